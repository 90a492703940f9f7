//! The comma-separated result log, one row per completed trial.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::timer::PhaseTiming;

pub const HEADER: &str = "Attach,Single Step,Breakpoint,Registers,Memory,Memory Search,Total";

/// Append-only log of trial timings.
///
/// Rows are buffered. Nothing is guaranteed to reach the sink before
/// [`ResultLog::finish()`].
#[derive(Debug)]
pub struct ResultLog<W: Write> {
    writer: W,
    rows: usize,
}

impl ResultLog<BufWriter<File>> {
    /// Create (or truncate) the log file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> ResultLog<W> {
    /// Start a log on `writer`, writing the header line.
    pub fn new(mut writer: W) -> Result<Self> {
        writeln!(writer, "{HEADER}")?;

        Ok(Self { writer, rows: 0 })
    }

    /// Append the row of one completed trial.
    pub fn append(&mut self, timing: &PhaseTiming) -> Result<()> {
        let row = timing.row();
        let line = row
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(",");

        writeln!(self.writer, "{line}")?;
        self.rows += 1;

        debug!(rows = self.rows, %line, "appended result row");

        Ok(())
    }

    /// Number of data rows appended, not counting the header.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush the log and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
