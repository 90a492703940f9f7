//! The fixed sequence of instrumented phases a tracee is driven through.

/// A tracee's progress through one trial.
///
/// Variants are declared in execution order. A tracee only ever moves forward
/// through this sequence.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub enum Phase {
    Attached,
    Stepping,
    Breakpointing,
    AccessingRegisters,
    AccessingMemory,
    Searching,
    Terminated,
}

impl Phase {
    /// Phases that are timed, in order. `Attached` covers attach and initialization.
    pub const TIMED: [Phase; 6] = [
        Phase::Attached,
        Phase::Stepping,
        Phase::Breakpointing,
        Phase::AccessingRegisters,
        Phase::AccessingMemory,
        Phase::Searching,
    ];

    /// Column name of the phase in the result log.
    pub fn column(&self) -> &'static str {
        match self {
            Phase::Attached => "Attach",
            Phase::Stepping => "Single Step",
            Phase::Breakpointing => "Breakpoint",
            Phase::AccessingRegisters => "Registers",
            Phase::AccessingMemory => "Memory",
            Phase::Searching => "Memory Search",
            Phase::Terminated => "Total",
        }
    }

    /// The phase that follows `self`, if any.
    pub fn successor(&self) -> Option<Phase> {
        let next = match self {
            Phase::Attached => Phase::Stepping,
            Phase::Stepping => Phase::Breakpointing,
            Phase::Breakpointing => Phase::AccessingRegisters,
            Phase::AccessingRegisters => Phase::AccessingMemory,
            Phase::AccessingMemory => Phase::Searching,
            Phase::Searching => Phase::Terminated,
            Phase::Terminated => return None,
        };

        Some(next)
    }

    /// Returns `true` if a tracee in `self` may move to `next`.
    ///
    /// Phases can't be skipped or re-entered. Termination is allowed from any live phase.
    pub fn can_enter(&self, next: Phase) -> bool {
        match next {
            Phase::Terminated => *self != Phase::Terminated,
            _ => self.successor() == Some(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_only_move_forward() {
        assert!(Phase::Attached.can_enter(Phase::Stepping));
        assert!(Phase::Stepping.can_enter(Phase::Breakpointing));
        assert!(!Phase::Breakpointing.can_enter(Phase::Breakpointing));
        assert!(!Phase::Searching.can_enter(Phase::Stepping));
        assert!(!Phase::Attached.can_enter(Phase::Breakpointing));
    }

    #[test]
    fn test_terminate_from_anywhere_once() {
        for phase in Phase::TIMED.iter() {
            assert!(phase.can_enter(Phase::Terminated));
        }

        assert!(!Phase::Terminated.can_enter(Phase::Terminated));
        assert!(!Phase::Terminated.can_enter(Phase::Searching));
    }

    #[test]
    fn test_columns_in_log_order() {
        let columns: Vec<_> = Phase::TIMED.iter().map(Phase::column).collect();

        assert_eq!(columns, ["Attach", "Single Step", "Breakpoint", "Registers", "Memory", "Memory Search"]);
    }
}
