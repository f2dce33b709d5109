//! Signal numbers
//!
//! Only the numbering and the state transitions the scheduler must honour
//! live here; handler dispatch belongs to the surrounding kernel.

use std::fmt;

use serde::Serialize;

use crate::{KernelError, KernelResult};

/// Number of signal slots in a task's bitmaps
pub const NSIG: u32 = 32;

/// Classic Unix signal numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum Signal {
    /// Hangup
    Hup = 1,
    /// Interrupt from keyboard
    Int = 2,
    /// Quit from keyboard
    Quit = 3,
    /// Illegal instruction
    Ill = 4,
    /// Trace/breakpoint trap
    Trap = 5,
    /// Abort
    Abrt = 6,
    /// Arithmetic exception
    Fpe = 8,
    /// Unconditional kill
    Kill = 9,
    /// Invalid memory reference
    Segv = 11,
    /// Write to a pipe with no readers
    Pipe = 13,
    /// Timer alarm
    Alrm = 14,
    /// Termination request
    Term = 15,
    /// Child stopped or exited
    Chld = 17,
    /// Continue if stopped
    Cont = 18,
    /// Stop the process
    Stop = 19,
}

impl Signal {
    const ALL: [Signal; 15] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Ill,
        Signal::Trap,
        Signal::Abrt,
        Signal::Fpe,
        Signal::Kill,
        Signal::Segv,
        Signal::Pipe,
        Signal::Alrm,
        Signal::Term,
        Signal::Chld,
        Signal::Cont,
        Signal::Stop,
    ];

    /// Look up a signal by number
    pub fn from_number(number: u32) -> KernelResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|sig| sig.number() == number)
            .ok_or(KernelError::InvalidSignal(number))
    }

    /// Signal number
    pub fn number(self) -> u32 {
        self as u32
    }

    /// Bit for this signal in a pending/blocked bitmap
    pub fn mask(self) -> u32 {
        1 << (self.number() - 1)
    }

    /// Signals that can be neither blocked nor ignored
    pub fn is_unblockable(self) -> bool {
        matches!(self, Signal::Kill | Signal::Stop)
    }

    /// Exit code of a task terminated by this signal
    pub fn exit_code(self) -> i32 {
        128 + self.number() as i32
    }

    /// Conventional name
    pub fn name(self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Ill => "SIGILL",
            Signal::Trap => "SIGTRAP",
            Signal::Abrt => "SIGABRT",
            Signal::Fpe => "SIGFPE",
            Signal::Kill => "SIGKILL",
            Signal::Segv => "SIGSEGV",
            Signal::Pipe => "SIGPIPE",
            Signal::Alrm => "SIGALRM",
            Signal::Term => "SIGTERM",
            Signal::Chld => "SIGCHLD",
            Signal::Cont => "SIGCONT",
            Signal::Stop => "SIGSTOP",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_number() {
        assert_eq!(Signal::from_number(9).unwrap(), Signal::Kill);
        assert_eq!(Signal::from_number(19).unwrap(), Signal::Stop);
        assert_eq!(Signal::from_number(7), Err(KernelError::InvalidSignal(7)));
        assert_eq!(Signal::from_number(NSIG), Err(KernelError::InvalidSignal(NSIG)));
    }

    #[test]
    fn test_masks_are_distinct() {
        let combined = Signal::ALL.iter().fold(0u32, |acc, sig| {
            assert_eq!(acc & sig.mask(), 0);
            acc | sig.mask()
        });
        assert_eq!(combined.count_ones() as usize, Signal::ALL.len());
        assert_eq!(Signal::Hup.mask(), 1);
    }

    #[test]
    fn test_names_and_codes() {
        assert_eq!(Signal::Term.to_string(), "SIGTERM");
        assert_eq!(Signal::Kill.exit_code(), 137);
        assert!(Signal::Stop.is_unblockable());
        assert!(!Signal::Term.is_unblockable());
    }
}
