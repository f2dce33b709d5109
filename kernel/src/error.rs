//! Error types for the kernel core
//!
//! Faults raised by the memory subsystem carry the offending address so the
//! surrounding kernel can turn them into signals or termination.

use thiserror::Error;

use crate::mm::FrameId;
use crate::sys::{Pid, TaskState};

/// Kernel result type
pub type KernelResult<T> = Result<T, KernelError>;

/// Kernel error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    // ========== Memory Errors ==========

    /// Frame allocator exhausted
    #[error("Out of memory: no free frames")]
    OutOfMemory,

    /// Access to an unmapped virtual page
    #[error("Page fault at {vaddr:#x}: page not present")]
    PageFault {
        /// Faulting virtual address
        vaddr: u64,
    },

    /// Write to a present page that is neither writable nor copy-on-write
    #[error("Permission fault at {vaddr:#x}: page is read-only")]
    PermissionFault {
        /// Faulting virtual address
        vaddr: u64,
    },

    /// Physical access outside simulated RAM (a kernel bug, not a process fault)
    #[error("Host fault: physical address {paddr:#x} out of range")]
    HostFault {
        /// Offending physical address
        paddr: u64,
    },

    /// Virtual address beyond the task size
    #[error("Virtual address {vaddr:#x} outside the address space")]
    AddressOutOfRange {
        /// Offending virtual address
        vaddr: u64,
    },

    /// Reference taken on a frame that is not allocated
    #[error("Frame {0} is not allocated")]
    FrameNotAllocated(FrameId),

    // ========== Process Errors ==========

    /// Scheduler slot table is full
    #[error("Process table full")]
    ProcessTableFull,

    /// No task with this PID
    #[error("No such process: {0}")]
    NoSuchProcess(Pid),

    /// Task has no children to wait for
    #[error("Process {0} has no children")]
    NoChildren(Pid),

    /// Children exist but none has exited yet
    #[error("Operation would block")]
    WouldBlock,

    /// PID already present in the table
    #[error("Process {0} already exists")]
    AlreadyExists(Pid),

    /// State transition not allowed from the current state
    #[error("Process {pid} cannot do that while {state}")]
    InvalidState {
        /// Task PID
        pid: Pid,
        /// State at the time of the request
        state: TaskState,
    },

    /// Signal number outside 1..NSIG
    #[error("Invalid signal number: {0}")]
    InvalidSignal(u32),

    /// Execution gate shut down while a body was waiting for its turn
    #[error("Execution gate closed")]
    GateClosed,

    // ========== Configuration Errors ==========

    /// Configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl KernelError {
    /// Whether this error is a process-level memory fault
    pub fn is_fault(&self) -> bool {
        matches!(self, KernelError::PageFault { .. } | KernelError::PermissionFault { .. })
    }

    /// Faulting virtual address, for fault kinds
    pub fn fault_address(&self) -> Option<u64> {
        match self {
            KernelError::PageFault { vaddr } | KernelError::PermissionFault { vaddr } => Some(*vaddr),
            _ => None,
        }
    }
}
