//! Core Kernel Services
//!
//! Provides fundamental kernel services:
//! - Process control blocks and signals
//! - Scheduler
//! - Process lifecycle (fork, exit, wait, kill, exec)
//! - Cooperative execution of process bodies

pub mod gate;
pub mod process;
pub mod scheduler;
pub mod signal;
pub mod task;

pub use gate::ExecutionGate;
pub use process::ProcessContext;
pub use scheduler::Scheduler;
pub use signal::{Signal, NSIG};
pub use task::{DescriptorTable, FileHandle, Pid, Task, TaskInfo, TaskState};
