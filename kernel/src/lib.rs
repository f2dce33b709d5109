//! μSim Kernel: Process & Virtual-Memory Core
//!
//! A single-CPU, Unix-like kernel simulator modelling:
//! - A physical frame allocator with reference-counted sharing
//! - Per-process page tables and address spaces
//! - Copy-on-write fork
//! - Priority-decayed round-robin scheduling
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Syscall layer / callers                    │
//! │         fork · exit · wait · kill · brk · read/write        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                         Kernel                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │  Scheduler   │  │    Tasks     │  │  Execution Gate  │   │
//! │  │ (slot table) │  │ (PCB + sigs) │  │ (cont. token)    │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────────┘   │
//! │         │                 │ owns                            │
//! │         │          ┌──────▼───────┐                         │
//! │         │          │ AddressSpace │  segments · brk · COW   │
//! │         │          └──────┬───────┘                         │
//! │         │          ┌──────▼───────┐  ┌──────────────────┐   │
//! │         │          │  PageTable   │  │  FrameAllocator  │   │
//! │         │          │ (2-level)    │──│ (ref-counted)    │   │
//! │         │          └──────────────┘  └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Process bodies are cooperative: a body runs only while it holds the
//! continuation token the scheduler grants to the current task.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod mm;
pub mod sys;

pub use config::KernelConfig;
pub use error::{KernelError, KernelResult};
pub use kernel::Kernel;
pub use mm::{AddressSpace, FrameAllocator, FrameId, FramePool, PageFlags, PageTable, PhysAddr, VirtAddr};
pub use sys::{Pid, ProcessContext, Scheduler, Signal, Task, TaskState};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "μSim";

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Default simulated physical memory (16 MB)
pub const MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Low memory permanently owned by the kernel (1 MB)
pub const KERNEL_MEMORY: usize = 1024 * 1024;

/// Size of each process's virtual address space (64 MB)
pub const TASK_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum number of processes
pub const NR_TASKS: usize = 64;

/// Descriptor slots per process
pub const NR_OPEN: usize = 20;

/// Default static priority (also the counter refill amount)
pub const DEF_PRIORITY: u32 = 15;

/// Default initial time slice
pub const DEF_COUNTER: u32 = 10;

/// Timer ticks per second
pub const HZ: u32 = 100;
