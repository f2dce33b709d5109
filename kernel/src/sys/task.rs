//! Process Control Block
//!
//! A task is the unit of scheduling:
//! - Identity (pid, parent pid, name)
//! - Scheduling state and time slice
//! - Owned address space
//! - Descriptor table and signal bitmaps
//!
//! # State Machine
//!
//! ```text
//!              block(interruptible)
//!   RUNNABLE ─────────────────────────► INTERRUPTIBLE_WAIT / UNINTERRUPTIBLE_WAIT
//!      ▲  ◄─────────────────────────────        │
//!      │              wake()                    │
//!      │ SIGCONT                                │ SIGSTOP (any non-zombie)
//!      │                                        ▼
//!   STOPPED ◄───────────────────────────────────┘
//!
//!   any non-zombie ── exit(code) ──► ZOMBIE (terminal)
//! ```

use std::fmt;

use serde::Serialize;

use super::signal::Signal;
use crate::mm::AddressSpace;
use crate::{KernelError, KernelResult, DEF_COUNTER, DEF_PRIORITY, NR_OPEN};

/// Process ID type
pub type Pid = u32;

/// Descriptor slots kept across exec (stdin, stdout, stderr)
const STDIO_SLOTS: usize = 3;

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    /// Eligible to run
    Runnable,
    /// Sleeping; signals wake it
    InterruptibleWait,
    /// Sleeping; only an explicit wake ends it
    UninterruptibleWait,
    /// Suspended until continued
    Stopped,
    /// Terminated, waiting to be reaped
    Zombie,
}

impl TaskState {
    /// Either wait state
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskState::InterruptibleWait | TaskState::UninterruptibleWait)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Runnable => "runnable",
            TaskState::InterruptibleWait => "interruptible wait",
            TaskState::UninterruptibleWait => "uninterruptible wait",
            TaskState::Stopped => "stopped",
            TaskState::Zombie => "zombie",
        };
        f.write_str(s)
    }
}

/// Opaque handle to an open file owned by the file layer
pub type FileHandle = u32;

/// Per-task descriptor table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorTable {
    slots: [Option<FileHandle>; NR_OPEN],
}

impl DescriptorTable {
    /// Create empty table
    pub fn new() -> Self {
        Self { slots: [None; NR_OPEN] }
    }

    /// Install a handle in the lowest free slot
    pub fn install(&mut self, handle: FileHandle) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(handle);
        Some(fd)
    }

    /// Handle in slot `fd`
    pub fn get(&self, fd: usize) -> Option<FileHandle> {
        self.slots.get(fd).copied().flatten()
    }

    /// Empty slot `fd`, returning what it held
    pub fn close(&mut self, fd: usize) -> Option<FileHandle> {
        self.slots.get_mut(fd)?.take()
    }

    /// Empty every slot from `first` upwards
    pub fn close_from(&mut self, first: usize) {
        for slot in self.slots.iter_mut().skip(first) {
            *slot = None;
        }
    }

    /// Empty every slot
    pub fn close_all(&mut self) {
        self.close_from(0);
    }

    /// Number of occupied slots
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Process listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    /// Process ID
    pub pid: Pid,
    /// Parent process ID (0 = none)
    pub ppid: Pid,
    /// Name
    pub name: String,
    /// State
    pub state: TaskState,
    /// Remaining time slice
    pub counter: u32,
    /// Static priority
    pub priority: u32,
    /// User time in ticks
    pub utime: u64,
}

/// Task structure
pub struct Task {
    /// Process ID
    pub pid: Pid,
    /// Parent process ID (0 = none)
    pub ppid: Pid,
    /// Task name
    pub name: String,
    /// Remaining time slice
    pub counter: u32,
    /// Static priority, added back on every decay
    pub priority: u32,
    /// Tick at which the task was created
    pub start_time: u64,
    /// User time (ticks)
    pub utime: u64,
    /// Kernel time (ticks)
    pub stime: u64,
    /// Open descriptors
    pub descriptors: DescriptorTable,
    /// Parent is blocked in wait for a child
    pub waiting_for_child: bool,
    state: TaskState,
    exit_code: Option<i32>,
    signal_pending: u32,
    signal_blocked: u32,
    address_space: Option<AddressSpace>,
}

impl Task {
    /// Create new runnable task owning `address_space`
    pub fn new(pid: Pid, ppid: Pid, name: &str, address_space: AddressSpace) -> Self {
        Self {
            pid,
            ppid,
            name: String::from(name),
            counter: DEF_COUNTER,
            priority: DEF_PRIORITY,
            start_time: 0,
            utime: 0,
            stime: 0,
            descriptors: DescriptorTable::new(),
            waiting_for_child: false,
            state: TaskState::Runnable,
            exit_code: None,
            signal_pending: 0,
            signal_blocked: 0,
            address_space: Some(address_space),
        }
    }

    /// Set priority and initial time slice
    pub fn with_time_slice(mut self, priority: u32, counter: u32) -> Self {
        self.priority = priority;
        self.counter = counter;
        self
    }

    /// Set the creation tick
    pub fn started_at(mut self, jiffies: u64) -> Self {
        self.start_time = jiffies;
        self
    }

    /// Build the child of a fork: same name, priority, time slice,
    /// descriptors and blocked mask, with its own pid and address space.
    pub fn fork_child(&self, pid: Pid, address_space: AddressSpace) -> Task {
        let mut child = Task::new(pid, self.pid, &self.name, address_space)
            .with_time_slice(self.priority, self.counter);
        child.descriptors = self.descriptors.clone();
        child.signal_blocked = self.signal_blocked;
        child
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Exit code, once a zombie
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Runnable with time slice left
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Runnable && self.counter > 0
    }

    /// Check for zombie
    pub fn is_zombie(&self) -> bool {
        self.state == TaskState::Zombie
    }

    /// Put a runnable task to sleep
    pub fn block(&mut self, interruptible: bool) -> KernelResult<()> {
        if self.state != TaskState::Runnable {
            return Err(self.invalid_state());
        }

        self.state = if interruptible {
            TaskState::InterruptibleWait
        } else {
            TaskState::UninterruptibleWait
        };
        Ok(())
    }

    /// Wake a sleeping task. Returns whether the state changed.
    pub fn wake(&mut self) -> bool {
        if self.state.is_waiting() {
            self.state = TaskState::Runnable;
            true
        } else {
            false
        }
    }

    /// Stop any live task
    pub fn stop(&mut self) -> KernelResult<()> {
        if self.is_zombie() {
            return Err(self.invalid_state());
        }
        self.state = TaskState::Stopped;
        Ok(())
    }

    /// Resume a stopped task. Returns whether the state changed.
    pub fn cont(&mut self) -> bool {
        if self.state == TaskState::Stopped {
            self.state = TaskState::Runnable;
            true
        } else {
            false
        }
    }

    /// Terminate: become a zombie holding `code`.
    ///
    /// Descriptors are closed. The address space is left in place; the
    /// caller takes and releases it.
    pub fn exit(&mut self, code: i32) -> KernelResult<()> {
        if self.is_zombie() {
            return Err(self.invalid_state());
        }

        self.state = TaskState::Zombie;
        self.exit_code = Some(code);
        self.counter = 0;
        self.waiting_for_child = false;
        self.descriptors.close_all();
        Ok(())
    }

    /// Reset for a new program image in the same process
    pub fn exec_reset(&mut self) {
        self.signal_pending = 0;
        self.signal_blocked = 0;
        self.utime = 0;
        self.descriptors.close_from(STDIO_SLOTS);
    }

    /// Consume one tick of time slice
    pub fn decrement_counter(&mut self) {
        self.counter = self.counter.saturating_sub(1);
    }

    /// Set the time slice
    pub fn reset_counter_to(&mut self, counter: u32) {
        self.counter = counter;
    }

    /// Halve what is left of the slice and add the priority back
    pub fn decay_counter(&mut self) {
        self.counter = (self.counter / 2).saturating_add(self.priority);
    }

    /// Post a signal.
    ///
    /// The pending bit is always recorded. Stop, continue and kill also take
    /// effect on the state immediately; zombies ignore everything.
    pub fn send_signal(&mut self, signal: Signal) {
        if self.is_zombie() {
            return;
        }

        self.signal_pending |= signal.mask();

        match signal {
            Signal::Stop => {
                self.state = TaskState::Stopped;
                self.signal_pending &= !Signal::Cont.mask();
            }
            Signal::Cont => {
                self.cont();
                self.signal_pending &= !Signal::Stop.mask();
            }
            Signal::Kill => {
                if self.state.is_waiting() || self.state == TaskState::Stopped {
                    self.state = TaskState::Runnable;
                }
            }
            _ => {
                if self.state == TaskState::InterruptibleWait && self.signal_blocked & signal.mask() == 0 {
                    self.state = TaskState::Runnable;
                }
            }
        }
    }

    /// Whether any unblocked signal is pending
    pub fn has_pending_signals(&self) -> bool {
        self.signal_pending & !self.signal_blocked != 0
    }

    /// Lowest-numbered unblocked pending signal
    pub fn next_signal(&self) -> Option<Signal> {
        let ready = self.signal_pending & !self.signal_blocked;
        (1..=crate::sys::signal::NSIG)
            .filter(|n| ready & (1 << (n - 1)) != 0)
            .find_map(|n| Signal::from_number(n).ok())
    }

    /// Clear a pending signal
    pub fn clear_signal(&mut self, signal: Signal) {
        self.signal_pending &= !signal.mask();
    }

    /// Block a signal. Kill and stop cannot be blocked.
    pub fn block_signal(&mut self, signal: Signal) {
        if !signal.is_unblockable() {
            self.signal_blocked |= signal.mask();
        }
    }

    /// Unblock a signal
    pub fn unblock_signal(&mut self, signal: Signal) {
        self.signal_blocked &= !signal.mask();
    }

    /// Pending bitmap
    pub fn pending_signals(&self) -> u32 {
        self.signal_pending
    }

    /// Blocked bitmap
    pub fn blocked_signals(&self) -> u32 {
        self.signal_blocked
    }

    /// Address space, if not yet released
    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    /// Mutable address space, if not yet released
    pub fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.address_space.as_mut()
    }

    /// Detach the address space (for release at exit)
    pub fn take_address_space(&mut self) -> Option<AddressSpace> {
        self.address_space.take()
    }

    /// Replace the address space, returning the old one
    pub fn replace_address_space(&mut self, space: AddressSpace) -> Option<AddressSpace> {
        self.address_space.replace(space)
    }

    /// Listing snapshot
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            pid: self.pid,
            ppid: self.ppid,
            name: self.name.clone(),
            state: self.state,
            counter: self.counter,
            priority: self.priority,
            utime: self.utime,
        }
    }

    fn invalid_state(&self) -> KernelError {
        KernelError::InvalidState {
            pid: self.pid,
            state: self.state,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("ppid", &self.ppid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("counter", &self.counter)
            .field("priority", &self.priority)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
