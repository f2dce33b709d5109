//! Scheduler
//!
//! Priority-decayed round-robin over a fixed slot table:
//! - Each task holds a counter (remaining time slice) and a static priority
//! - The runnable task with the greatest counter runs
//! - Timer ticks drain the running task's counter
//!
//! # Scheduling Algorithm
//!
//! 1. Scan the slots for runnable tasks with counter > 0; keep the strictly
//!    greatest counter, so ties go to the lowest slot
//! 2. If none qualifies, decay every live task once:
//!    `counter = counter / 2 + priority`, then scan again
//! 3. A task reaching counter 0 on a tick forces a reschedule
//!
//! Sleeping tasks keep half their slice across each decay, so they come
//! back with a larger counter than tasks that used theirs up.

use super::task::{Pid, Task, TaskInfo};
use crate::{KernelError, KernelResult, NR_TASKS};

/// Scheduler
pub struct Scheduler {
    /// Task slots (capacity = process ceiling)
    slots: Vec<Option<Task>>,
    /// Currently selected task
    current: Option<Pid>,
    /// Next PID to hand out
    next_pid: Pid,
    /// Timer ticks since boot
    jiffies: u64,
    /// Number of times the selected task changed
    context_switches: u64,
}

impl Scheduler {
    /// Create new scheduler with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            slots,
            current: None,
            next_pid: 1,
            jiffies: 0,
            context_switches: 0,
        }
    }

    /// Hand out a fresh PID. PIDs are never reused.
    pub fn allocate_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Place a task in the first free slot.
    ///
    /// On failure the table is untouched and the task is dropped, which
    /// releases its address space.
    pub fn add(&mut self, task: Task) -> KernelResult<()> {
        if self.find(task.pid).is_some() {
            return Err(KernelError::AlreadyExists(task.pid));
        }

        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            tracing::warn!("Task table full, dropping pid {}", task.pid);
            return Err(KernelError::ProcessTableFull);
        };

        tracing::debug!("Added task {} ({})", task.pid, task.name);
        *slot = Some(task);
        Ok(())
    }

    /// Remove a task from the table
    pub fn remove(&mut self, pid: Pid) -> Option<Task> {
        let task = self
            .slots
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|t| t.pid == pid))?
            .take();

        if self.current == Some(pid) {
            self.current = None;
        }

        tracing::debug!("Removed task {}", pid);
        task
    }

    /// Get task by PID
    pub fn find(&self, pid: Pid) -> Option<&Task> {
        self.tasks().find(|t| t.pid == pid)
    }

    /// Get mutable task by PID
    pub fn find_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks_mut().find(|t| t.pid == pid)
    }

    /// Pick the next task to run and make it current.
    ///
    /// Returns the new current PID, or `None` when nothing can run.
    pub fn schedule(&mut self) -> Option<Pid> {
        let next = match self.select() {
            Some(pid) => Some(pid),
            None => {
                self.decay();
                self.select()
            }
        };

        if next != self.current {
            if next.is_some() {
                self.context_switches += 1;
            }
            tracing::trace!("Switching {:?} -> {:?}", self.current, next);
        }

        self.current = next;
        next
    }

    /// Runnable task with the strictly greatest counter
    fn select(&self) -> Option<Pid> {
        let mut best: Option<&Task> = None;
        for task in self.tasks().filter(|t| t.is_runnable()) {
            if best.map_or(true, |b| task.counter > b.counter) {
                best = Some(task);
            }
        }
        best.map(|t| t.pid)
    }

    fn decay(&mut self) {
        for task in self.tasks_mut().filter(|t| !t.is_zombie()) {
            task.decay_counter();
        }
        tracing::trace!("Counters decayed at tick {}", self.jiffies);
    }

    /// Handle timer tick. Returns true if a reschedule happened.
    pub fn timer_tick(&mut self) -> bool {
        self.jiffies += 1;

        let Some(task) = self.current_task_mut() else {
            return false;
        };

        task.utime += 1;
        task.decrement_counter();

        if task.counter == 0 {
            self.schedule();
            true
        } else {
            false
        }
    }

    /// Block the current task and reschedule
    pub fn sleep(&mut self, interruptible: bool) -> KernelResult<Option<Pid>> {
        if let Some(task) = self.current_task_mut() {
            task.block(interruptible)?;
        }
        Ok(self.schedule())
    }

    /// Wake every task in either wait state. Returns how many woke.
    pub fn wake_all(&mut self) -> usize {
        self.tasks_mut().map(|t| t.wake()).filter(|&woke| woke).count()
    }

    /// Current PID
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Currently selected task
    pub fn current_task(&self) -> Option<&Task> {
        self.find(self.current?)
    }

    /// Currently selected task, mutably
    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        let pid = self.current?;
        self.find_mut(pid)
    }

    /// Timer ticks since creation
    pub fn jiffies(&self) -> u64 {
        self.jiffies
    }

    /// Number of switches to a different task
    pub fn context_switches(&self) -> u64 {
        self.context_switches
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.tasks().count()
    }

    /// Check for an empty table
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// All tasks in slot order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.slots.iter().flatten()
    }

    /// All tasks in slot order, mutably
    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut Task> + '_ {
        self.slots.iter_mut().flatten()
    }

    /// Children of `ppid` in slot order
    pub fn children_of(&self, ppid: Pid) -> impl Iterator<Item = &Task> + '_ {
        self.tasks().filter(move |t| t.ppid == ppid)
    }

    /// Process listing
    pub fn process_list(&self) -> Vec<TaskInfo> {
        self.tasks().map(Task::info).collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(NR_TASKS)
    }
}
