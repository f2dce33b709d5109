//! Kernel instance
//!
//! Ties the subsystems together: the frame pool, the scheduler behind its
//! coarse lock, and the execution gate. Nothing here is global, so several
//! kernels can live side by side.
//!
//! Lock order is scheduler → frames and scheduler → gate. Process bodies
//! wait on the gate without holding the scheduler lock.

use parking_lot::{Mutex, MutexGuard};

use crate::mm::{AddressSpace, FramePool, MemoryStats, PageFlags, VirtAddr};
use crate::sys::gate::ExecutionGate;
use crate::sys::{Pid, Scheduler, Task, TaskInfo};
use crate::{KernelConfig, KernelError, KernelResult, PAGE_SIZE};

/// PID of the first process
pub const INIT_PID: Pid = 1;

/// Pages mapped for init's image
const INIT_PAGES: usize = 4;

/// Kernel instance
pub struct Kernel {
    config: KernelConfig,
    frames: FramePool,
    scheduler: Mutex<Scheduler>,
    gate: ExecutionGate,
}

impl Kernel {
    /// Boot a kernel from a validated configuration
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;

        let frames = FramePool::from_config(&config);
        let scheduler = Scheduler::new(config.max_tasks);

        tracing::info!(
            "{} v{} booted: {} frames ({} reserved), {} task slots",
            crate::NAME,
            crate::VERSION,
            config.total_frames(),
            config.reserved_frames(),
            config.max_tasks
        );

        Ok(Self {
            config,
            frames,
            scheduler: Mutex::new(scheduler),
            gate: ExecutionGate::new(),
        })
    }

    /// Get configuration
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Get the frame pool
    pub fn frames(&self) -> &FramePool {
        &self.frames
    }

    /// Lock the scheduler
    pub fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock()
    }

    pub(crate) fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Create an empty address space of the configured size
    pub fn new_address_space(&self) -> AddressSpace {
        AddressSpace::with_task_size(self.frames.clone(), self.config.task_size)
    }

    /// Create init: PID 1 with four writable user pages at address 0
    pub fn create_init_process(&self) -> KernelResult<Pid> {
        if self.scheduler.lock().find(INIT_PID).is_some() {
            return Err(KernelError::AlreadyExists(INIT_PID));
        }
        self.spawn("init", 0, INIT_PAGES)
    }

    /// Create a runnable process whose data segment is `pages` zeroed,
    /// writable pages starting at address 0.
    ///
    /// `parent` 0 means no parent.
    pub fn spawn(&self, name: &str, parent: Pid, pages: usize) -> KernelResult<Pid> {
        let mut sched = self.scheduler.lock();
        if parent != 0 && sched.find(parent).is_none() {
            return Err(KernelError::NoSuchProcess(parent));
        }

        let mut space = self.new_address_space();
        for vpage in 0..pages {
            space.allocate_and_map(VirtAddr::from_page(vpage), PageFlags::USER_DATA)?;
        }
        space.set_data(0, (pages * PAGE_SIZE) as u64);

        let pid = sched.allocate_pid();
        let task = Task::new(pid, parent, name, space)
            .with_time_slice(self.config.default_priority, self.config.default_counter)
            .started_at(sched.jiffies());
        sched.add(task)?;

        tracing::info!("Created process {} ({}), parent {}", pid, name, parent);
        Ok(pid)
    }

    /// Run the selection algorithm and hand the token to the winner
    pub fn schedule(&self) -> Option<Pid> {
        let mut sched = self.scheduler.lock();
        self.reschedule_locked(&mut sched)
    }

    pub(crate) fn reschedule_locked(&self, sched: &mut Scheduler) -> Option<Pid> {
        let next = sched.schedule();
        self.gate.grant(next);
        next
    }

    /// Timer interrupt. Returns true if the current task changed hands.
    ///
    /// Safe to call from any thread: a body interrupted here keeps the CPU
    /// until its next yield point, and only then does the new holder run.
    pub fn timer_tick(&self) -> bool {
        let mut sched = self.scheduler.lock();
        self.timer_tick_locked(&mut sched)
    }

    pub(crate) fn timer_tick_locked(&self, sched: &mut Scheduler) -> bool {
        let rescheduled = sched.timer_tick();
        if rescheduled {
            self.gate.grant(sched.current());
        }
        rescheduled
    }

    /// Block the current task and reschedule
    pub fn sleep(&self, interruptible: bool) -> KernelResult<Option<Pid>> {
        let mut sched = self.scheduler.lock();
        self.sleep_locked(&mut sched, interruptible)
    }

    pub(crate) fn sleep_locked(&self, sched: &mut Scheduler, interruptible: bool) -> KernelResult<Option<Pid>> {
        let next = sched.sleep(interruptible)?;
        self.gate.grant(next);
        Ok(next)
    }

    /// Wake every waiting task. The current task keeps running.
    pub fn wake_all(&self) -> usize {
        self.scheduler.lock().wake_all()
    }

    /// Currently selected PID
    pub fn current_pid(&self) -> Option<Pid> {
        self.scheduler.lock().current()
    }

    /// Run `f` on a task under the scheduler lock
    pub fn with_task<R>(&self, pid: Pid, f: impl FnOnce(&mut Task) -> R) -> KernelResult<R> {
        let mut sched = self.scheduler.lock();
        let task = sched.find_mut(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        Ok(f(task))
    }

    /// Physical memory usage
    pub fn memory_stats(&self) -> MemoryStats {
        self.frames.stats()
    }

    /// Process listing
    pub fn process_list(&self) -> Vec<TaskInfo> {
        self.scheduler.lock().process_list()
    }

    /// Close the gate; bodies still waiting for a turn return `GateClosed`
    pub fn shutdown(&self) {
        self.gate.close();
        tracing::info!("Kernel shut down at tick {}", self.scheduler.lock().jiffies());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::small()).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = KernelConfig { max_tasks: 0, ..KernelConfig::small() };
        assert!(matches!(Kernel::new(config), Err(KernelError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_reserved_memory_at_boot() {
        let k = Kernel::new(KernelConfig::default()).unwrap();
        let stats = k.memory_stats();
        assert_eq!(stats.total_frames, 4096);
        assert_eq!(stats.used_frames, 256);
    }

    #[test]
    fn test_create_init_process() {
        let k = kernel();
        let pid = k.create_init_process().unwrap();
        assert_eq!(pid, INIT_PID);
        assert_eq!(k.memory_stats().used_frames, 4);

        k.with_task(pid, |t| {
            let space = t.address_space().unwrap();
            assert_eq!(space.mapped_pages(), 4);
            assert_eq!(space.brk(), 4 * PAGE_SIZE as u64);
            assert_eq!(t.ppid, 0);
        })
        .unwrap();

        assert_eq!(k.create_init_process(), Err(KernelError::AlreadyExists(INIT_PID)));
    }

    #[test]
    fn test_spawn_unknown_parent() {
        let k = kernel();
        assert_eq!(k.spawn("orphan", 42, 1), Err(KernelError::NoSuchProcess(42)));
    }

    #[test]
    fn test_spawn_out_of_memory_releases_pages() {
        let k = kernel();
        assert_eq!(k.spawn("huge", 0, 65), Err(KernelError::OutOfMemory));
        assert_eq!(k.memory_stats().free_frames, 64);
        assert!(k.process_list().is_empty());
    }

    #[test]
    fn test_spawn_uses_config_time_slice() {
        let config = KernelConfig {
            default_priority: 4,
            default_counter: 2,
            ..KernelConfig::small()
        };
        let k = Kernel::new(config).unwrap();
        let pid = k.spawn("p", 0, 0).unwrap();

        let info = &k.process_list()[0];
        assert_eq!(info.pid, pid);
        assert_eq!(info.priority, 4);
        assert_eq!(info.counter, 2);
    }

    #[test]
    fn test_schedule_grants_token() {
        let k = kernel();
        let pid = k.create_init_process().unwrap();

        assert_eq!(k.schedule(), Some(pid));
        assert_eq!(k.current_pid(), Some(pid));
        assert_eq!(k.gate().holder(), Some(pid));
    }

    #[test]
    fn test_sleep_and_wake_all() {
        let k = kernel();
        let a = k.spawn("a", 0, 0).unwrap();
        let b = k.spawn("b", 0, 0).unwrap();
        k.schedule();

        assert_eq!(k.sleep(true).unwrap(), Some(b));
        assert_eq!(k.gate().holder(), Some(b));
        assert_eq!(k.wake_all(), 1);
        assert_eq!(k.current_pid(), Some(b));
        assert!(k.with_task(a, |t| t.is_runnable()).unwrap());
    }

    #[test]
    fn test_timer_tick_regrants() {
        let k = kernel();
        let a = k.spawn("a", 0, 0).unwrap();
        let b = k.spawn("b", 0, 0).unwrap();
        k.schedule();

        let mut switched = false;
        for _ in 0..crate::DEF_COUNTER {
            switched |= k.timer_tick();
        }
        assert!(switched);
        assert_eq!(k.current_pid(), Some(b));
        assert_eq!(k.gate().holder(), Some(b));
        assert_eq!(k.with_task(a, |t| t.utime).unwrap(), crate::DEF_COUNTER as u64);
    }

    #[test]
    fn test_with_task_missing() {
        let k = kernel();
        assert_eq!(k.with_task(9, |t| t.pid), Err(KernelError::NoSuchProcess(9)));
    }
}
