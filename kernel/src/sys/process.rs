//! Process Management
//!
//! The fork/exit/wait/kill/exec operations a syscall layer builds on, plus
//! cooperative process bodies.
//!
//! A body is a closure running on its own OS thread. It starts only once
//! the scheduler grants its PID the continuation token, and every call that
//! can reschedule (`yield_now`, `sleep`, `tick`) waits for the token again
//! before returning. Every context call runs only while its process is
//! current; a body preempted by a tick from another thread yields at its
//! next call.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::scheduler::Scheduler;
use super::signal::Signal;
use super::task::Pid;
use crate::kernel::{Kernel, INIT_PID};
use crate::mm::AddressSpace;
use crate::{KernelError, KernelResult};

impl Kernel {
    /// Duplicate `parent` into a new process sharing its memory copy-on-write.
    ///
    /// The child inherits priority, remaining time slice and descriptors.
    /// If the table is full the child's references are released again.
    pub fn fork(&self, parent: Pid) -> KernelResult<Pid> {
        let mut sched = self.scheduler();
        self.fork_locked(&mut sched, parent)
    }

    fn fork_locked(&self, sched: &mut Scheduler, parent: Pid) -> KernelResult<Pid> {
        let jiffies = sched.jiffies();

        let space = {
            let task = sched.find_mut(parent).ok_or(KernelError::NoSuchProcess(parent))?;
            let invalid = KernelError::InvalidState {
                pid: parent,
                state: task.state(),
            };
            if task.is_zombie() {
                return Err(invalid);
            }
            task.address_space_mut().ok_or(invalid)?.fork()?
        };

        let pid = sched.allocate_pid();
        let child = sched
            .find(parent)
            .ok_or(KernelError::NoSuchProcess(parent))?
            .fork_child(pid, space)
            .started_at(jiffies);
        sched.add(child)?;

        tracing::info!("Process {} forked child {}", parent, pid);
        Ok(pid)
    }

    /// Terminate `pid` with `code`.
    ///
    /// The task becomes a zombie, its memory is released, orphans are handed
    /// to init and a parent blocked in wait is woken. If `pid` was running,
    /// another task is scheduled.
    pub fn exit(&self, pid: Pid, code: i32) -> KernelResult<()> {
        let mut sched = self.scheduler();
        self.exit_locked(&mut sched, pid, code)
    }

    fn exit_locked(&self, sched: &mut Scheduler, pid: Pid, code: i32) -> KernelResult<()> {
        let task = sched.find_mut(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        task.exit(code)?;
        drop(task.take_address_space());
        let ppid = task.ppid;

        let heir = if pid == INIT_PID { 0 } else { INIT_PID };
        for orphan in sched.tasks_mut().filter(|t| t.ppid == pid) {
            orphan.ppid = heir;
        }

        if let Some(parent) = sched.find_mut(ppid) {
            parent.send_signal(Signal::Chld);
            if parent.waiting_for_child {
                parent.waiting_for_child = false;
                parent.wake();
            }
        }

        tracing::info!("Process {} exited with code {}", pid, code);

        if sched.current() == Some(pid) {
            self.reschedule_locked(sched);
        }
        Ok(())
    }

    /// Reap the first zombie child of `parent`, returning its PID and exit code.
    ///
    /// With live children but no zombie, the parent is marked as waiting and
    /// `WouldBlock` is returned; the caller decides whether to sleep.
    pub fn wait(&self, parent: Pid) -> KernelResult<(Pid, i32)> {
        let mut sched = self.scheduler();
        self.wait_locked(&mut sched, parent)
    }

    fn wait_locked(&self, sched: &mut Scheduler, parent: Pid) -> KernelResult<(Pid, i32)> {
        if sched.find(parent).is_none() {
            return Err(KernelError::NoSuchProcess(parent));
        }

        let zombie = sched
            .children_of(parent)
            .find(|t| t.is_zombie())
            .map(|t| (t.pid, t.exit_code().unwrap_or(0)));
        let has_children = sched.children_of(parent).next().is_some();

        let task = sched.find_mut(parent).ok_or(KernelError::NoSuchProcess(parent))?;
        match zombie {
            Some((pid, code)) => {
                task.waiting_for_child = false;
                sched.remove(pid);
                tracing::debug!("Process {} reaped {} (code {})", parent, pid, code);
                Ok((pid, code))
            }
            None if has_children => {
                task.waiting_for_child = true;
                Err(KernelError::WouldBlock)
            }
            None => Err(KernelError::NoChildren(parent)),
        }
    }

    /// Reap a zombie child of `parent`, or block `parent` until one exits.
    ///
    /// Returns `None` once the parent is blocked (and, if it was current,
    /// another task scheduled). The check and the block share one scheduler
    /// lock, so a child exiting in between cannot leave the parent asleep.
    pub fn wait_or_block(&self, parent: Pid) -> KernelResult<Option<(Pid, i32)>> {
        let mut sched = self.scheduler();
        self.wait_or_block_locked(&mut sched, parent)
    }

    fn wait_or_block_locked(&self, sched: &mut Scheduler, parent: Pid) -> KernelResult<Option<(Pid, i32)>> {
        match self.wait_locked(sched, parent) {
            Err(KernelError::WouldBlock) => {}
            other => return other.map(Some),
        }

        sched
            .find_mut(parent)
            .ok_or(KernelError::NoSuchProcess(parent))?
            .block(true)?;
        tracing::debug!("Process {} sleeps until a child exits", parent);

        if sched.current() == Some(parent) {
            self.reschedule_locked(sched);
        }
        Ok(None)
    }

    /// Send `signal` to `pid`. SIGKILL terminates it with code 128 + 9.
    pub fn kill(&self, pid: Pid, signal: Signal) -> KernelResult<()> {
        let mut sched = self.scheduler();
        let task = sched.find_mut(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        if task.is_zombie() {
            return Ok(());
        }

        task.send_signal(signal);
        tracing::debug!("Sent {} to process {}", signal, pid);

        match signal {
            Signal::Kill => self.exit_locked(&mut sched, pid, signal.exit_code()),
            Signal::Stop if sched.current() == Some(pid) => {
                self.reschedule_locked(&mut sched);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Replace the program image of `pid`: signals and user time are reset,
    /// descriptors above stdio closed, and memory swapped for an empty space.
    pub fn exec(&self, pid: Pid) -> KernelResult<()> {
        let space = self.new_address_space();

        let mut sched = self.scheduler();
        let task = sched.find_mut(pid).ok_or(KernelError::NoSuchProcess(pid))?;
        if task.is_zombie() {
            return Err(KernelError::InvalidState {
                pid,
                state: task.state(),
            });
        }

        task.exec_reset();
        drop(task.replace_address_space(space));

        tracing::debug!("Process {} exec'd", pid);
        Ok(())
    }

    /// Run `body` as the code of process `pid`.
    ///
    /// The body starts once `pid` is granted the token. If it returns while
    /// the process is still alive, the process exits with 0 on `Ok` and 1 on
    /// `Err`.
    pub fn spawn_body<F>(self: &Arc<Self>, pid: Pid, body: F) -> JoinHandle<KernelResult<()>>
    where
        F: FnOnce(&ProcessContext) -> KernelResult<()> + Send + 'static,
    {
        let ctx = ProcessContext {
            kernel: Arc::clone(self),
            pid,
        };

        thread::spawn(move || {
            ctx.kernel.gate().wait_turn(pid)?;

            let result = body(&ctx);

            let alive = ctx
                .kernel
                .with_task(pid, |t| !t.is_zombie())
                .unwrap_or(false);
            if alive {
                let code = if result.is_ok() { 0 } else { 1 };
                if let Err(e) = ctx.kernel.exit(pid, code) {
                    tracing::warn!("Process {} body finished but exit failed: {}", pid, e);
                }
            }
            ctx.kernel.gate().release(pid);
            result
        })
    }
}

/// Handle a process body uses to reach the kernel
pub struct ProcessContext {
    kernel: Arc<Kernel>,
    pid: Pid,
}

impl ProcessContext {
    /// PID this body runs as
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Owning kernel
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Offer the CPU and wait for the next turn
    pub fn yield_now(&self) -> KernelResult<()> {
        self.on_cpu(|sched| {
            self.kernel.reschedule_locked(sched);
            Ok(())
        })?;
        self.yield_cpu()
    }

    /// Block, then wait until woken and scheduled again
    pub fn sleep(&self, interruptible: bool) -> KernelResult<()> {
        self.on_cpu(|sched| self.kernel.sleep_locked(sched, interruptible))?;
        self.yield_cpu()
    }

    /// Deliver one timer tick, waiting for the next turn if the slice ran out
    pub fn tick(&self) -> KernelResult<()> {
        self.on_cpu(|sched| Ok(self.kernel.timer_tick_locked(sched)))?;
        self.yield_cpu()
    }

    /// Fork this process
    pub fn fork(&self) -> KernelResult<Pid> {
        self.on_cpu(|sched| self.kernel.fork_locked(sched, self.pid))
    }

    /// Wait for a child to exit, sleeping while none has
    pub fn wait(&self) -> KernelResult<(Pid, i32)> {
        loop {
            match self.on_cpu(|sched| self.kernel.wait_or_block_locked(sched, self.pid))? {
                Some(reaped) => return Ok(reaped),
                None => self.yield_cpu()?,
            }
        }
    }

    /// Terminate this process
    pub fn exit(&self, code: i32) -> KernelResult<()> {
        self.on_cpu(|sched| self.kernel.exit_locked(sched, self.pid, code))
    }

    /// Run `f` on this process's address space.
    ///
    /// `f` runs under the scheduler lock and must not call back into the kernel.
    pub fn with_address_space<R>(&self, f: impl FnOnce(&mut AddressSpace) -> R) -> KernelResult<R> {
        self.on_cpu(|sched| {
            let task = sched.find_mut(self.pid).ok_or(KernelError::NoSuchProcess(self.pid))?;
            let state = task.state();
            let space = task.address_space_mut().ok_or(KernelError::InvalidState {
                pid: self.pid,
                state,
            })?;
            Ok(f(space))
        })
    }

    /// Run `f` under the scheduler lock while this process is current.
    ///
    /// If a tick from outside moved the CPU away since the last yield point,
    /// the body yields here first. A terminated process gets `InvalidState`.
    fn on_cpu<R>(&self, f: impl FnOnce(&mut Scheduler) -> KernelResult<R>) -> KernelResult<R> {
        loop {
            {
                let mut sched = self.kernel.scheduler();
                let task = sched.find(self.pid).ok_or(KernelError::NoSuchProcess(self.pid))?;
                if task.is_zombie() {
                    return Err(KernelError::InvalidState {
                        pid: self.pid,
                        state: task.state(),
                    });
                }
                if sched.current() == Some(self.pid) {
                    return f(&mut *sched);
                }
            }
            tracing::trace!("Process {} preempted, yielding", self.pid);
            self.yield_cpu()?;
        }
    }

    /// Give up the CPU and wait for the token again
    fn yield_cpu(&self) -> KernelResult<()> {
        let gate = self.kernel.gate();
        gate.release(self.pid);
        gate.wait_turn(self.pid)
    }
}
