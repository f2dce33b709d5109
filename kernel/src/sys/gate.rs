//! Execution Gate
//!
//! The continuation token behind cooperative process bodies. The scheduler
//! grants the token to the current task after every reschedule; a body runs
//! only while the token names its PID. At most one body therefore touches
//! kernel state at a time, even though each body has its own OS thread.
//!
//! Hand-off is two-phase. A grant only names the next holder; that body
//! starts once the previous one has reached a yield point and released the
//! CPU. A tick delivered from outside can move the token, but it cannot
//! start a second body while the interrupted one is still executing.

use parking_lot::{Condvar, Mutex};

use super::task::Pid;
use crate::{KernelError, KernelResult};

#[derive(Debug, Default)]
struct GateState {
    /// PID holding the token
    holder: Option<Pid>,
    /// PID whose body is executing
    running: Option<Pid>,
    /// Set on shutdown; waiters give up
    closed: bool,
}

/// Continuation token shared by the scheduler and process bodies
#[derive(Debug, Default)]
pub struct ExecutionGate {
    state: Mutex<GateState>,
    turn: Condvar,
}

impl ExecutionGate {
    /// Create an open gate with no holder
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the token to `pid` (or to nobody) and wake the waiters
    pub fn grant(&self, pid: Option<Pid>) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.holder != pid {
            tracing::trace!("Token {:?} -> {:?}", state.holder, pid);
        }
        state.holder = pid;
        self.turn.notify_all();
    }

    /// Block until `pid` holds the token and no other body is executing,
    /// then mark `pid` as running.
    ///
    /// Fails with `GateClosed` once the gate shuts down.
    pub fn wait_turn(&self, pid: Pid) -> KernelResult<()> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(KernelError::GateClosed);
            }
            let cpu_free = state.running.is_none() || state.running == Some(pid);
            if state.holder == Some(pid) && cpu_free {
                state.running = Some(pid);
                return Ok(());
            }
            self.turn.wait(&mut state);
        }
    }

    /// `pid` has reached a yield point; let the holder run
    pub fn release(&self, pid: Pid) {
        let mut state = self.state.lock();
        if state.running == Some(pid) {
            state.running = None;
            self.turn.notify_all();
        }
    }

    /// Current holder
    pub fn holder(&self) -> Option<Pid> {
        self.state.lock().holder
    }

    /// PID whose body is executing
    pub fn running(&self) -> Option<Pid> {
        self.state.lock().running
    }

    /// Shut the gate and release every waiter
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.holder = None;
        state.running = None;
        self.turn.notify_all();
    }

    /// Check whether the gate has been shut
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_holder_passes_immediately() {
        let gate = ExecutionGate::new();
        gate.grant(Some(3));
        assert_eq!(gate.holder(), Some(3));
        assert!(gate.wait_turn(3).is_ok());
    }

    #[test]
    fn test_waiter_released_by_grant() {
        let gate = Arc::new(ExecutionGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_turn(7))
        };

        thread::sleep(Duration::from_millis(20));
        gate.grant(Some(1));
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.grant(Some(7));
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_new_holder_waits_for_release() {
        let gate = Arc::new(ExecutionGate::new());
        gate.grant(Some(1));
        gate.wait_turn(1).unwrap();
        assert_eq!(gate.running(), Some(1));

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_turn(2))
        };

        gate.grant(Some(2));
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.release(3);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.release(1);
        assert!(waiter.join().unwrap().is_ok());
        assert_eq!(gate.running(), Some(2));
    }

    #[test]
    fn test_close_releases_waiters() {
        let gate = Arc::new(ExecutionGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_turn(2))
        };

        thread::sleep(Duration::from_millis(20));
        gate.close();
        assert_eq!(waiter.join().unwrap(), Err(KernelError::GateClosed));

        gate.grant(Some(2));
        assert!(gate.is_closed());
        assert_eq!(gate.holder(), None);
        assert_eq!(gate.running(), None);
    }
}
