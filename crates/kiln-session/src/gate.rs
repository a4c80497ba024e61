// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serialize process-global mutations against ordinary session work.
// Author: Lukas Bower

//! Shared/exclusive gate for operations that mutate process-wide state.
//!
//! Ordinary session operations take a shared slot; anything that must mutate
//! the process working directory or environment takes the gate exclusively.
//! No new shared entrant is admitted while an exclusive waiter exists, and
//! the exclusive holder waits for all shared slots to drain, so
//! CWD-sensitive and CWD-agnostic work never interleave.

use std::sync::{Condvar, Mutex, OnceLock};

#[derive(Debug, Default)]
struct GateState {
    shared: usize,
    exclusive: bool,
    waiting_exclusive: usize,
}

/// Gate granting many shared slots or one exclusive slot.
#[derive(Debug, Default)]
pub struct ProcessGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ProcessGate {
    /// Create an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide gate shared by all sessions.
    pub fn global() -> &'static ProcessGate {
        static GATE: OnceLock<ProcessGate> = OnceLock::new();
        GATE.get_or_init(ProcessGate::new)
    }

    /// Take a shared slot, blocking while an exclusive holder or waiter
    /// exists.
    pub fn shared(&self) -> SharedGuard<'_> {
        let mut state = self.state.lock().expect("process gate lock poisoned");
        while state.exclusive || state.waiting_exclusive > 0 {
            state = self.cond.wait(state).expect("process gate lock poisoned");
        }
        state.shared += 1;
        SharedGuard { gate: self }
    }

    /// Take the gate exclusively, blocking until all shared slots drain.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        let mut state = self.state.lock().expect("process gate lock poisoned");
        state.waiting_exclusive += 1;
        while state.exclusive || state.shared > 0 {
            state = self.cond.wait(state).expect("process gate lock poisoned");
        }
        state.waiting_exclusive -= 1;
        state.exclusive = true;
        ExclusiveGuard { gate: self }
    }
}

/// A held shared slot; released on drop.
pub struct SharedGuard<'a> {
    gate: &'a ProcessGate,
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .expect("process gate lock poisoned");
        state.shared -= 1;
        drop(state);
        self.gate.cond.notify_all();
    }
}

/// The held exclusive slot; released on drop.
pub struct ExclusiveGuard<'a> {
    gate: &'a ProcessGate,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .expect("process gate lock poisoned");
        state.exclusive = false;
        drop(state);
        self.gate.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_slots_coexist() {
        let gate = ProcessGate::new();
        let a = gate.shared();
        let b = gate.shared();
        drop(a);
        drop(b);
    }

    #[test]
    fn exclusive_waits_for_shared_drain() {
        let gate = Arc::new(ProcessGate::new());
        let order = Arc::new(AtomicUsize::new(0));
        let shared = gate.shared();
        let handle = {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let _guard = gate.exclusive();
                order.store(2, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(order.load(Ordering::SeqCst), 0);
        order.store(1, Ordering::SeqCst);
        drop(shared);
        handle.join().expect("exclusive thread");
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn waiting_exclusive_blocks_new_shared() {
        let gate = Arc::new(ProcessGate::new());
        let first = gate.shared();
        let excl = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _guard = gate.exclusive();
            })
        };
        // Give the exclusive waiter time to register.
        thread::sleep(Duration::from_millis(50));
        let late = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _guard = gate.shared();
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!late.is_finished());
        drop(first);
        excl.join().expect("exclusive thread");
        late.join().expect("late shared thread");
    }
}
