// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Maintain the process-wide monotonic session state token.
// Author: Lukas Bower

//! Process-wide monotonic version counter gating session operations.
//!
//! There is exactly one counter per process. Every session handle remembers
//! the value current at its creation; a handle whose remembered value has
//! fallen behind is stale and is refused by every operation. The counter
//! counts all session transitions across all sessions and never decreases
//! within a process lifetime.

use std::sync::{Mutex, MutexGuard};

use crate::error::SessionError;

static CURRENT: Mutex<u64> = Mutex::new(0);

/// A remembered session version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateToken(u64);

impl StateToken {
    /// Access the raw counter value.
    #[must_use]
    pub fn into_raw(self) -> u64 {
        self.0
    }
}

/// Exclusive access to the token cell, held across a mutating operation.
///
/// The holder has verified its token is current; dropping without
/// [`advance`](TokenGuard::advance) leaves the counter untouched.
pub struct TokenGuard {
    slot: MutexGuard<'static, u64>,
}

impl TokenGuard {
    /// Increment the counter and return the new value, releasing the cell.
    pub fn advance(mut self) -> StateToken {
        *self.slot += 1;
        StateToken(*self.slot)
    }
}

/// Read the current process token.
#[must_use]
pub fn current() -> StateToken {
    StateToken(*CURRENT.lock().expect("state token lock poisoned"))
}

/// Acquire the token cell after verifying `token` is still current.
pub fn lock_checked(token: StateToken) -> Result<TokenGuard, SessionError> {
    let slot = CURRENT.lock().expect("state token lock poisoned");
    if *slot != token.0 {
        return Err(SessionError::StaleSession);
    }
    Ok(TokenGuard { slot })
}

/// Verify `token` is still current without holding the cell.
pub fn check(token: StateToken) -> Result<(), SessionError> {
    lock_checked(token).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn advancing_strictly_increases() {
        let before = current();
        let a = lock_checked(before).expect("current token").advance();
        let b = lock_checked(a).expect("current token").advance();
        assert!(before < a);
        assert!(a < b);
    }

    #[test]
    #[serial]
    fn stale_tokens_are_refused() {
        let old = current();
        let new = lock_checked(old).expect("current token").advance();
        assert!(matches!(
            lock_checked(old),
            Err(SessionError::StaleSession)
        ));
        assert!(check(new).is_ok());
    }

    #[test]
    #[serial]
    fn dropping_the_guard_does_not_advance() {
        let before = current();
        drop(lock_checked(before).expect("current token"));
        assert_eq!(current(), before);
    }
}
