// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Carry numbered progress steps with free-form messages.
// Author: Lukas Bower

//! Step-counted progress events observed while a request is in flight.

use kiln_codec::ProgressBody;

/// A numbered step of ongoing work. Steps start at 1 and only grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    step: u32,
    message: String,
}

impl Progress {
    /// First step of a fresh request.
    #[must_use]
    pub fn start(message: impl Into<String>) -> Self {
        Self {
            step: 1,
            message: message.into(),
        }
    }

    /// The next step, carrying a new message.
    #[must_use]
    pub fn update(self, message: impl Into<String>) -> Self {
        Self {
            step: self.step.saturating_add(1),
            message: message.into(),
        }
    }

    /// The step counter.
    #[must_use]
    pub fn step(&self) -> u32 {
        self.step
    }

    /// The step's message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn body(&self) -> ProgressBody {
        ProgressBody::Step {
            step: self.step,
            message: self.message.clone(),
        }
    }

    pub(crate) fn from_body(step: u32, message: String) -> Self {
        Self { step, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_count_up_from_one() {
        let first = Progress::start("a");
        assert_eq!(first.step(), 1);
        let second = first.update("b");
        assert_eq!(second.step(), 2);
        assert_eq!(second.message(), "b");
    }
}
