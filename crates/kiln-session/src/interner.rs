// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Intern strings behind integer ids for wire-economic diffs.
// Author: Lukas Bower

//! Explicit-sharing cache: an arena of strings indexed by integer ids.
//!
//! The worker interns every string its symbol tables reference and ships
//! only the arena's new tail with each result; the session side replays
//! those deltas into its own arena and resolves ids at query time. Shipping
//! ids keeps per-module diffs small and lets cyclic import graphs share
//! entries without ownership cycles.

use std::collections::HashMap;

use kiln_codec::{CacheDelta, SymbolId};

use crate::error::SessionError;

/// Append-only string arena with id handles.
#[derive(Debug, Clone, Default)]
pub struct StringArena {
    strings: Vec<String>,
    index: HashMap<String, SymbolId>,
    shipped: usize,
}

impl StringArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text`, returning the existing id when already present.
    pub fn intern(&mut self, text: &str) -> SymbolId {
        if let Some(id) = self.index.get(text) {
            return *id;
        }
        let id = SymbolId::from_raw(self.strings.len() as u32);
        self.strings.push(text.to_owned());
        self.index.insert(text.to_owned(), id);
        id
    }

    /// Resolve an id to its string, when the arena holds it.
    #[must_use]
    pub fn resolve(&self, id: SymbolId) -> Option<&str> {
        self.strings.get(id.into_raw() as usize).map(String::as_str)
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// True when nothing is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Entries interned since the previous call, as a shippable delta.
    pub fn take_delta(&mut self) -> CacheDelta {
        let entries = self
            .strings
            .iter()
            .enumerate()
            .skip(self.shipped)
            .map(|(raw, text)| (SymbolId::from_raw(raw as u32), text.clone()))
            .collect();
        self.shipped = self.strings.len();
        CacheDelta { entries }
    }

    /// Extend the arena with a received delta. Entries must continue the
    /// arena contiguously; anything else is a protocol violation.
    pub fn apply_delta(&mut self, delta: &CacheDelta) -> Result<(), SessionError> {
        for (id, text) in &delta.entries {
            if id.into_raw() as usize != self.strings.len() {
                return Err(SessionError::ProtocolViolation(format!(
                    "cache delta id {} does not extend arena of {}",
                    id.into_raw(),
                    self.strings.len()
                )));
            }
            self.strings.push(text.clone());
            self.index.insert(text.clone(), *id);
        }
        self.shipped = self.strings.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut arena = StringArena::new();
        let a = arena.intern("base");
        let b = arena.intern("base");
        assert_eq!(a, b);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.resolve(a), Some("base"));
    }

    #[test]
    fn deltas_replay_into_a_peer_arena() {
        let mut worker = StringArena::new();
        worker.intern("M");
        worker.intern("base");
        let first = worker.take_delta();
        assert_eq!(first.entries.len(), 2);

        let mut client = StringArena::new();
        client.apply_delta(&first).expect("first delta");
        assert_eq!(client.resolve(SymbolId::from_raw(1)), Some("base"));

        worker.intern("Data.Frob");
        let second = worker.take_delta();
        assert_eq!(second.entries.len(), 1);
        client.apply_delta(&second).expect("second delta");
        assert_eq!(client.len(), worker.len());
    }

    #[test]
    fn gapped_deltas_are_rejected() {
        let mut client = StringArena::new();
        let delta = CacheDelta {
            entries: vec![(SymbolId::from_raw(5), "stray".to_owned())],
        };
        assert!(matches!(
            client.apply_delta(&delta),
            Err(SessionError::ProtocolViolation(_))
        ));
    }
}
