// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Provide the in-memory file overlay shared by all sessions.
// Author: Lukas Bower

//! Virtual file store overlaying the session's on-disk directories.
//!
//! The store maps logical paths to byte content. A lookup consults the map
//! first and falls back to the real file under the caller-supplied root.
//! Writes never touch the filesystem: a put records content, a delete
//! records a mask that hides any same-named on-disk file. All access is
//! serialized through a single lock; batched writes are applied under one
//! acquisition so observers never see a half-applied batch.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use kiln_codec::OverlayEntry;

/// Process-wide overlay of logical paths onto byte content.
#[derive(Debug, Default)]
pub struct OverlayStore {
    entries: Mutex<BTreeMap<PathBuf, Option<Vec<u8>>>>,
}

impl OverlayStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The store shared by all sessions in this process.
    pub fn global() -> &'static OverlayStore {
        static STORE: OnceLock<OverlayStore> = OnceLock::new();
        STORE.get_or_init(OverlayStore::new)
    }

    /// Record overlay content for `path`.
    pub fn put(&self, path: impl Into<PathBuf>, contents: Vec<u8>) {
        self.apply([(path.into(), Some(contents))]);
    }

    /// Mask `path`: lookups fail even when a file of that name exists on
    /// disk.
    pub fn delete(&self, path: impl Into<PathBuf>) {
        self.apply([(path.into(), None)]);
    }

    /// Apply a group of writes under a single lock acquisition. `Some`
    /// records content, `None` records a mask.
    pub fn apply(&self, writes: impl IntoIterator<Item = (PathBuf, Option<Vec<u8>>)>) {
        let mut entries = self.entries.lock().expect("overlay store lock poisoned");
        for (path, contents) in writes {
            log::debug!("overlay write {}", path.display());
            entries.insert(path, contents);
        }
    }

    /// Read `path`, consulting the overlay first and the file under `root`
    /// second.
    pub fn read(&self, path: impl AsRef<Path>, root: &Path) -> io::Result<Vec<u8>> {
        let path = path.as_ref();
        {
            let entries = self.entries.lock().expect("overlay store lock poisoned");
            match entries.get(path) {
                Some(Some(contents)) => return Ok(contents.clone()),
                Some(None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} is deleted in the overlay", path.display()),
                    ))
                }
                None => {}
            }
        }
        std::fs::read(root.join(path))
    }

    /// Snapshot every overlay entry, masks included, in path order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OverlayEntry> {
        let entries = self.entries.lock().expect("overlay store lock poisoned");
        entries
            .iter()
            .map(|(path, contents)| OverlayEntry {
                path: path.to_string_lossy().into_owned(),
                contents: contents.clone(),
            })
            .collect()
    }

    /// Drop every entry. Used when a session root is torn down.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("overlay store lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_read_round_trips() {
        let store = OverlayStore::new();
        store.put("M.hs", b"module M where\n".to_vec());
        let contents = store
            .read("M.hs", Path::new("/nonexistent"))
            .expect("overlay read");
        assert_eq!(contents, b"module M where\n");
    }

    #[test]
    fn later_put_wins() {
        let store = OverlayStore::new();
        store.put("M.hs", b"old".to_vec());
        store.put("M.hs", b"new".to_vec());
        let contents = store
            .read("M.hs", Path::new("/nonexistent"))
            .expect("overlay read");
        assert_eq!(contents, b"new");
    }

    #[test]
    fn delete_masks_the_disk_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("M.hs"), b"on disk").expect("write file");
        let store = OverlayStore::new();
        assert_eq!(
            store.read("M.hs", dir.path()).expect("disk fallback"),
            b"on disk"
        );
        store.delete("M.hs");
        let err = store.read("M.hs", dir.path()).expect_err("masked read");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn snapshot_carries_masks() {
        let store = OverlayStore::new();
        store.put("A.hs", b"a".to_vec());
        store.delete("B.hs");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].path, "A.hs");
        assert_eq!(snapshot[0].contents.as_deref(), Some(b"a".as_slice()));
        assert_eq!(snapshot[1].path, "B.hs");
        assert_eq!(snapshot[1].contents, None);
    }
}
