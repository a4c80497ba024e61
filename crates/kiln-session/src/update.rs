// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Describe composable batches of staged session mutations.
// Author: Lukas Bower

//! Composable batches of deferred session mutations.
//!
//! A batch records intent as an ordered list of tagged mutation records;
//! nothing happens until the session applies it while holding the state
//! token. Batches form a monoid: the empty batch is a no-op, and appending
//! runs the left batch's effects before the right's, so a later put to the
//! same path wins.

use std::path::PathBuf;

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Install or replace a source module, identified by module name.
    PutModule {
        /// Dotted module name, e.g. `Data.Frob`.
        name: String,
        /// Full module source.
        contents: Vec<u8>,
    },
    /// Remove a source module from the snapshot.
    DeleteModule {
        /// Dotted module name.
        name: String,
    },
    /// Install or replace a data file, identified by path.
    PutDataFile {
        /// Path relative to the session data directory.
        path: PathBuf,
        /// File content.
        contents: Vec<u8>,
    },
    /// Remove a data file from the snapshot.
    DeleteDataFile {
        /// Path relative to the session data directory.
        path: PathBuf,
    },
    /// Replace the dynamic compiler option set.
    SetOptions(Vec<String>),
    /// Toggle code generation for subsequent compiles.
    SetGenerateCode(bool),
    /// Replace the environment overlay applied to executed entry points.
    /// `Some` sets a variable, `None` removes it.
    SetEnv(Vec<(String, Option<String>)>),
}

/// An ordered, composable batch of staged mutations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    mutations: Vec<Mutation>,
}

impl UpdateBatch {
    /// The empty batch; applying it changes nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch installing one source module.
    #[must_use]
    pub fn put_module(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self::from(Mutation::PutModule {
            name: name.into(),
            contents: contents.into(),
        })
    }

    /// Batch removing one source module.
    #[must_use]
    pub fn delete_module(name: impl Into<String>) -> Self {
        Self::from(Mutation::DeleteModule { name: name.into() })
    }

    /// Batch installing one data file.
    #[must_use]
    pub fn put_data_file(path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        Self::from(Mutation::PutDataFile {
            path: path.into(),
            contents: contents.into(),
        })
    }

    /// Batch removing one data file.
    #[must_use]
    pub fn delete_data_file(path: impl Into<PathBuf>) -> Self {
        Self::from(Mutation::DeleteDataFile { path: path.into() })
    }

    /// Batch replacing the dynamic option set.
    #[must_use]
    pub fn options(options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::from(Mutation::SetOptions(
            options.into_iter().map(Into::into).collect(),
        ))
    }

    /// Batch toggling code generation.
    #[must_use]
    pub fn generate_code(enabled: bool) -> Self {
        Self::from(Mutation::SetGenerateCode(enabled))
    }

    /// Batch replacing the run environment overlay.
    #[must_use]
    pub fn env(pairs: Vec<(String, Option<String>)>) -> Self {
        Self::from(Mutation::SetEnv(pairs))
    }

    /// Append `other`'s mutations after this batch's.
    #[must_use]
    pub fn append(mut self, other: UpdateBatch) -> Self {
        self.mutations.extend(other.mutations);
        self
    }

    /// True when the batch stages nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// The staged mutations in application order.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

impl From<Mutation> for UpdateBatch {
    fn from(mutation: Mutation) -> Self {
        Self {
            mutations: vec![mutation],
        }
    }
}

/// Map a dotted module name to its logical source path.
pub(crate) fn module_file(name: &str) -> PathBuf {
    PathBuf::from(name.replace('.', "/")).with_extension("hs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_an_identity() {
        let batch = UpdateBatch::put_module("M", "module M where\n");
        assert_eq!(UpdateBatch::new().append(batch.clone()), batch);
        assert_eq!(batch.clone().append(UpdateBatch::new()), batch);
    }

    #[test]
    fn append_is_associative() {
        let a = UpdateBatch::put_module("A", "module A where\n");
        let b = UpdateBatch::delete_module("B");
        let c = UpdateBatch::options(["-Wall"]);
        assert_eq!(
            a.clone().append(b.clone()).append(c.clone()),
            a.append(b.append(c))
        );
    }

    #[test]
    fn append_preserves_order() {
        let batch = UpdateBatch::put_module("M", "one")
            .append(UpdateBatch::put_module("M", "two"));
        assert_eq!(batch.mutations().len(), 2);
        assert!(matches!(
            &batch.mutations()[1],
            Mutation::PutModule { contents, .. } if contents == b"two"
        ));
    }

    #[test]
    fn module_names_map_to_nested_paths() {
        assert_eq!(module_file("M"), PathBuf::from("M.hs"));
        assert_eq!(module_file("Data.Frob"), PathBuf::from("Data/Frob.hs"));
    }
}
