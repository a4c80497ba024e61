// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Describe per-session directories, options, and worker placement.
// Author: Lukas Bower

//! Static configuration fixed at session creation.

use std::io;
use std::path::{Path, PathBuf};

/// Where the session's worker runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// Re-execute this binary in server mode (the production arrangement).
    #[default]
    OwnExecutable,
    /// Spawn the named binary in server mode.
    Executable(PathBuf),
    /// Host the worker loop on a thread inside this process, speaking the
    /// same framed protocol over in-memory pipes.
    InProcess,
}

/// Static configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory the engine reads source modules from, overlaid by the
    /// virtual file store.
    pub sources_dir: PathBuf,
    /// Directory for interface files and other compile intermediates.
    pub working_dir: PathBuf,
    /// Runtime working directory for executed entry points.
    pub data_dir: PathBuf,
    /// Scratch directory; also holds `dist/` build and doc output.
    pub temp_dir: PathBuf,
    /// Package database stack handed to the engine, outermost first.
    pub package_db_stack: Vec<PathBuf>,
    /// Extra directories prepended to the worker's search path.
    pub extra_path_dirs: Vec<PathBuf>,
    /// Include roots resolved relative to the sources directory.
    pub include_roots: Vec<PathBuf>,
    /// Remove `temp_dir` when the session shuts down.
    pub delete_temp_on_shutdown: bool,
    /// Build dynamic executables against shared libraries.
    pub dynamic_link: bool,
    /// Engine options fixed for the worker's lifetime; options the engine
    /// does not claim as static become the initial dynamic set.
    pub static_options: Vec<String>,
    /// Worker placement.
    pub worker_mode: WorkerMode,
}

impl SessionConfig {
    /// Conventional layout with all four directories under one root.
    #[must_use]
    pub fn for_root(root: &Path) -> Self {
        Self {
            sources_dir: root.join("src"),
            working_dir: root.join("work"),
            data_dir: root.join("data"),
            temp_dir: root.join("tmp"),
            package_db_stack: Vec::new(),
            extra_path_dirs: Vec::new(),
            include_roots: Vec::new(),
            delete_temp_on_shutdown: true,
            dynamic_link: false,
            static_options: Vec::new(),
            worker_mode: WorkerMode::default(),
        }
    }

    /// Create the session directories when absent.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [
            &self.sources_dir,
            &self.working_dir,
            &self.data_dir,
            &self.temp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Root of build and documentation output.
    #[must_use]
    pub fn dist_dir(&self) -> PathBuf {
        self.temp_dir.join("dist")
    }

    /// The option vector handed to the worker: static options plus the
    /// package-DB stack and include roots folded into engine syntax.
    #[must_use]
    pub fn worker_options(&self) -> Vec<String> {
        let mut options = self.static_options.clone();
        for db in &self.package_db_stack {
            options.push("-package-db".to_owned());
            options.push(db.display().to_string());
        }
        for root in &self.include_roots {
            options.push(format!("-i{}", self.sources_dir.join(root).display()));
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_options_fold_databases_and_roots() {
        let mut config = SessionConfig::for_root(Path::new("/s"));
        config.static_options = vec!["-O".to_owned()];
        config.package_db_stack = vec![PathBuf::from("/pkg/global")];
        config.include_roots = vec![PathBuf::from("lib")];
        let options = config.worker_options();
        assert_eq!(options[0], "-O");
        assert_eq!(options[1], "-package-db");
        assert_eq!(options[2], "/pkg/global");
        assert_eq!(options[3], "-i/s/src/lib");
    }

    #[test]
    fn dist_lives_under_temp() {
        let config = SessionConfig::for_root(Path::new("/s"));
        assert_eq!(config.dist_dir(), PathBuf::from("/s/tmp/dist"));
    }
}
