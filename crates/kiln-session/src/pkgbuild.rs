// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Synthesize package descriptions and drive configure/build/doc.
// Author: Lukas Bower

//! Package-build driver.
//!
//! From the last compile's output this synthesizes an in-memory package
//! description (a `main`/1.0 package with one library exposing the loaded
//! modules, one executable per requested target, and dependencies derived
//! from the observed package imports) and drives an external
//! configure+build facility. The facility is a trait; the shipped backend
//! spawns a builder process with its output redirected to log files under
//! the dist directory, and tests substitute stubs.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::computed::ComputedState;
use crate::config::SessionConfig;
use crate::error::SessionError;

/// One external package dependency of the synthesized package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Package name.
    pub package: String,
    /// Pinned version when known; unversioned otherwise.
    pub version: Option<String>,
}

/// One executable of the synthesized package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSpec {
    /// Executable name.
    pub name: String,
    /// Module whose `main` the executable runs.
    pub main_module: String,
    /// Wrapper source written under the dist directory, when the target
    /// module is not itself `Main`.
    pub wrapper: Option<PathBuf>,
}

/// The synthesized package description handed to the build backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDesc {
    /// Package name; always `main`.
    pub name: String,
    /// Package version; always `1.0`.
    pub version: String,
    /// Modules exposed from the package library.
    pub exposed_modules: Vec<String>,
    /// Executables to build.
    pub executables: Vec<ExecutableSpec>,
    /// External dependencies.
    pub dependencies: Vec<Dependency>,
    /// Install into the user package database.
    pub user_install: bool,
    /// Backend verbosity; zero is minimal.
    pub verbosity: u32,
    /// Build dynamic executables against shared libraries.
    pub dynamic: bool,
}

impl PackageDesc {
    /// Render the description in the conventional textual form.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("name: {}\nversion: {}\n\n", self.name, self.version));
        text.push_str("library\n  exposed-modules:\n");
        for module in &self.exposed_modules {
            text.push_str(&format!("    {module}\n"));
        }
        if !self.dependencies.is_empty() {
            text.push_str("  build-depends:\n");
            for dep in &self.dependencies {
                match &dep.version {
                    Some(version) => {
                        text.push_str(&format!("    {} == {}\n", dep.package, version))
                    }
                    None => text.push_str(&format!("    {}\n", dep.package)),
                }
            }
        }
        for exe in &self.executables {
            text.push_str(&format!(
                "\nexecutable {}\n  main-module: {}\n",
                exe.name, exe.main_module
            ));
            if let Some(wrapper) = &exe.wrapper {
                text.push_str(&format!("  main-is: {}\n", wrapper.display()));
            }
        }
        text
    }
}

/// Open log files capturing a build phase's output.
#[derive(Debug)]
pub struct BuildLogs {
    /// Captured standard output.
    pub stdout: File,
    /// Captured standard error.
    pub stderr: File,
}

/// The opaque configure+build facility.
pub trait BuildBackend {
    /// Configure the synthesized package. Returns the facility's exit code.
    fn configure(
        &mut self,
        desc: &PackageDesc,
        dist_dir: &Path,
        logs: &mut BuildLogs,
    ) -> io::Result<i32>;

    /// Build the configured package's executables.
    fn build(&mut self, desc: &PackageDesc, dist_dir: &Path, logs: &mut BuildLogs)
        -> io::Result<i32>;

    /// Generate documentation for the configured package.
    fn haddock(
        &mut self,
        desc: &PackageDesc,
        dist_dir: &Path,
        logs: &mut BuildLogs,
    ) -> io::Result<i32>;
}

/// Backend spawning an external builder program, its stdout/stderr
/// redirected into the supplied logs for the duration of the call.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    /// Builder program to spawn.
    pub program: PathBuf,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self {
            program: PathBuf::from("cabal"),
        }
    }
}

impl ProcessBackend {
    fn invoke(
        &self,
        verb: &str,
        desc: &PackageDesc,
        dist_dir: &Path,
        logs: &mut BuildLogs,
    ) -> io::Result<i32> {
        let mut command = Command::new(&self.program);
        command
            .arg(verb)
            .arg(format!("--builddir={}", dist_dir.display()))
            .current_dir(dist_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(logs.stdout.try_clone()?))
            .stderr(Stdio::from(logs.stderr.try_clone()?));
        if desc.user_install {
            command.arg("--user");
        }
        if desc.verbosity == 0 {
            command.arg("--verbose=0");
        }
        if verb == "configure" && desc.dynamic {
            command.arg("--enable-executable-dynamic");
            command.arg("--enable-shared");
        }
        let status = command.status()?;
        Ok(status.code().unwrap_or(-1))
    }
}

impl BuildBackend for ProcessBackend {
    fn configure(
        &mut self,
        desc: &PackageDesc,
        dist_dir: &Path,
        logs: &mut BuildLogs,
    ) -> io::Result<i32> {
        self.invoke("configure", desc, dist_dir, logs)
    }

    fn build(
        &mut self,
        desc: &PackageDesc,
        dist_dir: &Path,
        logs: &mut BuildLogs,
    ) -> io::Result<i32> {
        self.invoke("build", desc, dist_dir, logs)
    }

    fn haddock(
        &mut self,
        desc: &PackageDesc,
        dist_dir: &Path,
        logs: &mut BuildLogs,
    ) -> io::Result<i32> {
        self.invoke("haddock", desc, dist_dir, logs)
    }
}

/// Synthesize the package description for the current compile output.
pub(crate) fn synthesize(
    computed: &ComputedState,
    targets: &[String],
    dist_dir: &Path,
    dynamic: bool,
) -> io::Result<PackageDesc> {
    let build_dir = dist_dir.join("build");
    fs::create_dir_all(&build_dir)?;
    let mut executables = Vec::new();
    for target in targets {
        let wrapper = if target == "Main" {
            None
        } else {
            // A target other than Main gets a wrapper that imports it and
            // runs its main.
            let path = build_dir.join(format!("{}-main.hs", target.replace('.', "-")));
            let source = format!(
                "module Main where\n\nimport qualified {target}\n\nmain :: IO ()\nmain = {target}.main\n"
            );
            fs::write(&path, source)?;
            Some(path)
        };
        executables.push(ExecutableSpec {
            name: target.replace('.', "-"),
            main_module: target.clone(),
            wrapper,
        });
    }
    let dependencies = computed
        .all_pkg_deps()
        .into_iter()
        .map(|(package, version)| Dependency { package, version })
        .collect();
    Ok(PackageDesc {
        name: "main".to_owned(),
        version: "1.0".to_owned(),
        exposed_modules: computed.loaded_modules().to_vec(),
        executables,
        dependencies,
        user_install: true,
        verbosity: 0,
        dynamic,
    })
}

fn open_logs(dist_dir: &Path, stem: &str) -> io::Result<BuildLogs> {
    let build_dir = dist_dir.join("build");
    fs::create_dir_all(&build_dir)?;
    Ok(BuildLogs {
        stdout: File::create(build_dir.join(format!("{stem}.stdout")))?,
        stderr: File::create(build_dir.join(format!("{stem}.stderr")))?,
    })
}

/// Drive configure+build for the requested executables. The progress
/// callback fires on entry and after dependency resolution, configure, and
/// build.
pub(crate) fn build_executables(
    config: &SessionConfig,
    computed: &ComputedState,
    targets: &[String],
    backend: &mut dyn BuildBackend,
    progress: &mut dyn FnMut(&str),
) -> Result<i32, SessionError> {
    progress("starting executable build");
    let dist_dir = config.dist_dir();
    let desc = synthesize(computed, targets, &dist_dir, config.dynamic_link)?;
    fs::write(dist_dir.join("main.desc"), desc.render())?;
    progress("resolved dependencies");
    let stem = desc
        .executables
        .first()
        .map_or_else(|| "main".to_owned(), |exe| exe.name.clone());
    let mut logs = open_logs(&dist_dir, &stem)?;
    let code = backend.configure(&desc, &dist_dir, &mut logs)?;
    progress("configured");
    if code != 0 {
        return Ok(code);
    }
    let code = backend.build(&desc, &dist_dir, &mut logs)?;
    progress("built executables");
    Ok(code)
}

/// Drive configure+haddock for the current snapshot. Documentation lands
/// under `dist/doc`.
pub(crate) fn build_doc(
    config: &SessionConfig,
    computed: &ComputedState,
    backend: &mut dyn BuildBackend,
    progress: &mut dyn FnMut(&str),
) -> Result<i32, SessionError> {
    progress("starting documentation build");
    let dist_dir = config.dist_dir();
    fs::create_dir_all(dist_dir.join("doc"))?;
    let desc = synthesize(computed, &[], &dist_dir, config.dynamic_link)?;
    fs::write(dist_dir.join("main.desc"), desc.render())?;
    progress("resolved dependencies");
    let mut logs = open_logs(&dist_dir, "haddock")?;
    let code = backend.configure(&desc, &dist_dir, &mut logs)?;
    progress("configured");
    if code != 0 {
        return Ok(code);
    }
    let code = backend.haddock(&desc, &dist_dir, &mut logs)?;
    progress("generated documentation");
    Ok(code)
}
