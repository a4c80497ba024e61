// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: CLI entry point for the Kiln compile-session tool.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! CLI entry point for the Kiln compile-session tool.
//!
//! `kiln [SOURCES_DIR]` opens a demo session over the given directory,
//! compiles it once, and prints diagnostics and loaded modules.
//! `kiln --server ...` is the private worker mode the session layer spawns;
//! its argv carries engine options and transport parameters, its
//! stdin/stdout carry the framed protocol, and stderr is free for logging.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_codec::SERVER_FLAG;
use kiln_session::{IdeSession, SessionConfig};

#[derive(Debug, Parser)]
#[command(author = "Lukas Bower", version, about = "Interactive compile sessions")]
struct Cli {
    /// Directory holding the source modules to compile.
    #[arg(value_name = "SOURCES_DIR", default_value = ".")]
    sources_dir: PathBuf,

    /// Keep the scratch directory after the session ends.
    #[arg(long, default_value_t = false)]
    keep_temp: bool,
}

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some(SERVER_FLAG) {
        std::process::exit(kiln_session::server::serve(&args[2..]));
    }
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let scratch = std::env::temp_dir().join(format!("kiln-{}", std::process::id()));
    let mut config = SessionConfig::for_root(&scratch);
    config.sources_dir = cli
        .sources_dir
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", cli.sources_dir.display()))?;
    config.delete_temp_on_shutdown = !cli.keep_temp;

    let session = IdeSession::init(config).context("cannot open session")?;
    let mut handle = session.update_session().context("cannot start compile")?;
    while let Some(progress) = handle.progress() {
        println!("[{:>3}] {}", progress.step(), progress.message());
    }
    let session = handle.wait().context("compile failed")?;

    for diagnostic in session.source_errors().context("cannot read diagnostics")? {
        println!(
            "{}",
            serde_json::to_string(&diagnostic).context("cannot render diagnostic")?
        );
    }
    let loaded = session.loaded_modules().context("cannot read modules")?;
    println!("loaded: {}", loaded.join(", "));

    session.shutdown().context("cannot close session")?;
    Ok(())
}
