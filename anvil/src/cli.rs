// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The thin CLI shell (spec §4.11): a `clap`-derive `Command`/`Global`/
//! `Subcommand` triad modeled on `boulder/src/cli.rs`, exposing the
//! meta-operations named in the GLOSSARY (`perform`, `configure`, `dist`,
//! `info`) as subcommands. Per spec §1 Non-goals, option parsing/help text
//! semantics are not otherwise specified -- this exists only so the engine
//! is invokable from a shell, translating `Result<_, BuildFailure>`/
//! [`Error`] into process exit codes (spec §6.4).

use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser};
use clap_complete::{
    generate_to,
    shells::{Bash, Fish, Zsh},
};
use clap_mangen::Man;
use fs_err::{self as fs, File};
use thiserror::Error;

use crate::path::Dir;
use crate::Context;

mod configure;
mod dist;
mod info;
mod perform;

#[derive(Debug, Parser)]
#[command(name = "anvil", about = "A general-purpose build engine")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Option<Subcommand>,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase diagnostic verbosity (0-6)")]
    pub verbose: u8,
    #[arg(short = 'j', long, global = true, help = "Maximum number of concurrently active recipes")]
    pub jobs: Option<usize>,
    #[arg(long, global = true, help = "Maximum number of scheduler threads")]
    pub max_threads: Option<usize>,
    #[arg(long, global = true, help = "Working directory to resolve targets against")]
    pub directory: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    pub generate_manpages: Option<PathBuf>,
    #[arg(long, global = true, hide = true)]
    pub generate_completions: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Perform(perform::Command),
    Configure(configure::Command),
    Dist(dist::Command),
    Info(info::Command),
}

/// Parses arguments, builds a [`Context`] and dispatches to the chosen
/// subcommand. Returns `Ok(())` on success; any `Err` is a caller signal to
/// exit non-zero (spec §6.4: 1 for a reported build failure, 2 for
/// anything this shell itself could not make sense of).
pub async fn process() -> Result<(), Error> {
    let args = std::env::args().collect::<Vec<_>>();
    let Command { global, subcommand } = Command::parse_from(args);

    if let Some(dir) = global.generate_manpages {
        fs::create_dir_all(&dir)?;
        let main_cmd = Command::command();
        let main_man = Man::new(main_cmd.clone());
        let mut buffer = File::create(dir.join("anvil.1"))?;
        main_man.render(&mut buffer)?;

        for sub in main_cmd.get_subcommands() {
            let sub_man = Man::new(sub.clone());
            let name = format!("anvil-{}.1", sub.get_name());
            let mut buffer = File::create(dir.join(&name))?;
            sub_man.render(&mut buffer)?;
        }
        return Ok(());
    }

    if let Some(dir) = global.generate_completions {
        fs::create_dir_all(&dir)?;
        let mut cmd = Command::command();
        generate_to(Bash, &mut cmd, "anvil", &dir)?;
        generate_to(Fish, &mut cmd, "anvil", &dir)?;
        generate_to(Zsh, &mut cmd, "anvil", &dir)?;
        return Ok(());
    }

    let is_root = crate::util::is_root();
    let mut config = crate::config::load(is_root).await;
    if let Some(jobs) = global.jobs {
        config.max_active = Some(jobs);
    }
    if let Some(max_threads) = global.max_threads {
        config.max_threads = Some(max_threads);
    }

    let max_threads = config.max_threads.unwrap_or_else(|| crate::util::num_cpus().get());
    let max_active = config.max_active.unwrap_or(max_threads).min(max_threads).max(1);
    let work_dir = match &global.directory {
        Some(dir) => Dir::new(dir.to_string_lossy()),
        None => Dir::new(std::env::current_dir()?.to_string_lossy()),
    };

    let ctx = Context::new(max_threads.max(1), max_active, work_dir);
    ctx.set_verbosity(config.verbosity.max(global.verbose));

    let result = match subcommand {
        Some(Subcommand::Perform(command)) => perform::handle(command, &ctx),
        Some(Subcommand::Configure(command)) => configure::handle(command, &ctx),
        Some(Subcommand::Dist(command)) => dist::handle(command, &ctx),
        Some(Subcommand::Info(command)) => info::handle(command, &ctx),
        None => Ok(()),
    };

    ctx.shutdown();
    result
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("perform")]
    Perform(#[from] perform::Error),
    #[error("configure")]
    Configure(#[from] configure::Error),
    #[error("dist")]
    Dist(#[from] dist::Error),
    #[error("info")]
    Info(#[from] info::Error),
    #[error("io error")]
    Io(#[from] std::io::Error),
}
