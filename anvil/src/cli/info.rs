// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! `anvil info` -- reports on the loaded graph without matching or
//! executing anything (spec GLOSSARY: "Meta-operation: outermost
//! dispatch").

use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use crate::Context;

#[derive(Debug, Parser)]
#[command(about = "Print information about the loaded target graph")]
pub struct Command;

pub fn handle(_command: Command, ctx: &Arc<Context>) -> Result<(), Error> {
    println!("work directory: {}", ctx.work_dir.as_path().display());
    println!("targets interned: {}", ctx.targets.len());
    println!("scopes: {}", ctx.scopes.len());
    println!("verbosity: {}", ctx.verbosity());
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {}
