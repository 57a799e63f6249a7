// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! `anvil configure` -- the meta-operation that only matches rules without
//! executing recipes (spec GLOSSARY: "Meta-operation: outermost dispatch").

use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use crate::engine::{self, TargetRef};
use crate::rule::Action;
use crate::Context;

const CONFIGURE: Action = Action::simple("configure", "configure");

#[derive(Debug, Parser)]
#[command(about = "Match rules for one or more targets without executing recipes")]
pub struct Command {
    #[arg(required = true, help = "File targets, relative to --directory")]
    targets: Vec<String>,
}

pub fn handle(command: Command, ctx: &Arc<Context>) -> Result<(), Error> {
    for name in &command.targets {
        let target_ref = TargetRef {
            target_type: "file".into(),
            dir: ctx.work_dir.clone(),
            out: ctx.work_dir.clone(),
            name: name.clone(),
            extension: None,
        };

        let target = engine::search(ctx, &target_ref)?;
        engine::match_target(ctx, CONFIGURE, &target)?;
        anvil_diag::info(format!("configured {target}"));
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] anvil_diag::BuildFailure),
}
