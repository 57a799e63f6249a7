// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! `anvil dist` -- packages a target tree by running its `dist` operation
//! to completion (match + execute), the way `perform update` does but
//! under its own meta-operation name.

use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use crate::engine::{self, TargetRef};
use crate::rule::Action;
use crate::Context;

const DIST: Action = Action::outer("dist", "dist", "update");

#[derive(Debug, Parser)]
#[command(about = "Produce a distributable source archive for one or more targets")]
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
        let state = engine::execute_target(ctx, DIST, &target)?;
        anvil_diag::info(format!("dist {target}: {state:?}"));
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Build(#[from] anvil_diag::BuildFailure),
}
