// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! `anvil perform` -- the one meta-operation with more than one operation
//! (spec GLOSSARY: `update`/`clean`/`install`/`test`), matching §4.3/§4.7.

use std::sync::Arc;

use clap::Parser;
use thiserror::Error;

use crate::engine::{self, TargetRef};
use crate::rule::Action;
use crate::Context;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Operation {
    Update,
    Clean,
    Install,
    Test,
}

impl Operation {
    fn action(self) -> Action {
        match self {
            Operation::Update => Action::simple("perform", "update"),
            Operation::Clean => Action::simple("perform", "clean"),
            Operation::Install => Action::outer("perform", "install", "update"),
            Operation::Test => Action::outer("perform", "test", "update"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Load, match and execute recipes for one or more targets")]
pub struct Command {
    #[arg(value_enum, help = "Operation to perform")]
    operation: Operation,
    #[arg(required = true, help = "File targets, relative to --directory")]
    targets: Vec<String>,
}

pub fn handle(command: Command, ctx: &Arc<Context>) -> Result<(), Error> {
    let action = command.operation.action();

    for name in &command.targets {
        let target_ref = TargetRef {
            target_type: "file".into(),
            dir: ctx.work_dir.clone(),
            out: ctx.work_dir.clone(),
            name: name.clone(),
            extension: None,
        };

        let target = engine::search(ctx, &target_ref)?;
        let state = engine::execute_target(ctx, action, &target)?;
        anvil_diag::info(format!("{action} {target}: {state:?}"));

        if state == crate::rule::TargetState::Failed {
            return Err(Error::Failed(name.clone()));
        }
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to {0}")]
    Failed(String),
    #[error(transparent)]
    Build(#[from] anvil_diag::BuildFailure),
}
