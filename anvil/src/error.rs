// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The top-level composed error type (spec §7 "Error Handling Design"):
//! every module-local `thiserror` enum converts into this via `#[from]`, the
//! way `boulder::builder::Error` composes its collaborators' errors.
//! [`anvil_diag::BuildFailure`] is deliberately excluded -- it is the
//! terminal, already-reported sentinel and never gets wrapped further.

use std::path::PathBuf;

use thiserror::Error;

use crate::rule::MatchError;
use crate::scheduler::Cancelled;
use crate::value::TypeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("rule matching failed")]
    Match(#[from] MatchError),

    #[error("value conversion failed")]
    Type(#[from] TypeError),

    #[error(transparent)]
    Scheduler(#[from] Cancelled),

    #[error("dependency database error")]
    Depdb(#[from] anvil_depdb::Error),

    #[error("failed to read config file {0:?}")]
    ConfigRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file {0:?}")]
    ConfigParse(PathBuf, #[source] serde_yaml::Error),

    #[error("unknown target type {0:?}")]
    UnknownTargetType(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
