// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! A general-purpose build engine: a scoped variable/rule data model, a
//! hand-rolled parallel scheduler, and a load/match/execute driver, backed
//! by an append-only change-tracking database for deciding what needs
//! rebuilding.

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod name;
pub mod path;
pub mod rule;
pub mod scheduler;
pub mod scope;
pub mod target;
pub mod util;
pub mod value;
pub mod variable;

pub use context::Context;
pub use error::Error;
