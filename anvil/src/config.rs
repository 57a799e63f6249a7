// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Engine configuration (spec §4.10), loaded the way `boulder::env::Env`
//! loads its own: a [`config::Manager`] searches system (`/etc`,
//! `/usr/share`) then user (`$XDG_CONFIG_HOME`) scopes and merges whatever
//! it finds, falling back to [`EngineConfig::default`] if nothing is
//! configured at all.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const PROGRAM: &str = "anvil";

/// The subset of scheduler/engine tuning knobs a deployment may want to
/// override outside of `perform`'s own CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently *active* recipe executions (spec §4.6).
    pub max_active: Option<usize>,
    /// Upper bound on OS threads the scheduler may spawn in total.
    pub max_threads: Option<usize>,
    /// Diagnostic verbosity, as accepted by `anvil_diag::set_verbosity`.
    pub verbosity: u8,
    /// Root directory prepended to out-of-tree target paths (spec §4.3).
    pub out_root: Option<PathBuf>,
    /// Path to the change-tracking database file (spec §4.8).
    pub depdb_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_active: None,
            max_threads: None,
            verbosity: 0,
            out_root: None,
            depdb_path: None,
        }
    }
}

impl config::Config for EngineConfig {
    fn domain() -> String {
        "engine".into()
    }

    fn merge(self, other: Self) -> Self {
        EngineConfig {
            max_active: self.max_active.or(other.max_active),
            max_threads: self.max_threads.or(other.max_threads),
            verbosity: if self.verbosity != 0 { self.verbosity } else { other.verbosity },
            out_root: self.out_root.or(other.out_root),
            depdb_path: self.depdb_path.or(other.depdb_path),
        }
    }
}

/// Loads the merged system+user configuration, or the default if neither
/// scope has anything. `is_root` picks the system manager's root the same
/// way `boulder::env::Env::new` does.
pub async fn load(is_root: bool) -> EngineConfig {
    let manager = if is_root {
        Some(config::Manager::system("/", PROGRAM))
    } else {
        config::Manager::user(PROGRAM)
    };

    match manager {
        Some(manager) => manager.load::<EngineConfig>().await.unwrap_or_default(),
        None => EngineConfig::default(),
    }
}

/// Persists `config` to the user (or system, if `is_root`) scope under the
/// name `"engine"`.
pub async fn save(is_root: bool, config: &EngineConfig) -> Result<(), config::SaveError> {
    let manager = if is_root {
        config::Manager::system("/", PROGRAM)
    } else {
        match config::Manager::user(PROGRAM) {
            Some(manager) => manager,
            None => return Ok(()),
        }
    };

    manager.save("engine", config).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn merge_prefers_self_then_falls_back_to_other() {
        let mine = EngineConfig {
            max_active: Some(4),
            ..EngineConfig::default()
        };
        let theirs = EngineConfig {
            max_active: Some(1),
            max_threads: Some(8),
            ..EngineConfig::default()
        };

        let merged = config::Config::merge(mine, theirs);
        assert_eq!(merged.max_active, Some(4));
        assert_eq!(merged.max_threads, Some(8));
    }

    #[test]
    fn default_has_no_overrides() {
        let config = EngineConfig::default();
        assert!(config.max_active.is_none());
        assert!(config.max_threads.is_none());
        assert_eq!(config.verbosity, 0);
    }
}
