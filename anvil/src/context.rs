// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The run-wide [`Context`]: a single value holding the current phase, the
//! scope/target data model, and the scheduler, created once per process
//! invocation and threaded explicitly rather than stashed in a global --
//! multiple `Context`s can therefore coexist in one test binary.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use crate::path::Dir;
use crate::scheduler::Scheduler;
use crate::scope::ScopeTree;
use crate::target::{self, TargetMap, TargetTypeRegistry};

/// The three phases an `Action` moves a target through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Load,
    Match,
    Execute,
}

/// Run-wide shared state. `phase` is a shared lock: `match` and `execute`
/// take shared (read) locks so they can run concurrently with each other,
/// while `load` takes an exclusive (write) lock. A recipe that needs a
/// synchronous load (e.g. to import a project during match) briefly
/// upgrades by dropping its read guard and taking a write guard -- there is
/// a small window where another thread could slip in between, which is an
/// accepted simplification versus a true atomic upgrade (std's `RwLock`
/// doesn't offer one).
pub struct Context {
    pub scopes: ScopeTree,
    pub targets: TargetMap,
    pub target_types: TargetTypeRegistry,
    pub scheduler: Arc<Scheduler>,
    pub home: PathBuf,
    pub work_dir: Dir,
    phase: RwLock<Phase>,
    verbosity: AtomicU8,
}

impl Context {
    pub fn new(max_threads: usize, max_active: usize, work_dir: Dir) -> Arc<Self> {
        let target_types = TargetTypeRegistry::new();
        target_types.register(&target::FILE);

        Arc::new(Context {
            scopes: ScopeTree::new(),
            targets: TargetMap::new(),
            target_types,
            scheduler: Scheduler::new(max_threads, max_active),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            work_dir,
            phase: RwLock::new(Phase::Load),
            verbosity: AtomicU8::new(1),
        })
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_verbosity(&self, level: u8) {
        self.verbosity.store(level, Ordering::Relaxed);
        anvil_diag::set_verbosity(level);
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity.load(Ordering::Relaxed)
    }

    /// Run `f` with the context held in the load phase (exclusive lock).
    pub fn with_load<T>(&self, f: impl FnOnce() -> T) -> T {
        let mut guard = self.phase.write().unwrap_or_else(|e| e.into_inner());
        *guard = Phase::Load;
        let result = f();
        result
    }

    /// Run `f` with the context held in match or execute phase (shared
    /// lock, so other match/execute work proceeds concurrently).
    pub fn with_concurrent<T>(&self, phase: Phase, f: impl FnOnce() -> T) -> T {
        debug_assert!(matches!(phase, Phase::Match | Phase::Execute));
        let _guard = self.phase.read().unwrap_or_else(|e| e.into_inner());
        f()
    }

    /// Briefly upgrade to an exclusive load lock from within match/execute,
    /// run `f`, then conceptually return to the concurrent phase (the
    /// caller re-acquires a shared guard itself afterward).
    pub fn synchronous_load<T>(&self, f: impl FnOnce() -> T) -> T {
        let mut guard = self.phase.write().unwrap_or_else(|e| e.into_inner());
        let previous = *guard;
        *guard = Phase::Load;
        let result = f();
        *guard = previous;
        result
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_context_starts_in_load_phase() {
        let ctx = Context::new(4, 2, Dir::new("."));
        assert_eq!(ctx.phase(), Phase::Load);
        ctx.shutdown();
    }

    #[test]
    fn with_concurrent_does_not_deadlock_across_two_calls() {
        let ctx = Context::new(4, 2, Dir::new("."));
        ctx.with_concurrent(Phase::Match, || {});
        ctx.with_concurrent(Phase::Execute, || {});
        ctx.shutdown();
    }
}
