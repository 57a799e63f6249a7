// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Interned variable descriptors and their pools: one per project plus a
//! single process-wide public pool.
//!
//! Interning is one-shot: once a [`Variable`] handle is produced for a name,
//! its `Arc` is cheap to clone and reads never touch the pool mutex again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::value::TypeTag;

/// Who may read/write a variable of this visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    Global,
    Project,
    Scope,
    Target,
    Prerequisite,
}

#[derive(Debug)]
struct VariableInner {
    name: String,
    type_tag: Option<TypeTag>,
    visibility: Visibility,
    overridable: bool,
}

/// A cheap-to-clone handle to an interned variable descriptor. Two handles
/// for the same name (within the same pool) are guaranteed to point at the
/// same allocation, so equality can be done by pointer/name comparison.
#[derive(Debug, Clone)]
pub struct Variable(Arc<VariableInner>);

impl Variable {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        self.0.type_tag
    }

    pub fn visibility(&self) -> Visibility {
        self.0.visibility
    }

    pub fn overridable(&self) -> bool {
        self.0.overridable
    }

    /// The `.__override` synthetic variable name for this variable.
    pub fn override_name(&self) -> String {
        format!("{}.__override", self.0.name)
    }

    pub fn prefix_name(&self) -> String {
        format!("{}.__prefix", self.0.name)
    }

    pub fn suffix_name(&self) -> String {
        format!("{}.__suffix", self.0.name)
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Variable {}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

/// An interning pool of [`Variable`] descriptors, guarded by a mutex on
/// insert; reads of an already-handed-out [`Variable`] never lock.
#[derive(Default)]
pub struct VariablePool {
    entries: Mutex<HashMap<String, Variable>>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (if absent) and return the handle for `name`. Re-declaring an
    /// already-interned variable with a different type is a logic error
    /// elsewhere (the engine should reject it at load time); the pool itself
    /// just returns the first registration.
    pub fn insert(&self, name: &str, type_tag: Option<TypeTag>, visibility: Visibility, overridable: bool) -> Variable {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(name.to_owned())
            .or_insert_with(|| {
                Variable(Arc::new(VariableInner {
                    name: name.to_owned(),
                    type_tag,
                    visibility,
                    overridable,
                }))
            })
            .clone()
    }

    pub fn find(&self, name: &str) -> Option<Variable> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single process-wide public pool (spec §4.1: "one global public
/// pool"), for variables with [`Visibility::Global`] that are shared across
/// every project in the run.
pub fn global_pool() -> &'static VariablePool {
    static POOL: OnceLock<VariablePool> = OnceLock::new();
    POOL.get_or_init(VariablePool::new)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let pool = VariablePool::new();
        let a = pool.insert("cxx.std", Some(TypeTag::String), Visibility::Project, true);
        let b = pool.insert("cxx.std", Some(TypeTag::Bool), Visibility::Global, false);
        assert_eq!(a, b);
        // first registration wins
        assert_eq!(b.type_tag(), Some(TypeTag::String));
    }

    #[test]
    fn override_names_follow_convention() {
        let pool = VariablePool::new();
        let v = pool.insert("cflags", Some(TypeTag::Strings), Visibility::Scope, true);
        assert_eq!(v.override_name(), "cflags.__override");
        assert_eq!(v.prefix_name(), "cflags.__prefix");
        assert_eq!(v.suffix_name(), "cflags.__suffix");
    }

    #[test]
    fn find_misses_unregistered() {
        let pool = VariablePool::new();
        assert!(pool.find("nope").is_none());
    }
}
