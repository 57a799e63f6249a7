// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The target and prerequisite graph: target types, interned targets, and
//! their prerequisite/group relationships.
//!
//! Targets are interned once and never removed; cross-references (a group
//! pointing at its members, a member pointing back at its group) are
//! therefore plain `Arc<Target>` clones rather than anything that would need
//! a cycle collector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use crate::path::{Dir, Path};
use crate::rule::{Recipe, TargetState};
use crate::scheduler::{self, Counter};
use crate::value::Value;

/// How target-type identity treats a target's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionDiscipline {
    /// Extension never participates in identity (e.g. `dir{}`).
    None,
    /// Extension must be given at declaration time and is part of identity.
    MustBeSpecified,
    /// Extension is initially unknown and derived during match; identity
    /// uses whatever extension was known at interning time.
    DerivedLater,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetTypeFlags {
    pub group: bool,
    pub see_through: bool,
    pub member_hint: bool,
    pub dyn_members: bool,
}

/// A static target-type descriptor. Concrete language modules register
/// instances of this at process startup; the engine never constructs one
/// itself.
#[derive(Debug)]
pub struct TargetType {
    pub name: &'static str,
    pub base_type: Option<&'static str>,
    pub extension_discipline: ExtensionDiscipline,
    pub default_extension: Option<&'static str>,
    pub flags: TargetTypeFlags,
}

impl TargetType {
    pub fn is_a(&self, registry: &TargetTypeRegistry, other: &str) -> bool {
        if self.name == other {
            return true;
        }
        let mut base = self.base_type;
        while let Some(b) = base {
            if b == other {
                return true;
            }
            base = registry.find(b).and_then(|t| t.base_type);
        }
        false
    }
}

/// Registry of known target types, populated during load by modules.
#[derive(Default)]
pub struct TargetTypeRegistry {
    types: Mutex<HashMap<&'static str, &'static TargetType>>,
}

impl TargetTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tt: &'static TargetType) {
        self.types.lock().unwrap_or_else(|e| e.into_inner()).insert(tt.name, tt);
    }

    pub fn find(&self, name: &str) -> Option<&'static TargetType> {
        self.types.lock().unwrap_or_else(|e| e.into_inner()).get(name).copied()
    }
}

/// Uniqueness key. `dir`/`out` must already be absolute and normalized by
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TargetKey {
    target_type: &'static str,
    dir: Dir,
    out: Dir,
    name: String,
    extension: Option<String>,
}

/// A declared, pre-resolution dependency of a target. `cached` is filled in
/// at search time via a one-shot
/// compare-and-swap ([`OnceLock`] gives us exactly that: the loser of a
/// race simply observes the winner's value already set).
pub struct Prerequisite {
    pub target_type: String,
    pub dir: Dir,
    pub out: Dir,
    pub name: String,
    pub extension: Option<String>,
    pub project: Option<String>,
    pub vars: HashMap<String, Value>,
    cached: OnceLock<Arc<Target>>,
}

impl Prerequisite {
    pub fn new(target_type: impl Into<String>, dir: Dir, out: Dir, name: impl Into<String>) -> Self {
        Prerequisite {
            target_type: target_type.into(),
            dir,
            out,
            name: name.into(),
            extension: None,
            project: None,
            vars: HashMap::new(),
            cached: OnceLock::new(),
        }
    }

    /// Resolve against `map`, caching the result. Idempotent and race-safe:
    /// if two threads race to resolve the same prerequisite they both
    /// compute the same (interned) target and only one write wins.
    pub fn resolve(&self, map: &TargetMap, registry: &TargetTypeRegistry) -> Option<Arc<Target>> {
        if let Some(t) = self.cached.get() {
            return Some(t.clone());
        }
        let tt = registry.find(&self.target_type)?;
        let (target, _inserted) = map.insert(tt, self.dir.clone(), self.out.clone(), self.name.clone(), self.extension.clone());
        let _ = self.cached.set(target.clone());
        Some(self.cached.get().unwrap_or(&target).clone())
    }

    pub fn cached_target(&self) -> Option<Arc<Target>> {
        self.cached.get().cloned()
    }
}

/// How a resolved prerequisite participates in a target's prerequisite list:
/// ad hoc members share the recipe, see-through groups expand
/// transparently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Include {
    Normal,
    Adhoc,
    Excluded,
}

/// A resolved prerequisite, produced during match.
#[derive(Clone)]
pub struct PrerequisiteTarget {
    pub target: Arc<Target>,
    pub include: Include,
}

/// Monotonic per-(target, action) progress counter. Values are compared
/// against context-wide thresholds rather than encoding a literal enum, so
/// concurrent readers can observe "at least matched" without a lock. The
/// ordering `touched < matched < applied < busy < executed` tracks a
/// target's progress through one build operation.
pub mod offset {
    pub const UNTOUCHED: u64 = 0;
    pub const TOUCHED: u64 = 1;
    pub const MATCHED: u64 = 2;
    pub const APPLIED: u64 = 3;
    pub const BUSY: u64 = 4;
    pub const EXECUTED: u64 = 5;
}

/// Per-(target, action) state.
pub struct OpState {
    pub offset: AtomicU64,
    pub dependents: AtomicU64,
    pub recipe: Mutex<Option<Recipe>>,
    pub vars: Mutex<HashMap<String, Value>>,
    pub prerequisite_targets: Mutex<Vec<PrerequisiteTarget>>,
    /// The task-count the scheduler waits on while this (target, action) is
    /// being matched or executed by another thread; zero when idle.
    pub wait_counter: Counter,
    pub result: Mutex<Option<TargetState>>,
}

impl Default for OpState {
    fn default() -> Self {
        OpState {
            offset: AtomicU64::new(offset::UNTOUCHED),
            dependents: AtomicU64::new(0),
            recipe: Mutex::new(None),
            vars: Mutex::new(HashMap::new()),
            prerequisite_targets: Mutex::new(Vec::new()),
            wait_counter: scheduler::new_counter(),
            result: Mutex::new(None),
        }
    }
}

impl OpState {
    /// Attempt to advance from `from` to `to`. Returns whether this call won
    /// the race; a successful CAS from state N to N+1 happens-before any
    /// observer that subsequently reads N+1.
    pub fn advance(&self, from: u64, to: u64) -> bool {
        self.offset.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn current(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn at_least(&self, threshold: u64) -> bool {
        self.current() >= threshold
    }
}

/// An interned target instance.
pub struct Target {
    pub target_type: &'static TargetType,
    pub dir: Dir,
    pub out: Dir,
    pub name: String,
    pub extension: Mutex<Option<String>>,
    pub group: Mutex<Option<Arc<Target>>>,
    pub adhoc_members: Mutex<Vec<Arc<Target>>>,
    pub prerequisites: Mutex<Vec<Prerequisite>>,
    pub path: Mutex<Option<Path>>,
    pub mtime: Mutex<Option<SystemTime>>,
    /// An inline script attached directly to this target in the buildfile.
    /// Ad hoc recipes take priority over rule matching.
    pub adhoc_recipe: Mutex<Option<Recipe>>,
    ops: Mutex<HashMap<(&'static str, &'static str), Arc<OpState>>>,
}

impl Target {
    fn new(target_type: &'static TargetType, dir: Dir, out: Dir, name: String, extension: Option<String>) -> Self {
        Target {
            target_type,
            dir,
            out,
            name,
            extension: Mutex::new(extension),
            group: Mutex::new(None),
            adhoc_members: Mutex::new(Vec::new()),
            prerequisites: Mutex::new(Vec::new()),
            path: Mutex::new(None),
            mtime: Mutex::new(None),
            adhoc_recipe: Mutex::new(None),
            ops: Mutex::new(HashMap::new()),
        }
    }

    /// Per-(meta-operation, operation) state, created on first access.
    pub fn op_state(&self, meta_op: &'static str, op: &'static str) -> Arc<OpState> {
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry((meta_op, op))
            .or_insert_with(|| Arc::new(OpState::default()))
            .clone()
    }

    pub fn add_adhoc_member(&self, member: Arc<Target>) {
        *member.group.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.adhoc_members.lock().unwrap_or_else(|e| e.into_inner()).push(member);
    }

    /// Members of a real or see-through group. Empty for a non-group
    /// target.
    pub fn group_members(&self) -> Vec<Arc<Target>> {
        self.adhoc_members.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_group(&self) -> bool {
        self.target_type.flags.group
    }

    pub fn is_see_through(&self) -> bool {
        self.target_type.flags.see_through
    }

    pub fn set_path(&self, path: Path) {
        *self.path.lock().unwrap_or_else(|e| e.into_inner()) = Some(path);
    }

    pub fn path(&self) -> Option<Path> {
        self.path.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_mtime(&self, mtime: SystemTime) {
        *self.mtime.lock().unwrap_or_else(|e| e.into_inner()) = Some(mtime);
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        *self.mtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Derive a path from the directory/name/default-extension if one has
    /// not already been set.
    pub fn derive_path(&self) -> Path {
        if let Some(p) = self.path() {
            return p;
        }
        let file_name = match (self.extension.lock().unwrap_or_else(|e| e.into_inner()).clone(), self.target_type.default_extension) {
            (Some(ext), _) if !ext.is_empty() => format!("{}.{}", self.name, ext),
            (_, Some(ext)) if !ext.is_empty() => format!("{}.{}", self.name, ext),
            _ => self.name.clone(),
        };
        let path = self.dir.join(file_name);
        self.set_path(path.clone());
        path
    }

    pub fn exists(&self) -> bool {
        self.path().map(|p| p.as_std().exists()).unwrap_or(false)
            || self.derive_path_readonly().as_std().exists()
    }

    fn derive_path_readonly(&self) -> Path {
        if let Some(p) = self.path() {
            return p;
        }
        let ext = self.extension.lock().unwrap_or_else(|e| e.into_inner()).clone().or(self.target_type.default_extension.map(str::to_owned));
        let file_name = match ext {
            Some(ext) if !ext.is_empty() => format!("{}.{}", self.name, ext),
            _ => self.name.clone(),
        };
        self.dir.join(file_name)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{{}{}}}", self.target_type.name, self.dir.as_key(), self.name)
    }
}

/// The global, MT-safe target arena: targets are interned on first
/// reference and never removed.
#[derive(Default)]
pub struct TargetMap {
    table: Mutex<HashMap<TargetKey, Arc<Target>>>,
}

impl TargetMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or return the existing target for this identity. Racing
    /// insertions resolve deterministically: since the whole operation runs
    /// under the table mutex, the first caller to reach it wins and every
    /// later caller (including true concurrent races) observes the same
    /// `Arc`.
    pub fn insert(
        &self,
        target_type: &'static TargetType,
        dir: Dir,
        out: Dir,
        name: String,
        extension: Option<String>,
    ) -> (Arc<Target>, bool) {
        let key_extension = match target_type.extension_discipline {
            ExtensionDiscipline::None => None,
            ExtensionDiscipline::MustBeSpecified | ExtensionDiscipline::DerivedLater => extension.clone(),
        };
        let key = TargetKey {
            target_type: target_type.name,
            dir: dir.clone(),
            out: out.clone(),
            name: name.clone(),
            extension: key_extension,
        };

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = table.get(&key) {
            return (existing.clone(), false);
        }
        let target = Arc::new(Target::new(target_type, dir, out, name, extension));
        table.insert(key, target.clone());
        (target, true)
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter_snapshot(&self) -> Vec<Arc<Target>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }
}

/// The one target type every engine instance registers itself: a plain file
/// identified by path alone, with no extension discipline. Every other
/// target type is registered by an external language module; `file` is the
/// base every such type ultimately derives from, so the engine cannot do
/// without it.
pub static FILE: TargetType = TargetType {
    name: "file",
    base_type: None,
    extension_discipline: ExtensionDiscipline::None,
    default_extension: None,
    flags: TargetTypeFlags {
        group: false,
        see_through: false,
        member_hint: false,
        dyn_members: false,
    },
};

#[cfg(test)]
mod test {
    use super::*;

    static FILE_TT: TargetType = TargetType {
        name: "file",
        base_type: None,
        extension_discipline: ExtensionDiscipline::None,
        default_extension: None,
        flags: TargetTypeFlags {
            group: false,
            see_through: false,
            member_hint: false,
            dyn_members: false,
        },
    };

    #[test]
    fn interning_returns_same_pointer() {
        let map = TargetMap::new();
        let (a, inserted_a) = map.insert(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "a".into(), None);
        let (b, inserted_b) = map.insert(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "a".into(), None);
        assert!(inserted_a);
        assert!(!inserted_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn extension_insignificant_for_none_discipline() {
        let map = TargetMap::new();
        let (a, _) = map.insert(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "a".into(), Some("txt".into()));
        let (b, inserted) = map.insert(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "a".into(), None);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn op_state_advances_monotonically() {
        let target = Target::new(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "a".into(), None);
        let state = target.op_state("perform", "update");
        assert!(state.advance(offset::UNTOUCHED, offset::TOUCHED));
        assert!(!state.advance(offset::UNTOUCHED, offset::TOUCHED));
        assert!(state.at_least(offset::TOUCHED));
        assert!(!state.at_least(offset::MATCHED));
    }

    #[test]
    fn derive_path_uses_default_extension() {
        static OBJ_TT: TargetType = TargetType {
            name: "obj",
            base_type: None,
            extension_discipline: ExtensionDiscipline::DerivedLater,
            default_extension: Some("o"),
            flags: TargetTypeFlags::default(),
        };
        let target = Target::new(&OBJ_TT, Dir::new("/p"), Dir::new("/p"), "foo".into(), None);
        assert_eq!(target.derive_path().to_string(), "/p/foo.o");
    }
}
