// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The scope tree: hierarchical key/value namespaces keyed by out-directory,
//! with parent
//! chains for the out-tree and a project amalgamation chain, hosting
//! target-type/pattern-specific variable maps and rule registrations.
//!
//! Scopes are created only during the load phase (single-threaded, or at
//! least serialized by [`crate::context::Context`]'s phase lock); during
//! match/execute they are read-only, which is why lookups here take a
//! shared reference and use plain `Mutex`es rather than anything lock-free --
//! there is no *concurrent* mutation to race with, just interior mutability
//! needed because scopes are shared via `Arc` across the tree.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::name::Name;
use crate::path::Dir;
use crate::rule::RuleRegistry;
use crate::value::{TypeTag, Value};
use crate::variable::Variable;

/// A literal or regex pattern used to key target-type-specific variable
/// blocks. A bare `*` is the common "every target of this type" wildcard
/// (e.g. `obj{*}: warn = true`) rather than a literal asterisk.
#[derive(Debug, Clone)]
pub enum Pattern {
    Any,
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return Pattern::Any;
        }
        if let Some(body) = raw.strip_prefix('~') {
            match Regex::new(body) {
                Ok(re) => return Pattern::Regex(re),
                Err(_) => return Pattern::Literal(raw.to_owned()),
            }
        }
        Pattern::Literal(raw.to_owned())
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Literal(lit) => lit == name,
            Pattern::Regex(re) => re.is_match(name),
        }
    }
}

struct TypeSpecific {
    target_type: String,
    pattern: Pattern,
    vars: HashMap<String, Value>,
}

/// A node in the out-directory-keyed scope tree.
pub struct Scope {
    pub out_path: Dir,
    pub src_path: Dir,
    pub is_root: bool,
    /// Out-tree parent (the directory scope physically enclosing this one).
    parent: Option<Arc<Scope>>,
    /// Project amalgamation chain: e.g. imported projects' root scopes,
    /// consulted after the out-tree chain is exhausted.
    amalgamation: Mutex<Vec<Arc<Scope>>>,
    vars: Mutex<HashMap<String, Value>>,
    type_specific: Mutex<Vec<TypeSpecific>>,
    rules: Mutex<RuleRegistry>,
    loaded_modules: Mutex<HashSet<String>>,
}

impl Scope {
    fn new(out_path: Dir, src_path: Dir, parent: Option<Arc<Scope>>) -> Self {
        let is_root = parent.is_none();
        Scope {
            out_path,
            src_path,
            is_root,
            parent,
            amalgamation: Mutex::new(Vec::new()),
            vars: Mutex::new(HashMap::new()),
            type_specific: Mutex::new(Vec::new()),
            rules: Mutex::new(RuleRegistry::new()),
            loaded_modules: Mutex::new(HashSet::new()),
        }
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    pub fn add_amalgamation(&self, other: Arc<Scope>) {
        self.amalgamation.lock().unwrap_or_else(|e| e.into_inner()).push(other);
    }

    /// Assign a plain scope variable (`NAME = VALUE`).
    pub fn assign(&self, name: &str, value: Value) {
        self.vars.lock().unwrap_or_else(|e| e.into_inner()).insert(name.to_owned(), value);
    }

    /// The raw value of `name` at this scope only, with no parent walk and
    /// no override composition -- what a buildfile `+=`/`=+` assignment
    /// composes against.
    pub fn plain(&self, name: &str) -> Option<Value> {
        self.vars.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Assign into a target-type/pattern-specific block, e.g. `obj{*}: warn = true`.
    pub fn assign_type_specific(&self, target_type: &str, pattern: &str, name: &str, value: Value) {
        let mut blocks = self.type_specific.lock().unwrap_or_else(|e| e.into_inner());
        let block = blocks.iter_mut().find(|b| b.target_type == target_type && matches_same_pattern(&b.pattern, pattern));
        match block {
            Some(b) => {
                b.vars.insert(name.to_owned(), value);
            }
            None => blocks.push(TypeSpecific {
                target_type: target_type.to_owned(),
                pattern: Pattern::parse(pattern),
                vars: HashMap::from([(name.to_owned(), value)]),
            }),
        }
    }

    pub fn insert_rule(&self, meta_op: &str, op: &str, target_type: &str, name: &str, rule: crate::rule::RuleHandle) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(meta_op, op, target_type, name, rule);
    }

    pub fn rules(&self) -> std::sync::MutexGuard<'_, RuleRegistry> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_module_loaded(&self, name: &str) -> bool {
        self.loaded_modules.lock().unwrap_or_else(|e| e.into_inner()).insert(name.to_owned())
    }

    pub fn module_loaded(&self, name: &str) -> bool {
        self.loaded_modules.lock().unwrap_or_else(|e| e.into_inner()).contains(name)
    }

    /// Raw lookup of a single (possibly synthetic, e.g. `.__override`) name,
    /// walking the out-tree parent chain then the amalgamation chain.
    /// Returns the value together with its "distance" from `self` (0 =
    /// found on `self`), used by [`Scope::lookup`] to rank overrides.
    fn lookup_raw(&self, name: &str, target_type: Option<&str>, target_name: Option<&str>) -> Option<(Value, u32)> {
        let mut distance = 0u32;
        let mut node = self;
        loop {
            if let (Some(tt), Some(tn)) = (target_type, target_name) {
                let blocks = node.type_specific.lock().unwrap_or_else(|e| e.into_inner());
                for block in blocks.iter() {
                    if block.target_type == tt && block.pattern.matches(tn) {
                        if let Some(v) = block.vars.get(name) {
                            return Some((v.clone(), distance));
                        }
                    }
                }
            }
            {
                let vars = node.vars.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(v) = vars.get(name) {
                    return Some((v.clone(), distance));
                }
            }
            match &node.parent {
                Some(p) => {
                    node = p;
                    distance += 1;
                }
                None => break,
            }
        }

        // Project amalgamation chain: walked last, distance keeps increasing
        // from wherever the out-tree chain ended.
        let amalgamation = self.amalgamation.lock().unwrap_or_else(|e| e.into_inner());
        for proj in amalgamation.iter() {
            distance += 1;
            if let Some(found) = proj.lookup_raw(name, target_type, target_name) {
                return Some((found.0, distance + found.1));
            }
        }
        None
    }

    /// Full variable lookup with override/prepend/append composition (spec
    /// §4.1): the original value is returned unless an override applies at
    /// an equal-or-more-specific level (a strictly smaller or equal
    /// distance from the query scope); prepend/append overrides compose
    /// with the original instead of replacing it.
    pub fn lookup(&self, var: &Variable, target_type: Option<&str>, target_name: Option<&str>) -> Option<Value> {
        let original = self.lookup_raw(var.name(), target_type, target_name);
        let orig_distance = original.as_ref().map(|(_, d)| *d);

        let applies = |found: &Option<(Value, u32)>| match (found, orig_distance) {
            (Some((_, d)), Some(od)) => *d <= od,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let over = self.lookup_raw(&var.override_name(), target_type, target_name);
        if applies(&over) {
            return over.map(|(v, _)| v);
        }

        let prefix = self.lookup_raw(&var.prefix_name(), target_type, target_name);
        let suffix = self.lookup_raw(&var.suffix_name(), target_type, target_name);
        let has_prefix = applies(&prefix);
        let has_suffix = applies(&suffix);

        if !has_prefix && !has_suffix {
            return original.map(|(v, _)| v);
        }

        let mut names: Vec<Name> = Vec::new();
        if has_prefix {
            names.extend(prefix.unwrap().0.untypify());
        }
        if let Some((v, _)) = &original {
            names.extend(v.untypify());
        }
        if has_suffix {
            names.extend(suffix.unwrap().0.untypify());
        }

        match var.type_tag() {
            Some(tag) => Value::typify(&names, tag).ok().or(Some(Value::NameList(names))),
            None => Some(Value::NameList(names)),
        }
    }
}

fn matches_same_pattern(existing: &Pattern, raw: &str) -> bool {
    match existing {
        Pattern::Any => raw == "*",
        Pattern::Literal(l) => l == raw,
        Pattern::Regex(re) => re.as_str() == raw.strip_prefix('~').unwrap_or(raw),
    }
}

/// The directory-keyed scope map. Insertion is load-phase-only; the tree
/// mutex is held only for structural changes.
#[derive(Default)]
pub struct ScopeTree {
    scopes: Mutex<HashMap<Dir, Arc<Scope>>>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, dir: &Dir) -> Option<Arc<Scope>> {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner()).get(dir).cloned()
    }

    /// Find the innermost scope that is `dir` or an ancestor of it.
    pub fn find_nearest(&self, dir: &Dir) -> Option<Arc<Scope>> {
        let scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        let mut cur = Some(dir.clone());
        while let Some(d) = cur {
            if let Some(s) = scopes.get(&d) {
                return Some(s.clone());
            }
            cur = d.parent();
        }
        None
    }

    /// Insert (creating ancestor scopes as needed is the caller's
    /// responsibility -- in practice the load phase walks buildfiles
    /// top-down, so parents are always inserted first) the scope for `dir`,
    /// returning the existing one if already present.
    pub fn insert(&self, out_dir: Dir, src_dir: Dir) -> Arc<Scope> {
        let mut scopes = self.scopes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = scopes.get(&out_dir) {
            return existing.clone();
        }
        let parent = out_dir.parent().and_then(|mut p| loop {
            if let Some(s) = scopes.get(&p) {
                break Some(s.clone());
            }
            match p.parent() {
                Some(next) => p = next,
                None => break None,
            }
        });
        let scope = Arc::new(Scope::new(out_dir.clone(), src_dir, parent));
        scopes.insert(out_dir, scope.clone());
        scope
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::TypeTag;
    use crate::variable::{Visibility, VariablePool};

    #[test]
    fn lookup_walks_out_tree_parent_chain() {
        let tree = ScopeTree::new();
        let root = tree.insert(Dir::new("/p"), Dir::new("/p"));
        let child = tree.insert(Dir::new("/p/src"), Dir::new("/p/src"));
        assert!(Arc::ptr_eq(child.parent().unwrap(), &root));

        root.assign("cflags", Value::Strings(vec!["-O2".into()]));

        let pool = VariablePool::new();
        let var = pool.insert("cflags", Some(TypeTag::Strings), Visibility::Scope, true);

        assert_eq!(child.lookup(&var, None, None), Some(Value::Strings(vec!["-O2".into()])));
    }

    #[test]
    fn override_prepend_composes_at_the_declaring_scope_only() {
        let tree = ScopeTree::new();
        let s = tree.insert(Dir::new("/p"), Dir::new("/p"));
        let st = tree.insert(Dir::new("/p/t"), Dir::new("/p/t"));

        let pool = VariablePool::new();
        let var = pool.insert("cflags", Some(TypeTag::Strings), Visibility::Scope, true);

        s.assign("cflags", Value::Strings(vec!["-O2".into()]));
        st.assign(&var.prefix_name(), Value::Strings(vec!["-g".into()]));

        assert_eq!(
            st.lookup(&var, None, None),
            Some(Value::Strings(vec!["-g".into(), "-O2".into()]))
        );
        assert_eq!(s.lookup(&var, None, None), Some(Value::Strings(vec!["-O2".into()])));
    }

    #[test]
    fn target_type_pattern_specific_beats_plain_scope_var() {
        let tree = ScopeTree::new();
        let s = tree.insert(Dir::new("/p"), Dir::new("/p"));

        let pool = VariablePool::new();
        let var = pool.insert("warn", Some(TypeTag::Bool), Visibility::Scope, true);

        s.assign("warn", Value::Bool(false));
        s.assign_type_specific("obj", "*", "warn", Value::Bool(true));

        assert_eq!(s.lookup(&var, Some("obj"), Some("foo")), Some(Value::Bool(true)));
        assert_eq!(s.lookup(&var, Some("obj"), Some("foo")).unwrap(), Value::Bool(true));
        assert_eq!(s.lookup(&var, None, None), Some(Value::Bool(false)));
    }

    #[test]
    fn find_nearest_walks_up_missing_directories() {
        let tree = ScopeTree::new();
        let root = tree.insert(Dir::new("/p"), Dir::new("/p"));
        let found = tree.find_nearest(&Dir::new("/p/sub/deep"));
        assert!(Arc::ptr_eq(&found.unwrap(), &root));
    }
}
