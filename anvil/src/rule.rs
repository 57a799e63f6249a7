// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! Rules, recipes, and rule matching: actions select a rule by
//! meta-operation/operation/target-type, rules produce recipes, recipes run
//! and report whether the target changed.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use anvil_diag::BuildFailure;

use crate::target::Target;

/// `(meta-operation, operation)` pair driving rule selection and recipe
/// execution. `inner`, when set, is the operation this one falls back to
/// when no outer-only rule matches (e.g. `install`'s inner is `update`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub meta_operation: &'static str,
    pub operation: &'static str,
    pub inner: Option<&'static str>,
}

impl Action {
    pub const fn simple(meta_operation: &'static str, operation: &'static str) -> Self {
        Action {
            meta_operation,
            operation,
            inner: None,
        }
    }

    pub const fn outer(meta_operation: &'static str, operation: &'static str, inner: &'static str) -> Self {
        Action {
            meta_operation,
            operation,
            inner: Some(inner),
        }
    }

    pub fn is_outer(&self) -> bool {
        self.inner.is_some()
    }

    /// The inner action, reusing this action's meta-operation. Used when an
    /// outer action (e.g. `install`) has no matching rule of its own and
    /// falls back to its inner operation (e.g. `update`).
    pub fn inner_action(&self) -> Option<Action> {
        self.inner.map(|op| Action::simple(self.meta_operation, op))
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.operation, self.meta_operation)
    }
}

/// Outcome of running a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Unchanged,
    Changed,
    Failed,
    Postponed,
}

/// The callable a rule's `apply` produces.
pub type Recipe = Arc<dyn Fn(&Action, &Arc<Target>) -> Result<TargetState, BuildFailure> + Send + Sync>;

/// Mutable scratch space threaded from `match` to `apply`, carrying e.g.
/// regex backreferences captured while testing a target-type pattern.
#[derive(Debug, Default, Clone)]
pub struct MatchExtra {
    pub captures: HashMap<String, String>,
}

/// A polymorphic match/apply/recipe object.
pub trait Rule: Send + Sync {
    fn match_rule(&self, action: &Action, target: &Arc<Target>, hint: Option<&str>, extra: &mut MatchExtra) -> bool;
    fn apply(&self, action: &Action, target: &Arc<Target>, extra: &MatchExtra) -> Result<Recipe, BuildFailure>;
}

pub type RuleHandle = Arc<dyn Rule>;

/// Collapses hint handling for the common case where a rule doesn't care
/// about hints beyond the default prefix-class restriction already applied
/// during lookup.
pub struct SimpleRule<M, A> {
    matcher: M,
    applier: A,
}

impl<M, A> SimpleRule<M, A>
where
    M: Fn(&Action, &Arc<Target>) -> bool + Send + Sync,
    A: Fn(&Action, &Arc<Target>) -> Result<Recipe, BuildFailure> + Send + Sync,
{
    pub fn new(matcher: M, applier: A) -> Self {
        SimpleRule { matcher, applier }
    }
}

impl<M, A> Rule for SimpleRule<M, A>
where
    M: Fn(&Action, &Arc<Target>) -> bool + Send + Sync,
    A: Fn(&Action, &Arc<Target>) -> Result<Recipe, BuildFailure> + Send + Sync,
{
    fn match_rule(&self, action: &Action, target: &Arc<Target>, _hint: Option<&str>, _extra: &mut MatchExtra) -> bool {
        (self.matcher)(action, target)
    }

    fn apply(&self, action: &Action, target: &Arc<Target>, _extra: &MatchExtra) -> Result<Recipe, BuildFailure> {
        (self.applier)(action, target)
    }
}

/// Per-scope rule registry: per `(meta-operation, operation, target-type)`,
/// an ordered map by registration name, since the name's `.`-separated
/// prefix doubles as a hint a caller can narrow matching with.
#[derive(Default)]
pub struct RuleRegistry {
    rules: HashMap<(String, String, String), IndexMap<String, RuleHandle>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `rule` under `name` for `(meta_op, op)` on `target_type`
    /// (spec §4.3: `scope.insert_rule<TargetType>(meta-op-id, op-id, name,
    /// rule&)` -- target-type is an explicit axis of registration, not
    /// inferred from the rule's own name; a rule named `cxx.compile` might
    /// match `obj{}` targets, not `cxx{}` ones).
    pub fn insert(&mut self, meta_op: &str, op: &str, target_type: &str, name: &str, rule: RuleHandle) {
        self.rules
            .entry((meta_op.to_owned(), op.to_owned(), target_type.to_owned()))
            .or_default()
            .insert(name.to_owned(), rule);
    }

    fn candidates(&self, meta_op: &str, op: &str, target_type: &str) -> Option<&IndexMap<String, RuleHandle>> {
        self.rules.get(&(meta_op.to_owned(), op.to_owned(), target_type.to_owned()))
    }
}

/// Hint `h` is a prefix with word boundaries on `.`; rule name `n` is a
/// candidate iff `n == h` or `n` starts with `h.`.
fn hint_matches(hint: &str, name: &str) -> bool {
    name == hint || name.strip_prefix(hint).is_some_and(|rest| rest.starts_with('.'))
}

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("no rule to {action} {target}")]
    NoMatch { action: Action, target: String },
    #[error("ambiguous rule match for {action} {target}: candidates {candidates:?}")]
    Ambiguous {
        action: Action,
        target: String,
        candidates: Vec<String>,
    },
}

/// Resolve the rule (and its match-extra) for `(action, target)` against
/// the rules registered on `target_type_name` in `registry`.
///
/// `registry` is expected to be the rule set visible at the target's
/// declaring scope (the caller has already walked the scope's out-tree, as
/// scope lookup does for variables -- rule registries are consulted the
/// same way, innermost first, with the first scope that has *any*
/// candidates winning, matching libbuild2's behavior of resolving rules
/// from the target's own scope rather than merging across the chain).
pub fn match_rule(
    registries: &[&RuleRegistry],
    action: Action,
    target: &Arc<Target>,
    target_type_name: &str,
    hint: Option<&str>,
) -> Result<(RuleHandle, MatchExtra), MatchError> {
    let ops_to_try: Vec<&'static str> = if action.is_outer() {
        vec![action.operation, action.inner.unwrap()]
    } else {
        vec![action.operation]
    };

    for op in ops_to_try {
        for registry in registries {
            let Some(candidates) = registry.candidates(action.meta_operation, op, target_type_name) else {
                continue;
            };

            let pool: Vec<(&String, &RuleHandle)> = match hint {
                Some(h) => candidates.iter().filter(|(name, _)| hint_matches(h, name)).collect(),
                None => candidates.iter().collect(),
            };

            if pool.is_empty() {
                continue;
            }

            let mut matched: Vec<(&String, RuleHandle, MatchExtra)> = Vec::new();
            for (name, rule) in pool {
                let mut extra = MatchExtra::default();
                if rule.match_rule(&action, target, hint, &mut extra) {
                    matched.push((name, rule.clone(), extra));
                }
            }

            match matched.len() {
                0 => continue,
                1 => {
                    let (_, rule, extra) = matched.into_iter().next().unwrap();
                    return Ok((rule, extra));
                }
                _ => {
                    return Err(MatchError::Ambiguous {
                        action,
                        target: target.to_string(),
                        candidates: matched.into_iter().map(|(n, _, _)| n.clone()).collect(),
                    });
                }
            }
        }
    }

    Err(MatchError::NoMatch {
        action,
        target: target.to_string(),
    })
}

/// The fallback rule for any existing `file`-class target with no other
/// rule applying.
pub fn file_rule() -> RuleHandle {
    Arc::new(SimpleRule::new(
        |action, target| {
            target.derive_path();
            if !target.exists() {
                return false;
            }
            if action.operation == "clean" {
                // `clean` only matches non-real (generated) targets; it
                // never cleans a physically-present source file.
                return !target.prerequisites.lock().unwrap_or_else(|e| e.into_inner()).is_empty();
            }
            true
        },
        |_action, target| {
            // With no prerequisites this is a pure source file: the noop
            // recipe. Otherwise the default recipe just executes
            // prerequisites and reports their aggregate outcome.
            if target.prerequisites.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
                let recipe: Recipe = Arc::new(|_action, _target| Ok(TargetState::Unchanged));
                Ok(recipe)
            } else {
                let recipe: Recipe = Arc::new(|action, target| {
                    crate::engine::execute_prerequisites(action, target)
                });
                Ok(recipe)
            }
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::path::Dir;
    use crate::target::{ExtensionDiscipline, TargetType, TargetTypeFlags};

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

    fn new_target() -> Arc<Target> {
        let map = crate::target::TargetMap::new();
        map.insert(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "a".into(), None).0
    }

    #[test]
    fn hint_requires_word_boundary() {
        assert!(hint_matches("bin", "bin"));
        assert!(hint_matches("bin", "bin.link"));
        assert!(!hint_matches("bin", "binary"));
    }

    #[test]
    fn single_match_wins() {
        let mut registry = RuleRegistry::new();
        registry.insert(
            "perform",
            "update",
            "file",
            "cxx.compile",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        let target = new_target();
        let action = Action::simple("perform", "update");
        let result = match_rule(&[&registry], action, &target, "file", None);
        assert!(result.is_ok());
    }

    #[test]
    fn two_matches_are_ambiguous() {
        let mut registry = RuleRegistry::new();
        registry.insert(
            "perform",
            "update",
            "file",
            "cxx.compile",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        registry.insert(
            "perform",
            "update",
            "file",
            "cc.compile",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        let target = new_target();
        let action = Action::simple("perform", "update");
        let err = match_rule(&[&registry], action, &target, "file", None).unwrap_err();
        assert!(matches!(err, MatchError::Ambiguous { .. }));
    }

    #[test]
    fn hint_restricts_candidate_pool() {
        let mut registry = RuleRegistry::new();
        registry.insert(
            "perform",
            "update",
            "file",
            "cxx.compile",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        registry.insert(
            "perform",
            "update",
            "file",
            "cc.compile",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        let target = new_target();
        let action = Action::simple("perform", "update");
        let result = match_rule(&[&registry], action, &target, "file", Some("cxx"));
        assert!(result.is_ok());
    }

    #[test]
    fn outer_action_falls_back_to_inner() {
        let mut registry = RuleRegistry::new();
        registry.insert(
            "perform",
            "update",
            "file",
            "in.rule",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        let target = new_target();
        let action = Action::outer("perform", "install", "update");
        let result = match_rule(&[&registry], action, &target, "file", None);
        assert!(result.is_ok());
    }

    #[test]
    fn registration_keyed_by_target_type_not_by_rule_name() {
        // A rule named "cxx.compile" must be found when looked up under the
        // target type it was registered against, even though the name's
        // own prefix ("cxx") differs from that type ("obj").
        let mut registry = RuleRegistry::new();
        registry.insert(
            "perform",
            "update",
            "obj",
            "cxx.compile",
            Arc::new(SimpleRule::new(|_, _| true, |_, _| Ok(Arc::new(|_, _| Ok(TargetState::Unchanged))))),
        );
        let target = new_target();
        let action = Action::simple("perform", "update");
        assert!(match_rule(&[&registry], action, &target, "obj", None).is_ok());
        assert!(matches!(
            match_rule(&[&registry], action, &target, "file", None).unwrap_err(),
            MatchError::NoMatch { .. }
        ));
    }

    #[test]
    fn no_candidates_is_nomatch() {
        let registry = RuleRegistry::new();
        let target = new_target();
        let action = Action::simple("perform", "update");
        let err = match_rule(&[&registry], action, &target, "file", None).unwrap_err();
        assert!(matches!(err, MatchError::NoMatch { .. }));
    }
}
