// SPDX-FileCopyrightText: Copyright © 2020-2025 The Anvil Authors
//
// SPDX-License-Identifier: MPL-2.0

//! The `perform` meta-operation driver: load the declared graph, resolve
//! requested target keys to targets (search), match rules to recipes (match
//! phase), then run the recipes (execute phase).
//!
//! [`Statement`] stands in for the external buildfile parser's output (spec
//! §1 Out of scope, §6.1): this crate consumes it but does not produce it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anvil_diag::BuildFailure;

use crate::context::Context;
use crate::name::Name;
use crate::path::Dir;
use crate::rule::{self, Action, MatchError, TargetState};
use crate::scope::Scope;
use crate::target::{offset, Include, OpState, Prerequisite, PrerequisiteTarget, Target};
use crate::value::Value;
use crate::variable::Variable;

/// How a buildfile variable assignment composes with any existing value at
/// that scope (`=`, `+=`, `=+`). This acts directly on the plain scope value
/// at the point of assignment; it is unrelated to the
/// `.__override`/`.__prefix`/`.__suffix` lookup-time override chain, which
/// instead models externally supplied overrides (e.g. from a `configure`
/// invocation) that take effect at read time regardless of how the original
/// was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Append,
    Prepend,
}

/// External parser output the load phase consumes.
#[derive(Debug, Clone)]
pub enum Statement {
    Assign {
        name: String,
        op: AssignOp,
        value: Value,
        /// `Some((target_type, pattern))` for a target-type/pattern-specific
        /// block, `None` for a plain scope assignment.
        type_specific: Option<(String, String)>,
    },
    Dependency {
        targets: Vec<Name>,
        prereqs: Vec<Name>,
        scoped_vars: HashMap<String, Value>,
    },
    ScopeBlock {
        dir: Dir,
        body: Vec<Statement>,
    },
    Use {
        name: String,
        version: Option<String>,
    },
}

/// A target reference as it would come off the command line: an untyped
/// name plus the type inferred or declared for it.
#[derive(Debug, Clone)]
pub struct TargetRef {
    pub target_type: String,
    pub dir: Dir,
    pub out: Dir,
    pub name: String,
    pub extension: Option<String>,
}

/// Compose an `+=`/`=+` assignment against whatever is already directly
/// assigned at `name` on `scope` (no parent walk, no overrides -- see
/// [`Scope::plain`]).
fn compose_assign(scope: &Scope, name: &str, op: AssignOp, value: Value) -> Value {
    let current = scope.plain(name);
    match (op, current) {
        (AssignOp::Set, _) | (_, None) => value,
        (AssignOp::Append, Some(cur)) => append_names(cur, value),
        (AssignOp::Prepend, Some(cur)) => append_names(value, cur),
    }
}

fn append_names(first: Value, second: Value) -> Value {
    let tag = first.type_tag().or_else(|| second.type_tag());
    let mut names = first.untypify();
    names.extend(second.untypify());
    match tag {
        Some(tag) => Value::typify(&names, tag).unwrap_or(Value::NameList(names)),
        None => Value::NameList(names),
    }
}

/// Load declared statements into the scope tree and target graph. Must be
/// called while the context holds the load (exclusive) phase lock.
pub fn load_statements(ctx: &Context, scope: &Arc<Scope>, statements: &[Statement]) -> Result<(), BuildFailure> {
    for statement in statements {
        match statement {
            Statement::Assign {
                name,
                op,
                value,
                type_specific,
            } => match type_specific {
                Some((tt, pattern)) => {
                    let composed = compose_assign(scope, name, *op, value.clone());
                    scope.assign_type_specific(tt, pattern, name, composed);
                }
                None => {
                    let composed = compose_assign(scope, name, *op, value.clone());
                    scope.assign(name, composed);
                }
            },
            Statement::Dependency {
                targets,
                prereqs,
                scoped_vars,
            } => {
                for t in targets {
                    let target_type = t.typ.clone().unwrap_or_else(|| "file".to_owned());
                    let Some(tt) = ctx.target_types.find(&target_type) else {
                        return Err(anvil_diag::fail(format!("unknown target type {target_type}")));
                    };
                    let (target, _) = ctx.targets.insert(tt, t.dir.clone(), scope.out_path.clone(), t.value.clone(), None);

                    for p in prereqs {
                        let prereq_type = p.typ.clone().unwrap_or_else(|| "file".to_owned());
                        let prereq = Prerequisite::new(prereq_type, p.dir.clone(), scope.out_path.clone(), p.value.clone());
                        target.prerequisites.lock().unwrap_or_else(|e| e.into_inner()).push(prereq);
                    }

                    if !scoped_vars.is_empty() {
                        let ambient = target.op_state("*", "*");
                        let mut vars = ambient.vars.lock().unwrap_or_else(|e| e.into_inner());
                        for (k, v) in scoped_vars {
                            vars.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            Statement::ScopeBlock { dir, body } => {
                let sub = ctx.scopes.insert(dir.clone(), dir.clone());
                load_statements(ctx, &sub, body)?;
            }
            Statement::Use { name, version } => {
                if !scope.mark_module_loaded(name) {
                    continue;
                }
                anvil_diag::trace(3, format!("using {name}{}", version.as_deref().map(|v| format!("@{v}")).unwrap_or_default()));
            }
        }
    }
    Ok(())
}

/// Resolve a variable for a target. Target-visibility lookups check the
/// per-target (ambient and per-action) variable maps before falling back to
/// the scope's own lookup/override chain.
pub fn lookup_variable(ctx: &Context, target: &Arc<Target>, action: Action, var: &Variable) -> Option<Value> {
    let ambient = target.op_state("*", "*");
    if let Some(v) = ambient.vars.lock().unwrap_or_else(|e| e.into_inner()).get(var.name()) {
        return Some(v.clone());
    }
    let op_state = target.op_state(action.meta_operation, action.operation);
    if let Some(v) = op_state.vars.lock().unwrap_or_else(|e| e.into_inner()).get(var.name()) {
        return Some(v.clone());
    }
    let scope = ctx.scopes.find_nearest(&target.dir)?;
    scope.lookup(var, Some(target.target_type.name), Some(&target.name))
}

/// Resolve a [`TargetRef`] to an interned target.
pub fn search(ctx: &Context, target_ref: &TargetRef) -> Result<Arc<Target>, BuildFailure> {
    let tt = ctx
        .target_types
        .find(&target_ref.target_type)
        .ok_or_else(|| anvil_diag::fail(format!("unknown target type {}", target_ref.target_type)))?;
    let (target, _) = ctx.targets.insert(
        tt,
        target_ref.dir.clone(),
        target_ref.out.clone(),
        target_ref.name.clone(),
        target_ref.extension.clone(),
    );
    Ok(target)
}

/// Match phase for a single target: resolves its recipe via [`rule::match_rule`]
/// (falling back to [`rule::file_rule`]) or its ad hoc recipe, and
/// recursively matches its prerequisites.
///
/// Concurrent callers for the same `(target, action)` converge on the same
/// underlying scheduler task-count: the thread that wins the `UNTOUCHED ->
/// TOUCHED` race spawns the matching work, every caller (winner included)
/// waits on it, and `wait` only returns once that work's `spawn` wrapper has
/// decremented the count back to zero -- so there is no window where a
/// waiter observes "not yet matched" after its `wait` call returns.
pub fn match_target(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<(), BuildFailure> {
    loop {
        let state = target.op_state(action.meta_operation, action.operation);

        if state.at_least(offset::MATCHED) {
            return Ok(());
        }

        if !state.advance(offset::UNTOUCHED, offset::TOUCHED) {
            if state.at_least(offset::MATCHED) {
                return Ok(());
            }
            ctx.scheduler
                .wait(0, &state.wait_counter)
                .map_err(|_| anvil_diag::fail(format!("match cancelled for {target}")))?;
            continue;
        }

        let counter = state.wait_counter.clone();
        let ctx2 = ctx.clone();
        let target2 = target.clone();
        let state2 = state.clone();

        ctx.scheduler.spawn(&counter, move || {
            if do_match(&ctx2, action, &target2, &state2).is_err() {
                state2.offset.store(offset::TOUCHED, Ordering::Release);
            }
        });

        ctx.scheduler
            .wait(0, &counter)
            .map_err(|_| anvil_diag::fail(format!("match cancelled for {target}")))?;

        if !state.at_least(offset::MATCHED) {
            return Err(anvil_diag::fail(format!("no rule to {action} {target}")));
        }
        return Ok(());
    }
}

fn do_match(ctx: &Arc<Context>, action: Action, target: &Arc<Target>, state: &Arc<OpState>) -> Result<(), BuildFailure> {
    let adhoc = target.adhoc_recipe.lock().unwrap_or_else(|e| e.into_inner()).clone();

    let recipe = if let Some(adhoc) = adhoc {
        adhoc
    } else {
        let scope = ctx
            .scopes
            .find_nearest(&target.dir)
            .ok_or_else(|| anvil_diag::fail(format!("no scope for {}", target.dir)))?;
        let registry_guard = scope.rules();
        let registries: [&rule::RuleRegistry; 1] = [&registry_guard];
        let matched = rule::match_rule(&registries, action, target, target.target_type.name, None);
        drop(registry_guard);

        match matched {
            Ok((matched_rule, extra)) => matched_rule.apply(&action, target, &extra)?,
            Err(MatchError::NoMatch { .. }) => {
                let file_rule = rule::file_rule();
                let mut extra = rule::MatchExtra::default();
                if file_rule.match_rule(&action, target, None, &mut extra) {
                    file_rule.apply(&action, target, &extra)?
                } else {
                    return Err(anvil_diag::fail(format!("no rule to {action} {target}")));
                }
            }
            Err(e) => return Err(anvil_diag::fail(e.to_string())),
        }
    };

    *state.recipe.lock().unwrap_or_else(|e| e.into_inner()) = Some(recipe);

    let resolved: Vec<Arc<Target>> = {
        let prereqs = target.prerequisites.lock().unwrap_or_else(|e| e.into_inner());
        prereqs.iter().filter_map(|p| p.resolve(&ctx.targets, &ctx.target_types)).collect()
    };
    for prereq_target in &resolved {
        match_target(ctx, action, prereq_target)?;
    }
    state
        .prerequisite_targets
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .extend(resolved.into_iter().map(|target| PrerequisiteTarget {
            target,
            include: Include::Normal,
        }));

    state.offset.store(offset::MATCHED, Ordering::Release);
    Ok(())
}

/// Execute phase for a single target: run prerequisites first (recursively),
/// then this target's own recipe. Matches first if not already matched.
pub fn execute_target(ctx: &Arc<Context>, action: Action, target: &Arc<Target>) -> Result<TargetState, BuildFailure> {
    loop {
        let state = target.op_state(action.meta_operation, action.operation);

        if state.current() < offset::MATCHED {
            match_target(ctx, action, target)?;
            continue;
        }

        if state.at_least(offset::EXECUTED) {
            let result = *state.result.lock().unwrap_or_else(|e| e.into_inner());
            return Ok(result.unwrap_or(TargetState::Unchanged));
        }

        if !state.advance(offset::MATCHED, offset::BUSY) {
            ctx.scheduler
                .wait(0, &state.wait_counter)
                .map_err(|_| anvil_diag::fail(format!("execute cancelled for {target}")))?;
            continue;
        }

        let counter = state.wait_counter.clone();
        let ctx2 = ctx.clone();
        let target2 = target.clone();
        let state2 = state.clone();

        ctx.scheduler.spawn(&counter, move || {
            if do_execute(&ctx2, action, &target2, &state2).is_err() {
                // Leave the target matched-but-not-executed so the next
                // waiter's `at_least(EXECUTED)` check below reports failure
                // rather than silently treating it as unchanged.
                state2.offset.store(offset::MATCHED, Ordering::Release);
            }
        });

        ctx.scheduler
            .wait(0, &counter)
            .map_err(|_| anvil_diag::fail(format!("execute cancelled for {target}")))?;

        if !state.at_least(offset::EXECUTED) {
            return Err(anvil_diag::fail(format!("failed to {action} {target}")));
        }
        let result = *state.result.lock().unwrap_or_else(|e| e.into_inner());
        return Ok(result.unwrap_or(TargetState::Unchanged));
    }
}

fn do_execute(ctx: &Arc<Context>, action: Action, target: &Arc<Target>, state: &Arc<OpState>) -> Result<(), BuildFailure> {
    let prereqs = state.prerequisite_targets.lock().unwrap_or_else(|e| e.into_inner()).clone();

    let mut aggregate = TargetState::Unchanged;
    for prereq in &prereqs {
        if prereq.include == Include::Excluded {
            continue;
        }
        if execute_target(ctx, action, &prereq.target)? == TargetState::Changed {
            aggregate = TargetState::Changed;
        }
    }

    let recipe = state.recipe.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let outcome = match recipe {
        Some(recipe) => recipe(&action, target)?,
        None => aggregate,
    };

    // Spec §4.5: a recipe that tracks its inputs through a depdb must close
    // it *before* touching the target file, so that mtime(depdb) <=
    // mtime(target) holds in success. The engine checks this explicitly
    // after the recipe returns rather than trusting it was done right.
    check_depdb_mtime(target)?;

    *state.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
    state.offset.store(offset::EXECUTED, Ordering::Release);
    Ok(())
}

/// Depdb files colocate with their target at `<path>.d` (spec §6.3's
/// `foo.o.d` example). Most recipes -- the file fallback, the
/// aggregate-of-prerequisites recipe -- never create one, so this is a
/// cheap no-op for them; it only does real work for recipes that opted into
/// depdb-based change tracking.
fn check_depdb_mtime(target: &Arc<Target>) -> Result<(), BuildFailure> {
    let Some(path) = target.path() else {
        return Ok(());
    };
    let depdb_path = PathBuf::from(format!("{path}.d"));
    if !depdb_path.exists() {
        return Ok(());
    }
    anvil_depdb::Depdb::check_mtime(&depdb_path, path.as_std()).map_err(|e| anvil_diag::fail(e.to_string()))
}

/// Runs every already-resolved prerequisite of `target` under `action` and
/// reports whether any of them exist as a built path -- the default recipe
/// [`rule::file_rule`]'s fallback uses for non-leaf file targets (spec
/// §4.4). Prerequisites were already recursively executed by [`do_execute`]
/// before a recipe ever runs, so this just aggregates their outcome from
/// disk state; it does not recurse itself, since a bare `Recipe` closure has
/// no `Context` handle to drive further scheduling.
pub fn execute_prerequisites(_action: &Action, target: &Arc<Target>) -> Result<TargetState, BuildFailure> {
    let prereqs = target.prerequisites.lock().unwrap_or_else(|e| e.into_inner());
    let mut changed = false;
    for prereq in prereqs.iter() {
        if let Some(cached) = prereq.cached_target() {
            if cached.path().map(|p| p.as_std().exists()).unwrap_or(false) {
                changed = true;
            }
        }
    }
    Ok(if changed { TargetState::Changed } else { TargetState::Unchanged })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;
    use crate::scope::ScopeTree;
    use crate::target::{ExtensionDiscipline, TargetType, TargetTypeFlags};
    use std::sync::Arc as StdArc;

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
    fn search_interns_and_returns_same_target() {
        let ctx = Context::new(2, 2, Dir::new("/p"));
        ctx.target_types.register(&FILE_TT);
        let target_ref = TargetRef {
            target_type: "file".into(),
            dir: Dir::new("/p"),
            out: Dir::new("/p"),
            name: "a".into(),
            extension: None,
        };
        let a = search(&ctx, &target_ref).unwrap();
        let b = search(&ctx, &target_ref).unwrap();
        assert!(StdArc::ptr_eq(&a, &b));
        ctx.shutdown();
    }

    #[test]
    fn match_with_no_rule_and_no_file_fails() {
        let ctx = Context::new(2, 2, Dir::new("/p"));
        ctx.target_types.register(&FILE_TT);
        ctx.scopes.insert(Dir::new("/p"), Dir::new("/p"));
        let target_ref = TargetRef {
            target_type: "file".into(),
            dir: Dir::new("/p"),
            out: Dir::new("/p"),
            name: "nonexistent-xyz".into(),
            extension: None,
        };
        let target = search(&ctx, &target_ref).unwrap();
        let action = Action::simple("perform", "update");
        let result = match_target(&ctx, action, &target);
        assert!(result.is_err());
        ctx.shutdown();
    }

    #[test]
    fn compose_assign_prepends_and_appends() {
        let tree = ScopeTree::new();
        let scope = tree.insert(Dir::new("/p"), Dir::new("/p"));
        scope.assign("cflags", Value::Strings(vec!["-O2".into()]));

        let composed = compose_assign(&scope, "cflags", AssignOp::Prepend, Value::Strings(vec!["-g".into()]));
        assert_eq!(composed, Value::Strings(vec!["-g".into(), "-O2".into()]));
    }

    #[test]
    fn dependency_statement_wires_prerequisites() {
        let ctx = Context::new(2, 2, Dir::new("/p"));
        ctx.target_types.register(&FILE_TT);
        let scope = ctx.scopes.insert(Dir::new("/p"), Dir::new("/p"));

        let statements = vec![Statement::Dependency {
            targets: vec![Name::qualified("file", Dir::new("/p"), "out")],
            prereqs: vec![Name::qualified("file", Dir::new("/p"), "in")],
            scoped_vars: HashMap::new(),
        }];

        load_statements(&ctx, &scope, &statements).unwrap();

        let (target, inserted) = ctx.targets.insert(&FILE_TT, Dir::new("/p"), Dir::new("/p"), "out".into(), None);
        assert!(!inserted);
        assert_eq!(target.prerequisites.lock().unwrap().len(), 1);
        ctx.shutdown();
    }

    /// Recipe that tracks a single synthetic input through a real
    /// `anvil_depdb::Depdb`, following spec §4.5's ordering: the depdb is
    /// opened, read/expected, and closed *before* the target file is
    /// touched, so `mtime(depdb) <= mtime(target)` holds on success.
    fn depdb_tracked_recipe() -> rule::Recipe {
        Arc::new(|_action, target| {
            let path = target.derive_path();
            let depdb_path = format!("{path}.d");

            let mut dd = anvil_depdb::Depdb::open(&depdb_path, false).map_err(|e| anvil_diag::fail(e.to_string()))?;
            dd.expect("demo.compile 1").map_err(|e| anvil_diag::fail(e.to_string()))?;
            let changed = dd.writing();
            dd.close(changed).map_err(|e| anvil_diag::fail(e.to_string()))?;

            if changed {
                std::thread::sleep(std::time::Duration::from_millis(15));
                std::fs::write(path.as_std(), b"built").map_err(|e| anvil_diag::fail(e.to_string()))?;
            }

            Ok(if changed { TargetState::Changed } else { TargetState::Unchanged })
        })
    }

    #[test]
    fn depdb_tracked_recipe_rebuilds_once_then_reports_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let work = Dir::new(dir.path());

        let ctx = Context::new(2, 2, work.clone());
        ctx.target_types.register(&FILE_TT);
        let scope = ctx.scopes.insert(work.clone(), work.clone());
        scope.insert_rule(
            "perform",
            "update",
            "file",
            "demo.compile",
            Arc::new(rule::SimpleRule::new(|_action, _target| true, |_action, _target| Ok(depdb_tracked_recipe()))),
        );

        let target_ref = TargetRef {
            target_type: "file".into(),
            dir: work.clone(),
            out: work.clone(),
            name: "out".into(),
            extension: None,
        };

        let target = search(&ctx, &target_ref).unwrap();
        let action = Action::simple("perform", "update");
        let first = execute_target(&ctx, action, &target).unwrap();
        assert_eq!(first, TargetState::Changed);
        ctx.shutdown();

        // Fresh context, same on-disk depdb/target: re-running the same
        // recipe should see its expectation already satisfied and report no
        // change, demonstrating the depdb round trip rather than just its
        // first write.
        let ctx2 = Context::new(2, 2, work.clone());
        ctx2.target_types.register(&FILE_TT);
        let scope2 = ctx2.scopes.insert(work.clone(), work.clone());
        scope2.insert_rule(
            "perform",
            "update",
            "file",
            "demo.compile",
            Arc::new(rule::SimpleRule::new(|_action, _target| true, |_action, _target| Ok(depdb_tracked_recipe()))),
        );
        let target2 = search(&ctx2, &target_ref).unwrap();
        let second = execute_target(&ctx2, action, &target2).unwrap();
        assert_eq!(second, TargetState::Unchanged);
        ctx2.shutdown();
    }

    #[test]
    fn backwards_depdb_mtime_is_caught_by_the_engine() {
        let dir = tempfile::tempdir().unwrap();
        let work = Dir::new(dir.path());

        let ctx = Context::new(2, 2, work.clone());
        ctx.target_types.register(&FILE_TT);
        let scope = ctx.scopes.insert(work.clone(), work.clone());

        // Deliberately wrong order: writes the target file first, then
        // closes the depdb afterwards, so the depdb ends up newer than the
        // target it is supposed to describe.
        let broken_recipe: rule::Recipe = Arc::new(|_action, target| {
            let path = target.derive_path();
            std::fs::write(path.as_std(), b"built").map_err(|e| anvil_diag::fail(e.to_string()))?;
            std::thread::sleep(std::time::Duration::from_millis(15));

            let depdb_path = format!("{path}.d");
            let mut dd = anvil_depdb::Depdb::open(&depdb_path, false).map_err(|e| anvil_diag::fail(e.to_string()))?;
            dd.expect("broken.compile 1").map_err(|e| anvil_diag::fail(e.to_string()))?;
            dd.close(true).map_err(|e| anvil_diag::fail(e.to_string()))?;

            Ok(TargetState::Changed)
        });

        scope.insert_rule(
            "perform",
            "update",
            "file",
            "broken.compile",
            Arc::new(rule::SimpleRule::new(|_action, _target| true, move |_action, _target| Ok(broken_recipe.clone()))),
        );

        let target_ref = TargetRef {
            target_type: "file".into(),
            dir: work.clone(),
            out: work.clone(),
            name: "out".into(),
            extension: None,
        };
        let target = search(&ctx, &target_ref).unwrap();
        let action = Action::simple("perform", "update");
        let result = execute_target(&ctx, action, &target);
        assert!(result.is_err());
        ctx.shutdown();
    }
}
