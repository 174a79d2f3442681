//! Fixed table of cross-module update triggers and the bounded walk over it.

use std::collections::HashSet;

use serde::Serialize;

use super::{descriptor::descriptor, view::EngineContext};
use crate::patch::{self, PatchOutcome};

/// `(trigger, dependents)` pairs. New modules extend this by hand.
pub type CascadeTable = &'static [(&'static str, &'static [&'static str])];

pub const CASCADE: CascadeTable = &[
    ("apache", &["php"]),
    ("php", &["apache", "phpmyadmin"]),
    ("mysql", &["phpmyadmin", "adminer", "php"]),
    ("mariadb", &["phpmyadmin", "adminer"]),
    ("postgresql", &["phppgadmin", "adminer"]),
];

pub const MAX_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Patched { changed: usize },
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeStep {
    pub module: String,
    pub trigger: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CascadeReport {
    pub steps: Vec<CascadeStep>,
}

impl CascadeReport {
    pub fn visited(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|step| step.module.as_str())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CascadeStep> {
        self.steps
            .iter()
            .filter(|step| matches!(step.outcome, StepOutcome::Failed { .. }))
    }
}

pub fn dependents(table: CascadeTable, id: &str) -> &'static [&'static str] {
    table
        .iter()
        .find(|(trigger, _)| *trigger == id)
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

/// Re-render the config of every module reachable from `origin`.
pub fn run(origin: &str, ctx: &EngineContext) -> CascadeReport {
    walk(origin, CASCADE, |target| patch_target(target, ctx))
}

/// Visit each module reachable from `origin` at most once, to at most
/// [`MAX_DEPTH`] edges away. Only patched targets propagate further.
pub fn walk<F>(origin: &str, table: CascadeTable, mut step: F) -> CascadeReport
where
    F: FnMut(&str) -> StepOutcome,
{
    let mut visited = HashSet::from([origin.to_string()]);
    let mut report = CascadeReport::default();
    expand(origin, table, 1, &mut visited, &mut step, &mut report);
    report
}

fn expand<F>(
    trigger: &str,
    table: CascadeTable,
    depth: usize,
    visited: &mut HashSet<String>,
    step: &mut F,
    report: &mut CascadeReport,
) where
    F: FnMut(&str) -> StepOutcome,
{
    if depth > MAX_DEPTH {
        tracing::warn!(module = trigger, "cascade depth limit reached");
        return;
    }
    for target in dependents(table, trigger) {
        if !visited.insert(target.to_string()) {
            continue;
        }
        let outcome = step(target);
        tracing::debug!(module = target, trigger, ?outcome, "cascade step");
        let propagate = matches!(outcome, StepOutcome::Patched { .. });
        report.steps.push(CascadeStep {
            module: target.to_string(),
            trigger: trigger.to_string(),
            outcome,
        });
        if propagate {
            expand(target, table, depth + 1, visited, step, report);
        }
    }
}

fn patch_target(target: &str, ctx: &EngineContext) -> StepOutcome {
    let Some(descriptor) = descriptor(target) else {
        return StepOutcome::Skipped {
            reason: "unknown module".to_string(),
        };
    };
    let view = match ctx.view(target) {
        Ok(view) => view,
        Err(error) => {
            return StepOutcome::Failed {
                error: error.to_string(),
            };
        }
    };
    if !view.enabled {
        return StepOutcome::Skipped {
            reason: "disabled".to_string(),
        };
    }
    if let Err(error) = view.validate() {
        return StepOutcome::Skipped {
            reason: error.to_string(),
        };
    }
    if let Err(error) = descriptor.check_compatibility(&view, ctx) {
        tracing::warn!(module = target, %error, "dependency no longer compatible");
    }

    let applied = descriptor
        .config_patches(&view, ctx)
        .and_then(|plan| Ok(patch::apply_all(&plan)?));
    match applied {
        Ok(outcomes) => StepOutcome::Patched {
            changed: outcomes
                .iter()
                .filter(|(_, outcome)| *outcome == PatchOutcome::Changed)
                .count(),
        },
        Err(error) => StepOutcome::Failed {
            error: error.to_string(),
        },
    }
}
