//! The fixed per-operation pipeline.

use std::fmt;

use serde::Serialize;

/// Number of phases every operation passes through.
pub const PHASE_COUNT: usize = 6;

/// One stage of the per-operation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Resolve the route, load the current row, evaluate access rules.
    Authorize,
    /// Validate the body and compute the pending mutation or read result.
    Build,
    /// Run resource before-hooks on the pending mutation.
    BeforeHooks,
    /// Execute mutations (grouped by the batch engine).
    Persist,
    /// Run resource after-hooks.
    AfterHooks,
    /// Shape the response body.
    Transform,
}

impl Phase {
    pub const ALL: [Phase; PHASE_COUNT] = [
        Phase::Authorize,
        Phase::Build,
        Phase::BeforeHooks,
        Phase::Persist,
        Phase::AfterHooks,
        Phase::Transform,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<Phase> {
        Phase::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Authorize => "authorize",
            Phase::Build => "build",
            Phase::BeforeHooks => "before_hooks",
            Phase::Persist => "persist",
            Phase::AfterHooks => "after_hooks",
            Phase::Transform => "transform",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
