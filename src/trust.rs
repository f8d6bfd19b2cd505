//! Trust resolution.
//!
//! The effective trust of a turn is the first value present, in order:
//! per-turn override, the level stored on the session, the workspace
//! default, the built-in default. Resolution is pure; persisting an
//! override onto the session is the orchestrator's job.

use crate::models::session::TrustLevel;
use crate::models::turn::{TrustDecision, TrustSource};

/// Inputs to one trust decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrustInputs {
    /// Explicit per-turn override.
    pub turn_override: Option<TrustLevel>,
    /// Level stored on the session.
    pub session: Option<TrustLevel>,
    /// Workspace default.
    pub workspace: Option<TrustLevel>,
}

/// Resolves effective trust with a fixed built-in default.
#[derive(Debug, Clone, Copy)]
pub struct TrustResolver {
    default: TrustLevel,
}

impl TrustResolver {
    /// Resolver falling back to `default`.
    #[must_use]
    pub fn new(default: TrustLevel) -> Self {
        Self { default }
    }

    /// Built-in default level.
    #[must_use]
    pub fn default_level(&self) -> TrustLevel {
        self.default
    }

    /// Resolve the effective trust for a turn.
    #[must_use]
    pub fn resolve(&self, inputs: TrustInputs) -> TrustDecision {
        let (effective_trust, source) = if let Some(level) = inputs.turn_override {
            (level, TrustSource::Override)
        } else if let Some(level) = inputs.session {
            (level, TrustSource::Session)
        } else if let Some(level) = inputs.workspace {
            (level, TrustSource::Workspace)
        } else {
            (self.default, TrustSource::Default)
        };
        TrustDecision {
            effective_trust,
            source,
        }
    }
}
