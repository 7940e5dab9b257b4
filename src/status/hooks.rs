//! Status-change hooks.
//!
//! Hooks run after a status change has been persisted and published. They
//! are where an external notifier plugs in; the built-in one only logs.

use chrono::{DateTime, Utc};

use crate::db::StatusKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// The server went degraded or down.
    Failure,
    /// The server came back up from degraded or down.
    Recovery,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub server_id: i64,
    pub server_name: String,
    pub previous: StatusKind,
    pub current: StatusKind,
    pub kind: TransitionKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Classify a status change. `None` when nothing changed.
pub fn classify(previous: StatusKind, current: StatusKind) -> Option<TransitionKind> {
    if previous == current {
        return None;
    }
    if current.is_unhealthy() {
        Some(TransitionKind::Failure)
    } else if previous.is_unhealthy() {
        Some(TransitionKind::Recovery)
    } else {
        None
    }
}

pub trait StatusHook: Send + Sync {
    fn on_transition(&self, transition: &StatusTransition);
}

/// Writes every transition to the log.
pub struct LogHook;

impl StatusHook for LogHook {
    fn on_transition(&self, t: &StatusTransition) {
        match t.kind {
            TransitionKind::Failure => tracing::warn!(
                "Server {} ({}) is {} (was {}): {}",
                t.server_name,
                t.server_id,
                t.current,
                t.previous,
                t.message
            ),
            TransitionKind::Recovery => tracing::info!(
                "Server {} ({}) recovered (was {})",
                t.server_name,
                t.server_id,
                t.previous
            ),
        }
    }
}
