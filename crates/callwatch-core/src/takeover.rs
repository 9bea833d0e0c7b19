//! Optimistic takeover display.
//!
//! A takeover request has no acknowledgment. After sending one the call is
//! shown as "takeover requested" for a bounded window; the next snapshot or
//! escalation is what actually confirms or refutes it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::CallId;

/// Display window used by the dashboard for a requested takeover.
pub const DEFAULT_DISPLAY_WINDOW_MS: u64 = 2000;
/// Longest accepted display window; larger values are clamped.
pub const MAX_DISPLAY_WINDOW_MS: u64 = 3_600_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTakeover {
    pub call_id: CallId,
    pub phone_number: String,
    pub requested_at: DateTime<Utc>,
    pub display_until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TakeoverTracker {
    window: Duration,
    pending: HashMap<CallId, PendingTakeover>,
}

impl Default for TakeoverTracker {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_WINDOW_MS)
    }
}

impl TakeoverTracker {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window: Duration::milliseconds(window_ms.min(MAX_DISPLAY_WINDOW_MS) as i64),
            pending: HashMap::new(),
        }
    }

    /// Reflect a sent takeover. A repeated request restarts the window.
    pub fn record(
        &mut self,
        call_id: CallId,
        phone_number: impl Into<String>,
        now: DateTime<Utc>,
    ) -> &PendingTakeover {
        let entry = PendingTakeover {
            call_id: call_id.clone(),
            phone_number: phone_number.into(),
            requested_at: now,
            display_until: now
                .checked_add_signed(self.window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        self.pending.insert(call_id.clone(), entry);
        &self.pending[&call_id]
    }

    pub fn is_pending(&self, call_id: &CallId, now: DateTime<Utc>) -> bool {
        self.pending
            .get(call_id)
            .is_some_and(|p| p.display_until > now)
    }

    /// Drop expired entries and entries for calls no longer active.
    pub fn prune<'a>(&mut self, active: impl IntoIterator<Item = &'a CallId>, now: DateTime<Utc>) {
        let active: std::collections::HashSet<&CallId> = active.into_iter().collect();
        self.pending
            .retain(|id, p| p.display_until > now && active.contains(id));
    }

    /// Entries still inside their display window.
    pub fn pending(&self, now: DateTime<Utc>) -> Vec<PendingTakeover> {
        let mut out: Vec<PendingTakeover> = self
            .pending
            .values()
            .filter(|p| p.display_until > now)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        out
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
