//! Derived call view: merges polled snapshots and pushed escalation events.
//!
//! The poll snapshot is authoritative. An escalation event may provisionally
//! mark a call that the last snapshot knows as active; every applied snapshot
//! discards those provisional marks, whatever they said.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{BusinessId, CallId, CallRecord, EscalationEvent, ScopeEpoch};

/// Coarse state of the view, for display and for the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    /// No business scope: polling and subscription are disabled.
    NoBusinessLinked,
    /// Scope set, no snapshot applied yet.
    AwaitingSnapshot,
    /// Last poll succeeded.
    Live,
    /// Last poll failed; showing the last known data.
    Stale,
}

/// Why a call sits in the pending-escalation projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "origin", rename_all = "snake_case")]
pub enum EscalationOrigin {
    /// The snapshot reported the call with status `escalated`.
    Snapshot,
    /// An escalation event arrived after the last snapshot.
    Provisional {
        reason: Option<String>,
        score: Option<f64>,
        received_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub call: CallRecord,
    #[serde(flatten)]
    pub origin: EscalationOrigin,
}

/// Result of offering a snapshot to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied { active: usize, escalated: usize },
    /// Fetched under an epoch that is no longer current.
    Stale,
}

/// Result of offering an escalation event to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// Active call now provisionally pending escalation.
    Marked,
    /// Already pending, from the snapshot or an earlier event.
    AlreadyPending,
    /// Call id not in the active set; nothing changed.
    Ignored,
}

#[derive(Debug, Clone)]
struct ProvisionalMark {
    reason: Option<String>,
    score: Option<f64>,
    received_at: DateTime<Utc>,
}

/// The reconciled view for one business scope.
#[derive(Debug, Clone, Default)]
pub struct CallView {
    scope: Option<BusinessId>,
    epoch: ScopeEpoch,
    active: HashMap<CallId, CallRecord>,
    escalated: HashMap<CallId, CallRecord>,
    provisional: HashMap<CallId, ProvisionalMark>,
    last_snapshot_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl CallView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(&self) -> Option<&BusinessId> {
        self.scope.as_ref()
    }

    pub fn epoch(&self) -> ScopeEpoch {
        self.epoch
    }

    /// Switch to a new scope assignment. Older epochs are ignored and a
    /// repeat of the current assignment is a no-op; anything newer clears
    /// every projection, even for the same business, since snapshots in
    /// flight for the old epoch are now stale. Returns whether anything
    /// changed.
    pub fn set_scope(&mut self, epoch: ScopeEpoch, scope: Option<BusinessId>) -> bool {
        if epoch < self.epoch || (epoch == self.epoch && scope == self.scope) {
            return false;
        }
        self.epoch = epoch;
        self.scope = scope;
        self.active.clear();
        self.escalated.clear();
        self.provisional.clear();
        self.last_snapshot_at = None;
        self.last_error = None;
        true
    }

    /// Replace the view wholesale with a snapshot fetched under `epoch`.
    pub fn apply_snapshot(
        &mut self,
        epoch: ScopeEpoch,
        calls: Vec<CallRecord>,
        fetched_at: DateTime<Utc>,
    ) -> SnapshotOutcome {
        if epoch != self.epoch || self.scope.is_none() {
            return SnapshotOutcome::Stale;
        }

        let mut active = HashMap::new();
        let mut escalated = HashMap::new();
        for call in calls {
            if call.is_escalated() {
                escalated.insert(call.id.clone(), call.clone());
            }
            if call.is_active() {
                active.insert(call.id.clone(), call);
            }
        }

        self.active = active;
        self.escalated = escalated;
        self.provisional.clear();
        self.last_snapshot_at = Some(fetched_at);
        self.last_error = None;

        SnapshotOutcome::Applied {
            active: self.active.len(),
            escalated: self.escalated.len(),
        }
    }

    /// Record a failed fetch. Data is kept; only the status changes.
    /// Returns false for a stale epoch.
    pub fn record_poll_failure(&mut self, epoch: ScopeEpoch, error: impl Into<String>) -> bool {
        if epoch != self.epoch || self.scope.is_none() {
            return false;
        }
        self.last_error = Some(error.into());
        true
    }

    /// Eagerly mark an active call as pending escalation.
    pub fn apply_escalation(&mut self, event: &EscalationEvent) -> EscalationOutcome {
        if !self.active.contains_key(&event.call_id) {
            return EscalationOutcome::Ignored;
        }
        if self.escalated.contains_key(&event.call_id)
            || self.provisional.contains_key(&event.call_id)
        {
            return EscalationOutcome::AlreadyPending;
        }
        self.provisional.insert(
            event.call_id.clone(),
            ProvisionalMark {
                reason: event.reason.clone(),
                score: event.score,
                received_at: event.received_at,
            },
        );
        EscalationOutcome::Marked
    }

    pub fn status(&self) -> ViewStatus {
        if self.scope.is_none() {
            ViewStatus::NoBusinessLinked
        } else if self.last_error.is_some() {
            ViewStatus::Stale
        } else if self.last_snapshot_at.is_none() {
            ViewStatus::AwaitingSnapshot
        } else {
            ViewStatus::Live
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        self.last_snapshot_at
    }

    pub fn is_active(&self, call_id: &CallId) -> bool {
        self.active.contains_key(call_id)
    }

    pub fn is_pending_escalation(&self, call_id: &CallId) -> bool {
        self.escalated.contains_key(call_id) || self.provisional.contains_key(call_id)
    }

    pub fn active_ids(&self) -> impl Iterator<Item = &CallId> {
        self.active.keys()
    }

    /// Active calls, newest first.
    pub fn active_calls(&self) -> Vec<&CallRecord> {
        let mut calls: Vec<&CallRecord> = self.active.values().collect();
        calls.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        calls
    }

    /// Snapshot-escalated calls plus provisional marks, newest first.
    pub fn pending_escalations(&self) -> Vec<PendingEscalation> {
        let mut pending: Vec<PendingEscalation> = self
            .escalated
            .values()
            .map(|call| PendingEscalation {
                call: call.clone(),
                origin: EscalationOrigin::Snapshot,
            })
            .collect();

        for (call_id, mark) in &self.provisional {
            if let Some(call) = self.active.get(call_id) {
                pending.push(PendingEscalation {
                    call: call.clone(),
                    origin: EscalationOrigin::Provisional {
                        reason: mark.reason.clone(),
                        score: mark.score,
                        received_at: mark.received_at,
                    },
                });
            }
        }

        pending.sort_by(|a, b| {
            b.call
                .started_at
                .cmp(&a.call.started_at)
                .then(a.call.id.cmp(&b.call.id))
        });
        pending
    }
}
