//! Call state reconciler: the single owner of the derived view.
//!
//! Every producer (poller, push channel observer, control server) sends a
//! [`ReconcileInput`] over one mpsc channel. The actor applies it to the
//! [`CallView`] and the [`TakeoverTracker`], then publishes a fresh
//! [`ViewSnapshot`] into shared state and broadcasts what changed.

use std::sync::Arc;

use callwatch_core::{
    BusinessId, CallId, CallRecord, CallView, EscalationEvent, EscalationOutcome,
    PendingEscalation, PendingTakeover, ScopeEpoch, SnapshotOutcome, TakeoverTracker, ViewStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ReconcileInput {
    ScopeChanged {
        epoch: ScopeEpoch,
        business: Option<BusinessId>,
    },
    Snapshot {
        epoch: ScopeEpoch,
        calls: Vec<CallRecord>,
        fetched_at: DateTime<Utc>,
    },
    PollFailed {
        epoch: ScopeEpoch,
        error: String,
    },
    Escalation(EscalationEvent),
    /// A takeover command was sent over the channel.
    TakeoverRequested {
        call_id: CallId,
        phone_number: String,
        requested_at: DateTime<Utc>,
    },
}

/// Broadcast to subscribers after an input changed the view.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewNotification {
    ScopeChanged {
        epoch: ScopeEpoch,
        business: Option<BusinessId>,
    },
    SnapshotApplied {
        epoch: ScopeEpoch,
        active: usize,
        escalated: usize,
    },
    Escalation {
        call_id: CallId,
        reason: Option<String>,
        score: Option<f64>,
        received_at: DateTime<Utc>,
    },
    PollFailed {
        epoch: ScopeEpoch,
        error: String,
    },
    TakeoverRequested {
        call_id: CallId,
        display_until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveCallEntry {
    #[serde(flatten)]
    pub call: CallRecord,
    pub escalation_pending: bool,
    pub last_transcript: Option<String>,
    /// End of the "takeover requested" display window, if one was sent.
    pub takeover_until: Option<DateTime<Utc>>,
}

impl ActiveCallEntry {
    pub fn takeover_requested(&self, now: DateTime<Utc>) -> bool {
        self.takeover_until.is_some_and(|until| until > now)
    }
}

/// Read-only copy of the view, published after every input.
#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub status: ViewStatus,
    pub scope: Option<BusinessId>,
    pub epoch: ScopeEpoch,
    pub active: Vec<ActiveCallEntry>,
    pub pending_escalations: Vec<PendingEscalation>,
    pub takeovers: Vec<PendingTakeover>,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ViewSnapshot {
    fn default() -> Self {
        Self::build(&CallView::new(), &TakeoverTracker::default(), Utc::now())
    }
}

impl ViewSnapshot {
    fn build(view: &CallView, takeovers: &TakeoverTracker, now: DateTime<Utc>) -> Self {
        let pending_takeovers = takeovers.pending(now);
        let active = view
            .active_calls()
            .into_iter()
            .map(|call| ActiveCallEntry {
                escalation_pending: view.is_pending_escalation(&call.id),
                last_transcript: call.last_transcript().map(str::to_string),
                takeover_until: pending_takeovers
                    .iter()
                    .find(|t| t.call_id == call.id)
                    .map(|t| t.display_until),
                call: call.clone(),
            })
            .collect();
        Self {
            status: view.status(),
            scope: view.scope().cloned(),
            epoch: view.epoch(),
            active,
            pending_escalations: view.pending_escalations(),
            takeovers: pending_takeovers,
            last_snapshot_at: view.last_snapshot_at(),
            last_error: view.last_error().map(str::to_string),
        }
    }

    /// Drop takeover marks whose display window has passed by `now`.
    pub fn at(&self, now: DateTime<Utc>) -> Self {
        let mut out = self.clone();
        out.takeovers.retain(|t| t.display_until > now);
        for entry in &mut out.active {
            if !entry.takeover_requested(now) {
                entry.takeover_until = None;
            }
        }
        out
    }
}

pub type SharedView = Arc<RwLock<ViewSnapshot>>;

pub struct Reconciler {
    view: CallView,
    takeovers: TakeoverTracker,
    input_rx: mpsc::Receiver<ReconcileInput>,
    notify_tx: broadcast::Sender<ViewNotification>,
    shared: SharedView,
    cancel: CancellationToken,
}

impl Reconciler {
    pub fn new(
        input_rx: mpsc::Receiver<ReconcileInput>,
        notify_tx: broadcast::Sender<ViewNotification>,
        shared: SharedView,
        takeover_display_ms: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            view: CallView::new(),
            takeovers: TakeoverTracker::new(takeover_display_ms),
            input_rx,
            notify_tx,
            shared,
            cancel,
        }
    }

    /// Runs until every sender is dropped or the token is cancelled.
    pub async fn run(&mut self) {
        info!("reconciler: started");
        loop {
            tokio::select! {
                input = self.input_rx.recv() => {
                    match input {
                        Some(input) => {
                            if let Some(note) = self.handle(input, Utc::now()) {
                                self.publish(note).await;
                            }
                        }
                        None => {
                            info!("reconciler: input channel closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    info!("reconciler: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    /// Apply one input. Returns the notification to publish, or `None` when
    /// the input changed nothing.
    fn handle(&mut self, input: ReconcileInput, now: DateTime<Utc>) -> Option<ViewNotification> {
        match input {
            ReconcileInput::ScopeChanged { epoch, business } => {
                if !self.view.set_scope(epoch, business.clone()) {
                    return None;
                }
                self.takeovers.clear();
                info!(%epoch, business = business.as_ref().map(BusinessId::as_str), "reconciler: scope changed");
                Some(ViewNotification::ScopeChanged { epoch, business })
            }
            ReconcileInput::Snapshot {
                epoch,
                calls,
                fetched_at,
            } => match self.view.apply_snapshot(epoch, calls, fetched_at) {
                SnapshotOutcome::Applied { active, escalated } => {
                    self.takeovers.prune(self.view.active_ids(), now);
                    debug!(%epoch, active, escalated, "reconciler: snapshot applied");
                    Some(ViewNotification::SnapshotApplied {
                        epoch,
                        active,
                        escalated,
                    })
                }
                SnapshotOutcome::Stale => {
                    debug!(%epoch, current = %self.view.epoch(), "reconciler: stale snapshot dropped");
                    None
                }
            },
            ReconcileInput::PollFailed { epoch, error } => {
                if !self.view.record_poll_failure(epoch, error.clone()) {
                    return None;
                }
                warn!(%epoch, "reconciler: view stale: {error}");
                Some(ViewNotification::PollFailed { epoch, error })
            }
            ReconcileInput::Escalation(event) => match self.view.apply_escalation(&event) {
                EscalationOutcome::Marked => {
                    info!(call_id = %event.call_id, "reconciler: call pending escalation");
                    Some(ViewNotification::Escalation {
                        call_id: event.call_id,
                        reason: event.reason,
                        score: event.score,
                        received_at: event.received_at,
                    })
                }
                EscalationOutcome::AlreadyPending => None,
                EscalationOutcome::Ignored => {
                    debug!(call_id = %event.call_id, "reconciler: escalation for unknown call ignored");
                    None
                }
            },
            ReconcileInput::TakeoverRequested {
                call_id,
                phone_number,
                requested_at,
            } => {
                if !self.view.is_active(&call_id) {
                    debug!(call_id = %call_id, "reconciler: takeover for inactive call not shown");
                    return None;
                }
                let entry = self.takeovers.record(call_id.clone(), phone_number, requested_at);
                Some(ViewNotification::TakeoverRequested {
                    call_id,
                    display_until: entry.display_until,
                })
            }
        }
    }

    async fn publish(&self, note: ViewNotification) {
        let snapshot = ViewSnapshot::build(&self.view, &self.takeovers, Utc::now());
        *self.shared.write().await = snapshot;
        // No subscribers is fine.
        let _ = self.notify_tx.send(note);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, ended: bool, status: &str) -> CallRecord {
        let mut v = serde_json::json!({
            "id": id,
            "caller_number": "+15550001",
            "started_at": "2026-01-01T10:00:00Z",
            "status": status,
        });
        if ended {
            v["ended_at"] = serde_json::json!("2026-01-01T10:05:00Z");
        }
        serde_json::from_value(v).unwrap()
    }

    fn escalation(id: &str) -> ReconcileInput {
        ReconcileInput::Escalation(EscalationEvent {
            call_id: CallId::from(id),
            reason: Some("caller upset".into()),
            score: Some(0.91),
            received_at: Utc::now(),
        })
    }

    fn actor() -> (
        Reconciler,
        mpsc::Sender<ReconcileInput>,
        broadcast::Receiver<ViewNotification>,
        SharedView,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let (ntx, nrx) = broadcast::channel(64);
        let shared: SharedView = Arc::new(RwLock::new(ViewSnapshot::default()));
        let r = Reconciler::new(rx, ntx, shared.clone(), 2000, CancellationToken::new());
        (r, tx, nrx, shared)
    }

    fn scope(epoch: u64, biz: &str) -> ReconcileInput {
        ReconcileInput::ScopeChanged {
            epoch: ScopeEpoch(epoch),
            business: Some(BusinessId::from(biz)),
        }
    }

    #[tokio::test]
    async fn run_applies_inputs_until_channel_closed() {
        let (mut r, tx, mut nrx, shared) = actor();

        tx.send(scope(1, "biz-A")).await.unwrap();
        tx.send(ReconcileInput::Snapshot {
            epoch: ScopeEpoch(1),
            calls: vec![call("c1", false, "active"), call("c0", true, "escalated")],
            fetched_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.send(escalation("c1")).await.unwrap();
        tx.send(escalation("c404")).await.unwrap();
        drop(tx);
        r.run().await;

        let snap = shared.read().await.clone();
        assert_eq!(snap.status, ViewStatus::Live);
        assert_eq!(snap.active.len(), 1);
        assert!(snap.active[0].escalation_pending);
        assert_eq!(snap.pending_escalations.len(), 2);

        assert!(matches!(nrx.recv().await.unwrap(), ViewNotification::ScopeChanged { .. }));
        assert!(matches!(
            nrx.recv().await.unwrap(),
            ViewNotification::SnapshotApplied { active: 1, escalated: 1, .. }
        ));
        assert!(matches!(nrx.recv().await.unwrap(), ViewNotification::Escalation { .. }));
        // c404 changed nothing and was not broadcast.
        assert!(nrx.try_recv().is_err());
    }

    #[test]
    fn stale_epoch_snapshot_is_dropped() {
        let (mut r, _tx, _nrx, _shared) = actor();
        let now = Utc::now();
        r.handle(scope(1, "biz-A"), now);
        r.handle(scope(2, "biz-B"), now);

        let late = ReconcileInput::Snapshot {
            epoch: ScopeEpoch(1),
            calls: vec![call("a1", false, "active")],
            fetched_at: now,
        };
        assert!(r.handle(late, now).is_none());
        assert!(!r.view.is_active(&CallId::from("a1")));
    }

    #[test]
    fn poll_failure_keeps_last_data() {
        let (mut r, _tx, _nrx, _shared) = actor();
        let now = Utc::now();
        r.handle(scope(1, "biz-A"), now);
        r.handle(
            ReconcileInput::Snapshot {
                epoch: ScopeEpoch(1),
                calls: vec![call("c1", false, "active")],
                fetched_at: now,
            },
            now,
        );
        let note = r.handle(
            ReconcileInput::PollFailed {
                epoch: ScopeEpoch(1),
                error: "timeout".into(),
            },
            now,
        );
        assert!(matches!(note, Some(ViewNotification::PollFailed { .. })));

        let snap = ViewSnapshot::build(&r.view, &r.takeovers, now);
        assert_eq!(snap.status, ViewStatus::Stale);
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn takeover_shown_until_window_or_snapshot() {
        let (mut r, _tx, _nrx, _shared) = actor();
        let now = Utc::now();
        r.handle(scope(1, "biz-A"), now);
        r.handle(
            ReconcileInput::Snapshot {
                epoch: ScopeEpoch(1),
                calls: vec![call("c1", false, "active"), call("c2", false, "active")],
                fetched_at: now,
            },
            now,
        );
        for id in ["c1", "c2"] {
            let note = r.handle(
                ReconcileInput::TakeoverRequested {
                    call_id: CallId::from(id),
                    phone_number: "+15551234567".into(),
                    requested_at: now,
                },
                now,
            );
            assert!(matches!(note, Some(ViewNotification::TakeoverRequested { .. })));
        }

        let snap = ViewSnapshot::build(&r.view, &r.takeovers, now);
        assert!(snap.active.iter().all(|e| e.takeover_requested(now)));
        let later = now + chrono::Duration::milliseconds(2500);
        let aged = snap.at(later);
        assert!(aged.takeovers.is_empty());
        assert!(aged.active.iter().all(|e| e.takeover_until.is_none()));

        // c1 ends: its takeover mark goes with it.
        r.handle(
            ReconcileInput::Snapshot {
                epoch: ScopeEpoch(1),
                calls: vec![call("c1", true, "transferred"), call("c2", false, "active")],
                fetched_at: now,
            },
            now,
        );
        let snap = ViewSnapshot::build(&r.view, &r.takeovers, now);
        let ids: Vec<&str> = snap.takeovers.iter().map(|t| t.call_id.as_str()).collect();
        assert_eq!(ids, vec!["c2"]);
    }

    #[test]
    fn takeover_for_unknown_call_is_not_fabricated() {
        let (mut r, _tx, _nrx, _shared) = actor();
        let now = Utc::now();
        r.handle(scope(1, "biz-A"), now);
        let note = r.handle(
            ReconcileInput::TakeoverRequested {
                call_id: CallId::from("ghost"),
                phone_number: "+1".into(),
                requested_at: now,
            },
            now,
        );
        assert!(note.is_none());
        assert!(r.takeovers.pending(now).is_empty());
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let cancel = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(8);
        let (ntx, _nrx) = broadcast::channel(8);
        let shared: SharedView = Arc::new(RwLock::new(ViewSnapshot::default()));
        let mut r = Reconciler::new(rx, ntx, shared, 2000, cancel.clone());
        let handle = tokio::spawn(async move { r.run().await });
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
