//! Call snapshot poller.
//!
//! While a business scope is set, fetches the latest calls on a fixed
//! interval and forwards them, tagged with the scope epoch, to the
//! reconciler. Scope changes are forwarded on the same channel so the
//! reconciler always sees `ScopeChanged` before the new scope's snapshots.

use std::sync::Arc;

use callwatch_core::BusinessId;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;
use crate::reconciler::ReconcileInput;
use crate::rest::{CallListParams, CallSource};
use crate::session::{ScopeState, SessionState, SessionStore};

pub struct CallSnapshotPoller<S: CallSource> {
    source: Arc<S>,
    session: SessionStore,
    tx: mpsc::Sender<ReconcileInput>,
    config: PollConfig,
    cancel: CancellationToken,
}

enum Interrupt {
    Cancelled,
    Scope(ScopeState),
}

impl<S: CallSource> CallSnapshotPoller<S> {
    pub fn new(
        source: Arc<S>,
        session: SessionStore,
        tx: mpsc::Sender<ReconcileInput>,
        config: PollConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            session,
            tx,
            config,
            cancel,
        }
    }

    /// Runs until cancelled or the reconciler goes away.
    pub async fn run(self) {
        let mut scope_rx = self.session.subscribe();
        let mut scope = scope_rx.borrow_and_update().scope.clone();

        loop {
            let announce = ReconcileInput::ScopeChanged {
                epoch: scope.epoch,
                business: scope.business.clone(),
            };
            if self.tx.send(announce).await.is_err() {
                tracing::info!("poller: reconciler gone, stopping");
                return;
            }

            let interrupt = match scope.business.clone() {
                Some(business) => self.poll_scope(&scope, business, &mut scope_rx).await,
                None => {
                    tracing::info!("poller: no business linked, idle");
                    self.wait_for_scope(&scope, &mut scope_rx).await
                }
            };
            match interrupt {
                Some(Interrupt::Scope(next)) => scope = next,
                Some(Interrupt::Cancelled) | None => {
                    tracing::info!("poller: stopped");
                    return;
                }
            }
        }
    }

    async fn wait_for_scope(
        &self,
        current: &ScopeState,
        scope_rx: &mut watch::Receiver<SessionState>,
    ) -> Option<Interrupt> {
        tokio::select! {
            _ = self.cancel.cancelled() => Some(Interrupt::Cancelled),
            next = next_scope(scope_rx, current) => next.map(Interrupt::Scope),
        }
    }

    /// Poll one scope until it changes. `None` means stop for good.
    async fn poll_scope(
        &self,
        scope: &ScopeState,
        business: BusinessId,
        scope_rx: &mut watch::Receiver<SessionState>,
    ) -> Option<Interrupt> {
        tracing::info!(
            business = %business,
            epoch = %scope.epoch,
            interval_ms = self.config.interval_ms,
            "poller: polling scope"
        );
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Some(Interrupt::Cancelled),
                next = next_scope(scope_rx, scope) => return next.map(Interrupt::Scope),
                _ = interval.tick() => {}
            }

            let params = self.params(&business);
            // A scope change drops the in-flight fetch with it.
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Some(Interrupt::Cancelled),
                next = next_scope(scope_rx, scope) => {
                    tracing::debug!(business = %business, "poller: scope changed mid-fetch, discarding");
                    return next.map(Interrupt::Scope);
                }
                result = self.source.list_calls(&params) => result,
            };

            let input = match result {
                Ok(calls) => {
                    tracing::debug!(business = %business, count = calls.len(), "poller: snapshot");
                    ReconcileInput::Snapshot {
                        epoch: scope.epoch,
                        calls,
                        fetched_at: Utc::now(),
                    }
                }
                Err(e) => {
                    tracing::warn!(business = %business, "poller: fetch failed: {e}");
                    ReconcileInput::PollFailed {
                        epoch: scope.epoch,
                        error: e.to_string(),
                    }
                }
            };
            if self.tx.send(input).await.is_err() {
                return None;
            }
        }
    }

    fn params(&self, business: &BusinessId) -> CallListParams {
        let mut params = CallListParams::latest(business.clone(), self.config.limit);
        if let Some(hours) = self.config.lookback_hours {
            params.date_from = chrono::Duration::try_hours(i64::from(hours))
                .and_then(|span| Utc::now().checked_sub_signed(span));
        }
        params
    }
}

/// Resolves on the next change of scope, ignoring credential-only updates.
/// `None` when the store is gone.
async fn next_scope(
    rx: &mut watch::Receiver<SessionState>,
    current: &ScopeState,
) -> Option<ScopeState> {
    loop {
        rx.changed().await.ok()?;
        let scope = rx.borrow_and_update().scope.clone();
        if scope != *current {
            return Some(scope);
        }
    }
}
