//! Ties the push channel lifecycle to the session.
//!
//! Login builds a [`SessionChannelManager`] for the credential and joins the
//! current business room; a scope change re-joins; logout (explicit or after
//! a 401) tears the manager down. The manager lives in a shared slot so the
//! control server can send takeovers through it.

use std::sync::Arc;

use callwatch_core::SessionCredential;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::channel::{JoinOutcome, SessionChannelManager, Transport};
use crate::reconciler::ReconcileInput;
use crate::session::{SessionState, SessionStore};

pub type SharedChannel = Arc<Mutex<Option<SessionChannelManager>>>;

pub struct SessionSupervisor {
    session: SessionStore,
    transport: Arc<dyn Transport>,
    channel: SharedChannel,
    reconcile_tx: mpsc::Sender<ReconcileInput>,
    cancel: CancellationToken,
    bound: Option<SessionCredential>,
}

impl SessionSupervisor {
    pub fn new(
        session: SessionStore,
        transport: Arc<dyn Transport>,
        channel: SharedChannel,
        reconcile_tx: mpsc::Sender<ReconcileInput>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            transport,
            channel,
            reconcile_tx,
            cancel,
            bound: None,
        }
    }

    pub async fn run(mut self) {
        let mut rx = self.session.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            self.apply(&state).await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(mut mgr) = self.channel.lock().await.take() {
            mgr.disconnect();
        }
        tracing::info!("supervisor: stopped");
    }

    async fn apply(&mut self, state: &SessionState) {
        let mut slot = self.channel.lock().await;

        let Some(credential) = &state.credential else {
            if let Some(mut mgr) = slot.take() {
                tracing::info!("supervisor: session ended, closing channel");
                mgr.disconnect();
            }
            self.bound = None;
            return;
        };

        if self.bound.as_ref() != Some(credential) {
            if let Some(mut old) = slot.take() {
                old.disconnect();
            }
            let mut mgr = self.new_manager();
            mgr.connect(credential);
            tracing::info!("supervisor: channel opened for new session");
            *slot = Some(mgr);
            self.bound = Some(credential.clone());
        }

        let Some(mgr) = slot.as_mut() else {
            return;
        };
        match &state.scope.business {
            Some(business) => match mgr.join(business) {
                JoinOutcome::NotConnected => {
                    tracing::warn!(business = %business, "supervisor: channel missing, room not joined");
                }
                JoinOutcome::AlreadyJoined => {}
                outcome => tracing::debug!(?outcome, business = %business, "supervisor: room joined"),
            },
            None => mgr.leave(),
        }
    }

    fn new_manager(&self) -> SessionChannelManager {
        let mgr = SessionChannelManager::new(Arc::clone(&self.transport));
        let tx = self.reconcile_tx.clone();
        mgr.on_escalation(move |event| {
            // Never block the delivery task on the reconciler.
            if let Err(e) = tx.try_send(ReconcileInput::Escalation(event.clone())) {
                tracing::warn!(call_id = %event.call_id, "supervisor: escalation dropped: {e}");
            }
        });
        mgr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::MockTransport;
    use callwatch_core::{BusinessId, CallId, EscalationEvent};
    use chrono::Utc;
    use std::time::Duration;

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn start(
        session: &SessionStore,
    ) -> (MockTransport, SharedChannel, mpsc::Receiver<ReconcileInput>, CancellationToken) {
        let transport = MockTransport::default();
        let channel: SharedChannel = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let sup = SessionSupervisor::new(
            session.clone(),
            Arc::new(transport.clone()),
            Arc::clone(&channel),
            tx,
            cancel.clone(),
        );
        tokio::spawn(sup.run());
        (transport, channel, rx, cancel)
    }

    #[tokio::test]
    async fn login_connects_and_joins_scope() {
        let session = SessionStore::new();
        let (transport, channel, mut rx, cancel) = start(&session);

        session.login(SessionCredential::new("tok"));
        session.set_business(Some(BusinessId::from("biz-A")));
        eventually(|| transport.join_count() == 1).await;
        assert_eq!(transport.opened(), 1);
        assert!(channel.lock().await.is_some());

        let event = EscalationEvent {
            call_id: CallId::from("c1"),
            reason: None,
            score: None,
            received_at: Utc::now(),
        };
        assert_eq!(transport.push(&BusinessId::from("biz-A"), &event), 1);
        match rx.recv().await {
            Some(ReconcileInput::Escalation(ev)) => assert_eq!(ev.call_id, CallId::from("c1")),
            other => panic!("expected escalation, got {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn logout_tears_the_channel_down() {
        let session = SessionStore::new();
        let (transport, channel, _rx, cancel) = start(&session);

        session.login(SessionCredential::new("tok"));
        session.set_business(Some(BusinessId::from("biz-A")));
        eventually(|| transport.join_count() == 1).await;

        session.logout();
        eventually(|| transport.open_links() == 0).await;
        eventually(|| channel.try_lock().is_ok_and(|slot| slot.is_none())).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn new_credential_builds_a_new_manager() {
        let session = SessionStore::new();
        let (transport, _channel, _rx, cancel) = start(&session);

        session.login(SessionCredential::new("a"));
        eventually(|| transport.opened() == 1).await;
        session.login(SessionCredential::new("b"));
        eventually(|| transport.opened() == 2).await;
        assert_eq!(transport.open_links(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn scope_switch_moves_the_room() {
        let session = SessionStore::new();
        let (transport, channel, _rx, cancel) = start(&session);

        session.login(SessionCredential::new("tok"));
        session.set_business(Some(BusinessId::from("biz-A")));
        eventually(|| transport.join_count() == 1).await;
        session.set_business(Some(BusinessId::from("biz-B")));
        eventually(|| transport.opened() == 2).await;

        let slot = channel.lock().await;
        assert_eq!(
            slot.as_ref().and_then(|m| m.room().cloned()),
            Some(BusinessId::from("biz-B"))
        );
        drop(slot);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_disconnects() {
        let session = SessionStore::new();
        let (transport, _channel, _rx, cancel) = start(&session);
        session.login(SessionCredential::new("tok"));
        eventually(|| transport.opened() == 1).await;
        cancel.cancel();
        eventually(|| transport.open_links() == 0).await;
    }
}
