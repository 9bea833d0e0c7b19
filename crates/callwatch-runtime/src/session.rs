//! Process-wide auth/session store.
//!
//! Holds the bearer credential, the business scope (stamped with a
//! monotonically increasing epoch) and the operator's takeover phone.
//! Consumers subscribe to changes; the supervisor and the poller are the
//! main readers.

use std::sync::Arc;

use callwatch_core::{BusinessId, ScopeEpoch, SessionCredential};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeState {
    pub epoch: ScopeEpoch,
    pub business: Option<BusinessId>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub credential: Option<SessionCredential>,
    pub scope: ScopeState,
    pub operator_phone: Option<String>,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }
}

/// Cloneable handle; every clone observes the same state.
#[derive(Clone)]
pub struct SessionStore {
    tx: Arc<watch::Sender<SessionState>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn credential(&self) -> Option<SessionCredential> {
        self.tx.borrow().credential.clone()
    }

    pub fn operator_phone(&self) -> Option<String> {
        self.tx.borrow().operator_phone.clone()
    }

    /// Install a credential. Replacing an existing one is a session change.
    pub fn login(&self, credential: SessionCredential) {
        self.tx.send_modify(|s| s.credential = Some(credential));
        tracing::info!("session: credential installed");
    }

    /// Clear the credential and the scope. Returns false when already logged out.
    pub fn logout(&self) -> bool {
        let changed = self.tx.send_if_modified(|s| {
            if s.credential.is_none() && s.scope.business.is_none() {
                return false;
            }
            s.credential = None;
            s.operator_phone = None;
            if s.scope.business.is_some() {
                s.scope.epoch = s.scope.epoch.next();
                s.scope.business = None;
            }
            true
        });
        if changed {
            tracing::info!("session: logged out");
        }
        changed
    }

    /// Set (or clear) the business scope. Bumps the epoch when it changes.
    pub fn set_business(&self, business: Option<BusinessId>) -> ScopeEpoch {
        self.tx.send_if_modified(|s| {
            if s.scope.business == business {
                return false;
            }
            s.scope.epoch = s.scope.epoch.next();
            tracing::info!(
                epoch = %s.scope.epoch,
                business = business.as_ref().map(BusinessId::as_str),
                "session: scope changed"
            );
            s.scope.business = business;
            true
        });
        self.tx.borrow().scope.epoch
    }

    pub fn set_operator_phone(&self, phone: Option<String>) {
        self.tx.send_modify(|s| s.operator_phone = phone);
    }
}
