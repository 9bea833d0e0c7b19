//! callwatch-core: pure domain logic for live call tracking.
//! Call and escalation types, the push-channel wire codec, the reconciled
//! call view, and the optimistic takeover window. No IO, no async.

pub mod protocol;
pub mod takeover;
pub mod types;
pub mod view;

pub use protocol::{ClientCommand, ProtocolError, ServerEvent};
pub use takeover::{PendingTakeover, TakeoverTracker};
pub use types::{
    BusinessId, CallId, CallMessage, CallRecord, CallStatus, EscalationEvent, EscalationPayload,
    ScopeEpoch, SessionCredential,
};
pub use view::{
    CallView, EscalationOrigin, EscalationOutcome, PendingEscalation, SnapshotOutcome, ViewStatus,
};
