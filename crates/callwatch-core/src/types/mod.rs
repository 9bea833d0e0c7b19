mod call;
mod escalation;
mod session;

pub use call::{CallId, CallMessage, CallRecord, CallStatus};
pub use escalation::{EscalationEvent, EscalationPayload};
pub use session::{BusinessId, ScopeEpoch, SessionCredential};
