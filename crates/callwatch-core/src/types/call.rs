use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a call as issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status reported by the backend.
///
/// Descriptive only: whether a call is active is decided by `ended_at`,
/// never by this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[serde(alias = "in_progress")]
    Active,
    Completed,
    Escalated,
    Missed,
    Transferred,
    #[serde(other)]
    Unknown,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Escalated => "escalated",
            Self::Missed => "missed",
            Self::Transferred => "transferred",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transcript line attached to a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMessage {
    #[serde(default, alias = "role")]
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A call as returned by `GET /calls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: CallId,
    #[serde(default)]
    pub business_id: Option<String>,
    pub caller_number: String,
    #[serde(default)]
    pub caller_name: Option<String>,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub messages: Vec<CallMessage>,
    #[serde(default)]
    pub escalated_to: Option<String>,
}

impl CallRecord {
    /// A call with no end time is active.
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn is_escalated(&self) -> bool {
        self.status == CallStatus::Escalated
    }

    /// Last known transcript fragment: the newest message, else the summary.
    pub fn last_transcript(&self) -> Option<&str> {
        self.messages
            .last()
            .map(|m| m.content.as_str())
            .or(self.summary.as_deref())
    }

    /// Elapsed seconds, from the backend when known, otherwise derived from
    /// `started_at` and `ended_at` (or `now` for an active call).
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        if let Some(d) = self.duration_seconds {
            return d;
        }
        let end = self.ended_at.unwrap_or(now);
        end.signed_duration_since(self.started_at).num_seconds().max(0)
    }
}
