use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryId(pub Uuid);

impl HistoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HistoryId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Requested,
    Pending,
    Played,
    Failed,
}

impl RequestStatus {
    /// `played` and `failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Played | RequestStatus::Failed)
    }

    /// Requests only ever move forward through the lifecycle.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Requested, Pending) | (Requested, Failed) | (Pending, Played) | (Pending, Failed)
        )
    }
}

/// A listener request as persisted by the request repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub track_id: String,
    pub submitter: String,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
    #[serde(default)]
    pub history: Option<HistoryId>,
}

impl Request {
    pub fn new(track_id: impl Into<String>, submitter: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            track_id: track_id.into(),
            submitter: submitter.into(),
            requested_at: Utc::now(),
            status: RequestStatus::Requested,
            history: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, RequestStatus::Requested | RequestStatus::Pending)
    }
}

/// Operator-supplied request used by the bulk replace of the request tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRequest {
    pub track_id: String,
    pub submitter: String,
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl From<NewRequest> for Request {
    fn from(new: NewRequest) -> Self {
        let mut request = Request::new(new.track_id, new.submitter);
        if let Some(at) = new.requested_at {
            request.requested_at = at;
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: HistoryId,
    pub track_id: String,
    pub submitter: Option<String>,
    pub played_at: DateTime<Utc>,
}
