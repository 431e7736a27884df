pub mod identity;
pub mod request;
pub mod track;

pub use identity::Identity;
pub use request::{HistoryEntry, HistoryId, NewRequest, Request, RequestId, RequestStatus};
pub use track::{QueueEntry, Track, SOURCE_PLATFORM};

use std::path::PathBuf;

use serde::Serialize;

/// Fully prepared audio waiting in the buffer tier.
///
/// Owned by the gatherer until `buffer_add`, then by the player, which deletes
/// `path` once the broadcast ends.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedAudio {
    pub path: PathBuf,
    pub track: Track,
    pub submitter: Option<String>,
    pub request: Option<RequestId>,
}

impl PreparedAudio {
    pub fn track_id(&self) -> &str {
        &self.track.id
    }
}
