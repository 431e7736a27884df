use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;

const ANON_PREFIX: &str = "anon";
const ANON_HANDLE_LEN: usize = 24;
const MAX_HANDLE_LEN: usize = 64;

/// Who is behind a listener connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "handle", rename_all = "lowercase")]
pub enum Identity {
    Authenticated(String),
    /// Session handle of the form `anon` + 20 characters.
    Anonymous(String),
}

impl Identity {
    /// Classify a caller-supplied handle. Returns `None` for unusable handles.
    pub fn from_handle(handle: &str) -> Option<Self> {
        let handle = handle.trim();
        if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
            return None;
        }
        if handle.starts_with(ANON_PREFIX) && handle.len() == ANON_HANDLE_LEN {
            Some(Identity::Anonymous(handle.to_string()))
        } else {
            Some(Identity::Authenticated(handle.to_string()))
        }
    }

    /// Fresh session handle for a caller that supplied none.
    pub fn anonymous() -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ANON_HANDLE_LEN - ANON_PREFIX.len())
            .map(char::from)
            .collect();
        Identity::Anonymous(format!("{ANON_PREFIX}{suffix}"))
    }

    pub fn handle(&self) -> &str {
        match self {
            Identity::Authenticated(handle) | Identity::Anonymous(handle) => handle,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous(_))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.handle())
    }
}
