//! Observable sync state.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// State of the most recent sync attempt.
///
/// Starts as `Idle`. A terminal `Success` or `Error` stays observable
/// until the next attempt moves the state to `InProgress`.
#[derive(Debug, Clone, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    InProgress,
    Success {
        message: String,
    },
    Error {
        message: String,
        cause: Arc<SyncError>,
    },
}

impl SyncStatus {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, SyncStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Success { .. } | SyncStatus::Error { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Success { .. } => "success",
            SyncStatus::Error { .. } => "error",
        }
    }

    pub(crate) fn failed(error: SyncError) -> Self {
        SyncStatus::Error {
            message: error.to_string(),
            cause: Arc::new(error),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::InProgress => write!(f, "In progress"),
            SyncStatus::Success { message } => write!(f, "Success: {message}"),
            SyncStatus::Error { message, .. } => write!(f, "Error: {message}"),
        }
    }
}

/// Which side of the link a sync attempt runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    /// Package local logs and hand them to the transport.
    Send,
    /// Take a package from the transport and ingest it.
    Receive,
}

impl fmt::Display for SyncRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncRole::Send => f.write_str("send"),
            SyncRole::Receive => f.write_str("receive"),
        }
    }
}

impl FromStr for SyncRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "send" | "origin" | "sender" => Ok(SyncRole::Send),
            "receive" | "destination" | "receiver" => Ok(SyncRole::Receive),
            other => Err(format!("unknown sync role '{other}' (expected send or receive)")),
        }
    }
}
