//! Readiness summary returned once the server announces its endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Everything a test needs to talk to a freshly started server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ReadyInfo {
    /// Harness session that produced the server.
    pub session_id: String,
    /// Endpoint parsed from the readiness marker.
    pub url: Url,
    /// Identifier written by the build sub-run.
    pub build_id: String,
    /// When the readiness marker was observed.
    pub ready_at: DateTime<Utc>,
}
