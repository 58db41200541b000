//! Deployment session handle (§4.1 `createDeploymentSession`, §6.1).

use serde::Deserialize;

/// Opaque session returned by the store's config server.
///
/// All subsequent file operations against `content_base_url` MUST go through
/// the same `reqwest::Client` (cookie-based stickiness to the session's node).
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentSession {
    #[serde(rename = "content")]
    pub content_base_url: String,
    #[serde(rename = "prepared")]
    pub prepare_url: String,
    #[serde(rename = "session-id")]
    pub session_id: String,
}
