use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Control plane -> agent
// ---------------------------------------------------------------------------

/// An instruction pushed from the control plane.
///
/// The agent never deserializes this type straight off the wire: inbound
/// commands go through the validator in the control-plane client, which
/// builds the envelope only after size, depth and tenant checks pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub command_type: String,
    pub node_id: Uuid,
    pub organization_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Returns `true` if the command expired before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Payload of a `DownloadFile` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileCommand {
    pub transfer_id: Uuid,
    pub source_url: String,
    pub destination_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
}

/// Payload of an `UploadFile` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFileCommand {
    pub transfer_id: Uuid,
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Agent -> control plane
// ---------------------------------------------------------------------------

/// Periodic liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub node_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub agent_version: String,
    pub uptime_secs: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metrics: HashMap<String, f64>,
}

/// Outcome of a command, reported back to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command_id: Uuid,
    pub node_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    /// Builds a successful result.
    pub fn success(command_id: Uuid, node_id: Uuid, output: Option<serde_json::Value>) -> Self {
        Self {
            command_id,
            node_id,
            success: true,
            output,
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Builds a failed result with a short, caller-safe message.
    pub fn failure(command_id: Uuid, node_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            command_id,
            node_id,
            success: false,
            output: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }
}

/// Response body of `POST /files/upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadResponse {
    pub file_id: String,
}
