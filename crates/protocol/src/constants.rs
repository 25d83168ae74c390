use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Path of the agent hub on the control-plane endpoint.
pub const HUB_PATH: &str = "/hubs/agent";

/// Default time to complete the connection handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single outbound call (heartbeat, result, telemetry).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval between keep-alive pings.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default server-silence timeout.
///
/// Any inbound frame resets the deadline. If nothing arrives within this
/// window the connection is considered dead and reconnection starts.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum WebSocket message size in bytes (1 MiB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum size of a raw command, measured in UTF-8 bytes (256 KiB).
pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 256 * 1024;

/// Maximum nesting depth of a command's JSON document.
pub const MAX_COMMAND_DEPTH: usize = 64;

/// Command types longer than this are bucketed as [`UNKNOWN_COMMAND_TYPE`].
pub const MAX_COMMAND_TYPE_LEN: usize = 64;

/// Metric bucket for command types outside [`KNOWN_COMMAND_TYPES`].
pub const UNKNOWN_COMMAND_TYPE: &str = "Unknown";

/// Command types the agent understands.
pub const KNOWN_COMMAND_TYPES: &[&str] = &[
    "Ping",
    "Restart",
    "Shutdown",
    "UpdateConfiguration",
    "DownloadFile",
    "UploadFile",
    "ExecuteScript",
    "CollectDiagnostics",
    "UpdateAgent",
    "RotateCertificate",
];

/// Liveness probe sent as a command.
pub const COMMAND_PING: &str = "Ping";

/// Command type requesting a file download.
pub const COMMAND_DOWNLOAD_FILE: &str = "DownloadFile";

/// Command type requesting a file upload.
pub const COMMAND_UPLOAD_FILE: &str = "UploadFile";

/// Target of a frame: a hub method the agent invokes or a push from the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    // Agent to control plane
    SendHeartbeat,
    SendCommandResult,
    SendTelemetry,

    // Control plane to agent
    ReceiveCommand,
    ReceivePing,

    /// Reply to an invocation, correlated by frame id.
    Completion,

    /// Any target this agent does not know about.
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_serializes_as_plain_name() {
        let json = serde_json::to_string(&Method::ReceiveCommand).unwrap();
        assert_eq!(json, "\"ReceiveCommand\"");
    }

    #[test]
    fn unknown_method_deserializes_to_catch_all() {
        let m: Method = serde_json::from_str("\"ReceiveSomethingNew\"").unwrap();
        assert_eq!(m, Method::Unknown);
    }

    #[test]
    fn command_limits_are_consistent() {
        assert!(MAX_COMMAND_PAYLOAD_BYTES < WS_MAX_MESSAGE_SIZE);
        assert!(
            KNOWN_COMMAND_TYPES
                .iter()
                .all(|t| !t.is_empty() && t.len() <= MAX_COMMAND_TYPE_LEN)
        );
        assert!(KNOWN_COMMAND_TYPES.contains(&COMMAND_DOWNLOAD_FILE));
        assert!(KNOWN_COMMAND_TYPES.contains(&COMMAND_UPLOAD_FILE));
    }
}
