//! Executes validated commands and builds the result reported back.

use std::sync::Arc;

use fleetlink_control_plane::sanitize_command_type;
use fleetlink_protocol::constants::{COMMAND_DOWNLOAD_FILE, COMMAND_PING, COMMAND_UPLOAD_FILE};
use fleetlink_protocol::messages::{
    CommandEnvelope, CommandResult, DownloadFileCommand, UploadFileCommand,
};
use fleetlink_transfer::{
    FileTransferProgress, FileTransferResult, FileTransferService, ProgressCallback,
    TransferError,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

/// Runs `command` and returns its outcome. Never fails: every error becomes
/// a failed [`CommandResult`] with a message safe to send to the control
/// plane.
pub async fn execute(
    command: &CommandEnvelope,
    transfers: &FileTransferService,
    cancel: &CancellationToken,
) -> CommandResult {
    let id = command.command_id;
    let node = command.node_id;

    // Same case-insensitive binding the command counters use.
    match sanitize_command_type(&command.command_type) {
        COMMAND_PING => CommandResult::success(id, node, None),
        COMMAND_DOWNLOAD_FILE => {
            let Some(request) = parse::<DownloadFileCommand>(command) else {
                return CommandResult::failure(id, node, "invalid DownloadFile payload");
            };
            let outcome = transfers
                .download(request.into(), Some(progress_logger()), cancel)
                .await;
            transfer_result(command, outcome)
        }
        COMMAND_UPLOAD_FILE => {
            let Some(request) = parse::<UploadFileCommand>(command) else {
                return CommandResult::failure(id, node, "invalid UploadFile payload");
            };
            let outcome = transfers
                .upload(request.into(), Some(progress_logger()), cancel)
                .await;
            transfer_result(command, outcome)
        }
        other => {
            tracing::debug!(
                command_type = other,
                raw = %command.command_type,
                "command not handled by this agent"
            );
            CommandResult::failure(id, node, "unsupported command type")
        }
    }
}

fn parse<T: DeserializeOwned>(command: &CommandEnvelope) -> Option<T> {
    match serde_json::from_value(command.payload.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(
                command_id = %command.command_id,
                command_type = %command.command_type,
                error = %e,
                "malformed command payload"
            );
            None
        }
    }
}

fn transfer_result(
    command: &CommandEnvelope,
    outcome: Result<FileTransferResult, TransferError>,
) -> CommandResult {
    let id = command.command_id;
    let node = command.node_id;
    match outcome {
        Ok(result) => match serde_json::to_value(&result) {
            Ok(output) => CommandResult::success(id, node, Some(output)),
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize transfer result");
                CommandResult::success(id, node, None)
            }
        },
        Err(e) => CommandResult::failure(id, node, format!("{}: {e}", e.code())),
    }
}

fn progress_logger() -> ProgressCallback {
    Arc::new(|p: FileTransferProgress| {
        tracing::trace!(
            transfer_id = %p.transfer_id,
            bytes = p.bytes_transferred,
            total = ?p.total_bytes,
            rate = p.bytes_per_second,
            "transfer progress"
        );
    })
}
