//! Application orchestrator: wires the control-plane client and the transfer
//! service together and runs the agent's periodic loops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use fleetlink_control_plane::{
    AgentIdentity, ClientEvent, ConnectionState, ControlPlaneClient, PemCertificateStore,
    ReconnectPolicy, TlsConnector,
};
use fleetlink_protocol::messages::{CommandEnvelope, HeartbeatPayload};
use fleetlink_protocol::telemetry::{TelemetryEvent, TelemetryPayload};
use fleetlink_transfer::{FileTransferService, HttpTransferTransport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::dispatch;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared handles used by every loop.
struct Agent {
    client: ControlPlaneClient,
    transfers: Arc<FileTransferService>,
    node_id: Uuid,
    started: Instant,
    reconnect: ReconnectPolicy,
}

/// Runs the agent until Ctrl-C or an unrecoverable connect error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let identity = AgentIdentity::new(config.node_id, config.organization_id);
    if !identity.is_enrolled() {
        tracing::warn!("agent is not enrolled, commands will not be tenant-checked");
    }

    // -- Control plane --
    let mut connector = TlsConnector::new();
    if let Some(bundle) = &config.control_plane.ca_bundle {
        connector = connector
            .with_ca_bundle(bundle)
            .context("failed to load CA bundle")?;
    }
    let certificates = PemCertificateStore::new(
        config.certificate.chain_path.clone(),
        config.certificate.key_path.clone(),
    );
    let client = ControlPlaneClient::new(
        config.control_plane.options(),
        identity,
        Arc::new(connector),
        Arc::new(certificates),
    );
    let events = client
        .take_events()
        .context("control-plane events already taken")?;

    // -- Transfers --
    let transport = HttpTransferTransport::new(
        config.transfer.base_url()?,
        config.transfer.connect_timeout(),
        config.transfer.read_timeout(),
    )
    .context("failed to build transfer HTTP client")?;
    let transfers = Arc::new(FileTransferService::new(
        config.transfer.options(),
        Arc::new(transport),
    ));

    let agent = Arc::new(Agent {
        client,
        transfers,
        node_id: identity.node_id.unwrap_or_default(),
        started: Instant::now(),
        reconnect: config.control_plane.reconnect_policy(),
    });

    // -- Loops --
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(event_loop(
        Arc::clone(&agent),
        events,
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(heartbeat_loop(
        Arc::clone(&agent),
        config.control_plane.heartbeat_interval(),
        cancel.clone(),
    )));
    if config.control_plane.telemetry_enabled {
        tasks.push(tokio::spawn(telemetry_loop(
            Arc::clone(&agent),
            config.control_plane.telemetry_interval(),
            cancel.clone(),
        )));
    }

    tracing::info!(name = %config.name, "agent ready");

    let outcome = tokio::select! {
        result = connect_with_retry(&agent, &cancel) => {
            match result {
                Ok(()) => {
                    wait_for_shutdown().await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        _ = wait_for_shutdown() => Ok(()),
    };

    // -- Graceful shutdown --
    tracing::info!("stopping agent...");
    // Also cancels in-flight transfers: their tokens are children of `cancel`.
    cancel.cancel();
    if let Err(e) = agent.client.disconnect(&CancellationToken::new()).await {
        tracing::warn!(error = %e, "disconnect failed");
    }
    for task in tasks {
        let _ = task.await;
    }

    outcome
}

async fn wait_for_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("SIGINT received, shutting down");
}

/// Explicit connect, retried with backoff while the error is transient.
async fn connect_with_retry(agent: &Agent, cancel: &CancellationToken) -> anyhow::Result<()> {
    let mut attempt: u32 = 0;
    loop {
        match agent.client.connect(cancel).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                let delay = {
                    let mut rng = rand::thread_rng();
                    agent.reconnect.delay_for_attempt(attempt, &mut rng)
                };
                tracing::warn!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "control-plane connect failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e).context("control-plane connect failed"),
        }
    }
}

async fn event_loop(
    agent: Arc<Agent>,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            ClientEvent::StateChanged(change) => {
                tracing::info!(
                    previous = %change.previous,
                    current = %change.current,
                    error = change.error.as_deref().unwrap_or(""),
                    "control-plane state changed"
                );
                // Reconnect attempts exhausted: start over with an explicit connect.
                if change.current == ConnectionState::Failed && change.previous == ConnectionState::Reconnecting {
                    let agent = Arc::clone(&agent);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connect_with_retry(&agent, &cancel).await {
                            tracing::error!(error = %e, "control-plane reconnect abandoned");
                        }
                    });
                }
            }
            ClientEvent::CommandReceived(command) => {
                tokio::spawn(handle_command(Arc::clone(&agent), command, cancel.clone()));
            }
            ClientEvent::PingReceived => tracing::debug!("control-plane ping"),
        }
    }
}

async fn handle_command(agent: Arc<Agent>, command: CommandEnvelope, cancel: CancellationToken) {
    tracing::info!(
        command_id = %command.command_id,
        command_type = %command.command_type,
        "executing command"
    );
    let result = dispatch::execute(&command, &agent.transfers, &cancel).await;
    if !agent.client.send_command_result(&result, &cancel).await {
        tracing::warn!(command_id = %command.command_id, "command result not acknowledged");
    }
}

async fn heartbeat_loop(agent: Arc<Agent>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let heartbeat = HeartbeatPayload {
            node_id: agent.node_id,
            timestamp: Utc::now(),
            agent_version: AGENT_VERSION.to_string(),
            uptime_secs: agent.started.elapsed().as_secs(),
            metrics: [(
                "activeTransfers".to_string(),
                agent.transfers.active_transfers().len() as f64,
            )]
            .into_iter()
            .collect(),
        };
        if let Err(e) = agent.client.send_heartbeat(&heartbeat, &cancel).await {
            tracing::warn!(error = %e, "heartbeat failed");
        }
    }
}

async fn telemetry_loop(agent: Arc<Agent>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let payload = telemetry_snapshot(&agent);
        agent.client.send_telemetry(&payload, &cancel).await;
    }
}

fn telemetry_snapshot(agent: &Agent) -> TelemetryPayload {
    let mut payload = TelemetryPayload::new(agent.node_id);
    let active = agent.transfers.active_transfers();
    payload
        .metrics
        .insert("uptimeSecs".into(), agent.started.elapsed().as_secs() as f64);
    payload
        .metrics
        .insert("activeTransfers".into(), active.len() as f64);
    for state in active {
        let mut event = TelemetryEvent::info("transfer.active")
            .with("transferId", state.transfer_id.to_string())
            .with("direction", state.direction.as_str())
            .with("status", format!("{:?}", state.status));
        if let Some(progress) = state.progress {
            event = event.with("bytes", progress.bytes_transferred.to_string());
        }
        payload.events.push(event);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlink_control_plane::ControlPlaneOptions;
    use fleetlink_transfer::FileTransferOptions;

    fn agent() -> Agent {
        let client = ControlPlaneClient::new(
            ControlPlaneOptions::default(),
            AgentIdentity::default(),
            Arc::new(TlsConnector::new()),
            Arc::new(PemCertificateStore::new(None, None)),
        );
        let transport =
            HttpTransferTransport::new(None, Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        Agent {
            client,
            transfers: Arc::new(FileTransferService::new(
                FileTransferOptions::default(),
                Arc::new(transport),
            )),
            node_id: Uuid::new_v4(),
            started: Instant::now(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[test]
    fn idle_telemetry_has_metrics_only() {
        let agent = agent();
        let payload = telemetry_snapshot(&agent);
        assert_eq!(payload.node_id, agent.node_id);
        assert_eq!(payload.metrics.get("activeTransfers"), Some(&0.0));
        assert!(payload.metrics.contains_key("uptimeSecs"));
        assert!(payload.events.is_empty());
    }

    #[tokio::test]
    async fn connect_with_insecure_endpoint_is_not_retried() {
        let mut agent = agent();
        agent.client = ControlPlaneClient::new(
            ControlPlaneOptions {
                endpoint: "ws://cp.example.com".into(),
                ..ControlPlaneOptions::default()
            },
            AgentIdentity::default(),
            Arc::new(TlsConnector::new()),
            Arc::new(PemCertificateStore::new(None, None)),
        );
        let result = connect_with_retry(&agent, &CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(agent.client.state(), ConnectionState::Failed);
    }
}
