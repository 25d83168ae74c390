//! Counters emitted by the control-plane client.

/// Sink for client counters.
pub trait ClientMetrics: Send + Sync {
    /// A heartbeat was acknowledged by the control plane.
    fn heartbeat_sent(&self);
    /// The reconnect loop scheduled another attempt.
    fn reconnect_attempt(&self);
    /// A command passed validation. `command_type` is already sanitized.
    fn command_received(&self, command_type: &'static str);
}

/// [`ClientMetrics`] backed by the `metrics` facade.
///
/// Counters are no-ops until the host application installs a recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRecorder;

impl ClientMetrics for MetricsRecorder {
    fn heartbeat_sent(&self) {
        ::metrics::counter!("fleetlink_agent_heartbeats_sent_total").increment(1);
    }

    fn reconnect_attempt(&self) {
        ::metrics::counter!("fleetlink_agent_reconnect_attempts_total").increment(1);
    }

    fn command_received(&self, command_type: &'static str) {
        ::metrics::counter!(
            "fleetlink_agent_commands_received_total",
            "command_type" => command_type
        )
        .increment(1);
    }
}
