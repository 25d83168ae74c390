use crate::types::TransferDirection;

/// Counters recorded by the transfer service.
pub trait TransferMetrics: Send + Sync {
    fn bytes_transferred(&self, direction: TransferDirection, bytes: u64);

    fn transfer_completed(&self, direction: TransferDirection);
}

/// Records through the `metrics` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsRecorder;

impl TransferMetrics for MetricsRecorder {
    fn bytes_transferred(&self, direction: TransferDirection, bytes: u64) {
        ::metrics::counter!(
            "fleetlink_agent_transfer_bytes_total",
            "direction" => direction.as_str()
        )
        .increment(bytes);
    }

    fn transfer_completed(&self, direction: TransferDirection) {
        ::metrics::counter!(
            "fleetlink_agent_transfers_completed_total",
            "direction" => direction.as_str()
        )
        .increment(1);
    }
}
