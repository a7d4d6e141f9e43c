//! Health and metrics snapshots.

use hm_pipeline::DispatcherStats;
use serde::{Deserialize, Serialize};

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some issues detected but operational.
    Warning,
    /// Significant issues affecting operations.
    Degraded,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub outbox_pending: usize,
    pub outbox_failed: usize,
    pub scheduled_pending: usize,
    pub active_queue_workers: usize,
    pub dead_letter_count: usize,
    pub in_flight_dispatches: usize,
    pub issues: Vec<String>,
}

/// Point-in-time counters across the facade's components.
#[derive(Debug, Clone, Default)]
pub struct MessagingMetrics {
    pub dispatcher: DispatcherStats,
    pub outbox_published: u64,
    pub outbox_retried: u64,
    pub outbox_dead_lettered: u64,
    pub scheduler_delivered: u64,
    pub scheduler_failed: u64,
    pub queue_acked: u64,
    pub queue_nacked: u64,
}
