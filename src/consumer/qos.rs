//! Per-session quality-of-service scoring.
//!
//! Three scores in `[0, 1]`, smoothed with an exponential moving average:
//! availability (success ratio), latency (observed versus the compute-unit
//! budget) and sync (serviced block lag versus the chain's allowed lag).
//! Session scores are aggregated per provider when the manager reports to
//! the payment layer.

use crate::config::TimeoutConfig;
use crate::types::QosReport;
use std::time::Duration;

/// Weight of the newest sample in the moving average.
const EMA_SAMPLE_WEIGHT: f64 = 0.125;

/// QoS state of a single session.
#[derive(Debug, Clone)]
pub struct QosInfo {
    /// Relays attempted on this session, successful or not.
    pub total_relays: u64,
    /// Relays that completed successfully.
    pub answered_relays: u64,
    availability: f64,
    latency: f64,
    sync: f64,
}

impl Default for QosInfo {
    fn default() -> Self {
        Self {
            total_relays: 0,
            answered_relays: 0,
            availability: 1.0,
            latency: 1.0,
            sync: 1.0,
        }
    }
}

impl QosInfo {
    fn smooth(current: f64, sample: f64) -> f64 {
        current * (1.0 - EMA_SAMPLE_WEIGHT) + sample * EMA_SAMPLE_WEIGHT
    }

    /// Record a failed relay.
    pub fn record_failure(&mut self) {
        self.total_relays += 1;
        self.availability = Self::smooth(self.availability, 0.0);
    }

    /// Record a successful relay.
    ///
    /// `sync_lag` is `expected_block - latest_serviced_block`; `allowed_lag`
    /// comes from the chain's block-time statistics.
    pub fn record_success(
        &mut self,
        cu: u64,
        latency: Duration,
        sync_lag: i64,
        allowed_lag: i64,
        timeouts: &TimeoutConfig,
    ) {
        self.total_relays += 1;
        self.answered_relays += 1;
        self.availability = Self::smooth(self.availability, 1.0);

        let expected = timeouts.local_node_time(cu)
            + Duration::from_millis(timeouts.average_world_latency_ms);
        let latency_sample = if latency.is_zero() {
            1.0
        } else {
            (expected.as_secs_f64() / latency.as_secs_f64()).min(1.0)
        };
        self.latency = Self::smooth(self.latency, latency_sample);

        let allowed = allowed_lag.max(1);
        let sync_sample = if sync_lag <= allowed {
            1.0
        } else {
            f64::from(u32::try_from(allowed).unwrap_or(1))
                / f64::from(u32::try_from(sync_lag).unwrap_or(u32::MAX))
        };
        self.sync = Self::smooth(self.sync, sync_sample);
    }

    /// Current smoothed scores.
    #[must_use]
    pub fn report(&self) -> QosReport {
        QosReport {
            availability: self.availability,
            latency: self.latency,
            sync: self.sync,
        }
    }
}

/// Average a set of session reports into a provider-level report.
#[must_use]
pub fn aggregate_reports(reports: &[QosReport]) -> Option<QosReport> {
    if reports.is_empty() {
        return None;
    }
    let n = reports.len() as f64;
    Some(QosReport {
        availability: reports.iter().map(|r| r.availability).sum::<f64>() / n,
        latency: reports.iter().map(|r| r.latency).sum::<f64>() / n,
        sync: reports.iter().map(|r| r.sync).sum::<f64>() / n,
    })
}
