//! Router configuration

/// Per-router options
///
/// Passed at construction; there is no process-global configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Floor for aggregated REMB targets, bits per second
    pub min_bandwidth: u64,

    /// Ceiling for aggregated REMB targets, bits per second (0 = default
    /// ceiling)
    pub max_bandwidth: u64,

    /// Aggregate subscriber REMB reports and relay them to the publisher
    pub remb_feedback: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            min_bandwidth: 10_000,
            max_bandwidth: 100_000_000,
            remb_feedback: false,
        }
    }
}

impl RouterConfig {
    /// Set the REMB floor
    pub fn min_bandwidth(mut self, bps: u64) -> Self {
        self.min_bandwidth = bps;
        self
    }

    /// Set the REMB ceiling
    pub fn max_bandwidth(mut self, bps: u64) -> Self {
        self.max_bandwidth = bps;
        self
    }

    /// Enable REMB aggregation
    pub fn remb_feedback(mut self, on: bool) -> Self {
        self.remb_feedback = on;
        self
    }
}
