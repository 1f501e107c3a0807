//! Engine configuration.

use std::time::Duration;

use faultline_table::MAX_DELAY_MS;

/// Configuration for an [`crate::Engine`], with `with_*` builders.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Seed for the engine RNG driving RANDOM / TRANS_RND draws and table
    /// randomization. Fixed seed, reproducible run.
    pub seed: u64,
    /// Permit parity-of-checksum (1POC) records in loaded tables.
    pub poc_injection: bool,
    /// Skip CORRUPT_CRC records entirely (some stacks treat a lone bad
    /// checksum over good data as benign).
    pub ignore_corrupt_crc_data_errors: bool,
    /// Lift the spare-class type restriction for every object.
    pub unrestricted_spare_injection: bool,
    /// Hard ceiling on any single delay, clamping what a record asks for.
    pub max_delay: Duration,
    /// Poll ceiling of the delay worker; bounds cancellation latency.
    pub poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            poc_injection: true,
            ignore_corrupt_crc_data_errors: false,
            unrestricted_spare_injection: false,
            max_delay: Duration::from_millis(u64::from(MAX_DELAY_MS)),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_poc_injection(mut self, poc_injection: bool) -> Self {
        self.poc_injection = poc_injection;
        self
    }

    pub fn with_ignore_corrupt_crc_data_errors(mut self, ignore: bool) -> Self {
        self.ignore_corrupt_crc_data_errors = ignore;
        self
    }

    pub fn with_unrestricted_spare_injection(mut self, unrestricted: bool) -> Self {
        self.unrestricted_spare_injection = unrestricted;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}
