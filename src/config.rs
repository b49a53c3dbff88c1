use std::time::Duration;

/// Default backoff exponent ceiling: retry waits cap at 2^5 = 32 seconds.
pub const DEFAULT_MAX_WAIT_EXPONENT: u32 = 5;

/// Extra attempts granted past the exponent ceiling before giving up.
pub const ATTEMPTS_PAST_CEILING: u32 = 7;

/// Engine configuration
///
/// All values are fixed at engine construction; there is no runtime
/// reconfiguration surface.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backoff ceiling: retry wait is `2^min(attempts, max_wait_exponent)` seconds
    pub max_wait_exponent: u32,

    /// Attempts before a retryable operation is abandoned
    pub max_attempts: u32,

    /// Requests held back from routine work for emergency operations
    pub reserved_emergency_budget: i64,

    /// Minimum quiet period between auto-saves of the same record
    pub auto_save_interval: Duration,

    /// Global auto-save switch (overridable per store)
    pub auto_save_enabled: bool,

    /// Flush all resident records through emergency saves on shutdown
    pub flush_on_shutdown: bool,

    /// Scheduler tick period
    pub tick_interval: Duration,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self {
            max_wait_exponent: DEFAULT_MAX_WAIT_EXPONENT,
            max_attempts: DEFAULT_MAX_WAIT_EXPONENT + ATTEMPTS_PAST_CEILING,
            reserved_emergency_budget: 5,
            auto_save_interval: Duration::from_secs(30),
            auto_save_enabled: true,
            flush_on_shutdown: true,
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Set the backoff exponent ceiling; also rederives `max_attempts`
    /// as ceiling + 7 (override afterwards with `with_max_attempts`).
    pub fn with_max_wait_exponent(mut self, exponent: u32) -> Self {
        self.max_wait_exponent = exponent;
        self.max_attempts = exponent + ATTEMPTS_PAST_CEILING;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_reserved_emergency_budget(mut self, budget: i64) -> Self {
        self.reserved_emergency_budget = budget;
        self
    }

    pub fn with_auto_save_interval(mut self, interval: Duration) -> Self {
        self.auto_save_interval = interval;
        self
    }

    pub fn with_auto_save_enabled(mut self, enabled: bool) -> Self {
        self.auto_save_enabled = enabled;
        self
    }

    pub fn with_flush_on_shutdown(mut self, flush: bool) -> Self {
        self.flush_on_shutdown = flush;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_max_attempts_follows_exponent() {
        let config = EngineConfig::new().with_max_wait_exponent(3);
        assert_eq!(config.max_attempts, 10);

        let config = config.with_max_attempts(4);
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.max_wait_exponent, 3);
    }
}
