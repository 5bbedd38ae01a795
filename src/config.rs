//! Engine configuration.

/// Tunables for staleness detection, retries, and write policy.
///
/// # Example
/// ```
/// use relume::config::EngineConfig;
///
/// let config = EngineConfig::new()
///     .with_full_refresh_ratio(0.5)
///     .with_default_max_retries(2);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Stale-partition fraction above which an incremental refresh is
    /// upgraded to a full refresh. The upgrade fires only when the ratio
    /// strictly exceeds this value.
    pub full_refresh_ratio: f64,
    /// Retry budget for transient execution failures, used when a task
    /// does not set its own.
    pub default_max_retries: u32,
    /// Completed runs retained per task, oldest evicted first.
    pub run_history_limit: usize,
    /// Allow writes to externally-registered (unmanaged) table instances.
    pub allow_unmanaged_sink_writes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            full_refresh_ratio: 0.3,
            default_max_retries: 1,
            run_history_limit: 100,
            allow_unmanaged_sink_writes: false,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the full-refresh upgrade threshold.
    ///
    /// # Panics
    /// Panics if the ratio is outside `[0.0, 1.0]`.
    pub fn with_full_refresh_ratio(mut self, ratio: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&ratio),
            "full_refresh_ratio must be between 0.0 and 1.0, got {}",
            ratio
        );
        self.full_refresh_ratio = ratio;
        self
    }

    /// Set the default retry budget for transient failures.
    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    /// Set the number of completed runs retained per task.
    ///
    /// # Panics
    /// Panics if the limit is 0.
    pub fn with_run_history_limit(mut self, limit: usize) -> Self {
        assert!(limit > 0, "run_history_limit must be at least 1");
        self.run_history_limit = limit;
        self
    }

    /// Allow or forbid writes to unmanaged external table instances.
    pub fn with_unmanaged_sink_writes(mut self, allow: bool) -> Self {
        self.allow_unmanaged_sink_writes = allow;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.full_refresh_ratio, 0.3);
        assert_eq!(config.default_max_retries, 1);
        assert_eq!(config.run_history_limit, 100);
        assert!(!config.allow_unmanaged_sink_writes);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_full_refresh_ratio(0.4)
            .with_default_max_retries(3)
            .with_run_history_limit(10)
            .with_unmanaged_sink_writes(true);
        assert_eq!(config.full_refresh_ratio, 0.4);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.run_history_limit, 10);
        assert!(config.allow_unmanaged_sink_writes);
    }

    #[test]
    #[should_panic(expected = "full_refresh_ratio")]
    fn test_ratio_out_of_range() {
        EngineConfig::new().with_full_refresh_ratio(1.5);
    }
}
