//! Engine configuration.

use crate::params::DEFAULT_MAX_THREADGROUPS;

/// Environment variable overriding [`SortConfig::max_thread_groups`].
pub const MAX_THREADGROUPS_ENV: &str = "PARALLEL_SORT_MAX_THREADGROUPS";

/// Tuning knobs for a [`ParallelSort`](crate::ParallelSort) engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortConfig {
    /// Upper bound on Count/Scatter thread groups per dispatch. Larger inputs
    /// hand several blocks to each group instead of launching more groups.
    pub max_thread_groups: u32,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            max_thread_groups: DEFAULT_MAX_THREADGROUPS,
        }
    }
}

impl SortConfig {
    pub fn with_max_thread_groups(mut self, max_thread_groups: u32) -> Self {
        self.max_thread_groups = max_thread_groups;
        self
    }

    /// Defaults, overridden by `PARALLEL_SORT_MAX_THREADGROUPS` when it holds
    /// a positive integer.
    pub fn from_env() -> Self {
        let config = Self::default();
        match std::env::var(MAX_THREADGROUPS_ENV) {
            Ok(value) => match Self::parse_budget(&value) {
                Some(budget) => config.with_max_thread_groups(budget),
                None => {
                    log::warn!(
                        "ignoring {}={:?}: expected a positive integer",
                        MAX_THREADGROUPS_ENV,
                        value
                    );
                    config
                }
            },
            Err(_) => config,
        }
    }

    fn parse_budget(value: &str) -> Option<u32> {
        value.trim().parse().ok().filter(|&budget| budget > 0)
    }
}
