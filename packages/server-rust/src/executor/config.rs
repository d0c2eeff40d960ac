use std::time::Duration;

use gridline_core::DEFAULT_PARTITION_COUNT;

use super::ExecutorError;

/// Sizing and timing configuration for the operation executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identifier of this node. Prefixes thread names when non-empty.
    pub node_id: String,
    /// Number of partitions. Configurable for testing; defaults to
    /// `DEFAULT_PARTITION_COUNT` (271).
    pub partition_count: u32,
    /// Number of partition threads. Partition `p` is owned by thread
    /// `p % partition_thread_count`.
    pub partition_thread_count: usize,
    /// Number of generic threads.
    pub generic_thread_count: usize,
    /// Capacity of each normal lane.
    pub queue_capacity: usize,
    /// Urgent lane capacity is `queue_capacity * urgent_capacity_multiplier`.
    pub urgent_capacity_multiplier: usize,
    /// Whether generic operations may run inline on non-operation threads.
    pub ad_hoc_enabled: bool,
    /// Runners busy with one task for longer than this are reported as slow.
    pub slow_operation_threshold: Duration,
    /// Interval between slow-operation scans.
    pub monitor_interval: Duration,
    /// Upper bound on how long shutdown waits for submitters and threads.
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let partition_thread_count = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self {
            node_id: String::new(),
            partition_count: DEFAULT_PARTITION_COUNT,
            partition_thread_count,
            generic_thread_count: (partition_thread_count / 2).max(2),
            queue_capacity: 100_000,
            urgent_capacity_multiplier: 10,
            ad_hoc_enabled: true,
            slow_operation_threshold: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub fn urgent_capacity(&self) -> usize {
        self.queue_capacity
            .saturating_mul(self.urgent_capacity_multiplier)
    }

    /// Prefix used for thread names: the node id, or `gridline`.
    #[must_use]
    pub fn thread_name_prefix(&self) -> &str {
        if self.node_id.is_empty() {
            "gridline"
        } else {
            &self.node_id
        }
    }

    /// Checks the configuration for values the executor cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError::InvalidConfig` naming the offending field.
    pub fn validate(&self) -> Result<(), ExecutorError> {
        let invalid = |reason: &str| Err(ExecutorError::InvalidConfig(reason.to_string()));
        if self.partition_count == 0 {
            return invalid("partition_count must be at least 1");
        }
        if i32::try_from(self.partition_count).is_err() {
            return invalid("partition_count must fit in a wire partition id");
        }
        if self.partition_thread_count == 0 {
            return invalid("partition_thread_count must be at least 1");
        }
        if self.generic_thread_count == 0 {
            return invalid("generic_thread_count must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.urgent_capacity_multiplier == 0 {
            return invalid("urgent_capacity_multiplier must be at least 1");
        }
        if self.monitor_interval.is_zero() {
            return invalid("monitor_interval must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partition_count, 271);
        assert!(config.partition_thread_count >= 1);
        assert!(config.generic_thread_count >= 2);
        assert_eq!(config.urgent_capacity(), 1_000_000);
        assert_eq!(config.thread_name_prefix(), "gridline");
    }

    #[test]
    fn node_id_prefixes_thread_names() {
        let config = ExecutorConfig {
            node_id: "node-a".to_string(),
            ..ExecutorConfig::default()
        };
        assert_eq!(config.thread_name_prefix(), "node-a");
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let cases = [
            ExecutorConfig {
                partition_count: 0,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                partition_count: u32::MAX,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                partition_thread_count: 0,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                generic_thread_count: 0,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                queue_capacity: 0,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                urgent_capacity_multiplier: 0,
                ..ExecutorConfig::default()
            },
            ExecutorConfig {
                monitor_interval: Duration::ZERO,
                ..ExecutorConfig::default()
            },
        ];
        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(ExecutorError::InvalidConfig(_))
            ));
        }
    }
}
