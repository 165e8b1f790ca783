//! Tuning knobs for the dispatcher and the scheduler loop.

use std::time::Duration;

use uuid::Uuid;

use crate::EngineError;

/// Settings applied when a trigger creates an enrollment.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Failed attempts allowed per node before the enrollment is exited.
    pub max_retries: i32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

/// Settings for [`crate::Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between two ticks of [`crate::Scheduler::run`].
    pub poll_interval: Duration,
    /// Maximum number of enrollments claimed per tick.
    pub batch_size: i64,
    /// Upper bound on one collaborator call (send, list change, lookup).
    pub send_timeout: Duration,
    /// Back-off after the first failure; doubled for every further one.
    pub retry_base_delay: Duration,
    /// Cap on the back-off.
    pub max_retry_delay: Duration,
    /// How long a claimed row stays reserved for this instance. Renewed right
    /// before each step, so it must outlast one step: a contact lookup plus
    /// one side effect, each bounded by `send_timeout`.
    pub lease_duration: Duration,
    /// Written to `locked_by`; unique per running scheduler.
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            send_timeout: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(60),
            max_retry_delay: Duration::from_secs(3600),
            lease_duration: Duration::from_secs(300),
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
        }
    }
}

impl SchedulerConfig {
    /// Reject settings the scheduler loop cannot honour.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.poll_interval.is_zero() {
            return Err(EngineError::InvalidConfig("poll_interval must be positive".into()));
        }
        if self.batch_size < 1 {
            return Err(EngineError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.instance_id.is_empty() {
            return Err(EngineError::InvalidConfig("instance_id must not be empty".into()));
        }
        let step = self.send_timeout.saturating_mul(2);
        if self.lease_duration <= step {
            return Err(EngineError::InvalidConfig(format!(
                "lease_duration ({:?}) must exceed two send timeouts ({:?})",
                self.lease_duration, step
            )));
        }
        Ok(())
    }

    /// Back-off before the `retry_count`-th retry (1-based):
    /// `retry_base_delay * 2^(retry_count - 1)`, capped at `max_retry_delay`.
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let exponent = u32::try_from(retry_count.saturating_sub(1)).unwrap_or(0).min(31);
        self.retry_base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_retry_delay, |d| d.min(self.max_retry_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SchedulerConfig {
            retry_base_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(35),
            ..SchedulerConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_secs(10));
        assert_eq!(config.backoff(2), Duration::from_secs(20));
        assert_eq!(config.backoff(3), Duration::from_secs(35));
        assert_eq!(config.backoff(40), Duration::from_secs(35));
    }

    #[test]
    fn defaults_are_valid() {
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn lease_must_outlast_a_step() {
        let config = SchedulerConfig {
            send_timeout: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidConfig(_))));

        let zero_poll =
            SchedulerConfig { poll_interval: Duration::ZERO, ..SchedulerConfig::default() };
        assert!(matches!(zero_poll.validate(), Err(EngineError::InvalidConfig(_))));

        let no_batch = SchedulerConfig { batch_size: 0, ..SchedulerConfig::default() };
        assert!(matches!(no_batch.validate(), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn instances_get_distinct_ids() {
        assert_ne!(SchedulerConfig::default().instance_id, SchedulerConfig::default().instance_id);
    }
}
