//! Probe classification and per-server health records.

pub(crate) mod monitor;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::config::HealthConfig;

/// Outcome class of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// What a probe observed, before classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The session has no live channel
    NoChannel,
    /// The ping failed or went unanswered
    Failed(String),
    /// The server answered the ping
    Answered {
        latency: Duration,
        /// Required capabilities whose list method failed
        missing_required: Vec<String>,
        /// Other advertised capabilities whose list method failed
        missing_optional: Vec<String>,
    },
}

impl ProbeOutcome {
    pub fn latency(&self) -> Option<Duration> {
        match self {
            ProbeOutcome::Answered { latency, .. } => Some(*latency),
            _ => None,
        }
    }
}

/// Classifies a probe outcome against the configured thresholds.
pub fn classify(outcome: &ProbeOutcome, config: &HealthConfig) -> HealthStatus {
    match outcome {
        ProbeOutcome::NoChannel | ProbeOutcome::Failed(_) => HealthStatus::Unhealthy,
        ProbeOutcome::Answered {
            latency,
            missing_required,
            missing_optional,
        } => {
            if *latency >= config.degraded_latency || !missing_required.is_empty() {
                HealthStatus::Unhealthy
            } else if *latency >= config.healthy_latency || !missing_optional.is_empty() {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
    }
}

/// One recorded probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSample {
    pub status: HealthStatus,
    pub latency: Option<Duration>,
    pub at: DateTime<Utc>,
}

impl ProbeSample {
    pub fn new(status: HealthStatus, latency: Option<Duration>) -> Self {
        Self {
            status,
            latency,
            at: Utc::now(),
        }
    }
}

/// Rolling probe history of one server.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    status: Option<HealthStatus>,
    consecutive_failures: u32,
    last_latency: Option<Duration>,
    last_success: Option<DateTime<Utc>>,
    window: VecDeque<ProbeSample>,
    capacity: usize,
}

impl HealthRecord {
    pub fn new(capacity: usize) -> Self {
        Self {
            status: None,
            consecutive_failures: 0,
            last_latency: None,
            last_success: None,
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a probe and returns the consecutive-failure count.
    pub fn record(&mut self, sample: ProbeSample) -> u32 {
        match sample.status {
            HealthStatus::Unhealthy => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            HealthStatus::Healthy | HealthStatus::Degraded => {
                self.consecutive_failures = 0;
                self.last_success = Some(sample.at);
            }
        }
        if sample.latency.is_some() {
            self.last_latency = sample.latency;
        }
        self.status = Some(sample.status);

        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.consecutive_failures
    }

    /// Starts counting failures from zero again, leaving the probe history
    /// untouched.
    pub fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Status of the latest probe; `None` before the first one.
    pub fn status(&self) -> Option<HealthStatus> {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    pub fn samples(&self) -> impl Iterator<Item = &ProbeSample> {
        self.window.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answered(ms: u64) -> ProbeOutcome {
        ProbeOutcome::Answered {
            latency: Duration::from_millis(ms),
            missing_required: vec![],
            missing_optional: vec![],
        }
    }

    #[test]
    fn test_classification_thresholds() {
        let config = HealthConfig::default();
        assert_eq!(classify(&answered(20), &config), HealthStatus::Healthy);
        assert_eq!(classify(&answered(1500), &config), HealthStatus::Degraded);
        assert_eq!(classify(&answered(5000), &config), HealthStatus::Unhealthy);
        assert_eq!(classify(&ProbeOutcome::NoChannel, &config), HealthStatus::Unhealthy);
        assert_eq!(
            classify(&ProbeOutcome::Failed("timeout".into()), &config),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_missing_capabilities() {
        let config = HealthConfig::default();
        let optional = ProbeOutcome::Answered {
            latency: Duration::from_millis(5),
            missing_required: vec![],
            missing_optional: vec!["prompts".into()],
        };
        assert_eq!(classify(&optional, &config), HealthStatus::Degraded);

        let required = ProbeOutcome::Answered {
            latency: Duration::from_millis(5),
            missing_required: vec!["tools".into()],
            missing_optional: vec![],
        };
        assert_eq!(classify(&required, &config), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_healthy_probes_never_touch_the_counter() {
        let mut record = HealthRecord::new(4);
        for _ in 0..10 {
            assert_eq!(record.record(ProbeSample::new(HealthStatus::Healthy, Some(Duration::from_millis(3)))), 0);
        }
        assert_eq!(record.samples().count(), 4);
        assert!(record.last_success().is_some());
    }

    #[test]
    fn test_failures_accumulate_until_a_success() {
        let mut record = HealthRecord::new(8);
        assert_eq!(record.record(ProbeSample::new(HealthStatus::Unhealthy, None)), 1);
        assert_eq!(record.record(ProbeSample::new(HealthStatus::Unhealthy, None)), 2);
        assert_eq!(record.record(ProbeSample::new(HealthStatus::Degraded, Some(Duration::from_secs(2)))), 0);
        assert_eq!(record.status(), Some(HealthStatus::Degraded));
        assert_eq!(record.last_latency(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_reset_failures_keeps_the_probe_history() {
        let mut record = HealthRecord::new(8);
        record.record(ProbeSample::new(HealthStatus::Unhealthy, None));
        record.record(ProbeSample::new(HealthStatus::Unhealthy, None));

        record.reset_failures();

        assert_eq!(record.consecutive_failures(), 0);
        assert_eq!(record.status(), Some(HealthStatus::Unhealthy));
        assert_eq!(record.samples().count(), 2);
        assert!(record.last_success().is_none());
        assert_eq!(record.record(ProbeSample::new(HealthStatus::Unhealthy, None)), 1);
    }
}
