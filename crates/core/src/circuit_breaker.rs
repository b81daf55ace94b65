//! Worker circuit breakers.
//!
//! Breakers only decide; they never stop anything themselves. The worker loop
//! consults [`CircuitBreakers::is_open`] after each settled item and stops
//! polling when it turns true.

use std::time::{Duration, Instant};

use crate::config::QueueConfig;

/// A single stop policy, scoped to one worker process.
#[derive(Debug, Clone)]
pub enum CircuitBreaker {
    /// Never opens.
    Disabled,
    /// Opens after `max` failures in a row; any success resets the streak.
    MaxConsecutiveFailures { max: u32, consecutive_failures: u32 },
    /// Opens once `max_duration` has elapsed since `started_at`.
    Timeout {
        started_at: Instant,
        max_duration: Duration,
    },
}

impl CircuitBreaker {
    pub fn max_consecutive_failures(max: u32) -> Self {
        Self::MaxConsecutiveFailures {
            max,
            consecutive_failures: 0,
        }
    }

    pub fn timeout(max_duration: Duration) -> Self {
        Self::Timeout {
            started_at: Instant::now(),
            max_duration,
        }
    }

    pub fn report_failure(&mut self) {
        if let Self::MaxConsecutiveFailures {
            consecutive_failures,
            ..
        } = self
        {
            *consecutive_failures = consecutive_failures.saturating_add(1);
        }
    }

    pub fn report_success(&mut self) {
        if let Self::MaxConsecutiveFailures {
            consecutive_failures,
            ..
        } = self
        {
            *consecutive_failures = 0;
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Self::Disabled => false,
            Self::MaxConsecutiveFailures {
                max,
                consecutive_failures,
            } => consecutive_failures >= max,
            Self::Timeout {
                started_at,
                max_duration,
            } => started_at.elapsed() >= *max_duration,
        }
    }

    /// Human-readable reason, for the log line emitted when the worker stops.
    pub fn describe(&self) -> String {
        match self {
            Self::Disabled => "disabled".to_string(),
            Self::MaxConsecutiveFailures { max, .. } => {
                format!("{max} consecutive failures")
            }
            Self::Timeout { max_duration, .. } => {
                format!("max duration of {max_duration:?} reached")
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::Disabled
    }
}

/// The set of breakers a worker honors; open when any member is open.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakers {
    breakers: Vec<CircuitBreaker>,
}

impl CircuitBreakers {
    pub fn new(breakers: Vec<CircuitBreaker>) -> Self {
        Self { breakers }
    }

    /// Breakers implied by the config; empty when none are configured.
    pub fn from_config(config: &QueueConfig) -> Self {
        let mut breakers = Vec::new();
        if let Some(max) = config.max_consecutive_failures {
            breakers.push(CircuitBreaker::max_consecutive_failures(max));
        }
        if let Some(max_duration) = config.max_duration {
            breakers.push(CircuitBreaker::timeout(max_duration));
        }
        Self { breakers }
    }

    pub fn report_failure(&mut self) {
        self.breakers.iter_mut().for_each(CircuitBreaker::report_failure);
    }

    pub fn report_success(&mut self) {
        self.breakers.iter_mut().for_each(CircuitBreaker::report_success);
    }

    pub fn is_open(&self) -> bool {
        self.breakers.iter().any(CircuitBreaker::is_open)
    }

    /// The first open breaker, if any.
    pub fn tripped(&self) -> Option<&CircuitBreaker> {
        self.breakers.iter().find(|b| b.is_open())
    }
}
