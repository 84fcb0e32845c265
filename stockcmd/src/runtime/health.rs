//! Health reporting for consumer runtimes.

use chrono::{DateTime, Utc};

/// Health status of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Listening on an established session.
    Healthy,
    /// Not listening, but within the reconnect tolerance.
    Degraded,
    /// Connection attempts keep failing.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Latest health observation of a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Current status
    pub status: HealthStatus,
    /// Human-readable description
    pub message: String,
    /// Connection attempts that failed in a row
    pub consecutive_failures: u32,
    /// Last broker error observed, if any
    pub last_error: Option<String>,
    /// When the report was produced
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// A healthy report.
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message)
    }

    /// A degraded report.
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, message)
    }

    /// An unhealthy report.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, message)
    }

    fn with_status(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            consecutive_failures: 0,
            last_error: None,
            checked_at: Utc::now(),
        }
    }

    /// Report after `failures` consecutive failed connection attempts.
    pub fn after_failures(failures: u32, threshold: u32, last_error: impl Into<String>) -> Self {
        let report = if failures >= threshold.max(1) {
            Self::unhealthy(format!("{failures} consecutive connection failures"))
        } else {
            Self::degraded(format!("reconnecting after {failures} failed attempt(s)"))
        };
        Self {
            consecutive_failures: failures,
            last_error: Some(last_error.into()),
            ..report
        }
    }

    /// Whether the status is [`HealthStatus::Healthy`].
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_turn_unhealthy_at_the_threshold() {
        let degraded = HealthReport::after_failures(2, 3, "refused");
        let unhealthy = HealthReport::after_failures(3, 3, "refused");

        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!(unhealthy.status, HealthStatus::Unhealthy);
        assert_eq!(unhealthy.consecutive_failures, 3);
        assert_eq!(unhealthy.last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn zero_threshold_behaves_like_one() {
        assert_eq!(
            HealthReport::after_failures(1, 0, "refused").status,
            HealthStatus::Unhealthy
        );
    }
}
