use chrono::{DateTime, Duration, Utc};

use crate::config::AttemptSettings;
use crate::models::timer::RemainingTime;
use crate::models::{Attempt, Quiz};

/// Server-side deadline rules for attempts.
#[derive(Debug, Clone, Copy)]
pub struct TimerPolicy {
    grace: Duration,
}

impl TimerPolicy {
    pub fn new(grace_period_secs: u64) -> Self {
        Self {
            grace: Duration::seconds(grace_period_secs as i64),
        }
    }

    pub fn from_settings(settings: &AttemptSettings) -> Self {
        Self::new(settings.grace_period_secs)
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Computed once at creation; untimed quizzes get no deadline.
    pub fn expires_at(&self, quiz: &Quiz, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        quiz.time_limit_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| started_at + Duration::minutes(minutes as i64) + self.grace)
    }

    pub fn is_expired(&self, attempt: &Attempt, now: DateTime<Utc>) -> bool {
        attempt.expires_at.is_some_and(|deadline| now > deadline)
    }

    pub fn remaining(&self, attempt: &Attempt, now: DateTime<Utc>) -> RemainingTime {
        let Some(deadline) = attempt.expires_at else {
            return RemainingTime::untimed(now);
        };

        let display_deadline = deadline - self.grace;
        let remaining = (display_deadline - now).num_seconds().max(0);
        let total = (display_deadline - attempt.started_at).num_seconds().max(0);

        RemainingTime {
            timed: true,
            display_deadline: Some(display_deadline),
            remaining_seconds: Some(remaining as u32),
            total_seconds: Some(total as u32),
            timestamp: now,
        }
    }
}

pub fn duration_seconds(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> i64 {
    (ended_at - started_at).num_seconds().max(0)
}
