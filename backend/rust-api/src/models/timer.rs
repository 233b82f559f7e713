use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Learner-facing timer state. The grace window is already subtracted, so
/// `remaining_seconds` reaches zero before the server-side deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemainingTime {
    pub timed: bool,
    pub display_deadline: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<u32>,
    pub total_seconds: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl RemainingTime {
    pub fn untimed(now: DateTime<Utc>) -> Self {
        Self {
            timed: false,
            display_deadline: None,
            remaining_seconds: None,
            total_seconds: None,
            timestamp: now,
        }
    }

    pub fn is_elapsed(&self) -> bool {
        matches!(self.remaining_seconds, Some(0))
    }
}
