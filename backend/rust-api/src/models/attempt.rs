use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::quiz::Track;
use super::timer::RemainingTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    InProgress,
    Submitted,
    Scored,
    AiDone,
    Expired,
    Error,
}

impl AttemptStatus {
    /// Statuses that count against the attempt limit.
    pub const COMPLETED: [AttemptStatus; 3] = [
        AttemptStatus::Scored,
        AttemptStatus::AiDone,
        AttemptStatus::Submitted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Scored => "scored",
            AttemptStatus::AiDone => "ai_done",
            AttemptStatus::Expired => "expired",
            AttemptStatus::Error => "error",
        }
    }

    pub fn is_completed(&self) -> bool {
        Self::COMPLETED.contains(self)
    }

    /// Allowed lifecycle edges. `ai_done -> ai_done` covers forced feedback
    /// regeneration, which rewrites feedback without moving the attempt.
    pub fn can_transition_to(&self, next: AttemptStatus) -> bool {
        use AttemptStatus as S;
        matches!(
            (self, next),
            (S::InProgress, S::Submitted)
                | (S::InProgress, S::Scored)
                | (S::InProgress, S::Expired)
                | (S::Submitted, S::Scored)
                | (S::Submitted, S::AiDone)
                | (S::Submitted, S::Error)
                | (S::Scored, S::AiDone)
                | (S::Scored, S::Error)
                | (S::AiDone, S::AiDone)
        )
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Queued,
    Generating,
    Done,
    Error,
}

impl FeedbackStatus {
    pub const RETRIABLE: [FeedbackStatus; 4] = [
        FeedbackStatus::Queued,
        FeedbackStatus::Pending,
        FeedbackStatus::Generating,
        FeedbackStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackStatus::Pending => "pending",
            FeedbackStatus::Queued => "queued",
            FeedbackStatus::Generating => "generating",
            FeedbackStatus::Done => "done",
            FeedbackStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FeedbackStatus::Done | FeedbackStatus::Error)
    }
}

/// Denormalized view of the quiz taken at start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizSnapshot {
    pub name: String,
    pub subject: String,
    pub year_level: Option<u8>,
    pub total_points: u32,
    pub track: Track,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct AnswerRecord {
    #[validate(length(min = 1, max = 128))]
    pub question_id: String,
    #[serde(default)]
    pub selected_option_ids: Vec<String>,
    #[serde(default)]
    #[validate(length(max = 20000))]
    pub free_text: Option<String>,
    #[serde(default)]
    pub points_scored: u32,
    #[serde(default)]
    pub points_available: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub points: u32,
    pub available: u32,
    pub percentage: u32,
    pub grade: String,
    pub pass: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScore {
    pub scored: u32,
    pub total: u32,
}

pub type TopicBreakdown = BTreeMap<String, TopicScore>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMeta {
    pub status: FeedbackStatus,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
}

impl FeedbackMeta {
    pub fn pending() -> Self {
        Self {
            status: FeedbackStatus::Pending,
            status_message: None,
            generated_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProctoringReport {
    #[serde(default)]
    pub tab_switches: u32,
    #[serde(default)]
    pub fullscreen_exits: u32,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: String,
    pub learner_id: String,
    pub account_id: String,
    pub quiz_id: String,
    pub quiz: QuizSnapshot,
    pub status: AttemptStatus,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub timer_expired: bool,
    pub answers: Vec<AnswerRecord>,
    pub score: Option<ScoreSummary>,
    pub topic_breakdown: TopicBreakdown,
    pub feedback: FeedbackMeta,
    pub feedback_payload: Option<serde_json::Value>,
    pub performance_analysis: Option<serde_json::Value>,
    pub proctoring: Option<ProctoringReport>,
}

impl Attempt {
    pub fn is_owned_by(&self, learner_id: &str) -> bool {
        self.learner_id == learner_id
    }

    pub fn track(&self) -> Track {
        self.quiz.track
    }
}

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Validate)]
pub struct StartAttemptRequest {
    #[validate(length(min = 1, max = 128))]
    pub quiz_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AutosaveRequest {
    #[validate(length(max = 500), nested, custom(function = "unique_question_ids"))]
    pub answers: Vec<AnswerRecord>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitAttemptRequest {
    #[validate(length(max = 500), nested, custom(function = "unique_question_ids"))]
    pub answers: Vec<AnswerRecord>,
    #[serde(default)]
    pub proctoring: Option<ProctoringReport>,
}

/// One answer per question.
fn unique_question_ids(answers: &[AnswerRecord]) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(answers.len());
    for answer in answers {
        if !seen.insert(answer.question_id.as_str()) {
            let mut err = ValidationError::new("duplicate_question_id");
            err.message = Some(format!("question {} answered more than once", answer.question_id).into());
            return Err(err);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StartAttemptResponse {
    pub resumed: bool,
    pub attempt: Attempt,
    pub remaining: RemainingTime,
}

#[derive(Debug, Serialize)]
pub struct AutosaveResponse {
    pub attempt_id: String,
    pub saved_answers: usize,
    pub remaining: RemainingTime,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub attempt: Attempt,
    pub questions: Vec<super::quiz::LearnerQuestion>,
    pub remaining: RemainingTime,
}

#[derive(Debug, Serialize)]
pub struct SubmitAttemptResponse {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub score: Option<ScoreSummary>,
    pub topic_breakdown: TopicBreakdown,
    pub timer_expired: bool,
    pub feedback_status: FeedbackStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_statuses() {
        assert!(AttemptStatus::Scored.is_completed());
        assert!(AttemptStatus::AiDone.is_completed());
        assert!(AttemptStatus::Submitted.is_completed());
        assert!(!AttemptStatus::Expired.is_completed());
        assert!(!AttemptStatus::InProgress.is_completed());
        assert!(!AttemptStatus::Error.is_completed());
    }

    #[test]
    fn test_state_machine_edges() {
        use AttemptStatus as S;
        assert!(S::InProgress.can_transition_to(S::Expired));
        assert!(S::InProgress.can_transition_to(S::Scored));
        assert!(S::Submitted.can_transition_to(S::AiDone));
        assert!(S::Scored.can_transition_to(S::AiDone));

        assert!(!S::Expired.can_transition_to(S::InProgress));
        assert!(!S::Expired.can_transition_to(S::Scored));
        assert!(!S::AiDone.can_transition_to(S::Scored));
        assert!(!S::Scored.can_transition_to(S::Submitted));
        assert!(!S::InProgress.can_transition_to(S::AiDone));
    }

    #[test]
    fn test_duplicate_question_ids_rejected() {
        let answer = |id: &str| AnswerRecord {
            question_id: id.into(),
            selected_option_ids: vec!["a".into()],
            ..Default::default()
        };

        let req = SubmitAttemptRequest {
            answers: vec![answer("q1"), answer("q1"), answer("q2")],
            proctoring: None,
        };
        let errors = req.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("answers"));

        let req = AutosaveRequest {
            answers: vec![answer("q1"), answer("q2")],
        };
        assert!(req.validate().is_ok());

        let req = AutosaveRequest {
            answers: vec![answer("q2"), answer("q2")],
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&AttemptStatus::AiDone).unwrap(),
            "\"ai_done\""
        );
        assert_eq!(
            serde_json::to_string(&FeedbackStatus::Generating).unwrap(),
            "\"generating\""
        );
    }

    #[test]
    fn test_feedback_terminal() {
        assert!(FeedbackStatus::Done.is_terminal());
        assert!(FeedbackStatus::Error.is_terminal());
        assert!(!FeedbackStatus::Generating.is_terminal());
        assert!(!FeedbackStatus::Queued.is_terminal());
    }
}
