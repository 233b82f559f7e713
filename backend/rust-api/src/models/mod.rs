use serde::{Deserialize, Serialize};

pub mod attempt;
pub mod feedback;
pub mod quiz;
pub mod timer;

pub use attempt::{
    AnswerRecord, Attempt, AttemptStatus, FeedbackMeta, FeedbackStatus, QuizSnapshot,
    ScoreSummary, TopicBreakdown, TopicScore,
};
pub use quiz::{Question, QuestionType, Quiz, Track};

/// Authenticated learner making an attempt-touching call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerContext {
    pub learner_id: String,
    pub account_id: String,
    pub year_level: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Trial,
    Suspended,
    Cancelled,
}
