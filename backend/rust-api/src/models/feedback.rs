use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::{AttemptStatus, FeedbackStatus, ScoreSummary, TopicBreakdown};

/// Payload handed to the external feedback generator, one shape per track.
///
/// Serialized untagged: the generator scripts read their own stdin keys and
/// the HTTP transport carries the track in the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedbackRequest {
    Objective(ObjectiveFeedbackRequest),
    Writing(WritingFeedbackRequest),
}

impl FeedbackRequest {
    pub fn attempt_id(&self) -> &str {
        match self {
            FeedbackRequest::Objective(req) => &req.attempt_id,
            FeedbackRequest::Writing(req) => &req.attempt_id,
        }
    }

    pub fn track_name(&self) -> &'static str {
        match self {
            FeedbackRequest::Objective(_) => "objective",
            FeedbackRequest::Writing(_) => "writing",
        }
    }
}

/// Objective payload: `{attempt_id, doc: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveFeedbackRequest {
    pub attempt_id: String,
    pub doc: ObjectiveAttemptDoc,
}

/// Scored attempt as the subject feedback generator expects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectiveAttemptDoc {
    pub quiz_name: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year_level: Option<u8>,
    /// `points`, `available`, `percentage` and `grade`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreSummary>,
    #[serde(rename = "topicBreakdown")]
    pub topic_breakdown: TopicBreakdown,
    /// Seconds between start and submission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    pub questions: Vec<QuestionOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub question_id: String,
    pub points_scored: u32,
    pub points_available: u32,
}

/// Writing payload, flat: the evaluator requires `student_year`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritingFeedbackRequest {
    pub attempt_id: String,
    pub quiz_name: String,
    pub student_year: u8,
    pub writing_prompt: String,
    pub student_writing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_type: Option<String>,
    pub answers: Vec<WritingAnswer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WritingAnswer {
    pub question_id: String,
    pub prompt: String,
    pub text: String,
}

/// Raw generator response as it arrives on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorResponse {
    pub success: bool,
    #[serde(default, alias = "result", alias = "ai_feedback")]
    pub feedback: Option<serde_json::Value>,
    #[serde(default)]
    pub performance_analysis: Option<serde_json::Value>,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Settled result of one generator invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorOutcome {
    Success {
        feedback: serde_json::Value,
        analysis: Option<serde_json::Value>,
        generated_at: Option<DateTime<Utc>>,
    },
    Failure {
        error: String,
    },
}

impl From<GeneratorResponse> for GeneratorOutcome {
    fn from(response: GeneratorResponse) -> Self {
        match (response.success, response.feedback) {
            (true, Some(feedback)) => GeneratorOutcome::Success {
                feedback,
                analysis: response.performance_analysis,
                generated_at: response.generated_at,
            },
            (true, None) => GeneratorOutcome::Failure {
                error: "generator reported success without feedback".to_string(),
            },
            (false, _) => GeneratorOutcome::Failure {
                error: response
                    .error
                    .unwrap_or_else(|| "generator reported failure".to_string()),
            },
        }
    }
}

impl GeneratorOutcome {
    /// Parses generator output; anything malformed becomes a failure.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return GeneratorOutcome::Failure {
                error: "generator returned an empty response".to_string(),
            };
        }

        match serde_json::from_str::<GeneratorResponse>(trimmed) {
            Ok(response) => response.into(),
            Err(err) => GeneratorOutcome::Failure {
                error: format!("malformed generator response: {}", err),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOneRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryBatchRequest {
    #[serde(default)]
    pub feedback_statuses: Option<Vec<FeedbackStatus>>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub force: bool,
}

/// Filter for selecting attempts eligible for bulk feedback retry.
#[derive(Debug, Clone)]
pub struct RetryFilter {
    pub feedback_statuses: Vec<FeedbackStatus>,
    pub subject: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackRunReport {
    pub attempt_id: String,
    pub status: AttemptStatus,
    pub feedback_status: FeedbackStatus,
    pub status_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryItemResult {
    pub attempt_id: String,
    pub success: bool,
    pub feedback_status: Option<FeedbackStatus>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryBatchResponse {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<RetryItemResult>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attempt::TopicScore;

    #[test]
    fn test_parse_success() {
        let raw = r#"{"success": true, "feedback": {"overall_feedback": "ok"},
            "performance_analysis": {"accuracy": 80.0},
            "generated_at": "2026-01-02T03:04:05Z"}"#;
        match GeneratorOutcome::parse(raw) {
            GeneratorOutcome::Success {
                feedback,
                analysis,
                generated_at,
            } => {
                assert_eq!(feedback["overall_feedback"], "ok");
                assert!(analysis.is_some());
                assert!(generated_at.is_some());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_parse_accepts_result_alias() {
        let raw = r#"{"success": true, "result": {"overall": {"total_score": 30}}}"#;
        assert!(matches!(
            GeneratorOutcome::parse(raw),
            GeneratorOutcome::Success { .. }
        ));
    }

    #[test]
    fn test_parse_failure_payload() {
        let raw = r#"{"success": false, "error": "GEMINI_API_KEY environment variable is required"}"#;
        assert_eq!(
            GeneratorOutcome::parse(raw),
            GeneratorOutcome::Failure {
                error: "GEMINI_API_KEY environment variable is required".into()
            }
        );
    }

    #[test]
    fn test_parse_malformed_is_failure() {
        assert!(matches!(
            GeneratorOutcome::parse("Traceback (most recent call last):"),
            GeneratorOutcome::Failure { .. }
        ));
        assert!(matches!(
            GeneratorOutcome::parse("   "),
            GeneratorOutcome::Failure { .. }
        ));
        assert!(matches!(
            GeneratorOutcome::parse(r#"{"success": true}"#),
            GeneratorOutcome::Failure { .. }
        ));
    }

    #[test]
    fn test_writing_request_carries_student_year() {
        let req = FeedbackRequest::Writing(WritingFeedbackRequest {
            attempt_id: "a1".into(),
            quiz_name: "Year 3 Writing".into(),
            student_year: 3,
            writing_prompt: "Describe a day at the beach".into(),
            student_writing: "The sand was warm.".into(),
            text_type: None,
            answers: vec![],
        });
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["student_year"], 3);
        assert_eq!(json["writing_prompt"], "Describe a day at the beach");
        assert_eq!(json["student_writing"], "The sand was warm.");
        assert!(json.get("text_type").is_none());
        assert!(json.get("track").is_none());
        assert_eq!(req.track_name(), "writing");
    }

    #[test]
    fn test_objective_request_nests_doc() {
        let mut topics = TopicBreakdown::new();
        topics.insert("fractions".into(), TopicScore { scored: 1, total: 2 });
        let req = FeedbackRequest::Objective(ObjectiveFeedbackRequest {
            attempt_id: "a2".into(),
            doc: ObjectiveAttemptDoc {
                quiz_name: "Year 5 Numeracy".into(),
                subject: "Numeracy".into(),
                year_level: Some(5),
                score: Some(ScoreSummary {
                    points: 1,
                    available: 2,
                    percentage: 50,
                    grade: "D".into(),
                    pass: true,
                }),
                topic_breakdown: topics,
                duration: Some(300),
                questions: vec![],
            },
        });
        let json = serde_json::to_value(&req).unwrap();
        let doc = &json["doc"];
        assert_eq!(doc["quiz_name"], "Year 5 Numeracy");
        assert_eq!(doc["year_level"], 5);
        assert_eq!(doc["score"]["points"], 1);
        assert_eq!(doc["score"]["available"], 2);
        assert_eq!(doc["score"]["percentage"], 50);
        assert_eq!(doc["topicBreakdown"]["fractions"]["scored"], 1);
        assert_eq!(doc["topicBreakdown"]["fractions"]["total"], 2);
        assert_eq!(doc["duration"], 300);
        assert!(json.get("quiz_name").is_none());
    }
}
