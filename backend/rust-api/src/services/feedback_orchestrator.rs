//! Drives a submitted attempt to a terminal feedback state.
//!
//! Dispatch runs the generator on a detached task with its own crash
//! boundary; completion is communicated only through store writes. Operator
//! retries go through the same guarded path but are awaited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::{FeedbackSettings, MAX_RETRY_BATCH};
use crate::error::{AttemptError, AttemptResult};
use crate::metrics::{FEEDBACK_JOBS_TOTAL, FEEDBACK_JOB_DURATION_SECONDS};
use crate::models::feedback::{
    FeedbackRequest, FeedbackRunReport, GeneratorOutcome, ObjectiveAttemptDoc,
    ObjectiveFeedbackRequest, QuestionOutcome, RetryBatchRequest, RetryBatchResponse, RetryFilter, RetryItemResult,
    WritingAnswer, WritingFeedbackRequest,
};
use crate::models::quiz::infer_year_level_from_name;
use crate::models::{Attempt, AttemptStatus, FeedbackStatus, Question, QuestionType, ScoreSummary, Track};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

use super::attempt_store::AttemptStore;
use super::feedback_generator::FeedbackGenerator;
use super::question_store::QuestionStore;
use super::scoring::summarize;

/// Writing evaluator needs a year; quizzes with none resolved are marked
/// against the youngest band.
const FALLBACK_WRITING_YEAR: u8 = 3;

/// Generator calls in flight at once during a bulk retry.
pub const RETRY_BATCH_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct FeedbackOrchestrator {
    attempts: Arc<dyn AttemptStore>,
    questions: Arc<dyn QuestionStore>,
    generator: Arc<dyn FeedbackGenerator>,
    timeout: Duration,
    batch_limit: u32,
}

impl FeedbackOrchestrator {
    pub fn new(
        attempts: Arc<dyn AttemptStore>,
        questions: Arc<dyn QuestionStore>,
        generator: Arc<dyn FeedbackGenerator>,
        settings: &FeedbackSettings,
    ) -> Self {
        Self {
            attempts,
            questions,
            generator,
            timeout: Duration::from_secs(settings.timeout_secs),
            batch_limit: settings.retry_batch_limit.clamp(1, MAX_RETRY_BATCH),
        }
    }

    /// Fire-and-forget generation after a submission. The returned handle is
    /// only useful to tests; request handlers drop it.
    pub fn dispatch(&self, attempt_id: String) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.execute_guarded(&attempt_id).await {
                tracing::warn!(attempt_id = %attempt_id, error = %err, "Feedback dispatch ended with error");
            }
        })
    }

    /// Runs generation on its own task and converts an `Err` or a panic into
    /// a persisted `error` feedback status.
    async fn execute_guarded(&self, attempt_id: &str) -> AttemptResult<FeedbackRunReport> {
        let inner = {
            let orchestrator = self.clone();
            let attempt_id = attempt_id.to_string();
            tokio::spawn(async move { orchestrator.run(&attempt_id).await })
        };

        let failure = match inner.await {
            Ok(Ok(report)) => return Ok(report),
            Ok(Err(err @ AttemptError::NotFound(_))) => return Err(err),
            Ok(Err(err)) => err,
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    "feedback task panicked".to_string()
                } else {
                    "feedback task was cancelled".to_string()
                };
                AttemptError::Internal(anyhow!(message))
            }
        };

        tracing::error!(attempt_id = %attempt_id, error = %failure, "Feedback task crashed");
        self.mark_crashed(attempt_id, &failure.to_string()).await;
        Err(failure)
    }

    /// One synchronous generation pass: mark `generating`, call the
    /// generator under the timeout, persist the settled outcome.
    pub async fn run(&self, attempt_id: &str) -> AttemptResult<FeedbackRunReport> {
        let attempt = self
            .attempts
            .get(attempt_id)
            .await?
            .ok_or(AttemptError::NotFound("attempt"))?;
        let track = attempt.track();
        let questions = self.questions.get_questions(&attempt.quiz_id).await?;
        let request = build_request(&attempt, &questions);

        self.update_attempt(attempt_id, |a| {
            a.feedback.status = FeedbackStatus::Generating;
            a.feedback.status_message = None;
        })
        .await?;

        tracing::info!(
            attempt_id = %attempt_id,
            track = track.as_str(),
            "Invoking feedback generator"
        );

        let started = Instant::now();
        let (outcome, label) =
            match tokio::time::timeout(self.timeout, self.generator.generate(&request)).await {
                Ok(Ok(outcome)) => {
                    let label = match outcome {
                        GeneratorOutcome::Success { .. } => "success",
                        GeneratorOutcome::Failure { .. } => "failure",
                    };
                    (outcome, label)
                }
                Ok(Err(err)) => (
                    GeneratorOutcome::Failure {
                        error: format!("{:#}", err),
                    },
                    "failure",
                ),
                Err(_) => (
                    GeneratorOutcome::Failure {
                        error: format!(
                            "feedback generator timed out after {}s",
                            self.timeout.as_secs()
                        ),
                    },
                    "timeout",
                ),
            };

        FEEDBACK_JOB_DURATION_SECONDS
            .with_label_values(&[track.as_str()])
            .observe(started.elapsed().as_secs_f64());
        FEEDBACK_JOBS_TOTAL
            .with_label_values(&[track.as_str(), label])
            .inc();

        if let GeneratorOutcome::Failure { error } = &outcome {
            tracing::warn!(attempt_id = %attempt_id, error = %error, "Feedback generation failed");
        }

        let now = Utc::now();
        let updated = self
            .update_attempt(attempt_id, |a| apply_outcome(a, &outcome, now))
            .await?;

        Ok(FeedbackRunReport {
            attempt_id: updated.id.clone(),
            status: updated.status,
            feedback_status: updated.feedback.status,
            status_message: updated.feedback.status_message.clone(),
        })
    }

    pub async fn retry_one(&self, attempt_id: &str, force: bool) -> AttemptResult<FeedbackRunReport> {
        let attempt = self
            .attempts
            .get(attempt_id)
            .await?
            .ok_or(AttemptError::NotFound("attempt"))?;

        if matches!(attempt.status, AttemptStatus::InProgress | AttemptStatus::Expired) {
            return Err(AttemptError::WrongState {
                current: attempt.status,
            });
        }
        if attempt.feedback.status == FeedbackStatus::Done && !force {
            return Err(AttemptError::FeedbackAlreadyComplete);
        }

        tracing::info!(attempt_id = %attempt_id, force, "Operator feedback retry");
        self.execute_guarded(attempt_id).await
    }

    pub async fn retry_batch(&self, request: RetryBatchRequest) -> AttemptResult<RetryBatchResponse> {
        let filter = RetryFilter {
            feedback_statuses: request
                .feedback_statuses
                .filter(|statuses| !statuses.is_empty())
                .unwrap_or_else(|| FeedbackStatus::RETRIABLE.to_vec()),
            subject: request
                .subject
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            limit: request
                .limit
                .unwrap_or(self.batch_limit)
                .clamp(1, MAX_RETRY_BATCH),
        };

        let candidates = self.attempts.find_for_feedback_retry(&filter).await?;
        tracing::info!(
            candidates = candidates.len(),
            limit = filter.limit,
            subject = ?filter.subject,
            "Bulk feedback retry"
        );

        // Bounded fan-out: a full batch of hung generators costs
        // ceil(limit / RETRY_BATCH_CONCURRENCY) timeouts, not `limit`.
        let force = request.force;
        let items: Vec<RetryItemResult> = stream::iter(candidates)
            .map(|attempt| async move {
                match self.retry_one(&attempt.id, force).await {
                    Ok(report) => RetryItemResult {
                        attempt_id: report.attempt_id,
                        success: report.feedback_status == FeedbackStatus::Done,
                        feedback_status: Some(report.feedback_status),
                        error: report.status_message,
                    },
                    Err(err) => RetryItemResult {
                        attempt_id: attempt.id,
                        success: false,
                        feedback_status: None,
                        error: Some(err.to_string()),
                    },
                }
            })
            .buffered(RETRY_BATCH_CONCURRENCY)
            .collect()
            .await;

        let succeeded = items.iter().filter(|i| i.success).count();
        Ok(RetryBatchResponse {
            processed: items.len(),
            succeeded,
            failed: items.len() - succeeded,
            items,
        })
    }

    /// Catch-all write used when the run never reached outcome handling.
    async fn mark_crashed(&self, attempt_id: &str, message: &str) {
        let now = Utc::now();
        let result = self
            .update_attempt(attempt_id, |a| {
                a.feedback.status = FeedbackStatus::Error;
                a.feedback.status_message = Some(message.to_string());
                a.feedback.generated_at = Some(now);
                if a.track() == Track::Writing && a.status == AttemptStatus::Submitted {
                    a.status = AttemptStatus::Scored;
                }
            })
            .await;

        if let Err(err) = result {
            tracing::error!(
                attempt_id = %attempt_id,
                error = %err,
                "Failed to record feedback crash"
            );
        }
    }

    /// Read-modify-write guarded by the current status, retried with backoff
    /// when the store errors or the record moved underneath us.
    async fn update_attempt<F>(&self, attempt_id: &str, mutate: F) -> AttemptResult<Attempt>
    where
        F: Fn(&mut Attempt) + Send + Sync,
    {
        let updated = retry_async_with_config(RetryConfig::default(), || async {
            self.update_attempt_once(attempt_id, &mutate).await
        })
        .await?;
        Ok(updated)
    }

    async fn update_attempt_once<F>(&self, attempt_id: &str, mutate: &F) -> anyhow::Result<Attempt>
    where
        F: Fn(&mut Attempt) + Send + Sync,
    {
        let mut attempt = self
            .attempts
            .get(attempt_id)
            .await?
            .ok_or_else(|| anyhow!("attempt {} disappeared", attempt_id))?;
        let expected = attempt.status;
        mutate(&mut attempt);

        if self.attempts.replace_if_status(&attempt, expected).await? {
            Ok(attempt)
        } else {
            Err(anyhow!("attempt {} changed concurrently", attempt_id))
        }
    }
}

fn advance(attempt: &mut Attempt, next: AttemptStatus) {
    if attempt.status.can_transition_to(next) {
        attempt.status = next;
    }
}

/// Folds a settled generator outcome into the attempt.
///
/// Writing attempts reach `ai_done` whether the call succeeded or not, since
/// the generator is their only score source. Objective attempts keep
/// `scored` when feedback failed.
pub fn apply_outcome(attempt: &mut Attempt, outcome: &GeneratorOutcome, now: DateTime<Utc>) {
    let track = attempt.track();
    match outcome {
        GeneratorOutcome::Success {
            feedback,
            analysis,
            generated_at,
        } => {
            attempt.feedback_payload = Some(feedback.clone());
            attempt.performance_analysis = analysis.clone();
            attempt.feedback.status = FeedbackStatus::Done;
            attempt.feedback.status_message = None;
            attempt.feedback.generated_at = Some(generated_at.unwrap_or(now));

            if track == Track::Writing {
                if let Some(score) = analysis
                    .as_ref()
                    .and_then(writing_score)
                    .or_else(|| writing_score(feedback))
                {
                    attempt.score = Some(score);
                }
            }
            advance(attempt, AttemptStatus::AiDone);
        }
        GeneratorOutcome::Failure { error } => {
            attempt.feedback.status = FeedbackStatus::Error;
            attempt.feedback.status_message = Some(error.clone());
            attempt.feedback.generated_at = Some(now);

            if track == Track::Writing {
                advance(attempt, AttemptStatus::AiDone);
            }
        }
    }
}

/// Reads `total_score`/`max_score` from the top level or under `overall`.
pub fn writing_score(analysis: &Value) -> Option<ScoreSummary> {
    let field = |name: &str| {
        analysis
            .get(name)
            .or_else(|| analysis.get("overall").and_then(|o| o.get(name)))
            .and_then(Value::as_f64)
    };

    let total = field("total_score")?;
    let max = field("max_score")?;
    if max <= 0.0 || total < 0.0 {
        return None;
    }

    Some(summarize(total.round() as u32, max.round() as u32))
}

pub fn build_request(attempt: &Attempt, questions: &[Question]) -> FeedbackRequest {
    match attempt.track() {
        Track::Objective => FeedbackRequest::Objective(ObjectiveFeedbackRequest {
            attempt_id: attempt.id.clone(),
            doc: ObjectiveAttemptDoc {
                quiz_name: attempt.quiz.name.clone(),
                subject: attempt.quiz.subject.clone(),
                year_level: attempt.quiz.year_level,
                score: attempt.score.clone(),
                topic_breakdown: attempt.topic_breakdown.clone(),
                duration: attempt.duration_seconds,
                questions: attempt
                    .answers
                    .iter()
                    .map(|a| QuestionOutcome {
                        question_id: a.question_id.clone(),
                        points_scored: a.points_scored,
                        points_available: a.points_available,
                    })
                    .collect(),
            },
        }),
        Track::Writing => {
            let prompts: HashMap<&str, &str> = questions
                .iter()
                .map(|q| (q.id.as_str(), q.text.as_str()))
                .collect();

            let answers: Vec<WritingAnswer> = attempt
                .answers
                .iter()
                .filter_map(|a| {
                    let text = a.free_text.as_deref()?.trim();
                    if text.is_empty() {
                        return None;
                    }
                    Some(WritingAnswer {
                        question_id: a.question_id.clone(),
                        prompt: prompts
                            .get(a.question_id.as_str())
                            .map(|p| p.to_string())
                            .unwrap_or_default(),
                        text: text.to_string(),
                    })
                })
                .collect();

            let writing_prompt = questions
                .iter()
                .find(|q| q.question_type == QuestionType::FreeText)
                .map(|q| q.text.clone())
                .unwrap_or_default();

            let student_writing = answers
                .iter()
                .map(|a| a.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");

            FeedbackRequest::Writing(WritingFeedbackRequest {
                attempt_id: attempt.id.clone(),
                quiz_name: attempt.quiz.name.clone(),
                student_year: attempt
                    .quiz
                    .year_level
                    .or_else(|| infer_year_level_from_name(&attempt.quiz.name))
                    .unwrap_or(FALLBACK_WRITING_YEAR),
                writing_prompt,
                student_writing,
                text_type: None,
                answers,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnswerRecord, FeedbackMeta, QuizSnapshot, TopicBreakdown, TopicScore};
    use serde_json::json;

    fn attempt(track: Track, status: AttemptStatus) -> Attempt {
        Attempt {
            id: "a-1".into(),
            learner_id: "child".into(),
            account_id: "parent".into(),
            quiz_id: "quiz".into(),
            quiz: QuizSnapshot {
                name: "Year 5 Writing".into(),
                subject: match track {
                    Track::Writing => "Writing".into(),
                    Track::Objective => "Numeracy".into(),
                },
                year_level: Some(5),
                total_points: 10,
                track,
            },
            status,
            attempt_number: 1,
            started_at: Utc::now(),
            submitted_at: Some(Utc::now()),
            duration_seconds: Some(120),
            expires_at: None,
            timer_expired: false,
            answers: vec![
                AnswerRecord {
                    question_id: "w1".into(),
                    free_text: Some("Once upon a time".into()),
                    ..Default::default()
                },
                AnswerRecord {
                    question_id: "w2".into(),
                    free_text: Some("   ".into()),
                    ..Default::default()
                },
            ],
            score: None,
            topic_breakdown: TopicBreakdown::new(),
            feedback: FeedbackMeta::pending(),
            feedback_payload: None,
            performance_analysis: None,
            proctoring: None,
        }
    }

    #[test]
    fn test_writing_score_top_level_and_overall() {
        let top = writing_score(&json!({ "total_score": 36, "max_score": 48 })).unwrap();
        assert_eq!(top.percentage, 75);
        assert_eq!(top.grade, "B");

        let nested = writing_score(&json!({ "overall": { "total_score": 20, "max_score": 48 } }))
            .unwrap();
        assert_eq!(nested.points, 20);
        assert!(!nested.pass);

        assert!(writing_score(&json!({ "total_score": 5 })).is_none());
        assert!(writing_score(&json!({ "total_score": 5, "max_score": 0 })).is_none());
    }

    #[test]
    fn test_writing_success_sets_score_and_ai_done() {
        let mut a = attempt(Track::Writing, AttemptStatus::Submitted);
        let outcome = GeneratorOutcome::Success {
            feedback: json!({ "overall": { "total_score": 40, "max_score": 48 } }),
            analysis: None,
            generated_at: None,
        };
        apply_outcome(&mut a, &outcome, Utc::now());

        assert_eq!(a.status, AttemptStatus::AiDone);
        assert_eq!(a.feedback.status, FeedbackStatus::Done);
        assert_eq!(a.score.as_ref().map(|s| s.points), Some(40));
        assert!(a.feedback.generated_at.is_some());
    }

    #[test]
    fn test_writing_failure_still_reaches_ai_done() {
        let mut a = attempt(Track::Writing, AttemptStatus::Submitted);
        let outcome = GeneratorOutcome::Failure {
            error: "quota exceeded".into(),
        };
        apply_outcome(&mut a, &outcome, Utc::now());

        assert_eq!(a.status, AttemptStatus::AiDone);
        assert_eq!(a.feedback.status, FeedbackStatus::Error);
        assert!(a.score.is_none());
    }

    #[test]
    fn test_objective_failure_keeps_scored() {
        let mut a = attempt(Track::Objective, AttemptStatus::Scored);
        let outcome = GeneratorOutcome::Failure {
            error: "bad payload".into(),
        };
        apply_outcome(&mut a, &outcome, Utc::now());

        assert_eq!(a.status, AttemptStatus::Scored);
        assert_eq!(a.feedback.status_message.as_deref(), Some("bad payload"));
    }

    #[test]
    fn test_writing_request_falls_back_to_name_year() {
        let mut a = attempt(Track::Writing, AttemptStatus::Submitted);
        a.quiz.year_level = None;
        a.quiz.name = "Year 7 Writing".into();
        let json = serde_json::to_value(build_request(&a, &[])).unwrap();
        assert_eq!(json["student_year"], 7);

        a.quiz.name = "Writing practice".into();
        let json = serde_json::to_value(build_request(&a, &[])).unwrap();
        assert_eq!(json["student_year"], FALLBACK_WRITING_YEAR);
    }

    #[test]
    fn test_objective_request_matches_generator_doc() {
        let mut a = attempt(Track::Objective, AttemptStatus::Scored);
        a.quiz.name = "Year 5 Numeracy".into();
        a.score = Some(summarize(3, 4));
        a.topic_breakdown
            .insert("fractions".into(), TopicScore { scored: 3, total: 4 });

        let json = serde_json::to_value(build_request(&a, &[])).unwrap();
        assert_eq!(json["attempt_id"], "a-1");
        let doc = &json["doc"];
        assert_eq!(doc["quiz_name"], "Year 5 Numeracy");
        assert_eq!(doc["score"]["points"], 3);
        assert_eq!(doc["score"]["available"], 4);
        assert_eq!(doc["score"]["percentage"], 75);
        assert_eq!(doc["topicBreakdown"]["fractions"]["scored"], 3);
        assert_eq!(doc["topicBreakdown"]["fractions"]["total"], 4);
        assert_eq!(doc["duration"], 120);
    }

    #[test]
    fn test_writing_request_skips_blank_answers() {
        let a = attempt(Track::Writing, AttemptStatus::Submitted);
        let questions = vec![Question {
            id: "w1".into(),
            quiz_id: "quiz".into(),
            question_type: QuestionType::FreeText,
            text: "Write a story about a storm".into(),
            points: 48,
            options: vec![],
            topics: vec![],
            position: 1,
        }];

        match build_request(&a, &questions) {
            FeedbackRequest::Writing(req) => {
                assert_eq!(req.writing_prompt, "Write a story about a storm");
                assert_eq!(req.student_writing, "Once upon a time");
                assert_eq!(req.answers.len(), 1);
                assert_eq!(req.answers[0].prompt, "Write a story about a storm");
                assert_eq!(req.student_year, 5);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }
}
