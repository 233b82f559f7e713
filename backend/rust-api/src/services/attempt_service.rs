use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AttemptError, AttemptResult};
use crate::metrics::{ATTEMPTS_EXPIRED_TOTAL, ATTEMPT_STARTS_TOTAL, SUBMISSIONS_TOTAL};
use crate::models::attempt::{
    AutosaveRequest, AutosaveResponse, ResumeResponse, StartAttemptRequest, StartAttemptResponse,
    SubmitAttemptRequest, SubmitAttemptResponse,
};
use crate::models::quiz::LearnerQuestion;
use crate::models::{
    AnswerRecord, Attempt, AttemptStatus, FeedbackMeta, FeedbackStatus, LearnerContext,
    QuizSnapshot, TopicBreakdown, Track,
};

use super::attempt_store::{apply_expiry, AttemptStore, InsertOutcome};
use super::entitlement::EntitlementOracle;
use super::feedback_orchestrator::FeedbackOrchestrator;
use super::question_store::{total_points, QuestionStore};
use super::scoring::score_answers;
use super::timer_policy::{duration_seconds, TimerPolicy};
use super::AppState;

pub struct AttemptService {
    attempts: Arc<dyn AttemptStore>,
    questions: Arc<dyn QuestionStore>,
    entitlements: Arc<dyn EntitlementOracle>,
    feedback: FeedbackOrchestrator,
    timer: TimerPolicy,
    default_max_attempts: u32,
}

impl AttemptService {
    pub fn new(state: &AppState) -> Self {
        Self {
            attempts: state.attempts.clone(),
            questions: state.questions.clone(),
            entitlements: state.entitlements.clone(),
            feedback: state.feedback_orchestrator(),
            timer: TimerPolicy::from_settings(&state.config.attempts),
            default_max_attempts: state.config.attempts.default_max_attempts,
        }
    }

    pub async fn start(
        &self,
        learner: &LearnerContext,
        req: StartAttemptRequest,
    ) -> AttemptResult<StartAttemptResponse> {
        req.validate()?;

        let quiz = self
            .questions
            .get_quiz(&req.quiz_id)
            .await?
            .ok_or(AttemptError::NotFound("quiz"))?;
        if !quiz.is_active {
            return Err(AttemptError::QuizInactive);
        }

        if !self.entitlements.is_entitled(learner, &quiz).await? {
            ATTEMPT_STARTS_TOTAL.with_label_values(&["not_entitled"]).inc();
            tracing::info!(
                learner_id = %learner.learner_id,
                quiz_id = %quiz.id,
                "Start rejected: not entitled"
            );
            return Err(AttemptError::NotEntitled);
        }

        let limit = quiz
            .max_attempts
            .filter(|max| *max > 0)
            .unwrap_or(self.default_max_attempts);
        let completed = self
            .entitlements
            .completed_attempt_count(&learner.learner_id, &quiz.id)
            .await?;
        if completed >= u64::from(limit) {
            ATTEMPT_STARTS_TOTAL.with_label_values(&["max_attempts"]).inc();
            return Err(AttemptError::MaxAttemptsReached { completed, limit });
        }

        let now = Utc::now();
        if let Some(existing) = self
            .attempts
            .find_in_progress(&learner.learner_id, &quiz.id)
            .await?
        {
            if self.timer.is_expired(&existing, now) {
                self.expire(existing, now).await?;
            } else {
                return Ok(self.resumed(existing, now));
            }
        }

        let questions = self.questions.get_questions(&quiz.id).await?;
        let prior = self.attempts.count_all(&learner.learner_id, &quiz.id).await?;

        let attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            learner_id: learner.learner_id.clone(),
            account_id: learner.account_id.clone(),
            quiz_id: quiz.id.clone(),
            quiz: QuizSnapshot {
                name: quiz.name.clone(),
                subject: quiz.resolved_subject(),
                year_level: quiz.resolved_year_level(),
                total_points: total_points(&questions),
                track: quiz.track(),
            },
            status: AttemptStatus::InProgress,
            attempt_number: prior as u32 + 1,
            started_at: now,
            submitted_at: None,
            duration_seconds: None,
            expires_at: self.timer.expires_at(&quiz, now),
            timer_expired: false,
            answers: Vec::new(),
            score: None,
            topic_breakdown: TopicBreakdown::new(),
            feedback: FeedbackMeta::pending(),
            feedback_payload: None,
            performance_analysis: None,
            proctoring: None,
        };

        match self.attempts.insert(&attempt).await? {
            InsertOutcome::Inserted => {
                ATTEMPT_STARTS_TOTAL.with_label_values(&["created"]).inc();
                tracing::info!(
                    attempt_id = %attempt.id,
                    learner_id = %attempt.learner_id,
                    quiz_id = %attempt.quiz_id,
                    attempt_number = attempt.attempt_number,
                    "Attempt created"
                );
                let remaining = self.timer.remaining(&attempt, now);
                Ok(StartAttemptResponse {
                    resumed: false,
                    attempt,
                    remaining,
                })
            }
            InsertOutcome::DuplicateInProgress => {
                // A concurrent start won; hand back its attempt.
                let winner = self
                    .attempts
                    .find_in_progress(&learner.learner_id, &quiz.id)
                    .await?
                    .ok_or_else(|| anyhow!("in-progress attempt vanished after duplicate insert"))?;
                Ok(self.resumed(winner, now))
            }
        }
    }

    pub async fn autosave(
        &self,
        learner: &LearnerContext,
        attempt_id: &str,
        req: AutosaveRequest,
    ) -> AttemptResult<AutosaveResponse> {
        req.validate()?;

        let mut attempt = self.load_owned(learner, attempt_id).await?;
        let now = Utc::now();
        self.ensure_live(&attempt, now).await?;

        attempt.answers = req.answers.into_iter().map(client_answer).collect();
        if !self
            .attempts
            .replace_if_status(&attempt, AttemptStatus::InProgress)
            .await?
        {
            return Err(self.moved_on(attempt_id).await);
        }

        Ok(AutosaveResponse {
            attempt_id: attempt.id.clone(),
            saved_answers: attempt.answers.len(),
            remaining: self.timer.remaining(&attempt, now),
        })
    }

    /// Data a client needs to pick an attempt back up: the attempt, the
    /// question set without correctness flags, and the remaining time.
    pub async fn resume(
        &self,
        learner: &LearnerContext,
        attempt_id: &str,
    ) -> AttemptResult<ResumeResponse> {
        let attempt = self.load_owned(learner, attempt_id).await?;
        let now = Utc::now();
        self.ensure_live(&attempt, now).await?;

        let questions = self
            .questions
            .get_questions(&attempt.quiz_id)
            .await?
            .iter()
            .map(LearnerQuestion::from)
            .collect();

        Ok(ResumeResponse {
            remaining: self.timer.remaining(&attempt, now),
            attempt,
            questions,
        })
    }

    pub async fn submit(
        &self,
        learner: &LearnerContext,
        attempt_id: &str,
        req: SubmitAttemptRequest,
    ) -> AttemptResult<SubmitAttemptResponse> {
        req.validate()?;

        let mut attempt = self.load_owned(learner, attempt_id).await?;
        if attempt.status != AttemptStatus::InProgress {
            return Err(AttemptError::WrongState {
                current: attempt.status,
            });
        }

        // Late submissions are accepted and flagged, never rejected.
        let now = Utc::now();
        let late = self.timer.is_expired(&attempt, now);

        let questions = self.questions.get_questions(&attempt.quiz_id).await?;
        let answers: Vec<AnswerRecord> = req.answers.into_iter().map(client_answer).collect();
        let scored = score_answers(&questions, &answers);

        let track = attempt.track();
        attempt.answers = scored.answers;
        attempt.topic_breakdown = scored.topic_breakdown;
        match track {
            Track::Objective => {
                attempt.score = Some(scored.summary);
                attempt.status = AttemptStatus::Scored;
            }
            Track::Writing => {
                attempt.score = None;
                attempt.status = AttemptStatus::Submitted;
            }
        }
        attempt.submitted_at = Some(now);
        attempt.duration_seconds = Some(duration_seconds(attempt.started_at, now));
        attempt.timer_expired = late;
        attempt.proctoring = req.proctoring;
        attempt.feedback = FeedbackMeta {
            status: FeedbackStatus::Queued,
            status_message: None,
            generated_at: None,
        };

        if !self
            .attempts
            .replace_if_status(&attempt, AttemptStatus::InProgress)
            .await?
        {
            return Err(self.moved_on(attempt_id).await);
        }

        SUBMISSIONS_TOTAL
            .with_label_values(&[track.as_str(), if late { "true" } else { "false" }])
            .inc();
        tracing::info!(
            attempt_id = %attempt.id,
            learner_id = %attempt.learner_id,
            track = track.as_str(),
            late,
            "Attempt submitted"
        );

        self.feedback.dispatch(attempt.id.clone());

        Ok(SubmitAttemptResponse {
            attempt_id: attempt.id,
            status: attempt.status,
            score: attempt.score,
            topic_breakdown: attempt.topic_breakdown,
            timer_expired: attempt.timer_expired,
            feedback_status: attempt.feedback.status,
        })
    }

    pub async fn get_result(
        &self,
        learner: &LearnerContext,
        attempt_id: &str,
    ) -> AttemptResult<Attempt> {
        self.load_owned(learner, attempt_id).await
    }

    async fn load_owned(&self, learner: &LearnerContext, attempt_id: &str) -> AttemptResult<Attempt> {
        let attempt = self
            .attempts
            .get(attempt_id)
            .await?
            .ok_or(AttemptError::NotFound("attempt"))?;
        if !attempt.is_owned_by(&learner.learner_id) {
            tracing::warn!(
                attempt_id = %attempt_id,
                learner_id = %learner.learner_id,
                "Attempt access by non-owner"
            );
            return Err(AttemptError::NotOwner);
        }
        Ok(attempt)
    }

    /// Rejects anything but a live in-progress attempt, expiring it first
    /// when its deadline has passed.
    async fn ensure_live(&self, attempt: &Attempt, now: DateTime<Utc>) -> AttemptResult<()> {
        if attempt.status != AttemptStatus::InProgress {
            return Err(AttemptError::WrongState {
                current: attempt.status,
            });
        }
        if self.timer.is_expired(attempt, now) {
            self.expire(attempt.clone(), now).await?;
            return Err(AttemptError::Expired {
                attempt_id: attempt.id.clone(),
            });
        }
        Ok(())
    }

    async fn expire(&self, mut attempt: Attempt, now: DateTime<Utc>) -> AttemptResult<()> {
        apply_expiry(&mut attempt, now);
        if self
            .attempts
            .replace_if_status(&attempt, AttemptStatus::InProgress)
            .await?
        {
            ATTEMPTS_EXPIRED_TOTAL.with_label_values(&["reactive"]).inc();
            tracing::info!(attempt_id = %attempt.id, "Attempt expired on access");
        }
        Ok(())
    }

    /// Explains a lost compare-and-set on an in-progress attempt.
    async fn moved_on(&self, attempt_id: &str) -> AttemptError {
        match self.attempts.get(attempt_id).await {
            Ok(Some(current)) if current.status == AttemptStatus::Expired => AttemptError::Expired {
                attempt_id: attempt_id.to_string(),
            },
            Ok(Some(current)) => AttemptError::WrongState {
                current: current.status,
            },
            Ok(None) => AttemptError::NotFound("attempt"),
            Err(err) => AttemptError::Internal(err),
        }
    }

    fn resumed(&self, attempt: Attempt, now: DateTime<Utc>) -> StartAttemptResponse {
        ATTEMPT_STARTS_TOTAL.with_label_values(&["resumed"]).inc();
        tracing::debug!(attempt_id = %attempt.id, "Resuming in-progress attempt");
        StartAttemptResponse {
            resumed: true,
            remaining: self.timer.remaining(&attempt, now),
            attempt,
        }
    }
}

/// Points are computed server-side; whatever the client sent is discarded.
fn client_answer(answer: AnswerRecord) -> AnswerRecord {
    AnswerRecord {
        points_scored: 0,
        points_available: 0,
        ..answer
    }
}
