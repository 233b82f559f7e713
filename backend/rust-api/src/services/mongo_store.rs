//! MongoDB-backed implementations of the store seams.
//!
//! Attempts are persisted through `AttemptDocument` so that every timestamp
//! the sweeper filters on is a native BSON date.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::metrics::track_db_operation;
use crate::models::attempt::ProctoringReport;
use crate::models::feedback::RetryFilter;
use crate::models::{
    AccountStatus, AnswerRecord, Attempt, AttemptStatus, FeedbackMeta, LearnerContext, Question,
    Quiz, QuizSnapshot, ScoreSummary, TopicBreakdown,
};
use crate::utils::time::{bson_to_chrono, chrono_to_bson};

use super::attempt_store::{AttemptStore, InsertOutcome};
use super::entitlement::{entitlement_decision, EntitlementOracle};
use super::question_store::QuestionStore;

pub const ATTEMPTS_COLLECTION: &str = "attempts";
pub const QUIZZES_COLLECTION: &str = "quizzes";
pub const QUESTIONS_COLLECTION: &str = "questions";
pub const ENTITLEMENTS_COLLECTION: &str = "entitlements";
pub const ACCOUNTS_COLLECTION: &str = "accounts";

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptDocument {
    #[serde(rename = "_id")]
    id: String,
    learner_id: String,
    account_id: String,
    quiz_id: String,
    quiz: QuizSnapshot,
    status: AttemptStatus,
    attempt_number: u32,
    started_at: BsonDateTime,
    #[serde(default)]
    submitted_at: Option<BsonDateTime>,
    #[serde(default)]
    duration_seconds: Option<i64>,
    #[serde(default)]
    expires_at: Option<BsonDateTime>,
    #[serde(default)]
    timer_expired: bool,
    #[serde(default)]
    answers: Vec<AnswerRecord>,
    #[serde(default)]
    score: Option<ScoreSummary>,
    #[serde(default)]
    topic_breakdown: TopicBreakdown,
    feedback: FeedbackMeta,
    #[serde(default)]
    feedback_payload: Option<serde_json::Value>,
    #[serde(default)]
    performance_analysis: Option<serde_json::Value>,
    #[serde(default)]
    proctoring: Option<ProctoringReport>,
}

impl From<&Attempt> for AttemptDocument {
    fn from(a: &Attempt) -> Self {
        Self {
            id: a.id.clone(),
            learner_id: a.learner_id.clone(),
            account_id: a.account_id.clone(),
            quiz_id: a.quiz_id.clone(),
            quiz: a.quiz.clone(),
            status: a.status,
            attempt_number: a.attempt_number,
            started_at: chrono_to_bson(a.started_at),
            submitted_at: a.submitted_at.map(chrono_to_bson),
            duration_seconds: a.duration_seconds,
            expires_at: a.expires_at.map(chrono_to_bson),
            timer_expired: a.timer_expired,
            answers: a.answers.clone(),
            score: a.score.clone(),
            topic_breakdown: a.topic_breakdown.clone(),
            feedback: a.feedback.clone(),
            feedback_payload: a.feedback_payload.clone(),
            performance_analysis: a.performance_analysis.clone(),
            proctoring: a.proctoring.clone(),
        }
    }
}

impl From<AttemptDocument> for Attempt {
    fn from(d: AttemptDocument) -> Self {
        Self {
            id: d.id,
            learner_id: d.learner_id,
            account_id: d.account_id,
            quiz_id: d.quiz_id,
            quiz: d.quiz,
            status: d.status,
            attempt_number: d.attempt_number,
            started_at: bson_to_chrono(d.started_at),
            submitted_at: d.submitted_at.map(bson_to_chrono),
            duration_seconds: d.duration_seconds,
            expires_at: d.expires_at.map(bson_to_chrono),
            timer_expired: d.timer_expired,
            answers: d.answers,
            score: d.score,
            topic_breakdown: d.topic_breakdown,
            feedback: d.feedback,
            feedback_payload: d.feedback_payload,
            performance_analysis: d.performance_analysis,
            proctoring: d.proctoring,
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        *err.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == DUPLICATE_KEY_CODE
    )
}

fn status_strs(statuses: &[AttemptStatus]) -> Vec<&'static str> {
    statuses.iter().map(AttemptStatus::as_str).collect()
}

/// Expiry as an update pipeline, so duration is computed from each
/// document's own `started_at`.
fn expiry_pipeline(now: DateTime<Utc>) -> Vec<Document> {
    let now = chrono_to_bson(now);
    vec![doc! {
        "$set": {
            "status": AttemptStatus::Expired.as_str(),
            "submitted_at": now,
            "duration_seconds": {
                "$max": [
                    0_i64,
                    { "$toLong": { "$floor": { "$divide": [ { "$subtract": [now, "$started_at"] }, 1000 ] } } }
                ]
            }
        }
    }]
}

/// Creates the indexes the lifecycle relies on. The partial unique index is
/// what makes concurrent starts collapse onto one in-progress attempt.
pub async fn ensure_indexes(db: &Database) -> Result<()> {
    let attempts = db.collection::<Document>(ATTEMPTS_COLLECTION);
    let attempt_indexes = vec![
        IndexModel::builder()
            .keys(doc! { "learner_id": 1, "quiz_id": 1 })
            .options(
                IndexOptions::builder()
                    .name("one_in_progress_per_learner_quiz".to_string())
                    .unique(true)
                    .partial_filter_expression(doc! {
                        "status": AttemptStatus::InProgress.as_str()
                    })
                    .build(),
            )
            .build(),
        IndexModel::builder()
            .keys(doc! { "status": 1, "expires_at": 1 })
            .options(IndexOptions::builder().name("status_expires_at".to_string()).build())
            .build(),
        IndexModel::builder()
            .keys(doc! { "feedback.status": 1, "quiz.subject": 1, "submitted_at": 1 })
            .options(IndexOptions::builder().name("feedback_retry".to_string()).build())
            .build(),
    ];
    attempts
        .create_indexes(attempt_indexes)
        .await
        .context("Failed to create attempt indexes")?;

    db.collection::<Document>(QUESTIONS_COLLECTION)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "quiz_id": 1, "position": 1 })
                .build(),
        )
        .await
        .context("Failed to create question index")?;

    db.collection::<Document>(ENTITLEMENTS_COLLECTION)
        .create_index(
            IndexModel::builder()
                .keys(doc! { "learner_id": 1, "quiz_id": 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build(),
        )
        .await
        .context("Failed to create entitlement index")?;

    tracing::info!("MongoDB indexes ensured");
    Ok(())
}

pub struct MongoAttemptStore {
    db: Database,
    attempts: Collection<AttemptDocument>,
}

impl MongoAttemptStore {
    pub fn new(db: Database) -> Self {
        let attempts = db.collection::<AttemptDocument>(ATTEMPTS_COLLECTION);
        Self { db, attempts }
    }
}

#[async_trait]
impl AttemptStore for MongoAttemptStore {
    async fn insert(&self, attempt: &Attempt) -> Result<InsertOutcome> {
        let document = AttemptDocument::from(attempt);
        track_db_operation("insert_one", ATTEMPTS_COLLECTION, async {
            match self.attempts.insert_one(&document).await {
                Ok(_) => Ok(InsertOutcome::Inserted),
                Err(e) if is_duplicate_key(&e) => Ok(InsertOutcome::DuplicateInProgress),
                Err(e) => Err(anyhow::Error::new(e).context("Failed to insert attempt")),
            }
        })
        .await
    }

    async fn get(&self, attempt_id: &str) -> Result<Option<Attempt>> {
        let found = track_db_operation("find_one", ATTEMPTS_COLLECTION, async {
            self.attempts
                .find_one(doc! { "_id": attempt_id })
                .await
                .context("Failed to load attempt")
        })
        .await?;
        Ok(found.map(Attempt::from))
    }

    async fn find_in_progress(&self, learner_id: &str, quiz_id: &str) -> Result<Option<Attempt>> {
        let found = track_db_operation("find_one", ATTEMPTS_COLLECTION, async {
            self.attempts
                .find_one(doc! {
                    "learner_id": learner_id,
                    "quiz_id": quiz_id,
                    "status": AttemptStatus::InProgress.as_str(),
                })
                .sort(doc! { "started_at": -1 })
                .await
                .context("Failed to look up in-progress attempt")
        })
        .await?;
        Ok(found.map(Attempt::from))
    }

    async fn count_all(&self, learner_id: &str, quiz_id: &str) -> Result<u64> {
        track_db_operation("count_documents", ATTEMPTS_COLLECTION, async {
            self.attempts
                .count_documents(doc! { "learner_id": learner_id, "quiz_id": quiz_id })
                .await
                .context("Failed to count attempts")
        })
        .await
    }

    async fn count_completed(&self, learner_id: &str, quiz_id: &str) -> Result<u64> {
        track_db_operation("count_documents", ATTEMPTS_COLLECTION, async {
            self.attempts
                .count_documents(doc! {
                    "learner_id": learner_id,
                    "quiz_id": quiz_id,
                    "status": { "$in": status_strs(&AttemptStatus::COMPLETED) },
                })
                .await
                .context("Failed to count completed attempts")
        })
        .await
    }

    async fn replace_if_status(
        &self,
        attempt: &Attempt,
        expected: AttemptStatus,
    ) -> Result<bool> {
        let document = AttemptDocument::from(attempt);
        let result = track_db_operation("replace_one", ATTEMPTS_COLLECTION, async {
            self.attempts
                .replace_one(
                    doc! { "_id": &attempt.id, "status": expected.as_str() },
                    &document,
                )
                .await
                .context("Failed to replace attempt")
        })
        .await?;
        Ok(result.matched_count == 1)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = track_db_operation("update_many", ATTEMPTS_COLLECTION, async {
            self.attempts
                .update_many(
                    doc! {
                        "status": AttemptStatus::InProgress.as_str(),
                        "expires_at": { "$ne": null, "$lt": chrono_to_bson(now) },
                    },
                    expiry_pipeline(now),
                )
                .await
                .context("Failed to expire overdue attempts")
        })
        .await?;
        Ok(result.modified_count)
    }

    async fn expire_stale_untimed(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = track_db_operation("update_many", ATTEMPTS_COLLECTION, async {
            self.attempts
                .update_many(
                    doc! {
                        "status": AttemptStatus::InProgress.as_str(),
                        "expires_at": null,
                        "started_at": { "$lt": chrono_to_bson(started_before) },
                    },
                    expiry_pipeline(now),
                )
                .await
                .context("Failed to expire stale untimed attempts")
        })
        .await?;
        Ok(result.modified_count)
    }

    async fn find_for_feedback_retry(&self, filter: &RetryFilter) -> Result<Vec<Attempt>> {
        let feedback_statuses: Vec<&str> =
            filter.feedback_statuses.iter().map(|s| s.as_str()).collect();
        let mut query = doc! {
            "status": { "$nin": status_strs(&[AttemptStatus::InProgress, AttemptStatus::Expired]) },
            "feedback.status": { "$in": feedback_statuses },
        };
        if let Some(subject) = filter.subject.as_deref() {
            query.insert(
                "quiz.subject",
                doc! { "$regex": format!("^{}$", regex::escape(subject)), "$options": "i" },
            );
        }

        let documents: Vec<AttemptDocument> =
            track_db_operation("find", ATTEMPTS_COLLECTION, async {
                let cursor = self
                    .attempts
                    .find(query)
                    .sort(doc! { "submitted_at": 1 })
                    .limit(filter.limit as i64)
                    .await
                    .context("Failed to query feedback retry candidates")?;
                cursor
                    .try_collect()
                    .await
                    .context("Failed to read feedback retry candidates")
            })
            .await?;

        Ok(documents.into_iter().map(Attempt::from).collect())
    }

    async fn ping(&self) -> Result<()> {
        self.db
            .run_command(doc! { "ping": 1 })
            .await
            .context("MongoDB ping failed")?;
        Ok(())
    }
}

pub struct MongoQuestionStore {
    quizzes: Collection<Quiz>,
    questions: Collection<Question>,
}

impl MongoQuestionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            quizzes: db.collection(QUIZZES_COLLECTION),
            questions: db.collection(QUESTIONS_COLLECTION),
        }
    }
}

#[async_trait]
impl QuestionStore for MongoQuestionStore {
    async fn get_quiz(&self, quiz_id: &str) -> Result<Option<Quiz>> {
        track_db_operation("find_one", QUIZZES_COLLECTION, async {
            self.quizzes
                .find_one(doc! { "_id": quiz_id })
                .await
                .context("Failed to load quiz")
        })
        .await
    }

    async fn get_questions(&self, quiz_id: &str) -> Result<Vec<Question>> {
        track_db_operation("find", QUESTIONS_COLLECTION, async {
            let cursor = self
                .questions
                .find(doc! { "quiz_id": quiz_id })
                .sort(doc! { "position": 1 })
                .await
                .context("Failed to query questions")?;
            cursor
                .try_collect()
                .await
                .context("Failed to read questions")
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct AccountDocument {
    status: AccountStatus,
}

pub struct MongoEntitlementOracle {
    entitlements: Collection<Document>,
    accounts: Collection<AccountDocument>,
    attempts: Arc<dyn AttemptStore>,
}

impl MongoEntitlementOracle {
    pub fn new(db: &Database, attempts: Arc<dyn AttemptStore>) -> Self {
        Self {
            entitlements: db.collection(ENTITLEMENTS_COLLECTION),
            accounts: db.collection(ACCOUNTS_COLLECTION),
            attempts,
        }
    }
}

#[async_trait]
impl EntitlementOracle for MongoEntitlementOracle {
    async fn is_entitled(&self, learner: &LearnerContext, quiz: &Quiz) -> Result<bool> {
        if quiz.is_trial {
            return Ok(true);
        }

        let grant = track_db_operation("count_documents", ENTITLEMENTS_COLLECTION, async {
            self.entitlements
                .count_documents(doc! { "learner_id": &learner.learner_id, "quiz_id": &quiz.id })
                .await
                .context("Failed to check entitlement grant")
        })
        .await?;

        let account = track_db_operation("find_one", ACCOUNTS_COLLECTION, async {
            self.accounts
                .find_one(doc! { "_id": &learner.account_id })
                .await
                .context("Failed to load account")
        })
        .await?;

        Ok(entitlement_decision(
            quiz,
            learner,
            grant > 0,
            account.map(|a| a.status),
        ))
    }

    async fn completed_attempt_count(&self, learner_id: &str, quiz_id: &str) -> Result<u64> {
        self.attempts.count_completed(learner_id, quiz_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeedbackStatus, Track};
    use chrono::TimeZone;

    fn sample_attempt() -> Attempt {
        let started = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        Attempt {
            id: "a-1".into(),
            learner_id: "child".into(),
            account_id: "parent".into(),
            quiz_id: "q-1".into(),
            quiz: QuizSnapshot {
                name: "Year 5 Reading".into(),
                subject: "Reading".into(),
                year_level: Some(5),
                total_points: 10,
                track: Track::Objective,
            },
            status: AttemptStatus::InProgress,
            attempt_number: 2,
            started_at: started,
            submitted_at: None,
            duration_seconds: None,
            expires_at: Some(started + chrono::Duration::minutes(31)),
            timer_expired: false,
            answers: vec![],
            score: None,
            topic_breakdown: TopicBreakdown::new(),
            feedback: FeedbackMeta::pending(),
            feedback_payload: None,
            performance_analysis: None,
            proctoring: None,
        }
    }

    #[test]
    fn test_document_stores_native_dates() {
        let attempt = sample_attempt();
        let bson = mongodb::bson::to_document(&AttemptDocument::from(&attempt)).unwrap();
        assert!(bson.get_datetime("started_at").is_ok());
        assert!(bson.get_datetime("expires_at").is_ok());
        assert_eq!(bson.get_str("status").unwrap(), "in_progress");
        assert_eq!(bson.get_str("_id").unwrap(), "a-1");
    }

    #[test]
    fn test_document_conversion_preserves_attempt() {
        let mut attempt = sample_attempt();
        attempt.feedback.status = FeedbackStatus::Queued;
        let back = Attempt::from(AttemptDocument::from(&attempt));
        assert_eq!(back.started_at, attempt.started_at);
        assert_eq!(back.expires_at, attempt.expires_at);
        assert_eq!(back.feedback.status, FeedbackStatus::Queued);
        assert_eq!(back.attempt_number, 2);
    }

    #[test]
    fn test_expiry_pipeline_sets_status() {
        let pipeline = expiry_pipeline(Utc::now());
        let set = pipeline[0].get_document("$set").unwrap();
        assert_eq!(set.get_str("status").unwrap(), "expired");
        assert!(set.contains_key("duration_seconds"));
    }
}
