//! Durable attempt records. The store is the single source of truth for the
//! lifecycle state; every status change goes through a compare-and-set on
//! the current status.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::feedback::RetryFilter;
use crate::models::{Attempt, AttemptStatus};

use super::timer_policy::duration_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another in-progress attempt for the same learner and quiz won the race.
    DuplicateInProgress,
}

#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert(&self, attempt: &Attempt) -> Result<InsertOutcome>;

    async fn get(&self, attempt_id: &str) -> Result<Option<Attempt>>;

    async fn find_in_progress(&self, learner_id: &str, quiz_id: &str) -> Result<Option<Attempt>>;

    /// All attempts ever created for the pair, whatever their status.
    async fn count_all(&self, learner_id: &str, quiz_id: &str) -> Result<u64>;

    async fn count_completed(&self, learner_id: &str, quiz_id: &str) -> Result<u64>;

    /// Replaces the stored record only if its status still equals `expected`.
    /// Returns `false` when the record moved on (or vanished) in between.
    async fn replace_if_status(&self, attempt: &Attempt, expected: AttemptStatus)
        -> Result<bool>;

    /// In-progress attempts whose deadline has passed become `expired`.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Untimed in-progress attempts started before `started_before` become
    /// `expired`.
    async fn expire_stale_untimed(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    async fn find_for_feedback_retry(&self, filter: &RetryFilter) -> Result<Vec<Attempt>>;

    async fn ping(&self) -> Result<()>;
}

/// Marks an attempt expired in place.
pub fn apply_expiry(attempt: &mut Attempt, now: DateTime<Utc>) {
    attempt.status = AttemptStatus::Expired;
    attempt.submitted_at = Some(now);
    attempt.duration_seconds = Some(duration_seconds(attempt.started_at, now));
}

/// Process-local store used by tests and local development.
#[derive(Default)]
pub struct InMemoryAttemptStore {
    attempts: RwLock<HashMap<String, Attempt>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn insert(&self, attempt: &Attempt) -> Result<InsertOutcome> {
        let mut attempts = self.attempts.write().await;

        if attempt.status == AttemptStatus::InProgress
            && attempts.values().any(|existing| {
                existing.status == AttemptStatus::InProgress
                    && existing.learner_id == attempt.learner_id
                    && existing.quiz_id == attempt.quiz_id
            })
        {
            return Ok(InsertOutcome::DuplicateInProgress);
        }

        if attempts.contains_key(&attempt.id) {
            anyhow::bail!("Attempt {} already exists", attempt.id);
        }

        attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, attempt_id: &str) -> Result<Option<Attempt>> {
        Ok(self.attempts.read().await.get(attempt_id).cloned())
    }

    async fn find_in_progress(&self, learner_id: &str, quiz_id: &str) -> Result<Option<Attempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .values()
            .filter(|a| {
                a.status == AttemptStatus::InProgress
                    && a.learner_id == learner_id
                    && a.quiz_id == quiz_id
            })
            .max_by_key(|a| a.started_at)
            .cloned())
    }

    async fn count_all(&self, learner_id: &str, quiz_id: &str) -> Result<u64> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .values()
            .filter(|a| a.learner_id == learner_id && a.quiz_id == quiz_id)
            .count() as u64)
    }

    async fn count_completed(&self, learner_id: &str, quiz_id: &str) -> Result<u64> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .values()
            .filter(|a| {
                a.learner_id == learner_id && a.quiz_id == quiz_id && a.status.is_completed()
            })
            .count() as u64)
    }

    async fn replace_if_status(
        &self,
        attempt: &Attempt,
        expected: AttemptStatus,
    ) -> Result<bool> {
        let mut attempts = self.attempts.write().await;
        match attempts.get_mut(&attempt.id) {
            Some(current) if current.status == expected => {
                *current = attempt.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut attempts = self.attempts.write().await;
        let mut expired = 0;
        for attempt in attempts.values_mut() {
            let overdue = attempt.expires_at.is_some_and(|deadline| deadline < now);
            if attempt.status == AttemptStatus::InProgress && overdue {
                apply_expiry(attempt, now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn expire_stale_untimed(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut attempts = self.attempts.write().await;
        let mut expired = 0;
        for attempt in attempts.values_mut() {
            if attempt.status == AttemptStatus::InProgress
                && attempt.expires_at.is_none()
                && attempt.started_at < started_before
            {
                apply_expiry(attempt, now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn find_for_feedback_retry(&self, filter: &RetryFilter) -> Result<Vec<Attempt>> {
        let attempts = self.attempts.read().await;
        let mut matching: Vec<Attempt> = attempts
            .values()
            .filter(|a| !matches!(a.status, AttemptStatus::InProgress | AttemptStatus::Expired))
            .filter(|a| filter.feedback_statuses.contains(&a.feedback.status))
            .filter(|a| {
                filter
                    .subject
                    .as_deref()
                    .map_or(true, |subject| a.quiz.subject.eq_ignore_ascii_case(subject))
            })
            .cloned()
            .collect();

        matching.sort_by_key(|a| a.submitted_at);
        matching.truncate(filter.limit as usize);
        Ok(matching)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
