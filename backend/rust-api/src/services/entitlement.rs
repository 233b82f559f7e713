use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::models::{AccountStatus, LearnerContext, Quiz};

use super::attempt_store::AttemptStore;

/// Answers whether a learner may take a quiz, and how many completed
/// attempts they already have.
#[async_trait]
pub trait EntitlementOracle: Send + Sync {
    async fn is_entitled(&self, learner: &LearnerContext, quiz: &Quiz) -> Result<bool>;

    async fn completed_attempt_count(&self, learner_id: &str, quiz_id: &str) -> Result<u64>;
}

/// Trial quizzes always pass; otherwise an explicit grant, or an active
/// account whose learner sits in the quiz's year level.
pub fn entitlement_decision(
    quiz: &Quiz,
    learner: &LearnerContext,
    has_grant: bool,
    account_status: Option<AccountStatus>,
) -> bool {
    if quiz.is_trial || has_grant {
        return true;
    }

    let account_active = account_status == Some(AccountStatus::Active);
    let year_matches = match (quiz.resolved_year_level(), learner.year_level) {
        (Some(quiz_year), Some(learner_year)) => quiz_year == learner_year,
        _ => false,
    };

    account_active && year_matches
}

/// In-process oracle with explicit grants and account statuses.
pub struct StaticEntitlementOracle {
    attempts: Arc<dyn AttemptStore>,
    grants: RwLock<HashSet<(String, String)>>,
    accounts: RwLock<HashMap<String, AccountStatus>>,
}

impl StaticEntitlementOracle {
    pub fn new(attempts: Arc<dyn AttemptStore>) -> Self {
        Self {
            attempts,
            grants: RwLock::new(HashSet::new()),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn grant(&self, learner_id: &str, quiz_id: &str) {
        self.grants
            .write()
            .await
            .insert((learner_id.to_string(), quiz_id.to_string()));
    }

    pub async fn set_account_status(&self, account_id: &str, status: AccountStatus) {
        self.accounts
            .write()
            .await
            .insert(account_id.to_string(), status);
    }
}

#[async_trait]
impl EntitlementOracle for StaticEntitlementOracle {
    async fn is_entitled(&self, learner: &LearnerContext, quiz: &Quiz) -> Result<bool> {
        let has_grant = self
            .grants
            .read()
            .await
            .contains(&(learner.learner_id.clone(), quiz.id.clone()));
        let account_status = self.accounts.read().await.get(&learner.account_id).copied();
        Ok(entitlement_decision(quiz, learner, has_grant, account_status))
    }

    async fn completed_attempt_count(&self, learner_id: &str, quiz_id: &str) -> Result<u64> {
        self.attempts.count_completed(learner_id, quiz_id).await
    }
}
