use std::sync::Arc;

use mongodb::Client as MongoClient;
use redis::aio::ConnectionManager;

use crate::config::Config;

pub mod attempt_service;
pub mod attempt_store;
pub mod cache;
pub mod entitlement;
pub mod expiry_sweeper;
pub mod feedback_generator;
pub mod feedback_orchestrator;
pub mod mongo_store;
pub mod question_store;
pub mod scoring;
pub mod timer_policy;

use attempt_store::AttemptStore;
use cache::{ExpiringCache, RedisCache};
use entitlement::EntitlementOracle;
use feedback_generator::{build_generator, FeedbackGenerator};
use feedback_orchestrator::FeedbackOrchestrator;
use mongo_store::{MongoAttemptStore, MongoEntitlementOracle, MongoQuestionStore};
use question_store::QuestionStore;

pub struct AppState {
    pub config: Config,
    pub attempts: Arc<dyn AttemptStore>,
    pub questions: Arc<dyn QuestionStore>,
    pub entitlements: Arc<dyn EntitlementOracle>,
    pub generator: Arc<dyn FeedbackGenerator>,
    pub cache: Arc<dyn ExpiringCache>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);
        mongo_store::ensure_indexes(&mongo).await?;

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        let cache = RedisCache::new(redis);
        tokio::time::timeout(std::time::Duration::from_secs(5), cache.ping())
            .await
            .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let attempts: Arc<dyn AttemptStore> = Arc::new(MongoAttemptStore::new(mongo.clone()));
        let questions = Arc::new(MongoQuestionStore::new(&mongo));
        let entitlements = Arc::new(MongoEntitlementOracle::new(&mongo, attempts.clone()));
        let generator = build_generator(&config.feedback);

        Ok(Self::from_parts(
            config,
            attempts,
            questions,
            entitlements,
            generator,
            Arc::new(cache),
        ))
    }

    /// Assembles state from already-built collaborators.
    pub fn from_parts(
        config: Config,
        attempts: Arc<dyn AttemptStore>,
        questions: Arc<dyn QuestionStore>,
        entitlements: Arc<dyn EntitlementOracle>,
        generator: Arc<dyn FeedbackGenerator>,
        cache: Arc<dyn ExpiringCache>,
    ) -> Self {
        Self {
            config,
            attempts,
            questions,
            entitlements,
            generator,
            cache,
        }
    }

    pub fn feedback_orchestrator(&self) -> FeedbackOrchestrator {
        FeedbackOrchestrator::new(
            self.attempts.clone(),
            self.questions.clone(),
            self.generator.clone(),
            &self.config.feedback,
        )
    }
}
