use anyhow::Context;
use tracing_subscriber::fmt::init;

use quizattempt_api::{
    config::Config,
    services::{expiry_sweeper::ExpirySweeper, mongo_store, mongo_store::MongoAttemptStore},
};

/// Standalone expiry sweeper for deployments that run it outside the API
/// process (`SWEEPER_RUN_IN_API=false`).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let config = Config::load().context("Failed to load configuration")?;

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
        .await
        .context("Failed to connect to MongoDB")?;
    let db = mongo_client.database(&config.mongo_database);
    mongo_store::ensure_indexes(&db).await?;

    let attempts = std::sync::Arc::new(MongoAttemptStore::new(db));
    let sweeper = ExpirySweeper::new(attempts, &config.sweeper);

    sweeper.run().await?;

    Ok(())
}
