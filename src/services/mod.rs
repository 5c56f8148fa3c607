use crate::config::Config;
use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

pub struct AppState {
    pub config: Config,
    pub mongo: Database,
    pub redis: ConnectionManager,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        // Create ConnectionManager with longer timeout
        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        // Test connection
        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let state = Self {
            config,
            mongo,
            redis,
        };
        state.ensure_indexes().await?;
        Ok(state)
    }

    /// Unique indexes back the race-safe create paths; they must exist
    /// before the first request is served.
    async fn ensure_indexes(&self) -> anyhow::Result<()> {
        feedback_store::FeedbackStore::new(self.mongo.clone())
            .ensure_indexes()
            .await?;
        submission_service::SubmissionService::new(self.mongo.clone())
            .ensure_indexes()
            .await?;
        Ok(())
    }
}

pub mod context_retriever;
pub mod dispatch;
pub mod feedback_service;
pub mod feedback_store;
pub mod grading;
pub mod llm_client;
pub mod prompt_builder;
pub mod rubric_service;
pub mod submission_service;
pub mod timeout_worker;
