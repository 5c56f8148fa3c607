use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    pub max_retries: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackConfig {
    /// Per-record generation time budget.
    pub timeout_seconds: i64,
    pub sweep_interval_secs: u64,
    /// Worker-pool cap for batch dispatch, regardless of batch size.
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub search_api_url: String,
    pub llm: LlmConfig,
    pub feedback: FeedbackConfig,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let config_builder = config::Config::builder()
            .add_source(
                config::File::with_name(&format!("config/{}", env)).required(false), // Allow missing config file, fallback to ENV
            )
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings = config_builder.build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string());

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "gradeflow".to_string());

        let search_api_url = settings
            .get_string("search.api_url")
            .or_else(|_| env::var("SEARCH_API_URL"))
            .unwrap_or_else(|_| "http://localhost:8000".to_string());

        let llm_api_key = settings
            .get_string("llm.api_key")
            .or_else(|_| env::var("LLM_API_KEY"))
            .unwrap_or_else(|_| {
                if env == "prod" {
                    panic!("FATAL: LLM_API_KEY must be set in production!");
                }
                eprintln!("WARNING: Using empty LLM_API_KEY (dev mode only!)");
                String::new()
            });

        let llm = LlmConfig {
            api_url: settings
                .get_string("llm.api_url")
                .or_else(|_| env::var("LLM_API_URL"))
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: llm_api_key,
            model: settings
                .get_string("llm.model")
                .or_else(|_| env::var("LLM_MODEL"))
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            temperature: settings.get_float("llm.temperature").unwrap_or(0.3),
            max_tokens: settings.get_int("llm.max_tokens").unwrap_or(1500) as u32,
            timeout_secs: settings.get_int("llm.timeout_secs").unwrap_or(90) as u64,
            max_retries: settings.get_int("llm.max_retries").unwrap_or(3) as usize,
        };

        let feedback = FeedbackConfig {
            timeout_seconds: settings.get_int("feedback.timeout_seconds").unwrap_or(120),
            sweep_interval_secs: settings
                .get_int("feedback.sweep_interval_secs")
                .unwrap_or(60) as u64,
            max_parallel: settings.get_int("feedback.max_parallel").unwrap_or(10) as usize,
        };

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            search_api_url,
            llm,
            feedback,
        })
    }
}
