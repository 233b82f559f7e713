use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub bind_addr: String,
    pub attempts: AttemptSettings,
    pub sweeper: SweeperSettings,
    pub feedback: FeedbackSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttemptSettings {
    pub default_max_attempts: u32,
    pub grace_period_secs: u64,
    pub start_rate_limit_per_minute: u32,
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self {
            default_max_attempts: 5,
            grace_period_secs: 60,
            start_rate_limit_per_minute: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweeperSettings {
    pub interval_secs: u64,
    pub stale_untimed_hours: u64,
    pub run_in_api: bool,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            stale_untimed_hours: 24,
            run_in_api: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackMode {
    Subprocess,
    Http,
}

impl std::str::FromStr for FeedbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "subprocess" => Ok(FeedbackMode::Subprocess),
            "http" => Ok(FeedbackMode::Http),
            other => Err(format!("unknown feedback mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackSettings {
    pub mode: FeedbackMode,
    pub timeout_secs: u64,
    pub python_bin: String,
    pub objective_script: String,
    pub writing_script: String,
    pub http_base_url: String,
    pub retry_batch_limit: u32,
}

/// Bulk retry never processes more than this many attempts per call.
pub const MAX_RETRY_BATCH: u32 = 50;

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            mode: FeedbackMode::Subprocess,
            timeout_secs: 60,
            python_bin: "python3".to_string(),
            objective_script: "subject_feedback/gemini_subject_feedback.py".to_string(),
            writing_script: "ai/gemini_writing_eval.py".to_string(),
            http_base_url: "http://localhost:8000".to_string(),
            retry_batch_limit: MAX_RETRY_BATCH,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Root .env first, then local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // config/*.toml + ENV overrides (prefix APP__)
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

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
            .unwrap_or_else(|_| "quizattempts".to_string());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let bind_addr = settings
            .get_string("server.bind_addr")
            .or_else(|_| env::var("BIND_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let attempt_defaults = AttemptSettings::default();
        let attempts = AttemptSettings {
            default_max_attempts: int_setting(
                &settings,
                "attempts.default_max_attempts",
                "DEFAULT_MAX_ATTEMPTS",
            )
            .map(|v| v as u32)
            .unwrap_or(attempt_defaults.default_max_attempts),
            grace_period_secs: int_setting(&settings, "attempts.grace_period_secs", "GRACE_PERIOD_SECS")
                .map(|v| v as u64)
                .unwrap_or(attempt_defaults.grace_period_secs),
            start_rate_limit_per_minute: int_setting(
                &settings,
                "attempts.start_rate_limit_per_minute",
                "START_RATE_LIMIT_PER_MINUTE",
            )
            .map(|v| v as u32)
            .unwrap_or(attempt_defaults.start_rate_limit_per_minute),
        };

        let sweeper_defaults = SweeperSettings::default();
        let sweeper = SweeperSettings {
            interval_secs: int_setting(&settings, "sweeper.interval_secs", "SWEEPER_INTERVAL_SECS")
                .map(|v| v as u64)
                .unwrap_or(sweeper_defaults.interval_secs),
            stale_untimed_hours: int_setting(
                &settings,
                "sweeper.stale_untimed_hours",
                "SWEEPER_STALE_UNTIMED_HOURS",
            )
            .map(|v| v as u64)
            .unwrap_or(sweeper_defaults.stale_untimed_hours),
            run_in_api: settings
                .get_bool("sweeper.run_in_api")
                .ok()
                .or_else(|| env::var("SWEEPER_RUN_IN_API").ok().map(|v| v != "0" && v != "false"))
                .unwrap_or(sweeper_defaults.run_in_api),
        };

        let feedback_defaults = FeedbackSettings::default();
        let mode = match settings
            .get_string("feedback.mode")
            .or_else(|_| env::var("FEEDBACK_MODE"))
        {
            Ok(raw) => raw.parse().map_err(config::ConfigError::Message)?,
            Err(_) => feedback_defaults.mode,
        };
        let feedback = FeedbackSettings {
            mode,
            timeout_secs: int_setting(&settings, "feedback.timeout_secs", "FEEDBACK_TIMEOUT_SECS")
                .map(|v| v as u64)
                .unwrap_or(feedback_defaults.timeout_secs),
            python_bin: string_setting(&settings, "feedback.python_bin", "FEEDBACK_PYTHON_BIN")
                .unwrap_or(feedback_defaults.python_bin),
            objective_script: string_setting(
                &settings,
                "feedback.objective_script",
                "FEEDBACK_OBJECTIVE_SCRIPT",
            )
            .unwrap_or(feedback_defaults.objective_script),
            writing_script: string_setting(
                &settings,
                "feedback.writing_script",
                "FEEDBACK_WRITING_SCRIPT",
            )
            .unwrap_or(feedback_defaults.writing_script),
            http_base_url: string_setting(&settings, "feedback.http_base_url", "PYTHON_API_URL")
                .unwrap_or(feedback_defaults.http_base_url),
            retry_batch_limit: int_setting(
                &settings,
                "feedback.retry_batch_limit",
                "FEEDBACK_RETRY_BATCH_LIMIT",
            )
            .map(|v| (v as u32).clamp(1, MAX_RETRY_BATCH))
            .unwrap_or(feedback_defaults.retry_batch_limit),
        };

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            bind_addr,
            attempts,
            sweeper,
            feedback,
        })
    }
}

fn int_setting(settings: &config::Config, key: &str, env_key: &str) -> Option<i64> {
    settings
        .get_int(key)
        .ok()
        .or_else(|| env::var(env_key).ok().and_then(|v| v.parse::<i64>().ok()))
        .filter(|v| *v >= 0)
}

fn string_setting(settings: &config::Config, key: &str, env_key: &str) -> Option<String> {
    settings
        .get_string(key)
        .ok()
        .or_else(|| env::var(env_key).ok())
        .filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn test_defaults_when_nothing_configured() {
        env::set_var("SKIP_ROOT_ENV", "1");
        env::remove_var("DEFAULT_MAX_ATTEMPTS");
        env::remove_var("FEEDBACK_MODE");
        env::remove_var("FEEDBACK_RETRY_BATCH_LIMIT");

        let config = Config::load().unwrap();
        assert_eq!(config.attempts.default_max_attempts, 5);
        assert_eq!(config.attempts.grace_period_secs, 60);
        assert_eq!(config.sweeper.interval_secs, 300);
        assert_eq!(config.sweeper.stale_untimed_hours, 24);
        assert_eq!(config.feedback.timeout_secs, 60);
        assert_eq!(config.feedback.retry_batch_limit, 50);

        env::remove_var("SKIP_ROOT_ENV");
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides_and_batch_cap() {
        env::set_var("SKIP_ROOT_ENV", "1");
        env::set_var("DEFAULT_MAX_ATTEMPTS", "3");
        env::set_var("FEEDBACK_MODE", "http");
        env::set_var("FEEDBACK_RETRY_BATCH_LIMIT", "500");

        let config = Config::load().unwrap();
        assert_eq!(config.attempts.default_max_attempts, 3);
        assert_eq!(config.feedback.mode, FeedbackMode::Http);
        assert_eq!(config.feedback.retry_batch_limit, MAX_RETRY_BATCH);

        env::remove_var("DEFAULT_MAX_ATTEMPTS");
        env::remove_var("FEEDBACK_MODE");
        env::remove_var("FEEDBACK_RETRY_BATCH_LIMIT");
        env::remove_var("SKIP_ROOT_ENV");
    }

    #[test]
    fn test_feedback_mode_parse() {
        assert_eq!("Subprocess".parse::<FeedbackMode>(), Ok(FeedbackMode::Subprocess));
        assert!("grpc".parse::<FeedbackMode>().is_err());
    }
}
