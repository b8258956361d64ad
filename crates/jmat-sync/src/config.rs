//! Process configuration, read once at startup from `JMAT_*` variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use jmat_core::DEFAULT_SATURATION_HITS;
use thiserror::Error;

pub const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
pub const DEFAULT_USER_AGENT: &str = "jmat/0.1 (+job-match-and-track)";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub match_threshold: u32,
    pub saturation_hits: u32,
    pub retention_days: u32,
    pub poll_interval: Duration,
    pub sync_cron: Option<String>,
    pub track_reaction: String,
    pub confirm_reaction: String,
    pub slack_channel_id: String,
    pub slack_bot_token: Option<String>,
    pub slack_api_base: String,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub web_bind: SocketAddr,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub db_acquire_timeout: Duration,
    pub log_level: String,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key))
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        // blank values count as unset
        let optional = |var: &str| -> Option<String> {
            lookup(var)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let or_default =
            |var: &str, default: &str| -> String { optional(var).unwrap_or_else(|| default.to_string()) };
        let invalid = |var: &str, reason: String| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            reason,
        };
        let parse_u32 = |var: &str, default: &str| -> Result<u32, ConfigError> {
            or_default(var, default)
                .parse::<u32>()
                .map_err(|e| invalid(var, e.to_string()))
        };
        let parse_u64 = |var: &str, default: &str| -> Result<u64, ConfigError> {
            or_default(var, default)
                .parse::<u64>()
                .map_err(|e| invalid(var, e.to_string()))
        };
        let marker = |var: &str, default: &str| -> Result<String, ConfigError> {
            let value = or_default(var, default).trim_matches(':').to_string();
            if value.is_empty() {
                return Err(invalid(var, "reaction marker is empty".to_string()));
            }
            Ok(value)
        };

        let match_threshold = parse_u32("JMAT_MATCH_THRESHOLD", "15")?;
        if match_threshold > 100 {
            return Err(invalid(
                "JMAT_MATCH_THRESHOLD",
                format!("{match_threshold} is not a percentage"),
            ));
        }

        let saturation_hits =
            parse_u32("JMAT_SATURATION_HITS", &DEFAULT_SATURATION_HITS.to_string())?;
        if saturation_hits == 0 {
            return Err(invalid("JMAT_SATURATION_HITS", "must be at least 1".to_string()));
        }

        let poll_minutes = parse_u64("JMAT_POLL_INTERVAL_MINUTES", "15")?;
        if poll_minutes == 0 {
            return Err(invalid(
                "JMAT_POLL_INTERVAL_MINUTES",
                "must be at least 1".to_string(),
            ));
        }

        let web_bind = or_default("JMAT_WEB_BIND", "0.0.0.0:8000")
            .parse::<SocketAddr>()
            .map_err(|e| invalid("JMAT_WEB_BIND", e.to_string()))?;

        let slack_channel_id = optional("JMAT_SLACK_CHANNEL_ID")
            .ok_or_else(|| ConfigError::MissingEnvVar("JMAT_SLACK_CHANNEL_ID".to_string()))?;

        Ok(Self {
            match_threshold,
            saturation_hits,
            retention_days: parse_u32("JMAT_RETENTION_DAYS", "30")?,
            poll_interval: Duration::from_secs(poll_minutes * 60),
            sync_cron: optional("JMAT_SYNC_CRON"),
            track_reaction: marker("JMAT_TRACK_REACTION", "white_check_mark")?,
            confirm_reaction: marker("JMAT_CONFIRM_REACTION", "heavy_check_mark")?,
            slack_channel_id,
            slack_bot_token: optional("JMAT_SLACK_BOT_TOKEN"),
            slack_api_base: or_default("JMAT_SLACK_API_BASE", DEFAULT_SLACK_API_BASE)
                .trim_end_matches('/')
                .to_string(),
            data_dir: PathBuf::from(or_default("JMAT_DATA_DIR", "./data")),
            config_dir: PathBuf::from(or_default("JMAT_CONFIG_DIR", "./config")),
            web_bind,
            http_timeout: Duration::from_secs(parse_u64("JMAT_HTTP_TIMEOUT_SECS", "20")?),
            user_agent: or_default("JMAT_USER_AGENT", DEFAULT_USER_AGENT),
            database_url: optional("DATABASE_URL"),
            db_acquire_timeout: Duration::from_secs(parse_u64(
                "JMAT_DB_ACQUIRE_TIMEOUT_SECS",
                "10",
            )?),
            log_level: or_default("JMAT_LOG_LEVEL", "info"),
        })
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("seen_jobs.json")
    }

    pub fn applications_path(&self) -> PathBuf {
        self.data_dir.join("applications.json")
    }

    pub fn taxonomy_path(&self) -> PathBuf {
        self.config_dir.join("taxonomy.yaml")
    }

    pub fn role_filter_path(&self) -> PathBuf {
        self.config_dir.join("role_filter.yaml")
    }

    pub fn sources_path(&self) -> PathBuf {
        self.config_dir.join("sources.yaml")
    }
}
