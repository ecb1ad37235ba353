use std::time::Duration;

use crate::engine::preview::PreviewSettings;
use crate::models::ApprovalPolicy;

const INSECURE_JWT_SECRET: &str = "CHANGE_ME_DEV_ONLY_SECRET";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    /// Comma-separated list of webhook URLs to notify on approval events.
    pub webhook_urls: Vec<String>,
    pub webhook_secret: Option<String>,
    /// Open previews older than this are rolled back by the sweep.
    pub preview_ceiling: Duration,
    pub sweep_interval: Duration,
    pub preview_sample_rows: usize,
    /// Row cap for immediately executed reads.
    pub query_max_rows: usize,
    /// Per-request deadline, separate from the preview ceiling.
    pub request_timeout: Duration,
    pub pool_acquire_timeout: Duration,
    pub finished_retention: Duration,
    pub approvals_required: u32,
    pub rejections_required: u32,
    /// Browser origin allowed by CORS besides localhost.
    pub cors_origin: String,
}

impl Config {
    pub fn preview_settings(&self) -> PreviewSettings {
        PreviewSettings {
            sample_rows: self.preview_sample_rows,
            ceiling: chrono::Duration::from_std(self.preview_ceiling)
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
            retention: chrono::Duration::from_std(self.finished_retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    pub fn approval_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy {
            approvals_required: self.approvals_required.max(1),
            rejections_required: self.rejections_required.max(1),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            database_url: "postgres://localhost/sqlgate".into(),
            jwt_secret: INSECURE_JWT_SECRET.into(),
            webhook_urls: Vec::new(),
            webhook_secret: None,
            preview_ceiling: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            preview_sample_rows: 20,
            query_max_rows: 1000,
            request_timeout: Duration::from_secs(30),
            pool_acquire_timeout: Duration::from_secs(5),
            finished_retention: Duration::from_secs(86_400),
            approvals_required: 1,
            rejections_required: 1,
            cors_origin: "http://localhost:3000".into(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let jwt_secret =
        std::env::var("SQLGATE_JWT_SECRET").unwrap_or_else(|_| INSECURE_JWT_SECRET.into());

    if jwt_secret == INSECURE_JWT_SECRET {
        let env_mode = std::env::var("SQLGATE_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "SQLGATE_JWT_SECRET is still the insecure placeholder. \
                 Set a real secret before running in production."
            );
        }
        tracing::warn!("SQLGATE_JWT_SECRET is not set, using insecure placeholder");
    }

    let defaults = Config::default();
    Ok(Config {
        port: env_or("SQLGATE_PORT", defaults.port),
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        jwt_secret,
        webhook_urls: std::env::var("SQLGATE_WEBHOOK_URLS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        webhook_secret: std::env::var("SQLGATE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty()),
        preview_ceiling: secs("SQLGATE_PREVIEW_CEILING_SECS", 300),
        sweep_interval: secs("SQLGATE_SWEEP_INTERVAL_SECS", 30),
        preview_sample_rows: env_or("SQLGATE_PREVIEW_SAMPLE_ROWS", defaults.preview_sample_rows),
        query_max_rows: env_or("SQLGATE_QUERY_MAX_ROWS", defaults.query_max_rows),
        request_timeout: secs("SQLGATE_REQUEST_TIMEOUT_SECS", 30),
        pool_acquire_timeout: secs("SQLGATE_POOL_ACQUIRE_TIMEOUT_SECS", 5),
        finished_retention: secs("SQLGATE_FINISHED_RETENTION_SECS", 86_400),
        approvals_required: env_or("SQLGATE_APPROVALS_REQUIRED", 1),
        rejections_required: env_or("SQLGATE_REJECTIONS_REQUIRED", 1),
        cors_origin: std::env::var("SQLGATE_CORS_ORIGIN").unwrap_or(defaults.cors_origin),
    })
}
