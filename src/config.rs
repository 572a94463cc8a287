use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL
    pub database_url: String,

    /// Seconds between checks for a monthly usage reset (env: USAGE_RESET_CHECK_SECS)
    pub usage_reset_check_secs: u64,

    /// Emit JSON log lines instead of human-readable text (env: LOG_FORMAT=json)
    pub log_json: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let usage_reset_check_secs = match std::env::var("USAGE_RESET_CHECK_SECS") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("USAGE_RESET_CHECK_SECS must be a number, got '{v}'"))?,
            Err(_) => 3600,
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://ci_admission.db".into()),
            usage_reset_check_secs,
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}
