use anyhow::Result;

use crate::db::Database;

const DEFAULT_RUNNER_ONLINE_TIMEOUT_SECS: i64 = 7200;

/// Longest accepted runner online window (one year).
pub const MAX_RUNNER_ONLINE_TIMEOUT_SECS: i64 = 365 * 24 * 3600;

/// Runtime-configurable admission settings.
///
/// Loaded from the `settings` table, with compile-time defaults as fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionSettings {
    /// Gate instance runners on compute-minute quota.
    pub enforce_quota: bool,
    /// Emergency switch: stop quota enforcement while queueing is degraded.
    pub disaster_recovery_disable_quota: bool,
    /// Instance-wide minutes limit for namespaces without their own (0 = unlimited).
    pub default_minutes_limit: f64,
    /// Runners not heard from within this window count as offline.
    pub runner_online_timeout_secs: i64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            enforce_quota: true,
            disaster_recovery_disable_quota: false,
            default_minutes_limit: 0.0,
            runner_online_timeout_secs: DEFAULT_RUNNER_ONLINE_TIMEOUT_SECS,
        }
    }
}

impl AdmissionSettings {
    /// Whether the quota strategy takes part in admission at all.
    pub fn quota_enforced(&self) -> bool {
        self.enforce_quota && !self.disaster_recovery_disable_quota
    }

    /// Earliest contact time of a runner that still counts as online.
    ///
    /// A window that cannot be subtracted from `now` falls back to the default.
    pub fn online_since(&self, now: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
        chrono::Duration::try_seconds(self.runner_online_timeout_secs)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or_else(|| now - chrono::Duration::seconds(DEFAULT_RUNNER_ONLINE_TIMEOUT_SECS))
    }
}

/// Load settings from the DB `settings` table, falling back to defaults for missing keys.
pub async fn load_settings(db: &Database) -> Result<AdmissionSettings> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM settings")
        .fetch_all(&db.pool)
        .await?;

    let mut settings = AdmissionSettings::default();

    for (key, value) in &rows {
        match key.as_str() {
            "ci_enforce_minutes_quota" => {
                if let Ok(v) = value.parse() {
                    settings.enforce_quota = v;
                }
            }
            "ci_queueing_disaster_recovery_disable_quota" => {
                if let Ok(v) = value.parse() {
                    settings.disaster_recovery_disable_quota = v;
                }
            }
            "shared_runners_minutes" => {
                if let Ok(v) = value.parse::<f64>() {
                    if v >= 0.0 {
                        settings.default_minutes_limit = v;
                    }
                }
            }
            "runner_online_timeout_secs" => {
                if let Ok(v) = value.parse::<i64>() {
                    if (1..=MAX_RUNNER_ONLINE_TIMEOUT_SECS).contains(&v) {
                        settings.runner_online_timeout_secs = v;
                    }
                }
            }
            _ => {} // Ignore unknown keys
        }
    }

    Ok(settings)
}

/// Persist a single setting to the DB.
pub async fn save_setting(db: &Database, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .execute(&db.pool)
    .await?;

    Ok(())
}
