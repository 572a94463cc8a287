//! Compute-minute quota: per-root-namespace allotments, cost factors, and the
//! accounting that feeds them.

pub mod usage;

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::FromRow;
use tracing::debug;

use crate::db::models::VisibilityLevel;
use crate::db::{self, Database, NAMESPACE_ANCESTRY};
use crate::matching::RunnerMatcher;

/// Shared-runner minutes allotted to and consumed by one root namespace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuotaState {
    pub namespace_id: i64,
    pub minutes_used: f64,
    /// `0` means unlimited.
    pub minutes_limit: f64,
    pub extra_minutes_limit: f64,
}

impl QuotaState {
    pub fn limit_enabled(&self) -> bool {
        self.minutes_limit > 0.0
    }

    pub fn total_minutes_limit(&self) -> f64 {
        self.minutes_limit + self.extra_minutes_limit
    }

    pub fn minutes_used_up(&self) -> bool {
        self.limit_enabled() && self.minutes_used >= self.total_minutes_limit()
    }
}

#[derive(Debug, FromRow)]
struct QuotaRow {
    namespace_id: i64,
    minutes_used: f64,
    minutes_limit: Option<f64>,
    extra_minutes_limit: f64,
    has_statistics: bool,
}

impl QuotaRow {
    fn into_state(self, default_limit: f64) -> QuotaState {
        if !self.has_statistics {
            debug!(namespace = self.namespace_id, "No namespace statistics, treating usage as zero");
        }
        QuotaState {
            namespace_id: self.namespace_id,
            minutes_used: self.minutes_used,
            minutes_limit: self.minutes_limit.unwrap_or(default_limit),
            extra_minutes_limit: self.extra_minutes_limit,
        }
    }
}

const QUOTA_COLUMNS: &str = r#"
    n.id AS namespace_id,
    CAST(COALESCE(s.shared_runners_minutes_used, 0) AS REAL) AS minutes_used,
    n.shared_runners_minutes_limit AS minutes_limit,
    CAST(n.extra_shared_runners_minutes_limit AS REAL) AS extra_minutes_limit,
    s.namespace_id IS NOT NULL AS has_statistics
"#;

/// Request-scoped snapshot of quota state for a set of root namespaces.
///
/// Built once per scheduling attempt and consulted by reference; it is
/// never refreshed behind the caller's back.
#[derive(Debug, Clone, Default)]
pub struct QuotaLedger {
    states: HashMap<i64, QuotaState>,
}

impl QuotaLedger {
    pub fn new(states: impl IntoIterator<Item = QuotaState>) -> Self {
        Self {
            states: states.into_iter().map(|s| (s.namespace_id, s)).collect(),
        }
    }

    /// Read limits and usage for the given root namespaces in one query.
    ///
    /// Namespaces without a limit fall back to `default_limit`; missing
    /// statistics count as zero usage.
    pub async fn load(db: &Database, namespace_ids: &[i64], default_limit: f64) -> Result<Self> {
        if namespace_ids.is_empty() {
            return Ok(Self::default());
        }

        let sql = format!(
            "SELECT {QUOTA_COLUMNS} FROM namespaces n \
             LEFT JOIN namespace_statistics s ON s.namespace_id = n.id \
             WHERE n.id IN (SELECT value FROM json_each(?1))"
        );
        let rows = sqlx::query_as::<_, QuotaRow>(&sql)
            .bind(db::id_array(namespace_ids))
            .fetch_all(&db.pool)
            .await
            .context("Failed to load namespace quota state")?;

        Ok(Self::new(rows.into_iter().map(|r| r.into_state(default_limit))))
    }

    pub fn state(&self, namespace_id: i64) -> Option<&QuotaState> {
        self.states.get(&namespace_id)
    }

    /// Whether the root namespace has exhausted its shared-runner minutes.
    ///
    /// Unknown namespaces are never over quota.
    pub fn minutes_used_up(&self, namespace_id: i64) -> bool {
        match self.states.get(&namespace_id) {
            Some(state) => state.minutes_used_up(),
            None => {
                debug!(namespace = namespace_id, "No quota state loaded, failing open");
                false
            }
        }
    }

    /// Multiplier applied to wall-clock minutes a runner spends on a project
    /// of the given visibility. Only instance runners are billed.
    pub fn cost_factor_for(runner: &RunnerMatcher, visibility: VisibilityLevel) -> f64 {
        if !runner.is_instance_type() {
            return 0.0;
        }
        match visibility {
            VisibilityLevel::Public => runner.public_projects_minutes_cost_factor,
            VisibilityLevel::Internal | VisibilityLevel::Private => {
                runner.private_projects_minutes_cost_factor
            }
        }
    }

    /// Visibility levels a runner serves without consuming quota.
    pub fn visibility_levels_without_minutes_quota(
        runner: &RunnerMatcher,
    ) -> Vec<VisibilityLevel> {
        if !runner.is_instance_type() {
            return Vec::new();
        }
        VisibilityLevel::ALL
            .into_iter()
            .filter(|level| Self::cost_factor_for(runner, *level) <= 0.0)
            .collect()
    }

    pub fn cost_adjusted_minutes(
        runner: &RunnerMatcher,
        visibility: VisibilityLevel,
        duration: chrono::Duration,
    ) -> f64 {
        let minutes = duration.num_milliseconds().max(0) as f64 / 60_000.0;
        minutes * Self::cost_factor_for(runner, visibility)
    }
}

/// Root namespace the project's usage is billed to.
pub async fn root_namespace_for_project(db: &Database, project_id: i64) -> Result<Option<i64>> {
    let sql = format!(
        "WITH RECURSIVE {NAMESPACE_ANCESTRY} \
         SELECT a.root_id FROM projects p JOIN ancestry a ON a.id = p.namespace_id \
         WHERE p.id = ?1"
    );
    let row: Option<(i64,)> = sqlx::query_as(&sql)
        .bind(project_id)
        .fetch_optional(&db.pool)
        .await
        .context("Failed to resolve root namespace")?;
    Ok(row.map(|(id,)| id))
}

/// Quota state of the root namespace that owns `project_id`.
pub async fn quota_for_project(
    db: &Database,
    project_id: i64,
    default_limit: f64,
) -> Result<Option<QuotaState>> {
    let Some(root_id) = root_namespace_for_project(db, project_id).await? else {
        return Ok(None);
    };
    let ledger = QuotaLedger::load(db, &[root_id], default_limit).await?;
    Ok(ledger.state(root_id).copied())
}
