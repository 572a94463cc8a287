use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use super::admission::{Admission, AdmissionContext, AdmissionFilter, PrivateCapacity};
use super::settings::AdmissionSettings;
use crate::db::models::ClaimedBuild;
use crate::db::{self, Database};
use crate::matching::{BuildMatcher, Relation, RunnerMatcher};
use crate::quota::QuotaLedger;

/// Serves job requests from polling runners.
///
/// Each call works on a fresh snapshot of the queue and quota state; nothing
/// is cached between polls.
#[derive(Debug)]
pub struct BuildQueueService<'a> {
    db: &'a Database,
    settings: &'a AdmissionSettings,
    filter: AdmissionFilter,
}

impl<'a> BuildQueueService<'a> {
    pub fn new(db: &'a Database, settings: &'a AdmissionSettings) -> Self {
        Self {
            db,
            settings,
            filter: AdmissionFilter::new(settings),
        }
    }

    /// Find and claim the oldest build the runner is admitted to.
    ///
    /// `Ok(None)` means there is no work for this runner right now.
    pub async fn process(&self, runner_id: i64) -> Result<Option<ClaimedBuild>> {
        let request_id = Uuid::new_v4();
        let span = info_span!("job_request", %request_id, runner = runner_id);
        self.process_inner(runner_id).instrument(span).await
    }

    async fn process_inner(&self, runner_id: i64) -> Result<Option<ClaimedBuild>> {
        let runners = RunnerMatcher::load(self.db, &Relation::RunnerIds(vec![runner_id])).await?;
        let Some(runner) = runners.into_iter().next() else {
            debug!("Unknown runner");
            return Ok(None);
        };
        if !runner.active {
            debug!("Runner paused");
            return Ok(None);
        }

        touch_runner(self.db, runner_id).await?;

        let admission = self.admission_for(&runner).await?;
        for build_id in &admission.eligible {
            if let Some(claimed) = claim_build(self.db, *build_id, runner_id).await? {
                debug!(build = claimed.id, "Build claimed");
                return Ok(Some(claimed));
            }
            debug!(build = build_id, "Lost claim race, trying next build");
        }

        Ok(None)
    }

    /// Advisory snapshot of what the runner may claim; re-validated at claim time.
    pub async fn admission_for(&self, runner: &RunnerMatcher) -> Result<Admission> {
        let runner_id = runner.runner_ids.first().copied().unwrap_or_default();
        let builds = BuildMatcher::load(self.db, &Relation::QueueForRunner(runner_id)).await?;

        let (ledger, capacity) = if runner.is_instance_type() && self.settings.quota_enforced() {
            let namespaces: Vec<i64> = builds
                .iter()
                .map(|b| b.namespace_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let ledger =
                QuotaLedger::load(self.db, &namespaces, self.settings.default_minutes_limit)
                    .await?;

            let gated_projects: Vec<i64> = builds
                .iter()
                .filter(|b| ledger.minutes_used_up(b.namespace_id))
                .map(|b| b.project_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let online_since = self.settings.online_since(Utc::now());
            let capacity = PrivateCapacity::load(self.db, &gated_projects, online_since).await?;
            (ledger, capacity)
        } else {
            (QuotaLedger::default(), PrivateCapacity::default())
        };

        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        Ok(self.filter.filter(runner, &builds, &ctx))
    }
}

/// Record that the runner has been heard from.
pub async fn touch_runner(db: &Database, runner_id: i64) -> Result<()> {
    sqlx::query("UPDATE runners SET contacted_at = ? WHERE id = ?")
        .bind(db::sql_timestamp(Utc::now()))
        .bind(runner_id)
        .execute(&db.pool)
        .await
        .context("Failed to update runner contact time")?;
    Ok(())
}

/// Atomically assign a pending build to a runner.
///
/// Returns `None` when another runner got there first or the build is no
/// longer pending.
pub async fn claim_build(
    db: &Database,
    build_id: i64,
    runner_id: i64,
) -> Result<Option<ClaimedBuild>> {
    let claimed = sqlx::query_as::<_, ClaimedBuild>(
        r#"
        UPDATE builds SET status = 'running', runner_id = ?2, started_at = ?3
        WHERE id = ?1 AND status = 'pending' AND runner_id IS NULL
        RETURNING id, pipeline_id, project_id, name, runner_id, started_at
        "#,
    )
    .bind(build_id)
    .bind(runner_id)
    .bind(db::sql_timestamp(Utc::now()))
    .fetch_optional(&db.pool)
    .await
    .context("Failed to claim build")?;

    Ok(claimed)
}
