use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::FromRow;
use tracing::{debug, info, warn};

use super::{DropBroadcaster, DroppedBuilds};
use crate::db::models::{FailureReason, PipelineStatus};
use crate::db::{self, Database};
use crate::matching::{BuildMatcher, Relation, RunnerMatcher};
use crate::quota::{self, QuotaLedger};
use crate::scheduler::settings::AdmissionSettings;

/// Why a pipeline was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PipelineNotFound,
    PipelineNotCreated,
    SharedRunnersDisabled,
    QuotaNotEnforced,
    QuotaAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum DropOutcome {
    /// Ids of the builds failed by this run, possibly empty.
    Dropped(Vec<i64>),
    Skipped(SkipReason),
}

#[derive(Debug, FromRow)]
struct PipelineRow {
    status: PipelineStatus,
    project_id: i64,
    shared_runners_enabled: bool,
}

/// Fails builds of a freshly created pipeline that only shared runners could
/// take while the project's namespace is out of shared-runner minutes.
///
/// Such builds would otherwise sit in the queue until the next monthly reset.
#[derive(Debug)]
pub struct DropNotRunnableBuildsService<'a> {
    db: &'a Database,
    settings: &'a AdmissionSettings,
    broadcaster: &'a DropBroadcaster,
}

impl<'a> DropNotRunnableBuildsService<'a> {
    pub fn new(
        db: &'a Database,
        settings: &'a AdmissionSettings,
        broadcaster: &'a DropBroadcaster,
    ) -> Self {
        Self {
            db,
            settings,
            broadcaster,
        }
    }

    pub async fn execute(&self, pipeline_id: i64) -> Result<DropOutcome> {
        let pipeline = sqlx::query_as::<_, PipelineRow>(
            "SELECT p.status, p.project_id, pr.shared_runners_enabled \
             FROM pipelines p JOIN projects pr ON pr.id = p.project_id \
             WHERE p.id = ?",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.db.pool)
        .await
        .context("Failed to load pipeline")?;

        let Some(pipeline) = pipeline else {
            return Ok(self.skip(pipeline_id, SkipReason::PipelineNotFound));
        };
        if pipeline.status != PipelineStatus::Created {
            return Ok(self.skip(pipeline_id, SkipReason::PipelineNotCreated));
        }
        if !pipeline.shared_runners_enabled {
            return Ok(self.skip(pipeline_id, SkipReason::SharedRunnersDisabled));
        }
        if !self.settings.quota_enforced() {
            return Ok(self.skip(pipeline_id, SkipReason::QuotaNotEnforced));
        }

        let quota = quota::quota_for_project(
            self.db,
            pipeline.project_id,
            self.settings.default_minutes_limit,
        )
        .await?;
        let Some(quota) = quota.filter(|q| q.minutes_used_up()) else {
            return Ok(self.skip(pipeline_id, SkipReason::QuotaAvailable));
        };
        let ledger = QuotaLedger::new([quota]);

        let runners = RunnerMatcher::load(
            self.db,
            &Relation::AvailableRunners {
                project_id: pipeline.project_id,
                online_since: self.settings.online_since(Utc::now()),
            },
        )
        .await?;
        let (instance_runners, private_runners): (Vec<_>, Vec<_>) =
            runners.into_iter().partition(|r| r.is_instance_type());

        let builds = BuildMatcher::load(self.db, &Relation::PipelineBuilds(pipeline_id)).await?;

        let mut build_ids: Vec<i64> = builds
            .iter()
            .filter(|build| {
                matches_instance_runners_and_quota_used_up(build, &instance_runners, &ledger)
                    && !matches_private_runners(build, &private_runners)
            })
            .flat_map(|build| build.build_ids.iter().copied())
            .collect();
        build_ids.sort_unstable();

        if build_ids.is_empty() {
            debug!(pipeline = pipeline_id, "No builds to drop");
            return Ok(DropOutcome::Dropped(build_ids));
        }

        let dropped = drop_all_builds(self.db, &build_ids, FailureReason::CiQuotaExceeded).await?;
        if dropped != build_ids.len() as u64 {
            warn!(
                pipeline = pipeline_id,
                expected = build_ids.len(),
                dropped,
                "Some builds changed status before they could be dropped"
            );
        }

        info!(
            pipeline = pipeline_id,
            namespace = quota.namespace_id,
            count = build_ids.len(),
            "Dropped builds that cannot run within the minutes quota"
        );
        self.broadcaster.notify(DroppedBuilds {
            pipeline_id,
            build_ids: build_ids.clone(),
            reason: FailureReason::CiQuotaExceeded,
        });

        Ok(DropOutcome::Dropped(build_ids))
    }

    fn skip(&self, pipeline_id: i64, reason: SkipReason) -> DropOutcome {
        debug!(pipeline = pipeline_id, ?reason, "Skipping not-runnable build check");
        DropOutcome::Skipped(reason)
    }
}

/// An instance runner would take the build, but every such runner is held
/// back by the exhausted quota.
fn matches_instance_runners_and_quota_used_up(
    build: &BuildMatcher,
    instance_runners: &[RunnerMatcher],
    ledger: &QuotaLedger,
) -> bool {
    let mut matching = instance_runners.iter().filter(|r| r.matches(build)).peekable();
    if matching.peek().is_none() {
        return false;
    }
    matching.all(|runner| {
        !QuotaLedger::visibility_levels_without_minutes_quota(runner)
            .contains(&build.visibility_level)
            && ledger.minutes_used_up(build.namespace_id)
    })
}

fn matches_private_runners(build: &BuildMatcher, private_runners: &[RunnerMatcher]) -> bool {
    private_runners.iter().any(|r| r.matches(build))
}

/// Fail the given builds in one transaction. Builds that already left the
/// `created`/`pending` states are left alone.
async fn drop_all_builds(db: &Database, build_ids: &[i64], reason: FailureReason) -> Result<u64> {
    let mut tx = db.pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE builds SET status = 'failed', failure_reason = ?2, finished_at = ?3
        WHERE id IN (SELECT value FROM json_each(?1))
          AND status IN ('created', 'pending')
        "#,
    )
    .bind(db::id_array(build_ids))
    .bind(reason.as_str())
    .bind(db::sql_timestamp(Utc::now()))
    .execute(&mut *tx)
    .await
    .context("Failed to drop builds")?;

    tx.commit().await?;
    Ok(result.rows_affected())
}
