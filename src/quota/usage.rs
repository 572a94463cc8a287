use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, info};

use super::QuotaLedger;
use crate::db::models::VisibilityLevel;
use crate::db::{self, Database, NAMESPACE_ANCESTRY};
use crate::matching::{Relation, RunnerMatcher};

/// A finished build with what is needed to bill it.
#[derive(Debug, sqlx::FromRow)]
struct FinishedBuild {
    runner_id: Option<i64>,
    started_at: Option<String>,
    finished_at: Option<String>,
    visibility_level: VisibilityLevel,
    root_namespace_id: i64,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Invalid timestamp '{value}'"))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Add a finished build's cost-weighted minutes to its root namespace.
///
/// Only instance runners consume quota. A build is billed at most once; the
/// `minutes_recorded` marker is set in the same transaction as the usage
/// update. Returns the minutes recorded, `0.0` when the build is not billable
/// or was already billed.
pub async fn record_build_minutes(db: &Database, build_id: i64) -> Result<f64> {
    let sql = format!(
        r#"
        WITH RECURSIVE {NAMESPACE_ANCESTRY}
        SELECT b.runner_id, b.started_at, b.finished_at, p.visibility_level,
               a.root_id AS root_namespace_id
        FROM builds b
        JOIN projects p ON p.id = b.project_id
        JOIN ancestry a ON a.id = p.namespace_id
        WHERE b.id = ?1 AND b.status IN ('success', 'failed', 'canceled')
          AND b.minutes_recorded = 0
        "#
    );
    let build = sqlx::query_as::<_, FinishedBuild>(&sql)
        .bind(build_id)
        .fetch_optional(&db.pool)
        .await
        .context("Failed to load finished build")?;

    let Some(build) = build else {
        debug!(build = build_id, "Build not finished or already recorded");
        return Ok(0.0);
    };
    let (Some(runner_id), Some(started_at), Some(finished_at)) =
        (build.runner_id, build.started_at, build.finished_at)
    else {
        return Ok(0.0);
    };

    let runners = RunnerMatcher::load(db, &Relation::RunnerIds(vec![runner_id])).await?;
    let Some(runner) = runners.first() else {
        return Ok(0.0);
    };

    let duration = parse_timestamp(&finished_at)? - parse_timestamp(&started_at)?;
    let minutes = QuotaLedger::cost_adjusted_minutes(runner, build.visibility_level, duration);
    if minutes <= 0.0 {
        return Ok(0.0);
    }

    let mut tx = db.pool.begin().await?;

    let marked = sqlx::query(
        "UPDATE builds SET minutes_recorded = 1 WHERE id = ? AND minutes_recorded = 0",
    )
    .bind(build_id)
    .execute(&mut *tx)
    .await
    .context("Failed to mark build minutes as recorded")?;
    if marked.rows_affected() == 0 {
        debug!(build = build_id, "Build minutes recorded concurrently");
        return Ok(0.0);
    }

    sqlx::query(
        r#"
        INSERT INTO namespace_statistics (namespace_id, shared_runners_minutes_used)
        VALUES (?, ?)
        ON CONFLICT(namespace_id) DO UPDATE SET
            shared_runners_minutes_used = shared_runners_minutes_used
                + excluded.shared_runners_minutes_used
        "#,
    )
    .bind(build.root_namespace_id)
    .bind(minutes)
    .execute(&mut *tx)
    .await
    .context("Failed to update namespace statistics")?;

    tx.commit().await?;

    debug!(
        build = build_id,
        namespace = build.root_namespace_id,
        minutes,
        "Recorded shared runner minutes"
    );
    Ok(minutes)
}

/// First instant of the month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = now.date_naive().with_day(1).unwrap_or(now.date_naive());
    Utc.from_utc_datetime(&first.and_time(chrono::NaiveTime::MIN))
}

/// Zero out usage for every namespace last reset before the current month.
///
/// Purchased extra minutes are consumed by any overage first, so only the
/// unused part of the extra allowance carries over. Returns the number of
/// namespaces reset.
pub async fn reset_monthly_usage(
    db: &Database,
    now: DateTime<Utc>,
    default_limit: f64,
) -> Result<u64> {
    let cutoff = db::sql_timestamp(month_start(now));
    let mut tx = db.pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE namespaces SET extra_shared_runners_minutes_limit = MAX(
            extra_shared_runners_minutes_limit - MAX(
                (SELECT s.shared_runners_minutes_used FROM namespace_statistics s
                 WHERE s.namespace_id = namespaces.id)
                - COALESCE(shared_runners_minutes_limit, ?2), 0), 0)
        WHERE extra_shared_runners_minutes_limit > 0
          AND COALESCE(shared_runners_minutes_limit, ?2) > 0
          AND id IN (SELECT namespace_id FROM namespace_statistics
                     WHERE shared_runners_minutes_reset_at < ?1)
        "#,
    )
    .bind(&cutoff)
    .bind(default_limit)
    .execute(&mut *tx)
    .await
    .context("Failed to settle extra minutes")?;

    let reset = sqlx::query(
        "UPDATE namespace_statistics \
         SET shared_runners_minutes_used = 0, shared_runners_minutes_reset_at = ?2 \
         WHERE shared_runners_minutes_reset_at < ?1",
    )
    .bind(&cutoff)
    .bind(db::sql_timestamp(now))
    .execute(&mut *tx)
    .await
    .context("Failed to reset namespace statistics")?;

    tx.commit().await?;

    let count = reset.rows_affected();
    if count > 0 {
        info!(count, "Reset monthly shared runner minutes");
    }
    Ok(count)
}
