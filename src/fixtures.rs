//! Row builders shared by the test suites.

use chrono::{DateTime, Utc};

use crate::db::models::{RunnerType, VisibilityLevel};
use crate::db::{self, Database};

pub async fn namespace(db: &Database, parent_id: Option<i64>) -> i64 {
    sqlx::query("INSERT INTO namespaces (parent_id, name) VALUES (?, 'ns')")
        .bind(parent_id)
        .execute(&db.pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

pub async fn project(db: &Database, namespace_id: i64, visibility: VisibilityLevel) -> i64 {
    sqlx::query("INSERT INTO projects (namespace_id, name, visibility_level) VALUES (?, 'project', ?)")
        .bind(namespace_id)
        .bind(visibility)
        .execute(&db.pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

pub async fn pipeline(db: &Database, project_id: i64, status: &str) -> i64 {
    sqlx::query("INSERT INTO pipelines (project_id, status) VALUES (?, ?)")
        .bind(project_id)
        .bind(status)
        .execute(&db.pool)
        .await
        .unwrap()
        .last_insert_rowid()
}

async fn tag_ids(db: &Database, tags: &[&str]) -> Vec<i64> {
    let mut ids = Vec::new();
    for tag in tags {
        sqlx::query("INSERT OR IGNORE INTO tags (name) VALUES (?)")
            .bind(tag)
            .execute(&db.pool)
            .await
            .unwrap();
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM tags WHERE name = ?")
            .bind(tag)
            .fetch_one(&db.pool)
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

pub async fn build(
    db: &Database,
    pipeline_id: i64,
    project_id: i64,
    status: &str,
    tags: &[&str],
    protected: bool,
) -> i64 {
    let id = sqlx::query(
        "INSERT INTO builds (pipeline_id, project_id, name, status, protected) \
         VALUES (?, ?, 'test', ?, ?)",
    )
    .bind(pipeline_id)
    .bind(project_id)
    .bind(status)
    .bind(protected)
    .execute(&db.pool)
    .await
    .unwrap()
    .last_insert_rowid();

    for tag_id in tag_ids(db, tags).await {
        sqlx::query("INSERT OR IGNORE INTO build_tags (build_id, tag_id) VALUES (?, ?)")
            .bind(id)
            .bind(tag_id)
            .execute(&db.pool)
            .await
            .unwrap();
    }
    id
}

async fn runner(db: &Database, runner_type: RunnerType, tags: &[&str], run_untagged: bool) -> i64 {
    let id = sqlx::query(
        "INSERT INTO runners (runner_type, run_untagged, contacted_at) VALUES (?, ?, ?)",
    )
    .bind(runner_type)
    .bind(run_untagged)
    .bind(db::sql_timestamp(Utc::now()))
    .execute(&db.pool)
    .await
    .unwrap()
    .last_insert_rowid();

    for tag_id in tag_ids(db, tags).await {
        sqlx::query("INSERT OR IGNORE INTO runner_tags (runner_id, tag_id) VALUES (?, ?)")
            .bind(id)
            .bind(tag_id)
            .execute(&db.pool)
            .await
            .unwrap();
    }
    id
}

pub async fn instance_runner(db: &Database, tags: &[&str], run_untagged: bool) -> i64 {
    runner(db, RunnerType::InstanceType, tags, run_untagged).await
}

pub async fn group_runner(
    db: &Database,
    namespace_id: i64,
    tags: &[&str],
    run_untagged: bool,
) -> i64 {
    let id = runner(db, RunnerType::GroupType, tags, run_untagged).await;
    sqlx::query("INSERT INTO runner_namespaces (runner_id, namespace_id) VALUES (?, ?)")
        .bind(id)
        .bind(namespace_id)
        .execute(&db.pool)
        .await
        .unwrap();
    id
}

pub async fn project_runner(
    db: &Database,
    project_id: i64,
    tags: &[&str],
    run_untagged: bool,
) -> i64 {
    let id = runner(db, RunnerType::ProjectType, tags, run_untagged).await;
    sqlx::query("INSERT INTO runner_projects (runner_id, project_id) VALUES (?, ?)")
        .bind(id)
        .bind(project_id)
        .execute(&db.pool)
        .await
        .unwrap();
    id
}

pub async fn protect_runner(db: &Database, runner_id: i64) {
    sqlx::query("UPDATE runners SET access_level = 'ref_protected' WHERE id = ?")
        .bind(runner_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

pub async fn pause_runner(db: &Database, runner_id: i64) {
    sqlx::query("UPDATE runners SET active = 0 WHERE id = ?")
        .bind(runner_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

pub async fn set_contacted_at(db: &Database, runner_id: i64, at: DateTime<Utc>) {
    sqlx::query("UPDATE runners SET contacted_at = ? WHERE id = ?")
        .bind(db::sql_timestamp(at))
        .bind(runner_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

pub async fn set_cost_factors(
    db: &Database,
    runner_id: i64,
    public: Option<f64>,
    private: Option<f64>,
) {
    sqlx::query(
        "UPDATE runners SET public_projects_minutes_cost_factor = ?, \
         private_projects_minutes_cost_factor = ? WHERE id = ?",
    )
    .bind(public)
    .bind(private)
    .bind(runner_id)
    .execute(&db.pool)
    .await
    .unwrap();
}

pub async fn disable_group_runners(db: &Database, project_id: i64) {
    sqlx::query("UPDATE projects SET group_runners_enabled = 0 WHERE id = ?")
        .bind(project_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

pub async fn disable_shared_runners(db: &Database, project_id: i64) {
    sqlx::query("UPDATE projects SET shared_runners_enabled = 0 WHERE id = ?")
        .bind(project_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

pub async fn set_minutes_limit(db: &Database, namespace_id: i64, limit: Option<f64>) {
    sqlx::query("UPDATE namespaces SET shared_runners_minutes_limit = ? WHERE id = ?")
        .bind(limit)
        .bind(namespace_id)
        .execute(&db.pool)
        .await
        .unwrap();
}

/// Set a namespace's limits and upsert its usage statistics.
pub async fn set_quota(db: &Database, namespace_id: i64, limit: Option<f64>, extra: f64, used: f64) {
    sqlx::query(
        "UPDATE namespaces SET shared_runners_minutes_limit = ?, \
         extra_shared_runners_minutes_limit = ? WHERE id = ?",
    )
    .bind(limit)
    .bind(extra)
    .bind(namespace_id)
    .execute(&db.pool)
    .await
    .unwrap();

    sqlx::query(
        "INSERT INTO namespace_statistics (namespace_id, shared_runners_minutes_used) VALUES (?, ?) \
         ON CONFLICT(namespace_id) DO UPDATE SET shared_runners_minutes_used = excluded.shared_runners_minutes_used",
    )
    .bind(namespace_id)
    .bind(used)
    .execute(&db.pool)
    .await
    .unwrap();
}

pub async fn set_reset_at(db: &Database, namespace_id: i64, at: DateTime<Utc>) {
    sqlx::query(
        "UPDATE namespace_statistics SET shared_runners_minutes_reset_at = ? WHERE namespace_id = ?",
    )
    .bind(db::sql_timestamp(at))
    .bind(namespace_id)
    .execute(&db.pool)
    .await
    .unwrap();
}

/// Mark a build as run to success by `runner_id` between `start` and `end`.
pub async fn finish_build(
    db: &Database,
    build_id: i64,
    runner_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) {
    sqlx::query(
        "UPDATE builds SET status = 'success', runner_id = ?, started_at = ?, finished_at = ? \
         WHERE id = ?",
    )
    .bind(runner_id)
    .bind(db::sql_timestamp(start))
    .bind(db::sql_timestamp(end))
    .bind(build_id)
    .execute(&db.pool)
    .await
    .unwrap();
}
