use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RunnerType {
    InstanceType,
    GroupType,
    ProjectType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AccessLevel {
    NotProtected,
    RefProtected,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum VisibilityLevel {
    Private,
    Internal,
    Public,
}

impl VisibilityLevel {
    pub const ALL: [VisibilityLevel; 3] = [
        VisibilityLevel::Private,
        VisibilityLevel::Internal,
        VisibilityLevel::Public,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BuildStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

/// Why a build ended up `failed`. Quota drops must stay distinguishable
/// from failures of the job's own script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureReason {
    ScriptFailure,
    CiQuotaExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ScriptFailure => "script_failure",
            FailureReason::CiQuotaExceeded => "ci_quota_exceeded",
        }
    }
}

/// A runner row with its tags aggregated into a JSON array.
#[derive(Debug, Clone, FromRow)]
pub struct RunnerRow {
    pub id: i64,
    pub runner_type: RunnerType,
    pub run_untagged: bool,
    pub access_level: AccessLevel,
    pub active: bool,
    pub public_projects_minutes_cost_factor: Option<f64>,
    pub private_projects_minutes_cost_factor: Option<f64>,
    pub tags_json: String,
}

/// A build row plucked with everything needed for matching.
#[derive(Debug, Clone, FromRow)]
pub struct BuildRow {
    pub id: i64,
    pub project_id: i64,
    pub protected: bool,
    pub visibility_level: VisibilityLevel,
    pub root_namespace_id: i64,
    pub tags_json: String,
}

/// Parse a `json_group_array` tag aggregate into a sorted, deduplicated set.
pub fn parse_tag_list(tags_json: &str) -> serde_json::Result<BTreeSet<String>> {
    let tags: Vec<String> = serde_json::from_str(tags_json)?;
    Ok(tags.into_iter().collect())
}

/// A build successfully assigned to a runner.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ClaimedBuild {
    pub id: i64,
    pub pipeline_id: i64,
    pub project_id: i64,
    pub name: String,
    pub runner_id: i64,
    pub started_at: String,
}
