//! Comparable descriptors of runner capabilities and build requirements.
//!
//! Matchers are derived views recomputed at each scheduling attempt. Bulk
//! construction plucks attributes in one query per relation and collapses
//! records with identical matching attributes into a single matcher, so
//! admission decisions are made once per distinct shape.

pub mod build_matcher;
pub mod runner_matcher;

use std::fmt;

use chrono::{DateTime, Utc};

pub use build_matcher::BuildMatcher;
pub use runner_matcher::RunnerMatcher;

/// The record type a relation ranges over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Build,
    Runner,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::Build => f.write_str("build"),
            RecordType::Runner => f.write_str("runner"),
        }
    }
}

/// A query over builds or runners that matchers can be bulk-built from.
#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    /// Builds of a pipeline that have not started yet (`created` or `pending`).
    PipelineBuilds(i64),
    /// Pending, unassigned builds the given runner is allowed to see.
    QueueForRunner(i64),
    BuildIds(Vec<i64>),
    /// Active runners contacted since `online_since` that can serve the project.
    AvailableRunners {
        project_id: i64,
        online_since: DateTime<Utc>,
    },
    RunnerIds(Vec<i64>),
}

impl Relation {
    pub fn record_type(&self) -> RecordType {
        match self {
            Relation::PipelineBuilds(_)
            | Relation::QueueForRunner(_)
            | Relation::BuildIds(_) => RecordType::Build,
            Relation::AvailableRunners { .. } | Relation::RunnerIds(_) => RecordType::Runner,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MatcherError {
    /// Programmer error: the relation ranges over the wrong record type.
    #[error("cannot build {expected} matchers from a {found} relation")]
    WrongRecordType {
        expected: RecordType,
        found: RecordType,
    },
    #[error("failed to load matcher attributes")]
    Database(#[from] sqlx::Error),
    #[error("malformed tag list")]
    MalformedTags(#[from] serde_json::Error),
}

pub(crate) fn ensure_record_type(
    relation: &Relation,
    expected: RecordType,
) -> Result<(), MatcherError> {
    let found = relation.record_type();
    if found != expected {
        return Err(MatcherError::WrongRecordType { expected, found });
    }
    Ok(())
}
