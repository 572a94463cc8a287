use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use super::{ensure_record_type, BuildMatcher, MatcherError, RecordType, Relation};
use crate::db::models::{parse_tag_list, AccessLevel, RunnerRow, RunnerType};
use crate::db::{self, Database};

/// Cost factor applied when a runner row leaves it unset.
pub const DEFAULT_COST_FACTOR: f64 = 1.0;

/// Capabilities shared by one or more runners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunnerMatcher {
    pub runner_ids: Vec<i64>,
    pub runner_type: RunnerType,
    pub public_projects_minutes_cost_factor: f64,
    pub private_projects_minutes_cost_factor: f64,
    pub run_untagged: bool,
    pub access_level: AccessLevel,
    pub active: bool,
    pub tag_list: BTreeSet<String>,
}

// f64 cost factors are keyed by their bit pattern.
type Shape = (
    RunnerType,
    u64,
    u64,
    bool,
    AccessLevel,
    bool,
    BTreeSet<String>,
);

impl RunnerMatcher {
    /// Build a matcher for a single runner row.
    pub fn from_row(row: &RunnerRow) -> Result<Self, MatcherError> {
        Ok(Self {
            runner_ids: vec![row.id],
            runner_type: row.runner_type,
            public_projects_minutes_cost_factor: row
                .public_projects_minutes_cost_factor
                .unwrap_or(DEFAULT_COST_FACTOR),
            private_projects_minutes_cost_factor: row
                .private_projects_minutes_cost_factor
                .unwrap_or(DEFAULT_COST_FACTOR),
            run_untagged: row.run_untagged,
            access_level: row.access_level,
            active: row.active,
            tag_list: parse_tag_list(&row.tags_json)?,
        })
    }

    /// Collapse runner rows into one matcher per distinct shape, ordered by
    /// lowest runner id.
    pub fn group(rows: &[RunnerRow]) -> Result<Vec<Self>, MatcherError> {
        let mut matchers: Vec<Self> = Vec::new();
        let mut index: HashMap<Shape, usize> = HashMap::new();

        for row in rows {
            let matcher = Self::from_row(row)?;
            let shape = matcher.shape();
            match index.get(&shape) {
                Some(&i) => matchers[i].runner_ids.push(row.id),
                None => {
                    index.insert(shape, matchers.len());
                    matchers.push(matcher);
                }
            }
        }

        for matcher in &mut matchers {
            matcher.runner_ids.sort_unstable();
        }
        matchers.sort_by_key(|m| m.runner_ids.first().copied().unwrap_or(i64::MAX));
        Ok(matchers)
    }

    /// Bulk-build matchers from a runner relation in a single query.
    pub async fn load(db: &Database, relation: &Relation) -> Result<Vec<Self>, MatcherError> {
        let rows = load_rows(db, relation).await?;
        Self::group(&rows)
    }

    fn shape(&self) -> Shape {
        (
            self.runner_type,
            self.public_projects_minutes_cost_factor.to_bits(),
            self.private_projects_minutes_cost_factor.to_bits(),
            self.run_untagged,
            self.access_level,
            self.active,
            self.tag_list.clone(),
        )
    }

    pub fn is_instance_type(&self) -> bool {
        self.runner_type == RunnerType::InstanceType
    }

    pub fn is_ref_protected(&self) -> bool {
        self.access_level == AccessLevel::RefProtected
    }

    /// Whether a runner of this shape may pick up builds of `build`'s shape.
    ///
    /// Quota is not considered here.
    pub fn matches(&self, build: &BuildMatcher) -> bool {
        if !self.active {
            return false;
        }
        if build.protected && !self.is_ref_protected() {
            return false;
        }
        self.accepts_tags(build)
    }

    fn accepts_tags(&self, build: &BuildMatcher) -> bool {
        (self.run_untagged || build.has_tags()) && build.tag_list.is_subset(&self.tag_list)
    }
}

pub(crate) const RUNNER_COLUMNS: &str = r#"
    r.id, r.runner_type, r.run_untagged, r.access_level, r.active,
    r.public_projects_minutes_cost_factor, r.private_projects_minutes_cost_factor,
    (SELECT json_group_array(t.name)
     FROM runner_tags rt JOIN tags t ON t.id = rt.tag_id
     WHERE rt.runner_id = r.id) AS tags_json
"#;

/// `project_ancestors(project_id, id)`: every namespace above each project
/// in the `?1` id list, the project's own namespace included.
pub(crate) const PROJECT_ANCESTRY: &str = r#"
    project_ancestors(project_id, id) AS (
        SELECT p.id, p.namespace_id FROM projects p
        WHERE p.id IN (SELECT value FROM json_each(?1))
        UNION
        SELECT pa.project_id, n.parent_id FROM namespaces n
        JOIN project_ancestors pa ON n.id = pa.id
        WHERE n.parent_id IS NOT NULL
    )
"#;

/// Runner `r` is active, contacted since `?2` and allowed to serve project `p`.
pub(crate) const RUNNER_AVAILABLE_TO_PROJECT: &str = r#"
    r.active = 1 AND r.contacted_at >= ?2 AND (
        (r.runner_type = 'instance_type' AND p.shared_runners_enabled = 1)
        OR (r.runner_type = 'group_type' AND p.group_runners_enabled = 1 AND EXISTS (
            SELECT 1 FROM runner_namespaces rn
            JOIN project_ancestors pa ON pa.id = rn.namespace_id AND pa.project_id = p.id
            WHERE rn.runner_id = r.id))
        OR (r.runner_type = 'project_type' AND EXISTS (
            SELECT 1 FROM runner_projects rp
            WHERE rp.runner_id = r.id AND rp.project_id = p.id))
    )
"#;

/// Pluck matching attributes for every runner in the relation.
pub async fn load_rows(db: &Database, relation: &Relation) -> Result<Vec<RunnerRow>, MatcherError> {
    ensure_record_type(relation, RecordType::Runner)?;

    let rows = match relation {
        Relation::RunnerIds(ids) => {
            let sql = format!(
                "SELECT {RUNNER_COLUMNS} FROM runners r \
                 WHERE r.id IN (SELECT value FROM json_each(?1)) ORDER BY r.id"
            );
            sqlx::query_as::<_, RunnerRow>(&sql)
                .bind(db::id_array(ids))
                .fetch_all(&db.pool)
                .await?
        }
        Relation::AvailableRunners {
            project_id,
            online_since,
        } => {
            let sql = format!(
                r#"
                WITH RECURSIVE {PROJECT_ANCESTRY}
                SELECT {RUNNER_COLUMNS}
                FROM projects p CROSS JOIN runners r
                WHERE p.id IN (SELECT value FROM json_each(?1))
                  AND {RUNNER_AVAILABLE_TO_PROJECT}
                ORDER BY r.id
                "#
            );
            sqlx::query_as::<_, RunnerRow>(&sql)
                .bind(db::id_array(&[*project_id]))
                .bind(db::sql_timestamp(*online_since))
                .fetch_all(&db.pool)
                .await?
        }
        _ => Vec::new(),
    };

    Ok(rows)
}
