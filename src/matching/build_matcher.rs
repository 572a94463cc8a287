use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use super::{MatcherError, RecordType, Relation};
use crate::db::models::{parse_tag_list, BuildRow, VisibilityLevel};
use crate::db::{self, Database, NAMESPACE_ANCESTRY};

/// Requirements shared by one or more builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildMatcher {
    /// Ascending, i.e. in queue order.
    pub build_ids: Vec<i64>,
    pub tag_list: BTreeSet<String>,
    pub protected: bool,
    pub visibility_level: VisibilityLevel,
    /// Root namespace of the owning project.
    pub namespace_id: i64,
    pub project_id: i64,
}

type Shape = (BTreeSet<String>, bool, VisibilityLevel, i64, i64);

impl BuildMatcher {
    /// Build a matcher for a single build row.
    pub fn from_row(row: &BuildRow) -> Result<Self, MatcherError> {
        Ok(Self {
            build_ids: vec![row.id],
            tag_list: parse_tag_list(&row.tags_json)?,
            protected: row.protected,
            visibility_level: row.visibility_level,
            namespace_id: row.root_namespace_id,
            project_id: row.project_id,
        })
    }

    /// Collapse build rows into one matcher per distinct shape.
    ///
    /// Matchers come out ordered by their oldest build and each `build_ids`
    /// list is ascending, whatever the input order.
    pub fn group(rows: &[BuildRow]) -> Result<Vec<Self>, MatcherError> {
        let mut matchers: Vec<Self> = Vec::new();
        let mut index: HashMap<Shape, usize> = HashMap::new();

        for row in rows {
            let tag_list = parse_tag_list(&row.tags_json)?;
            let shape: Shape = (
                tag_list,
                row.protected,
                row.visibility_level,
                row.root_namespace_id,
                row.project_id,
            );

            match index.get(&shape) {
                Some(&i) => matchers[i].build_ids.push(row.id),
                None => {
                    index.insert(shape.clone(), matchers.len());
                    let (tag_list, protected, visibility_level, namespace_id, project_id) = shape;
                    matchers.push(Self {
                        build_ids: vec![row.id],
                        tag_list,
                        protected,
                        visibility_level,
                        namespace_id,
                        project_id,
                    });
                }
            }
        }

        for matcher in &mut matchers {
            matcher.build_ids.sort_unstable();
        }
        matchers.sort_by_key(|m| m.first_build_id());
        Ok(matchers)
    }

    /// Bulk-build matchers from a build relation in a single query.
    pub async fn load(db: &Database, relation: &Relation) -> Result<Vec<Self>, MatcherError> {
        let rows = load_rows(db, relation).await?;
        Self::group(&rows)
    }

    pub fn has_tags(&self) -> bool {
        !self.tag_list.is_empty()
    }

    /// Lowest build id, used for FIFO ordering across shapes.
    pub fn first_build_id(&self) -> i64 {
        self.build_ids.first().copied().unwrap_or(i64::MAX)
    }
}

/// Pluck matching attributes for every build in the relation.
///
/// Tags are aggregated with a correlated `json_group_array`; ordering is
/// normalised when the aggregate is parsed into a sorted set.
pub async fn load_rows(db: &Database, relation: &Relation) -> Result<Vec<BuildRow>, MatcherError> {
    let (scope_ctes, condition) = match relation {
        Relation::PipelineBuilds(_) => ("", "b.pipeline_id = ?1 AND b.status IN ('created', 'pending')"),
        Relation::BuildIds(_) => ("", "b.id IN (SELECT value FROM json_each(?1))"),
        Relation::QueueForRunner(_) => (
            r#",
            runner_scope(id) AS (
                SELECT namespace_id FROM runner_namespaces WHERE runner_id = ?1
                UNION
                SELECT n.id FROM namespaces n JOIN runner_scope s ON n.parent_id = s.id
            )"#,
            r#"b.status = 'pending' AND b.runner_id IS NULL AND EXISTS (
                SELECT 1 FROM runners r WHERE r.id = ?1 AND (
                    (r.runner_type = 'instance_type' AND p.shared_runners_enabled = 1)
                    OR (r.runner_type = 'group_type' AND p.group_runners_enabled = 1
                        AND p.namespace_id IN (SELECT id FROM runner_scope))
                    OR (r.runner_type = 'project_type' AND EXISTS (
                        SELECT 1 FROM runner_projects rp
                        WHERE rp.runner_id = r.id AND rp.project_id = p.id))
                )
            )"#,
        ),
        Relation::AvailableRunners { .. } | Relation::RunnerIds(_) => {
            return Err(MatcherError::WrongRecordType {
                expected: RecordType::Build,
                found: relation.record_type(),
            })
        }
    };

    let sql = format!(
        r#"
        WITH RECURSIVE {NAMESPACE_ANCESTRY}{scope_ctes}
        SELECT b.id, b.project_id, b.protected, p.visibility_level, a.root_id AS root_namespace_id,
               (SELECT json_group_array(t.name)
                FROM build_tags bt JOIN tags t ON t.id = bt.tag_id
                WHERE bt.build_id = b.id) AS tags_json
        FROM builds b
        JOIN projects p ON p.id = b.project_id
        JOIN ancestry a ON a.id = p.namespace_id
        WHERE {condition}
        ORDER BY b.id
        "#
    );

    let query = sqlx::query_as::<_, BuildRow>(&sql);
    let query = match relation {
        Relation::PipelineBuilds(id) | Relation::QueueForRunner(id) => query.bind(*id),
        Relation::BuildIds(ids) => query.bind(db::id_array(ids)),
        _ => query,
    };

    Ok(query.fetch_all(&db.pool).await?)
}
