//! Decides which pending builds a polling runner may claim.
//!
//! Tag and protection matching always apply. Everything else is an
//! [`EligibilityPredicate`] composed into the filter at construction, so the
//! quota policy can be switched off without touching the matching rules.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use tracing::debug;

use super::settings::AdmissionSettings;
use crate::db::models::RunnerRow;
use crate::db::{self, Database};
use crate::matching::runner_matcher::{PROJECT_ANCESTRY, RUNNER_AVAILABLE_TO_PROJECT, RUNNER_COLUMNS};
use crate::matching::{BuildMatcher, RunnerMatcher};
use crate::quota::QuotaLedger;

/// Outcome of one predicate for one build shape. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Admit,
    /// Not for this runner, but another capacity path can still serve it.
    Defer,
    /// No runner able to serve it is allowed to.
    Block,
}

/// Request-scoped data predicates may consult.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub ledger: &'a QuotaLedger,
    pub private_capacity: &'a PrivateCapacity,
}

/// An additional eligibility rule layered on top of tag matching.
pub trait EligibilityPredicate: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(
        &self,
        runner: &RunnerMatcher,
        build: &BuildMatcher,
        ctx: &AdmissionContext<'_>,
    ) -> Verdict;
}

/// Gates instance runners on the build namespace's compute-minute quota.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuotaPredicate;

impl EligibilityPredicate for QuotaPredicate {
    fn name(&self) -> &'static str {
        "minutes_quota"
    }

    fn evaluate(
        &self,
        runner: &RunnerMatcher,
        build: &BuildMatcher,
        ctx: &AdmissionContext<'_>,
    ) -> Verdict {
        if !runner.is_instance_type() {
            return Verdict::Admit;
        }
        if QuotaLedger::visibility_levels_without_minutes_quota(runner)
            .contains(&build.visibility_level)
        {
            return Verdict::Admit;
        }
        if !ctx.ledger.minutes_used_up(build.namespace_id) {
            return Verdict::Admit;
        }
        if ctx.private_capacity.can_serve(build) {
            Verdict::Defer
        } else {
            Verdict::Block
        }
    }
}

/// Private (group and project) runners available to each project.
#[derive(Debug, Clone, Default)]
pub struct PrivateCapacity {
    by_project: HashMap<i64, Vec<RunnerMatcher>>,
}

#[derive(Debug, FromRow)]
struct PrivateRunnerRow {
    project_id: i64,
    #[sqlx(flatten)]
    runner: RunnerRow,
}

impl PrivateCapacity {
    pub fn new(by_project: impl IntoIterator<Item = (i64, Vec<RunnerMatcher>)>) -> Self {
        Self {
            by_project: by_project.into_iter().collect(),
        }
    }

    /// Whether a private runner available to the build's project matches it.
    pub fn can_serve(&self, build: &BuildMatcher) -> bool {
        self.by_project
            .get(&build.project_id)
            .is_some_and(|runners| runners.iter().any(|r| r.matches(build)))
    }

    /// Load the active, online private runners each project may use, scoped
    /// the same way as `Relation::AvailableRunners`.
    pub async fn load(
        db: &Database,
        project_ids: &[i64],
        online_since: DateTime<Utc>,
    ) -> Result<Self> {
        if project_ids.is_empty() {
            return Ok(Self::default());
        }

        let sql = format!(
            r#"
            WITH RECURSIVE {PROJECT_ANCESTRY}
            SELECT p.id AS project_id, {RUNNER_COLUMNS}
            FROM projects p CROSS JOIN runners r
            WHERE p.id IN (SELECT value FROM json_each(?1))
              AND r.runner_type != 'instance_type'
              AND {RUNNER_AVAILABLE_TO_PROJECT}
            ORDER BY p.id, r.id
            "#
        );
        let rows = sqlx::query_as::<_, PrivateRunnerRow>(&sql)
            .bind(db::id_array(project_ids))
            .bind(db::sql_timestamp(online_since))
            .fetch_all(&db.pool)
            .await
            .context("Failed to load private runner capacity")?;

        let mut grouped: HashMap<i64, Vec<RunnerRow>> = HashMap::new();
        for row in rows {
            grouped.entry(row.project_id).or_default().push(row.runner);
        }

        let mut by_project = HashMap::with_capacity(grouped.len());
        for (project_id, runners) in grouped {
            by_project.insert(project_id, RunnerMatcher::group(&runners)?);
        }
        Ok(Self { by_project })
    }
}

/// Admission decision for one poll, each list in queue order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// Builds the runner may claim.
    pub eligible: Vec<i64>,
    /// Quota-gated for this runner but servable by private capacity.
    pub deferred: Vec<i64>,
    /// Quota-gated with no other runner to fall back on.
    pub blocked: Vec<i64>,
}

/// Narrows the pending queue to what one runner may claim.
#[derive(Debug, Default)]
pub struct AdmissionFilter {
    predicates: Vec<Box<dyn EligibilityPredicate>>,
}

impl AdmissionFilter {
    /// Compose the predicates the settings call for.
    pub fn new(settings: &AdmissionSettings) -> Self {
        let mut predicates: Vec<Box<dyn EligibilityPredicate>> = Vec::new();
        if settings.quota_enforced() {
            predicates.push(Box::new(QuotaPredicate));
        }
        Self { predicates }
    }

    pub fn with_predicates(predicates: Vec<Box<dyn EligibilityPredicate>>) -> Self {
        Self { predicates }
    }

    pub fn predicate_names(&self) -> Vec<&'static str> {
        self.predicates.iter().map(|p| p.name()).collect()
    }

    /// Classify every build the runner matches. Pure: reads only its inputs.
    pub fn filter(
        &self,
        runner: &RunnerMatcher,
        builds: &[BuildMatcher],
        ctx: &AdmissionContext<'_>,
    ) -> Admission {
        let mut decided: Vec<(i64, Verdict)> = Vec::new();

        for build in builds {
            if !runner.matches(build) {
                continue;
            }
            let verdict = self
                .predicates
                .iter()
                .map(|p| p.evaluate(runner, build, ctx))
                .max()
                .unwrap_or(Verdict::Admit);
            decided.extend(build.build_ids.iter().map(|id| (*id, verdict)));
        }

        decided.sort_unstable_by_key(|(id, _)| *id);

        let mut admission = Admission::default();
        for (id, verdict) in decided {
            match verdict {
                Verdict::Admit => admission.eligible.push(id),
                Verdict::Defer => admission.deferred.push(id),
                Verdict::Block => admission.blocked.push(id),
            }
        }

        debug!(
            runners = ?runner.runner_ids,
            eligible = admission.eligible.len(),
            deferred = admission.deferred.len(),
            blocked = admission.blocked.len(),
            "Admission evaluated"
        );
        admission
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::models::{AccessLevel, RunnerType, VisibilityLevel};
    use crate::fixtures;
    use crate::quota::QuotaState;

    const EXHAUSTED: i64 = 1;
    const HEALTHY: i64 = 2;

    fn runner(runner_type: RunnerType, tags: &[&str]) -> RunnerMatcher {
        RunnerMatcher {
            runner_ids: vec![100],
            runner_type,
            public_projects_minutes_cost_factor: 1.0,
            private_projects_minutes_cost_factor: 1.0,
            run_untagged: true,
            access_level: AccessLevel::NotProtected,
            active: true,
            tag_list: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// One project per namespace, sharing its id.
    fn build(ids: &[i64], tags: &[&str], namespace_id: i64) -> BuildMatcher {
        BuildMatcher {
            build_ids: ids.to_vec(),
            tag_list: tags.iter().map(|t| t.to_string()).collect(),
            protected: false,
            visibility_level: VisibilityLevel::Private,
            namespace_id,
            project_id: namespace_id,
        }
    }

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(
            [
                QuotaState {
                    namespace_id: EXHAUSTED,
                    minutes_used: 150.0,
                    minutes_limit: 100.0,
                    extra_minutes_limit: 0.0,
                },
                QuotaState {
                    namespace_id: HEALTHY,
                    minutes_used: 10.0,
                    minutes_limit: 100.0,
                    extra_minutes_limit: 0.0,
                },
            ],
        )
    }

    fn enforcing() -> AdmissionFilter {
        AdmissionFilter::new(&AdmissionSettings::default())
    }

    #[test]
    fn settings_compose_predicates() {
        assert_eq!(enforcing().predicate_names(), vec!["minutes_quota"]);

        let off = AdmissionSettings {
            disaster_recovery_disable_quota: true,
            ..AdmissionSettings::default()
        };
        assert!(AdmissionFilter::new(&off).predicate_names().is_empty());

        let off = AdmissionSettings {
            enforce_quota: false,
            ..AdmissionSettings::default()
        };
        assert!(AdmissionFilter::new(&off).predicate_names().is_empty());
    }

    #[test]
    fn output_preserves_queue_order_across_shapes() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let builds = vec![
            build(&[1, 4, 7], &[], HEALTHY),
            build(&[2, 5], &["docker"], HEALTHY),
            build(&[3, 6], &["gpu"], HEALTHY),
        ];

        let admission = enforcing().filter(&runner(RunnerType::InstanceType, &["docker"]), &builds, &ctx);
        assert_eq!(admission.eligible, vec![1, 2, 4, 5, 7]);
        assert!(admission.deferred.is_empty());
        assert!(admission.blocked.is_empty());
    }

    #[test]
    fn instance_runner_excludes_exhausted_namespace() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let builds = vec![build(&[1], &[], EXHAUSTED), build(&[2], &[], HEALTHY)];

        let admission = enforcing().filter(&runner(RunnerType::InstanceType, &[]), &builds, &ctx);
        assert_eq!(admission.eligible, vec![2]);
        assert_eq!(admission.blocked, vec![1]);
    }

    #[test]
    fn private_runner_escape_valve() {
        let ledger = ledger();
        let capacity = PrivateCapacity::new([(EXHAUSTED, vec![runner(RunnerType::ProjectType, &[])])]);
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let builds = vec![build(&[1], &[], EXHAUSTED)];
        let filter = enforcing();

        let shared = filter.filter(&runner(RunnerType::InstanceType, &[]), &builds, &ctx);
        assert!(shared.eligible.is_empty());
        assert_eq!(shared.deferred, vec![1]);
        assert!(shared.blocked.is_empty());

        let private = filter.filter(&runner(RunnerType::ProjectType, &[]), &builds, &ctx);
        assert_eq!(private.eligible, vec![1]);
    }

    #[test]
    fn escape_valve_needs_a_matching_private_runner() {
        let ledger = ledger();
        let capacity = PrivateCapacity::new([(
            EXHAUSTED,
            vec![runner(RunnerType::GroupType, &["windows"])],
        )]);
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let builds = vec![build(&[1], &["docker"], EXHAUSTED)];

        let admission = enforcing().filter(&runner(RunnerType::InstanceType, &["docker"]), &builds, &ctx);
        assert_eq!(admission.blocked, vec![1]);
    }

    #[test]
    fn group_runners_are_not_quota_gated() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let builds = vec![build(&[1], &[], EXHAUSTED)];

        let admission = enforcing().filter(&runner(RunnerType::GroupType, &[]), &builds, &ctx);
        assert_eq!(admission.eligible, vec![1]);
    }

    #[test]
    fn zero_cost_visibility_is_exempt() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let mut public = build(&[1], &[], EXHAUSTED);
        public.visibility_level = VisibilityLevel::Public;
        let private = build(&[2], &[], EXHAUSTED);

        let mut shared = runner(RunnerType::InstanceType, &[]);
        shared.public_projects_minutes_cost_factor = 0.0;

        let admission = enforcing().filter(&shared, &[public, private], &ctx);
        assert_eq!(admission.eligible, vec![1]);
        assert_eq!(admission.blocked, vec![2]);
    }

    #[test]
    fn disaster_recovery_bypasses_quota() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let settings = AdmissionSettings {
            disaster_recovery_disable_quota: true,
            ..AdmissionSettings::default()
        };
        let builds = vec![build(&[1], &[], EXHAUSTED)];

        let admission =
            AdmissionFilter::new(&settings).filter(&runner(RunnerType::InstanceType, &[]), &builds, &ctx);
        assert_eq!(admission.eligible, vec![1]);
    }

    #[test]
    fn protected_builds_skip_unprotected_runners() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let mut protected = build(&[1], &[], HEALTHY);
        protected.protected = true;
        let builds = vec![protected, build(&[2], &[], HEALTHY)];

        let mut r = runner(RunnerType::ProjectType, &[]);
        assert_eq!(enforcing().filter(&r, &builds, &ctx).eligible, vec![2]);

        r.access_level = AccessLevel::RefProtected;
        assert_eq!(enforcing().filter(&r, &builds, &ctx).eligible, vec![1, 2]);
    }

    #[test]
    fn unmatched_builds_are_not_classified() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let builds = vec![build(&[1], &["gpu"], EXHAUSTED)];

        let admission = enforcing().filter(&runner(RunnerType::InstanceType, &[]), &builds, &ctx);
        assert_eq!(admission, Admission::default());
    }

    #[derive(Debug)]
    struct DenyAll;

    impl EligibilityPredicate for DenyAll {
        fn name(&self) -> &'static str {
            "deny_all"
        }

        fn evaluate(&self, _: &RunnerMatcher, _: &BuildMatcher, _: &AdmissionContext<'_>) -> Verdict {
            Verdict::Block
        }
    }

    #[test]
    fn strictest_predicate_wins() {
        let ledger = ledger();
        let capacity = PrivateCapacity::default();
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let filter = AdmissionFilter::with_predicates(vec![Box::new(QuotaPredicate), Box::new(DenyAll)]);
        let builds = vec![build(&[1], &[], HEALTHY)];

        let admission = filter.filter(&runner(RunnerType::ProjectType, &[]), &builds, &ctx);
        assert_eq!(admission.blocked, vec![1]);
    }

    #[tokio::test]
    async fn concurrent_polls_agree_on_exhausted_quota() {
        let ledger = Arc::new(ledger());
        let capacity = Arc::new(PrivateCapacity::default());
        let filter = Arc::new(enforcing());
        let builds = Arc::new(vec![build(&[1], &[], EXHAUSTED), build(&[2], &[], HEALTHY)]);

        let mut handles = Vec::new();
        for i in 0..8 {
            let (ledger, capacity, filter, builds) =
                (ledger.clone(), capacity.clone(), filter.clone(), builds.clone());
            handles.push(tokio::spawn(async move {
                let mut r = runner(RunnerType::InstanceType, &[]);
                r.runner_ids = vec![i];
                let ctx = AdmissionContext {
                    ledger: &ledger,
                    private_capacity: &capacity,
                };
                filter.filter(&r, &builds, &ctx)
            }));
        }

        for handle in handles {
            let admission = handle.await.unwrap();
            assert_eq!(admission.eligible, vec![2]);
            assert_eq!(admission.blocked, vec![1]);
        }
    }

    #[test]
    fn escape_valve_is_scoped_to_the_build_project() {
        let ledger = ledger();
        let capacity = PrivateCapacity::new([(EXHAUSTED, vec![runner(RunnerType::ProjectType, &[])])]);
        let ctx = AdmissionContext {
            ledger: &ledger,
            private_capacity: &capacity,
        };
        let mut sibling = build(&[1], &[], EXHAUSTED);
        sibling.project_id = 99;

        let admission = enforcing().filter(&runner(RunnerType::InstanceType, &[]), &[sibling], &ctx);
        assert_eq!(admission.blocked, vec![1]);
    }

    #[tokio::test]
    async fn private_capacity_loads_per_project() {
        let db = Database::test_db().await;
        let root = fixtures::namespace(&db, None).await;
        let sub = fixtures::namespace(&db, Some(root)).await;
        let other_sub = fixtures::namespace(&db, Some(root)).await;
        let other = fixtures::namespace(&db, None).await;
        let project = fixtures::project(&db, sub, VisibilityLevel::Private).await;
        let sibling = fixtures::project(&db, sub, VisibilityLevel::Private).await;
        let no_groups = fixtures::project(&db, sub, VisibilityLevel::Private).await;
        fixtures::disable_group_runners(&db, no_groups).await;

        fixtures::project_runner(&db, sibling, &["docker"], false).await;
        fixtures::group_runner(&db, root, &["linux"], false).await;
        fixtures::group_runner(&db, other_sub, &["gpu"], false).await;
        fixtures::group_runner(&db, other, &[], true).await;
        fixtures::instance_runner(&db, &[], true).await;

        let online_since = Utc::now() - chrono::Duration::hours(2);
        let capacity = PrivateCapacity::load(&db, &[project, sibling, no_groups], online_since)
            .await
            .unwrap();

        let on = |project_id: i64, tags: &[&str]| {
            let mut b = build(&[1], tags, root);
            b.project_id = project_id;
            b
        };
        assert!(capacity.can_serve(&on(sibling, &["docker"])));
        assert!(!capacity.can_serve(&on(project, &["docker"])));
        assert!(capacity.can_serve(&on(project, &["linux"])));
        assert!(!capacity.can_serve(&on(no_groups, &["linux"])));
        assert!(!capacity.can_serve(&on(project, &["gpu"])));
        assert!(!capacity.can_serve(&on(project, &[])));
    }
}
