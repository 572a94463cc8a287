pub mod admission;
pub mod queue;
pub mod settings;

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::db::models::ClaimedBuild;
use crate::db::Database;
use crate::pipeline::{DropBroadcaster, DropNotRunnableBuildsService, DropOutcome};
use admission::AdmissionFilter;
use queue::BuildQueueService;
use settings::AdmissionSettings;

/// Entry point for job requests and pipeline pruning, carrying the cached
/// admission settings and the drop broadcaster.
///
/// Cloning is cheap; clones share the same underlying data via Arc.
#[derive(Debug, Clone)]
pub struct Scheduler {
    settings: Arc<RwLock<AdmissionSettings>>,
    drops: DropBroadcaster,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            settings: Arc::new(RwLock::new(AdmissionSettings::default())),
            drops: DropBroadcaster::new(),
        }
    }

    /// Get a read-locked snapshot of the current admission settings.
    pub async fn settings(&self) -> AdmissionSettings {
        self.settings.read().await.clone()
    }

    /// Reload settings from the database into the cached Arc.
    pub async fn reload_settings(&self, db: &Database) -> anyhow::Result<()> {
        let new_settings = settings::load_settings(db).await?;
        let mut locked = self.settings.write().await;
        *locked = new_settings;
        Ok(())
    }

    /// Filter assembled from the current settings.
    pub async fn admission_filter(&self) -> AdmissionFilter {
        AdmissionFilter::new(&*self.settings.read().await)
    }

    /// Access the drop broadcaster.
    pub fn drops(&self) -> &DropBroadcaster {
        &self.drops
    }

    /// Serve a runner's job request.
    pub async fn request_job(
        &self,
        db: &Database,
        runner_id: i64,
    ) -> anyhow::Result<Option<ClaimedBuild>> {
        let settings = self.settings().await;
        BuildQueueService::new(db, &settings).process(runner_id).await
    }

    /// Fail builds of a new pipeline that cannot run within the minutes quota.
    pub async fn drop_not_runnable_builds(
        &self,
        db: &Database,
        pipeline_id: i64,
    ) -> anyhow::Result<DropOutcome> {
        let settings = self.settings().await;
        DropNotRunnableBuildsService::new(db, &settings, &self.drops)
            .execute(pipeline_id)
            .await
    }
}
