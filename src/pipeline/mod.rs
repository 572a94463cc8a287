pub mod drop_not_runnable;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::models::FailureReason;

pub use drop_not_runnable::{DropNotRunnableBuildsService, DropOutcome, SkipReason};

/// Builds of one pipeline that were failed before ever being queued.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DroppedBuilds {
    pub pipeline_id: i64,
    pub build_ids: Vec<i64>,
    pub reason: FailureReason,
}

/// Fans out drop events so status reporting and notifications can react
/// without the drop service knowing about them.
#[derive(Debug, Clone)]
pub struct DropBroadcaster {
    tx: broadcast::Sender<DroppedBuilds>,
}

impl Default for DropBroadcaster {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }
}

impl DropBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DroppedBuilds> {
        self.tx.subscribe()
    }

    /// Publish a drop event. Having no subscribers is not an error.
    pub fn notify(&self, event: DroppedBuilds) {
        let _ = self.tx.send(event);
    }
}
