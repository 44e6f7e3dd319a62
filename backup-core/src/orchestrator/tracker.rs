//! Background operations that outlive the request that started them.
//!
//! A caller waits a bounded time for the result. If the operation is still
//! running it gets an id instead and polls [`OperationTracker::get`] until
//! the terminal state is recorded.

use crate::utils::errors::{BackupError, ErrorKind, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Running {
        label: String,
        started_at: DateTime<Utc>,
    },
    Succeeded {
        label: String,
        result: serde_json::Value,
        finished_at: DateTime<Utc>,
    },
    Failed {
        label: String,
        kind: ErrorKind,
        detail: String,
        finished_at: DateTime<Utc>,
    },
}

impl OperationStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, OperationStatus::Running { .. })
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            OperationStatus::Running { .. } => None,
            OperationStatus::Succeeded { finished_at, .. } | OperationStatus::Failed { finished_at, .. } => {
                Some(*finished_at)
            }
        }
    }
}

/// Outcome of [`OperationTracker::run_with_timeout`].
#[derive(Debug)]
pub enum Tracked<T> {
    Finished(Result<T>),
    Pending(Uuid),
}

#[derive(Clone)]
pub struct OperationTracker {
    operations: Arc<DashMap<Uuid, OperationStatus>>,
    tasks: TaskTracker,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self {
            operations: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
        }
    }
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `operation` and wait up to `wait` for it. The operation keeps
    /// running after the wait expires and records its own terminal state.
    pub async fn run_with_timeout<T, F>(&self, label: &str, wait: Duration, operation: F) -> Tracked<T>
    where
        T: Serialize + Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        self.operations.insert(
            id,
            OperationStatus::Running {
                label: label.to_string(),
                started_at: Utc::now(),
            },
        );

        let operations = self.operations.clone();
        let task_label = label.to_string();
        let mut handle = self.tasks.spawn(async move {
            let result = operation.await;
            let status = match &result {
                Ok(value) => OperationStatus::Succeeded {
                    label: task_label.clone(),
                    result: serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                    finished_at: Utc::now(),
                },
                Err(e) => OperationStatus::Failed {
                    label: task_label.clone(),
                    kind: e.kind(),
                    detail: e.to_string(),
                    finished_at: Utc::now(),
                },
            };
            operations.insert(id, status);
            result
        });

        match tokio::time::timeout(wait, &mut handle).await {
            Ok(joined) => Tracked::Finished(joined.map_err(BackupError::from).and_then(|r| r)),
            Err(_) => {
                info!(operation_id = %id, label, "Operation continues in the background");
                Tracked::Pending(id)
            }
        }
    }

    /// Refuse new operations and wait for every spawned one to record its
    /// terminal state. A restore past the engine stop cannot be abandoned,
    /// so there is no deadline here.
    pub async fn drain(&self) {
        self.tasks.close();
        let running = self.running();
        if running > 0 {
            info!(running, "Waiting for background operations to finish");
        }
        self.tasks.wait().await;
    }

    pub fn get(&self, id: &Uuid) -> Option<OperationStatus> {
        self.operations.get(id).map(|entry| entry.value().clone())
    }

    pub fn running(&self) -> usize {
        self.operations.iter().filter(|e| e.value().is_running()).count()
    }

    /// Forget finished operations older than `max_age`.
    pub fn prune(&self, max_age: ChronoDuration) -> usize {
        let cutoff = Utc::now() - max_age;
        let before = self.operations.len();
        self.operations
            .retain(|_, status| status.finished_at().map_or(true, |at| at > cutoff));
        let removed = before.saturating_sub(self.operations.len());
        if removed > 0 {
            warn!(removed, "Pruned finished operations");
        }
        removed
    }
}
