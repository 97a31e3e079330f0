//! Background sync task handles.
//!
//! A triggered backfill returns a task id immediately; the task record stays observable here
//! after the HTTP response has gone out. The registry is bounded: the least recently touched
//! records are evicted first.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::IngestError;
use crate::sync_orchestrator::{SyncOutcome, SyncReport};

pub const DEFAULT_TASK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// What started a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SyncTask {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub trigger: SyncTrigger,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SyncReport>,
    /// Set when the run ended without a report (connection vanished, internal error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct TaskRegistry {
    tasks: Mutex<LruCache<Uuid, SyncTask>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_CAPACITY)
    }
}

impl TaskRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            tasks: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<Uuid, SyncTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create(&self, connection_id: Uuid, trigger: SyncTrigger) -> SyncTask {
        let task = SyncTask {
            id: Uuid::new_v4(),
            connection_id,
            trigger,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            report: None,
            error: None,
        };
        self.lock().put(task.id, task.clone());
        task
    }

    pub fn mark_running(&self, id: Uuid) {
        if let Some(task) = self.lock().get_mut(&id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        }
    }

    /// Record the run's result. Reports map to a status by outcome; errors without a report
    /// are `failed`, or `cancelled` for a cancellation.
    pub fn finish(&self, id: Uuid, result: &Result<SyncReport, IngestError>) {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&id) else {
            tracing::debug!(task_id = %id, "finished task was already evicted");
            return;
        };

        task.finished_at = Some(Utc::now());
        match result {
            Ok(report) => {
                task.status = match report.outcome {
                    SyncOutcome::Succeeded | SyncOutcome::PartiallySucceeded => TaskStatus::Succeeded,
                    SyncOutcome::Failed => TaskStatus::Failed,
                    SyncOutcome::Cancelled => TaskStatus::Cancelled,
                };
                task.report = Some(report.clone());
            }
            Err(IngestError::Cancelled) => {
                task.status = TaskStatus::Cancelled;
                task.error = Some(IngestError::Cancelled.to_string());
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
            }
        }
    }

    /// Look a task up without refreshing its eviction order.
    pub fn get(&self, id: Uuid) -> Option<SyncTask> {
        self.lock().peek(&id).cloned()
    }

    /// Most recently created task for a connection.
    pub fn latest_for_connection(&self, connection_id: Uuid) -> Option<SyncTask> {
        self.lock()
            .iter()
            .map(|(_, task)| task)
            .filter(|task| task.connection_id == connection_id)
            .reduce(|best, task| if task.created_at > best.created_at { task } else { best })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Provider;

    fn report(outcome: SyncOutcome) -> SyncReport {
        SyncReport {
            connection_id: Uuid::nil(),
            provider: Provider::Stripe,
            outcome,
            records_processed: 3,
            records_written: 3,
            records_skipped: 0,
            entities: Vec::new(),
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn task_moves_through_states() {
        let registry = TaskRegistry::default();
        let task = registry.create(Uuid::new_v4(), SyncTrigger::Manual);
        assert_eq!(registry.get(task.id).unwrap().status, TaskStatus::Queued);

        registry.mark_running(task.id);
        assert_eq!(registry.get(task.id).unwrap().status, TaskStatus::Running);

        registry.finish(task.id, &Ok(report(SyncOutcome::PartiallySucceeded)));
        let done = registry.get(task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Succeeded);
        assert_eq!(done.report.unwrap().records_processed, 3);
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn errors_and_cancellation_are_visible() {
        let registry = TaskRegistry::default();
        let failed = registry.create(Uuid::new_v4(), SyncTrigger::Scheduled);
        registry.finish(
            failed.id,
            &Err(IngestError::ConnectionNotFound("gone".into())),
        );
        assert_eq!(registry.get(failed.id).unwrap().status, TaskStatus::Failed);

        let cancelled = registry.create(Uuid::new_v4(), SyncTrigger::Manual);
        registry.finish(cancelled.id, &Ok(report(SyncOutcome::Cancelled)));
        assert_eq!(
            registry.get(cancelled.id).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn oldest_tasks_are_evicted() {
        let registry = TaskRegistry::new(2);
        let connection_id = Uuid::new_v4();
        let first = registry.create(connection_id, SyncTrigger::Manual);
        registry.create(connection_id, SyncTrigger::Manual);
        let third = registry.create(connection_id, SyncTrigger::Manual);

        assert_eq!(registry.len(), 2);
        assert!(registry.get(first.id).is_none());
        assert_eq!(
            registry.latest_for_connection(connection_id).unwrap().id,
            third.id
        );
    }
}
