//! # Sync Scheduler
//!
//! Background loop that walks active connections each tick and spawns a backfill for every
//! connection whose interval has elapsed. Single-flight is enforced by the orchestrator, so a
//! connection still syncing from the previous trigger is simply skipped.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::IngestError;
use crate::models::connection;
use crate::repositories::ConnectionSyncSettings;
use crate::sync_orchestrator::SyncOrchestrator;
use crate::sync_tasks::SyncTrigger;

/// Default number of connections evaluated per tick.
const DEFAULT_BATCH_SIZE: usize = 128;

pub struct SyncScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    config: SchedulerConfig,
    batch_size: usize,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub connections_polled: u64,
    pub syncs_spawned: u64,
    pub skipped_running: u64,
    pub skipped_not_due: u64,
    pub overdue: u64,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Run until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting sync scheduler");
        let tick_interval = TokioDuration::from_secs(self.config.tick_interval_seconds.max(1));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync scheduler shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick(Utc::now()).await {
                        error!(error = %err, "Scheduler tick failed");
                    }
                    histogram!("sync_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Sync scheduler stopped");
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, IngestError> {
        let mut stats = TickStats::default();
        let mut candidates = self.orchestrator.connections().list_active().await?;
        candidates.sort_by_key(|c| c.last_synced_at);

        for connection in candidates.into_iter().take(self.batch_size) {
            stats.connections_polled += 1;
            self.process_connection(&connection, now, &mut stats);
        }

        gauge!("sync_scheduler_backlog_gauge").set(stats.overdue as f64);
        debug!(
            polled = stats.connections_polled,
            spawned = stats.syncs_spawned,
            skipped_running = stats.skipped_running,
            skipped_not_due = stats.skipped_not_due,
            "Scheduler tick completed"
        );
        Ok(stats)
    }

    fn process_connection(&self, connection: &connection::Model, now: DateTime<Utc>, stats: &mut TickStats) {
        if self.orchestrator.is_syncing(connection.id) {
            stats.skipped_running += 1;
            return;
        }

        let settings = ConnectionSyncSettings::from_connection_settings(connection.settings.as_ref());
        let interval = settings.effective_interval_seconds(&self.config);
        let jitter = jitter_seconds(&self.config, interval, connection.id);

        // A failed run never stamps `last_synced_at`; count the attempt so it is not retried
        // every tick.
        let last_attempt = self
            .orchestrator
            .tasks()
            .latest_for_connection(connection.id)
            .map(|task| task.created_at);
        let reference = [
            connection.last_synced_at.map(|at| at.with_timezone(&Utc)),
            last_attempt,
        ]
        .into_iter()
        .flatten()
        .max();

        let due_at = compute_due_at(reference, connection.created_at.with_timezone(&Utc), interval, jitter);
        if now < due_at {
            stats.skipped_not_due += 1;
            return;
        }
        if now - due_at > Duration::seconds(interval as i64) {
            stats.overdue += 1;
        }

        match self
            .orchestrator
            .spawn_sync(connection.id, SyncTrigger::Scheduled)
        {
            Ok(task) => {
                stats.syncs_spawned += 1;
                counter!("sync_scheduler_jobs_scheduled_total", "provider" => connection.provider.clone())
                    .increment(1);
                histogram!("sync_scheduler_jitter_seconds").record(jitter as f64);
                info!(
                    connection_id = %connection.id,
                    provider = %connection.provider,
                    task_id = %task.id,
                    interval_seconds = interval,
                    jitter_seconds = jitter,
                    "Scheduled sync spawned"
                );
            }
            Err(IngestError::SyncInProgress { .. }) => stats.skipped_running += 1,
            Err(err) => error!(connection_id = %connection.id, error = %err, "Failed to spawn scheduled sync"),
        }
    }
}

/// Next due time: one interval (plus jitter) after the last sync, or after activation for a
/// connection that has never synced.
fn compute_due_at(
    last_run: Option<DateTime<Utc>>,
    activated_at: DateTime<Utc>,
    interval_seconds: u64,
    jitter_seconds: u64,
) -> DateTime<Utc> {
    match last_run {
        Some(last) => last + Duration::seconds((interval_seconds + jitter_seconds) as i64),
        None => activated_at + Duration::seconds(jitter_seconds as i64),
    }
}

/// Stable per-connection jitter so schedules spread out without drifting between ticks.
fn jitter_seconds(config: &SchedulerConfig, interval_seconds: u64, connection_id: Uuid) -> u64 {
    let mut rng = StdRng::seed_from_u64(connection_id.as_u128() as u64);
    compute_jitter_seconds(config.jitter_pct_max, interval_seconds, &mut rng)
}

fn compute_jitter_seconds<R: Rng + ?Sized>(jitter_pct_max: f64, interval_seconds: u64, rng: &mut R) -> u64 {
    let max = jitter_pct_max.max(0.0);
    if max == 0.0 {
        return 0;
    }
    (interval_seconds as f64 * rng.gen_range(0.0..=max)).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn jitter_respects_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let jitter = compute_jitter_seconds(0.2, 900, &mut rng);
            assert!(jitter <= 180);
        }
        assert_eq!(compute_jitter_seconds(0.0, 900, &mut StepRng::new(0, 1)), 0);
    }

    #[test]
    fn jitter_is_stable_per_connection() {
        let config = SchedulerConfig::default();
        let id = Uuid::new_v4();
        assert_eq!(
            jitter_seconds(&config, 3600, id),
            jitter_seconds(&config, 3600, id)
        );
    }

    #[test]
    fn never_synced_connections_are_due_at_activation() {
        let activated = DateTime::parse_from_rfc3339("2025-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(compute_due_at(None, activated, 900, 30), activated + Duration::seconds(30));
    }

    #[test]
    fn synced_connections_wait_one_interval() {
        let last = DateTime::parse_from_rfc3339("2025-01-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let activated = last - Duration::days(3);
        assert_eq!(
            compute_due_at(Some(last), activated, 900, 0),
            last + Duration::minutes(15)
        );
    }

    mod with_orchestrator {
        use super::*;
        use crate::config::AppConfig;
        use crate::connectors::{Provider, Registry};
        use crate::crypto::CryptoKey;
        use crate::db::test_db;
        use crate::repositories::NewConnection;
        use crate::request_queue::{HttpTransport, OutboundRequest, OutboundResponse, QueueRegistry, TransportError};
        use async_trait::async_trait;

        struct Unreachable;

        #[async_trait]
        impl HttpTransport for Unreachable {
            async fn send(&self, _: &OutboundRequest) -> Result<OutboundResponse, TransportError> {
                Err(TransportError("offline".into()))
            }
        }

        #[tokio::test]
        async fn tick_spawns_once_per_connection() {
            let mut config = AppConfig::default();
            config.scheduler.jitter_pct_max = 0.0;
            let queues = Arc::new(QueueRegistry::new(
                Arc::new(Unreachable),
                config.queue.clone(),
                config.rate_limit_policy.clone(),
            ));
            let orchestrator = Arc::new(SyncOrchestrator::new(
                Arc::new(test_db().await),
                CryptoKey::new(vec![1u8; 32]).unwrap(),
                Arc::new(Registry::from_config(&config)),
                queues,
                &config,
            ));
            orchestrator
                .connections()
                .create(NewConnection {
                    organization_id: Uuid::new_v4(),
                    provider: Provider::Stripe,
                    provider_account_id: "acct_1",
                    credential: "sk_test_1",
                    settings: None,
                })
                .await
                .unwrap();

            let scheduler = SyncScheduler::new(orchestrator.clone(), config.scheduler.clone());
            let first = scheduler.tick(Utc::now()).await.unwrap();
            assert_eq!(first.syncs_spawned, 1);

            // The attempt counts as the last run whether or not it is still in flight.
            let second = scheduler.tick(Utc::now()).await.unwrap();
            assert_eq!(second.syncs_spawned, 0);
            assert_eq!(second.skipped_running + second.skipped_not_due, 1);
        }
    }
}
