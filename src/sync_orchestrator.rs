//! Sync Orchestrator
//!
//! Entry point for both ingestion paths. Backfill runs `ConnectionTesting → Backfilling →
//! Idle` for one connection at a time, walking each tracked entity type through the paginated
//! fetcher and writing page by page. Webhooks take the single-record path: verify, parse,
//! resolve the connection, normalize, write.
//!
//! At most one backfill runs per connection. The slot is claimed before any work starts and
//! released when the run's guard drops, whatever the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::{AppConfig, SyncConfig};
use crate::connectors::{
    ConnectionAdapter, ConnectionContext, Provider, Registry, SyncError, SyncErrorKind, SyncWindow,
};
use crate::crypto::CryptoKey;
use crate::error::IngestError;
use crate::models::connection::{self, STATUS_ACTIVE, STATUS_DISCONNECTED, STATUS_ERROR};
use crate::normalization::LifecycleAction;
use crate::pagination::fetch_all;
use crate::rate_limit::WebhookRateLimiter;
use crate::repositories::{
    ConnectionRepository, ConnectionSyncSettings, MetricWriter, ReceiptOutcome, ResumePoint,
    SyncCursorRepository, WebhookReceiptRepository, WriteSummary,
};
use crate::request_queue::QueueRegistry;
use crate::sync_tasks::{SyncTask, SyncTrigger, TaskRegistry};
use crate::webhook_verification::log_rejection;

/// Where a connection is in its sync lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    ConnectionTesting,
    Backfilling,
    Error,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Succeeded,
    /// Some entity types synced, others failed
    PartiallySucceeded,
    Failed,
    Cancelled,
}

/// Per-entity progress of one backfill run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct EntitySyncResult {
    pub entity_type: String,
    pub pages: u32,
    /// Provider records fetched and handed to the normalizer
    pub records_processed: u64,
    pub records_written: u64,
    pub records_skipped: u64,
    /// Records the normalizer rejected; they are logged and skipped
    pub records_malformed: u64,
    /// True when the entity reached the end of its window
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct EntitySyncError {
    pub entity_type: String,
    #[schema(value_type = Object)]
    pub error: SyncError,
}

/// Result summary of one backfill, returned to collaborators for display.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SyncReport {
    pub connection_id: Uuid,
    pub provider: Provider,
    pub outcome: SyncOutcome,
    pub records_processed: u64,
    pub records_written: u64,
    pub records_skipped: u64,
    pub entities: Vec<EntitySyncResult>,
    pub errors: Vec<EntitySyncError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Structured result of `test_connection`.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ConnectionTestReport {
    pub connection_id: Uuid,
    pub provider: Provider,
    pub success: bool,
    /// Connection status after the test
    pub status: String,
    pub consecutive_failures: i32,
    #[schema(value_type = Option<Object>)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncError>,
    /// True when a human must act (re-authorize) rather than wait
    pub requires_intervention: bool,
}

/// How an inbound webhook names its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookTarget {
    Connection(Uuid),
    Organization(Uuid),
    /// Resolve from the delivery itself (shop domain, Connect account).
    FromDelivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Processed,
    /// Same delivery already processed; nothing written
    Duplicate,
    /// Kind acknowledged but not mapped
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct WebhookOutcome {
    pub status: WebhookStatus,
    pub connection_id: Uuid,
    pub kind: String,
    pub records_written: u64,
    pub records_skipped: u64,
}

struct SyncSlot {
    phase: SyncPhase,
    cancel: CancellationToken,
    task_id: Option<Uuid>,
}

type Slots = Arc<Mutex<HashMap<Uuid, SyncSlot>>>;

fn lock_slots(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<Uuid, SyncSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds a connection's backfill slot; dropping it frees the slot.
pub struct SlotGuard {
    slots: Slots,
    connection_id: Uuid,
    cancel: CancellationToken,
}

impl SlotGuard {
    fn set_phase(&self, phase: SyncPhase) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&self.connection_id) {
            slot.phase = phase;
        }
    }

    fn set_task(&self, task_id: Uuid) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&self.connection_id) {
            slot.task_id = Some(task_id);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock_slots(&self.slots).remove(&self.connection_id);
    }
}

#[derive(Debug)]
enum EntityFailure {
    Sync(SyncError),
    Cancelled,
}

impl From<SyncError> for EntityFailure {
    fn from(error: SyncError) -> Self {
        Self::Sync(error)
    }
}

pub struct SyncOrchestrator {
    connections: ConnectionRepository,
    writer: MetricWriter,
    cursors: SyncCursorRepository,
    receipts: WebhookReceiptRepository,
    registry: Arc<Registry>,
    queues: Arc<QueueRegistry>,
    webhook_limiter: WebhookRateLimiter,
    tasks: TaskRegistry,
    slots: Slots,
    sync_config: SyncConfig,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<DatabaseConnection>,
        crypto_key: CryptoKey,
        registry: Arc<Registry>,
        queues: Arc<QueueRegistry>,
        config: &AppConfig,
    ) -> Self {
        Self {
            connections: ConnectionRepository::new(db.clone(), crypto_key),
            writer: MetricWriter::new(db.clone()),
            cursors: SyncCursorRepository::new(db.clone()),
            receipts: WebhookReceiptRepository::new(db),
            registry,
            queues,
            webhook_limiter: WebhookRateLimiter::per_minute(config.webhooks.rate_limit_per_minute),
            tasks: TaskRegistry::default(),
            slots: Arc::new(Mutex::new(HashMap::new())),
            sync_config: config.sync.clone(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn connections(&self) -> &ConnectionRepository {
        &self.connections
    }

    pub fn writer(&self) -> &MetricWriter {
        &self.writer
    }

    pub fn cursors(&self) -> &SyncCursorRepository {
        &self.cursors
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Claim the backfill slot for `connection_id`. Fails with `SyncInProgress` while another
    /// backfill holds it.
    pub fn try_acquire_slot(&self, connection_id: Uuid) -> Result<SlotGuard, IngestError> {
        let mut slots = lock_slots(&self.slots);
        if slots.contains_key(&connection_id) {
            return Err(IngestError::SyncInProgress { connection_id });
        }
        let cancel = self.shutdown.child_token();
        slots.insert(
            connection_id,
            SyncSlot {
                phase: SyncPhase::Idle,
                cancel: cancel.clone(),
                task_id: None,
            },
        );
        Ok(SlotGuard {
            slots: self.slots.clone(),
            connection_id,
            cancel,
        })
    }

    pub fn is_syncing(&self, connection_id: Uuid) -> bool {
        lock_slots(&self.slots).contains_key(&connection_id)
    }

    /// In-memory phase when a run is active, otherwise derived from the stored status.
    pub fn sync_phase(&self, connection: &connection::Model) -> SyncPhase {
        if let Some(slot) = lock_slots(&self.slots).get(&connection.id) {
            return slot.phase;
        }
        match connection.status.as_str() {
            STATUS_DISCONNECTED => SyncPhase::Disconnected,
            STATUS_ERROR => SyncPhase::Error,
            _ => SyncPhase::Idle,
        }
    }

    /// Task id of the run currently holding the slot, if it was spawned as a task.
    pub fn running_task(&self, connection_id: Uuid) -> Option<Uuid> {
        lock_slots(&self.slots)
            .get(&connection_id)
            .and_then(|slot| slot.task_id)
    }

    /// Abort an in-flight backfill. The cursor stays at the last written page.
    pub fn cancel_sync(&self, connection_id: Uuid) -> bool {
        match lock_slots(&self.slots).get(&connection_id) {
            Some(slot) => {
                slot.cancel.cancel();
                info!(connection_id = %connection_id, "sync cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every run; used at shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.queues.shutdown_all();
    }

    async fn load(&self, connection_id: Uuid) -> Result<connection::Model, IngestError> {
        self.connections
            .get_by_id(connection_id)
            .await?
            .ok_or_else(|| IngestError::ConnectionNotFound(connection_id.to_string()))
    }

    fn adapter_for(&self, model: &connection::Model) -> Result<(Provider, Arc<dyn ConnectionAdapter>), IngestError> {
        let adapter = self
            .registry
            .get_by_name(&model.provider)
            .map_err(|e| IngestError::ValidationFailed(e.to_string()))?;
        Ok((adapter.provider(), adapter))
    }

    fn context(
        &self,
        model: &connection::Model,
        adapter: &dyn ConnectionAdapter,
    ) -> Result<ConnectionContext, IngestError> {
        let credential = self.connections.credential(model).map_err(|_| {
            IngestError::AuthorizationFailed {
                provider: model.provider.clone(),
                message: "stored credential is unavailable".to_string(),
            }
        })?;
        let queue = self.queues.get_or_create(
            model.id,
            adapter.provider().as_str(),
            adapter.throttle_hint(),
        );
        Ok(ConnectionContext::new(
            model.id,
            model.organization_id,
            model.provider_account_id.clone(),
            credential,
            queue,
        ))
    }

    /// One lightweight authenticated call. Success keeps or restores `active`; failures
    /// count toward the `error` threshold, and a rejected credential flips it at once.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn test_connection(&self, connection_id: Uuid) -> Result<ConnectionTestReport, IngestError> {
        let model = self.load(connection_id).await?;
        if model.status == STATUS_DISCONNECTED {
            return Err(IngestError::ConnectionInactive {
                connection_id,
                status: model.status,
            });
        }
        let (provider, adapter) = self.adapter_for(&model)?;

        let result = match self.context(&model, adapter.as_ref()) {
            Ok(ctx) => adapter.test_connection(&ctx).await.map_err(SyncError::from),
            Err(err) => Err(SyncError::from(&err)),
        };

        match result {
            Ok(()) => {
                let updated = self.connections.record_test_success(connection_id).await?;
                info!(provider = %provider, "connection test passed");
                Ok(ConnectionTestReport {
                    connection_id,
                    provider,
                    success: true,
                    status: updated.status,
                    consecutive_failures: updated.consecutive_failures,
                    error: None,
                    requires_intervention: false,
                })
            }
            Err(sync_error) => {
                let unauthorized = sync_error.kind == SyncErrorKind::Unauthorized;
                let outcome = self
                    .connections
                    .record_test_failure(
                        connection_id,
                        &sync_error.to_string(),
                        self.sync_config.test_failure_threshold,
                        unauthorized,
                    )
                    .await?;
                warn!(provider = %provider, error = %sync_error, "connection test failed");
                Ok(ConnectionTestReport {
                    connection_id,
                    provider,
                    success: false,
                    status: outcome.connection.status,
                    consecutive_failures: outcome.connection.consecutive_failures,
                    error: Some(sync_error),
                    requires_intervention: unauthorized,
                })
            }
        }
    }

    /// Backfill inline. Rejected with `SyncInProgress` while another run holds the slot.
    pub async fn sync_connection(&self, connection_id: Uuid) -> Result<SyncReport, IngestError> {
        let guard = self.try_acquire_slot(connection_id)?;
        self.run_sync(&guard).await
    }

    /// Backfill in the background. The slot is claimed before returning, so a second
    /// trigger is rejected immediately rather than queued behind the first.
    pub fn spawn_sync(self: &Arc<Self>, connection_id: Uuid, trigger: SyncTrigger) -> Result<SyncTask, IngestError> {
        let guard = self.try_acquire_slot(connection_id)?;
        let task = self.tasks.create(connection_id, trigger);
        guard.set_task(task.id);

        let orchestrator = Arc::clone(self);
        let task_id = task.id;
        let span = info_span!("sync_task", task_id = %task_id, connection_id = %connection_id);
        tokio::spawn(
            async move {
                orchestrator.tasks.mark_running(task_id);
                let result = orchestrator.run_sync(&guard).await;
                if let Err(err) = &result {
                    warn!(error = %err, "background sync ended without a report");
                }
                drop(guard);
                orchestrator.tasks.finish(task_id, &result);
            }
            .instrument(span),
        );
        Ok(task)
    }

    #[instrument(skip(self, guard), fields(connection_id = %guard.connection_id))]
    async fn run_sync(&self, guard: &SlotGuard) -> Result<SyncReport, IngestError> {
        let connection_id = guard.connection_id;
        let started_at = Utc::now();
        let timer = Instant::now();

        let model = self.load(connection_id).await?;
        if model.status == STATUS_DISCONNECTED {
            return Err(IngestError::ConnectionInactive {
                connection_id,
                status: model.status,
            });
        }
        let (provider, adapter) = self.adapter_for(&model)?;

        guard.set_phase(SyncPhase::ConnectionTesting);
        let test = self.test_connection(connection_id).await?;
        if !test.success {
            let error = test
                .error
                .unwrap_or_else(|| SyncError::transient("connection test failed"));
            let report = SyncReport {
                connection_id,
                provider,
                outcome: SyncOutcome::Failed,
                records_processed: 0,
                records_written: 0,
                records_skipped: 0,
                entities: Vec::new(),
                errors: vec![EntitySyncError {
                    entity_type: "connection_test".to_string(),
                    error,
                }],
                started_at,
                finished_at: Utc::now(),
            };
            record_run(&report, timer.elapsed());
            return Ok(report);
        }

        // The test may have reactivated the connection; reload for the credential row.
        let model = self.load(connection_id).await?;
        let ctx = self.context(&model, adapter.as_ref())?;
        guard.set_phase(SyncPhase::Backfilling);

        let settings = ConnectionSyncSettings::from_connection_settings(model.settings.as_ref());
        let lookback = ChronoDuration::days(i64::from(settings.effective_lookback_days(&self.sync_config)));
        let until = Utc::now();
        let default_since = until - lookback;
        let entity_timeout = Duration::from_secs(self.sync_config.entity_timeout_seconds);

        let mut entities = Vec::new();
        let mut errors = Vec::new();
        let mut positions = Map::new();
        let mut cancelled = false;

        for entity_type in settings.select_entity_types(adapter.entity_types()) {
            if guard.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let mut progress = EntitySyncResult {
                entity_type: entity_type.to_string(),
                ..Default::default()
            };
            let stored = match self.cursors.get(connection_id, entity_type).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(entity_type, error = %err, "could not read sync cursor");
                    errors.push(EntitySyncError {
                        entity_type: entity_type.to_string(),
                        error: SyncError::transient(format!("cursor read failed: {err}")),
                    });
                    entities.push(progress);
                    continue;
                }
            };
            let resume = ResumePoint::from_model(stored.as_ref(), default_since);
            let window = SyncWindow {
                since: resume.since.min(until),
                until,
            };

            let outcome = tokio::select! {
                result = tokio::time::timeout(
                    entity_timeout,
                    self.backfill_entity(adapter.as_ref(), &ctx, entity_type, window, resume.position, &mut progress),
                ) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EntityFailure::Sync(SyncError::transient(format!(
                        "entity sync timed out after {}s",
                        entity_timeout.as_secs()
                    )))),
                },
                _ = guard.cancel.cancelled() => Err(EntityFailure::Cancelled),
            };

            match self.cursors.get(connection_id, entity_type).await {
                Ok(stored) => {
                    let position = stored.and_then(|c| c.position).unwrap_or(Value::Null);
                    positions.insert(entity_type.to_string(), position);
                }
                Err(err) => warn!(entity_type, error = %err, "could not read sync cursor position"),
            }

            match outcome {
                Ok(()) => {
                    info!(
                        entity_type,
                        records_processed = progress.records_processed,
                        records_written = progress.records_written,
                        "entity sync completed"
                    );
                }
                Err(EntityFailure::Cancelled) => {
                    warn!(entity_type, "entity sync cancelled");
                    errors.push(EntitySyncError {
                        entity_type: entity_type.to_string(),
                        error: SyncError::transient("cancelled"),
                    });
                    cancelled = true;
                }
                Err(EntityFailure::Sync(error)) => {
                    warn!(entity_type, error = %error, "entity sync failed");
                    let unauthorized = error.kind == SyncErrorKind::Unauthorized;
                    errors.push(EntitySyncError {
                        entity_type: entity_type.to_string(),
                        error: error.clone(),
                    });
                    if unauthorized {
                        if let Err(err) = self
                            .connections
                            .record_test_failure(
                                connection_id,
                                &error.to_string(),
                                self.sync_config.test_failure_threshold,
                                true,
                            )
                            .await
                        {
                            error!(entity_type, error = %err, "could not record rejected credential");
                        }
                    }
                }
            }
            entities.push(progress);

            if cancelled || errors.last().is_some_and(|e| e.error.kind == SyncErrorKind::Unauthorized) {
                break;
            }
        }

        let completed = entities.iter().filter(|e| e.completed).count();
        let outcome = if cancelled {
            SyncOutcome::Cancelled
        } else if errors.is_empty() {
            SyncOutcome::Succeeded
        } else if completed > 0 {
            SyncOutcome::PartiallySucceeded
        } else {
            SyncOutcome::Failed
        };

        if matches!(outcome, SyncOutcome::Succeeded | SyncOutcome::PartiallySucceeded) {
            if let Err(err) = self
                .connections
                .mark_synced(connection_id, until, Some(Value::Object(positions)))
                .await
            {
                // Records and cursors are already durable; the next run resumes from them.
                error!(error = %err, "could not stamp connection as synced");
            }
        }

        let report = SyncReport {
            connection_id,
            provider,
            outcome,
            records_processed: entities.iter().map(|e| e.records_processed).sum(),
            records_written: entities.iter().map(|e| e.records_written).sum(),
            records_skipped: entities.iter().map(|e| e.records_skipped).sum(),
            entities,
            errors,
            started_at,
            finished_at: Utc::now(),
        };
        record_run(&report, timer.elapsed());
        info!(
            provider = %provider,
            outcome = ?report.outcome,
            records_processed = report.records_processed,
            errors = report.errors.len(),
            "sync finished"
        );
        Ok(report)
    }

    /// Walk one entity type page by page. Each page is normalized and written before its
    /// successor's position is saved, so a crash or cancel resumes at the first unwritten page.
    async fn backfill_entity(
        &self,
        adapter: &dyn ConnectionAdapter,
        ctx: &ConnectionContext,
        entity_type: &str,
        window: SyncWindow,
        start_from: Option<crate::connectors::Cursor>,
        progress: &mut EntitySyncResult,
    ) -> Result<(), EntityFailure> {
        let connection_id = ctx.connection_id;
        let mut fetcher = fetch_all(
            adapter,
            ctx,
            entity_type,
            window,
            start_from,
            self.sync_config.page_size,
        );

        loop {
            let page = match fetcher.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(err) => return Err(EntityFailure::Sync(err.into())),
            };

            let mut drafts = Vec::new();
            for record in &page.records {
                match adapter.normalize(entity_type, record) {
                    Ok(mapped) => drafts.extend(mapped),
                    Err(err) => {
                        progress.records_malformed += 1;
                        warn!(entity_type, error = %err, "skipping malformed provider record");
                    }
                }
            }

            let summary = self.writer.write(connection_id, &drafts).await;
            progress.pages += 1;
            progress.records_processed += page.records.len() as u64;
            progress.records_written += summary.written;
            progress.records_skipped += summary.skipped;
            if !summary.is_complete() {
                return Err(SyncError::transient(format!(
                    "{} metric records failed to persist",
                    summary.failed
                ))
                .into());
            }

            if page.is_last {
                break;
            }
            self.cursors
                .save_position(connection_id, entity_type, page.resume_from.as_ref(), window.since)
                .await
                .map_err(|e| SyncError::transient(format!("failed to save cursor: {e}")))?;
        }

        self.cursors
            .complete(connection_id, entity_type, window.until)
            .await
            .map_err(|e| SyncError::transient(format!("failed to complete cursor: {e}")))?;
        progress.completed = true;
        Ok(())
    }

    /// Disconnect a connection: abort its backfill, tear down its queue and webhook window,
    /// and discard the credential.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn disconnect(&self, connection_id: Uuid, reason: &str) -> Result<connection::Model, IngestError> {
        self.cancel_sync(connection_id);
        self.queues.remove(connection_id);
        self.webhook_limiter.forget(connection_id);
        self.connections
            .disconnect(connection_id, reason)
            .await?
            .ok_or_else(|| IngestError::ConnectionNotFound(connection_id.to_string()))
    }

    async fn resolve_webhook_connection(
        &self,
        provider: Provider,
        target: WebhookTarget,
        account_hint: Option<&str>,
    ) -> Result<connection::Model, IngestError> {
        let found = match target {
            WebhookTarget::Connection(id) => self
                .connections
                .get_by_id(id)
                .await?
                .filter(|c| c.provider == provider.as_str()),
            WebhookTarget::Organization(org) => {
                self.connections
                    .find_active_by_org_provider(org, provider)
                    .await?
            }
            WebhookTarget::FromDelivery => match account_hint {
                Some(account) => {
                    self.connections
                        .find_by_provider_account(provider, account)
                        .await?
                }
                None => None,
            },
        };

        let model = found.ok_or_else(|| IngestError::ConnectionNotFound(format!("{provider} webhook target")))?;
        if model.status != STATUS_ACTIVE {
            return Err(IngestError::ConnectionInactive {
                connection_id: model.id,
                status: model.status,
            });
        }
        Ok(model)
    }

    /// Single-record ingestion for one webhook delivery.
    #[instrument(skip(self, headers, body), fields(provider = %provider))]
    pub async fn ingest_webhook(
        &self,
        provider: Provider,
        target: WebhookTarget,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, IngestError> {
        let adapter = self
            .registry
            .get(provider)
            .map_err(|e| IngestError::ConnectionNotFound(e.to_string()))?;

        adapter
            .verify_signature(headers, body, Utc::now().timestamp())
            .map_err(|err| {
                log_rejection(provider.as_str(), &err);
                IngestError::signature(provider.as_str(), err.reason())
            })?;

        let envelope = adapter.parse_webhook(headers, body)?;
        let model = self
            .resolve_webhook_connection(provider, target, envelope.account_hint.as_deref())
            .await?;
        let connection_id = model.id;

        if let Err(retry_after) = self.webhook_limiter.check(connection_id) {
            return Err(IngestError::RateLimitExceeded {
                retry_after_secs: Some(retry_after.as_secs().max(1)),
            });
        }

        let external_id = envelope
            .external_id
            .clone()
            .unwrap_or_else(|| body_digest(body));
        if self
            .receipts
            .find_completed(connection_id, provider.as_str(), &external_id)
            .await?
            .is_some()
        {
            debug!(connection_id = %connection_id, kind = %envelope.kind, "duplicate delivery absorbed");
            return Ok(WebhookOutcome {
                status: WebhookStatus::Duplicate,
                connection_id,
                kind: envelope.kind,
                records_written: 0,
                records_skipped: 0,
            });
        }

        let receipt = self
            .receipts
            .record_received(connection_id, provider.as_str(), &envelope.kind, &external_id)
            .await?;

        let result = self
            .apply_event(adapter.as_ref(), connection_id, &envelope.kind, &envelope.payload)
            .await;

        let (receipt_outcome, error_detail) = match &result {
            Ok((WebhookStatus::Ignored, _)) => (ReceiptOutcome::Ignored, None),
            Ok((_, summary)) => (
                ReceiptOutcome::Processed {
                    records_written: summary.written,
                },
                None,
            ),
            Err(err) => (ReceiptOutcome::Failed, Some(err.to_string())),
        };
        if let Err(err) = self
            .receipts
            .complete(receipt.id, receipt_outcome, error_detail.as_deref())
            .await
        {
            error!(receipt_id = %receipt.id, error = %err, "failed to complete webhook receipt");
        }

        let (status, summary) = result?;
        Ok(WebhookOutcome {
            status,
            connection_id,
            kind: envelope.kind,
            records_written: summary.written,
            records_skipped: summary.skipped,
        })
    }

    async fn apply_event(
        &self,
        adapter: &dyn ConnectionAdapter,
        connection_id: Uuid,
        kind: &str,
        payload: &Value,
    ) -> Result<(WebhookStatus, WriteSummary), IngestError> {
        let event = adapter.parse_event(kind, payload)?;

        match event.lifecycle() {
            Some(LifecycleAction::Disconnect) => {
                self.disconnect(connection_id, kind).await?;
                return Ok((WebhookStatus::Processed, WriteSummary::default()));
            }
            Some(LifecycleAction::RedactCustomer { customer_id }) => {
                self.writer
                    .redact_customer(connection_id, &customer_id)
                    .await
                    .map_err(IngestError::Internal)?;
                return Ok((WebhookStatus::Processed, WriteSummary::default()));
            }
            None => {}
        }

        if !event.is_handled() {
            info!(connection_id = %connection_id, kind, "unhandled event kind acknowledged");
            return Ok((WebhookStatus::Ignored, WriteSummary::default()));
        }

        let drafts = event.into_drafts()?;
        let summary = self.writer.write(connection_id, &drafts).await;
        if !summary.is_complete() {
            return Err(IngestError::Internal(anyhow::anyhow!(
                "{} of {} metric records failed to persist",
                summary.failed,
                drafts.len()
            )));
        }
        Ok((WebhookStatus::Processed, summary))
    }
}

/// Stand-in external id for deliveries that carry none.
fn body_digest(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

fn record_run(report: &SyncReport, elapsed: Duration) {
    let outcome = match report.outcome {
        SyncOutcome::Succeeded => "succeeded",
        SyncOutcome::PartiallySucceeded => "partial",
        SyncOutcome::Failed => "failed",
        SyncOutcome::Cancelled => "cancelled",
    };
    let provider = report.provider.as_str();
    counter!("sync_runs_total", "provider" => provider, "outcome" => outcome).increment(1);
    histogram!("sync_duration_seconds", "provider" => provider).record(elapsed.as_secs_f64());
}
