//! Two-phase destination sync
//!
//! Processes claimed work items against the destinations a user has
//! enabled. Page-level dedup follows the SyncRecord protocol:
//!
//! 1. Look up `SyncRecord(user, page, destination)`
//! 2. Present with a matching hash: done, no destination call
//! 3. Present with a differing hash: `update_item` in place
//! 4. Absent: recover via `check_duplicate`, else `sync_item`; the unique
//!    key arbitrates concurrent inserts, and the loser removes the extra
//!    external object it created
//! 5. Externally deleted objects drop the local record and restart as (4)
//!
//! Containers are never created here inline. A page sync that finds no
//! container enqueues a priority-0 container item and retries later, so
//! container creation stays serialized per user.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use inkmirror_core::domain::newtypes::{DestinationName, NotebookUuid, PageUuid, UserId};
use inkmirror_core::domain::{
    DestinationSelector, Notebook, OcrStatus, Page, SyncRecord, WorkItem, WorkKind,
};
use inkmirror_core::ports::{
    Destination, DestinationError, MetadataPayload, SyncItemPayload,
};
use inkmirror_destinations::DestinationRegistry;
use inkmirror_store::integrations::IntegrationRepository;
use inkmirror_store::notebooks::NotebookRepository;
use inkmirror_store::pages::PageRepository;
use inkmirror_store::sync_records::{container_scope, InsertOutcome, SyncRecordRepository};
use inkmirror_store::work_queue::WorkQueueRepository;
use inkmirror_store::StoreError;
use inkmirror_telemetry::PipelineMetrics;

/// Failure of one work item, classified along the retry boundary
#[derive(Debug, Error)]
pub enum SyncError {
    /// Retry with backoff (network, 5xx, rate limit, not-ready)
    #[error("retryable: {0}")]
    Retryable(String),
    /// Do not retry (auth, validation, permanent destination failure)
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        // Storage hiccups are worth retrying; the conditional-update
        // conflicts that matter are handled where they occur
        SyncError::Retryable(err.to_string())
    }
}

fn classify(dest: &DestinationName, err: &DestinationError) -> SyncError {
    match err {
        DestinationError::Transient(msg) => SyncError::Retryable(format!("{dest}: {msg}")),
        DestinationError::RateLimited { retry_after_secs } => {
            SyncError::Retryable(format!("{dest}: rate limited for {retry_after_secs}s"))
        }
        DestinationError::Auth(msg) => SyncError::Permanent(format!("{dest}: auth: {msg}")),
        DestinationError::ObjectGone(msg) => {
            // Handled inline by the caller; reaching here means the retry
            // after record deletion failed too
            SyncError::Retryable(format!("{dest}: object gone: {msg}"))
        }
        DestinationError::Permanent(msg) => SyncError::Permanent(format!("{dest}: {msg}")),
    }
}

// ============================================================================
// Adapter resolution
// ============================================================================

/// Resolves the destination adapters to sync for a user
///
/// Production resolves enabled IntegrationConfigs through the registry;
/// tests inject fixed adapters.
#[async_trait::async_trait]
pub trait AdapterSource: Send + Sync {
    /// Adapters for the user's enabled destinations, filtered by `selector`
    async fn adapters_for(
        &self,
        user_id: &UserId,
        selector: &DestinationSelector,
    ) -> anyhow::Result<Vec<Arc<dyn Destination>>>;
}

/// Registry-backed adapter source
pub struct RegistryAdapterSource {
    integrations: Arc<IntegrationRepository>,
    registry: Arc<DestinationRegistry>,
}

impl RegistryAdapterSource {
    /// Creates a source over the integration store and the registry
    pub fn new(
        integrations: Arc<IntegrationRepository>,
        registry: Arc<DestinationRegistry>,
    ) -> Self {
        Self {
            integrations,
            registry,
        }
    }
}

#[async_trait::async_trait]
impl AdapterSource for RegistryAdapterSource {
    async fn adapters_for(
        &self,
        user_id: &UserId,
        selector: &DestinationSelector,
    ) -> anyhow::Result<Vec<Arc<dyn Destination>>> {
        let configs = self.integrations.list_enabled(user_id).await?;
        let mut adapters = Vec::new();
        for config in configs {
            if !selector.includes(&config.destination) {
                continue;
            }
            match self.registry.build(&config) {
                Ok(adapter) => adapters.push(adapter),
                Err(err) => {
                    // A destination with broken credentials must not poison
                    // syncs to the others
                    warn!(
                        destination = %config.destination,
                        error = %err,
                        "Skipping destination with unusable config"
                    );
                }
            }
        }
        Ok(adapters)
    }
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Processes one claimed work item at a time
pub struct SyncEngine {
    pages: Arc<PageRepository>,
    notebooks: Arc<NotebookRepository>,
    sync_records: Arc<SyncRecordRepository>,
    work_queue: Arc<WorkQueueRepository>,
    integrations: Arc<IntegrationRepository>,
    adapters: Arc<dyn AdapterSource>,
    metrics: Arc<PipelineMetrics>,
}

impl SyncEngine {
    /// Creates the engine over its repositories and adapter source
    pub fn new(
        pages: Arc<PageRepository>,
        notebooks: Arc<NotebookRepository>,
        sync_records: Arc<SyncRecordRepository>,
        work_queue: Arc<WorkQueueRepository>,
        integrations: Arc<IntegrationRepository>,
        adapters: Arc<dyn AdapterSource>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            pages,
            notebooks,
            sync_records,
            work_queue,
            integrations,
            adapters,
            metrics,
        }
    }

    /// Processes one work item end to end
    #[tracing::instrument(skip(self, item), fields(id = %item.id, kind = %item.kind, target = %item.target_ref))]
    pub async fn process(&self, item: &WorkItem) -> Result<(), SyncError> {
        match item.kind {
            WorkKind::Container => self.process_container(item).await,
            WorkKind::Full => self.process_full(item).await,
            WorkKind::Metadata => self.process_metadata(item).await,
        }
    }

    // ------------------------------------------------------------------
    // Phase 1: container creation
    // ------------------------------------------------------------------

    async fn process_container(&self, item: &WorkItem) -> Result<(), SyncError> {
        let notebook_uuid: NotebookUuid = item
            .target_ref
            .parse()
            .map_err(|e| SyncError::Permanent(format!("bad container target: {e}")))?;

        let Some(notebook) = self.notebooks.get(&item.user_id, &notebook_uuid).await? else {
            // Notebook deleted since enqueue; nothing to create
            debug!("Container target notebook no longer exists");
            return Ok(());
        };

        let adapters = self
            .adapters
            .adapters_for(&item.user_id, &item.destinations)
            .await
            .map_err(|e| SyncError::Retryable(e.to_string()))?;

        let mut errors = Vec::new();
        for adapter in adapters {
            let dest = destination_name(adapter.as_ref())?;
            if self
                .sync_records
                .get_container(&item.user_id, &notebook_uuid, &dest)
                .await?
                .is_some()
            {
                debug!(destination = %dest, "Container already exists, skipping");
                continue;
            }

            match adapter
                .create_container(&notebook_uuid, &notebook.visible_name)
                .await
            {
                Ok(outcome) => {
                    let mut record = SyncRecord::container_success(
                        item.user_id,
                        container_scope(&notebook_uuid),
                        dest.clone(),
                        outcome.external_id,
                    );
                    record.metadata = outcome.metadata;
                    match self.sync_records.try_insert(&record).await? {
                        InsertOutcome::Inserted => {
                            info!(destination = %dest, "Container created");
                            self.metrics
                                .record_destination_sync(dest.as_str(), "container", "success");
                            self.integrations
                                .record_sync(&item.user_id, &dest)
                                .await
                                .ok();
                        }
                        InsertOutcome::Lost(_) => {
                            // A concurrent creation won; ours is surplus.
                            // Container single-writer leasing makes this
                            // effectively unreachable, but the record stays
                            // consistent either way.
                            warn!(destination = %dest, "Lost container insert race");
                        }
                    }
                }
                Err(err) => {
                    self.metrics
                        .record_destination_sync(dest.as_str(), "container", "error");
                    errors.push(classify(&dest, &err));
                }
            }
        }

        merge_errors(errors)
    }

    // ------------------------------------------------------------------
    // Phase 2: page upsert
    // ------------------------------------------------------------------

    async fn process_full(&self, item: &WorkItem) -> Result<(), SyncError> {
        let page_uuid: PageUuid = item
            .target_ref
            .parse()
            .map_err(|e| SyncError::Permanent(format!("bad page target: {e}")))?;

        let Some(page) = self.pages.get_by_uuid(&item.user_id, &page_uuid).await? else {
            debug!("Page no longer exists, nothing to sync");
            return Ok(());
        };

        match page.ocr_status() {
            OcrStatus::Completed => {}
            OcrStatus::Pending | OcrStatus::PendingQuota => {
                return Err(SyncError::Retryable(format!(
                    "page {page_uuid} not transcribed yet"
                )));
            }
            OcrStatus::Failed | OcrStatus::NotSynced => {
                debug!("Page has no transcription, nothing to sync");
                return Ok(());
            }
        }

        let Some(hash) = page.content_hash().cloned() else {
            return Err(SyncError::Retryable(format!("page {page_uuid} has no hash")));
        };
        let Some(notebook) = self
            .notebooks
            .get(&item.user_id, page.notebook_uuid())
            .await?
        else {
            debug!("Owning notebook gone, nothing to sync");
            return Ok(());
        };

        let adapters = self
            .adapters
            .adapters_for(&item.user_id, &item.destinations)
            .await
            .map_err(|e| SyncError::Retryable(e.to_string()))?;

        let mut errors = Vec::new();
        for adapter in adapters {
            let dest = destination_name(adapter.as_ref())?;
            if let Err(err) = self
                .sync_page_to(adapter.as_ref(), &dest, &page, &notebook, &hash)
                .await
            {
                errors.push(err);
            } else {
                self.integrations
                    .record_sync(&item.user_id, &dest)
                    .await
                    .ok();
            }
        }

        merge_errors(errors)
    }

    /// Runs the dedup protocol for one page against one destination
    async fn sync_page_to(
        &self,
        adapter: &dyn Destination,
        dest: &DestinationName,
        page: &Page,
        notebook: &Notebook,
        hash: &inkmirror_core::domain::newtypes::ContentHash,
    ) -> Result<(), SyncError> {
        let user_id = *page.user_id();
        let page_uuid = *page.page_uuid();

        let existing = self.sync_records.get(&user_id, &page_uuid, dest).await?;

        // Step 2: up to date, no destination call
        if let Some(ref record) = existing {
            if record.is_current(hash) {
                debug!(destination = %dest, "Replica current, skipping");
                self.metrics
                    .record_destination_sync(dest.as_str(), "noop", "success");
                return Ok(());
            }
        }

        let container = self
            .sync_records
            .get_container(&user_id, page.notebook_uuid(), dest)
            .await?;
        let Some(container) = container else {
            // Phase 1 has not reached this notebook yet: queue it and
            // come back with the next attempt
            self.work_queue
                .enqueue(&WorkItem::new(
                    user_id,
                    WorkKind::Container,
                    page.notebook_uuid().to_string(),
                    DestinationSelector::Named(vec![dest.clone()]),
                ))
                .await?;
            return Err(SyncError::Retryable(format!(
                "{dest}: container for notebook {} not created yet",
                page.notebook_uuid()
            )));
        };

        let payload = SyncItemPayload {
            page_uuid,
            notebook_uuid: *page.notebook_uuid(),
            notebook_title: notebook.visible_name.clone(),
            page_number: page.page_number(),
            text: page.ocr_text().unwrap_or_default().to_string(),
            confidence: page.ocr_confidence().unwrap_or(0.0),
            content_hash: hash.clone(),
            container_id: Some(container.external_id.clone()),
            metadata: existing.as_ref().and_then(|r| r.metadata.clone()),
        };

        // Step 3: update in place when the replica exists but is stale
        if let Some(record) = existing {
            return match adapter.update_item(&record.external_id, &payload).await {
                Ok(outcome) => {
                    self.sync_records
                        .mark_synced(&user_id, &page_uuid, dest, hash, outcome.metadata.as_ref())
                        .await?;
                    self.metrics
                        .record_destination_sync(dest.as_str(), "update", "success");
                    Ok(())
                }
                // Step 5: externally deleted; drop the record, restart as create
                Err(DestinationError::ObjectGone(_)) => {
                    info!(destination = %dest, "External object gone, recreating");
                    self.sync_records.delete(&user_id, &page_uuid, dest).await?;
                    self.create_replica(adapter, dest, &payload, &user_id, &page_uuid, hash)
                        .await
                }
                Err(err) => {
                    self.sync_records
                        .mark_failed(
                            &user_id,
                            &page_uuid,
                            dest,
                            &err.to_string(),
                            err.is_retryable(),
                        )
                        .await?;
                    self.metrics
                        .record_destination_sync(dest.as_str(), "update", "error");
                    Err(classify(dest, &err))
                }
            };
        }

        // Step 4: no local record
        self.create_replica(adapter, dest, &payload, &user_id, &page_uuid, hash)
            .await
    }

    /// Creates the external object (or recovers one) and records it
    async fn create_replica(
        &self,
        adapter: &dyn Destination,
        dest: &DestinationName,
        payload: &SyncItemPayload,
        user_id: &UserId,
        page_uuid: &PageUuid,
        hash: &inkmirror_core::domain::newtypes::ContentHash,
    ) -> Result<(), SyncError> {
        // Lost-record recovery: the destination may already hold an object
        // from an attempt whose response we never saw
        if adapter.capabilities().dedupe_check {
            match adapter.check_duplicate(hash).await {
                Ok(Some(external_id)) => {
                    info!(destination = %dest, external = %external_id, "Recovered external object by hash");
                    let record = SyncRecord::page_success(
                        *user_id,
                        *page_uuid,
                        dest.clone(),
                        external_id,
                        hash.clone(),
                    );
                    match self.sync_records.try_insert(&record).await? {
                        InsertOutcome::Inserted | InsertOutcome::Lost(_) => {
                            self.metrics
                                .record_destination_sync(dest.as_str(), "recover", "success");
                            return Ok(());
                        }
                    }
                }
                Ok(None) => {}
                Err(err) if err.is_retryable() => return Err(classify(dest, &err)),
                Err(err) => {
                    // A broken dedupe endpoint must not block creation
                    warn!(destination = %dest, error = %err, "check_duplicate failed, proceeding to create");
                }
            }
        }

        let outcome = match adapter.sync_item(payload).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics
                    .record_destination_sync(dest.as_str(), "create", "error");
                return Err(classify(dest, &err));
            }
        };

        let mut record = SyncRecord::page_success(
            *user_id,
            *page_uuid,
            dest.clone(),
            outcome.external_id.clone(),
            hash.clone(),
        );
        record.metadata = outcome.metadata;

        match self.sync_records.try_insert(&record).await? {
            InsertOutcome::Inserted => {
                self.metrics
                    .record_destination_sync(dest.as_str(), "create", "success");
                Ok(())
            }
            InsertOutcome::Lost(winner) => {
                // A concurrent worker created the replica first. The object
                // this call created is surplus; remove it so the destination
                // holds exactly one.
                warn!(
                    destination = %dest,
                    winner = %winner.external_id,
                    surplus = %outcome.external_id,
                    "Lost replica insert race, deleting surplus object"
                );
                if adapter.capabilities().delete {
                    if let Err(err) = adapter.delete_item(&outcome.external_id).await {
                        warn!(destination = %dest, error = %err, "Failed to delete surplus object");
                    }
                }
                if !winner.is_current(hash) {
                    let outcome = adapter
                        .update_item(&winner.external_id, payload)
                        .await
                        .map_err(|e| classify(dest, &e))?;
                    self.sync_records
                        .mark_synced(user_id, page_uuid, dest, hash, outcome.metadata.as_ref())
                        .await?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Metadata-only sync
    // ------------------------------------------------------------------

    async fn process_metadata(&self, item: &WorkItem) -> Result<(), SyncError> {
        let notebook_uuid: NotebookUuid = item
            .target_ref
            .parse()
            .map_err(|e| SyncError::Permanent(format!("bad metadata target: {e}")))?;

        let Some(notebook) = self.notebooks.get(&item.user_id, &notebook_uuid).await? else {
            debug!("Metadata target notebook no longer exists");
            return Ok(());
        };

        let page_count = self
            .pages
            .list_for_notebook(&item.user_id, &notebook_uuid)
            .await?
            .len() as i64;
        let folder_path = self
            .notebooks
            .folder_path(&item.user_id, &notebook_uuid)
            .await?;

        let adapters = self
            .adapters
            .adapters_for(&item.user_id, &item.destinations)
            .await
            .map_err(|e| SyncError::Retryable(e.to_string()))?;

        let mut errors = Vec::new();
        for adapter in adapters {
            let dest = destination_name(adapter.as_ref())?;
            let Some(container) = self
                .sync_records
                .get_container(&item.user_id, &notebook_uuid, &dest)
                .await?
            else {
                // Never synced here; metadata alone does not create objects
                debug!(destination = %dest, "No container, metadata sync skipped");
                continue;
            };

            let payload = MetadataPayload {
                notebook_uuid,
                title: notebook.visible_name.clone(),
                last_modified: notebook.last_modified.to_rfc3339(),
                page_count,
                folder_path: folder_path.clone(),
            };

            match adapter.update_metadata(&container.external_id, &payload).await {
                Ok(_) => {
                    self.metrics
                        .record_destination_sync(dest.as_str(), "metadata", "success");
                }
                Err(err) => {
                    self.metrics
                        .record_destination_sync(dest.as_str(), "metadata", "error");
                    errors.push(classify(&dest, &err));
                }
            }
        }

        merge_errors(errors)
    }
}

fn destination_name(adapter: &dyn Destination) -> Result<DestinationName, SyncError> {
    DestinationName::new(adapter.name())
        .map_err(|e| SyncError::Permanent(format!("adapter reports invalid name: {e}")))
}

/// Collapses per-destination errors into the item outcome
///
/// Any retryable error keeps the item retryable: the dedup protocol makes
/// re-processing already-synced destinations a no-op.
fn merge_errors(errors: Vec<SyncError>) -> Result<(), SyncError> {
    if errors.is_empty() {
        return Ok(());
    }
    let any_retryable = errors.iter().any(|e| matches!(e, SyncError::Retryable(_)));
    let joined = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");
    if any_retryable {
        Err(SyncError::Retryable(joined))
    } else {
        Err(SyncError::Permanent(joined))
    }
}
