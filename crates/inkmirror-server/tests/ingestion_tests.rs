//! End-to-end ingestion pipeline tests
//!
//! Exercises the upload flow, quota deferral, retroactive processing, and
//! metadata-only ingestion against an in-memory database, a temp-dir blob
//! store, and a scripted OCR engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use inkmirror_core::config::ServerConfig;
use inkmirror_core::domain::newtypes::{NotebookUuid, PageUuid};
use inkmirror_core::domain::{OcrStatus, QuotaKind, Tier};
use inkmirror_core::ports::{OcrEngine, OcrError, OcrExtraction};
use inkmirror_destinations::DestinationRegistry;
use inkmirror_server::ingest::{
    IngestError, IngestionService, MetadataOutcome, UploadOutcome, UploadRequest,
};
use inkmirror_server::retroactive::RetroactiveProcessor;
use inkmirror_server::state::AppState;
use inkmirror_store::users::UserRecord;
use inkmirror_store::DatabasePool;
use inkmirror_telemetry::PipelineMetrics;

// ============================================================================
// Scripted OCR engine
// ============================================================================

/// OCR stub that succeeds with fixed text, counting invocations
struct ScriptedOcr {
    calls: AtomicUsize,
    fail_permanently: bool,
}

impl ScriptedOcr {
    fn succeeding() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_permanently: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_permanently: true,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl OcrEngine for ScriptedOcr {
    async fn extract(&self, pdf_bytes: &[u8]) -> Result<OcrExtraction, OcrError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_permanently {
            return Err(OcrError::Permanent("unreadable document".to_string()));
        }
        Ok(OcrExtraction {
            text: format!("transcription #{n} of {} bytes", pdf_bytes.len()),
            confidence: 0.95,
            page_count: 1,
        })
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    state: AppState,
    ingestion: IngestionService,
    ocr: Arc<ScriptedOcr>,
    user: UserRecord,
    _blob_dir: tempfile::TempDir,
}

async fn harness_with(ocr: ScriptedOcr, configure: impl FnOnce(&mut ServerConfig)) -> Harness {
    let mut config = ServerConfig::default();
    configure(&mut config);

    let db = DatabasePool::in_memory().await.unwrap();
    let blob_dir = tempfile::tempdir().unwrap();
    let object_store =
        Arc::new(inkmirror_blob::FsObjectStore::new(blob_dir.path().join("blobs")).unwrap());
    let ocr = Arc::new(ocr);
    let destinations = DestinationRegistry::new("test-master-secret", Duration::from_secs(2));
    let metrics = PipelineMetrics::new().unwrap();

    let state = AppState::new(
        config,
        db,
        object_store,
        ocr.clone() as Arc<dyn OcrEngine>,
        destinations,
        metrics,
    );
    let user = state.users.find_or_create("oauth|tester").await.unwrap();

    Harness {
        ingestion: IngestionService::new(state.clone()),
        state,
        ocr,
        user,
        _blob_dir: blob_dir,
    }
}

async fn harness() -> Harness {
    harness_with(ScriptedOcr::succeeding(), |_| {}).await
}

fn upload(notebook: NotebookUuid, page: PageUuid, number: i32, bytes: &[u8]) -> UploadRequest {
    UploadRequest {
        notebook_uuid: notebook,
        page_uuid: page,
        page_number: number,
        visible_name: Some("Field notes".to_string()),
        source: bytes.to_vec(),
        pdf: None,
    }
}

// ============================================================================
// Seed scenario 1: fresh free-tier user, limit 30
// ============================================================================

#[tokio::test]
async fn free_tier_user_fills_quota_then_defers() {
    let h = harness().await;
    assert_eq!(Tier::Free.ocr_page_limit(), 30);
    let notebook = NotebookUuid::new();

    // 30 single-page uploads complete and consume the whole budget
    for i in 0..30 {
        let outcome = h
            .ingestion
            .handle_upload(
                &h.user,
                upload(notebook, PageUuid::new(), i, format!("page {i}").as_bytes()),
            )
            .await
            .unwrap();
        assert!(
            matches!(outcome, UploadOutcome::Completed { cached: false, .. }),
            "upload {i} should complete"
        );
    }

    let snapshot = h
        .state
        .quota
        .observe(&h.user.id, QuotaKind::OcrPages)
        .await
        .unwrap();
    assert_eq!(snapshot.used, 30);
    assert!(snapshot.is_exhausted);
    assert_eq!(h.state.pages.count_pending_quota(&h.user.id).await.unwrap(), 0);

    // The 31st upload is accepted but deferred; the ledger does not move
    let outcome = h
        .ingestion
        .handle_upload(
            &h.user,
            upload(notebook, PageUuid::new(), 31, b"page 31"),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UploadOutcome::Deferred {
            pending_quota_pages: 1
        }
    );

    let snapshot = h
        .state
        .quota
        .observe(&h.user.id, QuotaKind::OcrPages)
        .await
        .unwrap();
    assert_eq!(snapshot.used, 30);
    assert_eq!(h.ocr.call_count(), 30, "deferred upload must not call OCR");

    // Exactly one 100% threshold event was recorded across the whole run
    let events = h.state.quota.pending_events(100).await.unwrap();
    let hundred: Vec<_> = events
        .iter()
        .filter(|e| e.event.threshold.percent() == Some(100))
        .collect();
    assert_eq!(hundred.len(), 1);
}

// ============================================================================
// Seed scenario 2: idempotent ingestion via hash
// ============================================================================

#[tokio::test]
async fn byte_identical_reupload_returns_cached_text() {
    let h = harness().await;
    let notebook = NotebookUuid::new();
    let page = PageUuid::new();

    let first = h
        .ingestion
        .handle_upload(&h.user, upload(notebook, page, 1, b"stroke blob"))
        .await
        .unwrap();
    let UploadOutcome::Completed { text, .. } = first else {
        panic!("first upload should complete");
    };

    let depth_before = h.state.work_queue.queued_depth().await.unwrap();
    let used_before = h
        .state
        .quota
        .observe(&h.user.id, QuotaKind::OcrPages)
        .await
        .unwrap()
        .used;

    // Same bytes, same page: cached text, no OCR, no quota, no new work
    let second = h
        .ingestion
        .handle_upload(&h.user, upload(notebook, page, 1, b"stroke blob"))
        .await
        .unwrap();
    match second {
        UploadOutcome::Completed {
            text: cached_text,
            cached,
            ..
        } => {
            assert!(cached);
            assert_eq!(cached_text, text);
        }
        other => panic!("expected cached completion, got {other:?}"),
    }

    assert_eq!(h.ocr.call_count(), 1);
    assert_eq!(
        h.state
            .quota
            .observe(&h.user.id, QuotaKind::OcrPages)
            .await
            .unwrap()
            .used,
        used_before
    );
    assert_eq!(h.state.work_queue.queued_depth().await.unwrap(), depth_before);
}

#[tokio::test]
async fn changed_bytes_are_new_work() {
    let h = harness().await;
    let notebook = NotebookUuid::new();
    let page = PageUuid::new();

    h.ingestion
        .handle_upload(&h.user, upload(notebook, page, 1, b"version one"))
        .await
        .unwrap();
    let outcome = h
        .ingestion
        .handle_upload(&h.user, upload(notebook, page, 1, b"version two"))
        .await
        .unwrap();

    assert!(matches!(outcome, UploadOutcome::Completed { cached: false, .. }));
    assert_eq!(h.ocr.call_count(), 2);
}

// ============================================================================
// Seed scenario 3: reset and drain, newest first
// ============================================================================

#[tokio::test]
async fn reset_drains_newest_deferred_pages_up_to_headroom() {
    let h = harness().await;
    let notebook = NotebookUuid::new();

    // Exhaust the 30-page budget
    for i in 0..30 {
        h.ingestion
            .handle_upload(
                &h.user,
                upload(notebook, PageUuid::new(), i, format!("filler {i}").as_bytes()),
            )
            .await
            .unwrap();
    }

    // Defer 50 more
    for i in 0..50 {
        let outcome = h
            .ingestion
            .handle_upload(
                &h.user,
                upload(
                    notebook,
                    PageUuid::new(),
                    100 + i,
                    format!("deferred {i}").as_bytes(),
                ),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UploadOutcome::Deferred { .. }));
    }
    assert_eq!(h.state.pages.count_pending_quota(&h.user.id).await.unwrap(), 50);

    // Reset: headroom 30 drains the 30 newest, 20 stay deferred
    let processor = RetroactiveProcessor::new(h.state.clone());
    let summary = processor.reset_and_process(&h.user.id).await.unwrap();
    assert_eq!(summary.claimed, 30);
    assert_eq!(summary.completed, 30);
    assert_eq!(summary.failed, 0);

    assert_eq!(h.state.pages.count_pending_quota(&h.user.id).await.unwrap(), 20);
    let snapshot = h
        .state
        .quota
        .observe(&h.user.id, QuotaKind::OcrPages)
        .await
        .unwrap();
    assert_eq!(snapshot.used, 30);
}

// ============================================================================
// Hard cap on deferred pages
// ============================================================================

#[tokio::test]
async fn deferred_page_cap_rejects_further_uploads() {
    let h = harness_with(ScriptedOcr::succeeding(), |config| {
        config.ingestion.max_pending_quota_pages = 3;
    })
    .await;
    let notebook = NotebookUuid::new();

    for i in 0..30 {
        h.ingestion
            .handle_upload(
                &h.user,
                upload(notebook, PageUuid::new(), i, format!("filler {i}").as_bytes()),
            )
            .await
            .unwrap();
    }

    let mut deferred_pages = Vec::new();
    for i in 0..3 {
        let page = PageUuid::new();
        let outcome = h
            .ingestion
            .handle_upload(
                &h.user,
                upload(notebook, page, 50 + i, format!("d{i}").as_bytes()),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, UploadOutcome::Deferred { .. }));
        deferred_pages.push(page);
    }

    // A page that would newly enter the deferred set is rejected
    let err = h
        .ingestion
        .handle_upload(&h.user, upload(notebook, PageUuid::new(), 60, b"one too many"))
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::TooManyPending(3)));

    // Changed content for an already-deferred page does not grow the set;
    // the cap does not apply and the upload is still accepted
    let outcome = h
        .ingestion
        .handle_upload(
            &h.user,
            upload(notebook, deferred_pages[0], 50, b"d0 revised"),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        UploadOutcome::Deferred {
            pending_quota_pages: 3
        }
    );
    assert_eq!(h.state.pages.count_pending_quota(&h.user.id).await.unwrap(), 3);
}

// ============================================================================
// OCR failure marks the page failed
// ============================================================================

#[tokio::test]
async fn permanent_ocr_failure_marks_page_failed_without_debit() {
    let h = harness_with(ScriptedOcr::failing(), |_| {}).await;
    let notebook = NotebookUuid::new();
    let page = PageUuid::new();

    let outcome = h
        .ingestion
        .handle_upload(&h.user, upload(notebook, page, 1, b"noise"))
        .await
        .unwrap();
    assert!(matches!(outcome, UploadOutcome::OcrFailed { .. }));

    let stored = h
        .state
        .pages
        .get_by_uuid(&h.user.id, &page)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.ocr_status(), OcrStatus::Failed);

    // OCR-first, debit-on-success: nothing was charged
    let snapshot = h
        .state
        .quota
        .observe(&h.user.id, QuotaKind::OcrPages)
        .await
        .unwrap();
    assert_eq!(snapshot.used, 0);
    // No sync work for a failed page
    assert_eq!(h.state.work_queue.queued_depth().await.unwrap(), 0);
}

// ============================================================================
// Seed scenario 5: metadata-only ingestion
// ============================================================================

#[tokio::test]
async fn metadata_update_on_unsynced_notebook_is_skipped() {
    let h = harness().await;
    let notebook = NotebookUuid::new();

    // Notebook exists (via an upload) but has never been synced anywhere
    h.ingestion
        .handle_upload(&h.user, upload(notebook, PageUuid::new(), 1, b"content"))
        .await
        .unwrap();
    let depth_before = h.state.work_queue.queued_depth().await.unwrap();

    let outcome = h
        .ingestion
        .handle_metadata_update(&h.user, notebook, Some("Renamed".to_string()), None)
        .await
        .unwrap();

    assert_eq!(outcome, MetadataOutcome::Skipped);
    assert_eq!(h.state.work_queue.queued_depth().await.unwrap(), depth_before);

    // The rename itself still landed locally
    let stored = h
        .state
        .notebooks
        .get(&h.user.id, &notebook)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.visible_name, "Renamed");
}

#[tokio::test]
async fn metadata_update_on_unknown_notebook_is_skipped() {
    let h = harness().await;
    let outcome = h
        .ingestion
        .handle_metadata_update(&h.user, NotebookUuid::new(), None, None)
        .await
        .unwrap();
    assert_eq!(outcome, MetadataOutcome::Skipped);
}

// ============================================================================
// Upload enqueues sync work (full item + container item on first contact)
// ============================================================================

#[tokio::test]
async fn completed_upload_enqueues_full_and_container_work() {
    let h = harness().await;
    let notebook = NotebookUuid::new();

    h.ingestion
        .handle_upload(&h.user, upload(notebook, PageUuid::new(), 1, b"content"))
        .await
        .unwrap();

    // One full item for the page, one container item for the notebook
    assert_eq!(h.state.work_queue.queued_depth().await.unwrap(), 2);

    // A second page in the same (still containerless) notebook adds only
    // its own full item; the open container item deduplicates
    h.ingestion
        .handle_upload(&h.user, upload(notebook, PageUuid::new(), 2, b"more"))
        .await
        .unwrap();
    assert_eq!(h.state.work_queue.queued_depth().await.unwrap(), 3);
}

// ============================================================================
// Initial sync bootstrap
// ============================================================================

#[tokio::test]
async fn initial_sync_queues_containers_and_pages_once() {
    let h = harness().await;
    let notebook = NotebookUuid::new();

    for i in 0..3 {
        h.ingestion
            .handle_upload(
                &h.user,
                upload(notebook, PageUuid::new(), i, format!("page {i}").as_bytes()),
            )
            .await
            .unwrap();
    }

    // The uploads themselves queued work; initial sync finds those items
    // still open and queues nothing new
    let (notebooks_queued, pages_queued) = h
        .ingestion
        .handle_initial_sync(&h.user, None, false)
        .await
        .unwrap();
    assert_eq!(notebooks_queued, 0);
    assert_eq!(pages_queued, 0);
}

#[tokio::test]
async fn upload_too_large_is_rejected() {
    let h = harness_with(ScriptedOcr::succeeding(), |config| {
        config.ingestion.max_upload_bytes = 16;
    })
    .await;

    let err = h
        .ingestion
        .handle_upload(
            &h.user,
            upload(NotebookUuid::new(), PageUuid::new(), 1, &[0u8; 64]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::UploadTooLarge(64)));
}
