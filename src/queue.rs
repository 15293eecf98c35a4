//! Asynchronous processing queue.
//!
//! Every accepted upload is enqueued here and processed by a bounded pool of
//! workers. Processing a file fans out into two independent branches that
//! run concurrently and fail independently:
//!
//! - **vector branch** — chunk the extracted text, embed each chunk, replace
//!   the file's vector index
//! - **metadata branch** — LLM field extraction, risk aggregation, metadata
//!   upsert
//!
//! Shared prefix work (object download, text extraction) happens once per
//! dispatch; a shared-stage failure fails both branches. Branch status
//! transitions are persisted through the record store and broadcast on the
//! event bus as they happen.
//!
//! Enqueueing is idempotent: a file already waiting or in flight is not
//! queued twice. Completed branches are skipped on retry unless the caller
//! forces a full reprocess.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{error, info, warn};

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::embedding::EmbeddingGenerator;
use crate::error::PipelineError;
use crate::events::{EventBus, ProcessingEvent};
use crate::extract::TextExtractor;
use crate::metadata::{build_metadata, MetadataExtractor};
use crate::models::{Branch, ErrorType, ProcessingStatus, QueueStatus};
use crate::storage::ObjectStorage;
use crate::store::Store;
use crate::vector_store::VectorStore;

/// External collaborators the pipeline calls out to. Grouped so tests can
/// swap in fakes wholesale. Storage is shared with the upload handler.
pub struct PipelineDeps {
    pub storage: Arc<dyn ObjectStorage>,
    pub extractor: Box<dyn TextExtractor>,
    pub embedder: Arc<dyn EmbeddingGenerator>,
    pub metadata: Box<dyn MetadataExtractor>,
}

/// Result of an enqueue request, surfaced to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    AlreadyQueued,
    AlreadyCompleted,
    NotFound,
}

struct Job {
    file_id: String,
    force: bool,
}

#[derive(Clone)]
pub struct ProcessingQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    store: Store,
    vectors: Arc<dyn VectorStore>,
    deps: PipelineDeps,
    events: EventBus,
    chunk_size: usize,
    chunk_overlap: usize,
    store_write_retries: u32,
    max_workers: usize,

    tx: mpsc::UnboundedSender<Job>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    // File ids waiting or in flight; guards against duplicate dispatch.
    tracked: Mutex<HashSet<String>>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    running: AtomicBool,
    shutdown: Notify,
}

impl ProcessingQueue {
    pub fn new(
        config: &Config,
        store: Store,
        vectors: Arc<dyn VectorStore>,
        deps: PipelineDeps,
        events: EventBus,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(QueueInner {
                store,
                vectors,
                deps,
                events,
                chunk_size: config.chunking.chunk_size,
                chunk_overlap: config.chunking.chunk_overlap,
                store_write_retries: config.queue.store_write_retries,
                max_workers: config.queue.max_workers,
                tx,
                rx: Mutex::new(Some(rx)),
                tracked: Mutex::new(HashSet::new()),
                queued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Spawn the dispatcher. Call once; later calls are no-ops.
    pub fn start(&self) {
        let rx = match self.inner.rx.lock().expect("queue lock poisoned").take() {
            Some(rx) => rx,
            None => return,
        };
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            dispatch_loop(inner, rx).await;
        });
    }

    /// Stop accepting dispatches. Workers already running finish their file.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    /// Queue a file for processing. Idempotent per file id; with `force`,
    /// completed branches are reprocessed too.
    pub async fn enqueue(&self, file_id: &str, force: bool) -> Result<EnqueueOutcome, PipelineError> {
        let record = match self.inner.store.get_file(file_id).await? {
            Some(r) => r,
            None => return Ok(EnqueueOutcome::NotFound),
        };

        if !force
            && record.vector_processing_status == ProcessingStatus::Completed
            && record.metadata_processing_status == ProcessingStatus::Completed
        {
            return Ok(EnqueueOutcome::AlreadyCompleted);
        }

        {
            let mut tracked = self.inner.tracked.lock().expect("queue lock poisoned");
            if !tracked.insert(file_id.to_string()) {
                return Ok(EnqueueOutcome::AlreadyQueued);
            }
        }

        self.inner.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .inner
            .tx
            .send(Job {
                file_id: file_id.to_string(),
                force,
            })
            .is_err()
        {
            // Dispatcher is gone; roll back the bookkeeping.
            self.inner.queued.fetch_sub(1, Ordering::SeqCst);
            self.inner
                .tracked
                .lock()
                .expect("queue lock poisoned")
                .remove(file_id);
            return Err(PipelineError::Upload("queue is shut down".to_string()));
        }

        info!(file_id, force, "enqueued file for processing");
        Ok(EnqueueOutcome::Queued)
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            is_running: self.inner.running.load(Ordering::SeqCst),
            queued: self.inner.queued.load(Ordering::SeqCst),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            total_workers: self.inner.max_workers,
        }
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>, mut rx: mpsc::UnboundedReceiver<Job>) {
    let semaphore = Arc::new(Semaphore::new(inner.max_workers));
    info!(workers = inner.max_workers, "processing queue started");

    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = inner.shutdown.notified() => break,
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };

        inner.queued.fetch_sub(1, Ordering::SeqCst);
        inner.in_flight.fetch_add(1, Ordering::SeqCst);

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(e) = worker.process_file(&job.file_id, job.force).await {
                error!(file_id = %job.file_id, error = %e, "file processing aborted");
            }
            worker
                .tracked
                .lock()
                .expect("queue lock poisoned")
                .remove(&job.file_id);
            worker.in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        });
    }

    inner.running.store(false, Ordering::SeqCst);
    info!("processing queue stopped");
}

impl QueueInner {
    /// Run one dispatch for one file. Store failures on the critical status
    /// writes bubble up; stage failures are absorbed into branch state.
    async fn process_file(&self, file_id: &str, force: bool) -> Result<(), PipelineError> {
        let record = match self.store.get_file(file_id).await? {
            Some(r) => r,
            None => {
                warn!(file_id, "file deleted before processing, skipping");
                return Ok(());
            }
        };

        let run_vector = force || record.vector_processing_status != ProcessingStatus::Completed;
        let run_metadata =
            force || record.metadata_processing_status != ProcessingStatus::Completed;
        if !run_vector && !run_metadata {
            return Ok(());
        }

        self.with_store_retry(|| self.store.increment_attempts(file_id))
            .await?;

        if run_vector {
            self.set_status(file_id, Branch::Vector, ProcessingStatus::Processing)
                .await?;
        }
        if run_metadata {
            self.set_status(file_id, Branch::Metadata, ProcessingStatus::Processing)
                .await?;
        }

        // Shared prefix: fetch bytes, extract text once for both branches.
        let bytes = match self.deps.storage.download(&record.storage_id).await {
            Ok(b) => b,
            Err(e) => {
                warn!(file_id, error = %e, "object download failed");
                self.fail_branches(file_id, run_vector, run_metadata).await?;
                self.record_error(file_id, ErrorType::FileUpload, &e.to_string())
                    .await?;
                return Ok(());
            }
        };

        let text = match self.deps.extractor.extract(&record.filename, &bytes).await {
            Ok(t) => t,
            Err(e) => {
                warn!(file_id, error = %e, "text extraction failed");
                self.fail_branches(file_id, run_vector, run_metadata).await?;
                if run_vector {
                    self.record_error(file_id, ErrorType::VectorProcessing, &e.to_string())
                        .await?;
                }
                if run_metadata {
                    self.record_error(file_id, ErrorType::MetadataExtraction, &e.to_string())
                        .await?;
                }
                return Ok(());
            }
        };

        let vector_branch = async {
            if !run_vector {
                return Ok(());
            }
            match self.run_vector_branch(file_id, &text).await {
                Ok(()) => {
                    self.set_status(file_id, Branch::Vector, ProcessingStatus::Completed)
                        .await
                }
                Err(e) => {
                    warn!(file_id, error = %e, "vector branch failed");
                    self.set_status(file_id, Branch::Vector, ProcessingStatus::Failed)
                        .await?;
                    self.record_error(file_id, e.error_type(), &e.to_string())
                        .await
                }
            }
        };

        let metadata_branch = async {
            if !run_metadata {
                return Ok(());
            }
            match self.run_metadata_branch(file_id, &text).await {
                Ok(()) => {
                    self.set_status(file_id, Branch::Metadata, ProcessingStatus::Completed)
                        .await
                }
                Err(e) => {
                    warn!(file_id, error = %e, "metadata branch failed");
                    self.set_status(file_id, Branch::Metadata, ProcessingStatus::Failed)
                        .await?;
                    self.record_error(file_id, e.error_type(), &e.to_string())
                        .await
                }
            }
        };

        let (v, m) = tokio::join!(vector_branch, metadata_branch);
        v?;
        m?;

        info!(file_id, "dispatch finished");
        Ok(())
    }

    async fn run_vector_branch(&self, file_id: &str, text: &str) -> Result<(), PipelineError> {
        let chunks = chunk_text(file_id, text, self.chunk_size, self.chunk_overlap);
        let vectors = self.deps.embedder.embed(&chunks).await?;
        self.vectors
            .upsert(
                file_id,
                &chunks,
                &vectors,
                self.deps.embedder.model_name(),
                self.deps.embedder.dims(),
            )
            .await?;
        info!(file_id, chunks = chunks.len(), "vector index updated");
        Ok(())
    }

    async fn run_metadata_branch(&self, file_id: &str, text: &str) -> Result<(), PipelineError> {
        let fields = self.deps.metadata.extract_fields(text).await?;
        let metadata = build_metadata(file_id, fields, text.chars().count())?;
        self.with_store_retry(|| self.store.upsert_metadata(&metadata))
            .await?;
        self.events
            .publish(ProcessingEvent::metadata_extracted(file_id, metadata));
        Ok(())
    }

    async fn set_status(
        &self,
        file_id: &str,
        branch: Branch,
        status: ProcessingStatus,
    ) -> Result<(), PipelineError> {
        self.with_store_retry(|| self.store.update_status(file_id, branch, status))
            .await?;
        self.events
            .publish(ProcessingEvent::status_update(file_id, branch, status));
        Ok(())
    }

    async fn fail_branches(
        &self,
        file_id: &str,
        vector: bool,
        metadata: bool,
    ) -> Result<(), PipelineError> {
        if vector {
            self.set_status(file_id, Branch::Vector, ProcessingStatus::Failed)
                .await?;
        }
        if metadata {
            self.set_status(file_id, Branch::Metadata, ProcessingStatus::Failed)
                .await?;
        }
        Ok(())
    }

    async fn record_error(
        &self,
        file_id: &str,
        error_type: ErrorType,
        message: &str,
    ) -> Result<(), PipelineError> {
        self.with_store_retry(|| self.store.append_error(file_id, error_type, message, None))
            .await?;
        Ok(())
    }

    /// Retry a store write a bounded number of times before giving up.
    /// Transient SQLite busy errors under concurrent workers resolve within
    /// a retry or two.
    async fn with_store_retry<F, Fut>(&self, op: F) -> Result<(), sqlx::Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), sqlx::Error>>,
    {
        let mut last_err = None;
        for attempt in 0..=self.store_write_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "store write failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(sqlx::Error::PoolClosed))
    }
}
