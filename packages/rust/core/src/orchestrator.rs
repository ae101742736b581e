//! Run orchestration: detection, worker pool, finalization.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use contentsift_dedup::{AiSimilarity, DuplicateDetector, SimilarityService, SystemMemory};
use contentsift_llm::TextAnalyzer;
use contentsift_shared::{
    ContentId, ContentItem, DetectionMethod, DuplicateAnalysis, ProcessedContent,
    ProcessingConfig, ProcessingResult, ProcessingStats, QueryContext, RunId, SiftError,
    panic_message,
};
use contentsift_stages::StageAgents;

use crate::pipeline::ItemPipeline;
use crate::queue::{Pull, WorkQueue};
use crate::resources::ResourceMonitor;
use crate::{ProgressReporter, SilentProgress};

pub const NO_CONTENT_ERROR: &str = "No content provided for processing";
pub const ALL_FAILED_ERROR: &str = "All content processing failed";

/// Weight of the analysis relevance score in the final ranking.
const RELEVANCE_BOOST: f64 = 0.3;

/// Drives one batch of items from raw input to a ranked [`ProcessingResult`].
pub struct Orchestrator {
    config: Arc<ProcessingConfig>,
    pipeline: ItemPipeline,
    detector: Option<Arc<DuplicateDetector>>,
    monitor: Arc<ResourceMonitor>,
    progress: Arc<dyn ProgressReporter>,
    cleanup_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Orchestrator {
    pub fn new(
        config: ProcessingConfig,
        agents: StageAgents,
        detector: Option<DuplicateDetector>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            pipeline: ItemPipeline::new(agents, config.clone()),
            config,
            detector: detector.map(Arc::new),
            monitor: Arc::new(ResourceMonitor::new(Arc::new(SystemMemory::new()))),
            progress: Arc::new(SilentProgress),
            cleanup_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Default stages and detector, all backed by `analyzer` when given.
    ///
    /// Without an analyzer the AI stages fall back to placeholders and
    /// duplicate detection runs in pattern-only mode.
    pub fn from_analyzer(config: ProcessingConfig, analyzer: Option<Arc<dyn TextAnalyzer>>) -> Self {
        let detector = config.settings().enable_duplicate_detection.then(|| {
            let similarity = analyzer
                .clone()
                .map(|a| Arc::new(AiSimilarity::new(a)) as Arc<dyn SimilarityService>);
            DuplicateDetector::new(&config, similarity)
        });
        Self::new(config, StageAgents::new(analyzer), detector)
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = Arc::new(monitor);
        self
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// Process `items` for `query`.
    ///
    /// Never fails: the result always holds at least one processed item or
    /// at least one error.
    #[instrument(skip_all, fields(items = items.len(), query = %query.text))]
    pub async fn run(&self, items: Vec<ContentItem>, query: QueryContext) -> ProcessingResult {
        let run_id = RunId::new();
        let started = Instant::now();

        if items.is_empty() {
            warn!(%run_id, "empty input");
            let result = ProcessingResult::empty(run_id, query, NO_CONTENT_ERROR);
            self.progress.done(&result);
            return result;
        }

        info!(%run_id, concurrency = self.config.settings().concurrency, "starting run");
        self.monitor.snapshot("run start");

        let items: Vec<Arc<ContentItem>> = items.into_iter().map(Arc::new).collect();
        let mut scope = RunScope::new(
            self.config.shutdown_grace(),
            self.cleanup_lock.clone(),
            self.monitor.clone(),
        );

        let run_timeout = self.config.run_timeout();
        let timed_out = tokio::time::timeout(run_timeout, self.execute(&items, &query, &mut scope))
            .await
            .is_err();

        let Collected {
            processed,
            mut errors,
        } = scope.cleanup().await;
        if timed_out {
            let err = SiftError::timeout("content processing run", run_timeout.as_secs());
            error!(%run_id, error = %err, "run timed out");
            errors.push(err.to_string());
        }

        let successful = processed.len();
        if processed.is_empty() && errors.is_empty() {
            errors.push(ALL_FAILED_ERROR.to_string());
        }

        self.progress.phase("Ranking results");
        let (ranked, filtered) = self.finalize(processed, &mut errors);
        let detection = scope.detection.get().copied();

        let wall_time = started.elapsed();
        let stats = ProcessingStats {
            total_items: items.len(),
            successful,
            failed: items.len().saturating_sub(successful),
            filtered,
            duplicates_found: detection.map_or(0, |d| d.duplicates),
            wall_time,
            detection_method: detection.map(|d| d.method),
        };
        info!(
            %run_id,
            successful = stats.successful,
            failed = stats.failed,
            filtered = stats.filtered,
            duplicates = stats.duplicates_found,
            elapsed_ms = wall_time.as_millis() as u64,
            "run completed"
        );

        let result = ProcessingResult {
            run_id,
            processed_contents: ranked,
            stats,
            errors,
            total_processing_time: wall_time,
            query,
        };
        self.progress.done(&result);
        result
    }

    async fn execute(&self, items: &[Arc<ContentItem>], query: &QueryContext, scope: &mut RunScope) {
        let duplicates = self.detect_duplicates(items, scope).await;

        self.progress.phase("Processing content");
        let settings = self.config.settings();
        let queue = scope.queue.clone();
        let context = Arc::new(WorkerContext {
            query: query.clone(),
            duplicates,
            item_timeout: self.config.item_timeout(),
            poll_timeout: self.config.worker_poll_timeout(),
            total: items.len(),
            finished: AtomicUsize::new(0),
            progress: self.progress.clone(),
        });

        for worker_id in 0..settings.concurrency {
            let worker = Worker {
                id: worker_id,
                queue: queue.clone(),
                pipeline: self.pipeline.clone(),
                context: context.clone(),
                cancel: scope.cancel.child_token(),
                results: scope.results_tx.clone(),
                errors: scope.errors_tx.clone(),
            };
            scope.workers.spawn(worker.run());
        }

        for item in items {
            if let Err(e) = queue.push(item.clone()).await {
                error!(url = %item.url, error = %e, "failed to enqueue item");
                let _ = scope.errors_tx.send(format!("{}: {e}", item.url));
            }
        }
        queue.close().await;
        debug!(pending = queue.pending(), "all items enqueued");

        queue.join().await;
    }

    async fn detect_duplicates(
        &self,
        items: &[Arc<ContentItem>],
        scope: &RunScope,
    ) -> HashMap<ContentId, DuplicateAnalysis> {
        let Some(detector) = self
            .detector
            .as_ref()
            .filter(|_| self.config.settings().enable_duplicate_detection)
        else {
            return HashMap::new();
        };

        self.progress.phase("Detecting duplicates");
        let limit = self.config.detection_timeout();
        let Ok(analyses) = tokio::time::timeout(limit, detector.detect(items)).await else {
            let err = SiftError::timeout("duplicate detection", limit.as_secs());
            warn!(error = %err, "continuing without duplicate data");
            return HashMap::new();
        };
        let method = analyses
            .first()
            .map_or(DetectionMethod::Trivial, |a| a.method);
        let duplicates = analyses.iter().filter(|a| a.has_duplicates).count();
        let _ = scope.detection.set(DetectionSummary { method, duplicates });

        if method == DetectionMethod::Failed {
            let reason = analyses
                .first()
                .and_then(|a| a.error.clone())
                .unwrap_or_default();
            warn!(%reason, "duplicate detection failed, continuing without duplicate data");
            return HashMap::new();
        }

        analyses
            .into_iter()
            .map(|analysis| (analysis.content_id.clone(), analysis))
            .collect()
    }

    /// Filter by minimum quality, then rank best-first.
    ///
    /// Items with insights rank by `min(1, quality + relevance * 0.3)`,
    /// others by quality alone. Returns the ranked list and how many items
    /// the filter removed.
    fn finalize(
        &self,
        mut processed: Vec<ProcessedContent>,
        errors: &mut Vec<String>,
    ) -> (Vec<ProcessedContent>, usize) {
        let min_quality = self.config.settings().min_content_quality_score;
        let before = processed.len();
        processed.retain(|p| p.enhanced_quality_score >= min_quality);
        let filtered = before - processed.len();

        if processed.is_empty() && filtered > 0 {
            info!(filtered, min_quality, "every item fell below the quality threshold");
            errors.push(format!(
                "All {filtered} processed items scored below the minimum quality of {min_quality}"
            ));
        }

        processed.sort_by(|a, b| {
            ranking_score(b)
                .total_cmp(&ranking_score(a))
                .then_with(|| b.enhanced_quality_score.total_cmp(&a.enhanced_quality_score))
                .then_with(|| a.content_id.cmp(&b.content_id))
        });
        (processed, filtered)
    }
}

fn ranking_score(content: &ProcessedContent) -> f64 {
    match &content.insights {
        Some(insights) => {
            (content.enhanced_quality_score + insights.relevance_score * RELEVANCE_BOOST).min(1.0)
        }
        None => content.enhanced_quality_score,
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Read-only state shared by the workers of one run.
struct WorkerContext {
    query: QueryContext,
    duplicates: HashMap<ContentId, DuplicateAnalysis>,
    item_timeout: Duration,
    poll_timeout: Duration,
    total: usize,
    finished: AtomicUsize,
    progress: Arc<dyn ProgressReporter>,
}

struct Worker {
    id: usize,
    queue: Arc<WorkQueue<Arc<ContentItem>>>,
    pipeline: ItemPipeline,
    context: Arc<WorkerContext>,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<ProcessedContent>,
    errors: mpsc::UnboundedSender<String>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        loop {
            let pulled = tokio::select! {
                _ = self.cancel.cancelled() => break,
                pulled = self.queue.pull(self.context.poll_timeout) => pulled,
            };
            let (item, _ack) = match pulled {
                Pull::Item(item, ack) => (item, ack),
                Pull::Empty => continue,
                Pull::Closed => break,
            };

            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = self.errors.send(format!("{}: cancelled", item.url));
                    break;
                }
                outcome = self.process(item.clone()) => outcome,
            };
            match outcome {
                Ok(processed) => {
                    let _ = self.results.send(processed);
                }
                Err(message) => {
                    warn!(worker = self.id, url = %item.url, error = %message, "item failed");
                    let _ = self.errors.send(format!("{}: {message}", item.url));
                }
            }

            let finished = self.context.finished.fetch_add(1, Ordering::Relaxed) + 1;
            self.context.progress.item_finished(finished, self.context.total);
        }
        debug!(worker = self.id, "worker stopped");
    }

    /// Run the pipeline under the per-item timeout, containing panics.
    async fn process(&self, item: Arc<ContentItem>) -> Result<ProcessedContent, String> {
        let analysis = self.context.duplicates.get(&item.id()).cloned();
        let work = AssertUnwindSafe(self.pipeline.process(item, &self.context.query, analysis))
            .catch_unwind();

        match tokio::time::timeout(self.context.item_timeout, work).await {
            Ok(Ok(Ok(processed))) => Ok(processed),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(payload)) => Err(format!(
                "processing panicked: {}",
                panic_message(payload.as_ref())
            )),
            Err(_) => Err(
                SiftError::timeout("item processing", self.context.item_timeout.as_secs())
                    .to_string(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Run scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DetectionSummary {
    method: DetectionMethod,
    duplicates: usize,
}

#[derive(Default)]
struct Collected {
    processed: Vec<ProcessedContent>,
    errors: Vec<String>,
}

/// Everything one run owns: queue, channels, workers, cancellation.
///
/// [`cleanup`](Self::cleanup) is idempotent; dropping the scope cancels any
/// worker still running.
struct RunScope {
    queue: Arc<WorkQueue<Arc<ContentItem>>>,
    workers: JoinSet<()>,
    cancel: CancellationToken,
    results_tx: mpsc::UnboundedSender<ProcessedContent>,
    results_rx: mpsc::UnboundedReceiver<ProcessedContent>,
    errors_tx: mpsc::UnboundedSender<String>,
    errors_rx: mpsc::UnboundedReceiver<String>,
    detection: OnceLock<DetectionSummary>,
    grace: Duration,
    cleanup_lock: Arc<tokio::sync::Mutex<()>>,
    monitor: Arc<ResourceMonitor>,
    cleaned: bool,
}

impl RunScope {
    fn new(
        grace: Duration,
        cleanup_lock: Arc<tokio::sync::Mutex<()>>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            queue: Arc::new(WorkQueue::new(QUEUE_CAPACITY)),
            workers: JoinSet::new(),
            cancel: CancellationToken::new(),
            results_tx,
            results_rx,
            errors_tx,
            errors_rx,
            detection: OnceLock::new(),
            grace,
            cleanup_lock,
            monitor,
            cleaned: false,
        }
    }

    /// Stop workers, drain the queue and channels, snapshot resources.
    async fn cleanup(&mut self) -> Collected {
        let mut collected = Collected::default();
        if self.cleaned {
            return collected;
        }
        self.cleaned = true;

        let lock = self.cleanup_lock.clone();
        let _guard = match lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!("cleanup lock held by another run, continuing without it");
                None
            }
        };

        self.cancel.cancel();
        self.shutdown_workers().await;

        let abandoned = self.queue.drain().await;
        if abandoned > 0 {
            warn!(abandoned, "items left in queue at shutdown");
            collected
                .errors
                .push(format!("{abandoned} items were not processed before shutdown"));
        }

        while let Ok(processed) = self.results_rx.try_recv() {
            collected.processed.push(processed);
        }
        while let Ok(error) = self.errors_rx.try_recv() {
            collected.errors.push(error);
        }

        self.monitor.snapshot("run cleanup");
        self.monitor.check_growth();
        collected
    }

    /// Let workers finish within the grace period, then abort the rest.
    async fn shutdown_workers(&mut self) {
        let workers = &mut self.workers;
        let graceful = tokio::time::timeout(self.grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "worker panicked");
                    }
                }
            }
        })
        .await;

        if graceful.is_err() {
            warn!(
                remaining = self.workers.len(),
                "workers did not stop within grace period, aborting"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Items buffered ahead of the workers.
const QUEUE_CAPACITY: usize = 64;
