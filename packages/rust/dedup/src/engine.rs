use std::collections::HashMap;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use contentsift_shared::{
    ContentId, ContentItem, DetectionMethod, DuplicateAnalysis, ProcessingConfig, SiftError,
    panic_message,
};

use crate::dsu::DisjointSet;
use crate::fingerprint::{ContentFingerprint, Fingerprinter, sha256_hex};
use crate::memory::{MemoryGate, MemorySampler, SystemMemory};
use crate::similarity::{
    NearDuplicateGroup, NearDuplicateScan, ScanSettings, SimilarityService, characteristic_groups,
};

/// Near-duplicate groups buffered between the scan and the merge.
const GROUP_CHANNEL_CAPACITY: usize = 16;

const GROUP_CONFIDENCE: f64 = 0.9;
const HASH_MATCH_CONFIDENCE: f64 = 0.95;
const HASH_UNIQUE_CONFIDENCE: f64 = 1.0;
const UNIQUE_CONFIDENCE: f64 = 0.0;

/// Why two items were linked. Higher variants win when signals overlap.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Signal {
    Near(f64),
    Url,
    Exact,
}

impl Signal {
    fn rank(self) -> u8 {
        match self {
            Self::Near(_) => 0,
            Self::Url => 1,
            Self::Exact => 2,
        }
    }

    fn score(self) -> f64 {
        match self {
            Self::Near(score) => score,
            Self::Url | Self::Exact => 1.0,
        }
    }
}

/// Groups item indices by `key`, preserving first-seen order.
fn buckets<K: Eq + Hash>(keys: impl IntoIterator<Item = (usize, K)>) -> Vec<Vec<usize>> {
    let mut slot_of: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<Vec<usize>> = Vec::new();
    for (i, key) in keys {
        let slot = *slot_of.entry(key).or_insert_with(|| {
            out.push(Vec::new());
            out.len() - 1
        });
        out[slot].push(i);
    }
    out.retain(|bucket| bucket.len() > 1);
    out
}

// ---------------------------------------------------------------------------
// Group merge
// ---------------------------------------------------------------------------

/// DSU over content ids plus the strongest signal seen per linked pair.
struct GroupMerge<'a> {
    ids: &'a [ContentId],
    dsu: DisjointSet<ContentId>,
    links: HashMap<(ContentId, ContentId), Signal>,
}

impl<'a> GroupMerge<'a> {
    fn new(ids: &'a [ContentId]) -> Self {
        let mut dsu = DisjointSet::new();
        for id in ids {
            dsu.add(id.clone());
        }
        Self {
            ids,
            dsu,
            links: HashMap::new(),
        }
    }

    fn link(&mut self, a: usize, b: usize, signal: Signal) {
        let (x, y) = (&self.ids[a], &self.ids[b]);
        if x == y {
            return;
        }
        self.dsu.union(x, y);

        let key = if x < y {
            (x.clone(), y.clone())
        } else {
            (y.clone(), x.clone())
        };
        self.links
            .entry(key)
            .and_modify(|current| {
                if signal.rank() > current.rank() {
                    *current = signal;
                }
            })
            .or_insert(signal);
    }

    /// Union adjacent members and record a direct link for every pair.
    fn link_bucket(&mut self, bucket: &[usize], signal: Signal) {
        for (n, &a) in bucket.iter().enumerate() {
            for &b in &bucket[n + 1..] {
                self.link(a, b, signal);
            }
        }
    }

    fn link_near(&mut self, group: &NearDuplicateGroup) {
        for &(a, b, score) in &group.links {
            self.link(a, b, Signal::Near(score));
        }
    }

    fn link_score(&self, a: &ContentId, b: &ContentId) -> Option<f64> {
        let key = if a < b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        self.links.get(&key).map(|signal| signal.score())
    }

    fn into_analyses(
        mut self,
        items: &[Arc<ContentItem>],
        method: DetectionMethod,
        grouped_confidence: f64,
        unique_confidence: f64,
    ) -> Vec<DuplicateAnalysis> {
        let mut first_index: HashMap<&ContentId, usize> = HashMap::new();
        for (i, id) in self.ids.iter().enumerate() {
            first_index.entry(id).or_insert(i);
        }

        let groups = self.dsu.groups();
        let mut group_of: HashMap<&ContentId, usize> = HashMap::new();
        let mut best_of: Vec<Option<ContentId>> = Vec::with_capacity(groups.len());
        for (g, members) in groups.iter().enumerate() {
            let mut best: Option<(&ContentId, f64)> = None;
            for id in members {
                group_of.insert(id, g);
                let quality = items[first_index[id]].quality_score;
                if best.is_none_or(|(_, top)| quality > top) {
                    best = Some((id, quality));
                }
            }
            best_of.push(best.filter(|_| members.len() > 1).map(|(id, _)| id.clone()));
        }

        self.ids
            .iter()
            .map(|id| {
                let g = group_of[id];
                let members = &groups[g];
                if members.len() < 2 {
                    return DuplicateAnalysis::unique(id.clone(), method, unique_confidence);
                }
                let co_members: Vec<ContentId> =
                    members.iter().filter(|m| *m != id).cloned().collect();
                let similarity_scores = co_members
                    .iter()
                    .filter_map(|m| self.link_score(id, m).map(|s| (m.clone(), s)))
                    .collect();
                DuplicateAnalysis {
                    content_id: id.clone(),
                    has_duplicates: true,
                    confidence: grouped_confidence,
                    duplicate_group: co_members,
                    similarity_scores,
                    best_version_id: best_of[g].clone(),
                    method,
                    error: None,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DuplicateDetector
// ---------------------------------------------------------------------------

/// Finds exact, same-URL, and near duplicates within one batch of items.
pub struct DuplicateDetector {
    gate: Arc<MemoryGate>,
    similarity: Option<Arc<dyn SimilarityService>>,
    scan: ScanSettings,
    chunk_size: usize,
}

impl DuplicateDetector {
    /// Detector sampling this process's memory.
    pub fn new(config: &ProcessingConfig, similarity: Option<Arc<dyn SimilarityService>>) -> Self {
        Self::with_sampler(config, similarity, Arc::new(SystemMemory::new()))
    }

    pub fn with_sampler(
        config: &ProcessingConfig,
        similarity: Option<Arc<dyn SimilarityService>>,
        sampler: Arc<dyn MemorySampler>,
    ) -> Self {
        let settings = config.settings();
        let gate = MemoryGate::new(
            settings.memory_threshold_mb,
            config.memory_cooldown(),
            sampler,
        );
        Self {
            gate: Arc::new(gate),
            similarity,
            scan: ScanSettings::from(config),
            chunk_size: settings.fingerprint_chunk_size,
        }
    }

    pub fn gate(&self) -> &Arc<MemoryGate> {
        &self.gate
    }

    /// One analysis per item, in input order. Never fails: internal errors
    /// become [`DetectionMethod::Failed`] analyses carrying the message.
    #[instrument(skip_all, fields(items = items.len()))]
    pub async fn detect(&self, items: &[Arc<ContentItem>]) -> Vec<DuplicateAnalysis> {
        if items.len() <= 1 {
            return items
                .iter()
                .map(|item| DuplicateAnalysis::trivial(item.id()))
                .collect();
        }

        if self.gate.check() {
            warn!("memory pressure, falling back to hash-only detection");
            return hash_only(items);
        }

        let outcome = AssertUnwindSafe(self.detect_full(items))
            .catch_unwind()
            .await;
        let message = match outcome {
            Ok(analyses) if analyses.len() == items.len() => {
                let duplicates = analyses.iter().filter(|a| a.has_duplicates).count();
                info!(duplicates, "duplicate detection complete");
                return analyses;
            }
            Ok(analyses) => format!(
                "detection produced {} analyses for {} items",
                analyses.len(),
                items.len()
            ),
            Err(payload) => format!("detection panicked: {}", panic_message(payload.as_ref())),
        };

        let err = SiftError::Detection(message);
        error!(error = %err, "duplicate detection failed");
        let message = err.to_string();
        items
            .iter()
            .map(|item| DuplicateAnalysis::failed(item.id(), message.clone()))
            .collect()
    }

    async fn detect_full(&self, items: &[Arc<ContentItem>]) -> Vec<DuplicateAnalysis> {
        let fingerprints = Fingerprinter::new(self.gate.clone(), self.chunk_size)
            .generate_batch(items)
            .await;
        let ids: Vec<ContentId> = items.iter().map(|item| item.id()).collect();
        let fps: Vec<Option<&ContentFingerprint>> =
            ids.iter().map(|id| fingerprints.get(id)).collect();

        let mut merge = GroupMerge::new(&ids);
        let present: Vec<(usize, &ContentFingerprint)> = fps
            .iter()
            .enumerate()
            .filter_map(|(i, fp)| fp.map(|fp| (i, fp)))
            .collect();
        let exact = present
            .iter()
            .map(|&(i, fp)| (i, (&fp.text_hash, &fp.title_hash)));
        for bucket in buckets(exact) {
            merge.link_bucket(&bucket, Signal::Exact);
        }
        for bucket in buckets(present.iter().map(|&(i, fp)| (i, &fp.url_hash))) {
            merge.link_bucket(&bucket, Signal::Url);
        }

        let method = match &self.similarity {
            Some(service) => {
                let groups = characteristic_groups(&fps);
                let (tx, mut rx) = mpsc::channel(GROUP_CHANNEL_CAPACITY);
                let scan = NearDuplicateScan::new(service.as_ref(), &self.gate, self.scan.clone());
                let consume = async {
                    while let Some(group) = rx.recv().await {
                        merge.link_near(&group);
                    }
                };
                tokio::join!(scan.run(items, &groups, tx), consume);
                DetectionMethod::Full
            }
            None => DetectionMethod::PatternOnly,
        };

        merge.into_analyses(items, method, GROUP_CONFIDENCE, UNIQUE_CONFIDENCE)
    }
}

/// Group by raw-body hash only. No fingerprints, no AI calls.
fn hash_only(items: &[Arc<ContentItem>]) -> Vec<DuplicateAnalysis> {
    let ids: Vec<ContentId> = items.iter().map(|item| item.id()).collect();
    let mut merge = GroupMerge::new(&ids);
    let hashes = items
        .iter()
        .enumerate()
        .map(|(i, item)| (i, sha256_hex(&item.body)));
    for bucket in buckets(hashes) {
        merge.link_bucket(&bucket, Signal::Exact);
    }
    merge.into_analyses(
        items,
        DetectionMethod::HashOnly,
        HASH_MATCH_CONFIDENCE,
        HASH_UNIQUE_CONFIDENCE,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use contentsift_shared::{ProcessingSettings, ProviderError};

    use super::*;
    use crate::memory::testing::FakeMemory;
    use crate::similarity::testing::TableSimilarity;

    fn config() -> ProcessingConfig {
        ProcessingConfig::new(ProcessingSettings::default()).unwrap()
    }

    fn detector(similarity: Option<Arc<dyn SimilarityService>>) -> DuplicateDetector {
        DuplicateDetector::with_sampler(
            &config(),
            similarity,
            Arc::new(FakeMemory::new(10.0, 8192.0)),
        )
    }

    fn item(url: &str, title: &str, body: &str, quality: f64) -> Arc<ContentItem> {
        Arc::new(ContentItem::new(url, Some(title), body).with_quality(quality))
    }

    struct Panicking;

    #[async_trait]
    impl SimilarityService for Panicking {
        async fn similarity(&self, _: &str, _: &str) -> Result<f64, ProviderError> {
            panic!("similarity backend exploded");
        }
    }

    #[tokio::test]
    async fn single_item_is_trivial() {
        let items = vec![item("https://a.dev", "A", "body", 0.5)];
        let analyses = detector(None).detect(&items).await;
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].method, DetectionMethod::Trivial);
        assert_eq!(analyses[0].confidence, 1.0);
        assert!(detector(None).detect(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn pattern_only_finds_exact_and_url_duplicates() {
        let items = vec![
            item("https://a.dev/1", "Rust", "Ownership rules everything.", 0.4),
            item("https://b.dev/2", "rust!", "ownership   RULES everything", 0.7),
            item("https://www.c.dev/page/?utm_source=x", "Other", "Unrelated text here.", 0.9),
            item("http://c.dev/page", "Different", "Something else entirely, longer too.", 0.2),
            item("https://d.dev", "Solo", "Completely alone.", 0.5),
        ];
        let analyses = detector(None).detect(&items).await;
        assert_eq!(analyses.len(), 5);
        assert!(analyses.iter().all(|a| a.method == DetectionMethod::PatternOnly));

        let first = &analyses[0];
        assert!(first.has_duplicates);
        assert_eq!(first.confidence, 0.9);
        assert_eq!(first.duplicate_group, vec![items[1].id()]);
        assert_eq!(first.similarity_scores[&items[1].id()], 1.0);
        assert_eq!(first.best_version_id, Some(items[1].id()));

        assert_eq!(analyses[2].duplicate_group, vec![items[3].id()]);
        assert_eq!(analyses[3].best_version_id, Some(items[2].id()));

        assert!(!analyses[4].has_duplicates);
        assert_eq!(analyses[4].confidence, 0.0);
        assert!(analyses[4].best_version_id.is_none());
    }

    #[tokio::test]
    async fn near_duplicates_merge_with_url_groups() {
        // 0~1 by AI, 1 and 2 share a URL: one group, 0-2 only transitive.
        let items = vec![
            item("https://a.dev/x", "A", "alpha one two three", 0.5),
            item("https://b.dev/y", "B", "beta one two three", 0.5),
            item("https://b.dev/y/", "C", "gamma one two three", 0.8),
            item("https://z.dev", "Z", "zeta one two three", 0.1),
        ];
        let service = TableSimilarity::default().score("alpha", "beta", 0.86);
        let analyses = detector(Some(Arc::new(service))).detect(&items).await;

        assert!(analyses.iter().all(|a| a.method == DetectionMethod::Full));
        let first = &analyses[0];
        assert_eq!(first.duplicate_group, vec![items[1].id(), items[2].id()]);
        assert_eq!(first.similarity_scores.len(), 1);
        assert_eq!(first.similarity_scores[&items[1].id()], 0.86);
        assert_eq!(first.best_version_id, Some(items[2].id()));

        let second = &analyses[1];
        assert_eq!(second.similarity_scores[&items[0].id()], 0.86);
        assert_eq!(second.similarity_scores[&items[2].id()], 1.0);

        assert!(!analyses[3].has_duplicates);
    }

    #[tokio::test]
    async fn exact_signal_outranks_near_score() {
        let items = vec![
            item("https://a.dev/1", "Same", "alpha shared body text", 0.5),
            item("https://a.dev/2", "Same", "alpha shared body text", 0.5),
        ];
        let service = TableSimilarity::default().score("alpha", "alpha", 0.81);
        let analyses = detector(Some(Arc::new(service))).detect(&items).await;
        assert_eq!(analyses[0].similarity_scores[&items[1].id()], 1.0);
        // Equal quality: earliest item wins.
        assert_eq!(analyses[1].best_version_id, Some(items[0].id()));
    }

    #[tokio::test]
    async fn open_gate_uses_hash_only() {
        let memory = Arc::new(FakeMemory::new(10_000.0, 8192.0));
        let detector = DuplicateDetector::with_sampler(&config(), None, memory);
        let items = vec![
            item("https://a.dev/1", "One", "same body", 0.3),
            item("https://a.dev/2", "Two", "same body", 0.6),
            item("https://a.dev/3", "Three", "Same body", 0.9),
        ];
        let analyses = detector.detect(&items).await;

        assert!(analyses.iter().all(|a| a.method == DetectionMethod::HashOnly));
        assert_eq!(analyses[0].confidence, 0.95);
        assert_eq!(analyses[0].best_version_id, Some(items[1].id()));
        assert_eq!(analyses[2].confidence, 1.0);
        assert!(!analyses[2].has_duplicates);
    }

    #[tokio::test]
    async fn tracking_parameters_do_not_hide_a_duplicate() {
        let items = vec![
            item("https://docs.dev/a", "Guide", "Install the toolchain first.", 0.4),
            item("https://docs.dev/a?utm_source=x", "Guide", "Install the toolchain first.", 0.8),
        ];
        let analyses = detector(None).detect(&items).await;

        for analysis in &analyses {
            assert!(analysis.has_duplicates);
            assert_eq!(analysis.best_version_id, Some(items[1].id()));
        }
        assert_eq!(analyses[0].duplicate_group, vec![items[1].id()]);
        assert_eq!(analyses[1].duplicate_group, vec![items[0].id()]);
    }

    #[tokio::test]
    async fn near_duplicates_are_grouped_transitively() {
        let items = vec![
            item("https://a.dev/x", "A", "alpha one two three", 0.5),
            item("https://b.dev/y", "B", "beta one two three", 0.5),
            item("https://c.dev/z", "C", "gamma one two three", 0.5),
        ];
        let service = TableSimilarity::default()
            .score("alpha", "beta", 0.85)
            .score("beta", "gamma", 0.85)
            .score("alpha", "gamma", 0.4);
        let analyses = detector(Some(Arc::new(service))).detect(&items).await;

        assert!(analyses.iter().all(|a| a.method == DetectionMethod::Full));
        for (i, analysis) in analyses.iter().enumerate() {
            assert!(analysis.has_duplicates);
            assert_eq!(analysis.duplicate_group.len(), 2);
            assert!(!analysis.duplicate_group.contains(&items[i].id()));
        }
    }

    #[tokio::test]
    async fn repeated_detection_gives_identical_results() {
        let items = vec![
            item("https://a.dev/x", "A", "alpha one two three", 0.5),
            item("https://b.dev/y", "B", "beta one two three", 0.7),
            item("https://b.dev/y?ref=feed", "B", "beta one two three", 0.2),
            item("https://z.dev", "Z", "zeta one two three", 0.1),
        ];
        let service: Arc<dyn SimilarityService> =
            Arc::new(TableSimilarity::default().score("alpha", "beta", 0.9));
        let detector = detector(Some(service));

        let first = detector.detect(&items).await;
        let second = detector.detect(&items).await;
        assert_eq!(first, second);
        assert!(first[0].has_duplicates);
    }

    #[tokio::test]
    async fn tripped_gate_never_calls_similarity() {
        let service = Arc::new(TableSimilarity::default());
        let memory = Arc::new(FakeMemory::new(10_000.0, 8192.0));
        let detector = DuplicateDetector::with_sampler(
            &config(),
            Some(service.clone() as Arc<dyn SimilarityService>),
            memory,
        );
        let items: Vec<_> = (0..10)
            .map(|i| {
                item(
                    &format!("https://site.dev/{i}"),
                    &format!("Page {i}"),
                    &format!("distinct body number {i}"),
                    0.5,
                )
            })
            .collect();

        let analyses = detector.detect(&items).await;

        assert_eq!(analyses.len(), 10);
        assert!(analyses.iter().all(|a| a.method == DetectionMethod::HashOnly));
        assert!(analyses.iter().all(|a| !a.has_duplicates));
        assert_eq!(service.call_count(), 0);
    }

    #[tokio::test]
    async fn similarity_panic_becomes_failed_analyses() {
        let items = vec![
            item("https://a.dev/1", "A", "alpha one two", 0.5),
            item("https://a.dev/2", "B", "beta one two", 0.5),
        ];
        let analyses = detector(Some(Arc::new(Panicking))).detect(&items).await;
        assert_eq!(analyses.len(), 2);
        for (analysis, item) in analyses.iter().zip(&items) {
            assert_eq!(analysis.content_id, item.id());
            assert_eq!(analysis.method, DetectionMethod::Failed);
            assert!(analysis.error.as_deref().unwrap().contains("exploded"));
            assert!(analysis.error.as_deref().unwrap().starts_with("duplicate detection error"));
        }
    }

    #[tokio::test]
    async fn identical_ids_collapse() {
        let items = vec![
            item("https://a.dev/1", "Same", "first body", 0.5),
            item("https://a.dev/1", "Same", "second body, different", 0.5),
        ];
        let analyses = detector(None).detect(&items).await;
        assert_eq!(analyses.len(), 2);
        assert!(analyses.iter().all(|a| !a.has_duplicates));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_similarity_calls_are_dropped() {
        struct Slow;

        #[async_trait]
        impl SimilarityService for Slow {
            async fn similarity(&self, _: &str, _: &str) -> Result<f64, ProviderError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(1.0)
            }
        }

        let items = vec![
            item("https://a.dev/1", "A", "alpha one two", 0.5),
            item("https://a.dev/2", "B", "beta one two", 0.5),
        ];
        let analyses = detector(Some(Arc::new(Slow))).detect(&items).await;
        assert!(analyses.iter().all(|a| a.method == DetectionMethod::Full));
        assert!(analyses.iter().all(|a| !a.has_duplicates));
    }
}
