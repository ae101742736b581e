//! Pairwise similarity scoring and the streaming near-duplicate scan.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Deserialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use contentsift_llm::{GenerateOptions, TextAnalyzer, parse_json_object};
use contentsift_shared::{ContentItem, ProcessingConfig, ProviderError};

use crate::fingerprint::ContentFingerprint;
use crate::memory::MemoryGate;

/// Score used when the model answers without a usable `similarity_score`.
pub const NEUTRAL_SCORE: f64 = 0.5;

/// Pause budget per batch; two gate cooldowns at the default backoff.
pub const MAX_PRESSURE_PAUSES: usize = 30;

/// Semantic similarity of two texts, in `0.0..=1.0`.
#[async_trait]
pub trait SimilarityService: Send + Sync {
    async fn similarity(&self, a: &str, b: &str) -> Result<f64, ProviderError>;
}

/// [`SimilarityService`] backed by an LLM.
pub struct AiSimilarity {
    analyzer: Arc<dyn TextAnalyzer>,
}

impl AiSimilarity {
    pub fn new(analyzer: Arc<dyn TextAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[derive(Debug, Deserialize)]
struct SimilarityResponse {
    similarity_score: f64,
}

fn similarity_prompt(a: &str, b: &str) -> String {
    format!(
        "Compare the two pieces of content below and decide whether they are duplicates \
         or near-duplicates of each other (same information, possibly reworded).\n\n\
         CONTENT A:\n{a}\n\nCONTENT B:\n{b}\n\n\
         Respond with JSON only: {{\"similarity_score\": <number between 0.0 and 1.0>, \
         \"reasoning\": \"<one sentence>\"}}"
    )
}

#[async_trait]
impl SimilarityService for AiSimilarity {
    async fn similarity(&self, a: &str, b: &str) -> Result<f64, ProviderError> {
        let raw = self
            .analyzer
            .generate(&similarity_prompt(a, b), &GenerateOptions::precise())
            .await?;

        match parse_json_object::<SimilarityResponse>(&raw) {
            Some(r) if (0.0..=1.0).contains(&r.similarity_score) => Ok(r.similarity_score),
            Some(r) => {
                warn!(score = r.similarity_score, "similarity score out of range");
                Ok(NEUTRAL_SCORE)
            }
            None => {
                warn!("unparseable similarity response");
                Ok(NEUTRAL_SCORE)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scan settings
// ---------------------------------------------------------------------------

/// Knobs for one near-duplicate scan.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub threshold: f64,
    pub max_content_length: usize,
    /// Pair cap per characteristic group.
    pub max_pairs: usize,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub search_limit: usize,
    pub call_timeout: Duration,
    pub backoff: Duration,
    /// Consecutive pressure pauses tolerated on one batch before the scan
    /// gives up and keeps what it has found.
    pub max_pauses: usize,
    pub reclaim_every: usize,
    pub reclaim_interval: Duration,
    pub memory_threshold_mb: f64,
}

impl From<&ProcessingConfig> for ScanSettings {
    fn from(config: &ProcessingConfig) -> Self {
        let s = config.settings();
        Self {
            threshold: s.similarity_threshold,
            max_content_length: s.max_similarity_content_length,
            max_pairs: s.max_similarity_content_pairs,
            batch_size: s.max_similarity_batch_size,
            max_concurrency: s.max_concurrent_ai_analyses,
            search_limit: s.similarity_search_limit,
            call_timeout: config.ai_call_timeout(),
            backoff: config.memory_backoff(),
            max_pauses: MAX_PRESSURE_PAUSES,
            reclaim_every: s.reclaim_every_batches,
            reclaim_interval: config.reclaim_interval(),
            memory_threshold_mb: s.memory_threshold_mb as f64,
        }
    }
}

// ---------------------------------------------------------------------------
// Characteristic grouping
// ---------------------------------------------------------------------------

/// Greedy seed clustering of items with similar shape.
///
/// `fingerprints[i]` belongs to item `i`; items without a fingerprint are
/// skipped. Only groups with at least two members are returned.
pub fn characteristic_groups(fingerprints: &[Option<&ContentFingerprint>]) -> Vec<Vec<usize>> {
    let mut assigned = vec![false; fingerprints.len()];
    let mut groups = Vec::new();

    for (i, seed) in fingerprints.iter().enumerate() {
        let Some(seed) = seed else { continue };
        if assigned[i] {
            continue;
        }
        assigned[i] = true;
        let mut group = vec![i];

        for (j, candidate) in fingerprints.iter().enumerate().skip(i + 1) {
            let Some(candidate) = candidate else { continue };
            if !assigned[j] && seed.has_similar_characteristics(candidate) {
                assigned[j] = true;
                group.push(j);
            }
        }

        if group.len() > 1 {
            groups.push(group);
        }
    }

    groups
}

// ---------------------------------------------------------------------------
// Streaming scan
// ---------------------------------------------------------------------------

/// A near-duplicate group found by the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicateGroup {
    /// Item indices, seed pair first.
    pub members: Vec<usize>,
    /// Scored links that admitted each member: `(a, b, score)`.
    pub links: Vec<(usize, usize, f64)>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStats {
    pub pairs_scored: usize,
    pub probes: usize,
    pub batches: usize,
    pub groups_emitted: usize,
    pub pressure_pauses: usize,
    pub reclaims: usize,
    pub degraded: bool,
    /// The scan stopped early under sustained memory pressure.
    pub abandoned: bool,
}

/// Lazily enumerates unordered pairs of a group, skipping processed items.
struct PairCursor<'g> {
    members: &'g [usize],
    a: usize,
    b: usize,
}

impl<'g> PairCursor<'g> {
    fn new(members: &'g [usize]) -> Self {
        Self { members, a: 0, b: 1 }
    }

    fn next_pair(&mut self, processed: &HashSet<usize>) -> Option<(usize, usize)> {
        let len = self.members.len();
        loop {
            if self.a + 1 >= len {
                return None;
            }
            if self.b >= len {
                self.a += 1;
                self.b = self.a + 1;
                continue;
            }
            let x = self.members[self.a];
            if processed.contains(&x) {
                self.a += 1;
                self.b = self.a + 1;
                continue;
            }
            let y = self.members[self.b];
            self.b += 1;
            if !processed.contains(&y) {
                return Some((x, y));
            }
        }
    }
}

/// Fires every `every` batches or every `interval`, whichever comes first.
struct ReclaimThrottle {
    every: usize,
    interval: Duration,
    since_last: usize,
    last: Instant,
}

impl ReclaimThrottle {
    fn new(every: usize, interval: Duration) -> Self {
        Self {
            every: every.max(1),
            interval,
            since_last: 0,
            last: Instant::now(),
        }
    }

    fn tick(&mut self) -> bool {
        self.since_last += 1;
        if self.since_last >= self.every || self.last.elapsed() >= self.interval {
            self.since_last = 0;
            self.last = Instant::now();
            return true;
        }
        false
    }
}

fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Streams near-duplicate groups out of characteristic groups.
pub struct NearDuplicateScan<'a> {
    service: &'a dyn SimilarityService,
    gate: &'a MemoryGate,
    settings: ScanSettings,
    semaphore: Semaphore,
}

impl<'a> NearDuplicateScan<'a> {
    pub fn new(service: &'a dyn SimilarityService, gate: &'a MemoryGate, settings: ScanSettings) -> Self {
        let semaphore = Semaphore::new(settings.max_concurrency.max(1));
        Self {
            service,
            gate,
            settings,
            semaphore,
        }
    }

    /// Score one pair. Errors and timeouts yield `None`.
    async fn score(&self, texts: &[&str], a: usize, b: usize) -> Option<f64> {
        let _permit = self.semaphore.acquire().await.ok()?;
        let call = self.service.similarity(texts[a], texts[b]);
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(Ok(score)) => Some(score),
            Ok(Err(e)) => {
                warn!(a, b, error = %e, "similarity call failed, pair dropped");
                None
            }
            Err(_) => {
                warn!(
                    a,
                    b,
                    timeout_secs = self.settings.call_timeout.as_secs_f64(),
                    "similarity call timed out, pair dropped"
                );
                None
            }
        }
    }

    /// Score a batch concurrently. Results come back in batch order.
    async fn score_batch(&self, texts: &[&str], batch: &[(usize, usize)]) -> Vec<(usize, usize, f64)> {
        let mut pending: FuturesUnordered<_> = batch
            .iter()
            .enumerate()
            .map(|(pos, &(a, b))| async move { (pos, a, b, self.score(texts, a, b).await) })
            .collect();

        let mut scored = Vec::with_capacity(batch.len());
        while let Some((pos, a, b, score)) = pending.next().await {
            if let Some(score) = score {
                scored.push((pos, a, b, score));
            }
        }
        scored.sort_by_key(|&(pos, ..)| pos);
        scored.into_iter().map(|(_, a, b, s)| (a, b, s)).collect()
    }

    /// Grow a seeded group by probing unprocessed members of `candidates`.
    async fn grow(
        &self,
        texts: &[&str],
        candidates: &[usize],
        seed: (usize, usize, f64),
        processed: &mut HashSet<usize>,
        stats: &mut ScanStats,
    ) -> NearDuplicateGroup {
        let (a, b, score) = seed;
        processed.insert(a);
        processed.insert(b);
        let mut group = NearDuplicateGroup {
            members: vec![a, b],
            links: vec![(a, b, score)],
        };

        let probes: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|c| !processed.contains(c))
            .take(self.settings.search_limit)
            .collect();

        for candidate in probes {
            for member in group.members.clone() {
                stats.probes += 1;
                let Some(score) = self.score(texts, candidate, member).await else {
                    continue;
                };
                if score >= self.settings.threshold {
                    processed.insert(candidate);
                    group.members.push(candidate);
                    group.links.push((candidate, member, score));
                    break;
                }
            }
        }

        group
    }

    fn degrade_if_low_memory(&mut self, stats: &mut ScanStats) {
        if stats.degraded {
            return;
        }
        let Some(available_mb) = self.gate.sampler().available_mb() else {
            return;
        };
        if available_mb < self.settings.memory_threshold_mb {
            self.settings.batch_size = (self.settings.batch_size / 2).max(2);
            self.settings.max_pairs = (self.settings.max_pairs / 2).max(10);
            stats.degraded = true;
            warn!(
                available_mb,
                batch_size = self.settings.batch_size,
                max_pairs = self.settings.max_pairs,
                "low system memory, shrinking similarity batches"
            );
        }
    }

    /// Scan every characteristic group, sending groups through `tx` as found.
    ///
    /// Stops early if the receiver is dropped.
    #[instrument(skip_all, fields(groups = groups.len()))]
    pub async fn run(
        mut self,
        items: &[Arc<ContentItem>],
        groups: &[Vec<usize>],
        tx: mpsc::Sender<NearDuplicateGroup>,
    ) -> ScanStats {
        let mut stats = ScanStats::default();
        let texts: Vec<&str> = items
            .iter()
            .map(|item| head_chars(&item.body, self.settings.max_content_length))
            .collect();
        let mut processed: HashSet<usize> = HashSet::new();
        let mut throttle =
            ReclaimThrottle::new(self.settings.reclaim_every, self.settings.reclaim_interval);
        let mut batch: Vec<(usize, usize)> = Vec::with_capacity(self.settings.batch_size);

        'groups: for group in groups {
            self.degrade_if_low_memory(&mut stats);
            let mut cursor = PairCursor::new(group);
            let mut emitted_pairs = 0;

            loop {
                batch.clear();
                while batch.len() < self.settings.batch_size && emitted_pairs < self.settings.max_pairs {
                    match cursor.next_pair(&processed) {
                        Some(pair) => {
                            batch.push(pair);
                            emitted_pairs += 1;
                        }
                        None => break,
                    }
                }
                if batch.is_empty() {
                    break;
                }

                let mut pauses = 0;
                while self.gate.check() {
                    if pauses == self.settings.max_pauses {
                        warn!(
                            pauses,
                            groups = stats.groups_emitted,
                            "memory pressure did not ease, ending similarity scan early"
                        );
                        stats.abandoned = true;
                        break 'groups;
                    }
                    pauses += 1;
                    stats.pressure_pauses += 1;
                    warn!(
                        backoff_ms = self.settings.backoff.as_millis() as u64,
                        "memory pressure, pausing similarity batch"
                    );
                    tokio::time::sleep(self.settings.backoff).await;
                }

                stats.batches += 1;
                stats.pairs_scored += batch.len();
                let scored = self.score_batch(&texts, &batch).await;

                for (a, b, score) in scored {
                    if score < self.settings.threshold
                        || processed.contains(&a)
                        || processed.contains(&b)
                    {
                        continue;
                    }
                    let found = self
                        .grow(&texts, group, (a, b, score), &mut processed, &mut stats)
                        .await;
                    debug!(members = found.members.len(), "near-duplicate group found");
                    stats.groups_emitted += 1;
                    if tx.send(found).await.is_err() {
                        debug!("near-duplicate receiver dropped, stopping scan");
                        break 'groups;
                    }
                }

                tokio::task::yield_now().await;
                if throttle.tick() {
                    batch.shrink_to_fit();
                    processed.shrink_to_fit();
                    stats.reclaims += 1;
                    debug!(batches = stats.batches, "reclaimed scan buffers");
                }
            }
        }

        info!(
            pairs = stats.pairs_scored,
            probes = stats.probes,
            groups = stats.groups_emitted,
            degraded = stats.degraded,
            abandoned = stats.abandoned,
            "near-duplicate scan complete"
        );
        stats
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TableSimilarity;
    use super::*;
    use crate::fingerprint::Fingerprinter;
    use crate::memory::testing::FakeMemory;

    struct Reply(&'static str);

    #[async_trait]
    impl TextAnalyzer for Reply {
        fn name(&self) -> &str {
            "reply"
        }

        async fn generate(&self, _: &str, options: &GenerateOptions) -> Result<String, ProviderError> {
            assert!(options.temperature < 0.2);
            Ok(self.0.to_string())
        }
    }

    fn settings() -> ScanSettings {
        ScanSettings {
            threshold: 0.8,
            max_content_length: 1000,
            max_pairs: 50,
            batch_size: 10,
            max_concurrency: 3,
            search_limit: 20,
            call_timeout: Duration::from_secs(5),
            backoff: Duration::from_secs(2),
            max_pauses: 30,
            reclaim_every: 10,
            reclaim_interval: Duration::from_secs(30),
            memory_threshold_mb: 512.0,
        }
    }

    fn items(bodies: &[&str]) -> Vec<Arc<ContentItem>> {
        bodies
            .iter()
            .enumerate()
            .map(|(i, b)| Arc::new(ContentItem::new(format!("https://site.dev/{i}"), None, *b)))
            .collect()
    }

    fn gate(rss: f64, available: f64) -> MemoryGate {
        MemoryGate::new(
            512,
            Duration::from_secs(30),
            Arc::new(FakeMemory::new(rss, available)),
        )
    }

    async fn collect(
        service: &dyn SimilarityService,
        gate: &MemoryGate,
        settings: ScanSettings,
        items: &[Arc<ContentItem>],
        groups: &[Vec<usize>],
    ) -> (Vec<NearDuplicateGroup>, ScanStats) {
        let (tx, mut rx) = mpsc::channel(4);
        let scan = NearDuplicateScan::new(service, gate, settings);
        let (stats, found) = tokio::join!(scan.run(items, groups, tx), async {
            let mut found = Vec::new();
            while let Some(group) = rx.recv().await {
                found.push(group);
            }
            found
        });
        (found, stats)
    }

    #[tokio::test]
    async fn ai_similarity_parses_and_falls_back() {
        let ok = AiSimilarity::new(Arc::new(Reply(r#"Sure: {"similarity_score": 0.91}"#)));
        assert_eq!(ok.similarity("a", "b").await.unwrap(), 0.91);

        let garbage = AiSimilarity::new(Arc::new(Reply("they look alike")));
        assert_eq!(garbage.similarity("a", "b").await.unwrap(), NEUTRAL_SCORE);

        let out_of_range = AiSimilarity::new(Arc::new(Reply(r#"{"similarity_score": 7}"#)));
        assert_eq!(out_of_range.similarity("a", "b").await.unwrap(), NEUTRAL_SCORE);
    }

    #[test]
    fn characteristic_groups_cluster_by_shape() {
        let bodies = [
            "one two three four five",
            "a much longer body with many more words than the first one has",
            "six seven eight nine ten",
            "x",
        ];
        let fps: Vec<_> = items(&bodies).iter().map(|i| Fingerprinter::generate(i)).collect();
        let refs: Vec<Option<&ContentFingerprint>> = fps.iter().map(Some).collect();
        assert_eq!(characteristic_groups(&refs), vec![vec![0, 2]]);

        let mut missing = refs.clone();
        missing[2] = None;
        assert!(characteristic_groups(&missing).is_empty());
    }

    #[test]
    fn pair_cursor_skips_processed() {
        let members = [0, 1, 2, 3];
        let mut processed = HashSet::new();
        let mut cursor = PairCursor::new(&members);
        assert_eq!(cursor.next_pair(&processed), Some((0, 1)));
        processed.insert(0);
        processed.insert(2);
        assert_eq!(cursor.next_pair(&processed), Some((1, 3)));
        assert_eq!(cursor.next_pair(&processed), None);
    }

    #[tokio::test]
    async fn seeds_and_grows_groups() {
        let items = items(&["alpha body", "beta body", "gamma body", "delta body"]);
        let service = TableSimilarity::default()
            .score("alpha", "beta", 0.9)
            .score("delta", "beta", 0.85);
        let gate = gate(10.0, 4096.0);

        let (found, stats) = collect(&service, &gate, settings(), &items, &[vec![0, 1, 2, 3]]).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].members, vec![0, 1, 3]);
        assert_eq!(found[0].links, vec![(0, 1, 0.9), (3, 1, 0.85)]);
        assert_eq!(stats.groups_emitted, 1);
    }

    #[tokio::test]
    async fn failed_pairs_contribute_nothing() {
        let items = items(&["alpha x", "beta x", "gamma x"]);
        let service = TableSimilarity::default()
            .score("alpha", "beta", 0.95)
            .fail("alpha", "beta")
            .score("beta", "gamma", 0.9);
        let gate = gate(10.0, 4096.0);

        let (found, _) = collect(&service, &gate, settings(), &items, &[vec![0, 1, 2]]).await;

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].members, vec![1, 2]);
    }

    #[tokio::test]
    async fn pair_cap_limits_calls() {
        let bodies: Vec<String> = (0..10).map(|i| format!("w{i} body")).collect();
        let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
        let items = items(&refs);
        let service = TableSimilarity::default();
        let gate = gate(10.0, 4096.0);
        let mut settings = settings();
        settings.max_pairs = 7;
        settings.batch_size = 3;

        let (found, stats) = collect(&service, &gate, settings, &items, &[(0..10).collect()]).await;

        assert!(found.is_empty());
        assert_eq!(stats.pairs_scored, 7);
        assert_eq!(stats.batches, 3);
        assert_eq!(service.call_count(), 7);
    }

    #[tokio::test]
    async fn low_available_memory_degrades_once() {
        let bodies: Vec<String> = (0..10).map(|i| format!("w{i} body")).collect();
        let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
        let items = items(&refs);
        let service = TableSimilarity::default();
        let gate = gate(10.0, 100.0);
        let mut settings = settings();
        settings.max_pairs = 30;

        let (_, stats) = collect(&service, &gate, settings, &items, &[(0..10).collect()]).await;

        assert!(stats.degraded);
        // Pair cap 30 -> 15, batch 10 -> 5.
        assert_eq!(stats.pairs_scored, 15);
        assert_eq!(stats.batches, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_while_gate_is_open() {
        let items = items(&["alpha x", "beta x"]);
        let service = TableSimilarity::default().score("alpha", "beta", 0.9);
        let gate = gate(10.0, 4096.0);
        gate.trip();

        let started = Instant::now();
        let (found, stats) = collect(&service, &gate, settings(), &items, &[vec![0, 1]]).await;

        assert_eq!(found.len(), 1);
        assert!(stats.pressure_pauses >= 15);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_pressure_ends_scan_with_groups_found_so_far() {
        let items = items(&["alpha x", "beta x", "gamma y", "delta y"]);
        let service = TableSimilarity::default()
            .score("alpha", "beta", 0.9)
            .score("gamma", "delta", 0.9);
        let memory = Arc::new(FakeMemory::new(10.0, 4096.0));
        let gate = MemoryGate::new(512, Duration::from_secs(30), memory.clone());
        let mut settings = settings();
        settings.max_pauses = 4;

        let (tx, mut rx) = mpsc::channel(4);
        let scan = NearDuplicateScan::new(&service, &gate, settings);
        let groups = [vec![0, 1], vec![2, 3]];
        let (stats, found) = tokio::join!(scan.run(&items, &groups, tx), async {
            let mut found = Vec::new();
            while let Some(group) = rx.recv().await {
                // Memory spikes once the first group is out and never recovers.
                memory.set_rss(100_000.0);
                found.push(group);
            }
            found
        });

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].members, vec![0, 1]);
        assert!(stats.abandoned);
        assert_eq!(stats.pressure_pauses, 4);
        assert_eq!(service.call_count(), 1);
    }

    #[test]
    fn head_chars_respects_char_boundaries() {
        assert_eq!(head_chars("héllo", 2), "hé");
        assert_eq!(head_chars("hi", 10), "hi");
    }

    #[test]
    fn reclaim_throttle_fires_every_n() {
        let mut throttle = ReclaimThrottle::new(3, Duration::from_secs(3600));
        let fired: Vec<bool> = (0..6).map(|_| throttle.tick()).collect();
        assert_eq!(fired, vec![false, false, true, false, false, true]);
    }
}
