//! Memory snapshots taken around each run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use contentsift_dedup::MemorySampler;

/// Snapshots kept for comparison.
const HISTORY_LEN: usize = 10;

/// Growth between consecutive snapshots that counts as a suspected leak.
pub const LEAK_GROWTH_RATIO: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub label: String,
    pub taken_at: DateTime<Utc>,
    pub rss_mb: f64,
    pub available_mb: Option<f64>,
}

/// Ring of recent memory snapshots.
pub struct ResourceMonitor {
    sampler: Arc<dyn MemorySampler>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
}

impl ResourceMonitor {
    pub fn new(sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            sampler,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LEN)),
        }
    }

    fn history_mut(&self) -> MutexGuard<'_, VecDeque<ResourceSnapshot>> {
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a snapshot. `None` when RSS cannot be read.
    pub fn snapshot(&self, label: &str) -> Option<ResourceSnapshot> {
        let snapshot = ResourceSnapshot {
            label: label.to_string(),
            taken_at: Utc::now(),
            rss_mb: self.sampler.rss_mb()?,
            available_mb: self.sampler.available_mb(),
        };
        debug!(
            label,
            rss_mb = snapshot.rss_mb,
            available_mb = snapshot.available_mb,
            "resource snapshot"
        );

        let mut history = self.history_mut();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        Some(snapshot)
    }

    /// Relative RSS growth between the last two snapshots, when it exceeds
    /// [`LEAK_GROWTH_RATIO`]. Logs a warning when it does.
    pub fn check_growth(&self) -> Option<f64> {
        let history = self.history_mut();
        let mut recent = history.iter().rev();
        let (last, previous) = (recent.next()?, recent.next()?);
        if previous.rss_mb <= 0.0 {
            return None;
        }

        let growth = (last.rss_mb - previous.rss_mb) / previous.rss_mb;
        if growth > LEAK_GROWTH_RATIO {
            warn!(
                from = %previous.label,
                to = %last.label,
                previous_mb = previous.rss_mb,
                current_mb = last.rss_mb,
                growth_pct = growth * 100.0,
                "memory grew across run, possible leak"
            );
            return Some(growth);
        }
        None
    }

    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.history_mut().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedMemory;

    #[test]
    fn keeps_last_ten() {
        let memory = Arc::new(ScriptedMemory::new(100.0));
        let monitor = ResourceMonitor::new(memory);
        for i in 0..12 {
            monitor.snapshot(&format!("s{i}"));
        }
        let history = monitor.history();
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].label, "s2");
    }

    #[test]
    fn flags_growth_above_ten_percent() {
        let memory = Arc::new(ScriptedMemory::new(100.0));
        let monitor = ResourceMonitor::new(memory.clone());
        monitor.snapshot("start");
        assert_eq!(monitor.check_growth(), None);

        memory.set_rss(105.0);
        monitor.snapshot("middle");
        assert_eq!(monitor.check_growth(), None);

        memory.set_rss(126.0);
        monitor.snapshot("end");
        let growth = monitor.check_growth().unwrap();
        assert!((growth - 0.2).abs() < 1e-9);
    }
}
