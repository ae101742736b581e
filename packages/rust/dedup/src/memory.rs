//! Process memory sampling and the memory pressure gate.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::time::Instant;
use tracing::{info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// The gate opens once RSS exceeds the threshold by this factor.
pub const HYSTERESIS_FACTOR: f64 = 1.8;

/// Source of memory readings, in megabytes.
pub trait MemorySampler: Send + Sync {
    /// Resident set size of this process.
    fn rss_mb(&self) -> Option<f64>;
    /// Memory still available to the system.
    fn available_mb(&self) -> Option<f64>;
}

/// [`MemorySampler`] reading the live process through `sysinfo`.
pub struct SystemMemory {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "cannot resolve current pid; RSS sampling disabled");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SystemMemory {
    fn rss_mb(&self) -> Option<f64> {
        let pid = self.pid?;
        let mut system = self.system();
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|process| process.memory() as f64 / BYTES_PER_MB)
    }

    fn available_mb(&self) -> Option<f64> {
        let mut system = self.system();
        system.refresh_memory();
        Some(system.available_memory() as f64 / BYTES_PER_MB)
    }
}

// ---------------------------------------------------------------------------
// MemoryGate
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    tripped_at: Option<Instant>,
}

/// Circuit breaker over process memory.
///
/// Closed: every [`check`](Self::check) samples RSS and opens the gate when it
/// exceeds `threshold * 1.8`. Open: reports pressure until the cooldown has
/// elapsed, then closes without sampling.
pub struct MemoryGate {
    threshold_mb: f64,
    cooldown: Duration,
    sampler: Arc<dyn MemorySampler>,
    state: Mutex<GateState>,
}

impl MemoryGate {
    pub fn new(threshold_mb: u64, cooldown: Duration, sampler: Arc<dyn MemorySampler>) -> Self {
        Self {
            threshold_mb: threshold_mb as f64,
            cooldown,
            sampler,
            state: Mutex::new(GateState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether callers should back off right now.
    pub fn check(&self) -> bool {
        let mut state = self.state();

        if state.open {
            let cooled = state
                .tripped_at
                .is_none_or(|at| at.elapsed() > self.cooldown);
            if cooled {
                *state = GateState::default();
                info!("memory gate closed after cooldown");
                return false;
            }
            return true;
        }

        match self.sampler.rss_mb() {
            Some(rss_mb) if rss_mb > self.threshold_mb * HYSTERESIS_FACTOR => {
                state.open = true;
                state.tripped_at = Some(Instant::now());
                warn!(
                    rss_mb,
                    threshold_mb = self.threshold_mb,
                    "memory gate opened"
                );
                true
            }
            _ => false,
        }
    }

    /// Force the gate closed.
    pub fn reset(&self) {
        *self.state() = GateState::default();
    }

    /// Force the gate open, starting a fresh cooldown.
    pub fn trip(&self) {
        let mut state = self.state();
        state.open = true;
        state.tripped_at = Some(Instant::now());
    }

    /// Current state without sampling.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    pub fn sampler(&self) -> &Arc<dyn MemorySampler> {
        &self.sampler
    }

    pub fn threshold_mb(&self) -> f64 {
        self.threshold_mb
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeMemory;
    use super::*;

    fn gate(rss: f64) -> (MemoryGate, Arc<FakeMemory>) {
        let memory = Arc::new(FakeMemory::new(rss, 4096.0));
        let gate = MemoryGate::new(100, Duration::from_secs(30), memory.clone());
        (gate, memory)
    }

    #[tokio::test]
    async fn stays_closed_inside_hysteresis_band() {
        // 150 MB is over the threshold but under 1.8x
        let (gate, _) = gate(150.0);
        assert!(!gate.check());
        assert!(!gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn opens_then_closes_after_cooldown() {
        let (gate, memory) = gate(200.0);
        assert!(gate.check());

        // Still open during cooldown, even once memory recovers.
        memory.set_rss(10.0);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(gate.check());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!gate.check());
        assert!(!gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn reopens_after_cooldown_if_still_under_pressure() {
        let (gate, _) = gate(200.0);
        assert!(gate.check());
        tokio::time::advance(Duration::from_secs(31)).await;
        // The closing check reports no pressure; the next one samples again.
        assert!(!gate.check());
        assert!(gate.check());
    }

    #[tokio::test]
    async fn reset_and_trip_override_sampling() {
        let (gate, _) = gate(10.0);
        gate.trip();
        assert!(gate.check());
        gate.reset();
        assert!(!gate.check());
    }

    #[test]
    fn system_memory_reports_available() {
        let memory = SystemMemory::new();
        assert!(memory.available_mb().is_some_and(|mb| mb >= 0.0));
    }
}
