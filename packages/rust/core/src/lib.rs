//! Run orchestration for ContentSift.
//!
//! [`Orchestrator::run`] takes a batch of scraped items through duplicate
//! detection, a bounded worker pool running the per-item [`ItemPipeline`],
//! and final filtering and ranking into a [`ProcessingResult`].
//!
//! [`ProcessingResult`]: contentsift_shared::ProcessingResult

pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod resources;

use contentsift_shared::ProcessingResult;

pub use orchestrator::Orchestrator;
pub use pipeline::{ItemPipeline, enhanced_quality};
pub use resources::{ResourceMonitor, ResourceSnapshot};

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called each time an item finishes, successfully or not.
    fn item_finished(&self, current: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, result: &ProcessingResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_finished(&self, _current: usize, _total: usize) {}
    fn done(&self, _result: &ProcessingResult) {}
}
