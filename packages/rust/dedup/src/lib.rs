//! Duplicate detection for ContentSift.
//!
//! [`DuplicateDetector::detect`] combines three signals, merged through a
//! disjoint-set union keyed by [`ContentId`](contentsift_shared::ContentId):
//! - exact matches on normalized body and title ([`fingerprint`])
//! - identical canonical URLs
//! - near duplicates scored by a [`SimilarityService`], streamed out of
//!   groups of similarly-shaped items ([`similarity`])
//!
//! A [`MemoryGate`] guards the whole pass; while it is open detection drops to
//! a hash-only comparison of raw bodies.

pub mod dsu;
mod engine;
pub mod fingerprint;
pub mod memory;
pub mod similarity;

pub use dsu::DisjointSet;
pub use engine::DuplicateDetector;
pub use fingerprint::{ContentFingerprint, Fingerprinter, canonical_url, normalize_text};
pub use memory::{HYSTERESIS_FACTOR, MemoryGate, MemorySampler, SystemMemory};
pub use similarity::{AiSimilarity, NearDuplicateGroup, ScanSettings, ScanStats, SimilarityService};
