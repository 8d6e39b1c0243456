//! # qc-filter: outlier-based quality-control filtering
//!
//! Flags low-quality observations (cells) by comparing per-observation QC
//! metrics against thresholds placed a number of MADs from the median.
//! Statistics are computed per batch, optionally from a reference subset of
//! observations so that a compromised batch can borrow thresholds from
//! healthy ones. Flags from several metrics combine into a single discard
//! decision with per-metric bookkeeping.

#![deny(missing_docs)]

/// Batch-aware outlier detection
pub mod batch;

/// Multi-metric discard decisions
pub mod filter;

/// Outlier directions and threshold bounds
pub mod threshold;

/// Metric transforms applied before statistics
pub mod transform;
