use crate::threshold::{Direction, ThresholdPair};
use crate::transform::MetricTransform;
use anyhow::{bail, Error};
use log::{info, warn};
use ndarray::Array1;
use rayon::prelude::*;
use robust_stats::RobustStats;
use std::collections::BTreeMap;

/// How observations are partitioned for per-batch statistics.
#[derive(Clone, Copy, Debug)]
pub enum BatchSpec<'a> {
    /// One implicit batch containing every observation.
    Single,
    /// One batch per distinct label; `labels[i]` is observation `i`'s batch.
    Labeled(&'a [String]),
}

/// Per-metric outlier detection settings.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OutlierConfig {
    /// Transform applied before statistics are computed.
    pub transform: MetricTransform,
    /// Which tail(s) to flag.
    pub direction: Direction,
    /// Multiplier on the MAD when placing bounds.
    pub nmads: f64,
}

impl Default for OutlierConfig {
    fn default() -> OutlierConfig {
        OutlierConfig {
            transform: MetricTransform::Identity,
            direction: Direction::Both,
            nmads: 3.0,
        }
    }
}

/// Why a batch's threshold could or could not be applied.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum BatchStatus {
    /// Threshold computed and applied.
    Applied,
    /// The statistics population had zero spread (MAD of zero); nothing in
    /// the batch was flagged.
    DegenerateStatistics,
    /// Fewer than two usable observations in the statistics population;
    /// nothing in the batch was flagged.
    InsufficientData,
}

/// Diagnostic record for one batch.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BatchThreshold {
    /// Batch label; `None` for the single implicit batch.
    pub batch: Option<String>,
    /// Bounds applied to the batch, present when `status` is `Applied`.
    pub bounds: Option<ThresholdPair>,
    /// Outcome of threshold computation for this batch.
    pub status: BatchStatus,
    /// Number of observations that contributed to the statistics.
    pub stats_n: usize,
}

/// Outlier flags for one metric, plus per-batch diagnostics.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MetricOutliers {
    /// Per-observation flag: `Some(true)` outlier, `Some(false)` retained,
    /// `None` missing (the value had no usable transformed representation).
    pub flags: Vec<Option<bool>>,
    /// One record per batch, ordered by batch label.
    pub thresholds: Vec<BatchThreshold>,
}

impl MetricOutliers {
    /// Number of observations flagged as outliers.
    pub fn n_flagged(&self) -> usize {
        self.flags.iter().filter(|f| **f == Some(true)).count()
    }

    /// Diagnostic record for a batch, by label.
    pub fn threshold_for(&self, batch: Option<&str>) -> Option<&BatchThreshold> {
        self.thresholds.iter().find(|t| t.batch.as_deref() == batch)
    }
}

fn resolve_groups<'a>(spec: BatchSpec<'a>, n: usize) -> Result<Vec<(Option<&'a str>, Vec<usize>)>, Error> {
    match spec {
        BatchSpec::Single => Ok(vec![(None, (0..n).collect())]),
        BatchSpec::Labeled(labels) => {
            if labels.len() != n {
                bail!(
                    "batch labels length {} does not match metric length {}",
                    labels.len(),
                    n
                );
            }
            let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (i, label) in labels.iter().enumerate() {
                groups.entry(label.as_str()).or_default().push(i);
            }
            Ok(groups.into_iter().map(|(k, v)| (Some(k), v)).collect())
        }
    }
}

/// Flag per-observation outliers more than `nmads` MADs from the per-batch
/// median.
///
/// Statistics for each batch come from the batch's own observations, or
/// from the batch's intersection with `reference` when a mask is supplied.
/// A batch with no reference observations of its own borrows the whole
/// reference pool instead, which is how a compromised batch gets thresholds
/// from healthy ones. The resulting bounds are applied to every observation
/// of the batch either way. Batches whose statistics cannot support a
/// threshold flag nothing and are reported in the result; other batches are
/// unaffected.
pub fn detect_outliers(
    metric: &[f64],
    batches: BatchSpec<'_>,
    reference: Option<&[bool]>,
    config: &OutlierConfig,
) -> Result<MetricOutliers, Error> {
    if let Some(mask) = reference {
        if mask.len() != metric.len() {
            bail!(
                "reference mask length {} does not match metric length {}",
                mask.len(),
                metric.len()
            );
        }
    }
    let transformed: Array1<f64> = config.transform.apply(metric);
    let groups = resolve_groups(batches, metric.len())?;
    info!(
        "detecting outliers over {} observation(s) in {} batch(es)",
        metric.len(),
        groups.len()
    );

    let pool: Option<Vec<f64>> = reference.map(|mask| {
        transformed
            .iter()
            .zip(mask)
            .filter(|&(v, &r)| r && v.is_finite())
            .map(|(&v, _)| v)
            .collect()
    });

    let per_batch: Vec<(Vec<usize>, BatchThreshold)> = groups
        .into_par_iter()
        .map(|(key, indices)| {
            let threshold = batch_threshold(key, &indices, &transformed, reference, pool.as_deref(), config);
            (indices, threshold)
        })
        .collect();

    let mut flags = vec![None; metric.len()];
    let mut thresholds = Vec::with_capacity(per_batch.len());
    for (indices, threshold) in per_batch {
        for &i in &indices {
            let x = transformed[i];
            flags[i] = if x.is_nan() {
                None
            } else {
                match (threshold.status, threshold.bounds) {
                    (BatchStatus::Applied, Some(bounds)) => Some(bounds.is_outside(x)),
                    _ => Some(false),
                }
            };
        }
        thresholds.push(threshold);
    }
    Ok(MetricOutliers { flags, thresholds })
}

fn batch_threshold(
    key: Option<&str>,
    indices: &[usize],
    transformed: &Array1<f64>,
    reference: Option<&[bool]>,
    pool: Option<&[f64]>,
    config: &OutlierConfig,
) -> BatchThreshold {
    let batch = key.map(str::to_owned);
    let own: Vec<f64> = indices
        .iter()
        .copied()
        .filter(|&i| reference.map_or(true, |mask| mask[i]))
        .map(|i| transformed[i])
        .filter(|v| v.is_finite())
        .collect();
    let population: &[f64] = match pool {
        Some(pool) if own.is_empty() => {
            info!(
                "batch {}: no reference observations of its own, borrowing statistics from the reference pool",
                batch.as_deref().unwrap_or("<all>")
            );
            pool
        }
        _ => &own,
    };

    if population.len() < 2 {
        warn!(
            "batch {}: {} usable observation(s), not enough for a threshold",
            batch.as_deref().unwrap_or("<all>"),
            population.len()
        );
        return BatchThreshold {
            batch,
            bounds: None,
            status: BatchStatus::InsufficientData,
            stats_n: population.len(),
        };
    }

    let stats = match RobustStats::from_values(population) {
        Ok(stats) => stats,
        Err(_) => {
            return BatchThreshold {
                batch,
                bounds: None,
                status: BatchStatus::InsufficientData,
                stats_n: 0,
            };
        }
    };
    match ThresholdPair::from_stats(&stats, config.nmads, config.direction) {
        Some(bounds) => BatchThreshold {
            batch,
            bounds: Some(bounds),
            status: BatchStatus::Applied,
            stats_n: population.len(),
        },
        None => {
            warn!(
                "batch {}: zero MAD around median {}, skipping threshold",
                batch.as_deref().unwrap_or("<all>"),
                stats.median
            );
            BatchThreshold {
                batch,
                bounds: None,
                status: BatchStatus::DegenerateStatistics,
                stats_n: population.len(),
            }
        }
    }
}

/// Screen per-batch thresholds for batches that are themselves outliers.
///
/// The bound values of all batches with an applied threshold are treated as
/// a fresh metric and run through the detector as a single implicit batch;
/// a batch whose own bound is an outlier among its peers is suspected of
/// being systematically compromised and is a candidate for exclusion from
/// the statistics population in a second pass (see [`reference_excluding`]).
/// Which nmads/direction to screen with is an analyst decision; the config
/// used for the metric itself is the usual starting point. For
/// [`Direction::Both`] the lower and upper bounds are screened separately
/// and the flagged batches unioned.
pub fn suspect_batches(thresholds: &[BatchThreshold], config: &OutlierConfig) -> Result<Vec<Option<String>>, Error> {
    let applied: Vec<(Option<String>, ThresholdPair)> = thresholds
        .iter()
        .filter(|t| t.status == BatchStatus::Applied)
        .filter_map(|t| t.bounds.map(|b| (t.batch.clone(), b)))
        .collect();
    if applied.len() < 2 {
        return Ok(Vec::new());
    }

    // The bounds are already in the space the statistics were computed in,
    // so the screening pass never re-transforms them.
    let screen_config = OutlierConfig {
        transform: MetricTransform::Identity,
        ..*config
    };
    let mut suspect = vec![false; applied.len()];
    let mut tails: Vec<Vec<f64>> = Vec::new();
    if config.direction.tests_lower() {
        tails.push(applied.iter().map(|(_, b)| b.lower).collect());
    }
    if config.direction.tests_higher() {
        tails.push(applied.iter().map(|(_, b)| b.upper).collect());
    }
    for tail in tails {
        let screened = detect_outliers(&tail, BatchSpec::Single, None, &screen_config)?;
        for (flag, s) in screened.flags.iter().zip(suspect.iter_mut()) {
            if *flag == Some(true) {
                *s = true;
            }
        }
    }
    Ok(applied
        .into_iter()
        .zip(suspect)
        .filter(|(_, s)| *s)
        .map(|((key, _), _)| key)
        .collect())
}

/// Build a reference mask selecting every observation whose batch is not in
/// `exclude`. Feeding the mask back into [`detect_outliers`] makes each
/// excluded batch borrow its threshold from the remaining batches.
pub fn reference_excluding(labels: &[String], exclude: &[Option<String>]) -> Vec<bool> {
    labels
        .iter()
        .map(|label| !exclude.iter().any(|e| e.as_deref() == Some(label.as_str())))
        .collect()
}
