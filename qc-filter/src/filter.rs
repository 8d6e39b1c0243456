use crate::batch::{detect_outliers, BatchSpec, MetricOutliers, OutlierConfig};
use anyhow::{bail, Error};
use itertools::izip;
use log::info;
use rayon::prelude::*;
use std::collections::BTreeSet;

/// One QC metric and the settings used to screen it.
#[derive(Clone, Debug)]
pub struct MetricFilter {
    /// Reason name recorded for observations this metric discards.
    pub name: String,
    /// Per-observation metric values; NaN marks a missing value.
    pub values: Vec<f64>,
    /// Detection settings for this metric.
    pub config: OutlierConfig,
}

impl MetricFilter {
    /// A named metric with the given detection settings.
    pub fn new(name: impl Into<String>, values: Vec<f64>, config: OutlierConfig) -> MetricFilter {
        MetricFilter {
            name: name.into(),
            values,
            config,
        }
    }
}

/// Combined discard decision across several QC metrics.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct QcFilterResult {
    /// Per-metric outlier flags, in input order, keyed by reason name.
    pub reasons: Vec<(String, MetricOutliers)>,
    /// Three-valued OR of the reason vectors: `Some(true)` when any metric
    /// flags the observation, `None` when no metric flags it but at least
    /// one metric could not test it, `Some(false)` otherwise.
    pub discard: Vec<Option<bool>>,
}

impl QcFilterResult {
    /// Flags for a single reason, by metric name.
    pub fn reason(&self, name: &str) -> Option<&MetricOutliers> {
        self.reasons.iter().find(|(n, _)| n == name).map(|(_, m)| m)
    }

    /// Observations discarded for any reason.
    pub fn n_discarded(&self) -> usize {
        self.discard.iter().filter(|f| **f == Some(true)).count()
    }

    /// Observations no metric could test.
    pub fn n_unknown(&self) -> usize {
        self.discard.iter().filter(|f| f.is_none()).count()
    }
}

/// Run outlier detection independently for each metric and OR the flags
/// into a single discard vector.
///
/// Metrics are processed in parallel; each keeps its own transform,
/// direction and nmads. The per-metric flags survive in the result so a
/// host can audit which metric discarded which observation.
pub fn qc_filters(
    metrics: &[MetricFilter],
    batches: BatchSpec<'_>,
    reference: Option<&[bool]>,
) -> Result<QcFilterResult, Error> {
    let Some(first) = metrics.first() else {
        bail!("no metrics supplied");
    };
    let n = first.values.len();
    let mut seen = BTreeSet::new();
    for metric in metrics {
        if metric.values.len() != n {
            bail!(
                "metric {} has length {}, expected {}",
                metric.name,
                metric.values.len(),
                n
            );
        }
        if !seen.insert(metric.name.as_str()) {
            bail!("duplicate metric name: {}", metric.name);
        }
    }

    let reasons: Vec<(String, MetricOutliers)> = metrics
        .par_iter()
        .map(|metric| {
            detect_outliers(&metric.values, batches, reference, &metric.config)
                .map(|outliers| (metric.name.clone(), outliers))
        })
        .collect::<Result<_, _>>()?;

    let mut discard: Vec<Option<bool>> = vec![Some(false); n];
    for (name, outliers) in &reasons {
        info!("{}: {} of {} observation(s) flagged", name, outliers.n_flagged(), n);
        for (combined, flag) in izip!(discard.iter_mut(), outliers.flags.iter()) {
            *combined = match (*combined, *flag) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (None, _) | (_, None) => None,
                _ => Some(false),
            };
        }
    }
    Ok(QcFilterResult { reasons, discard })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::threshold::Direction;
    use crate::transform::MetricTransform;

    fn config(direction: Direction) -> OutlierConfig {
        OutlierConfig {
            transform: MetricTransform::Identity,
            direction,
            nmads: 3.0,
        }
    }

    // Ten observations where `sum` flags index 9 and `detected` flags
    // index 0.
    fn two_metrics() -> Vec<MetricFilter> {
        vec![
            MetricFilter::new(
                "high_sum",
                vec![1., 2., 2., 3., 3., 3., 4., 4., 5., 100.],
                config(Direction::Higher),
            ),
            MetricFilter::new(
                "low_detected",
                vec![-50., 10., 11., 12., 10., 11., 12., 10., 11., 12.],
                config(Direction::Lower),
            ),
        ]
    }

    #[test]
    fn test_union_of_reasons() {
        let res = qc_filters(&two_metrics(), BatchSpec::Single, None).unwrap();

        assert_eq!(res.reasons.len(), 2);
        assert_eq!(res.reasons[0].0, "high_sum");
        assert_eq!(res.reason("high_sum").unwrap().flags[9], Some(true));
        assert_eq!(res.reason("high_sum").unwrap().flags[0], Some(false));
        assert_eq!(res.reason("low_detected").unwrap().flags[0], Some(true));
        assert_eq!(res.reason("low_detected").unwrap().flags[9], Some(false));
        assert_eq!(res.reason("nonesuch"), None);

        let expected: Vec<Option<bool>> = (0..10).map(|i| Some(i == 0 || i == 9)).collect();
        assert_eq!(res.discard, expected);
        assert_eq!(res.n_discarded(), 2);
        assert_eq!(res.n_unknown(), 0);
    }

    #[test]
    fn test_missing_values_stay_unknown_unless_flagged() {
        let mut metrics = two_metrics();
        // Index 1 missing in one metric, retained by the other: unknown.
        // Index 9 missing in one metric, flagged by the other: discarded.
        metrics[1].values[1] = f64::NAN;
        metrics[1].values[9] = f64::NAN;
        let res = qc_filters(&metrics, BatchSpec::Single, None).unwrap();
        assert_eq!(res.discard[1], None);
        assert_eq!(res.discard[9], Some(true));
        assert_eq!(res.n_unknown(), 1);
    }

    #[test]
    fn test_discard_is_pure_or_of_reasons() {
        let res = qc_filters(&two_metrics(), BatchSpec::Single, None).unwrap();
        for (i, combined) in res.discard.iter().enumerate() {
            let any = res.reasons.iter().any(|(_, m)| m.flags[i] == Some(true));
            assert_eq!(*combined == Some(true), any);
        }
    }

    #[test]
    fn test_config_errors_are_fatal() {
        assert!(qc_filters(&[], BatchSpec::Single, None).is_err());

        let mut metrics = two_metrics();
        metrics[1].values.pop();
        assert!(qc_filters(&metrics, BatchSpec::Single, None).is_err());

        let mut metrics = two_metrics();
        metrics[1].name = "high_sum".to_string();
        assert!(qc_filters(&metrics, BatchSpec::Single, None).is_err());
    }

    #[test]
    fn test_batched_metrics_share_the_batch_spec() {
        let labels: Vec<String> = (0..10).map(|i| if i < 5 { "p1" } else { "p2" }.to_string()).collect();
        let metrics = vec![MetricFilter::new(
            "sum",
            vec![1., 2., 3., 2., 40., 10., 20., 30., 20., 400.],
            config(Direction::Higher),
        )];
        let res = qc_filters(&metrics, BatchSpec::Labeled(&labels), None).unwrap();
        let outliers = res.reason("sum").unwrap();
        assert_eq!(outliers.thresholds.len(), 2);
        assert_eq!(res.discard[4], Some(true));
        assert_eq!(res.discard[9], Some(true));
    }
}
