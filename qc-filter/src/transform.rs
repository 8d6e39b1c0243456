use anyhow::{bail, Error};
use ndarray::Array1;
use std::str::FromStr;

/// Transform applied to a metric before statistics are computed.
///
/// Many QC metrics (library size, detected-feature count) are right-skewed
/// and roughly log-normal; taking logs first makes a MAD-based threshold
/// symmetric around the median.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum MetricTransform {
    /// Use the metric as-is.
    #[default]
    Identity,
    /// Natural log. Values at or below zero have no log and become NaN,
    /// which downstream statistics treat as missing.
    Log,
}

impl MetricTransform {
    /// Transform a single value.
    #[inline]
    pub fn apply_value(self, x: f64) -> f64 {
        match self {
            MetricTransform::Identity => x,
            MetricTransform::Log => {
                if x > 0.0 {
                    x.ln()
                } else {
                    f64::NAN
                }
            }
        }
    }

    /// Transform a whole metric vector.
    pub fn apply(self, xs: &[f64]) -> Array1<f64> {
        Array1::from_iter(xs.iter().map(|&x| self.apply_value(x)))
    }
}

impl FromStr for MetricTransform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(MetricTransform::Identity),
            "log" => Ok(MetricTransform::Log),
            _ => bail!("metric transform not recognized: {}", s),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_log_transform() {
        let out = MetricTransform::Log.apply(&[std::f64::consts::E, 1.0, 0.0, -1.0, f64::NAN]);
        assert_approx_eq!(out[0], 1.0, 1e-12);
        assert_approx_eq!(out[1], 0.0, 1e-12);
        assert!(out[2].is_nan());
        assert!(out[3].is_nan());
        assert!(out[4].is_nan());
    }

    #[test]
    fn test_identity_passes_through() {
        let out = MetricTransform::Identity.apply(&[-2.0, 0.0, 7.5]);
        assert_eq!(out.to_vec(), vec![-2.0, 0.0, 7.5]);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("log".parse::<MetricTransform>().unwrap(), MetricTransform::Log);
        assert_eq!("identity".parse::<MetricTransform>().unwrap(), MetricTransform::Identity);
        assert!("log2".parse::<MetricTransform>().is_err());
    }
}
