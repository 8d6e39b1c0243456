//! Robust location and scale estimation: median and median absolute
//! deviation (MAD).

use ndarray::prelude::*;
use ndarray::DataMut;
use noisy_float::prelude::n64;
use num_traits::FromPrimitive;
use std::fmt::Display;
use std::ops::{Add, Div};

/// Scale factor making the MAD a consistent estimator of the standard
/// deviation under normality.
pub const NORMAL_CONSISTENCY: f64 = 1.4826;

/// Statistics over an empty population are undefined.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatsError {
    /// No usable observations remained after dropping missing values.
    EmptyPopulation,
}

impl std::error::Error for StatsError {}

impl Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::EmptyPopulation => f.write_str("statistics population is empty"),
        }
    }
}

/// Return the median. Sorts its argument in place.
pub fn median_mut<S, T>(xs: &mut ArrayBase<S, Ix1>) -> Result<T, StatsError>
where
    S: DataMut<Elem = T>,
    T: Clone + Copy + Ord + FromPrimitive,
    T: Add<Output = T> + Div<Output = T>,
{
    if xs.is_empty() {
        return Err(StatsError::EmptyPopulation);
    }
    match xs.as_slice_mut() {
        Some(vector) => vector.sort_unstable(),
        None => panic!("an attempt was made to calculate a median value for non-contiguous data"),
    }
    Ok(if xs.len() % 2 == 0 {
        (xs[xs.len() / 2] + xs[xs.len() / 2 - 1]) / T::from_u64(2).unwrap()
    } else {
        xs[xs.len() / 2]
    })
}

/// Median of the finite values in `xs`. NaN (and infinities) are treated as
/// missing and excluded.
pub fn nan_median(xs: &[f64]) -> Result<f64, StatsError> {
    let mut finite = Array1::from_iter(xs.iter().copied().filter(|v| v.is_finite()).map(n64));
    median_mut(&mut finite).map(|m| m.raw())
}

/// Median and scaled MAD of a population.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RobustStats {
    /// Median of the finite values.
    pub median: f64,
    /// Median absolute deviation from the median, scaled by
    /// [`NORMAL_CONSISTENCY`].
    pub mad: f64,
}

impl RobustStats {
    /// Compute the median and scaled MAD of `xs`, excluding non-finite
    /// values from both passes.
    pub fn from_values(xs: &[f64]) -> Result<RobustStats, StatsError> {
        let finite: Vec<f64> = xs.iter().copied().filter(|v| v.is_finite()).collect();
        let median = nan_median(&finite)?;
        let deviations: Vec<f64> = finite.iter().map(|v| (v - median).abs()).collect();
        let mad = nan_median(&deviations)? * NORMAL_CONSISTENCY;
        Ok(RobustStats { median, mad })
    }
}
