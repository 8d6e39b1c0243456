use anyhow::{bail, Error};
use robust_stats::RobustStats;
use std::str::FromStr;

/// Which tail(s) of the metric distribution count as abnormal.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Direction {
    /// Flag values below the lower bound only.
    Lower,
    /// Flag values above the upper bound only.
    Higher,
    /// Flag both tails.
    #[default]
    Both,
}

impl Direction {
    /// True if this direction tests the lower tail.
    pub fn tests_lower(self) -> bool {
        matches!(self, Direction::Lower | Direction::Both)
    }

    /// True if this direction tests the upper tail.
    pub fn tests_higher(self) -> bool {
        matches!(self, Direction::Higher | Direction::Both)
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lower" => Ok(Direction::Lower),
            "higher" => Ok(Direction::Higher),
            "both" => Ok(Direction::Both),
            _ => bail!("direction not recognized: {}", s),
        }
    }
}

/// Lower and upper outlier bounds for one batch. A tail that is not being
/// tested is unbounded (infinite).
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThresholdPair {
    /// Values strictly below this are outliers.
    pub lower: f64,
    /// Values strictly above this are outliers.
    pub upper: f64,
}

impl ThresholdPair {
    /// Place bounds `nmads` MADs away from the median, open in the
    /// direction(s) not being tested.
    ///
    /// Returns `None` when the MAD is zero: the bounds would collapse onto
    /// the median and flag nearly every non-median observation, so callers
    /// must treat the batch as having degenerate statistics instead.
    pub fn from_stats(stats: &RobustStats, nmads: f64, direction: Direction) -> Option<ThresholdPair> {
        if stats.mad == 0.0 {
            return None;
        }
        let lower = if direction.tests_lower() {
            stats.median - nmads * stats.mad
        } else {
            f64::NEG_INFINITY
        };
        let upper = if direction.tests_higher() {
            stats.median + nmads * stats.mad
        } else {
            f64::INFINITY
        };
        Some(ThresholdPair { lower, upper })
    }

    /// Strictly outside the bounds. NaN is never outside.
    #[inline]
    pub fn is_outside(&self, x: f64) -> bool {
        x < self.lower || x > self.upper
    }

    /// Bounds mapped back through `exp`, for displaying the thresholds of a
    /// log-transformed metric on the original scale. The stored bounds
    /// always stay in the space the statistics were computed in.
    pub fn exp(&self) -> ThresholdPair {
        ThresholdPair {
            lower: self.lower.exp(),
            upper: self.upper.exp(),
        }
    }
}
