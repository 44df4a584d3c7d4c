use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

use super::Quantity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
        })
    }
}

/// Windowed comparison of yearly quantities. The early window is the first
/// `ceil(span * window_fraction)` years of the entity's range, the late
/// window the same number of final years; years without trade count as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPolicy {
    /// Relative change of the late mean over the early mean that counts as a trend.
    pub threshold: f64,
    pub window_fraction: f64,
    /// Entities spanning fewer years are always `Stable`.
    pub min_span_years: u32,
}

impl Default for TrendPolicy {
    fn default() -> Self {
        Self { threshold: 0.20, window_fraction: 1.0 / 3.0, min_span_years: 3 }
    }
}

impl TrendPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(ConfigError::OutOfRange { field: "trend.threshold", detail: self.threshold.to_string() });
        }
        if !(self.window_fraction > 0.0 && self.window_fraction <= 0.5) {
            return Err(ConfigError::OutOfRange { field: "trend.window_fraction", detail: self.window_fraction.to_string() });
        }
        if self.min_span_years == 0 {
            return Err(ConfigError::OutOfRange { field: "trend.min_span_years", detail: "must be > 0".into() });
        }
        Ok(())
    }

    /// Classifies a year -> quantity series over the inclusive range `min..=max`.
    /// Window sums walk only the years present in `yearly`, so the cost does
    /// not depend on how wide the range is.
    pub fn classify(&self, yearly: &BTreeMap<i32, Quantity>, min_year: i32, max_year: i32) -> Trend {
        if max_year < min_year { return Trend::Stable; }
        let span = i64::from(max_year) - i64::from(min_year) + 1;
        if span < i64::from(self.min_span_years) { return Trend::Stable; }

        // Epsilon keeps 6 * (1/3) from rounding up to a window of 3.
        let window = ((span as f64 * self.window_fraction - 1e-9).ceil() as i64).clamp(1, span);
        let total = |from: i64, to: i64| -> Quantity {
            let from = i32::try_from(from).unwrap_or(i32::MIN);
            let to = i32::try_from(to).unwrap_or(i32::MAX);
            yearly.range(from..=to).map(|(_, q)| *q).sum()
        };
        let (lo, hi) = (i64::from(min_year), i64::from(max_year));
        // Both windows have the same width, so comparing sums compares means.
        let early = total(lo, lo + window - 1).to_f64();
        let late = total(hi - window + 1, hi).to_f64();

        if early == 0.0 {
            return if late > 0.0 { Trend::Increasing } else { Trend::Stable };
        }
        let change = (late - early) / early;
        if change > self.threshold {
            Trend::Increasing
        } else if change < -self.threshold {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}
