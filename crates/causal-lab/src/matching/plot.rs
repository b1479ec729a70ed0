//! Histogram data of the distance before and after matching.

use serde::{Deserialize, Serialize};

use crate::error::{CausalError, Result};
use crate::matching::weights::MatchResult;

/// Counts of units per distance bin, by group and sample.
///
/// Matched counts are weighted by the matching weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceHistogram {
    /// `bins + 1` bin edges
    pub edges: Vec<f64>,
    pub treated_all: Vec<f64>,
    pub control_all: Vec<f64>,
    pub treated_matched: Vec<f64>,
    pub control_matched: Vec<f64>,
}

fn bin_of(value: f64, lo: f64, width: f64, bins: usize) -> usize {
    if width <= 0.0 {
        return 0;
    }
    (((value - lo) / width).floor() as usize).min(bins - 1)
}

/// Bin the distance of every unit into `bins` equal-width bins.
pub fn distance_histogram(result: &MatchResult, bins: usize) -> Result<DistanceHistogram> {
    if bins == 0 {
        return Err(CausalError::InvalidConfig("bins must be at least 1".to_string()));
    }
    let lo = result.distance.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = result.distance.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() {
        return Err(CausalError::InsufficientData("no distance values to bin".to_string()));
    }
    let width = (hi - lo) / bins as f64;

    let mut hist = DistanceHistogram {
        edges: (0..=bins).map(|k| lo + width * k as f64).collect(),
        treated_all: vec![0.0; bins],
        control_all: vec![0.0; bins],
        treated_matched: vec![0.0; bins],
        control_matched: vec![0.0; bins],
    };

    for (unit, &d) in result.distance.iter().enumerate() {
        let b = bin_of(d, lo, width, bins);
        let w = result.weights[unit];
        if result.treated[unit] {
            hist.treated_all[b] += 1.0;
            hist.treated_matched[b] += w;
        } else {
            hist.control_all[b] += 1.0;
            hist.control_matched[b] += w;
        }
    }
    Ok(hist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceKind, Estimand, MatchingMethod};

    #[test]
    fn test_histogram_counts() {
        let result = MatchResult {
            method: MatchingMethod::Nearest,
            estimand: Estimand::Att,
            distance_kind: DistanceKind::Glm,
            treatment: "treat".to_string(),
            distance: vec![0.0, 0.9, 1.0, 0.1],
            treated: vec![true, true, false, false],
            weights: vec![1.0, 1.0, 2.0, 0.0],
            subclass: vec![None; 4],
            matched_pairs: vec![(0, 2), (1, 2)],
            discarded: vec![false; 4],
            row_index: vec![0, 1, 2, 3],
            caliper: None,
            ratio: 1,
            replace: true,
        };
        let hist = distance_histogram(&result, 2).unwrap();
        assert_eq!(hist.edges, vec![0.0, 0.5, 1.0]);
        assert_eq!(hist.treated_all, vec![1.0, 1.0]);
        assert_eq!(hist.control_all, vec![1.0, 1.0]);
        assert_eq!(hist.control_matched, vec![0.0, 2.0]);
        assert!(distance_histogram(&result, 0).is_err());
    }
}
