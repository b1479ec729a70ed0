//! Plot data for discontinuity figures.

use serde::{Deserialize, Serialize};

use crate::error::{CausalError, Result};
use crate::rdd::estimate::RdEstimate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Below,
    Above,
}

/// Mean outcome in one bin of the running variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinnedMean {
    pub side: Side,
    pub lower: f64,
    pub upper: f64,
    pub center: f64,
    pub mean: f64,
    pub count: usize,
}

/// Points of the local linear fit on both sides of the cutpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FittedLines {
    pub below: Vec<(f64, f64)>,
    pub above: Vec<(f64, f64)>,
}

fn side_bins(x: &[f64], y: &[f64], lo: f64, hi: f64, bins: usize, side: Side) -> Vec<BinnedMean> {
    let width = (hi - lo) / bins as f64;
    let mut sums = vec![(0.0, 0usize); bins];
    for (xi, yi) in x.iter().zip(y) {
        let inside = match side {
            Side::Below => *xi >= lo && *xi < hi,
            Side::Above => *xi >= lo && *xi <= hi,
        };
        if !inside {
            continue;
        }
        let b = if width > 0.0 {
            (((xi - lo) / width).floor() as usize).min(bins - 1)
        } else {
            0
        };
        sums[b].0 += yi;
        sums[b].1 += 1;
    }

    sums.into_iter()
        .enumerate()
        .filter(|(_, (_, count))| *count > 0)
        .map(|(b, (sum, count))| {
            let lower = lo + width * b as f64;
            let upper = lower + width;
            BinnedMean {
                side,
                lower,
                upper,
                center: (lower + upper) / 2.0,
                mean: sum / count as f64,
                count,
            }
        })
        .collect()
}

/// Mean outcome in equal-width bins on each side of the cutpoint.
///
/// Each side spans from the most extreme observation to the cutpoint.
/// Empty bins are left out.
pub fn binned_means(x: &[f64], y: &[f64], cutpoint: f64, bins_per_side: usize) -> Result<Vec<BinnedMean>> {
    if bins_per_side == 0 {
        return Err(CausalError::InvalidConfig("bins must be at least 1".to_string()));
    }
    if x.len() != y.len() {
        return Err(CausalError::Internal(format!(
            "{} running values for {} outcomes",
            x.len(),
            y.len()
        )));
    }
    let min = x.iter().copied().fold(f64::INFINITY, f64::min);
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut bins = Vec::new();
    if min < cutpoint {
        bins.extend(side_bins(x, y, min, cutpoint, bins_per_side, Side::Below));
    }
    if max >= cutpoint {
        bins.extend(side_bins(x, y, cutpoint, max, bins_per_side, Side::Above));
    }
    Ok(bins)
}

/// The local linear fit of `estimate` evaluated at `points` evenly spaced
/// values across the bandwidth on each side.
pub fn fitted_lines(estimate: &RdEstimate, points: usize) -> FittedLines {
    let points = points.max(2);
    let (c, h) = (estimate.cutpoint, estimate.bandwidth);
    let fit = estimate.fit;
    let step = h / (points - 1) as f64;

    let below = (0..points)
        .map(|k| {
            let xc = -h + step * k as f64;
            (c + xc, fit.left_intercept + fit.left_slope * xc)
        })
        .collect();
    let above = (0..points)
        .map(|k| {
            let xc = step * k as f64;
            (c + xc, fit.right_intercept + fit.right_slope * xc)
        })
        .collect();
    FittedLines { below, above }
}
