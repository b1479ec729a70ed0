//! Matching weights and the shared match result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{DistanceKind, Estimand, MatchingMethod};

/// Outcome of a matching run, one entry per unit of the propensity model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub method: MatchingMethod,
    pub estimand: Estimand,
    pub distance_kind: DistanceKind,
    /// Treatment column the units were split on
    pub treatment: String,
    pub distance: Vec<f64>,
    pub treated: Vec<bool>,
    /// Zero for units that were not matched
    pub weights: Vec<f64>,
    pub subclass: Vec<Option<usize>>,
    /// `(focal, matched)` unit pairs
    pub matched_pairs: Vec<(usize, usize)>,
    pub discarded: Vec<bool>,
    /// Source-frame row of every unit
    pub row_index: Vec<usize>,
    /// Caliper in distance units, when one was applied
    pub caliper: Option<f64>,
    pub ratio: usize,
    pub replace: bool,
}

impl MatchResult {
    /// Number of matched `(treated, control)` units.
    pub fn n_matched(&self) -> (usize, usize) {
        let mut counts = (0, 0);
        for (w, t) in self.weights.iter().zip(&self.treated) {
            if *w > 0.0 {
                if *t {
                    counts.0 += 1;
                } else {
                    counts.1 += 1;
                }
            }
        }
        counts
    }

    /// Number of distinct subclasses.
    pub fn n_subclasses(&self) -> usize {
        let mut ids: Vec<usize> = self.subclass.iter().flatten().copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn is_matched(&self, unit: usize) -> bool {
        self.weights[unit] > 0.0
    }
}

/// Scale the weights of one group so they sum to its matched count.
fn rescale_group(weights: &mut [f64], treated: &[bool], group: bool) {
    let (count, total) = weights
        .iter()
        .zip(treated)
        .filter(|(w, t)| **t == group && **w > 0.0)
        .fold((0usize, 0.0), |(c, s), (w, _)| (c + 1, s + w));
    if total <= 0.0 {
        return;
    }
    let factor = count as f64 / total;
    for (w, t) in weights.iter_mut().zip(treated) {
        if *t == group {
            *w *= factor;
        }
    }
}

fn rescale_non_focal(weights: &mut [f64], treated: &[bool], estimand: Estimand) {
    match estimand {
        Estimand::Att => rescale_group(weights, treated, false),
        Estimand::Atc => rescale_group(weights, treated, true),
        Estimand::Ate => {
            rescale_group(weights, treated, true);
            rescale_group(weights, treated, false);
        }
    }
}

/// Weights implied by a subclass assignment.
///
/// ATT: treated 1, controls `n_t(s) / n_c(s)`; ATC mirrors it; ATE gives
/// every unit `n(s) / n_group(s)`. Units without a subclass get 0.
pub fn subclass_weights(treated: &[bool], subclass: &[Option<usize>], estimand: Estimand) -> Vec<f64> {
    let mut sizes: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for (s, t) in subclass.iter().zip(treated) {
        if let Some(s) = s {
            let entry = sizes.entry(*s).or_default();
            if *t {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }
    }

    let mut weights: Vec<f64> = subclass
        .iter()
        .zip(treated)
        .map(|(s, t)| {
            let Some(s) = s else { return 0.0 };
            let (nt, nc) = sizes.get(s).copied().unwrap_or_default();
            if nt == 0 || nc == 0 {
                return 0.0;
            }
            let (nt, nc) = (nt as f64, nc as f64);
            match (estimand, *t) {
                (Estimand::Att, true) => 1.0,
                (Estimand::Att, false) => nt / nc,
                (Estimand::Atc, true) => nc / nt,
                (Estimand::Atc, false) => 1.0,
                (Estimand::Ate, true) => (nt + nc) / nt,
                (Estimand::Ate, false) => (nt + nc) / nc,
            }
        })
        .collect();

    rescale_non_focal(&mut weights, treated, estimand);
    weights
}

/// Weights for matching with replacement.
///
/// Every matched focal unit gets 1; each of its `k` matches receives
/// `1 / k`, summed over the focal units that used it.
pub fn replacement_weights(
    treated: &[bool],
    pairs: &[(usize, usize)],
    estimand: Estimand,
) -> Vec<f64> {
    let mut weights = vec![0.0; treated.len()];
    let mut per_focal: BTreeMap<usize, usize> = BTreeMap::new();
    for (focal, _) in pairs {
        *per_focal.entry(*focal).or_default() += 1;
    }
    for (focal, other) in pairs {
        let k = per_focal.get(focal).copied().unwrap_or(1);
        weights[*focal] = 1.0;
        weights[*other] += 1.0 / k as f64;
    }
    rescale_non_focal(&mut weights, treated, estimand);
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_att_subclass_weights() {
        // subclass 0: 1 treated + 2 controls, subclass 1: 1 treated + 1 control
        let treated = [true, false, false, true, false, false];
        let subclass = [Some(0), Some(0), Some(0), Some(1), Some(1), None];
        let w = subclass_weights(&treated, &subclass, Estimand::Att);
        assert_eq!(w[0], 1.0);
        assert_eq!(w[3], 1.0);
        assert_eq!(w[5], 0.0);
        // raw control weights 0.5, 0.5, 1.0 rescaled to sum to 3
        let controls: f64 = [w[1], w[2], w[4]].iter().sum();
        assert!((controls - 3.0).abs() < 1e-12);
        assert!((w[4] / w[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_atc_mirrors_att() {
        let treated = [false, true, true];
        let subclass = [Some(0), Some(0), Some(0)];
        let w = subclass_weights(&treated, &subclass, Estimand::Atc);
        assert_eq!(w, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_ate_weights_sum_to_group_counts() {
        let treated = [true, false, false, true, true, false];
        let subclass = [Some(0), Some(0), Some(0), Some(1), Some(1), Some(1)];
        let w = subclass_weights(&treated, &subclass, Estimand::Ate);
        let wt: f64 = w.iter().zip(&treated).filter(|(_, t)| **t).map(|(w, _)| w).sum();
        let wc: f64 = w.iter().zip(&treated).filter(|(_, t)| !**t).map(|(w, _)| w).sum();
        assert!((wt - 3.0).abs() < 1e-12);
        assert!((wc - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_replacement_weights() {
        // treated 0 and 1 both use control 2; treated 1 also uses control 3
        let treated = [true, true, false, false, false];
        let pairs = [(0, 2), (1, 2), (1, 3)];
        let w = replacement_weights(&treated, &pairs, Estimand::Att);
        assert_eq!(w[0], 1.0);
        assert_eq!(w[1], 1.0);
        assert_eq!(w[4], 0.0);
        // raw: control 2 = 1.5, control 3 = 0.5; rescaled to sum 2
        assert!((w[2] - 1.5).abs() < 1e-12);
        assert!((w[3] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_n_matched_and_subclasses() {
        let result = MatchResult {
            method: MatchingMethod::Nearest,
            estimand: Estimand::Att,
            distance_kind: DistanceKind::Glm,
            treatment: "treat".to_string(),
            distance: vec![0.2, 0.3, 0.25, 0.9],
            treated: vec![true, false, true, false],
            weights: vec![1.0, 1.0, 0.0, 0.0],
            subclass: vec![Some(0), Some(0), None, None],
            matched_pairs: vec![(0, 1)],
            discarded: vec![false; 4],
            row_index: vec![0, 1, 2, 3],
            caliper: None,
            ratio: 1,
            replace: false,
        };
        assert_eq!(result.n_matched(), (1, 1));
        assert_eq!(result.n_subclasses(), 1);
        assert!(!result.is_matched(2));
    }
}
