//! Propensity-score matching.
//!
//! [`estimate_propensity`] fits the treatment model, [`match_units`] turns
//! the scores into matched subclasses and weights, [`assess_balance`]
//! compares covariate distributions before and after matching and
//! [`estimate_effect`] runs the weighted outcome regression on the matched
//! sample.

pub mod balance;
pub mod full;
pub mod hungarian;
pub mod nearest;
pub mod outcome;
pub mod plot;
pub mod propensity;
pub mod weights;

pub use balance::{BalanceRow, BalanceStats, BalanceTable, GroupCount, SampleSizes, assess_balance};
pub use outcome::{EffectEstimate, estimate_effect, matched_data};
pub use plot::{DistanceHistogram, distance_histogram};
pub use propensity::{PropensityScores, common_support, estimate_propensity};
pub use weights::MatchResult;

use tracing::{info, instrument};

use crate::config::{Estimand, MatchingConfig, MatchingMethod};
use crate::error::{CausalError, Result};
use crate::stats::descriptive::std_dev;
use full::full_match;
use nearest::{NearestOptions, nearest_neighbors, pair_subclasses};
use weights::{replacement_weights, subclass_weights};

/// Caliper in distance units.
///
/// A standardized caliper is multiplied by the standard deviation of the
/// distance over units that survived common-support trimming.
fn absolute_caliper(config: &MatchingConfig, distance: &[f64], eligible: &[bool]) -> Option<f64> {
    let caliper = config.caliper?;
    if !config.std_caliper {
        return Some(caliper);
    }
    let kept: Vec<f64> = distance
        .iter()
        .zip(eligible)
        .filter(|(_, e)| **e)
        .map(|(d, _)| *d)
        .collect();
    Some(caliper * std_dev(&kept))
}

/// Match units on their propensity scores.
#[instrument(skip(scores, config), fields(treatment = %scores.treatment))]
pub fn match_units(scores: &PropensityScores, config: &MatchingConfig) -> Result<MatchResult> {
    if config.method == MatchingMethod::Nearest && config.estimand == Estimand::Ate {
        return Err(CausalError::InvalidConfig(
            "ATE requires full matching; nearest-neighbour matching supports ATT and ATC".to_string(),
        ));
    }

    let distance = scores.scores.clone();
    let treated = scores.treated.clone();
    let discarded = common_support(&distance, &treated, config.discard);
    let eligible: Vec<bool> = discarded.iter().map(|d| !d).collect();
    let caliper = absolute_caliper(config, &distance, &eligible);
    if let Some(c) = caliper {
        info!("Caliper of {:.4} distance units", c);
    }

    let (subclass, weights, matched_pairs) = match config.method {
        MatchingMethod::Nearest => {
            let options = NearestOptions {
                estimand: config.estimand,
                ratio: config.ratio,
                replace: config.replace,
                caliper,
                order: config.order,
                seed: config.seed,
            };
            let pairs = nearest_neighbors(&distance, &treated, &eligible, &options)?;
            if config.replace {
                let weights = replacement_weights(&treated, &pairs, config.estimand);
                (vec![None; distance.len()], weights, pairs)
            } else {
                let subclass = pair_subclasses(distance.len(), &pairs);
                let weights = subclass_weights(&treated, &subclass, config.estimand);
                (subclass, weights, pairs)
            }
        }
        MatchingMethod::Full => {
            let full = full_match(&distance, &treated, &eligible, caliper)?;
            let weights = subclass_weights(&treated, &full.subclass, config.estimand);
            (full.subclass, weights, full.edges)
        }
    };

    let result = MatchResult {
        method: config.method,
        estimand: config.estimand,
        distance_kind: scores.distance,
        treatment: scores.treatment.clone(),
        distance,
        treated,
        weights,
        subclass,
        matched_pairs,
        discarded,
        row_index: scores.row_index.clone(),
        caliper,
        ratio: config.ratio,
        replace: config.replace,
    };

    let (mt, mc) = result.n_matched();
    if mt == 0 || mc == 0 {
        return Err(CausalError::MatchingFailed(format!(
            "matched sample has {} treated and {} control units",
            mt, mc
        )));
    }
    info!(
        "Matched {} treated and {} control units ({} of {} treated, {} of {} control)",
        mt,
        mc,
        mt,
        scores.n_treated(),
        mc,
        scores.n_control()
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Discard, DistanceKind, MatchOrder};
    use crate::models::logit::fit_logit;

    fn scores(distance: Vec<f64>, treated: Vec<bool>) -> PropensityScores {
        let y: Vec<f64> = treated.iter().map(|t| if *t { 1.0 } else { 0.0 }).collect();
        let x: Vec<f64> = distance.iter().flat_map(|d| [1.0, *d]).collect();
        let model = fit_logit(
            &y,
            &x,
            &["(Intercept)".to_string(), "x".to_string()],
            None,
            0.95,
        )
        .unwrap();
        PropensityScores {
            treatment: "treat".to_string(),
            distance: DistanceKind::Glm,
            row_index: (0..distance.len()).collect(),
            scores: distance,
            treated,
            model,
        }
    }

    fn sample() -> PropensityScores {
        scores(
            vec![0.8, 0.5, 0.3, 0.75, 0.55, 0.31, 0.1, 0.45],
            vec![true, true, true, false, false, false, false, true],
        )
    }

    #[test]
    fn test_nearest_without_replacement() {
        let result = match_units(&sample(), &MatchingConfig::default()).unwrap();
        assert_eq!(result.n_matched(), (4, 4));
        assert_eq!(result.n_subclasses(), 4);
        assert!(result.weights.iter().all(|w| *w == 1.0));
    }

    #[test]
    fn test_std_caliper_scales_with_distance_sd() {
        let config = MatchingConfig {
            caliper: Some(0.1),
            std_caliper: true,
            ..MatchingConfig::default()
        };
        let s = sample();
        let result = match_units(&s, &config).unwrap();
        let expected = 0.1 * std_dev(&s.scores);
        assert!((result.caliper.unwrap() - expected).abs() < 1e-12);
        for (f, c) in &result.matched_pairs {
            assert!((s.scores[*f] - s.scores[*c]).abs() <= expected);
        }
    }

    #[test]
    fn test_full_matching_supports_ate() {
        let config = MatchingConfig {
            method: MatchingMethod::Full,
            estimand: Estimand::Ate,
            ..MatchingConfig::default()
        };
        let result = match_units(&sample(), &config).unwrap();
        assert!(result.subclass.iter().all(Option::is_some));
        let wt: f64 = result
            .weights
            .iter()
            .zip(&result.treated)
            .filter(|(_, t)| **t)
            .map(|(w, _)| w)
            .sum();
        assert!((wt - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_nearest_ate_rejected() {
        let config = MatchingConfig {
            estimand: Estimand::Ate,
            ..MatchingConfig::default()
        };
        assert!(matches!(
            match_units(&sample(), &config),
            Err(CausalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_common_support_discard() {
        let config = MatchingConfig {
            discard: Discard::Control,
            order: MatchOrder::Data,
            ..MatchingConfig::default()
        };
        let result = match_units(&sample(), &config).unwrap();
        // control 0.1 lies below the lowest treated score
        assert!(result.discarded[6]);
        assert_eq!(result.weights[6], 0.0);
    }

    #[test]
    fn test_replacement_has_no_subclasses() {
        let config = MatchingConfig {
            replace: true,
            ..MatchingConfig::default()
        };
        let result = match_units(&sample(), &config).unwrap();
        assert_eq!(result.n_subclasses(), 0);
        let (mt, _) = result.n_matched();
        assert_eq!(mt, 4);
    }
}
