//! Propensity scores and common-support trimming.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Discard, DistanceKind};
use crate::error::{CausalError, Result};
use crate::models::logit::{LogitModel, glm_logit};

/// Estimated distance for every unit used by the propensity model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropensityScores {
    pub treatment: String,
    pub distance: DistanceKind,
    /// Probability (`Glm`) or linear predictor (`Logit`) per unit
    pub scores: Vec<f64>,
    pub treated: Vec<bool>,
    /// Source-frame row of every unit
    pub row_index: Vec<usize>,
    pub model: LogitModel,
}

impl PropensityScores {
    pub fn n_treated(&self) -> usize {
        self.treated.iter().filter(|t| **t).count()
    }

    pub fn n_control(&self) -> usize {
        self.treated.len() - self.n_treated()
    }
}

/// Fit `treatment ~ covariates` by logistic regression.
///
/// The treatment must be coded 0/1 and both groups must be present after
/// listwise deletion.
pub fn estimate_propensity(
    df: &DataFrame,
    treatment: &str,
    covariates: &str,
    distance: DistanceKind,
) -> Result<PropensityScores> {
    let rhs = covariates.trim().trim_start_matches('~').trim();
    let formula = format!("{} ~ {}", treatment, rhs);
    let model = glm_logit(df, &formula, None, 0.95)?;

    let response = crate::data::columns::numeric_values(df, treatment)?;
    let mut treated = Vec::with_capacity(model.row_index.len());
    for &row in &model.row_index {
        match response[row] {
            Some(v) if v == 1.0 => treated.push(true),
            Some(v) if v == 0.0 => treated.push(false),
            other => {
                return Err(CausalError::InvalidConfig(format!(
                    "treatment '{}' must be 0/1, found {:?} in row {}",
                    treatment, other, row
                )));
            }
        }
    }

    let n_treated = treated.iter().filter(|t| **t).count();
    if n_treated == 0 || n_treated == treated.len() {
        return Err(CausalError::InsufficientData(format!(
            "treatment '{}' has only one group among complete rows",
            treatment
        )));
    }

    if !model.converged {
        warn!("Propensity model did not converge");
    }

    let scores = match distance {
        DistanceKind::Glm => model.fitted.clone(),
        DistanceKind::Logit => model.linear_predictor.clone(),
    };

    info!(
        "Estimated propensity scores for {} units ({} treated, {} control)",
        treated.len(),
        n_treated,
        treated.len() - n_treated
    );

    Ok(PropensityScores {
        treatment: treatment.to_string(),
        distance,
        scores,
        row_index: model.row_index.clone(),
        treated,
        model,
    })
}

fn range(scores: &[f64], treated: &[bool], group: bool) -> Option<(f64, f64)> {
    scores
        .iter()
        .zip(treated)
        .filter(|(_, t)| **t == group)
        .map(|(s, _)| *s)
        .fold(None, |acc, s| match acc {
            None => Some((s, s)),
            Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
        })
}

/// Flag units outside the score range of the other group.
pub fn common_support(scores: &[f64], treated: &[bool], discard: Discard) -> Vec<bool> {
    let mut discarded = vec![false; scores.len()];
    if discard == Discard::None {
        return discarded;
    }

    let treated_range = range(scores, treated, true);
    let control_range = range(scores, treated, false);
    let outside = |s: f64, r: Option<(f64, f64)>| r.is_some_and(|(lo, hi)| s < lo || s > hi);

    for (i, (&s, &t)) in scores.iter().zip(treated).enumerate() {
        discarded[i] = match (discard, t) {
            (Discard::Treated | Discard::Both, true) => outside(s, control_range),
            (Discard::Control | Discard::Both, false) => outside(s, treated_range),
            _ => false,
        };
    }

    let n = discarded.iter().filter(|d| **d).count();
    if n > 0 {
        info!("Discarded {} units outside common support", n);
    }
    discarded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cohort() -> DataFrame {
        df!(
            "treat" => &[1i64, 1, 1, 1, 0, 0, 0, 0, 0, 0, 1, 0],
            "age" => &[30.0f64, 35.0, 41.0, 28.0, 22.0, 45.0, 25.0, 33.0, 24.0, 21.0, 38.0, 26.0],
            "female" => &[1.0f64, 0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0]
        )
        .unwrap()
    }

    #[test]
    fn test_glm_and_logit_distances() {
        let glm = estimate_propensity(&cohort(), "treat", "age + female", DistanceKind::Glm).unwrap();
        assert_eq!(glm.n_treated(), 5);
        assert_eq!(glm.n_control(), 7);
        assert!(glm.scores.iter().all(|p| *p > 0.0 && *p < 1.0));

        let logit =
            estimate_propensity(&cohort(), "treat", "~ age + female", DistanceKind::Logit).unwrap();
        let p = 1.0 / (1.0 + (-logit.scores[0]).exp());
        assert!((p - glm.scores[0]).abs() < 1e-10);
    }

    #[test]
    fn test_non_binary_treatment() {
        let df = df!(
            "treat" => &[0i64, 1, 2, 1, 0, 1],
            "age" => &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]
        )
        .unwrap();
        assert!(estimate_propensity(&df, "treat", "age", DistanceKind::Glm).is_err());
    }

    #[test]
    fn test_common_support() {
        let scores = [0.1, 0.5, 0.9, 0.2, 0.4, 0.95];
        let treated = [false, false, false, true, true, true];
        assert_eq!(
            common_support(&scores, &treated, Discard::Control),
            vec![true, false, false, false, false, false]
        );
        assert_eq!(
            common_support(&scores, &treated, Discard::Treated),
            vec![false, false, false, false, false, true]
        );
        assert_eq!(
            common_support(&scores, &treated, Discard::Both),
            vec![true, false, false, false, false, true]
        );
        assert!(common_support(&scores, &treated, Discard::None).iter().all(|d| !d));
    }
}
