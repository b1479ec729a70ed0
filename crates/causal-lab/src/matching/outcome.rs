//! Matched samples and treatment-effect estimation.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CovarianceType, Estimand};
use crate::error::{CausalError, Result};
use crate::matching::weights::MatchResult;
use crate::models::covariance::VcovKind;
use crate::models::ols::{LmOptions, lm};

/// Column names appended to matched data.
pub const DISTANCE_COLUMN: &str = "distance";
pub const WEIGHTS_COLUMN: &str = "weights";
pub const SUBCLASS_COLUMN: &str = "subclass";

/// Treatment effect from a weighted regression on the matched sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectEstimate {
    pub estimand: Estimand,
    pub outcome: String,
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub conf_low: f64,
    pub conf_high: f64,
    /// Observations in the outcome regression
    pub n: usize,
    pub covariance: VcovKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_clusters: Option<usize>,
}

/// Matched rows of `df` with `distance`, `weights` and 1-based `subclass`
/// columns appended.
///
/// `df` must be the frame the propensity model was fitted on.
pub fn matched_data(df: &DataFrame, result: &MatchResult) -> Result<DataFrame> {
    let height = df.height();
    let mut distance: Vec<Option<f64>> = vec![None; height];
    let mut weights: Vec<Option<f64>> = vec![None; height];
    let mut subclass: Vec<Option<i64>> = vec![None; height];
    let mut keep = vec![false; height];

    for (unit, &row) in result.row_index.iter().enumerate() {
        if row >= height {
            return Err(CausalError::Internal(format!(
                "matched unit {} points at row {} of a {}-row frame",
                unit, row, height
            )));
        }
        if !result.is_matched(unit) {
            continue;
        }
        keep[row] = true;
        distance[row] = Some(result.distance[unit]);
        weights[row] = Some(result.weights[unit]);
        subclass[row] = result.subclass[unit].map(|s| s as i64 + 1);
    }

    let mut out = df.clone();
    out.with_column(Series::new(DISTANCE_COLUMN.into(), distance))?;
    out.with_column(Series::new(WEIGHTS_COLUMN.into(), weights))?;
    out.with_column(Series::new(SUBCLASS_COLUMN.into(), subclass))?;

    let mask = BooleanChunked::from_slice("mask".into(), &keep);
    Ok(out.filter(&mask)?)
}

/// Regress `outcome` on the treatment (and optional covariates) in the
/// matched sample, weighting by the matching weights.
///
/// Standard errors are clustered on subclass when the match produced at
/// least two subclasses, and HC1 otherwise (matching with replacement).
pub fn estimate_effect(
    df: &DataFrame,
    result: &MatchResult,
    outcome: &str,
    covariates: Option<&str>,
    conf_level: f64,
) -> Result<EffectEstimate> {
    let data = matched_data(df, result)?;

    let mut formula = format!("{} ~ {}", outcome, result.treatment);
    if let Some(extra) = covariates.map(|c| c.trim().trim_start_matches('~').trim())
        && !extra.is_empty()
    {
        formula.push_str(" + ");
        formula.push_str(extra);
    }

    let clustered = result.n_subclasses() >= 2;
    if !clustered {
        warn!("No subclasses to cluster on; using HC1 standard errors");
    }
    let options = LmOptions {
        weights: Some(WEIGHTS_COLUMN.to_string()),
        covariance: CovarianceType::Hc1,
        cluster: clustered.then(|| SUBCLASS_COLUMN.to_string()),
        absorb: None,
        conf_level,
    };
    let model = lm(&data, &formula, &options)?;

    let coef = model.coefficient(&result.treatment).ok_or_else(|| {
        CausalError::ModelFailed(format!(
            "treatment '{}' has no coefficient in '{}'",
            result.treatment, formula
        ))
    })?;

    info!(
        "{} on '{}': {:.4} (SE {:.4}, {})",
        result.estimand, outcome, coef.estimate, coef.std_error, model.covariance
    );

    Ok(EffectEstimate {
        estimand: result.estimand,
        outcome: outcome.to_string(),
        estimate: coef.estimate,
        std_error: coef.std_error,
        statistic: coef.statistic,
        p_value: coef.p_value,
        conf_low: coef.conf_low,
        conf_high: coef.conf_high,
        n: model.n_obs,
        covariance: model.covariance,
        n_clusters: model.n_clusters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DistanceKind, MatchingMethod};

    fn frame() -> DataFrame {
        df!(
            "treat" => &[1.0f64, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0],
            "y" => &[5.0f64, 7.0, 6.5, 3.0, 4.5, 4.0, 10.0],
            "age" => &[30.0f64, 40.0, 35.0, 31.0, 41.0, 36.0, 70.0]
        )
        .unwrap()
    }

    fn result() -> MatchResult {
        MatchResult {
            method: MatchingMethod::Nearest,
            estimand: Estimand::Att,
            distance_kind: DistanceKind::Glm,
            treatment: "treat".to_string(),
            distance: vec![0.6, 0.7, 0.65, 0.58, 0.69, 0.66, 0.1],
            treated: vec![true, true, true, false, false, false, false],
            weights: vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0],
            subclass: vec![Some(0), Some(1), Some(2), Some(0), Some(1), Some(2), None],
            matched_pairs: vec![(0, 3), (1, 4), (2, 5)],
            discarded: vec![false; 7],
            row_index: (0..7).collect(),
            caliper: None,
            ratio: 1,
            replace: false,
        }
    }

    #[test]
    fn test_matched_data_keeps_matched_rows() {
        let data = matched_data(&frame(), &result()).unwrap();
        assert_eq!(data.height(), 6);
        let subclass: Vec<Option<i64>> = data
            .column(SUBCLASS_COLUMN)
            .unwrap()
            .as_materialized_series()
            .i64()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(subclass, vec![Some(1), Some(2), Some(3), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn test_pair_matched_effect_is_mean_difference() {
        let effect = estimate_effect(&frame(), &result(), "y", None, 0.95).unwrap();
        // treated mean 6.1667, matched control mean 3.8333
        assert!((effect.estimate - (18.5 / 3.0 - 11.5 / 3.0)).abs() < 1e-9);
        assert_eq!(effect.n, 6);
        assert_eq!(effect.covariance, VcovKind::Cluster);
        assert_eq!(effect.n_clusters, Some(3));
        assert!(effect.conf_low < effect.estimate && effect.estimate < effect.conf_high);
    }

    #[test]
    fn test_replacement_match_uses_hc1() {
        let mut r = result();
        r.subclass = vec![None; 7];
        let effect = estimate_effect(&frame(), &r, "y", Some("~ age"), 0.95).unwrap();
        assert_eq!(effect.covariance, VcovKind::Hc1);
        assert!(effect.n_clusters.is_none());
    }
}
