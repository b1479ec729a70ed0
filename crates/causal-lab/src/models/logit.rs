//! Binomial GLM with logit link, fitted by iteratively reweighted least
//! squares.

use nalgebra::DMatrix;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Alternative;
use crate::error::{CausalError, Result};
use crate::models::covariance::{invert_cross_product, weighted_cross_products};
use crate::models::design::{DesignMatrix, numeric_at};
use crate::models::formula::Formula;
use crate::models::ols::Coefficient;
use crate::stats::inference::{normal_p_value, normal_quantile};

/// Maximum IRLS iterations.
pub const MAX_ITERATIONS: usize = 25;

/// Relative deviance change that counts as converged.
pub const TOLERANCE: f64 = 1e-8;

/// Fitted probabilities closer than this to 0 or 1 indicate separation.
const SEPARATION_EPS: f64 = 10.0 * f64::EPSILON;

/// A fitted logistic regression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogitModel {
    pub formula: String,
    pub coefficients: Vec<Coefficient>,
    pub n_obs: usize,
    pub dropped_rows: usize,
    pub deviance: f64,
    pub null_deviance: f64,
    pub df_residual: f64,
    pub df_null: f64,
    pub aic: f64,
    pub iterations: usize,
    pub converged: bool,
    /// Some fitted probabilities were numerically 0 or 1
    pub separation: bool,
    pub conf_level: f64,
    /// Fitted probabilities
    #[serde(skip)]
    pub fitted: Vec<f64>,
    #[serde(skip)]
    pub linear_predictor: Vec<f64>,
    #[serde(skip)]
    pub row_index: Vec<usize>,
}

fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

fn clamp_probability(mu: f64) -> f64 {
    mu.clamp(f64::EPSILON, 1.0 - f64::EPSILON)
}

/// Binomial deviance `-2 Σ w [y ln μ + (1 - y) ln(1 - μ)]`, with the
/// saturated-model terms removed for fractional `y`.
fn deviance(y: &[f64], mu: &[f64], weights: &[f64]) -> f64 {
    let ylogy = |a: f64, b: f64| if a > 0.0 { a * (a / b).ln() } else { 0.0 };
    2.0 * y
        .iter()
        .zip(mu)
        .zip(weights)
        .map(|((yi, mi), wi)| {
            let m = clamp_probability(*mi);
            wi * (ylogy(*yi, m) + ylogy(1.0 - yi, 1.0 - m))
        })
        .sum::<f64>()
}

/// Inverse information matrix at the final estimate, falling back to
/// `last` (from the final IRLS step) when it is singular.
fn final_bread(
    x_mat: &DMatrix<f64>,
    mu: &[f64],
    prior: &[f64],
    names: &[String],
    last: DMatrix<f64>,
) -> DMatrix<f64> {
    let weights: Vec<f64> = mu
        .iter()
        .zip(prior)
        .map(|(m, w)| {
            let m = clamp_probability(*m);
            w * m * (1.0 - m)
        })
        .collect();
    let (xtwx, _) = weighted_cross_products(x_mat, &weights, &vec![0.0; mu.len()]);
    match invert_cross_product(&xtwx, names) {
        Ok(bread) => bread,
        Err(e) => {
            warn!(
                "Information matrix singular at the final estimate ({}); keeping the last IRLS step",
                e
            );
            last
        }
    }
}

/// Fit `P(y = 1) = logistic(X b)` by IRLS.
///
/// `y` must lie in `[0, 1]`; `x` is row-major with one column per name.
pub fn fit_logit(
    y: &[f64],
    x: &[f64],
    names: &[String],
    weights: Option<&[f64]>,
    conf_level: f64,
) -> Result<LogitModel> {
    let n = y.len();
    let p = names.len();
    if p == 0 || x.len() != n * p {
        return Err(CausalError::Internal(format!(
            "design has {} values for {} rows and {} columns",
            x.len(),
            n,
            p
        )));
    }
    if y.iter().any(|v| !(0.0..=1.0).contains(v)) {
        return Err(CausalError::InvalidConfig(
            "logistic response must be coded 0/1".to_string(),
        ));
    }

    let prior: Vec<f64> = match weights {
        Some(w) if w.len() == n => w.to_vec(),
        Some(_) => return Err(CausalError::Internal("weights length mismatch".to_string())),
        None => vec![1.0; n],
    };
    let n_obs = prior.iter().filter(|w| **w > 0.0).count();
    if n_obs <= p {
        return Err(CausalError::InsufficientData(format!(
            "{} observations for {} parameters",
            n_obs, p
        )));
    }

    let x_mat = DMatrix::from_row_slice(n, p, x);

    // Starting values as in R's binomial family: mu = (w y + 0.5) / (w + 1)
    let mut mu: Vec<f64> = y
        .iter()
        .zip(&prior)
        .map(|(yi, wi)| (wi * yi + 0.5) / (wi + 1.0))
        .collect();
    let mut eta: Vec<f64> = mu.iter().map(|m| (m / (1.0 - m)).ln()).collect();
    let mut dev_old = deviance(y, &mu, &prior);
    let mut dev = dev_old;

    let mut converged = false;
    let mut iterations = 0;
    let mut bread = DMatrix::zeros(p, p);
    let mut beta = vec![0.0; p];

    for iter in 1..=MAX_ITERATIONS {
        iterations = iter;

        let mut working_weights = Vec::with_capacity(n);
        let mut z = Vec::with_capacity(n);
        for i in 0..n {
            let m = clamp_probability(mu[i]);
            let var = m * (1.0 - m);
            z.push(eta[i] + (y[i] - m) / var);
            working_weights.push(prior[i] * var);
        }

        let (xtwx, xtwz) = weighted_cross_products(&x_mat, &working_weights, &z);
        bread = invert_cross_product(&xtwx, names)?;
        let b = &bread * xtwz;
        beta = b.iter().copied().collect();

        eta = (&x_mat * &b).iter().copied().collect();
        mu = eta.iter().map(|e| sigmoid(*e)).collect();
        dev = deviance(y, &mu, &prior);

        if !dev.is_finite() {
            return Err(CausalError::ModelFailed(
                "deviance became non-finite during IRLS".to_string(),
            ));
        }

        debug!("IRLS iteration {}: deviance = {:.6}", iter, dev);

        if (dev - dev_old).abs() / (dev.abs() + 0.1) < TOLERANCE {
            converged = true;
            break;
        }
        dev_old = dev;
    }

    if !converged {
        warn!("IRLS did not converge in {} iterations", MAX_ITERATIONS);
    }

    let bread = final_bread(&x_mat, &mu, &prior, names, bread);

    let separation = mu
        .iter()
        .zip(&prior)
        .any(|(m, w)| *w > 0.0 && (*m < SEPARATION_EPS || *m > 1.0 - SEPARATION_EPS));
    if separation {
        warn!("Fitted probabilities numerically 0 or 1 occurred");
    }

    let has_intercept = names.iter().any(|name| name == crate::models::design::INTERCEPT);
    let null_mu = if has_intercept {
        let sum_w: f64 = prior.iter().sum();
        y.iter().zip(&prior).map(|(v, w)| v * w).sum::<f64>() / sum_w
    } else {
        0.5
    };
    let null_deviance = deviance(y, &vec![null_mu; n], &prior);

    let q = normal_quantile(1.0 - (1.0 - conf_level) / 2.0);
    let coefficients = names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let estimate = beta[j];
            let std_error = bread[(j, j)].max(0.0).sqrt();
            let statistic = estimate / std_error;
            Coefficient {
                term: name.clone(),
                estimate,
                std_error,
                statistic,
                p_value: normal_p_value(statistic, Alternative::TwoSided),
                conf_low: estimate - q * std_error,
                conf_high: estimate + q * std_error,
            }
        })
        .collect();

    Ok(LogitModel {
        formula: String::new(),
        coefficients,
        n_obs,
        dropped_rows: 0,
        deviance: dev,
        null_deviance,
        df_residual: (n_obs - p) as f64,
        df_null: (n_obs - usize::from(has_intercept)) as f64,
        aic: dev + 2.0 * p as f64,
        iterations,
        converged,
        separation,
        conf_level,
        fitted: mu,
        linear_predictor: eta,
        row_index: (0..n).collect(),
    })
}

/// Fit a logistic regression from a formula.
pub fn glm_logit(
    df: &DataFrame,
    formula: &str,
    weights: Option<&str>,
    conf_level: f64,
) -> Result<LogitModel> {
    let parsed = Formula::parse(formula)?;
    if parsed.response.is_none() {
        return Err(CausalError::InvalidFormula {
            formula: formula.to_string(),
            reason: "a response is required".to_string(),
        });
    }

    let extra: Vec<&str> = weights.into_iter().collect();
    let design = DesignMatrix::build(df, &parsed, &extra)?;
    let prior = match weights {
        Some(column) => Some(numeric_at(df, column, &design.row_index)?),
        None => None,
    };

    let y: Vec<f64> = design.response()?.iter().copied().collect();
    let mut model = fit_logit(&y, &design.x, &design.names, prior.as_deref(), conf_level)?;
    model.formula = parsed.to_string();
    model.dropped_rows = design.dropped_rows;
    model.row_index = design.row_index;
    Ok(model)
}

impl LogitModel {
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.term == name)
    }

    /// Predicted probabilities for design rows in the model's column order.
    pub fn predict_proba(&self, rows: &[Vec<f64>]) -> Vec<f64> {
        rows.iter()
            .map(|row| {
                let eta: f64 = row
                    .iter()
                    .zip(&self.coefficients)
                    .map(|(x, c)| x * c.estimate)
                    .sum();
                sigmoid(eta)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_bread_keeps_last_step_when_singular() {
        let names = vec!["a".to_string(), "b".to_string()];
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 0.0, 1.0, 0.0]);
        let last = DMatrix::from_element(2, 2, 7.0);

        let bread = final_bread(&x, &[0.5; 3], &[1.0; 3], &names, last.clone());
        assert_eq!(bread, last);
    }

    #[test]
    fn test_final_bread_inverts_information() {
        let names = vec!["a".to_string()];
        let x = DMatrix::from_row_slice(4, 1, &[1.0, 1.0, 1.0, 1.0]);

        // information = Σ w μ(1 - μ) = 4 * 0.25
        let bread = final_bread(&x, &[0.5; 4], &[1.0; 4], &names, DMatrix::zeros(1, 1));
        assert!((bread[(0, 0)] - 1.0).abs() < 1e-12);
    }

    fn admissions() -> DataFrame {
        df!(
            "admit" => &[0.0f64, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0],
            "score" => &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 4.5, 3.5]
        )
        .unwrap()
    }

    #[test]
    fn test_logit_converges_with_positive_slope() {
        let model = glm_logit(&admissions(), "admit ~ score", None, 0.95).unwrap();
        assert!(model.converged);
        assert!(!model.separation);
        assert!(model.iterations < MAX_ITERATIONS);
        assert!(model.coefficient("score").unwrap().estimate > 0.0);
        assert!(model.deviance < model.null_deviance);
        assert_eq!(model.df_null, 11.0);
        assert_eq!(model.df_residual, 10.0);
        assert!((model.aic - (model.deviance + 4.0)).abs() < 1e-12);
    }

    #[test]
    fn test_score_equations_hold_at_optimum() {
        let model = glm_logit(&admissions(), "admit ~ score", None, 0.95).unwrap();
        let df = admissions();
        let y = numeric_at(&df, "admit", &model.row_index).unwrap();
        let x = numeric_at(&df, "score", &model.row_index).unwrap();
        let residual_sum: f64 = y.iter().zip(&model.fitted).map(|(a, b)| a - b).sum();
        let weighted_sum: f64 = y
            .iter()
            .zip(&model.fitted)
            .zip(&x)
            .map(|((a, b), xi)| (a - b) * xi)
            .sum();
        assert!(residual_sum.abs() < 1e-5);
        assert!(weighted_sum.abs() < 1e-5);
    }

    #[test]
    fn test_intercept_only_matches_mean() {
        let model = glm_logit(&admissions(), "admit ~ 1", None, 0.95).unwrap();
        let p: f64 = 6.0 / 12.0;
        let b0 = model.coefficient("(Intercept)").unwrap().estimate;
        assert!((b0 - (p / (1.0 - p)).ln()).abs() < 1e-8);
        assert!((model.deviance - model.null_deviance).abs() < 1e-8);
    }

    #[test]
    fn test_separation_flagged() {
        let df = df!(
            "y" => &[0.0f64, 0.0, 0.0, 1.0, 1.0, 1.0],
            "x" => &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]
        )
        .unwrap();
        match glm_logit(&df, "y ~ x", None, 0.95) {
            Ok(model) => assert!(model.separation || !model.converged),
            Err(err) => assert_eq!(err.error_code(), "SINGULAR_MATRIX"),
        }
    }

    #[test]
    fn test_non_binary_response_rejected() {
        let df = df!(
            "y" => &[0.0f64, 2.0, 1.0, 0.0],
            "x" => &[1.0f64, 2.0, 3.0, 4.0]
        )
        .unwrap();
        let err = glm_logit(&df, "y ~ x", None, 0.95).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_predict_proba_matches_fitted() {
        let model = glm_logit(&admissions(), "admit ~ score", None, 0.95).unwrap();
        let pred = model.predict_proba(&[vec![1.0, 1.0]]);
        assert!((pred[0] - model.fitted[0]).abs() < 1e-12);
    }
}
