//! Ordinary and weighted least squares.

use nalgebra::{DMatrix, DVector};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::{Alternative, CovarianceType};
use crate::error::{CausalError, Result};
use crate::models::covariance::{self, VcovKind};
use crate::models::design::{DesignMatrix, INTERCEPT, labels_at, numeric_at};
use crate::models::formula::Formula;
use crate::stats::inference::{f_upper_tail, t_p_value, t_quantile};

/// One row of a coefficient table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coefficient {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    /// t statistic for linear models, z statistic for logistic models
    pub statistic: f64,
    pub p_value: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

/// Overall F test of the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FTest {
    pub statistic: f64,
    pub df_model: f64,
    pub df_residual: f64,
    pub p_value: f64,
}

/// Fixed effects swept out by within-demeaning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AbsorbedEffect {
    pub column: String,
    pub levels: usize,
}

/// A fitted linear model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub formula: String,
    pub coefficients: Vec<Coefficient>,
    pub covariance: VcovKind,
    pub n_obs: usize,
    pub dropped_rows: usize,
    pub df_residual: f64,
    /// Residual standard error
    pub sigma: f64,
    /// Within R² when fixed effects are absorbed
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub f_test: Option<FTest>,
    pub weighted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_clusters: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absorbed: Option<AbsorbedEffect>,
    pub conf_level: f64,
    /// Row-major `p x p` coefficient covariance
    #[serde(skip)]
    pub vcov: Vec<f64>,
    #[serde(skip)]
    pub fitted: Vec<f64>,
    #[serde(skip)]
    pub residuals: Vec<f64>,
    /// Source-frame row of every observation used
    #[serde(skip)]
    pub row_index: Vec<usize>,
}

/// Knobs for [`fit_ols`].
#[derive(Debug, Clone, Copy)]
pub struct OlsOptions<'a> {
    pub weights: Option<&'a [f64]>,
    pub covariance: CovarianceType,
    pub clusters: Option<&'a [u64]>,
    pub intercept: bool,
    /// Fixed-effect levels already swept out of `y` and `x`
    pub absorbed_levels: usize,
    pub conf_level: f64,
}

impl Default for OlsOptions<'_> {
    fn default() -> Self {
        Self {
            weights: None,
            covariance: CovarianceType::Classical,
            clusters: None,
            intercept: true,
            absorbed_levels: 0,
            conf_level: 0.95,
        }
    }
}

/// Options for [`lm`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmOptions {
    /// Column of non-negative observation weights
    pub weights: Option<String>,
    pub covariance: CovarianceType,
    /// Column whose labels define clusters
    pub cluster: Option<String>,
    /// Categorical column whose fixed effects are absorbed
    pub absorb: Option<String>,
    pub conf_level: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            weights: None,
            covariance: CovarianceType::Classical,
            cluster: None,
            absorb: None,
            conf_level: 0.95,
        }
    }
}

/// Fit `y = X b` by (weighted) least squares.
///
/// `x` is row-major with one column per entry of `names`. Rows with zero
/// weight are excluded from the fit and from the residual df.
pub fn fit_ols(y: &[f64], x: &[f64], names: &[String], options: &OlsOptions<'_>) -> Result<LinearModel> {
    let p = names.len();
    if p == 0 || x.len() != y.len() * p {
        return Err(CausalError::Internal(format!(
            "design has {} values for {} rows and {} columns",
            x.len(),
            y.len(),
            p
        )));
    }

    let weights: Vec<f64> = match options.weights {
        Some(w) => {
            if w.len() != y.len() {
                return Err(CausalError::Internal("weights length mismatch".to_string()));
            }
            if w.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(CausalError::InvalidConfig(
                    "weights must be finite and non-negative".to_string(),
                ));
            }
            w.to_vec()
        }
        None => vec![1.0; y.len()],
    };

    let n = weights.iter().filter(|w| **w > 0.0).count();
    let df_residual = n as f64 - p as f64 - options.absorbed_levels as f64;
    if df_residual < 1.0 {
        return Err(CausalError::InsufficientData(format!(
            "{} observations for {} parameters",
            n,
            p + options.absorbed_levels
        )));
    }

    let x_mat = DMatrix::from_row_slice(y.len(), p, x);
    let (xtx, xty) = covariance::weighted_cross_products(&x_mat, &weights, y);
    let bread = covariance::invert_cross_product(&xtx, names)?;
    let beta: DVector<f64> = &bread * xty;

    let fitted: Vec<f64> = (&x_mat * &beta).iter().copied().collect();
    let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(yi, fi)| yi - fi).collect();
    let rss: f64 = residuals
        .iter()
        .zip(&weights)
        .map(|(e, w)| w * e * e)
        .sum();
    let sigma2 = rss / df_residual;

    let (vcov, kind, n_clusters) = match options.clusters {
        Some(ids) => {
            let (v, g) =
                covariance::cluster_robust(&x_mat, &residuals, &weights, &bread, ids, p)?;
            (v, VcovKind::Cluster, Some(g))
        }
        None => match options.covariance {
            CovarianceType::Classical => {
                (covariance::classical(&bread, sigma2), VcovKind::Classical, None)
            }
            CovarianceType::Hc0 => (
                covariance::hc0(&x_mat, &residuals, &weights, &bread),
                VcovKind::Hc0,
                None,
            ),
            CovarianceType::Hc1 => (
                covariance::hc1(&x_mat, &residuals, &weights, &bread, df_residual),
                VcovKind::Hc1,
                None,
            ),
        },
    };

    // Total sum of squares: centered when the model has a constant.
    let centered = options.intercept;
    let sum_w: f64 = weights.iter().sum();
    let y_bar = if centered {
        y.iter().zip(&weights).map(|(v, w)| v * w).sum::<f64>() / sum_w
    } else {
        0.0
    };
    let tss: f64 = y
        .iter()
        .zip(&weights)
        .map(|(v, w)| w * (v - y_bar).powi(2))
        .sum();

    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };
    let has_constant = options.intercept || options.absorbed_levels > 0;
    let constant_df = if has_constant { 1.0 } else { 0.0 };
    let adj_r_squared = 1.0 - (1.0 - r_squared) * (n as f64 - constant_df) / df_residual;

    let df_model = p as f64 - if options.intercept { 1.0 } else { 0.0 };
    let f_test = if df_model > 0.0 && rss > 0.0 {
        let statistic = ((tss - rss) / df_model) / (rss / df_residual);
        Some(FTest {
            statistic,
            df_model,
            df_residual,
            p_value: f_upper_tail(statistic, df_model, df_residual),
        })
    } else {
        None
    };

    let df_t = match n_clusters {
        Some(g) => g as f64 - 1.0,
        None => df_residual,
    };
    let q = t_quantile(1.0 - (1.0 - options.conf_level) / 2.0, df_t);
    let coefficients = names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let estimate = beta[j];
            let std_error = vcov[(j, j)].max(0.0).sqrt();
            let statistic = estimate / std_error;
            Coefficient {
                term: name.clone(),
                estimate,
                std_error,
                statistic,
                p_value: t_p_value(statistic, df_t, Alternative::TwoSided),
                conf_low: estimate - q * std_error,
                conf_high: estimate + q * std_error,
            }
        })
        .collect();

    let mut vcov_flat = Vec::with_capacity(p * p);
    for a in 0..p {
        for b in 0..p {
            vcov_flat.push(vcov[(a, b)]);
        }
    }

    Ok(LinearModel {
        formula: String::new(),
        coefficients,
        covariance: kind,
        n_obs: n,
        dropped_rows: 0,
        df_residual,
        sigma: sigma2.sqrt(),
        r_squared,
        adj_r_squared,
        f_test,
        weighted: options.weights.is_some(),
        n_clusters,
        absorbed: None,
        conf_level: options.conf_level,
        vcov: vcov_flat,
        fitted,
        residuals,
        row_index: (0..y.len()).collect(),
    })
}

/// Weighted within-group demeaning of `y` and every column of `x`.
fn demean_within(y: &mut [f64], x: &mut [f64], p: usize, weights: &[f64], groups: &[u64]) {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, g) in groups.iter().enumerate() {
        index.entry(*g).or_default().push(i);
    }

    for rows in index.values() {
        let sum_w: f64 = rows.iter().map(|&i| weights[i]).sum();
        if sum_w <= 0.0 {
            continue;
        }
        let y_mean = rows.iter().map(|&i| weights[i] * y[i]).sum::<f64>() / sum_w;
        let x_mean: Vec<f64> = (0..p)
            .map(|j| rows.iter().map(|&i| weights[i] * x[i * p + j]).sum::<f64>() / sum_w)
            .collect();
        for &i in rows {
            y[i] -= y_mean;
            for j in 0..p {
                x[i * p + j] -= x_mean[j];
            }
        }
    }
}

/// Fit a linear model from a formula.
pub fn lm(df: &DataFrame, formula: &str, options: &LmOptions) -> Result<LinearModel> {
    let parsed = Formula::parse(formula)?;
    if parsed.response.is_none() {
        return Err(CausalError::InvalidFormula {
            formula: formula.to_string(),
            reason: "a response is required".to_string(),
        });
    }

    let extra: Vec<&str> = [&options.weights, &options.cluster, &options.absorb]
        .into_iter()
        .filter_map(|c| c.as_deref())
        .collect();
    let mut design = DesignMatrix::build(df, &parsed, &extra)?;

    let mut weights = match &options.weights {
        Some(column) => Some(numeric_at(df, column, &design.row_index)?),
        None => None,
    };
    if let Some(w) = &weights {
        if w.iter().any(|v| *v < 0.0) {
            return Err(CausalError::InvalidConfig(format!(
                "weights column '{}' has negative values",
                options.weights.as_deref().unwrap_or_default()
            )));
        }
        let keep: Vec<bool> = w.iter().map(|v| *v > 0.0).collect();
        if keep.iter().any(|k| !k) {
            design.retain_rows(&keep);
            weights = Some(w.iter().copied().filter(|v| *v > 0.0).collect());
        }
    }

    let mut absorbed = None;
    let mut absorbed_levels = 0;
    let y_original = design.response()?.iter().copied().collect::<Vec<f64>>();
    let mut y = y_original.clone();

    if let Some(column) = &options.absorb {
        design.drop_column(INTERCEPT);
        if design.p == 0 {
            return Err(CausalError::InvalidFormula {
                formula: formula.to_string(),
                reason: format!("no regressors remain after absorbing '{}'", column),
            });
        }
        let groups = covariance::cluster_ids(&labels_at(df, column, &design.row_index)?);
        absorbed_levels = groups.iter().copied().max().map(|m| m as usize + 1).unwrap_or(0);
        let unit = vec![1.0; design.n];
        let w = weights.as_deref().unwrap_or(&unit[..]);
        demean_within(&mut y, &mut design.x, design.p, w, &groups);
        absorbed = Some(AbsorbedEffect {
            column: column.clone(),
            levels: absorbed_levels,
        });
        info!("Absorbed {} levels of '{}'", absorbed_levels, column);
    }

    let clusters = match &options.cluster {
        Some(column) => Some(covariance::cluster_ids(&labels_at(df, column, &design.row_index)?)),
        None => None,
    };

    let fit_options = OlsOptions {
        weights: weights.as_deref(),
        covariance: options.covariance,
        clusters: clusters.as_deref(),
        intercept: design.intercept,
        absorbed_levels,
        conf_level: options.conf_level,
    };
    let mut model = fit_ols(&y, &design.x, &design.names, &fit_options)?;

    if absorbed.is_some() {
        model.fitted = y_original
            .iter()
            .zip(&model.residuals)
            .map(|(v, e)| v - e)
            .collect();
    }
    model.formula = parsed.to_string();
    model.dropped_rows = design.dropped_rows;
    model.row_index = design.row_index;
    model.absorbed = absorbed;

    debug!(
        "lm '{}': n = {}, R² = {:.4}, covariance = {}",
        model.formula, model.n_obs, model.r_squared, model.covariance
    );
    Ok(model)
}

impl LinearModel {
    /// Coefficient row by term name.
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.term == name)
    }

    /// Term names in column order.
    pub fn terms(&self) -> Vec<&str> {
        self.coefficients.iter().map(|c| c.term.as_str()).collect()
    }

    /// Linear predictions for row-major design rows in the model's column order.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<f64>> {
        let p = self.coefficients.len();
        rows.iter()
            .map(|row| {
                if row.len() != p {
                    return Err(CausalError::InvalidConfig(format!(
                        "prediction row has {} values, model has {} coefficients",
                        row.len(),
                        p
                    )));
                }
                Ok(row
                    .iter()
                    .zip(&self.coefficients)
                    .map(|(x, c)| x * c.estimate)
                    .sum())
            })
            .collect()
    }

    /// Covariance between two coefficients by position.
    pub fn vcov_entry(&self, a: usize, b: usize) -> f64 {
        let p = self.coefficients.len();
        self.vcov.get(a * p + b).copied().unwrap_or(f64::NAN)
    }

    /// Standard error of a linear combination `Σ c_j b_j`.
    pub fn combination_std_error(&self, weights: &[f64]) -> f64 {
        let mut var = 0.0;
        for (a, wa) in weights.iter().enumerate() {
            for (b, wb) in weights.iter().enumerate() {
                var += wa * wb * self.vcov_entry(a, b);
            }
        }
        var.max(0.0).sqrt()
    }
}
