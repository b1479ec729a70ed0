//! Local linear regression-discontinuity estimates.

use nalgebra::{DMatrix, DVector};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::{Alternative, CovarianceType, Kernel, RddConfig};
use crate::data::columns::numeric_values;
use crate::error::{CausalError, Result};
use crate::models::covariance::{self, invert_cross_product, weighted_cross_products};
use crate::models::design::INTERCEPT;
use crate::models::ols::{Coefficient, OlsOptions, fit_ols};
use crate::rdd::bandwidth::{IkBandwidth, ik_bandwidth_details};
use crate::rdd::kernel::kernel_weights;
use crate::stats::inference::{normal_p_value, normal_quantile};

/// Fewest observations required on each side of the cutpoint.
pub const MIN_SIDE_OBS: usize = 3;

/// Name of the above-cutpoint indicator in local regressions.
pub const JUMP_TERM: &str = "D";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RdDesign {
    Sharp,
    Fuzzy,
}

/// How the bandwidth was obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum BandwidthChoice {
    Fixed { bandwidth: f64 },
    ImbensKalyanaraman(IkBandwidth),
}

impl BandwidthChoice {
    pub fn bandwidth(&self) -> f64 {
        match self {
            Self::Fixed { bandwidth } => *bandwidth,
            Self::ImbensKalyanaraman(ik) => ik.bandwidth,
        }
    }
}

/// A z-based estimate with its confidence interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZEstimate {
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub p_value: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

impl ZEstimate {
    fn new(estimate: f64, std_error: f64, conf_level: f64) -> Self {
        let statistic = estimate / std_error;
        let q = normal_quantile(1.0 - (1.0 - conf_level) / 2.0);
        Self {
            estimate,
            std_error,
            statistic,
            p_value: normal_p_value(statistic, Alternative::TwoSided),
            conf_low: estimate - q * std_error,
            conf_high: estimate + q * std_error,
        }
    }

    fn from_coefficient(coef: &Coefficient, conf_level: f64) -> Self {
        Self::new(coef.estimate, coef.std_error, conf_level)
    }
}

/// Local linear fit of the outcome on each side, covariates held at zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LocalFit {
    pub left_intercept: f64,
    pub left_slope: f64,
    pub right_intercept: f64,
    pub right_slope: f64,
}

/// Discontinuity estimate at one bandwidth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdEstimate {
    pub design: RdDesign,
    pub cutpoint: f64,
    pub bandwidth: f64,
    pub multiplier: f64,
    pub kernel: Kernel,
    /// Jump in the outcome (sharp) or the local Wald estimate (fuzzy)
    pub effect: ZEstimate,
    /// Jump in treatment take-up, fuzzy designs only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_stage: Option<ZEstimate>,
    pub n_left: usize,
    pub n_right: usize,
    pub fit: LocalFit,
}

/// Estimates at every configured bandwidth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdAnalysis {
    pub running: String,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treatment: Option<String>,
    pub covariates: Vec<String>,
    pub design: RdDesign,
    pub cutpoint: f64,
    pub kernel: Kernel,
    pub bandwidth: BandwidthChoice,
    pub n_obs: usize,
    pub dropped_rows: usize,
    pub estimates: Vec<RdEstimate>,
}

impl RdAnalysis {
    /// Estimate at the selected bandwidth.
    pub fn primary(&self) -> Option<&RdEstimate> {
        self.estimates
            .iter()
            .find(|e| e.multiplier == 1.0)
            .or_else(|| self.estimates.first())
    }
}

/// Observations of a discontinuity design.
#[derive(Debug, Clone, Default)]
pub struct RdData {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Treatment take-up for fuzzy designs
    pub treatment: Option<Vec<f64>>,
    /// Row-major covariates, `covariate_names.len()` per observation
    pub covariates: Vec<f64>,
    pub covariate_names: Vec<String>,
}

struct LocalDesign {
    names: Vec<String>,
    x: Vec<f64>,
    y: Vec<f64>,
    z: Option<Vec<f64>>,
    weights: Vec<f64>,
    n_left: usize,
    n_right: usize,
}

fn local_design(data: &RdData, cutpoint: f64, h: f64, kernel: Kernel) -> Result<LocalDesign> {
    let k = data.covariate_names.len();
    let weights = kernel_weights(&data.x, cutpoint, h, kernel);

    let mut names = vec![
        INTERCEPT.to_string(),
        JUMP_TERM.to_string(),
        "xc".to_string(),
        format!("{}:xc", JUMP_TERM),
    ];
    names.extend(data.covariate_names.iter().cloned());

    let mut design = LocalDesign {
        names,
        x: Vec::new(),
        y: Vec::new(),
        z: data.treatment.as_ref().map(|_| Vec::new()),
        weights: Vec::new(),
        n_left: 0,
        n_right: 0,
    };

    for (i, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        let xc = data.x[i] - cutpoint;
        let d = if xc >= 0.0 { 1.0 } else { 0.0 };
        if d > 0.0 {
            design.n_right += 1;
        } else {
            design.n_left += 1;
        }
        design.x.extend([1.0, d, xc, d * xc]);
        design.x.extend_from_slice(&data.covariates[i * k..(i + 1) * k]);
        design.y.push(data.y[i]);
        if let (Some(z), Some(t)) = (design.z.as_mut(), data.treatment.as_ref()) {
            z.push(t[i]);
        }
        design.weights.push(*w);
    }

    if design.n_left < MIN_SIDE_OBS || design.n_right < MIN_SIDE_OBS {
        return Err(CausalError::InsufficientData(format!(
            "{} observations below and {} above the cutpoint within bandwidth {:.4}; need {} on each side",
            design.n_left, design.n_right, h, MIN_SIDE_OBS
        )));
    }
    Ok(design)
}

fn local_fit(coefficients: &[Coefficient]) -> LocalFit {
    let b = |j: usize| coefficients.get(j).map_or(f64::NAN, |c| c.estimate);
    LocalFit {
        left_intercept: b(0),
        left_slope: b(2),
        right_intercept: b(0) + b(1),
        right_slope: b(2) + b(3),
    }
}

/// Two-stage least squares of `y` on the design with treatment take-up in
/// place of the jump indicator, which becomes the excluded instrument.
/// Returns the coefficient on take-up and its HC1 standard error.
fn two_stage(design: &LocalDesign, z: &[f64], z_hat: &[f64]) -> Result<(f64, f64)> {
    let n = design.y.len();
    let p = design.names.len();
    let mut names = design.names.clone();
    names[1] = "treatment".to_string();

    let mut structural = design.x.clone();
    let mut projected = design.x.clone();
    for i in 0..n {
        structural[i * p + 1] = z[i];
        projected[i * p + 1] = z_hat[i];
    }
    let structural = DMatrix::from_row_slice(n, p, &structural);
    let projected = DMatrix::from_row_slice(n, p, &projected);

    let (xtx, xty) = weighted_cross_products(&projected, &design.weights, &design.y);
    let bread = invert_cross_product(&xtx, &names)?;
    let beta: DVector<f64> = &bread * xty;

    // Residuals use observed take-up, not its projection.
    let residuals: Vec<f64> = (&structural * &beta)
        .iter()
        .zip(&design.y)
        .map(|(f, y)| y - f)
        .collect();
    let df_residual = n as f64 - p as f64;
    let vcov = covariance::hc1(&projected, &residuals, &design.weights, &bread, df_residual);
    Ok((beta[1], vcov[(1, 1)].max(0.0).sqrt()))
}

/// Discontinuity estimate at bandwidth `h`.
pub fn rd_estimate_at(
    data: &RdData,
    cutpoint: f64,
    h: f64,
    kernel: Kernel,
    conf_level: f64,
) -> Result<RdEstimate> {
    let design = local_design(data, cutpoint, h, kernel)?;
    let options = OlsOptions {
        weights: Some(&design.weights),
        covariance: CovarianceType::Hc1,
        conf_level,
        ..OlsOptions::default()
    };

    // Sharp jump, or the reduced form of a fuzzy design.
    let outcome = fit_ols(&design.y, &design.x, &design.names, &options)?;
    let fit = local_fit(&outcome.coefficients);
    let jump = ZEstimate::from_coefficient(&outcome.coefficients[1], conf_level);

    let (design_kind, effect, first_stage) = match &design.z {
        None => (RdDesign::Sharp, jump, None),
        Some(z) => {
            let first = fit_ols(z, &design.x, &design.names, &options)?;
            let take_up = ZEstimate::from_coefficient(&first.coefficients[1], conf_level);
            if take_up.estimate.abs() < 1e-8 {
                return Err(CausalError::ModelFailed(
                    "treatment take-up does not change at the cutpoint".to_string(),
                ));
            }
            let (wald, se) = two_stage(&design, z, &first.fitted)?;
            (RdDesign::Fuzzy, ZEstimate::new(wald, se, conf_level), Some(take_up))
        }
    };

    Ok(RdEstimate {
        design: design_kind,
        cutpoint,
        bandwidth: h,
        multiplier: 1.0,
        kernel,
        effect,
        first_stage,
        n_left: design.n_left,
        n_right: design.n_right,
        fit,
    })
}

/// Estimates at every multiple of the bandwidth in `config`.
///
/// The IK bandwidth is selected when `config.bandwidth` is `None`. A
/// failure at the selected bandwidth is an error; other multipliers that
/// leave too few observations are skipped.
pub fn rd_estimates(
    data: &RdData,
    config: &RddConfig,
    conf_level: f64,
) -> Result<(BandwidthChoice, Vec<RdEstimate>)> {
    let choice = match config.bandwidth {
        Some(h) if h > 0.0 => BandwidthChoice::Fixed { bandwidth: h },
        Some(h) => {
            return Err(CausalError::InvalidConfig(format!(
                "bandwidth must be positive, got {}",
                h
            )));
        }
        None => BandwidthChoice::ImbensKalyanaraman(ik_bandwidth_details(
            &data.x,
            &data.y,
            config.cutpoint,
            config.kernel,
        )?),
    };
    let h = choice.bandwidth();
    info!("Bandwidth {:.4} ({:?})", h, config.kernel);

    let multipliers = if config.bandwidth_multipliers.is_empty() {
        vec![1.0]
    } else {
        config.bandwidth_multipliers.clone()
    };

    let mut estimates = Vec::with_capacity(multipliers.len());
    for m in multipliers {
        match rd_estimate_at(data, config.cutpoint, h * m, config.kernel, conf_level) {
            Ok(mut estimate) => {
                estimate.multiplier = m;
                estimates.push(estimate);
            }
            Err(e) if m != 1.0 => warn!("Skipping bandwidth multiplier {}: {}", m, e),
            Err(e) => return Err(e),
        }
    }
    if estimates.is_empty() {
        return Err(CausalError::InsufficientData(
            "no bandwidth produced an estimate".to_string(),
        ));
    }
    Ok((choice, estimates))
}

/// Regression-discontinuity analysis of `outcome` on `running` in a frame.
///
/// A `treatment` column makes the design fuzzy. Covariates must be
/// numeric; rows with a missing value in any used column are dropped.
#[instrument(skip(df, covariates, config))]
pub fn rd_estimate(
    df: &DataFrame,
    running: &str,
    outcome: &str,
    treatment: Option<&str>,
    covariates: &[&str],
    config: &RddConfig,
    conf_level: f64,
) -> Result<RdAnalysis> {
    let x = numeric_values(df, running)?;
    let y = numeric_values(df, outcome)?;
    let t = treatment.map(|c| numeric_values(df, c)).transpose()?;
    let covs = covariates
        .iter()
        .map(|c| numeric_values(df, c))
        .collect::<Result<Vec<_>>>()?;

    let mut data = RdData {
        covariate_names: covariates.iter().map(|c| c.to_string()).collect(),
        treatment: t.as_ref().map(|_| Vec::new()),
        ..RdData::default()
    };
    let mut dropped_rows = 0;
    for i in 0..df.height() {
        let (Some(xi), Some(yi)) = (x[i], y[i]) else {
            dropped_rows += 1;
            continue;
        };
        let ti = t.as_ref().map(|t| t[i]);
        if matches!(ti, Some(None)) || covs.iter().any(|c| c[i].is_none()) {
            dropped_rows += 1;
            continue;
        }
        data.x.push(xi);
        data.y.push(yi);
        if let (Some(v), Some(Some(ti))) = (data.treatment.as_mut(), ti) {
            v.push(ti);
        }
        data.covariates.extend(covs.iter().filter_map(|c| c[i]));
    }
    if dropped_rows > 0 {
        warn!("Dropped {} rows with missing values", dropped_rows);
    }
    if data.x.is_empty() {
        return Err(CausalError::NoValidValues(running.to_string()));
    }

    let (bandwidth, estimates) = rd_estimates(&data, config, conf_level)?;
    let analysis = RdAnalysis {
        running: running.to_string(),
        outcome: outcome.to_string(),
        treatment: treatment.map(str::to_string),
        covariates: data.covariate_names.clone(),
        design: if treatment.is_some() {
            RdDesign::Fuzzy
        } else {
            RdDesign::Sharp
        },
        cutpoint: config.cutpoint,
        kernel: config.kernel,
        bandwidth,
        n_obs: data.x.len(),
        dropped_rows,
        estimates,
    };

    if let Some(primary) = analysis.primary() {
        info!(
            "Discontinuity in '{}' at {}: {:.4} (SE {:.4}, n = {} + {})",
            outcome,
            config.cutpoint,
            primary.effect.estimate,
            primary.effect.std_error,
            primary.n_left,
            primary.n_right
        );
    }
    Ok(analysis)
}
