//! Coefficient covariance estimators for (weighted) least squares.
//!
//! All estimators share the bread `(X'WX)^{-1}`; the robust ones differ
//! in the meat of the sandwich.
//!
//! - Classical: `sigma² (X'WX)^{-1}`
//! - HC0: `B Σ_i (w_i e_i)² x_i x_i' B`
//! - HC1: HC0 scaled by `n / (n - k)`
//! - Cluster (Liang–Zeger): `B Σ_g s_g s_g' B` with `s_g = Σ_{i∈g} w_i e_i x_i`,
//!   scaled by `G/(G-1) · (N-1)/(N-K)`

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::CovarianceType;
use crate::error::{CausalError, Result};

/// Covariance estimator that produced a set of standard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcovKind {
    Classical,
    Hc0,
    Hc1,
    Cluster,
}

impl From<CovarianceType> for VcovKind {
    fn from(value: CovarianceType) -> Self {
        match value {
            CovarianceType::Classical => Self::Classical,
            CovarianceType::Hc0 => Self::Hc0,
            CovarianceType::Hc1 => Self::Hc1,
        }
    }
}

impl fmt::Display for VcovKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classical => write!(f, "classical"),
            Self::Hc0 => write!(f, "HC0"),
            Self::Hc1 => write!(f, "HC1"),
            Self::Cluster => write!(f, "cluster-robust (CR1)"),
        }
    }
}

/// `X'WX` and `X'Wz` for row-major `x`.
pub fn weighted_cross_products(
    x: &DMatrix<f64>,
    weights: &[f64],
    z: &[f64],
) -> (DMatrix<f64>, DVector<f64>) {
    let (n, p) = (x.nrows(), x.ncols());
    let mut xtx = DMatrix::zeros(p, p);
    let mut xtz = DVector::zeros(p);

    for i in 0..n {
        let w = weights[i];
        if w == 0.0 {
            continue;
        }
        for a in 0..p {
            let xa = x[(i, a)] * w;
            if xa == 0.0 {
                continue;
            }
            xtz[a] += xa * z[i];
            for b in a..p {
                xtx[(a, b)] += xa * x[(i, b)];
            }
        }
    }
    for a in 0..p {
        for b in 0..a {
            xtx[(a, b)] = xtx[(b, a)];
        }
    }
    (xtx, xtz)
}

/// Invert a cross-product matrix, rejecting rank-deficient designs.
///
/// Rank is judged on the unit-diagonal rescaling of `xtx` so that
/// columns on very different scales do not trip the check.
pub fn invert_cross_product(xtx: &DMatrix<f64>, names: &[String]) -> Result<DMatrix<f64>> {
    let p = xtx.nrows();
    let diag: Vec<f64> = (0..p).map(|j| xtx[(j, j)]).collect();

    if let Some(j) = diag.iter().position(|d| !(*d > 0.0)) {
        return Err(CausalError::SingularMatrix(format!(
            "column '{}' is identically zero",
            names.get(j).map(String::as_str).unwrap_or("?")
        )));
    }

    let scale: Vec<f64> = diag.iter().map(|d| 1.0 / d.sqrt()).collect();
    let scaled = DMatrix::from_fn(p, p, |a, b| xtx[(a, b)] * scale[a] * scale[b]);
    let singular = scaled.clone().singular_values();
    let max_sv = singular.iter().copied().fold(0.0_f64, f64::max);
    let min_sv = singular.iter().copied().fold(f64::INFINITY, f64::min);

    if !(min_sv > max_sv * 1e-12) {
        return Err(CausalError::SingularMatrix(format!(
            "design columns are collinear ({} columns: {})",
            p,
            names.join(", ")
        )));
    }

    let inv = scaled
        .try_inverse()
        .ok_or_else(|| CausalError::SingularMatrix("X'WX is not invertible".to_string()))?;
    Ok(DMatrix::from_fn(p, p, |a, b| inv[(a, b)] * scale[a] * scale[b]))
}

/// `sigma² · bread`.
pub fn classical(bread: &DMatrix<f64>, sigma2: f64) -> DMatrix<f64> {
    bread * sigma2
}

/// Heteroskedasticity-consistent sandwich (HC0).
pub fn hc0(
    x: &DMatrix<f64>,
    residuals: &[f64],
    weights: &[f64],
    bread: &DMatrix<f64>,
) -> DMatrix<f64> {
    let p = x.ncols();
    let mut meat = DMatrix::zeros(p, p);
    for i in 0..x.nrows() {
        let u = weights[i] * residuals[i];
        let u2 = u * u;
        if u2 == 0.0 {
            continue;
        }
        for a in 0..p {
            for b in a..p {
                meat[(a, b)] += u2 * x[(i, a)] * x[(i, b)];
            }
        }
    }
    symmetrize(&mut meat);
    bread * meat * bread
}

/// HC0 scaled by `n / df_residual`.
pub fn hc1(
    x: &DMatrix<f64>,
    residuals: &[f64],
    weights: &[f64],
    bread: &DMatrix<f64>,
    df_residual: f64,
) -> DMatrix<f64> {
    let n = weights.iter().filter(|w| **w > 0.0).count() as f64;
    hc0(x, residuals, weights, bread) * (n / df_residual)
}

/// Liang–Zeger cluster-robust covariance with the CR1 correction.
///
/// Returns the covariance and the number of clusters.
pub fn cluster_robust(
    x: &DMatrix<f64>,
    residuals: &[f64],
    weights: &[f64],
    bread: &DMatrix<f64>,
    cluster_ids: &[u64],
    k: usize,
) -> Result<(DMatrix<f64>, usize)> {
    let n = x.nrows();
    let p = x.ncols();
    if cluster_ids.len() != n {
        return Err(CausalError::Internal(format!(
            "cluster_ids length ({}) != n ({})",
            cluster_ids.len(),
            n
        )));
    }

    let mut cluster_map: HashMap<u64, Vec<usize>> = HashMap::new();
    for (i, &cid) in cluster_ids.iter().enumerate() {
        cluster_map.entry(cid).or_default().push(i);
    }
    let g = cluster_map.len();
    if g < 2 {
        return Err(CausalError::InsufficientData(
            "cluster-robust covariance needs at least 2 clusters".to_string(),
        ));
    }

    let mut meat = DMatrix::zeros(p, p);
    for indices in cluster_map.values() {
        let mut s_g = vec![0.0_f64; p];
        for &i in indices {
            let u = weights[i] * residuals[i];
            for (j, s) in s_g.iter_mut().enumerate() {
                *s += x[(i, j)] * u;
            }
        }
        for a in 0..p {
            for b in 0..p {
                meat[(a, b)] += s_g[a] * s_g[b];
            }
        }
    }

    let gf = g as f64;
    let nf = n as f64;
    let kf = k as f64;
    let correction = if nf > kf {
        (gf / (gf - 1.0)) * ((nf - 1.0) / (nf - kf))
    } else {
        gf / (gf - 1.0)
    };

    Ok((bread * meat * bread * correction, g))
}

/// Map arbitrary labels onto dense cluster ids.
pub fn cluster_ids<S: AsRef<str>>(labels: &[S]) -> Vec<u64> {
    let mut ids: HashMap<&str, u64> = HashMap::new();
    labels
        .iter()
        .map(|label| {
            let next = ids.len() as u64;
            *ids.entry(label.as_ref()).or_insert(next)
        })
        .collect()
}

fn symmetrize(m: &mut DMatrix<f64>) {
    let p = m.nrows();
    for a in 0..p {
        for b in 0..a {
            m[(a, b)] = m[(b, a)];
        }
    }
}
