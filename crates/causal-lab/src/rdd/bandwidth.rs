//! Imbens–Kalyanaraman plug-in bandwidth.
//!
//! Three steps:
//! 1. a pilot bandwidth `h1 = 1.84 sd(x) n^(-1/5)` gives the density of
//!    the running variable at the cutpoint and the pooled outcome variance
//!    on both sides;
//! 2. a global cubic between the side medians estimates the third
//!    derivative, which sets side-specific bandwidths for quadratic fits of
//!    the second derivative on each side;
//! 3. the optimal bandwidth combines those with regularization terms and a
//!    kernel constant.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::Kernel;
use crate::error::{CausalError, Result};
use crate::models::covariance::{invert_cross_product, weighted_cross_products};
use crate::stats::descriptive::{mean, median, std_dev};

/// Intermediate quantities of the bandwidth computation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IkBandwidth {
    pub bandwidth: f64,
    pub pilot: f64,
    /// Density of the running variable at the cutpoint
    pub density: f64,
    /// Pooled outcome variance within the pilot bandwidth
    pub var_y: f64,
    pub third_derivative: f64,
    pub h2_left: f64,
    pub h2_right: f64,
    pub second_derivative_left: f64,
    pub second_derivative_right: f64,
    pub regularization_left: f64,
    pub regularization_right: f64,
}

/// Least-squares coefficients of `y` on row-major `x` with `p` columns.
fn least_squares(x: &[f64], p: usize, y: &[f64]) -> Result<DVector<f64>> {
    let n = y.len();
    let names: Vec<String> = (0..p).map(|k| format!("x^{}", k)).collect();
    let x_mat = nalgebra::DMatrix::from_row_slice(n, p, x);
    let (xtx, xty) = weighted_cross_products(&x_mat, &vec![1.0; n], y);
    let bread = invert_cross_product(&xtx, &names)?;
    Ok(bread * xty)
}

fn insufficient(stage: &str, left: usize, right: usize) -> CausalError {
    CausalError::InsufficientData(format!(
        "{} observations below and {} above the cutpoint for the {}",
        left, right, stage
    ))
}

/// Observations of `(x - c, y)` with `lo <= x - c < hi` (or `<= hi` when
/// `closed`).
fn window(x: &[f64], y: &[f64], c: f64, lo: f64, hi: f64, closed: bool) -> (Vec<f64>, Vec<f64>) {
    x.iter()
        .zip(y)
        .filter(|(xi, _)| {
            let d = **xi - c;
            d >= lo && if closed { d <= hi } else { d < hi }
        })
        .map(|(xi, yi)| (xi - c, *yi))
        .unzip()
}

fn sum_squares(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum()
}

/// Second derivative at zero from a quadratic fit.
fn curvature(xc: &[f64], y: &[f64]) -> Result<f64> {
    let rows: Vec<f64> = xc.iter().flat_map(|v| [1.0, *v, v * v]).collect();
    Ok(2.0 * least_squares(&rows, 3, y)?[2])
}

/// IK bandwidth with every intermediate quantity.
pub fn ik_bandwidth_details(x: &[f64], y: &[f64], cutpoint: f64, kernel: Kernel) -> Result<IkBandwidth> {
    let n = x.len();
    let n_below = x.iter().filter(|v| **v < cutpoint).count();
    let n_above = n - n_below;
    if n_below == 0 || n_above == 0 {
        return Err(insufficient("bandwidth selection", n_below, n_above));
    }
    let nf = n as f64;

    // Step 1: density and variance within the pilot bandwidth.
    let pilot = 1.84 * std_dev(x) * nf.powf(-0.2);
    let (_, y_left) = window(x, y, cutpoint, -pilot, 0.0, false);
    let (_, y_right) = window(x, y, cutpoint, 0.0, pilot, true);
    let (nl, nr) = (y_left.len(), y_right.len());
    if nl == 0 || nr == 0 {
        return Err(insufficient("pilot bandwidth", nl, nr));
    }
    let density = (nl + nr) as f64 / (2.0 * nf * pilot);
    let var_y = (sum_squares(&y_left) + sum_squares(&y_right)) / (nl + nr) as f64;

    // Step 2: third derivative from a cubic between the side medians.
    let below: Vec<f64> = x.iter().copied().filter(|v| *v < cutpoint).collect();
    let above: Vec<f64> = x.iter().copied().filter(|v| *v >= cutpoint).collect();
    let (med_left, med_right) = (median(&below), median(&above));
    let (xc, y_mid) = window(x, y, cutpoint, med_left - cutpoint, med_right - cutpoint, true);
    if xc.len() < 6 {
        return Err(insufficient("third-derivative fit", nl, nr));
    }
    let rows: Vec<f64> = xc
        .iter()
        .flat_map(|v| [1.0, if *v >= 0.0 { 1.0 } else { 0.0 }, *v, v * v, v * v * v])
        .collect();
    // d³/dx³ of g3·x³
    let third_derivative = 6.0 * least_squares(&rows, 5, &y_mid)?[4];

    let base = (var_y / (density * third_derivative.powi(2).max(0.01))).powf(1.0 / 7.0);
    let h2_left = 3.56 * (n_below as f64).powf(-1.0 / 7.0) * base;
    let h2_right = 3.56 * (n_above as f64).powf(-1.0 / 7.0) * base;

    let (xl, yl) = window(x, y, cutpoint, -h2_left, 0.0, false);
    let (xr, yr) = window(x, y, cutpoint, 0.0, h2_right, true);
    if xl.len() < 3 || xr.len() < 3 {
        return Err(insufficient("second-derivative fits", xl.len(), xr.len()));
    }
    let second_derivative_left = curvature(&xl, &yl)?;
    let second_derivative_right = curvature(&xr, &yr)?;

    // Step 3: regularized optimal bandwidth.
    let regularization_left = 720.0 * var_y / (xl.len() as f64 * h2_left.powi(4));
    let regularization_right = 720.0 * var_y / (xr.len() as f64 * h2_right.powi(4));
    let curvature_gap = (second_derivative_right - second_derivative_left).powi(2);
    let bandwidth = kernel.ik_constant()
        * (2.0 * var_y / (density * (curvature_gap + regularization_left + regularization_right)))
            .powf(0.2)
        * nf.powf(-0.2);

    let (fl, fr) = (
        window(x, y, cutpoint, -bandwidth, 0.0, false).0.len(),
        window(x, y, cutpoint, 0.0, bandwidth, true).0.len(),
    );
    if fl == 0 || fr == 0 || !bandwidth.is_finite() {
        return Err(insufficient("selected bandwidth", fl, fr));
    }

    debug!(
        "IK bandwidth: pilot {:.4}, f(c) {:.4}, var(y) {:.4}, m3 {:.4}, h2 = ({:.4}, {:.4}), h = {:.4}",
        pilot, density, var_y, third_derivative, h2_left, h2_right, bandwidth
    );

    Ok(IkBandwidth {
        bandwidth,
        pilot,
        density,
        var_y,
        third_derivative,
        h2_left,
        h2_right,
        second_derivative_left,
        second_derivative_right,
        regularization_left,
        regularization_right,
    })
}

/// Imbens–Kalyanaraman optimal bandwidth for local linear estimation.
pub fn ik_bandwidth(x: &[f64], y: &[f64], cutpoint: f64, kernel: Kernel) -> Result<f64> {
    ik_bandwidth_details(x, y, cutpoint, kernel).map(|d| d.bandwidth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..=400).map(|i| -2.0 + i as f64 * 0.01).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let jump = if *v >= 0.0 { 1.5 } else { 0.0 };
                2.0 + 0.8 * v - 0.3 * v * v + jump + 0.4 * (i as f64 * 37.0).sin()
            })
            .collect();
        (x, y)
    }

    #[test]
    fn test_bandwidth_is_positive_and_local() {
        let (x, y) = sample();
        let d = ik_bandwidth_details(&x, &y, 0.0, Kernel::Triangular).unwrap();
        assert!(d.bandwidth > 0.0 && d.bandwidth < 4.0, "h = {}", d.bandwidth);
        assert!(d.var_y > 0.0);
        // uniform running variable over a range of 4
        assert!((d.density - 0.25).abs() < 0.05, "density {}", d.density);
        assert!(d.h2_left > 0.0 && d.h2_right > 0.0);
    }

    #[test]
    fn test_kernel_constant_scales_bandwidth() {
        let (x, y) = sample();
        let tri = ik_bandwidth(&x, &y, 0.0, Kernel::Triangular).unwrap();
        let rect = ik_bandwidth(&x, &y, 0.0, Kernel::Rectangular).unwrap();
        assert!((rect / tri - 5.40 / 3.4375).abs() < 1e-9);
    }

    #[test]
    fn test_third_derivative_of_cubic() {
        let x: Vec<f64> = (0..=400).map(|i| -2.0 + i as f64 * 0.01).collect();
        let y: Vec<f64> = x.iter().map(|v| v.powi(3)).collect();

        let d = ik_bandwidth_details(&x, &y, 0.0, Kernel::Triangular).unwrap();
        assert!((d.third_derivative - 6.0).abs() < 1e-8, "m3 = {}", d.third_derivative);
        // quadratic fits of x³ on each side of zero
        assert!((d.second_derivative_left + 1.77).abs() < 1e-6);
        assert!((d.second_derivative_right - 1.74).abs() < 1e-6);
        assert!((d.h2_left - 0.584_367_916).abs() < 1e-6);
        assert!((d.bandwidth - 0.332_871_987).abs() < 1e-6, "h = {}", d.bandwidth);
    }

    #[test]
    fn test_one_sided_data_rejected() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 2.0, 3.0, 4.0];
        assert!(matches!(
            ik_bandwidth(&x, &y, 0.0, Kernel::Triangular),
            Err(CausalError::InsufficientData(_))
        ));
    }
}
