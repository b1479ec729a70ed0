//! Kernel weights around a cutpoint.

use crate::config::Kernel;

impl Kernel {
    /// Weight at scaled distance `u = (x - c) / h`; zero outside `|u| <= 1`.
    pub fn weight(self, u: f64) -> f64 {
        let a = u.abs();
        if !(a <= 1.0) {
            return 0.0;
        }
        match self {
            Kernel::Triangular => 1.0 - a,
            Kernel::Rectangular => 1.0,
            Kernel::Epanechnikov => 0.75 * (1.0 - a * a),
        }
    }

    /// Constant of the IK optimal-bandwidth formula.
    pub fn ik_constant(self) -> f64 {
        match self {
            Kernel::Triangular => 3.4375,
            Kernel::Rectangular => 5.40,
            Kernel::Epanechnikov => 3.1999,
        }
    }
}

/// Kernel weight of every observation for bandwidth `h`.
pub fn kernel_weights(x: &[f64], cutpoint: f64, h: f64, kernel: Kernel) -> Vec<f64> {
    if !(h > 0.0) {
        return vec![0.0; x.len()];
    }
    x.iter().map(|v| kernel.weight((v - cutpoint) / h)).collect()
}
