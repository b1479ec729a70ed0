//! Reference distributions for test statistics.
//!
//! Thin wrappers over `statrs` that return `NaN` instead of panicking
//! when degrees of freedom are not positive.

use statrs::distribution::{ContinuousCDF, FisherSnedecor, Normal, StudentsT};

use crate::config::Alternative;

fn t_dist(df: f64) -> Option<StudentsT> {
    if !(df.is_finite() && df > 0.0) {
        return None;
    }
    StudentsT::new(0.0, 1.0, df).ok()
}

fn standard_normal() -> Option<Normal> {
    Normal::new(0.0, 1.0).ok()
}

fn tail_probability(cdf: f64, alternative: Alternative) -> f64 {
    match alternative {
        Alternative::TwoSided => (2.0 * cdf.min(1.0 - cdf)).min(1.0),
        Alternative::Less => cdf,
        Alternative::Greater => 1.0 - cdf,
    }
}

/// p-value of a t statistic.
pub fn t_p_value(statistic: f64, df: f64, alternative: Alternative) -> f64 {
    match t_dist(df) {
        Some(dist) if statistic.is_finite() => tail_probability(dist.cdf(statistic), alternative),
        _ => f64::NAN,
    }
}

/// Quantile of the Student t distribution.
pub fn t_quantile(p: f64, df: f64) -> f64 {
    t_dist(df).map(|d| d.inverse_cdf(p)).unwrap_or(f64::NAN)
}

/// p-value of a z statistic.
pub fn normal_p_value(statistic: f64, alternative: Alternative) -> f64 {
    match standard_normal() {
        Some(dist) if statistic.is_finite() => tail_probability(dist.cdf(statistic), alternative),
        _ => f64::NAN,
    }
}

/// Quantile of the standard normal distribution.
pub fn normal_quantile(p: f64) -> f64 {
    standard_normal()
        .map(|d| d.inverse_cdf(p))
        .unwrap_or(f64::NAN)
}

/// Upper-tail probability of an F statistic.
pub fn f_upper_tail(statistic: f64, df1: f64, df2: f64) -> f64 {
    if !(statistic.is_finite() && df1 > 0.0 && df2 > 0.0) {
        return f64::NAN;
    }
    match FisherSnedecor::new(df1, df2) {
        Ok(dist) => (1.0 - dist.cdf(statistic)).max(0.0),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_t_p_value_symmetry() {
        let two = t_p_value(2.0, 10.0, Alternative::TwoSided);
        let greater = t_p_value(2.0, 10.0, Alternative::Greater);
        let less = t_p_value(-2.0, 10.0, Alternative::Less);
        assert!((two - 2.0 * greater).abs() < 1e-10);
        assert!((greater - less).abs() < 1e-10);
        // qt(0.975, 10) = 2.228139
        assert!((t_quantile(0.975, 10.0) - 2.228139).abs() < 1e-5);
    }

    #[test]
    fn test_normal_quantile() {
        assert!((normal_quantile(0.975) - 1.959964).abs() < 1e-5);
        assert!((normal_p_value(1.959964, Alternative::TwoSided) - 0.05).abs() < 1e-5);
    }

    #[test]
    fn test_invalid_df_yields_nan() {
        assert!(t_p_value(1.0, 0.0, Alternative::TwoSided).is_nan());
        assert!(t_quantile(0.5, -1.0).is_nan());
        assert!(f_upper_tail(1.0, 0.0, 5.0).is_nan());
    }

    #[test]
    fn test_f_upper_tail() {
        // F(2, 20) upper tail is (1 + 2 * 4 / 20)^-10
        assert!((f_upper_tail(4.0, 2.0, 20.0) - 0.034572).abs() < 1e-4);
    }
}
