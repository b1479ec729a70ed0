//! Configuration types for causal-lab analyses.
//!
//! This module provides configuration options using the builder pattern
//! for flexible and ergonomic analysis setup. Configurations serialize to
//! JSON so they can be stored next to a dataset and passed to the CLI with
//! `--config`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Variance assumption of a two-sample t-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TTestKind {
    /// Unequal variances, Welch–Satterthwaite degrees of freedom
    #[default]
    Welch,
    /// Pooled variance, `n_x + n_y - 2` degrees of freedom
    Student,
}

/// Alternative hypothesis of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Alternative {
    /// Difference is not equal to the null value
    #[default]
    TwoSided,
    /// Difference is less than the null value
    Less,
    /// Difference is greater than the null value
    Greater,
}

/// Coefficient covariance estimator for linear models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CovarianceType {
    /// Homoskedastic OLS covariance
    #[default]
    Classical,
    /// White heteroskedasticity-robust sandwich
    Hc0,
    /// HC0 with `n / (n - k)` small-sample scaling
    Hc1,
}

/// Matching algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MatchingMethod {
    /// Greedy nearest-neighbour matching on the distance
    #[default]
    Nearest,
    /// Optimal full matching
    Full,
}

/// Causal estimand targeted by matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Estimand {
    /// Average treatment effect among the treated
    #[default]
    Att,
    /// Average treatment effect among the controls
    Atc,
    /// Average treatment effect in the whole sample
    Ate,
}

impl std::fmt::Display for Estimand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Att => "ATT",
            Self::Atc => "ATC",
            Self::Ate => "ATE",
        };
        write!(f, "{}", s)
    }
}

/// Scale of the propensity-score distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DistanceKind {
    /// Fitted probability
    #[default]
    Glm,
    /// Linear predictor (log-odds)
    Logit,
}

/// Order in which focal units pick their nearest neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MatchOrder {
    /// Highest distance first
    #[default]
    Largest,
    /// Lowest distance first
    Smallest,
    /// Seeded random order
    Random,
    /// Row order of the dataset
    Data,
}

/// Common-support trimming applied before matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Discard {
    /// Keep every unit
    #[default]
    None,
    /// Drop treated units outside the control distance range
    Treated,
    /// Drop control units outside the treated distance range
    Control,
    /// Apply both rules
    Both,
}

/// Kernel used to weight observations around a discontinuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Kernel {
    /// `1 - |u|`
    #[default]
    Triangular,
    /// Uniform weight inside the bandwidth
    Rectangular,
    /// `0.75 (1 - u^2)`
    Epanechnikov,
}

/// Matching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Matching algorithm.
    /// Default: Nearest
    pub method: MatchingMethod,

    /// Target estimand. `Ate` requires full matching.
    /// Default: Att
    pub estimand: Estimand,

    /// Distance scale of the propensity score.
    /// Default: Glm
    pub distance: DistanceKind,

    /// Number of matches per focal unit (nearest only).
    /// Default: 1
    pub ratio: usize,

    /// Whether non-focal units may be reused (nearest only).
    /// Default: false
    pub replace: bool,

    /// Maximum allowed distance between matched units.
    /// Default: None
    pub caliper: Option<f64>,

    /// Interpret the caliper in standard deviations of the distance.
    /// Default: true
    pub std_caliper: bool,

    /// Order of focal units for greedy matching.
    /// Default: Largest
    pub order: MatchOrder,

    /// Common-support trimming.
    /// Default: None
    pub discard: Discard,

    /// Seed for `MatchOrder::Random`.
    /// Default: None (fixed internal seed)
    pub seed: Option<u64>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            method: MatchingMethod::default(),
            estimand: Estimand::default(),
            distance: DistanceKind::default(),
            ratio: 1,
            replace: false,
            caliper: None,
            std_caliper: true,
            order: MatchOrder::default(),
            discard: Discard::default(),
            seed: None,
        }
    }
}

/// Regression-discontinuity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RddConfig {
    /// Threshold of the running variable.
    /// Default: 0.0
    pub cutpoint: f64,

    /// Kernel for local weighting.
    /// Default: Triangular
    pub kernel: Kernel,

    /// Fixed bandwidth. `None` selects the Imbens–Kalyanaraman bandwidth.
    /// Default: None
    pub bandwidth: Option<f64>,

    /// Multiples of the bandwidth at which estimates are reported.
    /// Default: [1.0, 0.5, 2.0]
    pub bandwidth_multipliers: Vec<f64>,

    /// Number of bins per side for plot data.
    /// Default: 20
    pub bins: usize,
}

impl Default for RddConfig {
    fn default() -> Self {
        Self {
            cutpoint: 0.0,
            kernel: Kernel::default(),
            bandwidth: None,
            bandwidth_multipliers: vec![1.0, 0.5, 2.0],
            bins: 20,
        }
    }
}

/// Configuration for causal-lab analyses.
///
/// Use [`AnalysisConfig::builder()`] to create a new configuration
/// with fluent API.
///
/// # Example
///
/// ```rust,ignore
/// use causal_lab::config::{AnalysisConfig, MatchingMethod};
///
/// let config = AnalysisConfig::builder()
///     .matching_method(MatchingMethod::Full)
///     .caliper(0.2)
///     .build()?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Confidence level for intervals (0.0 - 1.0, exclusive).
    /// Default: 0.95
    pub confidence_level: f64,

    /// Variance assumption of two-sample t-tests.
    /// Default: Welch
    pub t_test_kind: TTestKind,

    /// Covariance estimator for regression tables.
    /// Default: Classical
    pub covariance: CovarianceType,

    /// Matching settings.
    pub matching: MatchingConfig,

    /// Regression-discontinuity settings.
    pub rdd: RddConfig,

    /// Output directory for reports and exported data.
    /// Default: "output"
    pub output_dir: PathBuf,

    /// Whether to write reports and exported data to disk.
    /// Default: true
    pub save_to_disk: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            t_test_kind: TTestKind::default(),
            covariance: CovarianceType::default(),
            matching: MatchingConfig::default(),
            rdd: RddConfig::default(),
            output_dir: PathBuf::from("output"),
            save_to_disk: true,
        }
    }
}

impl AnalysisConfig {
    /// Create a new configuration builder.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder::default()
    }

    /// Read and validate a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: AnalysisConfig = serde_json::from_str(&content)?;
        config
            .validate()
            .map_err(|e| crate::error::CausalError::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ConfigValidationError::InvalidConfidenceLevel(
                self.confidence_level,
            ));
        }

        let matching = &self.matching;
        if matching.ratio == 0 {
            return Err(ConfigValidationError::InvalidRatio(matching.ratio));
        }
        if let Some(caliper) = matching.caliper
            && !(caliper.is_finite() && caliper > 0.0)
        {
            return Err(ConfigValidationError::InvalidCaliper(caliper));
        }
        if matching.estimand == Estimand::Ate && matching.method == MatchingMethod::Nearest {
            return Err(ConfigValidationError::UnsupportedEstimand {
                estimand: matching.estimand,
                method: matching.method,
            });
        }

        if let Some(bandwidth) = self.rdd.bandwidth
            && !(bandwidth.is_finite() && bandwidth > 0.0)
        {
            return Err(ConfigValidationError::InvalidBandwidth(bandwidth));
        }
        if let Some(&bad) = self
            .rdd
            .bandwidth_multipliers
            .iter()
            .find(|m| !(m.is_finite() && **m > 0.0))
        {
            return Err(ConfigValidationError::InvalidBandwidth(bad));
        }
        if self.rdd.bins == 0 {
            return Err(ConfigValidationError::InvalidBins(self.rdd.bins));
        }

        Ok(())
    }
}

/// Errors that can occur during configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid confidence level: {0} (must be strictly between 0.0 and 1.0)")]
    InvalidConfidenceLevel(f64),

    #[error("Invalid matching ratio: {0} (must be at least 1)")]
    InvalidRatio(usize),

    #[error("Invalid caliper: {0} (must be a positive number)")]
    InvalidCaliper(f64),

    #[error("Invalid bandwidth: {0} (must be a positive number)")]
    InvalidBandwidth(f64),

    #[error("Estimand {estimand} is not supported with {method:?} matching")]
    UnsupportedEstimand {
        estimand: Estimand,
        method: MatchingMethod,
    },

    #[error("Invalid number of plot bins: {0} (must be at least 1)")]
    InvalidBins(usize),
}

/// Builder for [`AnalysisConfig`] with fluent API.
#[derive(Debug, Default)]
pub struct AnalysisConfigBuilder {
    confidence_level: Option<f64>,
    t_test_kind: Option<TTestKind>,
    covariance: Option<CovarianceType>,
    matching: Option<MatchingConfig>,
    rdd: Option<RddConfig>,
    output_dir: Option<PathBuf>,
    save_to_disk: Option<bool>,
}

impl AnalysisConfigBuilder {
    fn matching_mut(&mut self) -> &mut MatchingConfig {
        self.matching.get_or_insert_with(MatchingConfig::default)
    }

    fn rdd_mut(&mut self) -> &mut RddConfig {
        self.rdd.get_or_insert_with(RddConfig::default)
    }

    /// Set the confidence level for intervals (e.g., 0.95).
    pub fn confidence_level(mut self, level: f64) -> Self {
        self.confidence_level = Some(level);
        self
    }

    /// Set the variance assumption of two-sample t-tests.
    pub fn t_test_kind(mut self, kind: TTestKind) -> Self {
        self.t_test_kind = Some(kind);
        self
    }

    /// Set the covariance estimator for regression tables.
    pub fn covariance(mut self, covariance: CovarianceType) -> Self {
        self.covariance = Some(covariance);
        self
    }

    /// Replace all matching settings at once.
    pub fn matching(mut self, matching: MatchingConfig) -> Self {
        self.matching = Some(matching);
        self
    }

    /// Set the matching algorithm.
    pub fn matching_method(mut self, method: MatchingMethod) -> Self {
        self.matching_mut().method = method;
        self
    }

    /// Set the target estimand.
    pub fn estimand(mut self, estimand: Estimand) -> Self {
        self.matching_mut().estimand = estimand;
        self
    }

    /// Set the propensity distance scale.
    pub fn distance(mut self, distance: DistanceKind) -> Self {
        self.matching_mut().distance = distance;
        self
    }

    /// Set the number of matches per focal unit.
    pub fn ratio(mut self, ratio: usize) -> Self {
        self.matching_mut().ratio = ratio;
        self
    }

    /// Allow or forbid matching with replacement.
    pub fn replace(mut self, replace: bool) -> Self {
        self.matching_mut().replace = replace;
        self
    }

    /// Set a caliper on the distance.
    ///
    /// With `std_caliper(true)` (the default) the caliper is expressed in
    /// standard deviations of the distance.
    pub fn caliper(mut self, caliper: f64) -> Self {
        self.matching_mut().caliper = Some(caliper);
        self
    }

    /// Interpret the caliper in standard deviations of the distance.
    pub fn std_caliper(mut self, std_caliper: bool) -> Self {
        self.matching_mut().std_caliper = std_caliper;
        self
    }

    /// Set the order in which focal units are matched.
    pub fn match_order(mut self, order: MatchOrder) -> Self {
        self.matching_mut().order = order;
        self
    }

    /// Set the common-support trimming rule.
    pub fn discard(mut self, discard: Discard) -> Self {
        self.matching_mut().discard = discard;
        self
    }

    /// Set the seed for random matching order.
    pub fn seed(mut self, seed: u64) -> Self {
        self.matching_mut().seed = Some(seed);
        self
    }

    /// Replace all discontinuity settings at once.
    pub fn rdd(mut self, rdd: RddConfig) -> Self {
        self.rdd = Some(rdd);
        self
    }

    /// Set the discontinuity threshold.
    pub fn cutpoint(mut self, cutpoint: f64) -> Self {
        self.rdd_mut().cutpoint = cutpoint;
        self
    }

    /// Set the discontinuity kernel.
    pub fn kernel(mut self, kernel: Kernel) -> Self {
        self.rdd_mut().kernel = kernel;
        self
    }

    /// Use a fixed bandwidth instead of the plug-in selector.
    pub fn bandwidth(mut self, bandwidth: f64) -> Self {
        self.rdd_mut().bandwidth = Some(bandwidth);
        self
    }

    /// Set the bandwidth multiples at which estimates are reported.
    pub fn bandwidth_multipliers(mut self, multipliers: Vec<f64>) -> Self {
        self.rdd_mut().bandwidth_multipliers = multipliers;
        self
    }

    /// Set the number of bins per side for discontinuity plot data.
    pub fn bins(mut self, bins: usize) -> Self {
        self.rdd_mut().bins = bins;
        self
    }

    /// Set the output directory for reports and exported data.
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Enable or disable writing results to disk.
    pub fn save_to_disk(mut self, save: bool) -> Self {
        self.save_to_disk = Some(save);
        self
    }

    /// Build the configuration.
    ///
    /// Returns a validated `AnalysisConfig` or an error if validation fails.
    pub fn build(self) -> std::result::Result<AnalysisConfig, ConfigValidationError> {
        let config = AnalysisConfig {
            confidence_level: self.confidence_level.unwrap_or(0.95),
            t_test_kind: self.t_test_kind.unwrap_or_default(),
            covariance: self.covariance.unwrap_or_default(),
            matching: self.matching.unwrap_or_default(),
            rdd: self.rdd.unwrap_or_default(),
            output_dir: self.output_dir.unwrap_or_else(|| PathBuf::from("output")),
            save_to_disk: self.save_to_disk.unwrap_or(true),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.confidence_level, 0.95);
        assert_eq!(config.t_test_kind, TTestKind::Welch);
        assert_eq!(config.matching.method, MatchingMethod::Nearest);
        assert_eq!(config.matching.ratio, 1);
        assert!(config.matching.std_caliper);
        assert_eq!(config.rdd.kernel, Kernel::Triangular);
        assert_eq!(config.rdd.bandwidth_multipliers, vec![1.0, 0.5, 2.0]);
    }

    #[test]
    fn test_builder_custom_values() {
        let config = AnalysisConfig::builder()
            .confidence_level(0.9)
            .matching_method(MatchingMethod::Full)
            .estimand(Estimand::Ate)
            .caliper(0.25)
            .cutpoint(21.0)
            .kernel(Kernel::Rectangular)
            .save_to_disk(false)
            .build()
            .unwrap();

        assert_eq!(config.confidence_level, 0.9);
        assert_eq!(config.matching.method, MatchingMethod::Full);
        assert_eq!(config.matching.estimand, Estimand::Ate);
        assert_eq!(config.matching.caliper, Some(0.25));
        assert_eq!(config.rdd.cutpoint, 21.0);
        assert_eq!(config.rdd.kernel, Kernel::Rectangular);
        assert!(!config.save_to_disk);
    }

    #[test]
    fn test_validation_invalid_confidence_level() {
        let result = AnalysisConfig::builder().confidence_level(1.0).build();
        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::InvalidConfidenceLevel(_)
        ));
    }

    #[test]
    fn test_validation_invalid_ratio_and_caliper() {
        assert!(matches!(
            AnalysisConfig::builder().ratio(0).build().unwrap_err(),
            ConfigValidationError::InvalidRatio(0)
        ));
        assert!(matches!(
            AnalysisConfig::builder().caliper(-0.1).build().unwrap_err(),
            ConfigValidationError::InvalidCaliper(_)
        ));
    }

    #[test]
    fn test_validation_ate_requires_full_matching() {
        let result = AnalysisConfig::builder().estimand(Estimand::Ate).build();
        assert!(matches!(
            result.unwrap_err(),
            ConfigValidationError::UnsupportedEstimand { .. }
        ));
    }

    #[test]
    fn test_validation_bandwidth() {
        assert!(AnalysisConfig::builder().bandwidth(0.0).build().is_err());
        assert!(
            AnalysisConfig::builder()
                .bandwidth_multipliers(vec![1.0, -2.0])
                .build()
                .is_err()
        );
        assert!(AnalysisConfig::builder().bins(0).build().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "confidence_level": 0.99,
            "t_test_kind": "Student",
            "covariance": "Hc1",
            "matching": {
                "method": "Full",
                "estimand": "Att",
                "distance": "Logit",
                "ratio": 1,
                "replace": false,
                "caliper": 0.1,
                "std_caliper": true,
                "order": "Data",
                "discard": "Both",
                "seed": 42
            },
            "rdd": {
                "cutpoint": 21.0,
                "kernel": "Epanechnikov",
                "bandwidth": null,
                "bandwidth_multipliers": [1.0],
                "bins": 10
            },
            "output_dir": "reports",
            "save_to_disk": false
        }"#;

        let config: AnalysisConfig = serde_json::from_str(json).expect("valid config JSON");
        assert!(config.validate().is_ok());
        assert_eq!(config.t_test_kind, TTestKind::Student);
        assert_eq!(config.covariance, CovarianceType::Hc1);
        assert_eq!(config.matching.distance, DistanceKind::Logit);
        assert_eq!(config.matching.discard, Discard::Both);
        assert_eq!(config.matching.seed, Some(42));
        assert_eq!(config.rdd.kernel, Kernel::Epanechnikov);
        assert_eq!(config.output_dir.to_str().unwrap(), "reports");
    }
}
