//! Causal Inference Workshop Library
//!
//! Statistical building blocks for observational-data workshops, built
//! with Rust and Polars.
//!
//! # Overview
//!
//! - **Data**: CSV/parquet loading, recoding (binarizing ordinal answers,
//!   centering a running variable, interactions), listwise deletion
//! - **Descriptive statistics and t-tests**: Welch and Student two-sample
//!   tests, one-sample tests, group means
//! - **Regression**: OLS from R-style formulas with factors, interactions,
//!   absorbed fixed effects, weights and robust or clustered standard
//!   errors; logistic regression by IRLS
//! - **Matching**: propensity scores, nearest-neighbour matching (with or
//!   without replacement, caliper, k:1), optimal full matching, balance
//!   diagnostics and weighted outcome regression
//! - **Regression discontinuity**: sharp and fuzzy local linear estimates
//!   with the Imbens–Kalyanaraman bandwidth, plus plot data
//! - **Progress Reporting**: progress updates with cancellation support
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use causal_lab::{AnalysisConfig, MatchingStudy, Pipeline, load_dataset};
//! use causal_lab::config::MatchingMethod;
//!
//! let df = load_dataset("survey.csv")?;
//!
//! let config = AnalysisConfig::builder()
//!     .matching_method(MatchingMethod::Nearest)
//!     .caliper(0.2)
//!     .build()?;
//!
//! let study = MatchingStudy::new("union", "age + female + educ").outcome("voted");
//! let report = Pipeline::builder()
//!     .config(config)
//!     .on_progress(|update| {
//!         println!("[{:.0}%] {}", update.progress * 100.0, update.message);
//!     })
//!     .build()?
//!     .run_matching(&df, &study)?;
//!
//! println!("max |SMD| after matching: {:.3}", report.balance.max_abs_smd());
//! ```
//!
//! # Building blocks
//!
//! Every step of a [`Pipeline`] run is also available on its own:
//!
//! ```rust,ignore
//! use causal_lab::models::{LmOptions, lm};
//! use causal_lab::rdd::ik_bandwidth;
//!
//! let model = lm(&df, "mortality ~ over21 + age_c + over21:age_c", &LmOptions::default())?;
//! let h = ik_bandwidth(&age, &mortality, 21.0, Kernel::Triangular)?;
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod matching;
pub mod models;
pub mod rdd;
pub mod reporting;
pub mod stats;
pub mod utils;
pub mod workflow;

// Re-exports for convenient access
pub use config::{
    AnalysisConfig, AnalysisConfigBuilder, ConfigValidationError, MatchingConfig, RddConfig,
};
pub use data::{load_dataset, write_csv};
pub use error::{CausalError, Result as CausalResult, ResultExt};
pub use reporting::{AnalysisReport, ReportGenerator, ReportKind};
pub use workflow::{
    AnalysisStage, CancellationToken, ClosureProgressReporter, DiscontinuityReport,
    DiscontinuityStudy, MatchSummary, MatchingReport, MatchingStudy, Pipeline, PipelineBuilder,
    ProgressReporter, ProgressUpdate,
};
