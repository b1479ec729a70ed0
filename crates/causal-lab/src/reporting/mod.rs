//! Report generation.
//!
//! Every analysis can be rendered two ways: as an [`AnalysisReport`]
//! (JSON on stdout with `--json`, or a file with `--emit-report`) and as
//! a plain-text table from [`tables`].
//!
//! # Example
//!
//! ```rust,ignore
//! use causal_lab::reporting::{AnalysisReport, ReportGenerator, ReportKind};
//!
//! let report = AnalysisReport::from_result("survey.csv", ReportKind::Regression, &model)?;
//! println!("{}", report.to_json_pretty()?);
//!
//! let generator = ReportGenerator::new(PathBuf::from("output"));
//! generator.write_report_to_file(&report, "survey")?;
//! ```

mod generator;
pub mod tables;

pub use generator::{AnalysisReport, ReportGenerator, ReportKind};
