use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Result, ResultExt};

/// Analysis that produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Describe,
    TTest,
    Regression,
    Logit,
    Matching,
    Discontinuity,
}

impl ReportKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Describe => "Descriptive statistics",
            Self::TTest => "t-test",
            Self::Regression => "Linear regression",
            Self::Logit => "Logistic regression",
            Self::Matching => "Propensity score matching",
            Self::Discontinuity => "Regression discontinuity",
        }
    }
}

/// Report of one analysis, used both for JSON output (`--json`) and for
/// files written with `--emit-report`.
///
/// `body` holds the serialized result of the analysis; its shape depends
/// on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Timestamp when the report was generated
    pub generated_at: String,
    /// Path to the input file
    pub input_file: String,
    pub kind: ReportKind,
    pub body: serde_json::Value,
}

impl AnalysisReport {
    pub fn new(input_file: impl Into<String>, kind: ReportKind, body: serde_json::Value) -> Self {
        Self {
            generated_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            input_file: input_file.into(),
            kind,
            body,
        }
    }

    /// Build a report from any serializable analysis result.
    pub fn from_result<T: Serialize>(
        input_file: impl Into<String>,
        kind: ReportKind,
        result: &T,
    ) -> Result<Self> {
        let body = serde_json::to_value(result)?;
        Ok(Self::new(input_file, kind, body))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Writes reports into an output directory.
pub struct ReportGenerator {
    output_dir: PathBuf,
}

impl ReportGenerator {
    pub fn new(output_dir: PathBuf) -> Self {
        Self { output_dir }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write `report` as `<stem>_report.json`, creating the output
    /// directory if needed.
    pub fn write_report_to_file(&self, report: &AnalysisReport, stem: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).context(format!(
            "creating output directory {}",
            self.output_dir.display()
        ))?;

        let path = self.output_dir.join(format!("{}_report.json", stem));
        let json = report.to_json_pretty()?;
        debug!("Writing {} bytes of {} report", json.len(), report.kind.display_name());

        let mut file = File::create(&path).context(format!("creating {}", path.display()))?;
        file.write_all(json.as_bytes())?;

        info!("Report saved: {}", path.display());
        Ok(path)
    }
}
