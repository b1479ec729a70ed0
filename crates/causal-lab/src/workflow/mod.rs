//! End-to-end analysis runs.
//!
//! A [`Pipeline`] runs a [`MatchingStudy`] (propensity model, matching,
//! balance, outcome model) or a [`DiscontinuityStudy`] (bandwidth,
//! estimates, plot data) on a frame, reporting progress and honouring
//! cancellation between stages.

pub mod progress;

pub use progress::{
    AnalysisStage, CancellationToken, ClosureProgressReporter, ProgressReporter, ProgressUpdate,
};

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::config::{AnalysisConfig, ConfigValidationError, Estimand, MatchingMethod, RddConfig};
use crate::data::columns::numeric_values;
use crate::data::recode::{Recode, apply_recodes, center, drop_missing, subset_equals};
use crate::error::{CausalError, Result, ResultExt};
use crate::matching::{
    BalanceTable, DistanceHistogram, EffectEstimate, MatchResult, assess_balance,
    distance_histogram, estimate_effect, estimate_propensity, match_units, matched_data,
};
use crate::models::formula::Formula;
use crate::models::logit::LogitModel;
use crate::rdd::{BinnedMean, FittedLines, RdAnalysis, binned_means, fitted_lines, rd_estimate};
use crate::reporting::{AnalysisReport, ReportGenerator};

/// Bins of the distance histogram in matching reports.
const DISTANCE_BINS: usize = 20;

/// Points per side of fitted discontinuity lines.
const LINE_POINTS: usize = 50;

/// A propensity-score matching analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchingStudy {
    /// 0/1 treatment column
    pub treatment: String,
    /// Right-hand side of the propensity model, e.g. `"age + female + educ"`
    pub covariates: String,
    /// Outcome for the effect estimate; no outcome model when `None`
    pub outcome: Option<String>,
    /// Extra adjustment terms for the outcome model
    pub outcome_covariates: Option<String>,
    /// Keep only rows where `column == value`
    pub subset: Option<(String, String)>,
    /// Drop rows with a missing value in any model column before matching
    pub drop_missing: bool,
    /// Recoding steps applied before subsetting
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recodes: Vec<Recode>,
}

impl MatchingStudy {
    pub fn new(treatment: impl Into<String>, covariates: impl Into<String>) -> Self {
        Self {
            treatment: treatment.into(),
            covariates: covariates.into(),
            ..Self::default()
        }
    }

    pub fn outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn subset(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.subset = Some((column.into(), value.into()));
        self
    }

    pub fn drop_missing(mut self, drop: bool) -> Self {
        self.drop_missing = drop;
        self
    }

    pub fn recode(mut self, recode: Recode) -> Self {
        self.recodes.push(recode);
        self
    }

    /// Columns the study reads.
    fn columns(&self) -> Result<Vec<String>> {
        let mut columns = vec![self.treatment.clone()];
        columns.extend(Formula::parse_rhs(&self.covariates)?.variables());
        if let Some(outcome) = &self.outcome {
            columns.push(outcome.clone());
        }
        if let Some(extra) = &self.outcome_covariates {
            columns.extend(Formula::parse_rhs(extra)?.variables());
        }
        columns.sort();
        columns.dedup();
        Ok(columns)
    }
}

/// Summary of how units were matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSummary {
    pub method: MatchingMethod,
    pub estimand: Estimand,
    pub ratio: usize,
    pub replace: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caliper: Option<f64>,
    pub n_subclasses: usize,
    pub matched_treated: usize,
    pub matched_control: usize,
}

impl From<&MatchResult> for MatchSummary {
    fn from(result: &MatchResult) -> Self {
        let (matched_treated, matched_control) = result.n_matched();
        Self {
            method: result.method,
            estimand: result.estimand,
            ratio: result.ratio,
            replace: result.replace,
            caliper: result.caliper,
            n_subclasses: result.n_subclasses(),
            matched_treated,
            matched_control,
        }
    }
}

/// Everything a matching run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingReport {
    pub study: MatchingStudy,
    pub n_rows: usize,
    pub propensity_model: LogitModel,
    pub matching: MatchSummary,
    pub balance: BalanceTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<EffectEstimate>,
    pub distance_histogram: DistanceHistogram,
    pub duration_ms: u64,
    /// Full per-unit result, kept for exporting matched data
    #[serde(skip)]
    pub result: Option<MatchResult>,
    /// Frame the propensity model was fitted on
    #[serde(skip)]
    pub sample: Option<DataFrame>,
}

impl MatchingReport {
    /// Matched rows with distance, weights and subclass columns, or `None`
    /// for a report read back from JSON.
    pub fn matched_data(&self) -> Result<Option<DataFrame>> {
        match (&self.sample, &self.result) {
            (Some(sample), Some(result)) => matched_data(sample, result).map(Some),
            _ => Ok(None),
        }
    }
}

/// A regression-discontinuity analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscontinuityStudy {
    pub running: String,
    pub outcome: String,
    /// Treatment take-up; makes the design fuzzy
    pub treatment: Option<String>,
    pub covariates: Vec<String>,
    /// Estimate on `running - cutpoint` with the cutpoint at zero
    pub recentre: bool,
    /// Recoding steps applied before estimation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recodes: Vec<Recode>,
}

impl DiscontinuityStudy {
    pub fn new(running: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            running: running.into(),
            outcome: outcome.into(),
            ..Self::default()
        }
    }

    pub fn treatment(mut self, treatment: impl Into<String>) -> Self {
        self.treatment = Some(treatment.into());
        self
    }

    pub fn recentre(mut self, recentre: bool) -> Self {
        self.recentre = recentre;
        self
    }

    pub fn recode(mut self, recode: Recode) -> Self {
        self.recodes.push(recode);
        self
    }
}

/// Everything a discontinuity run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscontinuityReport {
    pub study: DiscontinuityStudy,
    pub analysis: RdAnalysis,
    pub binned_means: Vec<BinnedMean>,
    /// Local linear fit at the selected bandwidth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitted_lines: Option<FittedLines>,
    pub duration_ms: u64,
}

/// Runs analyses with shared settings, progress and cancellation.
///
/// Use [`Pipeline::builder()`] to create one.
pub struct Pipeline {
    config: AnalysisConfig,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation_token: CancellationToken,
    reporter: ReportGenerator,
}

static_assertions::assert_impl_all!(Pipeline: Send);

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancellation_token.is_cancelled() {
            return Err(CausalError::Cancelled);
        }
        Ok(())
    }

    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.progress_reporter {
            reporter.report(update);
        }
    }

    /// Report the outcome of a run to the progress reporter.
    fn finish<T>(&self, result: Result<T>, what: &str) -> Result<T> {
        match result {
            Ok(value) => {
                self.report_progress(ProgressUpdate::complete(format!("{} completed", what)));
                Ok(value)
            }
            Err(e) => {
                if e.is_cancelled() {
                    self.report_progress(ProgressUpdate::cancelled());
                } else {
                    self.report_progress(ProgressUpdate::failed(e.to_string()));
                }
                error!("{} failed: {}", what, e);
                Err(e)
            }
        }
    }

    /// Propensity model, matching, balance and (optionally) outcome model.
    pub fn run_matching(&self, df: &DataFrame, study: &MatchingStudy) -> Result<MatchingReport> {
        self.finish(self.run_matching_internal(df, study), "Matching analysis")
    }

    fn run_matching_internal(&self, df: &DataFrame, study: &MatchingStudy) -> Result<MatchingReport> {
        let start = Instant::now();
        self.report_progress(ProgressUpdate::new(
            AnalysisStage::Initializing,
            0.0,
            format!("Matching on '{}'", study.treatment),
        ));
        let columns = study.columns()?;
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(AnalysisStage::Preparing, 0.0, "Preparing data"));
        let mut data = apply_recodes(df, &study.recodes)?;
        if let Some((column, value)) = &study.subset {
            data = subset_equals(&data, column, value).context("subsetting")?;
        }
        if study.drop_missing {
            let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
            data = drop_missing(&data, &refs)?;
        }
        info!("Matching sample: {} of {} rows", data.height(), df.height());
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(
            AnalysisStage::PropensityModel,
            0.0,
            "Fitting propensity model",
        ));
        let matching = &self.config.matching;
        let scores = estimate_propensity(&data, &study.treatment, &study.covariates, matching.distance)
            .context("propensity model")?;
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(
            AnalysisStage::Matching,
            0.0,
            format!("{:?} matching for the {}", matching.method, matching.estimand),
        ));
        let result = match_units(&scores, matching).context("matching")?;
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(AnalysisStage::Balance, 0.0, "Assessing balance"));
        let balance = assess_balance(&data, &result, &study.covariates)?;
        let histogram = distance_histogram(&result, DISTANCE_BINS)?;
        self.check_cancelled()?;

        let effect = match &study.outcome {
            Some(outcome) => {
                self.report_progress(ProgressUpdate::new(
                    AnalysisStage::OutcomeModel,
                    0.0,
                    format!("Estimating effect on '{}'", outcome),
                ));
                Some(
                    estimate_effect(
                        &data,
                        &result,
                        outcome,
                        study.outcome_covariates.as_deref(),
                        self.config.confidence_level,
                    )
                    .context("outcome model")?,
                )
            }
            None => None,
        };

        self.report_progress(ProgressUpdate::new(
            AnalysisStage::ReportGeneration,
            0.0,
            "Assembling report",
        ));
        Ok(MatchingReport {
            study: study.clone(),
            n_rows: data.height(),
            propensity_model: scores.model,
            matching: MatchSummary::from(&result),
            balance,
            effect,
            distance_histogram: histogram,
            duration_ms: start.elapsed().as_millis() as u64,
            result: Some(result),
            sample: Some(data),
        })
    }

    /// Bandwidth selection, estimates at every multiplier and plot data.
    pub fn run_discontinuity(
        &self,
        df: &DataFrame,
        study: &DiscontinuityStudy,
    ) -> Result<DiscontinuityReport> {
        self.finish(
            self.run_discontinuity_internal(df, study),
            "Discontinuity analysis",
        )
    }

    fn run_discontinuity_internal(
        &self,
        df: &DataFrame,
        study: &DiscontinuityStudy,
    ) -> Result<DiscontinuityReport> {
        let start = Instant::now();
        let rdd = &self.config.rdd;
        self.report_progress(ProgressUpdate::new(
            AnalysisStage::Initializing,
            0.0,
            format!("Discontinuity in '{}' at {} = {}", study.outcome, study.running, rdd.cutpoint),
        ));
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(AnalysisStage::Preparing, 0.0, "Preparing data"));
        let recoded = apply_recodes(df, &study.recodes)?;
        let (data, running, config) = if study.recentre {
            let centred = format!("{}_c", study.running);
            let data = center(&recoded, &study.running, &centred, rdd.cutpoint)?;
            let config = RddConfig {
                cutpoint: 0.0,
                ..rdd.clone()
            };
            (data, centred, config)
        } else {
            (recoded, study.running.clone(), rdd.clone())
        };
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(
            AnalysisStage::BandwidthSelection,
            0.0,
            match config.bandwidth {
                Some(h) => format!("Using fixed bandwidth {}", h),
                None => "Selecting IK bandwidth".to_string(),
            },
        ));
        let covariates: Vec<&str> = study.covariates.iter().map(String::as_str).collect();
        self.report_progress(ProgressUpdate::new(
            AnalysisStage::Estimation,
            0.0,
            format!("Estimating at {} bandwidths", config.bandwidth_multipliers.len().max(1)),
        ));
        let analysis = rd_estimate(
            &data,
            &running,
            &study.outcome,
            study.treatment.as_deref(),
            &covariates,
            &config,
            self.config.confidence_level,
        )?;
        self.check_cancelled()?;

        self.report_progress(ProgressUpdate::new(AnalysisStage::PlotData, 0.0, "Binning outcomes"));
        let (x, y): (Vec<f64>, Vec<f64>) = numeric_values(&data, &running)?
            .into_iter()
            .zip(numeric_values(&data, &study.outcome)?)
            .filter_map(|pair| match pair {
                (Some(a), Some(b)) => Some((a, b)),
                _ => None,
            })
            .unzip();
        let binned = binned_means(&x, &y, config.cutpoint, config.bins)?;
        let lines = analysis.primary().map(|e| fitted_lines(e, LINE_POINTS));

        self.report_progress(ProgressUpdate::new(
            AnalysisStage::ReportGeneration,
            0.0,
            "Assembling report",
        ));
        Ok(DiscontinuityReport {
            study: study.clone(),
            analysis,
            binned_means: binned,
            fitted_lines: lines,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Write a report into the configured output directory.
    ///
    /// Returns `None` when saving to disk is disabled.
    pub fn save_report(&self, report: &AnalysisReport, stem: &str) -> Result<Option<PathBuf>> {
        if !self.config.save_to_disk {
            return Ok(None);
        }
        self.reporter.write_report_to_file(report, stem).map(Some)
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    config: Option<AnalysisConfig>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
    cancellation_token: Option<CancellationToken>,
}

static_assertions::assert_impl_all!(PipelineBuilder: Send);

impl PipelineBuilder {
    pub fn config(mut self, config: AnalysisConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a custom progress reporter.
    pub fn progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    /// Set a progress callback closure.
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_reporter = Some(Arc::new(ClosureProgressReporter::new(callback)));
        self
    }

    /// Set a token that stops the run between stages once cancelled.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    /// Build the pipeline, validating the configuration.
    pub fn build(self) -> std::result::Result<Pipeline, ConfigValidationError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let reporter = ReportGenerator::new(config.output_dir.clone());

        Ok(Pipeline {
            config,
            progress_reporter: self.progress_reporter,
            cancellation_token: self.cancellation_token.unwrap_or_default(),
            reporter,
        })
    }
}
