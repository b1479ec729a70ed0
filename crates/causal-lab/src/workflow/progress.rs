//! Progress reporting and cancellation for analysis runs.
//!
//! A run reports [`ProgressUpdate`]s through a [`ProgressReporter`] and
//! checks a [`CancellationToken`] between stages, so a caller on another
//! thread can follow or stop a long matching job.
//!
//! # Example
//!
//! ```rust,ignore
//! use causal_lab::{CancellationToken, Pipeline};
//!
//! let token = CancellationToken::new();
//! let pipeline = Pipeline::builder()
//!     .cancellation_token(token.clone())
//!     .on_progress(|update| {
//!         println!("[{:.0}%] {}", update.progress * 100.0, update.message);
//!     })
//!     .build()?;
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stages of an analysis run.
///
/// Matching studies go through the propensity, matching, balance and
/// outcome stages; discontinuity studies through bandwidth selection,
/// estimation and plot data. Both start with initialization and data
/// preparation and end with report generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    /// Validating inputs
    Initializing,
    /// Subsetting, recoding and dropping incomplete rows
    Preparing,
    /// Fitting the propensity model
    PropensityModel,
    /// Matching units on the distance
    Matching,
    /// Computing balance diagnostics
    Balance,
    /// Fitting the outcome model on the matched sample
    OutcomeModel,
    /// Selecting the discontinuity bandwidth
    BandwidthSelection,
    /// Estimating the discontinuity
    Estimation,
    /// Computing binned means and fitted lines
    PlotData,
    /// Assembling and writing reports
    ReportGeneration,
    /// Run completed successfully
    Complete,
    /// Run was cancelled by the caller
    Cancelled,
    /// Run failed with an error
    Failed,
}

impl AnalysisStage {
    /// Human-readable name of the stage.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Preparing => "Preparing Data",
            Self::PropensityModel => "Estimating Propensity Scores",
            Self::Matching => "Matching Units",
            Self::Balance => "Checking Balance",
            Self::OutcomeModel => "Estimating Effect",
            Self::BandwidthSelection => "Selecting Bandwidth",
            Self::Estimation => "Estimating Discontinuity",
            Self::PlotData => "Preparing Plot Data",
            Self::ReportGeneration => "Generating Reports",
            Self::Complete => "Complete",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }

    /// Share of the whole run spent in this stage.
    ///
    /// The stages of a matching study sum to 1.0, and so do the stages of
    /// a discontinuity study.
    pub fn weight(&self) -> f32 {
        match self {
            Self::Initializing => 0.02,
            Self::Preparing => 0.08,
            Self::PropensityModel => 0.20,
            Self::Matching => 0.30,
            Self::Balance => 0.15,
            Self::OutcomeModel => 0.15,
            Self::BandwidthSelection => 0.30,
            Self::Estimation => 0.40,
            Self::PlotData => 0.10,
            Self::ReportGeneration => 0.10,
            Self::Complete | Self::Cancelled | Self::Failed => 0.0,
        }
    }

    /// Cumulative progress at the start of this stage.
    pub fn base_progress(&self) -> f32 {
        match self {
            Self::Initializing => 0.0,
            Self::Preparing => 0.02,
            Self::PropensityModel => 0.10,
            Self::Matching => 0.30,
            Self::Balance => 0.60,
            Self::OutcomeModel => 0.75,
            Self::BandwidthSelection => 0.10,
            Self::Estimation => 0.40,
            Self::PlotData => 0.80,
            Self::ReportGeneration => 0.90,
            Self::Complete => 1.0,
            Self::Cancelled | Self::Failed => 0.0,
        }
    }
}

/// Progress of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: AnalysisStage,

    /// Optional detail, e.g. "Bandwidth ×0.5"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_stage: Option<String>,

    /// Overall progress (0.0 - 1.0)
    pub progress: f32,

    /// Progress within the current stage (0.0 - 1.0)
    pub stage_progress: f32,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_total: Option<usize>,
}

impl ProgressUpdate {
    fn build(
        stage: AnalysisStage,
        sub_stage: Option<String>,
        stage_progress: f32,
        message: String,
    ) -> Self {
        let stage_progress = stage_progress.clamp(0.0, 1.0);
        let progress = stage.base_progress() + stage.weight() * stage_progress;
        Self {
            stage,
            sub_stage,
            progress: progress.clamp(0.0, 1.0),
            stage_progress,
            message,
            items_processed: None,
            items_total: None,
        }
    }

    pub fn new(stage: AnalysisStage, stage_progress: f32, message: impl Into<String>) -> Self {
        Self::build(stage, None, stage_progress, message.into())
    }

    pub fn with_sub_stage(
        stage: AnalysisStage,
        sub_stage: impl Into<String>,
        stage_progress: f32,
        message: impl Into<String>,
    ) -> Self {
        Self::build(stage, Some(sub_stage.into()), stage_progress, message.into())
    }

    /// Progress through `total` items of one stage.
    pub fn with_items(
        stage: AnalysisStage,
        sub_stage: impl Into<String>,
        current: usize,
        total: usize,
        message: impl Into<String>,
    ) -> Self {
        let stage_progress = if total > 0 {
            current as f32 / total as f32
        } else {
            0.0
        };
        let mut update = Self::build(stage, Some(sub_stage.into()), stage_progress, message.into());
        update.items_processed = Some(current);
        update.items_total = Some(total);
        update
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::build(AnalysisStage::Complete, None, 1.0, message.into())
    }

    pub fn cancelled() -> Self {
        Self::build(
            AnalysisStage::Cancelled,
            None,
            0.0,
            "Analysis cancelled by caller".to_string(),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::build(AnalysisStage::Failed, None, 0.0, message.into())
    }
}

/// Receiver of progress updates.
///
/// Implementations must be `Send + Sync`; runs may report from a worker
/// thread.
pub trait ProgressReporter: Send + Sync {
    /// Called at every stage boundary and within long stages. Keep it
    /// non-blocking.
    fn report(&self, update: ProgressUpdate);
}

/// [`ProgressReporter`] backed by a closure.
pub struct ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    callback: F,
}

impl<F> ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        (self.callback)(update);
    }
}

/// Shared flag for cancelling a run from another thread.
///
/// Clones share state. A run checks the token between stages and returns
/// [`CausalError::Cancelled`](crate::error::CausalError::Cancelled) once it
/// is set.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

static_assertions::assert_impl_all!(CancellationToken: Send, Sync);
static_assertions::assert_impl_all!(ProgressUpdate: Send, Sync);

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Safe to call from any thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for another run.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}
