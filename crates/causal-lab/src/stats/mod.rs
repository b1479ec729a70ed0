//! Statistics module.
//!
//! Descriptive summaries, reference distributions and t-tests used for
//! the descriptive comparisons that open an analysis.

pub mod descriptive;
pub mod inference;
pub mod ttest;

pub use descriptive::{GroupSummary, Summary, group_means, summarize, summarize_column};
pub use ttest::{TTestResult, t_test_by_group, t_test_one_sample, t_test_two_sample};
