//! Dataset access module.
//!
//! This module loads survey and administrative datasets into polars
//! frames, exposes typed column accessors, and implements the recoding
//! steps applied before analysis (binary collapses, centering a running
//! variable, threshold indicators, subsetting).

pub mod columns;
pub mod loader;
pub mod recode;

pub use columns::{complete_rows, distinct_levels, is_numeric_column, numeric_values, string_values};
pub use loader::{load_dataset, write_csv};
pub use recode::{Recode, apply_recodes};
