//! Variable recoding.
//!
//! Every function takes a frame by reference and returns a new frame with
//! the target column added (or replaced when it already exists).

use polars::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::data::columns::{complete_rows, numeric_values, string_values};
use crate::error::{CausalError, Result};

fn with_numeric_column(df: &DataFrame, target: &str, values: Vec<Option<f64>>) -> Result<DataFrame> {
    let series = Series::new(target.into(), values);
    let mut out = df.clone();
    out.with_column(series)?;
    Ok(out)
}

fn filter_rows(df: &DataFrame, keep: &[bool]) -> Result<DataFrame> {
    let mask = BooleanChunked::from_slice("mask".into(), keep);
    Ok(df.filter(&mask)?)
}

/// Collapse a categorical column into a 0/1 indicator.
///
/// Rows whose label is listed in `positive_levels` become `1.0`, other
/// labelled rows `0.0`; missing labels stay missing.
pub fn binarize(
    df: &DataFrame,
    source: &str,
    target: &str,
    positive_levels: &[&str],
) -> Result<DataFrame> {
    let labels = string_values(df, source)?;
    let values: Vec<Option<f64>> = labels
        .iter()
        .map(|label| {
            label
                .as_deref()
                .map(|l| if positive_levels.contains(&l) { 1.0 } else { 0.0 })
        })
        .collect();

    let positives = values.iter().filter(|v| **v == Some(1.0)).count();
    debug!(
        "Binarized '{}' into '{}': {} of {} rows positive",
        source,
        target,
        positives,
        values.len()
    );
    with_numeric_column(df, target, values)
}

/// Collapse a categorical column into a 0/1 indicator using a regex.
pub fn binarize_matching(
    df: &DataFrame,
    source: &str,
    target: &str,
    pattern: &str,
) -> Result<DataFrame> {
    let regex = Regex::new(pattern)
        .map_err(|e| CausalError::InvalidConfig(format!("invalid pattern '{}': {}", pattern, e)))?;

    let values: Vec<Option<f64>> = string_values(df, source)?
        .iter()
        .map(|label| {
            label
                .as_deref()
                .map(|l| if regex.is_match(l) { 1.0 } else { 0.0 })
        })
        .collect();
    with_numeric_column(df, target, values)
}

/// Map labels to numbers. Labels without a mapping become missing.
pub fn map_values(
    df: &DataFrame,
    source: &str,
    target: &str,
    mapping: &[(&str, f64)],
) -> Result<DataFrame> {
    let lookup: HashMap<&str, f64> = mapping.iter().copied().collect();
    let labels = string_values(df, source)?;

    let mut unmapped = 0usize;
    let values: Vec<Option<f64>> = labels
        .iter()
        .map(|label| match label.as_deref() {
            Some(l) => {
                let mapped = lookup.get(l).copied();
                if mapped.is_none() {
                    unmapped += 1;
                }
                mapped
            }
            None => None,
        })
        .collect();

    if unmapped > 0 {
        warn!(
            "{} labelled rows of '{}' had no mapping and were set to missing",
            unmapped, source
        );
    }
    with_numeric_column(df, target, values)
}

/// Center a numeric column at a threshold (`x - threshold`).
pub fn center(df: &DataFrame, source: &str, target: &str, threshold: f64) -> Result<DataFrame> {
    let values = numeric_values(df, source)?
        .into_iter()
        .map(|v| v.map(|x| x - threshold))
        .collect();
    with_numeric_column(df, target, values)
}

/// Indicator for `x >= threshold`.
pub fn threshold_indicator(
    df: &DataFrame,
    source: &str,
    target: &str,
    threshold: f64,
) -> Result<DataFrame> {
    let values = numeric_values(df, source)?
        .into_iter()
        .map(|v| v.map(|x| if x >= threshold { 1.0 } else { 0.0 }))
        .collect();
    with_numeric_column(df, target, values)
}

/// Product of two numeric columns.
pub fn interaction(df: &DataFrame, a: &str, b: &str, target: &str) -> Result<DataFrame> {
    let left = numeric_values(df, a)?;
    let right = numeric_values(df, b)?;
    let values = left
        .into_iter()
        .zip(right)
        .map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => Some(x * y),
            _ => None,
        })
        .collect();
    with_numeric_column(df, target, values)
}

/// Keep only rows where every listed column is non-missing.
pub fn drop_missing(df: &DataFrame, columns: &[&str]) -> Result<DataFrame> {
    let mask = complete_rows(df, columns)?;
    let dropped = mask.iter().filter(|keep| !**keep).count();
    if dropped > 0 {
        info!(
            "Dropped {} of {} rows with missing values in {:?}",
            dropped,
            df.height(),
            columns
        );
    }
    filter_rows(df, &mask)
}

/// Keep rows whose label in `column` equals `value`.
pub fn subset_equals(df: &DataFrame, column: &str, value: &str) -> Result<DataFrame> {
    let labels = string_values(df, column)?;
    let mask: Vec<bool> = labels
        .iter()
        .map(|label| label.as_deref() == Some(value))
        .collect();

    let kept = mask.iter().filter(|keep| **keep).count();
    if kept == 0 {
        return Err(CausalError::InsufficientData(format!(
            "no rows with {} == '{}'",
            column, value
        )));
    }

    info!("Subset {} == '{}': {} of {} rows", column, value, kept, df.height());
    filter_rows(df, &mask)
}

/// One recoding step, as listed in a study or a JSON recode file.
///
/// ```json
/// [
///   {"op": "binarize", "source": "trust_gov", "target": "trusts_gov", "positive": ["somewhat", "a lot"]},
///   {"op": "center", "source": "agecell", "target": "age_c", "threshold": 21}
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Recode {
    Binarize {
        source: String,
        target: String,
        positive: Vec<String>,
    },
    BinarizeMatching {
        source: String,
        target: String,
        pattern: String,
    },
    MapValues {
        source: String,
        target: String,
        mapping: BTreeMap<String, f64>,
    },
    Center {
        source: String,
        target: String,
        threshold: f64,
    },
    Threshold {
        source: String,
        target: String,
        threshold: f64,
    },
    Interaction {
        a: String,
        b: String,
        target: String,
    },
}

impl Recode {
    /// Column the step writes.
    pub fn target(&self) -> &str {
        match self {
            Self::Binarize { target, .. }
            | Self::BinarizeMatching { target, .. }
            | Self::MapValues { target, .. }
            | Self::Center { target, .. }
            | Self::Threshold { target, .. }
            | Self::Interaction { target, .. } => target,
        }
    }

    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        match self {
            Self::Binarize {
                source,
                target,
                positive,
            } => {
                let levels: Vec<&str> = positive.iter().map(String::as_str).collect();
                binarize(df, source, target, &levels)
            }
            Self::BinarizeMatching {
                source,
                target,
                pattern,
            } => binarize_matching(df, source, target, pattern),
            Self::MapValues {
                source,
                target,
                mapping,
            } => {
                let pairs: Vec<(&str, f64)> =
                    mapping.iter().map(|(k, v)| (k.as_str(), *v)).collect();
                map_values(df, source, target, &pairs)
            }
            Self::Center {
                source,
                target,
                threshold,
            } => center(df, source, target, *threshold),
            Self::Threshold {
                source,
                target,
                threshold,
            } => threshold_indicator(df, source, target, *threshold),
            Self::Interaction { a, b, target } => interaction(df, a, b, target),
        }
    }

    /// Read a JSON array of steps.
    pub fn list_from_json_file(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Apply recoding steps in order; later steps may use earlier targets.
pub fn apply_recodes(df: &DataFrame, recodes: &[Recode]) -> Result<DataFrame> {
    let mut out = df.clone();
    for recode in recodes {
        out = recode
            .apply(&out)
            .map_err(|e| e.with_context(format!("recoding '{}'", recode.target())))?;
    }
    if !recodes.is_empty() {
        info!("Applied {} recoding steps", recodes.len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::columns::numeric_values;

    fn survey() -> DataFrame {
        df!(
            "cntry" => &["DE", "FR", "DE", "PL", "DE"],
            "educ" => &["Tertiary", "Primary", "Upper secondary", "NA", "Primary"],
            "age" => &[Some(20.5f64), Some(21.0), Some(22.5), None, Some(19.0)],
            "trust" => &["Agree", "Don't know", "Disagree", "Agree", "Disagree"]
        )
        .unwrap()
    }

    #[test]
    fn test_binarize_keeps_missing() {
        let df = binarize(&survey(), "educ", "higher_ed", &["Tertiary", "Upper secondary"]).unwrap();
        assert_eq!(
            numeric_values(&df, "higher_ed").unwrap(),
            vec![Some(1.0), Some(0.0), Some(1.0), None, Some(0.0)]
        );
    }

    #[test]
    fn test_binarize_matching() {
        let df = binarize_matching(&survey(), "educ", "secondary", "(?i)secondary").unwrap();
        assert_eq!(
            numeric_values(&df, "secondary").unwrap(),
            vec![Some(0.0), Some(0.0), Some(1.0), None, Some(0.0)]
        );
        assert!(binarize_matching(&survey(), "educ", "x", "(").is_err());
    }

    #[test]
    fn test_map_values_unmapped_become_missing() {
        let df = map_values(
            &survey(),
            "trust",
            "trust_num",
            &[("Agree", 1.0), ("Disagree", 0.0)],
        )
        .unwrap();
        assert_eq!(
            numeric_values(&df, "trust_num").unwrap(),
            vec![Some(1.0), None, Some(0.0), Some(1.0), Some(0.0)]
        );
    }

    #[test]
    fn test_center_and_threshold() {
        let df = center(&survey(), "age", "age_c", 21.0).unwrap();
        let df = threshold_indicator(&df, "age", "over21", 21.0).unwrap();
        assert_eq!(
            numeric_values(&df, "age_c").unwrap(),
            vec![Some(-0.5), Some(0.0), Some(1.5), None, Some(-2.0)]
        );
        assert_eq!(
            numeric_values(&df, "over21").unwrap(),
            vec![Some(0.0), Some(1.0), Some(1.0), None, Some(0.0)]
        );
    }

    #[test]
    fn test_interaction() {
        let df = threshold_indicator(&survey(), "age", "over21", 21.0).unwrap();
        let df = interaction(&df, "over21", "age", "over21_age").unwrap();
        assert_eq!(
            numeric_values(&df, "over21_age").unwrap(),
            vec![Some(0.0), Some(21.0), Some(22.5), None, Some(0.0)]
        );
    }

    #[test]
    fn test_recode_steps_from_json() {
        let steps: Vec<Recode> = serde_json::from_str(
            r#"[
                {"op": "threshold", "source": "age", "target": "over21", "threshold": 21},
                {"op": "interaction", "a": "over21", "b": "age", "target": "over21_age"},
                {"op": "map_values", "source": "trust", "target": "agree", "mapping": {"Agree": 1, "Disagree": 0}}
            ]"#,
        )
        .unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[1].target(), "over21_age");

        let df = apply_recodes(&survey(), &steps).unwrap();
        assert_eq!(
            numeric_values(&df, "over21_age").unwrap(),
            vec![Some(0.0), Some(21.0), Some(22.5), None, Some(0.0)]
        );
        assert_eq!(
            numeric_values(&df, "agree").unwrap(),
            vec![Some(1.0), None, Some(0.0), Some(1.0), Some(0.0)]
        );
    }

    #[test]
    fn test_failed_recode_names_its_target() {
        let steps = vec![Recode::Center {
            source: "income".to_string(),
            target: "income_c".to_string(),
            threshold: 0.0,
        }];
        let err = apply_recodes(&survey(), &steps).unwrap_err();
        assert!(err.to_string().contains("income_c"), "{}", err);
    }

    #[test]
    fn test_drop_missing_and_subset() {
        let df = drop_missing(&survey(), &["age", "educ"]).unwrap();
        assert_eq!(df.height(), 4);

        let de = subset_equals(&survey(), "cntry", "DE").unwrap();
        assert_eq!(de.height(), 3);

        let err = subset_equals(&survey(), "cntry", "ES").unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_DATA");
    }
}
