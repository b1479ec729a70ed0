//! Typed column accessors.
//!
//! Analysis code works on plain vectors; these helpers pull a named
//! column out of a frame as `Option<f64>` or `Option<String>` values,
//! treating survey missing-value markers as missing.

use polars::prelude::*;
use std::collections::BTreeSet;

use crate::error::{CausalError, Result};
use crate::utils::{DtypeCategory, get_dtype_category, is_missing_marker, parse_numeric_string};

fn column_series(df: &DataFrame, name: &str) -> Result<Series> {
    let column = df
        .column(name)
        .map_err(|_| CausalError::ColumnNotFound(name.to_string()))?;
    Ok(column.as_materialized_series().clone())
}

/// Render a numeric value as a level label (`2` rather than `2.0`).
pub fn format_level(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

/// Check whether a column holds numbers (or booleans).
pub fn is_numeric_column(df: &DataFrame, name: &str) -> Result<bool> {
    let series = column_series(df, name)?;
    Ok(matches!(
        get_dtype_category(series.dtype()),
        DtypeCategory::Numeric | DtypeCategory::Boolean
    ))
}

/// Extract a column as `f64` values.
///
/// Numeric and boolean columns are cast; string columns are parsed
/// leniently, so `"NA"` or `"n/a"` become `None`. Non-finite values are
/// treated as missing.
pub fn numeric_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let series = column_series(df, name)?;
    match get_dtype_category(series.dtype()) {
        DtypeCategory::Numeric | DtypeCategory::Boolean => {
            let cast = series.cast(&DataType::Float64)?;
            let values = cast
                .f64()?
                .into_iter()
                .map(|v| v.filter(|x| x.is_finite()))
                .collect();
            Ok(values)
        }
        DtypeCategory::Label => {
            let cast = series.cast(&DataType::String)?;
            let values = cast
                .str()?
                .into_iter()
                .map(|v| v.and_then(parse_numeric_string))
                .collect();
            Ok(values)
        }
        DtypeCategory::Other => Err(CausalError::InvalidConfig(format!(
            "column '{}' has unsupported type {} for numeric use",
            name,
            series.dtype()
        ))),
    }
}

/// Extract a column as labels.
///
/// Numeric columns are rendered with [`format_level`] so that `1.0`
/// and `1` produce the same label.
pub fn string_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    if is_numeric_column(df, name)? {
        let values = numeric_values(df, name)?;
        return Ok(values.into_iter().map(|v| v.map(format_level)).collect());
    }

    let series = column_series(df, name)?;
    let cast = series.cast(&DataType::String)?;
    let values = cast
        .str()?
        .into_iter()
        .map(|v| {
            v.filter(|s| !is_missing_marker(s))
                .map(|s| s.trim().to_string())
        })
        .collect();
    Ok(values)
}

/// Distinct non-missing levels of a column, sorted.
///
/// Numeric columns sort numerically, label columns lexicographically.
pub fn distinct_levels(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    if is_numeric_column(df, name)? {
        let mut values: Vec<f64> = numeric_values(df, name)?.into_iter().flatten().collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        values.dedup();
        return Ok(values.into_iter().map(format_level).collect());
    }

    let levels: BTreeSet<String> = string_values(df, name)?.into_iter().flatten().collect();
    Ok(levels.into_iter().collect())
}

/// Row mask that is `true` where every listed column is non-missing.
pub fn complete_rows(df: &DataFrame, columns: &[&str]) -> Result<Vec<bool>> {
    let mut mask = vec![true; df.height()];
    for &name in columns {
        if is_numeric_column(df, name)? {
            for (keep, value) in mask.iter_mut().zip(numeric_values(df, name)?) {
                *keep &= value.is_some();
            }
        } else {
            for (keep, value) in mask.iter_mut().zip(string_values(df, name)?) {
                *keep &= value.is_some();
            }
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn survey() -> DataFrame {
        df!(
            "income" => &[Some(1200.0f64), None, Some(800.0), Some(950.5)],
            "educ" => &["Upper secondary", "NA", "Tertiary", "Lower secondary"],
            "wave" => &[2i64, 10, 1, 2],
            "coded" => &["1", "n/a", "0", "1"]
        )
        .unwrap()
    }

    #[test]
    fn test_numeric_values_from_numeric_and_string_columns() {
        let df = survey();
        assert_eq!(
            numeric_values(&df, "income").unwrap(),
            vec![Some(1200.0), None, Some(800.0), Some(950.5)]
        );
        assert_eq!(
            numeric_values(&df, "coded").unwrap(),
            vec![Some(1.0), None, Some(0.0), Some(1.0)]
        );
    }

    #[test]
    fn test_string_values_treat_markers_as_missing() {
        let df = survey();
        let educ = string_values(&df, "educ").unwrap();
        assert_eq!(educ[1], None);
        assert_eq!(educ[2].as_deref(), Some("Tertiary"));
    }

    #[test]
    fn test_distinct_levels_numeric_order() {
        let df = survey();
        assert_eq!(distinct_levels(&df, "wave").unwrap(), vec!["1", "2", "10"]);
        assert_eq!(
            distinct_levels(&df, "educ").unwrap(),
            vec!["Lower secondary", "Tertiary", "Upper secondary"]
        );
    }

    #[test]
    fn test_complete_rows() {
        let df = survey();
        let mask = complete_rows(&df, &["income", "educ"]).unwrap();
        assert_eq!(mask, vec![true, false, true, true]);
    }

    #[test]
    fn test_missing_column() {
        let df = survey();
        let err = numeric_values(&df, "age").unwrap_err();
        assert_eq!(err.error_code(), "COLUMN_NOT_FOUND");
    }
}
