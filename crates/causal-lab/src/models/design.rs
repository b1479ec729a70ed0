//! Design matrices built from a formula and a data frame.
//!
//! Rows with a missing value in any referenced column (response,
//! predictors and any extra columns such as weights or clusters) are
//! dropped listwise. `row_index` maps every design row back to its row in
//! the source frame.
//!
//! Categorical terms (string columns, or any column wrapped in
//! `factor()`) are treatment-coded against their first sorted level.
//! Dummy columns are named `<term><level>`, e.g. `cntryDE` or
//! `factor(wave)2`.

use nalgebra::{DMatrix, DVector};
use polars::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use crate::data::columns::{distinct_levels, is_numeric_column, numeric_values, string_values};
use crate::error::{CausalError, Result};
use crate::models::formula::{Formula, TermPart};

/// Name of the intercept column.
pub const INTERCEPT: &str = "(Intercept)";

/// Numeric model matrix with its response.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    /// Column names, intercept first when present
    pub names: Vec<String>,
    /// Row-major values, `n * p`
    pub x: Vec<f64>,
    /// Response, when the formula has one
    pub y: Option<Vec<f64>>,
    pub n: usize,
    pub p: usize,
    /// Source-frame row of every design row
    pub row_index: Vec<usize>,
    /// Rows removed by listwise deletion
    pub dropped_rows: usize,
    pub intercept: bool,
}

enum Encoded {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<String>>),
}

impl Encoded {
    fn present(&self, row: usize) -> bool {
        match self {
            Self::Numeric(values) => values[row].is_some(),
            Self::Categorical(labels) => labels[row].is_some(),
        }
    }
}

fn encode(df: &DataFrame, part: &TermPart) -> Result<Encoded> {
    let name = part.variable();
    match part {
        TermPart::Factor(_) => Ok(Encoded::Categorical(string_values(df, name)?)),
        TermPart::Variable(_) => {
            if is_numeric_column(df, name)? {
                Ok(Encoded::Numeric(numeric_values(df, name)?))
            } else {
                Ok(Encoded::Categorical(string_values(df, name)?))
            }
        }
    }
}

/// Values of `name` at the given rows. Missing values become `NaN`.
pub fn numeric_at(df: &DataFrame, name: &str, rows: &[usize]) -> Result<Vec<f64>> {
    let values = numeric_values(df, name)?;
    Ok(rows
        .iter()
        .map(|&r| values[r].unwrap_or(f64::NAN))
        .collect())
}

/// Labels of `name` at the given rows. Missing labels become empty strings.
pub fn labels_at(df: &DataFrame, name: &str, rows: &[usize]) -> Result<Vec<String>> {
    let labels = string_values(df, name)?;
    Ok(rows
        .iter()
        .map(|&r| labels[r].clone().unwrap_or_default())
        .collect())
}

impl DesignMatrix {
    /// Build the design for `formula`, also requiring `extra` columns to
    /// be non-missing.
    pub fn build(df: &DataFrame, formula: &Formula, extra: &[&str]) -> Result<Self> {
        let mut encoded: HashMap<String, Encoded> = HashMap::new();
        let mut mask_columns: Vec<Encoded> = Vec::new();

        let response = match &formula.response {
            Some(name) => {
                let values = numeric_values(df, name)?;
                mask_columns.push(Encoded::Numeric(values.clone()));
                Some(values)
            }
            None => None,
        };

        for term in &formula.terms {
            for part in &term.parts {
                let key = part.label();
                if !encoded.contains_key(&key) {
                    encoded.insert(key, encode(df, part)?);
                }
            }
        }
        for name in extra {
            // Extra columns only take part in listwise deletion.
            if is_numeric_column(df, name)? {
                mask_columns.push(Encoded::Numeric(numeric_values(df, name)?));
            } else {
                mask_columns.push(Encoded::Categorical(string_values(df, name)?));
            }
        }

        let rows: Vec<usize> = (0..df.height())
            .filter(|&r| {
                mask_columns.iter().all(|c| c.present(r)) && encoded.values().all(|c| c.present(r))
            })
            .collect();
        let dropped_rows = df.height() - rows.len();

        if rows.is_empty() {
            return Err(CausalError::InsufficientData(format!(
                "no complete rows for '{}'",
                formula.raw
            )));
        }

        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        if formula.intercept {
            names.push(INTERCEPT.to_string());
            columns.push(vec![1.0; rows.len()]);
        }

        let mut full_coding_available = !formula.intercept;

        for term in &formula.terms {
            // Each part contributes one or more (suffix, values) columns.
            let mut blocks: Vec<Vec<(String, Vec<f64>)>> = Vec::new();
            for part in &term.parts {
                let label = part.label();
                let block = match encoded.get(&label) {
                    Some(Encoded::Numeric(values)) => {
                        vec![(label.clone(), rows.iter().filter_map(|&r| values[r]).collect())]
                    }
                    Some(Encoded::Categorical(labels)) => {
                        let levels = used_levels(df, part, labels, &rows)?;
                        if levels.len() < 2 {
                            return Err(CausalError::InsufficientData(format!(
                                "'{}' has fewer than 2 levels in the complete rows",
                                label
                            )));
                        }
                        // Without an intercept the first single-factor term
                        // keeps all of its levels.
                        let skip = if full_coding_available && term.parts.len() == 1 {
                            full_coding_available = false;
                            0
                        } else {
                            1
                        };
                        levels
                            .iter()
                            .skip(skip)
                            .map(|level| {
                                let dummy = rows
                                    .iter()
                                    .map(|&r| {
                                        if labels[r].as_deref() == Some(level.as_str()) {
                                            1.0
                                        } else {
                                            0.0
                                        }
                                    })
                                    .collect();
                                (format!("{}{}", label, level), dummy)
                            })
                            .collect()
                    }
                    None => {
                        return Err(CausalError::Internal(format!("term '{}' was not encoded", label)));
                    }
                };
                blocks.push(block);
            }

            for (name, values) in cartesian(blocks, rows.len()) {
                names.push(name);
                columns.push(values);
            }
        }

        let n = rows.len();
        let p = columns.len();
        if p == 0 {
            return Err(CausalError::InvalidFormula {
                formula: formula.raw.clone(),
                reason: "design has no columns".to_string(),
            });
        }

        let mut x = vec![0.0; n * p];
        for (j, column) in columns.iter().enumerate() {
            for (i, value) in column.iter().enumerate() {
                x[i * p + j] = *value;
            }
        }

        let y = response.map(|values| rows.iter().filter_map(|&r| values[r]).collect());

        debug!(
            "Design for '{}': {} rows x {} columns ({} dropped)",
            formula.raw, n, p, dropped_rows
        );

        Ok(Self {
            names,
            x,
            y,
            n,
            p,
            row_index: rows,
            dropped_rows,
            intercept: formula.intercept,
        })
    }

    /// Row `i` of the design.
    pub fn row(&self, i: usize) -> &[f64] {
        &self.x[i * self.p..(i + 1) * self.p]
    }

    /// Copy of column `name`.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.names.iter().position(|n| n == name)?;
        Some((0..self.n).map(|i| self.x[i * self.p + j]).collect())
    }

    /// Remove a column by name. Returns `true` if it was present.
    pub fn drop_column(&mut self, name: &str) -> bool {
        let Some(j) = self.names.iter().position(|n| n == name) else {
            return false;
        };
        let p = self.p;
        let x: Vec<f64> = self
            .x
            .iter()
            .enumerate()
            .filter(|(k, _)| k % p != j)
            .map(|(_, v)| *v)
            .collect();
        self.names.remove(j);
        self.x = x;
        self.p -= 1;
        if name == INTERCEPT {
            self.intercept = false;
        }
        true
    }

    /// Keep only the rows where `keep` is true.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        let p = self.p;
        let mut x = Vec::with_capacity(self.x.len());
        let mut rows = Vec::with_capacity(self.n);
        let mut y = self.y.as_ref().map(|_| Vec::with_capacity(self.n));

        for i in 0..self.n {
            if keep[i] {
                x.extend_from_slice(&self.x[i * p..(i + 1) * p]);
                rows.push(self.row_index[i]);
                if let (Some(out), Some(src)) = (y.as_mut(), self.y.as_ref()) {
                    out.push(src[i]);
                }
            }
        }

        self.dropped_rows += self.n - rows.len();
        self.n = rows.len();
        self.x = x;
        self.row_index = rows;
        self.y = y;
    }

    /// Design as an `n x p` matrix.
    pub fn matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.n, self.p, &self.x)
    }

    /// Response as a vector.
    pub fn response(&self) -> Result<DVector<f64>> {
        match &self.y {
            Some(y) => Ok(DVector::from_column_slice(y)),
            None => Err(CausalError::InvalidConfig(
                "model formula has no response variable".to_string(),
            )),
        }
    }
}

/// Levels of a categorical part that occur in the used rows, sorted the
/// same way as [`distinct_levels`].
fn used_levels(
    df: &DataFrame,
    part: &TermPart,
    labels: &[Option<String>],
    rows: &[usize],
) -> Result<Vec<String>> {
    let present: std::collections::HashSet<&str> =
        rows.iter().filter_map(|&r| labels[r].as_deref()).collect();
    Ok(distinct_levels(df, part.variable())?
        .into_iter()
        .filter(|level| present.contains(level.as_str()))
        .collect())
}

/// Element-wise products of every combination of columns across blocks.
fn cartesian(blocks: Vec<Vec<(String, Vec<f64>)>>, n: usize) -> Vec<(String, Vec<f64>)> {
    let mut acc: Vec<(String, Vec<f64>)> = vec![(String::new(), vec![1.0; n])];
    for block in blocks {
        let mut next = Vec::with_capacity(acc.len() * block.len());
        // Earlier parts vary fastest, matching R's column order.
        for (name_b, values_b) in &block {
            for (name_a, values_a) in &acc {
                let name = if name_a.is_empty() {
                    name_b.clone()
                } else {
                    format!("{}:{}", name_a, name_b)
                };
                let values = values_a.iter().zip(values_b).map(|(a, b)| a * b).collect();
                next.push((name, values));
            }
        }
        acc = next;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn survey() -> DataFrame {
        df!(
            "wage" => &[Some(10.0f64), Some(12.0), None, Some(15.0), Some(11.0), Some(14.0)],
            "female" => &[1.0f64, 0.0, 1.0, 0.0, 1.0, 0.0],
            "cntry" => &["DE", "FR", "DE", "PL", "FR", "PL"],
            "wave" => &[1i64, 2, 1, 2, 10, 10]
        )
        .unwrap()
    }

    #[test]
    fn test_listwise_deletion_and_row_index() {
        let f = Formula::parse("wage ~ female").unwrap();
        let design = DesignMatrix::build(&survey(), &f, &[]).unwrap();
        assert_eq!(design.n, 5);
        assert_eq!(design.dropped_rows, 1);
        assert_eq!(design.row_index, vec![0, 1, 3, 4, 5]);
        assert_eq!(design.names, vec!["(Intercept)", "female"]);
        assert_eq!(design.y.as_ref().unwrap()[2], 15.0);
    }

    #[test]
    fn test_factor_dummies() {
        let f = Formula::parse("wage ~ cntry + factor(wave)").unwrap();
        let design = DesignMatrix::build(&survey(), &f, &[]).unwrap();
        assert_eq!(
            design.names,
            vec!["(Intercept)", "cntryFR", "cntryPL", "factor(wave)2", "factor(wave)10"]
        );
        assert_eq!(design.column("cntryPL").unwrap(), vec![0.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_interaction_columns() {
        let f = Formula::parse("wage ~ female * cntry").unwrap();
        let design = DesignMatrix::build(&survey(), &f, &[]).unwrap();
        assert_eq!(
            design.names,
            vec![
                "(Intercept)",
                "female",
                "cntryFR",
                "cntryPL",
                "female:cntryFR",
                "female:cntryPL"
            ]
        );
        assert_eq!(design.column("female:cntryFR").unwrap(), vec![0.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_no_intercept_full_coding() {
        let f = Formula::parse("wage ~ cntry - 1").unwrap();
        let design = DesignMatrix::build(&survey(), &f, &[]).unwrap();
        assert_eq!(design.names, vec!["cntryDE", "cntryFR", "cntryPL"]);
    }

    #[test]
    fn test_extra_columns_participate_in_deletion() {
        let df = df!(
            "y" => &[1.0f64, 2.0, 3.0, 4.0],
            "x" => &[1.0f64, 0.0, 1.0, 0.0],
            "w" => &[Some(1.0f64), None, Some(2.0), Some(1.0)]
        )
        .unwrap();
        let f = Formula::parse("y ~ x").unwrap();
        let design = DesignMatrix::build(&df, &f, &["w"]).unwrap();
        assert_eq!(design.row_index, vec![0, 2, 3]);
    }

    #[test]
    fn test_drop_and_retain() {
        let f = Formula::parse("wage ~ female").unwrap();
        let mut design = DesignMatrix::build(&survey(), &f, &[]).unwrap();
        assert!(design.drop_column(INTERCEPT));
        assert!(!design.intercept);
        assert_eq!(design.p, 1);
        design.retain_rows(&[true, false, true, true, false]);
        assert_eq!(design.n, 3);
        assert_eq!(design.row_index, vec![0, 3, 4]);
        assert_eq!(design.x, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_single_level_factor_rejected() {
        let df = df!("y" => &[1.0f64, 2.0], "g" => &["a", "a"]).unwrap();
        let f = Formula::parse("y ~ g").unwrap();
        let err = DesignMatrix::build(&df, &f, &[]).unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_DATA");
    }

    #[test]
    fn test_missing_column() {
        let f = Formula::parse("wage ~ educ").unwrap();
        let err = DesignMatrix::build(&survey(), &f, &[]).unwrap_err();
        assert_eq!(err.error_code(), "COLUMN_NOT_FOUND");
    }
}
