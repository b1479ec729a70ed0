//! R-style model formulas.
//!
//! Supported syntax: `y ~ a + b + a:b + c*d + factor(g) - 1`.
//! `*` expands to all main effects and interactions of its operands,
//! `:` builds a single interaction, `factor(x)` forces categorical coding,
//! and `- 1` / `+ 0` drops the intercept.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CausalError, Result};

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_.][A-Za-z0-9_.]*$").expect("Invalid regex: variable name")
});

static FACTOR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^factor\(\s*([A-Za-z_.][A-Za-z0-9_.]*)\s*\)$").expect("Invalid regex: factor()")
});

/// One variable inside a term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TermPart {
    /// Column used as-is (string columns are still coded as categories)
    Variable(String),
    /// Column wrapped in `factor()`
    Factor(String),
}

impl TermPart {
    /// Column name referenced by this part.
    pub fn variable(&self) -> &str {
        match self {
            Self::Variable(name) | Self::Factor(name) => name,
        }
    }

    /// Label used in coefficient names.
    pub fn label(&self) -> String {
        match self {
            Self::Variable(name) => name.clone(),
            Self::Factor(name) => format!("factor({})", name),
        }
    }
}

/// A main effect (one part) or an interaction (several parts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub parts: Vec<TermPart>,
}

impl Term {
    /// Label such as `a`, `factor(g)` or `a:b`.
    pub fn label(&self) -> String {
        self.parts
            .iter()
            .map(TermPart::label)
            .collect::<Vec<_>>()
            .join(":")
    }

    fn key(&self) -> Vec<String> {
        let mut key: Vec<String> = self.parts.iter().map(TermPart::label).collect();
        key.sort();
        key
    }

    fn same_as(&self, other: &Term) -> bool {
        self.key() == other.key()
    }
}

/// A parsed model formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    pub raw: String,
    pub response: Option<String>,
    pub terms: Vec<Term>,
    pub intercept: bool,
}

fn invalid(formula: &str, reason: impl Into<String>) -> CausalError {
    CausalError::InvalidFormula {
        formula: formula.to_string(),
        reason: reason.into(),
    }
}

fn parse_part(formula: &str, token: &str) -> Result<TermPart> {
    let token = token.trim();
    if let Some(caps) = FACTOR_PATTERN.captures(token) {
        return Ok(TermPart::Factor(caps[1].to_string()));
    }
    if NAME_PATTERN.is_match(token) {
        return Ok(TermPart::Variable(token.to_string()));
    }
    Err(invalid(formula, format!("cannot parse term '{}'", token)))
}

/// Parse `a:b` into its parts, removing repeated variables.
fn parse_interaction(formula: &str, token: &str) -> Result<Vec<TermPart>> {
    let mut parts: Vec<TermPart> = Vec::new();
    for piece in token.split(':') {
        if piece.trim().is_empty() {
            return Err(invalid(formula, format!("empty operand in '{}'", token)));
        }
        let part = parse_part(formula, piece)?;
        if !parts.contains(&part) {
            parts.push(part);
        }
    }
    Ok(parts)
}

/// Expand `a*b*c` into main effects and interactions ordered by degree.
fn expand_product(formula: &str, token: &str) -> Result<Vec<Term>> {
    let operands: Vec<Vec<TermPart>> = token
        .split('*')
        .map(|op| {
            if op.trim().is_empty() {
                Err(invalid(formula, format!("empty operand in '{}'", token)))
            } else {
                parse_interaction(formula, op)
            }
        })
        .collect::<Result<_>>()?;

    let k = operands.len();
    if k > 16 {
        return Err(invalid(formula, "too many operands in product term"));
    }

    let mut masks: Vec<u32> = (1..(1u32 << k)).collect();
    masks.sort_by_key(|m| (m.count_ones(), *m));

    let mut terms = Vec::with_capacity(masks.len());
    for mask in masks {
        let mut parts: Vec<TermPart> = Vec::new();
        for (i, operand) in operands.iter().enumerate() {
            if mask & (1 << i) != 0 {
                for part in operand {
                    if !parts.contains(part) {
                        parts.push(part.clone());
                    }
                }
            }
        }
        terms.push(Term { parts });
    }
    Ok(terms)
}

/// Split the right-hand side on top-level `+` and `-`.
fn split_signed(rhs: &str) -> Vec<(bool, String)> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut positive = true;
    let mut depth = 0i32;

    for ch in rhs.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth -= 1;
                current.push(ch);
            }
            '+' | '-' if depth == 0 => {
                tokens.push((positive, std::mem::take(&mut current)));
                positive = ch == '+';
            }
            _ => current.push(ch),
        }
    }
    tokens.push((positive, current));
    tokens
}

impl Formula {
    /// Parse a formula with a response: `y ~ x1 + x2`.
    pub fn parse(formula: &str) -> Result<Self> {
        let sides: Vec<&str> = formula.split('~').collect();
        if sides.len() != 2 {
            return Err(invalid(formula, "expected exactly one '~'"));
        }

        let response = sides[0].trim();
        if response.is_empty() {
            return Self::parse_rhs_with_raw(formula, sides[1]);
        }
        if !NAME_PATTERN.is_match(response) {
            return Err(invalid(formula, format!("invalid response '{}'", response)));
        }

        let mut parsed = Self::parse_rhs_with_raw(formula, sides[1])?;
        parsed.response = Some(response.to_string());
        Ok(parsed)
    }

    /// Parse a right-hand side only: `x1 + x2*x3`.
    pub fn parse_rhs(rhs: &str) -> Result<Self> {
        let rhs = rhs.trim().trim_start_matches('~');
        Self::parse_rhs_with_raw(rhs, rhs)
    }

    fn parse_rhs_with_raw(raw: &str, rhs: &str) -> Result<Self> {
        let mut terms: Vec<Term> = Vec::new();
        let mut intercept = true;

        if rhs.trim().is_empty() {
            return Err(invalid(raw, "empty right-hand side"));
        }

        for (index, (positive, token)) in split_signed(rhs).into_iter().enumerate() {
            let token = token.trim();
            if token.is_empty() {
                // A leading sign leaves an empty first token.
                if index == 0 {
                    continue;
                }
                return Err(invalid(raw, "dangling '+' or '-'"));
            }

            match (token, positive) {
                ("1", true) => intercept = true,
                ("1", false) | ("0", true) => intercept = false,
                ("0", false) => intercept = true,
                _ => {
                    let expanded = expand_product(raw, token)?;
                    if positive {
                        for term in expanded {
                            if !terms.iter().any(|t| t.same_as(&term)) {
                                terms.push(term);
                            }
                        }
                    } else {
                        terms.retain(|t| !expanded.iter().any(|r| r.same_as(t)));
                    }
                }
            }
        }

        if terms.is_empty() && !intercept {
            return Err(invalid(raw, "model has no terms and no intercept"));
        }

        Ok(Self {
            raw: raw.trim().to_string(),
            response: None,
            terms,
            intercept,
        })
    }

    /// Every referenced column, response first, without duplicates.
    pub fn variables(&self) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        if let Some(response) = &self.response {
            vars.push(response.clone());
        }
        for term in &self.terms {
            for part in &term.parts {
                let name = part.variable().to_string();
                if !vars.contains(&name) {
                    vars.push(name);
                }
            }
        }
        vars
    }

    /// Right-hand side variables only.
    pub fn predictors(&self) -> Vec<String> {
        let vars = self.variables();
        match &self.response {
            Some(_) => vars.into_iter().skip(1).collect(),
            None => vars,
        }
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rhs: Vec<String> = self.terms.iter().map(Term::label).collect();
        if !self.intercept {
            rhs.push("- 1".to_string());
        }
        let rhs = if rhs.is_empty() { "1".to_string() } else { rhs.join(" + ").replace("+ - 1", "- 1") };
        match &self.response {
            Some(response) => write!(f, "{} ~ {}", response, rhs),
            None => write!(f, "~ {}", rhs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn labels(formula: &Formula) -> Vec<String> {
        formula.terms.iter().map(Term::label).collect()
    }

    #[test]
    fn test_simple_formula() {
        let f = Formula::parse("wage ~ educ + age").unwrap();
        assert_eq!(f.response.as_deref(), Some("wage"));
        assert_eq!(labels(&f), vec!["educ", "age"]);
        assert!(f.intercept);
    }

    #[test]
    fn test_product_expansion() {
        let f = Formula::parse("all ~ over21 * agecell").unwrap();
        assert_eq!(labels(&f), vec!["over21", "agecell", "over21:agecell"]);

        let f = Formula::parse("y ~ a*b*c").unwrap();
        assert_eq!(
            labels(&f),
            vec!["a", "b", "c", "a:b", "a:c", "b:c", "a:b:c"]
        );
    }

    #[test]
    fn test_factor_and_interaction() {
        let f = Formula::parse("trust ~ female:educ + factor(cntry)").unwrap();
        assert_eq!(labels(&f), vec!["female:educ", "factor(cntry)"]);
        assert_eq!(f.variables(), vec!["trust", "female", "educ", "cntry"]);
        assert_eq!(f.predictors(), vec!["female", "educ", "cntry"]);
    }

    #[test]
    fn test_intercept_removal_and_term_removal() {
        let f = Formula::parse("y ~ x - 1").unwrap();
        assert!(!f.intercept);
        let f = Formula::parse("y ~ 0 + x").unwrap();
        assert!(!f.intercept);
        let f = Formula::parse("y ~ a*b - a:b").unwrap();
        assert_eq!(labels(&f), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let f = Formula::parse("y ~ a + a + b:a + a:b").unwrap();
        assert_eq!(labels(&f), vec!["a", "b:a"]);
    }

    #[test]
    fn test_rhs_only() {
        let f = Formula::parse_rhs("age + female + factor(educ)").unwrap();
        assert!(f.response.is_none());
        assert_eq!(f.variables(), vec!["age", "female", "educ"]);

        let f = Formula::parse("~ age").unwrap();
        assert!(f.response.is_none());
    }

    #[test]
    fn test_invalid_formulas() {
        for bad in ["y ~", "y ~ a +", "y ~ log(a)", "y ~~ a", "y ~ a::b", "3y ~ a", "y ~ -1"] {
            let err = Formula::parse(bad).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_FORMULA", "formula {:?}", bad);
        }
    }

    #[test]
    fn test_display() {
        let f = Formula::parse("y ~ a*b - 1").unwrap();
        assert_eq!(f.to_string(), "y ~ a + b + a:b - 1");
    }
}
