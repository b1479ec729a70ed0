//! Plain-text tables for terminal output.
//!
//! Layouts follow the summaries statistical packages print: a
//! coefficient block with significance stars, the t-test banner, and the
//! match summary of a balance assessment.

use std::fmt::Write;

use crate::config::Alternative;
use crate::matching::balance::{BalanceRow, BalanceStats, BalanceTable, GroupCount};
use crate::matching::outcome::EffectEstimate;
use crate::models::logit::LogitModel;
use crate::models::ols::{Coefficient, LinearModel};
use crate::rdd::estimate::{BandwidthChoice, RdAnalysis, RdDesign};
use crate::stats::descriptive::Summary;
use crate::stats::ttest::TTestResult;
use crate::utils::{format_number, format_p_value, significance_stars, truncate_label};

const TERM_WIDTH: usize = 24;
const SIGNIF_CODES: &str = "Signif. codes:  0 '***' 0.001 '**' 0.01 '*' 0.05 '.' 0.1 ' ' 1";

fn rule(out: &mut String, width: usize) {
    let _ = writeln!(out, "{}", "-".repeat(width));
}

fn optional(value: Option<f64>) -> String {
    value.map(format_number).unwrap_or_else(|| "".to_string())
}

/// Coefficient block: estimate, standard error, statistic and p-value.
///
/// `statistic_label` is `t value` for linear models and `z value` for
/// likelihood-based ones.
pub fn coefficient_table(coefficients: &[Coefficient], statistic_label: &str) -> String {
    let mut out = String::new();
    let p_label = if statistic_label.starts_with('z') {
        "Pr(>|z|)"
    } else {
        "Pr(>|t|)"
    };
    let _ = writeln!(
        out,
        "{:<width$} {:>12} {:>12} {:>10} {:>10}",
        "",
        "Estimate",
        "Std. Error",
        statistic_label,
        p_label,
        width = TERM_WIDTH
    );
    for c in coefficients {
        let _ = writeln!(
            out,
            "{:<width$} {:>12} {:>12} {:>10} {:>10} {}",
            truncate_label(&c.term, TERM_WIDTH),
            format_number(c.estimate),
            format_number(c.std_error),
            format!("{:.3}", c.statistic),
            format_p_value(c.p_value),
            significance_stars(c.p_value),
            width = TERM_WIDTH
        );
    }
    out
}

pub fn linear_model_table(model: &LinearModel) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Formula: {}", model.formula);
    if model.weighted {
        let _ = writeln!(out, "Weighted least squares");
    }
    if let Some(absorbed) = &model.absorbed {
        let _ = writeln!(
            out,
            "Fixed effects: {} ({} levels absorbed)",
            absorbed.column, absorbed.levels
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Coefficients:");
    out.push_str(&coefficient_table(&model.coefficients, "t value"));
    let _ = writeln!(out, "---");
    let _ = writeln!(out, "{}", SIGNIF_CODES);
    let _ = writeln!(out);

    let _ = writeln!(
        out,
        "Residual standard error: {} on {} degrees of freedom",
        format_number(model.sigma),
        model.df_residual
    );
    if model.dropped_rows > 0 {
        let _ = writeln!(out, "  ({} observations deleted due to missingness)", model.dropped_rows);
    }
    let _ = writeln!(
        out,
        "Multiple R-squared: {:.4},\tAdjusted R-squared: {:.4}",
        model.r_squared, model.adj_r_squared
    );
    if let Some(f) = &model.f_test {
        let _ = writeln!(
            out,
            "F-statistic: {:.3} on {} and {} DF,  p-value: {}",
            f.statistic,
            f.df_model,
            f.df_residual,
            format_p_value(f.p_value)
        );
    }
    let _ = write!(out, "Standard errors: {}", model.covariance);
    if let Some(g) = model.n_clusters {
        let _ = write!(out, " with {} clusters", g);
    }
    let _ = writeln!(out);
    out
}

pub fn logit_table(model: &LogitModel) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Formula: {}  (binomial, logit link)", model.formula);
    let _ = writeln!(out);
    let _ = writeln!(out, "Coefficients:");
    out.push_str(&coefficient_table(&model.coefficients, "z value"));
    let _ = writeln!(out, "---");
    let _ = writeln!(out, "{}", SIGNIF_CODES);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "    Null deviance: {:.2}  on {} degrees of freedom",
        model.null_deviance, model.df_null
    );
    let _ = writeln!(
        out,
        "Residual deviance: {:.2}  on {} degrees of freedom",
        model.deviance, model.df_residual
    );
    if model.dropped_rows > 0 {
        let _ = writeln!(out, "  ({} observations deleted due to missingness)", model.dropped_rows);
    }
    let _ = writeln!(out, "AIC: {:.2}", model.aic);
    let _ = writeln!(out);
    let _ = writeln!(out, "Number of Fisher Scoring iterations: {}", model.iterations);
    if !model.converged {
        let _ = writeln!(out, "Warning: algorithm did not converge");
    }
    if model.separation {
        let _ = writeln!(out, "Warning: fitted probabilities numerically 0 or 1 occurred");
    }
    out
}

pub fn t_test_summary(result: &TTestResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", result.method);
    let _ = writeln!(out);
    if let Some((x, y)) = &result.levels {
        let _ = writeln!(out, "groups: {} vs {}", x, y);
    }
    let _ = writeln!(
        out,
        "t = {:.4}, df = {:.2}, p-value = {}",
        result.statistic,
        result.df,
        format_p_value(result.p_value)
    );
    let relation = match result.alternative {
        Alternative::TwoSided => "not equal to",
        Alternative::Less => "less than",
        Alternative::Greater => "greater than",
    };
    let subject = if result.mean_y.is_some() {
        "difference in means"
    } else {
        "mean"
    };
    let _ = writeln!(
        out,
        "alternative hypothesis: true {} is {} {}",
        subject,
        relation,
        format_number(result.null_value)
    );
    let _ = writeln!(
        out,
        "{:.0} percent confidence interval:\n {} {}",
        result.conf_level * 100.0,
        format_number(result.conf_low),
        format_number(result.conf_high)
    );
    let _ = writeln!(out, "sample estimates:");
    match (result.mean_y, &result.levels) {
        (Some(mean_y), Some((x, y))) => {
            let _ = writeln!(out, " mean in group {}: {}", x, format_number(result.mean_x));
            let _ = writeln!(out, " mean in group {}: {}", y, format_number(mean_y));
        }
        (Some(mean_y), None) => {
            let _ = writeln!(out, " mean of x: {}", format_number(result.mean_x));
            let _ = writeln!(out, " mean of y: {}", format_number(mean_y));
        }
        (None, _) => {
            let _ = writeln!(out, " mean of x: {}", format_number(result.mean_x));
        }
    }
    out
}

pub fn summary_table(summaries: &[(String, Summary)]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:>7} {:>7} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "Column", "N", "Missing", "Mean", "SD", "Min", "Q1", "Median", "Q3", "Max"
    );
    rule(&mut out, 120);
    for (name, s) in summaries {
        let _ = writeln!(
            out,
            "{:<20} {:>7} {:>7} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            truncate_label(name, 20),
            s.n,
            s.missing,
            format_number(s.mean),
            format_number(s.sd),
            format_number(s.min),
            format_number(s.q1),
            format_number(s.median),
            format_number(s.q3),
            format_number(s.max)
        );
    }
    out
}

fn balance_block(
    out: &mut String,
    title: &str,
    table: &BalanceTable,
    pick: fn(&BalanceRow) -> &BalanceStats,
) {
    let _ = writeln!(out, "{}:", title);
    let _ = writeln!(
        out,
        "{:<width$} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
        "",
        "Means Tr.",
        "Means Ct.",
        "Std. Diff",
        "Var. Ratio",
        "eCDF Mean",
        "eCDF Max",
        width = TERM_WIDTH
    );
    for row in &table.rows {
        let stats = pick(row);
        let _ = writeln!(
            out,
            "{:<width$} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            truncate_label(&row.variable, TERM_WIDTH),
            format_number(stats.mean_treated),
            format_number(stats.mean_control),
            format_number(stats.std_mean_diff),
            optional(stats.var_ratio),
            format_number(stats.ecdf_mean),
            format_number(stats.ecdf_max),
            width = TERM_WIDTH
        );
    }
    let _ = writeln!(out);
}

fn count_row(out: &mut String, label: &str, count: &GroupCount) {
    let _ = writeln!(
        out,
        "{:<12} {:>10} {:>10}",
        label,
        format_count(count.control),
        format_count(count.treated)
    );
}

fn format_count(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

/// Match summary: balance in the full and matched samples, percent
/// improvement and sample sizes.
pub fn balance_table(table: &BalanceTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Estimand: {}", table.estimand);
    let _ = writeln!(out);
    balance_block(&mut out, "Summary of Balance for All Data", table, |r| &r.all);
    balance_block(&mut out, "Summary of Balance for Matched Data", table, |r| &r.matched);

    let _ = writeln!(out, "Percent Balance Improvement:");
    let _ = writeln!(
        out,
        "{:<width$} {:>10} {:>10} {:>10} {:>10}",
        "",
        "Std. Diff",
        "Var. Ratio",
        "eCDF Mean",
        "eCDF Max",
        width = TERM_WIDTH
    );
    let percent = |v: Option<f64>| v.map(|p| format!("{:.1}", p)).unwrap_or_default();
    for row in &table.rows {
        let imp = &row.improvement;
        let _ = writeln!(
            out,
            "{:<width$} {:>10} {:>10} {:>10} {:>10}",
            truncate_label(&row.variable, TERM_WIDTH),
            percent(imp.std_mean_diff),
            percent(imp.var_ratio),
            percent(imp.ecdf_mean),
            percent(imp.ecdf_max),
            width = TERM_WIDTH
        );
    }
    let _ = writeln!(out);

    let sizes = &table.sample_sizes;
    let _ = writeln!(out, "Sample Sizes:");
    let _ = writeln!(out, "{:<12} {:>10} {:>10}", "", "Control", "Treated");
    count_row(&mut out, "All", &sizes.all);
    count_row(&mut out, "Matched (ESS)", &sizes.effective);
    count_row(&mut out, "Matched", &sizes.matched);
    count_row(&mut out, "Unmatched", &sizes.unmatched);
    count_row(&mut out, "Discarded", &sizes.discarded);
    out
}

pub fn effect_table(effect: &EffectEstimate) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} of treatment on {}", effect.estimand, effect.outcome);
    let _ = writeln!(
        out,
        "  Estimate: {}  Std. Error: {}  t: {:.3}  p-value: {} {}",
        format_number(effect.estimate),
        format_number(effect.std_error),
        effect.statistic,
        format_p_value(effect.p_value),
        significance_stars(effect.p_value)
    );
    let _ = writeln!(
        out,
        "  CI: [{}, {}]",
        format_number(effect.conf_low),
        format_number(effect.conf_high)
    );
    let _ = write!(out, "  n = {}, standard errors: {}", effect.n, effect.covariance);
    if let Some(g) = effect.n_clusters {
        let _ = write!(out, " ({} subclasses)", g);
    }
    let _ = writeln!(out);
    out
}

pub fn rdd_table(analysis: &RdAnalysis) -> String {
    let mut out = String::new();
    let design = match analysis.design {
        RdDesign::Sharp => "Sharp",
        RdDesign::Fuzzy => "Fuzzy",
    };
    let _ = writeln!(
        out,
        "{} RD estimate of {} at {} = {}",
        design,
        analysis.outcome,
        analysis.running,
        format_number(analysis.cutpoint)
    );
    if let Some(treatment) = &analysis.treatment {
        let _ = writeln!(out, "Treatment: {}", treatment);
    }
    if !analysis.covariates.is_empty() {
        let _ = writeln!(out, "Covariates: {}", analysis.covariates.join(", "));
    }
    let source = match &analysis.bandwidth {
        BandwidthChoice::Fixed { .. } => "fixed",
        BandwidthChoice::ImbensKalyanaraman(_) => "Imbens-Kalyanaraman",
    };
    let _ = writeln!(
        out,
        "Bandwidth: {} ({}), kernel: {:?}",
        format_number(analysis.bandwidth.bandwidth()),
        source,
        analysis.kernel
    );
    let _ = writeln!(out, "Observations: {}", analysis.n_obs);
    if analysis.dropped_rows > 0 {
        let _ = writeln!(out, "  ({} observations deleted due to missingness)", analysis.dropped_rows);
    }
    let _ = writeln!(out);

    let _ = writeln!(
        out,
        "{:<10} {:>10} {:>8} {:>8} {:>12} {:>12} {:>8} {:>10} {:>22}",
        "",
        "Bandwidth",
        "N left",
        "N right",
        "Estimate",
        "Std. Error",
        "z value",
        "Pr(>|z|)",
        "CI"
    );
    for e in &analysis.estimates {
        let label = if e.multiplier == 1.0 {
            "LATE".to_string()
        } else {
            format!("x{}", e.multiplier)
        };
        let _ = writeln!(
            out,
            "{:<10} {:>10} {:>8} {:>8} {:>12} {:>12} {:>8} {:>10} {:>22} {}",
            label,
            format_number(e.bandwidth),
            e.n_left,
            e.n_right,
            format_number(e.effect.estimate),
            format_number(e.effect.std_error),
            format!("{:.3}", e.effect.statistic),
            format_p_value(e.effect.p_value),
            format!(
                "[{}, {}]",
                format_number(e.effect.conf_low),
                format_number(e.effect.conf_high)
            ),
            significance_stars(e.effect.p_value)
        );
    }
    if let Some(first) = analysis.primary().and_then(|e| e.first_stage.as_ref()) {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "First stage jump in take-up: {} (se {})",
            format_number(first.estimate),
            format_number(first.std_error)
        );
    }
    out
}
