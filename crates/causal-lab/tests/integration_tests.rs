//! Integration tests for causal-lab.
//!
//! These tests run the workshop analyses end to end on the survey and
//! mortality fixtures.

use causal_lab::config::{CovarianceType, Estimand, Kernel, MatchingMethod, TTestKind};
use causal_lab::data::columns::numeric_values;
use causal_lab::data::recode::{Recode, binarize, center, drop_missing, threshold_indicator};
use causal_lab::models::{LmOptions, glm_logit, lm};
use causal_lab::rdd::{RdDesign, ik_bandwidth, ik_bandwidth_details, rd_estimate};
use causal_lab::stats::{summarize_column, t_test_by_group};
use causal_lab::{
    AnalysisConfig, AnalysisReport, AnalysisStage, CancellationToken, DiscontinuityStudy,
    MatchingStudy, Pipeline, RddConfig, ReportKind, load_dataset,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Helper Functions
// ============================================================================

fn fixtures_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn survey() -> polars::prelude::DataFrame {
    load_dataset(fixtures_path().join("survey.csv")).expect("Failed to read survey fixture")
}

fn mortality() -> polars::prelude::DataFrame {
    load_dataset(fixtures_path().join("mortality.csv")).expect("Failed to read mortality fixture")
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("causal_lab_it_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

// ============================================================================
// Data and descriptive statistics
// ============================================================================

#[test]
fn test_load_and_summarize_survey() {
    let df = survey();
    assert_eq!(df.shape(), (240, 8));

    let trust = summarize_column(&df, "trust").unwrap();
    assert_eq!(trust.n, 236);
    assert_eq!(trust.missing, 4);
    assert!(trust.min >= 0.0 && trust.max <= 10.0);
}

#[test]
fn test_recode_ordinal_answer() {
    let df = binarize(&survey(), "trust_gov", "trusts_gov", &["somewhat", "a lot"]).unwrap();
    let values = numeric_values(&df, "trusts_gov").unwrap();
    assert!(values.iter().all(|v| matches!(v, Some(x) if *x == 0.0 || *x == 1.0)));
    assert!(values.iter().any(|v| *v == Some(1.0)));
}

#[test]
fn test_missing_file() {
    let err = load_dataset(fixtures_path().join("nope.csv")).unwrap_err();
    assert_eq!(err.error_code(), "IO_ERROR");
}

// ============================================================================
// t-tests and regression
// ============================================================================

#[test]
fn test_welch_t_test_trust_by_union() {
    let df = survey();
    let result = t_test_by_group(
        &df,
        "trust",
        "union",
        TTestKind::Welch,
        Default::default(),
        0.95,
    )
    .unwrap();

    assert_eq!(result.levels, Some(("0".to_string(), "1".to_string())));
    assert_eq!(result.n_x, 192);
    assert_eq!(result.n_y, Some(44));
    assert!((result.mean_x - 5.5734375).abs() < 1e-9);
    assert!((result.statistic - -8.17660094682245).abs() < 1e-6);
    assert!((result.df - 78.09032085177607).abs() < 1e-6);
    assert!(result.p_value < 1e-6);
    assert!(result.conf_high < 0.0);
}

#[test]
fn test_country_fixed_effects_dummies_match_absorbed() {
    let df = survey();
    let dummies = lm(&df, "trust ~ union + age + educ + factor(cntry)", &LmOptions::default()).unwrap();
    let absorbed = lm(
        &df,
        "trust ~ union + age + educ",
        &LmOptions {
            absorb: Some("cntry".to_string()),
            ..LmOptions::default()
        },
    )
    .unwrap();

    assert_eq!(dummies.n_obs, 236);
    assert_eq!(dummies.dropped_rows, 4);
    let a = dummies.coefficient("union").unwrap();
    let b = absorbed.coefficient("union").unwrap();
    assert!((a.estimate - b.estimate).abs() < 1e-8);
    assert!((a.std_error - b.std_error).abs() < 1e-8);
    assert!(a.estimate > 0.0);
}

#[test]
fn test_interaction_and_clustered_errors() {
    let df = survey();
    let model = lm(
        &df,
        "trust ~ union * female",
        &LmOptions {
            cluster: Some("cntry".to_string()),
            ..LmOptions::default()
        },
    )
    .unwrap();
    assert!(model.coefficient("union:female").is_some());
    assert_eq!(model.n_clusters, Some(3));

    let robust = lm(
        &df,
        "trust ~ union * female",
        &LmOptions {
            covariance: CovarianceType::Hc1,
            ..LmOptions::default()
        },
    )
    .unwrap();
    let (c, r) = (
        model.coefficient("union").unwrap(),
        robust.coefficient("union").unwrap(),
    );
    assert_eq!(c.estimate, r.estimate);
}

#[test]
fn test_logit_union_membership() {
    let model = glm_logit(&survey(), "union ~ age + female + educ", None, 0.95).unwrap();
    assert!(model.converged);
    assert_eq!(model.n_obs, 240);
    assert!(model.deviance < model.null_deviance);
    assert_eq!(model.coefficients.len(), 4);
}

// ============================================================================
// Matching
// ============================================================================

#[test]
fn test_nearest_matching_within_country() {
    let pipeline = Pipeline::builder().build().unwrap();
    let study = MatchingStudy::new("union", "age + female + educ")
        .outcome("trust")
        .subset("cntry", "DE")
        .drop_missing(true);

    let report = pipeline.run_matching(&survey(), &study).unwrap();

    let treated = report.balance.sample_sizes.all.treated;
    assert_eq!(report.matching.matched_treated as f64, treated);
    assert_eq!(report.matching.matched_control, report.matching.matched_treated);
    assert_eq!(report.balance.rows[0].variable, "distance");
    assert_eq!(report.balance.rows.len(), 4);

    let effect = report.effect.as_ref().unwrap();
    assert_eq!(effect.estimand, Estimand::Att);
    assert!(effect.estimate.is_finite());
    assert!(effect.conf_low < effect.estimate && effect.estimate < effect.conf_high);

    let matched = report.matched_data().unwrap().unwrap();
    assert_eq!(matched.height(), 2 * report.matching.matched_treated);
}

#[test]
fn test_caliper_matching_drops_distant_treated() {
    let config = AnalysisConfig::builder().caliper(0.1).build().unwrap();
    let pipeline = Pipeline::builder().config(config).build().unwrap();
    let study = MatchingStudy::new("union", "age + female + educ");

    let report = pipeline.run_matching(&survey(), &study).unwrap();
    let sizes = &report.balance.sample_sizes;
    assert!(report.matching.caliper.is_some());
    assert!(sizes.matched.treated <= sizes.all.treated);
    assert_eq!(sizes.matched.treated + sizes.unmatched.treated, sizes.all.treated);
}

#[test]
fn test_full_matching_keeps_every_treated_unit() {
    let config = AnalysisConfig::builder()
        .matching_method(MatchingMethod::Full)
        .build()
        .unwrap();
    let pipeline = Pipeline::builder().config(config).build().unwrap();
    let study = MatchingStudy::new("union", "age + female + educ")
        .outcome("trust")
        .subset("cntry", "NL");

    let report = pipeline.run_matching(&survey(), &study).unwrap();
    let sizes = &report.balance.sample_sizes;
    assert_eq!(sizes.matched.treated, sizes.all.treated);
    assert!(report.matching.n_subclasses >= 1);

    let effect = report.effect.unwrap();
    if report.matching.n_subclasses >= 2 {
        assert_eq!(effect.n_clusters, Some(report.matching.n_subclasses));
    }
}

#[test]
fn test_matching_progress_and_report_file() {
    let dir = temp_dir("matching");
    let stages = Arc::new(Mutex::new(Vec::new()));
    let seen = stages.clone();
    let config = AnalysisConfig::builder().output_dir(&dir).build().unwrap();
    let pipeline = Pipeline::builder()
        .config(config)
        .on_progress(move |update| seen.lock().unwrap().push(update.stage))
        .build()
        .unwrap();

    let study = MatchingStudy::new("union", "age + educ").subset("cntry", "FR");
    let report = pipeline.run_matching(&survey(), &study).unwrap();
    let stages = stages.lock().unwrap().clone();
    assert_eq!(stages.last(), Some(&AnalysisStage::Complete));
    assert!(!stages.contains(&AnalysisStage::OutcomeModel));

    let report = AnalysisReport::from_result("survey.csv", ReportKind::Matching, &report).unwrap();
    let path = pipeline.save_report(&report, "survey").unwrap().unwrap();
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["kind"], "matching");
    assert_eq!(written["body"]["study"]["treatment"], "union");

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_matching_with_recode_file() {
    let dir = temp_dir("recodes");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("recodes.json");
    std::fs::write(
        &path,
        r#"[{"op": "binarize", "source": "trust_gov", "target": "trusts_gov", "positive": ["somewhat", "a lot"]}]"#,
    )
    .unwrap();

    let mut study = MatchingStudy::new("union", "age + trusts_gov").subset("cntry", "DE");
    study.recodes = Recode::list_from_json_file(&path).unwrap();
    let report = Pipeline::builder()
        .build()
        .unwrap()
        .run_matching(&survey(), &study)
        .unwrap();

    let variables: Vec<&str> = report.balance.rows.iter().map(|r| r.variable.as_str()).collect();
    assert!(variables.contains(&"trusts_gov"), "{:?}", variables);
    assert_eq!(report.n_rows, 80);

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn test_cancelled_before_start() {
    let token = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let pipeline = Pipeline::builder()
        .cancellation_token(token.clone())
        .on_progress(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    token.cancel();

    let err = pipeline
        .run_discontinuity(&mortality(), &DiscontinuityStudy::new("agecell", "all"))
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(calls.load(Ordering::SeqCst) >= 1);
}

// ============================================================================
// Regression discontinuity
// ============================================================================

#[test]
fn test_sharp_rd_at_fixed_bandwidth() {
    let config = RddConfig {
        cutpoint: 21.0,
        bandwidth: Some(2.0),
        bandwidth_multipliers: vec![1.0],
        ..RddConfig::default()
    };
    let analysis = rd_estimate(&mortality(), "agecell", "all", None, &[], &config, 0.95).unwrap();

    assert_eq!(analysis.design, RdDesign::Sharp);
    assert_eq!(analysis.dropped_rows, 1);
    assert_eq!(analysis.n_obs, 47);

    let primary = analysis.primary().unwrap();
    assert_eq!(primary.n_left + primary.n_right, 47);
    // separate triangular-weighted lines on each side
    assert!((primary.effect.estimate - 7.688_708_307).abs() < 1e-6);
    assert!((primary.fit.left_intercept - 92.056_343_926).abs() < 1e-6);
    assert!(primary.effect.p_value < 0.001);
}

#[test]
fn test_ik_bandwidth_on_mortality() {
    let df = drop_missing(&mortality(), &["all"]).unwrap();
    let x: Vec<f64> = numeric_values(&df, "agecell").unwrap().into_iter().flatten().collect();
    let y: Vec<f64> = numeric_values(&df, "all").unwrap().into_iter().flatten().collect();

    assert_eq!(x.len(), 47);

    // rdd::IKbandwidth(agecell, all, cutpoint = 21) on the same rows
    let h = ik_bandwidth(&x, &y, 21.0, Kernel::Triangular).unwrap();
    assert!((h - 1.226_381_026).abs() < 1e-6, "h = {}", h);

    let d = ik_bandwidth_details(&x, &y, 21.0, Kernel::Triangular).unwrap();
    assert!((d.third_derivative - 4.138_318_370).abs() < 1e-6);
    assert!((d.h2_left - 1.719_105_827).abs() < 1e-6);
    assert!((d.h2_right - 1.708_685_468).abs() < 1e-6);
}

#[test]
fn test_recentred_manual_regression_matches_rd() {
    let df = drop_missing(&mortality(), &["all"]).unwrap();
    let df = center(&df, "agecell", "age_c", 21.0).unwrap();
    let df = threshold_indicator(&df, "agecell", "over21", 21.0).unwrap();

    // rectangular kernel over the whole range is plain OLS with interaction
    let model = lm(&df, "all ~ over21 * age_c", &LmOptions::default()).unwrap();
    let config = RddConfig {
        cutpoint: 21.0,
        kernel: Kernel::Rectangular,
        bandwidth: Some(5.0),
        bandwidth_multipliers: vec![1.0],
        ..RddConfig::default()
    };
    let analysis = rd_estimate(&df, "agecell", "all", None, &[], &config, 0.95).unwrap();

    let jump = model.coefficient("over21").unwrap().estimate;
    assert!((analysis.primary().unwrap().effect.estimate - jump).abs() < 1e-8);
}

#[test]
fn test_discontinuity_pipeline_with_plot_data() {
    let config = AnalysisConfig::builder()
        .cutpoint(21.0)
        .bins(6)
        .build()
        .unwrap();
    let pipeline = Pipeline::builder().config(config).build().unwrap();

    let report = pipeline
        .run_discontinuity(&mortality(), &DiscontinuityStudy::new("agecell", "all"))
        .unwrap();

    assert!((report.analysis.bandwidth.bandwidth() - 1.226_381_026).abs() < 1e-6);
    assert!(report.analysis.primary().is_some());
    let bins = report.binned_means.len();
    assert!(bins > 0 && bins <= 12);
    let counted: usize = report.binned_means.iter().map(|b| b.count).sum();
    assert_eq!(counted, 47);
}
