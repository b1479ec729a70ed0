//! CLI entry point for the causal-inference workshop toolkit.

use anyhow::{Result, anyhow};
use causal_lab::config::{
    Alternative, CovarianceType, Discard, DistanceKind, Estimand, Kernel, MatchOrder,
    MatchingMethod, TTestKind,
};
use causal_lab::data::columns::{is_numeric_column, numeric_values};
use causal_lab::data::recode::Recode;
use causal_lab::models::{LmOptions, glm_logit, lm};
use causal_lab::reporting::tables;
use causal_lab::stats::{
    GroupSummary, Summary, group_means, summarize_column, t_test_by_group, t_test_one_sample,
};
use causal_lab::{
    AnalysisConfig, AnalysisReport, DiscontinuityStudy, MatchingStudy, Pipeline, ReportGenerator,
    ReportKind, load_dataset, write_csv,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use polars::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    author = "Causal Lab Team",
    version,
    about = "Causal inference workshop toolkit",
    long_about = "t-tests, regressions, propensity score matching and regression \
                  discontinuity on tabular data.\n\n\
                  EXAMPLES:\n  \
                  # Compare means between two groups\n  \
                  causal-lab ttest -i survey.csv --outcome trust --group union\n\n  \
                  # Regression with country fixed effects and clustered errors\n  \
                  causal-lab regress -i survey.csv --formula \"trust ~ union + age\" --absorb cntry --cluster cntry\n\n  \
                  # Caliper matching within one country, exporting the matched sample\n  \
                  causal-lab match -i survey.csv --treatment union --covariates \"age + female + educ\" \\\n    \
                  --caliper 0.2 --outcome voted --subset cntry=DE --export matched.csv\n\n  \
                  # Regression discontinuity at age 21\n  \
                  causal-lab rdd -i mortality.csv --running agecell --outcome all --cutpoint 21"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Path to the CSV or parquet file to analyse
    #[arg(short, long)]
    input: String,

    /// Output directory for reports and exported data
    #[arg(short, long)]
    output: Option<String>,

    /// JSON configuration file (see `AnalysisConfig`)
    ///
    /// Flags given on the command line override values from the file.
    #[arg(short, long)]
    config: Option<String>,

    /// Confidence level for intervals
    #[arg(long)]
    conf_level: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Suppress progress output (only show errors and final result)
    #[arg(short, long)]
    quiet: bool,

    /// Output JSON to stdout instead of a text table
    ///
    /// Disables all logs; only the final JSON report is written.
    /// Useful for piping to other tools: `... --json | jq .body`
    #[arg(long)]
    json: bool,

    /// Write a JSON report to the output directory
    ///
    /// The report will be saved as <input_name>_report.json
    #[arg(short = 'r', long)]
    emit_report: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summary statistics of numeric columns
    Describe(DescribeArgs),
    /// One- or two-sample t-test
    Ttest(TTestArgs),
    /// Linear regression from a formula
    Regress(RegressArgs),
    /// Logistic regression from a formula
    Logit(LogitArgs),
    /// Propensity score matching with balance diagnostics
    Match(MatchArgs),
    /// Regression discontinuity estimate
    Rdd(RddArgs),
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Self::Describe(a) => &a.common,
            Self::Ttest(a) => &a.common,
            Self::Regress(a) => &a.common,
            Self::Logit(a) => &a.common,
            Self::Match(a) => &a.common,
            Self::Rdd(a) => &a.common,
        }
    }
}

#[derive(Args, Debug)]
struct DescribeArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Columns to summarise; all numeric columns by default
    #[arg(long, value_delimiter = ',')]
    columns: Vec<String>,

    /// Also report means by the levels of this column
    #[arg(long)]
    group: Option<String>,
}

#[derive(Args, Debug)]
struct TTestArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Numeric outcome column
    #[arg(long)]
    outcome: String,

    /// Two-level grouping column; a one-sample test when omitted
    #[arg(long)]
    group: Option<String>,

    /// Assume equal variances (pooled Student test instead of Welch)
    #[arg(long)]
    student: bool,

    #[arg(long, value_enum, default_value = "two-sided")]
    alternative: CliAlternative,

    /// Null value of the mean or difference in means
    #[arg(long, default_value = "0")]
    mu: f64,
}

#[derive(Args, Debug)]
struct RegressArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Model formula, e.g. "y ~ x + factor(cntry) + x:z"
    #[arg(short, long)]
    formula: String,

    /// Column of observation weights
    #[arg(long)]
    weights: Option<String>,

    /// Column defining clusters for cluster-robust standard errors
    #[arg(long)]
    cluster: Option<String>,

    /// Categorical column whose fixed effects are absorbed
    #[arg(long)]
    absorb: Option<String>,

    /// Heteroskedasticity-robust standard errors
    #[arg(long, value_enum)]
    robust: Option<CliRobust>,
}

#[derive(Args, Debug)]
struct LogitArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Model formula with a 0/1 response
    #[arg(short, long)]
    formula: String,

    /// Column of prior weights
    #[arg(long)]
    weights: Option<String>,
}

#[derive(Args, Debug)]
struct MatchArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// 0/1 treatment column
    #[arg(long)]
    treatment: String,

    /// Right-hand side of the propensity model, e.g. "age + female + educ"
    #[arg(long)]
    covariates: String,

    #[arg(long, value_enum)]
    method: Option<CliMethod>,

    #[arg(long, value_enum)]
    estimand: Option<CliEstimand>,

    #[arg(long, value_enum)]
    distance: Option<CliDistance>,

    /// Maximum distance between matched units
    #[arg(long)]
    caliper: Option<f64>,

    /// Read the caliper in distance units instead of standard deviations
    #[arg(long)]
    raw_caliper: bool,

    /// Controls per treated unit
    #[arg(long)]
    ratio: Option<usize>,

    /// Match with replacement
    #[arg(long)]
    replace: bool,

    #[arg(long, value_enum)]
    order: Option<CliOrder>,

    #[arg(long, value_enum)]
    discard: Option<CliDiscard>,

    /// Seed for random matching order
    #[arg(long)]
    seed: Option<u64>,

    /// Outcome for the treatment effect estimate
    #[arg(long)]
    outcome: Option<String>,

    /// Extra adjustment terms for the outcome model
    #[arg(long)]
    outcome_covariates: Option<String>,

    /// Keep only rows where column == value, e.g. cntry=DE
    #[arg(long, value_parser = parse_subset)]
    subset: Option<(String, String)>,

    /// Drop rows with a missing value in any model column first
    #[arg(long)]
    drop_missing: bool,

    /// Write the matched sample (with distance, weights, subclass) to CSV
    #[arg(long)]
    export: Option<String>,

    /// JSON file with recoding steps applied before the analysis
    #[arg(long)]
    recodes: Option<String>,
}

#[derive(Args, Debug)]
struct RddArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Running variable
    #[arg(long)]
    running: String,

    #[arg(long)]
    outcome: String,

    /// Treatment take-up column; makes the design fuzzy
    #[arg(long)]
    treatment: Option<String>,

    #[arg(long)]
    cutpoint: Option<f64>,

    /// Fixed bandwidth; Imbens-Kalyanaraman when omitted
    #[arg(long)]
    bandwidth: Option<f64>,

    #[arg(long, value_enum)]
    kernel: Option<CliKernel>,

    /// Additional covariates of the local regression
    #[arg(long, value_delimiter = ',')]
    covariates: Vec<String>,

    /// Bandwidth multiples to report, e.g. 1,0.5,2
    #[arg(long, value_delimiter = ',')]
    multipliers: Vec<f64>,

    /// Bins per side for plot data
    #[arg(long)]
    bins: Option<usize>,

    /// Centre the running variable at the cutpoint before estimating
    #[arg(long)]
    recentre: bool,

    /// JSON file with recoding steps applied before the analysis
    #[arg(long)]
    recodes: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliAlternative {
    TwoSided,
    Less,
    Greater,
}

impl From<CliAlternative> for Alternative {
    fn from(cli: CliAlternative) -> Self {
        match cli {
            CliAlternative::TwoSided => Alternative::TwoSided,
            CliAlternative::Less => Alternative::Less,
            CliAlternative::Greater => Alternative::Greater,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRobust {
    /// White sandwich
    Hc0,
    /// Sandwich with n / (n - k) scaling
    Hc1,
}

impl From<CliRobust> for CovarianceType {
    fn from(cli: CliRobust) -> Self {
        match cli {
            CliRobust::Hc0 => CovarianceType::Hc0,
            CliRobust::Hc1 => CovarianceType::Hc1,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMethod {
    /// Greedy nearest-neighbour matching
    Nearest,
    /// Optimal full matching
    Full,
}

impl From<CliMethod> for MatchingMethod {
    fn from(cli: CliMethod) -> Self {
        match cli {
            CliMethod::Nearest => MatchingMethod::Nearest,
            CliMethod::Full => MatchingMethod::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliEstimand {
    Att,
    Atc,
    Ate,
}

impl From<CliEstimand> for Estimand {
    fn from(cli: CliEstimand) -> Self {
        match cli {
            CliEstimand::Att => Estimand::Att,
            CliEstimand::Atc => Estimand::Atc,
            CliEstimand::Ate => Estimand::Ate,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliDistance {
    /// Fitted probability
    Glm,
    /// Linear predictor
    Logit,
}

impl From<CliDistance> for DistanceKind {
    fn from(cli: CliDistance) -> Self {
        match cli {
            CliDistance::Glm => DistanceKind::Glm,
            CliDistance::Logit => DistanceKind::Logit,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliOrder {
    Largest,
    Smallest,
    Random,
    Data,
}

impl From<CliOrder> for MatchOrder {
    fn from(cli: CliOrder) -> Self {
        match cli {
            CliOrder::Largest => MatchOrder::Largest,
            CliOrder::Smallest => MatchOrder::Smallest,
            CliOrder::Random => MatchOrder::Random,
            CliOrder::Data => MatchOrder::Data,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliDiscard {
    None,
    Treated,
    Control,
    Both,
}

impl From<CliDiscard> for Discard {
    fn from(cli: CliDiscard) -> Self {
        match cli {
            CliDiscard::None => Discard::None,
            CliDiscard::Treated => Discard::Treated,
            CliDiscard::Control => Discard::Control,
            CliDiscard::Both => Discard::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliKernel {
    Triangular,
    Rectangular,
    Epanechnikov,
}

impl From<CliKernel> for Kernel {
    fn from(cli: CliKernel) -> Self {
        match cli {
            CliKernel::Triangular => Kernel::Triangular,
            CliKernel::Rectangular => Kernel::Rectangular,
            CliKernel::Epanechnikov => Kernel::Epanechnikov,
        }
    }
}

fn parse_subset(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((column, value)) if !column.trim().is_empty() => {
            Ok((column.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected column=value, got '{}'", s)),
    }
}

/// Initialize the tracing subscriber for logging.
///
/// When `json_output` is true, logging is completely disabled to ensure
/// only JSON is written to stdout.
fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if json_output {
        return;
    }

    use tracing_subscriber::EnvFilter;

    let effective_level = if quiet { "warn" } else { level };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(effective_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = cli.command.common().clone();

    // .env may carry RUST_LOG, so load it before the filter is built
    dotenv().ok();
    init_logging(&common.log_level, common.quiet, common.json);

    if !Path::new(&common.input).exists() {
        return Err(anyhow!("Input file not found: {}", common.input));
    }

    let config = base_config(&common)?;
    let output_dir = config.output_dir.clone();

    info!("Loading dataset from: {}", common.input);
    let data = load_dataset(&common.input)?;

    let (report, text) = match &cli.command {
        Command::Describe(args) => run_describe(args, &data)?,
        Command::Ttest(args) => run_ttest(args, &data, config)?,
        Command::Regress(args) => run_regress(args, &data, config)?,
        Command::Logit(args) => run_logit(args, &data, config)?,
        Command::Match(args) => run_match(args, &data, config)?,
        Command::Rdd(args) => run_rdd(args, &data, config)?,
    };

    handle_output(&report, &text, &common, output_dir)
}

/// Configuration from `--config` (or defaults) with the shared flags
/// applied.
fn base_config(common: &CommonArgs) -> Result<AnalysisConfig> {
    let mut config = match &common.config {
        Some(path) => {
            info!("Reading configuration from {}", path);
            AnalysisConfig::from_json_file(path)?
        }
        None => AnalysisConfig::default(),
    };
    if let Some(output) = &common.output {
        config.output_dir = PathBuf::from(output);
    }
    if let Some(level) = common.conf_level {
        config.confidence_level = level;
    }
    // reports are written by the CLI itself
    config.save_to_disk = false;
    config.validate()?;
    Ok(config)
}

fn read_recodes(path: Option<&str>) -> Result<Vec<Recode>> {
    match path {
        Some(path) => {
            info!("Reading recoding steps from {}", path);
            Ok(Recode::list_from_json_file(path)?)
        }
        None => Ok(Vec::new()),
    }
}

fn progress_pipeline(config: AnalysisConfig, common: &CommonArgs) -> Result<Pipeline> {
    let mut builder = Pipeline::builder().config(config);
    if !common.quiet && !common.json {
        builder = builder.on_progress(|update| {
            info!(
                "[{:.0}%] {}: {}",
                update.progress * 100.0,
                update.stage.display_name(),
                update.message
            );
        });
    }
    Ok(builder.build()?)
}

#[derive(Serialize)]
struct ColumnSummary {
    column: String,
    #[serde(flatten)]
    summary: Summary,
}

#[derive(Serialize)]
struct GroupedMeans {
    column: String,
    group: String,
    levels: Vec<GroupSummary>,
}

#[derive(Serialize)]
struct Description {
    rows: usize,
    columns: Vec<ColumnSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    groups: Vec<GroupedMeans>,
}

fn run_describe(args: &DescribeArgs, data: &DataFrame) -> Result<(AnalysisReport, String)> {
    let columns = if args.columns.is_empty() {
        let mut numeric = Vec::new();
        for name in data.get_column_names() {
            if is_numeric_column(data, name.as_str())? {
                numeric.push(name.to_string());
            }
        }
        numeric
    } else {
        args.columns.clone()
    };

    let mut summaries = Vec::with_capacity(columns.len());
    for column in &columns {
        summaries.push((column.clone(), summarize_column(data, column)?));
    }

    let mut groups = Vec::new();
    if let Some(group) = &args.group {
        for column in columns.iter().filter(|c| *c != group) {
            groups.push(GroupedMeans {
                column: column.clone(),
                group: group.clone(),
                levels: group_means(data, column, group)?,
            });
        }
    }

    let mut text = format!("{} rows\n\n", data.height());
    text.push_str(&tables::summary_table(&summaries));
    for grouped in &groups {
        text.push_str(&format!("\nMean of {} by {}:\n", grouped.column, grouped.group));
        for level in &grouped.levels {
            text.push_str(&format!(
                "  {:<16} n = {:<6} mean = {:<12.4} sd = {:.4}\n",
                level.level, level.n, level.mean, level.sd
            ));
        }
    }

    let description = Description {
        rows: data.height(),
        columns: summaries
            .into_iter()
            .map(|(column, summary)| ColumnSummary { column, summary })
            .collect(),
        groups,
    };
    let report = AnalysisReport::from_result(&args.common.input, ReportKind::Describe, &description)?;
    Ok((report, text))
}

fn run_ttest(
    args: &TTestArgs,
    data: &DataFrame,
    mut config: AnalysisConfig,
) -> Result<(AnalysisReport, String)> {
    if args.student {
        config.t_test_kind = TTestKind::Student;
    }
    let alternative = args.alternative.into();

    let result = match &args.group {
        Some(group) => {
            if args.mu != 0.0 {
                warn!("--mu {} is ignored by two-sample tests", args.mu);
            }
            t_test_by_group(
                data,
                &args.outcome,
                group,
                config.t_test_kind,
                alternative,
                config.confidence_level,
            )?
        }
        None => {
            let values: Vec<f64> = numeric_values(data, &args.outcome)?.into_iter().flatten().collect();
            t_test_one_sample(&values, args.mu, alternative, config.confidence_level)?
        }
    };

    let text = tables::t_test_summary(&result);
    let report = AnalysisReport::from_result(&args.common.input, ReportKind::TTest, &result)?;
    Ok((report, text))
}

fn run_regress(
    args: &RegressArgs,
    data: &DataFrame,
    config: AnalysisConfig,
) -> Result<(AnalysisReport, String)> {
    let options = LmOptions {
        weights: args.weights.clone(),
        covariance: args.robust.map(Into::into).unwrap_or(config.covariance),
        cluster: args.cluster.clone(),
        absorb: args.absorb.clone(),
        conf_level: config.confidence_level,
    };
    let model = lm(data, &args.formula, &options)?;

    let text = tables::linear_model_table(&model);
    let report = AnalysisReport::from_result(&args.common.input, ReportKind::Regression, &model)?;
    Ok((report, text))
}

fn run_logit(
    args: &LogitArgs,
    data: &DataFrame,
    config: AnalysisConfig,
) -> Result<(AnalysisReport, String)> {
    let model = glm_logit(
        data,
        &args.formula,
        args.weights.as_deref(),
        config.confidence_level,
    )?;

    let text = tables::logit_table(&model);
    let report = AnalysisReport::from_result(&args.common.input, ReportKind::Logit, &model)?;
    Ok((report, text))
}

fn run_match(
    args: &MatchArgs,
    data: &DataFrame,
    mut config: AnalysisConfig,
) -> Result<(AnalysisReport, String)> {
    let matching = &mut config.matching;
    if let Some(method) = args.method {
        matching.method = method.into();
    }
    if let Some(estimand) = args.estimand {
        matching.estimand = estimand.into();
    }
    if let Some(distance) = args.distance {
        matching.distance = distance.into();
    }
    if let Some(caliper) = args.caliper {
        matching.caliper = Some(caliper);
    }
    if args.raw_caliper {
        matching.std_caliper = false;
    }
    if let Some(ratio) = args.ratio {
        matching.ratio = ratio;
    }
    if args.replace {
        matching.replace = true;
    }
    if let Some(order) = args.order {
        matching.order = order.into();
    }
    if let Some(discard) = args.discard {
        matching.discard = discard.into();
    }
    if let Some(seed) = args.seed {
        matching.seed = Some(seed);
    }
    config.validate()?;

    let mut study = MatchingStudy::new(&args.treatment, &args.covariates).drop_missing(args.drop_missing);
    if let Some(outcome) = &args.outcome {
        study = study.outcome(outcome);
    }
    if let Some((column, value)) = &args.subset {
        study = study.subset(column, value);
    }
    study.outcome_covariates = args.outcome_covariates.clone();
    study.recodes = read_recodes(args.recodes.as_deref())?;

    let pipeline = progress_pipeline(config, &args.common)?;
    let report = pipeline.run_matching(data, &study)?;

    if let Some(path) = &args.export {
        match report.matched_data()? {
            Some(matched) => {
                let written = write_csv(&matched, path)?;
                info!("Matched data written to: {}", written.display());
            }
            None => error!("No matched sample to export"),
        }
    }

    let summary = &report.matching;
    let mut text = format!(
        "{:?} matching on {} ({} rows)\n",
        summary.method, report.study.treatment, report.n_rows
    );
    if let Some(caliper) = summary.caliper {
        text.push_str(&format!("Caliper: {:.4} (distance units)\n", caliper));
    }
    text.push_str(&format!(
        "Matched: {} treated, {} control in {} subclasses\n\n",
        summary.matched_treated, summary.matched_control, summary.n_subclasses
    ));
    text.push_str(&tables::balance_table(&report.balance));
    if let Some(effect) = &report.effect {
        text.push('\n');
        text.push_str(&tables::effect_table(effect));
    }

    let report = AnalysisReport::from_result(&args.common.input, ReportKind::Matching, &report)?;
    Ok((report, text))
}

fn run_rdd(
    args: &RddArgs,
    data: &DataFrame,
    mut config: AnalysisConfig,
) -> Result<(AnalysisReport, String)> {
    let rdd = &mut config.rdd;
    if let Some(cutpoint) = args.cutpoint {
        rdd.cutpoint = cutpoint;
    }
    if let Some(bandwidth) = args.bandwidth {
        rdd.bandwidth = Some(bandwidth);
    }
    if let Some(kernel) = args.kernel {
        rdd.kernel = kernel.into();
    }
    if !args.multipliers.is_empty() {
        rdd.bandwidth_multipliers = args.multipliers.clone();
    }
    if let Some(bins) = args.bins {
        rdd.bins = bins;
    }
    config.validate()?;

    let mut study = DiscontinuityStudy::new(&args.running, &args.outcome).recentre(args.recentre);
    if let Some(treatment) = &args.treatment {
        study = study.treatment(treatment);
    }
    study.covariates = args.covariates.clone();
    study.recodes = read_recodes(args.recodes.as_deref())?;

    let pipeline = progress_pipeline(config, &args.common)?;
    let report = pipeline.run_discontinuity(data, &study)?;

    let text = tables::rdd_table(&report.analysis);
    let report = AnalysisReport::from_result(&args.common.input, ReportKind::Discontinuity, &report)?;
    Ok((report, text))
}

/// Handle output based on CLI flags.
///
/// Output behavior:
/// - Default: Print a text table to stdout
/// - `--json`: Print JSON to stdout only (no logs)
/// - `--emit-report`: Also write the JSON report to file
fn handle_output(
    report: &AnalysisReport,
    text: &str,
    common: &CommonArgs,
    output_dir: PathBuf,
) -> Result<()> {
    if common.emit_report {
        let generator = ReportGenerator::new(output_dir);
        let report_path = generator.write_report_to_file(report, &extract_file_stem(&common.input))?;
        info!("Report written to: {}", report_path.display());
    }

    if common.json {
        println!("{}", report.to_json_pretty()?);
        return Ok(());
    }

    println!();
    println!("{}", report.kind.display_name().to_uppercase());
    println!("{}", "=".repeat(80));
    print!("{}", text);
    println!("{}", "=".repeat(80));
    if !common.emit_report {
        println!("Use --json for machine-readable output");
        println!("Use --emit-report to save a JSON report");
    }
    Ok(())
}

/// Extract the file stem (name without extension) from a path.
fn extract_file_stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string()
}
