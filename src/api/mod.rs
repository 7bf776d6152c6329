use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{
        Json, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::core::{
    CohortMonth, CohortReport, MarketHistory, RateSolution, ScanMode, SolverConfig, Strategy,
    SuccessRule, SwrError, find_solutions, outcomes_satisfy, scan_cohorts, trace_cohort,
};
use crate::data::load_history;

#[derive(Parser, Debug)]
#[command(
    name = "swr",
    about = "Historical safe withdrawal rate backtester (rolling monthly cohorts + glide path + reset rule)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search for the safe withdrawal rate and the safe adjustment rate
    Solve(SolveArgs),
    /// Evaluate every historical cohort at fixed rates
    Cohorts(CohortArgs),
    /// Print the month-by-month path of one cohort
    Trace(TraceArgs),
    /// Serve the JSON API over a loaded history
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StrategyArgs {
    #[arg(long, default_value_t = 100_000.0, help = "Savings at retirement")]
    savings: f64,
    #[arg(long, default_value_t = 720, help = "Retirement length in months")]
    retirement_length: usize,
    #[arg(
        long,
        default_value_t = 60.0,
        help = "Initial equity weight in percent"
    )]
    initial_equity_weight: f64,
    #[arg(
        long,
        default_value_t = 0.5,
        help = "Monthly glide-path increase of the equity weight in percentage points"
    )]
    glide_increment: f64,
    #[arg(
        long,
        default_value = "preserve-real-value",
        help = "Success rule: survival-only (0) or preserve-real-value (1)"
    )]
    success_rule: String,
}

#[derive(Args, Debug)]
pub struct SolveArgs {
    #[arg(long, help = "CSV file of monthly market history")]
    data: PathBuf,
    #[command(flatten)]
    strategy: StrategyArgs,
    #[arg(long, help = "Simulate cohorts on all cores")]
    parallel: bool,
    #[arg(long, help = "Print the full solution as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
pub struct CohortArgs {
    #[arg(long, help = "CSV file of monthly market history")]
    data: PathBuf,
    #[command(flatten)]
    strategy: StrategyArgs,
    #[arg(long, help = "Initial annual withdrawal rate in percent of savings")]
    withdrawal_rate: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Annual adjustment rate in percent of portfolio value"
    )]
    adjustment_rate: f64,
    #[arg(long, help = "Simulate cohorts on all cores")]
    parallel: bool,
    #[arg(long, help = "Print cohort reports as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
pub struct TraceArgs {
    #[arg(long, help = "CSV file of monthly market history")]
    data: PathBuf,
    #[command(flatten)]
    strategy: StrategyArgs,
    #[arg(long, default_value_t = 0, help = "Start offset (month index) of the cohort")]
    start: usize,
    #[arg(long, help = "Initial annual withdrawal rate in percent of savings")]
    withdrawal_rate: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Annual adjustment rate in percent of portfolio value"
    )]
    adjustment_rate: f64,
    #[arg(long, help = "Print the trace as JSON")]
    json: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(long, help = "CSV file of monthly market history")]
    data: PathBuf,
    #[arg(long, default_value_t = 8080)]
    port: u16,
    #[arg(long, help = "Simulate cohorts on all cores")]
    parallel: bool,
}

#[derive(Clone)]
struct AppState {
    history: Arc<MarketHistory>,
    scan: ScanMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RuleSelector {
    Code(u8),
    Name(String),
}

impl RuleSelector {
    fn resolve(self) -> Result<SuccessRule, SwrError> {
        match self {
            RuleSelector::Code(code) => SuccessRule::try_from(code),
            RuleSelector::Name(name) => name.parse(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StrategyPayload {
    savings: Option<f64>,
    retirement_length: Option<usize>,
    initial_equity_weight: Option<f64>,
    glide_increment: Option<f64>,
    success_rule: Option<RuleSelector>,
    withdrawal_rate: Option<f64>,
    adjustment_rate: Option<f64>,
}

#[derive(Debug)]
struct ApiRequest {
    strategy: Strategy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    months: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveResponse {
    success_rule: SuccessRule,
    retirement_length: usize,
    cohort_count: usize,
    safe_withdrawal_rate: f64,
    safe_adjustment_rate: f64,
    withdrawal_iterations: usize,
    adjustment_iterations: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CohortsResponse {
    success_rule: SuccessRule,
    withdrawal_rate: f64,
    adjustment_rate: f64,
    all_succeed: bool,
    cohorts: Vec<CohortReport>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Solve(args) => run_solve(args),
        Command::Cohorts(args) => run_cohorts(args),
        Command::Trace(args) => run_trace(args),
        Command::Serve(args) => {
            let history = load_history(&args.data)
                .with_context(|| format!("loading {}", args.data.display()))?;
            run_http_server(args.port, history, scan_mode(args.parallel))
                .await
                .context("HTTP server failed")
        }
    }
}

fn run_solve(args: SolveArgs) -> anyhow::Result<()> {
    let history = load_history(&args.data)
        .with_context(|| format!("loading {}", args.data.display()))?;
    let strategy = build_strategy(&args.strategy, 0.0, 0.0)?;
    let config = SolverConfig {
        scan: scan_mode(args.parallel),
        ..SolverConfig::default()
    };

    let solution = find_solutions(&history, &strategy, config)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&solution)?);
    } else {
        print!("{}", render_solution(&solution));
    }
    Ok(())
}

fn run_cohorts(args: CohortArgs) -> anyhow::Result<()> {
    let history = load_history(&args.data)
        .with_context(|| format!("loading {}", args.data.display()))?;
    let strategy = build_strategy(&args.strategy, args.withdrawal_rate, args.adjustment_rate)?;
    let response = evaluate_cohorts(&history, &strategy, scan_mode(args.parallel))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print!("{}", render_cohorts(&response));
    }
    Ok(())
}

fn run_trace(args: TraceArgs) -> anyhow::Result<()> {
    let history = load_history(&args.data)
        .with_context(|| format!("loading {}", args.data.display()))?;
    let strategy = build_strategy(&args.strategy, args.withdrawal_rate, args.adjustment_rate)?;
    let rows = trace_cohort(&history, args.start, &strategy)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", render_trace(&rows));
    }
    Ok(())
}

fn scan_mode(parallel: bool) -> ScanMode {
    if parallel {
        ScanMode::Parallel
    } else {
        ScanMode::Sequential
    }
}

/// Converts percent-valued flags into a validated strategy.
fn build_strategy(
    args: &StrategyArgs,
    withdrawal_rate_pct: f64,
    adjustment_rate_pct: f64,
) -> Result<Strategy, SwrError> {
    if !args.savings.is_finite() || args.savings <= 0.0 {
        return Err(SwrError::invalid_configuration("--savings must be > 0"));
    }
    if args.retirement_length == 0 {
        return Err(SwrError::invalid_configuration(
            "--retirement-length must be at least 1 month",
        ));
    }
    if !(0.0..=100.0).contains(&args.initial_equity_weight) {
        return Err(SwrError::invalid_configuration(
            "--initial-equity-weight must be between 0 and 100",
        ));
    }
    if !args.glide_increment.is_finite() || args.glide_increment < 0.0 {
        return Err(SwrError::invalid_configuration(
            "--glide-increment must be >= 0",
        ));
    }
    for (name, rate) in [
        ("--withdrawal-rate", withdrawal_rate_pct),
        ("--adjustment-rate", adjustment_rate_pct),
    ] {
        if !rate.is_finite() || rate < 0.0 {
            return Err(SwrError::invalid_configuration(format!(
                "{name} must be >= 0"
            )));
        }
    }
    let success_rule: SuccessRule = args.success_rule.parse()?;

    let strategy = Strategy {
        savings: args.savings,
        initial_withdrawal_rate: withdrawal_rate_pct / 100.0,
        adjustment_withdrawal_rate: adjustment_rate_pct / 100.0,
        retirement_length: args.retirement_length,
        initial_equity_weight: args.initial_equity_weight / 100.0,
        glide_increment: args.glide_increment / 100.0,
        success_rule,
    };
    strategy.validate()?;
    Ok(strategy)
}

fn evaluate_cohorts(
    history: &MarketHistory,
    strategy: &Strategy,
    scan: ScanMode,
) -> Result<CohortsResponse, SwrError> {
    let cohorts = scan_cohorts(history, strategy, scan)?;
    let outcomes: Vec<_> = cohorts.iter().map(CohortReport::outcome).collect();
    Ok(CohortsResponse {
        success_rule: strategy.success_rule,
        withdrawal_rate: strategy.initial_withdrawal_rate,
        adjustment_rate: strategy.adjustment_withdrawal_rate,
        all_succeed: outcomes_satisfy(&outcomes, strategy.success_rule),
        cohorts,
    })
}

fn render_solution(solution: &RateSolution) -> String {
    format!(
        "{}\n{}\n",
        solution.safe_withdrawal_rate, solution.safe_adjustment_rate
    )
}

fn render_cohorts(response: &CohortsResponse) -> String {
    let mut out = String::new();
    for cohort in &response.cohorts {
        out.push_str(&format!(
            "{:>6}  survived={:<5}  preserved={:<5}  balance={:>14.2}  resets={}\n",
            cohort.start_offset,
            cohort.survived,
            cohort.preserved,
            cohort.ending_balance,
            cohort.resets
        ));
    }
    let failures = response
        .cohorts
        .iter()
        .filter(|c| !c.outcome().satisfies(response.success_rule))
        .count();
    out.push_str(&format!(
        "{} of {} cohorts fail under {}; all succeed: {}\n",
        failures,
        response.cohorts.len(),
        response.success_rule,
        response.all_succeed
    ));
    out
}

fn render_trace(rows: &[CohortMonth]) -> String {
    let mut out = String::from("month        income         balance  inflation  equity  reset\n");
    for row in rows {
        out.push_str(&format!(
            "{:>5}  {:>12.2}  {:>14.2}  {:>9.5}  {:>6.4}  {}\n",
            row.month,
            row.income,
            row.balance,
            row.inflation_factor,
            row.equity_weight,
            if row.reset { "yes" } else { "" }
        ));
    }
    out
}

pub async fn run_http_server(
    port: u16,
    history: MarketHistory,
    scan: ScanMode,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let state = AppState {
        history: Arc::new(history),
        scan,
    };
    let app = Router::new()
        .route("/api/history", get(history_handler))
        .route("/api/solve", get(solve_get_handler).post(solve_post_handler))
        .route("/api/cohorts", post(cohorts_handler))
        .fallback(not_found_handler)
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    println!("SWR HTTP API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/api/history");

    axum::serve(listener, app).await
}

async fn history_handler(State(state): State<AppState>) -> Response {
    json_response(
        StatusCode::OK,
        HistoryResponse {
            months: state.history.len(),
        },
    )
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn solve_get_handler(
    State(state): State<AppState>,
    payload: Result<Query<StrategyPayload>, QueryRejection>,
) -> Response {
    match payload {
        Ok(Query(payload)) => solve_handler_impl(state, payload).await,
        Err(rejection) => rejection_response(rejection.body_text()),
    }
}

async fn solve_post_handler(
    State(state): State<AppState>,
    payload: Result<Json<StrategyPayload>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(payload)) => solve_handler_impl(state, payload).await,
        Err(rejection) => rejection_response(rejection.body_text()),
    }
}

async fn solve_handler_impl(state: AppState, payload: StrategyPayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(err) => return swr_error_response(&err),
    };
    let strategy = request.strategy;
    info!(
        "solve request: {} months, {} cohorts, {}",
        strategy.retirement_length,
        state.history.cohort_count(strategy.retirement_length),
        strategy.success_rule
    );

    let config = SolverConfig {
        scan: state.scan,
        ..SolverConfig::default()
    };
    let history = Arc::clone(&state.history);
    let joined =
        tokio::task::spawn_blocking(move || find_solutions(&history, &strategy, config)).await;
    match joined {
        Ok(Ok(solution)) => json_response(StatusCode::OK, build_solve_response(&strategy, &solution)),
        Ok(Err(err)) => swr_error_response(&err),
        Err(join_err) => {
            error!("solver task failed: {join_err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "solver task failed")
        }
    }
}

async fn cohorts_handler(
    State(state): State<AppState>,
    payload: Result<Json<StrategyPayload>, JsonRejection>,
) -> Response {
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => return rejection_response(rejection.body_text()),
    };
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(err) => return swr_error_response(&err),
    };
    let history = Arc::clone(&state.history);
    let scan = state.scan;
    let joined = tokio::task::spawn_blocking(move || {
        evaluate_cohorts(&history, &request.strategy, scan)
    })
    .await;
    match joined {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => swr_error_response(&err),
        Err(join_err) => {
            error!("cohort task failed: {join_err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "cohort task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn rejection_response(detail: String) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        &format!("Invalid API payload: {detail}"),
    )
}

fn status_for(err: &SwrError) -> StatusCode {
    match err {
        SwrError::InvalidConfiguration { .. } | SwrError::InvalidRange { .. } => {
            StatusCode::BAD_REQUEST
        }
        SwrError::DegenerateInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn swr_error_response(err: &SwrError) -> Response {
    error_response(status_for(err), &err.to_string())
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<StrategyPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload).map_err(|e| e.to_string())
}

fn api_request_from_payload(payload: StrategyPayload) -> Result<ApiRequest, SwrError> {
    let mut args = default_strategy_args();
    let mut withdrawal_rate = 0.0;
    let mut adjustment_rate = 0.0;

    if let Some(v) = payload.savings {
        args.savings = v;
    }
    if let Some(v) = payload.retirement_length {
        args.retirement_length = v;
    }
    if let Some(v) = payload.initial_equity_weight {
        args.initial_equity_weight = v;
    }
    if let Some(v) = payload.glide_increment {
        args.glide_increment = v;
    }
    if let Some(v) = payload.withdrawal_rate {
        withdrawal_rate = v;
    }
    if let Some(v) = payload.adjustment_rate {
        adjustment_rate = v;
    }

    let mut strategy = build_strategy(&args, withdrawal_rate, adjustment_rate)?;
    if let Some(selector) = payload.success_rule {
        strategy.success_rule = selector.resolve()?;
    }
    Ok(ApiRequest { strategy })
}

fn default_strategy_args() -> StrategyArgs {
    StrategyArgs {
        savings: 100_000.0,
        retirement_length: 720,
        initial_equity_weight: 60.0,
        glide_increment: 0.5,
        success_rule: SuccessRule::PreserveRealValue.to_string(),
    }
}

fn build_solve_response(strategy: &Strategy, solution: &RateSolution) -> SolveResponse {
    SolveResponse {
        success_rule: solution.success_rule,
        retirement_length: strategy.retirement_length,
        cohort_count: solution.cohort_count,
        safe_withdrawal_rate: solution.safe_withdrawal_rate,
        safe_adjustment_rate: solution.safe_adjustment_rate,
        withdrawal_iterations: solution.withdrawal_search.iterations.len(),
        adjustment_iterations: solution.adjustment_search.iterations.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MarketMonth;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_args() -> StrategyArgs {
        default_strategy_args()
    }

    fn small_history() -> MarketHistory {
        (0..36)
            .map(|k| {
                let equity = if k % 3 == 0 { -0.01 } else { 0.015 };
                MarketMonth::new(equity, 0.002, 0.003, 0.001)
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn build_strategy_converts_percent_inputs() {
        let strategy = build_strategy(&sample_args(), 4.0, 6.5).expect("valid strategy");
        assert_approx(strategy.savings, 100_000.0);
        assert_eq!(strategy.retirement_length, 720);
        assert_approx(strategy.initial_equity_weight, 0.6);
        assert_approx(strategy.glide_increment, 0.005);
        assert_approx(strategy.initial_withdrawal_rate, 0.04);
        assert_approx(strategy.adjustment_withdrawal_rate, 0.065);
        assert_eq!(strategy.success_rule, SuccessRule::PreserveRealValue);
    }

    #[test]
    fn build_strategy_rejects_equity_weight_above_hundred() {
        let mut args = sample_args();
        args.initial_equity_weight = 120.0;
        let err = build_strategy(&args, 4.0, 0.0).expect_err("must reject weight");
        assert!(err.to_string().contains("--initial-equity-weight"));
    }

    #[test]
    fn build_strategy_rejects_negative_rates() {
        let err = build_strategy(&sample_args(), -1.0, 0.0).expect_err("must reject rate");
        assert!(err.to_string().contains("--withdrawal-rate"));
        let err = build_strategy(&sample_args(), 4.0, -0.5).expect_err("must reject rate");
        assert!(err.to_string().contains("--adjustment-rate"));
    }

    #[test]
    fn build_strategy_rejects_unknown_success_rule() {
        let mut args = sample_args();
        args.success_rule = "2".to_string();
        let err = build_strategy(&args, 4.0, 0.0).expect_err("must reject rule");
        assert!(matches!(err, SwrError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("success rule"));
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let json = r#"{
          "savings": 250000,
          "retirementLength": 360,
          "initialEquityWeight": 75,
          "glideIncrement": 0.25,
          "successRule": "survival-only",
          "withdrawalRate": 4.5,
          "adjustmentRate": 7
        }"#;
        let request = api_request_from_json(json).expect("json should parse");
        let strategy = request.strategy;

        assert_approx(strategy.savings, 250_000.0);
        assert_eq!(strategy.retirement_length, 360);
        assert_approx(strategy.initial_equity_weight, 0.75);
        assert_approx(strategy.glide_increment, 0.0025);
        assert_approx(strategy.initial_withdrawal_rate, 0.045);
        assert_approx(strategy.adjustment_withdrawal_rate, 0.07);
        assert_eq!(strategy.success_rule, SuccessRule::SurvivalOnly);
    }

    #[test]
    fn api_request_accepts_numeric_rule_codes() {
        let request = api_request_from_json(r#"{ "successRule": 0 }"#).expect("code 0");
        assert_eq!(request.strategy.success_rule, SuccessRule::SurvivalOnly);
        let request = api_request_from_json(r#"{ "successRule": "1" }"#).expect("code 1");
        assert_eq!(request.strategy.success_rule, SuccessRule::PreserveRealValue);

        let err = api_request_from_json(r#"{ "successRule": 2 }"#).expect_err("code 2");
        assert!(err.contains("unrecognized success rule"));
    }

    #[test]
    fn empty_payload_uses_defaults() {
        let request = api_request_from_json("{}").expect("defaults");
        assert_eq!(request.strategy, Strategy::default());
    }

    #[test]
    fn error_statuses_separate_bad_config_from_short_history() {
        assert_eq!(
            status_for(&SwrError::invalid_configuration("bad")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SwrError::InvalidRange {
                start: 3,
                retirement_length: 10,
                available: 5,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&SwrError::DegenerateInput {
                retirement_length: 720,
                available: 36,
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn solve_response_serialization_contains_expected_fields() {
        let history = small_history();
        let mut args = sample_args();
        args.retirement_length = 24;
        args.success_rule = "survival-only".to_string();
        let strategy = build_strategy(&args, 0.0, 0.0).expect("valid strategy");

        let solution =
            find_solutions(&history, &strategy, SolverConfig::default()).expect("must solve");
        let response = build_solve_response(&strategy, &solution);
        assert_eq!(response.cohort_count, 13);

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"safeWithdrawalRate\""));
        assert!(json.contains("\"safeAdjustmentRate\""));
        assert!(json.contains("\"cohortCount\":13"));
        assert!(json.contains("\"successRule\":\"survival-only\""));
        assert!(json.contains("\"withdrawalIterations\""));
    }

    #[test]
    fn cohort_evaluation_reports_every_cohort() {
        let history = small_history();
        let mut args = sample_args();
        args.retirement_length = 24;
        args.success_rule = "survival-only".to_string();
        let strategy = build_strategy(&args, 4.0, 0.0).expect("valid strategy");

        let response =
            evaluate_cohorts(&history, &strategy, ScanMode::Sequential).expect("cohorts");
        assert_eq!(response.cohorts.len(), 13);
        assert!(response.all_succeed);

        let text = render_cohorts(&response);
        assert_eq!(text.lines().count(), 14);
        assert!(text.ends_with("0 of 13 cohorts fail under survival-only; all succeed: true\n"));

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"allSucceed\":true"));
        assert!(json.contains("\"startOffset\":12"));
        assert!(json.contains("\"endingBalance\""));
    }

    #[test]
    fn cohort_evaluation_rejects_short_history() {
        let history = small_history();
        let strategy = build_strategy(&sample_args(), 4.0, 0.0).expect("valid strategy");
        let err = evaluate_cohorts(&history, &strategy, ScanMode::Sequential)
            .expect_err("720 months do not fit");
        assert_eq!(status_for(&err), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn rendered_solution_prints_one_rate_per_line() {
        let history = small_history();
        let mut args = sample_args();
        args.retirement_length = 24;
        let strategy = build_strategy(&args, 0.0, 0.0).expect("valid strategy");
        let solution =
            find_solutions(&history, &strategy, SolverConfig::default()).expect("must solve");

        let text = render_solution(&solution);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let swr: f64 = lines[0].parse().expect("numeric rate");
        assert_approx(swr, solution.safe_withdrawal_rate);
    }

    fn test_state() -> AppState {
        AppState {
            history: Arc::new(small_history()),
            scan: ScanMode::Sequential,
        }
    }

    async fn json_extract(body: &str) -> Result<Json<StrategyPayload>, JsonRejection> {
        use axum::extract::FromRequest;

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/api/cohorts")
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .expect("request should build");
        Json::<StrategyPayload>::from_request(request, &()).await
    }

    async fn error_body(response: Response) -> (StatusCode, Option<String>, serde_json::Value) {
        let status = response.status();
        let cache = response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should read");
        let value = serde_json::from_slice(&bytes).expect("body should be JSON");
        (status, cache, value)
    }

    #[tokio::test]
    async fn malformed_json_payloads_get_json_errors() {
        for body in [
            r#"{ "successRule": 300 }"#,
            r#"{ "successRule": -1 }"#,
            r#"{ "savings": "x" }"#,
            "{ not json",
        ] {
            let payload = json_extract(body).await;
            assert!(payload.is_err(), "{body} should be rejected");

            let response = cohorts_handler(State(test_state()), payload).await;
            let (status, cache, value) = error_body(response).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(cache.as_deref(), Some("no-store"));
            let message = value["error"].as_str().expect("error message");
            assert!(message.starts_with("Invalid API payload"), "{message}");
        }

        let payload = json_extract(r#"{ "successRule": 300 }"#).await;
        let response = solve_post_handler(State(test_state()), payload).await;
        let (status, _, value) = error_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value["error"].is_string());
    }

    #[tokio::test]
    async fn malformed_query_gets_json_error() {
        use axum::extract::FromRequestParts;

        let (mut parts, _) = axum::http::Request::builder()
            .uri("/api/solve?retirementLength=many")
            .body(())
            .expect("request should build")
            .into_parts();
        let payload = Query::<StrategyPayload>::from_request_parts(&mut parts, &()).await;
        assert!(payload.is_err());

        let response = solve_get_handler(State(test_state()), payload).await;
        let (status, _, value) = error_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            value["error"]
                .as_str()
                .is_some_and(|m| m.starts_with("Invalid API payload"))
        );
    }

    #[tokio::test]
    async fn well_formed_payload_reaches_validation() {
        let payload = json_extract(r#"{ "retirementLength": 24, "withdrawalRate": 4 }"#).await;
        let response = cohorts_handler(State(test_state()), payload).await;
        assert_eq!(response.status(), StatusCode::OK);

        // Parsed but invalid values keep their validation message.
        let payload = json_extract(r#"{ "initialEquityWeight": 150 }"#).await;
        let response = cohorts_handler(State(test_state()), payload).await;
        let (status, _, value) = error_body(response).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(
            value["error"]
                .as_str()
                .is_some_and(|m| m.contains("--initial-equity-weight"))
        );
    }

    #[test]
    fn rendered_trace_has_header_and_one_row_per_month() {
        let history = small_history();
        let mut args = sample_args();
        args.retirement_length = 12;
        let strategy = build_strategy(&args, 4.0, 8.0).expect("valid strategy");
        let rows = trace_cohort(&history, 3, &strategy).expect("valid cohort");

        let text = render_trace(&rows);
        assert_eq!(text.lines().count(), 12);
        assert!(text.starts_with("month"));
    }
}
