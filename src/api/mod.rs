use axum::{
    Router,
    extract::{Json, Query},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    AnnualNeeds, BacktestResult, EngineError, FieldError, HoldingTotals, MarketSnapshot, MarketYear,
    MonteCarloSummary, ParametricModel, Policy, Portfolio, SaleOrder, SamplingMethod,
    SimulationConfig, StressPreset, SweepSummary, YearInput, evaluate_year, run_backtest,
    run_historical_sweep, run_monte_carlo,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliMode {
    MonteCarlo,
    Backtest,
    Sweep,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSampling {
    Parametric,
    Bootstrap,
}

impl From<CliSampling> for SamplingMethod {
    fn from(value: CliSampling) -> Self {
        match value {
            CliSampling::Parametric => SamplingMethod::Parametric,
            CliSampling::Bootstrap => SamplingMethod::Bootstrap,
        }
    }
}

impl From<SamplingMethod> for CliSampling {
    fn from(value: SamplingMethod) -> Self {
        match value {
            SamplingMethod::Parametric => CliSampling::Parametric,
            SamplingMethod::Bootstrap => CliSampling::Bootstrap,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStress {
    #[value(name = "stagflation-70s")]
    Stagflation70s,
    #[value(name = "double-bear-00s")]
    DoubleBear00s,
    #[value(name = "inflation-spike-3y")]
    InflationSpike3y,
    #[value(name = "forced-drawdown-3y")]
    ForcedDrawdown3y,
}

impl From<CliStress> for StressPreset {
    fn from(value: CliStress) -> Self {
        match value {
            CliStress::Stagflation70s => StressPreset::Stagflation70s,
            CliStress::DoubleBear00s => StressPreset::DoubleBear00s,
            CliStress::InflationSpike3y => StressPreset::InflationSpike3y,
            CliStress::ForcedDrawdown3y => StressPreset::ForcedDrawdown3y,
        }
    }
}

impl From<StressPreset> for CliStress {
    fn from(value: StressPreset) -> Self {
        match value {
            StressPreset::Stagflation70s => CliStress::Stagflation70s,
            StressPreset::DoubleBear00s => CliStress::DoubleBear00s,
            StressPreset::InflationSpike3y => CliStress::InflationSpike3y,
            StressPreset::ForcedDrawdown3y => CliStress::ForcedDrawdown3y,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSaleOrder {
    Fifo,
    TaxEfficient,
}

impl From<CliSaleOrder> for SaleOrder {
    fn from(value: CliSaleOrder) -> Self {
        match value {
            CliSaleOrder::Fifo => SaleOrder::Fifo,
            CliSaleOrder::TaxEfficient => SaleOrder::TaxEfficient,
        }
    }
}

impl From<SaleOrder> for CliSaleOrder {
    fn from(value: SaleOrder) -> Self {
        match value {
            SaleOrder::Fifo => CliSaleOrder::Fifo,
            SaleOrder::TaxEfficient => CliSaleOrder::TaxEfficient,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiMode {
    #[serde(alias = "monteCarlo", alias = "monte_carlo", alias = "mc")]
    MonteCarlo,
    Backtest,
    #[serde(alias = "historicalSweep", alias = "historical-sweep")]
    Sweep,
}

impl From<ApiMode> for CliMode {
    fn from(value: ApiMode) -> Self {
        match value {
            ApiMode::MonteCarlo => CliMode::MonteCarlo,
            ApiMode::Backtest => CliMode::Backtest,
            ApiMode::Sweep => CliMode::Sweep,
        }
    }
}

/// Optional overrides on top of `default_cli_for_api()`. Lot-level `portfolio`, a full
/// `policy` and `history` can only be supplied here.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    mode: Option<ApiMode>,

    equity_old_value: Option<f64>,
    equity_old_cost_basis: Option<f64>,
    equity_new_value: Option<f64>,
    equity_new_cost_basis: Option<f64>,
    gold_value: Option<f64>,
    gold_cost_basis: Option<f64>,
    cash: Option<f64>,
    money_market: Option<f64>,
    portfolio: Option<Portfolio>,

    floor: Option<f64>,
    flex: Option<f64>,
    pension: Option<f64>,
    pension_adjustment: Option<f64>,

    target_equity: Option<f64>,
    gold_target: Option<f64>,
    gold_floor: Option<f64>,
    rebalancing_band: Option<f64>,
    max_skim: Option<f64>,
    max_bear_refill: Option<f64>,
    runway_min: Option<f64>,
    runway_target: Option<f64>,
    min_cash_buffer: Option<f64>,
    allowance: Option<f64>,
    church_tax: Option<f64>,
    equity_exemption: Option<f64>,
    gold_exemption: Option<f64>,
    sale_order: Option<SaleOrder>,
    round_flex: Option<bool>,
    policy: Option<Policy>,

    horizon: Option<u32>,
    runs: Option<u32>,
    seed: Option<u64>,
    sampling: Option<SamplingMethod>,
    block_years: Option<u32>,
    stress: Option<StressPreset>,
    equity_mean: Option<f64>,
    equity_vol: Option<f64>,
    gold_mean: Option<f64>,
    gold_vol: Option<f64>,
    gold_correlation: Option<f64>,
    inflation_mean: Option<f64>,
    inflation_vol: Option<f64>,
    cash_rate: Option<f64>,
    history: Option<Vec<MarketYear>>,
    start_year: Option<i32>,
    start_snapshot: Option<MarketSnapshot>,
    continue_after_ruin: Option<bool>,
}

#[derive(Parser, Debug)]
#[command(
    name = "decumulate",
    about = "Guardrail withdrawal planner with German capital gains tax lots"
)]
struct Cli {
    #[arg(long, value_enum, default_value_t = CliMode::MonteCarlo)]
    mode: CliMode,

    #[arg(long, default_value_t = 0.0, help = "Equity bought before 2018 (grandfathered lot)")]
    equity_old_value: f64,
    #[arg(long, help = "Cost basis of the old equity lot; defaults to its value")]
    equity_old_cost_basis: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    equity_new_value: f64,
    #[arg(long, help = "Cost basis of the new equity lot; defaults to its value")]
    equity_new_cost_basis: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    gold_value: f64,
    #[arg(long, help = "Cost basis of the gold lot; defaults to its value")]
    gold_cost_basis: Option<f64>,
    #[arg(long, default_value_t = 0.0)]
    cash: f64,
    #[arg(long, default_value_t = 0.0)]
    money_market: f64,

    #[arg(long, help = "Annual floor spending need")]
    floor: f64,
    #[arg(long, default_value_t = 0.0, help = "Annual flexible spending need")]
    flex: f64,
    #[arg(long, default_value_t = 0.0, help = "Annual pension income")]
    pension: f64,
    #[arg(
        long,
        help = "Annual pension indexation in percent; follows inflation when omitted"
    )]
    pension_adjustment: Option<f64>,

    #[arg(long, default_value_t = 60.0, help = "Target equity share in percent")]
    target_equity: f64,
    #[arg(long, default_value_t = 10.0, help = "Gold target in percent; 0 disables gold")]
    gold_target: f64,
    #[arg(long, default_value_t = 1.0, help = "Gold floor in percent of wealth")]
    gold_floor: f64,
    #[arg(long, default_value_t = 20.0, help = "Rebalancing band in percent")]
    rebalancing_band: f64,
    #[arg(long, default_value_t = 10.0, help = "Max equity skim per year in percent")]
    max_skim: f64,
    #[arg(long, default_value_t = 5.0, help = "Max equity refill in bear markets in percent")]
    max_bear_refill: f64,
    #[arg(long, default_value_t = 24.0)]
    runway_min: f64,
    #[arg(long, default_value_t = 36.0)]
    runway_target: f64,
    #[arg(long, default_value_t = 2.0)]
    min_cash_buffer: f64,
    #[arg(long, default_value_t = 1000.0, help = "Annual capital gains allowance")]
    allowance: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Church tax in percent of the capital gains tax, e.g. 8 or 9"
    )]
    church_tax: f64,
    #[arg(long, default_value_t = 30.0, help = "Partial exemption for equity funds in percent")]
    equity_exemption: f64,
    #[arg(long, default_value_t = 0.0, help = "Tax exemption for gold sales in percent")]
    gold_exemption: f64,
    #[arg(long, value_enum, default_value_t = CliSaleOrder::TaxEfficient)]
    sale_order: CliSaleOrder,
    #[arg(long, help = "Round flex rates to multiples of five")]
    round_flex: bool,

    #[arg(long, default_value_t = 30, help = "Simulated years")]
    horizon: u32,
    #[arg(long, default_value_t = 1000)]
    runs: u32,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, value_enum, default_value_t = CliSampling::Parametric)]
    sampling: CliSampling,
    #[arg(long, default_value_t = 5, help = "Block length for bootstrap sampling")]
    block_years: u32,
    #[arg(long, value_enum)]
    stress: Option<CliStress>,
    #[arg(long, default_value_t = 7.0, help = "Expected equity return in percent")]
    equity_mean: f64,
    #[arg(long, default_value_t = 18.0, help = "Equity return volatility in percent")]
    equity_vol: f64,
    #[arg(long, default_value_t = 4.0)]
    gold_mean: f64,
    #[arg(long, default_value_t = 15.0)]
    gold_vol: f64,
    #[arg(long, default_value_t = 0.0, help = "Correlation between gold and equity returns")]
    gold_correlation: f64,
    #[arg(long, default_value_t = 2.0)]
    inflation_mean: f64,
    #[arg(long, default_value_t = 1.0)]
    inflation_vol: f64,
    #[arg(long, default_value_t = 2.0, help = "Interest on cash in percent")]
    cash_rate: f64,
    #[arg(long, help = "JSON file with an array of market years")]
    history: Option<PathBuf>,
    #[arg(long, help = "First history year of a backtest")]
    start_year: Option<i32>,
    #[arg(long, help = "Keep writing zero rows after ruin in backtests")]
    continue_after_ruin: bool,
    #[arg(long, default_value_t = 0, help = "Worker threads; 0 uses all cores")]
    threads: usize,
}

#[derive(Debug)]
struct ApiRequest {
    mode: CliMode,
    config: SimulationConfig,
}

#[derive(Debug, Serialize)]
#[serde(tag = "mode", content = "result", rename_all = "kebab-case")]
enum SimulateResponse {
    MonteCarlo(MonteCarloSummary),
    Backtest(BacktestResult),
    Sweep(SweepSummary),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<FieldError>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

fn check_non_negative(flag: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("--{flag} must be >= 0"));
    }
    Ok(())
}

fn build_config(cli: &Cli, history: Vec<MarketYear>) -> Result<SimulationConfig, String> {
    if cli.runs == 0 {
        return Err("--runs must be > 0".to_string());
    }

    if cli.horizon == 0 || cli.horizon > 100 {
        return Err("--horizon must be between 1 and 100".to_string());
    }

    if cli.block_years == 0 {
        return Err("--block-years must be > 0".to_string());
    }

    for (flag, value) in [
        ("equity-old-value", cli.equity_old_value),
        ("equity-new-value", cli.equity_new_value),
        ("gold-value", cli.gold_value),
        ("cash", cli.cash),
        ("money-market", cli.money_market),
        ("floor", cli.floor),
        ("flex", cli.flex),
        ("pension", cli.pension),
        ("allowance", cli.allowance),
        ("equity-vol", cli.equity_vol),
        ("gold-vol", cli.gold_vol),
        ("inflation-vol", cli.inflation_vol),
    ] {
        check_non_negative(flag, value)?;
    }

    for (flag, basis) in [
        ("equity-old-cost-basis", cli.equity_old_cost_basis),
        ("equity-new-cost-basis", cli.equity_new_cost_basis),
        ("gold-cost-basis", cli.gold_cost_basis),
    ] {
        if let Some(basis) = basis {
            check_non_negative(flag, basis)?;
        }
    }

    if !(0.0..=10.0).contains(&cli.church_tax) {
        return Err("--church-tax must be between 0 and 10".to_string());
    }

    if !(0.0..=100.0).contains(&cli.equity_exemption) {
        return Err("--equity-exemption must be between 0 and 100".to_string());
    }

    if !(0.0..=100.0).contains(&cli.gold_exemption) {
        return Err("--gold-exemption must be between 0 and 100".to_string());
    }

    if !(-1.0..=1.0).contains(&cli.gold_correlation) {
        return Err("--gold-correlation must be between -1 and 1".to_string());
    }

    if cli.sampling == CliSampling::Bootstrap && history.is_empty() {
        return Err("--history is required with --sampling bootstrap".to_string());
    }

    if cli.mode != CliMode::MonteCarlo && history.is_empty() {
        return Err("--history is required for backtests and sweeps".to_string());
    }

    let equity_exemption = cli.equity_exemption / 100.0;
    let gold_exemption = cli.gold_exemption / 100.0;
    let portfolio = Portfolio::from_totals(&HoldingTotals {
        equity_old_value: cli.equity_old_value,
        equity_old_cost_basis: cli.equity_old_cost_basis.unwrap_or(cli.equity_old_value),
        equity_new_value: cli.equity_new_value,
        equity_new_cost_basis: cli.equity_new_cost_basis.unwrap_or(cli.equity_new_value),
        gold_value: cli.gold_value,
        gold_cost_basis: cli.gold_cost_basis.unwrap_or(cli.gold_value),
        cash_on_hand: cli.cash,
        money_market: cli.money_market,
        equity_exemption,
        gold_exemption,
    });

    let policy = Policy {
        target_equity_pct: cli.target_equity,
        gold_target_pct: cli.gold_target,
        gold_floor_pct: cli.gold_floor,
        rebalancing_band_pct: cli.rebalancing_band,
        max_skim_pct: cli.max_skim,
        max_bear_refill_pct: cli.max_bear_refill,
        runway_min_months: cli.runway_min,
        runway_target_months: cli.runway_target,
        min_cash_buffer_months: cli.min_cash_buffer,
        annual_allowance: cli.allowance,
        church_tax_rate: cli.church_tax / 100.0,
        equity_exemption,
        gold_exemption,
        round_flex_to_five: cli.round_flex,
        sale_order: cli.sale_order.into(),
        ..Policy::default()
    };

    Ok(SimulationConfig {
        portfolio,
        needs: AnnualNeeds {
            floor: cli.floor,
            flex: cli.flex,
            pension: cli.pension,
        },
        policy,
        start_snapshot: None,
        history,
        horizon_years: cli.horizon,
        runs: cli.runs,
        seed: cli.seed,
        sampling: cli.sampling.into(),
        parametric: ParametricModel {
            equity_mean: cli.equity_mean / 100.0,
            equity_vol: cli.equity_vol / 100.0,
            gold_mean: cli.gold_mean / 100.0,
            gold_vol: cli.gold_vol / 100.0,
            gold_equity_correlation: cli.gold_correlation,
            inflation_mean: cli.inflation_mean / 100.0,
            inflation_vol: cli.inflation_vol / 100.0,
            cash_rate: cli.cash_rate / 100.0,
        },
        block_years: cli.block_years,
        stress: cli.stress.map(Into::into),
        pension_adjustment_pct: cli.pension_adjustment,
        stop_on_ruin: !cli.continue_after_ruin,
        threads: cli.threads,
        backtest_start_year: cli.start_year,
    })
}

fn load_history(path: &Path) -> Result<Vec<MarketYear>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("--history: cannot read {}: {e}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|e| format!("--history: invalid market years in {}: {e}", path.display()))
}

fn run_simulation(mode: CliMode, config: &SimulationConfig) -> Result<SimulateResponse, EngineError> {
    Ok(match mode {
        CliMode::MonteCarlo => SimulateResponse::MonteCarlo(run_monte_carlo(config, None)?),
        CliMode::Backtest => SimulateResponse::Backtest(run_backtest(config)?),
        CliMode::Sweep => SimulateResponse::Sweep(run_historical_sweep(config, None)?),
    })
}

/// Parses flags, runs the requested simulation and renders the result as JSON.
pub fn run_cli<I, T>(args: I) -> Result<String, String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let history = match &cli.history {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };
    let config = build_config(&cli, history)?;
    let response = run_simulation(cli.mode, &config).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&response).map_err(|e| format!("failed to render result: {e}"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/year", post(year_handler))
        .route("/api/health", get(health_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "decumulate HTTP API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn health_handler() -> Response {
    json_response(
        StatusCode::OK,
        HealthResponse {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        },
    )
}

async fn year_handler(Json(input): Json<YearInput>) -> Response {
    match evaluate_year(&input) {
        Ok(decision) => json_response(StatusCode::OK, decision),
        Err(err) => engine_error_response(&err),
    }
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let outcome =
        tokio::task::spawn_blocking(move || run_simulation(request.mode, &request.config)).await;
    match outcome {
        Ok(Ok(response)) => json_response(StatusCode::OK, response),
        Ok(Err(err)) => engine_error_response(&err),
        Err(join_error) => {
            error!(%join_error, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
            fields: Vec::new(),
        },
    )
}

fn engine_error_response(err: &EngineError) -> Response {
    let status = match err {
        EngineError::InvalidInput(_) | EngineError::MissingHistory(_) => StatusCode::BAD_REQUEST,
        EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_response(
        status,
        ErrorResponse {
            error: err.to_string(),
            fields: err.field_errors().to_vec(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.mode {
        cli.mode = v.into();
    }
    if let Some(v) = payload.equity_old_value {
        cli.equity_old_value = v;
        cli.equity_old_cost_basis = None;
    }
    if let Some(v) = payload.equity_old_cost_basis {
        cli.equity_old_cost_basis = Some(v);
    }
    if let Some(v) = payload.equity_new_value {
        cli.equity_new_value = v;
        cli.equity_new_cost_basis = None;
    }
    if let Some(v) = payload.equity_new_cost_basis {
        cli.equity_new_cost_basis = Some(v);
    }
    if let Some(v) = payload.gold_value {
        cli.gold_value = v;
        cli.gold_cost_basis = None;
    }
    if let Some(v) = payload.gold_cost_basis {
        cli.gold_cost_basis = Some(v);
    }
    if let Some(v) = payload.cash {
        cli.cash = v;
    }
    if let Some(v) = payload.money_market {
        cli.money_market = v;
    }
    if let Some(v) = payload.floor {
        cli.floor = v;
    }
    if let Some(v) = payload.flex {
        cli.flex = v;
    }
    if let Some(v) = payload.pension {
        cli.pension = v;
    }
    if payload.pension_adjustment.is_some() {
        cli.pension_adjustment = payload.pension_adjustment;
    }
    if let Some(v) = payload.target_equity {
        cli.target_equity = v;
    }
    if let Some(v) = payload.gold_target {
        cli.gold_target = v;
    }
    if let Some(v) = payload.gold_floor {
        cli.gold_floor = v;
    }
    if let Some(v) = payload.rebalancing_band {
        cli.rebalancing_band = v;
    }
    if let Some(v) = payload.max_skim {
        cli.max_skim = v;
    }
    if let Some(v) = payload.max_bear_refill {
        cli.max_bear_refill = v;
    }
    if let Some(v) = payload.runway_min {
        cli.runway_min = v;
    }
    if let Some(v) = payload.runway_target {
        cli.runway_target = v;
    }
    if let Some(v) = payload.min_cash_buffer {
        cli.min_cash_buffer = v;
    }
    if let Some(v) = payload.allowance {
        cli.allowance = v;
    }
    if let Some(v) = payload.church_tax {
        cli.church_tax = v;
    }
    if let Some(v) = payload.equity_exemption {
        cli.equity_exemption = v;
    }
    if let Some(v) = payload.gold_exemption {
        cli.gold_exemption = v;
    }
    if let Some(v) = payload.sale_order {
        cli.sale_order = v.into();
    }
    if let Some(v) = payload.round_flex {
        cli.round_flex = v;
    }
    if let Some(v) = payload.horizon {
        cli.horizon = v;
    }
    if let Some(v) = payload.runs {
        cli.runs = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }
    if let Some(v) = payload.sampling {
        cli.sampling = v.into();
    }
    if let Some(v) = payload.block_years {
        cli.block_years = v;
    }
    if let Some(v) = payload.stress {
        cli.stress = Some(v.into());
    }
    if let Some(v) = payload.equity_mean {
        cli.equity_mean = v;
    }
    if let Some(v) = payload.equity_vol {
        cli.equity_vol = v;
    }
    if let Some(v) = payload.gold_mean {
        cli.gold_mean = v;
    }
    if let Some(v) = payload.gold_vol {
        cli.gold_vol = v;
    }
    if let Some(v) = payload.gold_correlation {
        cli.gold_correlation = v;
    }
    if let Some(v) = payload.inflation_mean {
        cli.inflation_mean = v;
    }
    if let Some(v) = payload.inflation_vol {
        cli.inflation_vol = v;
    }
    if let Some(v) = payload.cash_rate {
        cli.cash_rate = v;
    }
    if payload.start_year.is_some() {
        cli.start_year = payload.start_year;
    }
    if let Some(v) = payload.continue_after_ruin {
        cli.continue_after_ruin = v;
    }

    let mut config = build_config(&cli, payload.history.unwrap_or_default())?;
    if let Some(portfolio) = payload.portfolio {
        config.portfolio = portfolio;
    }
    if let Some(policy) = payload.policy {
        config.policy = policy;
    }
    config.start_snapshot = payload.start_snapshot;

    Ok(ApiRequest {
        mode: cli.mode,
        config,
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        mode: CliMode::MonteCarlo,
        equity_old_value: 400_000.0,
        equity_old_cost_basis: Some(180_000.0),
        equity_new_value: 250_000.0,
        equity_new_cost_basis: Some(210_000.0),
        gold_value: 70_000.0,
        gold_cost_basis: Some(55_000.0),
        cash: 60_000.0,
        money_market: 60_000.0,
        floor: 24_000.0,
        flex: 12_000.0,
        pension: 0.0,
        pension_adjustment: None,
        target_equity: 60.0,
        gold_target: 10.0,
        gold_floor: 1.0,
        rebalancing_band: 20.0,
        max_skim: 10.0,
        max_bear_refill: 5.0,
        runway_min: 24.0,
        runway_target: 36.0,
        min_cash_buffer: 2.0,
        allowance: 1_000.0,
        church_tax: 0.0,
        equity_exemption: 30.0,
        gold_exemption: 0.0,
        sale_order: CliSaleOrder::TaxEfficient,
        round_flex: false,
        horizon: 30,
        runs: 1_000,
        seed: 42,
        sampling: CliSampling::Parametric,
        block_years: 5,
        stress: None,
        equity_mean: 7.0,
        equity_vol: 18.0,
        gold_mean: 4.0,
        gold_vol: 15.0,
        gold_correlation: 0.0,
        inflation_mean: 2.0,
        inflation_vol: 1.0,
        cash_rate: 2.0,
        history: None,
        start_year: None,
        continue_after_ruin: false,
        threads: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AssetClass;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        default_cli_for_api()
    }

    fn calm_history(years: usize) -> Vec<MarketYear> {
        (0..years)
            .map(|i| MarketYear {
                year: 2000 + i as i32,
                equity_return_pct: 6.0,
                gold_return_pct: 3.0,
                inflation_pct: 2.0,
                cash_rate_pct: 1.0,
                cape: None,
            })
            .collect()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("readable body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn build_config_defaults_cost_basis_to_value() {
        let mut cli = sample_cli();
        cli.gold_cost_basis = None;

        let config = build_config(&cli, Vec::new()).expect("valid config");
        let gold = config.portfolio.lot("gold").expect("gold lot");
        assert_approx(gold.cost_basis, 70_000.0);
        assert_approx(config.portfolio.total_liquidity(), 120_000.0);
    }

    #[test]
    fn build_config_converts_percentages() {
        let mut cli = sample_cli();
        cli.church_tax = 8.0;
        cli.equity_vol = 20.0;

        let config = build_config(&cli, Vec::new()).expect("valid config");
        assert_approx(config.policy.church_tax_rate, 0.08);
        assert_approx(config.policy.equity_exemption, 0.3);
        assert_approx(config.parametric.equity_vol, 0.2);
        assert_approx(config.parametric.cash_rate, 0.02);
        let old = config.portfolio.lot("equity-old").expect("old lot");
        assert_approx(old.tax_exemption_fraction, 0.3);
    }

    #[test]
    fn build_config_rejects_zero_runs() {
        let mut cli = sample_cli();
        cli.runs = 0;
        assert_eq!(
            build_config(&cli, Vec::new()).unwrap_err(),
            "--runs must be > 0"
        );
    }

    #[test]
    fn build_config_rejects_negative_cost_basis() {
        let mut cli = sample_cli();
        cli.equity_new_cost_basis = Some(-1.0);
        assert_eq!(
            build_config(&cli, Vec::new()).unwrap_err(),
            "--equity-new-cost-basis must be >= 0"
        );
    }

    #[test]
    fn build_config_requires_history_for_backtests() {
        let mut cli = sample_cli();
        cli.mode = CliMode::Backtest;
        assert_eq!(
            build_config(&cli, Vec::new()).unwrap_err(),
            "--history is required for backtests and sweeps"
        );
    }

    #[test]
    fn cli_parses_kebab_case_flags() {
        let cli = Cli::try_parse_from([
            "decumulate",
            "--floor",
            "24000",
            "--mode",
            "sweep",
            "--stress",
            "forced-drawdown-3y",
            "--sale-order",
            "fifo",
        ])
        .expect("valid flags");
        assert_eq!(cli.mode, CliMode::Sweep);
        assert_eq!(cli.stress, Some(CliStress::ForcedDrawdown3y));
        assert_eq!(cli.sale_order, CliSaleOrder::Fifo);
        assert_eq!(cli.runs, 1000);
    }

    #[test]
    fn api_request_from_json_parses_web_keys() {
        let request = api_request_from_json(
            r#"{
                "mode": "monteCarlo",
                "equityOldValue": 500000,
                "floor": 30000,
                "churchTax": 9,
                "stress": "inflation-spike-3y",
                "sampling": "parametric",
                "saleOrder": "fifo",
                "runs": 50,
                "horizon": 20
            }"#,
        )
        .expect("valid payload");

        assert_eq!(request.mode, CliMode::MonteCarlo);
        let config = request.config;
        let old = config.portfolio.lot("equity-old").expect("old lot");
        assert_approx(old.market_value, 500_000.0);
        assert_approx(old.cost_basis, 500_000.0);
        assert_approx(config.needs.floor, 30_000.0);
        assert_approx(config.policy.church_tax_rate, 0.09);
        assert_eq!(config.stress, Some(StressPreset::InflationSpike3y));
        assert_eq!(config.policy.sale_order, SaleOrder::Fifo);
        assert_eq!(config.runs, 50);
        assert_eq!(config.horizon_years, 20);
    }

    #[test]
    fn api_request_accepts_lot_level_portfolio_and_history() {
        let request = api_request_from_json(
            r#"{
                "mode": "backtest",
                "startYear": 2003,
                "portfolio": {
                    "tranches": [
                        {"id": "etf-2015", "assetClass": "equity-old", "marketValue": 300000, "costBasis": 120000, "taxExemptionFraction": 0.3, "purchaseDate": "2015-04-01"}
                    ],
                    "cashOnHand": 90000
                },
                "history": [
                    {"year": 2002, "equityReturnPct": -20.0, "inflationPct": 1.4},
                    {"year": 2003, "equityReturnPct": 25.0, "inflationPct": 1.0}
                ]
            }"#,
        )
        .expect("valid payload");

        assert_eq!(request.mode, CliMode::Backtest);
        assert_eq!(request.config.portfolio.tranches.len(), 1);
        assert_eq!(
            request.config.portfolio.tranches[0].asset_class,
            AssetClass::EquityOld
        );
        assert_eq!(request.config.history.len(), 2);
        assert_eq!(request.config.backtest_start_year, Some(2003));
    }

    #[test]
    fn api_request_rejects_unknown_stress_preset() {
        let err = api_request_from_json(r#"{"stress": "dot-com"}"#).unwrap_err();
        assert!(err.starts_with("Invalid API JSON payload"));
    }

    #[test]
    fn backtest_response_is_tagged_by_mode() {
        let mut cli = sample_cli();
        cli.mode = CliMode::Backtest;
        cli.horizon = 5;
        let config = build_config(&cli, calm_history(8)).expect("valid config");
        let response = run_simulation(cli.mode, &config).expect("backtest runs");
        let json = serde_json::to_value(&response).expect("serializable");
        assert_eq!(json["mode"], "backtest");
        assert_eq!(json["result"]["startYear"], 2000);
        assert_eq!(json["result"]["yearsSimulated"], 5);
    }

    #[tokio::test]
    async fn health_reports_ok_without_caching() {
        let response = health_handler().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&HeaderValue::from_static("no-store"))
        );
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn year_endpoint_lists_invalid_fields() {
        let input = YearInput {
            snapshot: MarketSnapshot::flat(100.0, 2.0),
            portfolio: Portfolio::default().with_cash(50_000.0),
            needs: AnnualNeeds {
                floor: -5.0,
                flex: 0.0,
                pension: 0.0,
            },
            policy: Policy::default(),
            state: None,
        };
        let response = year_handler(Json(input)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["fields"][0]["field"], "needs.floor");
    }

    #[tokio::test]
    async fn year_endpoint_returns_decision() {
        let input = YearInput {
            snapshot: MarketSnapshot::flat(100.0, 2.0),
            portfolio: Portfolio::default().with_cash(120_000.0),
            needs: AnnualNeeds {
                floor: 24_000.0,
                flex: 12_000.0,
                pension: 0.0,
            },
            policy: Policy::default(),
            state: None,
        };
        let response = year_handler(Json(input)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["spending"]["flexRate"], 100.0);
        assert_eq!(body["targetLiquidity"], 108_000.0);
    }

    #[tokio::test]
    async fn simulate_rejects_bad_flags_with_400() {
        let payload = SimulatePayload {
            runs: Some(0),
            ..SimulatePayload::default()
        };
        let response = simulate_handler_impl(payload).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "--runs must be > 0");
    }

    #[tokio::test]
    async fn simulate_runs_small_monte_carlo() {
        let payload = SimulatePayload {
            runs: Some(8),
            horizon: Some(5),
            ..SimulatePayload::default()
        };
        let response = simulate_handler_impl(payload).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["mode"], "monte-carlo");
        assert_eq!(body["result"]["runs"], 8);
    }
}
