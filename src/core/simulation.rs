use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::config::Policy;
use super::engine::{apply_year, decide_year};
use super::error::{EngineError, ValidationErrors};
use super::ledger::{TaxState, settle_tax_year};
use super::market::Scenario;
use super::planner::PlannerState;
use super::types::{AnnualNeeds, MarketSnapshot, Portfolio};
use super::validation::{SimulationMode, validate_simulation};

/// Withdrawals this far short of the requested amount still count as covered.
const SHORTFALL_TOLERANCE: f64 = 0.01;

/// One market year. Returns and inflation are in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketYear {
    #[serde(default)]
    pub year: i32,
    pub equity_return_pct: f64,
    #[serde(default)]
    pub gold_return_pct: f64,
    pub inflation_pct: f64,
    #[serde(default)]
    pub cash_rate_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cape: Option<f64>,
}

impl MarketYear {
    /// Real equity return in points, as a simple difference.
    fn real_equity_return_pct(&self) -> f64 {
        self.equity_return_pct - self.inflation_pct
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingMethod {
    #[default]
    Parametric,
    #[serde(alias = "block", alias = "block-bootstrap")]
    Bootstrap,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StressPreset {
    #[serde(rename = "stagflation-70s", alias = "stagflation_70s")]
    Stagflation70s,
    #[serde(rename = "double-bear-00s", alias = "double_bear_00s")]
    DoubleBear00s,
    #[serde(rename = "inflation-spike-3y", alias = "inflation_spike_3y")]
    InflationSpike3y,
    #[serde(rename = "forced-drawdown-3y", alias = "forced_drawdown_3y")]
    ForcedDrawdown3y,
}

impl StressPreset {
    pub fn years(self) -> usize {
        match self {
            StressPreset::Stagflation70s => 7,
            StressPreset::DoubleBear00s => 6,
            StressPreset::InflationSpike3y | StressPreset::ForcedDrawdown3y => 3,
        }
    }
}

/// Independent normal draws per year; returns and inflation are fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParametricModel {
    pub equity_mean: f64,
    pub equity_vol: f64,
    pub gold_mean: f64,
    pub gold_vol: f64,
    pub gold_equity_correlation: f64,
    pub inflation_mean: f64,
    pub inflation_vol: f64,
    pub cash_rate: f64,
}

impl Default for ParametricModel {
    fn default() -> Self {
        Self {
            equity_mean: 0.07,
            equity_vol: 0.18,
            gold_mean: 0.04,
            gold_vol: 0.15,
            gold_equity_correlation: 0.0,
            inflation_mean: 0.02,
            inflation_vol: 0.01,
            cash_rate: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub portfolio: Portfolio,
    pub needs: AnnualNeeds,
    pub policy: Policy,
    /// Market state before the first simulated year. Derived from history when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_snapshot: Option<MarketSnapshot>,
    pub history: Vec<MarketYear>,
    pub horizon_years: u32,
    pub runs: u32,
    pub seed: u64,
    pub sampling: SamplingMethod,
    pub parametric: ParametricModel,
    pub block_years: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress: Option<StressPreset>,
    /// Pension indexation; follows inflation when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pension_adjustment_pct: Option<f64>,
    pub stop_on_ruin: bool,
    /// Worker threads; 0 uses the available parallelism.
    pub threads: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtest_start_year: Option<i32>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            portfolio: Portfolio::default(),
            needs: AnnualNeeds::default(),
            policy: Policy::default(),
            start_snapshot: None,
            history: Vec::new(),
            horizon_years: 30,
            runs: 1_000,
            seed: 42,
            sampling: SamplingMethod::Parametric,
            parametric: ParametricModel::default(),
            block_years: 5,
            stress: None,
            pension_adjustment_pct: None,
            stop_on_ruin: true,
            threads: 0,
            backtest_start_year: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearRecord {
    pub year: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar_year: Option<i32>,
    /// Absent for the zero rows written after ruin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<Scenario>,
    pub flex_rate: f64,
    pub withdrawal: f64,
    pub alarm_active: bool,
    pub action: String,
    pub tax_paid: f64,
    pub liquidity: f64,
    pub wealth: f64,
    pub real_wealth: f64,
    pub equity_return_pct: f64,
    pub inflation_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ruin_year: Option<u32>,
    pub final_wealth: f64,
    pub final_real_wealth: f64,
    pub total_taxes: f64,
    pub alarm_years: u32,
    pub min_flex_rate: f64,
    pub volatility: f64,
    pub max_drawdown: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub years: Vec<YearRecord>,
    /// Real wealth at the end of each year, zero after ruin.
    #[serde(skip)]
    real_wealth_path: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

impl Percentiles {
    fn of(values: &mut [f64]) -> Self {
        Self {
            p10: percentile(values, 10.0),
            p25: percentile(values, 25.0),
            p50: percentile(values, 50.0),
            p75: percentile(values, 75.0),
            p90: percentile(values, 90.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WealthBand {
    pub year: u32,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloSummary {
    pub runs: u32,
    pub horizon_years: u32,
    pub success_rate: f64,
    pub final_wealth: Percentiles,
    pub final_real_wealth: Percentiles,
    pub median_max_drawdown: f64,
    pub p90_max_drawdown: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub median_ruin_year: Option<f64>,
    pub median_total_taxes: f64,
    pub median_alarm_years: f64,
    pub median_volatility: f64,
    pub wealth_bands: Vec<WealthBand>,
    /// Stress preset actually applied; absent when none was requested or it fell back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stress: Option<StressPreset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub start_year: i32,
    pub years_simulated: u32,
    pub path: PathResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepWindow {
    pub start_year: i32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ruin_year: Option<u32>,
    pub final_real_wealth: f64,
    pub max_drawdown: f64,
    pub min_flex_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub windows: Vec<SweepWindow>,
    pub success_rate: f64,
    pub median_final_real_wealth: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worst_start_year: Option<i32>,
}

/// Replays the configured history from `backtest_start_year` (or its first year).
pub fn run_backtest(config: &SimulationConfig) -> Result<BacktestResult, EngineError> {
    validate_simulation(config, SimulationMode::Backtest)?;
    let history = &config.history;
    let start_index = match config.backtest_start_year {
        Some(year) => history
            .iter()
            .position(|h| h.year == year)
            .ok_or_else(|| {
                let mut errors = ValidationErrors::new();
                errors.push("backtestStartYear", "must be a year in the history");
                EngineError::InvalidInput(errors)
            })?,
        None => 0,
    };
    let end = (start_index + config.horizon_years as usize).min(history.len());
    let years = &history[start_index..end];
    let start = config
        .start_snapshot
        .unwrap_or_else(|| snapshot_from_history(history, start_index));

    info!(
        start_year = history[start_index].year,
        years = years.len(),
        "backtest started"
    );
    let path = simulate_path(config, start, years, true);
    info!(
        success = path.success,
        final_wealth = path.final_wealth,
        "backtest finished"
    );

    Ok(BacktestResult {
        start_year: history[start_index].year,
        years_simulated: path.years.len() as u32,
        path,
    })
}

/// Backtests every full window of `horizon_years` in the history.
pub fn run_historical_sweep(
    config: &SimulationConfig,
    cancel: Option<&AtomicBool>,
) -> Result<SweepSummary, EngineError> {
    validate_simulation(config, SimulationMode::Sweep)?;
    let history = &config.history;
    let horizon = config.horizon_years as usize;
    let window_count = history.len() + 1 - horizon;
    info!(windows = window_count, horizon, "historical sweep started");

    let windows = run_parallel(window_count, config.threads, cancel, |start_index| {
        let start = snapshot_from_history(history, start_index);
        let path = simulate_path(
            config,
            start,
            &history[start_index..start_index + horizon],
            false,
        );
        SweepWindow {
            start_year: history[start_index].year,
            success: path.success,
            ruin_year: path.ruin_year,
            final_real_wealth: path.final_real_wealth,
            max_drawdown: path.max_drawdown,
            min_flex_rate: path.min_flex_rate,
        }
    })
    .ok_or_else(|| {
        warn!("historical sweep cancelled");
        EngineError::Cancelled
    })?;

    let successes = windows.iter().filter(|w| w.success).count();
    let mut finals: Vec<f64> = windows.iter().map(|w| w.final_real_wealth).collect();
    let worst_start_year = windows
        .iter()
        .min_by(|a, b| {
            let a_ruin = a.ruin_year.unwrap_or(u32::MAX);
            let b_ruin = b.ruin_year.unwrap_or(u32::MAX);
            a_ruin
                .cmp(&b_ruin)
                .then_with(|| a.final_real_wealth.total_cmp(&b.final_real_wealth))
        })
        .map(|w| w.start_year);

    info!(successes, windows = windows.len(), "historical sweep finished");
    Ok(SweepSummary {
        success_rate: successes as f64 / windows.len() as f64,
        median_final_real_wealth: percentile(&mut finals, 50.0),
        worst_start_year,
        windows,
    })
}

/// Runs independent sampled paths on scoped worker threads.
pub fn run_monte_carlo(
    config: &SimulationConfig,
    cancel: Option<&AtomicBool>,
) -> Result<MonteCarloSummary, EngineError> {
    validate_simulation(config, SimulationMode::MonteCarlo)?;
    let sampler = Sampler::new(config);
    let horizon = config.horizon_years as usize;
    let start = config
        .start_snapshot
        .unwrap_or_else(|| default_start_snapshot(config));

    info!(
        runs = config.runs,
        horizon,
        sampling = ?config.sampling,
        stress = ?sampler.applied_stress(),
        "monte carlo started"
    );
    let paths = run_parallel(config.runs as usize, config.threads, cancel, |path_index| {
        let mut rng = Rng::new(derive_seed(config.seed, 0, path_index as u32));
        let years = sampler.sample_years(horizon, &mut rng);
        simulate_path(config, start, &years, false)
    })
    .ok_or_else(|| {
        warn!("monte carlo cancelled");
        EngineError::Cancelled
    })?;

    let summary = summarize(&paths, config, sampler.applied_stress());
    info!(
        success_rate = summary.success_rate,
        median_final_real_wealth = summary.final_real_wealth.p50,
        "monte carlo finished"
    );
    Ok(summary)
}

fn default_start_snapshot(config: &SimulationConfig) -> MarketSnapshot {
    let inflation_pct = match config.sampling {
        SamplingMethod::Parametric => config.parametric.inflation_mean * 100.0,
        SamplingMethod::Bootstrap => config
            .history
            .last()
            .map_or(config.parametric.inflation_mean * 100.0, |y| y.inflation_pct),
    };
    MarketSnapshot::flat(100.0, inflation_pct)
}

/// Index levels rebuilt from the returns before `start`, starting at 100.
pub fn snapshot_from_history(history: &[MarketYear], start: usize) -> MarketSnapshot {
    let start = start.min(history.len());
    let mut levels = Vec::with_capacity(start + 1);
    let mut level = 100.0_f64;
    levels.push(level);
    for year in &history[..start] {
        level = (level * (1.0 + year.equity_return_pct / 100.0)).max(0.0);
        levels.push(level);
    }
    let at = |back: usize| levels[start.saturating_sub(back)];
    let (ath_index, all_time_high) = levels
        .iter()
        .enumerate()
        .fold((0, 0.0_f64), |best, (i, v)| if *v >= best.1 { (i, *v) } else { best });

    let (inflation_pct, cape) = match start.checked_sub(1).and_then(|i| history.get(i)) {
        Some(prev) => (prev.inflation_pct, prev.cape),
        None => history
            .get(start)
            .map_or((0.0, None), |y| (y.inflation_pct, y.cape)),
    };

    MarketSnapshot {
        current_level: at(0),
        level_1y_ago: at(1),
        level_2y_ago: at(2),
        level_3y_ago: at(3),
        all_time_high,
        years_since_ath: (start - ath_index) as u32,
        inflation_pct,
        cape,
    }
}

fn simulate_path(
    config: &SimulationConfig,
    start: MarketSnapshot,
    years: &[MarketYear],
    keep_records: bool,
) -> PathResult {
    let policy = &config.policy;
    let mut portfolio = config.portfolio.clone();
    let mut needs = config.needs;
    let mut snapshot = start;
    let mut state: Option<PlannerState> = None;
    let mut tax_state = TaxState::default();
    let mut price_index = 1.0;

    let mut wealth = Vec::with_capacity(years.len() + 1);
    wealth.push(portfolio.total_wealth());
    let mut real_wealth_path = Vec::with_capacity(years.len());
    let mut records = Vec::new();
    let mut total_taxes = 0.0;
    let mut alarm_years = 0;
    let mut min_flex_rate = 100.0_f64;
    let mut ruin_year = None;

    for (index, year) in years.iter().enumerate() {
        let decision = decide_year(&snapshot, &portfolio, &needs, policy, state.as_ref());
        let withdrawal = decision.annual_withdrawal();
        let (after, shortfall) =
            apply_year(portfolio, &decision.transaction, policy).after_withdrawal(withdrawal);
        portfolio = after;
        min_flex_rate = min_flex_rate.min(decision.spending.flex_rate);
        if decision.spending.alarm_active {
            alarm_years += 1;
        }

        if shortfall > SHORTFALL_TOLERANCE
            || portfolio.total_wealth() <= policy.thresholds.ruin_wealth
        {
            ruin_year = Some(index as u32 + 1);
            total_taxes += decision.transaction.tax_owed;
            if keep_records {
                records.push(YearRecord {
                    year: index as u32 + 1,
                    calendar_year: (year.year != 0).then_some(year.year),
                    scenario: Some(decision.market.scenario),
                    flex_rate: decision.spending.flex_rate,
                    withdrawal: withdrawal - shortfall,
                    alarm_active: decision.spending.alarm_active,
                    action: decision.transaction.title.clone(),
                    tax_paid: decision.transaction.tax_owed,
                    liquidity: 0.0,
                    wealth: 0.0,
                    real_wealth: 0.0,
                    equity_return_pct: year.equity_return_pct,
                    inflation_pct: year.inflation_pct,
                });
            }
            break;
        }

        let equity_return = year.equity_return_pct / 100.0;
        portfolio = portfolio.after_returns(
            equity_return,
            year.gold_return_pct / 100.0,
            year.cash_rate_pct / 100.0,
        );

        // Sales withhold tax lot by lot; the year settles against losses and carry.
        let settlement = settle_tax_year(
            tax_state,
            decision.transaction.signed_taxable_gain(),
            policy.annual_allowance,
            policy.church_tax_rate,
        );
        portfolio = portfolio.with_cash(decision.transaction.tax_owed - settlement.tax_due);
        tax_state = settlement.next;
        total_taxes += settlement.tax_due;

        let inflation = year.inflation_pct;
        price_index *= 1.0 + inflation / 100.0;
        let total = portfolio.total_wealth();
        wealth.push(total);
        real_wealth_path.push(total / price_index);

        if keep_records {
            records.push(YearRecord {
                year: index as u32 + 1,
                calendar_year: (year.year != 0).then_some(year.year),
                scenario: Some(decision.market.scenario),
                flex_rate: decision.spending.flex_rate,
                withdrawal,
                alarm_active: decision.spending.alarm_active,
                action: decision.transaction.title.clone(),
                tax_paid: settlement.tax_due,
                liquidity: portfolio.total_liquidity(),
                wealth: total,
                real_wealth: total / price_index,
                equity_return_pct: year.equity_return_pct,
                inflation_pct: inflation,
            });
        }

        let next_cape = years.get(index + 1).and_then(|y| y.cape);
        snapshot = snapshot.rolled(equity_return, inflation, next_cape);
        needs = needs.inflated(
            inflation,
            config.pension_adjustment_pct.unwrap_or(inflation),
        );
        state = Some(decision.spending.state.with_inflation(inflation));
    }

    if ruin_year.is_some() {
        wealth.push(0.0);
        real_wealth_path.resize(years.len(), 0.0);
        if keep_records && !config.stop_on_ruin {
            for (index, year) in years.iter().enumerate().skip(records.len()) {
                records.push(YearRecord {
                    year: index as u32 + 1,
                    calendar_year: (year.year != 0).then_some(year.year),
                    scenario: None,
                    flex_rate: 0.0,
                    withdrawal: 0.0,
                    alarm_active: false,
                    action: "ruined".to_string(),
                    tax_paid: 0.0,
                    liquidity: 0.0,
                    wealth: 0.0,
                    real_wealth: 0.0,
                    equity_return_pct: year.equity_return_pct,
                    inflation_pct: year.inflation_pct,
                });
            }
        }
    }

    let (volatility, max_drawdown) = run_stats(&wealth);
    let final_wealth = if ruin_year.is_some() {
        0.0
    } else {
        portfolio.total_wealth()
    };
    PathResult {
        success: ruin_year.is_none(),
        ruin_year,
        final_wealth,
        final_real_wealth: final_wealth / price_index,
        total_taxes,
        alarm_years,
        min_flex_rate,
        volatility,
        max_drawdown,
        years: records,
        real_wealth_path,
    }
}

/// Sample stdev of year-over-year wealth changes and the max drawdown from a running peak.
fn run_stats(wealth: &[f64]) -> (f64, f64) {
    let changes: Vec<f64> = wealth
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    let volatility = if changes.len() > 1 {
        let mean = changes.iter().sum::<f64>() / changes.len() as f64;
        let var = changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>()
            / (changes.len() - 1) as f64;
        var.sqrt()
    } else {
        0.0
    };

    let mut peak = 0.0_f64;
    let mut max_drawdown = 0.0_f64;
    for &w in wealth {
        peak = peak.max(w);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - w) / peak);
        }
    }
    (volatility, max_drawdown)
}

struct WealthBandAccumulator {
    years: Vec<Vec<f64>>,
}

impl WealthBandAccumulator {
    fn new(year_count: usize, expected_samples: usize) -> Self {
        Self {
            years: (0..year_count)
                .map(|_| Vec::with_capacity(expected_samples))
                .collect(),
        }
    }

    fn push(&mut self, path: &[f64]) {
        for (idx, slot) in self.years.iter_mut().enumerate() {
            slot.push(path.get(idx).copied().unwrap_or(0.0));
        }
    }

    fn into_bands(mut self) -> Vec<WealthBand> {
        self.years
            .iter_mut()
            .enumerate()
            .map(|(idx, values)| WealthBand {
                year: idx as u32 + 1,
                p10: percentile(values, 10.0),
                p50: percentile(values, 50.0),
                p90: percentile(values, 90.0),
            })
            .collect()
    }
}

fn summarize(
    paths: &[PathResult],
    config: &SimulationConfig,
    stress: Option<StressPreset>,
) -> MonteCarloSummary {
    let runs = paths.len();
    let successes = paths.iter().filter(|p| p.success).count();
    let collect = |f: fn(&PathResult) -> f64| paths.iter().map(f).collect::<Vec<f64>>();

    let mut final_wealth = collect(|p| p.final_wealth);
    let mut final_real = collect(|p| p.final_real_wealth);
    let mut drawdowns = collect(|p| p.max_drawdown);
    let mut taxes = collect(|p| p.total_taxes);
    let mut alarms = collect(|p| f64::from(p.alarm_years));
    let mut volatility = collect(|p| p.volatility);
    let mut ruin_years: Vec<f64> = paths
        .iter()
        .filter_map(|p| p.ruin_year.map(f64::from))
        .collect();

    let mut bands = WealthBandAccumulator::new(config.horizon_years as usize, runs);
    for path in paths {
        bands.push(&path.real_wealth_path);
    }

    MonteCarloSummary {
        runs: runs as u32,
        horizon_years: config.horizon_years,
        success_rate: successes as f64 / runs as f64,
        final_wealth: Percentiles::of(&mut final_wealth),
        final_real_wealth: Percentiles::of(&mut final_real),
        median_max_drawdown: percentile(&mut drawdowns, 50.0),
        p90_max_drawdown: percentile(&mut drawdowns, 90.0),
        median_ruin_year: (!ruin_years.is_empty()).then(|| percentile(&mut ruin_years, 50.0)),
        median_total_taxes: percentile(&mut taxes, 50.0),
        median_alarm_years: percentile(&mut alarms, 50.0),
        median_volatility: percentile(&mut volatility, 50.0),
        wealth_bands: bands.into_bands(),
        stress,
    }
}

/// Runs `job` for every index on scoped threads; results come back in index order.
/// Returns `None` when cancelled before every index finished.
fn run_parallel<T, F>(count: usize, threads: usize, cancel: Option<&AtomicBool>, job: F) -> Option<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    if count == 0 {
        return Some(Vec::new());
    }
    let available = thread::available_parallelism().map_or(1, |n| n.get());
    let workers = if threads == 0 { available } else { threads }.clamp(1, count);
    let chunk = count.div_ceil(workers);
    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    let job = &job;

    thread::scope(|scope| {
        for (chunk_index, chunk_slots) in slots.chunks_mut(chunk).enumerate() {
            scope.spawn(move || {
                for (offset, slot) in chunk_slots.iter_mut().enumerate() {
                    if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                        return;
                    }
                    *slot = Some(job(chunk_index * chunk + offset));
                }
            });
        }
    });

    slots.into_iter().collect()
}

enum StressPlan {
    Conditional {
        pool: Vec<MarketYear>,
    },
    Shifted {
        mu_shift: f64,
        vol_scale: f64,
        inflation_floor_pct: f64,
    },
    Sequence {
        returns: [f64; 3],
        noise: f64,
        rebound_years: usize,
        rebound_cap: f64,
    },
}

impl StressPlan {
    fn for_preset(preset: StressPreset, history: &[MarketYear]) -> Option<Self> {
        let filter: fn(&MarketYear) -> bool = match preset {
            StressPreset::Stagflation70s => {
                |y| y.inflation_pct >= 7.0 && y.real_equity_return_pct() <= -2.0
            }
            StressPreset::DoubleBear00s => |y| y.real_equity_return_pct() <= -8.0,
            StressPreset::InflationSpike3y => {
                return Some(StressPlan::Shifted {
                    mu_shift: -0.05,
                    vol_scale: 1.5,
                    inflation_floor_pct: 7.0,
                });
            }
            StressPreset::ForcedDrawdown3y => {
                return Some(StressPlan::Sequence {
                    returns: [-0.25, -0.20, -0.15],
                    noise: 0.04,
                    rebound_years: 2,
                    rebound_cap: 0.05,
                });
            }
        };
        let pool: Vec<MarketYear> = history.iter().copied().filter(filter).collect();
        if pool.is_empty() {
            warn!(?preset, "no matching history years for stress preset, running unstressed");
            return None;
        }
        Some(StressPlan::Conditional { pool })
    }
}

struct Sampler<'a> {
    method: SamplingMethod,
    model: ParametricModel,
    history: &'a [MarketYear],
    block_years: usize,
    stress: Option<(StressPreset, StressPlan)>,
    equity_mean: f64,
}

impl<'a> Sampler<'a> {
    fn new(config: &'a SimulationConfig) -> Self {
        let history = config.history.as_slice();
        let equity_mean = match config.sampling {
            SamplingMethod::Parametric => config.parametric.equity_mean,
            SamplingMethod::Bootstrap if !history.is_empty() => {
                history.iter().map(|y| y.equity_return_pct).sum::<f64>()
                    / history.len() as f64
                    / 100.0
            }
            SamplingMethod::Bootstrap => config.parametric.equity_mean,
        };
        let stress = config
            .stress
            .and_then(|preset| StressPlan::for_preset(preset, history).map(|plan| (preset, plan)));
        Self {
            method: config.sampling,
            model: config.parametric,
            history,
            block_years: (config.block_years.max(1) as usize).min(history.len().max(1)),
            stress,
            equity_mean,
        }
    }

    fn applied_stress(&self) -> Option<StressPreset> {
        self.stress.as_ref().map(|(preset, _)| *preset)
    }

    fn sample_years(&self, horizon: usize, rng: &mut Rng) -> Vec<MarketYear> {
        let mut years = Vec::with_capacity(horizon);
        let mut block_start = 0;
        let mut in_block = self.block_years;

        for index in 0..horizon {
            let stress_years = self.applied_stress().map_or(0, StressPreset::years);
            let mut year = match &self.stress {
                Some((_, StressPlan::Conditional { pool })) if index < stress_years => {
                    pool[rng.next_index(pool.len())]
                }
                _ => match self.method {
                    SamplingMethod::Parametric => sample_market(&self.model, rng),
                    SamplingMethod::Bootstrap => {
                        if in_block >= self.block_years {
                            let starts = self.history.len() + 1 - self.block_years;
                            block_start = rng.next_index(starts);
                            in_block = 0;
                        }
                        let year = self.history[block_start + in_block];
                        in_block += 1;
                        year
                    }
                },
            };

            match &self.stress {
                Some((
                    _,
                    StressPlan::Shifted {
                        mu_shift,
                        vol_scale,
                        inflation_floor_pct,
                    },
                )) if index < stress_years => {
                    let r = year.equity_return_pct / 100.0;
                    let shifted = self.equity_mean + (r - self.equity_mean) * vol_scale + mu_shift;
                    year.equity_return_pct = shifted.max(-0.95) * 100.0;
                    year.inflation_pct = year.inflation_pct.max(*inflation_floor_pct);
                }
                Some((
                    _,
                    StressPlan::Sequence {
                        returns,
                        noise,
                        rebound_years,
                        rebound_cap,
                    },
                )) => {
                    if index < returns.len() {
                        let jitter = (rng.next_f64() * 2.0 - 1.0) * noise;
                        year.equity_return_pct = (returns[index] + jitter) * 100.0;
                    } else if index < returns.len() + rebound_years {
                        year.equity_return_pct = year.equity_return_pct.min(rebound_cap * 100.0);
                    }
                }
                _ => {}
            }
            years.push(year);
        }
        years
    }
}

fn sample_market(model: &ParametricModel, rng: &mut Rng) -> MarketYear {
    let z1 = rng.standard_normal();
    let z2 = rng.standard_normal();
    let z3 = rng.standard_normal();

    let corr = model.gold_equity_correlation.clamp(-1.0, 1.0);
    let orth = (1.0 - corr * corr).sqrt();

    let equity = (model.equity_mean + model.equity_vol * z1).clamp(-0.95, 2.5);
    let gold = (model.gold_mean + model.gold_vol * (corr * z1 + orth * z2)).clamp(-0.95, 2.5);
    let inflation = (model.inflation_mean + model.inflation_vol * z3).clamp(-0.03, 0.20);

    MarketYear {
        year: 0,
        equity_return_pct: equity * 100.0,
        gold_return_pct: gold * 100.0,
        inflation_pct: inflation * 100.0,
        cash_rate_pct: model.cash_rate * 100.0,
        cape: None,
    }
}

fn derive_seed(base_seed: u64, stream: u32, path_index: u32) -> u64 {
    let mixed = base_seed ^ ((stream as u64) << 32) ^ path_index as u64;
    splitmix64(mixed)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

struct Rng {
    state: u64,
    cached_normal: Option<f64>,
}

impl Rng {
    fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self {
            state,
            cached_normal: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }

    /// Uniform index in `0..len`; `len` must be positive.
    fn next_index(&mut self, len: usize) -> usize {
        ((self.next_f64() * len as f64) as usize).min(len - 1)
    }

    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        self.cached_normal = Some(r * theta.sin());
        r * theta.cos()
    }
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AssetClass, Tranche};

    fn assert_approx_tol(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}"
        );
    }

    fn calm_history(years: usize) -> Vec<MarketYear> {
        (0..years)
            .map(|i| MarketYear {
                year: 1990 + i as i32,
                equity_return_pct: 5.0,
                gold_return_pct: 2.0,
                inflation_pct: 2.0,
                cash_rate_pct: 1.0,
                cape: None,
            })
            .collect()
    }

    fn sample_config() -> SimulationConfig {
        SimulationConfig {
            portfolio: Portfolio {
                tranches: vec![
                    Tranche::new("alt", AssetClass::EquityOld, 700_000.0, 400_000.0, 0.3),
                    Tranche::new("gold", AssetClass::Gold, 80_000.0, 70_000.0, 0.0),
                ],
                cash_on_hand: 120_000.0,
                money_market: 0.0,
            },
            needs: AnnualNeeds {
                floor: 24_000.0,
                flex: 12_000.0,
                pension: 0.0,
            },
            horizon_years: 15,
            runs: 24,
            seed: 7,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn percentile_interpolates_between_points() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert_approx_tol(percentile(&mut values, 50.0), 2.5, 1e-12);
        assert_approx_tol(percentile(&mut values, 0.0), 1.0, 1e-12);
        assert_approx_tol(percentile(&mut values, 100.0), 4.0, 1e-12);
    }

    #[test]
    fn derive_seed_changes_per_path_and_stream() {
        let base = derive_seed(42, 0, 0);
        assert_ne!(base, derive_seed(42, 0, 1));
        assert_ne!(base, derive_seed(42, 1, 0));
        assert_eq!(base, derive_seed(42, 0, 0));
    }

    #[test]
    fn run_stats_match_hand_calculation() {
        let (vol, dd) = run_stats(&[100.0, 120.0, 90.0, 108.0]);
        assert_approx_tol(vol, 0.0675_f64.sqrt(), 1e-9);
        assert_approx_tol(dd, 0.25, 1e-12);
    }

    #[test]
    fn snapshot_from_history_rebuilds_levels() {
        let mut history = calm_history(4);
        history[0].equity_return_pct = 10.0;
        history[1].equity_return_pct = -20.0;
        history[2].equity_return_pct = 5.0;
        history[2].inflation_pct = 4.0;
        let snap = snapshot_from_history(&history, 3);
        assert_approx_tol(snap.current_level, 92.4, 1e-9);
        assert_approx_tol(snap.level_1y_ago, 88.0, 1e-9);
        assert_approx_tol(snap.level_2y_ago, 110.0, 1e-9);
        assert_approx_tol(snap.level_3y_ago, 100.0, 1e-9);
        assert_approx_tol(snap.all_time_high, 110.0, 1e-9);
        assert_eq!(snap.years_since_ath, 2);
        assert_eq!(snap.inflation_pct, 4.0);
    }

    #[test]
    fn calm_backtest_survives_and_records_every_year() {
        let config = SimulationConfig {
            history: calm_history(20),
            horizon_years: 20,
            ..sample_config()
        };
        let result = run_backtest(&config).expect("valid config");
        assert!(result.path.success);
        assert_eq!(result.start_year, 1990);
        assert_eq!(result.years_simulated, 20);
        assert_eq!(result.path.years[0].calendar_year, Some(1990));
        assert!(result.path.final_wealth > 0.0);
        assert!(result.path.years.iter().all(|y| y.flex_rate <= 100.0));
    }

    #[test]
    fn backtest_starts_at_requested_year() {
        let config = SimulationConfig {
            history: calm_history(20),
            horizon_years: 5,
            backtest_start_year: Some(2000),
            ..sample_config()
        };
        let result = run_backtest(&config).expect("valid config");
        assert_eq!(result.start_year, 2000);
        assert_eq!(result.years_simulated, 5);
    }

    #[test]
    fn backtest_rejects_start_year_outside_history() {
        let config = SimulationConfig {
            history: calm_history(20),
            horizon_years: 5,
            backtest_start_year: Some(1850),
            ..sample_config()
        };
        let err = run_backtest(&config).expect_err("unknown start year");
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(err
            .field_errors()
            .iter()
            .any(|e| e.field == "backtestStartYear"));
    }

    #[test]
    fn cash_only_portfolio_is_ruined_in_second_year() {
        let config = SimulationConfig {
            portfolio: Portfolio {
                tranches: Vec::new(),
                cash_on_hand: 50_000.0,
                money_market: 0.0,
            },
            history: calm_history(10),
            horizon_years: 10,
            ..sample_config()
        };
        let result = run_backtest(&config).expect("valid config");
        assert!(!result.path.success);
        assert_eq!(result.path.ruin_year, Some(2));
        assert_eq!(result.path.years.len(), 2);
        assert_eq!(result.path.final_wealth, 0.0);
        assert_eq!(result.path.max_drawdown, 1.0);
    }

    #[test]
    fn historical_sweep_covers_every_full_window() {
        let config = SimulationConfig {
            history: calm_history(12),
            horizon_years: 10,
            ..sample_config()
        };
        let sweep = run_historical_sweep(&config, None).expect("valid config");
        let starts: Vec<i32> = sweep.windows.iter().map(|w| w.start_year).collect();
        assert_eq!(starts, vec![1990, 1991, 1992]);
        assert_eq!(sweep.success_rate, 1.0);
    }

    #[test]
    fn monte_carlo_is_independent_of_thread_count() {
        let single = run_monte_carlo(
            &SimulationConfig {
                threads: 1,
                ..sample_config()
            },
            None,
        )
        .expect("valid config");
        let parallel = run_monte_carlo(
            &SimulationConfig {
                threads: 4,
                ..sample_config()
            },
            None,
        )
        .expect("valid config");
        assert_eq!(single, parallel);
        assert_eq!(single.runs, 24);
        assert_eq!(single.wealth_bands.len(), 15);
    }

    #[test]
    fn zero_volatility_paths_are_identical() {
        let config = SimulationConfig {
            parametric: ParametricModel {
                equity_vol: 0.0,
                gold_vol: 0.0,
                inflation_vol: 0.0,
                ..ParametricModel::default()
            },
            ..sample_config()
        };
        let summary = run_monte_carlo(&config, None).expect("valid config");
        assert_eq!(summary.final_wealth.p10, summary.final_wealth.p90);
        assert_eq!(summary.success_rate, 1.0);
        assert!(summary.median_ruin_year.is_none());
    }

    #[test]
    fn cancelled_run_reports_cancellation() {
        let cancel = AtomicBool::new(true);
        let err = run_monte_carlo(&sample_config(), Some(&cancel)).unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
    }

    #[test]
    fn bootstrap_draws_contiguous_blocks() {
        let config = SimulationConfig {
            history: calm_history(10),
            sampling: SamplingMethod::Bootstrap,
            block_years: 3,
            ..sample_config()
        };
        let sampler = Sampler::new(&config);
        let mut rng = Rng::new(11);
        let years = sampler.sample_years(9, &mut rng);
        for block in years.chunks(3) {
            assert_eq!(block[1].year, block[0].year + 1);
            assert_eq!(block[2].year, block[1].year + 1);
        }
    }

    #[test]
    fn forced_drawdown_overrides_first_years_then_caps_rebound() {
        let config = SimulationConfig {
            stress: Some(StressPreset::ForcedDrawdown3y),
            parametric: ParametricModel {
                equity_mean: 0.30,
                equity_vol: 0.0,
                ..ParametricModel::default()
            },
            ..sample_config()
        };
        let sampler = Sampler::new(&config);
        let years = sampler.sample_years(7, &mut Rng::new(3));
        for (year, base) in years.iter().zip([-25.0, -20.0, -15.0]) {
            assert!((year.equity_return_pct - base).abs() <= 4.0 + 1e-9);
        }
        assert_approx_tol(years[3].equity_return_pct, 5.0, 1e-9);
        assert_approx_tol(years[4].equity_return_pct, 5.0, 1e-9);
        assert_approx_tol(years[5].equity_return_pct, 30.0, 1e-9);
    }

    #[test]
    fn conditional_stress_without_history_falls_back() {
        let config = SimulationConfig {
            stress: Some(StressPreset::Stagflation70s),
            ..sample_config()
        };
        let summary = run_monte_carlo(&config, None).expect("valid config");
        assert_eq!(summary.stress, None);
    }

    #[test]
    fn stagflation_stress_draws_only_matching_years() {
        let mut history = calm_history(10);
        history[4].inflation_pct = 9.0;
        history[4].equity_return_pct = -5.0;
        let config = SimulationConfig {
            history,
            sampling: SamplingMethod::Bootstrap,
            stress: Some(StressPreset::Stagflation70s),
            ..sample_config()
        };
        let sampler = Sampler::new(&config);
        let years = sampler.sample_years(9, &mut Rng::new(5));
        assert!(years[..7].iter().all(|y| y.year == 1994));
        assert_eq!(sampler.applied_stress(), Some(StressPreset::Stagflation70s));
    }

    #[test]
    fn monte_carlo_rejects_zero_runs() {
        let config = SimulationConfig {
            runs: 0,
            ..sample_config()
        };
        let err = run_monte_carlo(&config, None).unwrap_err();
        assert!(err.field_errors().iter().any(|e| e.field == "runs"));
    }

    #[test]
    fn backtest_requires_history() {
        let err = run_backtest(&sample_config()).unwrap_err();
        assert_eq!(err, EngineError::MissingHistory("backtest"));
    }
}
