use std::collections::HashSet;

use super::config::Policy;
use super::error::{EngineError, ValidationErrors};
use super::simulation::{SamplingMethod, SimulationConfig};
use super::types::{AnnualNeeds, MarketSnapshot, Portfolio};

/// Which driver a simulation config is about to run under.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SimulationMode {
    Backtest,
    Sweep,
    MonteCarlo,
}

fn check_range(errors: &mut ValidationErrors, field: &str, value: f64, min: f64, max: f64) {
    if !value.is_finite() || value < min || value > max {
        errors.push(field, format!("must be between {min} and {max}"));
    }
}

fn check_non_negative(errors: &mut ValidationErrors, field: &str, value: f64) {
    if !value.is_finite() || value < 0.0 {
        errors.push(field, "must be >= 0");
    }
}

fn check_positive(errors: &mut ValidationErrors, field: &str, value: f64) {
    if !value.is_finite() || value <= 0.0 {
        errors.push(field, "must be > 0");
    }
}

/// `YYYY-MM-DD` with a plausible month and day.
fn is_iso_date(date: &str) -> bool {
    let bytes = date.as_bytes();
    if !date.is_ascii() || bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return false;
    }
    let digits = |range: std::ops::Range<usize>| -> Option<u32> {
        let part = &date[range];
        if part.bytes().all(|b| b.is_ascii_digit()) {
            part.parse().ok()
        } else {
            None
        }
    };
    match (digits(0..4), digits(5..7), digits(8..10)) {
        (Some(_), Some(month), Some(day)) => (1..=12).contains(&month) && (1..=31).contains(&day),
        _ => false,
    }
}

fn snapshot_errors(errors: &mut ValidationErrors, snapshot: &MarketSnapshot) {
    check_positive(errors, "snapshot.currentLevel", snapshot.current_level);
    check_positive(errors, "snapshot.level1YearAgo", snapshot.level_1y_ago);
    check_positive(errors, "snapshot.level2YearsAgo", snapshot.level_2y_ago);
    check_positive(errors, "snapshot.level3YearsAgo", snapshot.level_3y_ago);
    check_positive(errors, "snapshot.allTimeHigh", snapshot.all_time_high);
    check_range(errors, "snapshot.inflationPct", snapshot.inflation_pct, -10.0, 50.0);
    if let Some(cape) = snapshot.cape {
        check_range(errors, "snapshot.cape", cape, 0.0, 100.0);
    }
}

fn portfolio_errors(errors: &mut ValidationErrors, portfolio: &Portfolio) {
    check_non_negative(errors, "portfolio.cashOnHand", portfolio.cash_on_hand);
    check_non_negative(errors, "portfolio.moneyMarket", portfolio.money_market);

    let mut seen = HashSet::new();
    for (i, lot) in portfolio.tranches.iter().enumerate() {
        let prefix = format!("portfolio.tranches[{i}]");
        if lot.id.is_empty() {
            errors.push(format!("{prefix}.id"), "must not be empty");
        } else if !seen.insert(lot.id.as_str()) {
            errors.push(format!("{prefix}.id"), "duplicate lot id");
        }
        check_non_negative(errors, &format!("{prefix}.marketValue"), lot.market_value);
        check_non_negative(errors, &format!("{prefix}.costBasis"), lot.cost_basis);
        check_range(
            errors,
            &format!("{prefix}.taxExemptionFraction"),
            lot.tax_exemption_fraction,
            0.0,
            1.0,
        );
        if let Some(date) = &lot.purchase_date
            && !is_iso_date(date)
        {
            errors.push(format!("{prefix}.purchaseDate"), "must be YYYY-MM-DD");
        }
    }
}

fn needs_errors(errors: &mut ValidationErrors, needs: &AnnualNeeds) {
    check_non_negative(errors, "needs.floor", needs.floor);
    check_non_negative(errors, "needs.flex", needs.flex);
    check_non_negative(errors, "needs.pension", needs.pension);
}

fn policy_errors(errors: &mut ValidationErrors, policy: &Policy) {
    check_range(errors, "policy.targetEquityPct", policy.target_equity_pct, 20.0, 90.0);
    if policy.gold_active() {
        check_range(errors, "policy.goldTargetPct", policy.gold_target_pct, 0.01, 50.0);
        check_range(errors, "policy.goldFloorPct", policy.gold_floor_pct, 0.0, 20.0);
    } else if policy.gold_target_pct < 0.0 {
        errors.push("policy.goldTargetPct", "must be >= 0");
    }
    check_range(errors, "policy.rebalancingBandPct", policy.rebalancing_band_pct, 1.0, 50.0);
    check_range(errors, "policy.maxSkimPct", policy.max_skim_pct, 0.0, 50.0);
    check_range(errors, "policy.maxBearRefillPct", policy.max_bear_refill_pct, 0.0, 70.0);
    check_range(errors, "policy.runwayMinMonths", policy.runway_min_months, 12.0, 60.0);
    check_range(errors, "policy.runwayTargetMonths", policy.runway_target_months, 18.0, 72.0);
    if policy.runway_target_months < policy.runway_min_months {
        errors.push("policy.runwayTargetMonths", "must be >= runwayMinMonths");
    }
    check_non_negative(errors, "policy.minCashBufferMonths", policy.min_cash_buffer_months);
    check_non_negative(errors, "policy.annualAllowance", policy.annual_allowance);
    check_range(errors, "policy.churchTaxRate", policy.church_tax_rate, 0.0, 0.1);
    check_range(errors, "policy.equityExemption", policy.equity_exemption, 0.0, 1.0);
    check_range(errors, "policy.goldExemption", policy.gold_exemption, 0.0, 1.0);
    check_non_negative(errors, "policy.thresholds.ruinWealth", policy.thresholds.ruin_wealth);
}

/// Checks one year's input, collecting every bad field.
pub fn validate_year(
    snapshot: &MarketSnapshot,
    portfolio: &Portfolio,
    needs: &AnnualNeeds,
    policy: &Policy,
) -> Result<(), EngineError> {
    let mut errors = ValidationErrors::new();
    snapshot_errors(&mut errors, snapshot);
    portfolio_errors(&mut errors, portfolio);
    needs_errors(&mut errors, needs);
    policy_errors(&mut errors, policy);
    errors.into_result()
}

pub fn validate_simulation(config: &SimulationConfig, mode: SimulationMode) -> Result<(), EngineError> {
    let mut errors = ValidationErrors::new();
    if let Some(snapshot) = &config.start_snapshot {
        snapshot_errors(&mut errors, snapshot);
    }
    portfolio_errors(&mut errors, &config.portfolio);
    needs_errors(&mut errors, &config.needs);
    policy_errors(&mut errors, &config.policy);

    if config.horizon_years == 0 || config.horizon_years > 100 {
        errors.push("horizonYears", "must be between 1 and 100");
    }
    if mode == SimulationMode::MonteCarlo && config.runs == 0 {
        errors.push("runs", "must be >= 1");
    }
    if let Some(adjustment) = config.pension_adjustment_pct {
        check_range(&mut errors, "pensionAdjustmentPct", adjustment, -10.0, 50.0);
    }
    for (i, year) in config.history.iter().enumerate() {
        check_range(
            &mut errors,
            &format!("history[{i}].inflationPct"),
            year.inflation_pct,
            -10.0,
            50.0,
        );
        if !year.equity_return_pct.is_finite() || year.equity_return_pct <= -100.0 {
            errors.push(format!("history[{i}].equityReturnPct"), "must be > -100");
        }
        if !year.gold_return_pct.is_finite() || year.gold_return_pct <= -100.0 {
            errors.push(format!("history[{i}].goldReturnPct"), "must be > -100");
        }
        if let Some(cape) = year.cape {
            check_range(&mut errors, &format!("history[{i}].cape"), cape, 0.0, 100.0);
        }
    }

    let model = &config.parametric;
    if mode == SimulationMode::MonteCarlo {
        match config.sampling {
            SamplingMethod::Parametric => {
                check_non_negative(&mut errors, "parametric.equityVol", model.equity_vol);
                check_non_negative(&mut errors, "parametric.goldVol", model.gold_vol);
                check_non_negative(&mut errors, "parametric.inflationVol", model.inflation_vol);
                check_range(
                    &mut errors,
                    "parametric.goldEquityCorrelation",
                    model.gold_equity_correlation,
                    -1.0,
                    1.0,
                );
            }
            SamplingMethod::Bootstrap => {
                if config.block_years == 0 {
                    errors.push("blockYears", "must be >= 1");
                }
            }
        }
    }

    if let (SimulationMode::Backtest, Some(year)) = (mode, config.backtest_start_year)
        && !config.history.is_empty()
        && !config.history.iter().any(|h| h.year == year)
    {
        errors.push("backtestStartYear", "must be a year in the history");
    }
    if mode == SimulationMode::Sweep
        && !config.history.is_empty()
        && config.history.len() < config.horizon_years as usize
    {
        errors.push("horizonYears", "must not exceed the history length for a sweep");
    }
    errors.into_result()?;

    if config.history.is_empty() {
        match mode {
            SimulationMode::Backtest => return Err(EngineError::MissingHistory("backtest")),
            SimulationMode::Sweep => return Err(EngineError::MissingHistory("historical sweep")),
            SimulationMode::MonteCarlo if config.sampling == SamplingMethod::Bootstrap => {
                return Err(EngineError::MissingHistory("bootstrap sampling"));
            }
            SimulationMode::MonteCarlo => {}
        }
    }
    Ok(())
}
