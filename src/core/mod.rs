mod config;
mod engine;
mod error;
mod ledger;
mod market;
mod planner;
mod simulation;
mod transactions;
mod types;
mod validation;

pub use config::{
    AlarmThresholds, CautionThresholds, CurbRule, Policy, RecoveryCurb, RunwayProfile, SaleOrder,
    SmoothingModel, Thresholds, capital_gains_rate,
};
pub use engine::{YearDecision, YearInput, apply_year, evaluate_year};
pub use error::{EngineError, FieldError, ValidationErrors};
pub use ledger::{
    LotSale, SaleLimits, SaleOutcome, SaleTarget, TaxState, TaxYearSettlement, order_lots, sell,
    sell_in_order, sell_lot, settle_tax_year,
};
pub use market::{MarketAnalysis, Regime, Scenario, Valuation, analyze_market};
pub use planner::{
    CutSource, DeescalationPath, KeyParams, PlannerState, PlannerStep, SpendingDecision,
    SpendingInputs, determine_spending,
};
pub use simulation::{
    BacktestResult, MarketYear, MonteCarloSummary, ParametricModel, PathResult, Percentiles,
    SamplingMethod, SimulationConfig, StressPreset, SweepSummary, SweepWindow, WealthBand,
    YearRecord, run_backtest, run_historical_sweep, run_monte_carlo, snapshot_from_history,
};
pub use transactions::{
    ActionContext, ActionKind, BlockReason, DecisionType, ProceedsUse, Rounding,
    TransactionDecision, TransactionDiagnostics, TransactionStep, calculate_target_liquidity,
    determine_action, quantize,
};
pub use types::{
    AnnualNeeds, AssetClass, HoldingTotals, MarketSnapshot, NetNeed, Portfolio, Tranche,
};
pub use validation::{SimulationMode, validate_simulation, validate_year};
