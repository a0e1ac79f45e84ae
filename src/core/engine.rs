use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::Policy;
use super::error::EngineError;
use super::market::{MarketAnalysis, analyze_market};
use super::planner::{PlannerState, SpendingDecision, SpendingInputs, determine_spending};
use super::transactions::{
    ActionContext, TransactionDecision, calculate_target_liquidity, determine_action,
};
use super::types::{AnnualNeeds, AssetClass, MarketSnapshot, Portfolio, Tranche};
use super::validation::validate_year;

/// Reported runway when there is no need to cover.
const MAX_RUNWAY_MONTHS: f64 = 999.0;

/// Everything one year's decision depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearInput {
    pub snapshot: MarketSnapshot,
    pub portfolio: Portfolio,
    pub needs: AnnualNeeds,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PlannerState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearDecision {
    pub market: MarketAnalysis,
    pub target_liquidity: f64,
    pub runway_months: f64,
    pub spending: SpendingDecision,
    pub transaction: TransactionDecision,
}

impl YearDecision {
    pub fn annual_withdrawal(&self) -> f64 {
        self.spending.annual_withdrawal
    }

    pub fn next_state(&self) -> &PlannerState {
        &self.spending.state
    }
}

/// Validates the input, then decides spending and the transaction for one year.
pub fn evaluate_year(input: &YearInput) -> Result<YearDecision, EngineError> {
    validate_year(
        &input.snapshot,
        &input.portfolio,
        &input.needs,
        &input.policy,
    )?;
    Ok(decide_year(
        &input.snapshot,
        &input.portfolio,
        &input.needs,
        &input.policy,
        input.state.as_ref(),
    ))
}

/// One year's decision without re-validating; simulations validate once up front.
pub(crate) fn decide_year(
    snapshot: &MarketSnapshot,
    portfolio: &Portfolio,
    needs: &AnnualNeeds,
    policy: &Policy,
    prev: Option<&PlannerState>,
) -> YearDecision {
    let analysis = analyze_market(snapshot, &policy.thresholds);
    let need = needs.net_of_pension();
    let runway_months = runway_months(portfolio.total_liquidity(), need.total());

    let spending = determine_spending(
        prev,
        &SpendingInputs {
            analysis: &analysis,
            snapshot,
            need,
            pension: needs.pension,
            runway_months,
            invested: portfolio.invested(),
            total_wealth: portfolio.total_wealth(),
        },
        policy,
    );

    let target_liquidity =
        calculate_target_liquidity(policy, &analysis, &need, needs.gross_total());
    let transaction = determine_action(
        &ActionContext {
            analysis: &analysis,
            need,
            target_liquidity,
        },
        portfolio,
        policy,
    );
    debug!(
        scenario = analysis.scenario.as_str(),
        flex_rate = spending.flex_rate,
        action = transaction.title.as_str(),
        "year decided"
    );

    YearDecision {
        market: analysis,
        target_liquidity,
        runway_months,
        spending,
        transaction,
    }
}

fn runway_months(liquidity: f64, annual_need: f64) -> f64 {
    if annual_need <= 0.0 {
        return MAX_RUNWAY_MONTHS;
    }
    (liquidity / (annual_need / 12.0)).min(MAX_RUNWAY_MONTHS)
}

/// Books a transaction: sold lots shrink, proceeds land in cash or buy equity and gold.
pub fn apply_year(portfolio: Portfolio, decision: &TransactionDecision, policy: &Policy) -> Portfolio {
    if !decision.is_transaction() {
        return portfolio;
    }
    let reduced: Vec<Tranche> = decision
        .sale_breakdown
        .iter()
        .filter_map(|sale| {
            portfolio.lot(&sale.lot_id).map(|lot| Tranche {
                market_value: sale.remaining_value,
                cost_basis: sale.remaining_cost_basis,
                ..lot.clone()
            })
        })
        .collect();

    portfolio
        .with_updated_lots(&reduced)
        .with_cash(decision.uses.liquidity - decision.cash_invested)
        .with_purchase(
            AssetClass::EquityNew,
            decision.uses.equity,
            policy.equity_exemption,
        )
        .with_purchase(AssetClass::Gold, decision.uses.gold, policy.gold_exemption)
}
