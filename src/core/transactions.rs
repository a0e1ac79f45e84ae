use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::{Policy, SaleOrder, Thresholds};
use super::ledger::{LotSale, SaleLimits, SaleOutcome, SaleTarget, order_lots, sell_in_order};
use super::market::{MarketAnalysis, Regime};
use super::types::{AssetClass, NetNeed, Portfolio, Tranche};

/// `(upper limit, step)` pairs; amounts at or above the last limit use `TOP_STEP`.
const QUANTIZATION_TIERS: [(f64, f64); 3] = [
    (10_000.0, 1_000.0),
    (50_000.0, 5_000.0),
    (200_000.0, 10_000.0),
];
const TOP_STEP: f64 = 25_000.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rounding {
    Up,
    Down,
}

/// Rounds trade amounts to tiered steps so planned trades are whole numbers.
pub fn quantize(amount: f64, rounding: Rounding) -> f64 {
    let step = QUANTIZATION_TIERS
        .iter()
        .find(|(limit, _)| amount < *limit)
        .map(|(_, step)| *step)
        .unwrap_or(TOP_STEP);
    match rounding {
        Rounding::Up => (amount / step).ceil() * step,
        Rounding::Down => (amount / step).floor() * step,
    }
}

/// Liquidity to hold this year, scaled between the runway minimum and the regime's
/// profile maximum by the distance to the all-time high.
pub fn calculate_target_liquidity(
    policy: &Policy,
    analysis: &MarketAnalysis,
    need: &NetNeed,
    gross_annual_need: f64,
) -> f64 {
    let regime = analysis.runway_regime();
    let profile_max = policy.runway_profile.months_for(regime);
    let min_months = policy.runway_min_months;
    let user_target = if policy.runway_target_months > 0.0 {
        policy.runway_target_months
    } else {
        profile_max
    };

    let fraction = if analysis.fraction_of_ath > 0.0 {
        analysis.fraction_of_ath
    } else {
        1.0
    };
    let months = if fraction >= 1.0 {
        let above = ((fraction - 1.0) * 5.0).min(1.0);
        user_target + above * (profile_max - user_target)
    } else {
        let below = ((1.0 - fraction) * 2.5).min(1.0);
        user_target - below * (user_target - min_months)
    };

    let adjustable_need = match regime {
        Regime::Peak | Regime::HotNeutral => need.floor + need.flex,
        _ => need.floor + 0.5 * need.flex,
    };
    let runway_target = adjustable_need.max(1.0) / 12.0 * months;
    let buffer_target = gross_annual_need / 12.0 * policy.min_cash_buffer_months;

    (runway_target.max(buffer_target) / 100.0).ceil() * 100.0
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    None,
    Transaction,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Hold,
    EmergencyBufferRefill,
    EmergencyBufferTopUp,
    BearRunwayRefill,
    RunwayRefill,
    OpportunisticRebalance,
    SurplusRebalance,
    SurplusDrawdown,
}

impl ActionKind {
    pub fn label(self) -> &'static str {
        match self {
            ActionKind::Hold => "no action",
            ActionKind::EmergencyBufferRefill => "emergency sale, buffer refill",
            ActionKind::EmergencyBufferTopUp => "emergency sale, buffer top-up",
            ActionKind::BearRunwayRefill => "bear runway refill",
            ActionKind::RunwayRefill => "runway refill",
            ActionKind::OpportunisticRebalance => "opportunistic rebalancing",
            ActionKind::SurplusRebalance => "surplus rebalancing",
            ActionKind::SurplusDrawdown => "surplus rebalancing, cash drawdown",
        }
    }

    fn title(self, capped: bool) -> String {
        if capped {
            format!("{}, capped", self.label())
        } else {
            self.label().to_string()
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    None,
    LiquiditySufficient,
    MinTrade,
}

/// Where the net proceeds (or invested cash) go.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceedsUse {
    pub liquidity: f64,
    pub gold: f64,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TransactionStep {
    EmergencyBuffer {
        buffer: f64,
        liquidity: f64,
        refill: f64,
    },
    RunwayGuardrail {
        target: f64,
        target_months: f64,
        coverage: f64,
        gap: f64,
        bear: bool,
        critical: bool,
    },
    RefillCapped {
        requested: f64,
        cap: f64,
        critical: bool,
    },
    RefillSuppressed {
        planned: f64,
        min_refill: f64,
    },
    MinTradeRelaxed {
        basis: f64,
        applied: f64,
    },
    GoldBand {
        target: f64,
        lower: f64,
        upper: f64,
        buy: f64,
        sell: f64,
    },
    HysteresisSkipped {
        amount: f64,
    },
    OpportunisticPlan {
        liquidity_need: f64,
        total_need: f64,
        gross_target: f64,
        equity_budget: f64,
        gold_budget: f64,
    },
    SurplusInvested {
        surplus: f64,
        equity: f64,
        gold: f64,
    },
    MinTradeBlocked {
        achieved: f64,
        threshold: f64,
    },
    ShortfallCapped {
        requested: f64,
        achieved: f64,
    },
    ResidualToLiquidity {
        amount: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDiagnostics {
    pub triggered: bool,
    pub block_reason: BlockReason,
    pub blocked_amount: f64,
    pub capped: bool,
    pub critical_liquidity: bool,
    pub steps: Vec<TransactionStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDecision {
    pub decision_type: DecisionType,
    pub action: ActionKind,
    pub title: String,
    pub tax_owed: f64,
    pub net_proceeds: f64,
    pub gross_sold: f64,
    pub sale_breakdown: Vec<LotSale>,
    pub uses: ProceedsUse,
    /// Cash moved out of liquidity into purchases.
    pub cash_invested: f64,
    pub target_liquidity: f64,
    pub allowance_used: f64,
    pub diagnostics: TransactionDiagnostics,
}

impl TransactionDecision {
    pub fn is_transaction(&self) -> bool {
        self.decision_type == DecisionType::Transaction
    }

    pub fn signed_taxable_gain(&self) -> f64 {
        self.sale_breakdown.iter().map(|s| s.taxable_gain).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
    pub analysis: &'a MarketAnalysis,
    /// Spending need net of pension income.
    pub need: NetNeed,
    pub target_liquidity: f64,
}

/// What the year intends to sell before the ledger runs.
struct Plan {
    need: f64,
    action: ActionKind,
    capped: bool,
    critical: bool,
    uses: ProceedsUse,
    limits: SaleLimits,
    ignore_gold_floor: bool,
    min_trade_override: Option<f64>,
    gross_target: Option<f64>,
}

impl Plan {
    fn idle() -> Self {
        Self {
            need: 0.0,
            action: ActionKind::Hold,
            capped: false,
            critical: false,
            uses: ProceedsUse::default(),
            limits: SaleLimits::default(),
            ignore_gold_floor: false,
            min_trade_override: None,
            gross_target: None,
        }
    }
}

struct MinTradeGate {
    applied: f64,
    override_amount: Option<f64>,
}

fn min_trade_basis(capital: f64, th: &Thresholds) -> f64 {
    th.min_trade_static
        .max(capital * th.min_trade_dynamic_factor)
}

/// Small, urgent liquidity needs get the lower refill gate instead of the full basis.
fn min_trade_gate(
    capital: f64,
    liquidity_need: f64,
    total_need: f64,
    th: &Thresholds,
    steps: &mut Vec<TransactionStep>,
) -> MinTradeGate {
    let basis = min_trade_basis(capital, th);
    let emergency_gate = th.min_refill_amount.max(th.cash_rebalance_threshold);
    if liquidity_need > 0.0 && total_need > 0.0 && total_need < basis {
        let applied = basis.min(emergency_gate);
        if applied < basis {
            steps.push(TransactionStep::MinTradeRelaxed { basis, applied });
            return MinTradeGate {
                applied,
                override_amount: Some(applied),
            };
        }
    }
    MinTradeGate {
        applied: basis,
        override_amount: None,
    }
}

struct Refill {
    amount: f64,
    capped: bool,
}

/// Bounded runway refill. Under critical liquidity the cap is raised to the relief
/// share of equity first, then the minimum refill gate drops to zero.
fn capped_refill(
    bear: bool,
    requested: f64,
    equity: f64,
    critical: bool,
    policy: &Policy,
    steps: &mut Vec<TransactionStep>,
) -> Refill {
    let th = &policy.thresholds;
    let pct = if bear {
        policy.max_bear_refill_pct
    } else {
        policy.max_skim_pct
    };
    let base_cap = pct / 100.0 * equity;
    let cap = if critical {
        base_cap.max(equity * th.critical_relief_equity_pct / 100.0)
    } else {
        base_cap
    };
    let amount = requested.min(cap).max(0.0);
    let capped = amount < requested;
    let min_refill = if critical { 0.0 } else { th.min_refill_amount };

    if amount < min_refill {
        if requested >= min_refill {
            steps.push(TransactionStep::RefillSuppressed {
                planned: amount,
                min_refill,
            });
        }
        return Refill {
            amount: 0.0,
            capped,
        };
    }
    if capped {
        steps.push(TransactionStep::RefillCapped {
            requested,
            cap,
            critical,
        });
    }
    Refill { amount, capped }
}

fn equity_budgets(portfolio: &Portfolio, limits: SaleLimits, required: f64) -> SaleLimits {
    let equity = portfolio.total_equity();
    if equity <= 0.0 {
        return limits;
    }
    let required = required.min(equity);
    [AssetClass::EquityOld, AssetClass::EquityNew]
        .into_iter()
        .fold(limits, |limits, class| {
            let share = portfolio.class_value(class) / equity;
            limits.with_class_budget(class, required * share)
        })
}

/// Decides whether to sell, rebalance or hold this year.
pub fn determine_action(
    ctx: &ActionContext<'_>,
    portfolio: &Portfolio,
    policy: &Policy,
) -> TransactionDecision {
    let th = &policy.thresholds;
    let analysis = ctx.analysis;
    let target = ctx.target_liquidity;
    let liquidity = portfolio.total_liquidity();
    let equity = portfolio.total_equity();
    let gold = portfolio.total_gold();
    let capital = portfolio.total_wealth();
    let floor_net = ctx.need.floor;
    let min_months = policy.runway_min_months;
    let bear_like = analysis.scenario.is_bear_like();
    let min_gold = if policy.gold_active() {
        policy.gold_floor_pct / 100.0 * capital
    } else {
        0.0
    };

    let mut steps = Vec::new();
    let mut plan = Plan::idle();

    let buffer = (floor_net / 12.0 * min_months).max(th.absolute_min_liquidity);
    let emergency = bear_like && liquidity <= buffer;
    if emergency {
        let gap = buffer - liquidity;
        let (need, action) = if gap > 1.0 {
            (gap, ActionKind::EmergencyBufferRefill)
        } else {
            (floor_net, ActionKind::EmergencyBufferTopUp)
        };
        steps.push(TransactionStep::EmergencyBuffer {
            buffer,
            liquidity,
            refill: need,
        });
        plan.need = need;
        plan.action = action;
        plan.critical = true;
        plan.ignore_gold_floor = true;
        plan.uses.liquidity = need;
    }

    let critical_floor_shortfall = liquidity < floor_net;
    if critical_floor_shortfall {
        plan.min_trade_override = Some(0.0);
    }

    if !emergency {
        let annual_need = floor_net + ctx.need.flex;
        let monthly_need = annual_need / 12.0;
        let runway = if monthly_need > 0.0 {
            liquidity / monthly_need
        } else {
            f64::INFINITY
        };
        let floor_runway = if floor_net > 0.0 {
            liquidity / (floor_net / 12.0)
        } else {
            f64::INFINITY
        };
        let coverage = if target > 0.0 { liquidity / target } else { 1.0 };
        let runway_gap = runway < min_months || floor_runway < min_months;
        // Critically low coverage stays on the gap refill, which shrinks to zero at the
        // guardrail target, so the hand-off to opportunistic rebalancing has no jump.
        let coverage_gap =
            coverage < th.guardrail_activation_coverage.max(th.critical_coverage);
        let guardrail_target = (min_months * monthly_need).max(th.critical_coverage * target);
        let gap = (guardrail_target - liquidity).max(0.0);

        if (runway_gap || coverage_gap) && gap > 0.0 {
            let critical = if bear_like {
                liquidity < buffer * th.bear_critical_buffer_factor
                    || coverage < th.critical_coverage
            } else {
                coverage < th.critical_coverage || runway_gap
            };
            steps.push(TransactionStep::RunwayGuardrail {
                target: guardrail_target,
                target_months: if monthly_need > 0.0 {
                    guardrail_target / monthly_need
                } else {
                    0.0
                },
                coverage,
                gap,
                bear: bear_like,
                critical,
            });
            plan.critical = critical;

            if !bear_like {
                let gate = min_trade_gate(capital, gap, gap, th, &mut steps);
                plan.min_trade_override = gate.override_amount;
                if critical {
                    plan.min_trade_override = Some(0.0);
                }
            }

            let refill = capped_refill(bear_like, gap, equity, critical, policy, &mut steps);
            if refill.amount > 0.0 {
                plan.need = refill.amount;
                plan.capped = refill.capped;
                plan.action = if bear_like {
                    ActionKind::BearRunwayRefill
                } else {
                    ActionKind::RunwayRefill
                };
                plan.uses.liquidity = refill.amount;
                plan.limits = equity_budgets(portfolio, SaleLimits::default(), refill.amount);
                if policy.gold_active() && gold > 0.0 {
                    let available = if bear_like || critical {
                        gold
                    } else {
                        (gold - min_gold).max(0.0)
                    };
                    plan.limits = plan.limits.with_class_budget(AssetClass::Gold, available);
                }
                plan.ignore_gold_floor = bear_like || critical;
                if bear_like {
                    plan.min_trade_override = Some(0.0);
                }
            }
        } else if !bear_like {
            plan = opportunistic_plan(
                ctx,
                portfolio,
                policy,
                capital,
                plan.min_trade_override,
                &mut steps,
            );
        }
    }

    if plan.need <= 0.0 {
        if let Some(decision) = surplus_rebalance(ctx, portfolio, policy, capital, &mut steps) {
            return decision;
        }
        return hold(target, BlockReason::LiquiditySufficient, 0.0, plan.critical, steps);
    }

    let mut limits = plan.limits.clone();
    if !plan.ignore_gold_floor && min_gold > 0.0 {
        let headroom = (gold - min_gold).max(0.0);
        let budget = limits
            .class_budgets
            .get(&AssetClass::Gold)
            .map_or(headroom, |b| b.min(headroom));
        limits = limits.with_class_budget(AssetClass::Gold, budget);
    }

    let ordered = sale_order(portfolio, policy, analysis, emergency, capital);
    let sale_target = match plan.gross_target {
        Some(gross) if gross > 0.0 => SaleTarget::Gross(gross),
        _ => SaleTarget::Net(plan.need),
    };
    let sale = sell_in_order(
        sale_target,
        &ordered,
        &limits,
        policy.annual_allowance,
        policy.church_tax_rate,
    );

    let min_trade = if emergency || critical_floor_shortfall {
        0.0
    } else {
        plan.min_trade_override
            .unwrap_or_else(|| min_trade_basis(capital, th))
    };
    if sale.net_achieved < min_trade {
        debug!(
            achieved = sale.net_achieved,
            threshold = min_trade,
            "trade below minimum size"
        );
        steps.push(TransactionStep::MinTradeBlocked {
            achieved: sale.net_achieved,
            threshold: min_trade,
        });
        return hold(
            target,
            BlockReason::MinTrade,
            min_trade - sale.net_achieved,
            plan.critical,
            steps,
        );
    }

    let achieved = sale.net_achieved;
    let mut capped = plan.capped;
    if plan.need > achieved + 1.0 && !capped {
        capped = true;
        steps.push(TransactionStep::ShortfallCapped {
            requested: plan.need,
            achieved,
        });
    }

    let uses = split_proceeds(achieved, &plan.uses, &mut steps);
    realized(plan.action, capped, plan.critical, target, sale, uses, steps)
}

/// Liquidity first, then gold, then equity; anything left over stays as cash.
fn split_proceeds(
    achieved: f64,
    planned: &ProceedsUse,
    steps: &mut Vec<TransactionStep>,
) -> ProceedsUse {
    let mut remaining = achieved;
    let mut liquidity = remaining.min(planned.liquidity);
    remaining -= liquidity;
    let gold = remaining.min(planned.gold);
    remaining -= gold;
    let equity = remaining.min(planned.equity);
    remaining -= equity;
    if remaining > 1.0 {
        steps.push(TransactionStep::ResidualToLiquidity { amount: remaining });
    }
    liquidity += remaining.max(0.0);
    ProceedsUse {
        liquidity,
        gold,
        equity,
    }
}

fn sale_order<'a>(
    portfolio: &'a Portfolio,
    policy: &Policy,
    analysis: &MarketAnalysis,
    emergency: bool,
    capital: f64,
) -> Vec<&'a Tranche> {
    let ordered = order_lots(&portfolio.tranches, policy.sale_order);
    let gold_lots: Vec<&Tranche> = order_lots(&portfolio.tranches, SaleOrder::Fifo)
        .into_iter()
        .filter(|t| t.asset_class == AssetClass::Gold)
        .collect();
    let equity_lots: Vec<&Tranche> = ordered
        .into_iter()
        .filter(|t| t.asset_class.is_equity())
        .collect();

    let defensive = emergency || analysis.scenario.is_bear_like();
    let gold_upper =
        capital * policy.gold_target_pct / 100.0 * (1.0 + policy.rebalancing_band_pct / 100.0);
    let gold_heavy = policy.gold_active() && portfolio.total_gold() > gold_upper;

    if defensive || gold_heavy {
        gold_lots.into_iter().chain(equity_lots).collect()
    } else {
        equity_lots.into_iter().chain(gold_lots).collect()
    }
}

fn opportunistic_plan(
    ctx: &ActionContext<'_>,
    portfolio: &Portfolio,
    policy: &Policy,
    capital: f64,
    min_trade_override: Option<f64>,
    steps: &mut Vec<TransactionStep>,
) -> Plan {
    let th = &policy.thresholds;
    let target = ctx.target_liquidity;
    let liquidity = portfolio.total_liquidity();
    let equity = portfolio.total_equity();
    let gold = portfolio.total_gold();
    let band = policy.rebalancing_band_pct / 100.0;

    let raw_gap = target - liquidity;
    let liquidity_need = quantize(raw_gap.max(0.0), Rounding::Up);
    let surplus_cash = (-raw_gap).max(0.0);
    let fraction = if ctx.analysis.fraction_of_ath > 0.0 {
        ctx.analysis.fraction_of_ath
    } else {
        1.0
    };
    let ath_factor = ((fraction - 0.8) / 0.2).clamp(0.0, 1.0);
    let below_floor = liquidity < th.absolute_min_liquidity;

    let mut gold_buy = 0.0;
    let mut gold_sell = 0.0;
    let gold_target = capital * policy.gold_target_pct / 100.0;
    if policy.gold_active() {
        let lower = gold_target * (1.0 - band);
        let upper = gold_target * (1.0 + band);
        if gold < lower {
            gold_buy = (gold_target - gold).max(0.0);
        } else if gold > upper {
            gold_sell = (gold - gold_target).max(0.0);
        }
        if gold_buy > 0.0 || gold_sell > 0.0 {
            steps.push(TransactionStep::GoldBand {
                target: gold_target,
                lower,
                upper,
                buy: gold_buy,
                sell: gold_sell,
            });
        }
    }
    if liquidity_need > 0.0 && gold_buy > 0.0 {
        // Sales never fund gold while liquidity is short.
        gold_buy = gold_buy.min(surplus_cash);
    }
    let gold_buy_from_sales = if surplus_cash > 0.0 && gold_buy > 0.0 {
        (gold_buy - surplus_cash).max(0.0)
    } else {
        gold_buy
    };

    let total_need = (liquidity_need + gold_buy_from_sales).max(gold_sell);
    let quantized = if !below_floor {
        if total_need < th.hysteresis_min_refill {
            if total_need > 0.0 {
                steps.push(TransactionStep::HysteresisSkipped { amount: total_need });
            }
            0.0
        } else {
            quantize(total_need, Rounding::Up)
        }
    } else if total_need > 0.0 {
        quantize(total_need, Rounding::Up)
    } else {
        0.0
    };
    let effective_liquidity_need = if quantized > 0.0 {
        liquidity_need + (quantized - total_need).max(0.0)
    } else {
        liquidity_need
    };

    let mut plan = Plan::idle();
    plan.critical = below_floor;
    plan.min_trade_override = min_trade_override;

    let gate = if below_floor {
        plan.min_trade_override = Some(0.0);
        0.0
    } else {
        let gate = min_trade_gate(capital, effective_liquidity_need, quantized, th, steps);
        plan.min_trade_override = gate.override_amount;
        gate.applied
    };

    if quantized <= 0.0 || quantized < gate {
        return plan;
    }

    let gold_budget = if policy.gold_active() && gold > gold_target * (1.0 + band) {
        quantize(gold - gold_target, Rounding::Down)
    } else {
        0.0
    };

    let equity_target = capital * policy.target_equity_pct / 100.0;
    let equity_upper = equity_target * (1.0 + band);
    let mut equity_excess = if equity > equity_upper {
        equity - equity_target
    } else {
        0.0
    };
    if gold_sell > 1.5 * effective_liquidity_need
        || (gold_sell >= effective_liquidity_need && !below_floor)
    {
        equity_excess = 0.0;
    }
    let gold_insufficient = gold_sell * 0.8 < effective_liquidity_need;
    if below_floor && equity_excess < effective_liquidity_need && gold_insufficient {
        equity_excess = effective_liquidity_need.min(equity);
    }

    let skim_cap = policy.max_skim_pct / 100.0 * equity * ath_factor;
    let effective_cap = if below_floor {
        skim_cap.max(effective_liquidity_need * 1.2)
    } else {
        skim_cap
    };
    let equity_budget = equity_excess.min(effective_cap);

    let mut limits = SaleLimits::default().with_class_budget(AssetClass::Gold, gold_budget);
    if equity > 0.0 {
        limits = limits.with_equity_budget(equity_budget);
    }

    let dry_run_order = sale_order(portfolio, policy, ctx.analysis, false, capital);
    let dry_run = sell_in_order(
        SaleTarget::Net(quantized),
        &dry_run_order,
        &limits,
        policy.annual_allowance,
        policy.church_tax_rate,
    );
    let gross_target = quantize(dry_run.gross_sold, Rounding::Up);

    steps.push(TransactionStep::OpportunisticPlan {
        liquidity_need: effective_liquidity_need,
        total_need: quantized,
        gross_target,
        equity_budget,
        gold_budget,
    });

    plan.need = quantized;
    plan.action = ActionKind::OpportunisticRebalance;
    plan.limits = limits;
    plan.gross_target = Some(gross_target);
    plan.uses.gold = quantize(quantized.min(gold_buy), Rounding::Down);
    let available = (quantized - plan.uses.gold).max(0.0);
    plan.uses.liquidity = available.min(effective_liquidity_need);
    if gold_sell > 0.0 {
        let equity_gap = (equity_target - equity).max(0.0);
        plan.uses.equity = (available - plan.uses.liquidity).max(0.0).min(equity_gap);
    }
    plan
}

/// Invests cash above the target into equity and gold, up to their upper bands.
fn surplus_rebalance(
    ctx: &ActionContext<'_>,
    portfolio: &Portfolio,
    policy: &Policy,
    capital: f64,
    steps: &mut Vec<TransactionStep>,
) -> Option<TransactionDecision> {
    let liquidity = portfolio.total_liquidity();
    let surplus = liquidity - ctx.target_liquidity;
    let threshold = min_trade_basis(capital, &policy.thresholds);
    if surplus <= threshold || ctx.analysis.is_risky() {
        return None;
    }

    let band = policy.rebalancing_band_pct / 100.0;
    let equity = portfolio.total_equity();
    let gold = if policy.gold_active() {
        portfolio.total_gold()
    } else {
        0.0
    };
    let upper_equity = capital * policy.target_equity_pct / 100.0 * (1.0 + band);
    let upper_gold = if policy.gold_active() {
        capital * policy.gold_target_pct / 100.0 * (1.0 + band)
    } else {
        0.0
    };
    let gap_equity = (upper_equity - equity).max(0.0);
    let gap_gold = (upper_gold - gold).max(0.0);
    let total_gap = gap_equity + gap_gold;

    let overflow = total_gap <= 0.0;
    let raw = if overflow {
        surplus.min(policy.max_skim_pct / 100.0 * equity)
    } else {
        surplus.min(total_gap)
    };
    let amount = quantize(raw, Rounding::Down);
    if amount <= 0.0 {
        return None;
    }

    let (share_equity, share_gold) = if total_gap > 0.0 {
        (gap_equity / total_gap, gap_gold / total_gap)
    } else {
        (1.0, 0.0)
    };
    let equity_buy = quantize(amount * share_equity, Rounding::Down);
    let gold_buy = quantize(amount * share_gold, Rounding::Down);
    let invested = equity_buy + gold_buy;
    if invested <= 0.0 {
        return None;
    }

    steps.push(TransactionStep::SurplusInvested {
        surplus,
        equity: equity_buy,
        gold: gold_buy,
    });
    let action = if overflow {
        ActionKind::SurplusDrawdown
    } else {
        ActionKind::SurplusRebalance
    };
    Some(TransactionDecision {
        decision_type: DecisionType::Transaction,
        action,
        title: action.title(false),
        tax_owed: 0.0,
        net_proceeds: invested,
        gross_sold: 0.0,
        sale_breakdown: Vec::new(),
        uses: ProceedsUse {
            liquidity: 0.0,
            gold: gold_buy,
            equity: equity_buy,
        },
        cash_invested: invested,
        target_liquidity: ctx.target_liquidity,
        allowance_used: 0.0,
        diagnostics: TransactionDiagnostics {
            triggered: true,
            block_reason: BlockReason::None,
            blocked_amount: 0.0,
            capped: false,
            critical_liquidity: false,
            steps: std::mem::take(steps),
        },
    })
}

fn hold(
    target: f64,
    reason: BlockReason,
    blocked_amount: f64,
    critical: bool,
    steps: Vec<TransactionStep>,
) -> TransactionDecision {
    TransactionDecision {
        decision_type: DecisionType::None,
        action: ActionKind::Hold,
        title: ActionKind::Hold.title(false),
        tax_owed: 0.0,
        net_proceeds: 0.0,
        gross_sold: 0.0,
        sale_breakdown: Vec::new(),
        uses: ProceedsUse::default(),
        cash_invested: 0.0,
        target_liquidity: target,
        allowance_used: 0.0,
        diagnostics: TransactionDiagnostics {
            triggered: false,
            block_reason: reason,
            blocked_amount: blocked_amount.max(0.0),
            capped: false,
            critical_liquidity: critical,
            steps,
        },
    }
}

fn realized(
    action: ActionKind,
    capped: bool,
    critical: bool,
    target: f64,
    sale: SaleOutcome,
    uses: ProceedsUse,
    steps: Vec<TransactionStep>,
) -> TransactionDecision {
    TransactionDecision {
        decision_type: DecisionType::Transaction,
        action,
        title: action.title(capped),
        tax_owed: sale.tax_owed,
        net_proceeds: sale.net_achieved,
        gross_sold: sale.gross_sold,
        sale_breakdown: sale.breakdown,
        uses,
        cash_invested: 0.0,
        target_liquidity: target,
        allowance_used: sale.allowance_consumed,
        diagnostics: TransactionDiagnostics {
            triggered: true,
            block_reason: BlockReason::None,
            blocked_amount: 0.0,
            capped,
            critical_liquidity: critical,
            steps,
        },
    }
}
