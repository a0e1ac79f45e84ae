use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::{SaleOrder, capital_gains_rate};
use super::types::{AssetClass, Tranche};

/// Sales stop once the outstanding amount is below one cent.
const SETTLED: f64 = 0.01;
/// Lot sales smaller than this are skipped.
const MIN_LOT_SALE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LotSale {
    pub lot_id: String,
    pub asset_class: AssetClass,
    pub gross: f64,
    pub cost_basis_sold: f64,
    /// Gain after the partial exemption; negative for a loss.
    pub taxable_gain: f64,
    pub allowance_used: f64,
    pub tax: f64,
    pub net: f64,
    pub remaining_value: f64,
    pub remaining_cost_basis: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleOutcome {
    pub tax_owed: f64,
    pub gross_sold: f64,
    pub net_achieved: f64,
    pub breakdown: Vec<LotSale>,
    pub allowance_consumed: f64,
    /// Every lot touched by the sale, reduced.
    #[serde(skip)]
    pub lots: Vec<Tranche>,
}

impl SaleOutcome {
    pub fn gross_by_class(&self) -> BTreeMap<AssetClass, f64> {
        let mut totals = BTreeMap::new();
        for sale in &self.breakdown {
            *totals.entry(sale.asset_class).or_insert(0.0) += sale.gross;
        }
        totals
    }

    pub fn taxable_gain(&self) -> f64 {
        self.breakdown.iter().map(|s| s.taxable_gain).sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SaleTarget {
    /// Sell until this much arrives after tax.
    Net(f64),
    /// Sell this much market value regardless of tax.
    Gross(f64),
}

/// Gross caps on what a single sale may take. Missing classes are unlimited.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaleLimits {
    pub class_budgets: BTreeMap<AssetClass, f64>,
    pub equity_budget: Option<f64>,
}

impl SaleLimits {
    pub fn with_class_budget(mut self, class: AssetClass, budget: f64) -> Self {
        self.class_budgets.insert(class, budget.max(0.0));
        self
    }

    pub fn with_equity_budget(mut self, budget: f64) -> Self {
        self.equity_budget = Some(budget.max(0.0));
        self
    }

    fn headroom(&self, lot: &Tranche) -> f64 {
        let mut limit = lot.market_value.max(0.0);
        if let Some(budget) = self.class_budgets.get(&lot.asset_class) {
            limit = limit.min(*budget);
        }
        if lot.asset_class.is_equity() {
            if let Some(budget) = self.equity_budget {
                limit = limit.min(budget);
            }
        }
        limit.max(0.0)
    }

    fn consume(&mut self, class: AssetClass, gross: f64) {
        if let Some(budget) = self.class_budgets.get_mut(&class) {
            *budget = (*budget - gross).max(0.0);
        }
        if class.is_equity() {
            if let Some(budget) = self.equity_budget.as_mut() {
                *budget = (*budget - gross).max(0.0);
            }
        }
    }
}

/// Sells `gross` of one lot. Returns the reduced lot and the sale record.
pub fn sell_lot(lot: &Tranche, gross: f64, allowance_remaining: f64, rate: f64) -> (Tranche, LotSale) {
    let gross = gross.clamp(0.0, lot.market_value.max(0.0));
    let cost_basis_sold = if lot.market_value > 0.0 {
        lot.cost_basis * gross / lot.market_value
    } else {
        0.0
    };
    let exemption = lot.tax_exemption_fraction.clamp(0.0, 1.0);
    let taxable_gain = (gross - cost_basis_sold) * (1.0 - exemption);
    let taxable = gross * lot.tax_load();
    let allowance_used = allowance_remaining.max(0.0).min(taxable);
    let tax = (taxable - allowance_used).max(0.0) * rate;
    let updated = lot.after_sale(gross);

    let sale = LotSale {
        lot_id: lot.id.clone(),
        asset_class: lot.asset_class,
        gross,
        cost_basis_sold,
        taxable_gain,
        allowance_used,
        tax,
        net: gross - tax,
        remaining_value: updated.market_value,
        remaining_cost_basis: updated.cost_basis,
    };
    (updated, sale)
}

/// Net proceeds of selling `gross` from a lot with the given tax load.
fn net_of(gross: f64, tax_load: f64, allowance: f64, rate: f64) -> f64 {
    gross - (gross * tax_load - allowance).max(0.0) * rate
}

/// Gross amount that yields exactly `net` from a lot, bounded by `max_gross`.
fn gross_for_net(net: f64, max_gross: f64, tax_load: f64, allowance: f64, rate: f64) -> f64 {
    if net >= net_of(max_gross, tax_load, allowance, rate) {
        return max_gross;
    }
    if tax_load <= 0.0 || net * tax_load <= allowance {
        return net.min(max_gross);
    }
    ((net - rate * allowance) / (1.0 - rate * tax_load)).min(max_gross)
}

fn compare_dates(a: &Tranche, b: &Tranche) -> Ordering {
    match (&a.purchase_date, &b.purchase_date) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Sellable lots in the order a sale consumes them.
pub fn order_lots(lots: &[Tranche], order: SaleOrder) -> Vec<&Tranche> {
    let mut ordered: Vec<&Tranche> = lots
        .iter()
        .filter(|t| t.asset_class.is_sellable() && t.market_value > 0.0)
        .collect();
    match order {
        SaleOrder::Fifo => ordered.sort_by(|a, b| compare_dates(a, b)),
        SaleOrder::TaxEfficient => ordered.sort_by(|a, b| {
            a.tax_load()
                .total_cmp(&b.tax_load())
                .then_with(|| a.gain_ratio().total_cmp(&b.gain_ratio()))
                .then_with(|| compare_dates(b, a))
                .then_with(|| a.id.cmp(&b.id))
        }),
    }
    ordered
}

/// Sells from `lots` until `requested_net` is raised or the lots run out.
pub fn sell(
    requested_net: f64,
    lots: &[Tranche],
    allowance_remaining: f64,
    church_tax_rate: f64,
    order: SaleOrder,
) -> SaleOutcome {
    let ordered = order_lots(lots, order);
    sell_in_order(
        SaleTarget::Net(requested_net),
        &ordered,
        &SaleLimits::default(),
        allowance_remaining,
        church_tax_rate,
    )
}

/// Consumes lots in the given order, respecting per-class budgets.
pub fn sell_in_order(
    target: SaleTarget,
    ordered: &[&Tranche],
    limits: &SaleLimits,
    allowance_remaining: f64,
    church_tax_rate: f64,
) -> SaleOutcome {
    let rate = capital_gains_rate(church_tax_rate);
    let mut limits = limits.clone();
    let mut allowance = allowance_remaining.max(0.0);
    let mut outcome = SaleOutcome::default();
    let mut remaining = match target {
        SaleTarget::Net(amount) | SaleTarget::Gross(amount) => amount.max(0.0),
    };

    for lot in ordered {
        if remaining <= SETTLED {
            break;
        }
        let max_gross = limits.headroom(lot);
        if max_gross <= 0.0 {
            continue;
        }

        let tax_load = lot.tax_load();
        let gross = match target {
            SaleTarget::Net(_) => {
                if net_of(max_gross, tax_load, allowance, rate) <= 0.0 {
                    continue;
                }
                gross_for_net(remaining, max_gross, tax_load, allowance, rate)
            }
            SaleTarget::Gross(_) => remaining.min(max_gross),
        };
        if gross < MIN_LOT_SALE {
            continue;
        }

        let (updated, sale) = sell_lot(lot, gross, allowance, rate);
        allowance -= sale.allowance_used;
        limits.consume(lot.asset_class, sale.gross);
        remaining -= match target {
            SaleTarget::Net(_) => sale.net,
            SaleTarget::Gross(_) => sale.gross,
        };

        outcome.tax_owed += sale.tax;
        outcome.gross_sold += sale.gross;
        outcome.net_achieved += sale.net;
        outcome.allowance_consumed += sale.allowance_used;
        outcome.breakdown.push(sale);
        outcome.lots.push(updated);
    }

    outcome
}

/// Loss carry-forward between tax years.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaxState {
    pub loss_carry: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxYearSettlement {
    pub taxable_before_carry: f64,
    pub loss_carry_used: f64,
    pub allowance_used: f64,
    pub taxable_after_allowance: f64,
    pub tax_due: f64,
    pub tax_saved_by_loss_carry: f64,
    pub next: TaxState,
}

/// Final tax for a year from the signed taxable gains of all its sales.
pub fn settle_tax_year(
    state: TaxState,
    signed_taxable_gain: f64,
    allowance: f64,
    church_tax_rate: f64,
) -> TaxYearSettlement {
    let rate = capital_gains_rate(church_tax_rate);
    let allowance = allowance.max(0.0);
    let carry = state.loss_carry.max(0.0);
    let after_carry = signed_taxable_gain - carry;

    let tax_without_carry = (signed_taxable_gain - allowance).max(0.0) * rate;
    if after_carry <= 0.0 {
        return TaxYearSettlement {
            taxable_before_carry: signed_taxable_gain,
            loss_carry_used: signed_taxable_gain.max(0.0).min(carry),
            allowance_used: 0.0,
            taxable_after_allowance: 0.0,
            tax_due: 0.0,
            tax_saved_by_loss_carry: tax_without_carry,
            next: TaxState {
                loss_carry: -after_carry,
            },
        };
    }

    let allowance_used = allowance.min(after_carry);
    let taxable_after_allowance = after_carry - allowance_used;
    let tax_due = taxable_after_allowance * rate;
    TaxYearSettlement {
        taxable_before_carry: signed_taxable_gain,
        loss_carry_used: carry,
        allowance_used,
        taxable_after_allowance,
        tax_due,
        tax_saved_by_loss_carry: (tax_without_carry - tax_due).max(0.0),
        next: TaxState::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    const EPS: f64 = 1e-6;
    const RATE: f64 = 0.26375;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn lot(id: &str, value: f64, basis: f64, exemption: f64) -> Tranche {
        Tranche::new(id, AssetClass::EquityOld, value, basis, exemption)
    }

    #[test]
    fn loss_free_lot_sells_at_par() {
        let lots = vec![lot("a", 50_000.0, 50_000.0, 0.3)];
        let out = sell(12_000.0, &lots, 0.0, 0.0, SaleOrder::Fifo);
        assert_approx(out.net_achieved, 12_000.0);
        assert_approx(out.gross_sold, 12_000.0);
        assert_eq!(out.tax_owed, 0.0);
    }

    #[test]
    fn net_request_is_met_exactly_without_allowance() {
        let lots = vec![lot("a", 100_000.0, 50_000.0, 0.3)];
        let out = sell(10_000.0, &lots, 0.0, 0.0, SaleOrder::Fifo);
        let expected_gross = 10_000.0 / (1.0 - RATE * 0.35);
        assert_approx(out.gross_sold, expected_gross);
        assert_approx(out.net_achieved, 10_000.0);
        assert_approx(out.tax_owed, expected_gross * 0.35 * RATE);
    }

    #[test]
    fn net_request_is_met_exactly_with_partial_allowance() {
        let lots = vec![lot("a", 100_000.0, 50_000.0, 0.3)];
        let out = sell(10_000.0, &lots, 1_000.0, 0.0, SaleOrder::Fifo);
        let expected_gross = (10_000.0 - RATE * 1_000.0) / (1.0 - RATE * 0.35);
        assert_approx(out.gross_sold, expected_gross);
        assert_approx(out.net_achieved, 10_000.0);
        assert_approx(out.allowance_consumed, 1_000.0);
    }

    #[test]
    fn allowance_covers_small_gain_completely() {
        let lots = vec![lot("a", 100_000.0, 90_000.0, 0.3)];
        let out = sell(5_000.0, &lots, 2_000.0, 0.0, SaleOrder::Fifo);
        assert_approx(out.gross_sold, 5_000.0);
        assert_eq!(out.tax_owed, 0.0);
        assert_approx(out.allowance_consumed, 5_000.0 * 0.1 * 0.7);
    }

    #[test]
    fn exhausted_lots_report_partial_fulfillment() {
        let lots = vec![lot("a", 5_000.0, 5_000.0, 0.3), lot("b", 3_000.0, 1_000.0, 0.0)];
        let out = sell(20_000.0, &lots, 0.0, 0.0, SaleOrder::Fifo);
        assert!(out.net_achieved < 20_000.0);
        assert_approx(out.gross_sold, 8_000.0);
        assert!(out.lots.iter().all(|l| l.is_depleted()));
    }

    #[test]
    fn fifo_sells_undated_lots_first_then_oldest() {
        let lots = vec![
            lot("new", 10_000.0, 10_000.0, 0.3).with_purchase_date("2021-05-01"),
            lot("old", 10_000.0, 10_000.0, 0.3).with_purchase_date("2010-01-15"),
            lot("legacy", 10_000.0, 10_000.0, 0.3),
        ];
        let order: Vec<&str> = order_lots(&lots, SaleOrder::Fifo)
            .into_iter()
            .map(|l| l.id.as_str())
            .collect();
        assert_eq!(order, vec!["legacy", "old", "new"]);
    }

    #[test]
    fn tax_efficient_order_prefers_low_tax_load_then_newer() {
        let lots = vec![
            lot("high", 10_000.0, 2_000.0, 0.3),
            lot("exempt", 10_000.0, 2_000.0, 1.0),
            lot("older_flat", 10_000.0, 10_000.0, 0.3).with_purchase_date("2012-01-01"),
            lot("newer_flat", 10_000.0, 10_000.0, 0.3).with_purchase_date("2020-01-01"),
        ];
        let order: Vec<&str> = order_lots(&lots, SaleOrder::TaxEfficient)
            .into_iter()
            .map(|l| l.id.as_str())
            .collect();
        assert_eq!(order, vec!["newer_flat", "older_flat", "exempt", "high"]);
    }

    #[test]
    fn money_market_lots_are_never_sold() {
        let lots = vec![Tranche::new(
            "mm",
            AssetClass::MoneyMarket,
            10_000.0,
            10_000.0,
            0.0,
        )];
        let out = sell(1_000.0, &lots, 0.0, 0.0, SaleOrder::Fifo);
        assert_eq!(out.gross_sold, 0.0);
        assert!(out.breakdown.is_empty());
    }

    #[test]
    fn budgets_limit_each_class() {
        let lots = vec![
            lot("eq", 50_000.0, 50_000.0, 0.3),
            Tranche::new("gold", AssetClass::Gold, 20_000.0, 20_000.0, 0.0),
        ];
        let ordered = order_lots(&lots, SaleOrder::Fifo);
        let limits = SaleLimits::default()
            .with_class_budget(AssetClass::EquityOld, 4_000.0)
            .with_class_budget(AssetClass::Gold, 5_000.0);
        let out = sell_in_order(SaleTarget::Net(20_000.0), &ordered, &limits, 0.0, 0.0);
        let by_class = out.gross_by_class();
        assert_approx(by_class[&AssetClass::EquityOld], 4_000.0);
        assert_approx(by_class[&AssetClass::Gold], 5_000.0);
        assert_approx(out.net_achieved, 9_000.0);
    }

    #[test]
    fn gross_target_ignores_tax() {
        let lots = vec![lot("a", 100_000.0, 50_000.0, 0.0)];
        let ordered = order_lots(&lots, SaleOrder::Fifo);
        let out = sell_in_order(
            SaleTarget::Gross(10_000.0),
            &ordered,
            &SaleLimits::default(),
            0.0,
            0.0,
        );
        assert_approx(out.gross_sold, 10_000.0);
        assert_approx(out.tax_owed, 5_000.0 * RATE);
    }

    #[test]
    fn lot_sale_records_remaining_position() {
        let (updated, sale) = sell_lot(&lot("a", 200_000.0, 150_000.0, 0.3), 20_000.0, 0.0, RATE);
        assert_approx(updated.market_value, 180_000.0);
        assert_approx(updated.cost_basis, 135_000.0);
        assert_approx(sale.cost_basis_sold, 15_000.0);
        assert_approx(sale.taxable_gain, 3_500.0);
        assert_eq!(sale.remaining_value, updated.market_value);
    }

    #[test]
    fn settlement_nets_losses_against_gains() {
        let settled = settle_tax_year(TaxState { loss_carry: 3_000.0 }, 5_000.0, 1_000.0, 0.0);
        assert_approx(settled.taxable_after_allowance, 1_000.0);
        assert_approx(settled.tax_due, 1_000.0 * RATE);
        assert_approx(settled.tax_saved_by_loss_carry, 3_000.0 * RATE);
        assert_eq!(settled.next.loss_carry, 0.0);
    }

    #[test]
    fn settlement_carries_unused_losses_forward() {
        let settled = settle_tax_year(TaxState { loss_carry: 2_000.0 }, -1_500.0, 1_000.0, 0.0);
        assert_eq!(settled.tax_due, 0.0);
        assert_approx(settled.next.loss_carry, 3_500.0);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]
        #[test]
        fn prop_higher_exemption_strictly_lowers_tax(
            value in 10_000.0f64..500_000.0,
            basis_ratio in 0.05f64..0.95,
            low in 0.0f64..0.9,
            step in 0.01f64..0.1,
            sold_fraction in 0.05f64..1.0,
        ) {
            let high = (low + step).min(1.0);
            let gross = value * sold_fraction;
            let a = lot("a", value, value * basis_ratio, low);
            let b = lot("b", value, value * basis_ratio, high);
            let (_, sale_a) = sell_lot(&a, gross, 0.0, RATE);
            let (_, sale_b) = sell_lot(&b, gross, 0.0, RATE);
            prop_assert!(sale_b.tax < sale_a.tax);
        }

        #[test]
        fn prop_sale_preserves_basis_per_unit(
            value in 1_000.0f64..500_000.0,
            basis_ratio in 0.1f64..1.5,
            request_fraction in 0.01f64..0.9,
        ) {
            let lots = vec![lot("a", value, value * basis_ratio, 0.3)];
            let out = sell(value * request_fraction * 0.7, &lots, 500.0, 0.0, SaleOrder::TaxEfficient);
            for updated in &out.lots {
                if !updated.is_depleted() {
                    let before = basis_ratio;
                    let after = updated.cost_basis / updated.market_value;
                    prop_assert!((before - after).abs() < 1e-9);
                }
            }
        }
    }
}
