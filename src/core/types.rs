use serde::{Deserialize, Serialize};

/// Lots below this value are treated as fully sold and pruned from the portfolio.
const DUST: f64 = 0.005;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssetClass {
    #[serde(alias = "equityOld", alias = "equity_old")]
    EquityOld,
    #[serde(alias = "equityNew", alias = "equity_new")]
    EquityNew,
    Gold,
    #[serde(alias = "moneyMarket", alias = "money_market")]
    MoneyMarket,
}

impl AssetClass {
    pub fn is_equity(self) -> bool {
        matches!(self, AssetClass::EquityOld | AssetClass::EquityNew)
    }

    /// Lots of this class can be sold to raise liquidity.
    pub fn is_sellable(self) -> bool {
        !matches!(self, AssetClass::MoneyMarket)
    }
}

/// A single tax lot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tranche {
    #[serde(default)]
    pub id: String,
    pub asset_class: AssetClass,
    pub market_value: f64,
    pub cost_basis: f64,
    #[serde(default)]
    pub tax_exemption_fraction: f64,
    /// ISO date (`YYYY-MM-DD`); lots without a date sort as the oldest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_date: Option<String>,
}

impl Tranche {
    pub fn new(
        id: impl Into<String>,
        asset_class: AssetClass,
        market_value: f64,
        cost_basis: f64,
        tax_exemption_fraction: f64,
    ) -> Self {
        Self {
            id: id.into(),
            asset_class,
            market_value,
            cost_basis,
            tax_exemption_fraction,
            purchase_date: None,
        }
    }

    pub fn with_purchase_date(mut self, date: impl Into<String>) -> Self {
        self.purchase_date = Some(date.into());
        self
    }

    pub fn gain_ratio(&self) -> f64 {
        if self.market_value <= 0.0 {
            return 0.0;
        }
        ((self.market_value - self.cost_basis) / self.market_value).max(0.0)
    }

    /// Fraction of every sold unit that ends up as taxable gain.
    pub fn tax_load(&self) -> f64 {
        self.gain_ratio() * (1.0 - self.tax_exemption_fraction.clamp(0.0, 1.0))
    }

    /// The lot left after selling `gross` of it. Cost basis shrinks by the sold fraction,
    /// so the basis per remaining unit is unchanged.
    pub fn after_sale(&self, gross: f64) -> Tranche {
        let mut next = self.clone();
        if self.market_value <= 0.0 {
            next.market_value = 0.0;
            next.cost_basis = 0.0;
            return next;
        }

        let gross = gross.clamp(0.0, self.market_value);
        let remaining = self.market_value - gross;
        if remaining <= DUST {
            next.market_value = 0.0;
            next.cost_basis = 0.0;
        } else {
            next.market_value = remaining;
            next.cost_basis = self.cost_basis * (remaining / self.market_value);
        }
        next
    }

    pub fn after_purchase(&self, amount: f64) -> Tranche {
        let mut next = self.clone();
        next.market_value += amount.max(0.0);
        next.cost_basis += amount.max(0.0);
        next
    }

    pub fn after_return(&self, rate: f64) -> Tranche {
        let mut next = self.clone();
        next.market_value = (self.market_value * (1.0 + rate)).max(0.0);
        next
    }

    pub fn is_depleted(&self) -> bool {
        self.market_value <= DUST
    }
}

/// Aggregated holdings for callers that do not track individual lots.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HoldingTotals {
    pub equity_old_value: f64,
    pub equity_old_cost_basis: f64,
    pub equity_new_value: f64,
    pub equity_new_cost_basis: f64,
    pub gold_value: f64,
    pub gold_cost_basis: f64,
    pub cash_on_hand: f64,
    pub money_market: f64,
    pub equity_exemption: f64,
    pub gold_exemption: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Portfolio {
    pub tranches: Vec<Tranche>,
    pub cash_on_hand: f64,
    pub money_market: f64,
}

impl Portfolio {
    pub fn from_totals(totals: &HoldingTotals) -> Self {
        let mut tranches = Vec::new();
        let lots = [
            (
                "equity-old",
                AssetClass::EquityOld,
                totals.equity_old_value,
                totals.equity_old_cost_basis,
                totals.equity_exemption,
            ),
            (
                "equity-new",
                AssetClass::EquityNew,
                totals.equity_new_value,
                totals.equity_new_cost_basis,
                totals.equity_exemption,
            ),
            (
                "gold",
                AssetClass::Gold,
                totals.gold_value,
                totals.gold_cost_basis,
                totals.gold_exemption,
            ),
        ];
        for (id, class, value, basis, exemption) in lots {
            if value > 0.0 {
                tranches.push(Tranche::new(id, class, value, basis, exemption));
            }
        }

        Self {
            tranches,
            cash_on_hand: totals.cash_on_hand,
            money_market: totals.money_market,
        }
    }

    pub fn class_value(&self, class: AssetClass) -> f64 {
        self.tranches
            .iter()
            .filter(|t| t.asset_class == class)
            .map(|t| t.market_value)
            .sum()
    }

    pub fn total_equity(&self) -> f64 {
        self.tranches
            .iter()
            .filter(|t| t.asset_class.is_equity())
            .map(|t| t.market_value)
            .sum()
    }

    pub fn total_gold(&self) -> f64 {
        self.class_value(AssetClass::Gold)
    }

    pub fn total_liquidity(&self) -> f64 {
        self.cash_on_hand + self.money_market + self.class_value(AssetClass::MoneyMarket)
    }

    /// Equity plus gold: the capital the skim and min-trade rules are measured against.
    pub fn invested(&self) -> f64 {
        self.total_equity() + self.total_gold()
    }

    pub fn total_wealth(&self) -> f64 {
        self.invested() + self.total_liquidity()
    }

    pub fn lot(&self, id: &str) -> Option<&Tranche> {
        self.tranches.iter().find(|t| t.id == id)
    }

    /// Swaps in reduced lots (matched by id) and prunes the ones that are gone.
    pub fn with_updated_lots(mut self, updated: &[Tranche]) -> Self {
        for lot in updated {
            if let Some(slot) = self.tranches.iter_mut().find(|t| t.id == lot.id) {
                *slot = lot.clone();
            }
        }
        self.tranches.retain(|t| !t.is_depleted());
        self
    }

    pub fn with_cash(mut self, amount: f64) -> Self {
        self.cash_on_hand += amount;
        self
    }

    /// Buys into the first lot of the class, or opens a new lot at cost.
    pub fn with_purchase(mut self, class: AssetClass, amount: f64, exemption: f64) -> Self {
        if amount <= 0.0 {
            return self;
        }
        let target = match class {
            AssetClass::EquityOld | AssetClass::EquityNew => AssetClass::EquityNew,
            other => other,
        };
        if let Some(slot) = self.tranches.iter_mut().find(|t| t.asset_class == target) {
            *slot = slot.after_purchase(amount);
        } else {
            let id = match target {
                AssetClass::EquityNew => "equity-new",
                AssetClass::Gold => "gold",
                AssetClass::MoneyMarket => "money-market",
                AssetClass::EquityOld => "equity-old",
            };
            self.tranches
                .push(Tranche::new(id, target, amount, amount, exemption));
        }
        self
    }

    /// Pays `amount` out of cash first, then the money-market balance. Returns the
    /// portfolio and the part that could not be covered.
    pub fn after_withdrawal(mut self, amount: f64) -> (Self, f64) {
        let mut remaining = amount.max(0.0);
        let from_cash = remaining.min(self.cash_on_hand.max(0.0));
        self.cash_on_hand -= from_cash;
        remaining -= from_cash;

        let from_money_market = remaining.min(self.money_market.max(0.0));
        self.money_market -= from_money_market;
        remaining -= from_money_market;

        for lot in self
            .tranches
            .iter_mut()
            .filter(|t| t.asset_class == AssetClass::MoneyMarket)
        {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(lot.market_value);
            *lot = lot.after_sale(take);
            remaining -= take;
        }
        self.tranches.retain(|t| !t.is_depleted());
        (self, remaining)
    }

    pub fn after_returns(mut self, equity_return: f64, gold_return: f64, cash_rate: f64) -> Self {
        for lot in &mut self.tranches {
            let rate = match lot.asset_class {
                AssetClass::EquityOld | AssetClass::EquityNew => equity_return,
                AssetClass::Gold => gold_return,
                AssetClass::MoneyMarket => cash_rate,
            };
            *lot = lot.after_return(rate);
        }
        self.cash_on_hand *= 1.0 + cash_rate;
        self.money_market *= 1.0 + cash_rate;
        self
    }
}

/// Prior-year-end index levels and the year's inflation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub current_level: f64,
    #[serde(rename = "level1YearAgo")]
    pub level_1y_ago: f64,
    #[serde(rename = "level2YearsAgo")]
    pub level_2y_ago: f64,
    #[serde(rename = "level3YearsAgo")]
    pub level_3y_ago: f64,
    pub all_time_high: f64,
    #[serde(default)]
    pub years_since_ath: u32,
    #[serde(default)]
    pub inflation_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cape: Option<f64>,
}

impl MarketSnapshot {
    /// A flat market sitting at its all-time high.
    pub fn flat(level: f64, inflation_pct: f64) -> Self {
        Self {
            current_level: level,
            level_1y_ago: level,
            level_2y_ago: level,
            level_3y_ago: level,
            all_time_high: level,
            years_since_ath: 0,
            inflation_pct,
            cape: None,
        }
    }

    /// Next year's snapshot after the index moved by `equity_return`.
    pub fn rolled(&self, equity_return: f64, next_inflation_pct: f64, cape: Option<f64>) -> Self {
        let level = (self.current_level * (1.0 + equity_return)).max(0.0);
        let (all_time_high, years_since_ath) = if level >= self.all_time_high {
            (level, 0)
        } else {
            (self.all_time_high, self.years_since_ath + 1)
        };
        Self {
            current_level: level,
            level_1y_ago: self.current_level,
            level_2y_ago: self.level_1y_ago,
            level_3y_ago: self.level_2y_ago,
            all_time_high,
            years_since_ath,
            inflation_pct: next_inflation_pct,
            cape,
        }
    }
}

/// Gross annual spending need and pension income, in nominal terms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AnnualNeeds {
    pub floor: f64,
    pub flex: f64,
    pub pension: f64,
}

/// Spending need the portfolio has to cover once pension income is applied.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetNeed {
    pub floor: f64,
    pub flex: f64,
}

impl NetNeed {
    pub fn total(&self) -> f64 {
        self.floor + self.flex
    }
}

impl AnnualNeeds {
    /// Pension covers the floor first; any surplus reduces the flex need.
    pub fn net_of_pension(&self) -> NetNeed {
        let pension = self.pension.max(0.0);
        let surplus = (pension - self.floor).max(0.0);
        NetNeed {
            floor: (self.floor - pension).max(0.0),
            flex: (self.flex - surplus).max(0.0),
        }
    }

    pub fn gross_total(&self) -> f64 {
        self.floor + self.flex
    }

    pub fn inflated(&self, inflation_pct: f64, pension_adjustment_pct: f64) -> Self {
        let factor = 1.0 + inflation_pct / 100.0;
        Self {
            floor: self.floor * factor,
            flex: self.flex * factor,
            pension: self.pension * (1.0 + pension_adjustment_pct / 100.0),
        }
    }
}
