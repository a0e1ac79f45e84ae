use serde::{Deserialize, Serialize};

use super::market::Regime;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SaleOrder {
    /// Oldest purchase first.
    #[serde(alias = "FIFO")]
    Fifo,
    /// Lowest taxable share of each sold unit first.
    #[default]
    #[serde(alias = "taxEfficient", alias = "tax_efficient", alias = "optimized")]
    TaxEfficient,
}

/// Maximum liquidity held per regime, in months of need.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunwayProfile {
    pub peak_months: f64,
    pub hot_neutral_months: f64,
    pub bear_months: f64,
    pub stagflation_months: f64,
    pub recovery_in_bear_months: f64,
    pub recovery_months: f64,
}

impl Default for RunwayProfile {
    fn default() -> Self {
        Self {
            peak_months: 48.0,
            hot_neutral_months: 36.0,
            bear_months: 60.0,
            stagflation_months: 60.0,
            recovery_in_bear_months: 48.0,
            recovery_months: 48.0,
        }
    }
}

impl RunwayProfile {
    pub fn months_for(&self, regime: Regime) -> f64 {
        match regime {
            Regime::Peak => self.peak_months,
            Regime::HotNeutral => self.hot_neutral_months,
            Regime::Bear => self.bear_months,
            Regime::Stagflation => self.stagflation_months,
            Regime::RecoveryInBear => self.recovery_in_bear_months,
            Regime::Recovery => self.recovery_months,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AlarmThresholds {
    /// Withdrawal rate on invested capital that counts as critical.
    pub withdrawal_rate: f64,
    /// Real drawdown from the wealth peak that counts as critical.
    pub real_drawdown: f64,
    pub runway_thin_months: f64,
    /// Drawdown under which a peak or sideways market ends the alarm.
    pub peak_exit_drawdown: f64,
    /// Runway margin above the minimum that ends the alarm in a recovery.
    pub recovery_exit_runway_margin_months: f64,
    pub floor_flex_rate: f64,
    pub max_cut_pp: f64,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            withdrawal_rate: 0.055,
            real_drawdown: 0.25,
            runway_thin_months: 24.0,
            peak_exit_drawdown: 0.15,
            recovery_exit_runway_margin_months: 6.0,
            floor_flex_rate: 35.0,
            max_cut_pp: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CautionThresholds {
    pub withdrawal_rate: f64,
    pub inflation_cap_pct: f64,
}

impl Default for CautionThresholds {
    fn default() -> Self {
        Self {
            withdrawal_rate: 0.045,
            inflation_cap_pct: 3.0,
        }
    }
}

/// Flex-rate smoothing and the per-year change bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmoothingModel {
    pub alpha: f64,
    pub max_up_pp: f64,
    pub agile_up_pp: f64,
    pub max_down_pp: f64,
    pub max_down_in_bear_pp: f64,
}

impl Default for SmoothingModel {
    fn default() -> Self {
        Self {
            alpha: 0.35,
            max_up_pp: 2.5,
            agile_up_pp: 4.5,
            max_down_pp: 3.5,
            max_down_in_bear_pp: 6.0,
        }
    }
}

/// One band of the recovery curb table. Matches `min_gap_pct < gap <= max_gap_pct`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurbRule {
    pub min_gap_pct: f64,
    pub max_gap_pct: f64,
    pub curb_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryCurb {
    pub rules: Vec<CurbRule>,
    pub default_curb_pct: f64,
    pub thin_runway_months: f64,
    pub thin_runway_min_curb_pct: f64,
}

impl Default for RecoveryCurb {
    fn default() -> Self {
        Self {
            rules: vec![
                CurbRule {
                    min_gap_pct: 25.0,
                    max_gap_pct: 100.0,
                    curb_pct: 25.0,
                },
                CurbRule {
                    min_gap_pct: 15.0,
                    max_gap_pct: 25.0,
                    curb_pct: 20.0,
                },
                CurbRule {
                    min_gap_pct: 10.0,
                    max_gap_pct: 15.0,
                    curb_pct: 15.0,
                },
                CurbRule {
                    min_gap_pct: 0.0,
                    max_gap_pct: 10.0,
                    curb_pct: 10.0,
                },
            ],
            default_curb_pct: 10.0,
            thin_runway_months: 30.0,
            thin_runway_min_curb_pct: 20.0,
        }
    }
}

impl RecoveryCurb {
    pub fn curb_for(&self, ath_gap_pct: f64, runway_months: f64) -> f64 {
        let curb = self
            .rules
            .iter()
            .find(|r| ath_gap_pct > r.min_gap_pct && ath_gap_pct <= r.max_gap_pct)
            .map(|r| r.curb_pct)
            .unwrap_or(self.default_curb_pct);
        if runway_months < self.thin_runway_months {
            curb.max(self.thin_runway_min_curb_pct)
        } else {
            curb
        }
    }
}

/// Trade-size and liquidity constants of the transaction engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Thresholds {
    pub stagflation_inflation_pct: f64,
    pub default_cape: f64,
    pub min_refill_amount: f64,
    pub min_trade_static: f64,
    pub min_trade_dynamic_factor: f64,
    pub cash_rebalance_threshold: f64,
    pub absolute_min_liquidity: f64,
    pub guardrail_activation_coverage: f64,
    pub critical_coverage: f64,
    pub critical_relief_equity_pct: f64,
    pub bear_critical_buffer_factor: f64,
    pub hysteresis_min_refill: f64,
    pub ruin_wealth: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            stagflation_inflation_pct: 4.0,
            default_cape: 20.0,
            min_refill_amount: 10_000.0,
            min_trade_static: 25_000.0,
            min_trade_dynamic_factor: 0.005,
            cash_rebalance_threshold: 2_500.0,
            absolute_min_liquidity: 10_000.0,
            guardrail_activation_coverage: 0.69,
            critical_coverage: 0.75,
            critical_relief_equity_pct: 10.0,
            bear_critical_buffer_factor: 1.5,
            hysteresis_min_refill: 2_000.0,
            ruin_wealth: 1.0,
        }
    }
}

/// Everything that stays fixed for one run. Percentages are in points (60 means 60%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Policy {
    pub target_equity_pct: f64,
    pub gold_target_pct: f64,
    pub gold_floor_pct: f64,
    pub rebalancing_band_pct: f64,
    pub max_skim_pct: f64,
    pub max_bear_refill_pct: f64,
    pub runway_min_months: f64,
    pub runway_target_months: f64,
    pub min_cash_buffer_months: f64,
    pub annual_allowance: f64,
    pub church_tax_rate: f64,
    pub equity_exemption: f64,
    pub gold_exemption: f64,
    pub round_flex_to_five: bool,
    pub sale_order: SaleOrder,
    pub runway_profile: RunwayProfile,
    pub alarm: AlarmThresholds,
    pub caution: CautionThresholds,
    pub smoothing: SmoothingModel,
    pub recovery_curb: RecoveryCurb,
    pub thresholds: Thresholds,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            target_equity_pct: 60.0,
            gold_target_pct: 10.0,
            gold_floor_pct: 1.0,
            rebalancing_band_pct: 20.0,
            max_skim_pct: 10.0,
            max_bear_refill_pct: 5.0,
            runway_min_months: 24.0,
            runway_target_months: 36.0,
            min_cash_buffer_months: 2.0,
            annual_allowance: 1_000.0,
            church_tax_rate: 0.0,
            equity_exemption: 0.3,
            gold_exemption: 0.0,
            round_flex_to_five: false,
            sale_order: SaleOrder::TaxEfficient,
            runway_profile: RunwayProfile::default(),
            alarm: AlarmThresholds::default(),
            caution: CautionThresholds::default(),
            smoothing: SmoothingModel::default(),
            recovery_curb: RecoveryCurb::default(),
            thresholds: Thresholds::default(),
        }
    }
}

impl Policy {
    pub fn gold_active(&self) -> bool {
        self.gold_target_pct > 0.0
    }

    /// Flat capital gains tax with solidarity surcharge and church tax on top.
    pub fn capital_gains_rate(&self) -> f64 {
        capital_gains_rate(self.church_tax_rate)
    }
}

pub fn capital_gains_rate(church_tax_rate: f64) -> f64 {
    0.25 * (1.0 + 0.055 + church_tax_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curb_table_matches_gap_bands() {
        let curb = RecoveryCurb::default();
        assert_eq!(curb.curb_for(30.0, 40.0), 25.0);
        assert_eq!(curb.curb_for(25.0, 40.0), 20.0);
        assert_eq!(curb.curb_for(16.0, 40.0), 20.0);
        assert_eq!(curb.curb_for(12.0, 40.0), 15.0);
        assert_eq!(curb.curb_for(5.0, 40.0), 10.0);
        assert_eq!(curb.curb_for(0.0, 40.0), 10.0);
    }

    #[test]
    fn thin_runway_widens_curb() {
        let curb = RecoveryCurb::default();
        assert_eq!(curb.curb_for(5.0, 20.0), 20.0);
        assert_eq!(curb.curb_for(30.0, 20.0), 25.0);
    }

    #[test]
    fn capital_gains_rate_includes_surcharges() {
        assert!((capital_gains_rate(0.0) - 0.26375).abs() < 1e-12);
        assert!((capital_gains_rate(0.09) - 0.28625).abs() < 1e-12);
    }

    #[test]
    fn policy_deserializes_from_partial_json() {
        let policy: Policy =
            serde_json::from_str(r#"{"targetEquityPct": 70, "saleOrder": "fifo"}"#)
                .expect("valid policy json");
        assert_eq!(policy.target_equity_pct, 70.0);
        assert_eq!(policy.sale_order, SaleOrder::Fifo);
        assert_eq!(policy.runway_min_months, 24.0);
    }
}
