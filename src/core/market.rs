use serde::{Deserialize, Serialize};

use super::config::Thresholds;
use super::types::MarketSnapshot;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    PeakHot,
    PeakStable,
    BearDeep,
    Recovery,
    CorrYoung,
    SideLong,
    RecoveryInBear,
}

/// Coarser grouping used for runway targets and smoothing bounds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Peak,
    HotNeutral,
    Bear,
    Stagflation,
    RecoveryInBear,
    Recovery,
}

impl Scenario {
    pub fn regime(self) -> Regime {
        match self {
            Scenario::PeakHot => Regime::Peak,
            Scenario::PeakStable | Scenario::SideLong => Regime::HotNeutral,
            Scenario::Recovery | Scenario::CorrYoung => Regime::Recovery,
            Scenario::BearDeep => Regime::Bear,
            Scenario::RecoveryInBear => Regime::RecoveryInBear,
        }
    }

    /// Markets in which sales prefer gold and the emergency buffer applies.
    pub fn is_bear_like(self) -> bool {
        matches!(self, Scenario::BearDeep | Scenario::RecoveryInBear)
    }

    pub fn is_peak_or_sideways(self) -> bool {
        matches!(
            self,
            Scenario::PeakHot | Scenario::PeakStable | Scenario::SideLong
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scenario::PeakHot => "peak_hot",
            Scenario::PeakStable => "peak_stable",
            Scenario::BearDeep => "bear_deep",
            Scenario::Recovery => "recovery",
            Scenario::CorrYoung => "corr_young",
            Scenario::SideLong => "side_long",
            Scenario::RecoveryInBear => "recovery_in_bear",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Valuation {
    Undervalued,
    Fair,
    Overvalued,
    ExtremeOvervalued,
}

impl Valuation {
    /// Long-run nominal equity return implied by the valuation level.
    pub fn expected_return(self) -> f64 {
        match self {
            Valuation::Undervalued => 0.08,
            Valuation::Fair => 0.07,
            Valuation::Overvalued => 0.05,
            Valuation::ExtremeOvervalued => 0.04,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketAnalysis {
    pub scenario: Scenario,
    pub ath_gap_pct: f64,
    #[serde(rename = "perf1YPct")]
    pub perf_1y_pct: f64,
    pub months_since_ath: f64,
    pub rally_from_low_pct: f64,
    /// Current level as a fraction of the all-time high.
    pub fraction_of_ath: f64,
    pub stagflation: bool,
    pub valuation: Valuation,
    pub cape_ratio: f64,
    pub expected_return: f64,
    pub reasons: Vec<String>,
}

impl MarketAnalysis {
    /// Regime used for the runway target; stagflation overrides the scenario mapping.
    pub fn runway_regime(&self) -> Regime {
        if self.stagflation {
            Regime::Stagflation
        } else {
            self.scenario.regime()
        }
    }

    /// Markets in which surplus cash stays uninvested.
    pub fn is_risky(&self) -> bool {
        self.scenario.is_bear_like() || self.ath_gap_pct > 15.0
    }
}

pub fn analyze_market(snapshot: &MarketSnapshot, thresholds: &Thresholds) -> MarketAnalysis {
    let current = snapshot.current_level;
    let ath = snapshot.all_time_high;
    let ath_gap_pct = if ath > 0.0 && current > 0.0 {
        (ath - current) / ath * 100.0
    } else {
        0.0
    };
    let perf_1y_pct = if snapshot.level_1y_ago > 0.0 {
        (current - snapshot.level_1y_ago) / snapshot.level_1y_ago * 100.0
    } else {
        0.0
    };
    let months_since_ath = if ath_gap_pct > 0.0 && snapshot.years_since_ath == 0 {
        12.0
    } else {
        f64::from(snapshot.years_since_ath) * 12.0
    };

    let mut reasons = Vec::new();
    let mut scenario = if ath_gap_pct <= 0.0 {
        if perf_1y_pct >= 10.0 {
            reasons.push(format!("new high with {perf_1y_pct:.1}% 1y momentum"));
            Scenario::PeakHot
        } else {
            reasons.push("new high without strong momentum".to_string());
            Scenario::PeakStable
        }
    } else if ath_gap_pct > 20.0 {
        reasons.push(format!("{ath_gap_pct:.1}% below all-time high"));
        Scenario::BearDeep
    } else if ath_gap_pct > 10.0 && perf_1y_pct > 10.0 && months_since_ath > 6.0 {
        reasons.push(format!(
            "{ath_gap_pct:.1}% below high, recovering {perf_1y_pct:.1}% over 1y"
        ));
        Scenario::Recovery
    } else if ath_gap_pct <= 15.0 && months_since_ath <= 6.0 {
        reasons.push(format!("young correction of {ath_gap_pct:.1}%"));
        Scenario::CorrYoung
    } else {
        reasons.push(format!(
            "sideways {months_since_ath:.0} months after the high"
        ));
        Scenario::SideLong
    };

    let low_point = [
        current,
        snapshot.level_1y_ago,
        snapshot.level_2y_ago,
        snapshot.level_3y_ago,
    ]
    .into_iter()
    .filter(|v| *v > 0.0)
    .fold(f64::INFINITY, f64::min);
    let rally_from_low_pct = if low_point.is_finite() && low_point > 0.0 {
        (current - low_point) / low_point * 100.0
    } else {
        0.0
    };

    if matches!(scenario, Scenario::BearDeep | Scenario::Recovery)
        && (perf_1y_pct >= 15.0 || rally_from_low_pct >= 30.0)
        && ath_gap_pct > 15.0
    {
        reasons.push(format!(
            "bounce of {rally_from_low_pct:.1}% from the 4-year low while still {ath_gap_pct:.1}% below high"
        ));
        scenario = Scenario::RecoveryInBear;
    }

    let stagflation = snapshot.inflation_pct >= thresholds.stagflation_inflation_pct
        && perf_1y_pct - snapshot.inflation_pct < 0.0;
    if stagflation {
        reasons.push(format!(
            "stagflation: inflation {:.1}% above real market performance",
            snapshot.inflation_pct
        ));
    }

    let cape_ratio = match snapshot.cape {
        Some(cape) if cape > 0.0 => cape,
        _ => thresholds.default_cape,
    };
    let valuation = if cape_ratio >= 35.0 {
        Valuation::ExtremeOvervalued
    } else if cape_ratio >= 30.0 {
        Valuation::Overvalued
    } else if cape_ratio <= 15.0 {
        Valuation::Undervalued
    } else {
        Valuation::Fair
    };

    MarketAnalysis {
        scenario,
        ath_gap_pct,
        perf_1y_pct,
        months_since_ath,
        rally_from_low_pct,
        fraction_of_ath: (100.0 - ath_gap_pct) / 100.0,
        stagflation,
        valuation,
        cape_ratio,
        expected_return: valuation.expected_return(),
        reasons,
    }
}
