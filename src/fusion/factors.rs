//! Weight factors for ML/rule fusion
//!
//! Each factor inspects the cycle and returns a pair of multipliers (ML, rule).
//! Factors are independent of each other; the controller applies them in order.

use serde::{Deserialize, Serialize};

use crate::config::FusionConfig;
use crate::features::{FeatureSnapshot, Indicator};
use crate::ml_engine::EnsemblePrediction;
use crate::regime::RegimeLabel;
use crate::strategy::RuleSignal;
use crate::types::PerformanceHistory;

/// One applied factor, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionFactor {
    pub name: String,
    pub ml: f64,
    pub rule: f64,
}

/// Everything a factor may look at
#[derive(Debug, Clone, Copy)]
pub struct FactorInput<'a> {
    pub ensemble: &'a EnsemblePrediction,
    pub rule: &'a RuleSignal,
    pub regime: RegimeLabel,
    pub history: Option<&'a PerformanceHistory>,
    pub features: &'a FeatureSnapshot,
    pub config: &'a FusionConfig,
}

/// Multi-timeframe trend confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendConfirmation {
    StrongBull,
    StrongBear,
    Unconfirmed,
}

pub type FactorFn = fn(&FactorInput) -> (f64, f64);

/// Ordered factor chain
pub const FACTOR_CHAIN: [(&str, FactorFn); 6] = [
    ("ensemble_quality", quality_factor),
    ("regime", regime_factor),
    ("confidence_gap", confidence_gap_factor),
    ("decision_consistency", consistency_factor),
    ("historical_performance", performance_factor),
    ("trend_confirmation", trend_factor),
];

/// Direction of a score outside the deadband
pub fn direction(score: f64, deadband: f64) -> i8 {
    if score > deadband {
        1
    } else if score < -deadband {
        -1
    } else {
        0
    }
}

/// Low ensemble quality sharply cuts the ML weight
pub fn quality_factor(input: &FactorInput) -> (f64, f64) {
    let q = input.ensemble.quality;
    let c = input.config;
    if q < c.low_quality {
        (0.3, 1.0)
    } else if q < c.medium_quality {
        (0.7, 1.0)
    } else if q >= c.high_quality {
        (1.2, 1.0)
    } else {
        (1.0, 1.0)
    }
}

/// Bear and sideways markets favor rules
pub fn regime_factor(input: &FactorInput) -> (f64, f64) {
    match input.regime {
        RegimeLabel::ExtremeBear | RegimeLabel::StrongBear | RegimeLabel::WeakBear => (0.8, 1.2),
        RegimeLabel::Sideways => (0.9, 1.1),
        RegimeLabel::StrongBull => (1.1, 1.0),
        RegimeLabel::WeakBull => (1.0, 1.0),
    }
}

/// Favor the side that is markedly more confident
pub fn confidence_gap_factor(input: &FactorInput) -> (f64, f64) {
    let gap = input.ensemble.confidence - input.rule.confidence();
    if gap > input.config.confidence_gap {
        (1.0 + gap, 1.0)
    } else if gap < -input.config.confidence_gap {
        (1.0, 1.0 - gap)
    } else {
        (1.0, 1.0)
    }
}

/// Historical hit-rate edge of ML over rules, if known and mature
fn reliability_edge(input: &FactorInput) -> f64 {
    let Some(h) = input.history.filter(|h| h.is_mature(input.config.min_trades)) else {
        return 0.0;
    };
    match (h.ml_hit_rate, h.rule_hit_rate) {
        (Some(ml), Some(rule)) => ml - rule,
        _ => 0.0,
    }
}

/// Agreement amplifies both; conflict goes to the stronger, more reliable side
pub fn consistency_factor(input: &FactorInput) -> (f64, f64) {
    let deadband = input.config.direction_deadband;
    let ml_dir = direction(input.ensemble.score, deadband);
    let rule_dir = direction(input.rule.score(), deadband);

    if ml_dir == 0 || rule_dir == 0 {
        return (1.0, 1.0);
    }
    if ml_dir == rule_dir {
        return (1.1, 1.1);
    }

    let mut ml_strength = input.ensemble.confidence * input.ensemble.quality;
    // Rule quality proxy: consistency ratio mapped onto [0, 1]
    let mut rule_strength = input.rule.confidence() * ((input.rule.consistency - 0.5) / 0.9);

    let edge = reliability_edge(input);
    if edge > input.config.reliability_edge {
        ml_strength *= 1.15;
    } else if edge < -input.config.reliability_edge {
        rule_strength *= 1.15;
    }

    if ml_strength > rule_strength {
        (1.3, 0.7)
    } else {
        (0.7, 1.3)
    }
}

/// Poor realized results shift weight toward rules
pub fn performance_factor(input: &FactorInput) -> (f64, f64) {
    let c = input.config;
    let Some(h) = input.history.filter(|h| h.is_mature(c.min_trades)) else {
        return (1.0, 1.0);
    };
    let mut ml = 1.0;
    if h.win_rate < c.poor_win_rate {
        ml *= 0.75;
    } else if h.win_rate > c.strong_win_rate {
        ml *= 1.1;
    }
    if h.max_drawdown > c.deep_drawdown {
        ml *= 0.85;
    }
    (ml, 1.0)
}

/// Classify the multi-timeframe trend from trend_5/20/50
pub fn trend_confirmation(features: &FeatureSnapshot, config: &FusionConfig) -> TrendConfirmation {
    let (Some(t5), Some(t20), Some(t50)) = (
        features.get(Indicator::Trend5),
        features.get(Indicator::Trend20),
        features.get(Indicator::Trend50),
    ) else {
        return TrendConfirmation::Unconfirmed;
    };

    let a = config.confirm_alignment;
    if t20 > config.confirm_trend && t5 > a && t50 > a {
        TrendConfirmation::StrongBull
    } else if t20 < -config.confirm_trend && t5 < -a && t50 < -a {
        TrendConfirmation::StrongBear
    } else {
        TrendConfirmation::Unconfirmed
    }
}

/// Confirmed strong bull favors ML, confirmed strong bear favors rules
pub fn trend_factor(input: &FactorInput) -> (f64, f64) {
    match trend_confirmation(input.features, input.config) {
        TrendConfirmation::StrongBull => (1.15, 1.0),
        TrendConfirmation::StrongBear => (0.8, 1.2),
        TrendConfirmation::Unconfirmed => (1.0, 1.0),
    }
}
