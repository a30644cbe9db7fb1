//! Market timing filter
//!
//! Penalizes adverse volatility/phase combinations. Each penalty is a named rule;
//! the filter folds the factors of the rules that fire and clamps the product to
//! [0.5, 1.0] before it is applied to the raw rule score.

use crate::config::RuleConfig;
use crate::features::{FeatureSnapshot, Indicator};
use crate::regime::RegimeLabel;

pub const MIN_TIMING: f64 = 0.5;

/// Inputs visible to timing rules
#[derive(Debug, Clone, Copy)]
pub struct TimingContext<'a> {
    pub volatility: Option<f64>,
    pub rsi: Option<f64>,
    pub regime: RegimeLabel,
    pub raw_score: f64,
    pub config: &'a RuleConfig,
}

impl<'a> TimingContext<'a> {
    pub fn new(
        features: &FeatureSnapshot,
        regime: RegimeLabel,
        raw_score: f64,
        config: &'a RuleConfig,
    ) -> Self {
        Self {
            volatility: features.get(Indicator::Volatility20).map(f64::abs),
            rsi: features.get(Indicator::Rsi14),
            regime,
            raw_score,
            config,
        }
    }

    fn volatility_above(&self, level: f64) -> bool {
        self.volatility.map_or(false, |v| v > level)
    }

    /// High but not extreme volatility
    fn elevated_volatility(&self) -> bool {
        self.volatility_above(self.config.high_volatility)
            && !self.volatility_above(self.config.extreme_volatility)
    }
}

/// One named timing penalty
#[derive(Clone, Copy)]
pub struct TimingRule {
    pub name: &'static str,
    pub rationale: &'static str,
    pub applies: fn(&TimingContext) -> bool,
    pub factor: f64,
}

impl std::fmt::Debug for TimingRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimingRule")
            .field("name", &self.name)
            .field("factor", &self.factor)
            .finish()
    }
}

/// Ordered timing rules; the three volatility rules are mutually exclusive
pub fn default_timing_rules() -> Vec<TimingRule> {
    vec![
        TimingRule {
            name: "extreme_volatility",
            rationale: "entries in disorderly markets fill badly",
            applies: |c| c.volatility_above(c.config.extreme_volatility),
            factor: 0.6,
        },
        TimingRule {
            name: "volatile_bear",
            rationale: "high volatility in a bear phase is mostly liquidation",
            applies: |c| c.elevated_volatility() && c.regime.is_bearish(),
            factor: 0.75,
        },
        TimingRule {
            name: "volatile_range",
            rationale: "high volatility without a trend whipsaws both sides",
            applies: |c| c.elevated_volatility() && c.regime == RegimeLabel::Sideways,
            factor: 0.8,
        },
        TimingRule {
            name: "chasing_extreme",
            rationale: "buying overbought or selling oversold chases a stretched oscillator",
            applies: |c| {
                c.rsi.map_or(false, |r| {
                    (c.raw_score > 0.0 && r > c.config.rsi_extreme_high)
                        || (c.raw_score < 0.0 && r < c.config.rsi_extreme_low)
                })
            },
            factor: 0.8,
        },
        TimingRule {
            name: "counter_phase_buy",
            rationale: "buying against a bear phase",
            applies: |c| c.raw_score > 0.0 && c.regime.is_bearish(),
            factor: 0.9,
        },
    ]
}

/// Multiplier in [MIN_TIMING, 1.0] from the rules that fire
pub fn timing_filter(rules: &[TimingRule], ctx: &TimingContext) -> f64 {
    rules
        .iter()
        .filter(|r| (r.applies)(ctx))
        .fold(1.0_f64, |t, r| t * r.factor)
        .clamp(MIN_TIMING, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(features: &FeatureSnapshot, regime: RegimeLabel, raw_score: f64) -> f64 {
        let config = RuleConfig::default();
        let ctx = TimingContext::new(features, regime, raw_score, &config);
        timing_filter(&default_timing_rules(), &ctx)
    }

    fn fired(features: &FeatureSnapshot, regime: RegimeLabel, raw_score: f64) -> Vec<&'static str> {
        let config = RuleConfig::default();
        let ctx = TimingContext::new(features, regime, raw_score, &config);
        default_timing_rules()
            .into_iter()
            .filter(|r| (r.applies)(&ctx))
            .map(|r| r.name)
            .collect()
    }

    #[test]
    fn test_calm_market_is_unpenalized() {
        let f = FeatureSnapshot::new()
            .with(Indicator::Volatility20, 0.01)
            .with(Indicator::Rsi14, 55.0);
        assert_eq!(timing(&f, RegimeLabel::WeakBull, 0.4), 1.0);
    }

    #[test]
    fn test_penalties_stack_but_stay_bounded() {
        let f = FeatureSnapshot::new()
            .with(Indicator::Volatility20, 0.2)
            .with(Indicator::Rsi14, 90.0);
        assert_eq!(timing(&f, RegimeLabel::StrongBear, 0.5), MIN_TIMING);
    }

    #[test]
    fn test_selling_into_oversold_is_penalized() {
        let f = FeatureSnapshot::new().with(Indicator::Rsi14, 15.0);
        let t = timing(&f, RegimeLabel::Sideways, -0.3);
        assert!((t - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_volatility_rules_are_exclusive() {
        let extreme = FeatureSnapshot::new().with(Indicator::Volatility20, 0.08);
        assert_eq!(fired(&extreme, RegimeLabel::WeakBear, -0.2), vec!["extreme_volatility"]);

        let high = FeatureSnapshot::new().with(Indicator::Volatility20, 0.04);
        assert_eq!(fired(&high, RegimeLabel::WeakBear, -0.2), vec!["volatile_bear"]);
        assert_eq!(fired(&high, RegimeLabel::Sideways, -0.2), vec!["volatile_range"]);
        assert!(fired(&high, RegimeLabel::StrongBull, -0.2).is_empty());
    }

    #[test]
    fn test_counter_phase_buy_in_volatile_bear() {
        let f = FeatureSnapshot::new().with(Indicator::Volatility20, 0.04);
        let t = timing(&f, RegimeLabel::StrongBear, 0.3);
        assert!((t - 0.75 * 0.9).abs() < 1e-12);
    }
}
