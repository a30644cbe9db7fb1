//! Weight adjustment rules
//!
//! Every condition-based multiplier on the base weights is a named rule with a
//! predicate over the cycle context and a per-term multiplier. Rules are applied in
//! order via a fold, so each one can be tested on its own.

use crate::config::RuleConfig;
use crate::features::{FeatureSnapshot, Indicator, IndicatorFamily};
use crate::regime::RegimeLabel;
use crate::types::{PerformanceHistory, PositionSide, PositionState};

/// Inputs visible to adjustment predicates
#[derive(Debug, Clone, Copy)]
pub struct AdjustmentContext<'a> {
    pub features: &'a FeatureSnapshot,
    pub regime: RegimeLabel,
    pub position: &'a PositionState,
    pub history: Option<&'a PerformanceHistory>,
    pub config: &'a RuleConfig,
}

impl AdjustmentContext<'_> {
    fn volatility(&self) -> Option<f64> {
        self.features.get(Indicator::Volatility20).map(f64::abs)
    }

    fn rsi(&self) -> Option<f64> {
        self.features.get(Indicator::Rsi14)
    }

    fn mature_history(&self) -> Option<&PerformanceHistory> {
        self.history
            .filter(|h| h.is_mature(self.config.min_trades_for_adaptation))
    }
}

/// A single declarative weight adjustment
#[derive(Clone, Copy)]
pub struct AdjustmentRule {
    pub name: &'static str,
    pub rationale: &'static str,
    pub applies: fn(&AdjustmentContext) -> bool,
    /// Multiplier for one term given its indicator and current signal
    pub multiplier: fn(Indicator, f64) -> f64,
}

impl std::fmt::Debug for AdjustmentRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdjustmentRule")
            .field("name", &self.name)
            .finish()
    }
}

fn family_is(indicator: Indicator, family: IndicatorFamily) -> bool {
    indicator.family() == family
}

fn is_level(indicator: Indicator) -> bool {
    matches!(
        indicator,
        Indicator::SupportLevel | Indicator::ResistanceLevel | Indicator::Price
    )
}

/// Ordered rule list
pub fn default_rules() -> Vec<AdjustmentRule> {
    vec![
        // ============ Volatility regime ============
        AdjustmentRule {
            name: "high_volatility",
            rationale: "trends are unreliable in wide ranges; price levels matter more",
            applies: |c| c.volatility().map_or(false, |v| v > c.config.high_volatility),
            multiplier: |i, _| {
                if family_is(i, IndicatorFamily::Trend) {
                    0.5
                } else if is_level(i) {
                    1.3
                } else {
                    1.0
                }
            },
        },
        AdjustmentRule {
            name: "low_volatility",
            rationale: "quiet tape lets trends persist and dulls oscillators",
            applies: |c| c.volatility().map_or(false, |v| v < c.config.low_volatility),
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Trend => 1.2,
                IndicatorFamily::Oscillator => 0.8,
                _ => 1.0,
            },
        },
        // ============ RSI extremity ============
        AdjustmentRule {
            name: "rsi_extreme",
            rationale: "stretched oscillators favor mean reversion over momentum",
            applies: |c| {
                c.rsi().map_or(false, |r| {
                    r < c.config.rsi_extreme_low || r > c.config.rsi_extreme_high
                })
            },
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Oscillator => 1.5,
                IndicatorFamily::Momentum => 0.8,
                _ => 1.0,
            },
        },
        // ============ Position state ============
        AdjustmentRule {
            name: "long_position",
            rationale: "holding long, bearish evidence is weighted toward exits",
            applies: |c| c.position.has_position && c.position.side == PositionSide::Long,
            multiplier: |_, s| if s < 0.0 { 1.2 } else { 1.0 },
        },
        AdjustmentRule {
            name: "short_position",
            rationale: "holding short, bullish evidence is weighted toward covering",
            applies: |c| c.position.has_position && c.position.side == PositionSide::Short,
            multiplier: |_, s| if s > 0.0 { 1.2 } else { 1.0 },
        },
        AdjustmentRule {
            name: "flat_in_bear_market",
            rationale: "new longs in a falling market need more evidence",
            applies: |c| !c.position.has_position && c.regime.is_bearish(),
            multiplier: |_, s| if s > 0.0 { 0.8 } else { 1.0 },
        },
        // ============ Market phase ============
        AdjustmentRule {
            name: "bear_phase",
            rationale: "follow the downtrend instead of catching bounces",
            applies: |c| c.regime.is_bearish(),
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Trend => 1.2,
                IndicatorFamily::Momentum => 1.1,
                IndicatorFamily::Oscillator => 0.8,
                _ => 1.0,
            },
        },
        AdjustmentRule {
            name: "bull_phase",
            rationale: "follow the uptrend; overbought readings persist",
            applies: |c| c.regime.is_bullish(),
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Trend => 1.2,
                IndicatorFamily::Oscillator => 0.9,
                _ => 1.0,
            },
        },
        AdjustmentRule {
            name: "sideways_phase",
            rationale: "ranges reward oscillators and levels over trend",
            applies: |c| c.regime == RegimeLabel::Sideways,
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Oscillator => 1.3,
                IndicatorFamily::Structure => 1.2,
                IndicatorFamily::Trend => 0.7,
                _ => 1.0,
            },
        },
        // ============ Historical performance ============
        AdjustmentRule {
            name: "poor_win_rate",
            rationale: "momentum entries have been losing on this symbol",
            applies: |c| {
                c.mature_history()
                    .map_or(false, |h| h.win_rate < c.config.poor_win_rate)
            },
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Momentum => 0.7,
                IndicatorFamily::Structure => 1.2,
                _ => 1.0,
            },
        },
        AdjustmentRule {
            name: "strong_win_rate",
            rationale: "trend and momentum have been paying on this symbol",
            applies: |c| {
                c.mature_history()
                    .map_or(false, |h| h.win_rate > c.config.strong_win_rate)
            },
            multiplier: |i, _| match i.family() {
                IndicatorFamily::Trend | IndicatorFamily::Momentum => 1.1,
                _ => 1.0,
            },
        },
        AdjustmentRule {
            name: "deep_drawdown",
            rationale: "after a deep drawdown, bullish evidence is discounted",
            applies: |c| {
                c.mature_history()
                    .map_or(false, |h| h.max_drawdown > c.config.deep_drawdown)
            },
            multiplier: |_, s| if s > 0.0 { 0.8 } else { 1.0 },
        },
        // ============ Sentiment / seasonal ============
        AdjustmentRule {
            name: "sentiment_extreme",
            rationale: "crowd sentiment matters when it is lopsided",
            applies: |c| {
                c.features
                    .get(Indicator::Sentiment)
                    .map_or(false, |s| s.abs() > 0.6)
            },
            multiplier: |i, _| if i == Indicator::Sentiment { 1.5 } else { 1.0 },
        },
        AdjustmentRule {
            name: "seasonal_window",
            rationale: "strong seasonal windows get extra weight",
            applies: |c| {
                c.features
                    .get(Indicator::Seasonality)
                    .map_or(false, |s| s.abs() > 0.5)
            },
            multiplier: |i, _| if i == Indicator::Seasonality { 1.3 } else { 1.0 },
        },
    ]
}

/// Names of the rules that fire for this context
pub fn active_rules<'r>(rules: &'r [AdjustmentRule], ctx: &AdjustmentContext) -> Vec<&'r AdjustmentRule> {
    rules.iter().filter(|r| (r.applies)(ctx)).collect()
}

/// Fold the active rules over a base weight, then clamp and floor it
pub fn adjusted_weight(
    base_weight: f64,
    indicator: Indicator,
    signal: f64,
    active: &[&AdjustmentRule],
    config: &RuleConfig,
) -> f64 {
    let combined = active
        .iter()
        .fold(base_weight, |w, rule| w * (rule.multiplier)(indicator, signal));
    let clamped = combined.clamp(-config.weight_clamp, config.weight_clamp);

    if clamped.abs() < config.weight_floor {
        if clamped < 0.0 || (clamped == 0.0 && base_weight < 0.0) {
            -config.weight_floor
        } else {
            config.weight_floor
        }
    } else {
        clamped
    }
}
