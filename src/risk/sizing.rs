//! Position sizing
//!
//! base = min(max allocation, cash-implied max)
//!      × regime multiplier [0.5, 1.3]
//!      × half-Kelly [floor, cap]
//!      × risk adjustment [0.1, 2.0]
//! -> capped by the VaR ceiling (fraction × volatility × z <= var_limit)
//! -> × signal quality [0.5, 1.5]
//! -> clamped to [min_allocation, max_allocation]

use tracing::debug;

use super::kelly::compute_half_kelly;
use crate::config::SizingConfig;
use crate::features::{FeatureSnapshot, Indicator};
use crate::fusion::FusionDecision;
use crate::types::{AllocationDecision, PerformanceHistory};

/// Inputs visible to risk adjustment rules
#[derive(Debug, Clone, Copy)]
pub struct RiskContext {
    /// Trend seen from the decision's direction (positive = tailwind)
    pub trend: f64,
    pub volatility: f64,
    pub adding_to_position: bool,
}

/// One named risk adjustment multiplier
#[derive(Clone, Copy)]
pub struct RiskRule {
    pub name: &'static str,
    pub rationale: &'static str,
    pub applies: fn(&RiskContext) -> bool,
    pub factor: fn(&RiskContext) -> f64,
}

impl std::fmt::Debug for RiskRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskRule").field("name", &self.name).finish()
    }
}

/// Ordered risk adjustment rules
pub fn default_risk_rules() -> Vec<RiskRule> {
    vec![
        RiskRule {
            name: "trend_tailwind",
            rationale: "size up with the trend, at most +50%",
            applies: |c| c.trend > 0.0,
            factor: |c| 1.0 + (c.trend * 10.0).min(0.5),
        },
        RiskRule {
            name: "trend_headwind",
            rationale: "size down against the trend, at most -50%",
            applies: |c| c.trend < 0.0,
            factor: |c| 1.0 - (c.trend.abs() * 10.0).min(0.5),
        },
        RiskRule {
            name: "extreme_volatility",
            rationale: "volatility above 4% per period",
            applies: |c| c.volatility > 0.04,
            factor: |_| 0.6,
        },
        RiskRule {
            name: "high_volatility",
            rationale: "volatility between 3% and 4% per period",
            applies: |c| c.volatility > 0.03 && c.volatility <= 0.04,
            factor: |_| 0.8,
        },
        RiskRule {
            name: "calm_market",
            rationale: "volatility under 1% per period",
            applies: |c| c.volatility < 0.01,
            factor: |_| 1.2,
        },
        RiskRule {
            name: "adding_to_position",
            rationale: "scaling into an open position",
            applies: |c| c.adding_to_position,
            factor: |_| 0.7,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: SizingConfig,
    var_z: f64,
    risk_rules: Vec<RiskRule>,
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(SizingConfig::default())
    }
}

impl PositionSizer {
    pub fn new(config: SizingConfig) -> Self {
        let var_z = config.var_z();
        Self {
            config,
            var_z,
            risk_rules: default_risk_rules(),
        }
    }

    fn volatility(&self, features: &FeatureSnapshot) -> f64 {
        features
            .get(Indicator::Volatility20)
            .map(f64::abs)
            .filter(|v| *v > 0.0)
            .unwrap_or(self.config.default_volatility)
    }

    /// Trend as seen from the decision's direction (positive = tailwind)
    fn aligned_trend(decision: &FusionDecision, features: &FeatureSnapshot) -> f64 {
        let t = features.trend_direction().unwrap_or(0.0);
        if decision.action.direction() < 0 {
            -t
        } else {
            t
        }
    }

    /// Cash-implied maximum: zero when one unit cannot be afforded after the reserve
    fn cash_limit(&self, cash: f64, price: f64) -> f64 {
        if !(cash > 0.0) || !(price > 0.0) {
            return 0.0;
        }
        let deployable = cash * (1.0 - self.config.cash_reserve);
        if deployable < price {
            0.0
        } else {
            (deployable / cash).min(1.0)
        }
    }

    pub fn regime_multiplier(&self, decision: &FusionDecision, features: &FeatureSnapshot) -> f64 {
        let trend = Self::aligned_trend(decision, features);
        let volatility = self.volatility(features);
        let m = 1.0 + (trend * 10.0).clamp(-0.3, 0.3) - ((volatility - 0.02) * 5.0).clamp(-0.1, 0.3);
        m.clamp(self.config.regime_multiplier_min, self.config.regime_multiplier_max)
    }

    pub fn half_kelly(&self, features: &FeatureSnapshot, history: Option<&PerformanceHistory>) -> f64 {
        let c = &self.config;
        let (p, b) = match history.filter(|h| h.is_mature(c.min_trades_for_kelly)) {
            Some(h) => (h.win_rate, h.reward_risk().unwrap_or(c.default_reward_risk)),
            None => (c.default_win_rate, c.default_reward_risk),
        };
        compute_half_kelly(p, b, self.volatility(features), c.kelly_vol_scale, c.kelly_floor, c.kelly_cap)
            .f_bounded
    }

    pub fn risk_adjustment(
        &self,
        decision: &FusionDecision,
        features: &FeatureSnapshot,
        adding_to_position: bool,
    ) -> f64 {
        let ctx = RiskContext {
            trend: Self::aligned_trend(decision, features),
            volatility: self.volatility(features),
            adding_to_position,
        };
        let r = self
            .risk_rules
            .iter()
            .filter(|rule| (rule.applies)(&ctx))
            .fold(1.0_f64, |r, rule| r * (rule.factor)(&ctx));

        r.clamp(self.config.risk_adjustment_min, self.config.risk_adjustment_max)
    }

    pub fn quality_factor(
        &self,
        decision: &FusionDecision,
        features: &FeatureSnapshot,
        history: Option<&PerformanceHistory>,
    ) -> f64 {
        let trend_strength = features
            .trend_direction()
            .map(|t| (t.abs() / 0.05).min(1.0))
            .unwrap_or(0.0);
        let accuracy = history
            .filter(|h| h.is_mature(self.config.min_trades_for_kelly))
            .map(|h| h.win_rate)
            .unwrap_or(0.5);

        let q = 0.6 * decision.consistency + 0.2 * (1.0 + trend_strength) + 0.2 * (0.5 + accuracy);
        q.clamp(self.config.quality_min, self.config.quality_max)
    }

    /// Size a decision as a fraction of deployable capital
    pub fn size(
        &self,
        decision: &FusionDecision,
        cash: f64,
        price: f64,
        features: &FeatureSnapshot,
        history: Option<&PerformanceHistory>,
        adding_to_position: bool,
    ) -> AllocationDecision {
        let c = &self.config;

        let base = c.max_allocation.min(self.cash_limit(cash, price));
        let regime = self.regime_multiplier(decision, features);
        let kelly = self.half_kelly(features, history);
        let risk = self.risk_adjustment(decision, features, adding_to_position);

        let mut fraction = base * regime * kelly * risk;

        let volatility = self.volatility(features);
        let var_ceiling = c.var_limit / (volatility * self.var_z).max(f64::EPSILON);
        let var_capped = fraction > var_ceiling;
        if var_capped {
            fraction = var_ceiling;
        }

        fraction *= self.quality_factor(decision, features, history);

        let fraction = if fraction.is_finite() {
            fraction.clamp(c.min_allocation, c.max_allocation)
        } else {
            c.min_allocation
        };

        debug!(
            "sizing base={:.3} regime={:.2} kelly={:.3} risk={:.2} var_capped={} -> {:.4}",
            base, regime, kelly, risk, var_capped, fraction
        );

        AllocationDecision {
            position_fraction: fraction,
            risk_adjustment_factor: risk,
            kelly_fraction: kelly,
            var_capped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::RegimeLabel;
    use crate::types::Action;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn decision(action: Action, consistency: f64) -> FusionDecision {
        FusionDecision {
            action,
            consistency,
            confidence: 0.7,
            score: 0.5,
            ..FusionDecision::hold(RegimeLabel::WeakBull)
        }
    }

    #[test]
    fn test_fraction_always_within_envelope() {
        let sizer = PositionSizer::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let f = FeatureSnapshot::new()
                .with(Indicator::Volatility20, rng.gen_range(0.0..2.0))
                .with(Indicator::Trend20, rng.gen_range(-1.0..1.0));
            let mut h = PerformanceHistory::new(rng.gen_range(0.0..1.0), 0.0, 0.1, 100);
            h.avg_win = Some(rng.gen_range(0.001..1.0));
            h.avg_loss = Some(rng.gen_range(0.001..1.0));
            let cash = rng.gen_range(-100.0..1e6);
            let a = sizer.size(
                &decision(Action::Buy, rng.gen_range(0.5..1.4)),
                cash,
                rng.gen_range(0.01..1000.0),
                &f,
                Some(&h),
                rng.gen_bool(0.5),
            );
            assert!(a.position_fraction >= 0.01 && a.position_fraction <= 0.25);
            assert!(a.risk_adjustment_factor >= 0.1 && a.risk_adjustment_factor <= 2.0);
            assert!(a.kelly_fraction >= 0.1 && a.kelly_fraction <= 0.5);
        }
    }

    #[test]
    fn test_unaffordable_trade_gets_minimum() {
        let a = PositionSizer::default().size(
            &decision(Action::Buy, 1.0),
            50.0,
            100.0,
            &FeatureSnapshot::new(),
            None,
            false,
        );
        assert_eq!(a.position_fraction, 0.01);
    }

    #[test]
    fn test_var_ceiling_binds_in_high_volatility() {
        let mut config = SizingConfig::default();
        config.kelly_floor = 0.5;
        config.kelly_cap = 0.5;
        config.min_allocation = 0.0;
        let sizer = PositionSizer::new(config);
        let f = FeatureSnapshot::new()
            .with(Indicator::Volatility20, 0.2)
            .with(Indicator::Trend20, 0.05);
        let a = sizer.size(&decision(Action::Buy, 1.0), 10_000.0, 10.0, &f, None, false);
        assert!(a.var_capped);
        // 0.02 / (0.2 * 2) = 0.05 before the quality factor
        assert!(a.position_fraction <= 0.05 * 1.5 + 1e-6);
    }

    #[test]
    fn test_risk_rules_compose() {
        let sizer = PositionSizer::default();
        let f = FeatureSnapshot::new()
            .with(Indicator::Volatility20, 0.035)
            .with(Indicator::Trend20, 0.02);
        let fresh = sizer.risk_adjustment(&decision(Action::Buy, 1.0), &f, false);
        let adding = sizer.risk_adjustment(&decision(Action::Buy, 1.0), &f, true);
        // tailwind 1.2 x high volatility 0.8
        assert!((fresh - 1.2 * 0.8).abs() < 1e-12, "fresh {}", fresh);
        assert!((adding - fresh * 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_bounds_do_not_panic() {
        let mut config = crate::config::EngineConfig::default();
        config.sizing.quality_min = 1.6;
        config.sizing.regime_multiplier_min = 2.0;
        config.sizing.regime_multiplier_max = 0.4;
        config.sizing.risk_adjustment_max = f64::NAN;
        let sizing = config.validated().sizing;
        assert!(sizing.quality_min <= sizing.quality_max);
        assert!(sizing.regime_multiplier_min <= sizing.regime_multiplier_max);
        assert_eq!(sizing.risk_adjustment_max, 2.0);

        let sizer = PositionSizer::new(sizing);
        let f = FeatureSnapshot::new()
            .with(Indicator::Volatility20, 0.02)
            .with(Indicator::Trend20, 0.01);
        let a = sizer.size(&decision(Action::Buy, 1.0), 10_000.0, 10.0, &f, None, false);
        assert!(a.position_fraction >= 0.01 && a.position_fraction <= 0.25);
    }

    #[test]
    fn test_short_sizing_uses_inverted_trend() {
        let sizer = PositionSizer::default();
        let down = FeatureSnapshot::new().with(Indicator::Trend20, -0.03);
        let short = sizer.risk_adjustment(&decision(Action::Short, 1.0), &down, false);
        let long = sizer.risk_adjustment(&decision(Action::Buy, 1.0), &down, false);
        assert!(short > long);
    }
}
