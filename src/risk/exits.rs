//! Stop-loss / take-profit state machine
//!
//! States: Flat -> {Long, Short} -> {StopLossTriggered, TakeProfitTriggered,
//! TimeExitTriggered} -> Flat.
//!
//! While positioned, every exit layer is evaluated each cycle and the most severe
//! trigger wins:
//! - Emergency stop (hard floor)
//! - Dynamic percentage stop (volatility / hold / trend / P&L adjusted)
//! - Distance stop from a volatility-range measure
//! - Support breach (resistance breach for shorts)
//! - Maximum hold duration (shortened in an adverse trend)
//! - Take-profit target, trailing stop, partial-profit tiers

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::config::ExitConfig;
use crate::features::{FeatureSnapshot, Indicator};
use crate::types::{Action, PositionSide, PositionState};

/// Position lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitState {
    Flat,
    Long,
    Short,
    StopLossTriggered,
    TakeProfitTriggered,
    TimeExitTriggered,
}

impl ExitState {
    pub fn from_position(position: &PositionState) -> Self {
        if !position.has_position {
            return ExitState::Flat;
        }
        match position.side {
            PositionSide::Long => ExitState::Long,
            PositionSide::Short => ExitState::Short,
        }
    }

    /// Transition on a triggered layer; only positioned states can trigger
    pub fn on_trigger(self, layer: ExitLayer) -> Self {
        match self {
            ExitState::Long | ExitState::Short => layer.kind().into(),
            other => other,
        }
    }

    /// Transition once the exit order has been filled
    pub fn on_fill(self, remaining_position: bool, side: PositionSide) -> Self {
        match self {
            ExitState::StopLossTriggered
            | ExitState::TakeProfitTriggered
            | ExitState::TimeExitTriggered => {
                if remaining_position {
                    match side {
                        PositionSide::Long => ExitState::Long,
                        PositionSide::Short => ExitState::Short,
                    }
                } else {
                    ExitState::Flat
                }
            }
            other => other,
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(
            self,
            ExitState::StopLossTriggered
                | ExitState::TakeProfitTriggered
                | ExitState::TimeExitTriggered
        )
    }
}

/// Broad class of an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitKind {
    StopLoss,
    TakeProfit,
    Time,
}

impl From<ExitKind> for ExitState {
    fn from(kind: ExitKind) -> Self {
        match kind {
            ExitKind::StopLoss => ExitState::StopLossTriggered,
            ExitKind::TakeProfit => ExitState::TakeProfitTriggered,
            ExitKind::Time => ExitState::TimeExitTriggered,
        }
    }
}

/// Exit layer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitLayer {
    EmergencyStop,
    DynamicStop,
    DistanceStop,
    SupportBreach,
    MaxHold,
    TakeProfit,
    TrailingStop,
    PartialProfit { tier: u8 },
}

impl ExitLayer {
    pub fn kind(&self) -> ExitKind {
        match self {
            ExitLayer::EmergencyStop
            | ExitLayer::DynamicStop
            | ExitLayer::DistanceStop
            | ExitLayer::SupportBreach => ExitKind::StopLoss,
            ExitLayer::MaxHold => ExitKind::Time,
            ExitLayer::TakeProfit | ExitLayer::TrailingStop | ExitLayer::PartialProfit { .. } => {
                ExitKind::TakeProfit
            }
        }
    }
}

impl fmt::Display for ExitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitLayer::EmergencyStop => write!(f, "EMERGENCY_STOP"),
            ExitLayer::DynamicStop => write!(f, "DYNAMIC_STOP"),
            ExitLayer::DistanceStop => write!(f, "DISTANCE_STOP"),
            ExitLayer::SupportBreach => write!(f, "SUPPORT_BREACH"),
            ExitLayer::MaxHold => write!(f, "MAX_HOLD"),
            ExitLayer::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitLayer::TrailingStop => write!(f, "TRAILING_STOP"),
            ExitLayer::PartialProfit { tier } => write!(f, "PARTIAL_PROFIT_{}", tier + 1),
        }
    }
}

/// Severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A triggered exit, published for logging/alerting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub layer: ExitLayer,
    pub severity: Severity,
    /// In [0.85, 0.99]
    pub confidence: f64,
    /// Sell for longs, cover for shorts
    pub action: Action,
    /// Fraction of the position to close (1.0 = all)
    pub close_fraction: f64,
    pub pnl: f64,
    /// Threshold the P&L (or hold time) crossed
    pub threshold: f64,
}

/// Result of evaluating all layers for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitAssessment {
    pub state: ExitState,
    /// Most severe trigger, if any
    pub trigger: Option<ExitEvent>,
    /// Every layer that fired this cycle
    pub fired: Vec<ExitEvent>,
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Inputs visible to stop-loss rules
#[derive(Debug, Clone, Copy)]
pub struct StopContext<'a> {
    pub volatility: f64,
    /// Hold duration as a share of the hold limit, in [0, 1]
    pub hold_pressure: f64,
    /// Trend seen from the position (positive = in our favor)
    pub trend: f64,
    pub pnl: f64,
    pub config: &'a ExitConfig,
}

/// One named multiplier on the base stop-loss
#[derive(Clone, Copy)]
pub struct StopRule {
    pub name: &'static str,
    pub rationale: &'static str,
    pub applies: fn(&StopContext) -> bool,
    pub factor: fn(&StopContext) -> f64,
}

impl fmt::Debug for StopRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopRule").field("name", &self.name).finish()
    }
}

/// Ordered stop-loss rules; a factor above 1 widens the stop
pub fn default_stop_rules() -> Vec<StopRule> {
    vec![
        StopRule {
            name: "volatility_widening",
            rationale: "noise needs room",
            applies: |c| c.volatility > 0.0,
            factor: |c| 1.0 + c.volatility * c.config.volatility_stop_sensitivity,
        },
        StopRule {
            name: "long_hold",
            rationale: "stale positions get less room",
            applies: |c| c.hold_pressure > 0.0,
            factor: |c| 1.0 - 0.25 * c.hold_pressure,
        },
        StopRule {
            name: "adverse_trend",
            rationale: "the trend runs against the position",
            applies: |c| c.trend < c.config.bear_trend,
            factor: |_| 0.8,
        },
        StopRule {
            name: "favorable_trend",
            rationale: "the trend carries the position",
            applies: |c| c.trend > -c.config.bear_trend,
            factor: |_| 1.1,
        },
        StopRule {
            name: "profit_lock",
            rationale: "past the take-profit level, keep most of the gain",
            applies: |c| c.pnl > c.config.base_take_profit,
            factor: |_| 0.6,
        },
        StopRule {
            name: "profit_protect",
            rationale: "any open profit tightens the stop",
            applies: |c| c.pnl > 0.0 && c.pnl <= c.config.base_take_profit,
            factor: |_| 0.85,
        },
    ]
}

#[derive(Debug, Clone)]
pub struct ExitMonitor {
    config: ExitConfig,
    stop_rules: Vec<StopRule>,
}

impl Default for ExitMonitor {
    fn default() -> Self {
        Self::new(ExitConfig::default())
    }
}

impl ExitMonitor {
    pub fn new(config: ExitConfig) -> Self {
        Self {
            config,
            stop_rules: default_stop_rules(),
        }
    }

    /// Signed trend seen from the position: positive = trend in our favor
    fn favorable_trend(position: &PositionState, features: &FeatureSnapshot) -> f64 {
        let t = features.trend_direction().unwrap_or(0.0);
        match position.side {
            PositionSide::Long => t,
            PositionSide::Short => -t,
        }
    }

    fn hold_pressure(&self, position: &PositionState) -> f64 {
        if self.config.max_hold_periods == 0 {
            return 1.0;
        }
        (position.hold_duration as f64 / self.config.max_hold_periods as f64).min(1.0)
    }

    /// Dynamic stop-loss threshold, always in [stop_loss_floor, stop_loss_ceiling]
    pub fn dynamic_stop_loss(&self, position: &PositionState, features: &FeatureSnapshot) -> f64 {
        let c = &self.config;
        let ctx = StopContext {
            volatility: features
                .get(Indicator::Volatility20)
                .map(f64::abs)
                .unwrap_or(0.0),
            hold_pressure: self.hold_pressure(position),
            trend: Self::favorable_trend(position, features),
            pnl: position.pnl_fraction(),
            config: c,
        };
        let stop = self
            .stop_rules
            .iter()
            .filter(|r| (r.applies)(&ctx))
            .fold(c.base_stop_loss, |stop, r| stop * (r.factor)(&ctx));

        stop.max(c.stop_loss_floor).min(c.stop_loss_ceiling).min(0.0)
    }

    /// Distance-stop threshold from the volatility-range measure
    pub fn distance_stop(&self, features: &FeatureSnapshot) -> Option<f64> {
        let c = &self.config;
        let range = features.volatility_range()?.abs();
        let volatility = features
            .get(Indicator::Volatility20)
            .map(f64::abs)
            .unwrap_or(range);

        let multiplier = if volatility <= c.calm_volatility {
            c.distance_multiplier_calm
        } else if volatility >= c.wild_volatility {
            c.distance_multiplier_wild
        } else {
            let t = (volatility - c.calm_volatility) / (c.wild_volatility - c.calm_volatility);
            c.distance_multiplier_calm + t * (c.distance_multiplier_wild - c.distance_multiplier_calm)
        };

        let distance = (range * multiplier).max(c.stop_loss_ceiling.abs());
        Some(-distance.min(c.stop_loss_floor.abs()))
    }

    /// Take-profit target in [take_profit_min, take_profit_max]
    pub fn take_profit_target(&self, position: &PositionState, features: &FeatureSnapshot) -> f64 {
        let c = &self.config;
        let volatility = features
            .get(Indicator::Volatility20)
            .map(f64::abs)
            .unwrap_or(0.0);

        let mut target = c.base_take_profit * (1.0 + volatility * c.volatility_stop_sensitivity);
        let trend = Self::favorable_trend(position, features);
        if trend > -c.bear_trend {
            target *= 1.2;
        } else if trend < c.bear_trend {
            target *= 0.8;
        }
        target *= 1.0 - 0.1 * self.hold_pressure(position);

        target.clamp(c.take_profit_min, c.take_profit_max)
    }

    /// Hold limit in periods, shortened when the trend runs against the position
    pub fn max_hold(&self, position: &PositionState, features: &FeatureSnapshot) -> f64 {
        let c = &self.config;
        let limit = c.max_hold_periods as f64;
        if Self::favorable_trend(position, features) < c.bear_trend {
            limit * (1.0 - c.bear_hold_reduction)
        } else {
            limit
        }
    }

    /// Share of peak profit the trailing stop protects
    pub fn trailing_protection(&self, peak_pnl: f64) -> f64 {
        let c = &self.config;
        (c.trailing_base_protect + (peak_pnl - c.trailing_activation).max(0.0) * 4.0)
            .min(c.trailing_max_protect)
    }

    /// Evaluate every layer for the current cycle
    pub fn evaluate(&self, position: &PositionState, features: &FeatureSnapshot) -> ExitAssessment {
        let state = ExitState::from_position(position);
        let stop_loss = self.dynamic_stop_loss(position, features);
        let take_profit = self.take_profit_target(position, features);

        if !position.has_position || position.entry_price <= 0.0 {
            return ExitAssessment {
                state,
                trigger: None,
                fired: Vec::new(),
                stop_loss,
                take_profit,
            };
        }

        let c = &self.config;
        let pnl = position.pnl_fraction();
        let exit = position.side.exit_action();
        let event = |layer, severity, confidence: f64, close_fraction, threshold| ExitEvent {
            layer,
            severity,
            confidence: confidence.clamp(0.85, 0.99),
            action: exit,
            close_fraction,
            pnl,
            threshold,
        };
        let mut fired = Vec::new();

        // ============ Stop layers ============

        if pnl <= c.emergency_stop {
            fired.push(event(ExitLayer::EmergencyStop, Severity::Critical, 0.99, 1.0, c.emergency_stop));
        }

        if pnl <= stop_loss {
            let excess = (stop_loss - pnl) / stop_loss.abs().max(f64::EPSILON);
            let confidence = 0.85 + excess.min(1.0) * 0.14;
            fired.push(event(ExitLayer::DynamicStop, Severity::High, confidence, 1.0, stop_loss));
        }

        if let Some(distance) = self.distance_stop(features) {
            if pnl <= distance {
                fired.push(event(ExitLayer::DistanceStop, Severity::High, 0.88, 1.0, distance));
            }
        }

        let breach = match position.side {
            PositionSide::Long => features
                .get(Indicator::SupportLevel)
                .filter(|s| *s > 0.0 && position.current_price < s * (1.0 - c.support_breach)),
            PositionSide::Short => features
                .get(Indicator::ResistanceLevel)
                .filter(|r| *r > 0.0 && position.current_price > r * (1.0 + c.support_breach)),
        };
        if let Some(level) = breach {
            fired.push(event(ExitLayer::SupportBreach, Severity::High, 0.9, 1.0, level));
        }

        // ============ Time layer ============

        let hold_limit = self.max_hold(position, features);
        if c.max_hold_periods > 0 && position.hold_duration as f64 >= hold_limit {
            fired.push(event(ExitLayer::MaxHold, Severity::Medium, 0.85, 1.0, hold_limit));
        }

        // ============ Profit layers ============

        if pnl >= take_profit {
            fired.push(event(ExitLayer::TakeProfit, Severity::Medium, 0.9, 1.0, take_profit));
        }

        let peak = position.peak_pnl_fraction();
        if peak >= c.trailing_activation {
            let floor = peak * self.trailing_protection(peak);
            if pnl <= floor {
                fired.push(event(ExitLayer::TrailingStop, Severity::Medium, 0.92, 1.0, floor));
            }
        }

        let next_tier = position.partial_exits_taken as usize;
        if let Some(tier) = c.partial_tiers.get(next_tier) {
            if pnl >= tier.profit {
                fired.push(event(
                    ExitLayer::PartialProfit {
                        tier: next_tier as u8,
                    },
                    Severity::Low,
                    0.85,
                    tier.close_fraction.clamp(0.0, 1.0),
                    tier.profit,
                ));
            }
        }

        let trigger = fired
            .iter()
            .max_by(|a, b| {
                a.severity
                    .cmp(&b.severity)
                    .then(a.confidence.total_cmp(&b.confidence))
                    .then(a.close_fraction.total_cmp(&b.close_fraction))
            })
            .cloned();

        let state = match &trigger {
            Some(t) => {
                info!(
                    "🛑 {} triggered: pnl={:.2}% threshold={:.4} conf={:.2} close={:.0}%",
                    t.layer,
                    t.pnl * 100.0,
                    t.threshold,
                    t.confidence,
                    t.close_fraction * 100.0
                );
                state.on_trigger(t.layer)
            }
            None => state,
        };

        ExitAssessment {
            state,
            trigger,
            fired,
            stop_loss,
            take_profit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> ExitMonitor {
        ExitMonitor::default()
    }

    #[test]
    fn test_flat_position_never_triggers() {
        let a = monitor().evaluate(&PositionState::flat(), &FeatureSnapshot::new());
        assert_eq!(a.state, ExitState::Flat);
        assert!(a.trigger.is_none());
    }

    #[test]
    fn test_deep_loss_hits_emergency_stop() {
        let position = PositionState::long(100.0, 80.0, 5);
        let a = monitor().evaluate(&position, &FeatureSnapshot::new());
        let t = a.trigger.unwrap();
        assert_eq!(t.layer, ExitLayer::EmergencyStop);
        assert_eq!(t.action, Action::Sell);
        assert!(t.confidence >= 0.95);
        assert_eq!(a.state, ExitState::StopLossTriggered);
    }

    #[test]
    fn test_short_exit_covers() {
        let position = PositionState::short(100.0, 120.0, 2);
        let t = monitor()
            .evaluate(&position, &FeatureSnapshot::new())
            .trigger
            .unwrap();
        assert_eq!(t.action, Action::Cover);
    }

    #[test]
    fn test_stop_is_bounded_and_non_positive() {
        let m = monitor();
        for vol in [0.0, 0.01, 0.05, 0.5, 5.0] {
            let f = FeatureSnapshot::new().with(Indicator::Volatility20, vol);
            let stop = m.dynamic_stop_loss(&PositionState::long(100.0, 100.0, 0), &f);
            assert!(stop <= 0.0);
            assert!((-0.25..=-0.03).contains(&stop), "vol {} -> {}", vol, stop);
        }
    }

    #[test]
    fn test_volatility_widens_stop() {
        let m = monitor();
        let position = PositionState::long(100.0, 99.0, 3);
        let calm = FeatureSnapshot::new().with(Indicator::Volatility20, 0.01);
        let wild = FeatureSnapshot::new().with(Indicator::Volatility20, 0.03);
        assert!(m.dynamic_stop_loss(&position, &wild) < m.dynamic_stop_loss(&position, &calm));
    }

    #[test]
    fn test_open_profit_tightens_stop() {
        let m = monitor();
        let f = FeatureSnapshot::new().with(Indicator::Volatility20, 0.01);
        let flat = m.dynamic_stop_loss(&PositionState::long(100.0, 100.0, 0), &f);
        let small = m.dynamic_stop_loss(&PositionState::long(100.0, 103.0, 0), &f);
        let large = m.dynamic_stop_loss(&PositionState::long(100.0, 110.0, 0), &f);
        assert!((small - flat * 0.85).abs() < 1e-12, "small {}", small);
        assert!((large - flat * 0.6).abs() < 1e-12, "large {}", large);
    }

    #[test]
    fn test_trend_rules_are_exclusive() {
        let config = ExitConfig::default();
        let ctx = |trend| StopContext {
            volatility: 0.0,
            hold_pressure: 0.0,
            trend,
            pnl: 0.0,
            config: &config,
        };
        let fired = |trend: f64| -> Vec<&'static str> {
            default_stop_rules()
                .into_iter()
                .filter(|r| (r.applies)(&ctx(trend)))
                .map(|r| r.name)
                .collect()
        };
        assert_eq!(fired(-0.03), vec!["adverse_trend"]);
        assert_eq!(fired(0.03), vec!["favorable_trend"]);
        assert!(fired(0.0).is_empty());
    }

    #[test]
    fn test_max_hold_shortened_in_bear_trend() {
        let m = monitor();
        let position = PositionState::long(100.0, 100.5, 36);
        let neutral = FeatureSnapshot::new();
        let bear = FeatureSnapshot::new().with(Indicator::Trend20, -0.03);
        assert!(m.evaluate(&position, &neutral).trigger.is_none());

        let a = m.evaluate(&position, &bear);
        assert_eq!(a.trigger.unwrap().layer, ExitLayer::MaxHold);
        assert_eq!(a.state, ExitState::TimeExitTriggered);
    }

    #[test]
    fn test_support_breach() {
        let f = FeatureSnapshot::new().with(Indicator::SupportLevel, 100.0);
        let position = PositionState::long(97.0, 94.0, 1);
        let a = monitor().evaluate(&position, &f);
        assert!(a.fired.iter().any(|e| e.layer == ExitLayer::SupportBreach));
    }

    #[test]
    fn test_trailing_stop_after_giveback() {
        // Peak +8%, now +2%: protection 0.5 + 0.05*4 = 0.7 -> floor 5.6%
        let position = PositionState::long(100.0, 102.0, 4).with_peak(108.0);
        let a = monitor().evaluate(&position, &FeatureSnapshot::new());
        assert_eq!(a.trigger.unwrap().layer, ExitLayer::TrailingStop);
    }

    #[test]
    fn test_partial_tiers_advance() {
        let m = monitor();
        let mut position = PositionState::long(100.0, 105.5, 2);
        let first = m.evaluate(&position, &FeatureSnapshot::new());
        let t = first.trigger.unwrap();
        assert_eq!(t.layer, ExitLayer::PartialProfit { tier: 0 });
        assert_eq!(t.close_fraction, 0.25);

        position.partial_exits_taken = 1;
        let second = m.evaluate(&position, &FeatureSnapshot::new());
        assert!(second.trigger.is_none());
    }

    #[test]
    fn test_state_transitions() {
        let s = ExitState::Long.on_trigger(ExitLayer::TakeProfit);
        assert_eq!(s, ExitState::TakeProfitTriggered);
        assert_eq!(s.on_fill(false, PositionSide::Long), ExitState::Flat);
        assert_eq!(s.on_fill(true, PositionSide::Long), ExitState::Long);
        assert_eq!(ExitState::Flat.on_trigger(ExitLayer::DynamicStop), ExitState::Flat);
    }
}
