//! Core types used throughout FusionBot
//!
//! Defines the shared data structures for actions, positions, predictions,
//! allocations and per-symbol performance history.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading action emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Short,
    Cover,
}

impl Default for Action {
    fn default() -> Self {
        Action::Hold
    }
}

impl Action {
    /// Directional sign: +1 bullish, -1 bearish, 0 neutral
    pub fn direction(&self) -> i8 {
        match self {
            Action::Buy | Action::Cover => 1,
            Action::Sell | Action::Short => -1,
            Action::Hold => 0,
        }
    }

    /// True when the action closes an existing position
    pub fn is_exit(&self) -> bool {
        matches!(self, Action::Sell | Action::Cover)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
            Action::Short => write!(f, "SHORT"),
            Action::Cover => write!(f, "COVER"),
        }
    }
}

/// Side of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl Default for PositionSide {
    fn default() -> Self {
        PositionSide::Long
    }
}

impl PositionSide {
    /// Action that closes a position on this side
    pub fn exit_action(&self) -> Action {
        match self {
            PositionSide::Long => Action::Sell,
            PositionSide::Short => Action::Cover,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Position snapshot owned by the execution layer (read-only here)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PositionState {
    pub has_position: bool,
    pub side: PositionSide,
    pub entry_price: f64,
    pub current_price: f64,
    /// Periods held since entry
    pub hold_duration: u32,
    /// Best price since entry (highest for longs, lowest for shorts)
    pub peak_price: Option<f64>,
    /// Partial take-profit tiers already executed
    pub partial_exits_taken: u8,
}

impl PositionState {
    pub fn flat() -> Self {
        Self::default()
    }

    pub fn long(entry_price: f64, current_price: f64, hold_duration: u32) -> Self {
        Self {
            has_position: true,
            side: PositionSide::Long,
            entry_price,
            current_price,
            hold_duration,
            peak_price: None,
            partial_exits_taken: 0,
        }
    }

    pub fn short(entry_price: f64, current_price: f64, hold_duration: u32) -> Self {
        Self {
            side: PositionSide::Short,
            ..Self::long(entry_price, current_price, hold_duration)
        }
    }

    pub fn with_peak(mut self, peak_price: f64) -> Self {
        self.peak_price = Some(peak_price);
        self
    }

    fn side_pnl(&self, price: f64) -> f64 {
        if !self.has_position || self.entry_price <= 0.0 || !price.is_finite() {
            return 0.0;
        }
        match self.side {
            PositionSide::Long => (price - self.entry_price) / self.entry_price,
            PositionSide::Short => (self.entry_price - price) / self.entry_price,
        }
    }

    /// Unrealized P&L as a fraction of entry (side-aware)
    pub fn pnl_fraction(&self) -> f64 {
        self.side_pnl(self.current_price)
    }

    /// Best unrealized P&L seen since entry
    pub fn peak_pnl_fraction(&self) -> f64 {
        let peak = self.peak_price.map(|p| self.side_pnl(p)).unwrap_or(0.0);
        peak.max(self.pnl_fraction())
    }
}

/// Score/confidence pair produced by the rule engine and by each ensemble member
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SignalPrediction {
    /// Directional score in [-1, 1]
    pub score: f64,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl SignalPrediction {
    pub fn new(score: f64, confidence: f64) -> Self {
        Self {
            score: clamp_finite(score, -1.0, 1.0),
            confidence: clamp_finite(confidence, 0.0, 1.0),
        }
    }

    pub fn neutral() -> Self {
        Self::default()
    }
}

/// Output of position sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationDecision {
    /// Fraction of deployable capital in [min_allocation, max_allocation]
    pub position_fraction: f64,
    /// Risk adjustment multiplier in [0.1, 2.0]
    pub risk_adjustment_factor: f64,
    /// Half-Kelly fraction used
    pub kelly_fraction: f64,
    /// True when the VaR ceiling bound the fraction
    pub var_capped: bool,
}

/// Per-symbol realized performance, refreshed by the execution/backtest loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceHistory {
    pub win_rate: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub total_trades: usize,
    /// Downside-only risk-adjusted return, when enough trades exist
    #[serde(default)]
    pub sortino_ratio: Option<f64>,
    /// 95% historical VaR of per-trade returns (positive loss fraction)
    #[serde(default)]
    pub historical_var: Option<f64>,
    /// Expected loss beyond that VaR
    #[serde(default)]
    pub cvar: Option<f64>,
    /// Average winning return (fraction, positive)
    pub avg_win: Option<f64>,
    /// Average losing return (fraction, positive)
    pub avg_loss: Option<f64>,
    /// Directional hit rate of the ensemble
    pub ml_hit_rate: Option<f64>,
    /// Directional hit rate of the rule engine
    pub rule_hit_rate: Option<f64>,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self {
            win_rate: 0.5,
            sharpe_ratio: 0.0,
            max_drawdown: 0.0,
            total_trades: 0,
            sortino_ratio: None,
            historical_var: None,
            cvar: None,
            avg_win: None,
            avg_loss: None,
            ml_hit_rate: None,
            rule_hit_rate: None,
        }
    }
}

impl PerformanceHistory {
    pub fn new(win_rate: f64, sharpe_ratio: f64, max_drawdown: f64, total_trades: usize) -> Self {
        Self {
            win_rate: clamp_finite(win_rate, 0.0, 1.0),
            sharpe_ratio: if sharpe_ratio.is_finite() { sharpe_ratio } else { 0.0 },
            max_drawdown: clamp_finite(max_drawdown, 0.0, 1.0),
            total_trades,
            ..Default::default()
        }
    }

    /// True when enough trades exist to adapt on
    pub fn is_mature(&self, min_trades: usize) -> bool {
        self.total_trades >= min_trades
    }

    /// Realized reward:risk ratio if both legs are known
    pub fn reward_risk(&self) -> Option<f64> {
        match (self.avg_win, self.avg_loss) {
            (Some(w), Some(l)) if w > 0.0 && l > 0.0 => Some(w / l),
            _ => None,
        }
    }
}

/// Clamp; NaN maps to 0 clamped into range, infinities go to the nearest bound
pub fn clamp_finite(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() {
        lo.max(0.0_f64.min(hi))
    } else {
        value.clamp(lo, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pnl_is_side_aware() {
        let long = PositionState::long(100.0, 110.0, 3);
        assert!((long.pnl_fraction() - 0.10).abs() < 1e-12);

        let short = PositionState::short(100.0, 110.0, 3);
        assert!((short.pnl_fraction() + 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_clamp_finite_edges() {
        assert_eq!(clamp_finite(f64::NAN, 0.0, 1.0), 0.0);
        assert_eq!(clamp_finite(f64::NAN, 0.2, 1.0), 0.2);
        assert_eq!(clamp_finite(f64::NAN, -1.0, -0.5), -0.5);
        assert_eq!(clamp_finite(f64::INFINITY, 0.0, 1.0), 1.0);
        assert_eq!(clamp_finite(f64::NEG_INFINITY, 0.0, 1.0), 0.0);
    }

    #[test]
    fn test_flat_has_zero_pnl() {
        assert_eq!(PositionState::flat().pnl_fraction(), 0.0);
    }

    #[test]
    fn test_peak_pnl_never_below_current() {
        let pos = PositionState::long(100.0, 108.0, 3).with_peak(105.0);
        assert!((pos.peak_pnl_fraction() - 0.08).abs() < 1e-12);
    }

    #[test]
    fn test_signal_prediction_is_clamped() {
        let p = SignalPrediction::new(3.0, -1.0);
        assert_eq!(p.score, 1.0);
        assert_eq!(p.confidence, 0.0);

        let nan = SignalPrediction::new(f64::NAN, f64::NAN);
        assert_eq!(nan.score, 0.0);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_action_direction() {
        assert_eq!(Action::Buy.direction(), 1);
        assert_eq!(Action::Short.direction(), -1);
        assert_eq!(Action::Hold.direction(), 0);
        assert!(Action::Cover.is_exit());
    }
}
