//! Configuration management for FusionBot
//!
//! Loads from optional YAML/TOML files + environment variables via .env.
//! Every section falls back to its `Default`, so an empty source set is valid.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::regime::thresholds::{default_rows, RegimeThresholds};
use crate::regime::RegimeLabel;
use crate::risk::stats;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub regime: RegimeConfig,
    pub rules: RuleConfig,
    pub ensemble: EnsembleConfig,
    pub fusion: FusionConfig,
    pub sizing: SizingConfig,
    pub exits: ExitConfig,
    /// Regime label -> threshold row
    pub thresholds: BTreeMap<String, RegimeThresholds>,
    pub runtime: RuntimeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            regime: RegimeConfig::default(),
            rules: RuleConfig::default(),
            ensemble: EnsembleConfig::default(),
            fusion: FusionConfig::default(),
            sizing: SizingConfig::default(),
            exits: ExitConfig::default(),
            thresholds: default_rows(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Sub-score weights (trend, volatility, RSI extremity, momentum, volume)
    pub trend_weight: f64,
    pub volatility_weight: f64,
    pub rsi_weight: f64,
    pub momentum_weight: f64,
    pub volume_weight: f64,
    /// |trend| that maps to a full trend sub-score
    pub trend_full_scale: f64,
    /// Volatility that maps to a full volatility sub-score
    pub volatility_full_scale: f64,
    /// Below this volatility the sub-score turns negative
    pub calm_volatility: f64,
    pub momentum_full_scale: f64,
    /// Trend below this is a downtrend (e.g. -0.005 = -0.5%)
    pub bear_trend: f64,
    pub bear_momentum: f64,
    /// |trend| above this qualifies for the strong regimes
    pub strong_trend: f64,
    pub strong_composite: f64,
    pub extreme_rsi_low: f64,
    pub extreme_rsi_high: f64,
    pub sideways_composite: f64,
    pub bull_momentum: f64,
    pub bull_volume_ratio: f64,
    pub bull_trend: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_weight: 0.40,
            volatility_weight: 0.25,
            rsi_weight: 0.15,
            momentum_weight: 0.10,
            volume_weight: 0.10,
            trend_full_scale: 0.05,
            volatility_full_scale: 0.05,
            calm_volatility: 0.005,
            momentum_full_scale: 0.05,
            bear_trend: -0.005,
            bear_momentum: -0.005,
            strong_trend: 0.03,
            strong_composite: 0.6,
            extreme_rsi_low: 20.0,
            extreme_rsi_high: 80.0,
            sideways_composite: 0.5,
            bull_momentum: 0.02,
            bull_volume_ratio: 1.2,
            bull_trend: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Volatility above this halves trend weights
    pub high_volatility: f64,
    pub low_volatility: f64,
    /// Volatility above this triggers the harshest timing penalty
    pub extreme_volatility: f64,
    pub rsi_extreme_low: f64,
    pub rsi_extreme_high: f64,
    /// Trades required before performance-based adjustments apply
    pub min_trades_for_adaptation: usize,
    pub poor_win_rate: f64,
    pub strong_win_rate: f64,
    pub deep_drawdown: f64,
    /// Combined weights are clamped to [-weight_clamp, weight_clamp]
    pub weight_clamp: f64,
    /// |weight| below this is floored to ±weight_floor
    pub weight_floor: f64,
    pub min_consistency_families: usize,
    /// Consistency ratio used when too few families are present
    pub insufficient_consistency: f64,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            high_volatility: 0.03,
            low_volatility: 0.01,
            extreme_volatility: 0.06,
            rsi_extreme_low: 25.0,
            rsi_extreme_high: 75.0,
            min_trades_for_adaptation: 10,
            poor_win_rate: 0.40,
            strong_win_rate: 0.60,
            deep_drawdown: 0.20,
            weight_clamp: 2.0,
            weight_floor: 0.001,
            min_consistency_families: 3,
            insufficient_consistency: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Members deviating more than this many std devs are dropped
    pub outlier_sigma: f64,
    /// Absolute floor on the leave-one-out std dev used for outlier tests
    pub outlier_std_floor: f64,
    /// Floor on that std dev as a share of the other members' mean |score|
    pub outlier_relative_floor: f64,
    /// Outlier filtering never leaves fewer members than this
    pub min_members: usize,
    /// Nominal ensemble size (used for the coverage part of quality)
    pub expected_members: usize,
    pub tight_spread: f64,
    pub wide_spread: f64,
    pub consensus_spread: f64,
    pub moderate_spread_low: f64,
    pub moderate_spread_high: f64,
    pub extreme_spread: f64,
    /// |score| at or above this is upweighted
    pub strong_score: f64,
    /// |score| below this is downweighted
    pub weak_score: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            outlier_sigma: 2.5,
            outlier_std_floor: 0.01,
            outlier_relative_floor: 0.5,
            min_members: 2,
            expected_members: 4,
            tight_spread: 0.10,
            wide_spread: 0.40,
            consensus_spread: 0.02,
            moderate_spread_low: 0.05,
            moderate_spread_high: 0.25,
            extreme_spread: 0.50,
            strong_score: 0.6,
            weak_score: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Starting ML share of the ML:rule split
    pub base_ml_weight: f64,
    pub low_quality: f64,
    pub medium_quality: f64,
    pub high_quality: f64,
    /// Confidence gap beyond which the more confident side is favored
    pub confidence_gap: f64,
    /// |score| below this has no direction
    pub direction_deadband: f64,
    pub min_trades: usize,
    pub poor_win_rate: f64,
    pub strong_win_rate: f64,
    pub deep_drawdown: f64,
    /// Hit-rate edge that marks one source as historically more reliable
    pub reliability_edge: f64,
    /// trend_20 magnitude for a confirmed strong trend
    pub confirm_trend: f64,
    /// Minimum same-sign magnitude for trend_5 / trend_50 to confirm
    pub confirm_alignment: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            base_ml_weight: 0.5,
            low_quality: 0.3,
            medium_quality: 0.5,
            high_quality: 0.8,
            confidence_gap: 0.2,
            direction_deadband: 0.05,
            min_trades: 10,
            poor_win_rate: 0.45,
            strong_win_rate: 0.60,
            deep_drawdown: 0.25,
            reliability_edge: 0.05,
            confirm_trend: 0.02,
            confirm_alignment: 0.005,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub max_allocation: f64,
    pub min_allocation: f64,
    /// Share of cash never deployed
    pub cash_reserve: f64,
    pub kelly_floor: f64,
    pub kelly_cap: f64,
    /// Volatility at which the Kelly discount reaches 100% (capped at 50%)
    pub kelly_vol_scale: f64,
    pub min_trades_for_kelly: usize,
    pub default_win_rate: f64,
    pub default_reward_risk: f64,
    /// Max loss at VaR as fraction of capital
    pub var_limit: f64,
    /// One-sided confidence of the parametric VaR ceiling (0.97725 is z = 2)
    pub var_confidence: f64,
    /// Volatility assumed when the snapshot has none
    pub default_volatility: f64,
    pub regime_multiplier_min: f64,
    pub regime_multiplier_max: f64,
    pub risk_adjustment_min: f64,
    pub risk_adjustment_max: f64,
    pub quality_min: f64,
    pub quality_max: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            max_allocation: 0.25,
            min_allocation: 0.01,
            cash_reserve: 0.05,
            kelly_floor: 0.1,
            kelly_cap: 0.5,
            kelly_vol_scale: 0.1,
            min_trades_for_kelly: 20,
            default_win_rate: 0.5,
            default_reward_risk: 1.5,
            var_limit: 0.02,
            var_confidence: 0.977_249_868,
            default_volatility: 0.02,
            regime_multiplier_min: 0.5,
            regime_multiplier_max: 1.3,
            risk_adjustment_min: 0.1,
            risk_adjustment_max: 2.0,
            quality_min: 0.5,
            quality_max: 1.5,
        }
    }
}

impl SizingConfig {
    /// z of `var_confidence`; 2.0 if the confidence is degenerate
    pub fn var_z(&self) -> f64 {
        stats::z_score(self.var_confidence).unwrap_or(2.0)
    }
}

/// Partial take-profit tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartialTier {
    /// Unrealized profit that arms the tier
    pub profit: f64,
    /// Fraction of the position to close
    pub close_fraction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    /// Base dynamic stop (negative P&L fraction)
    pub base_stop_loss: f64,
    /// Widest allowed stop (most negative)
    pub stop_loss_floor: f64,
    /// Tightest allowed stop
    pub stop_loss_ceiling: f64,
    /// Stop widening per unit of volatility
    pub volatility_stop_sensitivity: f64,
    /// Hard stop independent of every adjustment
    pub emergency_stop: f64,
    pub distance_multiplier_calm: f64,
    pub distance_multiplier_wild: f64,
    pub calm_volatility: f64,
    pub wild_volatility: f64,
    /// Breach distance below support (above resistance for shorts)
    pub support_breach: f64,
    pub max_hold_periods: u32,
    /// Hold limit reduction in a bear trend
    pub bear_hold_reduction: f64,
    pub bear_trend: f64,
    pub base_take_profit: f64,
    pub take_profit_min: f64,
    pub take_profit_max: f64,
    pub trailing_activation: f64,
    pub trailing_base_protect: f64,
    pub trailing_max_protect: f64,
    pub partial_tiers: Vec<PartialTier>,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            base_stop_loss: -0.08,
            stop_loss_floor: -0.25,
            stop_loss_ceiling: -0.03,
            volatility_stop_sensitivity: 10.0,
            emergency_stop: -0.15,
            distance_multiplier_calm: 1.5,
            distance_multiplier_wild: 2.0,
            calm_volatility: 0.02,
            wild_volatility: 0.04,
            support_breach: 0.05,
            max_hold_periods: 48,
            bear_hold_reduction: 0.3,
            bear_trend: -0.01,
            base_take_profit: 0.06,
            take_profit_min: 0.02,
            take_profit_max: 0.25,
            trailing_activation: 0.03,
            trailing_base_protect: 0.5,
            trailing_max_protect: 0.9,
            partial_tiers: vec![
                PartialTier {
                    profit: 0.05,
                    close_fraction: 0.25,
                },
                PartialTier {
                    profit: 0.10,
                    close_fraction: 0.33,
                },
                PartialTier {
                    profit: 0.20,
                    close_fraction: 0.50,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Total latency budget for the ensemble stage of one cycle
    pub cycle_budget_ms: u64,
    /// Per-member prediction timeout
    pub member_timeout_ms: u64,
    /// Interval between performance-buffer drains
    pub performance_drain_ms: u64,
    /// Rolling returns kept per symbol
    pub performance_window: usize,
    pub outcome_channel_capacity: usize,
    /// Symbols without a new outcome for this long are dropped from the aggregator
    pub performance_idle_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cycle_budget_ms: 500,
            member_timeout_ms: 200,
            performance_drain_ms: 1000,
            performance_window: 500,
            outcome_channel_capacity: 1024,
            performance_idle_secs: 86_400,
        }
    }
}

impl EngineConfig {
    /// Load configuration from files and environment, then sanitize it
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Runtime defaults
            .set_default("runtime.cycle_budget_ms", 500)?
            .set_default("runtime.member_timeout_ms", 200)?
            .set_default("runtime.performance_drain_ms", 1000)?
            .set_default("runtime.performance_window", 500)?
            .set_default("runtime.outcome_channel_capacity", 1024)?
            .set_default("runtime.performance_idle_secs", 86_400)?
            // Sizing envelope defaults
            .set_default("sizing.max_allocation", 0.25)?
            .set_default("sizing.min_allocation", 0.01)?
            // Exit defaults
            .set_default("exits.base_stop_loss", -0.08)?
            .set_default("exits.base_take_profit", 0.06)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (FUSIONBOT_*)
            .add_source(Environment::with_prefix("FUSIONBOT").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let engine_config: EngineConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(engine_config.validated())
    }

    /// Clamp out-of-range values, logging each correction
    pub fn validated(mut self) -> Self {
        if self.thresholds.is_empty() {
            self.thresholds = default_rows();
        }

        let sd = SizingConfig::default();
        let s = &mut self.sizing;
        s.max_allocation = clamp_logged("sizing.max_allocation", s.max_allocation, 0.0, 1.0);
        s.min_allocation = clamp_logged("sizing.min_allocation", s.min_allocation, 0.0, 1.0);
        ordered_logged("sizing.min_allocation", &mut s.min_allocation, &mut s.max_allocation);
        s.cash_reserve = clamp_logged("sizing.cash_reserve", s.cash_reserve, 0.0, 0.9);
        s.kelly_floor = clamp_logged("sizing.kelly_floor", s.kelly_floor, 0.0, 1.0);
        s.kelly_cap = clamp_logged("sizing.kelly_cap", s.kelly_cap, s.kelly_floor, 1.0);
        s.var_limit = clamp_logged("sizing.var_limit", s.var_limit, 0.001, 0.5);
        s.var_confidence =
            finite_logged("sizing.var_confidence", s.var_confidence, sd.var_confidence);
        s.var_confidence = clamp_logged("sizing.var_confidence", s.var_confidence, 0.5, 0.9999);
        for (key, (lo, hi), (lo_default, hi_default)) in [
            (
                "sizing.regime_multiplier",
                (&mut s.regime_multiplier_min, &mut s.regime_multiplier_max),
                (sd.regime_multiplier_min, sd.regime_multiplier_max),
            ),
            (
                "sizing.risk_adjustment",
                (&mut s.risk_adjustment_min, &mut s.risk_adjustment_max),
                (sd.risk_adjustment_min, sd.risk_adjustment_max),
            ),
            (
                "sizing.quality",
                (&mut s.quality_min, &mut s.quality_max),
                (sd.quality_min, sd.quality_max),
            ),
        ] {
            *lo = finite_logged(&format!("{}_min", key), *lo, lo_default).max(0.0);
            *hi = finite_logged(&format!("{}_max", key), *hi, hi_default).max(0.0);
            ordered_logged(&format!("{}_min", key), lo, hi);
        }

        let ed = ExitConfig::default();
        let e = &mut self.exits;
        e.base_stop_loss =
            non_positive_logged("exits.base_stop_loss", e.base_stop_loss, ed.base_stop_loss);
        e.stop_loss_floor =
            non_positive_logged("exits.stop_loss_floor", e.stop_loss_floor, ed.stop_loss_floor);
        e.stop_loss_ceiling = non_positive_logged(
            "exits.stop_loss_ceiling",
            e.stop_loss_ceiling,
            ed.stop_loss_ceiling,
        );
        e.emergency_stop =
            non_positive_logged("exits.emergency_stop", e.emergency_stop, ed.emergency_stop);
        ordered_logged("exits.stop_loss_floor", &mut e.stop_loss_floor, &mut e.stop_loss_ceiling);
        e.base_stop_loss = clamp_logged(
            "exits.base_stop_loss",
            e.base_stop_loss,
            e.stop_loss_floor,
            e.stop_loss_ceiling,
        );
        e.calm_volatility =
            finite_logged("exits.calm_volatility", e.calm_volatility, ed.calm_volatility);
        e.wild_volatility =
            finite_logged("exits.wild_volatility", e.wild_volatility, ed.wild_volatility);
        ordered_logged("exits.calm_volatility", &mut e.calm_volatility, &mut e.wild_volatility);
        e.trailing_base_protect =
            clamp_logged("exits.trailing_base_protect", e.trailing_base_protect, 0.0, 1.0);
        e.trailing_max_protect = clamp_logged(
            "exits.trailing_max_protect",
            e.trailing_max_protect,
            e.trailing_base_protect,
            1.0,
        );
        e.take_profit_min = clamp_logged("exits.take_profit_min", e.take_profit_min, 0.001, 1.0);
        e.take_profit_max =
            clamp_logged("exits.take_profit_max", e.take_profit_max, e.take_profit_min, 1.0);
        e.base_take_profit = clamp_logged(
            "exits.base_take_profit",
            e.base_take_profit,
            e.take_profit_min,
            e.take_profit_max,
        );
        e.partial_tiers.sort_by(|a, b| a.profit.total_cmp(&b.profit));

        let f = &mut self.fusion;
        f.base_ml_weight = clamp_logged("fusion.base_ml_weight", f.base_ml_weight, 0.0, 1.0);

        let en = &mut self.ensemble;
        en.outlier_sigma = clamp_logged("ensemble.outlier_sigma", en.outlier_sigma, 0.5, 10.0);
        en.min_members = en.min_members.max(1);
        en.expected_members = en.expected_members.max(1);

        let r = &mut self.rules;
        r.weight_clamp = clamp_logged("rules.weight_clamp", r.weight_clamp, 0.01, 10.0);
        r.weight_floor = clamp_logged("rules.weight_floor", r.weight_floor, 0.0, r.weight_clamp);
        r.insufficient_consistency = clamp_logged(
            "rules.insufficient_consistency",
            r.insufficient_consistency,
            0.5,
            1.4,
        );

        for (label, row) in self.thresholds.iter_mut() {
            row.ml_ceiling =
                clamp_logged(&format!("thresholds.{}.ml_ceiling", label), row.ml_ceiling, 0.0, 1.0);
            row.long_sell =
                clamp_logged(&format!("thresholds.{}.long_sell", label), row.long_sell, -1.0, 0.0);
        }

        self
    }

    /// Labels that must have a threshold row
    pub fn missing_threshold_rows(&self) -> Vec<RegimeLabel> {
        RegimeLabel::ALL
            .iter()
            .copied()
            .filter(|l| !self.thresholds.contains_key(l.as_str()))
            .collect()
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "alloc=[{:.2},{:.2}] base_ml={:.2} stop={:.2} tp={:.2} budget={}ms regimes={}",
            self.sizing.min_allocation,
            self.sizing.max_allocation,
            self.fusion.base_ml_weight,
            self.exits.base_stop_loss,
            self.exits.base_take_profit,
            self.runtime.cycle_budget_ms,
            self.thresholds.len()
        )
    }
}

impl std::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

fn clamp_logged(key: &str, value: f64, lo: f64, hi: f64) -> f64 {
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    if !value.is_finite() {
        warn!("{} is not finite, using {}", key, lo);
        return lo;
    }
    // max/min ignore a NaN bound where clamp would panic
    let clamped = value.max(lo).min(hi);
    if clamped != value {
        warn!("{}={} outside [{}, {}], clamped to {}", key, value, lo, hi, clamped);
    }
    clamped
}

fn finite_logged(key: &str, value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        warn!("{}={} is not finite, using {}", key, value, fallback);
        fallback
    }
}

/// Swap an inverted lo/hi pair in place
fn ordered_logged(key: &str, lo: &mut f64, hi: &mut f64) {
    if *lo > *hi {
        warn!("{}={} above its upper bound {}, swapping", key, lo, hi);
        std::mem::swap(lo, hi);
    }
}

fn non_positive_logged(key: &str, value: f64, fallback: f64) -> f64 {
    let value = finite_logged(key, value, fallback);
    if value > 0.0 {
        warn!("{}={} must be <= 0, negating", key, value);
        -value
    } else {
        value
    }
}
