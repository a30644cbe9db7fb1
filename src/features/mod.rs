//! Feature Snapshot - Typed indicator schema
//!
//! Per-cycle market features for a single symbol:
//! - Fixed schema of 30 core indicators (compile-time checked via [`Indicator`])
//! - Extras side-table for experimental / derived features
//! - Absent values are `None`, never zero
//!
//! Non-finite inputs (NaN, ±Inf) are treated as absent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Current schema version of [`FeatureSnapshot`]
pub const SCHEMA_VERSION: u16 = 1;

/// Indicator families used for consistency scoring and weight adjustments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndicatorFamily {
    Trend,
    Momentum,
    Macd,
    Volume,
    Oscillator,
    Volatility,
    Structure,
    Context,
}

/// Core indicators of the snapshot schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Indicator {
    // ============ Trend ============
    /// Fractional price change over 5 periods
    Trend5,
    /// Fractional price change over 20 periods
    Trend20,
    /// Fractional price change over 50 periods
    Trend50,
    /// ADX (0-100)
    Adx14,
    /// Distance from SMA20 as fraction of price
    Sma20Distance,
    /// Distance from EMA50 as fraction of price
    Ema50Distance,

    // ============ Momentum ============
    Momentum5,
    Momentum10,
    PriceChange1,
    PriceChange5,

    // ============ MACD ============
    MacdLine,
    MacdSignal,
    MacdHistogram,

    // ============ Volume ============
    /// Fractional change of volume vs its average
    VolumeTrend,
    /// Current volume / average volume
    VolumeRatio,
    ObvTrend,

    // ============ Oscillators ============
    Rsi14,
    StochRsi,
    /// Position within Bollinger Bands (0 = lower, 1 = upper)
    BollingerPosition,

    // ============ Volatility ============
    /// Standard deviation of returns over 20 periods
    Volatility20,
    Atr14,
    /// Short / long volatility ratio
    VolatilityRatio,
    /// (high - low) / close over the lookback
    HighLowRange,

    // ============ Structure ============
    Price,
    SupportLevel,
    ResistanceLevel,
    /// Fractional distance below the rolling high (>= 0)
    DrawdownFromHigh,

    // ============ Context ============
    /// External sentiment in [-1, 1]
    Sentiment,
    /// Seasonal bias in [-1, 1]
    Seasonality,
    /// Market breadth in [-1, 1]
    MarketBreadth,
}

impl Indicator {
    pub const COUNT: usize = 30;

    pub const ALL: [Indicator; Indicator::COUNT] = [
        Indicator::Trend5,
        Indicator::Trend20,
        Indicator::Trend50,
        Indicator::Adx14,
        Indicator::Sma20Distance,
        Indicator::Ema50Distance,
        Indicator::Momentum5,
        Indicator::Momentum10,
        Indicator::PriceChange1,
        Indicator::PriceChange5,
        Indicator::MacdLine,
        Indicator::MacdSignal,
        Indicator::MacdHistogram,
        Indicator::VolumeTrend,
        Indicator::VolumeRatio,
        Indicator::ObvTrend,
        Indicator::Rsi14,
        Indicator::StochRsi,
        Indicator::BollingerPosition,
        Indicator::Volatility20,
        Indicator::Atr14,
        Indicator::VolatilityRatio,
        Indicator::HighLowRange,
        Indicator::Price,
        Indicator::SupportLevel,
        Indicator::ResistanceLevel,
        Indicator::DrawdownFromHigh,
        Indicator::Sentiment,
        Indicator::Seasonality,
        Indicator::MarketBreadth,
    ];

    /// Canonical key used by external producers
    pub fn name(&self) -> &'static str {
        match self {
            Indicator::Trend5 => "trend_5",
            Indicator::Trend20 => "trend_20",
            Indicator::Trend50 => "trend_50",
            Indicator::Adx14 => "adx_14",
            Indicator::Sma20Distance => "sma_20_distance",
            Indicator::Ema50Distance => "ema_50_distance",
            Indicator::Momentum5 => "momentum_5",
            Indicator::Momentum10 => "momentum_10",
            Indicator::PriceChange1 => "price_change_1",
            Indicator::PriceChange5 => "price_change_5",
            Indicator::MacdLine => "macd_line",
            Indicator::MacdSignal => "macd_signal",
            Indicator::MacdHistogram => "macd_histogram",
            Indicator::VolumeTrend => "volume_trend",
            Indicator::VolumeRatio => "volume_ratio",
            Indicator::ObvTrend => "obv_trend",
            Indicator::Rsi14 => "rsi_14",
            Indicator::StochRsi => "stoch_rsi",
            Indicator::BollingerPosition => "bollinger_position",
            Indicator::Volatility20 => "volatility_20",
            Indicator::Atr14 => "atr_14",
            Indicator::VolatilityRatio => "volatility_ratio",
            Indicator::HighLowRange => "high_low_range",
            Indicator::Price => "price",
            Indicator::SupportLevel => "support_level",
            Indicator::ResistanceLevel => "resistance_level",
            Indicator::DrawdownFromHigh => "drawdown_from_high",
            Indicator::Sentiment => "sentiment",
            Indicator::Seasonality => "seasonality",
            Indicator::MarketBreadth => "market_breadth",
        }
    }

    pub fn family(&self) -> IndicatorFamily {
        use Indicator::*;
        match self {
            Trend5 | Trend20 | Trend50 | Adx14 | Sma20Distance | Ema50Distance => {
                IndicatorFamily::Trend
            }
            Momentum5 | Momentum10 | PriceChange1 | PriceChange5 => IndicatorFamily::Momentum,
            MacdLine | MacdSignal | MacdHistogram => IndicatorFamily::Macd,
            VolumeTrend | VolumeRatio | ObvTrend => IndicatorFamily::Volume,
            Rsi14 | StochRsi | BollingerPosition => IndicatorFamily::Oscillator,
            Volatility20 | Atr14 | VolatilityRatio | HighLowRange => IndicatorFamily::Volatility,
            Price | SupportLevel | ResistanceLevel | DrawdownFromHigh => {
                IndicatorFamily::Structure
            }
            Sentiment | Seasonality | MarketBreadth => IndicatorFamily::Context,
        }
    }

    /// Parse from canonical key
    pub fn from_name(name: &str) -> Option<Self> {
        Indicator::ALL.iter().copied().find(|i| i.name() == name)
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Immutable per-cycle feature snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub schema_version: u16,
    values: [Option<f64>; Indicator::COUNT],
    /// Experimental / derived features outside the core schema
    pub extras: BTreeMap<String, f64>,
}

impl Default for FeatureSnapshot {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            values: [None; Indicator::COUNT],
            extras: BTreeMap::new(),
        }
    }
}

impl FeatureSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from (name, value) pairs; unknown names land in `extras`
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut snapshot = Self::default();
        for (name, value) in pairs {
            snapshot.insert_named(name, value);
        }
        snapshot
    }

    /// Build from a string-keyed map produced by an external feature pipeline
    pub fn from_map(map: &HashMap<String, f64>) -> Self {
        Self::from_pairs(map.iter().map(|(k, v)| (k.as_str(), *v)))
    }

    /// Builder-style setter
    pub fn with(mut self, indicator: Indicator, value: f64) -> Self {
        self.set(indicator, value);
        self
    }

    pub fn set(&mut self, indicator: Indicator, value: f64) {
        self.values[indicator.index()] = value.is_finite().then_some(value);
    }

    pub fn insert_named(&mut self, name: &str, value: f64) {
        match Indicator::from_name(name) {
            Some(indicator) => self.set(indicator, value),
            None => {
                if value.is_finite() {
                    self.extras.insert(name.to_string(), value);
                }
            }
        }
    }

    pub fn get(&self, indicator: Indicator) -> Option<f64> {
        self.values[indicator.index()]
    }

    pub fn has(&self, indicator: Indicator) -> bool {
        self.get(indicator).is_some()
    }

    pub fn extra(&self, name: &str) -> Option<f64> {
        self.extras.get(name).copied()
    }

    /// Number of core indicators present
    pub fn coverage(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    // ============ Derived helpers ============

    /// Primary trend direction: trend_20, falling back to the mean of trend_5/trend_50
    pub fn trend_direction(&self) -> Option<f64> {
        if let Some(t) = self.get(Indicator::Trend20) {
            return Some(t);
        }
        let others: Vec<f64> = [Indicator::Trend5, Indicator::Trend50]
            .iter()
            .filter_map(|i| self.get(*i))
            .collect();
        if others.is_empty() {
            None
        } else {
            Some(others.iter().sum::<f64>() / others.len() as f64)
        }
    }

    /// Volume expansion ratio: volume_ratio, or 1 + volume_trend
    pub fn volume_expansion(&self) -> Option<f64> {
        self.get(Indicator::VolumeRatio)
            .or_else(|| self.get(Indicator::VolumeTrend).map(|t| 1.0 + t))
    }

    /// Volatility-range measure as fraction of price (ATR, range, or return volatility)
    pub fn volatility_range(&self) -> Option<f64> {
        let atr_pct = match (self.get(Indicator::Atr14), self.get(Indicator::Price)) {
            (Some(atr), Some(price)) if price > 0.0 => Some(atr / price),
            _ => None,
        };
        atr_pct
            .or_else(|| self.get(Indicator::HighLowRange))
            .or_else(|| self.get(Indicator::Volatility20))
    }
}
