//! Market Regime Classifier
//!
//! Maps a feature snapshot to one of six regimes plus a confidence:
//! - Five weighted sub-scores (trend, volatility, RSI extremity, momentum, volume)
//! - Ordered, asymmetric decision list: bear conditions are checked before bull
//!
//! The check order is policy and must not be rearranged.
//!
//! Note on `ExtremeBear`: the label fires on very low volatility combined with an
//! extreme RSI, which describes a quiet/exhausted market rather than a crash. The
//! condition is kept as-is; only the name is misleading.

pub mod thresholds;

pub use thresholds::{RegimeThresholds, ThresholdTable, SHORT_DISABLED};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::config::RegimeConfig;
use crate::error::EngineError;
use crate::features::{FeatureSnapshot, Indicator};

/// Regime label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegimeLabel {
    ExtremeBear,
    StrongBear,
    WeakBear,
    Sideways,
    WeakBull,
    StrongBull,
}

impl RegimeLabel {
    pub const ALL: [RegimeLabel; 6] = [
        RegimeLabel::ExtremeBear,
        RegimeLabel::StrongBear,
        RegimeLabel::WeakBear,
        RegimeLabel::Sideways,
        RegimeLabel::WeakBull,
        RegimeLabel::StrongBull,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegimeLabel::ExtremeBear => "extreme-bear",
            RegimeLabel::StrongBear => "strong-bear",
            RegimeLabel::WeakBear => "weak-bear",
            RegimeLabel::Sideways => "sideways",
            RegimeLabel::WeakBull => "weak-bull",
            RegimeLabel::StrongBull => "strong-bull",
        }
    }

    pub fn is_bearish(&self) -> bool {
        matches!(
            self,
            RegimeLabel::ExtremeBear | RegimeLabel::StrongBear | RegimeLabel::WeakBear
        )
    }

    pub fn is_bullish(&self) -> bool {
        matches!(self, RegimeLabel::WeakBull | RegimeLabel::StrongBull)
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RegimeLabel {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        RegimeLabel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == normalized)
            .ok_or_else(|| EngineError::UnknownRegime(s.to_string()))
    }
}

/// Weighted sub-scores behind a classification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RegimeScores {
    pub trend: Option<f64>,
    /// May be negative under extreme calm
    pub volatility: Option<f64>,
    pub rsi_extremity: Option<f64>,
    pub momentum: Option<f64>,
    pub volume: Option<f64>,
    /// Weighted composite in [0, 1]
    pub composite: f64,
}

/// Classifier output, recomputed each cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeClassification {
    pub label: RegimeLabel,
    pub confidence: f64,
    pub scores: RegimeScores,
}

/// Regime classifier
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new(RegimeConfig::default())
    }
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    /// Compute the five sub-scores and their weighted composite
    pub fn score(&self, features: &FeatureSnapshot) -> RegimeScores {
        let c = &self.config;

        let trend = features
            .trend_direction()
            .map(|t| (t.abs() / c.trend_full_scale).min(1.0));

        let volatility = features.get(Indicator::Volatility20).map(|v| {
            let v = v.abs();
            if v < c.calm_volatility {
                // Extreme calm pulls the composite down
                -0.5 * (c.calm_volatility - v) / c.calm_volatility
            } else {
                (v / c.volatility_full_scale).min(1.0)
            }
        });

        let rsi_extremity = features
            .get(Indicator::Rsi14)
            .map(|rsi| ((rsi - 50.0).abs() / 50.0).min(1.0));

        let momentum = features
            .get(Indicator::Momentum10)
            .map(|m| (m.abs() / c.momentum_full_scale).min(1.0));

        let volume = features
            .volume_expansion()
            .map(|ratio| (ratio - 1.0).clamp(0.0, 1.0));

        let weighted = [
            (trend, c.trend_weight),
            (volatility, c.volatility_weight),
            (rsi_extremity, c.rsi_weight),
            (momentum, c.momentum_weight),
            (volume, c.volume_weight),
        ];

        let (sum, weight) = weighted
            .iter()
            .filter_map(|(s, w)| s.map(|s| (s * w, *w)))
            .fold((0.0, 0.0), |(acc, tw), (s, w)| (acc + s, tw + w));

        let composite = if weight > 0.0 {
            (sum / weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        RegimeScores {
            trend,
            volatility,
            rsi_extremity,
            momentum,
            volume,
            composite,
        }
    }

    /// Classify a snapshot
    pub fn classify(&self, features: &FeatureSnapshot) -> RegimeClassification {
        let c = &self.config;
        let scores = self.score(features);
        let composite = scores.composite;

        let trend = features.trend_direction();
        let rsi = features.get(Indicator::Rsi14);
        let momentum = features.get(Indicator::Momentum10);
        let volatility = features.get(Indicator::Volatility20);
        let volume_ratio = features.volume_expansion();

        let lt = |v: Option<f64>, x: f64| v.map_or(false, |v| v < x);
        let gt = |v: Option<f64>, x: f64| v.map_or(false, |v| v > x);

        let trend_strength = trend.map_or(0.0, |t| (t.abs() / c.trend_full_scale).min(1.0));

        // 1. Downtrend confirmed by RSI or momentum
        if lt(trend, c.bear_trend) && (lt(rsi, 50.0) || lt(momentum, c.bear_momentum)) {
            let label = if lt(trend, -c.strong_trend) && composite >= c.strong_composite {
                RegimeLabel::StrongBear
            } else {
                RegimeLabel::WeakBear
            };
            let confidence = 0.5 + 0.3 * trend_strength + 0.2 * composite;
            return self.finish(label, confidence, scores);
        }

        // 2. Dead-calm tape with an exhausted oscillator
        if lt(volatility.map(f64::abs), c.calm_volatility)
            && (lt(rsi, c.extreme_rsi_low) || gt(rsi, c.extreme_rsi_high))
        {
            let extremity = scores.rsi_extremity.unwrap_or(0.0);
            let confidence = 0.5 + 0.4 * extremity + 0.1 * (1.0 - composite);
            return self.finish(RegimeLabel::ExtremeBear, confidence, scores);
        }

        let bullish_confirmed = gt(rsi, 50.0)
            && gt(momentum, c.bull_momentum)
            && gt(volume_ratio, c.bull_volume_ratio)
            && gt(trend, c.bull_trend);

        // 3. Weak composite without bullish confirmation
        if composite < c.sideways_composite && !bullish_confirmed {
            let confidence = 0.4 + 0.4 * (1.0 - composite);
            return self.finish(RegimeLabel::Sideways, confidence, scores);
        }

        // 4. Bull regimes require every confirmation at once
        if bullish_confirmed {
            let label = if gt(trend, c.strong_trend) && composite >= c.strong_composite {
                RegimeLabel::StrongBull
            } else {
                RegimeLabel::WeakBull
            };
            let confidence = 0.5 + 0.3 * trend_strength + 0.2 * composite;
            return self.finish(label, confidence, scores);
        }

        // 5. Active but directionless
        let confidence = 0.3 + 0.3 * (1.0 - trend_strength);
        self.finish(RegimeLabel::Sideways, confidence, scores)
    }

    fn finish(
        &self,
        label: RegimeLabel,
        confidence: f64,
        scores: RegimeScores,
    ) -> RegimeClassification {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        debug!(
            "regime={} confidence={:.2} composite={:.3}",
            label, confidence, scores.composite
        );
        RegimeClassification {
            label,
            confidence,
            scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(pairs: &[(&str, f64)]) -> RegimeClassification {
        RegimeClassifier::default().classify(&FeatureSnapshot::from_pairs(pairs.iter().copied()))
    }

    #[test]
    fn test_label_round_trip_and_unknown() {
        for label in RegimeLabel::ALL {
            assert_eq!(label.as_str().parse::<RegimeLabel>().unwrap(), label);
        }
        assert_eq!("STRONG_BULL".parse::<RegimeLabel>().unwrap(), RegimeLabel::StrongBull);
        assert!(matches!(
            "crash".parse::<RegimeLabel>(),
            Err(EngineError::UnknownRegime(_))
        ));
    }

    #[test]
    fn test_downtrend_is_weak_bear() {
        let r = classify(&[
            ("rsi_14", 25.0),
            ("trend_20", -0.02),
            ("momentum_10", -0.03),
            ("volatility_20", 0.01),
        ]);
        assert_eq!(r.label, RegimeLabel::WeakBear);
        assert!(r.confidence > 0.5 && r.confidence <= 1.0);
    }

    #[test]
    fn test_steep_downtrend_is_strong_bear() {
        let r = classify(&[
            ("rsi_14", 22.0),
            ("trend_20", -0.06),
            ("momentum_10", -0.05),
            ("volatility_20", 0.05),
            ("volume_ratio", 1.8),
        ]);
        assert_eq!(r.label, RegimeLabel::StrongBear);
    }

    #[test]
    fn test_quiet_exhausted_market_is_extreme_bear() {
        // Flat trend, dead volatility, RSI pinned high
        let r = classify(&[
            ("rsi_14", 85.0),
            ("trend_20", 0.001),
            ("momentum_10", 0.0),
            ("volatility_20", 0.002),
        ]);
        assert_eq!(r.label, RegimeLabel::ExtremeBear);
    }

    #[test]
    fn test_quiet_oversold_market_is_extreme_bear() {
        // Same dead tape with RSI pinned low but no confirmed downtrend
        let r = classify(&[
            ("rsi_14", 15.0),
            ("trend_20", 0.001),
            ("momentum_10", 0.0),
            ("volatility_20", 0.002),
        ]);
        assert_eq!(r.label, RegimeLabel::ExtremeBear);
        assert!(r.confidence > 0.5 && r.confidence <= 1.0);
    }

    #[test]
    fn test_bear_checked_before_extreme_bear() {
        // Satisfies both the downtrend rule and the calm/extreme-RSI rule
        let r = classify(&[
            ("rsi_14", 15.0),
            ("trend_20", -0.01),
            ("volatility_20", 0.002),
        ]);
        assert_eq!(r.label, RegimeLabel::WeakBear);
    }

    #[test]
    fn test_confirmed_rally_is_bull() {
        let strong = classify(&[
            ("rsi_14", 68.0),
            ("trend_20", 0.06),
            ("momentum_10", 0.05),
            ("volatility_20", 0.03),
            ("volume_ratio", 1.9),
        ]);
        assert_eq!(strong.label, RegimeLabel::StrongBull);

        let weak = classify(&[
            ("rsi_14", 58.0),
            ("trend_20", 0.015),
            ("momentum_10", 0.025),
            ("volatility_20", 0.02),
            ("volume_ratio", 1.3),
        ]);
        assert_eq!(weak.label, RegimeLabel::WeakBull);
    }

    #[test]
    fn test_bull_needs_volume_confirmation() {
        let r = classify(&[
            ("rsi_14", 68.0),
            ("trend_20", 0.06),
            ("momentum_10", 0.05),
            ("volatility_20", 0.03),
            ("volume_ratio", 1.0),
        ]);
        assert_eq!(r.label, RegimeLabel::Sideways);
    }

    #[test]
    fn test_empty_snapshot_is_sideways() {
        let r = classify(&[]);
        assert_eq!(r.label, RegimeLabel::Sideways);
        assert_eq!(r.scores.composite, 0.0);
    }

    #[test]
    fn test_calm_volatility_contributes_negatively() {
        let scores = RegimeClassifier::default()
            .score(&FeatureSnapshot::new().with(Indicator::Volatility20, 0.001));
        assert!(scores.volatility.unwrap() < 0.0);
        assert_eq!(scores.composite, 0.0);
    }
}
