//! Rule-Based Signal Engine
//!
//! Scores a feature snapshot with ~30 weighted indicator terms:
//! - Base weights adjusted by an ordered list of named rules (volatility, RSI,
//!   position, market phase, performance, sentiment/seasonal)
//! - Weighted sum over present terms only (absent indicators are skipped, never zero)
//! - Gated by a market timing filter and a cross-family consistency ratio
//! - Action chosen from the regime × position threshold table

pub mod adjustments;
pub mod consistency;
pub mod terms;
pub mod timing;

pub use adjustments::{AdjustmentContext, AdjustmentRule};
pub use consistency::ConsistencyReport;
pub use terms::{SignalTerm, BASE_TERMS};
pub use timing::{TimingContext, TimingRule};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RuleConfig;
use crate::error::EngineError;
use crate::features::{FeatureSnapshot, Indicator};
use crate::regime::{RegimeClassification, ThresholdTable};
use crate::types::{Action, PerformanceHistory, PositionState, SignalPrediction};

/// One present term after adjustment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermContribution {
    pub indicator: Indicator,
    pub signal: f64,
    pub weight: f64,
}

impl TermContribution {
    pub fn value(&self) -> f64 {
        self.signal * self.weight
    }
}

/// Rule engine output for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSignal {
    pub prediction: SignalPrediction,
    /// Action implied by the rule score alone
    pub action: Action,
    /// Normalized weighted sum before gating
    pub raw_score: f64,
    /// Consistency ratio in [0.5, 1.4]
    pub consistency: f64,
    /// Timing multiplier in [0.5, 1.0]
    pub timing: f64,
    /// Names of the adjustment rules that fired
    pub active_rules: Vec<String>,
    pub components: Vec<TermContribution>,
}

impl RuleSignal {
    pub fn score(&self) -> f64 {
        self.prediction.score
    }

    pub fn confidence(&self) -> f64 {
        self.prediction.confidence
    }
}

/// Rule-based signal engine
#[derive(Debug, Clone)]
pub struct RuleEngine {
    config: RuleConfig,
    thresholds: ThresholdTable,
    rules: Vec<AdjustmentRule>,
    timing_rules: Vec<TimingRule>,
}

impl RuleEngine {
    pub fn new(config: RuleConfig, thresholds: ThresholdTable) -> Self {
        Self {
            config,
            thresholds,
            rules: adjustments::default_rules(),
            timing_rules: timing::default_timing_rules(),
        }
    }

    /// Score a snapshot; fails only when the regime has no threshold row
    pub fn score(
        &self,
        features: &FeatureSnapshot,
        regime: &RegimeClassification,
        position: &PositionState,
        history: Option<&PerformanceHistory>,
    ) -> Result<RuleSignal, EngineError> {
        let thresholds = self.thresholds.lookup(regime.label)?;

        let ctx = AdjustmentContext {
            features,
            regime: regime.label,
            position,
            history,
            config: &self.config,
        };
        let active = adjustments::active_rules(&self.rules, &ctx);

        let components: Vec<TermContribution> = BASE_TERMS
            .iter()
            .filter_map(|term| {
                let signal = term.signal(features)?;
                let weight = adjustments::adjusted_weight(
                    term.base_weight,
                    term.indicator,
                    signal,
                    &active,
                    &self.config,
                );
                Some(TermContribution {
                    indicator: term.indicator,
                    signal,
                    weight,
                })
            })
            .collect();

        let total_weight: f64 = components.iter().map(|c| c.weight.abs()).sum();
        let raw_score = if total_weight > 0.0 {
            (components.iter().map(|c| c.value()).sum::<f64>() / total_weight).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let timing_ctx = TimingContext::new(features, regime.label, raw_score, &self.config);
        let timing = timing::timing_filter(&self.timing_rules, &timing_ctx);
        let family_contributions: Vec<_> = components
            .iter()
            .map(|c| (c.indicator.family(), c.value()))
            .collect();
        let consistency = consistency::consistency_ratio(
            &family_contributions,
            raw_score,
            self.config.min_consistency_families,
            self.config.insufficient_consistency,
        );

        let score = (raw_score * timing * consistency.ratio).clamp(-1.0, 1.0);

        // Confidence: signal strength, schema coverage and agreement
        let possible_weight: f64 = BASE_TERMS.iter().map(|t| t.base_weight.abs()).sum();
        let present_weight: f64 = components
            .iter()
            .filter_map(|c| BASE_TERMS.get(c.indicator as usize))
            .map(|t| t.base_weight.abs())
            .sum();
        let coverage = if possible_weight > 0.0 {
            present_weight / possible_weight
        } else {
            0.0
        };
        let agreement = (consistency.ratio - consistency::MIN_RATIO)
            / (consistency::MAX_RATIO - consistency::MIN_RATIO);
        let confidence = if components.is_empty() {
            0.0
        } else {
            (0.5 * score.abs() + 0.3 * coverage + 0.2 * agreement) * timing
        };

        let prediction = SignalPrediction::new(score, confidence);
        let action = thresholds.action_for(prediction.score, position);

        debug!(
            "rule score={:.3} raw={:.3} timing={:.2} consistency={:.2} terms={} regime={} -> {}",
            prediction.score,
            raw_score,
            timing,
            consistency.ratio,
            components.len(),
            regime.label,
            action
        );

        Ok(RuleSignal {
            prediction,
            action,
            raw_score,
            consistency: consistency.ratio,
            timing,
            active_rules: active.iter().map(|r| r.name.to_string()).collect(),
            components,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::{RegimeClassifier, RegimeLabel, RegimeScores};

    fn engine() -> RuleEngine {
        RuleEngine::new(RuleConfig::default(), ThresholdTable::default())
    }

    fn regime(label: RegimeLabel) -> RegimeClassification {
        RegimeClassification {
            label,
            confidence: 0.7,
            scores: RegimeScores::default(),
        }
    }

    fn bullish() -> FeatureSnapshot {
        FeatureSnapshot::from_pairs([
            ("trend_5", 0.02),
            ("trend_20", 0.04),
            ("trend_50", 0.06),
            ("momentum_10", 0.03),
            ("momentum_5", 0.02),
            ("macd_histogram", 0.5),
            ("volume_ratio", 1.6),
            ("rsi_14", 58.0),
            ("volatility_20", 0.015),
        ])
    }

    #[test]
    fn test_empty_snapshot_is_neutral() {
        let signal = engine()
            .score(
                &FeatureSnapshot::new(),
                &regime(RegimeLabel::Sideways),
                &PositionState::flat(),
                None,
            )
            .unwrap();
        assert_eq!(signal.prediction.score, 0.0);
        assert_eq!(signal.prediction.confidence, 0.0);
        assert_eq!(signal.action, Action::Hold);
    }

    #[test]
    fn test_bullish_snapshot_scores_positive_and_consistent() {
        let signal = engine()
            .score(&bullish(), &regime(RegimeLabel::WeakBull), &PositionState::flat(), None)
            .unwrap();
        assert!(signal.score() > 0.3, "score {}", signal.score());
        assert!(signal.consistency > 1.2);
        assert_eq!(signal.action, Action::Buy);
    }

    #[test]
    fn test_absent_indicator_is_skipped_not_zero() {
        let features = FeatureSnapshot::new().with(Indicator::Trend20, 0.03);
        let with_absent = engine()
            .score(&features, &regime(RegimeLabel::Sideways), &PositionState::flat(), None)
            .unwrap();
        // A lone bullish term normalizes to its own signal, not diluted by 29 zeros
        assert_eq!(with_absent.components.len(), 1);
        assert!((with_absent.raw_score - (1.0_f64).tanh()).abs() < 1e-9);
    }

    #[test]
    fn test_scoring_is_idempotent() {
        let e = engine();
        let f = bullish();
        let r = regime(RegimeLabel::WeakBull);
        let p = PositionState::long(100.0, 103.0, 4);
        let h = PerformanceHistory::new(0.55, 1.1, 0.1, 40);
        let a = e.score(&f, &r, &p, Some(&h)).unwrap();
        let b = e.score(&f, &r, &p, Some(&h)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_threshold_row_is_hard_error() {
        let mut rows = crate::regime::thresholds::default_rows();
        rows.remove("strong-bull");
        let table = ThresholdTable::from_rows(&rows).unwrap();
        let e = RuleEngine::new(RuleConfig::default(), table);
        let err = e
            .score(&bullish(), &regime(RegimeLabel::StrongBull), &PositionState::flat(), None)
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownRegime("strong-bull".into()));
    }

    #[test]
    fn test_flat_position_never_yields_exit_action() {
        let classifier = RegimeClassifier::default();
        let bearish = FeatureSnapshot::from_pairs([
            ("rsi_14", 25.0),
            ("trend_20", -0.02),
            ("momentum_10", -0.03),
            ("volatility_20", 0.01),
        ]);
        let r = classifier.classify(&bearish);
        let signal = engine()
            .score(&bearish, &r, &PositionState::flat(), None)
            .unwrap();
        assert!(!signal.action.is_exit());
        assert!(signal.prediction.confidence >= 0.0 && signal.prediction.confidence <= 1.0);
    }
}
