//! Fusion Controller
//!
//! Combines the rule engine and the ensemble into one action/confidence:
//! 1. Base ML:rule split
//! 2. Ordered chain of named factors (see [`factors::FACTOR_CHAIN`])
//! 3. Renormalize to sum 1, then cap ML at the regime ceiling
//! 4. Map the blended score through the regime × position thresholds
//!
//! A flat position never receives "sell" or "cover".

pub mod factors;

pub use factors::{FusionFactor, TrendConfirmation};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::FusionConfig;
use crate::error::EngineError;
use crate::features::FeatureSnapshot;
use crate::ml_engine::EnsemblePrediction;
use crate::regime::{RegimeClassification, RegimeLabel, ThresholdTable};
use crate::strategy::RuleSignal;
use crate::types::{Action, PerformanceHistory, PositionState};

use factors::{direction, FactorInput, FACTOR_CHAIN};

/// Terminal decision of the fusion stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionDecision {
    pub action: Action,
    pub confidence: f64,
    /// Blended score in [-1, 1]
    pub score: f64,
    pub ml_weight: f64,
    pub rule_weight: f64,
    pub regime: RegimeLabel,
    /// Rule consistency ratio, passed on to sizing
    pub consistency: f64,
    pub factors: Vec<FusionFactor>,
    /// True when an exit action was downgraded to hold for a flat position
    pub downgraded: bool,
}

impl FusionDecision {
    /// Conservative decision: hold with zero confidence
    pub fn hold(regime: RegimeLabel) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.0,
            score: 0.0,
            ml_weight: 0.0,
            rule_weight: 1.0,
            regime,
            consistency: 0.8,
            factors: Vec::new(),
            downgraded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionController {
    config: FusionConfig,
    thresholds: ThresholdTable,
}

impl FusionController {
    pub fn new(config: FusionConfig, thresholds: ThresholdTable) -> Self {
        Self { config, thresholds }
    }

    /// Fuse one cycle. Fails only on a regime without a threshold policy.
    pub fn fuse(
        &self,
        ensemble: Option<&EnsemblePrediction>,
        rule: &RuleSignal,
        regime: &RegimeClassification,
        position: &PositionState,
        history: Option<&PerformanceHistory>,
        features: &FeatureSnapshot,
    ) -> Result<FusionDecision, EngineError> {
        let thresholds = self.thresholds.lookup(regime.label)?;

        let usable = ensemble.filter(|e| e.members_used > 0);
        let mut factors = Vec::new();
        let mut agreement_boost = 1.0;

        let (ml_weight, rule_weight) = match usable {
            None => (0.0, 1.0),
            Some(e) => {
                let input = FactorInput {
                    ensemble: e,
                    rule,
                    regime: regime.label,
                    history,
                    features,
                    config: &self.config,
                };

                let mut ml = self.config.base_ml_weight;
                let mut rl = 1.0 - self.config.base_ml_weight;
                for (name, factor) in FACTOR_CHAIN.iter() {
                    let (m, r) = factor(&input);
                    ml *= m;
                    rl *= r;
                    factors.push(FusionFactor {
                        name: name.to_string(),
                        ml: m,
                        rule: r,
                    });
                }

                let deadband = self.config.direction_deadband;
                match (direction(e.score, deadband), direction(rule.score(), deadband)) {
                    (a, b) if a != 0 && a == b => agreement_boost = 1.1,
                    (a, b) if a != 0 && b != 0 => agreement_boost = 0.85,
                    _ => {}
                }

                let (ml, rl) = renormalize(ml, rl);
                cap_ml(ml, rl, thresholds.ml_ceiling)
            }
        };

        let ml_score = usable.map_or(0.0, |e| e.score);
        let ml_confidence = usable.map_or(0.0, |e| e.confidence);

        let score = (ml_weight * ml_score + rule_weight * rule.score()).clamp(-1.0, 1.0);
        let blended_confidence = ml_weight * ml_confidence + rule_weight * rule.confidence();
        let confidence = (blended_confidence * agreement_boost).clamp(0.0, 1.0);

        let mut action = thresholds.action_for(score, position);
        let mut downgraded = false;
        if !position.has_position && action.is_exit() {
            warn!("{} emitted while flat, downgrading to HOLD", action);
            action = Action::Hold;
            downgraded = true;
        }

        debug!(
            "fusion regime={} ml_w={:.2} rule_w={:.2} score={:.3} conf={:.3} -> {}",
            regime.label, ml_weight, rule_weight, score, confidence, action
        );

        Ok(FusionDecision {
            action,
            confidence,
            score,
            ml_weight,
            rule_weight,
            regime: regime.label,
            consistency: rule.consistency,
            factors,
            downgraded,
        })
    }
}

/// Scale to sum 1; degenerate weights fall back to rules only
fn renormalize(ml: f64, rule: f64) -> (f64, f64) {
    let ml = if ml.is_finite() { ml.max(0.0) } else { 0.0 };
    let rule = if rule.is_finite() { rule.max(0.0) } else { 0.0 };
    let total = ml + rule;
    if total <= f64::EPSILON {
        (0.0, 1.0)
    } else {
        (ml / total, rule / total)
    }
}

/// Move ML weight above the ceiling over to rules
fn cap_ml(ml: f64, rule: f64, ceiling: f64) -> (f64, f64) {
    if ml > ceiling {
        (ceiling, rule + (ml - ceiling))
    } else {
        (ml, rule)
    }
}
