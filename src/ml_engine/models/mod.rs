//! Built-in inference models
//!
//! Four statistical models with fixed, pre-fitted parameters. Training happens
//! elsewhere; only the inference contract lives here. Every model is a pure function
//! of the snapshot and reports failure when none of its inputs are present.

use async_trait::async_trait;

use super::{MemberDescriptor, MemberOutput, MemberPredictor, PredictorKind};
use crate::error::PredictorError;
use crate::features::{FeatureSnapshot, Indicator};

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn no_inputs(name: &str) -> PredictorError {
    PredictorError::Failed {
        name: name.to_string(),
        reason: "no input indicators present".to_string(),
    }
}

/// Present (value, coefficient) pairs and the share of inputs found
fn gather(features: &FeatureSnapshot, inputs: &[(Indicator, f64)]) -> (Vec<(f64, f64)>, f64) {
    let present: Vec<(f64, f64)> = inputs
        .iter()
        .filter_map(|(i, c)| features.get(*i).map(|v| (v, *c)))
        .collect();
    let coverage = if inputs.is_empty() {
        0.0
    } else {
        present.len() as f64 / inputs.len() as f64
    };
    (present, coverage)
}

// ============================================================================
// Linear factor model
// ============================================================================

/// Linear combination of scaled trend/momentum factors squashed by tanh
#[derive(Debug, Clone)]
pub struct LinearFactorModel {
    pub coefficients: Vec<(Indicator, f64)>,
}

impl Default for LinearFactorModel {
    fn default() -> Self {
        Self {
            coefficients: vec![
                (Indicator::Trend5, 12.0),
                (Indicator::Trend20, 10.0),
                (Indicator::Trend50, 6.0),
                (Indicator::Momentum10, 8.0),
                (Indicator::PriceChange5, 5.0),
                (Indicator::ObvTrend, 4.0),
                (Indicator::Sentiment, 0.5),
            ],
        }
    }
}

#[async_trait]
impl MemberPredictor for LinearFactorModel {
    fn descriptor(&self) -> MemberDescriptor {
        MemberDescriptor::new("linear_factor", PredictorKind::LinearFactor)
    }

    async fn predict(
        &self,
        _symbol: &str,
        features: &FeatureSnapshot,
    ) -> Result<MemberOutput, PredictorError> {
        let (present, coverage) = gather(features, &self.coefficients);
        if present.is_empty() {
            return Err(no_inputs("linear_factor"));
        }
        let z: f64 = present.iter().map(|(v, c)| v * c).sum();
        let score = z.tanh();
        Ok(MemberOutput {
            score,
            confidence: (0.3 + 0.6 * score.abs()) * coverage.sqrt(),
            quality: 0.55 + 0.3 * coverage,
        })
    }
}

// ============================================================================
// Logistic trend model
// ============================================================================

/// Logistic probability of an up-move from multi-timeframe trend and MACD
#[derive(Debug, Clone)]
pub struct LogisticTrendModel {
    pub intercept: f64,
    pub coefficients: Vec<(Indicator, f64)>,
}

impl Default for LogisticTrendModel {
    fn default() -> Self {
        Self {
            intercept: 0.0,
            coefficients: vec![
                (Indicator::Trend5, 20.0),
                (Indicator::Trend20, 25.0),
                (Indicator::Trend50, 10.0),
                (Indicator::Momentum5, 15.0),
                (Indicator::MacdHistogram, 2.0),
                (Indicator::Adx14, 0.0),
            ],
        }
    }
}

#[async_trait]
impl MemberPredictor for LogisticTrendModel {
    fn descriptor(&self) -> MemberDescriptor {
        MemberDescriptor::new("logistic_trend", PredictorKind::Logistic)
    }

    async fn predict(
        &self,
        _symbol: &str,
        features: &FeatureSnapshot,
    ) -> Result<MemberOutput, PredictorError> {
        let (present, coverage) = gather(features, &self.coefficients);
        if present.is_empty() {
            return Err(no_inputs("logistic_trend"));
        }
        let logit = self.intercept + present.iter().map(|(v, c)| v * c).sum::<f64>();
        let p_up = sigmoid(logit);
        let score = 2.0 * p_up - 1.0;

        // ADX scales how much the trend reading can be trusted
        let adx_trust = features
            .get(Indicator::Adx14)
            .map(|a| (0.6 + a / 100.0).min(1.0))
            .unwrap_or(0.8);

        Ok(MemberOutput {
            score,
            confidence: (score.abs() * 0.7 + 0.2) * adx_trust,
            quality: 0.5 + 0.4 * coverage,
        })
    }
}

// ============================================================================
// Mean reversion model
// ============================================================================

/// Fades stretched oscillators back toward the mean
#[derive(Debug, Clone)]
pub struct MeanReversionModel {
    /// RSI distance from 50 (in RSI points) that counts as fully stretched
    pub rsi_stretch: f64,
    pub rsi_weight: f64,
    pub bollinger_weight: f64,
    pub stoch_weight: f64,
}

impl Default for MeanReversionModel {
    fn default() -> Self {
        Self {
            rsi_stretch: 30.0,
            rsi_weight: 0.5,
            bollinger_weight: 0.3,
            stoch_weight: 0.2,
        }
    }
}

#[async_trait]
impl MemberPredictor for MeanReversionModel {
    fn descriptor(&self) -> MemberDescriptor {
        MemberDescriptor::new("mean_reversion", PredictorKind::MeanReversion)
    }

    async fn predict(
        &self,
        _symbol: &str,
        features: &FeatureSnapshot,
    ) -> Result<MemberOutput, PredictorError> {
        let unit = |v: f64| if v > 1.0 { v / 100.0 } else { v };
        let stretches = [
            features
                .get(Indicator::Rsi14)
                .map(|r| (((r - 50.0) / self.rsi_stretch).clamp(-1.0, 1.0), self.rsi_weight)),
            features
                .get(Indicator::BollingerPosition)
                .map(|b| (((b - 0.5) * 2.0).clamp(-1.0, 1.0), self.bollinger_weight)),
            features
                .get(Indicator::StochRsi)
                .map(|s| (((unit(s) - 0.5) * 2.0).clamp(-1.0, 1.0), self.stoch_weight)),
        ];

        let (sum, weight) = stretches
            .iter()
            .flatten()
            .fold((0.0, 0.0), |(s, w), (x, wt)| (s + x * wt, w + wt));
        if weight <= 0.0 {
            return Err(no_inputs("mean_reversion"));
        }
        let stretch = sum / weight;
        let score = -stretch;

        // Reversion is less reliable while a strong trend is running
        let trend_penalty = features
            .trend_direction()
            .map(|t| 1.0 - (t.abs() / 0.05).min(0.5))
            .unwrap_or(1.0);

        Ok(MemberOutput {
            score,
            confidence: (0.25 + 0.65 * stretch.abs()) * trend_penalty,
            quality: 0.5 + 0.4 * (weight / (self.rsi_weight + self.bollinger_weight + self.stoch_weight)),
        })
    }
}

// ============================================================================
// Decision stump forest
// ============================================================================

/// Single-split vote: `above` when value > threshold, otherwise `below`
#[derive(Debug, Clone, Copy)]
pub struct Stump {
    pub indicator: Indicator,
    pub threshold: f64,
    pub above: f64,
    pub below: f64,
}

/// Averaged votes of independent decision stumps
#[derive(Debug, Clone)]
pub struct StumpForestModel {
    pub stumps: Vec<Stump>,
}

impl Default for StumpForestModel {
    fn default() -> Self {
        let stump = |indicator, threshold, above, below| Stump {
            indicator,
            threshold,
            above,
            below,
        };
        Self {
            stumps: vec![
                stump(Indicator::Trend20, 0.0, 1.0, -1.0),
                stump(Indicator::Trend5, 0.0, 0.6, -0.6),
                stump(Indicator::Momentum10, 0.01, 1.0, -0.3),
                stump(Indicator::Momentum10, -0.01, 0.3, -1.0),
                stump(Indicator::MacdHistogram, 0.0, 0.8, -0.8),
                stump(Indicator::Rsi14, 70.0, -0.7, 0.1),
                stump(Indicator::Rsi14, 30.0, -0.1, 0.7),
                stump(Indicator::VolumeRatio, 1.5, 0.4, 0.0),
                stump(Indicator::BollingerPosition, 0.9, -0.6, 0.1),
                stump(Indicator::DrawdownFromHigh, 0.15, -0.5, 0.2),
                stump(Indicator::MarketBreadth, 0.0, 0.5, -0.5),
            ],
        }
    }
}

#[async_trait]
impl MemberPredictor for StumpForestModel {
    fn descriptor(&self) -> MemberDescriptor {
        MemberDescriptor::new("stump_forest", PredictorKind::TreeEnsemble)
    }

    async fn predict(
        &self,
        _symbol: &str,
        features: &FeatureSnapshot,
    ) -> Result<MemberOutput, PredictorError> {
        let votes: Vec<f64> = self
            .stumps
            .iter()
            .filter_map(|s| {
                features.get(s.indicator).map(|v| {
                    if v > s.threshold {
                        s.above
                    } else {
                        s.below
                    }
                })
            })
            .collect();
        if votes.is_empty() {
            return Err(no_inputs("stump_forest"));
        }

        let score = (votes.iter().sum::<f64>() / votes.len() as f64).clamp(-1.0, 1.0);
        let direction = score.signum();
        let agreeing = votes
            .iter()
            .filter(|v| v.signum() == direction && **v != 0.0)
            .count();
        let agreement = agreeing as f64 / votes.len() as f64;
        let coverage = votes.len() as f64 / self.stumps.len() as f64;

        Ok(MemberOutput {
            score,
            confidence: (0.2 + 0.7 * agreement).min(1.0) * (0.5 + 0.5 * coverage),
            quality: 0.5 + 0.45 * coverage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml_engine::ModelRegistry;

    fn bullish() -> FeatureSnapshot {
        FeatureSnapshot::from_pairs([
            ("trend_5", 0.02),
            ("trend_20", 0.04),
            ("trend_50", 0.05),
            ("momentum_5", 0.02),
            ("momentum_10", 0.03),
            ("macd_histogram", 0.4),
            ("rsi_14", 60.0),
            ("volume_ratio", 1.7),
        ])
    }

    #[tokio::test]
    async fn test_trend_models_agree_on_uptrend() {
        let f = bullish();
        let linear = LinearFactorModel::default().predict("BTC", &f).await.unwrap();
        let logistic = LogisticTrendModel::default().predict("BTC", &f).await.unwrap();
        let forest = StumpForestModel::default().predict("BTC", &f).await.unwrap();
        assert!(linear.score > 0.3);
        assert!(logistic.score > 0.3);
        assert!(forest.score > 0.3);
    }

    #[tokio::test]
    async fn test_mean_reversion_fades_overbought() {
        let f = FeatureSnapshot::from_pairs([("rsi_14", 80.0), ("bollinger_position", 0.95)]);
        let out = MeanReversionModel::default().predict("BTC", &f).await.unwrap();
        assert!(out.score < -0.5);
    }

    #[tokio::test]
    async fn test_models_fail_without_inputs() {
        let f = FeatureSnapshot::new();
        for member in ModelRegistry::default_members().members() {
            let result = member.predict("BTC", &f).await;
            assert!(
                matches!(result, Err(PredictorError::Failed { .. })),
                "{} should fail",
                member.descriptor().name
            );
        }
    }

    #[tokio::test]
    async fn test_outputs_pass_validation() {
        let f = bullish();
        for member in ModelRegistry::default_members().members() {
            let name = member.descriptor().name;
            let out = member.predict("BTC", &f).await.unwrap();
            assert!(out.validate(&name).is_ok(), "{} -> {:?}", name, out);
        }
    }
}
