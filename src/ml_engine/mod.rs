//! ML Engine - Ensemble model fusion
//!
//! This module implements:
//! - The inference contract for ensemble members ([`MemberPredictor`])
//! - An injected model registry (no global singletons)
//! - Concurrent fan-out with per-member timeouts
//! - Outlier-filtered, quality-weighted aggregation

pub mod ensemble;
pub mod models;

pub use ensemble::{EnsembleAggregator, EnsemblePrediction, MemberResult};
pub use models::{LinearFactorModel, LogisticTrendModel, MeanReversionModel, StumpForestModel};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{EnsembleConfig, RuntimeConfig};
use crate::error::PredictorError;
use crate::features::FeatureSnapshot;

/// Predictor family, used by the aggregation heuristics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    LinearFactor,
    Logistic,
    MeanReversion,
    TreeEnsemble,
    External,
}

/// Static description of a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    pub name: String,
    pub kind: PredictorKind,
}

impl MemberDescriptor {
    pub fn new(name: &str, kind: PredictorKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

/// Raw member output: (score, confidence, quality)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemberOutput {
    pub score: f64,
    pub confidence: f64,
    pub quality: f64,
}

impl MemberOutput {
    /// Reject NaN/Inf and out-of-range fields
    pub fn validate(self, name: &str) -> Result<Self, PredictorError> {
        let fields = [
            ("score", self.score, -1.0, 1.0),
            ("confidence", self.confidence, 0.0, 1.0),
            ("quality", self.quality, 0.0, 1.0),
        ];
        for (field, value, lo, hi) in fields {
            if !value.is_finite() {
                return Err(PredictorError::NonFinite {
                    name: name.to_string(),
                });
            }
            if value < lo || value > hi {
                return Err(PredictorError::OutOfRange {
                    name: name.to_string(),
                    field,
                    value,
                });
            }
        }
        Ok(self)
    }
}

/// Inference contract of an ensemble member
///
/// Implementations must be pure functions of (symbol, snapshot).
#[async_trait]
pub trait MemberPredictor: Send + Sync {
    fn descriptor(&self) -> MemberDescriptor;

    async fn predict(
        &self,
        symbol: &str,
        features: &FeatureSnapshot,
    ) -> Result<MemberOutput, PredictorError>;
}

/// Registry of ensemble members, injected into the engine
#[derive(Clone, Default)]
pub struct ModelRegistry {
    members: Vec<Arc<dyn MemberPredictor>>,
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.members.iter().map(|m| m.descriptor().name).collect();
        f.debug_struct("ModelRegistry").field("members", &names).finish()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in inference models
    pub fn default_members() -> Self {
        Self::new()
            .with(LinearFactorModel::default())
            .with(LogisticTrendModel::default())
            .with(MeanReversionModel::default())
            .with(StumpForestModel::default())
    }

    pub fn with<P: MemberPredictor + 'static>(mut self, member: P) -> Self {
        self.register(Arc::new(member));
        self
    }

    pub fn register(&mut self, member: Arc<dyn MemberPredictor>) {
        self.members.push(member);
    }

    pub fn members(&self) -> &[Arc<dyn MemberPredictor>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Fans out to every member under a timeout and aggregates what comes back
#[derive(Debug, Clone)]
pub struct EnsembleRunner {
    registry: ModelRegistry,
    aggregator: EnsembleAggregator,
    member_timeout: Duration,
}

impl EnsembleRunner {
    pub fn new(registry: ModelRegistry, config: EnsembleConfig, runtime: &RuntimeConfig) -> Self {
        Self {
            registry,
            aggregator: EnsembleAggregator::new(config),
            member_timeout: Duration::from_millis(runtime.member_timeout_ms),
        }
    }

    async fn run_member(
        member: &Arc<dyn MemberPredictor>,
        symbol: &str,
        features: &FeatureSnapshot,
        timeout: Duration,
    ) -> Result<MemberResult, PredictorError> {
        let descriptor = member.descriptor();
        let output = tokio::time::timeout(timeout, member.predict(symbol, features))
            .await
            .map_err(|_| PredictorError::TimedOut {
                name: descriptor.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })??
            .validate(&descriptor.name)?;

        Ok(MemberResult {
            name: descriptor.name,
            kind: descriptor.kind,
            output,
        })
    }

    /// Predict for a symbol within `budget`; member failures never fail the call
    pub async fn predict(
        &self,
        symbol: &str,
        features: &FeatureSnapshot,
        budget: Duration,
    ) -> Option<EnsemblePrediction> {
        if self.registry.is_empty() {
            return None;
        }

        let timeout = self.member_timeout.min(budget);
        let results = join_all(
            self.registry
                .members()
                .iter()
                .map(|m| Self::run_member(m, symbol, features, timeout)),
        )
        .await;

        let mut ok = Vec::with_capacity(results.len());
        let mut failed = 0;
        for result in results {
            match result {
                Ok(member) => ok.push(member),
                Err(e) => {
                    warn!("ensemble member excluded for {}: {}", symbol, e);
                    failed += 1;
                }
            }
        }

        let prediction = self.aggregator.aggregate(&ok, failed);
        if let Some(p) = &prediction {
            debug!(
                "ensemble {} score={:.3} conf={:.3} quality={:.3} used={} failed={}",
                symbol, p.score, p.confidence, p.quality, p.members_used, p.members_failed
            );
        }
        prediction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(MemberOutput);

    #[async_trait]
    impl MemberPredictor for Fixed {
        fn descriptor(&self) -> MemberDescriptor {
            MemberDescriptor::new("fixed", PredictorKind::External)
        }

        async fn predict(
            &self,
            _symbol: &str,
            _features: &FeatureSnapshot,
        ) -> Result<MemberOutput, PredictorError> {
            Ok(self.0)
        }
    }

    struct Slow;

    #[async_trait]
    impl MemberPredictor for Slow {
        fn descriptor(&self) -> MemberDescriptor {
            MemberDescriptor::new("slow", PredictorKind::External)
        }

        async fn predict(
            &self,
            _symbol: &str,
            _features: &FeatureSnapshot,
        ) -> Result<MemberOutput, PredictorError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(MemberOutput {
                score: 1.0,
                confidence: 1.0,
                quality: 1.0,
            })
        }
    }

    fn out(score: f64) -> MemberOutput {
        MemberOutput {
            score,
            confidence: 0.8,
            quality: 0.8,
        }
    }

    #[test]
    fn test_validation_rejects_bad_outputs() {
        assert!(matches!(
            out(f64::NAN).validate("m"),
            Err(PredictorError::NonFinite { .. })
        ));
        assert!(matches!(
            out(1.5).validate("m"),
            Err(PredictorError::OutOfRange { field: "score", .. })
        ));
        assert!(out(0.3).validate("m").is_ok());
    }

    #[tokio::test]
    async fn test_failed_members_are_excluded() {
        let registry = ModelRegistry::new()
            .with(Fixed(out(0.4)))
            .with(Fixed(out(0.42)))
            .with(Fixed(out(f64::INFINITY)));
        let runner = EnsembleRunner::new(registry, EnsembleConfig::default(), &RuntimeConfig::default());

        let p = runner
            .predict("BTC", &FeatureSnapshot::new(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(p.members_used, 2);
        assert_eq!(p.members_failed, 1);
    }

    #[tokio::test]
    async fn test_slow_member_times_out() {
        let registry = ModelRegistry::new()
            .with(Fixed(out(0.3)))
            .with(Fixed(out(0.32)))
            .with(Slow);
        let runner = EnsembleRunner::new(registry, EnsembleConfig::default(), &RuntimeConfig::default());

        let p = runner
            .predict("ETH", &FeatureSnapshot::new(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(p.members_used, 2);
        assert_eq!(p.members_failed, 1);
        assert!(p.score < 0.5);
    }

    #[tokio::test]
    async fn test_empty_registry_yields_nothing() {
        let runner = EnsembleRunner::new(
            ModelRegistry::new(),
            EnsembleConfig::default(),
            &RuntimeConfig::default(),
        );
        assert!(runner
            .predict("SOL", &FeatureSnapshot::new(), Duration::from_millis(500))
            .await
            .is_none());
    }
}
