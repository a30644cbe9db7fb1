//! Decision Engine - one evaluation cycle per symbol
//!
//! snapshot -> regime -> {rules, ensemble} -> fusion -> sizing -> exits -> outcome
//!
//! Every component is injected at construction; the engine holds no globals and
//! commits nothing while a cycle runs, so an abandoned cycle leaves no trace.

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::features::{FeatureSnapshot, Indicator};
use crate::fusion::{FusionController, FusionDecision};
use crate::ml_engine::{EnsemblePrediction, EnsembleRunner, ModelRegistry};
use crate::performance::PerformanceStore;
use crate::regime::{RegimeClassification, RegimeClassifier, RegimeLabel, ThresholdTable};
use crate::risk::{ExitEvent, ExitMonitor, ExitState, PositionSizer, RiskSnapshot, StressScenario};
use crate::strategy::{RuleEngine, RuleSignal};
use crate::types::{Action, AllocationDecision, PositionSide, PositionState};

/// Inputs of one cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRequest {
    pub symbol: String,
    pub features: FeatureSnapshot,
    pub position: PositionState,
    /// Deployable cash in quote currency
    pub cash: f64,
    /// Externally supplied regime label; replaces the classifier's label when set
    #[serde(default)]
    pub regime_override: Option<String>,
}

impl CycleRequest {
    pub fn new(symbol: &str, features: FeatureSnapshot, position: PositionState, cash: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            features,
            position,
            cash,
            regime_override: None,
        }
    }

    pub fn with_regime(mut self, label: &str) -> Self {
        self.regime_override = Some(label.to_string());
        self
    }

    /// Reference price: the position mark when positioned, else the snapshot price
    pub fn price(&self) -> Option<f64> {
        if self.position.has_position && self.position.current_price > 0.0 {
            Some(self.position.current_price)
        } else {
            self.features.get(Indicator::Price).filter(|p| *p > 0.0)
        }
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::InvalidInput("empty symbol".into()));
        }
        if !self.cash.is_finite() {
            return Err(EngineError::InvalidInput(format!("cash={}", self.cash)));
        }
        let p = &self.position;
        if p.has_position && !(p.entry_price.is_finite() && p.current_price.is_finite()) {
            return Err(EngineError::InvalidInput(format!(
                "non-finite position prices for {}",
                self.symbol
            )));
        }
        Ok(())
    }
}

/// Everything a cycle produced, returned as one value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub cycle_id: Uuid,
    pub symbol: String,
    pub regime: RegimeClassification,
    pub rule: RuleSignal,
    pub ensemble: Option<EnsemblePrediction>,
    pub fusion: FusionDecision,
    /// Present only for entries (buy / short)
    pub allocation: Option<AllocationDecision>,
    /// Exit layer that overrode the fused decision
    pub exit: Option<ExitEvent>,
    pub exit_state: ExitState,
    pub risk: Option<RiskSnapshot>,
    /// Final action after any exit override
    pub action: Action,
    pub confidence: f64,
    pub evaluated_at: DateTime<Utc>,
    pub latency_ms: u64,
}

impl CycleOutcome {
    pub fn overridden(&self) -> bool {
        self.exit.is_some()
    }
}

pub struct DecisionEngine {
    config: EngineConfig,
    classifier: RegimeClassifier,
    rules: RuleEngine,
    ensemble: EnsembleRunner,
    fusion: FusionController,
    sizer: PositionSizer,
    exits: ExitMonitor,
    store: PerformanceStore,
    scenarios: Vec<StressScenario>,
    budget: Duration,
}

impl DecisionEngine {
    /// Build from validated config; threshold rows with unknown labels are rejected
    pub fn new(
        config: EngineConfig,
        registry: ModelRegistry,
        store: PerformanceStore,
    ) -> Result<Self, EngineError> {
        let config = config.validated();
        let thresholds = ThresholdTable::from_rows(&config.thresholds)?;

        let missing = config.missing_threshold_rows();
        if !missing.is_empty() {
            warn!("no threshold policy for regimes {:?}; cycles in them will fail", missing);
        }
        if registry.is_empty() {
            warn!("model registry is empty, cycles will run rule-only");
        }

        info!(
            "🧠 Decision engine ready: {} members, {} threshold rows | {}",
            registry.len(),
            thresholds.len(),
            config.digest()
        );

        Ok(Self {
            classifier: RegimeClassifier::new(config.regime.clone()),
            rules: RuleEngine::new(config.rules.clone(), thresholds.clone()),
            ensemble: EnsembleRunner::new(registry, config.ensemble.clone(), &config.runtime),
            fusion: FusionController::new(config.fusion.clone(), thresholds),
            sizer: PositionSizer::new(config.sizing.clone()),
            exits: ExitMonitor::new(config.exits.clone()),
            store,
            scenarios: StressScenario::defaults(),
            budget: Duration::from_millis(config.runtime.cycle_budget_ms),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &PerformanceStore {
        &self.store
    }

    pub fn with_scenarios(mut self, scenarios: Vec<StressScenario>) -> Self {
        self.scenarios = scenarios;
        self
    }

    fn classify(&self, request: &CycleRequest) -> Result<RegimeClassification, EngineError> {
        let classification = self.classifier.classify(&request.features);
        match &request.regime_override {
            None => Ok(classification),
            Some(label) => {
                let label: RegimeLabel = label.parse()?;
                Ok(RegimeClassification {
                    label,
                    ..classification
                })
            }
        }
    }

    /// Run one cycle for one symbol
    pub async fn evaluate(&self, request: &CycleRequest) -> Result<CycleOutcome, EngineError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", symbol = %request.symbol, cycle_id = %cycle_id);
        self.run_cycle(cycle_id, request).instrument(span).await
    }

    async fn run_cycle(&self, cycle_id: Uuid, request: &CycleRequest) -> Result<CycleOutcome, EngineError> {
        let started = Instant::now();
        request.validate()?;

        let features = &request.features;
        let position = &request.position;
        let regime = self.classify(request)?;
        let history = self.store.get(&request.symbol).await;

        let remaining = self.budget.saturating_sub(started.elapsed());
        let (rule, ensemble) = tokio::join!(
            async { self.rules.score(features, &regime, position, history.as_ref()) },
            self.ensemble.predict(&request.symbol, features, remaining),
        );
        let rule = rule?;

        let fusion = self.fusion.fuse(
            ensemble.as_ref(),
            &rule,
            &regime,
            position,
            history.as_ref(),
            features,
        )?;

        let mut action = fusion.action;
        let mut confidence = fusion.confidence;

        let mut allocation = match (action, request.price()) {
            (Action::Buy | Action::Short, Some(price)) => {
                let adding = position.has_position
                    && matches!(
                        (position.side, action),
                        (PositionSide::Long, Action::Buy) | (PositionSide::Short, Action::Short)
                    );
                Some(self.sizer.size(&fusion, request.cash, price, features, history.as_ref(), adding))
            }
            (Action::Buy | Action::Short, None) => {
                debug!("no reference price, skipping sizing");
                None
            }
            _ => None,
        };

        let mut exit_state = ExitState::from_position(position);
        let mut exit = None;
        if position.has_position {
            let assessment = self.exits.evaluate(position, features);
            exit_state = assessment.state;
            if let Some(event) = assessment.trigger {
                action = event.action;
                confidence = event.confidence;
                allocation = None;
                exit = Some(event);
            }
        }

        let risk = allocation.as_ref().map(|a| {
            let notional = a.position_fraction * request.cash.max(0.0) * f64::from(action.direction());
            RiskSnapshot::assess(
                notional,
                features,
                self.config.sizing.default_volatility,
                self.config.sizing.var_z(),
                &self.scenarios,
            )
        });

        let latency_ms = started.elapsed().as_millis() as u64;
        if started.elapsed() > self.budget {
            warn!("cycle over budget: {}ms > {}ms", latency_ms, self.budget.as_millis());
        }

        info!(
            "{} regime={} action={} conf={:.2} score={:.3} ml_w={:.2} members={} exit={} ({}ms)",
            request.symbol,
            regime.label,
            action,
            confidence,
            fusion.score,
            fusion.ml_weight,
            ensemble.as_ref().map_or(0, |e| e.members_used),
            exit.as_ref().map_or_else(|| "-".to_string(), |e| e.layer.to_string()),
            latency_ms
        );

        Ok(CycleOutcome {
            cycle_id,
            symbol: request.symbol.clone(),
            regime,
            rule,
            ensemble,
            fusion,
            allocation,
            exit,
            exit_state,
            risk,
            action,
            confidence,
            evaluated_at: Utc::now(),
            latency_ms,
        })
    }

    /// Evaluate many symbols concurrently; one symbol's error never affects another
    pub async fn evaluate_batch(
        &self,
        requests: &[CycleRequest],
    ) -> Vec<(String, Result<CycleOutcome, EngineError>)> {
        let results = join_all(requests.iter().map(|r| self.evaluate(r))).await;
        requests
            .iter()
            .map(|r| r.symbol.clone())
            .zip(results)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PredictorError;
    use crate::ml_engine::{MemberDescriptor, MemberOutput, MemberPredictor, PredictorKind};
    use crate::types::PerformanceHistory;

    fn engine() -> DecisionEngine {
        DecisionEngine::new(
            EngineConfig::default(),
            ModelRegistry::default_members(),
            PerformanceStore::new(),
        )
        .unwrap()
    }

    fn bullish() -> FeatureSnapshot {
        FeatureSnapshot::new()
            .with(Indicator::Price, 100.0)
            .with(Indicator::Trend5, 0.03)
            .with(Indicator::Trend20, 0.04)
            .with(Indicator::Trend50, 0.05)
            .with(Indicator::Momentum10, 0.04)
            .with(Indicator::Rsi14, 60.0)
            .with(Indicator::Volatility20, 0.015)
            .with(Indicator::MacdSignal, 0.5)
            .with(Indicator::VolumeTrend, 0.2)
    }

    #[tokio::test]
    async fn test_empty_symbol_is_invalid() {
        let r = CycleRequest::new(" ", bullish(), PositionState::flat(), 1000.0);
        assert!(matches!(engine().evaluate(&r).await, Err(EngineError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_unparseable_override_is_unknown_regime() {
        let r = CycleRequest::new("BTC", bullish(), PositionState::flat(), 1000.0)
            .with_regime("mega-bull");
        assert!(matches!(engine().evaluate(&r).await, Err(EngineError::UnknownRegime(_))));
    }

    #[tokio::test]
    async fn test_override_replaces_label() {
        let r = CycleRequest::new("BTC", bullish(), PositionState::flat(), 1000.0)
            .with_regime("strong_bear");
        let out = engine().evaluate(&r).await.unwrap();
        assert_eq!(out.regime.label, RegimeLabel::StrongBear);
    }

    #[tokio::test]
    async fn test_missing_row_fails_cycle() {
        let mut config = EngineConfig::default();
        config.thresholds.remove("sideways");
        let engine = DecisionEngine::new(config, ModelRegistry::new(), PerformanceStore::new()).unwrap();
        let r = CycleRequest::new("BTC", FeatureSnapshot::new(), PositionState::flat(), 1000.0)
            .with_regime("sideways");
        assert_eq!(
            engine.evaluate(&r).await.unwrap_err(),
            EngineError::UnknownRegime("sideways".into())
        );
    }

    /// Member with a constant bullish reading
    struct Fixed(&'static str, f64);

    #[async_trait::async_trait]
    impl MemberPredictor for Fixed {
        fn descriptor(&self) -> MemberDescriptor {
            MemberDescriptor::new(self.0, PredictorKind::External)
        }

        async fn predict(
            &self,
            _symbol: &str,
            _features: &FeatureSnapshot,
        ) -> Result<MemberOutput, PredictorError> {
            Ok(MemberOutput {
                score: self.1,
                confidence: 0.9,
                quality: 0.9,
            })
        }
    }

    #[tokio::test]
    async fn test_entry_is_sized_and_risk_assessed() {
        let registry = ModelRegistry::new()
            .with(Fixed("a", 0.9))
            .with(Fixed("b", 0.9))
            .with(Fixed("c", 0.9));
        let engine = DecisionEngine::new(EngineConfig::default(), registry, PerformanceStore::new())
            .unwrap()
            .with_scenarios(vec![StressScenario::new("exchange_halt", -0.5, 2.0, 0.1)]);
        engine
            .store()
            .seed("BTC", PerformanceHistory::new(0.55, 1.0, 0.05, 40))
            .await;
        let r = CycleRequest::new("BTC", bullish(), PositionState::flat(), 10_000.0)
            .with_regime("strong_bull");
        let out = engine.evaluate(&r).await.unwrap();

        assert_eq!(out.action, Action::Buy);
        let a = out.allocation.as_ref().unwrap();
        assert!(a.position_fraction >= 0.01 && a.position_fraction <= 0.25);
        let risk = out.risk.as_ref().unwrap();
        assert!(risk.position_value > 0.0);
        assert_eq!(risk.worst_case.as_ref().unwrap().scenario, "exchange_halt");
        assert_eq!(out.exit_state, ExitState::Flat);
    }

    #[tokio::test]
    async fn test_batch_keeps_symbol_order() {
        let engine = engine();
        let requests = vec![
            CycleRequest::new("BTC", bullish(), PositionState::flat(), 1000.0),
            CycleRequest::new("", bullish(), PositionState::flat(), 1000.0),
            CycleRequest::new("ETH", FeatureSnapshot::new(), PositionState::flat(), 1000.0),
        ];
        let results = engine.evaluate_batch(&requests).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "BTC");
        assert!(results[0].1.is_ok());
        assert!(results[1].1.is_err());
        assert!(results[2].1.is_ok());
    }
}
