//! FusionBot Library
//!
//! Adaptive single-symbol decision engine: regime classification, rule scoring,
//! ensemble fusion, risk-bounded sizing and layered exits

pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod fusion;
pub mod ml_engine;
pub mod performance;
pub mod regime;
pub mod risk;
pub mod strategy;
pub mod types;

pub use config::EngineConfig;
pub use engine::{CycleOutcome, CycleRequest, DecisionEngine};
pub use error::{EngineError, PredictorError, StatsError};
pub use features::{FeatureSnapshot, Indicator};
pub use fusion::{FusionController, FusionDecision};
pub use ml_engine::{EnsemblePrediction, MemberPredictor, ModelRegistry};
pub use performance::{PerformanceRecorder, PerformanceStore, TradeOutcome};
pub use regime::{RegimeClassification, RegimeClassifier, RegimeLabel};
pub use types::{Action, AllocationDecision, PerformanceHistory, PositionState};
