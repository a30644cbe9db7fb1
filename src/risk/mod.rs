//! Risk Manager - Position sizing and risk controls
//!
//! Implements:
//! - Statistics library (VaR, CVaR, Sharpe, Sortino, drawdown)
//! - Half-Kelly sizing quotes
//! - Stress scenarios
//! - Risk-bounded position sizing
//! - Layered stop-loss / take-profit state machine

pub mod exits;
pub mod kelly;
pub mod sizing;
pub mod stats;
pub mod stress;

pub use exits::{
    ExitAssessment, ExitEvent, ExitLayer, ExitMonitor, ExitState, Severity, StopContext, StopRule,
};
pub use kelly::{compute_half_kelly, kelly_fraction, KellyQuote};
pub use sizing::{PositionSizer, RiskContext, RiskRule};
pub use stress::{run_stress_tests, StressResult, StressScenario};

use serde::{Deserialize, Serialize};

use crate::features::{FeatureSnapshot, Indicator};

/// Per-cycle risk view of a position value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    /// Signed exposure (negative = short)
    pub position_value: f64,
    pub volatility: f64,
    /// One-period parametric VaR
    pub parametric_var: f64,
    /// Worst stress scenario, if any were run
    pub worst_case: Option<StressResult>,
}

impl RiskSnapshot {
    /// Price the risk of `position_value` under the snapshot's volatility
    pub fn assess(
        position_value: f64,
        features: &FeatureSnapshot,
        default_volatility: f64,
        z: f64,
        scenarios: &[StressScenario],
    ) -> Self {
        let volatility = features
            .get(Indicator::Volatility20)
            .map(f64::abs)
            .unwrap_or(default_volatility);
        let worst_case = run_stress_tests(position_value, volatility, z, scenarios)
            .into_iter()
            .next();

        Self {
            position_value,
            volatility,
            parametric_var: stats::parametric_var(position_value, volatility, z),
            worst_case,
        }
    }
}
