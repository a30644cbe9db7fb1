//! Stress scenarios - shock a position and re-price its risk

use serde::{Deserialize, Serialize};

use super::stats::parametric_var;

/// A deterministic market shock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub name: String,
    /// Instantaneous price move (e.g. -0.20 = -20%)
    pub price_shock: f64,
    /// Multiplier applied to current volatility
    pub volatility_multiplier: f64,
    /// Extra exit cost as fraction of position value
    pub liquidity_haircut: f64,
}

impl StressScenario {
    pub fn new(name: &str, price_shock: f64, volatility_multiplier: f64, liquidity_haircut: f64) -> Self {
        Self {
            name: name.to_string(),
            price_shock,
            volatility_multiplier,
            liquidity_haircut,
        }
    }

    /// Default scenario set
    pub fn defaults() -> Vec<StressScenario> {
        vec![
            StressScenario::new("flash_crash", -0.20, 3.0, 0.02),
            StressScenario::new("volatility_spike", -0.05, 4.0, 0.005),
            StressScenario::new("liquidity_drain", -0.08, 1.5, 0.05),
            StressScenario::new("gap_up", 0.15, 2.0, 0.01),
        ]
    }
}

/// Result of applying one scenario to a long position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressResult {
    pub scenario: String,
    /// Immediate loss (positive = loss) including liquidity haircut
    pub shock_loss: f64,
    /// Parametric VaR under the stressed volatility
    pub stressed_var: f64,
    /// shock_loss + stressed_var
    pub total_loss: f64,
}

/// Apply a scenario to a position value. Positive `position_value` = long, negative = short.
pub fn apply_scenario(
    position_value: f64,
    volatility: f64,
    z: f64,
    scenario: &StressScenario,
) -> StressResult {
    let pnl = position_value * scenario.price_shock;
    let haircut = position_value.abs() * scenario.liquidity_haircut.max(0.0);
    let shock_loss = (-pnl).max(0.0) + haircut;
    let stressed_vol = volatility.abs() * scenario.volatility_multiplier.max(0.0);
    let stressed_value = position_value.abs() * (1.0 + scenario.price_shock.min(0.0)).max(0.0);
    let stressed_var = parametric_var(stressed_value, stressed_vol, z);

    StressResult {
        scenario: scenario.name.clone(),
        shock_loss,
        stressed_var,
        total_loss: shock_loss + stressed_var,
    }
}

/// Apply every scenario, worst total loss first
pub fn run_stress_tests(
    position_value: f64,
    volatility: f64,
    z: f64,
    scenarios: &[StressScenario],
) -> Vec<StressResult> {
    let mut results: Vec<StressResult> = scenarios
        .iter()
        .map(|s| apply_scenario(position_value, volatility, z, s))
        .collect();
    results.sort_by(|a, b| b.total_loss.total_cmp(&a.total_loss));
    results
}
