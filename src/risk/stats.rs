//! Risk statistics - VaR, CVaR, Sharpe, Sortino, drawdown
//!
//! Pure functions over return series (fractions, e.g. 0.01 = +1%).
//! Losses are reported as positive fractions.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::StatsError;

/// Minimum observations for historical VaR / CVaR
pub const MIN_VAR_OBSERVATIONS: usize = 10;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// One-sided standard normal quantile, e.g. 0.95 -> 1.645
pub fn z_score(confidence: f64) -> Result<f64, StatsError> {
    check_confidence(confidence)?;
    let normal = Normal::new(0.0, 1.0).map_err(|e| StatsError::InvalidInput(e.to_string()))?;
    Ok(normal.inverse_cdf(confidence))
}

fn check_series(returns: &[f64], needed: usize) -> Result<(), StatsError> {
    if returns.len() < needed {
        return Err(StatsError::InsufficientData {
            needed,
            got: returns.len(),
        });
    }
    if returns.iter().any(|r| !r.is_finite()) {
        return Err(StatsError::InvalidInput("non-finite return".into()));
    }
    Ok(())
}

fn check_confidence(confidence: f64) -> Result<(), StatsError> {
    if !(confidence > 0.0 && confidence < 1.0) {
        return Err(StatsError::InvalidInput(format!(
            "confidence {} outside (0, 1)",
            confidence
        )));
    }
    Ok(())
}

fn sorted(returns: &[f64]) -> Vec<f64> {
    let mut s = returns.to_vec();
    s.sort_by(|a, b| a.total_cmp(b));
    s
}

/// Historical VaR: loss not exceeded with probability `confidence`
pub fn historical_var(returns: &[f64], confidence: f64) -> Result<f64, StatsError> {
    check_series(returns, MIN_VAR_OBSERVATIONS)?;
    check_confidence(confidence)?;

    let s = sorted(returns);
    let idx = (((1.0 - confidence) * s.len() as f64).floor() as usize).min(s.len() - 1);
    Ok((-s[idx]).max(0.0))
}

/// Parametric (normal) VaR for a position value
pub fn parametric_var(position_value: f64, volatility: f64, z: f64) -> f64 {
    (position_value.abs() * volatility.abs() * z.abs()).max(0.0)
}

/// Conditional VaR (expected shortfall) beyond the historical VaR
pub fn cvar(returns: &[f64], confidence: f64) -> Result<f64, StatsError> {
    check_series(returns, MIN_VAR_OBSERVATIONS)?;
    check_confidence(confidence)?;

    let s = sorted(returns);
    let tail_len = (((1.0 - confidence) * s.len() as f64).floor() as usize).max(1);
    let tail = &s[..tail_len];
    let avg = tail.iter().sum::<f64>() / tail.len() as f64;
    Ok((-avg).max(0.0))
}

/// Annualized Sharpe ratio
pub fn sharpe_ratio(
    returns: &[f64],
    risk_free_per_period: f64,
    periods_per_year: f64,
) -> Result<f64, StatsError> {
    check_series(returns, 2)?;
    let excess: Vec<f64> = returns.iter().map(|r| r - risk_free_per_period).collect();
    let m = mean(&excess).unwrap_or(0.0);
    let sd = std_dev(&excess).unwrap_or(0.0);
    if sd <= f64::EPSILON {
        return Ok(0.0);
    }
    Ok(m / sd * periods_per_year.max(1.0).sqrt())
}

/// Annualized Sortino ratio (downside deviation only)
pub fn sortino_ratio(
    returns: &[f64],
    target_per_period: f64,
    periods_per_year: f64,
) -> Result<f64, StatsError> {
    check_series(returns, 2)?;
    let m = mean(returns).unwrap_or(0.0) - target_per_period;
    let downside = returns
        .iter()
        .map(|r| (r - target_per_period).min(0.0).powi(2))
        .sum::<f64>()
        / returns.len() as f64;
    let dd = downside.sqrt();
    if dd <= f64::EPSILON {
        return Ok(if m > 0.0 { 10.0 } else { 0.0 });
    }
    Ok(m / dd * periods_per_year.max(1.0).sqrt())
}

/// Maximum peak-to-trough drawdown of a compounded return series, in [0, 1]
pub fn max_drawdown(returns: &[f64]) -> f64 {
    let mut equity = 1.0_f64;
    let mut peak = 1.0_f64;
    let mut max_dd = 0.0_f64;

    for r in returns.iter().filter(|r| r.is_finite()) {
        equity *= 1.0 + r.max(-1.0);
        peak = peak.max(equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - equity) / peak);
        }
    }

    max_dd.clamp(0.0, 1.0)
}
