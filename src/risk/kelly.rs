/// Kelly sizing quote for a win probability and reward:risk payoff
#[derive(Debug, Clone, Copy)]
pub struct KellyQuote {
    pub p_win: f64,
    pub reward_risk: f64,
    pub f_raw: f64,
    pub f_half: f64,
    pub f_discounted: f64,
    pub f_bounded: f64,
}

/// Full Kelly fraction `p - (1 - p) / b`, floored at zero
pub fn kelly_fraction(p_win: f64, reward_risk: f64) -> f64 {
    if !(reward_risk > 0.0) || !p_win.is_finite() {
        return 0.0;
    }
    let p = p_win.clamp(0.0, 1.0);
    (p - (1.0 - p) / reward_risk).max(0.0)
}

/// Half-Kelly, discounted by volatility and bounded to `[floor, cap]`
///
/// `volatility_discount` is the fraction removed per unit of `volatility / vol_scale`,
/// itself capped at 50%.
pub fn compute_half_kelly(
    p_win: f64,
    reward_risk: f64,
    volatility: f64,
    vol_scale: f64,
    floor: f64,
    cap: f64,
) -> KellyQuote {
    let p = if p_win.is_finite() { p_win.clamp(0.01, 0.99) } else { 0.5 };
    let b = if reward_risk.is_finite() && reward_risk > 0.0 {
        reward_risk
    } else {
        1.0
    };

    let f_raw = kelly_fraction(p, b);
    let f_half = f_raw * 0.5;

    let vol = if volatility.is_finite() { volatility.abs() } else { 0.0 };
    let discount = if vol_scale > 0.0 {
        (vol / vol_scale).min(0.5)
    } else {
        0.0
    };
    let f_discounted = f_half * (1.0 - discount);
    let f_bounded = f_discounted.clamp(floor.min(cap), cap.max(floor));

    KellyQuote {
        p_win: p,
        reward_risk: b,
        f_raw,
        f_half,
        f_discounted,
        f_bounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kelly_zero_when_negative_edge() {
        assert_eq!(kelly_fraction(0.40, 1.0), 0.0);
    }

    #[test]
    fn kelly_matches_closed_form() {
        // p = 0.6, b = 2 -> 0.6 - 0.4 / 2 = 0.4
        assert!((kelly_fraction(0.6, 2.0) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn half_kelly_is_bounded() {
        let q = compute_half_kelly(0.99, 50.0, 0.0, 0.1, 0.1, 0.4);
        assert_eq!(q.f_bounded, 0.4);

        let q = compute_half_kelly(0.1, 0.5, 0.3, 0.1, 0.1, 0.5);
        assert_eq!(q.f_bounded, 0.1);
    }

    #[test]
    fn volatility_discounts_half_kelly() {
        let calm = compute_half_kelly(0.6, 2.0, 0.0, 0.1, 0.0, 1.0);
        let wild = compute_half_kelly(0.6, 2.0, 0.05, 0.1, 0.0, 1.0);
        assert!(wild.f_discounted < calm.f_discounted);
    }
}
