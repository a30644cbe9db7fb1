//! Cross-family signal consistency
//!
//! Agreement across the independent families (trend, momentum, MACD, volume) scales
//! the raw score between 0.5 (everything disagrees) and 1.4 (unanimous and strong).

use crate::features::IndicatorFamily;

/// Families that vote on consistency
pub const CONSISTENCY_FAMILIES: [IndicatorFamily; 4] = [
    IndicatorFamily::Trend,
    IndicatorFamily::Momentum,
    IndicatorFamily::Macd,
    IndicatorFamily::Volume,
];

pub const MIN_RATIO: f64 = 0.5;
pub const MAX_RATIO: f64 = 1.4;

/// Consistency ratio and the evidence behind it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsistencyReport {
    pub ratio: f64,
    pub families_present: usize,
    pub families_agreeing: usize,
    /// Share of family strength that agrees with the score direction
    pub agreeing_strength: f64,
    /// True when too few families were present and the fallback ratio was used
    pub insufficient: bool,
}

/// Score consistency from per-term weighted contributions
///
/// `contributions` pairs each present term's family with `weight * signal`.
pub fn consistency_ratio(
    contributions: &[(IndicatorFamily, f64)],
    direction: f64,
    min_families: usize,
    fallback: f64,
) -> ConsistencyReport {
    let family_sums: Vec<f64> = CONSISTENCY_FAMILIES
        .iter()
        .filter_map(|family| {
            let mut present = false;
            let sum: f64 = contributions
                .iter()
                .filter(|(f, _)| f == family)
                .inspect(|_| present = true)
                .map(|(_, c)| *c)
                .sum();
            present.then_some(sum)
        })
        .collect();

    let families_present = family_sums.len();
    if families_present < min_families {
        return ConsistencyReport {
            ratio: fallback,
            families_present,
            families_agreeing: 0,
            agreeing_strength: 0.0,
            insufficient: true,
        };
    }

    let sign = direction.signum();
    let agreeing: Vec<f64> = family_sums
        .iter()
        .copied()
        .filter(|s| direction != 0.0 && s.signum() == sign && *s != 0.0)
        .collect();

    let total_strength: f64 = family_sums.iter().map(|s| s.abs()).sum();
    let agreeing_strength = if total_strength > 0.0 {
        agreeing.iter().map(|s| s.abs()).sum::<f64>() / total_strength
    } else {
        0.0
    };
    let fraction = agreeing.len() as f64 / families_present as f64;

    let ratio = MIN_RATIO + (MAX_RATIO - MIN_RATIO) * (0.6 * fraction + 0.4 * agreeing_strength);

    ConsistencyReport {
        ratio: ratio.clamp(MIN_RATIO, MAX_RATIO),
        families_present,
        families_agreeing: agreeing.len(),
        agreeing_strength,
        insufficient: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IndicatorFamily::*;

    #[test]
    fn test_fallback_below_three_families() {
        let report = consistency_ratio(&[(Trend, 0.1), (Momentum, 0.1)], 1.0, 3, 0.8);
        assert!(report.insufficient);
        assert_eq!(report.ratio, 0.8);
    }

    #[test]
    fn test_unanimous_agreement_hits_ceiling() {
        let c = [(Trend, 0.1), (Momentum, 0.05), (Macd, 0.02), (Volume, 0.03)];
        let report = consistency_ratio(&c, 1.0, 3, 0.8);
        assert_eq!(report.families_agreeing, 4);
        assert!((report.ratio - MAX_RATIO).abs() < 1e-12);
    }

    #[test]
    fn test_total_disagreement_hits_floor() {
        let c = [(Trend, -0.1), (Momentum, -0.05), (Macd, -0.02)];
        let report = consistency_ratio(&c, 1.0, 3, 0.8);
        assert_eq!(report.families_agreeing, 0);
        assert!((report.ratio - MIN_RATIO).abs() < 1e-12);
    }

    #[test]
    fn test_non_voting_families_are_ignored() {
        let c = [(Trend, 0.1), (Oscillator, -0.5), (Structure, -0.3)];
        let report = consistency_ratio(&c, 1.0, 3, 0.8);
        assert_eq!(report.families_present, 1);
        assert!(report.insufficient);
    }
}
