//! Ensemble aggregation
//!
//! Combines member outputs into one score/confidence/quality triple:
//! 1. Per-member weight = confidence × quality × kind heuristic × magnitude factor
//! 2. Leave-one-out outlier rejection (skipped if fewer than `min_members` would remain)
//! 3. Weighted average of survivors
//! 4. Consistency and diversity bonuses scale confidence
//! 5. Post-processing: compress high-disagreement aggregates, amplify mid-strength ones

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{MemberOutput, PredictorKind};
use crate::config::EnsembleConfig;
use crate::risk::stats::{mean, std_dev};

/// One member result that passed validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberResult {
    pub name: String,
    pub kind: PredictorKind,
    pub output: MemberOutput,
}

/// Aggregated ensemble prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsemblePrediction {
    /// Aggregate score in [-1, 1]
    pub score: f64,
    /// Aggregate confidence in [0, 1]
    pub confidence: f64,
    /// Predictor-health proxy in [0, 1]
    pub quality: f64,
    pub members_used: usize,
    pub members_failed: usize,
    pub outliers_removed: Vec<String>,
    /// max - min score of the surviving members
    pub spread: f64,
    pub consistency_bonus: f64,
    pub diversity_bonus: f64,
}

/// Stateless aggregator
#[derive(Debug, Clone, Default)]
pub struct EnsembleAggregator {
    config: EnsembleConfig,
}

impl EnsembleAggregator {
    pub fn new(config: EnsembleConfig) -> Self {
        Self { config }
    }

    /// Type heuristic: tree ensembles and logistic models earn slightly more trust
    fn kind_factor(kind: PredictorKind) -> f64 {
        match kind {
            PredictorKind::TreeEnsemble => 1.1,
            PredictorKind::Logistic => 1.05,
            PredictorKind::MeanReversion => 0.95,
            PredictorKind::LinearFactor => 0.9,
            PredictorKind::External => 1.0,
        }
    }

    fn magnitude_factor(&self, score: f64) -> f64 {
        let s = score.abs();
        if s >= self.config.strong_score {
            1.2
        } else if s < self.config.weak_score {
            0.6
        } else {
            1.0
        }
    }

    fn member_weight(&self, m: &MemberResult) -> f64 {
        m.output.confidence
            * m.output.quality
            * Self::kind_factor(m.kind)
            * self.magnitude_factor(m.output.score)
    }

    /// Indices of members that survive outlier rejection
    ///
    /// Each member is tested against the mean/std of the *other* members; with a
    /// handful of members a full-sample z-score can never exceed ~1.7.
    fn surviving(&self, members: &[MemberResult]) -> (Vec<usize>, Vec<usize>) {
        let all: Vec<usize> = (0..members.len()).collect();
        if members.len() <= self.config.min_members {
            return (all, Vec::new());
        }

        let scores: Vec<f64> = members.iter().map(|m| m.output.score).collect();
        let mut keep = Vec::with_capacity(members.len());
        let mut drop = Vec::new();

        for (i, score) in scores.iter().enumerate() {
            let others: Vec<f64> = scores
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| *s)
                .collect();
            let m = mean(&others).unwrap_or(0.0);
            // Floor scales with the others' magnitude so near-zero ensembles still filter
            let magnitude = others.iter().map(|s| s.abs()).sum::<f64>() / others.len() as f64;
            let sd = std_dev(&others)
                .unwrap_or(0.0)
                .max(self.config.outlier_relative_floor * magnitude)
                .max(self.config.outlier_std_floor);
            if (score - m).abs() > self.config.outlier_sigma * sd {
                drop.push(i);
            } else {
                keep.push(i);
            }
        }

        if keep.len() < self.config.min_members {
            return (all, Vec::new());
        }
        (keep, drop)
    }

    fn consistency_bonus(&self, spread: f64) -> f64 {
        if spread < self.config.tight_spread {
            1.2
        } else if spread > self.config.wide_spread {
            0.8
        } else {
            1.0
        }
    }

    /// Moderate disagreement is healthy; lockstep and chaos are both penalized
    fn diversity_bonus(&self, spread: f64) -> f64 {
        let c = &self.config;
        if spread < c.consensus_spread {
            0.9
        } else if spread > c.extreme_spread {
            0.8
        } else if spread >= c.moderate_spread_low && spread <= c.moderate_spread_high {
            1.1
        } else {
            1.0
        }
    }

    fn post_process(&self, score: f64, spread: f64) -> f64 {
        let mut s = score;
        if spread > self.config.wide_spread {
            s *= 0.7;
        }
        if (0.3..=0.6).contains(&s.abs()) {
            s *= 1.05;
        }
        s.clamp(-1.0, 1.0)
    }

    /// Aggregate validated member results; `None` when nothing is usable
    pub fn aggregate(
        &self,
        members: &[MemberResult],
        members_failed: usize,
    ) -> Option<EnsemblePrediction> {
        if members.is_empty() {
            return None;
        }

        let (keep, drop) = self.surviving(members);
        let survivors: Vec<&MemberResult> = keep.iter().map(|i| &members[*i]).collect();

        let weights: Vec<f64> = survivors.iter().map(|m| self.member_weight(m)).collect();
        let total_weight: f64 = weights.iter().sum();
        let n = survivors.len() as f64;

        let (raw_score, raw_confidence, raw_quality) = if total_weight > f64::EPSILON {
            survivors.iter().zip(&weights).fold((0.0, 0.0, 0.0), |acc, (m, w)| {
                (
                    acc.0 + m.output.score * w / total_weight,
                    acc.1 + m.output.confidence * w / total_weight,
                    acc.2 + m.output.quality * w / total_weight,
                )
            })
        } else {
            // Every member reported zero confidence or quality: plain average
            survivors.iter().fold((0.0, 0.0, 0.0), |acc, m| {
                (
                    acc.0 + m.output.score / n,
                    acc.1 + m.output.confidence / n,
                    acc.2 + m.output.quality / n,
                )
            })
        };

        let (lo, hi) = survivors.iter().fold((f64::MAX, f64::MIN), |(lo, hi), m| {
            (lo.min(m.output.score), hi.max(m.output.score))
        });
        let spread = (hi - lo).max(0.0);

        let consistency_bonus = self.consistency_bonus(spread);
        let diversity_bonus = self.diversity_bonus(spread);
        let confidence = (raw_confidence * consistency_bonus * diversity_bonus).clamp(0.0, 1.0);
        let score = self.post_process(raw_score, spread);

        // Sparse or heavily filtered ensembles report lower health
        let attempted = members.len() + members_failed;
        let coverage =
            survivors.len() as f64 / attempted.max(self.config.expected_members) as f64;
        let quality = (raw_quality * coverage.min(1.0)).clamp(0.0, 1.0);

        let outliers_removed: Vec<String> = drop.iter().map(|i| members[*i].name.clone()).collect();
        if !outliers_removed.is_empty() {
            debug!("ensemble outliers removed: {:?}", outliers_removed);
        }

        Some(EnsemblePrediction {
            score,
            confidence,
            quality,
            members_used: survivors.len(),
            members_failed,
            outliers_removed,
            spread,
            consistency_bonus,
            diversity_bonus,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, score: f64, confidence: f64, quality: f64) -> MemberResult {
        MemberResult {
            name: name.to_string(),
            kind: PredictorKind::External,
            output: MemberOutput {
                score,
                confidence,
                quality,
            },
        }
    }

    fn agg() -> EnsembleAggregator {
        EnsembleAggregator::default()
    }

    #[test]
    fn test_empty_ensemble_is_none() {
        assert!(agg().aggregate(&[], 4).is_none());
    }

    #[test]
    fn test_identical_members_penalize_diversity() {
        let members: Vec<_> = (0..4)
            .map(|i| member(&format!("m{}", i), 0.5, 0.9, 0.9))
            .collect();
        let p = agg().aggregate(&members, 0).unwrap();
        assert!(p.diversity_bonus < 1.0);
        assert_eq!(p.consistency_bonus, 1.2);
        assert!((p.score - 0.5).abs() < 0.05, "score {}", p.score);
        assert!(p.confidence <= 1.0);
        assert!((p.quality - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_outlier_is_rejected() {
        let base = vec![
            member("a", 0.05, 0.8, 0.8),
            member("b", 0.06, 0.8, 0.8),
            member("c", 0.04, 0.8, 0.8),
        ];
        let mut with_outlier = base.clone();
        with_outlier.push(member("x", 0.5, 0.8, 0.8));

        let without = agg().aggregate(&base, 0).unwrap();
        let with = agg().aggregate(&with_outlier, 0).unwrap();
        assert_eq!(with.outliers_removed, vec!["x".to_string()]);
        assert!((with.score - without.score).abs() < 0.5 - without.score);
    }

    #[test]
    fn test_small_magnitude_outlier_is_rejected() {
        let base = vec![
            member("a", 0.03, 0.8, 0.8),
            member("b", 0.035, 0.8, 0.8),
            member("c", 0.025, 0.8, 0.8),
        ];
        let mut with_outlier = base.clone();
        with_outlier.push(member("x", 0.30, 0.8, 0.8));

        let without = agg().aggregate(&base, 0).unwrap();
        let with = agg().aggregate(&with_outlier, 0).unwrap();
        assert_eq!(with.outliers_removed, vec!["x".to_string()]);
        assert_eq!(with.members_used, 3);
        assert!((with.score - without.score).abs() < 1e-9, "score {}", with.score);
    }

    #[test]
    fn test_moderate_dissent_survives_filtering() {
        let members = vec![
            member("a", 0.3, 0.8, 0.8),
            member("b", 0.32, 0.8, 0.8),
            member("c", 0.28, 0.8, 0.8),
            member("d", 0.5, 0.8, 0.8),
        ];
        let p = agg().aggregate(&members, 0).unwrap();
        assert!(p.outliers_removed.is_empty());
        assert_eq!(p.members_used, 4);
    }

    #[test]
    fn test_filtering_never_leaves_fewer_than_min_members() {
        let members = vec![member("a", 0.9, 0.8, 0.8), member("b", -0.9, 0.8, 0.8)];
        let p = agg().aggregate(&members, 0).unwrap();
        assert_eq!(p.members_used, 2);
        assert!(p.outliers_removed.is_empty());
    }

    #[test]
    fn test_wide_disagreement_is_compressed() {
        let members = vec![
            member("a", 0.75, 0.8, 0.8),
            member("b", 0.6, 0.8, 0.8),
            member("c", 0.45, 0.8, 0.8),
            member("d", 0.3, 0.8, 0.8),
        ];
        let p = agg().aggregate(&members, 0).unwrap();
        assert!(p.outliers_removed.is_empty());
        assert!(p.spread > 0.4);
        assert_eq!(p.consistency_bonus, 0.8);
        assert!(p.score < 0.45, "score {}", p.score);
    }

    #[test]
    fn test_failures_within_expected_size_keep_quality() {
        // Two answers plus two failures still fills the nominal four slots
        let members = vec![member("a", 0.3, 0.8, 0.8), member("b", 0.32, 0.8, 0.8)];
        let healthy = agg().aggregate(&members, 0).unwrap();
        let degraded = agg().aggregate(&members, 2).unwrap();
        assert_eq!(degraded.members_failed, 2);
        assert_eq!(healthy.quality, degraded.quality);
    }

    #[test]
    fn test_failures_beyond_expected_size_reduce_quality() {
        let members = vec![member("a", 0.3, 0.8, 0.8), member("b", 0.32, 0.8, 0.8)];
        let healthy = agg().aggregate(&members, 0).unwrap();
        let degraded = agg().aggregate(&members, 4).unwrap();
        assert!(degraded.quality < healthy.quality);
    }

    #[test]
    fn test_sparse_coverage_reduces_quality() {
        let members = vec![member("a", 0.3, 0.8, 0.8), member("b", 0.32, 0.8, 0.8)];
        let healthy = agg().aggregate(&members, 0).unwrap();
        let sparse = agg().aggregate(&members[..1], 3).unwrap();
        assert!(sparse.quality < healthy.quality);
    }

    #[test]
    fn test_zero_confidence_members_fall_back_to_average() {
        let members = vec![member("a", 0.2, 0.0, 0.5), member("b", 0.4, 0.0, 0.5)];
        let p = agg().aggregate(&members, 0).unwrap();
        assert!((p.score - 0.3 * 1.05).abs() < 1e-9);
    }
}
