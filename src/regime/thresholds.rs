//! Adaptive decision thresholds (regime × position state)
//!
//! This table is the single threshold policy used by both the rule engine and the
//! fusion controller. A regime with no row is a hard error: there is no safe default.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::RegimeLabel;
use crate::error::EngineError;
use crate::types::{Action, PositionSide, PositionState};

/// Short threshold when shorting is forbidden; scores never reach it
pub const SHORT_DISABLED: f64 = -2.0;

/// Thresholds for one regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeThresholds {
    /// Flat: score >= flat_buy -> buy
    pub flat_buy: f64,
    /// Flat: score <= flat_short -> short (when allowed)
    pub flat_short: f64,
    /// Long: score >= long_add -> buy more
    pub long_add: f64,
    /// Long: score <= long_sell -> sell
    pub long_sell: f64,
    /// Short: score >= short_cover -> cover
    pub short_cover: f64,
    pub allow_short: bool,
    /// Upper bound on ML weight in fusion
    pub ml_ceiling: f64,
}

impl RegimeThresholds {
    /// Short threshold, or the sentinel when shorting is forbidden
    pub fn effective_short(&self) -> f64 {
        if self.allow_short {
            self.flat_short
        } else {
            SHORT_DISABLED
        }
    }

    /// Map a score to an action given the current position
    pub fn action_for(&self, score: f64, position: &PositionState) -> Action {
        if !score.is_finite() {
            return Action::Hold;
        }

        if !position.has_position {
            if score >= self.flat_buy {
                Action::Buy
            } else if score <= self.effective_short() {
                Action::Short
            } else {
                Action::Hold
            }
        } else {
            match position.side {
                PositionSide::Long => {
                    if score <= self.long_sell {
                        Action::Sell
                    } else if score >= self.long_add {
                        Action::Buy
                    } else {
                        Action::Hold
                    }
                }
                PositionSide::Short => {
                    if score >= self.short_cover {
                        Action::Cover
                    } else {
                        Action::Hold
                    }
                }
            }
        }
    }
}

/// Default rows, keyed by regime label
pub fn default_rows() -> BTreeMap<String, RegimeThresholds> {
    let row = |flat_buy, flat_short, long_add, long_sell, short_cover, allow_short, ml_ceiling| {
        RegimeThresholds {
            flat_buy,
            flat_short,
            long_add,
            long_sell,
            short_cover,
            allow_short,
            ml_ceiling,
        }
    };

    let mut rows = BTreeMap::new();
    rows.insert(
        RegimeLabel::StrongBull.to_string(),
        row(0.15, -0.60, 0.35, -0.25, 0.05, false, 0.70),
    );
    rows.insert(
        RegimeLabel::WeakBull.to_string(),
        row(0.20, -0.50, 0.40, -0.20, 0.10, false, 0.60),
    );
    rows.insert(
        RegimeLabel::Sideways.to_string(),
        row(0.30, -0.45, 0.50, -0.15, 0.15, true, 0.50),
    );
    rows.insert(
        RegimeLabel::WeakBear.to_string(),
        row(0.35, -0.30, 0.55, -0.10, 0.20, true, 0.40),
    );
    rows.insert(
        RegimeLabel::StrongBear.to_string(),
        row(0.45, -0.25, 0.60, -0.05, 0.25, true, 0.35),
    );
    rows.insert(
        RegimeLabel::ExtremeBear.to_string(),
        row(0.40, -0.40, 0.55, -0.10, 0.20, false, 0.40),
    );
    rows
}

/// Parsed threshold table
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    rows: HashMap<RegimeLabel, RegimeThresholds>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        // Default rows only use known labels
        let rows = default_rows()
            .into_iter()
            .filter_map(|(k, v)| k.parse::<RegimeLabel>().ok().map(|l| (l, v)))
            .collect();
        Self { rows }
    }
}

impl ThresholdTable {
    /// Build from configured rows; an unrecognized label is rejected
    pub fn from_rows(rows: &BTreeMap<String, RegimeThresholds>) -> Result<Self, EngineError> {
        let mut parsed = HashMap::with_capacity(rows.len());
        for (label, row) in rows {
            parsed.insert(label.parse::<RegimeLabel>()?, *row);
        }
        Ok(Self { rows: parsed })
    }

    pub fn lookup(&self, label: RegimeLabel) -> Result<&RegimeThresholds, EngineError> {
        self.rows
            .get(&label)
            .ok_or_else(|| EngineError::UnknownRegime(label.to_string()))
    }

    /// Lookup by an external label string
    pub fn lookup_str(&self, label: &str) -> Result<&RegimeThresholds, EngineError> {
        self.lookup(label.parse()?)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_covers_every_regime() {
        let table = ThresholdTable::default();
        for label in RegimeLabel::ALL {
            let row = table.lookup(label).unwrap();
            assert!(row.ml_ceiling > 0.0 && row.ml_ceiling <= 1.0);
            assert!(row.long_sell <= 0.0);
        }
    }

    #[test]
    fn test_short_disabled_in_bull_regimes() {
        let table = ThresholdTable::default();
        let row = table.lookup(RegimeLabel::StrongBull).unwrap();
        assert_eq!(row.effective_short(), SHORT_DISABLED);
        assert_eq!(row.action_for(-1.0, &PositionState::flat()), Action::Hold);
    }

    #[test]
    fn test_flat_never_sells_or_covers() {
        let table = ThresholdTable::default();
        for label in RegimeLabel::ALL {
            let row = table.lookup(label).unwrap();
            for i in -20..=20 {
                let action = row.action_for(i as f64 / 20.0, &PositionState::flat());
                assert!(!action.is_exit(), "{} -> {}", label, action);
            }
        }
    }

    #[test]
    fn test_long_and_short_exits() {
        let row = *ThresholdTable::default().lookup(RegimeLabel::Sideways).unwrap();
        let long = PositionState::long(100.0, 100.0, 1);
        let short = PositionState::short(100.0, 100.0, 1);
        assert_eq!(row.action_for(-0.5, &long), Action::Sell);
        assert_eq!(row.action_for(0.0, &long), Action::Hold);
        assert_eq!(row.action_for(0.6, &long), Action::Buy);
        assert_eq!(row.action_for(0.5, &short), Action::Cover);
        assert_eq!(row.action_for(-0.5, &short), Action::Hold);
    }

    #[test]
    fn test_missing_row_is_hard_error() {
        let mut rows = default_rows();
        rows.remove("weak-bear");
        let table = ThresholdTable::from_rows(&rows).unwrap();
        assert!(matches!(
            table.lookup(RegimeLabel::WeakBear),
            Err(EngineError::UnknownRegime(_))
        ));
    }

    #[test]
    fn test_unknown_label_in_config_is_rejected() {
        let mut rows = default_rows();
        let row = rows["sideways"];
        rows.insert("melt-up".to_string(), row);
        assert!(ThresholdTable::from_rows(&rows).is_err());
        assert!(ThresholdTable::default().lookup_str("melt-up").is_err());
    }
}
