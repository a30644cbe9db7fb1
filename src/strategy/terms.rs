//! Signal terms - one normalized, weighted term per core indicator
//!
//! Each term maps its raw indicator value to a signal in [-1, 1] where positive
//! means bullish for the raw reading. Base weights carry the sign of the relationship:
//! oscillators are weighted negatively (overbought is bearish).

use crate::features::{FeatureSnapshot, Indicator};

/// Maps a raw value (plus snapshot context) to a signal in [-1, 1]
pub type Normalizer = fn(f64, &FeatureSnapshot) -> Option<f64>;

/// Weighted indicator term
#[derive(Clone, Copy)]
pub struct SignalTerm {
    pub indicator: Indicator,
    /// Base weight in [-0.2, 0.2]
    pub base_weight: f64,
    pub normalize: Normalizer,
}

impl std::fmt::Debug for SignalTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalTerm")
            .field("indicator", &self.indicator)
            .field("base_weight", &self.base_weight)
            .finish()
    }
}

impl SignalTerm {
    /// Normalized signal for this term, `None` when its input is absent
    pub fn signal(&self, features: &FeatureSnapshot) -> Option<f64> {
        let raw = features.get(self.indicator)?;
        (self.normalize)(raw, features)
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(-1.0, 1.0))
    }
}

// ============ Normalizers ============

fn scaled(value: f64, scale: f64) -> f64 {
    (value / scale).tanh()
}

fn trend_sign(f: &FeatureSnapshot) -> f64 {
    match f.trend_direction() {
        Some(t) if t > 0.0 => 1.0,
        Some(t) if t < 0.0 => -1.0,
        _ => 0.0,
    }
}

/// Price-relative value when price is known, otherwise a unit-scale tanh
fn price_relative(value: f64, f: &FeatureSnapshot, scale: f64) -> f64 {
    match f.get(Indicator::Price) {
        Some(p) if p > 0.0 => scaled(value / p, scale),
        _ => value.tanh(),
    }
}

/// Map a 0-1 (or 0-100) oscillator to [-1, 1] around its midpoint
fn centered_unit(value: f64) -> f64 {
    let unit = if value > 1.0 { value / 100.0 } else { value };
    (unit - 0.5) * 2.0
}

fn trend_5(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.02))
}

fn trend_20(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.03))
}

fn trend_50(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.05))
}

/// ADX strengthens whichever direction the trend points
fn adx(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    let strength = ((v - 20.0) / 30.0).clamp(0.0, 1.0);
    Some(strength * trend_sign(f))
}

fn sma_distance(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.03))
}

fn ema_distance(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.05))
}

fn momentum_short(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.02))
}

fn momentum_long(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.03))
}

fn price_change_1(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.01))
}

fn price_change_5(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.02))
}

fn macd(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(price_relative(v, f, 0.005))
}

fn macd_histogram(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(price_relative(v, f, 0.002))
}

/// Volume confirms the prevailing trend
fn volume_trend(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.5) * trend_sign(f))
}

fn volume_ratio(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v - 1.0, 0.5) * trend_sign(f))
}

fn obv_trend(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(scaled(v, 0.05))
}

fn rsi(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(((v - 50.0) / 50.0).clamp(-1.0, 1.0))
}

fn oscillator(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(centered_unit(v))
}

/// High volatility fades the prevailing trend
fn volatility(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(-(v.abs() / 0.05).min(1.0) * trend_sign(f))
}

fn atr(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    let p = f.get(Indicator::Price).filter(|p| *p > 0.0)?;
    Some(-(v.abs() / p / 0.05).min(1.0) * trend_sign(f))
}

fn volatility_ratio(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(-scaled(v - 1.0, 0.5).max(0.0) * trend_sign(f))
}

fn high_low_range(v: f64, f: &FeatureSnapshot) -> Option<f64> {
    Some(-(v.abs() / 0.06).min(1.0) * trend_sign(f))
}

/// Position inside the support/resistance channel: near support is bullish
fn channel_position(price: f64, f: &FeatureSnapshot) -> Option<f64> {
    let support = f.get(Indicator::SupportLevel)?;
    let resistance = f.get(Indicator::ResistanceLevel)?;
    let half = (resistance - support) / 2.0;
    if half <= 0.0 {
        return None;
    }
    let mid = support + half;
    Some(((mid - price) / half).clamp(-1.0, 1.0))
}

/// Near support is bullish, a break below it is strongly bearish
fn support(level: f64, f: &FeatureSnapshot) -> Option<f64> {
    let price = f.get(Indicator::Price).filter(|p| *p > 0.0)?;
    if level <= 0.0 {
        return None;
    }
    let distance = (price - level) / level;
    if distance < 0.0 {
        Some(-1.0)
    } else {
        Some((1.0 - distance / 0.05).max(0.0))
    }
}

/// Near resistance is bearish, a breakout above it is bullish
fn resistance(level: f64, f: &FeatureSnapshot) -> Option<f64> {
    let price = f.get(Indicator::Price).filter(|p| *p > 0.0)?;
    if level <= 0.0 {
        return None;
    }
    let distance = (level - price) / level;
    if distance < 0.0 {
        Some(1.0)
    } else {
        Some(-(1.0 - distance / 0.05).max(0.0))
    }
}

fn drawdown(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(-(v.abs() / 0.2).min(1.0))
}

fn bounded(v: f64, _: &FeatureSnapshot) -> Option<f64> {
    Some(v.clamp(-1.0, 1.0))
}

// ============ Term table ============

const fn term(indicator: Indicator, base_weight: f64, normalize: Normalizer) -> SignalTerm {
    SignalTerm {
        indicator,
        base_weight,
        normalize,
    }
}

/// The 30 base terms, one per core indicator
pub const BASE_TERMS: [SignalTerm; Indicator::COUNT] = [
    term(Indicator::Trend5, 0.10, trend_5),
    term(Indicator::Trend20, 0.15, trend_20),
    term(Indicator::Trend50, 0.10, trend_50),
    term(Indicator::Adx14, 0.06, adx),
    term(Indicator::Sma20Distance, 0.05, sma_distance),
    term(Indicator::Ema50Distance, 0.05, ema_distance),
    term(Indicator::Momentum5, 0.08, momentum_short),
    term(Indicator::Momentum10, 0.12, momentum_long),
    term(Indicator::PriceChange1, 0.03, price_change_1),
    term(Indicator::PriceChange5, 0.05, price_change_5),
    term(Indicator::MacdLine, 0.06, macd),
    term(Indicator::MacdSignal, 0.04, macd),
    term(Indicator::MacdHistogram, 0.10, macd_histogram),
    term(Indicator::VolumeTrend, 0.05, volume_trend),
    term(Indicator::VolumeRatio, 0.05, volume_ratio),
    term(Indicator::ObvTrend, 0.06, obv_trend),
    term(Indicator::Rsi14, -0.15, rsi),
    term(Indicator::StochRsi, -0.08, oscillator),
    term(Indicator::BollingerPosition, -0.10, oscillator),
    term(Indicator::Volatility20, 0.04, volatility),
    term(Indicator::Atr14, 0.03, atr),
    term(Indicator::VolatilityRatio, 0.03, volatility_ratio),
    term(Indicator::HighLowRange, 0.02, high_low_range),
    term(Indicator::Price, 0.05, channel_position),
    term(Indicator::SupportLevel, 0.08, support),
    term(Indicator::ResistanceLevel, 0.08, resistance),
    term(Indicator::DrawdownFromHigh, 0.04, drawdown),
    term(Indicator::Sentiment, 0.06, bounded),
    term(Indicator::Seasonality, 0.03, bounded),
    term(Indicator::MarketBreadth, 0.05, bounded),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_term_per_indicator_in_schema_order() {
        for (term, indicator) in BASE_TERMS.iter().zip(Indicator::ALL.iter()) {
            assert_eq!(term.indicator, *indicator);
            assert!(term.base_weight.abs() <= 0.2);
        }
    }

    #[test]
    fn test_absent_indicator_has_no_signal() {
        let f = FeatureSnapshot::new().with(Indicator::Rsi14, 30.0);
        assert!(BASE_TERMS[1].signal(&f).is_none());
        assert!(BASE_TERMS[16].signal(&f).is_some());
    }

    #[test]
    fn test_structure_terms_need_price() {
        let f = FeatureSnapshot::new().with(Indicator::SupportLevel, 95.0);
        let support_term = BASE_TERMS[Indicator::SupportLevel as usize];
        assert!(support_term.signal(&f).is_none());

        let f = f.with(Indicator::Price, 96.0);
        let s = support_term.signal(&f).unwrap();
        assert!(s > 0.5, "close above support should be bullish: {}", s);

        let f = f.with(Indicator::Price, 90.0);
        assert_eq!(support_term.signal(&f), Some(-1.0));
    }

    #[test]
    fn test_signals_are_bounded() {
        let f = FeatureSnapshot::new()
            .with(Indicator::Trend20, 5.0)
            .with(Indicator::Rsi14, 250.0)
            .with(Indicator::Sentiment, -9.0);
        for term in BASE_TERMS.iter() {
            if let Some(s) = term.signal(&f) {
                assert!((-1.0..=1.0).contains(&s));
            }
        }
    }
}
