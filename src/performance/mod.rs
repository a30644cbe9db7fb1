//! Performance tracking with a single writer
//!
//! - [`PerformanceRecorder`]: cloneable, appends trade outcomes to a channel
//! - [`PerformanceAggregator`]: the only writer, drains the channel periodically
//! - [`PerformanceStore`]: cloneable read handle used by evaluation cycles
//!
//! The evaluation path only ever reads, so it never races with updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::risk::stats;
use crate::types::PerformanceHistory;

/// Confidence of the published tail-risk figures
const TAIL_CONFIDENCE: f64 = 0.95;

/// Realized result of one closed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub symbol: String,
    /// Realized return as a fraction of entry
    pub return_fraction: f64,
    /// Whether the ensemble called the direction correctly
    pub ml_correct: Option<bool>,
    /// Whether the rule engine called the direction correctly
    pub rule_correct: Option<bool>,
    pub closed_at: DateTime<Utc>,
}

impl TradeOutcome {
    pub fn new(symbol: &str, return_fraction: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            return_fraction,
            ml_correct: None,
            rule_correct: None,
            closed_at: Utc::now(),
        }
    }

    pub fn with_calls(mut self, ml_correct: Option<bool>, rule_correct: Option<bool>) -> Self {
        self.ml_correct = ml_correct;
        self.rule_correct = rule_correct;
        self
    }
}

/// Read handle over per-symbol history
#[derive(Debug, Clone, Default)]
pub struct PerformanceStore {
    inner: Arc<RwLock<HashMap<String, PerformanceHistory>>>,
}

impl PerformanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, symbol: &str) -> Option<PerformanceHistory> {
        self.inner.read().await.get(symbol).cloned()
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    /// Seed history from an external source (e.g. a backtest run) before cycles start
    pub async fn seed(&self, symbol: &str, history: PerformanceHistory) {
        self.inner.write().await.insert(symbol.to_string(), history);
    }

    async fn publish(&self, updates: Vec<(String, PerformanceHistory)>) {
        let mut guard = self.inner.write().await;
        for (symbol, history) in updates {
            guard.insert(symbol, history);
        }
    }

    async fn remove(&self, symbols: &[String]) {
        let mut guard = self.inner.write().await;
        for symbol in symbols {
            guard.remove(symbol);
        }
    }
}

/// Append-only handle for trade outcomes
#[derive(Debug, Clone)]
pub struct PerformanceRecorder {
    tx: mpsc::Sender<TradeOutcome>,
}

impl PerformanceRecorder {
    /// Never blocks; a full buffer drops the outcome with a warning
    pub fn record(&self, outcome: TradeOutcome) -> bool {
        match self.tx.try_send(outcome) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(o)) => {
                warn!("performance buffer full, dropping outcome for {}", o.symbol);
                false
            }
            Err(mpsc::error::TrySendError::Closed(o)) => {
                warn!("performance aggregator stopped, dropping outcome for {}", o.symbol);
                false
            }
        }
    }
}

#[derive(Debug)]
struct SymbolWindow {
    returns: VecDeque<f64>,
    ml_calls: VecDeque<bool>,
    rule_calls: VecDeque<bool>,
    total_trades: usize,
    last_seen: Instant,
}

fn hit_rate(calls: &VecDeque<bool>) -> Option<f64> {
    if calls.is_empty() {
        None
    } else {
        Some(calls.iter().filter(|c| **c).count() as f64 / calls.len() as f64)
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    buf.push_back(value);
    while buf.len() > cap {
        buf.pop_front();
    }
}

impl SymbolWindow {
    fn new(now: Instant) -> Self {
        Self {
            returns: VecDeque::new(),
            ml_calls: VecDeque::new(),
            rule_calls: VecDeque::new(),
            total_trades: 0,
            last_seen: now,
        }
    }

    fn push(&mut self, outcome: &TradeOutcome, cap: usize, now: Instant) {
        if !outcome.return_fraction.is_finite() {
            return;
        }
        self.last_seen = now;
        self.total_trades += 1;
        push_bounded(&mut self.returns, outcome.return_fraction, cap);
        if let Some(c) = outcome.ml_correct {
            push_bounded(&mut self.ml_calls, c, cap);
        }
        if let Some(c) = outcome.rule_correct {
            push_bounded(&mut self.rule_calls, c, cap);
        }
    }

    fn history(&self) -> PerformanceHistory {
        let returns: Vec<f64> = self.returns.iter().copied().collect();
        let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
        let losses: Vec<f64> = returns.iter().filter(|r| **r < 0.0).map(|r| -r).collect();

        let win_rate = if returns.is_empty() {
            0.5
        } else {
            wins.len() as f64 / returns.len() as f64
        };
        // Per-trade Sharpe; too few trades count as zero
        let sharpe = stats::sharpe_ratio(&returns, 0.0, 1.0).unwrap_or(0.0);

        let mut history = PerformanceHistory::new(
            win_rate,
            sharpe,
            stats::max_drawdown(&returns),
            self.total_trades,
        );
        history.sortino_ratio = stats::sortino_ratio(&returns, 0.0, 1.0).ok();
        // Unset until MIN_VAR_OBSERVATIONS trades are in the window
        history.historical_var = stats::historical_var(&returns, TAIL_CONFIDENCE).ok();
        history.cvar = stats::cvar(&returns, TAIL_CONFIDENCE).ok();
        history.avg_win = stats::mean(&wins);
        history.avg_loss = stats::mean(&losses);
        history.ml_hit_rate = hit_rate(&self.ml_calls);
        history.rule_hit_rate = hit_rate(&self.rule_calls);
        history
    }
}

/// The single writer of performance history
#[derive(Debug)]
pub struct PerformanceAggregator {
    rx: mpsc::Receiver<TradeOutcome>,
    store: PerformanceStore,
    windows: HashMap<String, SymbolWindow>,
    /// Symbols updated since the last publish
    dirty: Vec<String>,
    window: usize,
    drain_interval: Duration,
    idle_after: Duration,
}

/// Build the recorder/aggregator/store triple
pub fn channel(config: &RuntimeConfig) -> (PerformanceRecorder, PerformanceAggregator, PerformanceStore) {
    let (tx, rx) = mpsc::channel(config.outcome_channel_capacity.max(1));
    let store = PerformanceStore::new();
    let aggregator = PerformanceAggregator {
        rx,
        store: store.clone(),
        windows: HashMap::new(),
        dirty: Vec::new(),
        window: config.performance_window.max(2),
        drain_interval: Duration::from_millis(config.performance_drain_ms.max(1)),
        idle_after: Duration::from_secs(config.performance_idle_secs.max(1)),
    };
    (PerformanceRecorder { tx }, aggregator, store)
}

impl PerformanceAggregator {
    fn ingest(&mut self, outcome: TradeOutcome, now: Instant) {
        self.windows
            .entry(outcome.symbol.clone())
            .or_insert_with(|| SymbolWindow::new(now))
            .push(&outcome, self.window, now);
        if !self.dirty.contains(&outcome.symbol) {
            self.dirty.push(outcome.symbol);
        }
    }

    /// Drop symbols idle for longer than the configured window; returns how many
    ///
    /// Histories seeded directly into the store have no window and are kept.
    pub async fn evict_idle(&mut self, now: Instant) -> usize {
        let idle_after = self.idle_after;
        let stale: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.last_seen) > idle_after)
            .map(|(s, _)| s.clone())
            .collect();
        if stale.is_empty() {
            return 0;
        }
        for symbol in &stale {
            self.windows.remove(symbol);
        }
        self.dirty.retain(|s| !stale.contains(s));
        self.store.remove(&stale).await;
        info!("performance: evicted {} idle symbols", stale.len());
        stale.len()
    }

    async fn publish(&mut self) {
        if self.dirty.is_empty() {
            return;
        }
        let updates: Vec<(String, PerformanceHistory)> = self
            .dirty
            .drain(..)
            .filter_map(|s| self.windows.get(&s).map(|w| (s, w.history())))
            .collect();
        debug!("performance publish: {} symbols", updates.len());
        self.store.publish(updates).await;
    }

    /// Drain everything buffered and publish; returns outcomes processed
    pub async fn drain_now(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(outcome) = self.rx.try_recv() {
            self.ingest(outcome, Instant::now());
            processed += 1;
        }
        self.publish().await;
        processed
    }

    /// Publish on a fixed tick until every recorder is dropped
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.drain_interval);
        info!("📊 Performance aggregator started (every {:?})", self.drain_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publish().await;
                    self.evict_idle(Instant::now()).await;
                }
                received = self.rx.recv() => match received {
                    Some(outcome) => self.ingest(outcome, Instant::now()),
                    None => {
                        self.publish().await;
                        break;
                    }
                },
            }
        }
        info!("Performance aggregator stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> RuntimeConfig {
        RuntimeConfig {
            performance_window: 4,
            outcome_channel_capacity: 8,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_drain_publishes_history() {
        let (recorder, mut aggregator, store) = channel(&runtime());
        assert!(store.get("BTC").await.is_none());

        recorder.record(TradeOutcome::new("BTC", 0.04).with_calls(Some(true), Some(false)));
        recorder.record(TradeOutcome::new("BTC", -0.02).with_calls(Some(true), Some(true)));
        recorder.record(TradeOutcome::new("ETH", 0.01));

        // Nothing is visible before the writer drains
        assert!(store.get("BTC").await.is_none());
        assert_eq!(aggregator.drain_now().await, 3);

        let btc = store.get("BTC").await.unwrap();
        assert_eq!(btc.total_trades, 2);
        assert!((btc.win_rate - 0.5).abs() < 1e-12);
        assert_eq!(btc.reward_risk(), Some(2.0));
        assert_eq!(btc.ml_hit_rate, Some(1.0));
        assert_eq!(btc.rule_hit_rate, Some(0.5));
        assert!(store.get("ETH").await.is_some());
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let (recorder, mut aggregator, store) = channel(&runtime());
        for r in [-0.1, -0.1, 0.05, 0.05, 0.05, 0.05] {
            recorder.record(TradeOutcome::new("SOL", r));
        }
        aggregator.drain_now().await;
        let sol = store.get("SOL").await.unwrap();
        // Only the last four returns remain in the window
        assert_eq!(sol.win_rate, 1.0);
        assert_eq!(sol.total_trades, 6);
    }

    #[tokio::test]
    async fn test_tail_risk_needs_enough_trades() {
        let config = RuntimeConfig {
            performance_window: 50,
            ..runtime()
        };
        let (recorder, mut aggregator, store) = channel(&config);
        for r in [0.02, -0.01, 0.015] {
            recorder.record(TradeOutcome::new("BTC", r));
        }
        aggregator.drain_now().await;
        let early = store.get("BTC").await.unwrap();
        assert!(early.historical_var.is_none());
        assert!(early.cvar.is_none());

        for r in [-0.04, 0.01, -0.02, 0.03, -0.005, 0.02, -0.03, 0.01] {
            recorder.record(TradeOutcome::new("BTC", r));
        }
        aggregator.drain_now().await;
        let btc = store.get("BTC").await.unwrap();
        let var = btc.historical_var.unwrap();
        let es = btc.cvar.unwrap();
        assert!(var > 0.0);
        assert!(es >= var);
    }

    #[tokio::test]
    async fn test_idle_symbols_are_evicted() {
        let config = RuntimeConfig {
            performance_idle_secs: 60,
            ..runtime()
        };
        let (_recorder, mut aggregator, store) = channel(&config);
        let t0 = Instant::now();
        aggregator.ingest(TradeOutcome::new("OLD", 0.01), t0);
        aggregator.ingest(TradeOutcome::new("NEW", 0.02), t0 + Duration::from_secs(50));
        aggregator.publish().await;
        store.seed("SEEDED", PerformanceHistory::default()).await;

        assert_eq!(aggregator.evict_idle(t0 + Duration::from_secs(30)).await, 0);
        assert_eq!(aggregator.evict_idle(t0 + Duration::from_secs(70)).await, 1);
        assert!(store.get("OLD").await.is_none());
        assert!(store.get("NEW").await.is_some());
        assert!(store.get("SEEDED").await.is_some());
        assert_eq!(aggregator.windows.len(), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        let config = RuntimeConfig {
            outcome_channel_capacity: 1,
            ..RuntimeConfig::default()
        };
        let (recorder, _aggregator, _store) = channel(&config);
        assert!(recorder.record(TradeOutcome::new("BTC", 0.01)));
        assert!(!recorder.record(TradeOutcome::new("BTC", 0.02)));
    }

    #[tokio::test]
    async fn test_run_exits_when_recorders_drop() {
        let config = RuntimeConfig {
            performance_drain_ms: 5,
            ..RuntimeConfig::default()
        };
        let (recorder, aggregator, store) = channel(&config);
        recorder.record(TradeOutcome::new("ADA", 0.03));
        drop(recorder);
        aggregator.spawn().await.unwrap();
        assert_eq!(store.get("ADA").await.unwrap().total_trades, 1);
    }
}
