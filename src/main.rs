//! FusionBot - demo runner for the decision engine
//!
//! Usage:
//!   fusionbot                 evaluate synthetic snapshots
//!   fusionbot snapshots.json  evaluate snapshots from a JSON array
//!
//! Environment:
//!   RUST_LOG                  log filter (default: info)
//!   FUSIONBOT_LOG_JSON=1      structured JSON logs
//!   FUSIONBOT_SEED            seed for synthetic snapshots
//!   FUSIONBOT__<SECTION>__<KEY>  config overrides

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fusionbot::config::EngineConfig;
use fusionbot::features::{FeatureSnapshot, Indicator};
use fusionbot::ml_engine::ModelRegistry;
use fusionbot::performance::{self, TradeOutcome};
use fusionbot::types::PositionState;
use fusionbot::{CycleRequest, DecisionEngine};

const SYMBOLS: [&str; 4] = ["BTC", "ETH", "SOL", "XRP"];

#[derive(Debug, Deserialize)]
struct SnapshotInput {
    symbol: String,
    features: HashMap<String, f64>,
    #[serde(default)]
    position: PositionState,
    #[serde(default = "default_cash")]
    cash: f64,
    #[serde(default)]
    regime: Option<String>,
}

fn default_cash() -> f64 {
    10_000.0
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FUSIONBOT_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stdout))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stdout))
            .init();
    }
}

fn load_requests(path: &Path) -> Result<Vec<CycleRequest>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshots from {}", path.display()))?;
    let inputs: Vec<SnapshotInput> =
        serde_json::from_str(&raw).context("Failed to parse snapshots JSON")?;

    Ok(inputs
        .into_iter()
        .map(|i| {
            let request = CycleRequest::new(
                &i.symbol,
                FeatureSnapshot::from_map(&i.features),
                i.position,
                i.cash,
            );
            match i.regime {
                Some(label) => request.with_regime(&label),
                None => request,
            }
        })
        .collect())
}

/// Random but internally coherent snapshot (trend and momentum share a drift)
fn synthetic_request(rng: &mut StdRng, symbol: &str) -> CycleRequest {
    let drift: f64 = rng.gen_range(-0.04..0.04);
    let volatility: f64 = rng.gen_range(0.005..0.06);
    let price: f64 = rng.gen_range(10.0..50_000.0);
    let noise = |rng: &mut StdRng| rng.gen_range(-0.01..0.01);

    let features = FeatureSnapshot::new()
        .with(Indicator::Price, price)
        .with(Indicator::Trend5, drift * 0.8 + noise(rng))
        .with(Indicator::Trend20, drift + noise(rng))
        .with(Indicator::Trend50, drift * 1.2 + noise(rng))
        .with(Indicator::Momentum10, drift * 1.5 + noise(rng))
        .with(Indicator::MacdHistogram, drift * 10.0)
        .with(Indicator::Rsi14, (50.0 + drift * 600.0 + rng.gen_range(-8.0..8.0)).clamp(5.0, 95.0))
        .with(Indicator::Volatility20, volatility)
        .with(Indicator::VolumeTrend, rng.gen_range(-0.3..0.5))
        .with(Indicator::SupportLevel, price * (1.0 - rng.gen_range(0.01..0.08)))
        .with(Indicator::ResistanceLevel, price * (1.0 + rng.gen_range(0.01..0.08)));

    let position = if rng.gen_bool(0.4) {
        let entry = price * (1.0 + rng.gen_range(-0.2..0.2));
        PositionState::long(entry, price, rng.gen_range(1..60))
    } else {
        PositionState::flat()
    };

    CycleRequest::new(symbol, features, position, rng.gen_range(500.0..50_000.0))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("═══════════════════════════════════════════════════════════");
    info!("🤖 FusionBot decision engine starting...");
    info!("═══════════════════════════════════════════════════════════");

    let config = EngineConfig::load()?;
    info!("⚙️  {}", config);
    let yaml = serde_yaml::to_string(&config).context("Failed to render config")?;
    for line in yaml.lines() {
        info!("   {}", line);
    }

    let (recorder, aggregator, store) = performance::channel(&config.runtime);
    let aggregator = aggregator.spawn();
    let engine = DecisionEngine::new(config, ModelRegistry::default_members(), store)?;

    let requests = match std::env::args().nth(1) {
        Some(path) => load_requests(Path::new(&path))?,
        None => {
            let seed = std::env::var("FUSIONBOT_SEED")
                .ok()
                .and_then(|s| s.parse::<u64>().ok());
            let mut rng = match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            };
            SYMBOLS.iter().map(|s| synthetic_request(&mut rng, s)).collect()
        }
    };
    info!("📥 Evaluating {} snapshots", requests.len());

    for (symbol, result) in engine.evaluate_batch(&requests).await {
        match result {
            Ok(outcome) => {
                if let Some(exit) = &outcome.exit {
                    recorder.record(TradeOutcome::new(&symbol, exit.pnl));
                }
                let summary = serde_json::to_string(&outcome).context("Failed to render outcome")?;
                info!("📤 {}", summary);
            }
            Err(e) => warn!("❌ {} failed: {}", symbol, e),
        }
    }

    drop(recorder);
    if let Err(e) = aggregator.await {
        warn!("performance aggregator task failed: {}", e);
    }
    for symbol in engine.store().symbols().await {
        if let Some(h) = engine.store().get(&symbol).await {
            info!(
                "📊 {} trades={} win_rate={:.2} sharpe={:.2} cvar95={}",
                symbol,
                h.total_trades,
                h.win_rate,
                h.sharpe_ratio,
                h.cvar.map_or_else(|| "-".to_string(), |c| format!("{:.4}", c))
            );
        }
    }

    Ok(())
}
