//! Replay command implementation
//!
//! Feeds recorded snapshots through the engine. Frames without positions
//! are classified and routed; frames with positions are managed against a
//! paper gateway, so closed tickets drop out of later frames.

use anyhow::{Context, Result};
use regime_exit_engine::engine::PlannedAction;
use regime_exit_engine::journal::TracingJournal;
use regime_exit_engine::paper::PaperGateway;
use regime_exit_engine::{
    DecisionEngine, EngineConfig, ExecutionOutcome, FeatureSnapshot, Position, SessionVolatility,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct ReplayFixture {
    #[serde(default = "default_session")]
    session: SessionVolatility,
    frames: Vec<ReplayFrame>,
}

#[derive(Debug, Deserialize)]
struct ReplayFrame {
    snapshot: FeatureSnapshot,
    #[serde(default)]
    positions: Vec<Position>,
}

fn default_session() -> SessionVolatility {
    SessionVolatility::Medium
}

pub fn run(config_path: String, fixture_path: String, session_override: Option<String>) -> Result<()> {
    info!("Starting replay");

    let config = EngineConfig::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let contents = std::fs::read_to_string(&fixture_path)
        .with_context(|| format!("Failed to read fixture {}", fixture_path))?;
    let mut fixture: ReplayFixture =
        serde_json::from_str(&contents).context("Failed to parse replay fixture")?;
    if let Some(session) = session_override {
        fixture.session = session
            .parse()
            .with_context(|| format!("Invalid session volatility: {}", session))?;
    }
    info!(
        "Loaded {} frames from {} (session {:?})",
        fixture.frames.len(),
        fixture_path,
        fixture.session
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(replay(config, fixture))
}

async fn replay(config: EngineConfig, fixture: ReplayFixture) -> Result<()> {
    let gateway = Arc::new(PaperGateway::new());
    let engine = DecisionEngine::new(config, Arc::clone(&gateway)).with_journal(Arc::new(TracingJournal));

    println!("\n{}", "=".repeat(60));
    println!("REPLAY");
    println!("{}", "=".repeat(60));

    let mut actions = 0usize;
    for (index, frame) in fixture.frames.into_iter().enumerate() {
        let snapshot = frame.snapshot;
        let half_spread = snapshot.spread.unwrap_or(0.0) / 2.0;
        gateway.set_quote(&snapshot.symbol, snapshot.price - half_spread, snapshot.price + half_spread);

        if frame.positions.is_empty() {
            let (classification, strategy) = engine.evaluate_symbol(&snapshot);
            println!(
                "[{:>3}] {} {}  regime={} conf={:.0} -> {}",
                index,
                snapshot.time.format("%Y-%m-%d %H:%M"),
                snapshot.symbol,
                classification.regime,
                classification.confidence,
                strategy
            );
            debug!("{}", classification.reason);
            continue;
        }

        for mut position in frame.positions {
            if gateway.is_closed(position.ticket) {
                continue;
            }
            position.current_price = snapshot.price;
            if let Some(stop) = gateway.stop_loss(position.ticket) {
                position.stop_loss = Some(stop);
            }

            let (evaluation, outcome) = engine.manage_position(&position, &snapshot, fixture.session).await;
            let r = evaluation
                .r_multiple
                .map_or_else(|| "n/a".to_string(), |r| format!("{r:+.2}R"));
            let phase = evaluation
                .analysis
                .as_ref()
                .map_or("-", |a| a.phase.as_str());
            let action = match evaluation.planned_action() {
                PlannedAction::Hold => "hold".to_string(),
                PlannedAction::Close { reason } => format!("close ({reason})"),
                PlannedAction::ModifyStop { new_sl, reason } => format!("stop -> {new_sl:.2} ({reason})"),
            };
            let result = outcome.as_ref().map_or("-", ExecutionOutcome::as_str);
            if outcome.is_some() {
                actions += 1;
            }
            println!(
                "[{:>3}] {} {} #{}  {}  phase={}  {}  [{}]",
                index,
                snapshot.time.format("%Y-%m-%d %H:%M"),
                position.symbol,
                position.ticket,
                r,
                phase,
                action,
                result
            );
            if let Some(alert) = evaluation.alert {
                println!("{alert}");
            }
        }
    }

    println!("{}", "=".repeat(60));
    println!("Actions sent:       {}", actions);
    println!("Positions closed:   {}", gateway.closed_count());
    println!("{}", "=".repeat(60));
    Ok(())
}
