// =============================================================================
// Position Warden — Main Entry Point
// =============================================================================
//
// Starts in paper mode unless `mode` / BOT_MODE says `live`.  Paper mode runs
// the same engine against an in-process exchange priced from the public Bybit
// ticker, so no credentials are needed to try it.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod exchange;
mod exit;
mod notify;
mod position_engine;
mod quantize;
mod reconcile;
mod registry;
mod retry;
mod risk;
mod settings;
#[cfg(test)]
mod testkit;
mod types;

use std::io::BufRead;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::exchange::bybit::BybitEnv;
use crate::exchange::{BybitClient, ExchangeClient, PaperExchange};
use crate::notify::{Fanout, LogNotifier, TelegramNotifier};
use crate::position_engine::{Engine, Signal};
use crate::registry::JsonStateStore;
use crate::settings::Settings;
use crate::types::ExecutionMode;

const DEFAULT_SETTINGS_PATH: &str = "config/settings.json";
const SIGNAL_QUEUE: usize = 32;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings_path =
        std::env::var("BOT_SETTINGS_PATH").unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.into());
    let mut settings = if std::path::Path::new(&settings_path).exists() {
        Settings::load(&settings_path)?
    } else {
        warn!(path = %settings_path, "settings file not found, using defaults");
        Settings::default()
    };
    settings.apply_env_overrides();
    settings.validate().context("invalid settings")?;

    info!(
        mode = %settings.mode,
        symbols = ?settings.symbols,
        state_path = %settings.state_path,
        "position warden starting"
    );

    // ── 2. Collaborators ─────────────────────────────────────────────────
    let store = JsonStateStore::new(&settings.state_path);

    let mut notifier = Fanout::new().with(LogNotifier);
    match TelegramNotifier::from_env() {
        Some(telegram) => notifier = notifier.with(telegram),
        None => info!("telegram not configured, notifications go to the log only"),
    }

    // ── 3. Signal inlet ──────────────────────────────────────────────────
    // Stdin is read on a plain thread: a pending blocking read would otherwise
    // hold up runtime shutdown after Ctrl-C.
    let (tx, rx) = mpsc::channel(SIGNAL_QUEUE);
    std::thread::Builder::new()
        .name("signal-inlet".into())
        .spawn(move || read_signals(std::io::stdin().lock(), tx))
        .context("failed to start signal inlet")?;

    // ── 4. Engine ────────────────────────────────────────────────────────
    match settings.mode {
        ExecutionMode::Paper => {
            let env = BybitEnv::parse(&std::env::var("BYBIT_ENV").unwrap_or_default());
            let exchange = PaperExchange::with_feed(BybitClient::public(env));
            run_engine(exchange, store, notifier, settings, rx).await;
        }
        ExecutionMode::Live => {
            let exchange = BybitClient::from_env().context("live mode needs Bybit credentials")?;
            run_engine(exchange, store, notifier, settings, rx).await;
        }
    }

    info!("position warden shut down complete");
    Ok(())
}

async fn run_engine<E: ExchangeClient>(
    exchange: E,
    store: JsonStateStore,
    notifier: Fanout,
    settings: Settings,
    signals: mpsc::Receiver<Signal>,
) {
    Engine::new(exchange, Box::new(store), Box::new(notifier), settings)
        .run(signals)
        .await;
}

/// Forward newline-delimited JSON signals to the engine until EOF or until
/// the engine stops listening.
fn read_signals(input: impl BufRead, tx: mpsc::Sender<Signal>) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "signal inlet read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Signal>(line) {
            Ok(signal) => {
                info!(symbol = %signal.symbol, side = %signal.side, "signal received");
                if tx.blocking_send(signal).is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, line, "ignoring malformed signal"),
        }
    }
    debug!("signal inlet closed");
}
