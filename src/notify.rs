// =============================================================================
// Notifications — best-effort delivery of lifecycle events
// =============================================================================
//
// `Notifier::notify` never blocks the engine and never returns an error.
// Telegram delivery is spawned onto the runtime; failures are logged.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::risk::ExitReason;
use crate::types::Side;

const TELEGRAM_API: &str = "https://api.telegram.org";

// =============================================================================
// Event
// =============================================================================

/// One open position as listed in a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    /// Tightest stop known to protect the position.
    pub stop_loss: f64,
    pub take_profit: f64,
    pub partial_done: bool,
    pub realized_pnl: f64,
}

/// Lifecycle events worth telling a human about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Entry {
        symbol: String,
        side: Side,
        qty: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
        conditions: serde_json::Value,
    },
    ManualOpenDetected {
        symbol: String,
        side: Side,
        qty: f64,
        entry_price: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    StopTakeAligned {
        symbol: String,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
    TrailingMoved {
        symbol: String,
        side: Side,
        new_stop: f64,
        price: f64,
        r_now: f64,
    },
    PartialExecuted {
        symbol: String,
        side: Side,
        closed_qty: f64,
        remaining_qty: f64,
        price: f64,
        r_now: f64,
        pnl: f64,
    },
    PositionClosed {
        symbol: String,
        side: Side,
        entry_price: f64,
        exit_price: f64,
        qty: f64,
        reason: ExitReason,
        pnl: f64,
        result_pct: f64,
        capital_impact_pct: f64,
        opened_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    },
    StartupReconciled {
        notes: Vec<String>,
    },
    Heartbeat {
        at: DateTime<Utc>,
        capital_usdt: f64,
        trades_closed: u64,
        open: Vec<PositionSummary>,
        /// Watched symbols with nothing open.
        idle: Vec<String>,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Entry { .. } => "entry",
            Self::ManualOpenDetected { .. } => "manual_open_detected",
            Self::StopTakeAligned { .. } => "stop_take_aligned",
            Self::TrailingMoved { .. } => "trailing_moved",
            Self::PartialExecuted { .. } => "partial_executed",
            Self::PositionClosed { .. } => "position_closed",
            Self::StartupReconciled { .. } => "startup_reconciled",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Entry { symbol, .. }
            | Self::ManualOpenDetected { symbol, .. }
            | Self::StopTakeAligned { symbol, .. }
            | Self::TrailingMoved { symbol, .. }
            | Self::PartialExecuted { symbol, .. }
            | Self::PositionClosed { symbol, .. } => Some(symbol),
            Self::StartupReconciled { .. } | Self::Heartbeat { .. } => None,
        }
    }

    /// Plain-text rendering for chat delivery.
    pub fn render(&self) -> String {
        fn opt(v: Option<f64>) -> String {
            v.map(|x| format!("{x}")).unwrap_or_else(|| "-".to_string())
        }

        match self {
            Self::Entry {
                symbol,
                side,
                qty,
                entry_price,
                stop_loss,
                take_profit,
                ..
            } => format!(
                "ENTRY {symbol} {side}\nqty {qty} @ {entry_price}\nSL {stop_loss} | TP {take_profit}"
            ),
            Self::ManualOpenDetected {
                symbol,
                side,
                qty,
                entry_price,
                stop_loss,
                take_profit,
            } => format!(
                "MANUAL POSITION {symbol} {side}\nqty {qty} @ {entry_price}\nSL {stop_loss} | TP {take_profit}"
            ),
            Self::StopTakeAligned {
                symbol,
                stop_loss,
                take_profit,
            } => format!(
                "SL/TP aligned {symbol}\nSL {} | TP {}",
                opt(*stop_loss),
                opt(*take_profit)
            ),
            Self::TrailingMoved {
                symbol,
                side,
                new_stop,
                price,
                r_now,
            } => format!(
                "TRAILING {symbol} {side}\nstop -> {new_stop} (price {price}, {r_now:.2}R)"
            ),
            Self::PartialExecuted {
                symbol,
                side,
                closed_qty,
                remaining_qty,
                price,
                r_now,
                pnl,
            } => format!(
                "PARTIAL {symbol} {side}\nclosed {closed_qty} @ {price} ({r_now:.2}R)\nremaining {remaining_qty}\nPnL {pnl:.4}"
            ),
            Self::PositionClosed {
                symbol,
                side,
                entry_price,
                exit_price,
                qty,
                reason,
                pnl,
                result_pct,
                capital_impact_pct,
                opened_at,
                closed_at,
            } => {
                let minutes = (*closed_at - *opened_at).num_minutes();
                format!(
                    "CLOSED {symbol} {side} ({reason})\n{entry_price} -> {exit_price}, qty {qty}\nPnL {pnl:.4} ({result_pct:+.2}%, capital {capital_impact_pct:+.2}%)\nduration {minutes} min"
                )
            }
            Self::StartupReconciled { notes } => {
                if notes.is_empty() {
                    "Startup reconciliation: nothing to do".to_string()
                } else {
                    format!("Startup reconciliation:\n- {}", notes.join("\n- "))
                }
            }
            Self::Heartbeat {
                at,
                capital_usdt,
                trades_closed,
                open,
                idle,
            } => {
                let mut text = format!(
                    "HEARTBEAT {} UTC\ncapital {capital_usdt} USDT | closed trades {trades_closed}",
                    at.format("%Y-%m-%d %H:%M")
                );
                if open.is_empty() {
                    text.push_str("\nno open positions");
                } else {
                    text.push_str("\nOPEN:");
                    for p in open {
                        text.push_str(&format!(
                            "\n- {} {} qty {} @ {} SL {} TP {}{}",
                            p.symbol,
                            p.side,
                            p.qty,
                            p.entry_price,
                            p.stop_loss,
                            p.take_profit,
                            if p.partial_done { " (partial taken)" } else { "" }
                        ));
                    }
                }
                if !idle.is_empty() {
                    text.push_str(&format!("\nIDLE: {}", idle.join(", ")));
                }
                text
            }
        }
    }
}

// =============================================================================
// Notifiers
// =============================================================================

/// Sink for lifecycle events.  Must not block and must not fail.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &Event) {
        info!(
            kind = event.kind(),
            symbol = event.symbol().unwrap_or("-"),
            message = %event.render(),
            "notification"
        );
    }
}

/// Telegram Bot API `sendMessage`, fire-and-forget.
#[derive(Clone)]
pub struct TelegramNotifier {
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("token", &"***")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            chat_id: chat_id.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`; `None` if either is unset.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        if token.trim().is_empty() || chat_id.trim().is_empty() {
            return None;
        }
        Some(Self::new(token.trim(), chat_id.trim()))
    }

    async fn send(client: reqwest::Client, url: String, chat_id: String, text: String) {
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        match client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => debug!("telegram message delivered"),
            Ok(resp) => warn!(status = %resp.status(), "telegram sendMessage rejected"),
            Err(e) => warn!(error = %e, "telegram sendMessage failed"),
        }
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, event: &Event) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(kind = event.kind(), "no runtime, telegram notification dropped");
            return;
        };
        let url = format!("{TELEGRAM_API}/bot{}/sendMessage", self.token);
        handle.spawn(Self::send(
            self.client.clone(),
            url,
            self.chat_id.clone(),
            event.render(),
        ));
    }
}

/// Delivers each event to every inner notifier.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn Notifier>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Notifier + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Notifier for Fanout {
    fn notify(&self, event: &Event) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}
