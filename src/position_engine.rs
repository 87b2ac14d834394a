// =============================================================================
// Position Engine — single writer of position state
// =============================================================================
//
// One engine task owns the registry.  Every tick it:
//
//   1. reads the live position of each tracked symbol (configured symbols plus
//      anything still open locally) and reconciles it against the registry;
//   2. takes one price observation per open position and feeds it to the
//      trailing stop first, then to the partial exit.
//
// Each state change is persisted before the next step runs.  A failed save is
// logged and the loop continues on the in-memory registry.
//
// Shutdown is only observed between ticks and entries, so an exchange call is
// never abandoned half-way.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::exchange::{new_order_link_id, ExchangeClient, ExchangeError};
use crate::exit::partial::{self, PartialOutcome};
use crate::exit::trailing::push_gate;
use crate::notify::{Event, Notifier, PositionSummary};
use crate::quantize::InstrumentFilters;
use crate::reconcile::{self, MissOutcome, OpenDecision, SymbolWatch};
use crate::registry::{EntryOrigin, NewPosition, Registry, StateStore};
use crate::risk;
use crate::settings::Settings;
use crate::types::{LivePosition, Side, StopUpdate};

/// Quantity differences below this are treated as equal.
const QTY_EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Inputs and reports
// ---------------------------------------------------------------------------

/// Entry decision coming from a strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub side: Side,
    /// Reference price for sizing.  The last traded price is used when absent.
    #[serde(default)]
    pub price: Option<f64>,
    /// Audit snapshot stored with the position.
    #[serde(default)]
    pub conditions: serde_json::Value,
}

/// Why an entry signal did not open a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySkip {
    OpenLocally,
    OpenOnExchange,
    ZeroSize,
}

impl std::fmt::Display for EntrySkip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenLocally => write!(f, "position already tracked"),
            Self::OpenOnExchange => write!(f, "position already open on exchange"),
            Self::ZeroSize => write!(f, "computed size is zero"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened { qty: f64, entry_price: f64 },
    Skipped(EntrySkip),
}

/// What one reconciliation + management pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub symbols_checked: usize,
    pub failed_reads: usize,
    pub adopted: Vec<String>,
    pub closed: Vec<String>,
    pub realigned: usize,
    pub stops_pushed: usize,
    pub partials: usize,
    /// Human-readable notes, filled during the startup pass.
    pub notes: Vec<String>,
}

impl TickReport {
    fn is_quiet(&self) -> bool {
        self.failed_reads == 0
            && self.adopted.is_empty()
            && self.closed.is_empty()
            && self.realigned == 0
            && self.stops_pushed == 0
            && self.partials == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// First pass after boot: absent records close without confirmation.
    Startup,
    Tick,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<E: ExchangeClient> {
    exchange: E,
    store: Box<dyn StateStore>,
    notifier: Box<dyn Notifier>,
    settings: Settings,
    registry: Registry,
    watches: HashMap<String, SymbolWatch>,
}

impl<E: ExchangeClient> Engine<E> {
    pub fn new(
        exchange: E,
        store: Box<dyn StateStore>,
        notifier: Box<dyn Notifier>,
        settings: Settings,
    ) -> Self {
        Self {
            exchange,
            store,
            notifier,
            settings,
            registry: Registry::new(),
            watches: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn exchange(&self) -> &E {
        &self.exchange
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Run startup reconciliation, then poll until Ctrl-C.  Entry signals
    /// arriving on `signals` are handled between ticks.
    pub async fn run(mut self, mut signals: mpsc::Receiver<Signal>) {
        self.startup(Utc::now()).await;

        let mut interval = tokio::time::interval(self.settings.reconciliation.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; startup already covered it.
        interval.tick().await;

        let heartbeat_enabled = self.settings.heartbeat.enabled;
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat.period());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        if heartbeat_enabled {
            self.notifier.notify(&self.heartbeat(Utc::now()));
        }

        let mut signals_open = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = heartbeat.tick(), if heartbeat_enabled => {
                    self.notifier.notify(&self.heartbeat(Utc::now()));
                }
                received = signals.recv(), if signals_open => match received {
                    Some(signal) => {
                        let symbol = signal.symbol.clone();
                        match self.open_from_signal(signal, Utc::now()).await {
                            Ok(EntryOutcome::Opened { qty, entry_price }) => {
                                info!(symbol = %symbol, qty, entry_price, "signal entry opened");
                            }
                            Ok(EntryOutcome::Skipped(reason)) => {
                                info!(symbol = %symbol, %reason, "signal entry skipped");
                            }
                            Err(e) => error!(symbol = %symbol, error = %format!("{e:#}"), "signal entry failed"),
                        }
                    }
                    None => {
                        debug!("signal source closed");
                        signals_open = false;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.persist(Utc::now());
        info!(
            open = self.registry.open_symbols().len(),
            trades_closed = self.registry.trades_closed(),
            "engine stopped"
        );
    }

    /// Restore the registry and bring it in line with the exchange before the
    /// first tick.
    #[instrument(skip(self), name = "engine::startup")]
    pub async fn startup(&mut self, now: DateTime<Utc>) -> TickReport {
        match self.store.load() {
            Ok(Some(snapshot)) => {
                self.registry = Registry::from_snapshot(snapshot);
                info!(
                    open = ?self.registry.open_symbols(),
                    trades_closed = self.registry.trades_closed(),
                    "registry restored"
                );
            }
            Ok(None) => info!("no saved registry, starting empty"),
            Err(e) => warn!(error = %format!("{e:#}"), "failed to load registry, starting empty"),
        }

        let mut report = TickReport::default();
        self.reconcile_all(Pass::Startup, now, &mut report).await;
        self.manage_open_positions(now, &mut report).await;
        if report.partials > 0 {
            report
                .notes
                .push(format!("{} catch-up partial exit(s) executed", report.partials));
        }
        if report.notes.is_empty() {
            report.notes.push("registry already in sync with exchange".to_string());
        }

        self.notifier.notify(&Event::StartupReconciled {
            notes: report.notes.clone(),
        });
        self.persist(now);
        info!(
            checked = report.symbols_checked,
            adopted = report.adopted.len(),
            closed = report.closed.len(),
            realigned = report.realigned,
            "startup reconciliation complete"
        );
        report
    }

    /// One polling cycle.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        self.reconcile_all(Pass::Tick, now, &mut report).await;
        self.manage_open_positions(now, &mut report).await;

        if report.is_quiet() {
            debug!(checked = report.symbols_checked, "tick complete");
        } else {
            info!(
                checked = report.symbols_checked,
                failed_reads = report.failed_reads,
                adopted = ?report.adopted,
                closed = ?report.closed,
                realigned = report.realigned,
                stops_pushed = report.stops_pushed,
                partials = report.partials,
                "tick complete"
            );
        }
        report
    }

    /// Status summary of every open position and the idle watched symbols.
    pub fn heartbeat(&self, now: DateTime<Utc>) -> Event {
        let open_symbols = self.registry.open_symbols();
        let open = open_symbols
            .iter()
            .filter_map(|symbol| {
                let record = self.registry.open_position(symbol)?;
                let exchange_stop = self.watches.get(symbol.as_str()).and_then(|w| w.exchange_stop);
                Some(PositionSummary {
                    symbol: symbol.clone(),
                    side: record.side,
                    qty: record.qty,
                    entry_price: record.entry_price,
                    stop_loss: reconcile::desired_stop(record, exchange_stop),
                    take_profit: record.take_price(),
                    partial_done: record.partial_done,
                    realized_pnl: record.realized_pnl,
                })
            })
            .collect();
        let idle = self
            .settings
            .symbols
            .iter()
            .filter(|s| !open_symbols.contains(*s))
            .cloned()
            .collect();
        Event::Heartbeat {
            at: now,
            capital_usdt: self.settings.risk.capital_usdt,
            trades_closed: self.registry.trades_closed(),
            open,
            idle,
        }
    }

    // -----------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------

    /// Open a position for `signal` unless one already exists locally or on
    /// the exchange.
    #[instrument(skip_all, fields(symbol = %signal.symbol, side = %signal.side), name = "engine::open_from_signal")]
    pub async fn open_from_signal(
        &mut self,
        signal: Signal,
        now: DateTime<Utc>,
    ) -> Result<EntryOutcome> {
        let symbol = signal.symbol.as_str();
        let retry = self.settings.retry.clone();

        if self.registry.is_open(symbol) {
            return Ok(EntryOutcome::Skipped(EntrySkip::OpenLocally));
        }
        let existing = self
            .read_live(symbol)
            .await
            .with_context(|| format!("{symbol}: position check before entry failed"))?;
        if existing.is_some() {
            warn!(symbol, "entry blocked: exchange already holds a position");
            return Ok(EntryOutcome::Skipped(EntrySkip::OpenOnExchange));
        }

        let price = match signal.price.filter(|p| *p > 0.0) {
            Some(p) => p,
            None => retry
                .run("last_price", || self.exchange.last_price(symbol))
                .await
                .with_context(|| format!("{symbol}: no reference price for sizing"))?,
        };
        let filters = retry
            .run("instrument_filters", || self.exchange.instrument_filters(symbol))
            .await
            .with_context(|| format!("{symbol}: instrument filters unavailable"))?;

        let sym_risk = self.settings.risk_for(symbol);
        let qty = risk::position_size(&self.settings.risk, sym_risk.stop_loss_pct, price, &filters);
        if !(qty > 0.0) {
            return Ok(EntryOutcome::Skipped(EntrySkip::ZeroSize));
        }

        let link_id = new_order_link_id();
        let order_side = signal.side.entry_order_side();
        let fill = retry
            .run("place_market_order", || {
                self.exchange
                    .place_market_order(symbol, order_side, qty, false, &link_id)
            })
            .await
            .with_context(|| format!("{symbol}: entry order failed"))?;
        info!(symbol, order_id = %fill.order_id, qty, price, "entry order placed");

        // The exchange's view of entry and size wins over the order values.
        let live = match self.read_live(symbol).await {
            Ok(Some(live)) if live.side == signal.side => live,
            other => {
                warn!(symbol, read = ?other.map(|p| p.is_some()), "entry read-back unavailable, using order values");
                LivePosition {
                    side: signal.side,
                    qty: fill.filled_qty.filter(|q| *q > 0.0).unwrap_or(qty),
                    entry_price: price,
                    stop_loss: None,
                    take_profit: None,
                }
            }
        };

        let record = self.registry.open_record(
            symbol,
            NewPosition {
                side: live.side,
                entry_price: live.entry_price,
                qty: live.qty,
                stop_loss_pct: sym_risk.stop_loss_pct,
                take_profit_pct: sym_risk.take_profit_pct,
                origin: EntryOrigin::Signal,
                entry_conditions: signal.conditions.clone(),
            },
            &self.settings.trailing,
            now,
        );
        let (stop_loss, take_profit) = (record.stop_price(), record.take_price());
        let watch = self.watch(symbol);
        watch.miss_count = 0;
        watch.exchange_stop = live.stop_loss;
        self.persist(now);

        self.align_stop_take(symbol, &live).await;
        self.notifier.notify(&Event::Entry {
            symbol: symbol.to_string(),
            side: live.side,
            qty: live.qty,
            entry_price: live.entry_price,
            stop_loss,
            take_profit,
            conditions: signal.conditions,
        });

        Ok(EntryOutcome::Opened {
            qty: live.qty,
            entry_price: live.entry_price,
        })
    }

    // -----------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------

    async fn reconcile_all(&mut self, pass: Pass, now: DateTime<Utc>, report: &mut TickReport) {
        for symbol in self.tracked_symbols() {
            report.symbols_checked += 1;
            let live = match self.read_live(&symbol).await {
                Ok(live) => live,
                Err(e) => {
                    // Not an observation: never counts towards a close.
                    warn!(symbol = %symbol, error = %e, "position read failed, skipping symbol");
                    report.failed_reads += 1;
                    if pass == Pass::Startup {
                        report.notes.push(format!("{symbol}: position read failed ({e})"));
                    }
                    continue;
                }
            };

            match (self.registry.is_open(&symbol), live) {
                (true, Some(live)) => self.on_present(&symbol, &live, pass, now, report).await,
                (true, None) => self.on_absent(&symbol, pass, now, report).await,
                (false, Some(live)) => self.on_untracked(&symbol, &live, pass, now, report).await,
                (false, None) => {
                    self.watch(&symbol).miss_count = 0;
                }
            }
        }
    }

    /// Local record open and the exchange reports a position for the symbol.
    async fn on_present(
        &mut self,
        symbol: &str,
        live: &LivePosition,
        pass: Pass,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let replaced = self
            .registry
            .open_position(symbol)
            .filter(|record| !reconcile::same_lifetime(record, live))
            .map(|record| (record.side, record.entry_price));
        if let Some((side, entry)) = replaced {
            info!(
                symbol,
                local_side = %side,
                local_entry = entry,
                exchange_side = %live.side,
                exchange_entry = live.entry_price,
                "exchange position replaced the tracked one"
            );
            self.watch(symbol).record_seen();
            self.confirm_close(symbol, now, report).await;
            let fresh = LivePosition {
                stop_loss: reconcile::protective_stop(live),
                ..live.clone()
            };
            self.adopt(symbol, &fresh, pass, now, report).await;
            if pass == Pass::Startup {
                report.notes.push(format!("{symbol}: replaced by a {} position", live.side));
            }
            return;
        }

        let watch = self.watch(symbol);
        if let Some(misses) = watch.record_seen() {
            info!(symbol, misses, "position reported again, close not confirmed");
        }
        watch.exchange_stop = live.stop_loss;

        let mut synced = false;
        if let Some(record) = self.registry.get_mut(symbol) {
            if (record.qty - live.qty).abs() > QTY_EPSILON {
                info!(symbol, local = record.qty, exchange = live.qty, "quantity synced from exchange");
                record.qty = live.qty;
                synced = true;
            }
        }
        if synced {
            self.persist(now);
        }

        if self.align_stop_take(symbol, live).await {
            report.realigned += 1;
            if pass == Pass::Startup {
                report.notes.push(format!("{symbol}: SL/TP re-placed"));
            }
        }
    }

    /// Local record open but the exchange reports no position.
    async fn on_absent(
        &mut self,
        symbol: &str,
        pass: Pass,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let needed = self.settings.reconciliation.miss_confirm_count;
        let confirmed = match pass {
            Pass::Startup => true,
            Pass::Tick => match self.watch(symbol).record_miss(needed) {
                MissOutcome::Confirmed => true,
                MissOutcome::Pending { misses, needed } => {
                    info!(symbol, misses, needed, "position missing on exchange, awaiting confirmation");
                    false
                }
            },
        };
        if confirmed {
            self.confirm_close(symbol, now, report).await;
            if pass == Pass::Startup {
                report.notes.push(format!("{symbol}: closed while offline"));
            }
        }
    }

    /// Apply a confirmed close: update the registry, then report it.
    async fn confirm_close(&mut self, symbol: &str, now: DateTime<Utc>, report: &mut TickReport) {
        let observed = self.last_price(symbol).await;
        let tick_size = self
            .filters(symbol)
            .await
            .map(|f| f.tick_size)
            .unwrap_or(0.0);

        let Some(before) = self.registry.close_record(symbol, now) else {
            return;
        };
        self.watch(symbol).record_close(now);
        self.persist(now);

        let exit_price = observed.unwrap_or_else(|| {
            warn!(symbol, "no exit price observed, reporting at entry");
            before.entry_price
        });
        let params = &self.settings.risk;
        let reason = risk::classify_exit(&before, exit_price, tick_size);
        let pnl = before.realized_pnl
            + risk::pnl(
                before.side,
                before.entry_price,
                exit_price,
                before.qty,
                params.taker_fee_rate,
            );
        let result_pct = risk::result_pct(before.side, before.entry_price, exit_price);
        let capital_impact_pct = risk::capital_impact_pct(pnl, params.capital_usdt);

        info!(
            symbol,
            side = %before.side,
            entry = before.entry_price,
            exit = exit_price,
            %reason,
            pnl,
            result_pct,
            "position closed"
        );
        self.notifier.notify(&Event::PositionClosed {
            symbol: symbol.to_string(),
            side: before.side,
            entry_price: before.entry_price,
            exit_price,
            qty: before.qty,
            reason,
            pnl,
            result_pct,
            capital_impact_pct,
            opened_at: before.entry_timestamp,
            closed_at: now,
        });
        report.closed.push(symbol.to_string());
    }

    /// Exchange holds a position we are not tracking: adopt it as manual.
    async fn on_untracked(
        &mut self,
        symbol: &str,
        live: &LivePosition,
        pass: Pass,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let cfg = self.settings.reconciliation.clone();
        match self.watch(symbol).evaluate_open(live, &cfg, now) {
            OpenDecision::Adopt => {}
            OpenDecision::Holdoff => {
                info!(symbol, "position reported right after a confirmed close, ignoring");
                return;
            }
            OpenDecision::Duplicate => {
                debug!(symbol, "same manual position adopted moments ago, ignoring");
                return;
            }
        }
        self.adopt(symbol, live, pass, now, report).await;
    }

    /// Open a manual record for `live`, protect it and report it.
    async fn adopt(
        &mut self,
        symbol: &str,
        live: &LivePosition,
        pass: Pass,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let sym_risk = self.settings.risk_for(symbol);
        let record = self.registry.open_record(
            symbol,
            NewPosition {
                side: live.side,
                entry_price: live.entry_price,
                qty: live.qty,
                stop_loss_pct: sym_risk.stop_loss_pct,
                take_profit_pct: sym_risk.take_profit_pct,
                origin: EntryOrigin::Manual,
                entry_conditions: serde_json::json!({
                    "source": "manual",
                    "detected_at": now.to_rfc3339(),
                }),
            },
            &self.settings.trailing,
            now,
        );
        let (stop_loss, take_profit) = (record.stop_price(), record.take_price());
        self.watch(symbol).record_adopted(live, now);
        self.persist(now);

        info!(symbol, side = %live.side, qty = live.qty, entry = live.entry_price, "manual position adopted");
        self.notifier.notify(&Event::ManualOpenDetected {
            symbol: symbol.to_string(),
            side: live.side,
            qty: live.qty,
            entry_price: live.entry_price,
            stop_loss,
            take_profit,
        });

        if self.align_stop_take(symbol, live).await {
            report.realigned += 1;
        }
        report.adopted.push(symbol.to_string());
        if pass == Pass::Startup {
            report.notes.push(format!("{symbol}: manual {} position adopted", live.side));
        }
    }

    /// Push SL/TP legs that drifted beyond tolerance.  Returns `true` when the
    /// exchange applied a change.
    async fn align_stop_take(&mut self, symbol: &str, live: &LivePosition) -> bool {
        let Some(filters) = self.filters(symbol).await else {
            return false;
        };
        let Some(record) = self.registry.open_position(symbol) else {
            return false;
        };
        let plan = reconcile::plan_alignment(
            record,
            live,
            &filters,
            self.settings.reconciliation.sltp_tolerance_pct,
        );
        if plan.is_empty() {
            return false;
        }

        let result = self
            .settings
            .retry
            .run("set_stop_and_take", || {
                self.exchange
                    .set_stop_and_take(symbol, plan.stop_loss, plan.take_profit)
            })
            .await;
        match result {
            Ok(outcome) => {
                if let Some(stop) = plan.stop_loss {
                    self.watch(symbol).exchange_stop = Some(stop);
                }
                if outcome == StopUpdate::AlreadyAligned {
                    debug!(symbol, "sl/tp already in place");
                    return false;
                }
                info!(symbol, stop_loss = ?plan.stop_loss, take_profit = ?plan.take_profit, "sl/tp realigned");
                self.notifier.notify(&Event::StopTakeAligned {
                    symbol: symbol.to_string(),
                    stop_loss: plan.stop_loss,
                    take_profit: plan.take_profit,
                });
                true
            }
            Err(e) => {
                warn!(symbol, error = %e, "sl/tp realignment failed, will retry next tick");
                false
            }
        }
    }

    // -----------------------------------------------------------------
    // Exit management
    // -----------------------------------------------------------------

    async fn manage_open_positions(&mut self, now: DateTime<Utc>, report: &mut TickReport) {
        for symbol in self.registry.open_symbols() {
            // One observation drives both steps and their notifications.
            let Some(price) = self.last_price(&symbol).await else {
                continue;
            };
            self.step_trailing(&symbol, price, now, report).await;
            self.step_partial(&symbol, price, now, report).await;
        }
    }

    async fn step_trailing(
        &mut self,
        symbol: &str,
        price: f64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let Some(record) = self.registry.get_mut(symbol).filter(|r| r.open) else {
            return;
        };
        let update = record.trailing.update(price);
        let side = record.side;
        let r_now = record.trailing.r_multiple(price).unwrap_or(0.0);
        let pending = record.trailing.pending_push();
        if update.moved || update.armed_now {
            self.persist(now);
        }
        let Some(candidate) = pending else {
            return;
        };

        let Some(filters) = self.filters(symbol).await else {
            return;
        };
        let stop = filters.quantize_price(candidate);
        let exchange_stop = self.watches.get(symbol).and_then(|w| w.exchange_stop);
        let Some(record) = self.registry.open_position(symbol) else {
            return;
        };
        if let Err(skip) = push_gate(
            &record.trailing,
            stop,
            price,
            exchange_stop,
            &self.settings.trailing,
            now,
        ) {
            debug!(symbol, stop, price, %skip, "trailing push skipped");
            return;
        }

        let result = self
            .settings
            .retry
            .run("set_stop_and_take", || {
                self.exchange.set_stop_and_take(symbol, Some(stop), None)
            })
            .await;
        if let Err(e) = result {
            warn!(symbol, stop, error = %e, "trailing stop push failed, will retry next tick");
            return;
        }

        if let Some(record) = self.registry.get_mut(symbol) {
            record.trailing.record_push(stop, now);
        }
        self.watch(symbol).exchange_stop = Some(stop);
        self.persist(now);

        info!(symbol, side = %side, stop, price, r_now, "trailing stop moved");
        self.notifier.notify(&Event::TrailingMoved {
            symbol: symbol.to_string(),
            side,
            new_stop: stop,
            price,
            r_now,
        });
        report.stops_pushed += 1;
    }

    async fn step_partial(
        &mut self,
        symbol: &str,
        price: f64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) {
        let cfg = self.settings.partials_for(symbol);
        let Some(record) = self.registry.open_position(symbol) else {
            return;
        };
        let (fire, r_now) = partial::should_trigger(record, price, &cfg);
        if !fire {
            return;
        }
        info!(symbol, price, r_now, trigger_r = cfg.trigger_r, "partial exit triggered");

        let mut working = record.clone();
        let outcome = partial::execute(
            symbol,
            &mut working,
            price,
            &cfg,
            &self.exchange,
            &self.settings.retry,
            self.settings.risk.taker_fee_rate,
        )
        .await;
        if !outcome.changed_record() {
            return;
        }

        let side = working.side;
        if let Some(slot) = self.registry.get_mut(symbol) {
            *slot = working;
        }
        self.persist(now);

        if let PartialOutcome::Applied {
            closed_qty,
            remaining_qty,
            r_now,
            pnl,
        } = outcome
        {
            self.notifier.notify(&Event::PartialExecuted {
                symbol: symbol.to_string(),
                side,
                closed_qty,
                remaining_qty,
                price,
                r_now,
                pnl,
            });
            report.partials += 1;
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    /// Configured symbols first, then any other symbol still open locally.
    fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols = self.settings.symbols.clone();
        for symbol in self.registry.open_symbols() {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        symbols
    }

    fn watch(&mut self, symbol: &str) -> &mut SymbolWatch {
        self.watches.entry(symbol.to_string()).or_default()
    }

    fn persist(&self, now: DateTime<Utc>) {
        if let Err(e) = self.store.save(&self.registry.snapshot(now)) {
            warn!(error = %format!("{e:#}"), "failed to persist registry, continuing in memory");
        }
    }

    async fn read_live(&self, symbol: &str) -> Result<Option<LivePosition>, ExchangeError> {
        self.settings
            .retry
            .run("open_position", || self.exchange.open_position(symbol))
            .await
    }

    async fn last_price(&self, symbol: &str) -> Option<f64> {
        match self
            .settings
            .retry
            .run("last_price", || self.exchange.last_price(symbol))
            .await
        {
            Ok(price) => Some(price),
            Err(e) => {
                warn!(symbol, error = %e, "price unavailable");
                None
            }
        }
    }

    async fn filters(&self, symbol: &str) -> Option<InstrumentFilters> {
        match self
            .settings
            .retry
            .run("instrument_filters", || self.exchange.instrument_filters(symbol))
            .await
        {
            Ok(filters) => Some(filters),
            Err(e) => {
                warn!(symbol, error = %e, "instrument filters unavailable");
                None
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::risk::ExitReason;
    use crate::settings::TrailingConfig;
    use crate::testkit::{MemoryStore, RecordingNotifier, ScriptedExchange};
    use crate::types::OrderSide;
    use chrono::Duration;

    const BTC: &str = "BTCUSDT";

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.symbols = vec![BTC.to_string()];
        s.retry = RetryPolicy::immediate(2);
        s.risk.taker_fee_rate = 0.0;
        s
    }

    fn engine_with(
        settings: Settings,
        ex: ScriptedExchange,
        store: &MemoryStore,
        notes: &RecordingNotifier,
    ) -> Engine<ScriptedExchange> {
        Engine::new(ex, Box::new(store.clone()), Box::new(notes.clone()), settings)
    }

    fn live(entry: f64, qty: f64) -> LivePosition {
        LivePosition {
            side: Side::Long,
            qty,
            entry_price: entry,
            stop_loss: Some(99.0),
            take_profit: Some(105.0),
        }
    }

    fn at(base: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
        base + Duration::seconds(secs)
    }

    fn long_signal() -> Signal {
        Signal {
            symbol: BTC.to_string(),
            side: Side::Long,
            price: None,
            conditions: serde_json::json!({ "setup": "breakout" }),
        }
    }

    #[tokio::test]
    async fn single_miss_does_not_close() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        ex.set_live(BTC, Some(live(100.0, 1.0)));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();

        engine.tick(t0).await;
        assert!(engine.registry().is_open(BTC));

        engine.exchange().set_live(BTC, None);
        engine.tick(at(t0, 15)).await;
        assert!(engine.registry().is_open(BTC));

        engine.exchange().set_live(BTC, Some(live(100.0, 1.0)));
        engine.tick(at(t0, 30)).await;
        engine.exchange().set_live(BTC, None);
        engine.tick(at(t0, 45)).await;
        assert!(engine.registry().is_open(BTC));
        assert_eq!(notes.count("position_closed"), 0);
    }

    #[tokio::test]
    async fn consecutive_misses_close_exactly_once() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        ex.set_live(BTC, Some(live(100.0, 1.0)));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();

        engine.tick(t0).await;
        engine.exchange().set_live(BTC, None);
        engine.tick(at(t0, 15)).await;
        let report = engine.tick(at(t0, 30)).await;
        assert_eq!(report.closed, vec![BTC.to_string()]);
        engine.tick(at(t0, 45)).await;

        assert!(!engine.registry().is_open(BTC));
        assert_eq!(engine.registry().trades_closed(), 1);
        assert_eq!(notes.count("position_closed"), 1);
        let saved = store.saved().unwrap();
        assert!(!saved.records[BTC].open);
        assert_eq!(saved.records[BTC].qty, 0.0);
    }

    #[tokio::test]
    async fn failed_read_is_not_a_miss() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        ex.set_live(BTC, Some(live(100.0, 1.0)));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();
        engine.tick(t0).await;

        engine.exchange().set_live(BTC, None);
        for _ in 0..2 {
            engine
                .exchange()
                .queue_read(BTC, Err(ExchangeError::Transport("timeout".into())));
        }
        let report = engine.tick(at(t0, 15)).await;
        assert_eq!(report.failed_reads, 1);
        engine.tick(at(t0, 30)).await;
        assert!(engine.registry().is_open(BTC));

        engine.tick(at(t0, 45)).await;
        assert!(!engine.registry().is_open(BTC));
    }

    #[tokio::test]
    async fn identical_open_reports_adopt_one_record() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        ex.set_live(BTC, Some(live(100.0, 1.0)));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();

        let first = engine.tick(t0).await;
        let second = engine.tick(at(t0, 15)).await;
        assert_eq!(first.adopted, vec![BTC.to_string()]);
        assert!(second.adopted.is_empty());
        assert_eq!(notes.count("manual_open_detected"), 1);

        let rec = engine.registry().get(BTC).unwrap();
        assert_eq!(rec.entries_count, 1);
        assert_eq!(rec.origin, EntryOrigin::Manual);
        assert_eq!(rec.stop_loss_pct, 1.0);
    }

    #[tokio::test]
    async fn ghost_after_close_is_held_off_then_debounced() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        ex.set_live(BTC, Some(live(100.0, 1.0)));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();

        engine.tick(t0).await;
        engine.exchange().set_live(BTC, None);
        engine.tick(at(t0, 15)).await;
        engine.tick(at(t0, 30)).await;
        assert!(!engine.registry().is_open(BTC));

        engine.exchange().set_live(BTC, Some(live(100.0, 1.0)));
        engine.tick(at(t0, 40)).await;
        assert!(!engine.registry().is_open(BTC), "inside post-close holdoff");
        engine.tick(at(t0, 80)).await;
        assert!(!engine.registry().is_open(BTC), "same signature inside debounce");
        engine.tick(at(t0, 100)).await;
        assert!(engine.registry().is_open(BTC));
        assert_eq!(engine.registry().get(BTC).unwrap().entries_count, 2);
        assert_eq!(notes.count("manual_open_detected"), 2);
    }

    #[tokio::test]
    async fn missing_stop_and_take_are_placed_once() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let mut bare = live(100.0, 1.0);
        bare.stop_loss = None;
        bare.take_profit = None;
        ex.set_live(BTC, Some(bare));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();

        engine.tick(t0).await;
        engine.tick(at(t0, 15)).await;

        let stops = engine.exchange().stops();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].stop_loss, Some(99.0));
        assert_eq!(stops[0].take_profit, Some(105.0));
        assert_eq!(notes.count("stop_take_aligned"), 1);
    }

    #[tokio::test]
    async fn signal_entry_sizes_places_and_protects() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);

        let out = engine.open_from_signal(long_signal(), Utc::now()).await.unwrap();
        assert_eq!(
            out,
            EntryOutcome::Opened {
                qty: 10.0,
                entry_price: 100.0
            }
        );

        let orders = engine.exchange().orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert!(!orders[0].reduce_only);

        let rec = engine.registry().get(BTC).unwrap();
        assert_eq!(rec.origin, EntryOrigin::Signal);
        assert_eq!(rec.entry_conditions["setup"], "breakout");
        let held = engine.exchange().live(BTC).unwrap();
        assert_eq!(held.stop_loss, Some(99.0));
        assert_eq!(held.take_profit, Some(105.0));
        assert_eq!(notes.kinds(), vec!["stop_take_aligned", "entry"]);
        assert!(store.saved().unwrap().records[BTC].open);
    }

    #[tokio::test]
    async fn signal_entry_never_pyramids() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        ex.set_live(BTC, Some(live(100.0, 1.0)));
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);

        let out = engine.open_from_signal(long_signal(), Utc::now()).await.unwrap();
        assert_eq!(out, EntryOutcome::Skipped(EntrySkip::OpenOnExchange));

        engine.tick(Utc::now()).await;
        let out = engine.open_from_signal(long_signal(), Utc::now()).await.unwrap();
        assert_eq!(out, EntryOutcome::Skipped(EntrySkip::OpenLocally));
        assert!(engine.exchange().orders().is_empty());
    }

    #[tokio::test]
    async fn trailing_pushes_respect_cooldown() {
        let mut s = settings();
        s.partials.enabled = false;
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(s, ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();

        engine.exchange().set_price(BTC, 101.0);
        let report = engine.tick(at(t0, 15)).await;
        assert_eq!(report.stops_pushed, 1);
        let held = engine.exchange().live(BTC).unwrap().stop_loss.unwrap();
        assert!((held - 100.5).abs() < 1e-9);

        engine.exchange().set_price(BTC, 101.2);
        let report = engine.tick(at(t0, 25)).await;
        assert_eq!(report.stops_pushed, 0, "inside cooldown");

        let report = engine.tick(at(t0, 75)).await;
        assert_eq!(report.stops_pushed, 1);
        let held = engine.exchange().live(BTC).unwrap().stop_loss.unwrap();
        assert!((held - 100.7).abs() < 1e-9);

        let rec = engine.registry().get(BTC).unwrap();
        assert!(rec.trailing.armed);
        assert!((rec.trailing.last_notified_stop.unwrap() - 100.7).abs() < 1e-9);
        assert_eq!(notes.count("trailing_moved"), 2);
    }

    #[tokio::test]
    async fn partial_fires_once_through_ticks() {
        let mut s = settings();
        s.trailing = TrailingConfig {
            enabled: false,
            ..TrailingConfig::default()
        };
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(s, ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();

        engine.exchange().set_price(BTC, 100.9);
        engine.tick(at(t0, 15)).await;
        assert_eq!(notes.count("partial_executed"), 0);

        engine.exchange().set_price(BTC, 101.0);
        let report = engine.tick(at(t0, 30)).await;
        assert_eq!(report.partials, 1);
        engine.exchange().set_price(BTC, 102.0);
        engine.tick(at(t0, 45)).await;
        assert_eq!(notes.count("partial_executed"), 1);

        let orders = engine.exchange().orders();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert!(orders[1].reduce_only);
        assert!((orders[1].qty - 5.0).abs() < 1e-9);

        let saved = store.saved().unwrap();
        assert!(saved.records[BTC].partial_done);
        assert!((saved.records[BTC].qty - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn startup_closes_absent_records_and_catches_up() {
        let t0 = Utc::now();
        let mut reg = Registry::new();
        for symbol in [BTC, "ETHUSDT"] {
            reg.open_record(
                symbol,
                NewPosition {
                    side: Side::Long,
                    entry_price: 100.0,
                    qty: 2.0,
                    stop_loss_pct: 1.0,
                    take_profit_pct: 5.0,
                    origin: EntryOrigin::Signal,
                    entry_conditions: serde_json::Value::Null,
                },
                &TrailingConfig::default(),
                t0,
            );
        }
        let store = MemoryStore::with_snapshot(reg.snapshot(t0));
        let notes = RecordingNotifier::default();

        let ex = ScriptedExchange::new();
        ex.set_live(BTC, Some(live(100.0, 2.0)));
        ex.set_price(BTC, 101.5);
        ex.set_price("ETHUSDT", 99.0);
        let mut engine = engine_with(settings(), ex, &store, &notes);

        let report = engine.startup(at(t0, 60)).await;
        assert_eq!(report.closed, vec!["ETHUSDT".to_string()]);
        assert_eq!(report.partials, 1);
        assert!(engine.registry().is_open(BTC));

        match notes.events().iter().find(|e| e.kind() == "position_closed") {
            Some(Event::PositionClosed { reason, .. }) => assert_eq!(*reason, ExitReason::StopLoss),
            other => panic!("expected a close event, got {other:?}"),
        }
        assert_eq!(notes.kinds().last(), Some(&"startup_reconciled"));

        let saved = store.saved().unwrap();
        assert!(!saved.records["ETHUSDT"].open);
        assert!(saved.records[BTC].partial_done);
        assert!((saved.records[BTC].qty - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn persistence_failure_does_not_stop_the_engine() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        store.fail_saves(true);
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();

        engine.open_from_signal(long_signal(), t0).await.unwrap();
        engine.tick(at(t0, 15)).await;
        assert!(engine.registry().is_open(BTC));
        assert_eq!(store.save_count(), 0);

        store.fail_saves(false);
        engine.exchange().set_live(BTC, None);
        engine.tick(at(t0, 30)).await;
        engine.tick(at(t0, 45)).await;
        assert!(!store.saved().unwrap().records[BTC].open);
    }

    #[tokio::test]
    async fn heartbeat_reports_open_and_idle_symbols() {
        let mut s = settings();
        s.symbols = vec![BTC.to_string(), "ETHUSDT".to_string()];
        s.partials.enabled = false;
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(s, ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();
        engine.exchange().set_price(BTC, 101.0);
        engine.tick(at(t0, 15)).await;

        match engine.heartbeat(at(t0, 20)) {
            Event::Heartbeat {
                open,
                idle,
                trades_closed,
                capital_usdt,
                ..
            } => {
                assert_eq!(open.len(), 1);
                assert_eq!(open[0].symbol, BTC);
                assert_eq!(open[0].side, Side::Long);
                assert!((open[0].qty - 10.0).abs() < 1e-9);
                assert!((open[0].stop_loss - 100.5).abs() < 1e-9);
                assert_eq!(idle, vec!["ETHUSDT".to_string()]);
                assert_eq!(trades_closed, 0);
                assert_eq!(capital_usdt, 1000.0);
            }
            other => panic!("expected a heartbeat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn manual_close_before_partial_never_opens_the_other_side() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();

        engine.exchange().set_live(BTC, None);
        engine.exchange().set_price(BTC, 101.2);
        let report = engine.tick(at(t0, 15)).await;

        assert_eq!(report.partials, 0);
        assert_eq!(engine.exchange().orders().len(), 1);
        assert!(engine.exchange().live(BTC).is_none());
        let rec = engine.registry().get(BTC).unwrap();
        assert!(rec.open, "close still awaiting confirmation");
        assert!(!rec.partial_done);

        engine.tick(at(t0, 30)).await;
        assert!(!engine.registry().is_open(BTC));
        assert_eq!(engine.exchange().orders().len(), 1);
        assert!(engine.exchange().live(BTC).is_none());
    }

    #[tokio::test]
    async fn flipped_position_starts_a_new_lifetime() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();

        // Closed by hand and reopened short between two polls; the old long
        // stop is still attached.
        engine.exchange().set_price(BTC, 100.2);
        engine.exchange().set_live(
            BTC,
            Some(LivePosition {
                side: Side::Short,
                qty: 10.0,
                entry_price: 100.2,
                stop_loss: Some(99.0),
                take_profit: Some(105.0),
            }),
        );
        let report = engine.tick(at(t0, 15)).await;

        assert_eq!(report.closed, vec![BTC.to_string()]);
        assert_eq!(report.adopted, vec![BTC.to_string()]);
        let rec = engine.registry().get(BTC).unwrap();
        assert!(rec.open);
        assert_eq!(rec.side, Side::Short);
        assert_eq!(rec.origin, EntryOrigin::Manual);
        assert_eq!(rec.entries_count, 2);
        assert!((rec.entry_price - 100.2).abs() < 1e-9);

        let held = engine.exchange().live(BTC).unwrap();
        assert!((held.stop_loss.unwrap() - 101.2).abs() < 1e-9);
        assert!((held.take_profit.unwrap() - 95.19).abs() < 1e-9);

        match notes.events().iter().find(|e| e.kind() == "position_closed") {
            Some(Event::PositionClosed { side, .. }) => assert_eq!(*side, Side::Long),
            other => panic!("expected a close event, got {other:?}"),
        }
        assert_eq!(notes.count("manual_open_detected"), 1);

        let report = engine.tick(at(t0, 30)).await;
        assert!(report.closed.is_empty());
        assert!(report.adopted.is_empty());
    }

    #[tokio::test]
    async fn failed_stop_push_stays_pending_until_accepted() {
        let mut s = settings();
        s.partials.enabled = false;
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(s, ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();

        engine.exchange().fail_stops(Some(ExchangeError::Rejected {
            code: 10001,
            message: "stop loss price invalid".into(),
        }));
        engine.exchange().set_price(BTC, 101.0);
        let report = engine.tick(at(t0, 15)).await;
        assert_eq!(report.stops_pushed, 0);
        let rec = engine.registry().get(BTC).unwrap();
        assert!(rec.trailing.armed);
        assert_eq!(rec.trailing.last_notified_stop, None);
        assert!((rec.trailing.pending_push().unwrap() - 100.5).abs() < 1e-9);
        assert_eq!(engine.exchange().live(BTC).unwrap().stop_loss, Some(99.0));
        assert_eq!(notes.count("trailing_moved"), 0);

        engine.exchange().fail_stops(None);
        let report = engine.tick(at(t0, 30)).await;
        assert_eq!(report.stops_pushed, 1);
        let held = engine.exchange().live(BTC).unwrap().stop_loss.unwrap();
        assert!((held - 100.5).abs() < 1e-9);
        assert_eq!(notes.count("trailing_moved"), 1);
    }

    #[tokio::test]
    async fn missing_price_skips_exit_management() {
        let ex = ScriptedExchange::new();
        ex.set_price(BTC, 100.0);
        let (store, notes) = (MemoryStore::default(), RecordingNotifier::default());
        let mut engine = engine_with(settings(), ex, &store, &notes);
        let t0 = Utc::now();
        engine.open_from_signal(long_signal(), t0).await.unwrap();

        engine.exchange().set_price(BTC, 102.0);
        engine
            .exchange()
            .fail_prices(Some(ExchangeError::Transport("timeout".into())));
        let report = engine.tick(at(t0, 15)).await;
        assert_eq!(report.stops_pushed, 0);
        assert_eq!(report.partials, 0);
        let rec = engine.registry().get(BTC).unwrap();
        assert!(!rec.trailing.armed);
        assert!(!rec.partial_done);
        assert_eq!(engine.exchange().orders().len(), 1);

        engine.exchange().fail_prices(None);
        let report = engine.tick(at(t0, 30)).await;
        assert_eq!(report.stops_pushed, 1);
        assert_eq!(report.partials, 1);
    }
}
