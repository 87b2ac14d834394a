// =============================================================================
// Position Registry — per-symbol position records and durable snapshots
// =============================================================================
//
// The registry is owned by the engine loop and is its only writer.  The
// exchange is authoritative for whether a position exists and how large it is;
// the registry is authoritative for the risk parameters captured at entry and
// for trailing / partial progress.
//
// Persistence is a JSON snapshot written atomically: the previous file is
// copied to `.bak`, the new content goes to `.tmp` and is renamed over the
// original.  A corrupt primary file falls back to the backup on load.
// =============================================================================

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::exit::trailing::TrailingState;
use crate::settings::TrailingConfig;
use crate::types::Side;

/// Snapshot format version written to disk.
const SNAPSHOT_VERSION: u32 = 1;

// =============================================================================
// PositionRecord
// =============================================================================

/// How a position came to be tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    /// Opened by the engine after a strategy signal.
    Signal,
    /// Observed on the exchange with no local record.
    Manual,
}

impl Default for EntryOrigin {
    fn default() -> Self {
        Self::Signal
    }
}

/// One tracked instrument. At most one position per symbol is open at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub side: Side,
    pub entry_price: f64,
    /// Current open quantity; 0 once closed.
    pub qty: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    /// Number of times this symbol has been entered.
    pub entries_count: u64,
    pub open: bool,
    pub entry_timestamp: DateTime<Utc>,
    #[serde(rename = "trailing_state")]
    pub trailing: TrailingState,
    #[serde(default)]
    pub partial_done: bool,
    /// Opaque audit snapshot of why the position was entered.
    #[serde(default)]
    pub entry_conditions: serde_json::Value,
    /// Fee-aware PnL already realised by partial exits.
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub origin: EntryOrigin,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl PositionRecord {
    /// Configured stop-loss price.
    pub fn stop_price(&self) -> f64 {
        self.entry_price - self.side.sign() * self.entry_price * self.stop_loss_pct / 100.0
    }

    /// Configured take-profit price.
    pub fn take_price(&self) -> f64 {
        self.entry_price + self.side.sign() * self.entry_price * self.take_profit_pct / 100.0
    }

    /// Price distance of one R for the partial-exit trigger.
    pub fn risk_per_unit(&self) -> f64 {
        self.entry_price * self.stop_loss_pct / 100.0
    }
}

/// Inputs for a freshly opened position.
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub side: Side,
    pub entry_price: f64,
    pub qty: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub origin: EntryOrigin,
    pub entry_conditions: serde_json::Value,
}

// =============================================================================
// Registry
// =============================================================================

/// Durable form of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub records: BTreeMap<String, PositionRecord>,
    #[serde(default)]
    pub trades_closed: u64,
}

/// In-memory position registry.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: BTreeMap<String, PositionRecord>,
    trades_closed: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            records: snapshot.records,
            trades_closed: snapshot.trades_closed,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> RegistrySnapshot {
        RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            records: self.records.clone(),
            trades_closed: self.trades_closed,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&PositionRecord> {
        self.records.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut PositionRecord> {
        self.records.get_mut(symbol)
    }

    /// The record for `symbol` if it is currently open.
    pub fn open_position(&self, symbol: &str) -> Option<&PositionRecord> {
        self.records.get(symbol).filter(|r| r.open)
    }

    pub fn is_open(&self, symbol: &str) -> bool {
        self.open_position(symbol).is_some()
    }

    /// Symbols with an open record, in sorted order.
    pub fn open_symbols(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| r.open)
            .map(|(s, _)| s.clone())
            .collect()
    }

    pub fn trades_closed(&self) -> u64 {
        self.trades_closed
    }

    /// Start a new position lifetime for `symbol`.  Trailing and partial
    /// progress from any previous lifetime is discarded.
    pub fn open_record(
        &mut self,
        symbol: &str,
        new: NewPosition,
        trailing: &TrailingConfig,
        now: DateTime<Utc>,
    ) -> &mut PositionRecord {
        let entries_count = self
            .records
            .get(symbol)
            .map(|r| r.entries_count)
            .unwrap_or(0)
            + 1;

        let record = PositionRecord {
            side: new.side,
            entry_price: new.entry_price,
            qty: new.qty,
            stop_loss_pct: new.stop_loss_pct,
            take_profit_pct: new.take_profit_pct,
            entries_count,
            open: true,
            entry_timestamp: now,
            trailing: TrailingState::new(trailing, new.side, new.entry_price, new.stop_loss_pct),
            partial_done: false,
            entry_conditions: new.entry_conditions,
            realized_pnl: 0.0,
            origin: new.origin,
            closed_at: None,
        };

        info!(
            symbol,
            side = %record.side,
            entry = record.entry_price,
            qty = record.qty,
            entries_count,
            origin = ?record.origin,
            "position record opened"
        );

        match self.records.entry(symbol.to_string()) {
            Entry::Occupied(mut slot) => {
                slot.insert(record);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(record),
        }
    }

    /// Mark `symbol` closed.  Returns the record as it was just before closing,
    /// or `None` when nothing was open.
    pub fn close_record(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<PositionRecord> {
        let record = self.records.get_mut(symbol).filter(|r| r.open)?;
        let before = record.clone();
        record.open = false;
        record.qty = 0.0;
        record.closed_at = Some(now);
        self.trades_closed += 1;
        info!(symbol, entries_count = record.entries_count, "position record closed");
        Some(before)
    }
}

// =============================================================================
// StateStore
// =============================================================================

/// Durable storage for registry snapshots.
pub trait StateStore: Send + Sync {
    /// `Ok(None)` when no snapshot has been written yet.
    fn load(&self) -> Result<Option<RegistrySnapshot>>;

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()>;
}

/// JSON file store with `.bak` backup and atomic replace.
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self) -> PathBuf {
        self.path.with_extension("json.bak")
    }

    fn read(path: &Path) -> Result<RegistrySnapshot> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read state from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state from {}", path.display()))
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<Option<RegistrySnapshot>> {
        let backup = self.backup_path();
        if !self.path.exists() && !backup.exists() {
            debug!(path = %self.path.display(), "no state file yet");
            return Ok(None);
        }

        match Self::read(&self.path) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(primary) if backup.exists() => {
                warn!(
                    path = %self.path.display(),
                    error = %primary,
                    "state file unreadable, falling back to backup"
                );
                Self::read(&backup).map(Some)
            }
            Err(primary) => Err(primary),
        }
    }

    fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        let path = &self.path;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        }

        let content =
            serde_json::to_string_pretty(snapshot).context("failed to serialise registry")?;

        if path.exists() {
            let backup = self.backup_path();
            std::fs::copy(path, &backup)
                .with_context(|| format!("failed to back up state to {}", backup.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp state to {}", path.display()))?;

        debug!(path = %path.display(), records = snapshot.records.len(), "registry saved");
        Ok(())
    }
}
