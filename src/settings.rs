// =============================================================================
// Settings — typed engine configuration with atomic save
// =============================================================================
//
// Every tunable lives here: per-symbol risk, trailing, partial exits,
// reconciliation windows and the retry policy.  All fields carry serde
// defaults so that older settings files missing new fields keep loading.
//
// Partial-exit settings exist in two shapes in the wild (legacy `at_R` +
// `fraction`, and the newer `trigger_mode` / `qty_mode` form).  Both are
// normalised to one `PartialConfig` at deserialisation time and nowhere else.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::retry::RetryPolicy;
use crate::types::ExecutionMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "ETHUSDT".to_string(),
        "BTCUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_state_path() -> String {
    "data/registry.json".to_string()
}

fn default_stop_loss_pct() -> f64 {
    1.0
}

fn default_take_profit_pct() -> f64 {
    5.0
}

fn default_risk_usdt() -> f64 {
    10.0
}

fn default_leverage() -> f64 {
    10.0
}

fn default_target_margin_usdt() -> f64 {
    100.0
}

fn default_taker_fee_rate() -> f64 {
    0.0006
}

fn default_capital_usdt() -> f64 {
    1000.0
}

fn default_trigger_r() -> f64 {
    1.0
}

fn default_distance_r() -> f64 {
    0.5
}

fn default_min_move_pct() -> f64 {
    0.05
}

fn default_cooldown_seconds() -> f64 {
    45.0
}

fn default_poll_interval_seconds() -> f64 {
    15.0
}

fn default_debounce_seconds() -> f64 {
    90.0
}

fn default_holdoff_seconds() -> f64 {
    45.0
}

fn default_miss_confirm_count() -> u32 {
    2
}

fn default_sltp_tolerance_pct() -> f64 {
    0.1
}

fn default_heartbeat_minutes() -> f64 {
    30.0
}

/// Default partial trigger when the configured value is missing or invalid.
const DEFAULT_PARTIAL_TRIGGER_R: f64 = 1.0;
/// Default partial fraction when the configured value is missing or invalid.
const DEFAULT_PARTIAL_FRACTION: f64 = 0.5;

fn seconds(secs: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((secs.max(0.0) * 1000.0).round() as i64)
}

// =============================================================================
// RiskParams
// =============================================================================

/// Risk parameters captured into every position at entry, plus sizing inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    /// Stop-loss distance as a percentage of entry price.
    #[serde(default = "default_stop_loss_pct", alias = "stop_pct")]
    pub stop_loss_pct: f64,

    /// Take-profit distance as a percentage of entry price.
    #[serde(default = "default_take_profit_pct", alias = "take_pct")]
    pub take_profit_pct: f64,

    /// Quote currency lost if the stop is hit (used for sizing).
    #[serde(default = "default_risk_usdt")]
    pub risk_usdt: f64,

    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Margin committed per entry; `leverage * target_margin_usdt` caps notional.
    #[serde(default = "default_target_margin_usdt")]
    pub target_margin_usdt: f64,

    /// Taker fee per side, as a fraction (0.0006 = 6 bps).
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,

    /// Account capital used to express PnL as a capital impact.
    #[serde(default = "default_capital_usdt")]
    pub capital_usdt: f64,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            risk_usdt: default_risk_usdt(),
            leverage: default_leverage(),
            target_margin_usdt: default_target_margin_usdt(),
            taker_fee_rate: default_taker_fee_rate(),
            capital_usdt: default_capital_usdt(),
        }
    }
}

/// Per-symbol overrides. Absent fields fall back to the global values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolOverride {
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default, alias = "parcial")]
    pub partials: Option<PartialConfig>,
}

/// Resolved stop / take percentages for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolRisk {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
}

// =============================================================================
// TrailingConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// R-multiple at which the stop moves to breakeven.
    #[serde(default = "default_trigger_r", rename = "trigger_R")]
    pub trigger_r: f64,

    /// Trailing distance behind the best price, in R.
    #[serde(default = "default_distance_r", rename = "distance_R")]
    pub distance_r: f64,

    /// Minimum improvement (%) over the last pushed stop before pushing again.
    #[serde(default = "default_min_move_pct", alias = "min_mov_sl_pct")]
    pub min_move_pct: f64,

    /// Minimum seconds between two stop pushes for the same position.
    #[serde(default = "default_cooldown_seconds", alias = "cooldown_seg")]
    pub cooldown_seconds: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_r: default_trigger_r(),
            distance_r: default_distance_r(),
            min_move_pct: default_min_move_pct(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

impl TrailingConfig {
    pub fn cooldown(&self) -> chrono::Duration {
        seconds(self.cooldown_seconds)
    }
}

// =============================================================================
// PartialConfig — canonical shape + normalisation
// =============================================================================

/// Canonical partial-exit configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawPartialConfig")]
pub struct PartialConfig {
    pub enabled: bool,
    #[serde(rename = "trigger_R")]
    pub trigger_r: f64,
    /// Share of the open quantity to close, in (0, 1].
    pub fraction: f64,
}

impl Default for PartialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_r: DEFAULT_PARTIAL_TRIGGER_R,
            fraction: DEFAULT_PARTIAL_FRACTION,
        }
    }
}

/// Every accepted input shape, as written by users.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPartialConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub trigger_mode: Option<String>,
    #[serde(default, rename = "trigger_R")]
    pub trigger_r: Option<serde_json::Value>,
    #[serde(default)]
    pub qty_mode: Option<String>,
    /// Percent of the open quantity (new shape).
    #[serde(default)]
    pub qty_value: Option<serde_json::Value>,
    #[serde(default, rename = "at_R")]
    pub at_r: Option<serde_json::Value>,
    #[serde(default)]
    pub fraction: Option<serde_json::Value>,
}

/// Accept JSON numbers and numeric strings; reject anything non-finite.
fn as_number(value: &Option<serde_json::Value>) -> Option<f64> {
    let n = match value.as_ref()? {
        serde_json::Value::Number(n) => n.as_f64()?,
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn mode_is(mode: &Option<String>, expected: &str) -> bool {
    mode.as_deref()
        .map(|m| m.trim().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

impl From<RawPartialConfig> for PartialConfig {
    fn from(raw: RawPartialConfig) -> Self {
        let mut trigger_r = if mode_is(&raw.trigger_mode, "r_multiple") {
            as_number(&raw.trigger_r)
        } else {
            None
        };
        let mut fraction = if mode_is(&raw.qty_mode, "percent_of_open") {
            as_number(&raw.qty_value).map(|pct| pct / 100.0)
        } else {
            None
        };

        // Legacy keys, then a bare `trigger_R` (the canonical serialised form).
        trigger_r = trigger_r
            .or_else(|| as_number(&raw.at_r))
            .or_else(|| as_number(&raw.trigger_r));
        fraction = fraction.or_else(|| as_number(&raw.fraction));

        let trigger_r = match trigger_r {
            Some(r) if r > 0.0 => r,
            _ => DEFAULT_PARTIAL_TRIGGER_R,
        };
        let fraction = match fraction {
            Some(f) if f > 1.0 => 1.0,
            Some(f) if f > 0.0 => f,
            _ => DEFAULT_PARTIAL_FRACTION,
        };

        Self {
            enabled: raw.enabled.unwrap_or(true),
            trigger_r,
            fraction,
        }
    }
}

// =============================================================================
// ReconcileConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: f64,

    /// Identical "manual open" observations inside this window are ignored.
    #[serde(default = "default_debounce_seconds", alias = "manual_detect_debounce_s")]
    pub manual_detect_debounce_seconds: f64,

    /// Open observations this soon after a confirmed close are treated as ghosts.
    #[serde(default = "default_holdoff_seconds", alias = "post_close_holdoff_s")]
    pub post_close_holdoff_seconds: f64,

    /// Consecutive missing reads required before a close is confirmed.
    #[serde(default = "default_miss_confirm_count")]
    pub miss_confirm_count: u32,

    /// SL/TP drift (%) tolerated before re-issuing them.
    #[serde(default = "default_sltp_tolerance_pct")]
    pub sltp_tolerance_pct: f64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            manual_detect_debounce_seconds: default_debounce_seconds(),
            post_close_holdoff_seconds: default_holdoff_seconds(),
            miss_confirm_count: default_miss_confirm_count(),
            sltp_tolerance_pct: default_sltp_tolerance_pct(),
        }
    }
}

impl ReconcileConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis((self.poll_interval_seconds.max(0.1) * 1000.0) as u64)
    }

    pub fn debounce_window(&self) -> chrono::Duration {
        seconds(self.manual_detect_debounce_seconds)
    }

    pub fn holdoff_window(&self) -> chrono::Duration {
        seconds(self.post_close_holdoff_seconds)
    }
}

// =============================================================================
// HeartbeatConfig
// =============================================================================

/// Periodic status summary of open positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_heartbeat_minutes", alias = "cada_minutos")]
    pub every_minutes: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            every_minutes: default_heartbeat_minutes(),
        }
    }
}

impl HeartbeatConfig {
    /// Interval between heartbeats, never shorter than one minute.
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs((self.every_minutes.max(1.0) * 60.0) as u64)
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Symbols the engine watches and reconciles.
    #[serde(default = "default_symbols", alias = "simbolos")]
    pub symbols: Vec<String>,

    #[serde(default, alias = "riesgo")]
    pub risk: RiskParams,

    #[serde(default)]
    pub symbol_overrides: HashMap<String, SymbolOverride>,

    #[serde(default)]
    pub trailing: TrailingConfig,

    #[serde(default, alias = "parcial")]
    pub partials: PartialConfig,

    #[serde(default)]
    pub reconciliation: ReconcileConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Where the position registry snapshot is persisted.
    #[serde(default = "default_state_path")]
    pub state_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Paper,
            symbols: default_symbols(),
            risk: RiskParams::default(),
            symbol_overrides: HashMap::new(),
            trailing: TrailingConfig::default(),
            partials: PartialConfig::default(),
            reconciliation: ReconcileConfig::default(),
            retry: RetryPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            state_path: default_state_path(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?;

        let settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings from {}", path.display()))?;
        settings.validate()?;

        info!(
            path = %path.display(),
            mode = %settings.mode,
            symbols = ?settings.symbols,
            partial_trigger_r = settings.partials.trigger_r,
            partial_fraction = settings.partials.fraction,
            "settings loaded"
        );

        Ok(settings)
    }

    /// Persist settings using an atomic write (tmp file, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise settings to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp settings to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp settings to {}", path.display()))?;

        info!(path = %path.display(), "settings saved (atomic)");
        Ok(())
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.risk.stop_loss_pct <= 0.0 || self.risk.take_profit_pct <= 0.0 {
            bail!(
                "risk.stop_loss_pct and risk.take_profit_pct must be > 0 (got {} / {})",
                self.risk.stop_loss_pct,
                self.risk.take_profit_pct
            );
        }
        for (symbol, o) in &self.symbol_overrides {
            if o.stop_loss_pct.is_some_and(|v| v <= 0.0)
                || o.take_profit_pct.is_some_and(|v| v <= 0.0)
            {
                bail!("symbol_overrides.{symbol}: stop/take percentages must be > 0");
            }
        }
        if self.reconciliation.miss_confirm_count == 0 {
            bail!("reconciliation.miss_confirm_count must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            bail!(
                "retry.jitter_fraction must be within [0, 1] (got {})",
                self.retry.jitter_fraction
            );
        }
        Ok(())
    }

    /// Apply `BOT_SYMBOLS`, `BOT_MODE` and `BOT_STATE_PATH` from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("BOT_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(mode) = std::env::var("BOT_MODE") {
            match mode.trim().to_ascii_lowercase().as_str() {
                "live" | "real" => self.mode = ExecutionMode::Live,
                "paper" | "sim" => self.mode = ExecutionMode::Paper,
                other => warn!(value = other, "ignoring unknown BOT_MODE"),
            }
        }
        if let Ok(path) = std::env::var("BOT_STATE_PATH") {
            if !path.trim().is_empty() {
                self.state_path = path;
            }
        }
    }

    /// Stop / take percentages for `symbol`, honouring overrides.
    pub fn risk_for(&self, symbol: &str) -> SymbolRisk {
        let o = self.symbol_overrides.get(symbol);
        SymbolRisk {
            stop_loss_pct: o
                .and_then(|o| o.stop_loss_pct)
                .unwrap_or(self.risk.stop_loss_pct),
            take_profit_pct: o
                .and_then(|o| o.take_profit_pct)
                .unwrap_or(self.risk.take_profit_pct),
        }
    }

    /// Partial-exit configuration for `symbol`.
    pub fn partials_for(&self, symbol: &str) -> PartialConfig {
        self.symbol_overrides
            .get(symbol)
            .and_then(|o| o.partials)
            .unwrap_or(self.partials)
    }
}
