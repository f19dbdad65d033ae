//! On-disk state: bot configs, settlement records, runtime state,
//! global settings, and the per-bot closed-trade CSV history.
//!
//! Every JSON document is written atomically (write temp, then rename)
//! so a crash mid-write can never corrupt monetary state. Bot config
//! files carry the wallet secret and are chmod 0600 on Unix.

pub mod secrets;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::{BotConfig, GlobalSettings};
use crate::types::{ExitReason, Position, PositionSide};

/// Write `value` as pretty JSON via a temp file and rename.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T, restrict_mode: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(value)?;
    fs::write(&tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;

    #[cfg(unix)]
    if restrict_mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to chmod {}", tmp.display()))?;
    }
    #[cfg(not(unix))]
    let _ = restrict_mode;

    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let body =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Persisted monetary state of one bot, survives restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub realized_pnl_usd: f64,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    #[serde(default)]
    pub last_exit_time: Option<DateTime<Utc>>,
    /// Open position at the time of the last save; surfaced on restart
    /// for manual recovery, never auto-reopened.
    #[serde(default)]
    pub open_position: Option<Position>,
}

/// Small non-monetary runtime state (24h baseline, last trade marker).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub price_24h_ago: Option<f64>,
    #[serde(default)]
    pub price_24h_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_trade_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_trade_side: Option<String>,
}

/// One row of the closed-trade CSV history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTradeRecord {
    pub ts_open_ms: i64,
    pub ts_close_ms: i64,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub amount_usd: f64,
    pub shares: f64,
    pub pnl_usd: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub order_id: Option<String>,
    pub simulated: bool,
}

/// All per-bot and process-wide files under one data directory.
#[derive(Debug, Clone)]
pub struct Store {
    data_dir: PathBuf,
}

impl Store {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn bots_dir(&self) -> PathBuf {
        self.data_dir.join("bots")
    }

    fn config_path(&self, bot_id: &str) -> PathBuf {
        self.bots_dir().join(format!("{bot_id}.json"))
    }

    fn settlement_path(&self, bot_id: &str) -> PathBuf {
        self.bots_dir().join(format!("{bot_id}_settlement.json"))
    }

    fn runtime_path(&self, bot_id: &str) -> PathBuf {
        self.bots_dir().join(format!("{bot_id}_runtime.json"))
    }

    fn trades_path(&self, bot_id: &str) -> PathBuf {
        self.bots_dir().join(format!("{bot_id}_trades.csv"))
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }

    // ── Bot configs ────────────────────────────────────────────────

    pub fn save_config(&self, cfg: &BotConfig) -> Result<()> {
        atomic_write_json(&self.config_path(&cfg.id), cfg, true)?;
        info!(bot_id = %cfg.id, "bot config saved");
        Ok(())
    }

    pub fn load_config(&self, bot_id: &str) -> Result<Option<BotConfig>> {
        read_json(&self.config_path(bot_id))
    }

    /// All persisted bot configs. Unreadable files are logged and
    /// skipped rather than failing startup.
    pub fn load_all_configs(&self) -> Result<Vec<BotConfig>> {
        let dir = self.bots_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut configs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json")
                || name.ends_with("_settlement.json")
                || name.ends_with("_runtime.json")
            {
                continue;
            }
            match read_json::<BotConfig>(&path) {
                Ok(Some(cfg)) => configs.push(cfg),
                Ok(None) => {}
                Err(e) => error!(path = %path.display(), error = %e, "skipping unreadable bot config"),
            }
        }
        configs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(configs)
    }

    pub fn delete_config(&self, bot_id: &str) -> Result<bool> {
        let path = self.config_path(bot_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .with_context(|| format!("failed to delete {}", path.display()))?;
        // Runtime state goes with the config; the settlement record is
        // kept on disk as an audit trail.
        let _ = fs::remove_file(self.runtime_path(bot_id));
        info!(bot_id, "bot config deleted");
        Ok(true)
    }

    // ── Settlement records ─────────────────────────────────────────

    pub fn save_settlement(&self, bot_id: &str, record: &SettlementRecord) -> Result<()> {
        atomic_write_json(&self.settlement_path(bot_id), record, false)
    }

    pub fn load_settlement(&self, bot_id: &str) -> Result<Option<SettlementRecord>> {
        read_json(&self.settlement_path(bot_id))
    }

    // ── Runtime state ──────────────────────────────────────────────

    /// Best effort: runtime state is convenience data, losing it only
    /// costs a 24h baseline.
    pub fn save_runtime(&self, bot_id: &str, state: &RuntimeState) {
        if let Err(e) = atomic_write_json(&self.runtime_path(bot_id), state, false) {
            warn!(bot_id, error = %e, "failed to save runtime state");
        }
    }

    pub fn load_runtime(&self, bot_id: &str) -> RuntimeState {
        read_json(&self.runtime_path(bot_id))
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    // ── Global settings ────────────────────────────────────────────

    pub fn save_settings(&self, settings: &GlobalSettings) -> Result<()> {
        atomic_write_json(&self.settings_path(), settings, false)
    }

    pub fn load_settings(&self) -> Result<GlobalSettings> {
        Ok(read_json(&self.settings_path())?.unwrap_or_default())
    }

    // ── Trade history CSV ──────────────────────────────────────────

    /// Append one closed trade to the bot's CSV history.
    pub fn append_trade(&self, bot_id: &str, record: &ClosedTradeRecord) -> Result<()> {
        let path = self.trades_path(bot_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let new_file = !path.exists();
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(new_file)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load_trades(&self, bot_id: &str) -> Result<Vec<ClosedTradeRecord>> {
        let path = self.trades_path(bot_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut records = Vec::new();
        for row in reader.deserialize() {
            match row {
                Ok(rec) => records.push(rec),
                Err(e) => warn!(bot_id, error = %e, "skipping malformed trade row"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SealedSecret;

    fn store() -> (tempdir::TempDir, Store) {
        let dir = tempdir::TempDir::new("spikebot-store").unwrap();
        let store = Store::new(dir.path());
        (dir, store)
    }

    // Minimal stand-in for the tempfile crate: unique dir per test.
    mod tempdir {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new(prefix: &str) -> std::io::Result<Self> {
                let mut path = std::env::temp_dir();
                path.push(format!(
                    "{prefix}-{}-{:x}",
                    std::process::id(),
                    rand::random::<u64>()
                ));
                std::fs::create_dir_all(&path)?;
                Ok(Self(path))
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    fn sample_config(name: &str) -> BotConfig {
        let mut cfg = BotConfig::new(name, SealedSecret("enc:abc".into()));
        cfg.token_id = Some("tok".into());
        cfg
    }

    #[test]
    fn test_config_roundtrip_and_list() {
        let (_dir, store) = store();
        let a = sample_config("alpha");
        let b = sample_config("beta");
        store.save_config(&a).unwrap();
        store.save_config(&b).unwrap();

        let loaded = store.load_config(&a.id).unwrap().unwrap();
        assert_eq!(loaded.name, "alpha");
        assert_eq!(loaded.wallet_secret_encrypted, a.wallet_secret_encrypted);

        let all = store.load_all_configs().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_settlement_files_are_not_listed_as_configs() {
        let (_dir, store) = store();
        let cfg = sample_config("gamma");
        store.save_config(&cfg).unwrap();
        store
            .save_settlement(&cfg.id, &SettlementRecord::default())
            .unwrap();
        store.save_runtime(&cfg.id, &RuntimeState::default());

        let all = store.load_all_configs().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_delete_keeps_settlement_record() {
        let (_dir, store) = store();
        let cfg = sample_config("delta");
        store.save_config(&cfg).unwrap();
        let record = SettlementRecord {
            realized_pnl_usd: 1.25,
            total_trades: 3,
            ..Default::default()
        };
        store.save_settlement(&cfg.id, &record).unwrap();

        assert!(store.delete_config(&cfg.id).unwrap());
        assert!(store.load_config(&cfg.id).unwrap().is_none());
        let kept = store.load_settlement(&cfg.id).unwrap().unwrap();
        assert_eq!(kept.total_trades, 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_is_world_unreadable() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, store) = store();
        let cfg = sample_config("perm");
        store.save_config(&cfg).unwrap();
        let mode = std::fs::metadata(store.config_path(&cfg.id))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_trade_history_appends() {
        let (_dir, store) = store();
        let record = ClosedTradeRecord {
            ts_open_ms: 1,
            ts_close_ms: 2,
            side: PositionSide::Long,
            entry_price: 0.5,
            exit_price: 0.525,
            amount_usd: 5.0,
            shares: 10.0,
            pnl_usd: 0.25,
            pnl_pct: 5.0,
            exit_reason: ExitReason::TakeProfit,
            order_id: Some("oid".into()),
            simulated: true,
        };
        store.append_trade("bot_x", &record).unwrap();
        store.append_trade("bot_x", &record).unwrap();
        let rows = store.load_trades("bot_x").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].exit_reason, ExitReason::TakeProfit);
    }

    #[test]
    fn test_settings_default_when_missing() {
        let (_dir, store) = store();
        let settings = store.load_settings().unwrap();
        assert!(settings.stream_enabled);
        store.save_settings(&settings).unwrap();
        assert!(store.settings_path().exists());
    }
}
