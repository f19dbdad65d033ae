//! Per-bot persisted configuration.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange minimum order notional in USD.
pub const MIN_TRADE_USD: f64 = 1.0;

/// Opaque sealed wallet secret (`enc:`-prefixed ciphertext).
///
/// Never printed: `Debug`/`Display` render a mask. Serialization keeps
/// the sealed form so config files round-trip; API responses must go
/// through [`BotConfig::public_view`] instead of serializing directly.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SealedSecret(pub String);

impl SealedSecret {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn masked() -> Self {
        SealedSecret("enc:***".to_string())
    }
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSecret(***)")
    }
}

/// How orders are signed for this wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureMode {
    /// Plain EOA signing.
    #[default]
    Direct,
    /// Gnosis-proxy signing; requires a funder address.
    Proxy,
}

/// Strategy variant a bot runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyMode {
    /// Fade detected spikes: short pumps, buy dumps.
    #[default]
    SpikeFade,
    /// Cyclic buy -> sell -> buy with explicit saved targets.
    TrainOfTrade,
}

/// What the bot does right after its first usable price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryMode {
    ImmediateBuy,
    #[default]
    WaitForSpike,
    DelayedBuy,
}

/// How the next buy target is placed after an exit (train of trade).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebuyStrategy {
    /// Rebuy as soon as price revisits the exit level or below.
    #[default]
    Immediate,
    /// Rebuy only after price drops `rebuy_drop_pct` below the exit.
    WaitForDrop,
}

/// Full configuration of one bot. One JSON file per bot on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // Identity
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    // Market binding: a slug to resolve, or a token id directly.
    #[serde(default)]
    pub market_slug: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub outcome_index: usize,

    // Wallet binding
    pub wallet_secret_encrypted: SealedSecret,
    #[serde(default)]
    pub signature_mode: SignatureMode,
    #[serde(default)]
    pub funder_address: Option<String>,

    // Strategy selection
    #[serde(default)]
    pub strategy_mode: StrategyMode,
    #[serde(default)]
    pub entry_mode: EntryMode,
    #[serde(default)]
    pub entry_delay_seconds: u64,

    // Spike detection
    pub spike_threshold_pct: f64,
    #[serde(default = "default_min_spike_strength")]
    pub min_spike_strength: f64,
    #[serde(default = "default_spike_windows")]
    pub spike_windows_seconds: Vec<u64>,
    #[serde(default = "default_true")]
    pub use_volatility_filter: bool,
    #[serde(default = "default_max_volatility_cv")]
    pub max_volatility_cv: f64,
    #[serde(default = "default_history_size")]
    pub price_history_size: usize,

    // Risk parameters
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub max_hold_seconds: u64,
    pub cooldown_seconds: u64,
    #[serde(default = "default_settlement_delay")]
    pub settlement_delay_seconds: f64,
    pub trade_size_usd: f64,
    #[serde(default = "default_max_balance")]
    pub max_balance_usd: f64,
    /// 0 disables the per-session trade cap.
    #[serde(default)]
    pub max_trades_per_session: u32,
    /// 0 disables the per-session loss limit.
    #[serde(default)]
    pub session_loss_limit_usd: f64,

    // Rebuy behavior
    #[serde(default)]
    pub rebuy_strategy: RebuyStrategy,
    #[serde(default = "default_rebuy_delay")]
    pub rebuy_delay_seconds: f64,
    #[serde(default = "default_rebuy_drop")]
    pub rebuy_drop_pct: f64,

    // Order-book guards (per-bot overrides of the global floors)
    #[serde(default = "default_bid_liquidity")]
    pub min_bid_liquidity_usd: f64,
    #[serde(default = "default_ask_liquidity")]
    pub min_ask_liquidity_usd: f64,
    #[serde(default = "default_max_spread")]
    pub max_spread_pct: f64,

    // Mode
    #[serde(default = "default_true")]
    pub dry_run: bool,

    /// Profile this config was seeded from, if any.
    #[serde(default)]
    pub trading_profile: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_min_spike_strength() -> f64 {
    5.0
}
fn default_spike_windows() -> Vec<u64> {
    vec![600, 1800, 3600]
}
fn default_max_volatility_cv() -> f64 {
    10.0
}
fn default_history_size() -> usize {
    3600
}
fn default_settlement_delay() -> f64 {
    2.0
}
fn default_max_balance() -> f64 {
    10.0
}
fn default_rebuy_delay() -> f64 {
    2.0
}
fn default_rebuy_drop() -> f64 {
    0.1
}
fn default_bid_liquidity() -> f64 {
    5.0
}
fn default_ask_liquidity() -> f64 {
    5.0
}
fn default_max_spread() -> f64 {
    1.0
}

impl BotConfig {
    /// New config with defaults, ready for overrides from the API layer.
    pub fn new(name: impl Into<String>, wallet_secret_encrypted: SealedSecret) -> Self {
        let now = Utc::now();
        Self {
            id: crate::short_id("bot"),
            name: name.into(),
            description: String::new(),
            created_at: now,
            updated_at: now,
            market_slug: None,
            token_id: None,
            outcome_index: 0,
            wallet_secret_encrypted,
            signature_mode: SignatureMode::Direct,
            funder_address: None,
            strategy_mode: StrategyMode::SpikeFade,
            entry_mode: EntryMode::WaitForSpike,
            entry_delay_seconds: 0,
            spike_threshold_pct: 8.0,
            min_spike_strength: default_min_spike_strength(),
            spike_windows_seconds: default_spike_windows(),
            use_volatility_filter: true,
            max_volatility_cv: default_max_volatility_cv(),
            price_history_size: default_history_size(),
            take_profit_pct: 3.0,
            stop_loss_pct: 2.5,
            max_hold_seconds: 3600,
            cooldown_seconds: 120,
            settlement_delay_seconds: default_settlement_delay(),
            trade_size_usd: 2.0,
            max_balance_usd: default_max_balance(),
            max_trades_per_session: 0,
            session_loss_limit_usd: 0.0,
            rebuy_strategy: RebuyStrategy::Immediate,
            rebuy_delay_seconds: default_rebuy_delay(),
            rebuy_drop_pct: default_rebuy_drop(),
            min_bid_liquidity_usd: default_bid_liquidity(),
            min_ask_liquidity_usd: default_ask_liquidity(),
            max_spread_pct: default_max_spread(),
            dry_run: true,
            trading_profile: None,
        }
    }

    /// Reject configurations that could not trade safely.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("bot name must not be empty");
        }
        if self.market_slug.is_none() && self.token_id.is_none() {
            bail!("either market_slug or token_id must be set");
        }
        if self.wallet_secret_encrypted.is_empty() {
            bail!("wallet secret is required");
        }
        if self.signature_mode == SignatureMode::Proxy && self.funder_address.is_none() {
            bail!("funder_address is required in proxy signature mode");
        }
        if !(0.0 < self.spike_threshold_pct && self.spike_threshold_pct < 100.0) {
            bail!("spike_threshold_pct must be in (0, 100)");
        }
        if !(0.0 < self.take_profit_pct && self.take_profit_pct < 100.0) {
            bail!("take_profit_pct must be in (0, 100)");
        }
        if !(0.0 < self.stop_loss_pct && self.stop_loss_pct < 100.0) {
            bail!("stop_loss_pct must be in (0, 100)");
        }
        if self.max_hold_seconds == 0 {
            bail!("max_hold_seconds must be > 0");
        }
        if self.trade_size_usd < MIN_TRADE_USD {
            bail!("trade_size_usd must be >= ${MIN_TRADE_USD:.2} (exchange minimum)");
        }
        if self.spike_windows_seconds.is_empty() {
            bail!("at least one spike window is required");
        }
        if self.spike_windows_seconds.iter().any(|w| *w == 0) {
            bail!("spike windows must be positive");
        }
        if self.price_history_size < 5 {
            bail!("price_history_size must be >= 5");
        }
        Ok(())
    }

    /// Shortest configured spike window, used by the volatility gate.
    pub fn shortest_window_seconds(&self) -> u64 {
        self.spike_windows_seconds.iter().copied().min().unwrap_or(0)
    }

    /// Copy safe for API responses and broadcast: the wallet secret is
    /// replaced with a mask.
    pub fn public_view(&self) -> Self {
        let mut view = self.clone();
        view.wallet_secret_encrypted = SealedSecret::masked();
        view
    }
}

/// Partial config update from the dashboard. Only present fields are
/// applied. The wallet secret deliberately has no field here: it
/// travels separately so it can be sealed, and a stray
/// `wallet_secret_encrypted` key in a patch is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotConfigPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub market_slug: Option<String>,
    pub token_id: Option<String>,
    pub outcome_index: Option<usize>,
    pub signature_mode: Option<SignatureMode>,
    pub funder_address: Option<String>,
    pub strategy_mode: Option<StrategyMode>,
    pub entry_mode: Option<EntryMode>,
    pub entry_delay_seconds: Option<u64>,
    pub spike_threshold_pct: Option<f64>,
    pub min_spike_strength: Option<f64>,
    pub spike_windows_seconds: Option<Vec<u64>>,
    pub use_volatility_filter: Option<bool>,
    pub max_volatility_cv: Option<f64>,
    pub price_history_size: Option<usize>,
    pub take_profit_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub max_hold_seconds: Option<u64>,
    pub cooldown_seconds: Option<u64>,
    pub settlement_delay_seconds: Option<f64>,
    pub trade_size_usd: Option<f64>,
    pub max_balance_usd: Option<f64>,
    pub max_trades_per_session: Option<u32>,
    pub session_loss_limit_usd: Option<f64>,
    pub rebuy_strategy: Option<RebuyStrategy>,
    pub rebuy_delay_seconds: Option<f64>,
    pub rebuy_drop_pct: Option<f64>,
    pub min_bid_liquidity_usd: Option<f64>,
    pub min_ask_liquidity_usd: Option<f64>,
    pub max_spread_pct: Option<f64>,
    pub dry_run: Option<bool>,
}

macro_rules! apply_field {
    ($patch:ident, $cfg:ident, $($field:ident),+ $(,)?) => {
        $(if let Some(value) = $patch.$field.clone() {
            $cfg.$field = value;
        })+
    };
}

impl BotConfigPatch {
    /// Overlay every present field onto `cfg`. Optional bindings
    /// (market, funder) can be set but not cleared through a patch.
    pub fn apply_to(&self, cfg: &mut BotConfig) {
        let patch = self;
        apply_field!(
            patch,
            cfg,
            name,
            description,
            outcome_index,
            signature_mode,
            strategy_mode,
            entry_mode,
            entry_delay_seconds,
            spike_threshold_pct,
            min_spike_strength,
            spike_windows_seconds,
            use_volatility_filter,
            max_volatility_cv,
            price_history_size,
            take_profit_pct,
            stop_loss_pct,
            max_hold_seconds,
            cooldown_seconds,
            settlement_delay_seconds,
            trade_size_usd,
            max_balance_usd,
            max_trades_per_session,
            session_loss_limit_usd,
            rebuy_strategy,
            rebuy_delay_seconds,
            rebuy_drop_pct,
            min_bid_liquidity_usd,
            min_ask_liquidity_usd,
            max_spread_pct,
            dry_run,
        );
        if self.market_slug.is_some() {
            cfg.market_slug = self.market_slug.clone();
        }
        if self.token_id.is_some() {
            cfg.token_id = self.token_id.clone();
        }
        if self.funder_address.is_some() {
            cfg.funder_address = self.funder_address.clone();
        }
        cfg.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BotConfig {
        let mut cfg = BotConfig::new("test-bot", SealedSecret("enc:abc".into()));
        cfg.token_id = Some("123456".into());
        cfg
    }

    #[test]
    fn test_validate_accepts_defaults_with_market() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_market() {
        let mut cfg = valid_config();
        cfg.token_id = None;
        cfg.market_slug = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_requires_funder_for_proxy() {
        let mut cfg = valid_config();
        cfg.signature_mode = SignatureMode::Proxy;
        assert!(cfg.validate().is_err());
        cfg.funder_address = Some("0x0000000000000000000000000000000000000001".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_sub_minimum_trade_size() {
        let mut cfg = valid_config();
        cfg.trade_size_usd = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_secret_never_in_debug_output() {
        let cfg = valid_config();
        let dump = format!("{cfg:?}");
        assert!(!dump.contains("enc:abc"));
    }

    #[test]
    fn test_public_view_masks_secret() {
        let view = valid_config().public_view();
        assert_eq!(view.wallet_secret_encrypted, SealedSecret::masked());
    }

    #[test]
    fn test_patch_applies_only_present_fields() {
        let mut cfg = valid_config();
        let before_tp = cfg.take_profit_pct;
        let patch: BotConfigPatch = serde_json::from_str(
            r#"{"stop_loss_pct": 1.5, "dry_run": false, "spike_windows_seconds": [300, 900]}"#,
        )
        .unwrap();
        patch.apply_to(&mut cfg);
        assert_eq!(cfg.stop_loss_pct, 1.5);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.spike_windows_seconds, vec![300, 900]);
        assert_eq!(cfg.take_profit_pct, before_tp);
    }

    #[test]
    fn test_patch_cannot_replace_secret() {
        let mut cfg = valid_config();
        let sealed_before = cfg.wallet_secret_encrypted.clone();
        let patch: BotConfigPatch =
            serde_json::from_str(r#"{"wallet_secret_encrypted": "enc:zzz", "name": "n2"}"#)
                .unwrap();
        patch.apply_to(&mut cfg);
        assert_eq!(cfg.wallet_secret_encrypted, sealed_before);
        assert_eq!(cfg.name, "n2");
    }

    #[test]
    fn test_config_roundtrip_json() {
        let cfg = valid_config();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BotConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, cfg.id);
        assert_eq!(back.wallet_secret_encrypted, cfg.wallet_secret_encrypted);
        assert_eq!(back.spike_windows_seconds, cfg.spike_windows_seconds);
    }
}
