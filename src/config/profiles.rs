//! Built-in trading profiles.
//!
//! Presets that seed a new bot's strategy parameters for different
//! market conditions. The operator can still override any field.

use serde::Serialize;

use super::{BotConfig, RebuyStrategy};

#[derive(Debug, Clone, Serialize)]
pub struct TradingProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub spike_threshold_pct: f64,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub trade_size_usd: f64,
    pub max_hold_seconds: u64,
    pub cooldown_seconds: u64,
    pub min_spike_strength: f64,
    pub use_volatility_filter: bool,
    pub max_volatility_cv: f64,
    pub rebuy_delay_seconds: f64,
    pub rebuy_strategy: RebuyStrategy,
    pub rebuy_drop_pct: f64,
}

impl TradingProfile {
    pub fn get(name: &str) -> Option<&'static TradingProfile> {
        all_profiles().iter().find(|p| p.name == name.to_lowercase())
    }

    /// Overlay this profile's strategy parameters onto a config.
    pub fn apply_to(&self, cfg: &mut BotConfig) {
        cfg.spike_threshold_pct = self.spike_threshold_pct;
        cfg.take_profit_pct = self.take_profit_pct;
        cfg.stop_loss_pct = self.stop_loss_pct;
        cfg.trade_size_usd = self.trade_size_usd;
        cfg.max_hold_seconds = self.max_hold_seconds;
        cfg.cooldown_seconds = self.cooldown_seconds;
        cfg.min_spike_strength = self.min_spike_strength;
        cfg.use_volatility_filter = self.use_volatility_filter;
        cfg.max_volatility_cv = self.max_volatility_cv;
        cfg.rebuy_delay_seconds = self.rebuy_delay_seconds;
        cfg.rebuy_strategy = self.rebuy_strategy;
        cfg.rebuy_drop_pct = self.rebuy_drop_pct;
        cfg.trading_profile = Some(self.name.to_string());
    }
}

/// All built-in profiles, in display order.
pub fn all_profiles() -> &'static [TradingProfile] {
    &[
        TradingProfile {
            name: "normal",
            description: "Balanced settings for general markets",
            spike_threshold_pct: 8.0,
            take_profit_pct: 3.0,
            stop_loss_pct: 2.5,
            trade_size_usd: 2.0,
            max_hold_seconds: 3600,
            cooldown_seconds: 120,
            min_spike_strength: 5.0,
            use_volatility_filter: true,
            max_volatility_cv: 10.0,
            rebuy_delay_seconds: 2.0,
            rebuy_strategy: RebuyStrategy::Immediate,
            rebuy_drop_pct: 0.1,
        },
        TradingProfile {
            name: "live",
            description: "More aggressive for high-volatility live markets",
            spike_threshold_pct: 5.0,
            take_profit_pct: 2.0,
            stop_loss_pct: 1.5,
            trade_size_usd: 1.0,
            max_hold_seconds: 1800,
            cooldown_seconds: 60,
            min_spike_strength: 3.0,
            // Fast-moving markets trip the CV gate constantly.
            use_volatility_filter: false,
            max_volatility_cv: 20.0,
            rebuy_delay_seconds: 1.0,
            rebuy_strategy: RebuyStrategy::Immediate,
            rebuy_drop_pct: 0.0,
        },
        TradingProfile {
            name: "edge",
            description: "Conservative settings for edge trading",
            spike_threshold_pct: 12.0,
            take_profit_pct: 5.0,
            stop_loss_pct: 3.0,
            trade_size_usd: 5.0,
            max_hold_seconds: 7200,
            cooldown_seconds: 300,
            min_spike_strength: 8.0,
            use_volatility_filter: true,
            max_volatility_cv: 5.0,
            rebuy_delay_seconds: 5.0,
            rebuy_strategy: RebuyStrategy::WaitForDrop,
            rebuy_drop_pct: 0.5,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SealedSecret;

    #[test]
    fn test_profile_lookup_is_case_insensitive() {
        assert!(TradingProfile::get("EDGE").is_some());
        assert!(TradingProfile::get("nope").is_none());
    }

    #[test]
    fn test_apply_overlays_strategy_params() {
        let mut cfg = BotConfig::new("p", SealedSecret("enc:x".into()));
        TradingProfile::get("edge").unwrap().apply_to(&mut cfg);
        assert_eq!(cfg.spike_threshold_pct, 12.0);
        assert_eq!(cfg.rebuy_strategy, RebuyStrategy::WaitForDrop);
        assert_eq!(cfg.trading_profile.as_deref(), Some("edge"));
    }
}
