//! spikebot library
//!
//! Multi-bot trading agent for binary-outcome prediction markets.
//! Each bot watches one outcome token, detects short-horizon price
//! spikes, and trades a configured USD notional against them under
//! strict risk limits, fanning its state out to a dashboard over
//! HTTP + websocket.

pub mod broadcast;
pub mod clob;
pub mod config;
pub mod dashboard;
pub mod executor;
pub mod persistence;
pub mod price;
pub mod registry;
pub mod risk;
pub mod session;
pub mod spike;
pub mod strategy;
pub mod types;

/// Short unique id with a kind prefix, e.g. `bot_1f2a9c3d`.
pub fn short_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..8])
}

/// Shorten long identifiers (token ids, order ids) for log lines.
pub fn truncate_id(id: &str) -> String {
    if id.len() <= 12 {
        id.to_string()
    } else {
        format!("{}…", &id[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id_shape() {
        let id = short_id("bot");
        assert!(id.starts_with("bot_"));
        assert_eq!(id.len(), 12);
        assert_ne!(short_id("bot"), short_id("bot"));
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("abc"), "abc");
        assert_eq!(truncate_id("0123456789abcdef"), "0123456789ab…");
    }
}
