//! Dashboard API DTOs.

use serde::{Deserialize, Serialize};

use crate::config::BotConfigPatch;
use crate::types::OrderSide;

/// Uniform response envelope for every endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub wallet_secret: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(flatten)]
    pub config: BotConfigPatch,
}

#[derive(Debug, Deserialize)]
pub struct UpdateBotRequest {
    /// Replace the wallet secret; omitted keeps the stored one.
    #[serde(default)]
    pub wallet_secret: Option<String>,
    #[serde(flatten)]
    pub config: BotConfigPatch,
}

#[derive(Debug, Deserialize)]
pub struct TradeRequest {
    pub side: OrderSide,
    #[serde(default)]
    pub amount_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    #[serde(default = "default_activity_limit")]
    pub limit: usize,
    /// Filter by kind; omitted returns everything.
    #[serde(default)]
    pub kind: Option<crate::types::ActivityKind>,
}

fn default_activity_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct ChartQuery {
    #[serde(default = "default_chart_limit")]
    pub limit: usize,
    /// Bucket width in seconds; 0/1 returns raw samples.
    #[serde(default = "default_chart_resolution")]
    pub resolution: u64,
}

fn default_chart_limit() -> usize {
    300
}

fn default_chart_resolution() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
pub struct OrderbookQuery {
    #[serde(default = "default_orderbook_depth")]
    pub depth: usize,
}

fn default_orderbook_depth() -> usize {
    5
}

/// Messages a dashboard client may send over the push channel.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Focus the connection on one bot (routing hint; global events
    /// still flow).
    SubscribeBot { bot_id: String },
    /// Clear the focus set.
    UnsubscribeAll,
}
