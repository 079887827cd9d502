use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{Balance, Fill, Side, Symbol, TopOfBook};
use crate::error::Result;

/// Exchange acknowledgement for a write call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub exchange_order_id: Option<String>,
    pub client_order_id: Option<String>,
    /// Raw status string as reported; parsed by the caller
    pub status: String,
    pub ts: DateTime<Utc>,
}

/// An order as reported by the exchange (open-orders / all-orders queries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub executed_qty: Decimal,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Request payload for a limit order submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitOrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub client_order_id: String,
}

/// What the core consumes from the exchange. Implementations live outside
/// the core; errors must be classified via `LirabotError::Transport` /
/// `LirabotError::Exchange` and sanitized of credential material.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn get_exchange_info(&self) -> Result<Vec<(Symbol, serde_json::Value)>>;

    async fn get_orderbook(&self, symbol: &Symbol) -> Result<TopOfBook>;

    async fn get_balances(&self) -> Result<Vec<Balance>>;

    async fn get_open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<ExchangeOrder>>;

    async fn get_all_orders(
        &self,
        symbol: &Symbol,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<ExchangeOrder>>;

    async fn get_order(
        &self,
        exchange_order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<Option<ExchangeOrder>>;

    async fn get_recent_fills(&self, symbol: &Symbol, since_ms: i64) -> Result<Vec<Fill>>;

    async fn submit_limit_order(&self, request: &LimitOrderRequest) -> Result<Ack>;

    async fn cancel_order_by_exchange_id(&self, exchange_order_id: &str) -> Result<Ack>;

    async fn cancel_order_by_client_id(&self, client_order_id: &str) -> Result<Ack>;
}
