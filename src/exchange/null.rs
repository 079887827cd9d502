//! Offline transport for dry-run operation.
//!
//! Serves empty market data and refuses writes. The real exchange adapter
//! implements `ExchangeTransport` outside the core and is injected in its
//! place.

use async_trait::async_trait;

use crate::domain::{Balance, Fill, Symbol, TopOfBook};
use crate::error::{LirabotError, Result};

use super::traits::{Ack, ExchangeOrder, ExchangeTransport, LimitOrderRequest};

pub struct NullTransport;

fn offline(operation: &str) -> LirabotError {
    LirabotError::Exchange(format!("{} unavailable: offline transport", operation))
}

#[async_trait]
impl ExchangeTransport for NullTransport {
    async fn get_exchange_info(&self) -> Result<Vec<(Symbol, serde_json::Value)>> {
        Ok(Vec::new())
    }

    async fn get_orderbook(&self, symbol: &Symbol) -> Result<TopOfBook> {
        Err(LirabotError::Exchange(format!(
            "no orderbook for {}: offline transport",
            symbol
        )))
    }

    async fn get_balances(&self) -> Result<Vec<Balance>> {
        Ok(Vec::new())
    }

    async fn get_open_orders(&self, _symbol: Option<&Symbol>) -> Result<Vec<ExchangeOrder>> {
        Ok(Vec::new())
    }

    async fn get_all_orders(
        &self,
        _symbol: &Symbol,
        _start_ms: i64,
        _end_ms: i64,
    ) -> Result<Vec<ExchangeOrder>> {
        Ok(Vec::new())
    }

    async fn get_order(
        &self,
        _exchange_order_id: Option<&str>,
        _client_order_id: Option<&str>,
    ) -> Result<Option<ExchangeOrder>> {
        Ok(None)
    }

    async fn get_recent_fills(&self, _symbol: &Symbol, _since_ms: i64) -> Result<Vec<Fill>> {
        Ok(Vec::new())
    }

    async fn submit_limit_order(&self, _request: &LimitOrderRequest) -> Result<Ack> {
        Err(offline("submit_limit_order"))
    }

    async fn cancel_order_by_exchange_id(&self, _exchange_order_id: &str) -> Result<Ack> {
        Err(offline("cancel_order_by_exchange_id"))
    }

    async fn cancel_order_by_client_id(&self, _client_order_id: &str) -> Result<Ack> {
        Err(offline("cancel_order_by_client_id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_are_empty_and_writes_refuse() {
        let transport = NullTransport;
        assert!(transport.get_balances().await.unwrap().is_empty());
        assert!(transport
            .get_open_orders(None)
            .await
            .unwrap()
            .is_empty());

        let request = LimitOrderRequest {
            symbol: Symbol::try_base("BTC"),
            side: crate::domain::Side::Buy,
            price: rust_decimal::Decimal::ONE,
            qty: rust_decimal::Decimal::ONE,
            client_order_id: "coid".to_string(),
        };
        assert!(transport.submit_limit_order(&request).await.is_err());
    }
}
