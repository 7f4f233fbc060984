//! Order execution and trade recording.

use crate::exchange::{ExchangeApi, ExchangeError, OrderIntent, OrderResponse, TradeKind};
use crate::ledger::TradeEvent;
use crate::persistence::TradeStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

/// Failure of a single order submission. The caller decides whether to retry.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// The order filled but its trade could not be recorded.
    #[error("failed to record trade {uuid}: {source}")]
    Persistence {
        uuid: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A filled order as recorded in the trade history.
#[derive(Debug, Clone)]
pub struct OrderConfirmation {
    pub uuid: String,
    pub market: String,
    pub kind: TradeKind,
    pub executed_volume: Decimal,
    pub created_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Result of a submission that did not fail.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Executed(OrderConfirmation),
    /// Business-rule rejection (e.g. below the minimum order total).
    Rejected {
        market: String,
        name: String,
        message: String,
        payload: serde_json::Value,
    },
}

/// Places orders and appends every fill to the trade store.
pub struct OrderExecutor {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn TradeStore>,
    non_fatal_rejections: Vec<String>,
}

impl OrderExecutor {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn TradeStore>,
        non_fatal_rejections: Vec<String>,
    ) -> Self {
        Self {
            exchange,
            store,
            non_fatal_rejections,
        }
    }

    /// Submit one order. No retries.
    pub async fn submit(&self, intent: &OrderIntent) -> Result<SubmitOutcome, ExecutionError> {
        let request = intent.to_request();

        let placed = match self.exchange.place_order(&request).await {
            Ok(placed) => placed,
            Err(ExchangeError::Rejected {
                name,
                message,
                payload,
            }) if self.is_non_fatal(&name) => {
                warn!(
                    market = %intent.market,
                    kind = %intent.kind,
                    %name,
                    %message,
                    "Order rejected by exchange rule"
                );
                return Ok(SubmitOutcome::Rejected {
                    market: intent.market.clone(),
                    name,
                    message,
                    payload,
                });
            }
            Err(e) => {
                error!(market = %intent.market, kind = %intent.kind, error = %e, "Order failed");
                return Err(e.into());
            }
        };

        let (detail, raw) = self.order_detail(&placed).await;
        let event = TradeEvent {
            id: placed.uuid.clone(),
            kind: intent.kind,
            market: detail.market.clone(),
            executed_volume: detail.executed_volume(),
            created_at: detail.created_at,
            raw_payload: raw,
        };

        self.store
            .append(&event)
            .map_err(|source| ExecutionError::Persistence {
                uuid: event.id.clone(),
                source,
            })?;

        info!(
            uuid = %event.id,
            market = %event.market,
            kind = %event.kind,
            executed_volume = %event.executed_volume,
            "Order executed"
        );

        Ok(SubmitOutcome::Executed(OrderConfirmation {
            uuid: event.id,
            market: event.market,
            kind: event.kind,
            executed_volume: event.executed_volume,
            created_at: event.created_at,
            raw: event.raw_payload,
        }))
    }

    /// Order detail by uuid, falling back to the placement response.
    async fn order_detail(&self, placed: &OrderResponse) -> (OrderResponse, serde_json::Value) {
        let raw = match self.exchange.get_order(&placed.uuid).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(uuid = %placed.uuid, error = %e, "Order lookup failed, recording placement response");
                return (placed.clone(), placement_payload(placed));
            }
        };

        match serde_json::from_value::<OrderResponse>(raw.clone()) {
            Ok(detail) => (detail, raw),
            Err(e) => {
                warn!(uuid = %placed.uuid, error = %e, "Unreadable order detail, using placement response");
                (placed.clone(), raw)
            }
        }
    }

    fn is_non_fatal(&self, name: &str) -> bool {
        self.non_fatal_rejections.iter().any(|n| n == name)
    }
}

fn placement_payload(placed: &OrderResponse) -> serde_json::Value {
    serde_json::json!({
        "uuid": placed.uuid,
        "side": placed.side.as_str(),
        "ord_type": placed.ord_type.as_str(),
        "market": placed.market,
        "state": placed.state,
        "created_at": placed.created_at.to_rfc3339(),
        "price": placed.price.map(|p| p.to_string()),
        "volume": placed.volume.map(|v| v.to_string()),
        "remaining_volume": placed.remaining_volume.map(|v| v.to_string()),
        "executed_volume": placed.executed_volume.map(|v| v.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, MockExchangeApi, OrdType, OrderSide};
    use crate::persistence::SqliteTradeStore;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn non_fatal() -> Vec<String> {
        vec![
            "under_min_total_ask".to_string(),
            "under_min_total_bid".to_string(),
        ]
    }

    fn placed(uuid: &str) -> OrderResponse {
        OrderResponse {
            uuid: uuid.to_string(),
            side: OrderSide::Ask,
            ord_type: OrdType::Market,
            market: "KRW-ETH".to_string(),
            state: Some("wait".to_string()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 9, 0, 0, 1).unwrap(),
            price: None,
            volume: Some(dec!(0.5)),
            remaining_volume: Some(dec!(0.5)),
            executed_volume: Some(Decimal::ZERO),
        }
    }

    fn executed(outcome: SubmitOutcome) -> OrderConfirmation {
        match outcome {
            SubmitOutcome::Executed(confirmation) => confirmation,
            other => panic!("expected a fill, got {:?}", other),
        }
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    impl TradeStore for BrokenStore {
        fn append(&self, _event: &TradeEvent) -> anyhow::Result<()> {
            Err(anyhow!("disk I/O error"))
        }

        fn load_all(&self) -> anyhow::Result<Vec<TradeEvent>> {
            Ok(Vec::new())
        }
    }

    fn rejection(name: &str) -> ExchangeError {
        ExchangeError::Rejected {
            name: name.to_string(),
            message: "rejected".to_string(),
            payload: json!({"error": {"name": name, "message": "rejected"}}),
        }
    }

    #[tokio::test]
    async fn test_fill_is_recorded_from_order_detail() {
        let mut exchange = MockExchangeApi::new();
        exchange
            .expect_place_order()
            .times(1)
            .returning(|_| Ok(placed("abc")));
        exchange.expect_get_order().times(1).returning(|uuid| {
            Ok(json!({
                "uuid": uuid,
                "side": "ask",
                "ord_type": "market",
                "market": "KRW-ETH",
                "state": "done",
                "created_at": "2024-05-09T09:00:03+09:00",
                "executed_volume": "0.5",
                "trades": [{"price": "4000000", "volume": "0.5"}]
            }))
        });

        let store = Arc::new(SqliteTradeStore::in_memory().unwrap());
        let executor = OrderExecutor::new(Arc::new(exchange), store.clone(), non_fatal());

        let outcome = executor
            .submit(&OrderIntent::market_sell("KRW-ETH", dec!(0.5)))
            .await
            .unwrap();

        let confirmation = executed(outcome);
        assert_eq!(confirmation.executed_volume, dec!(0.5));
        assert_eq!(
            confirmation.created_at,
            Utc.with_ymd_and_hms(2024, 5, 9, 0, 0, 3).unwrap()
        );

        let events = store.load_all().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TradeKind::Sell);
        assert_eq!(events[0].raw_payload["trades"][0]["volume"], "0.5");
    }

    #[tokio::test]
    async fn test_failed_lookup_falls_back_to_placement() {
        let mut exchange = MockExchangeApi::new();
        exchange
            .expect_place_order()
            .returning(|_| Ok(placed("abc")));
        exchange
            .expect_get_order()
            .returning(|_| Err(ExchangeError::Other("timeout".to_string())));

        let store = Arc::new(SqliteTradeStore::in_memory().unwrap());
        let executor = OrderExecutor::new(Arc::new(exchange), store.clone(), non_fatal());

        let outcome = executor
            .submit(&OrderIntent::market_sell("KRW-ETH", dec!(0.5)))
            .await
            .unwrap();

        assert_eq!(executed(outcome).uuid, "abc");
        let events = store.load_all().unwrap();
        assert_eq!(events[0].id, "abc");
        assert_eq!(events[0].raw_payload["state"], "wait");
    }

    #[tokio::test]
    async fn test_unrecorded_fill_is_an_error() {
        let mut exchange = MockExchangeApi::new();
        exchange
            .expect_place_order()
            .times(1)
            .returning(|_| Ok(placed("abc")));
        exchange
            .expect_get_order()
            .returning(|_| Err(ExchangeError::Other("timeout".to_string())));

        let executor = OrderExecutor::new(Arc::new(exchange), Arc::new(BrokenStore), non_fatal());

        let result = executor
            .submit(&OrderIntent::market_sell("KRW-ETH", dec!(0.5)))
            .await;

        match result {
            Err(ExecutionError::Persistence { uuid, source }) => {
                assert_eq!(uuid, "abc");
                assert!(source.to_string().contains("disk I/O error"));
            }
            other => panic!("expected a persistence error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_minimum_total_rejection_is_data() {
        let mut exchange = MockExchangeApi::new();
        exchange
            .expect_place_order()
            .returning(|_| Err(rejection("under_min_total_bid")));
        exchange.expect_get_order().never();

        let store = Arc::new(SqliteTradeStore::in_memory().unwrap());
        let executor = OrderExecutor::new(Arc::new(exchange), store.clone(), non_fatal());

        let outcome = executor
            .submit(&OrderIntent::market_buy("KRW-ETH", dec!(1000)))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected { ref name, .. } if name == "under_min_total_bid"
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_other_rejection_is_an_error() {
        let mut exchange = MockExchangeApi::new();
        exchange
            .expect_place_order()
            .times(1)
            .returning(|_| Err(rejection("insufficient_funds_ask")));

        let store = Arc::new(SqliteTradeStore::in_memory().unwrap());
        let executor = OrderExecutor::new(Arc::new(exchange), store, non_fatal());

        let err = executor
            .submit(&OrderIntent::market_sell("KRW-ETH", dec!(3)))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Exchange(ExchangeError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_paper_buy_is_recorded() {
        let exchange = Arc::new(MockExchange::new(dec!(1_000_000)));
        exchange.set_price("KRW-XRP", dec!(700)).await;
        let store = Arc::new(SqliteTradeStore::in_memory().unwrap());
        let executor = OrderExecutor::new(exchange.clone(), store.clone(), non_fatal());

        let outcome = executor
            .submit(&OrderIntent::market_buy("KRW-XRP", dec!(70_000)))
            .await
            .unwrap();

        let confirmation = executed(outcome);
        assert_eq!(confirmation.kind, TradeKind::Buy);
        assert_eq!(exchange.balance("XRP").await, confirmation.executed_volume);
        assert_eq!(store.load_all().unwrap()[0].market, "KRW-XRP");
    }
}
