use crate::domain::errors::GatewayError;
use crate::domain::types::{Candle, Order, Position, SymbolId, Timeframe};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc::Receiver;

#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: SymbolId,
    pub side: crate::domain::types::OrderSide,
    pub order_type: crate::domain::types::OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    pub client_order_id: String,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub status: crate::domain::types::OrderStatus,
}

#[derive(Debug, Clone)]
pub struct Balances {
    pub equity: Decimal,
    pub available: Decimal,
}

/// A fill pushed asynchronously by the exchange adapter, independent of
/// the `place_order` response (which only acknowledges submission).
#[derive(Debug, Clone)]
pub struct Fill {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub fill_id: String,
    pub symbol: SymbolId,
    pub side: crate::domain::types::OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub ts: i64,
}

/// Abstract capabilities consumed by the core (§4.5). Concrete CCXT-style
/// HTTP/WebSocket clients are external collaborators; the core only
/// depends on this trait.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Infinite, non-restartable stream of the latest candle for a key.
    /// The caller reconnects by calling this again on stream termination.
    async fn watch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Receiver<Candle>, GatewayError>;

    /// Finite ordered history used for warm-up.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn place_order(&self, spec: OrderSpec) -> Result<OrderAck, GatewayError>;

    async fn cancel_order(&self, id: &str) -> Result<(), GatewayError>;

    /// Single-consumer stream of fills, pushed independently of order
    /// placement. Called once by OrderExecutor at startup.
    async fn watch_fills(&self) -> Result<Receiver<Fill>, GatewayError>;

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, GatewayError>;

    async fn get_balances(&self) -> Result<Balances, GatewayError>;

    /// Validates that a symbol is tradeable on the exchange (used by
    /// `SubscriptionController::add_symbol`).
    async fn validate_symbol(&self, symbol: &str) -> Result<(), GatewayError>;

    fn order_spec_for(&self, order: &Order) -> OrderSpec {
        OrderSpec {
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price,
            stop_price: None,
            reduce_only: false,
            client_order_id: order.client_order_id.clone(),
        }
    }
}
