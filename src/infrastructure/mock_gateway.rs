//! Deterministic in-memory `ExchangeGateway`, in the shape of
//! `infrastructure/mock.rs`. Ships the one concrete gateway in-tree since
//! exchange connectivity is an external collaborator but a runnable
//! crate needs something to drive it locally.

use crate::domain::errors::GatewayError;
use crate::domain::ports::{Balances, ExchangeGateway, Fill, OrderAck, OrderSpec};
use crate::domain::types::{Candle, OrderStatus, Position, Timeframe};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct SymbolState {
    last_price: Decimal,
    seed: u64,
}

pub struct MockGateway {
    symbols: Mutex<HashMap<String, SymbolState>>,
    order_seq: AtomicU64,
    clock_ms: AtomicI64,
    fills_tx: mpsc::Sender<Fill>,
    fills_rx: Mutex<Option<mpsc::Receiver<Fill>>>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        let (fills_tx, fills_rx) = mpsc::channel(256);
        Self {
            symbols: Mutex::new(HashMap::new()),
            order_seq: AtomicU64::new(1),
            clock_ms: AtomicI64::new(1_700_000_000_000),
            fills_tx,
            fills_rx: Mutex::new(Some(fills_rx)),
        }
    }

    pub fn with_symbol(self, symbol: &str, starting_price: Decimal) -> Self {
        let fut = self.symbols.lock();
        let mut guard = futures::executor::block_on(fut);
        guard.insert(
            symbol.to_string(),
            SymbolState {
                last_price: starting_price,
                seed: symbol.bytes().map(|b| b as u64).sum(),
            },
        );
        drop(guard);
        self
    }

    fn next_candle(&self, symbol: &str, timeframe: Timeframe, open_time_ms: i64, seed: &mut u64, last: &mut Decimal) -> Candle {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        let jitter = ((*seed >> 33) % 21) as i64 - 10; // -10..=10
        let open = *last;
        let close = (open + Decimal::new(jitter, 2)).max(dec!(0.01));
        let high = open.max(close) + dec!(0.05);
        let low = open.min(close) - dec!(0.05);
        *last = close;
        Candle {
            symbol: symbol.to_string(),
            timeframe,
            open_time_ms,
            open,
            high,
            low,
            close,
            volume: dec!(10),
            is_closed: true,
        }
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    async fn watch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<mpsc::Receiver<Candle>, GatewayError> {
        let (tx, rx) = mpsc::channel(64);
        let symbol = symbol.to_string();
        let mut seed = {
            let guard = self.symbols.lock().await;
            guard.get(&symbol).map(|s| s.seed).unwrap_or(42)
        };
        let mut last = {
            let guard = self.symbols.lock().await;
            guard.get(&symbol).map(|s| s.last_price).unwrap_or(dec!(100))
        };
        let mut open_time = self.clock_ms.load(Ordering::Relaxed);
        let duration = timeframe.duration_ms();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                open_time += duration;
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let jitter = ((seed >> 33) % 21) as i64 - 10;
                let open = last;
                let close = (open + Decimal::new(jitter, 2)).max(dec!(0.01));
                let high = open.max(close) + dec!(0.05);
                let low = open.min(close) - dec!(0.05);
                last = close;
                let candle = Candle {
                    symbol: symbol.clone(),
                    timeframe,
                    open_time_ms: open_time,
                    open,
                    high,
                    low,
                    close,
                    volume: dec!(10),
                    is_closed: true,
                };
                if tx.send(candle).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let mut guard = self.symbols.lock().await;
        let state = guard
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState { last_price: dec!(100), seed: 42 });
        let duration = timeframe.duration_ms();
        let start = self.clock_ms.load(Ordering::Relaxed) - (limit as i64) * duration;
        let mut out = Vec::with_capacity(limit);
        let mut last = state.last_price;
        let mut seed = state.seed;
        for i in 0..limit {
            let open_time_ms = start + (i as i64) * duration;
            out.push(self.next_candle(symbol, timeframe, open_time_ms, &mut seed, &mut last));
        }
        state.last_price = last;
        state.seed = seed;
        Ok(out)
    }

    async fn place_order(&self, spec: OrderSpec) -> Result<OrderAck, GatewayError> {
        let id = self.order_seq.fetch_add(1, Ordering::SeqCst);
        let exchange_order_id = format!("mock-{id}");

        let fallback_price = self
            .symbols
            .lock()
            .await
            .get(&spec.symbol)
            .map(|s| s.last_price)
            .unwrap_or(dec!(100));

        let tx = self.fills_tx.clone();
        let fill = Fill {
            client_order_id: spec.client_order_id.clone(),
            exchange_order_id: exchange_order_id.clone(),
            fill_id: format!("fill-{id}"),
            symbol: spec.symbol.clone(),
            side: spec.side,
            quantity: spec.quantity,
            price: spec.price.unwrap_or(fallback_price),
            ts: self.clock_ms.load(Ordering::Relaxed),
        };
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = tx.send(fill).await;
        });

        Ok(OrderAck {
            exchange_order_id,
            status: OrderStatus::Placed,
        })
    }

    async fn cancel_order(&self, _id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn watch_fills(&self) -> Result<mpsc::Receiver<Fill>, GatewayError> {
        self.fills_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| GatewayError::invalid("watch_fills already consumed"))
    }

    async fn get_position(&self, _symbol: &str) -> Result<Option<Position>, GatewayError> {
        Ok(None)
    }

    async fn get_balances(&self) -> Result<Balances, GatewayError> {
        Ok(Balances {
            equity: dec!(10000),
            available: dec!(10000),
        })
    }

    async fn validate_symbol(&self, symbol: &str) -> Result<(), GatewayError> {
        if symbol.is_empty() {
            return Err(GatewayError::NotFound(symbol.to_string()));
        }
        Ok(())
    }
}
