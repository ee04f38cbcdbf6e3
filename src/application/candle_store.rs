//! In-memory ring of candles per (symbol, timeframe) (§4.7).

use crate::domain::types::{Candle, StreamKey, Timeframe};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

pub const DEFAULT_N_MAX: usize = 1000;

struct Buffer {
    candles: VecDeque<Candle>,
    capacity: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            candles: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// §4.7 append semantics: strictly newer pushes, equal-time replaces
    /// the live tail, older is ignored as out-of-order.
    fn append(&mut self, candle: Candle) {
        match self.candles.back() {
            None => self.candles.push_back(candle),
            Some(last) if candle.open_time_ms > last.open_time_ms => {
                self.candles.push_back(candle);
                if self.candles.len() > self.capacity {
                    self.candles.pop_front();
                }
            }
            Some(last) if candle.open_time_ms == last.open_time_ms => {
                *self.candles.back_mut().unwrap() = candle;
            }
            _ => {} // strictly older: out-of-order, ignored
        }
    }
}

pub struct CandleStore {
    buffers: RwLock<HashMap<StreamKey, Buffer>>,
    capacity: usize,
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new(DEFAULT_N_MAX)
    }
}

impl CandleStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub async fn append(&self, candle: Candle) {
        let key = candle.stream_key();
        let mut buffers = self.buffers.write().await;
        let buffer = buffers.entry(key).or_insert_with(|| Buffer::new(self.capacity));
        buffer.append(candle);
    }

    /// Returns the ordered sequence (most recent last). Never fails;
    /// unknown keys yield an empty sequence.
    pub async fn get(&self, symbol: &str, timeframe: Timeframe, limit: Option<usize>) -> Vec<Candle> {
        let key = StreamKey::new(symbol, timeframe);
        let buffers = self.buffers.read().await;
        let Some(buffer) = buffers.get(&key) else {
            return Vec::new();
        };
        match limit {
            Some(n) if n < buffer.candles.len() => {
                let skip = buffer.candles.len() - n;
                buffer.candles.iter().skip(skip).cloned().collect()
            }
            _ => buffer.candles.iter().cloned().collect(),
        }
    }

    pub async fn len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        let key = StreamKey::new(symbol, timeframe);
        self.buffers.read().await.get(&key).map(|b| b.candles.len()).unwrap_or(0)
    }

    pub async fn drop_key(&self, symbol: &str, timeframe: Timeframe) {
        let key = StreamKey::new(symbol, timeframe);
        self.buffers.write().await.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open_time_ms: i64, close: rust_decimal::Decimal, is_closed: bool) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_time_ms,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(1),
            is_closed,
        }
    }

    #[tokio::test]
    async fn append_idempotent_for_duplicate_candle() {
        let store = CandleStore::new(10);
        let c = candle(60_000, dec!(100), true);
        store.append(c.clone()).await;
        store.append(c.clone()).await;
        let got = store.get("BTCUSDT", Timeframe::M1, None).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], c);
    }

    #[tokio::test]
    async fn live_candle_overwritten_in_place() {
        let store = CandleStore::new(10);
        store.append(candle(60_000, dec!(100), false)).await;
        store.append(candle(60_000, dec!(105), false)).await;
        let got = store.get("BTCUSDT", Timeframe::M1, None).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].close, dec!(105));
    }

    #[tokio::test]
    async fn out_of_order_candle_is_ignored() {
        let store = CandleStore::new(10);
        store.append(candle(120_000, dec!(100), true)).await;
        store.append(candle(60_000, dec!(50), true)).await;
        let got = store.get("BTCUSDT", Timeframe::M1, None).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].open_time_ms, 120_000);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_at_capacity() {
        let store = CandleStore::new(5);
        for i in 0..6 {
            store.append(candle((i + 1) * 60_000, dec!(100), true)).await;
        }
        let got = store.get("BTCUSDT", Timeframe::M1, None).await;
        assert_eq!(got.len(), 5);
        assert_eq!(got[0].open_time_ms, 2 * 60_000);
        assert_eq!(got[4].open_time_ms, 6 * 60_000);
    }

    #[tokio::test]
    async fn unknown_key_returns_empty() {
        let store = CandleStore::new(10);
        let got = store.get("ETHUSDT", Timeframe::M1, None).await;
        assert!(got.is_empty());
    }
}
