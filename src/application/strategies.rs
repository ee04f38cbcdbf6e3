//! Pluggable signal generators and the layer that drives them (§4.9).
//!
//! Strategies are stateless across events: all state they read lives in
//! the `IndicatorSnapshot` handed to them and the recent candles fetched
//! from `CandleStore`. `StrategyLayer` owns the live enable/disable wiring
//! and the failure isolation, in the same shape as the `TradingStrategy`
//! dispatch in `application/strategies/strategy_selector.rs` and
//! `application/strategies/traits.rs`.

use crate::domain::events::{Event, EventPayload};
use crate::domain::indicator::{IndicatorSnapshot, Trend, ZoneState};
use crate::domain::types::{Candle, Direction, Signal, Timeframe};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::event_bus::{EventBus, EventHandler};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A stateless signal generator. Implementations must not retain mutable
/// state across calls; everything needed is in `snapshot`/`recent_candles`.
pub trait Strategy: Send + Sync {
    fn id(&self) -> &str;
    fn timeframes(&self) -> &[Timeframe];
    fn evaluate(&self, snapshot: &IndicatorSnapshot, recent_candles: &[Candle]) -> Option<Signal>;
}

/// Enters on a retracement into an unmitigated FVG in the direction of
/// the prevailing trend.
pub struct FvgRetracementStrategy {
    timeframes: Vec<Timeframe>,
    reward_risk: Decimal,
}

impl FvgRetracementStrategy {
    pub fn new(timeframes: Vec<Timeframe>) -> Self {
        Self { timeframes, reward_risk: dec!(2) }
    }
}

impl Strategy for FvgRetracementStrategy {
    fn id(&self) -> &str {
        "fvg_retracement"
    }

    fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    fn evaluate(&self, snapshot: &IndicatorSnapshot, recent_candles: &[Candle]) -> Option<Signal> {
        let last = recent_candles.last()?;
        match snapshot.trend {
            Some(Trend::Bullish) => {
                let fvg = snapshot
                    .fvgs
                    .iter()
                    .filter(|f| f.bullish && f.state == ZoneState::Mitigated)
                    .max_by_key(|f| f.detected_at_open_time)?;
                if last.close < fvg.gap_low || last.close > fvg.gap_high {
                    return None;
                }
                let entry = last.close;
                let stop_loss = fvg.gap_low;
                let risk = entry - stop_loss;
                if risk <= Decimal::ZERO {
                    return None;
                }
                Some(self.build_signal(last, Direction::Long, entry, stop_loss, entry + risk * self.reward_risk))
            }
            Some(Trend::Bearish) => {
                let fvg = snapshot
                    .fvgs
                    .iter()
                    .filter(|f| !f.bullish && f.state == ZoneState::Mitigated)
                    .max_by_key(|f| f.detected_at_open_time)?;
                if last.close < fvg.gap_low || last.close > fvg.gap_high {
                    return None;
                }
                let entry = last.close;
                let stop_loss = fvg.gap_high;
                let risk = stop_loss - entry;
                if risk <= Decimal::ZERO {
                    return None;
                }
                Some(self.build_signal(last, Direction::Short, entry, stop_loss, entry - risk * self.reward_risk))
            }
            _ => None,
        }
    }
}

impl FvgRetracementStrategy {
    fn build_signal(
        &self,
        last: &Candle,
        direction: Direction,
        entry: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Signal {
        Signal {
            id: Uuid::new_v4().to_string(),
            symbol: last.symbol.clone(),
            timeframe: last.timeframe,
            direction,
            entry_price: entry,
            stop_loss,
            take_profit,
            confidence: 0.6,
            strategy_id: self.id().to_string(),
            source_snapshot_time: last.open_time_ms,
        }
    }
}

/// Enters on a retest of an active order block aligned with the trend.
pub struct OrderBlockRetestStrategy {
    timeframes: Vec<Timeframe>,
    reward_risk: Decimal,
}

impl OrderBlockRetestStrategy {
    pub fn new(timeframes: Vec<Timeframe>) -> Self {
        Self { timeframes, reward_risk: dec!(1.5) }
    }
}

impl Strategy for OrderBlockRetestStrategy {
    fn id(&self) -> &str {
        "order_block_retest"
    }

    fn timeframes(&self) -> &[Timeframe] {
        &self.timeframes
    }

    fn evaluate(&self, snapshot: &IndicatorSnapshot, recent_candles: &[Candle]) -> Option<Signal> {
        let last = recent_candles.last()?;
        match snapshot.trend {
            Some(Trend::Bullish) => {
                let ob = snapshot
                    .order_blocks
                    .iter()
                    .filter(|o| o.bullish && o.state == ZoneState::Mitigated)
                    .max_by_key(|o| o.detected_at_open_time)?;
                if last.close < ob.body_low || last.close > ob.body_high {
                    return None;
                }
                let entry = last.close;
                let stop_loss = ob.body_low;
                let risk = entry - stop_loss;
                if risk <= Decimal::ZERO {
                    return None;
                }
                Some(Signal {
                    id: Uuid::new_v4().to_string(),
                    symbol: last.symbol.clone(),
                    timeframe: last.timeframe,
                    direction: Direction::Long,
                    entry_price: entry,
                    stop_loss,
                    take_profit: entry + risk * self.reward_risk,
                    confidence: 0.55,
                    strategy_id: self.id().to_string(),
                    source_snapshot_time: last.open_time_ms,
                })
            }
            Some(Trend::Bearish) => {
                let ob = snapshot
                    .order_blocks
                    .iter()
                    .filter(|o| !o.bullish && o.state == ZoneState::Mitigated)
                    .max_by_key(|o| o.detected_at_open_time)?;
                if last.close < ob.body_low || last.close > ob.body_high {
                    return None;
                }
                let entry = last.close;
                let stop_loss = ob.body_high;
                let risk = stop_loss - entry;
                if risk <= Decimal::ZERO {
                    return None;
                }
                Some(Signal {
                    id: Uuid::new_v4().to_string(),
                    symbol: last.symbol.clone(),
                    timeframe: last.timeframe,
                    direction: Direction::Short,
                    entry_price: entry,
                    stop_loss,
                    take_profit: entry - risk * self.reward_risk,
                    confidence: 0.55,
                    strategy_id: self.id().to_string(),
                    source_snapshot_time: last.open_time_ms,
                })
            }
            _ => None,
        }
    }
}

/// Maps registration order to the three built-in config toggles. A
/// strategy beyond the third has no toggle and always runs.
fn is_enabled(index: usize, enable_1: bool, enable_2: bool, enable_3: bool) -> bool {
    match index {
        0 => enable_1,
        1 => enable_2,
        2 => enable_3,
        _ => true,
    }
}

pub struct StrategyLayer {
    bus: EventBus,
    config: Arc<ConfigStore>,
    candle_store: Arc<crate::application::candle_store::CandleStore>,
    strategies: Vec<Arc<dyn Strategy>>,
    failure_counts: HashMap<String, AtomicU64>,
}

impl StrategyLayer {
    pub fn new(
        bus: EventBus,
        config: Arc<ConfigStore>,
        candle_store: Arc<crate::application::candle_store::CandleStore>,
        strategies: Vec<Arc<dyn Strategy>>,
    ) -> Self {
        let failure_counts = strategies.iter().map(|s| (s.id().to_string(), AtomicU64::new(0))).collect();
        Self {
            bus,
            config,
            candle_store,
            strategies,
            failure_counts,
        }
    }

    async fn handle_indicator_update(
        &self,
        symbol: String,
        timeframe: Timeframe,
        snapshot: IndicatorSnapshot,
        provisional: bool,
    ) -> anyhow::Result<()> {
        if provisional {
            return Ok(());
        }
        let settings = self.config.snapshot().await;
        let recent = self.candle_store.get(&symbol, timeframe, Some(200)).await;

        for (idx, strategy) in self.strategies.iter().enumerate() {
            if !is_enabled(idx, settings.strategy.enable_1, settings.strategy.enable_2, settings.strategy.enable_3) {
                continue;
            }
            if !strategy.timeframes().contains(&timeframe) {
                continue;
            }

            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                strategy.evaluate(&snapshot, &recent)
            }));

            match outcome {
                Ok(Some(signal)) => {
                    debug!(strategy = strategy.id(), %symbol, "signal generated");
                    self.bus
                        .publish(Event::new(EventPayload::SignalGenerated { signal }, "strategy_layer"))
                        .await;
                }
                Ok(None) => {}
                Err(_) => {
                    if let Some(counter) = self.failure_counts.get(strategy.id()) {
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                    warn!(strategy = strategy.id(), "strategy evaluation panicked, isolated");
                }
            }
        }
        Ok(())
    }

    pub fn failure_count(&self, strategy_id: &str) -> u64 {
        self.failure_counts.get(strategy_id).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }
}

#[async_trait]
impl EventHandler for StrategyLayer {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if let EventPayload::IndicatorUpdated {
            symbol,
            timeframe,
            snapshot,
            provisional,
            ..
        } = event.payload
        {
            self.handle_indicator_update(symbol, timeframe, snapshot, provisional).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::candle_store::CandleStore;
    use crate::domain::indicator::FairValueGap;
    use crate::infrastructure::event_bus::SubscribeOptions;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    fn candle(open_time_ms: i64, close: Decimal) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_time_ms,
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: dec!(1),
            is_closed: true,
        }
    }

    struct Capture(Arc<Mutex<Vec<Signal>>>);

    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            if let EventPayload::SignalGenerated { signal } = event.payload {
                self.0.lock().unwrap().push(signal);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn emits_signal_for_bullish_fvg_retest() {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let candle_store = Arc::new(CandleStore::default());
        candle_store.append(candle(60_000, dec!(100))).await;

        let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(FvgRetracementStrategy::new(vec![Timeframe::M1]))];
        let layer = Arc::new(StrategyLayer::new(bus.clone(), config, candle_store, strategies));

        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("SignalGenerated", Arc::new(Capture(seen.clone())), SubscribeOptions::default())
            .await;
        bus.subscribe("IndicatorUpdated", layer, SubscribeOptions::default()).await;

        let snapshot = IndicatorSnapshot {
            fvgs: vec![FairValueGap {
                id: 1,
                bullish: true,
                gap_low: dec!(98),
                gap_high: dec!(102),
                state: ZoneState::Mitigated,
                detected_at_open_time: 60_000,
            }],
            trend: Some(Trend::Bullish),
            ..Default::default()
        };
        bus.publish(Event::new(
            EventPayload::IndicatorUpdated {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1,
                snapshot,
                source_candle_time: 60_000,
                provisional: false,
            },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let signals = seen.lock().unwrap().clone();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, Direction::Long);
    }

    #[tokio::test]
    async fn provisional_snapshots_are_skipped() {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let candle_store = Arc::new(CandleStore::default());
        candle_store.append(candle(60_000, dec!(100))).await;
        let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(FvgRetracementStrategy::new(vec![Timeframe::M1]))];
        let layer = Arc::new(StrategyLayer::new(bus.clone(), config, candle_store, strategies));
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("SignalGenerated", Arc::new(Capture(seen.clone())), SubscribeOptions::default())
            .await;
        bus.subscribe("IndicatorUpdated", layer, SubscribeOptions::default()).await;

        let snapshot = IndicatorSnapshot {
            fvgs: vec![FairValueGap {
                id: 1,
                bullish: true,
                gap_low: dec!(98),
                gap_high: dec!(102),
                state: ZoneState::Mitigated,
                detected_at_open_time: 60_000,
            }],
            trend: Some(Trend::Bullish),
            ..Default::default()
        };
        bus.publish(Event::new(
            EventPayload::IndicatorUpdated {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1,
                snapshot,
                source_candle_time: 60_000,
                provisional: true,
            },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_strategy_is_skipped_live() {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        config
            .update(
                crate::infrastructure::config_store::Patch::Strategy(
                    crate::infrastructure::config_store::StrategyPatch {
                        enable_1: Some(false),
                        ..Default::default()
                    },
                ),
                true,
            )
            .await
            .unwrap();
        let candle_store = Arc::new(CandleStore::default());
        candle_store.append(candle(60_000, dec!(100))).await;
        let strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(FvgRetracementStrategy::new(vec![Timeframe::M1]))];
        let layer = Arc::new(StrategyLayer::new(bus.clone(), config, candle_store, strategies));
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("SignalGenerated", Arc::new(Capture(seen.clone())), SubscribeOptions::default())
            .await;
        bus.subscribe("IndicatorUpdated", layer, SubscribeOptions::default()).await;

        let snapshot = IndicatorSnapshot {
            fvgs: vec![FairValueGap {
                id: 1,
                bullish: true,
                gap_low: dec!(98),
                gap_high: dec!(102),
                state: ZoneState::Mitigated,
                detected_at_open_time: 60_000,
            }],
            trend: Some(Trend::Bullish),
            ..Default::default()
        };
        bus.publish(Event::new(
            EventPayload::IndicatorUpdated {
                symbol: "BTCUSDT".into(),
                timeframe: Timeframe::M1,
                snapshot,
                source_candle_time: 60_000,
                provisional: false,
            },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
