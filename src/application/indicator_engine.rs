//! Per-(symbol,timeframe) indicator state with swing/pattern detection
//! (§4.8). IndicatorEngine owns its `IndicatorSnapshot`s independently of
//! `CandleStore` (§3 Ownership) — it keeps its own bounded bar history
//! fed directly from `CandleReceived`, rather than reading back through
//! `CandleStore`, since cross-subscriber delivery order is not
//! guaranteed (§4.1).

use crate::domain::events::{Event, EventPayload};
use crate::domain::indicator::{
    BreakerBlock, FairValueGap, IndicatorSnapshot, LiquidityZone, OrderBlock, SwingKind,
    SwingPoint, Trend, ZoneState,
};
use crate::domain::types::{Candle, StreamKey, Timeframe};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::event_bus::{EventBus, EventHandler};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub const DEFAULT_SWING_WINDOW: usize = 5;

struct Context {
    recent: VecDeque<Candle>,
    confirmed_swings: Vec<SwingPoint>,
    fvgs: Vec<FairValueGap>,
    order_blocks: Vec<OrderBlock>,
    breaker_blocks: Vec<BreakerBlock>,
    liquidity_zones: Vec<LiquidityZone>,
    bars_seen: u64,
    last_confirmed_idx: Option<u64>,
}

impl Context {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
            confirmed_swings: Vec::new(),
            fvgs: Vec::new(),
            order_blocks: Vec::new(),
            breaker_blocks: Vec::new(),
            liquidity_zones: Vec::new(),
            bars_seen: 0,
            last_confirmed_idx: None,
        }
    }
}

pub struct IndicatorEngine {
    bus: EventBus,
    config: Arc<ConfigStore>,
    supported_timeframes: HashSet<Timeframe>,
    window: usize,
    contexts: RwLock<HashMap<StreamKey, Context>>,
    warned: RwLock<HashSet<StreamKey>>,
    next_zone_id: AtomicU64,
    history_cap: usize,
}

impl IndicatorEngine {
    pub fn new(bus: EventBus, config: Arc<ConfigStore>, supported_timeframes: Vec<Timeframe>) -> Self {
        Self {
            bus,
            config,
            supported_timeframes: supported_timeframes.into_iter().collect(),
            window: DEFAULT_SWING_WINDOW,
            contexts: RwLock::new(HashMap::new()),
            warned: RwLock::new(HashSet::new()),
            next_zone_id: AtomicU64::new(1),
            history_cap: 500,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    async fn handle_candle(&self, candle: Candle) -> anyhow::Result<()> {
        let key = candle.stream_key();
        if !self.supported_timeframes.contains(&candle.timeframe) {
            let mut warned = self.warned.write().await;
            if warned.insert(key.clone()) {
                warn!(%key, "CandleReceived for unconfigured timeframe, dropping");
            }
            return Ok(());
        }

        let ict = self.config.snapshot().await.ict;
        let lookback = ict.ob_lookback_periods;
        let fvg_min_size_percent = Decimal::from_f64_retain(ict.fvg_min_size_percent).unwrap_or_default() / dec!(100);
        let liquidity_sweep_threshold = Decimal::from_f64_retain(ict.liquidity_sweep_threshold).unwrap_or_default();
        let window = self.window;
        let is_closed = candle.is_closed;
        let candle_time = candle.open_time_ms;

        let snapshot = {
            let mut contexts = self.contexts.write().await;
            let ctx = contexts.entry(key.clone()).or_insert_with(Context::new);
            self.ingest(ctx, candle, window, lookback, fvg_min_size_percent, liquidity_sweep_threshold)
        };

        self.bus
            .publish(Event::new(
                EventPayload::IndicatorUpdated {
                    symbol: key.symbol.clone(),
                    timeframe: key.timeframe,
                    snapshot,
                    source_candle_time: candle_time,
                    provisional: !is_closed,
                },
                "indicator_engine",
            ))
            .await;
        Ok(())
    }

    fn ingest(
        &self,
        ctx: &mut Context,
        candle: Candle,
        window: usize,
        lookback: usize,
        fvg_min_size_percent: Decimal,
        liquidity_sweep_threshold: Decimal,
    ) -> IndicatorSnapshot {
        // Live (not-yet-closed) candles update the tail in place, mirroring
        // CandleStore's live-overwrite rule, so re-detection always runs
        // against a consistent bar sequence.
        match ctx.recent.back() {
            Some(last) if last.open_time_ms == candle.open_time_ms => {
                *ctx.recent.back_mut().unwrap() = candle;
            }
            _ => {
                ctx.recent.push_back(candle);
                ctx.bars_seen += 1;
                let cap = self.history_cap.max(lookback * 2 + window * 4 + 8);
                while ctx.recent.len() > cap {
                    ctx.recent.pop_front();
                }
            }
        }

        self.detect_swings(ctx, window);
        self.evict_stale_swings(ctx, lookback);
        self.detect_fvg(ctx, fvg_min_size_percent);
        self.detect_order_blocks(ctx, lookback);
        self.detect_liquidity_zones(ctx, liquidity_sweep_threshold);
        self.update_breaker_blocks(ctx);
        let trend = self.classify_trend(ctx);

        IndicatorSnapshot {
            order_blocks: ctx.order_blocks.clone(),
            fvgs: ctx.fvgs.clone(),
            breaker_blocks: ctx.breaker_blocks.clone(),
            liquidity_zones: ctx.liquidity_zones.clone(),
            trend: Some(trend),
        }
    }

    /// A bar at buffer-index `i` is confirmed as a swing only once `window`
    /// bars exist on both sides, i.e. no earlier than global index `i+W`.
    fn detect_swings(&self, ctx: &mut Context, window: usize) {
        let n = ctx.recent.len();
        if n < 2 * window + 1 {
            return;
        }
        let candidate_idx = n - 1 - window;
        let candidate_global_idx = ctx.bars_seen - 1 - window as u64;
        if ctx.last_confirmed_idx == Some(candidate_global_idx) {
            return;
        }

        let candidate = &ctx.recent[candidate_idx];
        let mut is_high = true;
        let mut is_low = true;
        for offset in 1..=window {
            let left = &ctx.recent[candidate_idx - offset];
            let right = &ctx.recent[candidate_idx + offset];
            if !(candidate.high > left.high && candidate.high > right.high) {
                is_high = false;
            }
            if !(candidate.low < left.low && candidate.low < right.low) {
                is_low = false;
            }
        }

        if is_high {
            ctx.confirmed_swings.push(SwingPoint {
                kind: SwingKind::High,
                price: candidate.high,
                open_time_ms: candidate.open_time_ms,
            });
            ctx.last_confirmed_idx = Some(candidate_global_idx);
        } else if is_low {
            ctx.confirmed_swings.push(SwingPoint {
                kind: SwingKind::Low,
                price: candidate.low,
                open_time_ms: candidate.open_time_ms,
            });
            ctx.last_confirmed_idx = Some(candidate_global_idx);
        }
    }

    fn evict_stale_swings(&self, ctx: &mut Context, lookback: usize) {
        if ctx.confirmed_swings.len() > lookback {
            let excess = ctx.confirmed_swings.len() - lookback;
            ctx.confirmed_swings.drain(0..excess);
        }
    }

    /// Only gaps at least `fvg_min_size_percent` wide relative to the
    /// middle candle's close are recorded — narrow three-bar gaps inside
    /// noise don't get tracked as tradeable imbalances.
    fn detect_fvg(&self, ctx: &mut Context, fvg_min_size_percent: Decimal) {
        let n = ctx.recent.len();
        if n < 3 {
            return;
        }
        let a = &ctx.recent[n - 3];
        let b = &ctx.recent[n - 2];
        let c = &ctx.recent[n - 1];

        let large_enough = |gap_low: Decimal, gap_high: Decimal| {
            b.close > Decimal::ZERO && (gap_high - gap_low) / b.close >= fvg_min_size_percent
        };

        if a.high < c.low && large_enough(a.high, c.low) {
            self.upsert_fvg(ctx, true, a.high, c.low, c.open_time_ms);
        } else if a.low > c.high && large_enough(c.high, a.low) {
            self.upsert_fvg(ctx, false, c.high, a.low, c.open_time_ms);
        }

        let last_close = ctx.recent[n - 1].close;
        for fvg in ctx.fvgs.iter_mut() {
            if fvg.state == ZoneState::Invalidated {
                continue;
            }
            let inside = last_close >= fvg.gap_low && last_close <= fvg.gap_high;
            let filled = if fvg.bullish {
                last_close < fvg.gap_low
            } else {
                last_close > fvg.gap_high
            };
            if filled {
                fvg.state = ZoneState::Invalidated;
            } else if inside && fvg.state == ZoneState::Active {
                fvg.state = ZoneState::Mitigated;
            }
        }
    }

    fn upsert_fvg(&self, ctx: &mut Context, bullish: bool, gap_low: Decimal, gap_high: Decimal, at: i64) {
        let id = self.next_zone_id.fetch_add(1, Ordering::Relaxed);
        ctx.fvgs.push(FairValueGap {
            id,
            bullish,
            gap_low,
            gap_high,
            state: ZoneState::Active,
            detected_at_open_time: at,
        });
    }

    /// Last opposite-color candle preceding a structure break: when the
    /// newest bar closes beyond the most recent opposing swing, the most
    /// recent candle of the opposite color in `lookback` bars becomes an
    /// order block.
    fn detect_order_blocks(&self, ctx: &mut Context, lookback: usize) {
        let n = ctx.recent.len();
        if n < 2 {
            return;
        }
        let current = ctx.recent[n - 1].clone();

        let broke_up = ctx
            .confirmed_swings
            .iter()
            .rev()
            .find(|s| s.kind == SwingKind::High)
            .map(|s| current.close > s.price)
            .unwrap_or(false);
        let broke_down = ctx
            .confirmed_swings
            .iter()
            .rev()
            .find(|s| s.kind == SwingKind::Low)
            .map(|s| current.close < s.price)
            .unwrap_or(false);

        if broke_up {
            if let Some((idx, candle)) = self.find_last_opposite(ctx, false, lookback) {
                let _ = idx;
                let id = self.next_zone_id.fetch_add(1, Ordering::Relaxed);
                ctx.order_blocks.push(OrderBlock {
                    id,
                    bullish: true,
                    body_low: candle.open.min(candle.close),
                    body_high: candle.open.max(candle.close),
                    state: ZoneState::Active,
                    detected_at_open_time: candle.open_time_ms,
                });
            }
        } else if broke_down {
            if let Some((idx, candle)) = self.find_last_opposite(ctx, true, lookback) {
                let _ = idx;
                let id = self.next_zone_id.fetch_add(1, Ordering::Relaxed);
                ctx.order_blocks.push(OrderBlock {
                    id,
                    bullish: false,
                    body_low: candle.open.min(candle.close),
                    body_high: candle.open.max(candle.close),
                    state: ZoneState::Active,
                    detected_at_open_time: candle.open_time_ms,
                });
            }
        }

        let last_close = current.close;
        for ob in ctx.order_blocks.iter_mut() {
            if ob.state == ZoneState::Invalidated {
                continue;
            }
            let touched = last_close >= ob.body_low && last_close <= ob.body_high;
            let invalidated = if ob.bullish {
                last_close < ob.body_low
            } else {
                last_close > ob.body_high
            };
            if invalidated {
                ob.state = ZoneState::Invalidated;
            } else if touched && ob.state == ZoneState::Active {
                ob.state = ZoneState::Mitigated;
            }
        }
    }

    /// `bullish_candle = true` looks for the last up-close candle, `false`
    /// for the last down-close candle, scanning back `lookback` bars.
    fn find_last_opposite(&self, ctx: &Context, bullish_candle: bool, lookback: usize) -> Option<(usize, Candle)> {
        let n = ctx.recent.len();
        let start = n.saturating_sub(lookback + 1);
        for i in (start..n.saturating_sub(1)).rev() {
            let c = &ctx.recent[i];
            let is_up = c.close >= c.open;
            if is_up == bullish_candle {
                return Some((i, c.clone()));
            }
        }
        None
    }

    /// A former order block that was invalidated and then retested from
    /// the opposite side becomes a breaker block.
    fn update_breaker_blocks(&self, ctx: &mut Context) {
        let Some(last) = ctx.recent.back() else { return };
        let last_close = last.close;
        let last_time = last.open_time_ms;

        let mut new_breakers = Vec::new();
        for ob in ctx.order_blocks.iter() {
            if ob.state != ZoneState::Invalidated {
                continue;
            }
            let already_tracked = ctx.breaker_blocks.iter().any(|b| b.origin_order_block_id == ob.id);
            if already_tracked {
                continue;
            }
            let retested = if ob.bullish {
                // was bullish OB, invalidated downward; a breaker forms on
                // retest from below (price returns up into the old body).
                last_close >= ob.body_low && last_close <= ob.body_high
            } else {
                last_close >= ob.body_low && last_close <= ob.body_high
            };
            if retested {
                new_breakers.push(BreakerBlock {
                    id: self.next_zone_id.fetch_add(1, Ordering::Relaxed),
                    bullish: !ob.bullish,
                    body_low: ob.body_low,
                    body_high: ob.body_high,
                    state: ZoneState::Active,
                    detected_at_open_time: last_time,
                    origin_order_block_id: ob.id,
                });
            }
        }
        ctx.breaker_blocks.extend(new_breakers);

        for bb in ctx.breaker_blocks.iter_mut() {
            if bb.state == ZoneState::Invalidated {
                continue;
            }
            let broken_through = if bb.bullish {
                last_close > bb.body_high
            } else {
                last_close < bb.body_low
            };
            if broken_through {
                bb.state = ZoneState::Invalidated;
            }
        }
    }

    /// Clusters swings of the same kind within `liquidity_sweep_threshold`
    /// relative tolerance into liquidity zones; invalidates on a close
    /// past the level (a liquidity sweep).
    fn detect_liquidity_zones(&self, ctx: &mut Context, liquidity_sweep_threshold: Decimal) {
        for kind in [SwingKind::High, SwingKind::Low] {
            let candidates: Vec<&SwingPoint> =
                ctx.confirmed_swings.iter().filter(|s| s.kind == kind).collect();
            let Some(latest) = candidates.last() else { continue };
            let is_high = kind == SwingKind::High;

            let mut matched = false;
            for zone in ctx.liquidity_zones.iter_mut().filter(|z| z.is_high == is_high) {
                if zone.state == ZoneState::Invalidated {
                    continue;
                }
                let rel_diff = ((latest.price - zone.price) / zone.price).abs();
                if rel_diff <= liquidity_sweep_threshold && zone.detected_at_open_time != latest.open_time_ms {
                    zone.touches += 1;
                    matched = true;
                    break;
                }
            }
            if !matched && candidates.len() >= 2 {
                let id = self.next_zone_id.fetch_add(1, Ordering::Relaxed);
                ctx.liquidity_zones.push(LiquidityZone {
                    id,
                    is_high,
                    price: latest.price,
                    touches: 1,
                    state: ZoneState::Active,
                    detected_at_open_time: latest.open_time_ms,
                });
            }
        }

        let Some(last) = ctx.recent.back() else { return };
        for zone in ctx.liquidity_zones.iter_mut() {
            if zone.state == ZoneState::Invalidated {
                continue;
            }
            let swept = if zone.is_high {
                last.high > zone.price && last.close < zone.price
            } else {
                last.low < zone.price && last.close > zone.price
            };
            if swept {
                zone.state = ZoneState::Invalidated;
            }
        }
    }

    fn classify_trend(&self, ctx: &Context) -> Trend {
        let highs: Vec<Decimal> = ctx
            .confirmed_swings
            .iter()
            .filter(|s| s.kind == SwingKind::High)
            .map(|s| s.price)
            .collect();
        let lows: Vec<Decimal> = ctx
            .confirmed_swings
            .iter()
            .filter(|s| s.kind == SwingKind::Low)
            .map(|s| s.price)
            .collect();

        let higher_highs = highs.len() >= 2 && highs[highs.len() - 1] > highs[highs.len() - 2];
        let higher_lows = lows.len() >= 2 && lows[lows.len() - 1] > lows[lows.len() - 2];
        let lower_highs = highs.len() >= 2 && highs[highs.len() - 1] < highs[highs.len() - 2];
        let lower_lows = lows.len() >= 2 && lows[lows.len() - 1] < lows[lows.len() - 2];

        if higher_highs && higher_lows {
            Trend::Bullish
        } else if lower_highs && lower_lows {
            Trend::Bearish
        } else {
            Trend::Ranging
        }
    }
}

#[async_trait]
impl EventHandler for IndicatorEngine {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if let EventPayload::CandleReceived { candle, source: _ } = event.payload {
            self.handle_candle(candle).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::CandleSource;
    use crate::infrastructure::event_bus::SubscribeOptions;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn candle(open_time_ms: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_time_ms,
            open,
            high,
            low,
            close,
            volume: dec!(1),
            is_closed: true,
        }
    }

    struct Capture {
        snapshots: Arc<Mutex<Vec<IndicatorSnapshot>>>,
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            if let EventPayload::IndicatorUpdated { snapshot, .. } = event.payload {
                self.snapshots.lock().unwrap().push(snapshot);
                self.count.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    async fn setup() -> (EventBus, Arc<IndicatorEngine>, Arc<AtomicUsize>) {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let engine = Arc::new(IndicatorEngine::new(bus.clone(), config, vec![Timeframe::M1]));
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "IndicatorUpdated",
            Arc::new(Capture { snapshots: Arc::new(Mutex::new(Vec::new())), count: count.clone() }),
            SubscribeOptions::default(),
        )
        .await;
        bus.subscribe("CandleReceived", engine.clone(), SubscribeOptions::default())
            .await;
        (bus, engine, count)
    }

    #[tokio::test]
    async fn emits_one_indicator_update_per_candle() {
        let (bus, _engine, count) = setup().await;
        for i in 1..=10i64 {
            bus.publish(Event::new(
                EventPayload::CandleReceived {
                    candle: candle(i * 60_000, dec!(100), dec!(101), dec!(99), dec!(100)),
                    source: CandleSource::Live,
                },
                "test",
            ))
            .await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn provisional_flag_set_for_unclosed_candle() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        struct Flags(Arc<Mutex<Vec<bool>>>);
        #[async_trait]
        impl EventHandler for Flags {
            async fn handle(&self, event: Event) -> anyhow::Result<()> {
                if let EventPayload::IndicatorUpdated { provisional, .. } = event.payload {
                    self.0.lock().unwrap().push(provisional);
                }
                Ok(())
            }
        }
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let engine = Arc::new(IndicatorEngine::new(bus.clone(), config, vec![Timeframe::M1]));
        bus.subscribe("IndicatorUpdated", Arc::new(Flags(seen.clone())), SubscribeOptions::default())
            .await;
        bus.subscribe("CandleReceived", engine, SubscribeOptions::default()).await;

        let mut c = candle(60_000, dec!(100), dec!(101), dec!(99), dec!(100));
        c.is_closed = false;
        bus.publish(Event::new(
            EventPayload::CandleReceived { candle: c, source: CandleSource::Live },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().clone(), vec![true]);
    }

    #[tokio::test]
    async fn unconfigured_timeframe_is_dropped() {
        let (bus, _engine, count) = setup().await;
        bus.publish(Event::new(
            EventPayload::CandleReceived {
                candle: Candle {
                    symbol: "BTCUSDT".into(),
                    timeframe: Timeframe::H1,
                    open_time_ms: 3_600_000,
                    open: dec!(100),
                    high: dec!(101),
                    low: dec!(99),
                    close: dec!(100),
                    volume: dec!(1),
                    is_closed: true,
                },
                source: CandleSource::Live,
            },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn swing_confirmed_no_earlier_than_index_plus_window() {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let engine = IndicatorEngine::new(bus.clone(), config, vec![Timeframe::M1]).with_window(5);

        let mut ctx = Context::new();
        // A clean peak at index 5 (0-based): highs rise then fall around it.
        let highs = [100, 101, 102, 103, 104, 110, 104, 103, 102, 101, 100, 99];
        let mut confirmed_at = None;
        for (i, h) in highs.iter().enumerate() {
            let c = candle(
                (i as i64 + 1) * 60_000,
                Decimal::new(*h, 0),
                Decimal::new(*h, 0),
                Decimal::new(*h - 5, 0),
                Decimal::new(*h, 0),
            );
            engine.ingest(&mut ctx, c, 5, 50, Decimal::ZERO, dec!(0.001));
            if ctx.confirmed_swings.len() == 1 && confirmed_at.is_none() {
                confirmed_at = Some(i);
            }
        }
        // Peak is at buffer index 5; with W=5 it cannot confirm before
        // index 5+5=10.
        assert!(confirmed_at.unwrap() >= 10);
    }
}
