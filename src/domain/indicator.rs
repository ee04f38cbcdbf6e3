use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state shared by every ICT sub-record (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneState {
    Active,
    Mitigated,
    Invalidated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Bullish,
    Bearish,
    Ranging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwingPoint {
    pub kind: SwingKind,
    pub price: Decimal,
    pub open_time_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairValueGap {
    pub id: u64,
    pub bullish: bool,
    pub gap_low: Decimal,
    pub gap_high: Decimal,
    pub state: ZoneState,
    pub detected_at_open_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBlock {
    pub id: u64,
    pub bullish: bool,
    pub body_low: Decimal,
    pub body_high: Decimal,
    pub state: ZoneState,
    pub detected_at_open_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerBlock {
    pub id: u64,
    pub bullish: bool,
    pub body_low: Decimal,
    pub body_high: Decimal,
    pub state: ZoneState,
    pub detected_at_open_time: i64,
    pub origin_order_block_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityZone {
    pub id: u64,
    pub is_high: bool,
    pub price: Decimal,
    pub touches: u32,
    pub state: ZoneState,
    pub detected_at_open_time: i64,
}

/// Per-StreamKey snapshot published after every `CandleReceived` (§3, §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub order_blocks: Vec<OrderBlock>,
    pub fvgs: Vec<FairValueGap>,
    pub breaker_blocks: Vec<BreakerBlock>,
    pub liquidity_zones: Vec<LiquidityZone>,
    pub trend: Option<Trend>,
}
