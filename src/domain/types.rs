use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange ticker, e.g. "BTCUSDT".
pub type SymbolId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 5 * 60_000,
            Timeframe::M15 => 15 * 60_000,
            Timeframe::H1 => 60 * 60_000,
            Timeframe::H4 => 4 * 60 * 60_000,
            Timeframe::D1 => 24 * 60 * 60_000,
        }
    }

    /// True if `open_time_ms` falls on a boundary for this timeframe.
    pub fn is_aligned(&self, open_time_ms: i64) -> bool {
        open_time_ms % self.duration_ms() == 0
    }
}

impl std::str::FromStr for Timeframe {
    type Err = crate::domain::errors::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "m1" | "1m" => Ok(Timeframe::M1),
            "m5" | "5m" => Ok(Timeframe::M5),
            "m15" | "15m" => Ok(Timeframe::M15),
            "h1" | "1h" => Ok(Timeframe::H1),
            "h4" | "4h" => Ok(Timeframe::H4),
            "d1" | "1d" => Ok(Timeframe::D1),
            other => Err(crate::domain::errors::ConfigError::InvalidTimeframe(
                other.to_string(),
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unit of subscription and per-key state: (symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub symbol: SymbolId,
    pub timeframe: Timeframe,
}

impl StreamKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Immutable market candle. The last candle in a buffer may be live
/// (`is_closed == false`) and gets overwritten in place until superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: SymbolId,
    pub timeframe: Timeframe,
    pub open_time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

impl Candle {
    /// Validates the §3 invariants. Called at the ingress boundary.
    pub fn validate(&self) -> Result<(), crate::domain::errors::GatewayError> {
        use crate::domain::errors::GatewayError;
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        if !(self.low <= body_lo && body_hi <= self.high) {
            return Err(GatewayError::invalid(format!(
                "candle OHLC violates low<=min(o,c)<=max(o,c)<=high for {} @ {}",
                self.symbol, self.open_time_ms
            )));
        }
        if self.volume < Decimal::ZERO {
            return Err(GatewayError::invalid(format!(
                "negative volume for {} @ {}",
                self.symbol, self.open_time_ms
            )));
        }
        if !self.timeframe.is_aligned(self.open_time_ms) {
            return Err(GatewayError::invalid(format!(
                "open_time_ms {} not aligned to {} boundary",
                self.open_time_ms, self.timeframe
            )));
        }
        Ok(())
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.symbol.clone(), self.timeframe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl From<Direction> for OrderSide {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Placed,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Monotonic transition table per §3: status only ever advances.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Placed)
                | (Pending, Rejected)
                | (Placed, Partial)
                | (Placed, Filled)
                | (Placed, Canceled)
                | (Partial, Partial)
                | (Partial, Filled)
                | (Partial, Canceled)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: SymbolId,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: SymbolId,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub avg_entry: Decimal,
    pub opened_at: i64,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: SymbolId,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub confidence: f64,
    pub strategy_id: String,
    pub source_snapshot_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedSignal {
    pub signal: Signal,
    pub approved: bool,
    pub position_size: Decimal,
    pub rejection_reason: Option<RiskRejectionReason>,
}

/// Closed set of rejection reason codes (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskRejectionReason {
    DailyLossLimit,
    StopInvalid,
    StopTooTight,
    MinNotional,
    PositionCap,
    InsufficientBalance,
    ConfigInvalid,
}

impl fmt::Display for RiskRejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskRejectionReason::DailyLossLimit => "DAILY_LOSS_LIMIT",
            RiskRejectionReason::StopInvalid => "STOP_INVALID",
            RiskRejectionReason::StopTooTight => "STOP_TOO_TIGHT",
            RiskRejectionReason::MinNotional => "MIN_NOTIONAL",
            RiskRejectionReason::PositionCap => "POSITION_CAP",
            RiskRejectionReason::InsufficientBalance => "INSUFFICIENT_BALANCE",
            RiskRejectionReason::ConfigInvalid => "CONFIG_INVALID",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open_time_ms: i64, o: Decimal, h: Decimal, l: Decimal, c: Decimal) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            open_time_ms,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: dec!(1),
            is_closed: true,
        }
    }

    #[test]
    fn validate_accepts_well_formed_candle() {
        let c = candle(60_000, dec!(100), dec!(110), dec!(90), dec!(105));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_high_below_body() {
        let c = candle(60_000, dec!(100), dec!(101), dec!(90), dec!(105));
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_misaligned_open_time() {
        let c = candle(60_001, dec!(100), dec!(110), dec!(90), dec!(105));
        assert!(c.validate().is_err());
    }

    #[test]
    fn order_status_transitions_are_monotonic() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Placed));
        assert!(!OrderStatus::Filled.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Canceled.can_transition_to(OrderStatus::Filled));
    }
}
