use crate::domain::types::{
    Candle, Order, Position, RiskRejectionReason, Signal, StreamKey, Timeframe, ValidatedSignal,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of event payload tags (§4.1). Every event published on
/// the bus carries one of these; handlers match on the tag rather than on
/// a heterogeneous dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    CandleReceived {
        candle: Candle,
        source: CandleSource,
    },
    IndicatorUpdated {
        symbol: String,
        timeframe: Timeframe,
        snapshot: crate::domain::indicator::IndicatorSnapshot,
        source_candle_time: i64,
        provisional: bool,
    },
    SignalGenerated {
        signal: Signal,
    },
    RiskCheckPassed {
        validated: ValidatedSignal,
    },
    RiskCheckFailed {
        signal: Signal,
        reason: RiskRejectionReason,
        detail: String,
    },
    OrderPlaced {
        order: Order,
    },
    OrderFilled {
        order: Order,
        fill_id: String,
    },
    PositionOpened {
        position: Position,
    },
    PositionClosed {
        symbol: String,
        realized_pnl: rust_decimal::Decimal,
    },
    ConfigUpdated {
        subject: String,
        change_type: String,
        details: String,
        version: u64,
    },
    SubscriptionChanged {
        added: Vec<StreamKey>,
        removed: Vec<StreamKey>,
    },
    ServiceStateChanged {
        service: String,
        state: String,
    },
    TaskRestarted {
        task: String,
        attempt: u32,
        r#final: bool,
    },
}

impl EventPayload {
    /// Stable tag used for subscription routing and metrics labelling.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::CandleReceived { .. } => "CandleReceived",
            EventPayload::IndicatorUpdated { .. } => "IndicatorUpdated",
            EventPayload::SignalGenerated { .. } => "SignalGenerated",
            EventPayload::RiskCheckPassed { .. } => "RiskCheckPassed",
            EventPayload::RiskCheckFailed { .. } => "RiskCheckFailed",
            EventPayload::OrderPlaced { .. } => "OrderPlaced",
            EventPayload::OrderFilled { .. } => "OrderFilled",
            EventPayload::PositionOpened { .. } => "PositionOpened",
            EventPayload::PositionClosed { .. } => "PositionClosed",
            EventPayload::ConfigUpdated { .. } => "ConfigUpdated",
            EventPayload::SubscriptionChanged { .. } => "SubscriptionChanged",
            EventPayload::ServiceStateChanged { .. } => "ServiceStateChanged",
            EventPayload::TaskRestarted { .. } => "TaskRestarted",
        }
    }

    /// Default priority for the payload kind, per §4.1: market-data events
    /// default to 6 (drop_oldest band), control events default to 2
    /// (block_with_timeout band).
    pub fn default_priority(&self) -> u8 {
        match self {
            EventPayload::CandleReceived { .. } | EventPayload::IndicatorUpdated { .. } => 6,
            EventPayload::SignalGenerated { .. }
            | EventPayload::RiskCheckPassed { .. }
            | EventPayload::RiskCheckFailed { .. }
            | EventPayload::OrderPlaced { .. }
            | EventPayload::OrderFilled { .. } => 5,
            _ => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleSource {
    Warmup,
    Live,
}

impl fmt::Display for CandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandleSource::Warmup => write!(f, "warmup"),
            CandleSource::Live => write!(f, "live"),
        }
    }
}

/// Event envelope (§3). `priority` only affects ordering within an
/// already-buffered subscriber queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub payload: EventPayload,
    pub priority: u8,
    pub source: String,
    pub created_at: i64,
    pub correlation_id: Option<String>,
}

impl Event {
    pub fn new(payload: EventPayload, source: impl Into<String>) -> Self {
        let priority = payload.default_priority();
        Self {
            payload,
            priority,
            source: source.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(9);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}
