//! Position sizing and signal approval (§4.10).

use crate::domain::events::{Event, EventPayload};
use crate::domain::types::{OrderSide, RiskRejectionReason, Signal, ValidatedSignal};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::event_bus::{EventBus, EventHandler};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Minimum acceptable stop distance, as a fraction of entry price.
pub const MIN_STOP_DIST: Decimal = dec!(0.0005);
const DEFAULT_MIN_NOTIONAL_USDT: Decimal = dec!(10);
const DEFAULT_MAX_OPEN_POSITIONS: usize = 10;
const DAY_MS: i64 = 86_400_000;

struct DailyPnl {
    day_start_ms: i64,
    realized: Decimal,
}

pub struct RiskValidator {
    bus: EventBus,
    config: Arc<ConfigStore>,
    account_equity: RwLock<Decimal>,
    daily_pnl: RwLock<DailyPnl>,
    open_positions: RwLock<HashMap<String, ()>>,
    min_notional_usdt: Decimal,
    max_open_positions: usize,
}

impl RiskValidator {
    pub fn new(bus: EventBus, config: Arc<ConfigStore>, starting_equity: Decimal) -> Self {
        Self {
            bus,
            config,
            account_equity: RwLock::new(starting_equity),
            daily_pnl: RwLock::new(DailyPnl { day_start_ms: 0, realized: Decimal::ZERO }),
            open_positions: RwLock::new(HashMap::new()),
            min_notional_usdt: DEFAULT_MIN_NOTIONAL_USDT,
            max_open_positions: DEFAULT_MAX_OPEN_POSITIONS,
        }
    }

    pub async fn set_account_equity(&self, equity: Decimal) {
        *self.account_equity.write().await = equity;
    }

    /// Resets the rolling daily PnL window; `day_start_ms` identifies the
    /// trading day boundary so a new day clears the running total.
    pub async fn record_realized_pnl(&self, pnl: Decimal, day_start_ms: i64) {
        let mut daily = self.daily_pnl.write().await;
        if daily.day_start_ms != day_start_ms {
            daily.day_start_ms = day_start_ms;
            daily.realized = Decimal::ZERO;
        }
        daily.realized += pnl;
    }

    pub async fn note_position_opened(&self, symbol: &str) {
        self.open_positions.write().await.insert(symbol.to_string(), ());
    }

    pub async fn note_position_closed(&self, symbol: &str) {
        self.open_positions.write().await.remove(symbol);
    }

    async fn validate(&self, signal: Signal) -> ValidatedSignal {
        let settings = self.config.snapshot().await;
        let daily_loss_limit = settings.trading.daily_loss_limit_usdt;
        let risk_per_trade = settings.trading.risk_per_trade_percent;
        let max_position_size = settings.trading.max_position_size_usdt;
        let leverage = Decimal::from(settings.trading.default_leverage);

        if let Some(reason) = self.reject_reason(&signal, daily_loss_limit).await {
            return ValidatedSignal {
                signal,
                approved: false,
                position_size: Decimal::ZERO,
                rejection_reason: Some(reason),
            };
        }

        let equity = *self.account_equity.read().await;
        let risk_capital = equity * Decimal::from_f64_retain(risk_per_trade).unwrap_or(Decimal::ZERO) / dec!(100);
        let stop_distance = (signal.entry_price - signal.stop_loss).abs();
        if stop_distance <= Decimal::ZERO {
            return rejected(signal, RiskRejectionReason::StopInvalid);
        }

        let size_by_risk = risk_capital / stop_distance;
        let size_by_cap = if signal.entry_price > Decimal::ZERO {
            max_position_size / signal.entry_price
        } else {
            return rejected(signal, RiskRejectionReason::ConfigInvalid);
        };
        let position_size = size_by_risk.min(size_by_cap) * leverage;

        let notional = position_size * signal.entry_price;
        if notional < self.min_notional_usdt {
            return rejected(signal, RiskRejectionReason::MinNotional);
        }

        ValidatedSignal {
            signal,
            approved: true,
            position_size,
            rejection_reason: None,
        }
    }

    async fn reject_reason(&self, signal: &Signal, daily_loss_limit: Decimal) -> Option<RiskRejectionReason> {
        let daily = self.daily_pnl.read().await;
        if daily.realized <= -daily_loss_limit {
            return Some(RiskRejectionReason::DailyLossLimit);
        }
        drop(daily);

        let side: OrderSide = signal.direction.into();
        let stop_on_wrong_side = match side {
            OrderSide::Buy => signal.stop_loss >= signal.entry_price,
            OrderSide::Sell => signal.stop_loss <= signal.entry_price,
        };
        if stop_on_wrong_side {
            return Some(RiskRejectionReason::StopInvalid);
        }

        if signal.entry_price > Decimal::ZERO {
            let rel_dist = (signal.entry_price - signal.stop_loss).abs() / signal.entry_price;
            if rel_dist < MIN_STOP_DIST {
                return Some(RiskRejectionReason::StopTooTight);
            }
        }

        if self.open_positions.read().await.len() >= self.max_open_positions {
            return Some(RiskRejectionReason::PositionCap);
        }

        let equity = *self.account_equity.read().await;
        if equity <= Decimal::ZERO {
            return Some(RiskRejectionReason::InsufficientBalance);
        }

        None
    }
}

fn rejected(signal: Signal, reason: RiskRejectionReason) -> ValidatedSignal {
    ValidatedSignal {
        signal,
        approved: false,
        position_size: Decimal::ZERO,
        rejection_reason: Some(reason),
    }
}

#[async_trait]
impl EventHandler for RiskValidator {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        let created_at = event.created_at;
        match event.payload {
            EventPayload::SignalGenerated { signal } => {
                let validated = self.validate(signal).await;
                if validated.approved {
                    info!(symbol = %validated.signal.symbol, size = %validated.position_size, "risk check passed");
                    self.bus
                        .publish(Event::new(EventPayload::RiskCheckPassed { validated }, "risk_validator"))
                        .await;
                } else {
                    let reason = validated.rejection_reason.unwrap();
                    self.bus
                        .publish(Event::new(
                            EventPayload::RiskCheckFailed {
                                signal: validated.signal,
                                reason,
                                detail: reason.to_string(),
                            },
                            "risk_validator",
                        ))
                        .await;
                }
            }
            EventPayload::PositionOpened { position } => {
                self.note_position_opened(&position.symbol).await;
            }
            EventPayload::PositionClosed { symbol, realized_pnl } => {
                self.note_position_closed(&symbol).await;
                let day_start_ms = created_at - created_at.rem_euclid(DAY_MS);
                self.record_realized_pnl(realized_pnl, day_start_ms).await;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Direction, Timeframe};
    use crate::infrastructure::event_bus::SubscribeOptions;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn signal(entry: Decimal, stop: Decimal, direction: Direction) -> Signal {
        Signal {
            id: Uuid::new_v4().to_string(),
            symbol: "BTCUSDT".into(),
            timeframe: Timeframe::M1,
            direction,
            entry_price: entry,
            stop_loss: stop,
            take_profit: entry + (entry - stop).abs() * dec!(2),
            confidence: 0.6,
            strategy_id: "test".into(),
            source_snapshot_time: 0,
        }
    }

    struct Capture {
        passed: Arc<Mutex<Vec<ValidatedSignal>>>,
        failed: Arc<Mutex<Vec<RiskRejectionReason>>>,
    }

    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            match event.payload {
                EventPayload::RiskCheckPassed { validated } => self.passed.lock().unwrap().push(validated),
                EventPayload::RiskCheckFailed { reason, .. } => self.failed.lock().unwrap().push(reason),
                _ => {}
            }
            Ok(())
        }
    }

    async fn setup() -> (EventBus, Arc<RiskValidator>, Arc<Mutex<Vec<ValidatedSignal>>>, Arc<Mutex<Vec<RiskRejectionReason>>>) {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let validator = Arc::new(RiskValidator::new(bus.clone(), config, dec!(10000)));
        let passed = Arc::new(Mutex::new(Vec::new()));
        let failed = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "RiskCheckPassed",
            Arc::new(Capture { passed: passed.clone(), failed: failed.clone() }),
            SubscribeOptions::default(),
        )
        .await;
        bus.subscribe(
            "RiskCheckFailed",
            Arc::new(Capture { passed: passed.clone(), failed: failed.clone() }),
            SubscribeOptions::default(),
        )
        .await;
        bus.subscribe("SignalGenerated", validator.clone(), SubscribeOptions::default()).await;
        (bus, validator, passed, failed)
    }

    #[tokio::test]
    async fn approves_well_formed_signal() {
        let (bus, _v, passed, failed) = setup().await;
        bus.publish(Event::new(
            EventPayload::SignalGenerated { signal: signal(dec!(100), dec!(95), Direction::Long) },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(passed.lock().unwrap().len(), 1);
        assert!(failed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_when_daily_loss_limit_breached() {
        let (bus, validator, passed, failed) = setup().await;
        validator.record_realized_pnl(dec!(-500), 1).await;
        bus.publish(Event::new(
            EventPayload::SignalGenerated { signal: signal(dec!(100), dec!(95), Direction::Long) },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(passed.lock().unwrap().is_empty());
        assert_eq!(failed.lock().unwrap().clone(), vec![RiskRejectionReason::DailyLossLimit]);
    }

    #[tokio::test]
    async fn rejects_stop_on_wrong_side() {
        let (bus, _v, passed, failed) = setup().await;
        bus.publish(Event::new(
            EventPayload::SignalGenerated { signal: signal(dec!(100), dec!(105), Direction::Long) },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(passed.lock().unwrap().is_empty());
        assert_eq!(failed.lock().unwrap().clone(), vec![RiskRejectionReason::StopInvalid]);
    }

    #[tokio::test]
    async fn rejects_stop_too_tight() {
        let (bus, _v, passed, failed) = setup().await;
        bus.publish(Event::new(
            EventPayload::SignalGenerated { signal: signal(dec!(100), dec!(99.99), Direction::Long) },
            "test",
        ))
        .await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(passed.lock().unwrap().is_empty());
        assert_eq!(failed.lock().unwrap().clone(), vec![RiskRejectionReason::StopTooTight]);
    }
}
