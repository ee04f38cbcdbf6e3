//! Maintains open positions from fills and marks them to market (§4.12).

use crate::domain::events::{Event, EventPayload};
use crate::domain::types::{Order, OrderSide, Position};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::event_bus::{EventBus, EventHandler};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct PositionTracker {
    bus: EventBus,
    config: Arc<ConfigStore>,
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionTracker {
    pub fn new(bus: EventBus, config: Arc<ConfigStore>) -> Self {
        Self {
            bus,
            config,
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().await.get(symbol).cloned()
    }

    async fn apply_fill(&self, order: Order) {
        let mut positions = self.positions.write().await;
        let fill_qty = order.quantity;
        let fill_price = order.price.unwrap_or(Decimal::ZERO);

        match positions.get_mut(&order.symbol) {
            None => {
                let position = Position {
                    symbol: order.symbol.clone(),
                    side: order.side,
                    quantity: fill_qty,
                    avg_entry: fill_price,
                    opened_at: order.ts,
                    unrealized_pnl: Decimal::ZERO,
                };
                info!(symbol = %position.symbol, side = ?position.side, "position opened");
                positions.insert(order.symbol.clone(), position.clone());
                drop(positions);
                self.config.set_has_open_position(true).await;
                self.bus
                    .publish(Event::new(EventPayload::PositionOpened { position }, "position_tracker"))
                    .await;
            }
            Some(existing) if existing.side == order.side => {
                let total_qty = existing.quantity + fill_qty;
                existing.avg_entry =
                    (existing.avg_entry * existing.quantity + fill_price * fill_qty) / total_qty;
                existing.quantity = total_qty;
            }
            Some(existing) => {
                let realized_pnl = realized_pnl(existing.side, existing.avg_entry, fill_price, fill_qty.min(existing.quantity));
                if fill_qty >= existing.quantity {
                    let symbol = order.symbol.clone();
                    positions.remove(&symbol);
                    let any_open = !positions.is_empty();
                    drop(positions);
                    if !any_open {
                        self.config.set_has_open_position(false).await;
                    }
                    info!(%symbol, %realized_pnl, "position closed");
                    self.bus
                        .publish(Event::new(
                            EventPayload::PositionClosed { symbol, realized_pnl },
                            "position_tracker",
                        ))
                        .await;
                } else {
                    existing.quantity -= fill_qty;
                }
            }
        }
    }

    async fn mark_to_market(&self, symbol: &str, close_price: Decimal) {
        let mut positions = self.positions.write().await;
        if let Some(position) = positions.get_mut(symbol) {
            position.unrealized_pnl = unrealized_pnl(position.side, position.avg_entry, close_price, position.quantity);
        }
    }
}

fn realized_pnl(side: OrderSide, entry: Decimal, exit: Decimal, qty: Decimal) -> Decimal {
    match side {
        OrderSide::Buy => (exit - entry) * qty,
        OrderSide::Sell => (entry - exit) * qty,
    }
}

fn unrealized_pnl(side: OrderSide, entry: Decimal, mark: Decimal, qty: Decimal) -> Decimal {
    realized_pnl(side, entry, mark, qty)
}

#[async_trait]
impl EventHandler for PositionTracker {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        match event.payload {
            EventPayload::OrderFilled { order, .. } => {
                self.apply_fill(order).await;
            }
            EventPayload::CandleReceived { candle, .. } => {
                self.mark_to_market(&candle.symbol, candle.close).await;
            }
            _ => {}
        }
        Ok(())
    }
}
