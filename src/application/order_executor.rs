//! Places approved signals with the gateway and tracks idempotent fills
//! (§4.11).

use crate::domain::errors::GatewayError;
use crate::domain::events::{Event, EventPayload};
use crate::domain::ports::ExchangeGateway;
use crate::domain::types::{Order, OrderSide, OrderStatus, OrderType, ValidatedSignal};
use crate::infrastructure::circuit_breaker::backoff_with_jitter;
use crate::infrastructure::event_bus::{EventBus, EventHandler};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(250);
const CAP_BACKOFF: Duration = Duration::from_secs(5);

pub struct OrderExecutor {
    bus: EventBus,
    gateway: Arc<dyn ExchangeGateway>,
    symbol_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    orders_by_client_id: RwLock<HashMap<String, Order>>,
    seen_fills: RwLock<HashSet<(String, String)>>,
}

impl OrderExecutor {
    pub fn new(bus: EventBus, gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            bus,
            gateway,
            symbol_locks: RwLock::new(HashMap::new()),
            orders_by_client_id: RwLock::new(HashMap::new()),
            seen_fills: RwLock::new(HashSet::new()),
        }
    }

    /// Spawns the long-running fill-consumer loop. Must be called once
    /// after construction.
    pub fn spawn_fill_listener(self: &Arc<Self>) -> anyhow::Result<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut rx = match this.gateway.watch_fills().await {
                Ok(rx) => rx,
                Err(e) => {
                    error!(error = %e, "failed to subscribe to fill stream");
                    return;
                }
            };
            while let Some(fill) = rx.recv().await {
                this.handle_fill(fill).await;
            }
        });
        Ok(())
    }

    async fn handle_fill(&self, fill: crate::domain::ports::Fill) {
        let dedup_key = (fill.client_order_id.clone(), fill.fill_id.clone());
        {
            let mut seen = self.seen_fills.write().await;
            if !seen.insert(dedup_key) {
                return; // duplicate fill, already processed
            }
        }

        let mut orders = self.orders_by_client_id.write().await;
        let Some(order) = orders.get_mut(&fill.client_order_id) else {
            warn!(client_order_id = %fill.client_order_id, "fill for unknown order, dropping");
            return;
        };
        if order.status.can_transition_to(OrderStatus::Filled) {
            order.status = OrderStatus::Filled;
        }
        let order_copy = order.clone();
        drop(orders);

        self.bus
            .publish(Event::new(
                EventPayload::OrderFilled { order: order_copy, fill_id: fill.fill_id },
                "order_executor",
            ))
            .await;
    }

    async fn lock_for_symbol(&self, symbol: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.symbol_locks.read().await.get(symbol) {
            return lock.clone();
        }
        let mut locks = self.symbol_locks.write().await;
        locks.entry(symbol.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn place_with_retry(&self, validated: &ValidatedSignal) -> Result<(Order, crate::domain::ports::OrderAck), GatewayError> {
        let signal = &validated.signal;
        let side: OrderSide = signal.direction.into();
        let lock = self.lock_for_symbol(&signal.symbol).await;
        let _guard = lock.lock().await;

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            let client_order_id = deterministic_client_order_id(&signal.id, attempt);
            let order = Order {
                id: client_order_id.clone(),
                client_order_id: client_order_id.clone(),
                symbol: signal.symbol.clone(),
                side,
                order_type: OrderType::Market,
                quantity: validated.position_size,
                price: Some(signal.entry_price),
                status: OrderStatus::Pending,
                ts: signal.source_snapshot_time,
            };
            let spec = self.gateway.order_spec_for(&order);

            match self.gateway.place_order(spec).await {
                Ok(ack) => {
                    let mut placed = order;
                    placed.status = OrderStatus::Placed;
                    return Ok((placed, ack));
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let backoff = backoff_with_jitter(BASE_BACKOFF, CAP_BACKOFF, attempt);
                    warn!(attempt, error = %e, "order placement failed, retrying");
                    tokio::time::sleep(backoff).await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Network("retries exhausted".to_string())))
    }
}

/// Deterministic client order id derived from the signal id and the
/// attempt number, so retries of the same signal never collide and a
/// crash-restart replays the same id for attempt 0.
pub fn deterministic_client_order_id(signal_id: &str, attempt: u32) -> String {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    signal_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    format!("ict-{:016x}", hasher.finish())
}

#[async_trait]
impl EventHandler for OrderExecutor {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if let EventPayload::RiskCheckPassed { validated } = event.payload {
            match self.place_with_retry(&validated).await {
                Ok((order, _ack)) => {
                    info!(symbol = %order.symbol, client_order_id = %order.client_order_id, "order placed");
                    self.orders_by_client_id
                        .write()
                        .await
                        .insert(order.client_order_id.clone(), order.clone());
                    self.bus
                        .publish(Event::new(EventPayload::OrderPlaced { order }, "order_executor"))
                        .await;
                }
                Err(e) => {
                    error!(symbol = %validated.signal.symbol, error = %e, "order placement failed permanently");
                }
            }
        }
        Ok(())
    }
}
