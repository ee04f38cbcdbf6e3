//! Typed, in-process publish/subscribe bus (§4.1).
//!
//! Delivery is per-subscription FIFO. Subscribers run concurrently with
//! each other; each subscription serializes its own handler invocations
//! unless it opts into concurrent mode. Overflowing a subscriber's bounded
//! queue either drops the oldest buffered event (market-data, priority>=5)
//! or blocks the publisher briefly before dropping the newest (control
//! events, priority<5).

use crate::domain::events::Event;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{error, warn};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_millis(200);
const CONTROL_PRIORITY_THRESHOLD: u8 = 5;
const DEGRADED_FAILURE_THRESHOLD: u32 = 3;
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    pub priority: u8,
    pub concurrent: bool,
    pub queue_capacity: usize,
    pub block_timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            concurrent: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }
}

pub type SubscriptionToken = u64;

struct QueueItem {
    seq: u64,
    event: Event,
}

struct Subscription {
    token: SubscriptionToken,
    event_type: &'static str,
    handler: Arc<dyn EventHandler>,
    queue: std::sync::Mutex<VecDeque<QueueItem>>,
    capacity: usize,
    block_timeout: Duration,
    concurrent: bool,
    notify_pushed: Notify,
    notify_freed: Notify,
    delivered: AtomicU64,
    dropped: AtomicU64,
    consecutive_failures: AtomicU32,
    state: std::sync::Mutex<SubscriptionState>,
    stopped: AtomicBool,
}

impl Subscription {
    fn try_enqueue_nonblocking(&self, seq: u64, event: Event) -> bool {
        let mut q = self.queue.lock().unwrap();
        if q.len() < self.capacity {
            q.push_back(QueueItem { seq, event });
            true
        } else if event.priority >= CONTROL_PRIORITY_THRESHOLD {
            // drop_oldest: evict the earliest-buffered item, admit the new one.
            q.pop_front();
            q.push_back(QueueItem { seq, event });
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn enqueue_dropping_newest(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops the buffered item with the highest priority, earliest (FIFO
    /// among ties) — priority only orders already-buffered events.
    fn pop_highest_priority(&self) -> Option<Event> {
        let mut q = self.queue.lock().unwrap();
        if q.is_empty() {
            return None;
        }
        let mut best_idx = 0;
        let mut best = (&q[0].event.priority, q[0].seq);
        for (i, item) in q.iter().enumerate().skip(1) {
            let candidate = (&item.event.priority, item.seq);
            if candidate.0 > best.0 || (candidate.0 == best.0 && candidate.1 < best.1) {
                best = (candidate.0, candidate.1);
                best_idx = i;
            }
        }
        let item = q.remove(best_idx).unwrap();
        self.notify_freed.notify_waiters();
        Some(item.event)
    }
}

struct EventBusInner {
    subscriptions: RwLock<HashMap<&'static str, Vec<Arc<Subscription>>>>,
    by_token: RwLock<HashMap<SubscriptionToken, (&'static str, Arc<Subscription>)>>,
    next_token: AtomicU64,
    seq: AtomicU64,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscriptions: RwLock::new(HashMap::new()),
                by_token: RwLock::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub async fn subscribe(
        &self,
        event_type: &'static str,
        handler: Arc<dyn EventHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionToken {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            token,
            event_type,
            handler,
            queue: std::sync::Mutex::new(VecDeque::new()),
            capacity: options.queue_capacity,
            block_timeout: options.block_timeout,
            concurrent: options.concurrent,
            notify_pushed: Notify::new(),
            notify_freed: Notify::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            state: std::sync::Mutex::new(SubscriptionState::Active),
            stopped: AtomicBool::new(false),
        });

        self.inner
            .subscriptions
            .write()
            .await
            .entry(event_type)
            .or_default()
            .push(sub.clone());
        self.inner
            .by_token
            .write()
            .await
            .insert(token, (event_type, sub.clone()));

        let bus = self.clone();
        tokio::spawn(async move { bus.drive_subscription(sub).await });

        token
    }

    pub async fn unsubscribe(&self, token: SubscriptionToken) {
        if let Some((event_type, sub)) = self.inner.by_token.write().await.remove(&token) {
            sub.stopped.store(true, Ordering::SeqCst);
            sub.notify_pushed.notify_waiters();
            let mut subs = self.inner.subscriptions.write().await;
            if let Some(v) = subs.get_mut(event_type) {
                v.retain(|s| s.token != token);
            }
        }
    }

    /// Non-blocking publish: enqueues onto every matching subscriber's
    /// queue (subject to the back-pressure policy) without waiting for
    /// handler execution.
    pub async fn publish(&self, event: Event) {
        let event_type = event.type_name();
        let subs = {
            let guard = self.inner.subscriptions.read().await;
            guard.get(event_type).cloned().unwrap_or_default()
        };
        for sub in subs {
            self.deliver_to_queue(&sub, event.clone()).await;
        }
    }

    async fn deliver_to_queue(&self, sub: &Arc<Subscription>, event: Event) {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        if sub.try_enqueue_nonblocking(seq, event.clone()) {
            sub.notify_pushed.notify_waiters();
            return;
        }
        // Control event: block_with_timeout, then drop the newest.
        let deadline = tokio::time::Instant::now() + sub.block_timeout;
        loop {
            let wait = sub.notify_freed.notified();
            tokio::select! {
                _ = wait => {
                    if sub.try_enqueue_nonblocking(seq, event.clone()) {
                        sub.notify_pushed.notify_waiters();
                        return;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    sub.enqueue_dropping_newest();
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                sub.enqueue_dropping_newest();
                return;
            }
        }
    }

    /// Awaits all matching handlers directly, bypassing queues. Used for
    /// shutdown only.
    pub async fn publish_sync(&self, event: Event) {
        let event_type = event.type_name();
        let subs = {
            let guard = self.inner.subscriptions.read().await;
            guard.get(event_type).cloned().unwrap_or_default()
        };
        for sub in subs {
            let _ = self.invoke_handler(&sub, event.clone()).await;
        }
    }

    async fn invoke_handler(&self, sub: &Arc<Subscription>, event: Event) -> anyhow::Result<()> {
        let result = tokio::time::timeout(HANDLER_TIMEOUT, sub.handler.handle(event.clone())).await;
        match result {
            Ok(Ok(())) => {
                sub.delivered.fetch_add(1, Ordering::Relaxed);
                sub.consecutive_failures.store(0, Ordering::Relaxed);
                *sub.state.lock().unwrap() = SubscriptionState::Active;
                Ok(())
            }
            Ok(Err(e)) => {
                self.on_handler_failure(sub, &event, e.to_string()).await;
                Err(e)
            }
            Err(_) => {
                self.on_handler_failure(sub, &event, "handler exceeded 30s timeout".to_string())
                    .await;
                anyhow::bail!("handler timeout")
            }
        }
    }

    async fn on_handler_failure(&self, sub: &Arc<Subscription>, event: &Event, reason: String) {
        error!(
            subscription = sub.token,
            event_type = sub.event_type,
            %reason,
            ?event,
            "event handler failed"
        );
        let failures = sub.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= DEGRADED_FAILURE_THRESHOLD {
            let mut state = sub.state.lock().unwrap();
            if *state != SubscriptionState::Degraded {
                *state = SubscriptionState::Degraded;
                drop(state);
                warn!(
                    subscription = sub.token,
                    event_type = sub.event_type,
                    "subscription entered DEGRADED state after {} consecutive failures",
                    failures
                );
                self.publish(crate::domain::events::Event::new(
                    crate::domain::events::EventPayload::ServiceStateChanged {
                        service: format!("subscription:{}", sub.token),
                        state: "DEGRADED".to_string(),
                    },
                    "event_bus",
                ))
                .await;
            }
        }
    }

    async fn drive_subscription(&self, sub: Arc<Subscription>) {
        loop {
            if sub.stopped.load(Ordering::SeqCst) {
                return;
            }
            let event = match sub.pop_highest_priority() {
                Some(e) => e,
                None => {
                    sub.notify_pushed.notified().await;
                    continue;
                }
            };
            if sub.concurrent {
                let bus = self.clone();
                let sub2 = sub.clone();
                tokio::spawn(async move {
                    let _ = bus.invoke_handler(&sub2, event).await;
                });
            } else {
                let _ = self.invoke_handler(&sub, event).await;
            }
        }
    }

    pub async fn subscriber_counters(&self, token: SubscriptionToken) -> Option<(u64, u64)> {
        let guard = self.inner.by_token.read().await;
        guard
            .get(&token)
            .map(|(_, sub)| (sub.delivered.load(Ordering::Relaxed), sub.dropped.load(Ordering::Relaxed)))
    }

    pub async fn subscription_state(&self, token: SubscriptionToken) -> Option<SubscriptionState> {
        let guard = self.inner.by_token.read().await;
        guard.get(&token).map(|(_, sub)| *sub.state.lock().unwrap())
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .values()
            .map(|v| v.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventPayload;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config_event(version: u64) -> Event {
        Event::new(
            EventPayload::ConfigUpdated {
                subject: "trading".into(),
                change_type: "update".into(),
                details: "test".into(),
                version,
            },
            "test",
        )
    }

    #[tokio::test]
    async fn delivers_to_subscriber() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "ConfigUpdated",
            Arc::new(CountingHandler { count: count.clone(), delay: None }),
            SubscribeOptions::default(),
        )
        .await;
        bus.publish(config_event(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn preserves_fifo_order_per_subscription() {
        let bus = EventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct OrderHandler {
            seen: Arc<std::sync::Mutex<Vec<u64>>>,
        }
        #[async_trait]
        impl EventHandler for OrderHandler {
            async fn handle(&self, event: Event) -> anyhow::Result<()> {
                if let EventPayload::ConfigUpdated { version, .. } = event.payload {
                    self.seen.lock().unwrap().push(version);
                }
                Ok(())
            }
        }

        bus.subscribe(
            "ConfigUpdated",
            Arc::new(OrderHandler { seen: seen.clone() }),
            SubscribeOptions::default(),
        )
        .await;

        for v in 1..=10 {
            bus.publish(config_event(v)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let got = seen.lock().unwrap().clone();
        assert_eq!(got, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drops_oldest_for_market_data_overflow() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        // Slow handler so the queue backs up while we flood it.
        let token = bus
            .subscribe(
                "CandleReceived",
                Arc::new(CountingHandler {
                    count: count.clone(),
                    delay: Some(Duration::from_secs(5)),
                }),
                SubscribeOptions {
                    queue_capacity: 4,
                    ..Default::default()
                },
            )
            .await;

        let candle = crate::domain::types::Candle {
            symbol: "BTCUSDT".into(),
            timeframe: crate::domain::types::Timeframe::M1,
            open_time_ms: 60_000,
            open: rust_decimal_macros::dec!(1),
            high: rust_decimal_macros::dec!(1),
            low: rust_decimal_macros::dec!(1),
            close: rust_decimal_macros::dec!(1),
            volume: rust_decimal_macros::dec!(1),
            is_closed: true,
        };

        for _ in 0..10 {
            bus.publish(Event::new(
                EventPayload::CandleReceived {
                    candle: candle.clone(),
                    source: crate::domain::events::CandleSource::Live,
                },
                "test",
            ))
            .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, dropped) = bus.subscriber_counters(token).await.unwrap();
        assert!(dropped > 0);
    }
}
