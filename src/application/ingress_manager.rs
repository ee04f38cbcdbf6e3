//! Per-(symbol,timeframe) supervised candle ingestion (§4.6).
//!
//! Reconnect-with-backoff is delegated entirely to `TaskSupervisor`: the
//! stream future returns `Err` on any gateway exception and the
//! supervisor's own `min(cap, base*2^attempt)` jittered backoff restarts
//! it, so the policy lives in one place (§4.3) instead of being
//! duplicated here.

use crate::application::candle_store::CandleStore;
use crate::domain::events::{CandleSource, Event, EventPayload};
use crate::domain::ports::ExchangeGateway;
use crate::domain::types::{StreamKey, Timeframe};
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::service_registry::Service;
use crate::infrastructure::task_supervisor::{TaskConfig, TaskFn, TaskPriority, TaskSupervisor};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::warn;

type WarmupSignal = Arc<Mutex<Option<oneshot::Sender<()>>>>;

pub const DEFAULT_N_WARM: usize = 1000;
pub const DEFAULT_N_MIN: usize = 50;

pub struct IngressManager {
    bus: EventBus,
    gateway: Arc<dyn ExchangeGateway>,
    candle_store: Arc<CandleStore>,
    supervisor: Arc<TaskSupervisor>,
    config: Arc<ConfigStore>,
    n_warm: usize,
    n_min: usize,
}

impl IngressManager {
    pub fn new(
        bus: EventBus,
        gateway: Arc<dyn ExchangeGateway>,
        candle_store: Arc<CandleStore>,
        supervisor: Arc<TaskSupervisor>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            bus,
            gateway,
            candle_store,
            supervisor,
            config,
            n_warm: DEFAULT_N_WARM,
            n_min: DEFAULT_N_MIN,
        }
    }

    pub fn task_name(key: &StreamKey) -> String {
        format!("ingress:{key}")
    }

    pub async fn watch(&self, key: StreamKey) {
        self.watch_inner(key, None).await;
    }

    /// Like `watch`, but returns a receiver that fires once this key's
    /// warm-up phase completes (immediately, if warm-up was skipped
    /// because the store already held enough history). Used by
    /// SubscriptionController to gate its atomic commit.
    pub async fn watch_with_warmup_signal(&self, key: StreamKey) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.watch_inner(key, Some(Arc::new(Mutex::new(Some(tx))))).await;
        rx
    }

    async fn watch_inner(&self, key: StreamKey, warmup_signal: Option<WarmupSignal>) {
        let bus = self.bus.clone();
        let gateway = self.gateway.clone();
        let candle_store = self.candle_store.clone();
        let n_warm = self.n_warm;
        let n_min = self.n_min;
        let task_key = key.clone();

        let func: TaskFn = Arc::new(move || {
            let bus = bus.clone();
            let gateway = gateway.clone();
            let candle_store = candle_store.clone();
            let key = task_key.clone();
            let warmup_signal = warmup_signal.clone();
            Box::pin(async move { run_stream(bus, gateway, candle_store, key, n_warm, n_min, warmup_signal).await })
        });

        self.supervisor
            .spawn(TaskConfig {
                name: Self::task_name(&key),
                func,
                interval: None,
                priority: TaskPriority::High,
                timeout: Duration::from_secs(3600),
                restart_on_failure: true,
                max_restarts: u32::MAX,
                backoff_base_ms: 1000,
                backoff_cap_ms: 30_000,
                group: Some("ingress".to_string()),
            })
            .await;
    }

    pub async fn stop_watching(&self, key: &StreamKey) {
        self.supervisor.cancel(&Self::task_name(key)).await;
    }
}

async fn run_stream(
    bus: EventBus,
    gateway: Arc<dyn ExchangeGateway>,
    candle_store: Arc<CandleStore>,
    key: StreamKey,
    n_warm: usize,
    n_min: usize,
    warmup_signal: Option<WarmupSignal>,
) -> Result<(), String> {
    let existing = candle_store.len(&key.symbol, key.timeframe).await;
    if existing < n_min {
        let history = gateway
            .fetch_ohlcv(&key.symbol, key.timeframe, n_warm)
            .await
            .map_err(|e| e.to_string())?;
        for candle in history {
            if let Err(e) = candle.validate() {
                warn!(%key, error = %e, "dropping invalid warm-up candle");
                continue;
            }
            candle_store.append(candle.clone()).await;
            bus.publish(Event::new(
                EventPayload::CandleReceived { candle, source: CandleSource::Warmup },
                "ingress_manager",
            ))
            .await;
        }
    }

    if let Some(signal) = &warmup_signal {
        if let Some(tx) = signal.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    let mut rx = gateway
        .watch_candles(&key.symbol, key.timeframe)
        .await
        .map_err(|e| e.to_string())?;

    while let Some(candle) = rx.recv().await {
        if let Err(e) = candle.validate() {
            warn!(%key, error = %e, "dropping invalid live candle");
            continue;
        }
        candle_store.append(candle.clone()).await;
        bus.publish(
            Event::new(
                EventPayload::CandleReceived { candle, source: CandleSource::Live },
                "ingress_manager",
            )
            .with_priority(6),
        )
        .await;
    }

    Err(format!("candle stream for {key} ended"))
}

#[async_trait]
impl Service for IngressManager {
    async fn start(&self) -> Result<(), String> {
        let settings = self.config.snapshot().await;
        let timeframes: HashSet<Timeframe> = [
            settings.market.primary_timeframe,
            settings.market.higher_timeframe,
            settings.market.lower_timeframe,
        ]
        .into_iter()
        .collect();

        for symbol in &settings.market.active_symbols {
            for timeframe in &timeframes {
                self.watch(StreamKey::new(symbol.clone(), *timeframe)).await;
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        self.supervisor.cancel_group("ingress").await;
        Ok(())
    }
}
