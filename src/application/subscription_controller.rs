//! Dynamic symbol add/remove with atomic warm-up-gated commit (§4.13).

use crate::application::candle_store::CandleStore;
use crate::application::ingress_manager::IngressManager;
use crate::domain::errors::SubscriptionError;
use crate::domain::events::{Event, EventPayload};
use crate::domain::ports::ExchangeGateway;
use crate::domain::types::{StreamKey, Timeframe};
use crate::infrastructure::config_store::{ConfigStore, MarketPatch, Patch};
use crate::infrastructure::event_bus::EventBus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const WARMUP_TIMEOUT: Duration = Duration::from_secs(30);
const BUFFER_RETENTION: Duration = Duration::from_secs(30);

pub struct SubscriptionController {
    bus: EventBus,
    config: Arc<ConfigStore>,
    gateway: Arc<dyn ExchangeGateway>,
    ingress: Arc<IngressManager>,
    candle_store: Arc<CandleStore>,
}

impl SubscriptionController {
    pub fn new(
        bus: EventBus,
        config: Arc<ConfigStore>,
        gateway: Arc<dyn ExchangeGateway>,
        ingress: Arc<IngressManager>,
        candle_store: Arc<CandleStore>,
    ) -> Self {
        Self { bus, config, gateway, ingress, candle_store }
    }

    pub async fn add_symbol(&self, symbol: &str, timeframes: Option<Vec<Timeframe>>) -> Result<(), SubscriptionError> {
        self.gateway
            .validate_symbol(symbol)
            .await
            .map_err(|_| SubscriptionError::UnknownSymbol(symbol.to_string()))?;

        let settings = self.config.snapshot().await;
        let timeframes = timeframes.unwrap_or_else(|| {
            vec![settings.market.primary_timeframe, settings.market.higher_timeframe, settings.market.lower_timeframe]
                .into_iter()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        });

        let new_keys: Vec<StreamKey> = timeframes.iter().map(|tf| StreamKey::new(symbol, *tf)).collect();

        let mut receivers = Vec::with_capacity(new_keys.len());
        for key in &new_keys {
            let rx = self.ingress.watch_with_warmup_signal(key.clone()).await;
            receivers.push(rx);
        }

        let wait_all = async {
            for rx in receivers {
                if rx.await.is_err() {
                    return Err(());
                }
            }
            Ok(())
        };

        match tokio::time::timeout(WARMUP_TIMEOUT, wait_all).await {
            Ok(Ok(())) => {}
            _ => {
                warn!(%symbol, "warm-up failed or timed out, rolling back subscription");
                for key in &new_keys {
                    self.ingress.stop_watching(key).await;
                }
                return Err(SubscriptionError::Timeout(WARMUP_TIMEOUT));
            }
        }

        let mut active = settings.market.active_symbols.clone();
        if !active.iter().any(|s| s == symbol) {
            active.push(symbol.to_string());
        }
        self.config
            .update(Patch::Market(MarketPatch { active_symbols: Some(active), ..Default::default() }), true)
            .await
            .map_err(|_| SubscriptionError::UnknownSymbol(symbol.to_string()))?;

        info!(%symbol, "symbol subscription committed");
        self.bus
            .publish(Event::new(
                EventPayload::SubscriptionChanged { added: new_keys, removed: vec![] },
                "subscription_controller",
            ))
            .await;
        Ok(())
    }

    pub async fn remove_symbol(&self, symbol: &str) {
        let settings = self.config.snapshot().await;
        let timeframes = [settings.market.primary_timeframe, settings.market.higher_timeframe, settings.market.lower_timeframe];
        let removed_keys: Vec<StreamKey> = timeframes
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|tf| StreamKey::new(symbol, tf))
            .collect();

        for key in &removed_keys {
            self.ingress.stop_watching(key).await;
        }

        let active: Vec<String> = settings.market.active_symbols.iter().filter(|s| s.as_str() != symbol).cloned().collect();
        let _ = self
            .config
            .update(Patch::Market(MarketPatch { active_symbols: Some(active), ..Default::default() }), true)
            .await;

        let candle_store = self.candle_store.clone();
        let keys_to_drop = removed_keys.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BUFFER_RETENTION).await;
            for key in keys_to_drop {
                candle_store.drop_key(&key.symbol, key.timeframe).await;
            }
        });

        info!(%symbol, "symbol subscription removed");
        self.bus
            .publish(Event::new(
                EventPayload::SubscriptionChanged { added: vec![], removed: removed_keys },
                "subscription_controller",
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::event_bus::{EventHandler, SubscribeOptions};
    use crate::infrastructure::mock_gateway::MockGateway;
    use crate::infrastructure::task_supervisor::TaskSupervisor;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct Capture(Arc<Mutex<Vec<EventPayload>>>);
    #[async_trait]
    impl EventHandler for Capture {
        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event.payload);
            Ok(())
        }
    }

    fn setup() -> (EventBus, Arc<ConfigStore>, Arc<dyn ExchangeGateway>, Arc<IngressManager>, Arc<CandleStore>) {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(crate::domain::settings::Settings::default(), bus.clone()));
        let gateway: Arc<dyn ExchangeGateway> =
            Arc::new(MockGateway::new().with_symbol("ETHUSDT", dec!(2000)));
        let candle_store = Arc::new(CandleStore::default());
        let supervisor = Arc::new(TaskSupervisor::new(bus.clone()));
        let ingress = Arc::new(IngressManager::new(bus.clone(), gateway.clone(), candle_store.clone(), supervisor, config.clone()));
        (bus, config, gateway, ingress, candle_store)
    }

    #[tokio::test]
    async fn add_symbol_commits_after_warmup() {
        let (bus, config, gateway, ingress, candle_store) = setup();
        let controller = SubscriptionController::new(bus.clone(), config.clone(), gateway, ingress, candle_store);

        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("SubscriptionChanged", Arc::new(Capture(seen.clone())), SubscribeOptions::default())
            .await;

        controller.add_symbol("ETHUSDT", Some(vec![Timeframe::M1])).await.unwrap();

        let settings = config.snapshot().await;
        assert!(settings.market.active_symbols.iter().any(|s| s == "ETHUSDT"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_symbol_commits_and_emits_event() {
        let (bus, config, gateway, ingress, candle_store) = setup();
        let controller = SubscriptionController::new(bus.clone(), config.clone(), gateway, ingress, candle_store);
        controller.add_symbol("ETHUSDT", Some(vec![Timeframe::M1])).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("SubscriptionChanged", Arc::new(Capture(seen.clone())), SubscribeOptions::default())
            .await;

        controller.remove_symbol("ETHUSDT").await;
        let settings = config.snapshot().await;
        assert!(!settings.market.active_symbols.iter().any(|s| s == "ETHUSDT"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
