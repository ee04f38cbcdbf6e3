//! Wires every component behind `ServiceRegistry` + `TaskSupervisor` and
//! exposes a single `run()` entrypoint, in the shape of `app::Application`
//! bootstrap.

use crate::application::candle_store::CandleStore;
use crate::application::indicator_engine::IndicatorEngine;
use crate::application::ingress_manager::IngressManager;
use crate::application::order_executor::OrderExecutor;
use crate::application::position_tracker::PositionTracker;
use crate::application::risk_validator::RiskValidator;
use crate::application::strategies::{FvgRetracementStrategy, OrderBlockRetestStrategy, Strategy, StrategyLayer};
use crate::application::subscription_controller::SubscriptionController;
use crate::domain::ports::ExchangeGateway;
use crate::domain::settings::Settings;
use crate::infrastructure::config_store::ConfigStore;
use crate::infrastructure::event_bus::{EventBus, EventHandler, SubscribeOptions};
use crate::infrastructure::mock_gateway::MockGateway;
use crate::infrastructure::service_registry::{Service, ServiceRegistry};
use crate::infrastructure::task_supervisor::TaskSupervisor;
use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Adapts a plain `EventHandler` into a `Service` so the registry can
/// order its subscription relative to IngressManager's start.
struct EventHandlerService {
    bus: EventBus,
    event_types: Vec<&'static str>,
    handler: Arc<dyn EventHandler>,
    tokens: Mutex<Vec<u64>>,
}

impl EventHandlerService {
    fn new(bus: EventBus, event_types: Vec<&'static str>, handler: Arc<dyn EventHandler>) -> Self {
        Self { bus, event_types, handler, tokens: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Service for EventHandlerService {
    async fn start(&self) -> Result<(), String> {
        let mut tokens = self.tokens.lock().await;
        for event_type in &self.event_types {
            let token = self
                .bus
                .subscribe(event_type, self.handler.clone(), SubscribeOptions::default())
                .await;
            tokens.push(token);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        let mut tokens = self.tokens.lock().await;
        for token in tokens.drain(..) {
            self.bus.unsubscribe(token).await;
        }
        Ok(())
    }
}

struct OrderExecutorService {
    inner: Arc<OrderExecutor>,
    event: EventHandlerService,
}

#[async_trait]
impl Service for OrderExecutorService {
    async fn start(&self) -> Result<(), String> {
        self.event.start().await?;
        self.inner.spawn_fill_listener().map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), String> {
        self.event.stop().await
    }
}

pub struct Application {
    bus: EventBus,
    registry: ServiceRegistry,
    config: Arc<ConfigStore>,
    candle_store: Arc<CandleStore>,
    position_tracker: Arc<PositionTracker>,
    subscription_controller: Arc<SubscriptionController>,
}

impl Application {
    pub async fn bootstrap(settings: Settings) -> anyhow::Result<Self> {
        let bus = EventBus::new();
        let config = Arc::new(ConfigStore::new(settings, bus.clone()));
        let candle_store = Arc::new(CandleStore::default());
        let registry = ServiceRegistry::new(bus.clone());
        let supervisor = Arc::new(TaskSupervisor::new(bus.clone()));

        let gateway: Arc<dyn ExchangeGateway> = Arc::new(MockGateway::new());

        let timeframes = {
            let snapshot = config.snapshot().await;
            vec![snapshot.market.primary_timeframe, snapshot.market.higher_timeframe, snapshot.market.lower_timeframe]
        };

        let indicator_engine = Arc::new(IndicatorEngine::new(bus.clone(), config.clone(), timeframes.clone()));
        registry
            .register(
                "indicator_engine",
                Arc::new(EventHandlerService::new(bus.clone(), vec!["CandleReceived"], indicator_engine.clone())),
                vec![],
            )
            .await?;

        let strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(FvgRetracementStrategy::new(timeframes.clone())),
            Arc::new(OrderBlockRetestStrategy::new(timeframes.clone())),
        ];
        let strategy_layer = Arc::new(StrategyLayer::new(bus.clone(), config.clone(), candle_store.clone(), strategies));
        registry
            .register(
                "strategy_layer",
                Arc::new(EventHandlerService::new(bus.clone(), vec!["IndicatorUpdated"], strategy_layer.clone())),
                vec![],
            )
            .await?;

        let risk_validator = Arc::new(RiskValidator::new(bus.clone(), config.clone(), dec!(10000)));
        registry
            .register(
                "risk_validator",
                Arc::new(EventHandlerService::new(
                    bus.clone(),
                    vec!["SignalGenerated", "PositionOpened", "PositionClosed"],
                    risk_validator.clone(),
                )),
                vec![],
            )
            .await?;

        let order_executor = Arc::new(OrderExecutor::new(bus.clone(), gateway.clone()));
        registry
            .register(
                "order_executor",
                Arc::new(OrderExecutorService {
                    inner: order_executor.clone(),
                    event: EventHandlerService::new(bus.clone(), vec!["RiskCheckPassed"], order_executor.clone()),
                }),
                vec![],
            )
            .await?;

        let position_tracker = Arc::new(PositionTracker::new(bus.clone(), config.clone()));
        registry
            .register(
                "position_tracker",
                Arc::new(EventHandlerService::new(
                    bus.clone(),
                    vec!["OrderFilled", "CandleReceived"],
                    position_tracker.clone(),
                )),
                vec![],
            )
            .await?;

        let ingress = Arc::new(IngressManager::new(bus.clone(), gateway.clone(), candle_store.clone(), supervisor, config.clone()));
        registry
            .register(
                "ingress_manager",
                ingress.clone(),
                vec![
                    "indicator_engine".to_string(),
                    "strategy_layer".to_string(),
                    "risk_validator".to_string(),
                    "order_executor".to_string(),
                    "position_tracker".to_string(),
                ],
            )
            .await?;

        let subscription_controller =
            Arc::new(SubscriptionController::new(bus.clone(), config.clone(), gateway, ingress, candle_store.clone()));

        Ok(Self {
            bus,
            registry,
            config,
            candle_store,
            position_tracker,
            subscription_controller,
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn candle_store(&self) -> &Arc<CandleStore> {
        &self.candle_store
    }

    pub fn position_tracker(&self) -> &Arc<PositionTracker> {
        &self.position_tracker
    }

    pub fn subscription_controller(&self) -> &Arc<SubscriptionController> {
        &self.subscription_controller
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        self.registry.initialize_all().await?;
        self.registry.start_all().await?;
        info!("engine started, awaiting shutdown signal");

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received, stopping services");
        self.registry.stop_all().await?;
        Ok(())
    }
}
