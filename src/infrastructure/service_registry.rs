//! Dependency-ordered service lifecycle (§4.2).

use crate::domain::errors::ServiceError;
use crate::domain::events::{Event, EventPayload};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Registered,
    Initializing,
    Initialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ServiceState {
    fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Registered => "REGISTERED",
            ServiceState::Initializing => "INITIALIZING",
            ServiceState::Initialized => "INITIALIZED",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Stopped => "STOPPED",
            ServiceState::Failed => "FAILED",
        }
    }
}

#[async_trait]
pub trait Service: Send + Sync {
    async fn initialize(&self) -> Result<(), String> {
        Ok(())
    }
    async fn start(&self) -> Result<(), String>;
    async fn stop(&self) -> Result<(), String>;
}

struct Descriptor {
    name: String,
    instance: Arc<dyn Service>,
    dependencies: Vec<String>,
    state: ServiceState,
}

pub struct ServiceRegistry {
    bus: EventBus,
    descriptors: RwLock<Vec<Descriptor>>,
}

impl ServiceRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            descriptors: RwLock::new(Vec::new()),
        }
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        instance: Arc<dyn Service>,
        dependencies: Vec<String>,
    ) -> Result<(), ServiceError> {
        let name = name.into();
        if dependencies.contains(&name) {
            return Err(ServiceError::DependencyCycle(name));
        }

        {
            let mut descriptors = self.descriptors.write().await;
            descriptors.push(Descriptor {
                name: name.clone(),
                instance,
                dependencies,
                state: ServiceState::Registered,
            });
        }

        // Cycles among already-known services are rejected at registration
        // time; dependencies on services registered later are validated
        // lazily in `initialize_all`/`start_all` (Kahn's algorithm reports
        // unknown dependencies there too).
        if let Err(ServiceError::DependencyCycle(cycle)) = self.topo_order_ignoring_unknown().await {
            let mut descriptors = self.descriptors.write().await;
            descriptors.retain(|d| d.name != name);
            return Err(ServiceError::DependencyCycle(cycle));
        }
        Ok(())
    }

    /// Like `topo_order` but treats a dependency on a not-yet-registered
    /// service as satisfied (in-degree 0 contribution), so registration
    /// order doesn't matter — only genuine cycles are rejected here.
    async fn topo_order_ignoring_unknown(&self) -> Result<Vec<String>, ServiceError> {
        let descriptors = self.descriptors.read().await;
        let names: HashSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();

        let mut in_degree: HashMap<&str, usize> =
            descriptors.iter().map(|d| (d.name.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> =
            descriptors.iter().map(|d| (d.name.as_str(), Vec::new())).collect();

        for d in descriptors.iter() {
            for dep in &d.dependencies {
                if !names.contains(dep.as_str()) {
                    continue;
                }
                *in_degree.get_mut(d.name.as_str()).unwrap() += 1;
                dependents.get_mut(dep.as_str()).unwrap().push(d.name.as_str());
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&n, _)| n)
            .collect();
        queue.sort();

        let mut order = Vec::with_capacity(descriptors.len());
        while let Some(n) = queue.pop() {
            order.push(n.to_string());
            if let Some(deps) = dependents.get(n) {
                for &dependent in deps {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(dependent);
                        queue.sort();
                    }
                }
            }
        }

        if order.len() != descriptors.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(ServiceError::DependencyCycle(stuck.join(", ")));
        }

        Ok(order)
    }

    /// Kahn's algorithm; returns names in dependency-first order, or an
    /// error if a cycle or unknown dependency is detected.
    async fn topo_order(&self) -> Result<Vec<String>, ServiceError> {
        let descriptors = self.descriptors.read().await;
        let names: HashSet<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();

        for d in descriptors.iter() {
            for dep in &d.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(ServiceError::UnknownDependency {
                        service: d.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> =
            descriptors.iter().map(|d| (d.name.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> =
            descriptors.iter().map(|d| (d.name.as_str(), Vec::new())).collect();

        for d in descriptors.iter() {
            for dep in &d.dependencies {
                *in_degree.get_mut(d.name.as_str()).unwrap() += 1;
                dependents.get_mut(dep.as_str()).unwrap().push(d.name.as_str());
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&n, _)| n)
            .collect();
        queue.sort();

        let mut order = Vec::with_capacity(descriptors.len());
        while let Some(n) = queue.pop() {
            order.push(n.to_string());
            if let Some(deps) = dependents.get(n) {
                for &dependent in deps {
                    let deg = in_degree.get_mut(dependent).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(dependent);
                        queue.sort();
                    }
                }
            }
        }

        if order.len() != descriptors.len() {
            let stuck: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(ServiceError::DependencyCycle(stuck.join(", ")));
        }

        Ok(order)
    }

    async fn set_state(&self, name: &str, state: ServiceState) {
        {
            let mut descriptors = self.descriptors.write().await;
            if let Some(d) = descriptors.iter_mut().find(|d| d.name == name) {
                d.state = state;
            }
        }
        self.bus
            .publish(Event::new(
                EventPayload::ServiceStateChanged {
                    service: name.to_string(),
                    state: state.as_str().to_string(),
                },
                "service_registry",
            ))
            .await;
    }

    pub async fn initialize_all(&self) -> Result<(), ServiceError> {
        let order = self.topo_order().await?;
        for name in &order {
            let instance = {
                let descriptors = self.descriptors.read().await;
                descriptors.iter().find(|d| &d.name == name).unwrap().instance.clone()
            };
            self.set_state(name, ServiceState::Initializing).await;
            if let Err(e) = instance.initialize().await {
                self.set_state(name, ServiceState::Failed).await;
                error!(service = %name, error = %e, "service initialization failed");
                return Err(ServiceError::InitFailed(name.clone(), e));
            }
            self.set_state(name, ServiceState::Initialized).await;
        }
        Ok(())
    }

    /// Starts services in topological order. On failure, halts and tears
    /// down already-started services in reverse order.
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        let order = self.topo_order().await?;
        let mut started = Vec::new();
        for name in &order {
            let instance = {
                let descriptors = self.descriptors.read().await;
                descriptors.iter().find(|d| &d.name == name).unwrap().instance.clone()
            };
            self.set_state(name, ServiceState::Starting).await;
            match instance.start().await {
                Ok(()) => {
                    self.set_state(name, ServiceState::Running).await;
                    started.push(name.clone());
                }
                Err(e) => {
                    self.set_state(name, ServiceState::Failed).await;
                    error!(service = %name, error = %e, "service start failed, tearing down");
                    for prior in started.iter().rev() {
                        let _ = self.stop_one(prior).await;
                    }
                    return Err(ServiceError::StartFailed(name.clone(), e));
                }
            }
        }
        info!("all services started");
        Ok(())
    }

    async fn stop_one(&self, name: &str) -> Result<(), ServiceError> {
        let (instance, current_state) = {
            let descriptors = self.descriptors.read().await;
            let d = descriptors.iter().find(|d| d.name == name).unwrap();
            (d.instance.clone(), d.state)
        };
        if current_state == ServiceState::Stopped {
            return Ok(()); // idempotent
        }
        self.set_state(name, ServiceState::Stopping).await;
        match instance.stop().await {
            Ok(()) => {
                self.set_state(name, ServiceState::Stopped).await;
                Ok(())
            }
            Err(e) => {
                self.set_state(name, ServiceState::Failed).await;
                Err(ServiceError::StartFailed(name.to_string(), e))
            }
        }
    }

    pub async fn stop_all(&self) -> Result<(), ServiceError> {
        let order = self.topo_order().await?;
        for name in order.iter().rev() {
            self.stop_one(name).await?;
        }
        Ok(())
    }

    pub async fn state_of(&self, name: &str) -> Option<ServiceState> {
        self.descriptors
            .read()
            .await
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Dummy {
        start_order: Arc<std::sync::Mutex<Vec<String>>>,
        name: String,
        fail_start: bool,
    }

    #[async_trait]
    impl Service for Dummy {
        async fn start(&self) -> Result<(), String> {
            if self.fail_start {
                return Err("boom".into());
            }
            self.start_order.lock().unwrap().push(self.name.clone());
            Ok(())
        }
        async fn stop(&self) -> Result<(), String> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn starts_in_dependency_order() {
        let bus = EventBus::new();
        let registry = ServiceRegistry::new(bus);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        registry
            .register(
                "a",
                Arc::new(Dummy { start_order: order.clone(), name: "a".into(), fail_start: false }),
                vec![],
            )
            .await
            .unwrap();
        registry
            .register(
                "b",
                Arc::new(Dummy { start_order: order.clone(), name: "b".into(), fail_start: false }),
                vec!["a".to_string()],
            )
            .await
            .unwrap();

        registry.initialize_all().await.unwrap();
        registry.start_all().await.unwrap();

        let got = order.lock().unwrap().clone();
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn rejects_cycle_at_registration_time() {
        let bus = EventBus::new();
        let registry = ServiceRegistry::new(bus);
        registry
            .register(
                "a",
                Arc::new(Dummy { start_order: Arc::new(std::sync::Mutex::new(vec![])), name: "a".into(), fail_start: false }),
                vec!["b".to_string()],
            )
            .await
            .unwrap();
        let result = registry
            .register(
                "b",
                Arc::new(Dummy { start_order: Arc::new(std::sync::Mutex::new(vec![])), name: "b".into(), fail_start: false }),
                vec!["a".to_string()],
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn detects_unknown_dependency() {
        let bus = EventBus::new();
        let registry = ServiceRegistry::new(bus);
        registry
            .register(
                "a",
                Arc::new(Dummy { start_order: Arc::new(std::sync::Mutex::new(vec![])), name: "a".into(), fail_start: false }),
                vec!["ghost".to_string()],
            )
            .await
            .unwrap();
        assert!(registry.start_all().await.is_err());
    }

    #[tokio::test]
    async fn reverse_teardown_on_start_failure() {
        let bus = EventBus::new();
        let registry = ServiceRegistry::new(bus);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let stopped = Arc::new(AtomicUsize::new(0));

        struct Stoppable {
            stopped: Arc<AtomicUsize>,
        }
        #[async_trait]
        impl Service for Stoppable {
            async fn start(&self) -> Result<(), String> {
                Ok(())
            }
            async fn stop(&self) -> Result<(), String> {
                self.stopped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        registry
            .register("a", Arc::new(Stoppable { stopped: stopped.clone() }), vec![])
            .await
            .unwrap();
        registry
            .register(
                "b",
                Arc::new(Dummy { start_order: order.clone(), name: "b".into(), fail_start: true }),
                vec!["a".to_string()],
            )
            .await
            .unwrap();

        let result = registry.start_all().await;
        assert!(result.is_err());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
