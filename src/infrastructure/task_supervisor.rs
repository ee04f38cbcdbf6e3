//! Managed background tasks with restart/backoff (§4.3).

use crate::domain::events::{Event, EventPayload};
use crate::infrastructure::event_bus::EventBus;
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone)]
pub struct TaskConfig {
    pub name: String,
    pub func: TaskFn,
    /// `None` = one-shot, run once at start. `Some(d)` = run at a fixed
    /// cadence; overlapping runs are disallowed.
    pub interval: Option<Duration>,
    pub priority: TaskPriority,
    pub timeout: Duration,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub group: Option<String>,
}

struct TaskHandle {
    config: TaskConfig,
    state: std::sync::Mutex<TaskState>,
    restarts: AtomicU32,
    last_heartbeat_ms: AtomicU64,
    join: std::sync::Mutex<Option<JoinHandle<()>>>,
    cancel: Arc<tokio::sync::Notify>,
    cancelled: std::sync::atomic::AtomicBool,
}

pub struct TaskSupervisor {
    bus: EventBus,
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
    health_period: Duration,
}

impl TaskSupervisor {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            tasks: RwLock::new(HashMap::new()),
            health_period: Duration::from_secs(10),
        }
    }

    pub fn with_health_period(mut self, period: Duration) -> Self {
        self.health_period = period;
        self
    }

    pub async fn spawn(&self, config: TaskConfig) {
        let name = config.name.clone();
        let handle = Arc::new(TaskHandle {
            config,
            state: std::sync::Mutex::new(TaskState::Pending),
            restarts: AtomicU32::new(0),
            last_heartbeat_ms: AtomicU64::new(now_ms()),
            join: std::sync::Mutex::new(None),
            cancel: Arc::new(tokio::sync::Notify::new()),
            cancelled: std::sync::atomic::AtomicBool::new(false),
        });

        self.tasks.write().await.insert(name.clone(), handle.clone());
        let bus = self.bus.clone();
        let join = tokio::spawn(run_task_loop(bus, handle.clone()));
        *handle.join.lock().unwrap() = Some(join);
    }

    pub async fn cancel(&self, name: &str) {
        if let Some(handle) = self.tasks.read().await.get(name) {
            handle.cancelled.store(true, Ordering::SeqCst);
            handle.cancel.notify_waiters();
            *handle.state.lock().unwrap() = TaskState::Canceled;
        }
    }

    pub async fn cancel_group(&self, group: &str) {
        let tasks = self.tasks.read().await;
        for handle in tasks.values() {
            if handle.config.group.as_deref() == Some(group) {
                handle.cancelled.store(true, Ordering::SeqCst);
                handle.cancel.notify_waiters();
                *handle.state.lock().unwrap() = TaskState::Canceled;
            }
        }
    }

    pub async fn state_of(&self, name: &str) -> Option<TaskState> {
        let tasks = self.tasks.read().await;
        tasks.get(name).map(|h| *h.state.lock().unwrap())
    }

    pub async fn restarts_of(&self, name: &str) -> Option<u32> {
        let tasks = self.tasks.read().await;
        tasks.get(name).map(|h| h.restarts.load(Ordering::Relaxed))
    }

    /// Verifies interval-tasks produced a heartbeat within `3*interval`;
    /// force-restarts stale ones. Intended to be driven by a periodic
    /// caller (e.g. a one-shot supervisor task of its own).
    pub async fn run_health_check_once(&self) {
        let now = now_ms();
        let stale: Vec<Arc<TaskHandle>> = {
            let tasks = self.tasks.read().await;
            tasks
                .values()
                .filter(|h| {
                    if let Some(interval) = h.config.interval {
                        let limit = 3 * interval.as_millis() as u64;
                        let last = h.last_heartbeat_ms.load(Ordering::Relaxed);
                        *h.state.lock().unwrap() == TaskState::Running && now.saturating_sub(last) > limit
                    } else {
                        false
                    }
                })
                .cloned()
                .collect()
        };
        for handle in stale {
            warn!(task = %handle.config.name, "health monitor: stale task, forcing restart");
            handle.cancel.notify_waiters();
        }
    }

    pub fn health_period(&self) -> Duration {
        self.health_period
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

async fn run_task_loop(bus: EventBus, handle: Arc<TaskHandle>) {
    loop {
        if handle.cancelled.load(Ordering::SeqCst) {
            return;
        }
        *handle.state.lock().unwrap() = TaskState::Running;
        handle.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);

        let fut = (handle.config.func)();
        let outcome: Result<Result<(), String>, ()> = tokio::select! {
            result = tokio::time::timeout(handle.config.timeout, fut) => {
                result.map_err(|_| ())
            }
            _ = handle.cancel.notified() => {
                if handle.cancelled.load(Ordering::SeqCst) {
                    *handle.state.lock().unwrap() = TaskState::Canceled;
                    return;
                }
                Err(())
            }
        };
        handle.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {
                *handle.state.lock().unwrap() = TaskState::Succeeded;
                if handle.config.interval.is_none() {
                    return;
                }
            }
            Ok(Err(reason)) => {
                warn!(task = %handle.config.name, %reason, "task failed");
                if !attempt_restart(&bus, &handle).await {
                    return;
                }
                continue;
            }
            Err(()) => {
                warn!(task = %handle.config.name, "task timed out or was force-restarted");
                if !attempt_restart(&bus, &handle).await {
                    return;
                }
                continue;
            }
        }

        match handle.config.interval {
            Some(interval) => {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = handle.cancel.notified() => {
                        if handle.cancelled.load(Ordering::SeqCst) {
                            *handle.state.lock().unwrap() = TaskState::Canceled;
                            return;
                        }
                    }
                }
            }
            None => return,
        }
    }
}

/// Returns true if the task loop should continue (a restart was
/// scheduled), false if the task has terminated for good.
async fn attempt_restart(bus: &EventBus, handle: &Arc<TaskHandle>) -> bool {
    *handle.state.lock().unwrap() = TaskState::Failed;

    if !handle.config.restart_on_failure {
        return false;
    }
    let restarts = handle.restarts.fetch_add(1, Ordering::SeqCst) + 1;
    if restarts > handle.config.max_restarts {
        bus.publish(Event::new(
            EventPayload::TaskRestarted {
                task: handle.config.name.clone(),
                attempt: restarts,
                r#final: true,
            },
            "task_supervisor",
        ))
        .await;
        return false;
    }

    let backoff = backoff_with_jitter(
        handle.config.backoff_base_ms,
        handle.config.backoff_cap_ms,
        restarts - 1,
    );
    bus.publish(Event::new(
        EventPayload::TaskRestarted {
            task: handle.config.name.clone(),
            attempt: restarts,
            r#final: false,
        },
        "task_supervisor",
    ))
    .await;
    info!(task = %handle.config.name, attempt = restarts, backoff_ms = backoff.as_millis() as u64, "restarting task after backoff");

    tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        _ = handle.cancel.notified() => {
            if handle.cancelled.load(Ordering::SeqCst) {
                return false;
            }
        }
    }
    true
}

fn backoff_with_jitter(base_ms: u64, cap_ms: u64, exponent: u32) -> Duration {
    let raw = base_ms.saturating_mul(1u64 << exponent.min(32)).min(cap_ms);
    let jitter_frac = rand::rng().random_range(-0.2..=0.2);
    let jittered = (raw as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(name: &str, func: TaskFn) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            func,
            interval: None,
            priority: TaskPriority::Medium,
            timeout: Duration::from_secs(5),
            restart_on_failure: true,
            max_restarts: 3,
            backoff_base_ms: 10,
            backoff_cap_ms: 1000,
            group: None,
        }
    }

    #[tokio::test]
    async fn one_shot_task_succeeds() {
        let bus = EventBus::new();
        let sup = TaskSupervisor::new(bus);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let cfg = config(
            "warmup",
            Arc::new(move || {
                let ran = ran2.clone();
                Box::pin(async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        sup.spawn(cfg).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(sup.state_of("warmup").await, Some(TaskState::Succeeded));
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let bus = EventBus::new();
        let sup = TaskSupervisor::new(bus);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let mut cfg = config(
            "flaky",
            Arc::new(move || {
                let attempts = attempts2.clone();
                Box::pin(async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("network error".to_string())
                    } else {
                        Ok(())
                    }
                })
            }),
        );
        cfg.backoff_base_ms = 5;
        cfg.backoff_cap_ms = 20;
        sup.spawn(cfg).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(sup.state_of("flaky").await, Some(TaskState::Succeeded));
    }

    #[tokio::test]
    async fn exhausts_restarts_and_terminates() {
        let bus = EventBus::new();
        let sup = TaskSupervisor::new(bus);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let mut cfg = config(
            "always_fails",
            Arc::new(move || {
                let attempts = attempts2.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                })
            }),
        );
        cfg.max_restarts = 2;
        cfg.backoff_base_ms = 2;
        cfg.backoff_cap_ms = 10;
        sup.spawn(cfg).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 restarts
        assert_eq!(sup.state_of("always_fails").await, Some(TaskState::Failed));
    }
}
