//! Versioned runtime configuration with rollback (§4.4).

use crate::domain::errors::ConfigError;
use crate::domain::events::{Event, EventPayload};
use crate::domain::settings::Settings;
use crate::infrastructure::event_bus::EventBus;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

const DEFAULT_HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Binance,
    Trading,
    Strategy,
    Ict,
    Market,
}

impl ConfigSection {
    fn name(&self) -> &'static str {
        match self {
            ConfigSection::Binance => "binance",
            ConfigSection::Trading => "trading",
            ConfigSection::Strategy => "strategy",
            ConfigSection::Ict => "ict",
            ConfigSection::Market => "market",
        }
    }
}

/// A partial update to one section. Each field is `None` when left
/// unchanged by this patch.
#[derive(Debug, Clone, Default)]
pub struct TradingPatch {
    pub mode: Option<crate::domain::settings::TradingMode>,
    pub default_leverage: Option<u32>,
    pub max_position_size_usdt: Option<Decimal>,
    pub risk_per_trade_percent: Option<f64>,
    pub daily_loss_limit_usdt: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct BinancePatch {
    pub testnet: Option<bool>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub ip_whitelist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyPatch {
    pub enable_1: Option<bool>,
    pub enable_2: Option<bool>,
    pub enable_3: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct IctPatch {
    pub fvg_min_size_percent: Option<f64>,
    pub ob_lookback_periods: Option<usize>,
    pub liquidity_sweep_threshold: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct MarketPatch {
    pub active_symbols: Option<Vec<String>>,
    pub primary_timeframe: Option<crate::domain::types::Timeframe>,
    pub higher_timeframe: Option<crate::domain::types::Timeframe>,
    pub lower_timeframe: Option<crate::domain::types::Timeframe>,
}

#[derive(Debug, Clone)]
pub enum Patch {
    Binance(BinancePatch),
    Trading(TradingPatch),
    Strategy(StrategyPatch),
    Ict(IctPatch),
    Market(MarketPatch),
}

impl Patch {
    fn section(&self) -> ConfigSection {
        match self {
            Patch::Binance(_) => ConfigSection::Binance,
            Patch::Trading(_) => ConfigSection::Trading,
            Patch::Strategy(_) => ConfigSection::Strategy,
            Patch::Ict(_) => ConfigSection::Ict,
            Patch::Market(_) => ConfigSection::Market,
        }
    }
}

struct State {
    current: Settings,
    history: Vec<Settings>,
    version: u64,
    has_open_position: bool,
    /// How many steps the current state has already been rolled back by,
    /// relative to the history built up by real `update()` calls. Reset
    /// to 0 by `update`. Lets a chain of rollbacks (`rollback(1)` then
    /// `rollback(2)`) resolve `steps` against the same history each time
    /// instead of the previous call's already-truncated remainder.
    rolled_back_depth: usize,
}

/// Known symbols are validated against this set. In production this would
/// be backed by the gateway's instrument list; the core only needs a
/// pluggable predicate.
pub struct ConfigStore {
    bus: EventBus,
    state: RwLock<State>,
    history_capacity: usize,
    known_symbol: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl ConfigStore {
    pub fn new(initial: Settings, bus: EventBus) -> Self {
        Self {
            bus,
            state: RwLock::new(State {
                current: initial,
                history: Vec::new(),
                version: 0,
                has_open_position: false,
                rolled_back_depth: 0,
            }),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            known_symbol: Box::new(|_| true),
        }
    }

    pub fn with_known_symbol_predicate(mut self, pred: Box<dyn Fn(&str) -> bool + Send + Sync>) -> Self {
        self.known_symbol = pred;
        self
    }

    pub async fn snapshot(&self) -> Settings {
        self.state.read().await.current.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    /// Informs the store whether any position is currently open, needed to
    /// enforce the `SwitchBlocked` rule on `binance.testnet` changes.
    pub async fn set_has_open_position(&self, open: bool) {
        self.state.write().await.has_open_position = open;
    }

    fn validate_patch(&self, settings: &Settings, patch: &Patch) -> Result<(), ConfigError> {
        match patch {
            Patch::Trading(p) => {
                if let Some(r) = p.risk_per_trade_percent {
                    if !(0.0 < r && r <= 10.0) {
                        return Err(ConfigError::RiskPerTradeOutOfRange(r));
                    }
                }
                if let Some(l) = p.default_leverage {
                    if !(1..=125).contains(&l) {
                        return Err(ConfigError::LeverageOutOfRange(l));
                    }
                }
                if let Some(m) = p.max_position_size_usdt {
                    if m <= Decimal::ZERO {
                        return Err(ConfigError::InvalidMaxPositionSize(m));
                    }
                }
            }
            Patch::Market(p) => {
                if let Some(symbols) = &p.active_symbols {
                    for s in symbols {
                        if !(self.known_symbol)(s) {
                            return Err(ConfigError::UnknownSymbol(s.clone()));
                        }
                    }
                }
            }
            // binance.testnet's SwitchBlocked rule needs `has_open_position`,
            // which is only available with the state lock held; checked in
            // `update` itself rather than here.
            Patch::Binance(_) | Patch::Strategy(_) | Patch::Ict(_) => {}
        }
        Ok(())
    }

    fn apply(settings: &mut Settings, patch: &Patch) {
        match patch {
            Patch::Binance(p) => {
                if let Some(v) = p.testnet {
                    settings.binance.testnet = v;
                }
                if let Some(v) = &p.api_key {
                    settings.binance.api_key = v.clone();
                }
                if let Some(v) = &p.api_secret {
                    settings.binance.api_secret = v.clone();
                }
                if let Some(v) = &p.ip_whitelist {
                    settings.binance.ip_whitelist = v.clone();
                }
            }
            Patch::Trading(p) => {
                if let Some(v) = p.mode {
                    settings.trading.mode = v;
                }
                if let Some(v) = p.default_leverage {
                    settings.trading.default_leverage = v;
                }
                if let Some(v) = p.max_position_size_usdt {
                    settings.trading.max_position_size_usdt = v;
                }
                if let Some(v) = p.risk_per_trade_percent {
                    settings.trading.risk_per_trade_percent = v;
                }
                if let Some(v) = p.daily_loss_limit_usdt {
                    settings.trading.daily_loss_limit_usdt = v;
                }
            }
            Patch::Strategy(p) => {
                if let Some(v) = p.enable_1 {
                    settings.strategy.enable_1 = v;
                }
                if let Some(v) = p.enable_2 {
                    settings.strategy.enable_2 = v;
                }
                if let Some(v) = p.enable_3 {
                    settings.strategy.enable_3 = v;
                }
            }
            Patch::Ict(p) => {
                if let Some(v) = p.fvg_min_size_percent {
                    settings.ict.fvg_min_size_percent = v;
                }
                if let Some(v) = p.ob_lookback_periods {
                    settings.ict.ob_lookback_periods = v;
                }
                if let Some(v) = p.liquidity_sweep_threshold {
                    settings.ict.liquidity_sweep_threshold = v;
                }
            }
            Patch::Market(p) => {
                if let Some(v) = &p.active_symbols {
                    settings.market.active_symbols = v.clone();
                }
                if let Some(v) = p.primary_timeframe {
                    settings.market.primary_timeframe = v;
                }
                if let Some(v) = p.higher_timeframe {
                    settings.market.higher_timeframe = v;
                }
                if let Some(v) = p.lower_timeframe {
                    settings.market.lower_timeframe = v;
                }
            }
        }
    }

    pub async fn update(&self, patch: Patch, validate: bool) -> Result<u64, ConfigError> {
        let mut state = self.state.write().await;

        if validate {
            self.validate_patch(&state.current, &patch)?;
            if let Patch::Binance(p) = &patch {
                if let Some(testnet) = p.testnet {
                    if testnet != state.current.binance.testnet && state.has_open_position {
                        return Err(ConfigError::SwitchBlocked);
                    }
                }
            }
        }

        let previous = state.current.clone();
        let mut next = state.current.clone();
        Self::apply(&mut next, &patch);

        state.history.push(previous);
        if state.history.len() > self.history_capacity {
            state.history.remove(0);
        }
        state.current = next;
        state.version += 1;
        state.rolled_back_depth = 0;
        let version = state.version;
        let section = patch.section().name().to_string();
        drop(state);

        self.bus
            .publish(Event::new(
                EventPayload::ConfigUpdated {
                    subject: section,
                    change_type: "update".to_string(),
                    details: format!("version {version}"),
                    version,
                },
                "config_store",
            ))
            .await;
        Ok(version)
    }

    pub async fn batch_update(&self, patches: Vec<Patch>) -> Result<u64, ConfigError> {
        let mut last = self.state.read().await.version;
        for patch in patches {
            last = self.update(patch, true).await?;
        }
        Ok(last)
    }

    /// Restores the snapshot from `steps` updates ago, atomically. `steps`
    /// is always resolved against the history built up by real `update()`
    /// calls, not against whatever a previous rollback left behind — so a
    /// chain of ever-deeper rollbacks (`rollback(1)`, then `rollback(2)`)
    /// keeps reaching further back instead of running out of history
    /// after the first call. A rollback request that isn't strictly
    /// deeper than the last one is rejected: it would either be a no-op
    /// or ask to move forward, and only `update()` does that.
    pub async fn rollback(&self, steps: usize) -> Result<u64, ConfigError> {
        let mut state = self.state.write().await;
        if steps == 0 || steps <= state.rolled_back_depth || steps > state.history.len() {
            return Err(ConfigError::NoHistory);
        }
        let target_idx = state.history.len() - steps;
        let restored = state.history[target_idx].clone();
        state.current = restored;
        state.version += 1;
        state.rolled_back_depth = steps;
        let version = state.version;
        drop(state);

        self.bus
            .publish(Event::new(
                EventPayload::ConfigUpdated {
                    subject: "rollback".to_string(),
                    change_type: "rollback".to_string(),
                    details: format!("rolled back {steps} step(s)"),
                    version,
                },
                "config_store",
            ))
            .await;
        Ok(version)
    }
}
