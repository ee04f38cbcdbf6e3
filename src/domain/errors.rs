use thiserror::Error;

/// The four error kinds from the error-handling design: transient errors
/// are retried with backoff, invalid errors reject the triggering signal
/// or config change, fatal errors cascade through the service registry,
/// degraded errors let the component continue with reduced functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Invalid,
    Fatal,
    Degraded,
}

/// Errors surfaced by an `ExchangeGateway` implementation.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by exchange: {0}")]
    RejectedByExchange(String),
    #[error("invalid payload: {0}")]
    Invalid(String),
}

impl GatewayError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        GatewayError::Invalid(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Network(_) | GatewayError::RateLimited { .. } => ErrorKind::Transient,
            GatewayError::Auth(_) => ErrorKind::Fatal,
            GatewayError::NotFound(_) | GatewayError::Invalid(_) => ErrorKind::Invalid,
            GatewayError::RejectedByExchange(_) => ErrorKind::Invalid,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("unknown subscription token")]
    UnknownSubscription,
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("dependency cycle detected involving service '{0}'")]
    DependencyCycle(String),
    #[error("unknown dependency '{dependency}' for service '{service}'")]
    UnknownDependency { service: String, dependency: String },
    #[error("service '{0}' failed to initialize: {1}")]
    InitFailed(String, String),
    #[error("service '{0}' failed to start: {1}")]
    StartFailed(String, String),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{0}' timed out")]
    Timeout(String),
    #[error("task '{0}' exhausted {1} restart attempts")]
    RestartsExhausted(String, u32),
    #[error("task '{0}' was cancelled")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("risk_per_trade_percent must be in (0,10], got {0}")]
    RiskPerTradeOutOfRange(f64),
    #[error("default_leverage must be in [1,125], got {0}")]
    LeverageOutOfRange(u32),
    #[error("max_position_size_usdt must be > 0, got {0}")]
    InvalidMaxPositionSize(rust_decimal::Decimal),
    #[error("unknown symbol '{0}'")]
    UnknownSymbol(String),
    #[error("invalid timeframe token '{0}'")]
    InvalidTimeframe(String),
    #[error("switching binance.testnet is blocked while positions are open")]
    SwitchBlocked,
    #[error("unknown config section '{0}'")]
    UnknownSection(String),
    #[error("no history to roll back to")]
    NoHistory,
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("warm-up failed for stream keys: {0:?}")]
    WarmupFailed(Vec<String>),
    #[error("symbol '{0}' is not known to the gateway")]
    UnknownSymbol(String),
    #[error("warm-up timed out after {0:?}")]
    Timeout(std::time::Duration),
}
