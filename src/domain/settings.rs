use crate::domain::types::Timeframe;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The recognized configuration sections (§4.4). Replaces the source's
/// open-ended keyword blobs with an explicit record per §9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub binance: BinanceSection,
    pub trading: TradingSection,
    pub strategy: StrategySection,
    pub ict: IctSection,
    pub market: MarketSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceSection {
    pub testnet: bool,
    pub api_key: String,
    pub api_secret: String,
    pub ip_whitelist: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Paper,
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSection {
    pub mode: TradingMode,
    pub default_leverage: u32,
    pub max_position_size_usdt: Decimal,
    pub risk_per_trade_percent: f64,
    pub daily_loss_limit_usdt: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySection {
    pub enable_1: bool,
    pub enable_2: bool,
    pub enable_3: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IctSection {
    pub fvg_min_size_percent: f64,
    pub ob_lookback_periods: usize,
    pub liquidity_sweep_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSection {
    pub active_symbols: Vec<String>,
    pub primary_timeframe: Timeframe,
    pub higher_timeframe: Timeframe,
    pub lower_timeframe: Timeframe,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binance: BinanceSection {
                testnet: true,
                api_key: String::new(),
                api_secret: String::new(),
                ip_whitelist: Vec::new(),
            },
            trading: TradingSection {
                mode: TradingMode::Paper,
                default_leverage: 1,
                max_position_size_usdt: Decimal::new(1000, 0),
                risk_per_trade_percent: 1.0,
                daily_loss_limit_usdt: Decimal::new(500, 0),
            },
            strategy: StrategySection {
                enable_1: true,
                enable_2: false,
                enable_3: false,
            },
            ict: IctSection {
                fvg_min_size_percent: 0.05,
                ob_lookback_periods: 50,
                liquidity_sweep_threshold: 0.001,
            },
            market: MarketSection {
                active_symbols: vec!["BTCUSDT".to_string()],
                primary_timeframe: Timeframe::M5,
                higher_timeframe: Timeframe::H1,
                lower_timeframe: Timeframe::M1,
            },
        }
    }
}

impl Settings {
    /// Loads from a TOML file if present, falling back to defaults, then
    /// applies environment-variable overrides the way `Config::from_env`
    /// does.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(p) if std::path::Path::new(p).exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => Settings::default(),
        };

        if let Ok(symbols) = std::env::var("ACTIVE_SYMBOLS") {
            settings.market.active_symbols =
                symbols.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(testnet) = std::env::var("BINANCE_TESTNET") {
            if let Ok(v) = testnet.parse::<bool>() {
                settings.binance.testnet = v;
            }
        }
        if let Ok(key) = std::env::var("BINANCE_API_KEY") {
            settings.binance.api_key = key;
        }
        if let Ok(secret) = std::env::var("BINANCE_API_SECRET") {
            settings.binance.api_secret = secret;
        }

        Ok(settings)
    }
}
