use crate::errors::ConfigError;
use crate::instrument::Symbol;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Fixed after startup: endpoints only. Credentials live in [`crate::auth`],
/// tick tables in [`crate::instrument`].
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base: String,
    pub ws_url: String,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            api_base: env::var("STANDX_API_BASE")
                .unwrap_or_else(|_| "https://perps.standx.com".to_string()),
            ws_url: env::var("STANDX_WS_URL")
                .unwrap_or_else(|_| "wss://perps.standx.com/ws-stream/v1".to_string()),
        }
    }
}

/// Runtime tunables. Each engine tick clones one snapshot up front and runs
/// against that stable view; writes go through [`SharedConfig::apply`].
#[derive(Debug, Clone, Serialize)]
pub struct Tunables {
    pub symbol: Symbol,
    pub spread_bps: f64,
    pub bid_notional: f64,
    pub ask_notional: f64,
    /// Re-quote when a resting order drifts this many bps of mid from target.
    pub requote_threshold_bps: f64,
    pub refresh_interval: f64,
    pub stale_order_seconds: f64,
    pub max_spread_deviation_bps: f64,
    pub proximity_guard_bps: f64,
    pub max_consecutive_failures: u32,
    pub max_notional: f64,
    pub max_position: f64,
    pub auto_close_fills: bool,
    pub inventory_skew: bool,
    pub skew_factor_bps: f64,
    pub tp_bps: f64,
    pub sl_bps: f64,
    pub uptime_target_minutes: u64,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::BadEnvValue(key.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::BadEnvValue(key.to_string(), raw)),
        },
        Err(_) => Ok(default),
    }
}

impl Tunables {
    pub fn from_env() -> Result<Self, ConfigError> {
        let symbol_raw = env::var("SYMBOL").unwrap_or_else(|_| "BTC-USD".to_string());
        let symbol = symbol_raw
            .parse::<Symbol>()
            .map_err(ConfigError::UnsupportedSymbol)?;

        Ok(Self {
            symbol,
            spread_bps: env_parse("SPREAD_BPS", 50.0)?,
            bid_notional: env_parse("BID_NOTIONAL", 30.0)?,
            ask_notional: env_parse("ASK_NOTIONAL", 30.0)?,
            requote_threshold_bps: env_parse("REQUOTE_THRESHOLD_BPS", 25.0)?,
            refresh_interval: env_parse("REFRESH_INTERVAL", 1.0)?,
            stale_order_seconds: env_parse("STALE_ORDER_SECONDS", 30.0)?,
            max_spread_deviation_bps: env_parse("MAX_SPREAD_DEVIATION_BPS", 200.0)?,
            proximity_guard_bps: env_parse("PROXIMITY_GUARD_BPS", 1.0)?,
            max_consecutive_failures: env_parse("MAX_CONSECUTIVE_FAILURES", 5)?,
            max_notional: env_parse("MAX_NOTIONAL", 10_000.0)?,
            max_position: env_parse("MAX_POSITION", 1.0)?,
            auto_close_fills: env_bool("AUTO_CLOSE_FILLS", true)?,
            inventory_skew: env_bool("INVENTORY_SKEW", false)?,
            skew_factor_bps: env_parse("SKEW_FACTOR_BPS", 0.0)?,
            tp_bps: env_parse("TP_BPS", 0.0)?,
            sl_bps: env_parse("SL_BPS", 0.0)?,
            uptime_target_minutes: env_parse("UPTIME_TARGET_MINUTES", 30)?,
        })
    }

    pub fn uptime_target_seconds(&self) -> f64 {
        self.uptime_target_minutes as f64 * 60.0
    }
}

/// Patch accepted by `POST /api/config`. Only runtime-writable fields; a
/// symbol change additionally runs the switch barrier in the API layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub symbol: Option<Symbol>,
    pub spread_bps: Option<f64>,
    pub bid_notional: Option<f64>,
    pub ask_notional: Option<f64>,
    pub requote_threshold_bps: Option<f64>,
    pub refresh_interval: Option<f64>,
    pub tp_bps: Option<f64>,
    pub sl_bps: Option<f64>,
    pub auto_close_fills: Option<bool>,
    pub inventory_skew: Option<bool>,
    pub skew_factor_bps: Option<f64>,
}

impl ConfigUpdate {
    pub fn is_empty(&self) -> bool {
        self.symbol.is_none()
            && self.spread_bps.is_none()
            && self.bid_notional.is_none()
            && self.ask_notional.is_none()
            && self.requote_threshold_bps.is_none()
            && self.refresh_interval.is_none()
            && self.tp_bps.is_none()
            && self.sl_bps.is_none()
            && self.auto_close_fills.is_none()
            && self.inventory_skew.is_none()
            && self.skew_factor_bps.is_none()
    }
}

/// Range checks for a patch, separate from the write so the config route
/// can reject bad input before it starts tearing the engine down.
pub fn validate_update(update: &ConfigUpdate) -> Result<(), ConfigError> {
    fn positive(name: &'static str, v: f64) -> Result<(), ConfigError> {
        if v > 0.0 && v.is_finite() {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange(name, v))
        }
    }
    fn non_negative(name: &'static str, v: f64) -> Result<(), ConfigError> {
        if v >= 0.0 && v.is_finite() {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange(name, v))
        }
    }

    if let Some(v) = update.spread_bps {
        positive("spread_bps", v)?;
    }
    if let Some(v) = update.bid_notional {
        positive("bid_notional", v)?;
    }
    if let Some(v) = update.ask_notional {
        positive("ask_notional", v)?;
    }
    if let Some(v) = update.requote_threshold_bps {
        non_negative("requote_threshold_bps", v)?;
    }
    if let Some(v) = update.refresh_interval {
        positive("refresh_interval", v)?;
    }
    if let Some(v) = update.tp_bps {
        non_negative("tp_bps", v)?;
    }
    if let Some(v) = update.sl_bps {
        non_negative("sl_bps", v)?;
    }
    if let Some(v) = update.skew_factor_bps {
        non_negative("skew_factor_bps", v)?;
    }
    Ok(())
}

/// Shared handle to the tunables: cheap cloned snapshots for readers,
/// validated whole-field writes for the config route.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Tunables>>,
}

impl SharedConfig {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: Arc::new(RwLock::new(tunables)),
        }
    }

    /// Stable view for one tick.
    pub fn snapshot(&self) -> Tunables {
        self.inner.read().unwrap().clone()
    }

    pub fn symbol(&self) -> Symbol {
        self.inner.read().unwrap().symbol
    }

    /// Validate and apply a patch. Returns the list of field names written.
    pub fn apply(&self, update: &ConfigUpdate) -> Result<Vec<&'static str>, ConfigError> {
        validate_update(update)?;

        let mut cfg = self.inner.write().unwrap();
        let mut written = Vec::new();
        if let Some(v) = update.symbol {
            cfg.symbol = v;
            written.push("symbol");
        }
        if let Some(v) = update.spread_bps {
            cfg.spread_bps = v;
            written.push("spread_bps");
        }
        if let Some(v) = update.bid_notional {
            cfg.bid_notional = v;
            written.push("bid_notional");
        }
        if let Some(v) = update.ask_notional {
            cfg.ask_notional = v;
            written.push("ask_notional");
        }
        if let Some(v) = update.requote_threshold_bps {
            cfg.requote_threshold_bps = v;
            written.push("requote_threshold_bps");
        }
        if let Some(v) = update.refresh_interval {
            cfg.refresh_interval = v;
            written.push("refresh_interval");
        }
        if let Some(v) = update.tp_bps {
            cfg.tp_bps = v;
            written.push("tp_bps");
        }
        if let Some(v) = update.sl_bps {
            cfg.sl_bps = v;
            written.push("sl_bps");
        }
        if let Some(v) = update.auto_close_fills {
            cfg.auto_close_fills = v;
            written.push("auto_close_fills");
        }
        if let Some(v) = update.inventory_skew {
            cfg.inventory_skew = v;
            written.push("inventory_skew");
        }
        if let Some(v) = update.skew_factor_bps {
            cfg.skew_factor_bps = v;
            written.push("skew_factor_bps");
        }
        Ok(written)
    }
}
