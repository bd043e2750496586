//! Two-sided quote generation.
//!
//! Pure pricing: no I/O, no rounding. Tick rounding is applied by the
//! exchange client at submission time.

use crate::config::Tunables;
use serde::Serialize;

/// An immutable two-sided quote derived from one mid reading.
#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub mid: f64,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
    pub bid_half_spread_bps: f64,
    pub ask_half_spread_bps: f64,
    pub total_spread_bps: f64,
    pub skew_bps: Option<f64>,
    pub within_limits: bool,
}

impl Quote {
    /// Deviation of the bid from mid, in bps.
    pub fn bid_deviation_bps(&self) -> f64 {
        if self.mid == 0.0 {
            return 0.0;
        }
        (self.mid - self.bid_price) / self.mid * 10_000.0
    }

    /// Deviation of the ask from mid, in bps.
    pub fn ask_deviation_bps(&self) -> f64 {
        if self.mid == 0.0 {
            return 0.0;
        }
        (self.ask_price - self.mid) / self.mid * 10_000.0
    }
}

/// Price a symmetric (or inventory-skewed) quote around `mid`.
///
/// The skew term widens the side whose fill would grow the position, so
/// flow is biased toward flattening. With the factor at zero the output is
/// identical to the plain symmetric quote.
pub fn generate(mid: f64, cfg: &Tunables, inventory: Option<f64>) -> Quote {
    let skew = match inventory {
        Some(position) if cfg.inventory_skew && cfg.max_position > 0.0 => {
            Some(position / cfg.max_position * cfg.skew_factor_bps)
        }
        _ => None,
    };
    let skew_term = skew.unwrap_or(0.0);

    let bid_half = cfg.spread_bps + skew_term.max(0.0);
    let ask_half = cfg.spread_bps + (-skew_term).max(0.0);

    let bid_price = mid * (1.0 - bid_half / 10_000.0);
    let ask_price = mid * (1.0 + ask_half / 10_000.0);

    let mut quote = Quote {
        mid,
        bid_price,
        bid_size: cfg.bid_notional / mid,
        ask_price,
        ask_size: cfg.ask_notional / mid,
        bid_half_spread_bps: bid_half,
        ask_half_spread_bps: ask_half,
        total_spread_bps: bid_half + ask_half,
        skew_bps: skew,
        within_limits: true,
    };
    quote.within_limits = quote.bid_deviation_bps() <= cfg.max_spread_deviation_bps
        && quote.ask_deviation_bps() <= cfg.max_spread_deviation_bps;
    quote
}
