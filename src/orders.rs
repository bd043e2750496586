use crate::utils::epoch_secs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,  //bid
    Sell, //ask
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn flip(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Shadow-order lifecycle. `Open -> Cancelled` on an acknowledged cancel,
/// `Open -> Gone` when the exchange says the order no longer exists; an
/// entry never returns to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Cancelled,
    Gone,
}

/// Local shadow of one resting order the engine believes it owns.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOrder {
    pub order_id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub placed_at: f64,
    pub status: OrderStatus,
}

impl ActiveOrder {
    pub fn new(order_id: String, side: Side, price: f64, size: f64) -> Self {
        Self {
            order_id,
            side,
            price,
            size,
            placed_at: epoch_secs(),
            status: OrderStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    pub fn age_seconds(&self, now: f64) -> f64 {
        (now - self.placed_at).max(0.0)
    }

    pub fn is_stale(&self, max_age: f64, now: f64) -> bool {
        self.age_seconds(now) > max_age
    }

    /// Distance from `target` in bps of mid.
    pub fn drift_bps(&self, target: f64, mid: f64) -> f64 {
        if mid == 0.0 {
            return 0.0;
        }
        (self.price - target).abs() / mid * 10_000.0
    }
}
