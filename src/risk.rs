use crate::orders::Side;
use crate::utils::epoch_secs;
use serde::Serialize;
use std::sync::Mutex;
use tracing::warn;

/// Net position as last reported by the exchange.
#[derive(Debug, Clone, Serialize)]
pub struct Position {
    /// Net size in base asset, positive = long.
    pub size: f64,
    pub avg_entry: f64,
    /// abs(size) * mark price.
    pub notional: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub last_update: f64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            size: 0.0,
            avg_entry: 0.0,
            notional: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            last_update: epoch_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStatus {
    pub position: Position,
    pub max_position: f64,
    pub max_notional: f64,
    pub position_utilization_pct: f64,
    pub notional_utilization_pct: f64,
}

/// Refuses placements that would push the net position past the configured
/// ceilings. Limits are passed in from the tick's config snapshot so the
/// check always agrees with the quote it guards.
#[derive(Default)]
pub struct RiskManager {
    position: Mutex<Position>,
}

impl RiskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_position(
        &self,
        size: f64,
        avg_entry: f64,
        mark_price: f64,
        unrealized_pnl: f64,
        realized_pnl: f64,
    ) {
        let mut pos = self.position.lock().unwrap();
        pos.size = size;
        pos.avg_entry = avg_entry;
        pos.notional = size.abs() * mark_price;
        pos.unrealized_pnl = unrealized_pnl;
        pos.realized_pnl = realized_pnl;
        pos.last_update = epoch_secs();
    }

    pub fn position_size(&self) -> f64 {
        self.position.lock().unwrap().size
    }

    /// Would filling this order keep the position inside the limits?
    pub fn check_can_place_order(
        &self,
        side: Side,
        size: f64,
        price: f64,
        max_position: f64,
        max_notional: f64,
    ) -> bool {
        let current = self.position.lock().unwrap().size;
        let resulting = match side {
            Side::Buy => current + size,
            Side::Sell => current - size,
        };

        if resulting.abs() > max_position {
            warn!(
                current,
                order_side = side.as_str(),
                order_size = size,
                resulting,
                limit = max_position,
                "position limit would be exceeded"
            );
            return false;
        }

        let resulting_notional = resulting.abs() * price;
        if resulting_notional > max_notional {
            warn!(
                resulting_notional,
                limit = max_notional,
                "notional limit would be exceeded"
            );
            return false;
        }

        true
    }

    /// True when notional utilization passes 90%.
    pub fn should_reduce_only(&self, max_notional: f64) -> bool {
        if max_notional <= 0.0 {
            return false;
        }
        self.position.lock().unwrap().notional / max_notional > 0.9
    }

    pub fn status(&self, max_position: f64, max_notional: f64) -> RiskStatus {
        let position = self.position.lock().unwrap().clone();
        RiskStatus {
            position_utilization_pct: if max_position > 0.0 {
                position.size.abs() / max_position * 100.0
            } else {
                0.0
            },
            notional_utilization_pct: if max_notional > 0.0 {
                position.notional / max_notional * 100.0
            } else {
                0.0
            },
            position,
            max_position,
            max_notional,
        }
    }
}
