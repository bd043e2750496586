//! Core quoting engine.
//!
//! One task, one tick at a time: read the book, price a two-sided quote,
//! reconcile the resting orders against it, replenish what is missing and
//! report the result to the uptime accountant. Consecutive raising ticks
//! trip a kill-switch that cancels everything and parks the engine in
//! `Error`.

use crate::config::{SharedConfig, Tunables};
use crate::errors::ExchangeError;
use crate::exchange::{CancelResult, ExchangeApi, PlaceLimit};
use crate::orderbook::{BookMirror, TopOfBook};
use crate::orders::{ActiveOrder, OrderStatus, Side};
use crate::quote::{self, Quote};
use crate::risk::{RiskManager, RiskStatus};
use crate::uptime::{UptimeTracker, UptimeStats};
use crate::utils::epoch_secs;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Stopped,
    Running,
    Error,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderAction {
    Keep,
    ProximityHit,
    Drift,
    Stale,
}

/// Shadow order plus its age, for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOrderView {
    #[serde(flatten)]
    pub order: ActiveOrder,
    pub age_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FullStatus {
    pub status: EngineStatus,
    pub symbol: String,
    pub mid_price: Option<f64>,
    pub market_spread_bps: Option<f64>,
    pub configured_spread_bps: f64,
    pub bid_notional: f64,
    pub ask_notional: f64,
    pub refresh_interval: f64,
    pub active_orders: Vec<ActiveOrderView>,
    pub active_order_count: usize,
    pub last_quote: Option<Quote>,
    pub loop_count: u64,
    pub consecutive_failures: u32,
    pub fills_flattened: u64,
    pub uptime: UptimeStats,
    pub risk: RiskStatus,
}

struct EngineState {
    status: EngineStatus,
    active_orders: HashMap<String, ActiveOrder>,
    consecutive_failures: u32,
    last_quote: Option<Quote>,
    loop_count: u64,
    fills_flattened: u64,
    loop_token: Option<CancellationToken>,
    loop_task: Option<JoinHandle<()>>,
}

/// The quoting engine. Owns the shadow-order map and the failure counter;
/// everything else is an explicit collaborator handed in at construction.
pub struct Engine {
    book: Arc<BookMirror>,
    config: SharedConfig,
    exchange: Arc<dyn ExchangeApi>,
    uptime: Arc<UptimeTracker>,
    risk: Arc<RiskManager>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(
        book: Arc<BookMirror>,
        config: SharedConfig,
        exchange: Arc<dyn ExchangeApi>,
        uptime: Arc<UptimeTracker>,
        risk: Arc<RiskManager>,
    ) -> Self {
        Self {
            book,
            config,
            exchange,
            uptime,
            risk,
            state: Mutex::new(EngineState {
                status: EngineStatus::Stopped,
                active_orders: HashMap::new(),
                consecutive_failures: 0,
                last_quote: None,
                loop_count: 0,
                fills_flattened: 0,
                loop_token: None,
                loop_task: None,
            }),
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.state.lock().unwrap().status
    }

    /// Start the tick loop. Resets the failure counter; a previous loop
    /// (stopped or errored) is torn down first.
    pub async fn start(self: &Arc<Self>) {
        let (old_token, old_task) = {
            let mut state = self.state.lock().unwrap();
            (state.loop_token.take(), state.loop_task.take())
        };
        if let Some(token) = old_token {
            token.cancel();
        }
        if let Some(task) = old_task {
            let _ = task.await;
        }

        let token = CancellationToken::new();
        {
            // flip to running before the task can observe the status
            let mut state = self.state.lock().unwrap();
            state.status = EngineStatus::Running;
            state.consecutive_failures = 0;
            state.loop_token = Some(token.clone());
        }
        let task = tokio::spawn(run_loop(Arc::clone(self), token));
        self.state.lock().unwrap().loop_task = Some(task);
        info!("engine started");
    }

    /// Graceful stop: cancel the loop, wait for the in-flight tick to
    /// finish, then best-effort cancel every resting order.
    pub async fn stop(&self) {
        self.halt(EngineStatus::Stopped).await;
        info!("engine stopped");
    }

    /// Emergency kill: same teardown as stop but the engine stays dead.
    pub async fn kill(&self) {
        warn!("kill switch activated");
        self.halt(EngineStatus::Killed).await;
        info!("engine killed");
    }

    async fn halt(&self, final_status: EngineStatus) {
        let (token, task) = {
            let mut state = self.state.lock().unwrap();
            state.status = final_status;
            (state.loop_token.take(), state.loop_task.take())
        };
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        self.cancel_resting_orders().await;
    }

    /// One loop iteration: run the tick and do the failure accounting.
    /// A no-op once the engine has errored or been killed.
    pub async fn step(&self) {
        if matches!(self.status(), EngineStatus::Error | EngineStatus::Killed) {
            return;
        }
        match self.tick().await {
            Ok(()) => {
                self.state.lock().unwrap().consecutive_failures = 0;
            }
            Err(e) => {
                let (failures, budget_exhausted) = {
                    let mut state = self.state.lock().unwrap();
                    state.consecutive_failures += 1;
                    let max = self.config.snapshot().max_consecutive_failures;
                    let exhausted = state.consecutive_failures >= max;
                    if exhausted {
                        state.status = EngineStatus::Error;
                    }
                    (state.consecutive_failures, exhausted)
                };
                error!(error = %e, consecutive_failures = failures, "tick failed");
                if budget_exhausted {
                    error!(failures, "failure budget exhausted, cancelling all orders");
                    self.cancel_resting_orders().await;
                }
            }
        }
    }

    /// One full pass of the quoting cycle.
    async fn tick(&self) -> Result<(), ExchangeError> {
        let cfg = self.config.snapshot();
        {
            self.state.lock().unwrap().loop_count += 1;
        }

        // 1. position: flatten accidental fills, feed inventory to the skew
        let inventory = self.check_position(&cfg).await;

        // 2. mid
        let Some(top) = self.book.top_of_book() else {
            debug!("no usable mid, inactive tick");
            self.uptime.tick(false, cfg.spread_bps);
            return Ok(());
        };

        // 3. quote
        let quote = quote::generate(top.mid, &cfg, inventory);
        let quote_valid = quote.within_limits;
        {
            self.state.lock().unwrap().last_quote = Some(quote.clone());
        }
        if !quote_valid {
            warn!(
                bid_dev = quote.bid_deviation_bps(),
                ask_dev = quote.ask_deviation_bps(),
                max_dev = cfg.max_spread_deviation_bps,
                "quote exceeds max deviation, inactive tick"
            );
            self.uptime.tick(false, cfg.spread_bps);
            return Ok(());
        }

        // 4. reconcile: any order out of policy refreshes both sides
        let now = epoch_secs();
        let needs_refresh = {
            let state = self.state.lock().unwrap();
            let mut refresh = false;
            for order in state.active_orders.values().filter(|o| o.is_open()) {
                let target = match order.side {
                    Side::Buy => quote.bid_price,
                    Side::Sell => quote.ask_price,
                };
                let action = classify_order(order, target, &top, &cfg, now);
                if action != OrderAction::Keep {
                    info!(
                        order_id = %order.order_id,
                        side = order.side.as_str(),
                        price = order.price,
                        ?action,
                        "order out of policy"
                    );
                    refresh = true;
                }
            }
            refresh
        };

        let (mut has_bid, mut has_ask) = if needs_refresh {
            self.exchange.cancel_all(cfg.symbol).await;
            let mut state = self.state.lock().unwrap();
            state.active_orders.clear();
            (false, false)
        } else {
            let state = self.state.lock().unwrap();
            (
                state
                    .active_orders
                    .values()
                    .any(|o| o.is_open() && o.side == Side::Buy),
                state
                    .active_orders
                    .values()
                    .any(|o| o.is_open() && o.side == Side::Sell),
            )
        };

        // 5. replenish missing sides
        if !has_bid {
            has_bid = self
                .place_side(&cfg, Side::Buy, quote.bid_price, quote.bid_size)
                .await?;
        }
        if !has_ask {
            has_ask = self
                .place_side(&cfg, Side::Sell, quote.ask_price, quote.ask_size)
                .await?;
        }

        // 6. account the tick at the configured spread
        let has_both = has_bid && has_ask;
        self.uptime.tick(has_both, cfg.spread_bps);

        info!(
            loop_count = self.state.lock().unwrap().loop_count,
            mid = top.mid,
            bid = quote.bid_price,
            ask = quote.ask_price,
            has_both,
            maker_uptime_pct = self.uptime.maker_uptime_pct(),
            "tick"
        );
        Ok(())
    }

    /// Query the exchange position when flattening or skew needs it.
    /// Returns the inventory to feed the quote generator.
    async fn check_position(&self, cfg: &Tunables) -> Option<f64> {
        if !cfg.auto_close_fills && !cfg.inventory_skew {
            return None;
        }

        let positions = self.exchange.query_positions(cfg.symbol).await;
        let Some(pos) = positions.iter().find(|p| p.symbol == cfg.symbol.code()) else {
            // empty also covers a failed query; keep the last known size
            return Some(self.risk.position_size());
        };

        let signed = pos.signed_size();
        let mark = self.book.mid().unwrap_or(pos.entry_price);
        self.risk
            .update_position(signed, pos.entry_price, mark, 0.0, 0.0);

        if cfg.auto_close_fills && signed != 0.0 {
            let side = if signed > 0.0 { Side::Sell } else { Side::Buy };
            warn!(
                position = signed,
                entry = pos.entry_price,
                "accidental fill detected, flattening"
            );
            if self
                .exchange
                .place_market_reduce_only(cfg.symbol, side, pos.size)
                .await
            {
                self.state.lock().unwrap().fills_flattened += 1;
                return Some(0.0);
            }
        }
        Some(signed)
    }

    async fn place_side(
        &self,
        cfg: &Tunables,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<bool, ExchangeError> {
        if !self.risk.check_can_place_order(
            side,
            size,
            price,
            cfg.max_position,
            cfg.max_notional,
        ) {
            return Ok(false);
        }
        let placed = self
            .exchange
            .place_limit(&PlaceLimit {
                symbol: cfg.symbol,
                side,
                price,
                size,
                tp_bps: cfg.tp_bps,
                sl_bps: cfg.sl_bps,
            })
            .await?;
        match placed {
            Some(order_id) => {
                let order = ActiveOrder::new(order_id.clone(), side, price, size);
                self.state
                    .lock()
                    .unwrap()
                    .active_orders
                    .insert(order_id, order);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel everything we believe we own, reconcile against the exchange
    /// view, then sweep with a bulk cancel. Shadow map ends empty.
    async fn cancel_resting_orders(&self) {
        let symbol = self.config.symbol();
        let open: Vec<ActiveOrder> = {
            let state = self.state.lock().unwrap();
            state
                .active_orders
                .values()
                .filter(|o| o.is_open())
                .cloned()
                .collect()
        };

        for order in &open {
            let result = self.exchange.cancel_by_id(&order.order_id).await;
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.active_orders.get_mut(&order.order_id) {
                entry.status = match result {
                    CancelResult::Cancelled => OrderStatus::Cancelled,
                    CancelResult::Gone => OrderStatus::Gone,
                    CancelResult::Failed => entry.status,
                };
            }
        }

        // anything the exchange still lists that we lost track of gets
        // swept by the bulk cancel below
        let leaked = self.exchange.query_open_orders(symbol).await;
        for order in &leaked {
            let known = {
                let state = self.state.lock().unwrap();
                state.active_orders.contains_key(&order.id)
            };
            if !known {
                warn!(order_id = %order.id, "untracked open order on exchange");
            }
        }
        self.exchange.cancel_all(symbol).await;

        self.state.lock().unwrap().active_orders.clear();
    }

    pub fn active_orders(&self) -> Vec<ActiveOrderView> {
        let now = epoch_secs();
        let state = self.state.lock().unwrap();
        let mut orders: Vec<ActiveOrderView> = state
            .active_orders
            .values()
            .filter(|o| o.is_open())
            .map(|o| ActiveOrderView {
                age_seconds: o.age_seconds(now),
                order: o.clone(),
            })
            .collect();
        orders.sort_by(|a, b| a.order.placed_at.total_cmp(&b.order.placed_at));
        orders
    }

    /// Snapshot for the dashboard routes and the broadcaster.
    pub fn get_full_status(&self) -> FullStatus {
        let cfg = self.config.snapshot();
        let top = self.book.top_of_book();
        let active_orders = self.active_orders();
        let state = self.state.lock().unwrap();
        FullStatus {
            status: state.status,
            symbol: cfg.symbol.code().to_string(),
            mid_price: top.map(|t| t.mid),
            market_spread_bps: top.map(|t| t.spread_bps),
            configured_spread_bps: cfg.spread_bps,
            bid_notional: cfg.bid_notional,
            ask_notional: cfg.ask_notional,
            refresh_interval: cfg.refresh_interval,
            active_order_count: active_orders.len(),
            active_orders,
            last_quote: state.last_quote.clone(),
            loop_count: state.loop_count,
            consecutive_failures: state.consecutive_failures,
            fills_flattened: state.fills_flattened,
            uptime: self.uptime.stats(),
            risk: self.risk.status(cfg.max_position, cfg.max_notional),
        }
    }
}

async fn run_loop(engine: Arc<Engine>, token: CancellationToken) {
    loop {
        if token.is_cancelled() || engine.status() != EngineStatus::Running {
            break;
        }
        engine.step().await;
        let refresh = engine.config.snapshot().refresh_interval.max(0.05);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(Duration::from_secs_f64(refresh)) => {}
        }
    }
    debug!("tick loop exited");
}

/// Decide what to do with one resting order given the current book and
/// quote target. First violation wins; `Keep` means leave it resting.
fn classify_order(
    order: &ActiveOrder,
    target_price: f64,
    top: &TopOfBook,
    cfg: &Tunables,
    now: f64,
) -> OrderAction {
    let guard = top.mid * cfg.proximity_guard_bps / 10_000.0;
    let proximity_hit = match order.side {
        Side::Buy => order.price >= top.best_bid - guard,
        Side::Sell => order.price <= top.best_ask + guard,
    };
    if proximity_hit {
        return OrderAction::ProximityHit;
    }
    if order.drift_bps(target_price, top.mid) >= cfg.requote_threshold_bps {
        return OrderAction::Drift;
    }
    if order.is_stale(cfg.stale_order_seconds, now) {
        return OrderAction::Stale;
    }
    OrderAction::Keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Symbol;

    fn cfg() -> Tunables {
        Tunables {
            symbol: Symbol::BtcUsd,
            spread_bps: 50.0,
            bid_notional: 30.0,
            ask_notional: 30.0,
            requote_threshold_bps: 25.0,
            refresh_interval: 1.0,
            stale_order_seconds: 30.0,
            max_spread_deviation_bps: 200.0,
            proximity_guard_bps: 1.0,
            max_consecutive_failures: 5,
            max_notional: 10_000.0,
            max_position: 1.0,
            auto_close_fills: true,
            inventory_skew: false,
            skew_factor_bps: 0.0,
            tp_bps: 0.0,
            sl_bps: 0.0,
            uptime_target_minutes: 30,
        }
    }

    fn top() -> TopOfBook {
        TopOfBook {
            best_bid: 1000.0,
            best_ask: 1000.2,
            mid: 1000.1,
            spread_bps: 2.0,
        }
    }

    fn bid_at(price: f64, placed_at: f64) -> ActiveOrder {
        let mut o = ActiveOrder::new("b1".into(), Side::Buy, price, 0.1);
        o.placed_at = placed_at;
        o
    }

    #[test]
    fn far_fresh_on_target_order_is_kept() {
        // 50 bps below mid, just placed, on target
        let order = bid_at(995.1, 1000.0);
        let action = classify_order(&order, 995.1, &top(), &cfg(), 1001.0);
        assert_eq!(action, OrderAction::Keep);
    }

    #[test]
    fn bid_near_best_bid_is_proximity_hit() {
        // guard = 1000.1 * 1bp ~ 0.1; 999.95 >= 1000.0 - 0.1
        let order = bid_at(999.95, 1000.0);
        let action = classify_order(&order, 999.95, &top(), &cfg(), 1001.0);
        assert_eq!(action, OrderAction::ProximityHit);
    }

    #[test]
    fn ask_near_best_ask_is_proximity_hit() {
        let mut order = ActiveOrder::new("a1".into(), Side::Sell, 1000.25, 0.1);
        order.placed_at = 1000.0;
        let action = classify_order(&order, 1000.25, &top(), &cfg(), 1001.0);
        assert_eq!(action, OrderAction::ProximityHit);
    }

    #[test]
    fn drifted_order_is_flagged() {
        // 995.1 target vs 992.0 resting = ~31 bps of mid > 25 threshold
        let order = bid_at(992.0, 1000.0);
        let action = classify_order(&order, 995.1, &top(), &cfg(), 1001.0);
        assert_eq!(action, OrderAction::Drift);
    }

    #[test]
    fn old_order_is_stale() {
        let order = bid_at(995.1, 1000.0);
        let action = classify_order(&order, 995.1, &top(), &cfg(), 1031.0);
        assert_eq!(action, OrderAction::Stale);
    }
}
