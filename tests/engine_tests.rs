use async_trait::async_trait;
use makerbot::config::{SharedConfig, Tunables};
use makerbot::engine::{Engine, EngineStatus};
use makerbot::errors::ExchangeError;
use makerbot::exchange::{
    CancelResult, ExchangeApi, OpenOrder, PlaceLimit, PositionSide, PositionSnapshot,
};
use makerbot::instrument::Symbol;
use makerbot::orderbook::BookMirror;
use makerbot::orders::Side;
use makerbot::risk::RiskManager;
use makerbot::uptime::UptimeTracker;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted exchange double: records every call, optionally fails
/// placements with a synthetic 503 or soft-rejects them like a 400 "qty".
#[derive(Default)]
struct MockExchange {
    fail_placements: AtomicBool,
    soft_reject_placements: AtomicBool,
    next_id: AtomicUsize,
    placed: Mutex<Vec<PlaceLimit>>,
    cancelled_ids: Mutex<Vec<String>>,
    cancel_all_count: AtomicUsize,
    positions: Mutex<Vec<PositionSnapshot>>,
    reduce_only: Mutex<Vec<(Side, f64)>>,
}

impl MockExchange {
    fn placements(&self) -> Vec<PlaceLimit> {
        self.placed.lock().unwrap().clone()
    }

    fn set_position(&self, size: f64, entry: f64) {
        let side = if size > 0.0 {
            PositionSide::Long
        } else if size < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };
        *self.positions.lock().unwrap() = vec![PositionSnapshot {
            symbol: "BTC-USD".to_string(),
            side,
            size: size.abs(),
            entry_price: entry,
        }];
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn place_limit(&self, req: &PlaceLimit) -> Result<Option<String>, ExchangeError> {
        if self.fail_placements.load(Ordering::SeqCst) {
            return Err(ExchangeError::Status {
                status: 503,
                body: "synthetic outage".to_string(),
            });
        }
        if self.soft_reject_placements.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.placed.lock().unwrap().push(req.clone());
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("order-{id}")))
    }

    async fn cancel_by_id(&self, order_id: &str) -> CancelResult {
        self.cancelled_ids.lock().unwrap().push(order_id.to_string());
        CancelResult::Cancelled
    }

    async fn cancel_all(&self, _symbol: Symbol) {
        self.cancel_all_count.fetch_add(1, Ordering::SeqCst);
    }

    async fn query_open_orders(&self, _symbol: Symbol) -> Vec<OpenOrder> {
        Vec::new()
    }

    async fn query_positions(&self, _symbol: Symbol) -> Vec<PositionSnapshot> {
        self.positions.lock().unwrap().clone()
    }

    async fn place_market_reduce_only(&self, _symbol: Symbol, side: Side, qty: f64) -> bool {
        self.reduce_only.lock().unwrap().push((side, qty));
        self.positions.lock().unwrap().clear();
        true
    }
}

fn tunables() -> Tunables {
    Tunables {
        symbol: Symbol::BtcUsd,
        spread_bps: 50.0,
        bid_notional: 100.0,
        ask_notional: 100.0,
        requote_threshold_bps: 25.0,
        refresh_interval: 1.0,
        stale_order_seconds: 30.0,
        max_spread_deviation_bps: 200.0,
        proximity_guard_bps: 1.0,
        max_consecutive_failures: 5,
        max_notional: 1_000_000.0,
        max_position: 10.0,
        auto_close_fills: false,
        inventory_skew: false,
        skew_factor_bps: 0.0,
        tp_bps: 0.0,
        sl_bps: 0.0,
        uptime_target_minutes: 30,
    }
}

struct Harness {
    engine: Arc<Engine>,
    book: Arc<BookMirror>,
    exchange: Arc<MockExchange>,
    uptime: Arc<UptimeTracker>,
}

fn harness(cfg: Tunables) -> Harness {
    let book = Arc::new(BookMirror::new(cfg.symbol));
    let config = SharedConfig::new(cfg);
    let exchange = Arc::new(MockExchange::default());
    let uptime = Arc::new(UptimeTracker::new(1800.0));
    let risk = Arc::new(RiskManager::new());
    let engine = Arc::new(Engine::new(
        Arc::clone(&book),
        config,
        Arc::clone(&exchange) as Arc<dyn ExchangeApi>,
        Arc::clone(&uptime),
        risk,
    ));
    Harness {
        engine,
        book,
        exchange,
        uptime,
    }
}

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn seed_book(book: &BookMirror, bid: &str, ask: &str) {
    book.apply_snapshot(vec![(d(bid), d("1.0"))], vec![(d(ask), d("1.0"))]);
}

#[tokio::test]
async fn places_both_sides_on_a_live_book() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");

    h.engine.step().await;

    let placed = h.exchange.placements();
    assert_eq!(placed.len(), 2);
    assert_eq!(placed[0].side, Side::Buy);
    assert_eq!(placed[1].side, Side::Sell);
    // mid 1000, 50 bps each side
    assert!((placed[0].price - 995.0).abs() < 1e-9);
    assert!((placed[1].price - 1005.0).abs() < 1e-9);

    let status = h.engine.get_full_status();
    assert_eq!(status.active_order_count, 2);
    assert_eq!(status.loop_count, 1);
    assert_eq!(status.consecutive_failures, 0);
}

#[tokio::test]
async fn keeps_resting_orders_when_nothing_changed() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");

    h.engine.step().await;
    h.engine.step().await;

    // both orders survived reconciliation, nothing re-placed or cancelled
    assert_eq!(h.exchange.placements().len(), 2);
    assert_eq!(h.exchange.cancel_all_count.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.get_full_status().active_order_count, 2);
}

#[tokio::test]
async fn empty_book_means_an_inactive_tick() {
    let h = harness(tunables());

    h.engine.step().await;

    assert!(h.exchange.placements().is_empty());
    let stats = h.uptime.stats();
    assert!(!stats.current_hour.is_active);
    assert_eq!(stats.current_hour.record.maker_active_seconds, 0.0);
}

#[tokio::test]
async fn quote_past_max_deviation_is_not_placed() {
    let mut cfg = tunables();
    cfg.spread_bps = 15.0;
    cfg.max_spread_deviation_bps = 10.0;
    let h = harness(cfg);
    seed_book(&h.book, "999.8", "1000.2");

    h.engine.step().await;

    assert!(h.exchange.placements().is_empty());
    let status = h.engine.get_full_status();
    let quote = status.last_quote.expect("quote was generated");
    assert!(!quote.within_limits);
    assert!(!h.uptime.stats().current_hour.is_active);
}

#[tokio::test]
async fn proximity_hit_refreshes_both_sides() {
    let mut cfg = tunables();
    // isolate the proximity guard from drift/staleness
    cfg.requote_threshold_bps = 10_000.0;
    cfg.stale_order_seconds = 3600.0;
    let h = harness(cfg);

    seed_book(&h.book, "1000.0", "1000.2");
    h.engine.step().await;
    assert_eq!(h.exchange.placements().len(), 2);

    // market drops onto our resting bid: best bid is now within the guard
    let resting_bid = h.exchange.placements()[0].price; // ~995.05
    seed_book(
        &h.book,
        &format!("{:.1}", resting_bid - 0.05),
        &format!("{:.1}", resting_bid + 0.15),
    );
    h.engine.step().await;

    // cancel-all then repost both sides at the new mid
    assert_eq!(h.exchange.cancel_all_count.load(Ordering::SeqCst), 1);
    let placed = h.exchange.placements();
    assert_eq!(placed.len(), 4);
    assert_eq!(placed[2].side, Side::Buy);
    assert!(placed[2].price < placed[0].price);
    assert_eq!(h.engine.get_full_status().active_order_count, 2);
}

#[tokio::test]
async fn drifted_orders_are_requoted() {
    let mut cfg = tunables();
    cfg.proximity_guard_bps = 0.0;
    let h = harness(cfg);

    seed_book(&h.book, "999.8", "1000.2");
    h.engine.step().await;

    // mid moves 1% - far past the 25 bps requote threshold
    seed_book(&h.book, "1009.8", "1010.2");
    h.engine.step().await;

    assert_eq!(h.exchange.cancel_all_count.load(Ordering::SeqCst), 1);
    let placed = h.exchange.placements();
    assert_eq!(placed.len(), 4);
    assert!((placed[2].price - 1010.0 * (1.0 - 0.005)).abs() < 1e-6);
}

#[tokio::test]
async fn accidental_fill_is_flattened_reduce_only() {
    let mut cfg = tunables();
    cfg.auto_close_fills = true;
    let h = harness(cfg);
    seed_book(&h.book, "999.8", "1000.2");
    h.exchange.set_position(0.25, 998.0);

    h.engine.step().await;

    let flattened = h.exchange.reduce_only.lock().unwrap().clone();
    assert_eq!(flattened, vec![(Side::Sell, 0.25)]);
    let status = h.engine.get_full_status();
    assert_eq!(status.fills_flattened, 1);
    // the tick carried on and quoted both sides
    assert_eq!(status.active_order_count, 2);
}

#[tokio::test]
async fn short_position_flattens_with_a_buy() {
    let mut cfg = tunables();
    cfg.auto_close_fills = true;
    let h = harness(cfg);
    seed_book(&h.book, "999.8", "1000.2");
    h.exchange.set_position(-0.1, 1001.0);

    h.engine.step().await;

    let flattened = h.exchange.reduce_only.lock().unwrap().clone();
    assert_eq!(flattened, vec![(Side::Buy, 0.1)]);
}

#[tokio::test]
async fn kill_switch_trips_after_consecutive_failures() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");
    h.exchange.fail_placements.store(true, Ordering::SeqCst);

    for _ in 0..5 {
        h.engine.step().await;
    }

    assert_eq!(h.engine.status(), EngineStatus::Error);
    // cancel-all fired exactly once, on the transition
    assert_eq!(h.exchange.cancel_all_count.load(Ordering::SeqCst), 1);

    // further steps are no-ops
    h.engine.step().await;
    assert_eq!(h.exchange.cancel_all_count.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.get_full_status().consecutive_failures, 5);
}

#[tokio::test]
async fn one_success_resets_the_failure_counter() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");

    h.exchange.fail_placements.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        h.engine.step().await;
    }
    assert_eq!(h.engine.get_full_status().consecutive_failures, 3);

    h.exchange.fail_placements.store(false, Ordering::SeqCst);
    h.engine.step().await;
    assert_eq!(h.engine.get_full_status().consecutive_failures, 0);
    assert_eq!(h.engine.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn stop_cancels_everything_and_clears_the_shadow() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");
    h.engine.step().await;
    assert_eq!(h.engine.get_full_status().active_order_count, 2);

    h.engine.stop().await;

    assert_eq!(h.engine.status(), EngineStatus::Stopped);
    assert_eq!(h.exchange.cancelled_ids.lock().unwrap().len(), 2);
    assert!(h.exchange.cancel_all_count.load(Ordering::SeqCst) >= 1);
    assert_eq!(h.engine.get_full_status().active_order_count, 0);
}

#[tokio::test]
async fn soft_qty_rejection_is_not_a_failure() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");
    h.exchange.soft_reject_placements.store(true, Ordering::SeqCst);

    for _ in 0..10 {
        h.engine.step().await;
    }

    // nothing rested, but the engine never counted a failure
    let status = h.engine.get_full_status();
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(status.active_order_count, 0);
    assert_ne!(h.engine.status(), EngineStatus::Error);
    assert!(!h.uptime.stats().current_hour.is_active);
}

#[tokio::test]
async fn repeated_stop_does_not_recancel() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");
    h.engine.step().await;

    h.engine.stop().await;
    let after_first = h.exchange.cancelled_ids.lock().unwrap().len();
    h.engine.stop().await;

    // shadow entries stay terminal; the second pass has nothing to cancel
    assert_eq!(h.exchange.cancelled_ids.lock().unwrap().len(), after_first);
}

#[tokio::test]
async fn kill_parks_the_engine_for_good() {
    let h = harness(tunables());
    seed_book(&h.book, "999.8", "1000.2");
    h.engine.step().await;

    h.engine.kill().await;
    assert_eq!(h.engine.status(), EngineStatus::Killed);

    // killed engines do not tick
    let before = h.exchange.placements().len();
    h.engine.step().await;
    assert_eq!(h.exchange.placements().len(), before);
}

#[tokio::test]
async fn start_and_stop_drive_the_status_machine() {
    let mut cfg = tunables();
    cfg.refresh_interval = 0.05;
    let h = harness(cfg);
    seed_book(&h.book, "999.8", "1000.2");

    h.engine.start().await;
    assert_eq!(h.engine.status(), EngineStatus::Running);

    // let the loop run a couple of ticks
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    h.engine.stop().await;

    assert_eq!(h.engine.status(), EngineStatus::Stopped);
    assert!(h.engine.get_full_status().loop_count >= 2);
    assert!(!h.exchange.placements().is_empty());
}

#[tokio::test]
async fn maker_band_accrues_while_quoting_tight() {
    let mut cfg = tunables();
    cfg.spread_bps = 5.0;
    let h = harness(cfg);
    seed_book(&h.book, "999.8", "1000.2");

    h.engine.step().await;

    let stats = h.uptime.stats();
    assert!(stats.current_hour.is_active);
    // the configured spread decides the band, and 5 bps is maker-eligible
    assert_eq!(stats.current_hour.record.mm_active_seconds, 0.0);
}

#[tokio::test]
async fn wide_spread_accrues_the_mm_band() {
    let h = harness(tunables()); // 50 bps configured
    seed_book(&h.book, "999.8", "1000.2");

    h.engine.step().await;
    // force measurable elapsed time into the second tick
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.engine.step().await;

    let stats = h.uptime.stats();
    assert!(stats.current_hour.is_active);
    assert!(stats.current_hour.record.mm_active_seconds > 0.0);
    assert_eq!(stats.current_hour.record.maker_active_seconds, 0.0);
}

#[tokio::test]
async fn inventory_skew_widens_the_loaded_side() {
    let mut cfg = tunables();
    cfg.inventory_skew = true;
    cfg.skew_factor_bps = 20.0;
    cfg.max_position = 1.0;
    cfg.auto_close_fills = false;
    let h = harness(cfg);
    seed_book(&h.book, "999.8", "1000.2");
    h.exchange.set_position(0.5, 1000.0);

    h.engine.step().await;

    let placed = h.exchange.placements();
    assert_eq!(placed.len(), 2);
    let bid_dev = 1000.0 - placed[0].price;
    let ask_dev = placed[1].price - 1000.0;
    // long half the limit with 20 bps factor: bid widened by 10 bps
    assert!(bid_dev > ask_dev);
    let quote = h.engine.get_full_status().last_quote.unwrap();
    assert_eq!(quote.skew_bps, Some(10.0));
}
