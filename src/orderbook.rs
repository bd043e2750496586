use crate::instrument::Symbol;
use crate::utils::epoch_secs;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Which side of the book a delta touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookSide {
    Bid,
    Ask,
}

/// Single price level mirrored from the exchange feed.
#[derive(Debug, Clone, Serialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: f64,
}

/// A consistent best-bid/best-ask reading taken under one lock.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TopOfBook {
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub spread_bps: f64,
}

/// Dashboard view of the mirrored book.
#[derive(Debug, Clone, Serialize)]
pub struct BookLevels {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub mid_price: Option<f64>,
    pub spread_bps: Option<f64>,
    pub last_update: f64,
}

struct BookInner {
    symbol: Symbol,
    bids: BTreeMap<Decimal, PriceLevel>,
    asks: BTreeMap<Decimal, PriceLevel>,
    last_update: f64,
}

/// Local mirror of the exchange's top-of-book for the active symbol.
///
/// The feed task writes, the engine tick reads; one mutex keeps every
/// reader on a consistent best/best pair. The lock is never held across
/// an await point.
pub struct BookMirror {
    inner: Mutex<BookInner>,
}

impl BookMirror {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            inner: Mutex::new(BookInner {
                symbol,
                bids: BTreeMap::new(),
                asks: BTreeMap::new(),
                last_update: 0.0,
            }),
        }
    }

    pub fn symbol(&self) -> Symbol {
        self.inner.lock().unwrap().symbol
    }

    /// Atomically replace both sides with a fresh snapshot.
    pub fn apply_snapshot(&self, bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) {
        let now = epoch_secs();
        let mut inner = self.inner.lock().unwrap();
        inner.bids.clear();
        inner.asks.clear();
        for (price, size) in bids {
            if size > Decimal::ZERO {
                inner.bids.insert(
                    price,
                    PriceLevel {
                        price,
                        size,
                        timestamp: now,
                    },
                );
            }
        }
        for (price, size) in asks {
            if size > Decimal::ZERO {
                inner.asks.insert(
                    price,
                    PriceLevel {
                        price,
                        size,
                        timestamp: now,
                    },
                );
            }
        }
        inner.last_update = now;
    }

    /// Apply one incremental update. Size zero deletes the level.
    pub fn apply_delta(&self, side: BookSide, price: Decimal, size: Decimal) {
        let now = epoch_secs();
        let mut inner = self.inner.lock().unwrap();
        let book = match side {
            BookSide::Bid => &mut inner.bids,
            BookSide::Ask => &mut inner.asks,
        };
        if size <= Decimal::ZERO {
            book.remove(&price);
        } else {
            book.insert(
                price,
                PriceLevel {
                    price,
                    size,
                    timestamp: now,
                },
            );
        }
        inner.last_update = now;
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        let inner = self.inner.lock().unwrap();
        inner.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        let inner = self.inner.lock().unwrap();
        inner.asks.keys().next().copied()
    }

    /// Mid price, or `None` when a side is empty or the book is
    /// crossed/locked (best_bid >= best_ask is not a usable view).
    pub fn mid(&self) -> Option<f64> {
        self.top_of_book().map(|t| t.mid)
    }

    /// Market spread in basis points, under the same validity rules as
    /// [`BookMirror::mid`].
    pub fn spread_bps(&self) -> Option<f64> {
        self.top_of_book().map(|t| t.spread_bps)
    }

    /// Best bid, best ask, mid and spread read under one lock so the tick
    /// never observes a torn pair.
    pub fn top_of_book(&self) -> Option<TopOfBook> {
        let inner = self.inner.lock().unwrap();
        let bb = inner.bids.keys().next_back()?.to_f64()?;
        let ba = inner.asks.keys().next()?.to_f64()?;
        if bb >= ba {
            return None;
        }
        let mid = (bb + ba) / 2.0;
        Some(TopOfBook {
            best_bid: bb,
            best_ask: ba,
            mid,
            spread_bps: (ba - bb) / mid * 10_000.0,
        })
    }

    /// Drop both sides and switch the active symbol.
    pub fn reset(&self, new_symbol: Symbol) {
        let mut inner = self.inner.lock().unwrap();
        inner.bids.clear();
        inner.asks.clear();
        inner.symbol = new_symbol;
        inner.last_update = 0.0;
    }

    /// Top `depth` levels per side for the dashboard.
    pub fn top_levels(&self, depth: usize) -> BookLevels {
        let top = self.top_of_book();
        let inner = self.inner.lock().unwrap();
        BookLevels {
            symbol: inner.symbol.code().to_string(),
            bids: inner.bids.values().rev().take(depth).cloned().collect(),
            asks: inner.asks.values().take(depth).cloned().collect(),
            mid_price: top.map(|t| t.mid),
            spread_bps: top.map(|t| t.spread_bps),
            last_update: inner.last_update,
        }
    }
}

//tests
#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn levels(pairs: &[(&str, &str)]) -> Vec<(Decimal, Decimal)> {
        pairs.iter().map(|(p, s)| (d(p), d(s))).collect()
    }

    #[test]
    fn empty_book_has_no_mid_or_spread() {
        let book = BookMirror::new(Symbol::EthUsd);
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
        assert!(book.mid().is_none());
        assert!(book.spread_bps().is_none());
    }

    #[test]
    fn snapshot_sets_best_mid_and_spread() {
        let book = BookMirror::new(Symbol::EthUsd);
        book.apply_snapshot(
            levels(&[("100.0", "1.0"), ("99.0", "2.0"), ("98.0", "3.0")]),
            levels(&[("101.0", "1.0"), ("102.0", "2.0")]),
        );
        assert_eq!(book.best_bid(), Some(d("100.0")));
        assert_eq!(book.best_ask(), Some(d("101.0")));

        let top = book.top_of_book().unwrap();
        assert_eq!(top.mid, 100.5);
        let expected_spread = (101.0 - 100.0) / 100.5 * 10_000.0;
        assert!((top.spread_bps - expected_spread).abs() < 1e-9);
    }

    #[test]
    fn one_sided_book_has_no_mid() {
        let book = BookMirror::new(Symbol::BtcUsd);
        book.apply_snapshot(levels(&[("100.0", "1.0")]), vec![]);
        assert!(book.mid().is_none());
        assert_eq!(book.best_bid(), Some(d("100.0")));
    }

    #[test]
    fn delta_inserts_and_removes_levels() {
        let book = BookMirror::new(Symbol::EthUsd);
        book.apply_snapshot(levels(&[("100.0", "1.0")]), levels(&[("101.0", "1.0")]));

        book.apply_delta(BookSide::Bid, d("100.5"), d("2.0"));
        assert_eq!(book.best_bid(), Some(d("100.5")));

        // size zero deletes
        book.apply_delta(BookSide::Bid, d("100.5"), Decimal::ZERO);
        assert_eq!(book.best_bid(), Some(d("100.0")));
    }

    #[test]
    fn crossed_book_is_invalid() {
        let book = BookMirror::new(Symbol::BtcUsd);
        book.apply_snapshot(levels(&[("101.0", "1.0")]), levels(&[("100.0", "1.0")]));
        assert!(book.mid().is_none());
        assert!(book.top_of_book().is_none());
    }

    #[test]
    fn locked_book_is_invalid() {
        let book = BookMirror::new(Symbol::BtcUsd);
        book.apply_snapshot(levels(&[("100.0", "1.0")]), levels(&[("100.0", "1.0")]));
        assert!(book.mid().is_none());
    }

    #[test]
    fn reset_clears_both_sides_and_switches_symbol() {
        let book = BookMirror::new(Symbol::BtcUsd);
        book.apply_snapshot(levels(&[("100.0", "1.0")]), levels(&[("101.0", "1.0")]));
        book.reset(Symbol::EthUsd);
        assert_eq!(book.symbol(), Symbol::EthUsd);
        assert!(book.best_bid().is_none());
        assert!(book.best_ask().is_none());
    }

    #[test]
    fn top_levels_orders_best_first() {
        let book = BookMirror::new(Symbol::EthUsd);
        book.apply_snapshot(
            levels(&[("99.0", "2.0"), ("100.0", "1.0")]),
            levels(&[("102.0", "2.0"), ("101.0", "1.0")]),
        );
        let view = book.top_levels(1);
        assert_eq!(view.bids.len(), 1);
        assert_eq!(view.asks.len(), 1);
        assert_eq!(view.bids[0].price, d("100.0"));
        assert_eq!(view.asks[0].price, d("101.0"));
        assert_eq!(view.mid_price, Some(100.5));
    }
}
