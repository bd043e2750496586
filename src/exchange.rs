//! Typed REST surface of the exchange.
//!
//! Every mutating call is signed (see [`crate::auth`]) and every price and
//! quantity is snapped to the symbol's tick table before it goes on the
//! wire. Failure handling is deliberately uneven: placements raise so the
//! engine can count them, cancels and queries degrade softly.

use crate::auth::Credentials;
use crate::errors::ExchangeError;
use crate::instrument::Symbol;
use crate::orders::Side;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Limit placement request; prices/sizes are raw (unrounded) quote output.
#[derive(Debug, Clone)]
pub struct PlaceLimit {
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    /// Take-profit offset in bps of order price; zero disables.
    pub tp_bps: f64,
    /// Stop-loss offset in bps of order price; zero disables.
    pub sl_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// Exchange acknowledged the cancel.
    Cancelled,
    /// Exchange says the order no longer exists; counts as success.
    Gone,
    Failed,
}

#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// One position row from the exchange, held only while the tick decides
/// whether to flatten.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size in base asset.
    pub size: f64,
    pub entry_price: f64,
}

impl PositionSnapshot {
    /// Net size with sign restored (positive = long).
    pub fn signed_size(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
            PositionSide::Flat => 0.0,
        }
    }
}

/// Seam between the engine and the exchange; the live client implements it
/// over REST, tests script it.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Place a GTC post-side limit order. `Ok(Some(id))` when resting,
    /// `Ok(None)` when the exchange soft-rejected the quantity.
    async fn place_limit(&self, req: &PlaceLimit) -> Result<Option<String>, ExchangeError>;

    async fn cancel_by_id(&self, order_id: &str) -> CancelResult;

    /// Best-effort bulk cancel; never raises.
    async fn cancel_all(&self, symbol: Symbol);

    /// Empty on any error.
    async fn query_open_orders(&self, symbol: Symbol) -> Vec<OpenOrder>;

    /// Empty on any error.
    async fn query_positions(&self, symbol: Symbol) -> Vec<PositionSnapshot>;

    /// IOC reduce-only market order used to flatten accidental fills.
    async fn place_market_reduce_only(&self, symbol: Symbol, side: Side, qty: f64) -> bool;
}

/// Floor `qty` to the symbol's quantity tick, normalized to the tick's
/// decimal count. A result below one tick is bumped to one tick so a tiny
/// notional still rests an order.
pub fn round_quantity(symbol: Symbol, qty: f64) -> Decimal {
    let tick = symbol.qty_tick();
    let q = Decimal::from_f64(qty).unwrap_or(Decimal::ZERO);
    let floored = ((q / tick).floor() * tick).round_dp(tick.scale());
    if floored < tick { tick } else { floored }
}

/// Snap a price to the symbol's price tick: bids floor, asks ceil, so the
/// rounded order never lands tighter than the quoted spread.
pub fn round_price(symbol: Symbol, side: Side, price: f64) -> Decimal {
    let tick = symbol.price_tick();
    let p = Decimal::from_f64(price).unwrap_or(Decimal::ZERO);
    let steps = match side {
        Side::Buy => (p / tick).floor(),
        Side::Sell => (p / tick).ceil(),
    };
    (steps * tick).round_dp(tick.scale())
}

/// The exchange answers with `order_id` or `id`, as integer or string.
fn extract_order_id(data: &Value) -> Option<String> {
    let raw = data.get("order_id").or_else(|| data.get("id"))?;
    match raw {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_open_orders(data: &Value) -> Vec<OpenOrder> {
    data.get("result")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| extract_order_id(row).map(|id| OpenOrder { id }))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_positions(data: &Value) -> Vec<PositionSnapshot> {
    let Some(rows) = data.get("result").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let symbol = row.get("symbol")?.as_str()?.to_string();
            let qty = number_field(row, &["qty", "size", "quantity"])?;
            let entry_price = number_field(row, &["entry_price", "avg_entry_price"]).unwrap_or(0.0);
            let side = if qty > 0.0 {
                PositionSide::Long
            } else if qty < 0.0 {
                PositionSide::Short
            } else {
                PositionSide::Flat
            };
            Some(PositionSnapshot {
                symbol,
                side,
                size: qty.abs(),
                entry_price,
            })
        })
        .collect()
}

/// Numeric field that may arrive as a JSON number or a decimal string.
fn number_field(row: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        match row.get(*key) {
            Some(Value::Number(n)) => return n.as_f64(),
            Some(Value::String(s)) => return s.parse().ok(),
            _ => continue,
        }
    }
    None
}

/// Live REST client.
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    creds: Arc<Credentials>,
}

impl ExchangeClient {
    pub fn new(base_url: String, creds: Arc<Credentials>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
        }
    }

    /// POST a signed JSON body; the signature covers the exact bytes sent.
    async fn post_signed(&self, path: &str, payload: &Value) -> Result<reqwest::Response, ExchangeError> {
        let body = payload.to_string();
        let headers = self.creds.full_headers(&body);
        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(resp)
    }

    async fn get_query(&self, path: &str, symbol: Symbol) -> Result<Value, ExchangeError> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .query(&[("symbol", symbol.code())])
            .headers(self.creds.auth_headers())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ExchangeApi for ExchangeClient {
    async fn place_limit(&self, req: &PlaceLimit) -> Result<Option<String>, ExchangeError> {
        let price = round_price(req.symbol, req.side, req.price);
        let qty = round_quantity(req.symbol, req.size);

        let mut payload = json!({
            "symbol": req.symbol.code(),
            "side": req.side.as_str(),
            "type": "limit",
            "qty": qty.to_string(),
            "price": price.to_string(),
            "time_in_force": "GTC",
            "reduce_only": false,
        });
        // tp/sl ride along as absolute prices derived from the order price
        let tick = req.symbol.price_tick();
        if req.tp_bps > 0.0 {
            let factor = match req.side {
                Side::Buy => 1.0 + req.tp_bps / 10_000.0,
                Side::Sell => 1.0 - req.tp_bps / 10_000.0,
            };
            let tp = Decimal::from_f64(price.to_f64().unwrap_or(req.price) * factor)
                .unwrap_or(price)
                .round_dp(tick.scale());
            payload["take_profit"] = Value::String(tp.to_string());
        }
        if req.sl_bps > 0.0 {
            let factor = match req.side {
                Side::Buy => 1.0 - req.sl_bps / 10_000.0,
                Side::Sell => 1.0 + req.sl_bps / 10_000.0,
            };
            let sl = Decimal::from_f64(price.to_f64().unwrap_or(req.price) * factor)
                .unwrap_or(price)
                .round_dp(tick.scale());
            payload["stop_loss"] = Value::String(sl.to_string());
        }

        let resp = self.post_signed("/api/new_order", &payload).await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status.as_u16() == 400 && body.contains("qty") {
            // exchange refused the size; not worth a failure, the next
            // tick re-prices anyway
            warn!(symbol = %req.symbol, side = req.side.as_str(), %body, "quantity rejected");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ExchangeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = serde_json::from_str(&body)?;
        let order_id = extract_order_id(&data).unwrap_or_else(|| {
            let local = Uuid::new_v4().to_string();
            warn!(%local, "order id missing from placement response, tracking under local id");
            local
        });
        info!(
            order_id = %order_id,
            side = req.side.as_str(),
            price = %price,
            qty = %qty,
            "order placed"
        );
        Ok(Some(order_id))
    }

    async fn cancel_by_id(&self, order_id: &str) -> CancelResult {
        let payload = json!({ "order_id": order_id });
        let resp = match self.post_signed("/api/cancel_order", &payload).await {
            Ok(r) => r,
            Err(e) => {
                warn!(%order_id, error = %e, "cancel request failed");
                return CancelResult::Failed;
            }
        };
        let status = resp.status().as_u16();
        match status {
            s if (200..300).contains(&s) => CancelResult::Cancelled,
            404 | 422 => {
                debug!(%order_id, status, "order already gone");
                CancelResult::Gone
            }
            _ => {
                warn!(%order_id, status, "cancel rejected");
                CancelResult::Failed
            }
        }
    }

    async fn cancel_all(&self, symbol: Symbol) {
        let payload = json!({ "symbol": symbol.code() });
        match self.post_signed("/api/cancel_all_orders", &payload).await {
            Ok(resp) if resp.status().is_success() => {
                info!(symbol = %symbol, "bulk cancel sent");
            }
            Ok(resp) => {
                error!(symbol = %symbol, status = resp.status().as_u16(), "bulk cancel rejected");
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "bulk cancel failed");
            }
        }
    }

    async fn query_open_orders(&self, symbol: Symbol) -> Vec<OpenOrder> {
        match self.get_query("/api/query_open_orders", symbol).await {
            Ok(data) => parse_open_orders(&data),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "open-orders query failed");
                Vec::new()
            }
        }
    }

    async fn query_positions(&self, symbol: Symbol) -> Vec<PositionSnapshot> {
        match self.get_query("/api/query_positions", symbol).await {
            Ok(data) => parse_positions(&data),
            Err(e) => {
                debug!(symbol = %symbol, error = %e, "positions query failed");
                Vec::new()
            }
        }
    }

    async fn place_market_reduce_only(&self, symbol: Symbol, side: Side, qty: f64) -> bool {
        let payload = json!({
            "symbol": symbol.code(),
            "side": side.as_str(),
            "type": "market",
            "qty": round_quantity(symbol, qty).to_string(),
            "time_in_force": "IOC",
            "reduce_only": true,
        });
        match self.post_signed("/api/new_order", &payload).await {
            Ok(resp) if resp.status().is_success() => {
                info!(symbol = %symbol, side = side.as_str(), qty, "reduce-only market order sent");
                true
            }
            Ok(resp) => {
                error!(
                    symbol = %symbol,
                    status = resp.status().as_u16(),
                    "reduce-only market order rejected"
                );
                false
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "reduce-only market order failed");
                false
            }
        }
    }
}
