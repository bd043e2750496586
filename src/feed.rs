//! Depth feed client.
//!
//! One long-lived task: connect, subscribe to the current symbol's depth
//! channel, stream frames into the book mirror, and reconnect with
//! exponential backoff when the socket drops. Nothing here raises into the
//! engine; a broken feed just leaves the book empty and ticks inactive.

use crate::auth::Credentials;
use crate::config::SharedConfig;
use crate::instrument::Symbol;
use crate::orderbook::{BookMirror, BookSide};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval, sleep, sleep_until};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

enum FeedCommand {
    SwitchSymbol(Symbol),
}

/// Cheap handle for the rest of the app to steer the feed task.
#[derive(Clone)]
pub struct DepthFeedHandle {
    cmd_tx: mpsc::UnboundedSender<FeedCommand>,
}

impl DepthFeedHandle {
    /// Re-point the live subscription at `symbol`. A no-op while the socket
    /// is down; the connect path always subscribes to the current config
    /// symbol anyway.
    pub fn switch_symbol(&self, symbol: Symbol) {
        let _ = self.cmd_tx.send(FeedCommand::SwitchSymbol(symbol));
    }
}

/// Spawn the reader task. It only exits on cancellation.
pub fn spawn_depth_feed(
    book: Arc<BookMirror>,
    config: SharedConfig,
    creds: Arc<Credentials>,
    ws_url: String,
    token: CancellationToken,
) -> (DepthFeedHandle, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = DepthFeedHandle { cmd_tx };
    let task = tokio::spawn(run_feed(book, config, creds, ws_url, token, cmd_rx));
    (handle, task)
}

async fn run_feed(
    book: Arc<BookMirror>,
    config: SharedConfig,
    creds: Arc<Credentials>,
    ws_url: String,
    token: CancellationToken,
    mut cmd_rx: mpsc::UnboundedReceiver<FeedCommand>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if token.is_cancelled() {
            break;
        }

        let request = match ws_url.clone().into_client_request() {
            Ok(mut req) => {
                req.headers_mut().extend(creds.auth_headers());
                req
            }
            Err(e) => {
                warn!(url = %ws_url, error = %e, "bad websocket url");
                return;
            }
        };

        match connect_async(request).await {
            Ok((ws, _)) => {
                info!(url = %ws_url, "depth feed connected");
                backoff = INITIAL_BACKOFF;
                // switches requested while we were down are already
                // reflected in config; drop them
                while cmd_rx.try_recv().is_ok() {}
                consume_socket(ws, &book, &config, &token, &mut cmd_rx).await;
                if token.is_cancelled() {
                    break;
                }
                warn!("depth feed disconnected");
            }
            Err(e) => {
                warn!(url = %ws_url, error = %e, "depth feed connect failed");
            }
        }

        debug!(delay_secs = backoff.as_secs(), "depth feed reconnecting");
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    info!("depth feed stopped");
}

async fn consume_socket(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    book: &BookMirror,
    config: &SharedConfig,
    token: &CancellationToken,
    cmd_rx: &mut mpsc::UnboundedReceiver<FeedCommand>,
) {
    let (mut write, mut read) = ws.split();

    let mut current = config.symbol();
    if send_json(&mut write, &subscribe_frame(current)).await.is_err() {
        return;
    }
    info!(symbol = %current, "subscribed to depth channel");

    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.tick().await; // first tick fires immediately
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let deadline = pong_deadline;
        tokio::select! {
            _ = token.cancelled() => {
                let _ = send_json(&mut write, &unsubscribe_frame(current)).await;
                return;
            }
            Some(cmd) = cmd_rx.recv() => {
                let FeedCommand::SwitchSymbol(new) = cmd;
                if new != current {
                    let _ = send_json(&mut write, &unsubscribe_frame(current)).await;
                    book.reset(new);
                    if send_json(&mut write, &subscribe_frame(new)).await.is_err() {
                        return;
                    }
                    info!(from = %current, to = %new, "depth subscription switched");
                    current = new;
                }
            }
            _ = ping_timer.tick() => {
                if write.send(WsMsg::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
                pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
            }
            _ = async {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                warn!("pong timeout, dropping connection");
                return;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMsg::Text(text))) => handle_message(book, &text),
                    Some(Ok(WsMsg::Ping(data))) => {
                        if write.send(WsMsg::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMsg::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(WsMsg::Close(frame))) => {
                        info!(?frame, "depth feed close frame");
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "depth feed read error");
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

async fn send_json<S>(write: &mut S, frame: &Value) -> Result<(), ()>
where
    S: futures_util::Sink<WsMsg> + Unpin,
{
    write
        .send(WsMsg::Text(frame.to_string().into()))
        .await
        .map_err(|_| ())
}

fn subscribe_frame(symbol: Symbol) -> Value {
    json!({ "subscribe": { "channel": "depth_book", "symbol": symbol.code() } })
}

fn unsubscribe_frame(symbol: Symbol) -> Value {
    json!({ "unsubscribe": { "channel": "depth_book", "symbol": symbol.code() } })
}

/// Route one inbound frame. Depth snapshots rebuild the book, deltas patch
/// it; anything else (acks, heartbeats, user-channel frames) is ignored.
fn handle_message(book: &BookMirror, raw: &str) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, raw = &raw[..raw.len().min(200)], "invalid json frame");
            return;
        }
    };
    let Some(channel) = value.get("channel").and_then(Value::as_str) else {
        debug!("frame without channel, ignoring");
        return;
    };
    let Some(data) = value.get("data") else {
        debug!(channel, "frame without data, ignoring");
        return;
    };

    match channel {
        "depth_book" => {
            if !frame_matches_symbol(data, book) {
                return;
            }
            let (Some(bids), Some(asks)) = (parse_levels(data, "bids"), parse_levels(data, "asks"))
            else {
                warn!("depth snapshot with unparseable levels, dropping");
                return;
            };
            book.apply_snapshot(bids, asks);
        }
        "depth_delta" => {
            if !frame_matches_symbol(data, book) {
                return;
            }
            let Some(changes) = data.get("changes").and_then(Value::as_array) else {
                return;
            };
            for change in changes {
                let Some((side, price, size)) = parse_change(change) else {
                    warn!("unparseable depth delta, dropping change");
                    continue;
                };
                book.apply_delta(side, price, size);
            }
        }
        other => {
            debug!(channel = other, "ignoring frame");
        }
    }
}

/// Frames from a previous subscription can still be in flight right after
/// a switch; only the active symbol touches the book.
fn frame_matches_symbol(data: &Value, book: &BookMirror) -> bool {
    match data.get("symbol").and_then(Value::as_str) {
        Some(sym) => sym == book.symbol().code(),
        None => false,
    }
}

fn parse_levels(data: &Value, key: &str) -> Option<Vec<(Decimal, Decimal)>> {
    let rows = data.get(key)?.as_array()?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let pair = row.as_array()?;
        let price: Decimal = pair.first()?.as_str()?.parse().ok()?;
        let size: Decimal = pair.get(1)?.as_str()?.parse().ok()?;
        levels.push((price, size));
    }
    Some(levels)
}

fn parse_change(change: &Value) -> Option<(BookSide, Decimal, Decimal)> {
    let side = match change.get("side")?.as_str()? {
        "bid" | "buy" => BookSide::Bid,
        "ask" | "sell" => BookSide::Ask,
        _ => return None,
    };
    let price: Decimal = change.get("price")?.as_str()?.parse().ok()?;
    let size: Decimal = change.get("size")?.as_str()?.parse().ok()?;
    Some((side, price, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> BookMirror {
        BookMirror::new(Symbol::BtcUsd)
    }

    #[test]
    fn snapshot_frame_rebuilds_the_book() {
        let b = book();
        handle_message(
            &b,
            r#"{"channel":"depth_book","data":{"symbol":"BTC-USD",
                "bids":[["100.0","1.5"],["99.5","2.0"]],
                "asks":[["100.5","1.0"]]}}"#,
        );
        assert_eq!(b.best_bid().unwrap().to_string(), "100.0");
        assert_eq!(b.best_ask().unwrap().to_string(), "100.5");
    }

    #[test]
    fn delta_frame_patches_levels() {
        let b = book();
        handle_message(
            &b,
            r#"{"channel":"depth_book","data":{"symbol":"BTC-USD",
                "bids":[["100.0","1.0"]],"asks":[["101.0","1.0"]]}}"#,
        );
        handle_message(
            &b,
            r#"{"channel":"depth_delta","data":{"symbol":"BTC-USD",
                "changes":[{"side":"bid","price":"100.5","size":"2.0"},
                           {"side":"bid","price":"100.0","size":"0"}]}}"#,
        );
        assert_eq!(b.best_bid().unwrap().to_string(), "100.5");
    }

    #[test]
    fn malformed_json_is_dropped_without_state_change() {
        let b = book();
        handle_message(
            &b,
            r#"{"channel":"depth_book","data":{"symbol":"BTC-USD",
                "bids":[["100.0","1.0"]],"asks":[["101.0","1.0"]]}}"#,
        );
        handle_message(&b, "{not json");
        handle_message(
            &b,
            r#"{"channel":"depth_book","data":{"symbol":"BTC-USD","bids":[["x","y"]],"asks":[]}}"#,
        );
        assert_eq!(b.best_bid().unwrap().to_string(), "100.0");
    }

    #[test]
    fn frames_for_other_symbols_are_ignored() {
        let b = book();
        handle_message(
            &b,
            r#"{"channel":"depth_book","data":{"symbol":"ETH-USD",
                "bids":[["1.0","1.0"]],"asks":[["2.0","1.0"]]}}"#,
        );
        assert!(b.best_bid().is_none());
    }

    #[test]
    fn control_frames_are_ignored() {
        let b = book();
        handle_message(&b, r#"{"subscribed":{"channel":"depth_book"}}"#);
        handle_message(&b, r#"{"channel":"heartbeat","data":{}}"#);
        handle_message(&b, r#"{"channel":"orders","data":{"symbol":"BTC-USD"}}"#);
        assert!(b.best_bid().is_none());
    }

    #[test]
    fn subscribe_frames_name_channel_and_symbol() {
        let sub = subscribe_frame(Symbol::EthUsd);
        assert_eq!(sub["subscribe"]["channel"], "depth_book");
        assert_eq!(sub["subscribe"]["symbol"], "ETH-USD");
        let unsub = unsubscribe_frame(Symbol::EthUsd);
        assert_eq!(unsub["unsubscribe"]["symbol"], "ETH-USD");
    }
}
