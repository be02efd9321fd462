use axum::extract::ws::{Message as WsMessage, WebSocket};
use chrono::Utc;
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{self, action};
use crate::config::RelayConfig;
use crate::model::ClientId;
use crate::room::{ClientHandle, RoomHandle};

/// Drives one connection's reader and writer tasks until either exits, then
/// unregisters the client from its room. The reader keeps its own clone of
/// `outbound_tx` alive for pong replies, so the outbound channel closing on
/// drop can't signal "the room is done with this client". The room signals
/// that explicitly via `close`, exactly once, from its unregister/cancel
/// handlers, and the writer awaits that token directly instead.
pub async fn run(socket: WebSocket, room: RoomHandle, client_id: ClientId, auction_id: String, config: RelayConfig) {
    let (ws_tx, ws_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
    let close = CancellationToken::new();

    room.register(ClientHandle {
        id: client_id.clone(),
        outbound: outbound_tx.clone(),
        close: close.clone(),
    })
    .await;

    let reader = reader_loop(ws_rx, room.clone(), outbound_tx.clone(), client_id.clone(), auction_id.clone(), config.clone());
    let writer = writer_loop(ws_tx, outbound_rx, close.clone(), config.clone());

    tokio::select! {
        _ = reader => {},
        _ = writer => {},
    }

    room.unregister(client_id).await;
}

/// Reads frames off the socket until the connection closes, a decode-level
/// error occurs, or `config.read_idle` passes with nothing received. Every
/// read is wrapped in that idle deadline, which is implicitly reset on each
/// iteration simply by waiting on `next()` again; a pong is treated the same
/// as any other successful read for that purpose. Decoded text frames are
/// handed off to `handle_frame`; anything else recognized by the protocol
/// (pong, close) is handled inline, and unsupported frame kinds are logged
/// and dropped rather than ending the session.
async fn reader_loop(
    mut ws_rx: SplitStream<WebSocket>,
    room: RoomHandle,
    outbound_tx: mpsc::Sender<String>,
    client_id: ClientId,
    auction_id: String,
    config: RelayConfig,
) {
    loop {
        let next = match timeout(config.read_idle, ws_rx.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(err))) => {
                debug!(client_id = %client_id, error = %err, "read error");
                return;
            }
            Ok(None) => {
                debug!(client_id = %client_id, "connection closed by peer");
                return;
            }
            Err(_) => {
                debug!(client_id = %client_id, "read idle timeout");
                return;
            }
        };

        match next {
            WsMessage::Text(text) => {
                handle_frame(&text, &room, &outbound_tx, &client_id, &auction_id).await;
            }
            WsMessage::Pong(_) => {
                // Deadline already reset by the outer timeout on every
                // successful read; nothing else to do.
            }
            WsMessage::Close(_) => {
                debug!(client_id = %client_id, "client sent close frame");
                return;
            }
            WsMessage::Binary(_) | WsMessage::Ping(_) => {
                debug!(client_id = %client_id, "dropping unsupported frame kind");
            }
        }
    }
}

/// Decodes one inbound text frame and dispatches it. A decode failure is
/// logged and the frame is dropped; it never tears down the connection over
/// a single malformed message. An empty `senderId` is filled in from the
/// session's own client id before dispatch, matching the protocol's
/// "fill from session id" rule. Only `bid / place_bid` with a positive price
/// and `ping` are acted on; every other `(type, action)` combination is
/// logged and dropped.
async fn handle_frame(
    text: &str,
    room: &RoomHandle,
    outbound_tx: &mpsc::Sender<String>,
    client_id: &ClientId,
    auction_id: &str,
) {
    let mut message = match codec::decode(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(client_id = %client_id, error = %err, "decode error, dropping frame");
            return;
        }
    };

    if message.sender_id.as_deref().unwrap_or("").is_empty() {
        message.sender_id = Some(client_id.0.clone());
    }

    match message.kind {
        codec::MessageType::Bid if message.action.as_deref() == Some(action::PLACE_BID) => {
            match message.bidding_price {
                Some(price) if price > 0.0 => {
                    room.bid(client_id.clone(), price).await;
                }
                _ => {
                    debug!(client_id = %client_id, "invalid bid: non-positive or missing price");
                }
            }
        }
        codec::MessageType::Ping => {
            let reply = codec::Message::pong(auction_id, &client_id.0, Utc::now());
            if let Ok(encoded) = codec::encode(&reply) {
                // Non-blocking with a bounded wait, same contract as room sends.
                if timeout(crate::config::QUEUE_STUCK_TIMEOUT, outbound_tx.send(encoded))
                    .await
                    .is_err()
                {
                    warn!(client_id = %client_id, "stuck queue replying to ping");
                }
            }
        }
        _ => {
            debug!(client_id = %client_id, kind = ?message.kind, action = ?message.action, "unhandled message, dropping");
        }
    }
}

/// Drains the outbound queue onto the socket, answers a ticking keepalive
/// ping, and exits on whichever comes first: the per-client `close` token
/// firing (room-initiated teardown), the queue itself closing (defensive;
/// in practice `close` fires before this can happen), or a write that
/// doesn't complete within `config.write_deadline`. Every branch that ends
/// the loop on a room-initiated close attempts a best-effort WebSocket close
/// frame first; a failed write there is not itself treated as fatal since
/// the loop is already exiting.
async fn writer_loop(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<String>,
    close: CancellationToken,
    config: RelayConfig,
) {
    let mut ticker = tokio::time::interval(config.ping_interval());
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = close.cancelled() => {
                let _ = timeout(config.write_deadline, ws_tx.send(WsMessage::Close(None))).await;
                return;
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if timeout(config.write_deadline, ws_tx.send(WsMessage::Text(frame))).await.is_err() {
                            return;
                        }
                    }
                    None => {
                        let _ = timeout(config.write_deadline, ws_tx.send(WsMessage::Close(None))).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if timeout(config.write_deadline, ws_tx.send(WsMessage::Ping(Vec::new()))).await.is_err() {
                    return;
                }
            }
        }
    }
}
