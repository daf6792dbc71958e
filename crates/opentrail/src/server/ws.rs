//! `/api/logs/stream`: WebSocket push of newly stored entries.
//!
//! One subscription per connection. Each entry arrives as a JSON text
//! frame. The server pings every 30 s and treats 60 s without any inbound
//! frame (pong included) as a dead peer; writes are bounded by a 10 s
//! deadline. The connection closes on error, deadline, service shutdown,
//! or a full subscriber registry.

use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::time::{interval_at, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use crate::state::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub async fn stream_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state))
}

async fn handle_stream(socket: WebSocket, state: AppState) {
    let mut subscription = state.service.subscribe();
    if !subscription.accepted() {
        warn!("closing stream: subscriber registry full");
        let mut socket = socket;
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let (mut sink, mut source) = socket.split();
    let mut shutdown = state.shutdown_rx();
    let mut pings = interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    pings.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            entry = subscription.receiver.recv() => match entry {
                Some(entry) => {
                    let payload = match serde_json::to_string(&entry) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("failed to serialize entry for stream: {}", e);
                            continue;
                        }
                    };
                    match timeout(WRITE_DEADLINE, sink.send(Message::Text(payload.into()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("stream write failed: {}", e);
                            break;
                        }
                        Err(_) => {
                            debug!("stream write deadline exceeded");
                            break;
                        }
                    }
                }
                // Service shut down and dropped the sender.
                None => break,
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Pongs and any other client frame refresh the read deadline.
                Some(Ok(_)) => last_inbound = Instant::now(),
            },
            _ = pings.tick() => {
                if last_inbound.elapsed() > READ_DEADLINE {
                    debug!("stream read deadline exceeded, closing");
                    break;
                }
                if timeout(WRITE_DEADLINE, sink.send(Message::Ping(Default::default())))
                    .await
                    .map_or(true, |r| r.is_err())
                {
                    debug!("stream ping failed, closing");
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = timeout(WRITE_DEADLINE, sink.send(Message::Close(None))).await;
                    break;
                }
            }
        }
    }

    state.service.unsubscribe(subscription.id);
    debug!("stream connection closed");
}
