//! WebSocket connection handler for signaling peers.
//!
//! Implements the per-connection lifecycle: join the requested room, relay
//! every inbound frame to the room-mate, and tear the membership down exactly
//! once when the connection ends. A connection rejected from a full room is
//! sent a final notice and closed without ever entering the relay loop.

#![allow(clippy::future_not_send)]

use std::time::{Duration, Instant};

use actix_ws::Message;
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use tokio::{pin, sync::mpsc, time::interval};

use super::Msg;
use super::server::{JoinError, RelayServerHandle};

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Notice sent to a connection rejected from a room at capacity.
const ROOM_FULL_NOTICE: &str = "Room is full";

/// Handle the WebSocket lifecycle for one signaling peer.
///
/// Joins `room_id`, then loops: relay inbound text/binary frames to the
/// room-mate, forward relayed payloads out to the socket, respond to pings,
/// and monitor connection health. Runs until the peer closes, the stream
/// errors, the heartbeat times out, or the registry releases the connection;
/// afterwards the room membership is torn down and the socket closed.
pub async fn handle_ws(
    relay_server: RelayServerHandle,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
    room_id: String,
) {
    log::info!("connected");

    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let joined = match relay_server.join(room_id.clone(), conn_tx).await {
        Ok(joined) => joined,
        Err(err) => {
            log::info!("Rejecting connection to room id '{room_id}': {err}");
            if matches!(err, JoinError::RoomFull { .. }) {
                // best-effort notice; the peer may already be gone
                let _ = session.text(ROOM_FULL_NOTICE).await;
            }
            let _ = session.close(None).await;
            return;
        }
    };

    let conn_id = joined.conn_id;
    log::debug!("Connection id: {conn_id} room: {}", joined.room_name);

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // frames received from this peer
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => match msg {
                Message::Ping(bytes) => {
                    last_heartbeat = Instant::now();
                    if session.pong(&bytes).await.is_err() {
                        break None;
                    }
                }

                Message::Pong(_) => {
                    last_heartbeat = Instant::now();
                }

                Message::Text(text) => {
                    last_heartbeat = Instant::now();
                    let recipients = relay_server
                        .broadcast(&room_id, conn_id, Msg::Text(text.to_string()))
                        .await;
                    log::debug!("Relayed text frame from {conn_id} to {recipients} recipient(s)");
                }

                Message::Binary(bytes) => {
                    last_heartbeat = Instant::now();
                    let recipients = relay_server
                        .broadcast(&room_id, conn_id, Msg::Binary(bytes))
                        .await;
                    log::debug!("Relayed binary frame from {conn_id} to {recipients} recipient(s)");
                }

                Message::Close(reason) => break reason,

                _ => {
                    break None;
                }
            },

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("WebSocket stream error: {err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => {
                log::debug!("WebSocket stream ended");
                break None;
            }

            // payloads relayed from the room-mate
            Either::Left((Either::Right((Some(msg), _)), _)) => {
                let result = match msg {
                    Msg::Text(text) => session.text(text).await,
                    Msg::Binary(bytes) => session.binary(bytes).await,
                };

                if let Err(err) = result {
                    log::error!("Failed to send payload to conn_id={conn_id}: {err:?}");
                }
            }

            // all senders dropped: the registry released this connection
            Either::Left((Either::Right((None, _)), _)) => {
                log::debug!("Connection {conn_id} was released by the relay server");
                break None;
            }

            // heartbeat internal tick
            Either::Right((_inst, _)) => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "client has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        }
    };

    relay_server.leave(conn_id).await;

    // attempt to close connection gracefully
    let _ = session.close(close_reason).await;
}
