//! The room registry and message relay.
//!
//! [`RelayServer`] is the single source of truth for room membership and the
//! only component that mutates the room mapping. Connections talk to it
//! through a cloneable [`RelayServerHandle`] over a command channel; every
//! membership mutation happens under the registry lock, so the full-room
//! check and the insertion of a joining connection are one atomic step and
//! two peers racing for the last slot can never both win.
//!
//! Call and spawn [`run`](RelayServer::run) to start processing commands.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use rand::Rng as _;
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ws::{ConnId, Msg, RoomId};

/// Maximum number of occupants in a room.
const ROOM_CAPACITY: usize = 2;

/// A command received by the [`RelayServer`].
#[derive(Debug, AsRefStr)]
enum Command {
    /// Registers a new connection with a room.
    Join {
        /// Room to join.
        room_id: RoomId,
        /// Channel sender for payloads relayed to this connection.
        conn_tx: mpsc::UnboundedSender<Msg>,
        /// Channel to send back the join outcome.
        res_tx: oneshot::Sender<Result<Joined, JoinError>>,
    },

    /// Removes a connection from its room.
    Leave {
        /// Connection ID to remove.
        conn: ConnId,
        /// Channel to signal completion.
        res_tx: oneshot::Sender<()>,
    },

    /// Relays a payload to the other occupants of a room.
    Broadcast {
        /// Room the sender belongs to.
        room_id: RoomId,
        /// Sending connection, excluded from delivery.
        conn: ConnId,
        /// The payload to relay.
        msg: Msg,
        /// Channel to send back the recipient count.
        res_tx: oneshot::Sender<usize>,
    },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    /// ID assigned to the connection.
    pub conn_id: ConnId,
    /// Display name of the joined room, for logging only.
    pub room_name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    /// The room already has two occupants. A third join is rejected, never
    /// queued.
    #[error("room '{room_name}' is full")]
    RoomFull { room_name: String },
    /// The caller supplied an empty room id. The HTTP layer validates this
    /// first; the registry rejects it again defensively.
    #[error("missing room identifier")]
    MissingRoomId,
}

/// An active connection registered with the relay.
#[derive(Debug, Clone)]
struct Connection {
    /// The room this connection occupies.
    room_id: RoomId,
    /// Channel for sending payloads to this connection.
    sender: mpsc::UnboundedSender<Msg>,
}

/// A room pairing up to two connections under a caller-supplied id.
#[derive(Debug)]
struct Room {
    /// Cosmetic display name (`"room<N>"`), used only for logging.
    name: String,
    /// Connections currently joined.
    occupants: BTreeSet<ConnId>,
}

/// The relay server.
///
/// Owns the mapping from room id to room state plus the reverse index from
/// connection to room.
#[derive(Debug)]
pub struct RelayServer {
    /// Map of connection IDs to their room and payload sender.
    connections: BTreeMap<ConnId, Connection>,

    /// Map of room id to room state. A room with no occupants is deleted,
    /// never retained empty.
    rooms: BTreeMap<RoomId, Room>,

    /// Count of rooms ever created; drives display names.
    rooms_created: usize,

    /// Tracks the number of currently connected visitors.
    visitor_count: Arc<AtomicUsize>,

    /// Command receiver.
    cmd_rx: flume::Receiver<Command>,

    token: CancellationToken,
}

impl RelayServer {
    pub fn new() -> (Self, RelayServerHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let token = CancellationToken::new();
        let handle = RelayServerHandle {
            cmd_tx,
            token: token.clone(),
        };

        (
            Self {
                connections: BTreeMap::new(),
                rooms: BTreeMap::new(),
                rooms_created: 0,
                visitor_count: Arc::new(AtomicUsize::new(0)),
                cmd_rx,
                token,
            },
            handle,
        )
    }

    /// Register a new connection with the requested room.
    ///
    /// Looks up or creates the room, enforces the occupancy limit, and
    /// assigns a fresh connection ID. Runs under the registry write lock, so
    /// the capacity check and the insertion are atomic.
    fn join(
        &mut self,
        room_id: &str,
        conn_tx: mpsc::UnboundedSender<Msg>,
    ) -> Result<Joined, JoinError> {
        if room_id.is_empty() {
            return Err(JoinError::MissingRoomId);
        }

        let rooms_created = &mut self.rooms_created;
        let room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            *rooms_created += 1;
            let name = format!("room{rooms_created}");
            log::info!("Opening new room {name} for id '{room_id}'");
            Room {
                name,
                occupants: BTreeSet::new(),
            }
        });

        if room.occupants.len() >= ROOM_CAPACITY {
            log::info!("Room {} is full, rejecting connection", room.name);
            return Err(JoinError::RoomFull {
                room_name: room.name.clone(),
            });
        }

        // register session with random connection ID
        let conn_id = rand::rng().random::<ConnId>();

        room.occupants.insert(conn_id);

        if room.occupants.len() > ROOM_CAPACITY {
            pairlink_assert::die_or_panic!(
                "room {} exceeded capacity: {} occupants",
                room.name,
                room.occupants.len()
            );
        }

        let occupancy = room.occupants.len();
        let room_name = room.name.clone();

        self.connections.insert(
            conn_id,
            Connection {
                room_id: room_id.to_string(),
                sender: conn_tx,
            },
        );

        let count = self.visitor_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Visitor count: {count}");

        log::info!("Connection {conn_id} joined {room_name} ({occupancy}/{ROOM_CAPACITY})");

        Ok(Joined { conn_id, room_name })
    }

    /// Unregister a connection from its room; delete the room once empty.
    ///
    /// Idempotent: a connection that has already left (or never joined) is a
    /// no-op. Dropping the registered sender closes the connection's outbound
    /// channel, which ends its message loop and releases the transport even
    /// if the caller forgot to.
    fn leave(&mut self, conn_id: ConnId) {
        let Some(connection) = self.connections.remove(&conn_id) else {
            log::debug!("Connection {conn_id} already removed");
            return;
        };

        let count = self.visitor_count.fetch_sub(1, Ordering::SeqCst) - 1;
        log::debug!("Visitor count: {count}");

        if let Some(room) = self.rooms.get_mut(&connection.room_id) {
            room.occupants.remove(&conn_id);
            log::info!(
                "Connection {conn_id} left {} ({}/{ROOM_CAPACITY})",
                room.name,
                room.occupants.len(),
            );

            if room.occupants.is_empty() {
                if let Some(room) = self.rooms.remove(&connection.room_id) {
                    log::info!("Removed empty room {}", room.name);
                }
                log::debug!("Current room count: {}", self.rooms.len());
            }
        }
    }

    /// Deliver a payload to every occupant of the sender's room except the
    /// sender itself, returning the number of recipients.
    ///
    /// Delivery is independent per recipient: a failed send is logged and
    /// neither aborts the fan-out nor removes the recipient from the room —
    /// removal only happens through the recipient's own message loop
    /// detecting its connection failure.
    fn broadcast(&self, room_id: &str, skip: ConnId, msg: &Msg) -> usize {
        let Some(room) = self.rooms.get(room_id) else {
            log::debug!("Broadcast to unknown room id '{room_id}'");
            return 0;
        };

        let mut recipients = 0;

        for conn_id in &room.occupants {
            if *conn_id == skip {
                continue;
            }

            if let Some(Connection { sender, .. }) = self.connections.get(conn_id) {
                // errors if client disconnected abruptly and hasn't been timed-out yet
                if let Err(err) = sender.send(msg.clone()) {
                    log::error!(
                        "Failed to send payload to connection {conn_id} in {}: {err:?}",
                        room.name
                    );
                } else {
                    recipients += 1;
                }
            }
        }

        recipients
    }

    async fn process_command(ctx: Arc<RwLock<Self>>, cmd: Command) -> io::Result<()> {
        let cmd_str = cmd.to_string();
        log::debug!("process_command: cmd={cmd_str}");

        match cmd {
            Command::Join {
                room_id,
                conn_tx,
                res_tx,
            } => {
                let response = ctx.write().await.join(&room_id, conn_tx);
                if res_tx.send(response).is_err() {
                    log::error!("Failed to send join response for room id '{room_id}'");
                }
            }

            Command::Leave { conn, res_tx } => {
                ctx.write().await.leave(conn);
                let _ = res_tx.send(());
            }

            Command::Broadcast {
                room_id,
                conn,
                msg,
                res_tx,
            } => {
                let recipients = ctx.read().await.broadcast(&room_id, conn, &msg);
                let _ = res_tx.send(recipients);
            }
        }

        log::debug!("process_command: Finished processing cmd {cmd_str}");

        Ok(())
    }

    pub async fn run(self) -> io::Result<()> {
        let token = self.token.clone();
        let cmd_rx = self.cmd_rx.clone();
        let ctx = Arc::new(RwLock::new(self));
        while let Ok(Ok(cmd)) = tokio::select!(
            () = token.cancelled() => {
                log::debug!("RelayServer was cancelled");
                Err(io::Error::new(io::ErrorKind::Interrupted, "Cancelled"))
            }
            cmd = cmd_rx.recv_async() => { Ok(cmd) }
        ) {
            log::trace!("Received RelayServer command {cmd}");
            tokio::spawn(Self::process_command(ctx.clone(), cmd));
        }

        log::debug!("Stopped RelayServer");

        Ok(())
    }
}

/// Handle and command sender for the relay server.
///
/// Reduces boilerplate of setting up response channels in WebSocket handlers.
#[derive(Debug, Clone)]
pub struct RelayServerHandle {
    cmd_tx: flume::Sender<Command>,
    token: CancellationToken,
}

impl RelayServerHandle {
    /// Register a payload sender with the requested room and obtain the
    /// assigned connection ID.
    ///
    /// # Errors
    ///
    /// * [`JoinError::RoomFull`] if the room already has two occupants
    /// * [`JoinError::MissingRoomId`] if `room_id` is empty
    pub async fn join(
        &self,
        room_id: RoomId,
        conn_tx: mpsc::UnboundedSender<Msg>,
    ) -> Result<Joined, JoinError> {
        log::trace!("Sending Join command");

        let (res_tx, res_rx) = oneshot::channel();

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Join {
                room_id,
                conn_tx,
                res_tx,
            })
            .await
        {
            pairlink_assert::die_or_error!("Failed to send command: {e:?}");
        }

        res_rx.await.unwrap_or_else(|e| {
            pairlink_assert::die_or_panic!("Failed to recv response from relay server: {e:?}")
        })
    }

    /// Relay a payload to the other occupants of the sender's room,
    /// returning the recipient count.
    ///
    /// Resolves once the fan-out completed; awaiting it from the sender's
    /// own message loop keeps that sender's payloads in send order.
    pub async fn broadcast(&self, room_id: &str, conn: ConnId, msg: Msg) -> usize {
        log::trace!("Sending Broadcast command");

        let (res_tx, res_rx) = oneshot::channel();

        if let Err(e) = self
            .cmd_tx
            .send_async(Command::Broadcast {
                room_id: room_id.to_string(),
                conn,
                msg,
                res_tx,
            })
            .await
        {
            pairlink_assert::die_or_error!("Failed to send command: {e:?}");
        }

        res_rx.await.unwrap_or_else(|e| {
            pairlink_assert::die_or_error!("Failed to recv response from relay server: {e:?}");
            0
        })
    }

    /// Unregister a connection and release its room slot.
    pub async fn leave(&self, conn: ConnId) {
        log::trace!("Sending Leave command");

        let (res_tx, res_rx) = oneshot::channel();

        if let Err(e) = self.cmd_tx.send_async(Command::Leave { conn, res_tx }).await {
            pairlink_assert::die_or_error!("Failed to send command: {e:?}");
        }

        res_rx.await.unwrap_or_else(|e| {
            pairlink_assert::die_or_error!("Failed to recv response from relay server: {e:?}");
        });
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn conn() -> (mpsc::UnboundedSender<Msg>, mpsc::UnboundedReceiver<Msg>) {
        mpsc::unbounded_channel()
    }

    fn text(payload: &str) -> Msg {
        Msg::Text(payload.to_string())
    }

    #[test_log::test]
    fn join_assigns_sequential_room_names() {
        let (mut server, _handle) = RelayServer::new();

        let (a_tx, _a_rx) = conn();
        let (b_tx, _b_rx) = conn();

        let a = server.join("alpha", a_tx).unwrap();
        let b = server.join("beta", b_tx).unwrap();

        assert_eq!(a.room_name, "room1");
        assert_eq!(b.room_name, "room2");
    }

    #[test_log::test]
    fn empty_room_id_is_rejected() {
        let (mut server, _handle) = RelayServer::new();

        let (tx, _rx) = conn();

        assert_eq!(server.join("", tx), Err(JoinError::MissingRoomId));
        assert!(server.rooms.is_empty());
    }

    #[test_log::test]
    fn third_join_is_rejected_and_room_keeps_both_occupants() {
        let (mut server, _handle) = RelayServer::new();

        let (a_tx, _a_rx) = conn();
        let (b_tx, _b_rx) = conn();
        let (c_tx, _c_rx) = conn();

        let a = server.join("r1", a_tx).unwrap();
        let b = server.join("r1", b_tx).unwrap();

        assert_eq!(
            server.join("r1", c_tx),
            Err(JoinError::RoomFull {
                room_name: "room1".to_string()
            })
        );

        let occupants = &server.rooms.get("r1").unwrap().occupants;
        assert_eq!(occupants.len(), 2);
        assert!(occupants.contains(&a.conn_id));
        assert!(occupants.contains(&b.conn_id));
    }

    #[test_log::test]
    fn leave_is_idempotent() {
        let (mut server, _handle) = RelayServer::new();

        let (tx, _rx) = conn();
        let joined = server.join("r2", tx).unwrap();

        server.leave(joined.conn_id);
        server.leave(joined.conn_id);

        assert!(server.rooms.is_empty());
        assert!(server.connections.is_empty());
    }

    #[test_log::test]
    fn empty_room_is_removed_from_registry() {
        let (mut server, _handle) = RelayServer::new();

        let (tx, _rx) = conn();
        let joined = server.join("r2", tx).unwrap();

        assert!(server.rooms.contains_key("r2"));

        server.leave(joined.conn_id);

        assert!(!server.rooms.contains_key("r2"));
    }

    #[test_log::test]
    fn room_survives_until_the_last_occupant_leaves() {
        let (mut server, _handle) = RelayServer::new();

        let (a_tx, _a_rx) = conn();
        let (b_tx, _b_rx) = conn();

        let a = server.join("r3", a_tx).unwrap();
        let b = server.join("r3", b_tx).unwrap();

        server.leave(a.conn_id);

        let occupants = &server.rooms.get("r3").unwrap().occupants;
        assert_eq!(occupants.len(), 1);
        assert!(occupants.contains(&b.conn_id));

        server.leave(b.conn_id);

        assert!(!server.rooms.contains_key("r3"));
    }

    #[test_log::test]
    fn broadcast_excludes_the_sender() {
        let (mut server, _handle) = RelayServer::new();

        let (a_tx, mut a_rx) = conn();
        let (b_tx, mut b_rx) = conn();

        let a = server.join("r1", a_tx).unwrap();
        let _b = server.join("r1", b_tx).unwrap();

        let recipients = server.broadcast("r1", a.conn_id, &text("hello"));

        assert_eq!(recipients, 1);
        assert_eq!(b_rx.try_recv().unwrap(), text("hello"));
        assert!(a_rx.try_recv().is_err());
    }

    #[test_log::test]
    fn broadcast_in_a_solo_room_reaches_nobody() {
        let (mut server, _handle) = RelayServer::new();

        let (tx, mut rx) = conn();
        let joined = server.join("solo", tx).unwrap();

        assert_eq!(server.broadcast("solo", joined.conn_id, &text("echo?")), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test_log::test]
    fn broadcast_survives_a_dead_recipient_channel() {
        let (mut server, _handle) = RelayServer::new();

        let (a_tx, _a_rx) = conn();
        let (b_tx, b_rx) = conn();

        let a = server.join("r1", a_tx).unwrap();
        let b = server.join("r1", b_tx).unwrap();

        // simulate an abruptly dead peer that has not been cleaned up yet
        drop(b_rx);

        assert_eq!(server.broadcast("r1", a.conn_id, &text("anyone?")), 0);

        // the dead peer is still an occupant; only its own leave removes it
        assert!(server.rooms.get("r1").unwrap().occupants.contains(&b.conn_id));
    }

    #[test_log::test]
    fn display_names_stay_unique_across_room_churn() {
        let (mut server, _handle) = RelayServer::new();

        let (a_tx, _a_rx) = conn();
        let a = server.join("recycled", a_tx).unwrap();
        assert_eq!(a.room_name, "room1");

        server.leave(a.conn_id);

        let (b_tx, _b_rx) = conn();
        let b = server.join("recycled", b_tx).unwrap();
        assert_eq!(b.room_name, "room2");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn concurrent_joins_fill_at_most_two_slots() {
        let (server, handle) = RelayServer::new();
        let server = tokio::spawn(server.run());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let (conn_tx, conn_rx) = mpsc::unbounded_channel();
                handle
                    .join("race".to_string(), conn_tx)
                    .await
                    .map(|joined| (joined, conn_rx))
            }));
        }

        let mut winners = Vec::new();
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(winner) => winners.push(winner),
                Err(JoinError::RoomFull { .. }) => rejected += 1,
                Err(err) => panic!("unexpected join error: {err}"),
            }
        }

        assert_eq!(winners.len(), 2);
        assert_eq!(rejected, 6);

        // each winner sees exactly one room-mate
        let (a, _a_rx) = &winners[0];
        assert_eq!(handle.broadcast("race", a.conn_id, text("ping")).await, 1);

        handle.shutdown();
        server.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn payloads_from_one_peer_arrive_in_send_order() {
        let (server, handle) = RelayServer::new();
        let server = tokio::spawn(server.run());

        let (a_tx, mut a_rx) = conn();
        let (b_tx, mut b_rx) = conn();

        let a = handle.join("ordered".to_string(), a_tx).await.unwrap();
        let _b = handle.join("ordered".to_string(), b_tx).await.unwrap();

        assert_eq!(handle.broadcast("ordered", a.conn_id, text("m1")).await, 1);
        assert_eq!(handle.broadcast("ordered", a.conn_id, text("m2")).await, 1);

        assert_eq!(b_rx.recv().await, Some(text("m1")));
        assert_eq!(b_rx.recv().await, Some(text("m2")));
        assert!(a_rx.try_recv().is_err());

        handle.shutdown();
        server.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn leaving_frees_a_slot_and_emptying_recreates_the_room() {
        let (server, handle) = RelayServer::new();
        let server = tokio::spawn(server.run());

        let (a_tx, _a_rx) = conn();
        let (b_tx, _b_rx) = conn();

        let a = handle.join("r3".to_string(), a_tx).await.unwrap();
        let b = handle.join("r3".to_string(), b_tx).await.unwrap();

        handle.leave(a.conn_id).await;

        // the room survived with one occupant, so a new peer lands in it
        let (c_tx, _c_rx) = conn();
        let c = handle.join("r3".to_string(), c_tx).await.unwrap();
        assert_eq!(c.room_name, a.room_name);

        handle.leave(b.conn_id).await;
        handle.leave(c.conn_id).await;

        // both occupants gone: the room was deleted, so rejoining creates a
        // fresh one with the next display name
        let (d_tx, _d_rx) = conn();
        let d = handle.join("r3".to_string(), d_tx).await.unwrap();
        assert_ne!(d.room_name, a.room_name);

        handle.shutdown();
        server.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn relays_binary_payloads_verbatim() {
        let (server, handle) = RelayServer::new();
        let server = tokio::spawn(server.run());

        let (a_tx, _a_rx) = conn();
        let (b_tx, mut b_rx) = conn();

        let a = handle.join("bin".to_string(), a_tx).await.unwrap();
        let _b = handle.join("bin".to_string(), b_tx).await.unwrap();

        let payload = bytes::Bytes::from_static(&[0x00, 0xff, 0x7f, 0x80]);
        let recipients = handle
            .broadcast("bin", a.conn_id, Msg::Binary(payload.clone()))
            .await;

        assert_eq!(recipients, 1);
        assert_eq!(b_rx.recv().await, Some(Msg::Binary(payload)));

        handle.shutdown();
        server.await.unwrap().unwrap();
    }
}
