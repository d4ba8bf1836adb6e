//! WebSocket relay server and connection handling.
//!
//! This module pairs peers into capacity-2 rooms and relays every payload a
//! peer sends to its room-mate. The registry lives in [`server`], the
//! per-connection message loop in [`handler`], and the upgrade endpoint in
//! [`api`].

pub mod api;
pub mod handler;
pub mod server;

/// Connection ID type for identifying WebSocket clients.
///
/// Each connected client is assigned a unique numeric identifier.
pub type ConnId = u64;

/// Room ID type identifying a relay room.
///
/// Room ids are caller-supplied keys; the server never generates them.
pub type RoomId = String;

/// Payload relayed between room occupants.
///
/// Payloads are opaque: the relay never parses or transforms them, and the
/// inbound frame kind is preserved end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    Text(String),
    Binary(bytes::Bytes),
}
