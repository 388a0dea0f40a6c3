//! WebSocket relay for sensor-relay
//!
//! This module tracks open client connections and fans every text or
//! binary frame out to all other connected clients.

mod connection;
mod registry;
mod router;
mod server;

pub use connection::{Connection, ConnectionId, ConnectionState};
pub use registry::Registry;
pub use router::{BroadcastRouter, Delivery};
pub use server::{handle_connection, RelayServer};
