//! Transport channel to the control server
//!
//! Maintains one long-lived WebSocket connection, reconnecting with jittered
//! exponential backoff until shutdown.
//!
//! ## Usage
//!
//! ```ignore
//! let mut channel = spawn_channel(ChannelConfig::from(&config), cancel.clone());
//! while let Some(event) = channel.receive().await {
//!     // Connected / Frame / Closed / ConnectFailed
//! }
//! ```

mod backoff;
mod channel;

pub use backoff::{Connection, ReconnectPolicy};
pub use channel::{connect, spawn_channel, ChannelConfig, ChannelSender, TransportChannel};

use crate::error::ConnectError;

/// Raw inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected, not trying
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Connected and relaying frames
    Connected,
    /// Waiting for the next retry deadline
    Backoff,
}

/// Everything the channel reports to its consumer, in order
#[derive(Debug)]
pub enum ChannelEvent {
    /// Handshake completed; `reconnect` is false only for the first connection
    Connected { reconnect: bool },
    /// Inbound frame
    Frame(Frame),
    /// An established connection went away; a reconnect is already scheduled
    Closed { reason: String },
    /// A connection attempt failed
    ConnectFailed {
        error: ConnectError,
        retry_in: std::time::Duration,
    },
}
