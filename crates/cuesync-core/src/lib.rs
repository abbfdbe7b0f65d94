//! cuesync core library
//!
//! Keeps a local media player in step with a playback timeline declared by a
//! remote control server.
//!
//! # Architecture
//!
//! - **Transport**: one persistent WebSocket connection with jittered
//!   exponential backoff
//! - **Command decoding**: JSON or CBOR frames into typed control commands
//! - **Clock estimation**: heartbeats smoothed into a local clock offset
//! - **Controller**: pure state machine turning commands and drift into plans
//! - **Session**: the single task that executes plans against the player
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let clock = Arc::new(SystemClock);
//! let player = Arc::new(VirtualPlayer::new(clock.clone()));
//!
//! let mut session = SyncSession::spawn(&config, "wss://example.com/control", player, clock);
//! while let Some(event) = session.next_event().await {
//!     println!("{:?}", event);
//! }
//! ```
//!
//! # Modules
//!
//! - `transport`: WebSocket channel and reconnect policy
//! - `command`: inbound commands, outbound client messages
//! - `clock`: local clocks and the timeline estimator
//! - `controller`: sync state machine
//! - `player`: player adapter trait and virtual player
//! - `session`: runtime loop
//! - `config`: application configuration
//! - `error`: error types

pub mod clock;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod player;
pub mod session;
pub mod transport;

pub use clock::{ClockOffset, LocalClock, ManualClock, SystemClock, TimelineEstimator};
pub use command::{decode, ClientMessage, ControlCommand};
pub use config::Config;
pub use controller::{PlaybackIntent, SyncController, SyncState};
pub use error::{ConnectError, DecodeError, PlaybackError, SendError, StaleClockError};
pub use player::{PlayerAdapter, PlayerEvent, PlayerSnapshot, VirtualPlayer};
pub use session::{SessionEvent, SessionHandle, SyncSession};
pub use transport::{ChannelEvent, ConnectionState, Frame, TransportChannel};
