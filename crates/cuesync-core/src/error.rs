//! Error taxonomy
//!
//! Every failure the sync subsystem can produce. None of these are fatal:
//! the transport retries, the decoder drops, the controller degrades.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Failure to establish the control connection
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The configured URL cannot be used for a WebSocket connection
    #[error("Invalid server URL '{url}': {details}")]
    InvalidUrl { url: String, details: String },

    /// Name resolution or TCP connect failed
    #[error("Could not reach '{url}': {source}")]
    Unreachable {
        url: String,
        #[source]
        source: io::Error,
    },

    /// TLS negotiation failed
    #[error("TLS handshake with '{url}' failed: {details}")]
    Tls { url: String, details: String },

    /// Server answered the HTTP upgrade with something other than 101
    #[error("Server at '{url}' refused the WebSocket upgrade (HTTP {status})")]
    UpgradeRefused { url: String, status: u16 },

    /// Handshake did not finish within the connect timeout
    #[error("Timed out connecting to '{url}' after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// Any other handshake failure
    #[error("WebSocket handshake with '{url}' failed: {details}")]
    Handshake { url: String, details: String },
}

impl ConnectError {
    /// Classify a WebSocket library error raised during the handshake
    pub fn from_ws(error: WsError, url: &str) -> Self {
        let url = url.to_string();
        match error {
            WsError::Io(source) => ConnectError::Unreachable { url, source },
            WsError::Tls(e) => ConnectError::Tls {
                url,
                details: e.to_string(),
            },
            WsError::Url(e) => ConnectError::InvalidUrl {
                url,
                details: e.to_string(),
            },
            WsError::Http(response) => ConnectError::UpgradeRefused {
                url,
                status: response.status().as_u16(),
            },
            other => ConnectError::Handshake {
                url,
                details: other.to_string(),
            },
        }
    }

    /// Retrying cannot fix a malformed URL; everything else may clear up.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectError::InvalidUrl { .. })
    }
}

/// Failure to push an outbound frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected to the control server")]
    NotConnected,

    #[error("Send did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Transport error while sending: {0}")]
    Transport(String),
}

/// A frame that could not be turned into a control command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not parseable as JSON (text) or CBOR/JSON (binary)
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame is not an object")]
    NotAnObject,

    #[error("Frame has no 'type' field")]
    MissingType,

    #[error("Unknown command type '{0}'")]
    UnknownType(String),

    #[error("'{command}' command is missing required field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("Invalid value for '{field}': {details}")]
    InvalidField {
        field: &'static str,
        details: String,
    },
}

/// The player rejected or could not perform an action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Player rejected {action}: {reason}")]
    Rejected { action: String, reason: String },

    #[error("Player does not support {0}")]
    Unsupported(&'static str),

    #[error("Player is unavailable: {0}")]
    Unavailable(String),
}

impl PlaybackError {
    /// Text shown to the user when sync degrades because of this error
    pub fn degraded_notice(&self) -> String {
        format!("Playback sync degraded: {}", self)
    }
}

/// Clock estimate is too uncertain to base corrective seeks on
#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Clock confidence {confidence:.2} is below the required {threshold:.2}")]
pub struct StaleClockError {
    pub confidence: f64,
    pub threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classified_as_unreachable() {
        let ws_err = WsError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let err = ConnectError::from_ws(ws_err, "ws://localhost:9");

        assert!(matches!(err, ConnectError::Unreachable { .. }));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("ws://localhost:9"));
    }

    #[test]
    fn test_other_errors_classified_as_handshake() {
        let err = ConnectError::from_ws(WsError::ConnectionClosed, "ws://host");
        assert!(matches!(err, ConnectError::Handshake { .. }));
    }

    #[test]
    fn test_invalid_url_not_retryable() {
        let err = ConnectError::InvalidUrl {
            url: "http//nope".to_string(),
            details: "no scheme".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::MissingField {
            command: "seek",
            field: "position",
        };
        let msg = err.to_string();
        assert!(msg.contains("seek"));
        assert!(msg.contains("position"));
    }

    #[test]
    fn test_degraded_notice() {
        let err = PlaybackError::Rejected {
            action: "seek".to_string(),
            reason: "position out of range".to_string(),
        };
        assert!(err.degraded_notice().starts_with("Playback sync degraded"));
    }

    #[test]
    fn test_stale_clock_display() {
        let err = StaleClockError {
            confidence: 0.25,
            threshold: 0.5,
        };
        assert_eq!(
            err.to_string(),
            "Clock confidence 0.25 is below the required 0.50"
        );
    }
}
