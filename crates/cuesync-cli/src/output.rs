//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use serde::Serialize;

use cuesync_core::{ControlCommand, SessionEvent};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Print one session event as it happens
    pub fn print_event(&self, event: &SessionEvent) {
        match self.format {
            OutputFormat::Human => {
                println!(
                    "{}  {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    describe_event(event)
                );
            }
            OutputFormat::Json => print_json(event),
            OutputFormat::Quiet => {
                // State changes and degradation only
                match event {
                    SessionEvent::StateChanged { state } => println!("{}", state.as_str()),
                    SessionEvent::Degraded { notice } => eprintln!("{}", notice),
                    _ => {}
                }
            }
        }
    }

    /// Print a decoded control command
    pub fn print_command(&self, command: &ControlCommand) {
        match self.format {
            OutputFormat::Human => println!("{}", describe_command(command)),
            OutputFormat::Json => print_json(command),
            OutputFormat::Quiet => println!("{}", command.name()),
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Print an informational message
    pub fn message(&self, msg: &str) {
        match self.format {
            OutputFormat::Human => println!("{}", msg),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({"message": msg}));
            }
            OutputFormat::Quiet => {}
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize output: {}", e),
    }
}

/// One-line summary of a session event
pub fn describe_event(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Connection { state } => format!("connection {:?}", state),
        SessionEvent::ConnectFailed { error, retry_in_ms } => {
            format!("{} (retrying in {}ms)", error, retry_in_ms)
        }
        SessionEvent::StateChanged { state } => format!("sync {}", state.as_str()),
        SessionEvent::IntentChanged { intent } => format!(
            "target {} from {}",
            if intent.playing { "playing" } else { "paused" },
            format_position(intent.position_ms)
        ),
        SessionEvent::Applied { actions } => {
            let actions: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
            format!("player: {}", actions.join(", "))
        }
        SessionEvent::Drift { sample } => format!(
            "drift {:+}ms at {}",
            sample.drift_ms,
            format_position(sample.expected_ms)
        ),
        SessionEvent::FrameRejected { reason } => format!("dropped frame: {}", reason),
        SessionEvent::Degraded { notice } => format!("⚠ {}", notice),
    }
}

/// One-line summary of a control command
pub fn describe_command(command: &ControlCommand) -> String {
    match command {
        ControlCommand::Play {
            position,
            reference_time,
        } => format!(
            "play from {} at server time {}",
            format_position(*position),
            reference_time
        ),
        ControlCommand::Pause {
            position: Some(position),
            reference_time,
        } => format!(
            "pause at {} (server time {})",
            format_position(*position),
            reference_time
        ),
        ControlCommand::Pause {
            position: None,
            reference_time,
        } => format!("pause (server time {})", reference_time),
        ControlCommand::Seek {
            position,
            reference_time,
        } => format!(
            "seek to {} at server time {}",
            format_position(*position),
            reference_time
        ),
        ControlCommand::Heartbeat { reference_time } => {
            format!("heartbeat at server time {}", reference_time)
        }
    }
}

/// Media position as `[h:]mm:ss.mmm`
pub fn format_position(ms: i64) -> String {
    let sign = if ms < 0 { "-" } else { "" };
    let ms = ms.unsigned_abs();
    let (hours, rest) = (ms / 3_600_000, ms % 3_600_000);
    let (minutes, rest) = (rest / 60_000, rest % 60_000);
    let (seconds, millis) = (rest / 1_000, rest % 1_000);

    if hours > 0 {
        format!(
            "{}{}:{:02}:{:02}.{:03}",
            sign, hours, minutes, seconds, millis
        )
    } else {
        format!("{}{:02}:{:02}.{:03}", sign, minutes, seconds, millis)
    }
}
