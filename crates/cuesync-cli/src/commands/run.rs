//! Run command handler

use std::sync::Arc;

use anyhow::{Context, Result};

use cuesync_core::{Config, LocalClock, PlayerAdapter, SyncSession, SystemClock, VirtualPlayer};

use crate::output::{format_position, Output};

/// Options for `cuesync run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides config.server_url
    pub url: Option<String>,
    pub duration_ms: Option<i64>,
    pub rate_correction: bool,
}

impl RunOptions {
    fn server_url(&self, config: &Config) -> Result<String> {
        self.url
            .clone()
            .or_else(|| config.server_url.clone())
            .context(
                "No server URL configured. Pass --url or set one with:\n  \
                 cuesync config set server_url wss://your-server/control",
            )
    }
}

/// Follow the server with a simulated player until Ctrl-C
pub async fn run(config: &Config, options: RunOptions, output: &Output) -> Result<()> {
    let url = options.server_url(config)?;

    let clock: Arc<dyn LocalClock> = Arc::new(SystemClock);
    let mut player = VirtualPlayer::new(clock.clone());
    if let Some(duration_ms) = options.duration_ms {
        player = player.with_duration(duration_ms);
    }
    if options.rate_correction {
        player = player.with_rate_correction();
    }
    let player = Arc::new(player);

    let mut session = SyncSession::spawn(config, url.clone(), player.clone(), clock);
    output.message(&format!(
        "Following {} as {} (Ctrl-C to stop)",
        url,
        session.client_id()
    ));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = session.next_event() => match event {
                Some(event) => output.print_event(&event),
                None => break,
            },
        }
    }

    session.stop().await;
    output.success(&format!(
        "Stopped at {}",
        format_position(player.current_position().await)
    ));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_flag_overrides_config() {
        let config = Config {
            server_url: Some("ws://configured/control".to_string()),
            ..Config::default()
        };
        let options = RunOptions {
            url: Some("ws://flag/control".to_string()),
            ..RunOptions::default()
        };
        assert_eq!(options.server_url(&config).unwrap(), "ws://flag/control");
        assert_eq!(
            RunOptions::default().server_url(&config).unwrap(),
            "ws://configured/control"
        );
    }

    #[test]
    fn test_missing_url_is_an_error() {
        let err = RunOptions::default()
            .server_url(&Config::default())
            .unwrap_err();
        assert!(err.to_string().contains("No server URL"));
    }
}
