//! Config command handlers

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use cuesync_core::Config;

use crate::output::{Output, OutputFormat};

const VALID_KEYS: &str = "server_url, reconnect_base_delay_ms, reconnect_max_delay_ms, \
     drift_tolerance_ms, heartbeat_staleness_ms, drift_check_interval_ms, send_timeout_ms, \
     connect_timeout_ms, ping_interval_ms, smoothing_factor, clock_warmup_samples, \
     min_clock_confidence, max_rate_adjustment, log_file";

/// Show current configuration
pub fn show(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    match output.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        OutputFormat::Quiet => {
            println!("{}", config.server_url.as_deref().unwrap_or(""));
        }
        OutputFormat::Human => {
            let effective_path = config_path
                .cloned()
                .unwrap_or_else(Config::config_file_path);
            println!("Configuration:");
            println!(
                "  server_url:              {}",
                config.server_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  reconnect delay:         {}ms .. {}ms",
                config.reconnect_base_delay_ms, config.reconnect_max_delay_ms
            );
            println!("  drift_tolerance_ms:      {}", config.drift_tolerance_ms);
            println!("  drift_check_interval_ms: {}", config.drift_check_interval_ms);
            println!("  heartbeat_staleness_ms:  {}", config.heartbeat_staleness_ms);
            println!("  send_timeout_ms:         {}", config.send_timeout_ms);
            println!("  connect_timeout_ms:      {}", config.connect_timeout_ms);
            println!("  ping_interval_ms:        {}", config.ping_interval_ms);
            println!("  smoothing_factor:        {}", config.smoothing_factor);
            println!("  clock_warmup_samples:    {}", config.clock_warmup_samples);
            println!("  min_clock_confidence:    {}", config.min_clock_confidence);
            println!("  max_rate_adjustment:     {}", config.max_rate_adjustment);
            println!(
                "  log_file:                {}",
                config
                    .log_file
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(not set)".to_string())
            );
            println!();
            println!("Config file: {}", effective_path.display());
        }
    }

    Ok(())
}

/// Set a configuration value
pub fn set(
    key: String,
    value: String,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    let mut config =
        Config::load_with_cli_override(config_path).context("Failed to load configuration")?;

    apply(&mut config, &key, &value)?;
    config
        .validate()
        .with_context(|| format!("Refusing to set {} = {}", key, value))?;

    // Save to the CLI-specified path or default
    let save_path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);
    config
        .save_to_path(&save_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Set {} = {}", key, value));

    Ok(())
}

/// Print the config file location
pub fn path(config_path: Option<&PathBuf>, output: &Output) -> Result<()> {
    let path = config_path
        .cloned()
        .unwrap_or_else(Config::config_file_path);

    match output.format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "path": path })),
        _ => println!("{}", path.display()),
    }
    Ok(())
}

/// Update one field by name
fn apply(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let unset = value.is_empty() || value == "none";

    match key {
        "server_url" => {
            config.server_url = if unset { None } else { Some(value.to_string()) };
        }
        "log_file" => {
            config.log_file = if unset { None } else { Some(value.into()) };
        }
        "reconnect_base_delay_ms" => config.reconnect_base_delay_ms = parse(key, value)?,
        "reconnect_max_delay_ms" => config.reconnect_max_delay_ms = parse(key, value)?,
        "drift_tolerance_ms" => config.drift_tolerance_ms = parse(key, value)?,
        "heartbeat_staleness_ms" => config.heartbeat_staleness_ms = parse(key, value)?,
        "drift_check_interval_ms" => config.drift_check_interval_ms = parse(key, value)?,
        "send_timeout_ms" => config.send_timeout_ms = parse(key, value)?,
        "connect_timeout_ms" => config.connect_timeout_ms = parse(key, value)?,
        "ping_interval_ms" => config.ping_interval_ms = parse(key, value)?,
        "smoothing_factor" => config.smoothing_factor = parse(key, value)?,
        "clock_warmup_samples" => config.clock_warmup_samples = parse(key, value)?,
        "min_clock_confidence" => config.min_clock_confidence = parse(key, value)?,
        "max_rate_adjustment" => config.max_rate_adjustment = parse(key, value)?,
        _ => {
            bail!(
                "Unknown configuration key: '{}'\nValid keys: {}",
                key,
                VALID_KEYS
            );
        }
    }
    Ok(())
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(_) => bail!("Invalid value for {}: '{}'", key, value),
    }
}
