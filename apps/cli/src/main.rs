//! Run one conversation session in the terminal.
//!
//! Typed lines play the part of recognized speech; spoken output is
//! printed. Usage: `parley [config.json]`.

mod loopback;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parley_engine::{Engines, NullAudioDevice};
use parley_events::{EventBusRef, FanoutEventBus, TracingEventBus};
use parley_floor::AudioRoute;
use parley_turn::{CoordinatorHandle, ParleyConfig, TurnCoordinator};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::loopback::{
    ConsoleBus, ConsoleSynthesizer, GlossaryTranslator, OfflineTransport, StdinRecognizer,
};

const HELP: &str = "\
Type to speak. End a line with ... to keep talking.
  /pause  /resume  /status
  /route built_in|wired|bluetooth|assistive
  /low-power on|off
  /restart-transport
  /quit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,parley=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(std::env::args_os().nth(1).map(PathBuf::from))?;
    tracing::info!(
        local = %config.languages.local,
        remote = %config.languages.remote,
        "starting parley"
    );

    let recognizer = Arc::new(StdinRecognizer::default());
    let engines = Engines {
        recognizer: recognizer.clone(),
        translator: Arc::new(GlossaryTranslator),
        synthesizer: Arc::new(ConsoleSynthesizer::default()),
        transport: Arc::new(OfflineTransport),
        audio_device: Arc::new(NullAudioDevice),
    };
    let bus: EventBusRef = Arc::new(FanoutEventBus::new(vec![
        Arc::new(TracingEventBus) as EventBusRef,
        Arc::new(ConsoleBus),
    ]));

    let handle = TurnCoordinator::spawn(config, engines, bus)?;
    handle.start().await.context("failed to start listening")?;
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(command) = line.strip_prefix('/') {
            match run_command(&handle, command).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => println!("  ! {e:#}"),
            }
            continue;
        }
        if !recognizer.hear(line) {
            println!("  (not listening)");
        }
    }

    handle.shutdown().await?;
    let metrics = serde_json::to_string_pretty(&handle.metrics())?;
    tracing::info!(%metrics, "session ended");
    Ok(())
}

/// Returns false when the session should end.
async fn run_command(handle: &CoordinatorHandle, command: &str) -> Result<bool> {
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("quit"), _) => return Ok(false),
        (Some("pause"), _) => handle.pause()?,
        (Some("resume"), _) => handle.resume()?,
        (Some("restart-transport"), _) => handle.restart_transport()?,
        (Some("status"), _) => {
            let snapshot = handle.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            println!("{}", serde_json::to_string_pretty(&handle.metrics())?);
        }
        (Some("route"), Some(route)) => handle.set_route(parse_route(route)?)?,
        (Some("low-power"), Some(flag)) => handle.set_low_power(parse_switch(flag)?)?,
        _ => println!("{HELP}"),
    }
    Ok(true)
}

fn parse_route(name: &str) -> Result<AudioRoute> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .with_context(|| format!("unknown audio route {name:?}"))
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" => Ok(true),
        "off" | "false" => Ok(false),
        other => bail!("expected on or off, got {other:?}"),
    }
}

fn load_config(arg: Option<PathBuf>) -> Result<ParleyConfig> {
    let path = match arg {
        Some(path) => path,
        None => match dirs::config_dir().map(|dir| dir.join("parley").join("config.json")) {
            Some(path) if path.exists() => path,
            _ => {
                tracing::info!("no config file found, using defaults");
                return Ok(ParleyConfig::default());
            }
        },
    };
    ParleyConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_and_switch() {
        assert_eq!(parse_route("bluetooth").unwrap(), AudioRoute::Bluetooth);
        assert!(parse_route("hdmi").is_err());
        assert!(parse_switch("on").unwrap());
        assert!(!parse_switch("off").unwrap());
        assert!(parse_switch("maybe").is_err());
    }
}
