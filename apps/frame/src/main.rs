use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use broker::{MqttBroker, MqttConfig};
use clap::Parser;
use device_agent::{identity::device_id_from_machine_id, DeviceAgent, FrameSignals};
use shared::domain::DeviceId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RENDER_INTERVAL: Duration = Duration::from_millis(500);

/// Headless photo frame: type `skip` to advance the group, `quit` to exit.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,
    #[arg(long, env = "MQTT_USER")]
    user: Option<String>,
    #[arg(long, env = "MQTT_PASSWORD")]
    password: Option<String>,
    /// Overrides the name derived from the machine id.
    #[arg(long)]
    device_id: Option<String>,
    #[arg(long, default_value = "/etc/machine-id")]
    machine_id_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let device_id = resolve_device_id(&args)?;
    info!(%device_id, "starting frame");

    let mut config = MqttConfig::new(device_id.as_str(), &args.broker, args.port);
    config.username = args.user.clone();
    config.password = args.password.clone();
    let (broker, events, pump) = MqttBroker::connect(&config);

    let signals = FrameSignals::new();
    let agent = DeviceAgent::new(device_id, broker.clone(), signals.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent_task = tokio::spawn(agent.run(events, shutdown_rx.clone()));
    let renderer = tokio::spawn(render_loop(signals.clone(), shutdown_rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for shutdown signal")?;
                break;
            }
            joined = &mut agent_task => {
                let _ = shutdown_tx.send(true);
                joined.context("device agent panicked")??;
                return Ok(());
            }
            line = lines.next_line() => match line? {
                Some(line) if line.trim().eq_ignore_ascii_case("skip") => signals.request_skip(),
                Some(line) if line.trim().eq_ignore_ascii_case("quit") => break,
                Some(line) if line.trim().is_empty() => {}
                Some(line) => warn!(input = %line.trim(), "unknown command; use skip or quit"),
                None => break,
            },
        }
    }

    let _ = shutdown_tx.send(true);
    agent_task.await.context("device agent panicked")??;
    renderer.await.context("renderer panicked")?;
    if let Err(error) = broker.disconnect().await {
        warn!(%error, "mqtt disconnect failed");
    }
    pump.abort();
    Ok(())
}

fn resolve_device_id(args: &Args) -> Result<DeviceId> {
    if let Some(raw) = &args.device_id {
        return Ok(DeviceId::parse(raw)?);
    }
    let machine_id = fs::read_to_string(&args.machine_id_path).with_context(|| {
        format!(
            "failed to read machine id from '{}'; pass --device-id instead",
            args.machine_id_path.display()
        )
    })?;
    Ok(device_id_from_machine_id(&machine_id)?)
}

/// Stands in for the display: consumes refresh requests as they appear.
async fn render_loop(signals: FrameSignals, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(RENDER_INTERVAL);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if signals.take_refresh() {
                    info!("refresh requested; fetching current image");
                }
            }
        }
    }
}
