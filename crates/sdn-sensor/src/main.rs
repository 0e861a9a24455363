//! SDN Sensor - Main Entry Point
//!
//! # Usage
//!
//! ```bash
//! sdn-sensor -c /etc/sdn-sensor/sensor.json
//! RUST_LOG=sensor_dataplane=debug sdn-sensor --config sensor.json
//! ```

use anyhow::Context;
use clap::Parser;
use sensor_common::SensorConfig;
use sensor_dataplane::{BurstIo, Engine, FrequencyScaler, NoopScaler, SensorContext, SysfsScaler};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sdn-sensor")]
#[command(version)]
#[command(about = "Line-rate traffic sensor with filter chains and adaptive power control", long_about = None)]
struct Cli {
    /// Configuration document (JSON)
    #[arg(short, long, env = "SDN_SENSOR_CONFIG")]
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = SensorConfig::load(&cli.config)
        .with_context(|| format!("could not load configuration from {}", cli.config.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("SDN Sensor v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        ports = config.ports.len(),
        cores = config.cores,
        burst = config.scheduler.burst_size,
        "configuration loaded"
    );

    let io = open_ports(&config)?;
    let scaler = frequency_scaler(&config);
    let ctx = SensorContext::with_scaler(config, io, scaler).context("could not build sensor context")?;

    let mut engine = Engine::new(Arc::new(ctx));
    engine.start().context("could not start workers")?;

    let signal = wait_for_signal().await?;
    tracing::warn!(signal, "received fatal signal, shutting down");
    engine.stop();
    drop(engine);

    redeliver(signal);
    Ok(())
}

#[cfg(target_os = "linux")]
fn open_ports(config: &SensorConfig) -> anyhow::Result<Arc<dyn BurstIo>> {
    let ports = sensor_dataplane::PacketSocketPorts::open(&config.ports, config.cores)
        .context("could not open capture ports")?;
    Ok(Arc::new(ports))
}

#[cfg(not(target_os = "linux"))]
fn open_ports(_config: &SensorConfig) -> anyhow::Result<Arc<dyn BurstIo>> {
    anyhow::bail!("live capture needs AF_PACKET sockets, which only Linux provides")
}

fn frequency_scaler(config: &SensorConfig) -> Arc<dyn FrequencyScaler> {
    if !config.power.scaling {
        return Arc::new(NoopScaler);
    }
    match SysfsScaler::init(config.cores) {
        Ok(scaler) => Arc::new(scaler),
        Err(e) => {
            tracing::warn!(error = %e, "cpufreq scaling unavailable, running at current frequency");
            Arc::new(NoopScaler)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<i32> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = int.recv() => libc::SIGINT,
        _ = term.recv() => libc::SIGTERM,
        _ = hup.recv() => libc::SIGHUP,
        _ = quit.recv() => libc::SIGQUIT,
    };
    Ok(received)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<i32> {
    tokio::signal::ctrl_c().await?;
    Ok(2)
}

/// Restore the default disposition and deliver the signal again so the exit
/// status reflects it
#[cfg(unix)]
fn redeliver(signal: i32) {
    // SAFETY: resetting to SIG_DFL and raising are async-signal-safe and we
    // are on an ordinary thread, not inside a handler
    unsafe {
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

#[cfg(not(unix))]
fn redeliver(_signal: i32) {}
