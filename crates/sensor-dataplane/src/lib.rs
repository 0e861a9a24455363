//! SDN Sensor Dataplane
//!
//! Per-core run-to-completion loop that pulls bursts off every port,
//! classifies each frame through the chains, answers the few protocols the
//! sensor speaks itself, and trades latency for power when traffic is light.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SENSOR ENGINE                         │
//! │                                                              │
//! │  ┌────────────────────┐          ┌────────────────────┐      │
//! │  │  sensor-worker-0   │   ...    │  sensor-worker-N   │      │
//! │  │                    │          │                    │      │
//! │  │  TX-DRAIN          │          │  TX-DRAIN          │      │
//! │  │    │ telemetry     │          │    │               │      │
//! │  │    ▼               │          │    ▼               │      │
//! │  │  RX-POLL (queue 0) │          │  RX-POLL (queue N) │      │
//! │  │    ▼               │          │    ▼               │      │
//! │  │  CLASSIFY ─────────┼──┐    ┌──┼─ CLASSIFY          │      │
//! │  │    ▼               │  │    │  │    ▼               │      │
//! │  │  IDLE-DECISION     │  │    │  │  IDLE-DECISION     │      │
//! │  └────────────────────┘  │    │  └────────────────────┘      │
//! │                          ▼    ▼                              │
//! │              ┌──────────────────────────┐                    │
//! │              │  ChainSet (Arc, shared)  │──▶ output queues   │
//! │              └──────────────────────────┘                    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ports are reached only through [`io::BurstIo`]; [`io::RingPorts`] drives
//! the loop in tests and benchmarks, `PacketSocketPorts` captures live
//! interfaces on Linux.

#![warn(clippy::all)]

pub mod context;
pub mod engine;
pub mod io;
pub mod power;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod tx;

pub use context::SensorContext;
pub use engine::Engine;
pub use io::{BurstIo, IoError, LinkStatus, Packet, RingPorts};
pub use power::{FreqHint, FrequencyScaler, IdleAction, NoopScaler, PowerController, SysfsScaler};
pub use scheduler::{Phase, Worker};
pub use stats::{CoreStats, PortStats, PortStatsTable};
pub use telemetry::{Telemetry, TelemetryReport};
pub use tx::TxBuffer;

#[cfg(target_os = "linux")]
pub use io::PacketSocketPorts;

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("{configured} ports configured but only {available} available")]
    PortMismatch { configured: usize, available: usize },

    #[error("port error: {0}")]
    Io(#[from] IoError),
}

/// Result type for the dataplane
pub type Result<T> = std::result::Result<T, EngineError>;
