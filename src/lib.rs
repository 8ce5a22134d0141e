//! # Groundlink - Ground-Control Link for MAVLink Vehicles
//!
//! Groundlink talks MAVLink v2 to an autopilot over an unreliable duplex byte channel
//! (TCP or serial). It keeps a live vehicle-state snapshot, issues acknowledged commands
//! and uploads missions, resending every request until the vehicle answers or the caller
//! cancels.
//!
//! ## Features
//!
//! - **Transport**: incremental v2 framing with CRC resync, typed dispatch, predicate-based
//!   waits and resend-with-backoff ([`link`])
//! - **Telemetry**: position, attitude, guidance target, arm state, uptime and a bounded
//!   position history ([`telemetry`])
//! - **Commands**: arm, disarm, mode changes, reposition, mission current, reboot
//!   ([`vehicle::command`])
//! - **Missions**: concurrent per-item upload handshake ([`vehicle::mission`])
//! - **Supervisor**: GCS heartbeat, path recording, auto-start and reboot watchdog
//!   ([`vehicle::supervisor`])
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use groundlink::channel::{open_link, Endpoint};
//! use groundlink::config::Config;
//! use groundlink::vehicle::Vehicle;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("groundlink.toml").await?;
//!     let endpoint: Endpoint = config.link.endpoint.parse()?;
//!     let link = open_link(&endpoint, config.link.identity(), config.retry.tuning()).await?;
//!     let vehicle = Vehicle::attach(link, &config);
//!
//!     vehicle.navigate([-77.79, 25.68, 0.0]).await?;
//!     println!("{:?}", vehicle.state().position);
//!     vehicle.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Supervisor    │ ← heartbeat, startup, watchdog
//! └─────────────────┘
//!          │
//! ┌─────────────────┐   ┌─────────────────┐
//! │ Commands/Mission│   │    Telemetry    │ ← reducer over inbound messages
//! └─────────────────┘   └─────────────────┘
//!          │                     │
//! ┌─────────────────────────────────────────┐
//! │   Link (framer, codec, waits, retry)    │
//! └─────────────────────────────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Channel (TCP /  │
//! │ serial)         │
//! └─────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod link;
pub mod logutil;
pub mod metrics;
pub mod telemetry;
pub mod vehicle;
