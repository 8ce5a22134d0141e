//! # Configuration Management Module
//!
//! Groundlink is configured from a single TOML file. Every section except `[link]` and
//! `[logging]` may be omitted and falls back to its defaults.
//!
//! ## Configuration Structure
//!
//! - [`LinkConfig`] - Endpoint and MAVLink addressing
//! - [`RetryConfig`] - Resend window schedule
//! - [`SupervisorConfig`] - Tick loop, path recording, startup and reboot watchdog
//! - [`MissionConfig`] - Waypoints uploaded by the startup sequence
//! - [`LoggingConfig`] - Log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use groundlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("groundlink.toml").await?;
//!     let config = Config::load("groundlink.toml").await?;
//!     println!("Endpoint: {}", config.link.endpoint);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [link]
//! endpoint = "tcp:127.0.0.1:5760"
//! system_id = 255
//! component_id = 190
//! target_system = 1
//! target_component = 0
//!
//! [retry]
//! base_ms = 500
//! factor = 1.25
//! max_ms = 10000
//!
//! [supervisor]
//! tick_ms = 200
//! reboot_after_hours = 10.0
//! auto_start = true
//!
//! [[mission.waypoints]]
//! longitude = -77.797865
//! latitude = 25.67776
//! altitude = 0.0
//!
//! [logging]
//! level = "info"
//! file = "groundlink.log"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::link::{LinkIdentity, RetryTuning};
use crate::telemetry::{Position, DEFAULT_PATH_CAPACITY};
use crate::vehicle::command::{Target, AUTO_MODE_ROVER};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub link: LinkConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// `tcp:HOST:PORT` or `serial:PATH:BAUD`
    pub endpoint: String,
    #[serde(default = "default_system_id")]
    pub system_id: u8,
    #[serde(default = "default_component_id")]
    pub component_id: u8,
    #[serde(default = "default_target_system")]
    pub target_system: u8,
    #[serde(default)]
    pub target_component: u8,
}

fn default_system_id() -> u8 {
    255
}

fn default_component_id() -> u8 {
    190
}

fn default_target_system() -> u8 {
    1
}

impl LinkConfig {
    pub fn identity(&self) -> LinkIdentity {
        LinkIdentity {
            system_id: self.system_id,
            component_id: self.component_id,
        }
    }

    pub fn target(&self) -> Target {
        Target {
            system: self.target_system,
            component: self.target_component,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            factor: 1.25,
            max_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn tuning(&self) -> RetryTuning {
        RetryTuning {
            base: Duration::from_millis(self.base_ms),
            factor: self.factor.max(1.0),
            max: Duration::from_millis(self.max_ms.max(self.base_ms)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Run the tick loop at all (heartbeats, path, startup and watchdog)
    pub enabled: bool,
    pub tick_ms: u64,
    pub path_capacity: usize,
    pub reboot_after_hours: f64,
    /// Upload the mission and switch to AUTO on the first tick
    pub auto_start: bool,
    pub auto_mode: u32,
    pub start_index: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: 200,
            path_capacity: DEFAULT_PATH_CAPACITY,
            reboot_after_hours: 10.0,
            auto_start: true,
            auto_mode: AUTO_MODE_ROVER,
            start_index: 0,
        }
    }
}

impl SupervisorConfig {
    pub fn reboot_after(&self) -> Duration {
        if self.reboot_after_hours.is_finite() && self.reboot_after_hours > 0.0 {
            Duration::try_from_secs_f64(self.reboot_after_hours * 3600.0).unwrap_or(Duration::MAX)
        } else {
            Duration::MAX
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub longitude: f64,
    pub latitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

impl Waypoint {
    pub fn position(&self) -> Position {
        [self.longitude, self.latitude, self.altitude]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionConfig {
    #[serde(default)]
    pub waypoints: Vec<Waypoint>,
}

impl Default for MissionConfig {
    fn default() -> Self {
        let waypoint = |longitude, latitude| Waypoint {
            longitude,
            latitude,
            altitude: 0.0,
        };
        Self {
            waypoints: vec![
                waypoint(-77.797865, 25.67776),
                waypoint(-77.797865, 25.67876),
                waypoint(-77.797965, 25.67976),
                waypoint(-77.797965, 25.67076),
            ],
        }
    }
}

impl MissionConfig {
    pub fn positions(&self) -> Vec<Position> {
        self.waypoints.iter().map(Waypoint::position).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            link: LinkConfig {
                endpoint: "tcp:127.0.0.1:5760".to_string(),
                system_id: default_system_id(),
                component_id: default_component_id(),
                target_system: default_target_system(),
                target_component: 0,
            },
            retry: RetryConfig::default(),
            supervisor: SupervisorConfig::default(),
            mission: MissionConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("groundlink.log".to_string()),
            },
        }
    }
}
