//! Fixed-interval supervisor: heartbeats, path recording and the one-shot startup and
//! reboot-watchdog triggers.
use std::time::Duration;

use log::{debug, error, info, warn};
use mavlink::common::{MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::command::{CommandOutcome, Commander};
use super::mission::StartOutcome;
use crate::config::Config;
use crate::telemetry::Position;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub tick: Duration,
    pub reboot_after: Duration,
    pub auto_start: bool,
    pub start_index: u16,
    pub waypoints: Vec<Position>,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick: Duration::from_millis(config.supervisor.tick_ms.max(1)),
            reboot_after: config.supervisor.reboot_after(),
            auto_start: config.supervisor.auto_start,
            start_index: config.supervisor.start_index,
            waypoints: config.mission.positions(),
        }
    }
}

/// Heartbeat we emit every tick so the autopilot keeps us as its ground station.
pub fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Reboot watchdog condition.
pub fn reboot_due(armed: bool, uptime: Duration, limit: Duration) -> bool {
    armed && uptime > limit
}

struct Supervisor {
    commander: Commander,
    settings: SupervisorSettings,
    started: bool,
    rebooted: bool,
}

impl Supervisor {
    fn tick(&mut self, sequences: &mut JoinSet<()>, shutdown: &CancellationToken) {
        let telemetry = self.commander.telemetry();
        telemetry.record_position();

        let uptime = telemetry.boot_elapsed();
        if !self.rebooted && reboot_due(telemetry.armed(), uptime, self.settings.reboot_after) {
            self.rebooted = true;
            warn!(
                "Vehicle armed with {}s uptime; scheduling reboot",
                uptime.as_secs()
            );
            telemetry.reset_boot_time();
            let commander = self.commander.clone();
            let cancel = shutdown.child_token();
            sequences.spawn(async move {
                match commander.reboot(&cancel).await {
                    Ok(CommandOutcome::Accepted) => info!("Reboot accepted"),
                    Ok(outcome) => warn!("Reboot not completed: {:?}", outcome),
                    Err(e) => error!("Reboot sequence failed: {}", e),
                }
            });
        }

        if !self.started {
            self.started = true;
            if self.settings.auto_start && self.settings.waypoints.is_empty() {
                info!("Auto start enabled but no mission waypoints are configured; skipping");
            } else if self.settings.auto_start {
                let commander = self.commander.clone();
                let cancel = shutdown.child_token();
                let waypoints = self.settings.waypoints.clone();
                let start_index = self.settings.start_index;
                sequences.spawn(async move {
                    match commander.start_mission(&waypoints, start_index, &cancel).await {
                        Ok(StartOutcome::Started) => {}
                        Ok(StartOutcome::Cancelled) => debug!("Mission start cancelled"),
                        Ok(outcome) => warn!("Mission start stopped: {:?}", outcome),
                        Err(e) => warn!("Mission start failed: {}", e),
                    }
                });
            }
        }
    }
}

/// Run until `shutdown` is cancelled. Spawned sequences are aborted on exit.
pub async fn run(commander: Commander, settings: SupervisorSettings, shutdown: CancellationToken) {
    info!(
        "Supervisor running every {}ms (auto start: {})",
        settings.tick.as_millis(),
        settings.auto_start
    );
    let heartbeat = gcs_heartbeat();
    let mut interval = tokio::time::interval(settings.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut supervisor = Supervisor {
        commander,
        settings,
        started: false,
        rebooted: false,
    };
    let mut sequences = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(joined) = sequences.join_next() => {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        error!("Supervisor sequence panicked: {}", e);
                    }
                }
            }
            _ = interval.tick() => {
                // A channel that stopped draining must not hold up shutdown
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    sent = supervisor.commander.link().write(&heartbeat) => {
                        if let Err(e) = sent {
                            warn!("Heartbeat send failed: {}", e);
                        }
                    }
                }
                supervisor.tick(&mut sequences, &shutdown);
            }
        }
    }
    sequences.shutdown().await;
    info!("Supervisor stopped");
}
