//! Single-command sequences: each command is resent until the vehicle acknowledges it.
use std::sync::Arc;

use log::{debug, info, warn};
use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavResult, COMMAND_ACK_DATA, COMMAND_INT_DATA,
    COMMAND_LONG_DATA,
};
use tokio_util::sync::CancellationToken;

use crate::link::{Link, LinkError, Outcome};
use crate::metrics;
use crate::telemetry::{Position, Telemetry};

/// Magic `param2` that lets ArduPilot disarm even when it would normally refuse.
pub const FORCE_DISARM_MAGIC: f32 = 21196.0;
/// `DO_REPOSITION` flag: switch to guided mode on acceptance.
pub const REPOSITION_CHANGE_MODE: f32 = 1.0;
/// ArduRover `AUTO` custom mode.
pub const AUTO_MODE_ROVER: u32 = 10;

/// Addressing of the autopilot we command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            system: 1,
            component: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandOutcome {
    Accepted,
    Rejected(MavResult),
    Cancelled,
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted)
    }
}

/// Issues commands and mission uploads against one vehicle.
#[derive(Clone)]
pub struct Commander {
    pub(crate) link: Link,
    pub(crate) telemetry: Arc<Telemetry>,
    pub(crate) target: Target,
    auto_mode: u32,
}

impl Commander {
    pub fn new(link: Link, telemetry: Arc<Telemetry>, target: Target, auto_mode: u32) -> Self {
        Self {
            link,
            telemetry,
            target,
            auto_mode,
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub async fn arm(&self, cancel: &CancellationToken) -> Result<CommandOutcome, LinkError> {
        info!("Arming vehicle");
        let message = self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0]);
        self.execute(message, cancel).await
    }

    pub async fn disarm(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, LinkError> {
        info!("Disarming vehicle{}", if force { " (forced)" } else { "" });
        let p2 = if force { FORCE_DISARM_MAGIC } else { 0.0 };
        let message = self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0, p2]);
        self.execute(message, cancel).await
    }

    pub async fn set_mode(
        &self,
        custom_mode: u32,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, LinkError> {
        info!("Setting custom mode {}", custom_mode);
        // p1 = MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
        let message = self.command_long(MavCmd::MAV_CMD_DO_SET_MODE, [1.0, custom_mode as f32]);
        self.execute(message, cancel).await
    }

    /// Switch to the configured autonomous mode.
    pub async fn auto(&self, cancel: &CancellationToken) -> Result<CommandOutcome, LinkError> {
        self.set_mode(self.auto_mode, cancel).await
    }

    /// Reposition to `position` (`[lon, lat, _]`) at default speed, entering guided mode.
    pub async fn navigate(
        &self,
        position: Position,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, LinkError> {
        let [longitude, latitude, _] = position;
        info!("Navigating to lon={} lat={}", longitude, latitude);
        let message = MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            param1: -1.0,
            param2: REPOSITION_CHANGE_MODE,
            param3: 0.0,
            param4: 0.0,
            x: degrees_e7(latitude),
            y: degrees_e7(longitude),
            z: 0.0,
            command: MavCmd::MAV_CMD_DO_REPOSITION,
            target_system: self.target.system,
            target_component: self.target.component,
            frame: MavFrame::MAV_FRAME_GLOBAL,
            current: 0,
            autocontinue: 0,
        });
        self.execute(message, cancel).await
    }

    pub async fn set_mission_current(
        &self,
        seq: u16,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, LinkError> {
        debug!("Setting current mission item to {}", seq);
        let message =
            self.command_long(MavCmd::MAV_CMD_DO_SET_MISSION_CURRENT, [f32::from(seq), 0.0]);
        self.execute(message, cancel).await
    }

    /// Force-disarm if armed, reboot the autopilot, then forget the old uptime.
    pub async fn reboot(&self, cancel: &CancellationToken) -> Result<CommandOutcome, LinkError> {
        if self.telemetry.armed() {
            if let CommandOutcome::Cancelled = self.disarm(true, cancel).await? {
                return Ok(CommandOutcome::Cancelled);
            }
        }
        info!("Rebooting autopilot");
        let message = self.command_long(MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN, [1.0, 0.0]);
        let outcome = self.execute(message, cancel).await?;
        if outcome != CommandOutcome::Cancelled {
            self.telemetry.reset_boot_time();
        }
        Ok(outcome)
    }

    /// Send a `COMMAND_LONG`/`COMMAND_INT` until its `COMMAND_ACK` arrives.
    pub async fn execute(
        &self,
        message: MavMessage,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, LinkError> {
        let command = match &message {
            MavMessage::COMMAND_LONG(data) => data.command,
            MavMessage::COMMAND_INT(data) => data.command,
            other => {
                return Err(LinkError::Encode(format!(
                    "{} is not a command",
                    mavlink::Message::message_name(other)
                )))
            }
        };
        let ack = self.link.receive(command_ack(command), cancel);
        let outcome = match self.link.retry(&message, ack, cancel).await? {
            Outcome::Completed(MavResult::MAV_RESULT_ACCEPTED) => {
                debug!("Command {:?} accepted", command);
                CommandOutcome::Accepted
            }
            Outcome::Completed(result) => {
                warn!("Command {:?} failed: {:?}", command, result);
                metrics::inc_commands_rejected();
                CommandOutcome::Rejected(result)
            }
            Outcome::Cancelled => {
                debug!("Command {:?} cancelled", command);
                CommandOutcome::Cancelled
            }
        };
        Ok(outcome)
    }

    fn command_long(&self, command: MavCmd, [param1, param2]: [f32; 2]) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.target.system,
            target_component: self.target.component,
            command,
            confirmation: 0,
            param1,
            param2,
            param3: 0.0,
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        })
    }
}

/// Selector for the acknowledgement of `command`.
pub fn command_ack(
    command: MavCmd,
) -> impl FnMut(&MavMessage) -> Option<MavResult> + Send + 'static {
    move |message| match message {
        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: acked,
            result,
            ..
        }) if *acked == command => Some(*result),
        _ => None,
    }
}

/// Degrees to the `1e7`-scaled integer used by `*_INT` messages.
pub fn degrees_e7(degrees: f64) -> i32 {
    (degrees * 1e7).round() as i32
}
