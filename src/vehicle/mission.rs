//! Mission upload handshake and the mission start sequence.
//!
//! The upload follows the MAVLink mission protocol:
//!
//! ```text
//! GCS                          Vehicle
//!  | -- MISSION_COUNT(n) -------> |
//!  | <------ MISSION_REQUEST(0) - |
//!  | -- MISSION_ITEM_INT(0) ----> |
//!  | <------ MISSION_REQUEST(1) - |
//!  |            ...               |
//!  | -- MISSION_ITEM_INT(n-1) --> |
//!  | <----------- MISSION_ACK --- |
//! ```
//!
//! Every item runs its own resend loop. A loop stops resending once the vehicle asks for
//! the next item or the upload completes, so duplicated or reordered requests only cost
//! an extra frame.
use log::{debug, info, warn};
use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA,
};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::command::{degrees_e7, CommandOutcome, Commander, Target};
use crate::link::{Completion, Link, LinkError, Outcome, Receive};
use crate::metrics;
use crate::telemetry::Position;

#[derive(Debug, Error)]
pub enum VehicleError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("mission has no waypoints")]
    EmptyMission,

    #[error("mission has {0} waypoints, at most 65535 are supported")]
    MissionTooLarge(usize),

    #[error("mission item task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MissionOutcome {
    Accepted,
    Rejected(MavMissionResult),
    Cancelled,
}

/// How far the mission start sequence got.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StartOutcome {
    Started,
    MissionRefused(MavMissionResult),
    CommandRefused(&'static str, CommandOutcome),
    Cancelled,
}

impl Commander {
    /// Upload `waypoints` as the vehicle's mission.
    pub async fn upload_mission(
        &self,
        waypoints: &[Position],
        cancel: &CancellationToken,
    ) -> Result<MissionOutcome, VehicleError> {
        if waypoints.is_empty() {
            return Err(VehicleError::EmptyMission);
        }
        let count = u16::try_from(waypoints.len())
            .map_err(|_| VehicleError::MissionTooLarge(waypoints.len()))?;
        info!("Writing mission with {} waypoints", count);

        // Count phase: the vehicle answers with a request for item 0, or refuses with an ack
        let first_request = self.link.receive(item_request(0), cancel);
        let refusal = self.link.receive(mission_ack, cancel);
        let opened = async move {
            tokio::select! {
                requested = first_request => requested.map(|o| o.map(|_| None)),
                refused = refusal => refused.map(|o| o.map(Some)),
            }
        };
        let count_message = MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count,
            target_system: self.target.system,
            target_component: self.target.component,
            ..Default::default()
        });
        match self.link.retry(&count_message, opened, cancel).await? {
            Outcome::Cancelled => return Ok(MissionOutcome::Cancelled),
            Outcome::Completed(Some(result)) => {
                warn!("Mission count refused: {:?}", result);
                metrics::inc_mission_failures();
                return Ok(MissionOutcome::Rejected(result));
            }
            Outcome::Completed(None) => debug!("Vehicle requested mission item 0"),
        }

        let completion = self.link.completion(|message| match message {
            MavMessage::MISSION_ACK(ack)
                if ack.mavtype != MavMissionResult::MAV_MISSION_INVALID_SEQUENCE =>
            {
                Some(ack.mavtype)
            }
            _ => None,
        });

        // Subscribe every request wait before the first item goes out
        let last = count - 1;
        let plans: Vec<ItemPlan> = (0..count)
            .zip(waypoints)
            .map(|(seq, waypoint)| ItemPlan {
                seq,
                message: mission_item(self.target, seq, waypoint),
                // The count phase already consumed the request for item 0
                gate: (seq == last && seq > 0)
                    .then(|| self.link.receive(item_request(seq), cancel)),
                next: (seq != last).then(|| self.link.receive(item_request(seq + 1), cancel)),
            })
            .collect();

        let mut items = JoinSet::new();
        for plan in plans {
            items.spawn(send_item(
                self.link.clone(),
                plan,
                completion.clone(),
                cancel.clone(),
            ));
        }
        while let Some(joined) = items.join_next().await {
            joined??;
        }

        match completion.wait(cancel).await? {
            Outcome::Cancelled => Ok(MissionOutcome::Cancelled),
            Outcome::Completed(MavMissionResult::MAV_MISSION_ACCEPTED) => {
                info!("Mission write complete");
                Ok(MissionOutcome::Accepted)
            }
            Outcome::Completed(result) => {
                warn!("Mission write failure: {:?}", result);
                metrics::inc_mission_failures();
                Ok(MissionOutcome::Rejected(result))
            }
        }
    }

    /// Upload the mission, select `start_index`, arm if needed and switch to AUTO.
    /// Stops at the first step the vehicle does not accept.
    pub async fn start_mission(
        &self,
        waypoints: &[Position],
        start_index: u16,
        cancel: &CancellationToken,
    ) -> Result<StartOutcome, VehicleError> {
        match self.upload_mission(waypoints, cancel).await? {
            MissionOutcome::Accepted => {}
            MissionOutcome::Rejected(result) => return Ok(StartOutcome::MissionRefused(result)),
            MissionOutcome::Cancelled => return Ok(StartOutcome::Cancelled),
        }

        let outcome = self.set_mission_current(start_index, cancel).await?;
        if let Some(stop) = stopped("set mission current", outcome) {
            return Ok(stop);
        }
        if !self.telemetry.armed() {
            let outcome = self.arm(cancel).await?;
            if let Some(stop) = stopped("arm", outcome) {
                return Ok(stop);
            }
        }
        let outcome = self.auto(cancel).await?;
        if let Some(stop) = stopped("auto mode", outcome) {
            return Ok(stop);
        }
        info!("Mission started at item {}", start_index);
        Ok(StartOutcome::Started)
    }
}

fn stopped(step: &'static str, outcome: CommandOutcome) -> Option<StartOutcome> {
    match outcome {
        CommandOutcome::Accepted => None,
        CommandOutcome::Cancelled => Some(StartOutcome::Cancelled),
        rejected @ CommandOutcome::Rejected(_) => {
            Some(StartOutcome::CommandRefused(step, rejected))
        }
    }
}

struct ItemPlan {
    seq: u16,
    message: MavMessage,
    /// Last item of a multi-item mission: wait for its own request before the first write.
    gate: Option<Receive<u16>>,
    /// Non-last items: the request for the following item releases this one.
    next: Option<Receive<u16>>,
}

async fn send_item(
    link: Link,
    plan: ItemPlan,
    done: Completion<MavMissionResult>,
    cancel: CancellationToken,
) -> Result<Outcome<()>, LinkError> {
    let ItemPlan {
        seq,
        message,
        gate,
        next,
    } = plan;

    if let Some(gate) = gate {
        let opened = tokio::select! {
            requested = gate => requested.map(|o| o.map(|_| ())),
            settled = done.clone().wait(&cancel) => settled.map(|o| o.map(|_| ())),
        }?;
        if opened.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
    }
    if done.is_settled() {
        debug!("Mission already settled; item {} not sent", seq);
        return Ok(Outcome::Completed(()));
    }

    let released = async {
        match next {
            Some(next) => tokio::select! {
                requested = next => requested.map(|o| o.map(|_| ())),
                settled = done.clone().wait(&cancel) => settled.map(|o| o.map(|_| ())),
            },
            None => done.clone().wait(&cancel).await.map(|o| o.map(|_| ())),
        }
    };
    debug!("Sending mission item {}", seq);
    let outcome = link.retry(&message, released, &cancel).await?;
    debug!("Mission item {} released", seq);
    Ok(outcome)
}

/// Selector for a request of item `seq`, in either the int or the legacy form.
pub fn item_request(seq: u16) -> impl FnMut(&MavMessage) -> Option<u16> + Send + 'static {
    move |message| match message {
        MavMessage::MISSION_REQUEST_INT(request) if request.seq == seq => Some(seq),
        MavMessage::MISSION_REQUEST(request) if request.seq == seq => Some(seq),
        _ => None,
    }
}

fn mission_ack(message: &MavMessage) -> Option<MavMissionResult> {
    match message {
        MavMessage::MISSION_ACK(ack) => Some(ack.mavtype),
        _ => None,
    }
}

/// `MISSION_ITEM_INT` navigation waypoint for `[lon, lat, alt]`.
pub fn mission_item(target: Target, seq: u16, waypoint: &Position) -> MavMessage {
    let [longitude, latitude, altitude] = *waypoint;
    MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
        param1: 0.0,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        x: degrees_e7(latitude),
        y: degrees_e7(longitude),
        z: altitude as f32,
        seq,
        command: MavCmd::MAV_CMD_NAV_WAYPOINT,
        target_system: target.system,
        target_component: target.component,
        frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
        current: 0,
        autocontinue: 1,
        ..Default::default()
    })
}
