//! Test utilities: a simulated autopilot on the far end of an in-memory duplex channel.
//!
//! The autopilot decodes everything the link writes, records it with the (possibly paused)
//! tokio clock, and answers through a scripted responder.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use groundlink::config::Config;
use groundlink::link::{codec, Link, LinkIdentity, RetryTuning};
use groundlink::vehicle::Vehicle;
use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavMissionResult, MavModeFlag, MavResult, MavState,
    MavType, COMMAND_ACK_DATA, GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, MISSION_ACK_DATA,
    MISSION_REQUEST_DATA, MISSION_REQUEST_INT_DATA,
};
use mavlink::MavHeader;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

enum Outbound {
    Message(MavMessage),
    Raw(Vec<u8>),
}

pub struct Autopilot {
    received: Arc<Mutex<Vec<(Instant, MavMessage)>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

impl Autopilot {
    pub fn spawn<F>(stream: DuplexStream, mut respond: F) -> Self
    where
        F: FnMut(&MavMessage) -> Vec<MavMessage> + Send + 'static,
    {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
        let log = Arc::clone(&received);
        let task = tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(stream);
            let mut framer = codec::frame_decoder();
            let mut buf = [0u8; 1024];
            let mut sequence: u8 = 0;
            loop {
                let pending: Vec<Outbound> = tokio::select! {
                    read = rx.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        framer.push(&buf[..n]);
                        let mut replies = Vec::new();
                        while let Some(frame) = framer.next_frame() {
                            if let Some(message) = codec::decode(&frame) {
                                log.lock().unwrap().push((Instant::now(), message.clone()));
                                replies
                                    .extend(respond(&message).into_iter().map(Outbound::Message));
                            }
                        }
                        replies
                    }
                    Some(out) = outbound_rx.recv() => vec![out],
                };
                for out in pending {
                    let bytes = match out {
                        Outbound::Message(message) => {
                            let header = MavHeader {
                                system_id: 1,
                                component_id: 1,
                                sequence,
                            };
                            sequence = sequence.wrapping_add(1);
                            codec::encode(header, &message).unwrap()
                        }
                        Outbound::Raw(bytes) => bytes,
                    };
                    if tx.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
            }
        });
        Self {
            received,
            outbound,
            task,
        }
    }

    /// Send an unsolicited message to the link.
    pub fn send(&self, message: MavMessage) {
        let _ = self.outbound.send(Outbound::Message(message));
    }

    pub fn send_raw(&self, bytes: Vec<u8>) {
        let _ = self.outbound.send(Outbound::Raw(bytes));
    }

    pub fn received(&self) -> Vec<(Instant, MavMessage)> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&MavMessage) -> bool) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| pred(m))
            .count()
    }

    pub fn times(&self, pred: impl Fn(&MavMessage) -> bool) -> Vec<Instant> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| pred(m))
            .map(|(t, _)| *t)
            .collect()
    }

    pub fn messages(&self, pred: impl Fn(&MavMessage) -> bool) -> Vec<MavMessage> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| pred(m))
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Drop for Autopilot {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub fn silent(_: &MavMessage) -> Vec<MavMessage> {
    Vec::new()
}

/// Link plus simulated autopilot joined by an in-memory channel.
pub fn link_pair<F>(respond: F) -> (Link, Autopilot)
where
    F: FnMut(&MavMessage) -> Vec<MavMessage> + Send + 'static,
{
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let link = Link::open(ours, LinkIdentity::default(), RetryTuning::default());
    (link, Autopilot::spawn(theirs, respond))
}

pub fn vehicle_pair<F>(config: &Config, respond: F) -> (Vehicle, Autopilot)
where
    F: FnMut(&MavMessage) -> Vec<MavMessage> + Send + 'static,
{
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let vehicle = Vehicle::connect(ours, config);
    (vehicle, Autopilot::spawn(theirs, respond))
}

/// Default config with the supervisor switched off.
pub fn quiet_config() -> Config {
    let mut config = Config::default();
    config.supervisor.enabled = false;
    config.logging.file = None;
    config
}

/// Let spawned tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ---- message builders ----

pub fn ack(command: MavCmd, result: MavResult) -> MavMessage {
    MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
        command,
        result,
        ..Default::default()
    })
}

pub fn mission_request(seq: u16, legacy: bool) -> MavMessage {
    if legacy {
        MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA {
            seq,
            target_system: 255,
            target_component: 190,
            ..Default::default()
        })
    } else {
        MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            seq,
            target_system: 255,
            target_component: 190,
            ..Default::default()
        })
    }
}

pub fn mission_ack(result: MavMissionResult) -> MavMessage {
    MavMessage::MISSION_ACK(MISSION_ACK_DATA {
        target_system: 255,
        target_component: 190,
        mavtype: result,
        ..Default::default()
    })
}

pub fn vehicle_heartbeat(armed: bool) -> MavMessage {
    let mut base_mode = MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED;
    if armed {
        base_mode |= MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED;
    }
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GROUND_ROVER,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode,
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

pub fn global_position(lon: i32, lat: i32, alt: i32, time_boot_ms: u32) -> MavMessage {
    MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
        time_boot_ms,
        lat,
        lon,
        alt,
        ..Default::default()
    })
}

// ---- predicates ----

pub fn command_of(message: &MavMessage) -> Option<MavCmd> {
    match message {
        MavMessage::COMMAND_LONG(data) => Some(data.command),
        MavMessage::COMMAND_INT(data) => Some(data.command),
        _ => None,
    }
}

pub fn is_command(command: MavCmd) -> impl Fn(&MavMessage) -> bool {
    move |message| command_of(message) == Some(command)
}

pub fn item_seq(message: &MavMessage) -> Option<u16> {
    match message {
        MavMessage::MISSION_ITEM_INT(item) => Some(item.seq),
        _ => None,
    }
}

pub fn is_mission_count(message: &MavMessage) -> bool {
    matches!(message, MavMessage::MISSION_COUNT(_))
}

pub fn is_gcs_heartbeat(message: &MavMessage) -> bool {
    matches!(message, MavMessage::HEARTBEAT(hb) if hb.mavtype == MavType::MAV_TYPE_GCS)
}

/// Well-behaved autopilot: acknowledges every command and walks the mission protocol
/// in order, answering with `MISSION_REQUEST_INT` (or legacy `MISSION_REQUEST`).
pub fn cooperative(
    legacy_requests: bool,
) -> impl FnMut(&MavMessage) -> Vec<MavMessage> + Send + 'static {
    let mut count: u16 = 0;
    move |message| match message {
        MavMessage::COMMAND_LONG(data) => {
            vec![ack(data.command, MavResult::MAV_RESULT_ACCEPTED)]
        }
        MavMessage::COMMAND_INT(data) => {
            vec![ack(data.command, MavResult::MAV_RESULT_ACCEPTED)]
        }
        MavMessage::MISSION_COUNT(data) => {
            count = data.count;
            vec![mission_request(0, legacy_requests)]
        }
        MavMessage::MISSION_ITEM_INT(item) if item.seq + 1 < count => {
            vec![mission_request(item.seq + 1, legacy_requests)]
        }
        MavMessage::MISSION_ITEM_INT(_) => {
            vec![mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)]
        }
        _ => Vec::new(),
    }
}
