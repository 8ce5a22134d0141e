//! Vehicle telemetry state and the reducer that folds inbound messages into it.
//!
//! [`reduce`] is a pure function of the previous state and one message. [`Telemetry`]
//! wraps the latest state in a `tokio::sync::watch` channel so readers always see a
//! consistent snapshot and can await changes.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use mavlink::common::{MavMessage, MavModeFlag, MavType};
use serde::Serialize;
use tokio::sync::watch;

use crate::link::{Link, Subscription};
use crate::logutil::escape_padded;

/// `[longitude, latitude, altitude]` in degrees and metres.
pub type Position = [f64; 3];
/// `[pitch, yaw, roll]` in radians.
pub type Orientation = [f64; 3];

/// Default number of positions kept in [`VehicleState::path`].
pub const DEFAULT_PATH_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleState {
    /// Wall clock time of the last reduced message.
    pub time: DateTime<Utc>,
    /// Highest vehicle uptime (ms) reported so far; reset to 0 after a reboot.
    pub boot_time: u32,
    pub position: Position,
    pub orientation: Orientation,
    /// Current guidance target.
    pub target: Position,
    /// Recorded positions, newest first.
    pub path: VecDeque<Position>,
    pub armed: bool,
    /// Uptime the previous boot cycle had reached when `boot_time` was reset. Frames from
    /// that cycle still in flight report at least this much and are ignored.
    #[serde(skip)]
    stale_boot: Option<u32>,
}

impl Default for VehicleState {
    fn default() -> Self {
        Self {
            time: Utc::now(),
            boot_time: 0,
            position: [0.0; 3],
            orientation: [0.0; 3],
            target: [0.0; 3],
            path: VecDeque::new(),
            armed: false,
            stale_boot: None,
        }
    }
}

impl VehicleState {
    pub fn boot_elapsed(&self) -> Duration {
        Duration::from_millis(u64::from(self.boot_time))
    }

    /// Start a new boot cycle: `boot_time` drops to 0 and late frames from the old cycle
    /// are ignored until the vehicle reports a lower uptime.
    pub fn start_boot_cycle(&mut self) {
        if self.boot_time > 0 {
            self.stale_boot = Some(self.boot_time);
        }
        self.boot_time = 0;
    }
}

/// Fold one inbound message into `state`. Unrecognised messages only update `time`.
pub fn reduce(state: &mut VehicleState, message: &MavMessage, now: DateTime<Utc>) {
    state.time = now;
    match message {
        MavMessage::HEARTBEAT(hb) => {
            // Other ground stations share the link; only the vehicle reports arm state
            if hb.mavtype != MavType::MAV_TYPE_GCS {
                state.armed = hb
                    .base_mode
                    .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
            }
        }
        MavMessage::GLOBAL_POSITION_INT(gp) => {
            state.position = [
                f64::from(gp.lon) / 1e7,
                f64::from(gp.lat) / 1e7,
                f64::from(gp.alt) / 1e3,
            ];
            raise_boot_time(state, gp.time_boot_ms);
        }
        MavMessage::ATTITUDE(att) => {
            state.orientation = [
                f64::from(att.pitch),
                f64::from(att.yaw),
                f64::from(att.roll),
            ];
            raise_boot_time(state, att.time_boot_ms);
        }
        MavMessage::POSITION_TARGET_GLOBAL_INT(pt) => {
            state.target = [
                f64::from(pt.lon_int) / 1e7,
                f64::from(pt.lat_int) / 1e7,
                f64::from(pt.alt),
            ];
            raise_boot_time(state, pt.time_boot_ms);
        }
        MavMessage::LOCAL_POSITION_NED(m) => raise_boot_time(state, m.time_boot_ms),
        MavMessage::SYSTEM_TIME(m) => raise_boot_time(state, m.time_boot_ms),
        MavMessage::RC_CHANNELS(m) => raise_boot_time(state, m.time_boot_ms),
        MavMessage::SCALED_PRESSURE(m) => raise_boot_time(state, m.time_boot_ms),
        _ => {}
    }
}

fn raise_boot_time(state: &mut VehicleState, time_boot_ms: u32) {
    if let Some(stale) = state.stale_boot {
        if time_boot_ms >= stale {
            return;
        }
        state.stale_boot = None;
    }
    state.boot_time = state.boot_time.max(time_boot_ms);
}

/// Shared, observable telemetry state for one vehicle.
pub struct Telemetry {
    tx: watch::Sender<VehicleState>,
    path_capacity: usize,
}

impl Telemetry {
    pub fn new(path_capacity: usize) -> Self {
        let (tx, _rx) = watch::channel(VehicleState::default());
        Self { tx, path_capacity }
    }

    /// Subscribe the reducer to every message on `link`.
    pub fn attach(self: &Arc<Self>, link: &Link) -> Subscription {
        let telemetry = Arc::clone(self);
        link.read(move |message| telemetry.apply(message))
    }

    pub fn apply(&self, message: &MavMessage) {
        if let MavMessage::STATUSTEXT(st) = message {
            info!(
                "Vehicle status [{:?}]: {}",
                st.severity,
                escape_padded(&st.text[..])
            );
        }
        let now = Utc::now();
        self.tx.send_modify(|state| reduce(state, message, now));
    }

    /// Push the current position to the front of the path, bounded by capacity.
    pub fn record_position(&self) {
        let capacity = self.path_capacity;
        self.tx.send_modify(|state| {
            let position = state.position;
            state.path.push_front(position);
            state.path.truncate(capacity);
        });
    }

    pub fn reset_boot_time(&self) {
        self.tx.send_modify(VehicleState::start_boot_cycle);
    }

    pub fn snapshot(&self) -> VehicleState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<VehicleState> {
        self.tx.subscribe()
    }

    pub fn armed(&self) -> bool {
        self.tx.borrow().armed
    }

    pub fn boot_elapsed(&self) -> Duration {
        self.tx.borrow().boot_elapsed()
    }

    pub fn path_capacity(&self) -> usize {
        self.path_capacity
    }
}
