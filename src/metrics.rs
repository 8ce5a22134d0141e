//! Process-wide link counters.
//! Cheap atomics bumped from the transport and the vehicle state machine; read with [`snapshot`].
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static FRAMES_DROPPED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_SENT: AtomicU64 = AtomicU64::new(0);
static RETRIES: AtomicU64 = AtomicU64::new(0);
static COMMANDS_REJECTED: AtomicU64 = AtomicU64::new(0);
static MISSION_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}

/// Frames discarded before dispatch: bad CRC, unknown message id, resync garbage.
pub fn inc_frames_dropped() {
    FRAMES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_messages_sent() {
    MESSAGES_SENT.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_retries() {
    RETRIES.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_commands_rejected() {
    COMMANDS_REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn inc_mission_failures() {
    MISSION_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub messages_sent: u64,
    pub retries: u64,
    pub commands_rejected: u64,
    pub mission_failures: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        frames_dropped: FRAMES_DROPPED.load(Ordering::Relaxed),
        messages_sent: MESSAGES_SENT.load(Ordering::Relaxed),
        retries: RETRIES.load(Ordering::Relaxed),
        commands_rejected: COMMANDS_REJECTED.load(Ordering::Relaxed),
        mission_failures: MISSION_FAILURES.load(Ordering::Relaxed),
    }
}
