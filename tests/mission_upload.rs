mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    cooperative, is_mission_count, item_seq, link_pair, mission_ack, mission_request, settle,
    silent, Autopilot,
};
use groundlink::link::Link;
use groundlink::telemetry::{Position, Telemetry};
use groundlink::vehicle::{Commander, MissionOutcome, Target, VehicleError};
use mavlink::common::{MavMessage, MavMissionResult};
use tokio_util::sync::CancellationToken;

fn waypoints(n: usize) -> Vec<Position> {
    (0..n)
        .map(|i| [-77.797865, 25.67776 + i as f64 * 0.001, 0.0])
        .collect()
}

fn commander(link: Link) -> Commander {
    Commander::new(link, Arc::new(Telemetry::new(16)), Target::default(), 10)
}

fn items_sent(pilot: &Autopilot, seq: u16) -> usize {
    pilot.count(|m| item_seq(m) == Some(seq))
}

#[tokio::test(start_paused = true)]
async fn in_order_peer_receives_each_item_exactly_once() {
    let (link, pilot) = link_pair(cooperative(false));
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(4), &cancel)
        .await
        .unwrap();
    settle().await;

    assert_eq!(outcome, MissionOutcome::Accepted);
    assert_eq!(pilot.count(is_mission_count), 1);
    for seq in 0..4 {
        assert_eq!(items_sent(&pilot, seq), 1, "item {} resent", seq);
    }
}

#[tokio::test(start_paused = true)]
async fn legacy_mission_requests_are_understood() {
    let (link, pilot) = link_pair(cooperative(true));
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(3), &cancel)
        .await
        .unwrap();
    assert_eq!(outcome, MissionOutcome::Accepted);
    settle().await;
    assert_eq!(pilot.count(|m| item_seq(m).is_some()), 3);
}

#[tokio::test(start_paused = true)]
async fn invalid_sequence_ack_does_not_complete_the_upload() {
    let mut last_item_seen = 0;
    let responder = move |message: &MavMessage| match message {
        MavMessage::MISSION_COUNT(_) => vec![mission_request(0, false)],
        MavMessage::MISSION_ITEM_INT(item) if item.seq < 2 => {
            vec![mission_request(item.seq + 1, false)]
        }
        MavMessage::MISSION_ITEM_INT(_) => {
            last_item_seen += 1;
            if last_item_seen == 1 {
                vec![mission_ack(MavMissionResult::MAV_MISSION_INVALID_SEQUENCE)]
            } else {
                vec![mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)]
            }
        }
        _ => Vec::new(),
    };
    let (link, pilot) = link_pair(responder);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(3), &cancel)
        .await
        .unwrap();
    settle().await;

    assert_eq!(outcome, MissionOutcome::Accepted);
    assert_eq!(items_sent(&pilot, 0), 1);
    assert_eq!(items_sent(&pilot, 1), 1);
    assert_eq!(items_sent(&pilot, 2), 2, "last item should be resent once");
}

#[tokio::test(start_paused = true)]
async fn final_error_ack_rejects_the_mission() {
    let responder = |message: &MavMessage| match message {
        MavMessage::MISSION_COUNT(_) => vec![mission_request(0, false)],
        MavMessage::MISSION_ITEM_INT(_) => {
            vec![mission_ack(MavMissionResult::MAV_MISSION_NO_SPACE)]
        }
        _ => Vec::new(),
    };
    let (link, _pilot) = link_pair(responder);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(1), &cancel)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        MissionOutcome::Rejected(MavMissionResult::MAV_MISSION_NO_SPACE)
    );
}

#[tokio::test(start_paused = true)]
async fn refused_count_ends_the_upload_before_any_item() {
    let responder = |message: &MavMessage| match message {
        MavMessage::MISSION_COUNT(_) => vec![mission_ack(MavMissionResult::MAV_MISSION_DENIED)],
        _ => Vec::new(),
    };
    let (link, pilot) = link_pair(responder);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(2), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(
        outcome,
        MissionOutcome::Rejected(MavMissionResult::MAV_MISSION_DENIED)
    );
    assert_eq!(pilot.count(is_mission_count), 1);
    assert_eq!(pilot.count(|m| item_seq(m).is_some()), 0);
}

#[tokio::test]
async fn empty_mission_is_refused_without_traffic() {
    let (link, pilot) = link_pair(silent);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let err = commander.upload_mission(&[], &cancel).await.unwrap_err();
    assert!(matches!(err, VehicleError::EmptyMission));
    settle().await;
    assert!(pilot.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_an_upload_stops_the_count_resends() {
    let (link, pilot) = link_pair(silent);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let task = {
        let commander = commander.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { commander.upload_mission(&waypoints(2), &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, MissionOutcome::Cancelled);

    let sent = pilot.count(is_mission_count);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(pilot.count(is_mission_count), sent);
    assert!(sent >= 3);
}

#[tokio::test(start_paused = true)]
async fn repeated_requests_for_sent_items_are_tolerated() {
    // Every item is answered with the next request followed by a re-request of itself
    let responder = |message: &MavMessage| match message {
        MavMessage::MISSION_COUNT(_) => vec![mission_request(0, false)],
        MavMessage::MISSION_ITEM_INT(item) if item.seq < 2 => vec![
            mission_request(item.seq + 1, false),
            mission_request(item.seq + 1, false),
            mission_request(item.seq, false),
        ],
        MavMessage::MISSION_ITEM_INT(_) => {
            vec![mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)]
        }
        _ => Vec::new(),
    };
    let (link, pilot) = link_pair(responder);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(3), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(outcome, MissionOutcome::Accepted);
    for seq in 0..3 {
        assert_eq!(items_sent(&pilot, seq), 1, "item {} resent", seq);
    }
}

#[tokio::test(start_paused = true)]
async fn out_of_order_requests_still_complete_the_upload() {
    let responder = |message: &MavMessage| match message {
        MavMessage::MISSION_COUNT(_) => vec![mission_request(0, false)],
        MavMessage::MISSION_ITEM_INT(item) if item.seq == 0 => {
            vec![mission_request(2, false), mission_request(1, false)]
        }
        MavMessage::MISSION_ITEM_INT(item) if item.seq == 2 => {
            vec![mission_ack(MavMissionResult::MAV_MISSION_ACCEPTED)]
        }
        _ => Vec::new(),
    };
    let (link, pilot) = link_pair(responder);
    let commander = commander(link);
    let cancel = CancellationToken::new();

    let outcome = commander
        .upload_mission(&waypoints(3), &cancel)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(outcome, MissionOutcome::Accepted);
    for seq in 0..3 {
        assert_eq!(items_sent(&pilot, seq), 1, "item {} resent", seq);
    }
}
