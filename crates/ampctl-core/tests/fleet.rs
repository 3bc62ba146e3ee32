//! Discovery and fleet operations across several simulated boards

use std::sync::Arc;
use std::time::Duration;

use ampctl_core::protocol::discovery::discover_all;
use ampctl_core::protocol::{display_values, Fleet, PortFailure, ProtocolError, SessionTimings};
use ampctl_core::settings::{ChannelSetting, SettingsTable};
use ampctl_core::sim::{SimOpener, SimulatedBoard, NAK};
use pretty_assertions::assert_eq;

fn timings() -> SessionTimings {
    SessionTimings {
        poll_interval: Duration::from_millis(1),
        commit_deadline: Duration::from_millis(50),
        save_deadline: Duration::from_millis(50),
        ..SessionTimings::default()
    }
}

fn fleet_of(opener: SimOpener) -> (Fleet, Vec<PortFailure>) {
    let ports = opener.ports();
    Fleet::discover(Arc::new(opener), &ports, timings())
}

#[test]
fn test_discovery_sorts_by_identifier() {
    let mut opener = SimOpener::new();
    opener.attach("/dev/ttyACM0", SimulatedBoard::new(7, 8));
    opener.attach("/dev/ttyACM1", SimulatedBoard::new(3, 8));

    let report = discover_all(&opener, &opener.ports(), Duration::from_millis(10));
    let found: Vec<(u8, &str)> = report
        .boards
        .iter()
        .map(|b| (b.identifier, b.port.as_str()))
        .collect();
    assert_eq!(found, vec![(3, "/dev/ttyACM1"), (7, "/dev/ttyACM0")]);
    assert!(report.failures.is_empty());
}

#[test]
fn test_silent_port_is_reported_not_fatal() {
    let mut opener = SimOpener::new();
    opener.attach("/dev/ttyACM0", SimulatedBoard::new(2, 4));
    let mut silent = SimulatedBoard::new(1, 4);
    silent.silent = true;
    opener.attach("/dev/ttyACM1", silent);

    let mut ports = opener.ports();
    ports.push("/dev/ttyACM9".to_string());
    let report = discover_all(&opener, &ports, Duration::from_millis(10));

    assert_eq!(report.boards.len(), 1);
    assert_eq!(report.boards[0].identifier, 2);
    let failed: Vec<&str> = report.failures.iter().map(|f| f.port.as_str()).collect();
    assert_eq!(failed, vec!["/dev/ttyACM1", "/dev/ttyACM9"]);
    assert!(matches!(
        report.failures[0].error,
        ProtocolError::MissingResponse { .. }
    ));
    assert!(report.failures[1].error.is_connection_error());
}

#[test]
fn test_fleet_queries_channel_counts() {
    let mut opener = SimOpener::new();
    opener.attach("a", SimulatedBoard::new(2, 4));
    opener.attach("b", SimulatedBoard::new(1, 6));

    let (fleet, failures) = fleet_of(opener);
    assert!(failures.is_empty());
    let boards: Vec<(u8, u8)> = fleet
        .boards()
        .iter()
        .map(|b| (b.identifier, b.channel_count))
        .collect();
    assert_eq!(boards, vec![(1, 6), (2, 4)]);
}

#[test]
fn test_demo_fleet_reads_every_board() {
    let (fleet, failures) = fleet_of(SimOpener::demo(3));
    assert!(failures.is_empty());
    assert_eq!(fleet.len(), 3);

    let identifiers: Vec<u8> = fleet.boards().iter().map(|b| b.identifier).collect();
    assert_eq!(identifiers, vec![1, 2, 3]);

    let outcomes = fleet.read_all();
    assert_eq!(outcomes.len(), 3);
    for outcome in &outcomes {
        let snapshot = outcome.result.as_ref().unwrap();
        assert!(snapshot.eot_received);
        assert_eq!(snapshot.channel_count(), 8);
    }
}

#[test]
fn test_apply_all_then_read_all() {
    let mut opener = SimOpener::new();
    opener.attach("a", SimulatedBoard::new(1, 4));
    opener.attach("b", SimulatedBoard::new(2, 4));
    let (fleet, _) = fleet_of(opener);

    let mut table = SettingsTable::new();
    table.import_all(fleet.boards(), &[10, 11, 12, 13], &[20, 21, 22, 23]);
    table.set(ChannelSetting {
        board_index: 1,
        channel_index: 3,
        gain: 4095,
        threshold: 0,
    });

    let applied = fleet.apply_all(&table);
    assert_eq!(applied.len(), 2);
    assert!(applied
        .iter()
        .all(|o| o.result.as_ref().map(|r| r.is_clean()).unwrap_or(false)));

    let mut read_back = SettingsTable::new();
    for (index, outcome) in fleet.read_all().iter().enumerate() {
        read_back.record_readout(index, outcome.result.as_ref().unwrap());
    }
    assert_eq!(read_back, table);
}

#[test]
fn test_apply_all_skips_boards_without_settings() {
    let mut opener = SimOpener::new();
    let first = opener.attach("a", SimulatedBoard::new(1, 2));
    let second = opener.attach("b", SimulatedBoard::new(2, 2));
    let (fleet, _) = fleet_of(opener);
    let opens_after_discovery = second.lock().unwrap().opens;

    let mut table = SettingsTable::new();
    table.import_board(0, 2, &[5, 6], &[7, 8]);
    let applied = fleet.apply_all(&table);

    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].board.identifier, 1);
    assert_eq!(second.lock().unwrap().opens, opens_after_discovery);
    assert_eq!(first.lock().unwrap().thresholds, vec![7, 8]);
}

#[test]
fn test_one_failing_board_does_not_stop_the_rest() {
    let mut opener = SimOpener::new();
    opener.attach("a", SimulatedBoard::new(1, 2));
    let flaky = opener.attach("b", SimulatedBoard::new(2, 2));
    opener.attach("c", SimulatedBoard::new(3, 2));
    let (fleet, _) = fleet_of(opener);
    assert_eq!(fleet.len(), 3);

    flaky.lock().unwrap().silent = true;
    let outcomes = fleet.read_all();
    let ok: Vec<bool> = outcomes.iter().map(|o| o.result.is_ok()).collect();
    assert_eq!(ok, vec![true, false, true]);

    let saved = fleet.save_all();
    assert!(saved[1].result.as_ref().unwrap_err().is_timeout());
    assert!(saved[0].result.is_ok());
    assert!(saved[2].result.is_ok());
}

#[test]
fn test_every_operation_reconnects() {
    let mut opener = SimOpener::new();
    let board = opener.attach("a", SimulatedBoard::new(1, 2));
    let (fleet, _) = fleet_of(opener);
    // identify plus channel count
    assert_eq!(board.lock().unwrap().opens, 2);

    fleet.read_all();
    fleet.toggle_led_all();
    fleet.save_all();
    assert_eq!(board.lock().unwrap().opens, 5);
    assert!(board.lock().unwrap().led_on);
}

#[test]
fn test_board_without_channel_count_is_excluded() {
    let mut opener = SimOpener::new();
    opener.attach("a", SimulatedBoard::new(1, 2));
    let mut broken = SimulatedBoard::new(2, 2);
    broken.reject_channel_query = true;
    opener.attach("b", broken);

    let (fleet, failures) = fleet_of(opener);
    assert_eq!(fleet.len(), 1);
    assert_eq!(fleet.boards()[0].port, "a");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].port, "b");
    assert!(matches!(
        failures[0].error,
        ProtocolError::NoAck { received: NAK, .. }
    ));
}

#[test]
fn test_cancel_token_is_shared_with_sessions() {
    let mut opener = SimOpener::new();
    let mut slow = SimulatedBoard::new(1, 2);
    slow.withhold_slow_ack = true;
    opener.attach("a", slow);
    let ports = opener.ports();
    let slow_timings = SessionTimings {
        save_deadline: Duration::from_secs(3600),
        ..timings()
    };
    let (fleet, _) = Fleet::discover(Arc::new(opener), &ports, slow_timings);

    fleet.cancel_token().cancel();
    let saved = fleet.save_all();
    assert!(matches!(
        saved[0].result,
        Err(ProtocolError::Cancelled { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_read_keeps_discovery_order() {
    let (fleet, _) = fleet_of(SimOpener::demo(4));
    let sequential = fleet.read_all();
    let concurrent = fleet.read_all_concurrent().await;

    assert_eq!(concurrent.len(), sequential.len());
    for (a, b) in sequential.iter().zip(&concurrent) {
        assert_eq!(a.board, b.board);
        assert_eq!(
            display_values(a.result.as_ref().unwrap()),
            display_values(b.result.as_ref().unwrap())
        );
    }
}
