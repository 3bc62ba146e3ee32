//! Board session behaviour against simulated boards

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ampctl_core::protocol::{
    display_values, BoardSession, ChannelValues, ProtocolError, SessionTimings, ValueKind, ACK,
};
use ampctl_core::settings::ChannelSetting;
use ampctl_core::sim::{SimOpener, SimulatedBoard, NAK};
use pretty_assertions::assert_eq;

const PORT: &str = "/dev/ttyACM0";

/// Log sink shared between a test and its subscriber
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

/// Run `f` with logs at `level` and above captured as plain text
fn capture_logs<T>(level: tracing::Level, f: impl FnOnce() -> T) -> (T, String) {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(level)
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, logs.contents())
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn fast_timings() -> SessionTimings {
    SessionTimings {
        poll_interval: Duration::from_millis(1),
        commit_deadline: Duration::from_millis(50),
        save_deadline: Duration::from_millis(50),
        ..SessionTimings::default()
    }
}

fn session_with(board: SimulatedBoard) -> (BoardSession, Arc<Mutex<SimulatedBoard>>) {
    let mut opener = SimOpener::new();
    let handle = opener.attach(PORT, board);
    (
        BoardSession::new(Arc::new(opener), PORT, fast_timings()),
        handle,
    )
}

fn settings(values: &[(u16, u16)]) -> Vec<ChannelSetting> {
    values
        .iter()
        .enumerate()
        .map(|(ch, &(gain, threshold))| ChannelSetting {
            board_index: 0,
            channel_index: ch as u8,
            gain,
            threshold,
        })
        .collect()
}

#[test]
fn test_channel_count_requires_ack() {
    let (session, _) = session_with(SimulatedBoard::new(7, 8));
    assert_eq!(session.get_channel_count().unwrap(), 8);

    let mut silent = SimulatedBoard::new(7, 8);
    silent.silent = true;
    let (session, _) = session_with(silent);
    assert!(matches!(
        session.get_channel_count(),
        Err(ProtocolError::MissingResponse { .. })
    ));

    let mut rejecting = SimulatedBoard::new(7, 8);
    rejecting.reject_channel_query = true;
    let (session, _) = session_with(rejecting);
    assert!(matches!(
        session.get_channel_count(),
        Err(ProtocolError::NoAck { received: NAK, .. })
    ));
}

#[test]
fn test_gain_ch0_goes_to_wire_channel_1() {
    let (session, board) = session_with(SimulatedBoard::new(1, 4));

    let mut link = session.link(4).unwrap();
    link.set_gain(0, 4095).unwrap();
    drop(link);

    let board = board.lock().unwrap();
    assert_eq!(board.received, b"SG1/15/255/".to_vec());
    assert_eq!(board.gains, vec![0, 4095, 0, 0]);
}

#[test]
fn test_threshold_is_not_swapped() {
    let (session, board) = session_with(SimulatedBoard::new(1, 4));

    let mut link = session.link(4).unwrap();
    link.set_threshold(0, 300).unwrap();
    drop(link);

    let board = board.lock().unwrap();
    assert_eq!(board.received, b"ST0/1/44/".to_vec());
    assert_eq!(board.thresholds, vec![300, 0, 0, 0]);
}

#[test]
fn test_apply_then_read_round_trip() {
    let (session, board) = session_with(SimulatedBoard::new(1, 4));
    let wanted = [(4095, 12), (0, 4095), (1234, 567), (2048, 1)];

    let report = session.apply(4, &settings(&wanted)).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.acknowledged, 8);

    let snapshot = session.read_all(4).unwrap();
    assert!(snapshot.eot_received);
    let values: Vec<(u16, u16)> = display_values(&snapshot)
        .iter()
        .map(|v| (v.gain, v.threshold))
        .collect();
    assert_eq!(values, wanted.to_vec());

    let board = board.lock().unwrap();
    assert_eq!(board.opens, 2, "apply and read each use one connection");
    assert!(board.dac.is_some());
}

#[test]
fn test_apply_sends_gain_then_threshold_then_commit() {
    let (session, board) = session_with(SimulatedBoard::new(1, 2));
    session.apply(2, &settings(&[(1, 2), (3, 4)])).unwrap();

    let board = board.lock().unwrap();
    assert_eq!(
        String::from_utf8(board.received.clone()).unwrap(),
        "SG1/0/1/ST0/0/2/SG0/0/3/ST1/0/4/W\n"
    );
}

#[test]
fn test_rejected_channel_write_is_abandoned_not_fatal() {
    let (session, board) = session_with(SimulatedBoard::new(1, 2));
    let mut wanted = settings(&[(10, 20), (30, 40)]);
    // the board rejects anything wider than 12 bits
    wanted[1].gain = 0xFFFF;

    let report = session.apply(2, &wanted).unwrap();
    assert_eq!(report.acknowledged, 3);
    assert_eq!(report.faults.len(), 1);
    let fault = &report.faults[0];
    assert_eq!(fault.channel, 1);
    assert_eq!(fault.kind, ValueKind::Gain);
    assert!(matches!(
        fault.error,
        ProtocolError::NoAck { received: NAK, .. }
    ));

    let board = board.lock().unwrap();
    assert_eq!(board.thresholds, vec![20, 40]);
}

#[test]
fn test_settings_past_channel_count_are_skipped() {
    let (session, board) = session_with(SimulatedBoard::new(1, 2));
    let report = session
        .apply(2, &settings(&[(1, 1), (2, 2), (3, 3)]))
        .unwrap();
    assert_eq!(report.acknowledged, 4);
    assert!(!String::from_utf8_lossy(&board.lock().unwrap().received).contains("ST2/"));
}

#[test]
fn test_commit_without_ack_times_out() {
    let mut board = SimulatedBoard::new(1, 2);
    board.withhold_slow_ack = true;
    let (session, _) = session_with(board);

    let err = session.apply(2, &settings(&[(1, 1)])).unwrap_err();
    assert!(matches!(err, ProtocolError::TimeoutExhausted { .. }));
    assert!(err.is_timeout());
}

#[test]
fn test_commit_waits_through_busy_reads() {
    let mut board = SimulatedBoard::new(1, 2);
    board.busy_reads = 5;
    let (session, _) = session_with(board);
    assert!(session.apply(2, &settings(&[(1, 1), (2, 2)])).is_ok());
}

#[test]
fn test_save_to_eeprom_persists_applied_values() {
    let (session, board) = session_with(SimulatedBoard::new(1, 2));
    session.apply(2, &settings(&[(100, 200), (300, 400)])).unwrap();
    session.save_to_eeprom().unwrap();

    let board = board.lock().unwrap();
    assert_eq!(board.eeprom, board.dac);
    assert_eq!(board.opens, 2);
}

#[test]
fn test_save_can_be_cancelled() {
    let mut board = SimulatedBoard::new(1, 2);
    board.withhold_slow_ack = true;
    let mut opener = SimOpener::new();
    opener.attach(PORT, board);
    let timings = SessionTimings {
        save_deadline: Duration::from_secs(3600),
        poll_interval: Duration::from_millis(1),
        ..SessionTimings::default()
    };
    let session = BoardSession::new(Arc::new(opener), PORT, timings);
    let cancel = session.cancel_token().clone();

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        cancel.cancel();
    });
    let err = session.save_to_eeprom().unwrap_err();
    canceller.join().unwrap();
    assert!(matches!(err, ProtocolError::Cancelled { .. }));
}

#[test]
fn test_read_all_missing_eot_still_returns_values() {
    let mut board = SimulatedBoard::new(1, 2);
    board.gains = vec![10, 20];
    board.thresholds = vec![5, 6];
    board.trailer_marker = 0x03;
    let (session, _) = session_with(board);

    let (result, output) = capture_logs(tracing::Level::WARN, || session.read_all(2));
    let snapshot = result.unwrap();

    assert!(!snapshot.eot_received);
    assert_eq!(snapshot.gains, vec![10, 20]);
    assert_eq!(snapshot.thresholds, vec![5, 6]);

    assert!(output.contains("WARN"), "no warning logged: {output:?}");
    assert!(output.contains("no end of transmission received"), "{output:?}");
    assert!(output.contains(PORT), "{output:?}");
}

#[test]
fn test_read_all_with_eot_logs_no_warning() {
    let (session, _) = session_with(SimulatedBoard::new(1, 2));

    let (result, output) = capture_logs(tracing::Level::WARN, || session.read_all(2));

    assert!(result.unwrap().eot_received);
    assert_eq!(output, "");
}

#[test]
fn test_operation_states_are_traced() {
    let (session, _) = session_with(SimulatedBoard::new(1, 2));
    let (result, output) = capture_logs(tracing::Level::TRACE, || session.get_channel_count());
    assert_eq!(result.unwrap(), 2);
    assert!(output.contains("Idle -> Connecting"), "{output}");
    assert!(output.contains("AwaitingResponse"), "{output}");
    assert!(output.contains("Success -> Closed"), "{output}");

    let unplugged = BoardSession::new(Arc::new(SimOpener::new()), PORT, fast_timings());
    let (result, output) = capture_logs(tracing::Level::TRACE, || unplugged.get_channel_count());
    assert!(result.unwrap_err().is_connection_error());
    assert!(output.contains("Failed"), "{output}");
    assert!(!output.contains("AwaitingResponse"), "{output}");
}

#[test]
fn test_read_all_short_buffer_is_protocol_error() {
    let (session, _) = session_with(SimulatedBoard::new(1, 2));
    // Board has 2 channels, caller believes 4
    let err = session.read_all(4).unwrap_err();
    // 14 bytes arrive: 8 fill the gain read, 6 are left for 10 threshold bytes
    assert!(matches!(
        err,
        ProtocolError::ShortRead {
            expected: 10,
            actual: 6,
            ..
        }
    ));
}

#[test]
fn test_toggle_led_consumes_nothing() {
    let (session, board) = session_with(SimulatedBoard::new(1, 2));
    session.toggle_led().unwrap();
    let board = board.lock().unwrap();
    assert!(board.led_on);
    assert_eq!(board.received, b"L\n".to_vec());
}

#[test]
fn test_unknown_port_is_connection_error() {
    let session = BoardSession::new(Arc::new(SimOpener::new()), PORT, fast_timings());
    assert!(session.get_channel_count().unwrap_err().is_connection_error());
    assert!(session.read_all(2).unwrap_err().is_connection_error());
}

#[test]
fn test_ack_constant() {
    assert_eq!(ACK, 0x06);
    assert_eq!(
        ChannelValues::default(),
        ChannelValues {
            gain: 0,
            threshold: 0
        }
    );
}
