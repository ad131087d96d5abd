//! End-to-end engine scenarios over loopback devices.

use serialterm::port::loopback::ReadEvent;
use serialterm::{
    Command, Engine, EngineConfig, EngineEvent, EngineState, ErrorKind, LoopbackController,
    LoopbackOpener, Marker, PortIdentity, QueueItem, SerialSettings,
};
use std::io::Write;
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        join_timeout: Duration::from_millis(500),
        ..EngineConfig::default()
    }
}

fn identity(name: &str) -> PortIdentity {
    PortIdentity::new(
        name,
        SerialSettings::new(9600).with_timeout(Duration::from_millis(50)),
    )
}

struct Harness {
    engine: Engine,
    opener: LoopbackOpener,
    events: mpsc::Receiver<EngineEvent>,
}

impl Harness {
    fn new(config: EngineConfig, devices: &[&str]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let opener = LoopbackOpener::new();
        for name in devices {
            opener.create(*name);
        }
        let (tx, rx) = mpsc::channel();
        let engine = Engine::new(Arc::new(opener.clone()), Arc::new(tx), config).unwrap();
        Self {
            engine,
            opener,
            events: rx,
        }
    }

    fn device(&self, name: &str) -> LoopbackController {
        self.opener.controller(name).unwrap()
    }

    /// Collect events until one matches, failing after [`WAIT`].
    fn wait_for(&self, mut pred: impl FnMut(&EngineEvent) -> bool) -> Vec<EngineEvent> {
        let deadline = Instant::now() + WAIT;
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) => {
                    let done = pred(&event);
                    seen.push(event);
                    if done {
                        return seen;
                    }
                },
                Err(_) => panic!("timed out waiting for event; saw {seen:?}"),
            }
        }
    }

    fn drain_events(&self) -> Vec<EngineEvent> {
        self.events.try_iter().collect()
    }
}

fn temp_file(len: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

fn poll_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn connect_and_upload_300_bytes_in_chunks() {
    let mut h = Harness::new(
        EngineConfig {
            chunk_size: 100,
            relay_outbound: false,
            ..fast_config()
        },
        &["COM1"],
    );
    h.engine.connect(&identity("COM1")).unwrap();
    assert_eq!(h.engine.state(), EngineState::Connected);
    assert_eq!(h.device("COM1").settings().unwrap().baud_rate, 9600);

    let file = temp_file(300);
    h.engine.send_file(file.path()).unwrap();
    h.wait_for(|e| matches!(e, EngineEvent::TransferCompleted { bytes: 300 }));

    let items = h.engine.outbound().drain();
    assert_eq!(items.len(), 4);
    assert!(
        items[..3]
            .iter()
            .all(|item| matches!(item, QueueItem::Data(bytes) if bytes.len() == 100))
    );
    assert_eq!(
        items[3],
        QueueItem::Marker(Marker::TransferComplete { bytes: 300 })
    );
    assert!(h.engine.presentation().is_empty());
}

#[test]
fn connect_to_missing_port_fails_once() {
    let mut h = Harness::new(fast_config(), &[]);
    let err = h.engine.connect(&identity("COM9")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.engine.state(), EngineState::Disconnected);
    assert!(!h.engine.ports().is_open());

    let events = h.drain_events();
    let failures: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::OperationFailed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        EngineEvent::OperationFailed {
            kind: ErrorKind::NotFound,
            ..
        }
    ));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, EngineEvent::StateChanged(_)))
            .collect::<Vec<_>>(),
        vec![
            &EngineEvent::StateChanged(EngineState::Connecting),
            &EngineEvent::StateChanged(EngineState::Disconnected),
        ]
    );
}

#[test]
fn switch_and_configure_while_connected_are_busy() {
    let mut h = Harness::new(fast_config(), &["COM1", "COM2"]);
    h.engine.connect(&identity("COM1")).unwrap();

    let err = h.engine.switch_port(&identity("COM2")).unwrap_err();
    assert!(err.is_busy());
    let err = h
        .engine
        .configure(&SerialSettings::new(115_200))
        .unwrap_err();
    assert!(err.is_busy());

    assert_eq!(h.engine.state(), EngineState::Connected);
    assert_eq!(h.engine.current_port().unwrap().name, "COM1");
    let com1 = h.device("COM1");
    assert_eq!(com1.purge_count(), 0);
    assert_eq!(com1.settings().unwrap().baud_rate, 9600);
    assert!(!h.device("COM2").is_claimed());

    // Workers are still alive: data keeps flowing
    com1.push_read(b"still here".to_vec());
    h.wait_for(|e| *e == EngineEvent::ByteReceived(b"still here".to_vec()));
}

#[test]
fn empty_read_between_chunks_yields_two_items() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    let com1 = h.device("COM1");
    h.engine.connect(&identity("COM1")).unwrap();

    com1.push_read(vec![b'a'; 10]);
    com1.push_event(ReadEvent::Empty);
    com1.push_read(vec![b'b'; 5]);

    let mut received = Vec::new();
    h.wait_for(|e| {
        if let EngineEvent::ByteReceived(bytes) = e {
            received.push(bytes.clone());
        }
        received.len() == 2
    });
    assert_eq!(received, vec![vec![b'a'; 10], vec![b'b'; 5]]);

    std::thread::sleep(Duration::from_millis(30));
    assert!(
        !h.drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::ByteReceived(_)))
    );
}

#[test]
fn cancel_mid_transfer_queues_exactly_one_cancel_marker() {
    let mut h = Harness::new(
        EngineConfig {
            chunk_size: 10,
            upload_backlog: 2,
            relay_outbound: false,
            ..fast_config()
        },
        &["COM1"],
    );
    h.engine.connect(&identity("COM1")).unwrap();

    let file = temp_file(10_000);
    h.engine.send_file(file.path()).unwrap();
    poll_until(|| h.engine.outbound().len() >= 2);
    assert!(h.engine.is_uploading());

    assert!(h.engine.cancel_transfer());
    h.wait_for(|e| *e == EngineEvent::TransferCancelled);
    poll_until(|| !h.engine.is_uploading());

    let markers: Vec<Marker> = h
        .engine
        .outbound()
        .drain()
        .iter()
        .filter_map(QueueItem::marker)
        .collect();
    assert_eq!(markers, vec![Marker::TransferCancelled]);
    assert!(
        !h.drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::TransferCompleted { .. }))
    );

    // Nothing left to cancel
    assert!(!h.engine.cancel_transfer());
}

#[test]
fn disconnect_mid_upload_ends_the_transfer_exactly_once() {
    let mut h = Harness::new(
        EngineConfig {
            chunk_size: 1,
            upload_backlog: 1_000_000,
            relay_outbound: false,
            ..fast_config()
        },
        &["COM1"],
    );
    let file = temp_file(2_000_000);

    for _ in 0..20 {
        h.engine.connect(&identity("COM1")).unwrap();
        h.engine.send_file(file.path()).unwrap();
        poll_until(|| h.engine.outbound().len() >= 100);
        h.engine.disconnect().unwrap();

        let terminal: Vec<EngineEvent> = h
            .drain_events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    EngineEvent::TransferCompleted { .. }
                        | EngineEvent::TransferCancelled
                        | EngineEvent::OperationFailed { .. }
                )
            })
            .collect();
        assert_eq!(terminal, vec![EngineEvent::TransferCancelled]);
        assert!(h.engine.outbound().is_empty());
    }
}

#[test]
fn second_upload_while_running_is_busy() {
    let mut h = Harness::new(
        EngineConfig {
            chunk_size: 1,
            upload_backlog: 1,
            relay_outbound: false,
            ..fast_config()
        },
        &["COM1"],
    );
    h.engine.connect(&identity("COM1")).unwrap();
    let file = temp_file(1000);
    h.engine.send_file(file.path()).unwrap();
    poll_until(|| h.engine.outbound().len() == 1);

    let err = h.engine.send_file(file.path()).unwrap_err();
    assert!(err.is_busy());
    h.engine.disconnect().unwrap();
}

#[test]
fn disconnect_is_bounded_with_stalled_device() {
    let mut h = Harness::new(
        EngineConfig {
            join_timeout: Duration::from_millis(100),
            ..fast_config()
        },
        &["COM1"],
    );
    let com1 = h.device("COM1");
    let slow = PortIdentity::new(
        "COM1",
        SerialSettings::new(9600).with_timeout(Duration::from_millis(600)),
    );
    h.engine.connect(&slow).unwrap();

    com1.set_stall_writes(true);
    h.engine.send_bytes(b"never leaves").unwrap();
    poll_until(|| h.engine.outbound().is_empty());
    h.engine.presentation().push(QueueItem::Data(b"late".to_vec())).unwrap();

    let start = Instant::now();
    h.engine.disconnect().unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));

    assert_eq!(h.engine.state(), EngineState::Disconnected);
    assert!(!h.engine.ports().is_open());
    assert!(h.engine.outbound().is_empty());
    assert!(h.engine.inbound().is_empty());
    assert!(h.engine.presentation().is_empty());
    assert_eq!(com1.written_len(), 0);

    // The detached transmit worker lets go once its write gives up
    poll_until(|| !com1.is_claimed());
}

#[test]
fn link_loss_is_reported_and_disconnects() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    let com1 = h.device("COM1");
    h.engine.connect(&identity("COM1")).unwrap();

    com1.unplug();
    h.wait_for(|e| *e == EngineEvent::LinkLost);

    poll_until(|| h.engine.check_link());
    assert_eq!(h.engine.state(), EngineState::Disconnected);
    assert!(!h.engine.ports().is_open());
    assert!(!h.engine.check_link());
}

#[test]
fn replugged_device_reconnects_after_link_loss() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    let com1 = h.device("COM1");
    h.engine.connect(&identity("COM1")).unwrap();

    com1.unplug();
    h.wait_for(|e| *e == EngineEvent::LinkLost);
    poll_until(|| h.engine.check_link());

    let err = h.engine.connect(&identity("COM1")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.engine.state(), EngineState::Disconnected);

    com1.replug();
    h.engine.connect(&identity("COM1")).unwrap();
    com1.push_read(b"back".to_vec());
    h.wait_for(|e| *e == EngineEvent::ByteReceived(b"back".to_vec()));
}

#[test]
fn outbound_is_drained_only_once_the_writer_finishes() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    let com1 = h.device("COM1");
    com1.set_stall_writes(true);
    h.engine.connect(&identity("COM1")).unwrap();

    h.engine.send_bytes(b"tail").unwrap();
    poll_until(|| h.engine.outbound().is_empty());
    assert!(!h.engine.is_outbound_drained());

    com1.set_stall_writes(false);
    poll_until(|| h.engine.is_outbound_drained());
    assert_eq!(com1.take_written(), b"tail");
}

#[test]
fn keystrokes_are_relayed_and_echoed() {
    let mut h = Harness::new(fast_config(), &["loop://echo"]);
    let dev = h.device("loop://echo");
    dev.set_echo(true);
    h.engine.connect(&identity("loop://echo")).unwrap();

    h.engine.execute(Command::SendBytes(b"AT\r".to_vec())).unwrap();
    h.wait_for(|e| *e == EngineEvent::ByteReceived(b"AT\r".to_vec()));
    assert_eq!(dev.take_written(), b"AT\r");
}

#[test]
fn session_log_records_received_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new(
        EngineConfig {
            log_dir: Some(dir.path().to_path_buf()),
            ..fast_config()
        },
        &["COM1"],
    );
    let com1 = h.device("COM1");
    h.engine.connect(&identity("COM1")).unwrap();

    com1.push_read(b"hello ".to_vec());
    com1.push_read(b"log".to_vec());
    h.wait_for(|e| *e == EngineEvent::ByteReceived(b"log".to_vec()));
    h.engine.disconnect().unwrap();

    let logs: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(logs.len(), 1);
    let name = logs[0].file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("session-") && name.ends_with("-COM1.log"), "{name}");
    assert_eq!(std::fs::read(&logs[0]).unwrap(), b"hello log");
}

#[test]
fn reconnect_after_disconnect_and_reuse_switched_port() {
    let mut h = Harness::new(fast_config(), &["COM1", "COM2"]);
    h.engine.connect(&identity("COM1")).unwrap();
    h.engine.disconnect().unwrap();
    assert!(!h.device("COM1").is_claimed());

    // Switching while disconnected opens the new port right away
    h.engine.switch_port(&identity("COM2")).unwrap();
    let com2 = h.device("COM2");
    assert!(com2.is_claimed());
    assert_eq!(h.engine.state(), EngineState::Disconnected);

    h.engine.connect(&identity("COM2")).unwrap();
    assert_eq!(com2.open_count(), 1);

    com2.push_read(b"again".to_vec());
    h.wait_for(|e| *e == EngineEvent::ByteReceived(b"again".to_vec()));
}

#[test]
fn commands_require_the_right_state() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    assert!(h.engine.send_bytes(b"x").unwrap_err().is_busy());
    assert!(h.engine.send_file("whatever.bin").unwrap_err().is_busy());
    assert!(h.engine.disconnect().is_ok());

    h.engine.connect(&identity("COM1")).unwrap();
    assert!(h.engine.connect(&identity("COM1")).unwrap_err().is_busy());
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    h.engine.connect(&identity("COM1")).unwrap();
    h.engine.execute(Command::Shutdown).unwrap();
    h.engine.shutdown();

    assert!(h.engine.is_shut_down());
    assert_eq!(h.engine.state(), EngineState::Disconnected);
    assert!(!h.device("COM1").is_claimed());
    assert!(h.engine.outbound().is_closed());

    let err = h.engine.connect(&identity("COM1")).unwrap_err();
    assert!(err.is_busy());
}

#[test]
fn upload_of_missing_file_reports_file_error() {
    let mut h = Harness::new(fast_config(), &["COM1"]);
    h.engine.connect(&identity("COM1")).unwrap();

    let dir = tempfile::tempdir().unwrap();
    h.engine.send_file(dir.path().join("absent.bin")).unwrap();
    h.wait_for(|e| {
        matches!(
            e,
            EngineEvent::OperationFailed {
                kind: ErrorKind::FileError,
                ..
            }
        )
    });
    assert!(h.engine.outbound().is_empty());
    assert_eq!(h.engine.state(), EngineState::Connected);
}

#[test]
fn invalid_config_is_rejected() {
    let (tx, _rx) = mpsc::channel();
    let result = Engine::new(
        Arc::new(LoopbackOpener::new()),
        Arc::new(tx),
        EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        },
    );
    assert!(matches!(result, Err(e) if e.kind() == ErrorKind::Config));
}
