use std::io::{self, Write};
use std::sync::{Arc, Barrier};
use std::thread;

use pinctl::{
    AppConfig, AppError, Delivery, Direction, Edge, Level, LineId, ManualClock, MockPinBackend,
    PinManager,
};
use pinctl::backend::mock::MOCK_LINE_BASE;

fn sample_config() -> AppConfig {
    AppConfig::from_json(
        r#"
        {
            "http": {
                "host": "localhost:8080",
                "path": "/api/v1",
                "timeout": 30
            },
            "pins": {
                "48": { "name": "P9_15", "chip": "/dev/gpiochip1", "line": 16 },
                "49": { "name": "P9_23", "chip": "/dev/gpiochip1", "line": 17 },
                "60": { "name": "P9_12", "chip": "/dev/gpiochip1", "line": 28 }
            },
            "event_history_capacity": 8
        }
        "#,
    )
    .expect("valid sample config")
}

fn setup() -> (
    Arc<MockPinBackend>,
    Arc<ManualClock>,
    PinManager<MockPinBackend>,
) {
    let backend = Arc::new(MockPinBackend::default());
    let clock = Arc::new(ManualClock::new(1_000));
    let manager = PinManager::new(Arc::new(sample_config()), backend.clone(), clock.clone())
        .expect("pins come up");
    (backend, clock, manager)
}

struct FailAfter(usize);

impl Write for FailAfter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0 == 0 {
            return Err(io::Error::other("sink full"));
        }
        self.0 -= 1;
        Ok(buf.len().min(1))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn startup_reserves_every_pin_as_low_output() {
    let (backend, _clock, manager) = setup();

    for pin in manager.list_pins() {
        assert_eq!(pin.direction, Direction::Output);
        assert_eq!(pin.level, Level::Low);
        assert!(!pin.notifications_enabled);
        assert_eq!(pin.trigger_edge, None);
        assert_eq!(pin.subscriber_count, 0);
        assert_eq!(backend.level(pin.pin_id), Some(Level::Low));
    }
    assert_eq!(
        manager.list_pins().iter().map(|p| p.pin_id).collect::<Vec<_>>(),
        vec![48, 49, 60]
    );
}

#[test]
fn open_then_close_leaves_no_registration() {
    let (backend, _clock, manager) = setup();

    let session = manager.open(48).unwrap();
    assert!(!session.is_subscribed());
    session.close();

    assert_eq!(manager.pin_snapshot(48).unwrap().subscriber_count, 0);
    assert!(!backend.is_registered(48));
    assert_eq!(backend.registrations(), 0);
}

#[test]
fn open_unknown_pin_is_not_found() {
    let (_backend, _clock, manager) = setup();

    assert!(matches!(manager.open(50), Err(AppError::NotFound(_))));
}

#[test]
fn fresh_read_returns_low() {
    let (_backend, _clock, manager) = setup();
    let session = manager.open(60).unwrap();

    let mut buf = Vec::new();
    assert_eq!(session.read(4, &mut buf).unwrap(), 4);
    assert_eq!(buf, b"0000");
}

#[test]
fn output_high_is_read_back() {
    let (backend, _clock, manager) = setup();
    let session = manager.open(49).unwrap();

    assert_eq!(session.write(b"out").unwrap(), 3);
    assert_eq!(session.write(b"1").unwrap(), 1);

    assert_eq!(backend.level(49), Some(Level::High));
    assert_eq!(manager.pin_snapshot(49).unwrap().level, Level::High);

    let mut buf = Vec::new();
    session.read(3, &mut buf).unwrap();
    assert_eq!(buf, b"111");
}

#[test]
fn read_follows_the_wire_not_the_cache() {
    let (backend, _clock, manager) = setup();
    let session = manager.open(48).unwrap();

    session.write(b"in").unwrap();
    backend.drive(48, Level::High).unwrap();

    let mut buf = Vec::new();
    session.read(2, &mut buf).unwrap();
    assert_eq!(buf, b"11");
    assert_eq!(manager.pin_snapshot(48).unwrap().level, Level::Low);
}

#[test]
fn read_stops_short_when_sink_fails() {
    let (_backend, _clock, manager) = setup();
    let session = manager.open(48).unwrap();

    assert_eq!(session.read(5, &mut FailAfter(2)).unwrap(), 2);
}

#[test]
fn write_reports_every_byte_consumed() {
    let (_backend, _clock, manager) = setup();
    let session = manager.open(48).unwrap();

    assert_eq!(session.write(b"in\n").unwrap(), 3);
    assert_eq!(session.write(b"out\0\0\0").unwrap(), 6);
    assert_eq!(manager.pin_snapshot(48).unwrap().direction, Direction::Output);
}

#[test]
fn level_write_on_input_is_denied() {
    let (backend, _clock, manager) = setup();
    let session = manager.open(48).unwrap();
    session.write(b"in").unwrap();

    assert!(matches!(
        session.write(b"1"),
        Err(AppError::PermissionDenied(_))
    ));
    assert!(matches!(
        session.write(b"0"),
        Err(AppError::PermissionDenied(_))
    ));
    assert_eq!(backend.level(48), Some(Level::Low));
    assert_eq!(manager.pin_snapshot(48).unwrap().level, Level::Low);
}

#[test]
fn unrecognized_command_changes_nothing() {
    let (_backend, _clock, manager) = setup();
    let session = manager.open(48).unwrap();
    session.write(b"rising").unwrap();
    let before = manager.pin_snapshot(48).unwrap();

    assert!(matches!(
        session.write(b"toggle"),
        Err(AppError::InvalidArgument(_))
    ));
    assert_eq!(manager.pin_snapshot(48).unwrap(), before);
}

#[test]
fn going_output_drives_low() {
    let (backend, _clock, manager) = setup();
    let session = manager.open(48).unwrap();

    session.write(b"1").unwrap();
    session.write(b"in").unwrap();
    session.write(b"out").unwrap();

    assert_eq!(backend.level(48), Some(Level::Low));
    assert_eq!(manager.pin_snapshot(48).unwrap().level, Level::Low);
}

#[test]
fn arming_forces_input_and_registers_lazily() {
    let (backend, _clock, manager) = setup();
    let early = manager.open(48).unwrap();

    early.write(b"falling").unwrap();
    let snapshot = manager.pin_snapshot(48).unwrap();
    assert_eq!(snapshot.direction, Direction::Input);
    assert_eq!(snapshot.trigger_edge, Some(Edge::Falling));
    assert_eq!(backend.direction(48), Some(Direction::Input));
    assert!(!early.is_subscribed());
    assert!(!backend.is_registered(48));

    let late = manager.open(48).unwrap();
    assert!(late.is_subscribed());
    assert_eq!(backend.registered_edge(48), Some(Edge::Falling));

    early.close();
    assert!(backend.is_registered(48));
    late.close();
    assert!(!backend.is_registered(48));
}

#[test]
fn concurrent_opens_share_one_registration() {
    const OPENERS: usize = 8;
    let (backend, _clock, manager) = setup();
    manager.open(48).unwrap().write(b"rising").unwrap();

    let sessions: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..OPENERS)
            .map(|_| s.spawn(|| manager.open(48).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(sessions.iter().all(|s| s.is_subscribed()));
    assert_eq!(backend.registrations(), 1);
    assert_eq!(manager.pin_snapshot(48).unwrap().subscriber_count, OPENERS);

    thread::scope(|s| {
        for session in sessions {
            s.spawn(move || session.close());
        }
    });

    assert_eq!(backend.unregistrations(), 1);
    assert!(!backend.is_registered(48));
    assert_eq!(manager.pin_snapshot(48).unwrap().subscriber_count, 0);
}

#[test]
fn interleaved_open_close_never_leaks_registration() {
    const WORKERS: usize = 6;
    const ROUNDS: usize = 50;
    let (backend, _clock, manager) = setup();
    manager.open(49).unwrap().write(b"rising").unwrap();
    let barrier = Barrier::new(WORKERS);

    thread::scope(|s| {
        for _ in 0..WORKERS {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..ROUNDS {
                    let session = manager.open(49).unwrap();
                    assert!(backend.is_registered(49));
                    session.close();
                }
            });
        }
    });

    assert!(!backend.is_registered(49));
    assert_eq!(backend.registrations(), backend.unregistrations());
    assert_eq!(manager.pin_snapshot(49).unwrap().subscriber_count, 0);
}

#[test]
fn disable_irq_releases_while_sessions_remain_open() {
    let (backend, _clock, manager) = setup();
    let control = manager.open(48).unwrap();
    control.write(b"rising").unwrap();
    let first = manager.open(48).unwrap();
    let second = manager.open(48).unwrap();
    assert_eq!(manager.pin_snapshot(48).unwrap().subscriber_count, 2);

    control.write(b"disable-irq").unwrap();

    let snapshot = manager.pin_snapshot(48).unwrap();
    assert_eq!(snapshot.subscriber_count, 0);
    assert!(!snapshot.notifications_enabled);
    assert!(!backend.is_registered(48));
    assert_eq!(backend.unregistrations(), 1);

    first.close();
    second.close();
    control.close();
    assert_eq!(manager.pin_snapshot(48).unwrap().subscriber_count, 0);
    assert_eq!(backend.unregistrations(), 1);
}

#[test]
fn stale_session_cannot_release_a_newer_registration() {
    let (backend, _clock, manager) = setup();
    let control = manager.open(48).unwrap();
    control.write(b"rising").unwrap();
    let stale = manager.open(48).unwrap();
    control.write(b"disable-irq").unwrap();

    control.write(b"falling").unwrap();
    let fresh = manager.open(48).unwrap();
    assert_eq!(backend.registrations(), 2);

    stale.close();
    assert!(backend.is_registered(48));
    assert_eq!(manager.pin_snapshot(48).unwrap().subscriber_count, 1);

    fresh.close();
    assert!(!backend.is_registered(48));
    assert_eq!(backend.unregistrations(), 2);
}

#[test]
fn failed_registration_fails_the_open() {
    let (backend, _clock, manager) = setup();
    manager.open(60).unwrap().write(b"rising").unwrap();

    backend.fail_next_registration();
    assert!(matches!(
        manager.open(60),
        Err(AppError::BackendUnavailable(_))
    ));
    assert_eq!(manager.pin_snapshot(60).unwrap().subscriber_count, 0);

    let session = manager.open(60).unwrap();
    assert!(session.is_subscribed());
    assert_eq!(manager.pin_snapshot(60).unwrap().subscriber_count, 1);
}

#[test]
fn notifications_inside_the_window_are_debounced() {
    let (backend, clock, manager) = setup();
    let session = manager.open(48).unwrap();
    session.write(b"rising").unwrap();
    let _listener = manager.open(48).unwrap();

    assert_eq!(backend.drive(48, Level::High).unwrap(), Some(Delivery::Accepted));
    assert_eq!(backend.drive(48, Level::Low).unwrap(), None);

    clock.advance(100);
    let rejected = backend.drive(48, Level::High).unwrap().unwrap();
    assert_eq!(rejected, Delivery::Debounced);
    assert!(rejected.is_handled());
    let line = LineId(48 + MOCK_LINE_BASE);
    assert_eq!(manager.dispatcher().window().last_accepted(line), 1_000);
    assert_eq!(manager.get_events(48, None).unwrap().len(), 1);

    backend.drive(48, Level::Low).unwrap();
    clock.set(1_250);
    assert_eq!(backend.drive(48, Level::High).unwrap(), Some(Delivery::Accepted));
    assert_eq!(manager.dispatcher().window().last_accepted(line), 1_250);

    let events = manager.get_events(48, None).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].timestamp_ms, 1_000);
    assert_eq!(events[1].timestamp_ms, 1_250);
    assert!(events.iter().all(|e| e.edge == Edge::Rising));
}

#[test]
fn debounce_window_is_shared_between_pins() {
    let (backend, clock, manager) = setup();
    for pin in [48, 49] {
        manager.open(pin).unwrap().write(b"rising").unwrap();
    }
    let _a = manager.open(48).unwrap();
    let _b = manager.open(49).unwrap();

    assert_eq!(backend.fire(48), Some(Delivery::Accepted));
    clock.advance(50);
    assert_eq!(backend.fire(49), Some(Delivery::Debounced));
    assert!(manager.get_events(49, None).unwrap().is_empty());
}

#[test]
fn event_history_is_bounded_and_limited() {
    let (backend, clock, manager) = setup();
    manager.open(48).unwrap().write(b"rising").unwrap();
    let _listener = manager.open(48).unwrap();

    for _ in 0..10 {
        clock.advance(200);
        assert_eq!(backend.fire(48), Some(Delivery::Accepted));
    }

    let events = manager.get_events(48, None).unwrap();
    assert_eq!(events.len(), 8);
    let latest = manager.get_events(48, Some(2)).unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[1].timestamp_ms, 3_000);
}

#[test]
fn failed_startup_releases_reserved_pins() {
    let backend = Arc::new(MockPinBackend::default());
    backend.fail_reservation(60);

    let result = PinManager::new(
        Arc::new(sample_config()),
        backend.clone(),
        Arc::new(ManualClock::default()),
    );

    assert!(matches!(result, Err(AppError::BackendUnavailable(_))));
    assert_eq!(backend.released(), vec![49, 48]);
    assert!(!backend.is_reserved(48));
    assert!(!backend.is_reserved(49));
}

#[test]
fn shutdown_drops_registrations_and_releases_pins_once() {
    let (backend, _clock, manager) = setup();
    manager.open(48).unwrap().write(b"rising").unwrap();
    let listener = manager.open(48).unwrap();
    let driver = manager.open(49).unwrap();
    driver.write(b"out").unwrap();
    driver.write(b"1").unwrap();

    manager.shutdown();

    assert_eq!(backend.unregistrations(), 1);
    assert_eq!(backend.released(), vec![60, 49, 48]);
    let snapshot = manager.pin_snapshot(49).unwrap();
    assert_eq!(snapshot.direction, Direction::Output);
    assert_eq!(snapshot.level, Level::Low);

    listener.close();
    driver.close();
    drop(manager);
    assert_eq!(backend.released().len(), 3);
    assert_eq!(backend.unregistrations(), 1);
}
