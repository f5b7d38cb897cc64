use std::path::PathBuf;
use std::sync::Arc;

use sysgpio::{Config, Direction, Edge, GpioError, GpioManager, Level, MockBackend, PinExport};

fn sample_config() -> Config {
    serde_json::from_str(
        r#"
        {
            "sysfs_root": "/sys/class",
            "permission_timeout_ms": 50,
            "permission_poll_ms": 5,
            "watch_interval_ms": 20,
            "callback_workers": 2
        }
        "#,
    )
    .expect("valid sample config")
}

fn manager() -> (GpioManager<MockBackend>, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let manager = GpioManager::new(Arc::new(sample_config()), backend.clone())
        .expect("manager");
    (manager, backend)
}

fn write(path: &str, value: &str) -> (PathBuf, String) {
    (PathBuf::from(path), value.to_string())
}

#[test]
fn setup_output_writes_initial_level() {
    let (manager, backend) = manager();
    manager.setup(17, Direction::Out, Some(Level::High)).unwrap();

    assert_eq!(
        backend.writes(),
        vec![
            write("/sys/class/gpio/export", "17"),
            write("/sys/class/gpio/gpio17/direction", "out"),
            write("/sys/class/gpio/gpio17/value", "1"),
        ]
    );
    assert_eq!(manager.read(17).unwrap(), Level::High);
    assert_eq!(
        manager.export_of(17),
        Some(PinExport {
            pin: 17,
            direction: Direction::Out,
            edge: Edge::None,
        })
    );
}

#[test]
fn initial_level_is_ignored_for_inputs() {
    let (manager, backend) = manager();
    manager.setup(3, Direction::In, Some(Level::High)).unwrap();
    assert_eq!(backend.writes().len(), 2);
    assert_eq!(manager.read(3).unwrap(), Level::Low);
}

#[test]
fn setup_takes_over_a_busy_pin() {
    let (manager, backend) = manager();
    manager.sysfs().export(5).unwrap();
    backend.clear_writes();

    manager.setup(5, Direction::In, None).unwrap();
    assert_eq!(
        backend.writes(),
        vec![
            write("/sys/class/gpio/export", "5"),
            write("/sys/class/gpio/unexport", "5"),
            write("/sys/class/gpio/export", "5"),
            write("/sys/class/gpio/gpio5/direction", "in"),
        ]
    );
}

#[test]
fn setup_twice_is_rejected() {
    let (manager, _) = manager();
    manager.setup(6, Direction::In, None).unwrap();
    assert!(matches!(
        manager.setup(6, Direction::Out, None),
        Err(GpioError::AlreadyConfigured(6))
    ));
    assert_eq!(manager.export_of(6).unwrap().direction, Direction::In);
}

#[test]
fn pins_must_be_set_up_first() {
    let (manager, _) = manager();
    assert!(matches!(manager.read(7), Err(GpioError::NotConfigured(7))));
    assert!(matches!(
        manager.write(7, Level::High),
        Err(GpioError::NotConfigured(7))
    ));
    assert!(matches!(manager.teardown(7), Err(GpioError::NotConfigured(7))));
    assert!(matches!(
        manager.event_detected(7),
        Err(GpioError::NotConfigured(7))
    ));
}

#[test]
fn write_to_input_is_rejected() {
    let (manager, backend) = manager();
    manager.setup(8, Direction::In, None).unwrap();
    backend.clear_writes();

    assert!(matches!(
        manager.write(8, Level::High),
        Err(GpioError::WrongDirection {
            pin: 8,
            direction: Direction::In
        })
    ));
    assert!(backend.writes().is_empty());
}

#[test]
fn write_then_read_back() {
    let (manager, _) = manager();
    manager.setup(9, Direction::Out, None).unwrap();
    manager.write(9, Level::High).unwrap();
    assert_eq!(manager.read(9).unwrap(), Level::High);
    manager.write(9, Level::Low).unwrap();
    assert_eq!(manager.read(9).unwrap(), Level::Low);
}

#[test]
fn set_edge_is_recorded_and_blocked_while_watched() {
    let (manager, _) = manager();
    manager.setup(10, Direction::In, None).unwrap();

    manager.set_edge(10, Edge::Falling).unwrap();
    assert_eq!(manager.sysfs().read_edge(10).unwrap(), Edge::Falling);
    assert_eq!(manager.export_of(10).unwrap().edge, Edge::Falling);

    manager.add_event_detect(10, Edge::Both).unwrap();
    assert!(matches!(
        manager.set_edge(10, Edge::Rising),
        Err(GpioError::AlreadyRegistered(10))
    ));
    assert_eq!(manager.sysfs().read_edge(10).unwrap(), Edge::Both);
}

#[test]
fn teardown_unexports_and_stops_watching() {
    let (manager, backend) = manager();
    manager.setup(11, Direction::In, None).unwrap();
    manager.add_event_detect(11, Edge::Rising).unwrap();

    manager.teardown(11).unwrap();
    assert!(!manager.events().is_watched(11));
    assert_eq!(manager.export_of(11), None);
    assert!(backend.attr("/sys/class/gpio/gpio11/value").is_none());

    manager.setup(11, Direction::Out, None).unwrap();
}

#[test]
fn cleanup_releases_everything() {
    let (manager, backend) = manager();
    manager.setup(12, Direction::Out, Some(Level::Low)).unwrap();
    manager.setup(13, Direction::In, None).unwrap();
    manager.add_event_detect(13, Edge::Both).unwrap();

    manager.cleanup().unwrap();
    assert!(manager.exports().is_empty());
    assert!(manager.events().watched_pins().is_empty());
    assert!(backend.attr("/sys/class/gpio/gpio12/direction").is_none());
    assert!(backend.attr("/sys/class/gpio/gpio13/direction").is_none());

    manager.cleanup().unwrap();
}

#[test]
fn exports_are_listed_in_pin_order() {
    let (manager, _) = manager();
    for pin in [21, 4, 13] {
        manager.setup(pin, Direction::In, None).unwrap();
    }
    let pins: Vec<u32> = manager.exports().iter().map(|e| e.pin).collect();
    assert_eq!(pins, vec![4, 13, 21]);
}

#[test]
fn slow_permissions_are_waited_out() {
    let (manager, backend) = manager();
    manager.setup(14, Direction::Out, None).unwrap();
    let value = manager.sysfs().gpio_path(14, "value");
    backend.set_writable(&value, false);

    std::thread::scope(|s| {
        s.spawn(|| {
            std::thread::sleep(std::time::Duration::from_millis(15));
            backend.set_writable(&value, true);
        });
        manager.write(14, Level::High).unwrap();
    });
    assert_eq!(backend.attr(&value).as_deref(), Some("1"));
}

#[test]
fn permissions_that_never_settle_surface_the_io_error() {
    let (manager, backend) = manager();
    manager.setup(15, Direction::Out, None).unwrap();
    let value = manager.sysfs().gpio_path(15, "value");
    backend.set_writable(&value, false);

    let err = manager.write(15, Level::High).unwrap_err();
    assert!(matches!(err, GpioError::Io { .. }), "{err:?}");
    assert_eq!(err.raw_os_error(), Some(nix::errno::Errno::EACCES as i32));
}

#[test]
fn invalid_config_is_refused() {
    let backend = Arc::new(MockBackend::new());
    let config = Config {
        callback_workers: 0,
        ..Config::default()
    };
    assert!(matches!(
        GpioManager::new(Arc::new(config), backend),
        Err(GpioError::Config(_))
    ));
}

#[test]
fn detached_output_survives_cleanup() {
    let (manager, backend) = manager();
    manager.setup(16, Direction::Out, Some(Level::High)).unwrap();

    let export = manager.detach(16).unwrap();
    assert_eq!(export.direction, Direction::Out);
    assert_eq!(manager.export_of(16), None);
    assert!(matches!(manager.read(16), Err(GpioError::NotConfigured(16))));

    manager.cleanup().unwrap();
    assert_eq!(
        backend.attr("/sys/class/gpio/gpio16/value").as_deref(),
        Some("1")
    );
}
