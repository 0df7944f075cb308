use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use labcam::device::registry::{SIMULATED_CAMERA, SIMULATED_FLOATING_CAMERA};
use labcam::device::{DeviceControl, DeviceRegistry};
use labcam::error::exit_code;
use labcam::hardware::ParamValue;
use labcam::remote::DeviceClient;
use labcam::server::{ReadyServer, ServerExit, ServerSupervisor, ThreadLauncher};
use labcam::{DeviceDefinition, Settings};

const WAIT: Duration = Duration::from_secs(5);

fn fast_settings(devices: Vec<DeviceDefinition>) -> Settings {
    let mut settings = Settings {
        devices,
        ..Default::default()
    };
    settings.server.poll_interval_ms = 50;
    settings.server.init_retry_secs = 0;
    settings.server.join_timeout_secs = 5;
    settings
}

fn start(
    settings: Settings,
) -> (
    Arc<ServerSupervisor>,
    flume::Receiver<ReadyServer>,
    thread::JoinHandle<Result<(), labcam::ServerError>>,
) {
    let registry = Arc::new(DeviceRegistry::with_builtin());
    let (tx, rx) = flume::unbounded();
    let launcher = Arc::new(ThreadLauncher::new(registry.clone()).with_ready(tx));
    let supervisor = Arc::new(ServerSupervisor::new(settings, registry, launcher));
    let runner = {
        let supervisor = supervisor.clone();
        thread::spawn(move || supervisor.run())
    };
    (supervisor, rx, runner)
}

fn wait_for_exit(supervisor: &ServerSupervisor, pred: impl Fn(&ServerExit) -> bool) -> ServerExit {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(exit) = supervisor.exits().into_iter().find(|e| pred(e)) {
            return exit;
        }
        assert!(Instant::now() < deadline, "no matching exit in {:?}", supervisor.exits());
        thread::sleep(Duration::from_millis(20));
    }
}

/// A floating camera reporting "foo" against a table that only knows "bar".
fn misplaced_floating() -> DeviceDefinition {
    DeviceDefinition::new(SIMULATED_FLOATING_CAMERA, "127.0.0.1", 1)
        .with_uid("bar")
        .with_conf("serial", ParamValue::Text("foo".into()))
}

#[test]
fn unknown_floating_uid_ends_only_that_server() {
    let (supervisor, ready, runner) = start(fast_settings(vec![
        misplaced_floating(),
        DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", 0),
    ]));

    let sibling = ready.recv_timeout(WAIT).unwrap();
    assert_eq!(sibling.class, SIMULATED_CAMERA);

    let failed = wait_for_exit(&supervisor, |e| e.class == SIMULATED_FLOATING_CAMERA);
    assert_eq!(failed.code, exit_code::ENDPOINT_NOT_FOUND);
    assert!(!failed.restarted);

    let client = DeviceClient::connect(sibling.addr).unwrap();
    client.ping().unwrap();
    assert_eq!(client.get_id().unwrap(), SIMULATED_CAMERA);
    drop(client);

    supervisor.exit_flag().set();
    runner.join().unwrap().unwrap();
    let exits = supervisor.exits();
    assert!(exits
        .iter()
        .any(|e| e.class == SIMULATED_CAMERA && e.code == exit_code::OK));
}

#[test]
fn floating_device_served_at_its_uid_address() {
    let port = {
        let free = TcpListener::bind("127.0.0.1:0").unwrap();
        free.local_addr().unwrap().port()
    };
    let (supervisor, ready, runner) = start(fast_settings(vec![DeviceDefinition::new(
        SIMULATED_FLOATING_CAMERA,
        "127.0.0.1",
        port,
    )
    .with_uid("cam-7")
    .with_conf("serial", ParamValue::Text("cam-7".into()))]));

    let served = ready.recv_timeout(WAIT).unwrap();
    assert_eq!(served.id, "cam-7");
    assert_eq!(served.addr.port(), port);
    let client = DeviceClient::connect(served.addr).unwrap();
    assert_eq!(client.get_id().unwrap(), "cam-7");
    drop(client);

    supervisor.exit_flag().set();
    runner.join().unwrap().unwrap();
}

#[test]
fn supervisor_exits_when_no_server_is_left() {
    let (supervisor, _ready, runner) = start(fast_settings(vec![misplaced_floating()]));
    runner.join().unwrap().unwrap();
    assert!(supervisor.exit_flag().is_set());
    assert_eq!(supervisor.exits().len(), 1);
}

#[test]
fn crashed_server_is_restarted() {
    let blocker = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();
    let (supervisor, ready, runner) = start(fast_settings(vec![DeviceDefinition::new(
        SIMULATED_CAMERA,
        "127.0.0.1",
        port,
    )
    .with_conf("width", ParamValue::Int(64))
    .with_conf("height", ParamValue::Int(64))]));

    let failed = wait_for_exit(&supervisor, |e| e.code == exit_code::BIND_FAILED);
    assert!(failed.restarted);

    drop(blocker);
    let served = ready.recv_timeout(WAIT).unwrap();
    assert_eq!(served.addr.port(), port);

    supervisor.exit_flag().set();
    runner.join().unwrap().unwrap();
}

#[test]
fn settings_load_from_toml() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[server]
log_level = "debug"
poll_interval_ms = 100

[pipeline]
max_buffers = 8

[[devices]]
class = "simulated-camera"
host = "127.0.0.1"
port = 8000
[devices.conf]
width = 256
serial = "cam-a"

[[devices]]
class = "simulated-floating-camera"
host = "127.0.0.1"
port = 8001
uid = "foo"
"#
    )
    .unwrap();
    file.flush().unwrap();

    let settings = Settings::load(file.path()).unwrap();
    assert_eq!(settings.server.log_level, "debug");
    assert_eq!(settings.server.poll_interval(), Duration::from_millis(100));
    assert_eq!(settings.server.init_retry_secs, 5);
    assert_eq!(settings.pipeline.max_buffers, 8);
    assert_eq!(settings.devices.len(), 2);

    let first = &settings.devices[0];
    assert_eq!(first.class, SIMULATED_CAMERA);
    assert_eq!(first.conf["width"], ParamValue::Int(256));
    assert_eq!(first.conf["serial"], ParamValue::Text("cam-a".into()));
    assert_eq!(settings.devices[1].uid.as_deref(), Some("foo"));

    settings.validate(&DeviceRegistry::with_builtin()).unwrap();
}

#[test]
fn settings_load_rejects_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Settings::load(&dir.path().join("absent.toml")).is_err());
}
