//! Device servers as separate processes of the built binary.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use labcam::device::registry::{SIMULATED_CAMERA, SIMULATED_FLOATING_CAMERA};
use labcam::device::{DeviceControl, DeviceRegistry};
use labcam::error::exit_code;
use labcam::hardware::ParamValue;
use labcam::remote::DeviceClient;
use labcam::server::{LaunchSpec, ProcessLauncher, ServerExit, ServerSupervisor};
use labcam::{DeviceDefinition, Settings};

const WAIT: Duration = Duration::from_secs(10);
const EXE: &str = env!("CARGO_BIN_EXE_labcam");

fn free_port() -> u16 {
    let socket = TcpListener::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn spawn_device(spec: &LaunchSpec) -> Child {
    Command::new(EXE)
        .args(["--log-level", "warn", "device", "--spec"])
        .arg(serde_json::to_string(spec).unwrap())
        .stdin(Stdio::piped())
        .spawn()
        .unwrap()
}

fn wait_exit(child: &mut Child) -> ExitStatus {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("device process did not exit");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Keep dialing until the process has bound its port.
fn connect(addr: SocketAddr) -> DeviceClient {
    let deadline = Instant::now() + WAIT;
    loop {
        match DeviceClient::connect(addr) {
            Ok(client) => return client,
            Err(e) if Instant::now() > deadline => panic!("{addr} never came up: {e}"),
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
}

fn misplaced_floating() -> DeviceDefinition {
    DeviceDefinition::new(SIMULATED_FLOATING_CAMERA, "127.0.0.1", 1)
        .with_uid("bar")
        .with_conf("serial", ParamValue::Text("foo".into()))
}

#[test]
fn unknown_floating_uid_exits_with_endpoint_code() {
    let mut spec = LaunchSpec::new(misplaced_floating());
    spec.server.init_retry_secs = 0;
    spec.uid_to_host = HashMap::from([("bar".to_string(), "127.0.0.1".to_string())]);
    spec.uid_to_port = HashMap::from([("bar".to_string(), 1)]);

    let mut child = spawn_device(&spec);
    let status = wait_exit(&mut child);
    assert_eq!(status.code(), Some(exit_code::ENDPOINT_NOT_FOUND));
}

#[test]
fn closing_stdin_exits_cleanly() {
    let port = free_port();
    let mut spec = LaunchSpec::new(
        DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", port)
            .with_conf("width", ParamValue::Int(64))
            .with_conf("height", ParamValue::Int(64)),
    );
    spec.server.init_retry_secs = 0;

    let mut child = spawn_device(&spec);
    let client = connect(SocketAddr::from(([127, 0, 0, 1], port)));
    client.ping().unwrap();
    assert_eq!(client.get_id().unwrap(), SIMULATED_CAMERA);
    drop(client);

    drop(child.stdin.take());
    let status = wait_exit(&mut child);
    assert_eq!(status.code(), Some(exit_code::OK));
}

#[test]
fn sibling_process_survives_unknown_floating_uid() {
    let port = free_port();
    let mut settings = Settings {
        devices: vec![
            misplaced_floating(),
            DeviceDefinition::new(SIMULATED_CAMERA, "127.0.0.1", port)
                .with_conf("width", ParamValue::Int(64))
                .with_conf("height", ParamValue::Int(64)),
        ],
        ..Default::default()
    };
    settings.server.poll_interval_ms = 50;
    settings.server.init_retry_secs = 0;
    settings.server.join_timeout_secs = 5;

    let launcher = Arc::new(ProcessLauncher::new(PathBuf::from(EXE), "warn"));
    let supervisor = Arc::new(ServerSupervisor::new(
        settings,
        Arc::new(DeviceRegistry::with_builtin()),
        launcher,
    ));
    let runner = {
        let supervisor = supervisor.clone();
        thread::spawn(move || supervisor.run())
    };

    let failed = wait_for(&supervisor, |e| e.class == SIMULATED_FLOATING_CAMERA);
    assert_eq!(failed.code, exit_code::ENDPOINT_NOT_FOUND);
    assert!(!failed.restarted);

    let client = connect(SocketAddr::from(([127, 0, 0, 1], port)));
    client.ping().unwrap();
    drop(client);

    supervisor.exit_flag().set();
    runner.join().unwrap().unwrap();
    let sibling = wait_for(&supervisor, |e| e.class == SIMULATED_CAMERA);
    assert_eq!(sibling.code, exit_code::OK);
    assert!(!sibling.restarted);
}

fn wait_for(supervisor: &ServerSupervisor, pred: impl Fn(&ServerExit) -> bool) -> ServerExit {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(exit) = supervisor.exits().into_iter().find(|e| pred(e)) {
            return exit;
        }
        assert!(Instant::now() < deadline, "no matching exit in {:?}", supervisor.exits());
        thread::sleep(Duration::from_millis(20));
    }
}
