//! Starts one device server per definition, restarts the ones that die
//! and shuts them all down together.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::device_server::{DeviceServer, LaunchSpec, ReadyServer};
use crate::config::{DeviceDefinition, Settings};
use crate::device::DeviceRegistry;
use crate::error::{exit_code, ServerError};
use crate::utils::ExitFlag;

const STOP_POLL: Duration = Duration::from_millis(50);

/// A running device server, in a child process or a thread.
pub trait ServerHandle: Send {
    /// Exit code if the server has finished.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Ask the server to drain and exit.
    fn request_stop(&mut self);

    /// Stop without waiting for a clean exit.
    fn kill(&mut self);

    fn describe(&self) -> String;
}

pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerHandle>, ServerError>;
}

/// Runs each server as `<exe> device --spec <json>`. Closing the child's
/// stdin is the exit request.
pub struct ProcessLauncher {
    exe: PathBuf,
    log_level: String,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, log_level: impl Into<String>) -> Self {
        Self {
            exe,
            log_level: log_level.into(),
        }
    }

    /// Launch copies of the running executable.
    pub fn current(log_level: impl Into<String>) -> Result<Self, ServerError> {
        let exe = std::env::current_exe().map_err(ServerError::Launch)?;
        Ok(Self::new(exe, log_level))
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerHandle>, ServerError> {
        let json = serde_json::to_string(spec)
            .map_err(|e| ServerError::InvalidDefinition(e.to_string()))?;
        let mut child = Command::new(&self.exe)
            .arg("--log-level")
            .arg(&self.log_level)
            .arg("device")
            .arg("--spec")
            .arg(json)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(ServerError::Launch)?;
        let stdin = child.stdin.take();
        debug!(pid = child.id(), "device server process spawned");
        Ok(Box::new(ProcessHandle {
            label: format!("{} at {} (pid {})", spec.definition.class, spec.definition.addr(), child.id()),
            child,
            stdin,
        }))
    }
}

struct ProcessHandle {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ServerHandle for ProcessHandle {
    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        // Killed by a signal reports no code.
        Ok(self.child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn request_stop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush();
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("kill {}: {}", self.label, e);
        }
        let _ = self.child.wait();
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Runs each server on a thread of the current process.
pub struct ThreadLauncher {
    registry: Arc<DeviceRegistry>,
    ready: Option<flume::Sender<ReadyServer>>,
}

impl ThreadLauncher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            ready: None,
        }
    }

    pub fn with_ready(mut self, tx: flume::Sender<ReadyServer>) -> Self {
        self.ready = Some(tx);
        self
    }
}

impl Launcher for ThreadLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerHandle>, ServerError> {
        let exit = Arc::new(ExitFlag::new());
        let mut server = DeviceServer::new(spec.clone(), self.registry.clone(), exit.clone());
        if let Some(tx) = &self.ready {
            server = server.with_ready(tx.clone());
        }
        let label = format!("{} at {}", spec.definition.class, spec.definition.addr());
        let thread = thread::Builder::new()
            .name(format!("server-{}", spec.definition.class))
            .spawn(move || match server.run() {
                Ok(()) => exit_code::OK,
                Err(e) => e.exit_code(),
            })
            .map_err(ServerError::Launch)?;
        Ok(Box::new(ThreadHandle {
            label,
            exit,
            thread: Some(thread),
            code: None,
        }))
    }
}

struct ThreadHandle {
    label: String,
    exit: Arc<ExitFlag>,
    thread: Option<JoinHandle<i32>>,
    code: Option<i32>,
}

impl ServerHandle for ThreadHandle {
    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if self.thread.as_ref().is_some_and(|t| t.is_finished()) {
            if let Some(thread) = self.thread.take() {
                self.code = Some(thread.join().unwrap_or(-1));
            }
        }
        Ok(self.code)
    }

    fn request_stop(&mut self) {
        self.exit.set();
    }

    fn kill(&mut self) {
        warn!("{} did not stop in time; abandoning its thread", self.label);
        self.exit.set();
        self.thread = None;
        self.code = Some(-1);
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// How a supervised server ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerExit {
    pub class: String,
    pub addr: String,
    pub code: i32,
    pub restarted: bool,
}

struct Slot {
    spec: LaunchSpec,
    handle: Box<dyn ServerHandle>,
}

pub struct ServerSupervisor {
    settings: Settings,
    registry: Arc<DeviceRegistry>,
    launcher: Arc<dyn Launcher>,
    exit: Arc<ExitFlag>,
    exits: Mutex<Vec<ServerExit>>,
}

impl ServerSupervisor {
    pub fn new(settings: Settings, registry: Arc<DeviceRegistry>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            settings,
            registry,
            launcher,
            exit: Arc::new(ExitFlag::new()),
            exits: Mutex::new(Vec::new()),
        }
    }

    /// Setting this flag shuts every server down and makes `run` return.
    pub fn exit_flag(&self) -> Arc<ExitFlag> {
        self.exit.clone()
    }

    /// Servers that have ended so far.
    pub fn exits(&self) -> Vec<ServerExit> {
        self.exits.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// One launch spec per definition, grouped by class in order of first
    /// appearance. Floating classes share uid tables across their group.
    pub fn plan(&self) -> Result<Vec<LaunchSpec>, ServerError> {
        self.settings.validate(&self.registry)?;

        let mut order: Vec<&str> = Vec::new();
        let mut by_class: HashMap<&str, Vec<&DeviceDefinition>> = HashMap::new();
        for def in &self.settings.devices {
            let group = by_class.entry(def.class.as_str()).or_default();
            if group.is_empty() {
                order.push(def.class.as_str());
            }
            group.push(def);
        }

        let mut specs = Vec::with_capacity(self.settings.devices.len());
        for class in order {
            let defs = &by_class[class];
            let floating = self.registry.get(class).is_some_and(|c| c.floating);
            let mut uid_to_host = HashMap::new();
            let mut uid_to_port = HashMap::new();
            if floating {
                for def in defs {
                    if let Some(uid) = &def.uid {
                        uid_to_host.insert(uid.clone(), def.host.clone());
                        uid_to_port.insert(uid.clone(), def.port);
                    }
                }
            }
            for (index, def) in defs.iter().enumerate() {
                specs.push(LaunchSpec {
                    definition: (*def).clone(),
                    index,
                    uid_to_host: uid_to_host.clone(),
                    uid_to_port: uid_to_port.clone(),
                    server: self.settings.server.clone(),
                    pipeline: self.settings.pipeline.clone(),
                });
            }
        }
        Ok(specs)
    }

    /// Serve every device until the exit flag is set or no server is left.
    pub fn run(&self) -> Result<(), ServerError> {
        let specs = self.plan()?;
        if specs.is_empty() {
            warn!("no devices configured");
            return Ok(());
        }

        let mut slots = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.launcher.launch(&spec) {
                Ok(handle) => {
                    info!(server = %handle.describe(), "device server started");
                    slots.push(Slot { spec, handle });
                }
                Err(e) => error!(class = %spec.definition.class, "failed to start device server: {}", e),
            }
        }
        info!(count = slots.len(), "supervisor running");

        let poll = self.settings.server.poll_interval();
        while !self.exit.wait_timeout(poll) {
            self.keep_alive(&mut slots);
            if slots.is_empty() {
                info!("no servers running, exiting");
                self.exit.set();
            }
        }

        self.shutdown(slots);
        Ok(())
    }

    fn keep_alive(&self, slots: &mut Vec<Slot>) {
        let mut i = 0;
        while i < slots.len() {
            let code = match slots[i].handle.try_wait() {
                Ok(Some(code)) => code,
                Ok(None) => {
                    i += 1;
                    continue;
                }
                Err(e) => {
                    warn!(server = %slots[i].handle.describe(), "cannot poll server: {}", e);
                    i += 1;
                    continue;
                }
            };

            let slot = slots.swap_remove(i);
            let restart = self.settings.server.restart && !exit_code::is_permanent(code);
            self.record(&slot.spec, code, restart);
            if !restart {
                warn!(server = %slot.handle.describe(), code, "device server exited");
                continue;
            }

            warn!(server = %slot.handle.describe(), code, "device server died, restarting");
            metrics::counter!("labcam_server_restarts_total").increment(1);
            match self.launcher.launch(&slot.spec) {
                Ok(handle) => {
                    info!(server = %handle.describe(), "device server restarted");
                    slots.push(Slot {
                        spec: slot.spec,
                        handle,
                    });
                }
                Err(e) => error!("failed to restart device server: {}", e),
            }
        }
    }

    fn record(&self, spec: &LaunchSpec, code: i32, restarted: bool) {
        self.exits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ServerExit {
                class: spec.definition.class.clone(),
                addr: spec.definition.addr(),
                code,
                restarted,
            });
    }

    fn shutdown(&self, mut slots: Vec<Slot>) {
        info!(count = slots.len(), "shutting down device servers");
        for slot in &mut slots {
            slot.handle.request_stop();
        }

        let deadline = Instant::now() + self.settings.server.join_timeout();
        while !slots.is_empty() && Instant::now() < deadline {
            slots.retain_mut(|slot| match slot.handle.try_wait() {
                Ok(Some(code)) => {
                    self.record(&slot.spec, code, false);
                    false
                }
                Ok(None) => true,
                Err(_) => true,
            });
            if !slots.is_empty() {
                thread::sleep(STOP_POLL);
            }
        }

        for mut slot in slots {
            warn!(server = %slot.handle.describe(), "device server did not stop in time, killing");
            slot.handle.kill();
            self.record(&slot.spec, -1, false);
        }
        info!("all device servers stopped");
    }
}
