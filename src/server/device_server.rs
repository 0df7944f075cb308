//! Lifecycle of one served device.
//!
//! `Constructing -> Initializing -> ResolvingEndpoint -> Serving -> Draining -> Stopped`
//!
//! Initialisation is retried until it succeeds or the exit flag is set.
//! Floating devices learn their address from the uid tables only once the
//! hardware is open and can report its identity.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::config::{DeviceDefinition, PipelineOptions, ServerOptions};
use crate::device::{Device, DeviceArgs, DeviceControl, DeviceRegistry};
use crate::error::ServerError;
use crate::remote::RemoteServer;
use crate::utils::ExitFlag;

const EXIT_POLL: Duration = Duration::from_secs(1);

/// Everything a device server needs to start, as handed over by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub definition: DeviceDefinition,
    /// Position among the definitions of the same class.
    pub index: usize,
    /// Address tables shared by all floating devices of one class.
    pub uid_to_host: HashMap<String, String>,
    pub uid_to_port: HashMap<String, u16>,
    pub server: ServerOptions,
    pub pipeline: PipelineOptions,
}

impl LaunchSpec {
    pub fn new(definition: DeviceDefinition) -> Self {
        Self {
            definition,
            index: 0,
            uid_to_host: HashMap::new(),
            uid_to_port: HashMap::new(),
            server: ServerOptions::default(),
            pipeline: PipelineOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Constructing,
    Initializing,
    ResolvingEndpoint,
    Serving,
    Draining,
    Stopped,
}

/// Sent once a server is accepting calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyServer {
    pub class: String,
    pub index: usize,
    pub id: String,
    pub addr: SocketAddr,
}

pub struct DeviceServer {
    spec: LaunchSpec,
    registry: Arc<DeviceRegistry>,
    exit: Arc<ExitFlag>,
    ready: Option<flume::Sender<ReadyServer>>,
    state: Mutex<ServerState>,
}

impl DeviceServer {
    pub fn new(spec: LaunchSpec, registry: Arc<DeviceRegistry>, exit: Arc<ExitFlag>) -> Self {
        Self {
            spec,
            registry,
            exit,
            ready: None,
            state: Mutex::new(ServerState::Constructing),
        }
    }

    /// Report the bound address on `tx` once serving.
    pub fn with_ready(mut self, tx: flume::Sender<ReadyServer>) -> Self {
        self.ready = Some(tx);
        self
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, state: ServerState) {
        debug!(?state, "server state");
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Serve until the exit flag is set. Returns early on errors that a
    /// restart cannot fix.
    pub fn run(&self) -> Result<(), ServerError> {
        let def = &self.spec.definition;
        let span = info_span!("device", class = %def.class, index = self.spec.index);
        let _enter = span.enter();

        let result = self.serve();
        self.enter(ServerState::Stopped);
        match &result {
            Ok(()) => info!("device server stopped"),
            Err(e) => warn!("device server failed: {}", e),
        }
        result
    }

    fn serve(&self) -> Result<(), ServerError> {
        let def = &self.spec.definition;

        self.enter(ServerState::Constructing);
        let class = self
            .registry
            .get(&def.class)
            .ok_or_else(|| ServerError::UnknownClass(def.class.clone()))?;
        let args = DeviceArgs {
            conf: def.conf.clone(),
            index: self.spec.index,
        };
        let hardware = (class.build)(&args).map_err(|e| {
            ServerError::InvalidDefinition(format!("{} at {}: {}", def.class, def.addr(), e))
        })?;
        let device = Arc::new(Device::new(def.class.clone(), hardware, &self.spec.pipeline));

        self.enter(ServerState::Initializing);
        if !self.initialize(&device) {
            return Ok(());
        }

        self.enter(ServerState::ResolvingEndpoint);
        let (host, port) = self.resolve(&device, class.floating)?;

        let mut server = RemoteServer::bind((host.as_str(), port), device.clone())?;
        let addr = server.local_addr();
        let id = device.get_id().unwrap_or_else(|_| def.class.clone());
        self.enter(ServerState::Serving);
        info!(%addr, %id, "serving device");
        if let Some(tx) = &self.ready {
            let _ = tx.send(ReadyServer {
                class: def.class.clone(),
                index: self.spec.index,
                id,
                addr,
            });
        }

        while !self.exit.wait_timeout(EXIT_POLL) {}

        self.enter(ServerState::Draining);
        server.shutdown();
        device.shutdown();
        Ok(())
    }

    /// Open the device, retrying until it works. False if told to exit first.
    fn initialize(&self, device: &Device) -> bool {
        let retry = self.spec.server.init_retry();
        loop {
            if self.exit.is_set() {
                return false;
            }
            match device.initialize() {
                Ok(()) => return true,
                Err(e) => {
                    warn!("failed to start device, retrying in {:?}: {}", retry, e);
                    if self.exit.wait_timeout(retry) {
                        return false;
                    }
                }
            }
        }
    }

    fn resolve(&self, device: &Device, floating: bool) -> Result<(String, u16), ServerError> {
        let def = &self.spec.definition;
        if !floating {
            return Ok((def.host.clone(), def.port));
        }
        let uid = device.get_id()?;
        info!(%uid, "floating device identified");
        match (self.spec.uid_to_host.get(&uid), self.spec.uid_to_port.get(&uid)) {
            (Some(host), Some(port)) => Ok((host.clone(), *port)),
            _ => {
                device.shutdown();
                Err(ServerError::EndpointNotFound(uid))
            }
        }
    }
}
