pub mod device_server;
pub mod supervisor;

pub use device_server::{DeviceServer, LaunchSpec, ReadyServer, ServerState};
pub use supervisor::{
    Launcher, ProcessLauncher, ServerExit, ServerHandle, ServerSupervisor, ThreadLauncher,
};
