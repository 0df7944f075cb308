//! Remote calls on devices and frame pushes to consumers, over TCP.

pub mod client;
pub mod consumer;
pub mod listener;
pub mod server;
pub mod wire;

pub use client::DeviceClient;
pub use consumer::{CallbackRegistry, EndpointRef, Inbox, RemoteConsumerProxy, RemoteSink};
pub use server::RemoteServer;
pub use wire::{RemoteError, RemoteErrorKind, Reply, Request, SettingValue};
