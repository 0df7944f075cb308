//! The consumer end of frame delivery.
//!
//! A [`CallbackRegistry`] runs one listener per local interface. Devices
//! connect to it through a [`RemoteSink`] and push [`FramePush`] messages,
//! which the listener routes by consumer id to the matching
//! [`RemoteConsumerProxy`] inbox.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::listener::Listener;
use super::wire::{self, FramePush, Transport, WireError};
use crate::device::DeviceControl;
use crate::error::{DeviceError, DeviceResult};
use crate::pipeline::{DeliveredFrame, FrameSink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on pushing one frame to a consumer that stopped reading.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a device should push frames: a listener address plus the id of
/// the inbox behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRef {
    pub host: String,
    pub port: u16,
    pub consumer: u64,
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.host, self.port, self.consumer)
    }
}

/// Bounded frame queue that discards the oldest frame when full.
pub struct Inbox {
    tx: Sender<DeliveredFrame>,
    rx: Receiver<DeliveredFrame>,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Never blocks the caller.
    pub fn push(&self, mut frame: DeliveredFrame) {
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if let Ok(old) = self.rx.try_recv() {
                        metrics::counter!("labcam_inbox_dropped_total").increment(1);
                        debug!(sequence = old.meta.sequence, "inbox full, dropped oldest");
                    }
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn recv(&self) -> Option<DeliveredFrame> {
        self.rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DeliveredFrame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<DeliveredFrame> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

type Routes = Arc<Mutex<HashMap<u64, Arc<Inbox>>>>;

async fn read_pushes(mut transport: Transport, peer: SocketAddr, routes: Routes) {
    loop {
        match wire::recv::<FramePush, _>(&mut transport).await {
            Ok(push) => {
                let inbox = lock(&routes).get(&push.consumer).cloned();
                match inbox {
                    Some(inbox) => inbox.push(push.frame),
                    None => debug!(consumer = push.consumer, "frame for unknown consumer dropped"),
                }
            }
            Err(WireError::Closed) => break,
            Err(e) => {
                debug!(%peer, "device connection ended: {}", e);
                break;
            }
        }
    }
}

/// Lazily started listeners, one per interface, shared by every proxy in
/// the process.
#[derive(Default)]
pub struct CallbackRegistry {
    listeners: Mutex<HashMap<String, Listener>>,
    routes: Routes,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route pushes for a fresh consumer id to `inbox`, starting a listener
    /// on `host` if there is none yet.
    pub fn register(&self, host: &str, inbox: Arc<Inbox>) -> DeviceResult<EndpointRef> {
        let port = {
            let mut listeners = lock(&self.listeners);
            if let Some(listener) = listeners.get(host) {
                listener.local_addr().port()
            } else {
                let routes = self.routes.clone();
                let listener = Listener::bind((host, 0), "consumer", move |transport, peer| {
                    read_pushes(transport, peer, routes.clone())
                })
                .map_err(|e| DeviceError::DeliveryFailed(format!("cannot listen on {host}: {e}")))?;
                let port = listener.local_addr().port();
                info!(addr = %listener.local_addr(), "consumer listener started");
                listeners.insert(host.to_string(), listener);
                port
            }
        };
        let consumer = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.routes).insert(consumer, inbox);
        Ok(EndpointRef {
            host: host.to_string(),
            port,
            consumer,
        })
    }

    pub fn unregister(&self, endpoint: &EndpointRef) {
        lock(&self.routes).remove(&endpoint.consumer);
    }

    /// Stop every listener and join its threads.
    pub fn shutdown(&self) {
        let listeners: Vec<_> = lock(&self.listeners).drain().collect();
        for (_, mut listener) in listeners {
            listener.shutdown();
        }
        lock(&self.routes).clear();
    }
}

impl Drop for CallbackRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Device-side push target for a remote consumer. Keeps one connection
/// and reopens it on the next frame after a failure. A consumer that stops
/// reading costs at most the write timeout per frame.
pub struct RemoteSink {
    endpoint: EndpointRef,
    runtime: Runtime,
    conn: Mutex<Option<Transport>>,
    write_timeout: Duration,
}

impl RemoteSink {
    pub fn new(endpoint: EndpointRef) -> DeviceResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DeviceError::DeliveryFailed(format!("no runtime for {endpoint}: {e}")))?;
        Ok(Self {
            endpoint,
            runtime,
            conn: Mutex::new(None),
            write_timeout: WRITE_TIMEOUT,
        })
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    pub fn endpoint(&self) -> &EndpointRef {
        &self.endpoint
    }

    async fn connect(&self) -> DeviceResult<Transport> {
        let unreachable =
            |e: String| DeviceError::DeliveryFailed(format!("{} unreachable: {}", self.endpoint, e));
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| unreachable(format!("no answer within {CONNECT_TIMEOUT:?}")))?
            .map_err(|e| unreachable(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(wire::framed(stream))
    }

    async fn push(&self, conn: &mut Option<Transport>, push: &FramePush) -> DeviceResult<()> {
        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }
        let Some(transport) = conn.as_mut() else {
            return Err(DeviceError::DeliveryFailed("no connection".into()));
        };
        match timeout(self.write_timeout, wire::send(transport, push)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeviceError::DeliveryFailed(e.to_string())),
            Err(_) => Err(DeviceError::DeliveryFailed(format!(
                "{} not reading, gave up after {:?}",
                self.endpoint, self.write_timeout
            ))),
        }
    }
}

impl FrameSink for RemoteSink {
    fn deliver(&self, frame: DeliveredFrame) -> DeviceResult<()> {
        let mut conn = lock(&self.conn);
        let push = FramePush {
            consumer: self.endpoint.consumer,
            frame,
        };
        let pushed = self.runtime.block_on(self.push(&mut conn, &push));
        if pushed.is_err() {
            // A partly written frame leaves the stream out of step.
            *conn = None;
        }
        pushed
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

/// Client-side handle that receives a device's frames.
///
/// Registers itself as the device's client on creation and clears the
/// registration when dropped.
pub struct RemoteConsumerProxy {
    registry: Arc<CallbackRegistry>,
    device: Arc<dyn DeviceControl>,
    endpoint: EndpointRef,
    inbox: Arc<Inbox>,
}

impl RemoteConsumerProxy {
    /// `host` is the local interface the device can reach us on.
    pub fn new(
        registry: Arc<CallbackRegistry>,
        device: Arc<dyn DeviceControl>,
        host: &str,
        capacity: usize,
    ) -> DeviceResult<Self> {
        let inbox = Arc::new(Inbox::new(capacity));
        let endpoint = registry.register(host, inbox.clone())?;
        if let Err(e) = device.set_client(Some(endpoint.clone())) {
            registry.unregister(&endpoint);
            return Err(e);
        }
        info!(%endpoint, "consumer registered");
        Ok(Self {
            registry,
            device,
            endpoint,
            inbox,
        })
    }

    pub fn endpoint(&self) -> &EndpointRef {
        &self.endpoint
    }

    pub fn device(&self) -> &Arc<dyn DeviceControl> {
        &self.device
    }

    /// Re-register as the device's client, then enable it.
    pub fn enable(&self) -> DeviceResult<()> {
        self.device.set_client(Some(self.endpoint.clone()))?;
        self.device.enable()
    }

    /// Trigger the device and block until a frame arrives.
    pub fn trigger_and_wait(&self) -> DeviceResult<DeliveredFrame> {
        self.device.trigger()?;
        self.inbox.recv().ok_or(DeviceError::ShutDown)
    }

    pub fn trigger_and_wait_timeout(&self, timeout: Duration) -> DeviceResult<DeliveredFrame> {
        self.device.trigger()?;
        self.inbox
            .recv_timeout(timeout)
            .ok_or(DeviceError::AcquisitionTimeout)
    }

    /// Next frame pushed by the device, without triggering.
    pub fn next_frame_timeout(&self, timeout: Duration) -> Option<DeliveredFrame> {
        self.inbox.recv_timeout(timeout)
    }

    pub fn try_next(&self) -> Option<DeliveredFrame> {
        self.inbox.try_recv()
    }

    pub fn pending(&self) -> usize {
        self.inbox.len()
    }
}

impl FrameSink for RemoteConsumerProxy {
    fn deliver(&self, frame: DeliveredFrame) -> DeviceResult<()> {
        self.inbox.push(frame);
        Ok(())
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}

impl Drop for RemoteConsumerProxy {
    fn drop(&mut self) {
        if let Err(e) = self.device.set_client(None) {
            warn!(endpoint = %self.endpoint, "failed to clear client: {}", e);
        }
        self.registry.unregister(&self.endpoint);
    }
}
