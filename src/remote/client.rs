//! Calls a remote device's control surface.
//!
//! Calls are blocking and serialized over one connection. The client owns
//! a small current-thread runtime to drive its socket, so it must not be
//! used from inside an async task.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use super::consumer::EndpointRef;
use super::wire::{self, Reply, Request, Response, Transport, WireError};
use crate::device::{DeviceControl, DeviceSettings, DeviceStatus};
use crate::error::{DeviceError, DeviceResult};
use crate::hardware::{ParamDescriptor, ParamValue};
use crate::pipeline::{CorrectionFrame, Transform};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on a `RemoteServer`. A connection that fails or times out is
/// dropped and the next call dials again.
pub struct DeviceClient {
    runtime: Runtime,
    addr: SocketAddr,
    conn: Mutex<Option<Transport>>,
    timeout: Mutex<Option<Duration>>,
}

impl DeviceClient {
    pub fn connect<A: ToSocketAddrs>(addr: A) -> DeviceResult<Self> {
        let remote = |e: std::io::Error| DeviceError::Remote(format!("connect failed: {e}"));
        let addr = addr
            .to_socket_addrs()
            .map_err(remote)?
            .next()
            .ok_or_else(|| DeviceError::Remote("connect failed: no address resolved".into()))?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(remote)?;
        let transport = runtime.block_on(dial(addr)).map_err(remote)?;
        debug!(peer = %addr, "connected to device");
        Ok(Self {
            runtime,
            addr,
            conn: Mutex::new(Some(transport)),
            timeout: Mutex::new(None),
        })
    }

    /// Bound every call, dialing included. `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> DeviceResult<()> {
        *lock(&self.timeout) = timeout;
        Ok(())
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    pub fn ping(&self) -> DeviceResult<()> {
        match self.call(Request::Ping)? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn call(&self, request: Request) -> DeviceResult<Reply> {
        let timeout = *lock(&self.timeout);
        let mut conn = lock(&self.conn);
        let call = request.name();
        let exchanged = self.runtime.block_on(async {
            let exchange = exchange(&mut conn, self.addr, &request);
            match timeout {
                Some(limit) => tokio::time::timeout(limit, exchange)
                    .await
                    .unwrap_or(Err(WireError::TimedOut(limit))),
                None => exchange.await,
            }
        });
        match exchanged {
            Ok(response) => Ok(response?),
            Err(e) => {
                // A late reply would answer the wrong call.
                *conn = None;
                debug!(peer = %self.addr, call, "connection dropped: {}", e);
                Err(e.into())
            }
        }
    }

    fn call_done(&self, request: Request) -> DeviceResult<()> {
        match self.call(request)? {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

async fn dial(addr: SocketAddr) -> std::io::Result<Transport> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    Ok(wire::framed(stream))
}

async fn exchange(
    conn: &mut Option<Transport>,
    addr: SocketAddr,
    request: &Request,
) -> Result<Response, WireError> {
    if conn.is_none() {
        debug!(peer = %addr, "reconnecting to device");
        *conn = Some(dial(addr).await?);
    }
    let Some(transport) = conn.as_mut() else {
        return Err(WireError::Closed);
    };
    wire::send(transport, request).await?;
    wire::recv(transport).await
}

fn unexpected(reply: Reply) -> DeviceError {
    DeviceError::Remote(format!("unexpected reply {reply:?}"))
}

impl DeviceControl for DeviceClient {
    fn enable(&self) -> DeviceResult<()> {
        self.call_done(Request::Enable)
    }

    fn disable(&self) -> DeviceResult<()> {
        self.call_done(Request::Disable)
    }

    fn configure(&self, settings: DeviceSettings) -> DeviceResult<()> {
        self.call_done(Request::Configure(settings))
    }

    fn settings(&self) -> DeviceResult<DeviceSettings> {
        match self.call(Request::Settings)? {
            Reply::Settings(settings) => Ok(settings),
            other => Err(unexpected(other)),
        }
    }

    fn status(&self) -> DeviceResult<DeviceStatus> {
        match self.call(Request::Status)? {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    fn set_client(&self, endpoint: Option<EndpointRef>) -> DeviceResult<()> {
        self.call_done(Request::SetClient(endpoint))
    }

    fn trigger(&self) -> DeviceResult<()> {
        self.call_done(Request::Trigger)
    }

    fn go_silent(&self) -> DeviceResult<()> {
        self.call_done(Request::GoSilent)
    }

    fn go_loud(&self) -> DeviceResult<()> {
        self.call_done(Request::GoLoud)
    }

    fn set_correction(&self, correction: Option<CorrectionFrame>) -> DeviceResult<()> {
        self.call_done(Request::SetCorrection(correction))
    }

    fn get_id(&self) -> DeviceResult<String> {
        match self.call(Request::GetId)? {
            Reply::Id(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    fn set_transform(&self, transform: Transform) -> DeviceResult<()> {
        self.call_done(Request::SetTransform(transform))
    }

    fn transform(&self) -> DeviceResult<Transform> {
        match self.call(Request::Transform)? {
            Reply::Transform(transform) => Ok(transform),
            other => Err(unexpected(other)),
        }
    }

    fn describe_settings(&self) -> DeviceResult<Vec<ParamDescriptor>> {
        match self.call(Request::DescribeSettings)? {
            Reply::SettingDescriptions(descriptors) => Ok(descriptors),
            other => Err(unexpected(other)),
        }
    }

    fn get_setting(&self, name: &str) -> DeviceResult<ParamValue> {
        match self.call(Request::GetSetting(name.to_string()))? {
            Reply::Setting(value) => Ok(value.into()),
            other => Err(unexpected(other)),
        }
    }

    fn set_setting(&self, name: &str, value: ParamValue) -> DeviceResult<()> {
        self.call_done(Request::SetSetting(name.to_string(), value.into()))
    }
}
