//! Serves one device's control surface over TCP.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::listener::Listener;
use super::wire::{self, RemoteError, RemoteErrorKind, Reply, Request, Response, Transport, WireError};
use crate::device::DeviceControl;
use crate::error::ServerError;

pub struct RemoteServer {
    listener: Listener,
}

impl RemoteServer {
    pub fn bind<A>(addr: A, device: Arc<dyn DeviceControl>) -> Result<Self, ServerError>
    where
        A: ToSocketAddrs + std::fmt::Debug,
    {
        let shown = format!("{addr:?}");
        let listener = Listener::bind(addr, "control", move |transport, peer| {
            serve_connection(transport, peer, device.clone())
        })
        .map_err(|source| ServerError::Bind {
            addr: shown,
            source,
        })?;
        info!(addr = %listener.local_addr(), "control server listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Stop accepting calls and wait for in-flight ones to finish.
    pub fn shutdown(&mut self) {
        self.listener.shutdown();
    }
}

/// Answer calls in order until the client hangs up. Device calls block, so
/// each one runs on the runtime's blocking pool.
async fn serve_connection(mut transport: Transport, peer: SocketAddr, device: Arc<dyn DeviceControl>) {
    loop {
        let request: Request = match wire::recv(&mut transport).await {
            Ok(request) => request,
            Err(WireError::Closed) => break,
            Err(e) => {
                debug!(%peer, "control connection ended: {}", e);
                break;
            }
        };
        let call = request.name();
        debug!(%peer, call, "call");
        let device = device.clone();
        let response = tokio::task::spawn_blocking(move || dispatch(device.as_ref(), request))
            .await
            .unwrap_or_else(|e| {
                warn!(%peer, call, "device call panicked: {}", e);
                Err(RemoteError {
                    kind: RemoteErrorKind::Other,
                    message: format!("{call} panicked"),
                })
            });
        if let Err(e) = wire::send(&mut transport, &response).await {
            warn!(%peer, call, "failed to send reply: {}", e);
            break;
        }
    }
    debug!(%peer, "client disconnected");
}

pub(crate) fn dispatch(device: &dyn DeviceControl, request: Request) -> Response {
    let result = match request {
        Request::Ping => Ok(Reply::Pong),
        Request::Enable => device.enable().map(|()| Reply::Done),
        Request::Disable => device.disable().map(|()| Reply::Done),
        Request::Configure(settings) => device.configure(settings).map(|()| Reply::Done),
        Request::Settings => device.settings().map(Reply::Settings),
        Request::Status => device.status().map(Reply::Status),
        Request::SetClient(endpoint) => device.set_client(endpoint).map(|()| Reply::Done),
        Request::Trigger => device.trigger().map(|()| Reply::Done),
        Request::GoSilent => device.go_silent().map(|()| Reply::Done),
        Request::GoLoud => device.go_loud().map(|()| Reply::Done),
        Request::SetCorrection(frame) => device.set_correction(frame).map(|()| Reply::Done),
        Request::GetId => device.get_id().map(Reply::Id),
        Request::SetTransform(transform) => device.set_transform(transform).map(|()| Reply::Done),
        Request::Transform => device.transform().map(Reply::Transform),
        Request::DescribeSettings => device.describe_settings().map(Reply::SettingDescriptions),
        Request::GetSetting(name) => device
            .get_setting(&name)
            .map(|value| Reply::Setting(value.into())),
        Request::SetSetting(name, value) => device
            .set_setting(&name, value.into())
            .map(|()| Reply::Done),
    };
    result.map_err(|e| RemoteError::from(&e))
}
