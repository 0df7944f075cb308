//! TCP accept loop shared by the control server and the consumer listeners.
//!
//! The socket is bound up front so bind errors reach the caller. Accepting
//! then happens on one dedicated thread that drives a current-thread tokio
//! runtime; every connection becomes a task on that runtime. Shutting down
//! stops the accept loop and drops the runtime, which closes every open
//! connection.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use super::wire::{self, Transport};

/// How long shutdown waits for device calls still running on blocking threads.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Listener {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Bind `addr` and serve each connection with `handler` as its own task.
    pub fn bind<A, F, Fut>(addr: A, name: &str, handler: F) -> io::Result<Self>
    where
        A: ToSocketAddrs,
        F: Fn(Transport, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let socket = StdTcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;

        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name(format!("{name}-call"))
            .build()?;
        let (stop, stopped) = oneshot::channel();
        let thread = thread::Builder::new()
            .name(format!("{name}-listener"))
            .spawn(move || run(runtime, socket, handler, stopped))?;

        Ok(Self {
            addr,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting, close open connections and join the thread. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(addr = %self.addr, "listener thread panicked");
            }
            debug!(addr = %self.addr, "listener stopped");
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F, Fut>(runtime: Runtime, socket: StdTcpListener, handler: F, stopped: oneshot::Receiver<()>)
where
    F: Fn(Transport, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    runtime.block_on(accept_loop(socket, handler, stopped));
    runtime.shutdown_timeout(DRAIN_TIMEOUT);
}

async fn accept_loop<F, Fut>(socket: StdTcpListener, handler: F, mut stopped: oneshot::Receiver<()>)
where
    F: Fn(Transport, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = match TcpListener::from_std(socket) {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot register listener: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%peer, "connection accepted");
                    tokio::spawn(handler(wire::framed(stream), peer));
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}
