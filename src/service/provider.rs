//! Sources of new connections.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use super::scheduler::SchedulerHandle;
use super::{ServiceError, ServiceHandle};

/// Something that produces byte streams for a service.
///
/// A provider hands each new stream to
/// [`ServiceHandle::add_connection`]; the service keeps the provider until
/// [`Service::release`](super::Service::release), which calls
/// [`release`](Self::release) to stop it.
pub trait ConnectionProvider: Send + Sync {
    /// Stops producing connections. Must be idempotent.
    fn release(&self);

    /// Address the provider accepts on, when it has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Accepts TCP connections on a bound address.
#[derive(Debug)]
pub struct TcpConnectionProvider {
    pub(crate) local_addr: SocketAddr,
    accept_task: Mutex<Option<AbortHandle>>,
}

impl TcpConnectionProvider {
    /// Binds `addr` and starts accepting on `scheduler`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub(crate) fn bind(
        service: ServiceHandle,
        addr: SocketAddr,
        scheduler: &SchedulerHandle,
    ) -> Result<Arc<Self>, ServiceError> {
        let bind_error = |source| ServiceError::Bind { addr, source };
        let std_listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = std_listener.local_addr().map_err(bind_error)?;
        let listener = {
            let _runtime = scheduler.runtime().enter();
            TcpListener::from_std(std_listener).map_err(bind_error)?
        };

        let accept_task = scheduler.spawn(accept_loop(listener, service));
        info!(address = %local_addr, "listening");
        Ok(Arc::new(Self {
            local_addr,
            accept_task: Mutex::new(Some(accept_task.abort_handle())),
        }))
    }
}

impl ConnectionProvider for TcpConnectionProvider {
    fn release(&self) {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            debug!(address = %self.local_addr, "listener released");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}

impl Drop for TcpConnectionProvider {
    fn drop(&mut self) {
        self.release();
    }
}

async fn accept_loop(listener: TcpListener, service: ServiceHandle) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "failed to accept connection");
                continue;
            }
        };
        if !service.is_alive() {
            return;
        }
        debug!(peer = %peer_addr, "connection accepted");
        let local_addr = stream.local_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
        }
        service.add_connection(stream, Some(peer_addr), local_addr);
    }
}
