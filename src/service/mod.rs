//! The embeddable HTTP service.
//!
//! A [`Service`] owns its configuration, an ordered chain of
//! [`Processor`]s, the listeners feeding it connections and the
//! [`ConnectionRegistry`] of live connections. Requests are routed to the
//! first processor that claims them, then to static resources (for `GET`,
//! when enabled), and finally answered with `404 Not Found`.
//!
//! # Examples
//!
//! ```rust,no_run
//! use slib_http::service::{RequestContext, Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::create(ServiceConfig::new().with_port(8080))?;
//!     service.add_processor(|ctx: &mut RequestContext| {
//!         if ctx.path() != "/hello" {
//!             return false;
//!         }
//!         ctx.write("Hello, World!");
//!         true
//!     });
//!     tokio::signal::ctrl_c().await?;
//!     service.release();
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::http::{Method, StatusCode, content_type};

pub mod config;
pub mod connection;
pub mod context;
pub mod header_reader;
mod outbound;
pub mod processor;
pub mod provider;
pub mod registry;
pub mod resource;
mod scheduler;

pub use config::{ConfigError, ServiceConfig};
pub use connection::Connection;
pub use context::{ContextState, RequestContext, RequestError, ResponsePacket};
pub use header_reader::HeaderReader;
pub use processor::Processor;
pub use provider::{ConnectionProvider, TcpConnectionProvider};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use resource::{FsResourceProvider, ResourceProvider};

use scheduler::{Scheduler, SchedulerHandle};

/// Resources above this size are streamed from disk instead of read into memory.
pub const RESOURCE_STREAM_THRESHOLD: u64 = 0x100000;

/// Errors produced while starting or extending a service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service is already running")]
    AlreadyRunning,

    #[error("service is not running")]
    NotRunning,

    #[error("failed to create the scheduling runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// An HTTP/1.1 service.
///
/// Dropping the service releases it.
pub struct Service {
    shared: Arc<ServiceShared>,
}

/// A non-owning reference to a [`Service`], handed to connection providers.
#[derive(Clone)]
pub struct ServiceHandle {
    shared: Weak<ServiceShared>,
}

pub(crate) struct ServiceShared {
    state: Mutex<ServiceState>,
    config: RwLock<Arc<ServiceConfig>>,
    processors: RwLock<Vec<Arc<dyn Processor>>>,
    resources: RwLock<Option<Arc<dyn ResourceProvider>>>,
    registry: ConnectionRegistry,
}

#[derive(Default)]
struct ServiceState {
    running: bool,
    /// The resource provider was installed by `start` rather than the user.
    default_resources: bool,
    scheduler: Option<Scheduler>,
    providers: Vec<Arc<dyn ConnectionProvider>>,
}

impl Service {
    /// Creates a stopped service with the default configuration.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServiceShared {
                state: Mutex::new(ServiceState::default()),
                config: RwLock::new(Arc::new(ServiceConfig::default())),
                processors: RwLock::new(Vec::new()),
                resources: RwLock::new(None),
                registry: ConnectionRegistry::new(),
            }),
        }
    }

    /// Creates a service and starts it with `config`.
    pub fn create(config: ServiceConfig) -> Result<Self, ServiceError> {
        let service = Self::new();
        service.start(config)?;
        Ok(service)
    }

    /// Starts the service: sets up the scheduler and, when `config.port` is
    /// non-zero, the built-in TCP listener.
    ///
    /// Inside a tokio runtime the ambient runtime is used; otherwise one with
    /// `max_threads` workers is created and owned by the service.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::AlreadyRunning`] if the service was already started;
    ///   the running service is left untouched.
    /// - [`ServiceError::Runtime`] / [`ServiceError::Bind`] if the scheduler
    ///   or the listener cannot be created; nothing is left running.
    pub fn start(&self, config: ServiceConfig) -> Result<(), ServiceError> {
        let mut state = self.shared.lock_state();
        if state.running {
            return Err(ServiceError::AlreadyRunning);
        }

        let scheduler = Scheduler::create(config.worker_count()).map_err(ServiceError::Runtime)?;
        if let Some(addr) = config.listen_addr() {
            match TcpConnectionProvider::bind(self.handle(), addr, scheduler.handle()) {
                Ok(provider) => state.providers.push(provider),
                Err(e) => {
                    scheduler.release();
                    return Err(e);
                }
            }
        }

        {
            let mut resources = write(&self.shared.resources);
            if resources.is_none() || state.default_resources {
                *resources = Some(Arc::new(FsResourceProvider::new(&config.resource_root)));
                state.default_resources = true;
            }
        }
        *write(&self.shared.config) = Arc::new(config);
        state.scheduler = Some(scheduler);
        state.running = true;
        debug!("service started");
        Ok(())
    }

    /// `true` between a successful [`start`](Self::start) and [`release`](Self::release).
    pub fn is_running(&self) -> bool {
        self.shared.lock_state().running
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> Arc<ServiceConfig> {
        self.shared.config()
    }

    /// Returns a non-owning handle for connection providers.
    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Appends a processor to the chain. Processors run in registration order.
    pub fn add_processor<P>(&self, processor: P)
    where
        P: Processor + 'static,
    {
        self.add_processor_arc(Arc::new(processor));
    }

    /// Like [`add_processor`](Self::add_processor), for a shared processor.
    pub fn add_processor_arc(&self, processor: Arc<dyn Processor>) {
        write(&self.shared.processors).push(processor);
    }

    /// Replaces the provider used for static resources. It is kept across
    /// restarts; otherwise each [`start`](Self::start) serves from the new
    /// configuration's `resource_root`.
    pub fn set_resource_provider(&self, provider: Arc<dyn ResourceProvider>) {
        let mut state = self.shared.lock_state();
        *write(&self.shared.resources) = Some(provider);
        state.default_resources = false;
    }

    /// Starts an additional TCP listener and returns the bound address.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotRunning`] before [`start`](Self::start), or
    /// [`ServiceError::Bind`].
    pub fn add_listener(&self, addr: SocketAddr) -> Result<SocketAddr, ServiceError> {
        let mut state = self.shared.lock_state();
        let scheduler = state.scheduler.as_ref().ok_or(ServiceError::NotRunning)?;
        let provider = TcpConnectionProvider::bind(self.handle(), addr, scheduler.handle())?;
        let local_addr = provider.local_addr;
        state.providers.push(provider);
        Ok(local_addr)
    }

    /// Registers a custom connection provider, released with the service.
    pub fn add_connection_provider(&self, provider: Arc<dyn ConnectionProvider>) {
        self.shared.lock_state().providers.push(provider);
    }

    /// Addresses of every provider that accepts on one.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .lock_state()
            .providers
            .iter()
            .filter_map(|p| p.local_addr())
            .collect()
    }

    /// Wraps an accepted stream in a [`Connection`] and starts serving it.
    ///
    /// Returns `None` (dropping the stream) when the service is not running.
    pub fn add_connection<S>(
        &self,
        stream: S,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Option<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.shared.add_connection(stream, remote_addr, local_addr)
    }

    /// Looks up a live connection.
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Closes and deregisters one connection. Unknown ids are ignored.
    pub fn close_connection(&self, id: ConnectionId) {
        if let Some(connection) = self.shared.registry.get(id) {
            connection.close();
        }
    }

    /// Routes `context` through the processor chain and resource fallback.
    pub fn process_request(&self, context: &mut RequestContext) {
        self.shared.process_request(context);
    }

    /// Stops every listener, closes every connection and releases the
    /// scheduler. Safe to call repeatedly.
    pub fn release(&self) {
        let (providers, scheduler) = {
            let mut state = self.shared.lock_state();
            state.running = false;
            (std::mem::take(&mut state.providers), state.scheduler.take())
        };
        for provider in &providers {
            provider.release();
        }
        for connection in self.shared.registry.drain() {
            connection.close();
        }
        if let Some(scheduler) = scheduler {
            scheduler.release();
            debug!("service released");
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.release();
    }
}

impl ServiceHandle {
    /// `false` once the service has been dropped.
    pub fn is_alive(&self) -> bool {
        self.shared.strong_count() > 0
    }

    /// See [`Service::add_connection`].
    pub fn add_connection<S>(
        &self,
        stream: S,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Option<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.shared
            .upgrade()?
            .add_connection(stream, remote_addr, local_addr)
    }
}

impl ServiceShared {
    pub(crate) fn config(&self) -> Arc<ServiceConfig> {
        Arc::clone(&read(&self.config))
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub(crate) fn scheduler(&self) -> Option<SchedulerHandle> {
        self.lock_state().scheduler.as_ref().map(|s| s.handle().clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_connection<S>(
        self: &Arc<Self>,
        stream: S,
        remote_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
    ) -> Option<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Some(scheduler) = self.scheduler() else {
            debug!("service is not running; dropping connection");
            return None;
        };
        let connection = Connection::spawn(self, &scheduler, stream, remote_addr, local_addr);
        if self.config().log_debug {
            info!(
                connection = %connection.id(),
                remote = ?remote_addr,
                "connection created"
            );
        }
        Some(connection)
    }

    pub(crate) fn close_connection(&self, id: ConnectionId) {
        if self.registry.remove(id).is_some() && self.config().log_debug {
            info!(connection = %id, "connection closed");
        }
    }

    /// Offers a freshly parsed header to every processor's
    /// [`Processor::preprocess`]. Returns `true` when one took it over.
    pub(crate) fn preprocess_request(
        &self,
        context: &mut RequestContext,
        connection: &Arc<Connection>,
    ) -> bool {
        let processors = read(&self.processors).clone();
        let taken = processors
            .iter()
            .any(|processor| processor.preprocess(context, connection));
        if taken && self.config().log_debug {
            info!(
                connection = %context.connection_id(),
                method = %context.method(),
                path = context.path(),
                "request taken over"
            );
        }
        taken
    }

    pub(crate) fn process_request(&self, context: &mut RequestContext) {
        let config = self.config();
        if config.log_debug {
            info!(
                connection = %context.connection_id(),
                method = %context.method(),
                path = context.path(),
                query = context.query(),
                host = context.host(),
                "request"
            );
        }

        let processors = read(&self.processors).clone();
        for processor in &processors {
            if processor.handle(context) {
                return;
            }
        }

        if config.use_resource && *context.method() == Method::Get {
            let resources = read(&self.resources).clone();
            // Requests climbing above the resource prefix are never served.
            let path = resource::normalize_path(&percent_decode_str(context.path()).decode_utf8_lossy());
            if let (Some(resources), Some(path)) = (resources, path) {
                let path = format!("{}{}", config.resource_prefix, path);
                if serve_resource(resources.as_ref(), context, &path)
                    || serve_resource(resources.as_ref(), context, &format!("{path}/index.html"))
                {
                    return;
                }
            }
        }

        context.clear_response_body();
        context.set_response_status(StatusCode::NotFound);
    }
}

/// Writes the resource at `path` into the response. Returns `false` when
/// there is no such resource. An empty file is a resource and is served as
/// an empty `200`.
fn serve_resource(resources: &dyn ResourceProvider, context: &mut RequestContext, path: &str) -> bool {
    let Some(path) = resource::normalize_path(path) else {
        return false;
    };
    if path.is_empty() || !resources.exists(&path) {
        return false;
    }

    let mime = content_type::for_path(&path);
    let size = resources.size(&path).unwrap_or(0);
    if size > RESOURCE_STREAM_THRESHOLD {
        if let Some(file) = resources.open(&path) {
            context.set_response_content_type(mime);
            context.write_file(file, size);
            return true;
        }
    }
    match resources.read_all(&path) {
        Ok(bytes) => {
            context.set_response_content_type(mime);
            context.write_bytes(bytes);
            true
        }
        Err(e) => {
            debug!(path = %path, error = %e, "failed to read resource");
            false
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
