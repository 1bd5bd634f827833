//! Loopback TCP service that evaluates scripts for remote clients.
//!
//! [`Server`] owns the listener, the connection [`Multiplexer`], the
//! configuration and the host bindings. Each cycle it accepts at most one
//! connection, polls the others, and answers every readable client in turn:
//! parse, execute under the compute budget, render under the serialization
//! budget, write. The [`supervisor`] keeps cycling until shutdown is
//! requested.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::interpreter::HostBindings;
use crate::interpreter::builtins::NoBindings;
use crate::runtime::{ConfigError, Limits, execute};

pub mod client;
pub mod multiplexer;
pub mod protocol;
pub mod supervisor;

pub use client::{Client, ClientError, Reply};
pub use multiplexer::{ConnectionId, Multiplexer, RecvOutcome};
pub use protocol::{ProtocolError, Request};
pub use supervisor::{Supervised, Supervisor};

/// Default size of the single read that carries one request.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Default pause between cycles, in milliseconds.
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 50;

/// Errors surfaced by the server loop.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Socket-level failure outside any single connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The server was used after [`Server::shutdown`].
    #[error("server has been shut down")]
    ShutDown,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind (loopback by default)
    pub host: IpAddr,

    /// TCP port (default 9998; 0 picks a free port)
    pub port: u16,

    /// Per-request execution limits
    pub limits: Limits,

    /// Pause between cycles in milliseconds
    pub idle_interval_ms: u64,

    /// Maximum bytes read for one request
    pub max_request_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: crate::DEFAULT_PORT,
            limits: Limits::default(),
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl ServerConfig {
    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the execution limits.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the idle pause between cycles.
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Set the maximum request size.
    pub fn with_max_request_bytes(mut self, bytes: usize) -> Self {
        self.max_request_bytes = bytes;
        self
    }

    /// Idle pause as a [`Duration`].
    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    /// Check the configuration before binding.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate()?;
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Zero("max_request_bytes"));
        }
        if !self.host.is_loopback() {
            warn!(host = %self.host, "binding a non-loopback address; the channel is unauthenticated");
        }
        Ok(())
    }
}

/// External shutdown predicate, checked once per cycle.
pub trait ShutdownSignal {
    /// Whether the server should stop.
    fn is_shutdown(&self) -> bool;
}

impl ShutdownSignal for AtomicBool {
    fn is_shutdown(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<T: ShutdownSignal + ?Sized> ShutdownSignal for Arc<T> {
    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }
}

impl<T: ShutdownSignal + ?Sized> ShutdownSignal for &T {
    fn is_shutdown(&self) -> bool {
        (**self).is_shutdown()
    }
}

/// Adapts a closure into a [`ShutdownSignal`].
pub struct ShutdownFn<F>(pub F);

impl<F: Fn() -> bool> ShutdownSignal for ShutdownFn<F> {
    fn is_shutdown(&self) -> bool {
        (self.0)()
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Connection accepted this cycle, if any.
    pub accepted: Option<ConnectionId>,
    /// Requests answered this cycle.
    pub served: usize,
    /// Connections retired after EOF or a failed read or write.
    pub retired: usize,
}

/// Listener, connection set, configuration and host bindings.
pub struct Server {
    config: ServerConfig,
    multiplexer: Option<Multiplexer>,
    bindings: Arc<dyn HostBindings + Send + Sync>,
    requests_served: u64,
}

impl Server {
    /// Validate `config` and bind the listening socket.
    pub fn bind(config: ServerConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let listener = TcpListener::bind(SocketAddr::new(config.host, config.port))?;
        let multiplexer = Multiplexer::new(listener)?;
        info!(addr = %multiplexer.local_addr()?, "listening");
        Ok(Self {
            config,
            multiplexer: Some(multiplexer),
            bindings: Arc::new(NoBindings),
            requests_served: 0,
        })
    }

    /// Install host bindings into every request's interpreter.
    pub fn with_bindings(mut self, bindings: impl HostBindings + Send + Sync + 'static) -> Self {
        self.bindings = Arc::new(bindings);
        self
    }

    /// Bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServiceError> {
        Ok(self.multiplexer()?.local_addr()?)
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.multiplexer.as_ref().map_or(0, Multiplexer::len)
    }

    /// Requests answered since binding.
    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    fn multiplexer(&self) -> Result<&Multiplexer, ServiceError> {
        self.multiplexer.as_ref().ok_or(ServiceError::ShutDown)
    }

    /// Run one accept/poll/serve pass without sleeping.
    pub fn run_cycle(&mut self) -> Result<CycleReport, ServiceError> {
        let max_request_bytes = self.config.max_request_bytes;
        let mut report = CycleReport::default();

        let mux = self.multiplexer.as_mut().ok_or(ServiceError::ShutDown)?;
        report.accepted = mux.accept_if_ready()?;
        let mut readable = mux.poll_readable()?;
        readable.retain(|id| Some(*id) != report.accepted);

        for id in readable {
            let mux = self.multiplexer.as_mut().ok_or(ServiceError::ShutDown)?;
            let line = match mux.recv(id, max_request_bytes) {
                RecvOutcome::Data(bytes) => bytes,
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Closed => {
                    if mux.retire(id) {
                        report.retired += 1;
                    }
                    continue;
                }
            };
            let response = self.handle_line(&line);
            let mux = self.multiplexer.as_mut().ok_or(ServiceError::ShutDown)?;
            if mux.send(id, response.as_bytes()).is_err() {
                mux.retire(id);
                report.retired += 1;
                continue;
            }
            self.requests_served += 1;
            report.served += 1;
        }
        Ok(report)
    }

    /// Answer one received request line.
    pub fn handle_line(&self, bytes: &[u8]) -> String {
        let limits = &self.config.limits;
        let result = match protocol::parse_request(bytes) {
            Ok(request) => {
                debug!(
                    request_id = request.request_id,
                    declared_length = request.declared_length,
                    "evaluating request"
                );
                execute(&request.code, Some(request.request_id), limits, self.bindings.as_ref())
            }
            Err(error) => {
                let request_id = protocol::salvage_request_id(bytes);
                warn!(?request_id, %error, "malformed request");
                protocol::protocol_error_result(&error, request_id)
            }
        };
        protocol::format_response(&result, limits)
    }

    /// Cycle until `shutdown` reports true, sleeping between cycles.
    pub fn serve(&mut self, shutdown: &dyn ShutdownSignal) -> Result<(), ServiceError> {
        let idle = self.config.idle_interval();
        loop {
            self.run_cycle()?;
            if shutdown.is_shutdown() {
                return Ok(());
            }
            thread::sleep(idle);
        }
    }

    /// Close every connection and the listener.
    pub fn shutdown(&mut self) {
        if let Some(mut mux) = self.multiplexer.take() {
            mux.close_all();
            let stats = mux.stats();
            info!(
                accepted = stats.accepted,
                closed = stats.closed,
                served = self.requests_served,
                "server stopped"
            );
        }
    }
}

impl Supervised for Server {
    fn serve(&mut self, shutdown: &dyn ShutdownSignal) -> Result<(), ServiceError> {
        Server::serve(self, shutdown)
    }

    fn shutdown(&mut self) {
        Server::shutdown(self)
    }
}
