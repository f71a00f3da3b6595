//! Worker service lifecycle.
//!
//! `Created → Bound → Serving → ShuttingDown → Stopped`, published through
//! a watch channel so any number of observers can park on transitions.
//! The scheduling variant is chosen once at `serve()` from the resolved
//! configuration and cannot change for the lifetime of the process.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::info;

use crate::config::{SchedulingMode, WorkerConfig};
use crate::device::DeviceContext;
use crate::worker::engine::{CancelToken, WorkerEngine};
use crate::worker::{async_server, sync_server};

/// Lifecycle states of one service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Bound,
    Serving,
    ShuttingDown,
    Stopped,
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to bind `{addr}`: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Service cannot serve from state {0:?}")]
    NotBound(ServiceState),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The request-serving worker process core.
pub struct WorkerService {
    local_addr: SocketAddr,
    config: Arc<WorkerConfig>,
    engine: Arc<WorkerEngine>,
    listener: Option<std::net::TcpListener>,
    state: Arc<watch::Sender<ServiceState>>,
    shutdown: CancelToken,
    shutdown_notify: Arc<Notify>,
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService")
            .field("local_addr", &self.local_addr)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl WorkerService {
    /// Bind the service to `addr` (`Created → Bound`).
    ///
    /// Binding failure is fatal to process start; callers report it and
    /// exit non-zero.
    pub fn bind(
        addr: &str,
        config: Arc<WorkerConfig>,
        ctx: Arc<DeviceContext>,
    ) -> Result<Self, ServiceError> {
        let state = Arc::new(watch::channel(ServiceState::Created).0);

        let listener =
            std::net::TcpListener::bind(addr).map_err(|source| ServiceError::BindFailure {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        state.send_replace(ServiceState::Bound);
        info!(%local_addr, scheduling = %config.server.scheduling, "Worker service bound");

        Ok(Self {
            local_addr,
            engine: Arc::new(WorkerEngine::new(ctx)),
            config,
            listener: Some(listener),
            state,
            shutdown: CancelToken::new(),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    /// The address actually bound (resolves `:0` to the assigned port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// The engine serving this instance's requests.
    pub fn engine(&self) -> &Arc<WorkerEngine> {
        &self.engine
    }

    /// Start accepting connections (`Bound → Serving`) under the
    /// configured scheduling variant. Returns once the accept machinery is
    /// running; use [`WorkerService::wait`] to park until shutdown.
    pub fn serve(&mut self) -> Result<(), ServiceError> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ServiceError::NotBound(self.state()))?;

        self.state.send_replace(ServiceState::Serving);
        info!(addr = %self.local_addr, variant = %self.config.server.scheduling, "Serving requests");

        match self.config.server.scheduling {
            SchedulingMode::Synchronous => sync_server::spawn(
                listener,
                self.engine.clone(),
                self.config.clone(),
                self.shutdown.clone(),
                self.state.clone(),
            )?,
            SchedulingMode::Asynchronous => async_server::spawn(
                listener,
                self.engine.clone(),
                self.config.clone(),
                self.shutdown.clone(),
                self.shutdown_notify.clone(),
                self.state.clone(),
            )?,
        }

        Ok(())
    }

    /// Park until the service reaches `Stopped`. The only intended way for
    /// the hosting process to wait after startup.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow_and_update() != ServiceState::Stopped {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Trigger shutdown: cancels in-flight requests and stops the accept
    /// machinery. Idempotent.
    pub fn shutdown(&self) {
        match self.state() {
            ServiceState::Serving => {
                self.state.send_replace(ServiceState::ShuttingDown);
                self.shutdown.cancel();
                // One accept loop is the sole waiter; notify_one stores a
                // permit if it has not reached its select yet.
                self.shutdown_notify.notify_one();
            }
            ServiceState::Stopped | ServiceState::ShuttingDown => {}
            _ => {
                self.shutdown.cancel();
                self.state.send_replace(ServiceState::Stopped);
            }
        }
    }
}
