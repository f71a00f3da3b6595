//! Event-driven multiplexed scheduling variant.
//!
//! The tokio runtime's polling threads drive many in-flight calls at once;
//! a connection suspends at transport-readiness wait points instead of
//! occupying a thread. Request execution itself runs on the blocking pool,
//! so storage mutexes and host↔device copies never stall the pollers.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::worker::engine::{CancelToken, WorkerEngine};
use crate::worker::protocol;
use crate::worker::service::ServiceState;

/// Start the accept task. Returns once it is spawned; must be called from
/// within a tokio runtime.
pub(crate) fn spawn(
    listener: std::net::TcpListener,
    engine: Arc<WorkerEngine>,
    config: Arc<WorkerConfig>,
    shutdown: CancelToken,
    shutdown_notify: Arc<Notify>,
    state: Arc<watch::Sender<ServiceState>>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    tokio::spawn(accept_loop(
        listener,
        engine,
        config,
        shutdown,
        shutdown_notify,
        state,
    ));
    Ok(())
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    engine: Arc<WorkerEngine>,
    config: Arc<WorkerConfig>,
    shutdown: CancelToken,
    shutdown_notify: Arc<Notify>,
    state: Arc<watch::Sender<ServiceState>>,
) {
    let limiter = Arc::new(Semaphore::new(config.server.max_connections));

    while !shutdown.is_cancelled() {
        tokio::select! {
            _ = shutdown_notify.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = limiter.clone().try_acquire_owned() else {
                        warn!(%peer, "Connection limit reached, refusing connection");
                        continue;
                    };

                    debug!(%peer, "Accepted connection");
                    let engine = engine.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_connection(stream, engine, shutdown).await;
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
        }
    }

    info!("Asynchronous accept loop stopped");
    state.send_replace(ServiceState::Stopped);
}

async fn handle_connection(
    mut stream: TcpStream,
    engine: Arc<WorkerEngine>,
    shutdown: CancelToken,
) {
    loop {
        let frame = match protocol::read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Connection read failed");
                break;
            }
        };

        let exec_engine = engine.clone();
        let token = shutdown.child();
        let reply =
            match tokio::task::spawn_blocking(move || exec_engine.handle_frame(frame, &token))
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "Request task failed");
                    break;
                }
            };

        if let Err(e) = protocol::write_frame(&mut stream, &reply).await {
            debug!(error = %e, "Connection write failed");
            break;
        }
    }
}
