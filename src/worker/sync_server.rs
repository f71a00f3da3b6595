//! Blocking thread-per-call scheduling variant.
//!
//! Each accepted connection occupies one OS thread for its full lifetime;
//! accept → dispatch → execute → respond run sequentially on that thread.
//! Concurrency is bounded by `server.max_connections`. The accept loop
//! polls a nonblocking listener so it can observe shutdown promptly.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::worker::engine::{CancelToken, WorkerEngine};
use crate::worker::protocol;
use crate::worker::service::ServiceState;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Start the accept thread. Returns once it is running.
pub(crate) fn spawn(
    listener: TcpListener,
    engine: Arc<WorkerEngine>,
    config: Arc<WorkerConfig>,
    shutdown: CancelToken,
    state: Arc<watch::Sender<ServiceState>>,
) -> std::io::Result<()> {
    listener.set_nonblocking(true)?;
    std::thread::Builder::new()
        .name("worker-accept".to_string())
        .spawn(move || accept_loop(listener, engine, config, shutdown, state))?;
    Ok(())
}

fn accept_loop(
    listener: TcpListener,
    engine: Arc<WorkerEngine>,
    config: Arc<WorkerConfig>,
    shutdown: CancelToken,
    state: Arc<watch::Sender<ServiceState>>,
) {
    let active = Arc::new(AtomicUsize::new(0));

    while !shutdown.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if active.load(Ordering::Acquire) >= config.server.max_connections {
                    warn!(%peer, "Connection limit reached, refusing connection");
                    continue;
                }
                // Accepted sockets do not inherit the listener's
                // nonblocking mode on every platform.
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "Failed to configure connection");
                    continue;
                }

                debug!(%peer, "Accepted connection");
                active.fetch_add(1, Ordering::AcqRel);

                let engine = engine.clone();
                let shutdown = shutdown.clone();
                let active_conn = active.clone();
                let spawned = std::thread::Builder::new()
                    .name("worker-conn".to_string())
                    .spawn(move || {
                        handle_connection(stream, engine, shutdown);
                        active_conn.fetch_sub(1, Ordering::AcqRel);
                    });

                if let Err(e) = spawned {
                    active.fetch_sub(1, Ordering::AcqRel);
                    warn!(error = %e, "Failed to spawn connection thread");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!("Synchronous accept loop stopped");
    state.send_replace(ServiceState::Stopped);
}

fn handle_connection(mut stream: TcpStream, engine: Arc<WorkerEngine>, shutdown: CancelToken) {
    loop {
        let frame = match protocol::read_frame_blocking(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Connection read failed");
                break;
            }
        };

        let reply = engine.handle_frame(frame, &shutdown.child());

        if let Err(e) = protocol::write_frame_blocking(&mut stream, &reply) {
            debug!(error = %e, "Connection write failed");
            break;
        }
    }
}
