//! Background service thread: read-only `GET /status` and Ctrl-C handling.
//!
//! The main loop stays synchronous; this thread owns a small tokio runtime
//! and only ever reads [`SharedState`](crate::live_status::SharedState).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::config::StatusConfig;
use crate::live_status::{lock_shared, SharedHandle, StatusSnapshot};

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

pub struct ServiceHandle {
    pub addr: Option<SocketAddr>,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn join(self) {
        if self.join.join().is_err() {
            log::error!("Status service thread panicked");
        }
    }
}

async fn status_handler(State(shared): State<SharedHandle>) -> Json<StatusSnapshot> {
    let snapshot = lock_shared(&shared).snapshot();
    Json(snapshot)
}

pub fn router(shared: SharedHandle) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .with_state(shared)
}

async fn wait_for_shutdown(shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::SeqCst) {
        sleep(SHUTDOWN_POLL).await;
    }
}

/// Start the service thread. The listener is bound before the thread starts
/// so a bad bind address is reported to the caller.
pub fn spawn(
    config: &StatusConfig,
    shared: SharedHandle,
    shutdown: Arc<AtomicBool>,
) -> Result<ServiceHandle> {
    let listener = if config.enabled {
        let listener = std::net::TcpListener::bind(&config.bind)
            .with_context(|| format!("Failed to bind status server to {}", config.bind))?;
        listener.set_nonblocking(true)?;
        Some(listener)
    } else {
        None
    };
    let addr = listener.as_ref().and_then(|l| l.local_addr().ok());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("Failed to build status runtime")?;

    let join = thread::Builder::new()
        .name("status".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let signal_flag = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        log::info!("Ctrl-C received, shutting down");
                        signal_flag.store(true, Ordering::SeqCst);
                    }
                });

                match listener.map(TcpListener::from_std) {
                    Some(Ok(listener)) => {
                        if let Some(addr) = addr {
                            log::info!("Status server listening on http://{}/status", addr);
                        }
                        let served = axum::serve(listener, router(shared))
                            .with_graceful_shutdown(wait_for_shutdown(Arc::clone(&shutdown)))
                            .await;
                        if let Err(e) = served {
                            log::error!("Status server stopped: {}", e);
                        }
                    }
                    Some(Err(e)) => log::error!("Status listener unusable: {}", e),
                    None => {}
                }
                wait_for_shutdown(shutdown).await;
            });
        })
        .context("Failed to spawn status thread")?;

    Ok(ServiceHandle { addr, join })
}
