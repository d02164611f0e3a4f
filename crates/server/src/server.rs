//! TCP listener and connection loop.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use certgate_config::Config;

use crate::http::{self, AppState};
use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections. Requests already being served, and any
    /// issuance they started, run to completion on their own tasks.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.join.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        info!(addr = %self.local_addr, "Server stopped");
    }
}

/// Bind the configured address and start serving.
pub async fn serve(config: &Config) -> Result<ServerHandle, ServerError> {
    let state = Arc::new(AppState::new(config)?);

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.server.listen.clone(),
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
        addr: config.server.listen.clone(),
        source,
    })?;

    info!(
        addr = %local_addr,
        base_dir = %config.certificates.base_dir.display(),
        "Listening for certificate requests"
    );

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(conn) => conn,
                        Err(e) => {
                            debug!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| http::handle(req, peer, Arc::clone(&state)));
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                    });
                }
            }
        }
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        join,
    })
}
