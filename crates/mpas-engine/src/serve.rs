//! RPC listener.
//!
//! One length-prefixed JSON request per connection, dispatched on the
//! blocking pool so group locks may be held across subprocess waits without
//! stalling the accept loop. Ctrl-c drains into a final snapshot save.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, warn};

use mpas_core::protocol;

use crate::server::Server;

/// Bind per the configuration and serve until ctrl-c.
pub async fn serve(server: Arc<Server>) -> Result<()> {
    let endpoint = server.config().listen_endpoint();

    match server.config().network.as_str() {
        "unix" => serve_unix(server, &endpoint).await,
        _ => serve_tcp(server, &endpoint).await,
    }
}

async fn serve_tcp(server: Arc<Server>, endpoint: &str) -> Result<()> {
    let listener = TcpListener::bind(endpoint)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {endpoint}"))?;

    info!(listen = %endpoint, "Provider server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, server).await {
                                warn!(peer = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    shutdown(&server);
    Ok(())
}

async fn serve_unix(server: Arc<Server>, endpoint: &str) -> Result<()> {
    // Remove a stale socket from a previous run.
    let _ = std::fs::remove_file(endpoint);

    if let Some(parent) = std::path::Path::new(endpoint).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
    }

    let listener = UnixListener::bind(endpoint)
        .with_context(|| format!("Failed to bind Unix socket at {endpoint}"))?;

    info!(socket = %endpoint, "Provider server listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, server).await {
                                warn!(error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    shutdown(&server);
    let _ = std::fs::remove_file(endpoint);
    Ok(())
}

fn shutdown(server: &Server) {
    info!("Shutdown signal received");
    server.save_snapshot();
    info!("Provider server stopped");
}

/// Handle a single connection: read one request, execute, send response.
async fn handle_connection<S>(stream: S, server: Arc<Server>) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let request = protocol::recv_request(&mut reader).await?;

    let response = tokio::task::spawn_blocking(move || server.dispatch(request))
        .await
        .with_context(|| "Dispatch task failed")?;

    protocol::send_response(&mut writer, &response).await?;

    Ok(())
}
