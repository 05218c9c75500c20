//! TCP transport for the RPC server.
//!
//! Newline-delimited JSON framing; each connection is handled in its own task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

/// Bound TCP listener plus the handler every connection dispatches to.
pub struct Transport {
    listener: TcpListener,
    handler: Arc<MethodHandler>,
}

impl Transport {
    /// Bind the listener immediately; [`Transport::listen`] only accepts.
    pub async fn bind(bind_addr: SocketAddr, handler: MethodHandler) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", bind_addr))?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn listen(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        if let Ok(addr) = self.local_addr() {
            info!(addr = %addr, "RPC server listening");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "Client connected");
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                                debug!(peer = %peer_addr, error = %e, "Connection error");
                            }
                            debug!(peer = %peer_addr, "Client disconnected");
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.recv() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            // EOF - client disconnected
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => {
                if let Err(msg) = request.validate() {
                    warn!(peer = %peer_addr, error = msg, "Invalid request");
                    let id = request.id.clone().unwrap_or(serde_json::Value::Null);
                    Response::invalid_request(id)
                } else if request.is_notification() {
                    // Notifications don't get responses
                    debug!(peer = %peer_addr, method = %request.method, "Notification received");
                    handler.handle(request).await;
                    continue;
                } else {
                    debug!(peer = %peer_addr, method = %request.method, "Request");
                    handler.handle(request).await
                }
            }
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Parse error");
                Response::parse_error()
            }
        };

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
    }

    Ok(())
}
