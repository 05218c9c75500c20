//! RPC server for client communication.
//!
//! JSON-RPC 2.0 over TCP for querying open and past sessions and registering
//! devices.
//!
//! - `protocol`: JSON-RPC 2.0 request/response types
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: method dispatcher and handlers
//! - `client`: client used by the CLI subcommands

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::{ActiveSessions, DaemonStatus, DeviceHistory, MethodHandler, Registration};
pub use protocol::{Request, Response, RpcError};

/// RPC server exposing the session store and the live view to clients.
pub struct RpcServer {
    transport: Transport,
    shutdown_tx: broadcast::Sender<()>,
}

impl RpcServer {
    /// Bind the listener. Port 0 picks a free port; see [`RpcServer::local_addr`].
    pub async fn bind(ctx: AppContext, bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let transport = Transport::bind(bind_addr, MethodHandler::new(ctx)).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            transport,
            shutdown_tx,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Serve until [`RpcServer::shutdown`] is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.transport.listen(shutdown_rx).await
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
