//! RPC method handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::context::AppContext;
use crate::core::{LiveSession, SessionRecord};

use super::protocol::{Request, Response};

const DEFAULT_PAGE: u32 = 50;

pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub rpc_bind: String,
    pub simulation: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveSessions {
    pub sessions: Vec<LiveSession>,
    pub count: usize,
}

/// Everything known about one device: its open session, if any, and its
/// recorded history, newest first.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceHistory {
    pub serial_number: String,
    pub live: Option<LiveSession>,
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Registration {
    pub serial_number: String,
    pub sessions_updated: usize,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "sessions.active" => self.sessions_active(id).await,
            "sessions.list" => self.sessions_list(id, params).await,
            "sessions.get" => self.sessions_get(id, params).await,
            "devices.list" => self.devices_list(id).await,
            "devices.sessions" => self.devices_sessions(id, params).await,
            "devices.register" => self.devices_register(id, params).await,
            _ => Response::method_not_found(id, &request.method),
        }
    }

    async fn daemon_status(&self, id: Value) -> Response {
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                active_sessions: self.ctx.live.active_count().await,
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                simulation: self.ctx.config.simulation,
            },
        )
    }

    async fn sessions_active(&self, id: Value) -> Response {
        let sessions = self.ctx.live.get_all().await;
        let count = sessions.len();
        Response::success(id, ActiveSessions { sessions, count })
    }

    /// Persisted sessions, newest first.
    async fn sessions_list(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            limit: Option<u32>,
            #[serde(default)]
            offset: Option<u32>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            match serde_json::from_value(params) {
                Ok(p) => p,
                Err(e) => return Response::invalid_params(id, e.to_string()),
            }
        };

        let limit = params.limit.unwrap_or(DEFAULT_PAGE);
        let offset = params.offset.unwrap_or(0);

        match self.ctx.store.list_sessions(limit, offset).await {
            Ok(sessions) => Response::success(id, sessions),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    async fn sessions_get(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            id: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.ctx.store.get_session(&params.id).await {
            Ok(Some(session)) => Response::success(id, session),
            Ok(None) => Response::not_found(id, format!("Session not found: {}", params.id)),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    /// Newest session of every device, with its registration flag.
    async fn devices_list(&self, id: Value) -> Response {
        match self.ctx.store.latest_per_device().await {
            Ok(sessions) => Response::success(id, sessions),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }

    async fn devices_sessions(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            serial_number: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        let sessions = match self.ctx.store.sessions_for_device(&params.serial_number).await {
            Ok(sessions) => sessions,
            Err(e) => return Response::internal_error(id, e.to_string()),
        };
        let live = self.ctx.live.get(&params.serial_number).await;

        if sessions.is_empty() && live.is_none() {
            return Response::not_found(
                id,
                format!("No sessions for device: {}", params.serial_number),
            );
        }
        Response::success(
            id,
            DeviceHistory {
                serial_number: params.serial_number,
                live,
                sessions,
            },
        )
    }

    async fn devices_register(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            serial_number: String,
        }

        let params: Params = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Response::invalid_params(id, e.to_string()),
        };

        match self.ctx.store.register(&params.serial_number).await {
            Ok(0) => Response::not_found(
                id,
                format!("No sessions for device: {}", params.serial_number),
            ),
            Ok(sessions_updated) => Response::success(
                id,
                Registration {
                    serial_number: params.serial_number,
                    sessions_updated,
                },
            ),
            Err(e) => Response::internal_error(id, e.to_string()),
        }
    }
}
