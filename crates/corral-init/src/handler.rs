//! Request handler for corral-init.
//!
//! Routes JSON-RPC requests from the host driver. The sandboxed command runs
//! through a local hypervisor connection inside the guest.

use crate::setup;
use corral_hv::proto::{
    error_codes, methods, AttachParams, Request, Response, StartParams, StartResult, WaitResult,
};
use corral_hv::{ConsoleStream, DomainHandle, HypervisorConnection, LocalDriver};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// What the connection does after a request.
pub enum Outcome {
    /// Send the response and keep reading requests.
    Reply(Response),
    /// Send the response, then bridge the connection to the console.
    Attach(Response, ConsoleStream),
    /// Send the response, then shut the guest down.
    Shutdown(Response),
}

/// Guest-side state shared by all host connections.
pub struct Agent {
    local: Arc<LocalDriver>,
    conn: HypervisorConnection,
    domain: Mutex<Option<DomainHandle>>,
}

impl Agent {
    /// Open the local connection the command runs on.
    pub async fn new() -> corral_hv::Result<Self> {
        let local = Arc::new(LocalDriver::new());
        let conn = HypervisorConnection::with_driver("local:///", local.clone());
        conn.open().await?;
        Ok(Self {
            local,
            conn,
            domain: Mutex::new(None),
        })
    }

    /// Handle a JSON-RPC request.
    ///
    /// Supported methods:
    /// - `ping` - Health check, returns `{pong: true}`.
    /// - `start` - Prepare the guest and launch the command, once.
    /// - `attach` - Turn the connection into a console stream.
    /// - `wait` - Block until the command exits, returns its exit code.
    /// - `shutdown` - Stop the command and power off.
    pub async fn handle(&self, req: Request) -> Outcome {
        debug!(method = %req.method, id = req.id, "handling request");
        trace!(params = ?req.params, "request params");

        match req.method.as_str() {
            methods::PING => Outcome::Reply(Response::success(req.id, json!({"pong": true}))),
            methods::START => Outcome::Reply(self.handle_start(req.id, req.params).await),
            methods::ATTACH => self.handle_attach(req.id, req.params).await,
            methods::WAIT => Outcome::Reply(self.handle_wait(req.id).await),
            methods::SHUTDOWN => Outcome::Shutdown(self.handle_shutdown(req.id).await),
            _ => {
                warn!(method = %req.method, "unknown method");
                Outcome::Reply(Response::error(
                    req.id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not found: {}", req.method),
                ))
            }
        }
    }

    /// Handle the `start` method.
    async fn handle_start(&self, id: u64, params: Value) -> Response {
        let params = match serde_json::from_value::<StartParams>(params) {
            Ok(p) => p,
            Err(e) => return invalid_params(id, "start", e),
        };

        let mut domain = self.domain.lock().await;
        if domain.is_some() {
            return Response::error(id, error_codes::ALREADY_STARTED, "command already started");
        }

        let spec = params.spec;
        if let Err(e) = setup::prepare(&spec).await {
            warn!(id = id, error = %e, "guest setup failed");
            return Response::error(
                id,
                error_codes::INTERNAL_ERROR,
                format!("guest setup failed: {e:#}"),
            );
        }

        match self.conn.create_domain(&setup::local_spec(&spec)).await {
            Ok(handle) => {
                let pid = self.local.pid(handle.id()).await;
                info!(name = %spec.name, program = spec.program().0, pid, "command started");
                *domain = Some(handle);
                to_response(id, &StartResult { pid })
            }
            Err(e) => {
                warn!(id = id, error = %e, "command failed to start");
                Response::error(id, error_codes::INTERNAL_ERROR, e.to_string())
            }
        }
    }

    /// Handle the `attach` method.
    async fn handle_attach(&self, id: u64, params: Value) -> Outcome {
        let params = match serde_json::from_value::<AttachParams>(params) {
            Ok(p) => p,
            Err(e) => return Outcome::Reply(invalid_params(id, "attach", e)),
        };

        let Some(domain) = self.domain.lock().await.clone() else {
            return Outcome::Reply(Response::error(
                id,
                error_codes::NOT_STARTED,
                "command not started",
            ));
        };

        match self.conn.open_console(&domain, params.target).await {
            Ok(console) => {
                debug!(id = id, console = %params.target, "console attached");
                Outcome::Attach(Response::success(id, json!({"attached": true})), console)
            }
            Err(e) => {
                warn!(id = id, error = %e, "console attach failed");
                Outcome::Reply(Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()))
            }
        }
    }

    /// Handle the `wait` method.
    async fn handle_wait(&self, id: u64) -> Response {
        let Some(domain) = self.domain.lock().await.clone() else {
            return Response::error(id, error_codes::NOT_STARTED, "command not started");
        };
        match self.conn.wait_exit(&domain).await {
            Ok(exit_code) => to_response(id, &WaitResult { exit_code }),
            Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
        }
    }

    /// Handle the `shutdown` method.
    async fn handle_shutdown(&self, id: u64) -> Response {
        if let Some(domain) = self.domain.lock().await.take() {
            if let Err(e) = self.conn.destroy_domain(&domain).await {
                warn!(error = %e, "failed to stop command");
            }
        }
        self.conn.close().await;
        info!("shutdown requested");
        Response::success(id, json!({}))
    }
}

fn to_response<T: serde::Serialize>(id: u64, result: &T) -> Response {
    match serde_json::to_value(result) {
        Ok(v) => Response::success(id, v),
        Err(e) => Response::error(id, error_codes::INTERNAL_ERROR, e.to_string()),
    }
}

fn invalid_params(id: u64, method: &str, e: serde_json::Error) -> Response {
    warn!(id = id, error = %e, "invalid {method} params");
    Response::error(
        id,
        error_codes::INVALID_PARAMS,
        format!("invalid params: {e}"),
    )
}
