//! Host side of the `corral-init` protocol.

use crate::driver::{ConsoleStream, ConsoleTarget};
use crate::error::{HvError, Result};
use crate::proto::{
    methods, AttachParams, Request, Response, StartParams, StartResult, WaitResult, AGENT_PORT,
};
use crate::spec::DomainSpec;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;

/// Total time allowed for the guest to boot and `corral-init` to listen.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Timeout for a single RPC.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// A JSON-RPC connection to `corral-init` through Firecracker's vsock socket.
pub struct AgentClient {
    reader: BufReader<ReadHalf<UnixStream>>,
    writer: BufWriter<WriteHalf<UnixStream>>,
    next_id: u64,
}

impl AgentClient {
    /// Connect to the agent, retrying until it answers or the timeout elapses.
    pub async fn connect(vsock_path: &Path) -> Result<Self> {
        let start = std::time::Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match Self::try_connect(vsock_path).await {
                Ok(client) => {
                    tracing::debug!(
                        path = %vsock_path.display(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        "Connected to guest agent"
                    );
                    return Ok(client);
                }
                Err(e) if start.elapsed() >= CONNECT_TIMEOUT => {
                    tracing::warn!(
                        path = %vsock_path.display(),
                        attempts,
                        error = %e,
                        "Guest agent connection timeout"
                    );
                    return Err(HvError::Timeout(CONNECT_TIMEOUT));
                }
                Err(e) => {
                    tracing::trace!(error = %e, attempt = attempts, "Agent not ready, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// One connection attempt: socket connect plus the `CONNECT <port>` handshake.
    async fn try_connect(vsock_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(vsock_path)
            .await
            .map_err(|e| HvError::Connection(format!("socket connect failed: {e}")))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer = BufWriter::new(write_half);

        writer
            .write_all(format!("CONNECT {AGENT_PORT}\n").as_bytes())
            .await?;
        writer.flush().await?;

        let mut response = String::new();
        reader.read_line(&mut response).await?;
        if !response.starts_with("OK ") {
            return Err(HvError::Connection(format!(
                "handshake failed: {}",
                response.trim()
            )));
        }

        Ok(Self {
            reader,
            writer,
            next_id: 1,
        })
    }

    /// Send a request and wait for its response.
    pub async fn call<P: Serialize, R: DeserializeOwned>(&mut self, method: &str, params: P) -> Result<R> {
        self.request(method, params, Some(RPC_TIMEOUT)).await
    }

    async fn request<P: Serialize, R: DeserializeOwned>(
        &mut self,
        method: &str,
        params: P,
        limit: Option<Duration>,
    ) -> Result<R> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, method, serde_json::to_value(params)?);
        let line = serde_json::to_string(&request)?;
        tracing::debug!(method, id, "Sending agent request");

        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut reply = String::new();
        let read = self.reader.read_line(&mut reply);
        let n = match limit {
            Some(limit) => timeout(limit, read)
                .await
                .map_err(|_| HvError::Timeout(limit))??,
            None => read.await?,
        };
        if n == 0 {
            return Err(HvError::Connection("agent closed the connection".into()));
        }

        let response: Response = serde_json::from_str(reply.trim())?;
        if let Some(error) = response.error {
            tracing::debug!(method, id, code = error.code, message = %error.message, "Agent error");
            return Err(HvError::Agent {
                code: error.code,
                message: error.message,
            });
        }
        let result = response.result.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(result)?)
    }

    /// Check the agent is responsive.
    pub async fn ping(&mut self) -> Result<()> {
        let _: serde_json::Value = self.call(methods::PING, serde_json::json!({})).await?;
        Ok(())
    }

    /// Prepare the guest and launch the domain's command.
    pub async fn start(&mut self, spec: &DomainSpec) -> Result<StartResult> {
        self.call(methods::START, StartParams { spec: spec.clone() })
            .await
    }

    /// Wait, without a timeout, until the command exits and return its exit code.
    ///
    /// Blocks this connection; use a dedicated one.
    pub async fn wait_exit(&mut self) -> Result<Option<i32>> {
        let result: WaitResult = self
            .request(methods::WAIT, serde_json::json!({}), None)
            .await?;
        Ok(result.exit_code)
    }

    /// Ask the agent to kill the command and power off.
    pub async fn shutdown(&mut self) -> Result<()> {
        let _: serde_json::Value = self.call(methods::SHUTDOWN, serde_json::json!({})).await?;
        Ok(())
    }

    /// Switch this connection to a console stream for `target`.
    ///
    /// Bytes the agent sent right after the response stay in the read
    /// buffer and are delivered first.
    pub async fn into_console(mut self, target: ConsoleTarget) -> Result<ConsoleStream> {
        let _: serde_json::Value = self.call(methods::ATTACH, AttachParams { target }).await?;
        Ok(ConsoleStream::new(self.reader, self.writer.into_inner()))
    }
}
