//! Vsock listener and per-connection request loop.

use crate::handler::{Agent, Outcome};
use corral_hv::proto::{error_codes, Request, Response};
use corral_hv::ConsoleStream;
use std::io;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;
use tokio_vsock::VsockListener;
use tracing::{debug, error, warn};

/// Accept host connections until one of them requests shutdown.
pub async fn serve(listener: VsockListener, agent: Arc<Agent>) -> io::Result<()> {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(cid = addr.cid(), port = addr.port(), "accepted new connection");
                    let agent = Arc::clone(&agent);
                    let shutdown = shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, agent, shutdown).await {
                            warn!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "failed to accept connection"),
            },
            _ = shutdown_rx.recv() => {
                debug!("leaving accept loop");
                return Ok(());
            }
        }
    }
}

/// Handle a single host connection.
///
/// Reads newline-delimited JSON-RPC requests and writes responses. After a
/// successful `attach` the rest of the connection is console bytes.
pub async fn handle_connection<S>(
    stream: S,
    agent: Arc<Agent>,
    shutdown: mpsc::Sender<()>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            debug!("client disconnected");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<Request>(trimmed) {
            Ok(req) => agent.handle(req).await,
            Err(e) => {
                warn!(error = %e, "failed to parse request");
                Outcome::Reply(Response::error(
                    0,
                    error_codes::PARSE_ERROR,
                    format!("parse error: {e}"),
                ))
            }
        };

        match outcome {
            Outcome::Reply(response) => send(&mut writer, &response).await?,
            Outcome::Attach(response, console) => {
                send(&mut writer, &response).await?;
                bridge(reader, writer, console).await;
                return Ok(());
            }
            Outcome::Shutdown(response) => {
                send(&mut writer, &response).await?;
                let _ = shutdown.send(()).await;
                return Ok(());
            }
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> io::Result<()> {
    let json = serde_json::to_string(response)?;
    debug!(response = %json, "sending response");
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Copy console bytes both ways until either side closes.
///
/// The host closing its end detaches from the console; the command keeps
/// running. The console closing (command exit) closes the host connection.
async fn bridge<S>(
    mut host_rd: BufReader<ReadHalf<S>>,
    mut host_wr: WriteHalf<S>,
    console: ConsoleStream,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let ConsoleStream {
        reader: mut console_rd,
        writer: mut console_wr,
    } = console;

    tokio::select! {
        result = tokio::io::copy(&mut console_rd, &mut host_wr) => {
            debug!(bytes = ?result.ok(), "console output ended");
            let _ = host_wr.shutdown().await;
        }
        result = tokio::io::copy(&mut host_rd, &mut console_wr) => {
            debug!(bytes = ?result.ok(), "host detached");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_hv::proto::{methods, StartParams, StartResult, WaitResult};
    use corral_hv::DomainSpec;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(10);

    struct Host {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        next_id: u64,
    }

    impl Host {
        async fn call(&mut self, method: &str, params: serde_json::Value) -> Response {
            self.next_id += 1;
            let req = Request::new(self.next_id, method, params);
            self.send_raw(&serde_json::to_string(&req).unwrap()).await;
            self.recv().await
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            let mut line = String::new();
            timeout(WAIT, self.reader.read_line(&mut line))
                .await
                .expect("no response")
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn connect(agent: &Arc<Agent>, shutdown: &mpsc::Sender<()>) -> Host {
        let (host, guest) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(guest, Arc::clone(agent), shutdown.clone()));
        let (reader, writer) = tokio::io::split(host);
        Host {
            reader: BufReader::new(reader),
            writer,
            next_id: 0,
        }
    }

    async fn agent() -> (Arc<Agent>, mpsc::Sender<()>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Arc::new(Agent::new().await.unwrap()), tx, rx)
    }

    fn cat_spec() -> serde_json::Value {
        let mut spec = DomainSpec::new("guest");
        spec.command = vec!["/bin/cat".into()];
        spec.interactive = true;
        serde_json::to_value(StartParams { spec }).unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let (agent, tx, _rx) = agent().await;
        let mut host = connect(&agent, &tx);
        let resp = host.call(methods::PING, json!({})).await;
        assert_eq!(resp.result, Some(json!({"pong": true})));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_parse_error_keeps_connection() {
        let (agent, tx, _rx) = agent().await;
        let mut host = connect(&agent, &tx);

        host.send_raw("{not json").await;
        let resp = host.recv().await;
        assert_eq!(resp.error.unwrap().code, error_codes::PARSE_ERROR);

        let resp = host.call(methods::PING, json!({})).await;
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (agent, tx, _rx) = agent().await;
        let mut host = connect(&agent, &tx);
        let resp = host.call("exec", json!({})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_attach_before_start() {
        let (agent, tx, _rx) = agent().await;
        let mut host = connect(&agent, &tx);
        let resp = host.call(methods::ATTACH, json!({"target": "primary"})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_STARTED);
    }

    #[tokio::test]
    async fn test_invalid_start_params() {
        let (agent, tx, _rx) = agent().await;
        let mut host = connect(&agent, &tx);
        let resp = host.call(methods::START, json!({"spec": 5})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_wait_before_start() {
        let (agent, tx, _rx) = agent().await;
        let mut host = connect(&agent, &tx);
        let resp = host.call(methods::WAIT, json!({})).await;
        assert_eq!(resp.error.unwrap().code, error_codes::NOT_STARTED);
    }

    #[tokio::test]
    async fn test_start_reports_pid_and_wait_reports_exit_code() {
        let (agent, tx, _rx) = agent().await;
        let mut control = connect(&agent, &tx);

        let mut spec = DomainSpec::new("guest");
        spec.command = vec!["/bin/sh".into(), "-c".into(), "exit 7".into()];
        let params = serde_json::to_value(StartParams { spec }).unwrap();
        let resp = control.call(methods::START, params).await;
        let started: StartResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(started.pid.is_some());

        let mut waiter = connect(&agent, &tx);
        let resp = waiter.call(methods::WAIT, json!({})).await;
        let waited: WaitResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(waited.exit_code, Some(7));

        let resp = control.call(methods::SHUTDOWN, json!({})).await;
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_start_attach_and_shutdown() {
        let (agent, tx, mut rx) = agent().await;
        let mut control = connect(&agent, &tx);

        let resp = control.call(methods::START, cat_spec()).await;
        assert!(resp.error.is_none(), "start failed: {:?}", resp.error);
        let resp = control.call(methods::START, cat_spec()).await;
        assert_eq!(resp.error.unwrap().code, error_codes::ALREADY_STARTED);

        let mut console = connect(&agent, &tx);
        let resp = console.call(methods::ATTACH, json!({})).await;
        assert!(resp.error.is_none(), "attach failed: {:?}", resp.error);

        console.writer.write_all(b"echo me\n").await.unwrap();
        console.writer.flush().await.unwrap();
        let mut buf = [0u8; 8];
        timeout(WAIT, console.reader.read_exact(&mut buf))
            .await
            .expect("no console output")
            .unwrap();
        assert_eq!(&buf, b"echo me\n");

        let resp = control.call(methods::SHUTDOWN, json!({})).await;
        assert!(resp.error.is_none());
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();

        // The command is gone, so the console connection closes.
        let mut rest = Vec::new();
        timeout(WAIT, console.reader.read_to_end(&mut rest))
            .await
            .expect("console did not close")
            .unwrap();
    }
}
