//! Local driver: runs the sandboxed command as a host process.
//!
//! There is no isolation beyond the uid/gid switch. The driver exists for
//! development, for tests, and as the process runner inside a guest
//! (`corral-init` reuses it). Mounts and network interfaces are rejected.

mod process;
mod relay;

use crate::domain::{DomainHandle, DomainId};
use crate::driver::{ConsoleStream, ConsoleTarget, Driver};
use crate::error::{HvError, Result};
use crate::spec::{DomainSpec, DEFAULT_COMMAND};
use crate::uri::ConnectUri;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::DuplexStream;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// In-memory buffer of a console duplex pipe.
const CONSOLE_BUFFER: usize = 64 * 1024;

/// A running local domain.
struct LocalDomain {
    handle: DomainHandle,
    spec: DomainSpec,
    pid: Option<u32>,
    attach_tx: mpsc::Sender<DuplexStream>,
    relay: JoinHandle<()>,
    kill: oneshot::Sender<()>,
    exit: watch::Receiver<Option<i32>>,
    reaper: JoinHandle<()>,
}

/// Driver running domains as child processes of the current process.
#[derive(Default)]
pub struct LocalDriver {
    connected: AtomicBool,
    domains: Mutex<Vec<LocalDomain>>,
}

impl LocalDriver {
    /// Create a new local driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host PID of the command of domain `id`.
    pub async fn pid(&self, id: DomainId) -> Option<u32> {
        self.domains
            .lock()
            .await
            .iter()
            .find(|d| d.handle.id() == id)
            .and_then(|d| d.pid)
    }

    /// Spawn a process for `spec` and the relay serving its consoles.
    ///
    /// Returns the child, the attachment sender and the relay, not yet running.
    fn launch(
        program: &str,
        args: &[String],
        spec: &DomainSpec,
        label: String,
    ) -> std::io::Result<(Child, mpsc::Sender<DuplexStream>, relay::Relay)> {
        let (child, io) = process::spawn(program, args, spec)?;
        let (tx, rx) = mpsc::channel(1);
        Ok((child, tx, relay::Relay { io, rx, label }))
    }

    /// Spawn an administrative shell next to a domain, attached to a new console.
    async fn open_shell(spec: &DomainSpec) -> Result<ConsoleStream> {
        let mut shell_spec = spec.clone();
        shell_spec.interactive = true;
        let label = format!("{}-shell", spec.name);

        let args = ["-i".to_string()];
        let (child, tx, relay) = Self::launch(DEFAULT_COMMAND, &args, &shell_spec, label)
            .map_err(|e| HvError::Console(format!("failed to spawn shell: {e}")))?;
        let (host_end, relay_end) = tokio::io::duplex(CONSOLE_BUFFER);
        tx.send(relay_end)
            .await
            .map_err(|_| HvError::Console("shell relay ended".into()))?;
        tokio::spawn(relay.run(Some(child)));
        Ok(ConsoleStream::from_duplex(host_end))
    }

    async fn teardown(domain: LocalDomain) -> Result<()> {
        // The reaper may already be done if the process exited on its own.
        let _ = domain.kill.send(());
        domain
            .reaper
            .await
            .map_err(|e| HvError::Destroy(format!("reaper task failed: {e}")))?;
        domain.relay.abort();
        Ok(())
    }
}

/// Wait for `child`, killing it on request, and publish its exit code.
///
/// Dropping the `kill` sender also kills the child.
async fn reap(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<i32>>,
    label: String,
) {
    let killed = tokio::select! {
        _ = child.wait() => false,
        _ = kill => true,
    };
    if killed {
        if let Err(e) = child.start_kill() {
            tracing::debug!(domain = %label, error = %e, "Process already exited");
        }
    }
    match child.wait().await {
        Ok(status) => {
            let code = process::exit_code(status);
            tracing::debug!(domain = %label, %status, exit_code = code, "Local process reaped");
            exit.send_replace(Some(code));
        }
        Err(e) => tracing::warn!(domain = %label, error = %e, "Failed to wait for local process"),
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&self, uri: &ConnectUri) -> Result<()> {
        if !uri.host().is_empty() {
            return Err(HvError::Connection(format!(
                "local driver cannot reach remote host '{}'",
                uri.host()
            )));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainHandle>> {
        Ok(self
            .domains
            .lock()
            .await
            .iter()
            .map(|d| d.handle.clone())
            .collect())
    }

    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(HvError::NotConnected);
        }
        if !spec.mounts.is_empty() {
            return Err(HvError::unsupported("local", "filesystem mounts"));
        }
        if !spec.networks.is_empty() {
            return Err(HvError::unsupported("local", "network interfaces"));
        }

        let (program, args) = spec.program();
        let handle = DomainHandle::new(DomainId::new(), spec.name.clone());
        let (child, attach_tx, relay) = Self::launch(program, args, spec, handle.to_string())
            .map_err(|e| HvError::Create(format!("failed to spawn '{program}': {e}")))?;

        tracing::debug!(
            domain_id = %handle.id(),
            pid = child.id(),
            program,
            tty = spec.tty,
            "Local process spawned"
        );

        let pid = child.id();
        let relay = tokio::spawn(relay.run(None));
        let (kill, kill_rx) = oneshot::channel();
        let (exit_tx, exit) = watch::channel(None);
        let reaper = tokio::spawn(reap(child, kill_rx, exit_tx, handle.to_string()));
        self.domains.lock().await.push(LocalDomain {
            handle: handle.clone(),
            spec: spec.clone(),
            pid,
            attach_tx,
            relay,
            kill,
            exit,
            reaper,
        });
        Ok(handle)
    }

    async fn destroy_domain(&self, id: DomainId) -> Result<()> {
        let domain = {
            let mut domains = self.domains.lock().await;
            let pos = domains
                .iter()
                .position(|d| d.handle.id() == id)
                .ok_or(HvError::DomainNotFound(id))?;
            domains.remove(pos)
        };
        Self::teardown(domain).await
    }

    async fn open_console(&self, id: DomainId, target: ConsoleTarget) -> Result<ConsoleStream> {
        let (attach_tx, spec) = {
            let domains = self.domains.lock().await;
            let domain = domains
                .iter()
                .find(|d| d.handle.id() == id)
                .ok_or(HvError::DomainNotFound(id))?;
            (domain.attach_tx.clone(), domain.spec.clone())
        };

        match target {
            ConsoleTarget::Primary => {
                let (host_end, relay_end) = tokio::io::duplex(CONSOLE_BUFFER);
                attach_tx
                    .send(relay_end)
                    .await
                    .map_err(|_| HvError::Console("domain process has exited".into()))?;
                Ok(ConsoleStream::from_duplex(host_end))
            }
            ConsoleTarget::Shell => Self::open_shell(&spec).await,
        }
    }

    async fn wait_exit(&self, id: DomainId) -> Result<Option<i32>> {
        let mut exit = {
            let domains = self.domains.lock().await;
            domains
                .iter()
                .find(|d| d.handle.id() == id)
                .map(|d| d.exit.clone())
                .ok_or(HvError::DomainNotFound(id))?
        };
        // An error means the reaper gave up without a status.
        Ok(exit.wait_for(Option::is_some).await.ok().and_then(|code| *code))
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let domains: Vec<_> = self.domains.lock().await.drain(..).collect();
        for domain in domains {
            let id = domain.handle.id();
            if let Err(e) = Self::teardown(domain).await {
                tracing::warn!(domain_id = %id, error = %e, "Failed to tear down local domain");
            }
        }
    }
}
