//! Firecracker driver: one microVM per domain, `corral-init` inside.
//!
//! The driver boots the VM, connects to the guest agent over the vsock
//! socket and hands it the [`DomainSpec`]. Each console is a fresh vsock
//! connection that the agent bridges to the command.

mod agent;
mod api;
mod config;
mod machine;

pub use agent::AgentClient;
pub use config::{DriveConfig, FirecrackerConfig, MachineConfig, NetworkConfig, VsockConfig};
pub use machine::VirtualMachine;

use crate::domain::{DomainHandle, DomainId};
use crate::driver::{ConsoleStream, ConsoleTarget, Driver};
use crate::error::{HvError, Result};
use crate::spec::DomainSpec;
use crate::uri::ConnectUri;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

/// First guest CID handed out; 0-2 are reserved.
const FIRST_CID: u32 = 3;

struct FirecrackerDomain {
    handle: DomainHandle,
    vm: VirtualMachine,
    control: AgentClient,
}

/// Driver booting Firecracker microVMs.
pub struct FirecrackerDriver {
    config: FirecrackerConfig,
    next_cid: AtomicU32,
    domains: Mutex<Vec<FirecrackerDomain>>,
}

impl FirecrackerDriver {
    /// Create a driver with the given settings.
    pub fn new(config: FirecrackerConfig) -> Self {
        Self {
            config,
            next_cid: AtomicU32::new(FIRST_CID),
            domains: Mutex::new(Vec::new()),
        }
    }

    /// Driver settings.
    pub fn config(&self) -> &FirecrackerConfig {
        &self.config
    }

    async fn teardown(mut domain: FirecrackerDomain) -> Result<()> {
        if let Err(e) = domain.control.shutdown().await {
            tracing::debug!(domain_id = %domain.handle.id(), error = %e, "Guest shutdown request failed");
        }
        domain.vm.destroy().await
    }
}

#[async_trait]
impl Driver for FirecrackerDriver {
    fn name(&self) -> &'static str {
        "firecracker"
    }

    async fn connect(&self, uri: &ConnectUri) -> Result<()> {
        if !uri.host().is_empty() {
            return Err(HvError::Connection(format!(
                "firecracker driver cannot reach remote host '{}'",
                uri.host()
            )));
        }
        self.config
            .check_paths()
            .map_err(|e| HvError::Connection(e.to_string()))?;
        tokio::fs::create_dir_all(&self.config.chroot_path)
            .await
            .map_err(|e| {
                HvError::Connection(format!(
                    "cannot create {}: {e}",
                    self.config.chroot_path.display()
                ))
            })?;
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
        let start = std::time::Instant::now();
        let id = DomainId::new();
        let vm_id = id.to_string();
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);

        let machine = self.config.machine_for(spec, &vm_id, cid)?;
        let vm = VirtualMachine::boot(vm_id, machine).await?;

        let started = async {
            let mut control = AgentClient::connect(vm.vsock_uds_path()).await?;
            control.ping().await?;
            let result = control.start(spec).await?;
            Ok::<_, HvError>((control, result))
        }
        .await;

        let (control, result) = match started {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(domain_id = %id, error = %e, "Guest agent failed to start domain");
                if let Err(destroy_err) = vm.destroy().await {
                    tracing::warn!(domain_id = %id, error = %destroy_err, "Failed to destroy VM");
                }
                return Err(HvError::Create(e.to_string()));
            }
        };

        tracing::debug!(
            domain_id = %id,
            cid,
            guest_pid = result.pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Guest command started"
        );

        let handle = DomainHandle::new(id, spec.name.clone());
        self.domains.lock().await.push(FirecrackerDomain {
            handle: handle.clone(),
            vm,
            control,
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
        let vsock_path = {
            let domains = self.domains.lock().await;
            domains
                .iter()
                .find(|d| d.handle.id() == id)
                .map(|d| d.vm.vsock_uds_path().to_path_buf())
                .ok_or(HvError::DomainNotFound(id))?
        };
        let client = AgentClient::connect(&vsock_path)
            .await
            .map_err(|e| HvError::Console(e.to_string()))?;
        client.into_console(target).await.map_err(|e| match e {
            HvError::Agent { message, .. } => HvError::Console(message),
            other => other,
        })
    }

    async fn wait_exit(&self, id: DomainId) -> Result<Option<i32>> {
        let vsock_path = {
            let domains = self.domains.lock().await;
            domains
                .iter()
                .find(|d| d.handle.id() == id)
                .map(|d| d.vm.vsock_uds_path().to_path_buf())
                .ok_or(HvError::DomainNotFound(id))?
        };
        // The control connection stays free for shutdown.
        let mut client = AgentClient::connect(&vsock_path).await?;
        client.wait_exit().await
    }

    async fn disconnect(&self) {
        let domains: Vec<_> = self.domains.lock().await.drain(..).collect();
        for domain in domains {
            let id = domain.handle.id();
            if let Err(e) = Self::teardown(domain).await {
                tracing::warn!(domain_id = %id, error = %e, "Failed to tear down microVM");
            }
        }
    }
}
