//! SandboxContext - the lifecycle state machine of one sandbox.

use crate::cleaner::{Cleaner, CleanupStage};
use crate::config::SandboxConfig;
use crate::console::ConsoleChannel;
use crate::error::{Result, SandboxError};
use corral_hv::{ConsoleTarget, DomainHandle, HypervisorConnection};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Lifecycle state of a sandbox.
///
/// `Created -> Running -> Stopped`, or `Created -> Failed` when start fails.
/// `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Constructed, not started.
    Created,
    /// Domain exists and is bound to the context.
    Running,
    /// Stopped after running.
    Stopped,
    /// Start failed.
    Failed,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State guarded by the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    domain: Option<DomainHandle>,
    cleaner: Cleaner,
    primary: Option<ConsoleChannel>,
    shell: Option<ConsoleChannel>,
}

struct ContextInner {
    config: Arc<SandboxConfig>,
    connection: Arc<HypervisorConnection>,
    state: watch::Sender<SandboxState>,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if *self.state.borrow() == SandboxState::Running {
            tracing::warn!(
                sandbox = %self.config.name(),
                "Sandbox context dropped while running; the connection keeps the domain"
            );
        }
    }
}

/// One sandbox: a configuration bound to a hypervisor connection.
///
/// Lifecycle operations are serialized; the state is readable at any time
/// without waiting for them. Cloning gives another handle to the same
/// sandbox. The connection is shared and never closed by the context.
#[derive(Clone)]
pub struct SandboxContext {
    inner: Arc<ContextInner>,
}

impl SandboxContext {
    /// Create a context in the `Created` state. Nothing touches the backend yet.
    pub fn new(config: impl Into<Arc<SandboxConfig>>, connection: Arc<HypervisorConnection>) -> Self {
        let (state, _) = watch::channel(SandboxState::Created);
        Self {
            inner: Arc::new(ContextInner {
                config: config.into(),
                connection,
                state,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// The sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// The hypervisor connection.
    pub fn connection(&self) -> &Arc<HypervisorConnection> {
        &self.inner.connection
    }

    /// Current state.
    pub fn state(&self) -> SandboxState {
        *self.inner.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SandboxState> {
        self.inner.state.subscribe()
    }

    /// Handle of the running domain; `Some` exactly while `Running`.
    pub async fn domain(&self) -> Option<DomainHandle> {
        self.inner.lifecycle.lock().await.domain.clone()
    }

    /// Create the domain and move to `Running`.
    ///
    /// Only valid from `Created`. Writes `sandbox.cfg` into the state
    /// directory first. Any failure moves the context to `Failed` and is
    /// reported as [`SandboxError::Start`].
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != SandboxState::Created {
            return Err(SandboxError::invalid_state("created", state));
        }

        let name = self.config().name();
        let start = std::time::Instant::now();
        tracing::info!(sandbox = %name, uri = %self.inner.connection.uri(), "Starting sandbox");

        match self.launch(&mut lifecycle).await {
            Ok(domain) => {
                lifecycle.domain = Some(domain.clone());
                lifecycle.cleaner.run(CleanupStage::PostStart);
                self.set_state(SandboxState::Running);
                tracing::info!(
                    sandbox = %name,
                    domain_id = %domain.id(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Sandbox running"
                );
                Ok(())
            }
            Err(e) => {
                lifecycle.cleaner.run(CleanupStage::PostStart);
                lifecycle.cleaner.run(CleanupStage::PostStop);
                self.set_state(SandboxState::Failed);
                tracing::warn!(sandbox = %name, error = %e, "Sandbox failed to start");
                Err(match e {
                    SandboxError::Start(_) => e,
                    other => SandboxError::Start(other.to_string()),
                })
            }
        }
    }

    /// Prepare the state directory and ask the backend for the domain.
    async fn launch(&self, lifecycle: &mut Lifecycle) -> Result<DomainHandle> {
        let config = self.config();
        let state_dir = config.state_dir();
        let config_dir = config.config_dir();
        let config_path = config.config_path();

        // Only remove directories this start created.
        let cleaner = &mut lifecycle.cleaner;
        cleaner.add_rmfile(CleanupStage::PostStop, &config_path);
        if !config_dir.exists() {
            cleaner.add_rmdir(CleanupStage::PostStop, &config_dir);
        }
        if !state_dir.exists() {
            cleaner.add_rmdir(CleanupStage::PostStop, &state_dir);
        }

        tokio::fs::create_dir_all(&config_dir).await?;
        config.save_to_path(&config_path).await?;

        let spec = config.to_domain_spec();
        self.inner
            .connection
            .create_domain(&spec)
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))
    }

    /// Bind to an existing domain named after the sandbox and move to `Running`.
    ///
    /// Only valid from `Created`. A missing domain or an unusable connection
    /// moves the context to `Failed`.
    pub async fn attach(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != SandboxState::Created {
            return Err(SandboxError::invalid_state("created", state));
        }

        let name = self.config().name();
        let found = self
            .inner
            .connection
            .find_domain(name)
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))
            .and_then(|d| {
                d.ok_or_else(|| SandboxError::Start(format!("no domain named '{name}'")))
            });

        match found {
            Ok(domain) => {
                tracing::info!(sandbox = %name, domain_id = %domain.id(), "Attached to existing domain");
                lifecycle.domain = Some(domain);
                self.set_state(SandboxState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(SandboxState::Failed);
                tracing::warn!(sandbox = %name, error = %e, "Attach to existing domain failed");
                Err(e)
            }
        }
    }

    /// Stop the sandbox.
    ///
    /// A no-op success unless `Running`. Otherwise open consoles are detached
    /// (failures are logged, not returned), the domain is destroyed and the
    /// post-stop cleanup runs. The context ends up `Stopped` even if the
    /// backend fails to destroy the domain; that error is then returned.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != SandboxState::Running {
            tracing::trace!(sandbox = %self.config().name(), %state, "Stop is a no-op");
            return Ok(());
        }

        let name = self.config().name();
        tracing::info!(sandbox = %name, "Stopping sandbox");

        for console in [lifecycle.primary.take(), lifecycle.shell.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = console.detach().await {
                tracing::warn!(
                    sandbox = %name,
                    console = %console.target(),
                    error = %e,
                    "Console detach failed"
                );
            }
        }

        let result = match lifecycle.domain.take() {
            Some(domain) => self
                .inner
                .connection
                .destroy_domain(&domain)
                .await
                .map_err(SandboxError::from),
            None => Ok(()),
        };

        if !lifecycle.cleaner.run(CleanupStage::PostStop) {
            tracing::warn!(sandbox = %name, "Some post-stop cleanup actions failed");
        }
        self.set_state(SandboxState::Stopped);

        match &result {
            Ok(()) => tracing::info!(sandbox = %name, "Sandbox stopped"),
            Err(e) => tracing::warn!(sandbox = %name, error = %e, "Sandbox stopped with errors"),
        }
        result
    }

    /// The console of the sandboxed command.
    ///
    /// Only valid while `Running`. Returns the context's channel, creating
    /// it on first use; fails with [`SandboxError::AlreadyAttached`] while
    /// that channel is attached.
    pub async fn console(&self) -> Result<ConsoleChannel> {
        self.channel(ConsoleTarget::Primary).await
    }

    /// An administrative shell console next to the sandboxed command.
    ///
    /// Requires the configuration's `shell` flag; otherwise as [`console`](Self::console).
    pub async fn shell_console(&self) -> Result<ConsoleChannel> {
        if !self.config().shell() {
            return Err(SandboxError::InvalidConfig(
                "shell console is not enabled for this sandbox".into(),
            ));
        }
        self.channel(ConsoleTarget::Shell).await
    }

    async fn channel(&self, target: ConsoleTarget) -> Result<ConsoleChannel> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != SandboxState::Running {
            return Err(SandboxError::invalid_state("running", state));
        }
        let domain = lifecycle
            .domain
            .clone()
            .ok_or_else(|| SandboxError::invalid_state("running", "running without domain"))?;

        let slot = match target {
            ConsoleTarget::Primary => &mut lifecycle.primary,
            ConsoleTarget::Shell => &mut lifecycle.shell,
        };
        if let Some(existing) = slot {
            if existing.is_attached() {
                return Err(SandboxError::AlreadyAttached);
            }
            return Ok(existing.clone());
        }

        let channel = ConsoleChannel::new(
            self.inner.connection.clone(),
            domain,
            target,
            self.config().tty(),
            self.subscribe(),
        );
        *slot = Some(channel.clone());
        Ok(channel)
    }

    fn set_state(&self, state: SandboxState) {
        let previous = self.inner.state.send_replace(state);
        tracing::debug!(sandbox = %self.config().name(), from = %previous, to = %state, "State change");
    }
}

impl fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxContext")
            .field("name", &self.config().name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SandboxState::Created.to_string(), "created");
        assert_eq!(SandboxState::Running.to_string(), "running");
        assert_eq!(SandboxState::Stopped.to_string(), "stopped");
        assert_eq!(SandboxState::Failed.to_string(), "failed");
    }

    #[tokio::test]
    async fn test_new_context_is_created() {
        let config = SandboxConfig::new("fresh").unwrap();
        let conn = Arc::new(HypervisorConnection::new("local:///"));
        let ctx = SandboxContext::new(config, conn);
        assert_eq!(ctx.state(), SandboxState::Created);
        assert!(ctx.domain().await.is_none());
    }
}
