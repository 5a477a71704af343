//! HypervisorConnection - the shared handle to a virtualization backend.

use crate::domain::DomainHandle;
use crate::driver::{ConsoleStream, ConsoleTarget, Driver};
use crate::error::{HvError, Result};
use crate::local::LocalDriver;
use crate::spec::DomainSpec;
use crate::uri::ConnectUri;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Connection to a hypervisor backend identified by a URI.
///
/// A connection is created unopened. Every operation except [`open`](Self::open)
/// and [`close`](Self::close) fails with [`HvError::NotConnected`] until `open`
/// succeeds. Once open it is meant to be shared (`Arc<HypervisorConnection>`)
/// by any number of sandbox contexts; it stays the sole owner of the domains
/// created through it and hands out [`DomainHandle`]s only.
pub struct HypervisorConnection {
    uri: String,
    /// Driver injected by the caller; resolved from the scheme otherwise.
    preset: Option<Arc<dyn Driver>>,
    /// Connected driver, `Some` while open.
    session: Mutex<Option<Arc<dyn Driver>>>,
    open: AtomicBool,
    /// Domains known to this connection, in creation order.
    domains: Mutex<Vec<DomainHandle>>,
}

impl HypervisorConnection {
    /// Create an unopened connection using the builtin driver for the URI scheme.
    ///
    /// Builtin schemes: `local` and, with the `firecracker` feature,
    /// `firecracker`.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            preset: None,
            session: Mutex::new(None),
            open: AtomicBool::new(false),
            domains: Mutex::new(Vec::new()),
        }
    }

    /// Create an unopened connection backed by a specific driver.
    pub fn with_driver(uri: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self {
            preset: Some(driver),
            ..Self::new(uri)
        }
    }

    /// Create and open a connection in one step.
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        let conn = Self::new(uri);
        conn.open().await?;
        Ok(conn)
    }

    /// The URI this connection was created with.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether [`open`](Self::open) has succeeded and [`close`](Self::close)
    /// has not been called since.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Open the connection.
    ///
    /// Fails with [`HvError::InvalidUri`] for a malformed URI and with
    /// [`HvError::Connection`] if no driver handles the scheme or the backend
    /// cannot be reached. Opening an open connection is a no-op.
    pub async fn open(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            tracing::trace!(uri = %self.uri, "Connection already open");
            return Ok(());
        }

        let uri = ConnectUri::parse(&self.uri)?;
        let driver = match &self.preset {
            Some(driver) => Arc::clone(driver),
            None => builtin_driver(&uri)?,
        };

        tracing::debug!(uri = %uri, driver = driver.name(), "Opening hypervisor connection");
        driver.connect(&uri).await.map_err(|e| {
            tracing::warn!(uri = %uri, error = %e, "Hypervisor connection failed");
            match e {
                HvError::Connection(_) | HvError::InvalidUri { .. } => e,
                other => HvError::Connection(other.to_string()),
            }
        })?;

        *session = Some(driver);
        self.open.store(true, Ordering::Release);
        tracing::info!(uri = %uri, "Hypervisor connection open");
        Ok(())
    }

    /// Close the connection, releasing backend resources.
    ///
    /// Idempotent. Domains still alive are destroyed by the driver.
    pub async fn close(&self) {
        let driver = {
            let mut session = self.session.lock().await;
            self.open.store(false, Ordering::Release);
            session.take()
        };
        if let Some(driver) = driver {
            tracing::info!(uri = %self.uri, "Closing hypervisor connection");
            driver.disconnect().await;
            self.domains.lock().await.clear();
        }
    }

    /// Snapshot of the domains currently known to the backend.
    ///
    /// Each call refreshes from the driver, so the result can be re-requested
    /// at any time to observe newer state.
    pub async fn list_domains(&self) -> Result<Vec<DomainHandle>> {
        let driver = self.driver().await?;
        let listed = driver.list_domains().await?;
        tracing::trace!(count = listed.len(), "Listed domains");
        *self.domains.lock().await = listed.clone();
        Ok(listed)
    }

    /// Find a domain by name.
    pub async fn find_domain(&self, name: &str) -> Result<Option<DomainHandle>> {
        Ok(self
            .list_domains()
            .await?
            .into_iter()
            .find(|d| d.name() == name))
    }

    /// Ask the backend to create and start a domain.
    pub async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle> {
        let driver = self.driver().await?;
        let start = std::time::Instant::now();
        tracing::debug!(name = %spec.name, driver = driver.name(), "Creating domain");

        let handle = driver.create_domain(spec).await?;
        self.domains.lock().await.push(handle.clone());

        tracing::info!(
            domain_id = %handle.id(),
            name = %handle.name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Domain created"
        );
        Ok(handle)
    }

    /// Ask the backend to destroy a domain.
    pub async fn destroy_domain(&self, domain: &DomainHandle) -> Result<()> {
        let driver = self.driver().await?;
        tracing::debug!(domain_id = %domain.id(), "Destroying domain");

        let result = driver.destroy_domain(domain.id()).await;
        self.domains.lock().await.retain(|d| d.id() != domain.id());

        if let Err(ref e) = result {
            tracing::warn!(domain_id = %domain.id(), error = %e, "Domain destroy failed");
        } else {
            tracing::info!(domain_id = %domain.id(), "Domain destroyed");
        }
        result
    }

    /// Open a console stream on a domain.
    pub async fn open_console(
        &self,
        domain: &DomainHandle,
        target: ConsoleTarget,
    ) -> Result<ConsoleStream> {
        let driver = self.driver().await?;
        tracing::debug!(domain_id = %domain.id(), console = %target, "Opening console stream");
        driver.open_console(domain.id(), target).await
    }

    /// Wait for the command of a domain to exit and return its exit code.
    ///
    /// Returns as soon as the command has exited; `None` if the backend does
    /// not report exit codes.
    pub async fn wait_exit(&self, domain: &DomainHandle) -> Result<Option<i32>> {
        let driver = self.driver().await?;
        let code = driver.wait_exit(domain.id()).await?;
        tracing::debug!(domain_id = %domain.id(), exit_code = ?code, "Domain command exited");
        Ok(code)
    }

    /// The connected driver, or `NotConnected`.
    async fn driver(&self) -> Result<Arc<dyn Driver>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(HvError::NotConnected)
    }
}

impl fmt::Debug for HypervisorConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HypervisorConnection")
            .field("uri", &self.uri)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Resolve the driver for a builtin URI scheme.
fn builtin_driver(uri: &ConnectUri) -> Result<Arc<dyn Driver>> {
    match uri.scheme() {
        "local" => Ok(Arc::new(LocalDriver::new())),
        #[cfg(feature = "firecracker")]
        "firecracker" => Ok(Arc::new(crate::firecracker::FirecrackerDriver::new(
            crate::firecracker::FirecrackerConfig::from_env(),
        ))),
        other => Err(HvError::Connection(format!(
            "no driver available for scheme '{other}'"
        ))),
    }
}
