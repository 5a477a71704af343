//! The narrow interface every hypervisor backend implements.

use crate::domain::{DomainHandle, DomainId};
use crate::error::Result;
use crate::spec::DomainSpec;
use crate::uri::ConnectUri;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Which console of a domain to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleTarget {
    /// I/O of the sandboxed command.
    #[default]
    Primary,
    /// An administrative shell next to the sandboxed command.
    Shell,
}

impl fmt::Display for ConsoleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// Read half of a console stream.
pub type ConsoleReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a console stream.
pub type ConsoleWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bidirectional byte stream connected to a domain console.
///
/// EOF on `reader` means the remote side hung up (process exit or backend
/// close). Dropping both halves releases the console on the backend side.
pub struct ConsoleStream {
    /// Bytes produced by the domain.
    pub reader: ConsoleReader,
    /// Bytes sent to the domain.
    pub writer: ConsoleWriter,
}

impl ConsoleStream {
    /// Wrap separate read and write halves.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a full-duplex stream (socket, `DuplexStream`) into a console.
    pub fn from_duplex<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl fmt::Debug for ConsoleStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleStream").finish_non_exhaustive()
    }
}

/// A virtualization backend.
///
/// Drivers own the backend resources of every domain they create. Callers
/// go through [`HypervisorConnection`](crate::HypervisorConnection), which
/// guarantees `connect` succeeded before any other method is invoked.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Short driver name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Establish the backend session for `uri`.
    async fn connect(&self, uri: &ConnectUri) -> Result<()>;

    /// Domains currently known to the backend.
    async fn list_domains(&self) -> Result<Vec<DomainHandle>>;

    /// Create and start a domain.
    async fn create_domain(&self, spec: &DomainSpec) -> Result<DomainHandle>;

    /// Stop a domain and release its resources.
    async fn destroy_domain(&self, id: DomainId) -> Result<()>;

    /// Open a console stream on a running domain.
    async fn open_console(&self, id: DomainId, target: ConsoleTarget) -> Result<ConsoleStream>;

    /// Wait until the domain's command exits and return its exit code.
    ///
    /// A command killed by a signal reports `128 + signal`, as a shell does.
    /// `None` means the backend cannot tell.
    async fn wait_exit(&self, id: DomainId) -> Result<Option<i32>> {
        let _ = id;
        Ok(None)
    }

    /// Tear down the backend session, destroying remaining domains.
    async fn disconnect(&self);
}
