//! # corral-hv
//!
//! Hypervisor connection layer for Corral sandboxes.
//!
//! A [`HypervisorConnection`] is opened against a URI whose scheme selects a
//! [`Driver`]. The connection owns every domain created through it and hands
//! out [`DomainHandle`]s; consoles come back as [`ConsoleStream`]s.
//!
//! ## Quick Start
//!
//! ```no_run
//! use corral_hv::{ConsoleTarget, DomainSpec, HypervisorConnection};
//!
//! # async fn example() -> corral_hv::Result<()> {
//! let conn = HypervisorConnection::connect("local:///").await?;
//!
//! let mut spec = DomainSpec::new("demo");
//! spec.command = vec!["/bin/echo".into(), "hello".into()];
//! let domain = conn.create_domain(&spec).await?;
//!
//! let console = conn.open_console(&domain, ConsoleTarget::Primary).await?;
//! # drop(console);
//! conn.destroy_domain(&domain).await?;
//! conn.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Drivers
//!
//! - **`local://`**: the command runs as a host child process, no isolation
//! - **`firecracker://`**: one microVM per domain (feature `firecracker`)
//! - [`MockDriver`]: in-memory backend, injected with
//!   [`HypervisorConnection::with_driver`]

mod connection;
mod domain;
mod driver;
mod error;
mod local;
mod mock;
mod spec;
mod uri;

#[cfg(feature = "firecracker")]
pub mod firecracker;
pub mod proto;

pub use connection::HypervisorConnection;
pub use domain::{DomainHandle, DomainId};
pub use driver::{ConsoleReader, ConsoleStream, ConsoleTarget, ConsoleWriter, Driver};
pub use error::{HvError, Result};
pub use local::LocalDriver;
pub use mock::MockDriver;
pub use spec::{
    DomainSpec, MountSpec, NetworkAddress, NetworkSpec, SpecParseError, DEFAULT_COMMAND,
};
pub use uri::ConnectUri;
