//! # corral-core
//!
//! Sandbox lifecycle and console handling for Corral.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    corral-core (host)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ SandboxContext  │────▶│  SandboxConfig           │   │
//! │  │   - start()     │     │  (validated, read-only)  │   │
//! │  │   - attach()    │     └──────────────────────────┘   │
//! │  │   - stop()      │                                    │
//! │  │   - console()   │────▶ Cleaner (post-start/stop)     │
//! │  └─────────────────┘                                    │
//! │           │                                              │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │ ConsoleChannel  │────▶│  HypervisorConnection    │   │
//! │  │  - attach()     │     │  (from corral-hv)        │   │
//! │  │  - detach()     │     └──────────────────────────┘   │
//! │  │  - wait_closed()│                                    │
//! │  └─────────────────┘                                    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use corral_core::{SandboxConfig, SandboxContext};
//! use corral_hv::HypervisorConnection;
//! use std::sync::Arc;
//!
//! # async fn example() -> corral_core::Result<()> {
//! let conn = Arc::new(HypervisorConnection::connect("local:///").await?);
//!
//! let config = SandboxConfig::builder()
//!     .name("demo")
//!     .command(["/bin/echo", "hello"])
//!     .build()?;
//!
//! let ctx = SandboxContext::new(config, conn.clone());
//! ctx.start().await?;
//!
//! let console = ctx.console().await?;
//! console.attach_output(tokio::io::stdout()).await?;
//! let closed = console.wait_closed().await;
//! println!("console closed: {closed:?}");
//!
//! ctx.stop().await?;
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

mod cleaner;
mod config;
mod console;
mod context;
mod error;
mod terminal;

pub use cleaner::{Cleaner, CleanupStage};
pub use config::{SandboxConfig, SandboxConfigBuilder, CONFIG_FILE_NAME};
pub use console::{escape_byte, CloseReason, ConsoleChannel, ConsoleClosed, DEFAULT_ESCAPE};
pub use context::{SandboxContext, SandboxState};
pub use error::{Result, SandboxError};
