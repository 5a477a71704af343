//! corral-init: init process and agent for Corral microVM guests.
//!
//! Runs as PID 1 (`init=/usr/sbin/corral-init`), mounts the pseudo
//! filesystems, then serves the host driver over vsock: it prepares the
//! guest, runs the sandboxed command and bridges its consoles.

mod boot;
mod handler;
mod server;
mod setup;

use anyhow::Context;
use corral_hv::proto::AGENT_PORT;
use handler::Agent;
use std::sync::Arc;
use tokio_vsock::{VsockAddr, VsockListener};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to the serial console.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("corral_init=info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let pid1 = std::process::id() == 1;
    info!(pid1, "corral-init starting");
    if pid1 {
        boot::mount_basics();
    }

    let agent = Arc::new(Agent::new().await.context("failed to open local connection")?);

    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, AGENT_PORT);
    let listener = VsockListener::bind(addr).context("failed to bind vsock listener")?;
    info!(port = AGENT_PORT, "listening for connections");

    server::serve(listener, agent).await?;

    if pid1 {
        boot::power_off()?;
    }
    Ok(())
}
