//! corral: run a command in a sandbox with the terminal attached.
//!
//! Opens the hypervisor connection, starts the sandbox, attaches stdin and
//! stdout to its console and waits until the console closes (command exit,
//! escape character) or Ctrl-C. The sandbox is always stopped afterwards.
//! The exit status is the command's own when the backend reports it.

mod cli;
mod config;

use anyhow::Context;
use clap::Parser;
use cli::Args;
use config::Config;
use corral_core::{CloseReason, ConsoleClosed, SandboxContext};
use corral_hv::HypervisorConnection;
use std::io::IsTerminal;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Exit status after an interrupt, as a shell reports SIGINT.
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_env();

    // Logs go to stderr; stdout belongs to the console.
    let filter = args.verbosity_filter().unwrap_or(config.log_filter.as_str());
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("corral: {e:#}");
            1
        }
    };
    // A pending read on stdin would keep the runtime from shutting down.
    std::process::exit(code);
}

async fn run(args: Args, mut config: Config) -> anyhow::Result<i32> {
    if let Some(uri) = &args.connect {
        config.uri = uri.clone();
    }
    config.validate()?;

    let sandbox = args
        .sandbox_config(std::io::stdin().is_terminal(), config.state_root.as_deref())
        .context("invalid sandbox configuration")?;
    tracing::info!(uri = %config.uri, sandbox = %sandbox.name(), "Configuration loaded");

    let conn = Arc::new(HypervisorConnection::new(config.uri.as_str()));
    conn.open()
        .await
        .with_context(|| format!("failed to open connection to {}", config.uri))?;

    let ctx = SandboxContext::new(sandbox, Arc::clone(&conn));
    let result = session(&ctx, &args).await;

    if let Err(e) = ctx.stop().await {
        tracing::warn!(error = %e, "Failed to stop sandbox");
    }
    conn.close().await;
    result
}

async fn session(ctx: &SandboxContext, args: &Args) -> anyhow::Result<i32> {
    ctx.start().await?;

    let console = if args.attach_shell {
        ctx.shell_console().await?
    } else {
        ctx.console().await?
    };
    console.set_escape(Some(args.escape))?;
    console
        .attach_stdio()
        .await
        .context("failed to attach console")?;

    let closed = tokio::select! {
        closed = console.wait_closed() => closed,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            None
        }
    };

    if let Err(e) = console.detach().await {
        tracing::warn!(error = %e, "Failed to detach console");
    }

    exit_status(closed)
}

/// Process exit status for how the console closed.
fn exit_status(closed: Option<ConsoleClosed>) -> anyhow::Result<i32> {
    match closed {
        Some(ConsoleClosed {
            reason: CloseReason::Error(e),
            ..
        }) => anyhow::bail!("console failed: {e}"),
        Some(closed) => {
            tracing::debug!(reason = %closed.reason, exit_code = ?closed.exit_code, "Console closed");
            Ok(closed.exit_code.unwrap_or(0))
        }
        None => Ok(EXIT_INTERRUPTED),
    }
}
