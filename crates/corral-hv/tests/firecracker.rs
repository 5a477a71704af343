//! Integration tests for the Firecracker driver.
//!
//! These tests require:
//! - Linux with /dev/kvm access
//! - Firecracker binary installed
//! - Kernel image and a rootfs containing `corral-init`
//!
//! Configure with the `CORRAL_*` variables read by `FirecrackerConfig::from_env`
//! and run with: `cargo test -p corral-hv --test firecracker -- --ignored`

#![cfg(feature = "firecracker")]

use corral_hv::firecracker::FirecrackerConfig;
use corral_hv::{ConsoleTarget, DomainSpec, HypervisorConnection};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn host_ready() -> bool {
    let config = FirecrackerConfig::from_env();
    if let Err(e) = config.check_paths() {
        eprintln!("Skipping test: {e}");
        return false;
    }
    true
}

/// Boot a guest, read the command's output through the console, destroy it.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_echo_through_guest() {
    if !host_ready() {
        return;
    }

    let conn = HypervisorConnection::connect("firecracker:///")
        .await
        .expect("Failed to open connection");

    let mut spec = DomainSpec::new("fc-echo");
    spec.command = vec!["/bin/echo".into(), "from the guest".into()];
    let domain = conn.create_domain(&spec).await.expect("Failed to boot");

    let mut console = conn
        .open_console(&domain, ConsoleTarget::Primary)
        .await
        .expect("Failed to open console");
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), console.reader.read_to_end(&mut out))
        .await
        .expect("console did not close")
        .unwrap();
    assert!(String::from_utf8_lossy(&out).contains("from the guest"));

    conn.destroy_domain(&domain).await.expect("Failed to destroy");
    conn.close().await;
}

/// Interactive shell round trip inside the guest.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker"]
async fn test_interactive_guest_shell() {
    if !host_ready() {
        return;
    }

    let conn = HypervisorConnection::connect("firecracker:///")
        .await
        .expect("Failed to open connection");

    let mut spec = DomainSpec::new("fc-shell");
    spec.interactive = true;
    let domain = conn.create_domain(&spec).await.expect("Failed to boot");

    let mut console = conn
        .open_console(&domain, ConsoleTarget::Primary)
        .await
        .expect("Failed to open console");
    console
        .writer
        .write_all(b"echo marker-$((6*7))\nexit\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), console.reader.read_to_end(&mut out))
        .await
        .expect("console did not close")
        .unwrap();
    assert!(String::from_utf8_lossy(&out).contains("marker-42"));

    conn.close().await;
}
