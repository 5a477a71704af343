//! Direct Firecracker API calls for devices firepilot does not expose.
//!
//! Both calls must happen after the Firecracker process is up and before
//! the VM is started.

use super::config::VsockConfig;
use crate::error::{HvError, Result};
use firepilot_models::models::{MachineConfiguration, Vsock};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use std::path::Path;

/// Configure vCPU count and memory size (`PUT /machine-config`).
pub async fn configure_machine(socket_path: &Path, vcpu_count: u8, mem_size_mib: u32) -> Result<()> {
    tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");
    let config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
    put(socket_path, "/machine-config", &config).await?;
    tracing::debug!(vcpu_count, mem_size_mib, "Machine resources configured");
    Ok(())
}

/// Attach the vsock device (`PUT /vsock`).
pub async fn configure_vsock(socket_path: &Path, config: &VsockConfig) -> Result<()> {
    tracing::debug!(
        cid = config.guest_cid,
        uds_path = %config.uds_path.display(),
        "Configuring vsock"
    );
    let vsock = Vsock::new(
        config.guest_cid as i32,
        config.uds_path.to_string_lossy().to_string(),
    );
    put(socket_path, "/vsock", &vsock).await?;
    tracing::debug!(cid = config.guest_cid, "vsock configured");
    Ok(())
}

async fn put<T: Serialize>(socket_path: &Path, endpoint: &str, payload: &T) -> Result<()> {
    let start = std::time::Instant::now();
    let body = serde_json::to_string(payload)
        .map_err(|e| HvError::Config(format!("failed to serialize {endpoint} body: {e}")))?;
    tracing::trace!(endpoint, body = %body, "Firecracker API request");

    let uri: hyper::Uri = Uri::new(socket_path, endpoint).into();
    let request = Request::builder()
        .method(Method::PUT)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .map_err(|e| HvError::Config(format!("failed to build {endpoint} request: {e}")))?;

    let response = Client::unix().request(request).await.map_err(|e| {
        tracing::error!(endpoint, error = %e, "Firecracker API request failed");
        HvError::Firepilot(format!("{endpoint} request failed: {e}"))
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_bytes = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let body_str = String::from_utf8_lossy(&body_bytes);
        tracing::error!(endpoint, status = %status, body = %body_str, "Firecracker API rejected request");
        return Err(HvError::Firepilot(format!(
            "{endpoint} failed with status {status}: {body_str}"
        )));
    }

    tracing::trace!(
        endpoint,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Firecracker API request done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_serialization() {
        let config = MachineConfiguration::new(256, 2);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mem_size_mib\":256"));
        assert!(json.contains("\"vcpu_count\":2"));
    }

    #[test]
    fn test_vsock_serialization() {
        let vsock = Vsock::new(5, "/tmp/corral/vm/v.sock".to_string());
        let json = serde_json::to_string(&vsock).unwrap();
        assert!(json.contains("\"guest_cid\":5"));
        assert!(json.contains("\"uds_path\":\"/tmp/corral/vm/v.sock\""));
    }
}
