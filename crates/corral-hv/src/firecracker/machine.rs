//! One Firecracker microVM, booted through firepilot.

use super::api::{configure_machine, configure_vsock};
use super::config::{DriveConfig, MachineConfig};
use crate::error::{HvError, Result};
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use std::path::{Path, PathBuf};

/// A running microVM.
pub struct VirtualMachine {
    id: String,
    config: MachineConfig,
    machine: Machine,
}

impl VirtualMachine {
    /// Create and boot a microVM named `id`.
    ///
    /// Machine resources and vsock are configured through the API socket
    /// between process creation and boot.
    pub async fn boot(id: String, config: MachineConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(vm_id = %id, "Creating microVM");

        let kernel = KernelBuilder::new()
            .with_kernel_image_path(config.kernel_path.to_string_lossy().to_string())
            .with_boot_args(config.boot_args.clone())
            .try_build()
            .map_err(|e| HvError::Config(format!("kernel config: {e:?}")))?;

        let executor = FirecrackerExecutorBuilder::new()
            .with_chroot(config.chroot_path.to_string_lossy().to_string())
            .with_exec_binary(config.firecracker_path.clone())
            .try_build()
            .map_err(|e| HvError::Config(format!("executor config: {e:?}")))?;

        let mut fp_config = Configuration::new(id.clone())
            .with_kernel(kernel)
            .with_executor(executor)
            .with_drive(
                drive_builder(&config.root_drive)
                    .try_build()
                    .map_err(|e| HvError::Config(format!("root drive: {e:?}")))?,
            );

        for drive in &config.extra_drives {
            let built = drive_builder(drive)
                .try_build()
                .map_err(|e| HvError::Config(format!("drive {}: {e:?}", drive.drive_id)))?;
            fp_config = fp_config.with_drive(built);
        }

        for net in &config.networks {
            let mut builder = NetworkInterfaceBuilder::new()
                .with_iface_id(net.iface_id.clone())
                .with_host_dev_name(net.host_dev_name.clone());
            if let Some(mac) = &net.guest_mac {
                builder = builder.with_guest_mac(mac.clone());
            }
            let iface = builder
                .try_build()
                .map_err(|e| HvError::Config(format!("network config: {e:?}")))?;
            fp_config = fp_config.with_interface(iface);
        }

        let mut machine = Machine::new();
        machine
            .create(fp_config)
            .await
            .map_err(|e| HvError::Create(format!("{e:?}")))?;

        // From here on the Firecracker process and its workdir exist.
        let mut vm = Self {
            id,
            config,
            machine,
        };
        if let Err(e) = vm.configure_and_start().await {
            tracing::warn!(vm_id = %vm.id, error = %e, "MicroVM failed to boot");
            if let Err(destroy_err) = vm.destroy().await {
                tracing::debug!(error = %destroy_err, "Cleanup after failed boot");
            }
            return Err(e);
        }

        tracing::info!(vm_id = %vm.id, "MicroVM started");
        Ok(vm)
    }

    async fn configure_and_start(&mut self) -> Result<()> {
        let socket_path = self.config.api_socket(&self.id);
        configure_machine(&socket_path, self.config.vcpu_count, self.config.memory_mib).await?;
        configure_vsock(&socket_path, &self.config.vsock).await?;

        self.machine
            .start()
            .await
            .map_err(|e| HvError::Create(format!("start failed: {e:?}")))
    }

    /// VM identifier, also the chroot subdirectory name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Host socket of the VM's vsock device.
    pub fn vsock_uds_path(&self) -> &Path {
        &self.config.vsock.uds_path
    }

    /// Directory holding the VM's sockets.
    pub fn workdir(&self) -> PathBuf {
        self.config.chroot_path.join(&self.id)
    }

    /// Kill the Firecracker process and release the VM.
    pub async fn destroy(mut self) -> Result<()> {
        tracing::debug!(vm_id = %self.id, "Destroying microVM");
        let killed = self
            .machine
            .kill()
            .await
            .map_err(|e| HvError::Destroy(format!("kill failed: {e:?}")));

        let workdir = self.workdir();
        drop(self.machine);
        remove_workdir(&workdir).await;
        killed
    }
}

/// Remove a VM's chroot directory; a missing directory is fine.
async fn remove_workdir(workdir: &Path) {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => tracing::debug!(path = %workdir.display(), "VM workdir removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %workdir.display(), error = %e, "VM workdir not removed"),
    }
}

fn drive_builder(drive: &DriveConfig) -> DriveBuilder {
    let mut builder = DriveBuilder::new()
        .with_drive_id(drive.drive_id.clone())
        .with_path_on_host(drive.path_on_host.clone());
    if drive.is_root_device {
        builder = builder.as_root_device();
    }
    if drive.is_read_only {
        builder = builder.as_read_only();
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_workdir() {
        let root = tempfile::tempdir().unwrap();
        let workdir = root.path().join("vm-1");
        std::fs::create_dir_all(workdir.join("root/run")).unwrap();
        std::fs::write(workdir.join("root/run/firecracker.socket"), b"").unwrap();

        remove_workdir(&workdir).await;
        assert!(!workdir.exists());
        assert!(root.path().exists());

        // Already gone: nothing to do.
        remove_workdir(&workdir).await;
    }
}
