//! Firecracker driver and per-VM configuration.

use crate::error::{HvError, Result};
use crate::spec::{DomainSpec, MountSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Boot arguments: serial console, reboot on panic, and `corral-init` as PID 1.
pub const DEFAULT_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off init=/usr/sbin/corral-init";

/// Driver-wide settings, shared by every VM the driver boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirecrackerConfig {
    /// Path to the guest kernel image.
    pub kernel_path: PathBuf,
    /// Path to the root filesystem image (must contain `corral-init`).
    pub rootfs_path: PathBuf,
    /// Path to the Firecracker binary.
    pub firecracker_path: PathBuf,
    /// Working directory for VM sockets and state.
    pub chroot_path: PathBuf,
    /// vCPUs per VM.
    pub vcpu_count: u8,
    /// Memory per VM in MiB.
    pub memory_mib: u32,
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::from("/var/lib/corral/vmlinux"),
            rootfs_path: PathBuf::from("/var/lib/corral/rootfs.ext4"),
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            chroot_path: PathBuf::from("/tmp/corral"),
            vcpu_count: 1,
            memory_mib: 256,
        }
    }
}

impl FirecrackerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CORRAL_KERNEL` | `/var/lib/corral/vmlinux` |
    /// | `CORRAL_ROOTFS` | `/var/lib/corral/rootfs.ext4` |
    /// | `CORRAL_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `CORRAL_CHROOT` | `/tmp/corral` |
    /// | `CORRAL_VCPUS` | `1` |
    /// | `CORRAL_MEMORY_MIB` | `256` |
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            kernel_path: env_path("CORRAL_KERNEL").unwrap_or(default.kernel_path),
            rootfs_path: env_path("CORRAL_ROOTFS").unwrap_or(default.rootfs_path),
            firecracker_path: env_path("CORRAL_FIRECRACKER").unwrap_or(default.firecracker_path),
            chroot_path: env_path("CORRAL_CHROOT").unwrap_or(default.chroot_path),
            vcpu_count: std::env::var("CORRAL_VCPUS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.vcpu_count),
            memory_mib: std::env::var("CORRAL_MEMORY_MIB")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.memory_mib),
        }
    }

    /// Check that the host files the driver needs exist.
    pub fn check_paths(&self) -> Result<()> {
        for (what, path) in [
            ("kernel", &self.kernel_path),
            ("rootfs", &self.rootfs_path),
            ("firecracker binary", &self.firecracker_path),
        ] {
            if !path.exists() {
                return Err(HvError::Config(format!(
                    "{what} not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Derive the machine configuration for one domain.
    ///
    /// Host-image mounts become extra drives in mount order (`/dev/vdb`,
    /// `/dev/vdc`, ...), network specs become TAP interfaces. Host-bind
    /// mounts have no Firecracker equivalent and are rejected.
    pub fn machine_for(&self, spec: &DomainSpec, vm_id: &str, cid: u32) -> Result<MachineConfig> {
        let mut extra_drives = Vec::new();
        for mount in &spec.mounts {
            match mount {
                MountSpec::HostImage { source, .. } => extra_drives.push(DriveConfig {
                    drive_id: format!("mnt{}", extra_drives.len()),
                    path_on_host: source.clone(),
                    is_root_device: false,
                    is_read_only: false,
                }),
                MountSpec::HostBind { .. } => {
                    return Err(HvError::unsupported("firecracker", "host-bind mounts"));
                }
                MountSpec::GuestBind { .. } | MountSpec::Ram { .. } => {}
            }
        }

        let networks = spec
            .networks
            .iter()
            .enumerate()
            .map(|(i, net)| {
                let host_dev_name = net.source.clone().ok_or_else(|| {
                    HvError::Config(format!("network {i} needs source=<tap device>"))
                })?;
                Ok(NetworkConfig {
                    iface_id: format!("eth{i}"),
                    host_dev_name,
                    guest_mac: net.mac.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let config = MachineConfig {
            vcpu_count: self.vcpu_count,
            memory_mib: self.memory_mib,
            kernel_path: self.kernel_path.clone(),
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
            root_drive: DriveConfig {
                drive_id: "rootfs".into(),
                path_on_host: self.rootfs_path.clone(),
                is_root_device: true,
                is_read_only: false,
            },
            extra_drives,
            networks,
            vsock: VsockConfig::for_vm(cid, &self.chroot_path, vm_id),
            firecracker_path: self.firecracker_path.clone(),
            chroot_path: self.chroot_path.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

/// Configuration for one microVM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of virtual CPUs (1-32)
    pub vcpu_count: u8,
    /// Memory size in MiB (at least 128)
    pub memory_mib: u32,
    /// Path to kernel image
    pub kernel_path: PathBuf,
    /// Kernel boot arguments
    pub boot_args: String,
    /// Root filesystem drive
    pub root_drive: DriveConfig,
    /// Drives backing host-image mounts
    pub extra_drives: Vec<DriveConfig>,
    /// TAP-backed network interfaces
    pub networks: Vec<NetworkConfig>,
    /// vsock device reaching `corral-init`
    pub vsock: VsockConfig,
    /// Path to Firecracker binary
    pub firecracker_path: PathBuf,
    /// Working directory for VM sockets and state
    pub chroot_path: PathBuf,
}

impl MachineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.vcpu_count == 0 || self.vcpu_count > 32 {
            return Err(HvError::Config(format!(
                "vcpu_count must be 1-32, got {}",
                self.vcpu_count
            )));
        }

        if self.memory_mib < 128 {
            return Err(HvError::Config(format!(
                "memory_mib must be at least 128, got {}",
                self.memory_mib
            )));
        }

        // CIDs 0-2 are reserved.
        if self.vsock.guest_cid <= 2 {
            return Err(HvError::Config(format!(
                "vsock guest_cid must be > 2, got {}",
                self.vsock.guest_cid
            )));
        }

        let mut drive_ids = vec![&self.root_drive.drive_id];
        for extra in &self.extra_drives {
            if drive_ids.contains(&&extra.drive_id) {
                return Err(HvError::Config(format!(
                    "duplicate drive_id: {}",
                    extra.drive_id
                )));
            }
            drive_ids.push(&extra.drive_id);
        }

        Ok(())
    }

    /// Path to the Firecracker API socket of VM `vm_id`.
    pub fn api_socket(&self, vm_id: &str) -> PathBuf {
        self.chroot_path.join(vm_id).join("firecracker.socket")
    }
}

/// A block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image on host
    pub path_on_host: PathBuf,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

/// A network interface backed by a host TAP device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface ID inside Firecracker
    pub iface_id: String,
    /// Host TAP device name
    pub host_dev_name: String,
    /// Guest MAC address, generated by Firecracker if `None`
    pub guest_mac: Option<String>,
}

/// vsock device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest CID, must be > 2
    pub guest_cid: u32,
    /// Host Unix socket Firecracker exposes the device on
    pub uds_path: PathBuf,
}

impl VsockConfig {
    /// vsock config for a specific VM, with the socket under its chroot directory.
    pub fn for_vm(cid: u32, chroot_path: &Path, vm_id: &str) -> Self {
        Self {
            guest_cid: cid,
            uds_path: chroot_path.join(vm_id).join("v.sock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::NetworkSpec;

    fn driver_config() -> FirecrackerConfig {
        FirecrackerConfig {
            chroot_path: PathBuf::from("/tmp/corral-test"),
            ..FirecrackerConfig::default()
        }
    }

    #[test]
    fn test_machine_for_plain_spec() {
        let spec = DomainSpec::new("box");
        let config = driver_config().machine_for(&spec, "vm-1", 3).unwrap();
        assert!(config.extra_drives.is_empty());
        assert!(config.networks.is_empty());
        assert_eq!(config.vsock.uds_path, PathBuf::from("/tmp/corral-test/vm-1/v.sock"));
        assert_eq!(
            config.api_socket("vm-1"),
            PathBuf::from("/tmp/corral-test/vm-1/firecracker.socket")
        );
    }

    #[test]
    fn test_host_images_become_drives() {
        let mut spec = DomainSpec::new("box");
        spec.mounts = vec![
            "host-image:/data=/srv/data.img".parse().unwrap(),
            "ram:/tmp=64M".parse().unwrap(),
            "host-image:/cache=/srv/cache.img".parse().unwrap(),
        ];
        let config = driver_config().machine_for(&spec, "vm-1", 3).unwrap();
        assert_eq!(config.extra_drives.len(), 2);
        assert_eq!(config.extra_drives[0].drive_id, "mnt0");
        assert_eq!(config.extra_drives[1].path_on_host, PathBuf::from("/srv/cache.img"));
    }

    #[test]
    fn test_host_bind_rejected() {
        let mut spec = DomainSpec::new("box");
        spec.mounts = vec!["host-bind:/data=/srv".parse().unwrap()];
        let err = driver_config().machine_for(&spec, "vm-1", 3).unwrap_err();
        assert!(matches!(err, HvError::Unsupported { .. }));
    }

    #[test]
    fn test_network_requires_tap() {
        let mut spec = DomainSpec::new("box");
        spec.networks = vec![NetworkSpec::dhcp()];
        assert!(driver_config().machine_for(&spec, "vm-1", 3).is_err());

        spec.networks[0].source = Some("tap0".into());
        let config = driver_config().machine_for(&spec, "vm-1", 3).unwrap();
        assert_eq!(config.networks[0].iface_id, "eth0");
        assert_eq!(config.networks[0].host_dev_name, "tap0");
    }

    #[test]
    fn test_validate_vcpu_and_cid() {
        let spec = DomainSpec::new("box");
        let mut config = driver_config().machine_for(&spec, "vm-1", 3).unwrap();
        config.vcpu_count = 0;
        assert!(config.validate().is_err());
        config.vcpu_count = 2;
        config.vsock.guest_cid = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_memory() {
        let mut fc = driver_config();
        fc.memory_mib = 64;
        assert!(fc.machine_for(&DomainSpec::new("box"), "vm-1", 3).is_err());
    }
}
