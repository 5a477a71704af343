//! Guest preparation before the sandboxed command starts.

use anyhow::{bail, Context, Result};
use corral_hv::{DomainSpec, MountSpec, NetworkSpec};
use nix::mount::{mount, MsFlags};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// Apply hostname, mounts and network interfaces of `spec`.
pub async fn prepare(spec: &DomainSpec) -> Result<()> {
    if let Some(hostname) = &spec.hostname {
        nix::unistd::sethostname(hostname)
            .with_context(|| format!("failed to set hostname '{hostname}'"))?;
        debug!(%hostname, "hostname set");
    }
    mount_all(&spec.mounts)?;
    configure_network(&spec.networks).await?;
    info!(
        mounts = spec.mounts.len(),
        networks = spec.networks.len(),
        "guest prepared"
    );
    Ok(())
}

/// The part of `spec` the local driver runs once the guest is prepared.
pub fn local_spec(spec: &DomainSpec) -> DomainSpec {
    DomainSpec {
        hostname: None,
        mounts: Vec::new(),
        networks: Vec::new(),
        ..spec.clone()
    }
}

/// Guest block device of the `index`-th host image. `/dev/vda` is the rootfs.
pub fn image_device(index: usize) -> Option<PathBuf> {
    let letter = u8::try_from(index)
        .ok()
        .and_then(|i| b'b'.checked_add(i))
        .filter(|l| *l <= b'z')?;
    Some(PathBuf::from(format!("/dev/vd{}", letter as char)))
}

fn mount_all(mounts: &[MountSpec]) -> Result<()> {
    let mut images = 0;
    for spec in mounts {
        let target = spec.target();
        std::fs::create_dir_all(target)
            .with_context(|| format!("failed to create mount point {}", target.display()))?;

        match spec {
            MountSpec::HostImage { .. } => {
                let device = image_device(images).context("too many host images")?;
                images += 1;
                mount(
                    Some(device.as_path()),
                    target.as_path(),
                    Some("ext4"),
                    MsFlags::empty(),
                    None::<&str>,
                )
                .with_context(|| format!("failed to mount {} on {}", device.display(), target.display()))?;
            }
            MountSpec::GuestBind { source, .. } => {
                mount(
                    Some(source.as_path()),
                    target.as_path(),
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .with_context(|| format!("failed to bind {} on {}", source.display(), target.display()))?;
            }
            MountSpec::Ram { size_kib, .. } => {
                let data = format!("size={size_kib}k");
                mount(
                    Some("tmpfs"),
                    target.as_path(),
                    Some("tmpfs"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                    Some(data.as_str()),
                )
                .with_context(|| format!("failed to mount tmpfs on {}", target.display()))?;
            }
            MountSpec::HostBind { .. } => {
                bail!("host-bind mounts are not available inside a microVM");
            }
        }
        debug!(kind = spec.kind(), path = %target.display(), "mounted");
    }
    Ok(())
}

async fn configure_network(networks: &[NetworkSpec]) -> Result<()> {
    if networks.is_empty() {
        return Ok(());
    }
    run(&["ip", "link", "set", "lo", "up"]).await?;
    for (index, network) in networks.iter().enumerate() {
        let iface = format!("eth{index}");
        for argv in network_commands(&iface, network) {
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            run(&argv).await?;
        }
        debug!(%iface, dhcp = network.dhcp, "interface configured");
    }
    Ok(())
}

/// Commands that bring up `iface` as described by `network`.
pub fn network_commands(iface: &str, network: &NetworkSpec) -> Vec<Vec<String>> {
    let argv = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let mut commands = vec![argv(&["ip", "link", "set", iface, "up"])];
    if network.dhcp {
        commands.push(argv(&["udhcpc", "-i", iface, "-q", "-n"]));
    }
    for address in &network.addresses {
        let address = address.to_string();
        commands.push(argv(&["ip", "addr", "add", &address, "dev", iface]));
    }
    if let Some(gateway) = network.gateway {
        let gateway = gateway.to_string();
        commands.push(argv(&["ip", "route", "add", "default", "via", &gateway, "dev", iface]));
    }
    commands
}

async fn run(argv: &[&str]) -> Result<()> {
    let (program, args) = argv.split_first().context("empty command")?;
    let status = Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !status.success() {
        bail!("'{}' failed with {status}", argv.join(" "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_hv::NetworkAddress;

    #[test]
    fn test_image_device() {
        assert_eq!(image_device(0), Some(PathBuf::from("/dev/vdb")));
        assert_eq!(image_device(1), Some(PathBuf::from("/dev/vdc")));
        assert_eq!(image_device(24), Some(PathBuf::from("/dev/vdz")));
        assert_eq!(image_device(25), None);
        assert_eq!(image_device(1000), None);
    }

    #[test]
    fn test_network_commands_static() {
        let network = NetworkSpec {
            addresses: vec!["10.0.0.2/24".parse::<NetworkAddress>().unwrap()],
            gateway: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        let commands = network_commands("eth0", &network);
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0], ["ip", "link", "set", "eth0", "up"]);
        assert_eq!(commands[1], ["ip", "addr", "add", "10.0.0.2/24", "dev", "eth0"]);
        assert_eq!(
            commands[2],
            ["ip", "route", "add", "default", "via", "10.0.0.1", "dev", "eth0"]
        );
    }

    #[test]
    fn test_network_commands_dhcp() {
        let commands = network_commands("eth1", &NetworkSpec::dhcp());
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1], ["udhcpc", "-i", "eth1", "-q", "-n"]);
    }

    #[test]
    fn test_local_spec_strips_guest_setup() {
        let mut spec = DomainSpec::new("web");
        spec.hostname = Some("web".into());
        spec.mounts = vec!["ram:/tmp=1M".parse().unwrap()];
        spec.networks = vec![NetworkSpec::dhcp()];
        spec.interactive = true;

        let local = local_spec(&spec);
        assert!(local.hostname.is_none());
        assert!(local.mounts.is_empty());
        assert!(local.networks.is_empty());
        assert!(local.interactive);
        assert_eq!(local.name, "web");
    }

    #[tokio::test]
    async fn test_prepare_empty_spec_is_noop() {
        prepare(&DomainSpec::new("plain")).await.unwrap();
    }
}
