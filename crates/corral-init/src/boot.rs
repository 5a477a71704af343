//! PID 1 duties: pseudo filesystems at boot, power off at shutdown.

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use std::path::Path;
use tracing::{debug, warn};

struct BasicMount {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
}

fn basic_mounts() -> Vec<BasicMount> {
    let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    vec![
        BasicMount {
            source: "proc",
            target: "/proc",
            fstype: "proc",
            flags: hardened,
            data: None,
        },
        BasicMount {
            source: "sysfs",
            target: "/sys",
            fstype: "sysfs",
            flags: hardened,
            data: None,
        },
        BasicMount {
            source: "devtmpfs",
            target: "/dev",
            fstype: "devtmpfs",
            flags: MsFlags::MS_NOSUID,
            data: Some("mode=0755"),
        },
        BasicMount {
            source: "devpts",
            target: "/dev/pts",
            fstype: "devpts",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            data: Some("gid=5,mode=620,ptmxmode=666"),
        },
        BasicMount {
            source: "tmpfs",
            target: "/tmp",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: Some("mode=1777"),
        },
        BasicMount {
            source: "tmpfs",
            target: "/run",
            fstype: "tmpfs",
            flags: MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            data: Some("mode=0755"),
        },
    ]
}

/// Mount the pseudo filesystems a bare rootfs lacks.
///
/// Failures are logged; an already mounted target is skipped.
pub fn mount_basics() {
    for m in basic_mounts() {
        if let Err(e) = std::fs::create_dir_all(m.target) {
            warn!(target_dir = m.target, error = %e, "failed to create mount point");
            continue;
        }
        match mount(Some(m.source), Path::new(m.target), Some(m.fstype), m.flags, m.data) {
            Ok(()) => debug!(fstype = m.fstype, path = m.target, "mounted"),
            Err(Errno::EBUSY) => debug!(path = m.target, "already mounted"),
            Err(e) => warn!(fstype = m.fstype, path = m.target, error = %e, "mount failed"),
        }
    }
}

/// Flush filesystems and stop the guest. Firecracker exits on guest reboot.
pub fn power_off() -> anyhow::Result<()> {
    nix::unistd::sync();
    match reboot(RebootMode::RB_AUTOBOOT) {
        Ok(never) => match never {},
        Err(e) => Err(anyhow::anyhow!("reboot failed: {e}")),
    }
}
