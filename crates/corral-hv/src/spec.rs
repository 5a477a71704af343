//! Backend-neutral description of a domain to create.
//!
//! Mount and network specs use the same textual syntax as `virt-sandbox`:
//!
//! | spec | meaning |
//! |------|---------|
//! | `host-bind:/tmp=/srv/private` | bind host dir `/srv/private` at guest `/tmp` |
//! | `host-image:/data=/var/img/data.ext4` | attach a host disk image, mount at `/data` |
//! | `guest-bind:/etc=/tmp/etc` | bind guest dir `/tmp/etc` over `/etc` |
//! | `ram:/tmp=64M` | tmpfs of 64 MiB at `/tmp` |
//! | `dhcp,source=tap0` | NIC on host TAP `tap0`, configured by DHCP |
//! | `address=10.0.0.2/24,gateway=10.0.0.1` | NIC with a static address |

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Program run when a spec carries no command.
pub const DEFAULT_COMMAND: &str = "/bin/sh";

/// Everything a driver needs to create a domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Domain name.
    pub name: String,
    /// Command argv; empty means [`DEFAULT_COMMAND`].
    pub command: Vec<String>,
    /// Allocate a pseudo-terminal for the primary process.
    pub tty: bool,
    /// Keep the primary process's stdin connected to the console.
    pub interactive: bool,
    /// Extra environment variables.
    pub env: BTreeMap<String, String>,
    /// Working directory of the primary process.
    pub workdir: Option<PathBuf>,
    /// Hostname inside the domain.
    pub hostname: Option<String>,
    /// User ID to run the primary process as.
    pub uid: Option<u32>,
    /// Group ID to run the primary process as.
    pub gid: Option<u32>,
    /// Filesystem mounts.
    pub mounts: Vec<MountSpec>,
    /// Network interfaces.
    pub networks: Vec<NetworkSpec>,
}

impl DomainSpec {
    /// Create a spec that runs the default command.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Program and arguments to execute.
    pub fn program(&self) -> (&str, &[String]) {
        match self.command.split_first() {
            Some((program, args)) => (program.as_str(), args),
            None => (DEFAULT_COMMAND, &[]),
        }
    }
}

/// Error parsing a mount or network spec string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} spec '{spec}': {reason}")]
pub struct SpecParseError {
    kind: &'static str,
    spec: String,
    reason: String,
}

impl SpecParseError {
    fn new(kind: &'static str, spec: &str, reason: impl Into<String>) -> Self {
        Self {
            kind,
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }
}

/// A filesystem made visible inside the domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MountSpec {
    /// Host directory bound into the domain.
    HostBind {
        /// Path inside the domain.
        target: PathBuf,
        /// Host directory.
        source: PathBuf,
    },
    /// Host disk image attached as a block device and mounted.
    HostImage {
        /// Path inside the domain.
        target: PathBuf,
        /// Host image file.
        source: PathBuf,
    },
    /// Directory already inside the domain, bound to another path.
    GuestBind {
        /// Path inside the domain.
        target: PathBuf,
        /// Directory inside the domain.
        source: PathBuf,
    },
    /// Memory-backed filesystem.
    Ram {
        /// Path inside the domain.
        target: PathBuf,
        /// Size limit in KiB.
        size_kib: u64,
    },
}

impl MountSpec {
    /// Path inside the domain.
    pub fn target(&self) -> &PathBuf {
        match self {
            Self::HostBind { target, .. }
            | Self::HostImage { target, .. }
            | Self::GuestBind { target, .. }
            | Self::Ram { target, .. } => target,
        }
    }

    /// The spec's type keyword.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HostBind { .. } => "host-bind",
            Self::HostImage { .. } => "host-image",
            Self::GuestBind { .. } => "guest-bind",
            Self::Ram { .. } => "ram",
        }
    }
}

impl FromStr for MountSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| SpecParseError::new("mount", s, reason);

        let (kind, rest) = s.split_once(':').ok_or_else(|| err("expected TYPE:TARGET=SOURCE"))?;
        let (target, source) = rest
            .split_once('=')
            .ok_or_else(|| err("expected TARGET=SOURCE"))?;

        let target = PathBuf::from(target);
        if !target.is_absolute() {
            return Err(err("target must be an absolute path"));
        }
        if source.is_empty() {
            return Err(err("source must not be empty"));
        }

        match kind {
            "host-bind" => Ok(Self::HostBind {
                target,
                source: source.into(),
            }),
            "host-image" => Ok(Self::HostImage {
                target,
                source: source.into(),
            }),
            "guest-bind" => Ok(Self::GuestBind {
                target,
                source: source.into(),
            }),
            "ram" => Ok(Self::Ram {
                target,
                size_kib: parse_size_kib(source).ok_or_else(|| err("invalid size"))?,
            }),
            _ => Err(err("unknown mount type")),
        }
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostBind { target, source }
            | Self::HostImage { target, source }
            | Self::GuestBind { target, source } => {
                write!(f, "{}:{}={}", self.kind(), target.display(), source.display())
            }
            Self::Ram { target, size_kib } => {
                write!(f, "ram:{}={}K", target.display(), size_kib)
            }
        }
    }
}

/// Parse `64M`, `512K`, `1G` or a bare KiB count.
fn parse_size_kib(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1),
        'm' | 'M' => (&s[..s.len() - 1], 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = digits.parse().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(multiplier)
}

/// A static address assigned to a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// Interface address.
    pub address: IpAddr,
    /// Prefix length.
    pub prefix: u8,
}

impl FromStr for NetworkAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| "expected ADDRESS/PREFIX".to_string())?;
        let address: IpAddr = addr.parse().map_err(|e| format!("{addr}: {e}"))?;
        let prefix: u8 = prefix.parse().map_err(|e| format!("{prefix}: {e}"))?;
        let max = if address.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix {prefix} exceeds {max}"));
        }
        Ok(Self { address, prefix })
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// A network interface inside the domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Configure the interface with DHCP.
    pub dhcp: bool,
    /// Host-side source (TAP device, bridge) the driver connects to.
    pub source: Option<String>,
    /// Guest MAC address.
    pub mac: Option<String>,
    /// Static addresses.
    pub addresses: Vec<NetworkAddress>,
    /// Default gateway.
    pub gateway: Option<IpAddr>,
}

impl NetworkSpec {
    /// A DHCP-configured interface.
    pub fn dhcp() -> Self {
        Self {
            dhcp: true,
            ..Default::default()
        }
    }
}

impl FromStr for NetworkSpec {
    type Err = SpecParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: String| SpecParseError::new("network", s, reason);
        let mut net = NetworkSpec::default();

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                None if part == "dhcp" => net.dhcp = true,
                Some(("source", v)) if !v.is_empty() => net.source = Some(v.to_string()),
                Some(("mac", v)) if !v.is_empty() => net.mac = Some(v.to_string()),
                Some(("address", v)) => net.addresses.push(v.parse().map_err(err)?),
                Some(("gateway", v)) => {
                    net.gateway = Some(v.parse().map_err(|e| err(format!("{v}: {e}")))?)
                }
                _ => return Err(err(format!("unknown option '{part}'"))),
            }
        }

        if net.dhcp && !net.addresses.is_empty() {
            return Err(err("dhcp cannot be combined with static addresses".into()));
        }
        if !net.dhcp && net.addresses.is_empty() {
            return Err(err("expected dhcp or at least one address".into()));
        }
        if net.dhcp && net.gateway.is_some() {
            return Err(err("gateway requires static addresses".into()));
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_program() {
        let spec = DomainSpec::new("sandbox");
        assert_eq!(spec.program(), (DEFAULT_COMMAND, &[][..]));
    }

    #[test]
    fn test_program_splits_argv() {
        let mut spec = DomainSpec::new("sandbox");
        spec.command = vec!["/sbin/httpd".into(), "-some".into(), "-arg".into()];
        let (program, args) = spec.program();
        assert_eq!(program, "/sbin/httpd");
        assert_eq!(args, &["-some".to_string(), "-arg".to_string()][..]);
    }

    #[test]
    fn test_parse_mounts() {
        let m: MountSpec = "host-bind:/tmp=/tmp/privatestuff".parse().unwrap();
        assert_eq!(
            m,
            MountSpec::HostBind {
                target: "/tmp".into(),
                source: "/tmp/privatestuff".into()
            }
        );

        let m: MountSpec = "guest-bind:/etc=/tmp/etc".parse().unwrap();
        assert_eq!(m.kind(), "guest-bind");
        assert_eq!(m.target(), &PathBuf::from("/etc"));

        let m: MountSpec = "ram:/scratch=64M".parse().unwrap();
        assert_eq!(
            m,
            MountSpec::Ram {
                target: "/scratch".into(),
                size_kib: 64 * 1024
            }
        );
        assert_eq!(m.to_string(), "ram:/scratch=65536K");
    }

    #[test]
    fn test_parse_mount_errors() {
        assert!("/tmp=/x".parse::<MountSpec>().is_err());
        assert!("host-bind:tmp=/x".parse::<MountSpec>().is_err());
        assert!("host-bind:/tmp=".parse::<MountSpec>().is_err());
        assert!("nfs:/tmp=server:/export".parse::<MountSpec>().is_err());
        assert!("ram:/tmp=0".parse::<MountSpec>().is_err());
        assert!("ram:/tmp=lots".parse::<MountSpec>().is_err());
    }

    #[test]
    fn test_parse_dhcp_network() {
        let net: NetworkSpec = "dhcp,source=tap0".parse().unwrap();
        assert!(net.dhcp);
        assert_eq!(net.source.as_deref(), Some("tap0"));
        assert!(net.addresses.is_empty());
    }

    #[test]
    fn test_parse_static_network() {
        let net: NetworkSpec = "address=10.0.0.2/24,gateway=10.0.0.1,mac=52:54:00:00:00:01"
            .parse()
            .unwrap();
        assert!(!net.dhcp);
        assert_eq!(net.addresses.len(), 1);
        assert_eq!(net.addresses[0].to_string(), "10.0.0.2/24");
        assert_eq!(net.gateway, Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_parse_network_errors() {
        assert!("".parse::<NetworkSpec>().is_err());
        assert!("dhcp,address=10.0.0.2/24".parse::<NetworkSpec>().is_err());
        assert!("address=10.0.0.2/33".parse::<NetworkSpec>().is_err());
        assert!("dhcp,gateway=10.0.0.1".parse::<NetworkSpec>().is_err());
        assert!("dhcp,bogus=1".parse::<NetworkSpec>().is_err());
    }

    #[test]
    fn test_spec_serde_roundtrip_keeps_mount_tags() {
        let mut spec = DomainSpec::new("sandbox");
        spec.mounts.push("ram:/tmp=1M".parse().unwrap());
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"type\":\"ram\""));
        let back: DomainSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
