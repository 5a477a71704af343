//! Connection URIs such as `firecracker:///session` or `local:///`.
//!
//! The URI is mostly opaque: only the scheme is interpreted here (it selects
//! the driver). Drivers may look at the host and path.

use crate::error::HvError;
use std::fmt;
use std::str::FromStr;

/// A parsed hypervisor connection URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectUri {
    raw: String,
    scheme: String,
    host: String,
    path: String,
}

impl ConnectUri {
    /// Parse a connection URI of the form `scheme://[host][/path]`.
    pub fn parse(uri: &str) -> Result<Self, HvError> {
        let invalid = |reason: &str| HvError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = uri.trim();
        if trimmed.is_empty() {
            return Err(invalid("URI is empty"));
        }

        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://"))?;

        if scheme.is_empty() {
            return Err(invalid("missing scheme"));
        }
        if !scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            return Err(invalid("scheme contains invalid characters"));
        }

        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        Ok(Self {
            raw: trimmed.to_string(),
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    /// The URI exactly as given (whitespace trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Lower-cased scheme, used to pick the driver.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host component (empty for `scheme:///path`).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Path component including the leading `/`, or empty.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FromStr for ConnectUri {
    type Err = HvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_uri() {
        let uri = ConnectUri::parse("qemu:///session").unwrap();
        assert_eq!(uri.scheme(), "qemu");
        assert_eq!(uri.host(), "");
        assert_eq!(uri.path(), "/session");
        assert_eq!(uri.to_string(), "qemu:///session");
    }

    #[test]
    fn test_parse_host_only() {
        let uri: ConnectUri = "LXC://node1".parse().unwrap();
        assert_eq!(uri.scheme(), "lxc");
        assert_eq!(uri.host(), "node1");
        assert_eq!(uri.path(), "");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(
            ConnectUri::parse("   "),
            Err(HvError::InvalidUri { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_missing_scheme() {
        assert!(ConnectUri::parse("/var/run/sock").is_err());
        assert!(ConnectUri::parse(":///session").is_err());
        assert!(ConnectUri::parse("bad scheme:///").is_err());
    }
}
