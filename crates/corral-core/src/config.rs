//! Sandbox configuration.

use crate::error::{Result, SandboxError};
use corral_hv::{DomainSpec, MountSpec, NetworkSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the persisted configuration inside the config directory.
pub const CONFIG_FILE_NAME: &str = "sandbox.cfg";

/// What to run in a sandbox and how.
///
/// Built and validated through [`SandboxConfig::builder`]; immutable
/// afterwards. A [`SandboxContext`](crate::SandboxContext) shares it read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    name: String,
    #[serde(default)]
    command: Option<Vec<String>>,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    tty: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    workdir: Option<PathBuf>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    uid: Option<u32>,
    #[serde(default)]
    gid: Option<u32>,
    #[serde(default)]
    shell: bool,
    #[serde(default)]
    mounts: Vec<MountSpec>,
    #[serde(default)]
    networks: Vec<NetworkSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    state_dir: Option<PathBuf>,
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Config running the default command in a sandbox called `name`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        Self::builder().name(name).build()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SandboxError::InvalidConfig("name is required".into()));
        }
        if self.name.contains('/') {
            return Err(SandboxError::InvalidConfig(format!(
                "name '{}' must not contain '/'",
                self.name
            )));
        }
        if let Some(command) = &self.command {
            match command.first() {
                None => {
                    return Err(SandboxError::InvalidConfig("command must not be empty".into()));
                }
                Some(program) if program.is_empty() => {
                    return Err(SandboxError::InvalidConfig(
                        "command program must not be empty".into(),
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(SandboxError::InvalidConfig(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        if matches!(&self.hostname, Some(h) if h.is_empty()) {
            return Err(SandboxError::InvalidConfig("hostname must not be empty".into()));
        }
        Ok(())
    }

    /// Sandbox name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Command argv, `None` for the backend default shell.
    pub fn command(&self) -> Option<&[String]> {
        self.command.as_deref()
    }

    /// Whether local input is forwarded to the command.
    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// Whether a terminal was requested.
    pub fn tty(&self) -> bool {
        self.tty
    }

    /// Extra environment variables.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Working directory of the command.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Hostname inside the sandbox.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// User the command runs as.
    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    /// Group the command runs as.
    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    /// Whether an administrative shell console is available.
    pub fn shell(&self) -> bool {
        self.shell
    }

    /// Filesystem mounts.
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Network interfaces.
    pub fn networks(&self) -> &[NetworkSpec] {
        &self.networks
    }

    /// Per-sandbox state directory.
    ///
    /// Defaults to `<user cache dir>/corral/<name>`, falling back to the
    /// system temp directory when there is no cache dir.
    pub fn state_dir(&self) -> PathBuf {
        match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("corral")
                .join(&self.name),
        }
    }

    /// Directory holding the persisted configuration.
    pub fn config_dir(&self) -> PathBuf {
        self.state_dir().join("config")
    }

    /// Path of the persisted configuration.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILE_NAME)
    }

    /// Backend-neutral description of the domain to create.
    pub fn to_domain_spec(&self) -> DomainSpec {
        DomainSpec {
            name: self.name.clone(),
            command: self.command.clone().unwrap_or_default(),
            tty: self.tty,
            interactive: self.interactive,
            env: self.env.clone(),
            workdir: self.workdir.clone(),
            hostname: self.hostname.clone(),
            uid: self.uid,
            gid: self.gid,
            mounts: self.mounts.clone(),
            networks: self.networks.clone(),
        }
    }

    /// Write the configuration as JSON.
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await?;
        tracing::debug!(sandbox = %self.name, path = %path.display(), "Saved sandbox config");
        Ok(())
    }

    /// Read and validate a configuration written by [`save_to_path`](Self::save_to_path).
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`SandboxConfig`].
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the sandbox name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the command argv.
    pub fn command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    /// Forward local input to the command.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.config.interactive = interactive;
        self
    }

    /// Request a terminal.
    pub fn tty(mut self, tty: bool) -> Self {
        self.config.tty = tty;
        self
    }

    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.workdir = Some(dir.into());
        self
    }

    /// Set the hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = Some(hostname.into());
        self
    }

    /// Run the command as `uid`.
    pub fn uid(mut self, uid: u32) -> Self {
        self.config.uid = Some(uid);
        self
    }

    /// Run the command as group `gid`.
    pub fn gid(mut self, gid: u32) -> Self {
        self.config.gid = Some(gid);
        self
    }

    /// Make the administrative shell console available.
    pub fn shell(mut self, shell: bool) -> Self {
        self.config.shell = shell;
        self
    }

    /// Add a filesystem mount.
    pub fn mount(mut self, mount: MountSpec) -> Self {
        self.config.mounts.push(mount);
        self
    }

    /// Add a network interface.
    pub fn network(mut self, network: NetworkSpec) -> Self {
        self.config.networks.push(network);
        self
    }

    /// Override the state directory.
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.state_dir = Some(dir.into());
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<SandboxConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
