//! Command-line arguments.

use clap::{ArgAction, Parser};
use corral_core::{SandboxConfig, DEFAULT_ESCAPE};
use corral_hv::{MountSpec, NetworkSpec};
use std::path::{Path, PathBuf};

/// Run a command in a sandbox and attach the terminal to its console.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
pub struct Args {
    /// Hypervisor connection URI [default: $CORRAL_URI or local:///]
    #[arg(short = 'c', long = "connect", value_name = "URI")]
    pub connect: Option<String>,

    /// Sandbox name
    #[arg(short = 'n', long, default_value = "sandbox")]
    pub name: String,

    /// Allocate a terminal (default when stdin is a terminal)
    #[arg(short = 't', long, conflicts_with = "no_tty")]
    pub tty: bool,

    /// Never allocate a terminal
    #[arg(long)]
    pub no_tty: bool,

    /// Forward standard input to the command
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Mount a filesystem: host-bind|host-image|guest-bind:TARGET=SOURCE or ram:TARGET=SIZE
    #[arg(short = 'm', long = "mount", value_name = "TYPE:TARGET=SOURCE")]
    pub mounts: Vec<MountSpec>,

    /// Add a network interface: dhcp[,source=TAP] or address=IP/PREFIX[,gateway=IP][,mac=MAC]
    #[arg(short = 'N', long = "network", value_name = "OPTIONS")]
    pub networks: Vec<NetworkSpec>,

    /// Set an environment variable in the sandbox
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Working directory of the command
    #[arg(short = 'w', long, value_name = "DIR")]
    pub workdir: Option<PathBuf>,

    /// Hostname inside the sandbox
    #[arg(long)]
    pub hostname: Option<String>,

    /// Run as this user id
    #[arg(long)]
    pub uid: Option<u32>,

    /// Run as this group id
    #[arg(long)]
    pub gid: Option<u32>,

    /// Provide an administrative shell console
    #[arg(long)]
    pub shell: bool,

    /// Attach to the shell console instead of the command (implies --shell)
    #[arg(long)]
    pub attach_shell: bool,

    /// Escape character: Ctrl+CHAR closes the console
    #[arg(long, value_name = "CHAR", default_value_t = DEFAULT_ESCAPE)]
    pub escape: char,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Command and arguments [default: /bin/sh]
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Args {
    /// Whether a terminal is requested, given whether stdin is one.
    pub fn wants_tty(&self, stdin_is_tty: bool) -> bool {
        self.tty || (stdin_is_tty && !self.no_tty)
    }

    /// Log filter implied by `-v`, if any.
    pub fn verbosity_filter(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("info"),
            2 => Some("debug"),
            _ => Some("trace"),
        }
    }

    /// Build the sandbox configuration.
    ///
    /// A terminal implies interactive input. With `state_root`, the state
    /// directory is `<state_root>/<name>`.
    pub fn sandbox_config(
        &self,
        stdin_is_tty: bool,
        state_root: Option<&Path>,
    ) -> corral_core::Result<SandboxConfig> {
        let tty = self.wants_tty(stdin_is_tty);
        let mut builder = SandboxConfig::builder()
            .name(&self.name)
            .tty(tty)
            .interactive(self.interactive || tty)
            .shell(self.shell || self.attach_shell);

        if !self.command.is_empty() {
            builder = builder.command(&self.command);
        }
        for (key, value) in &self.env {
            builder = builder.env(key, value);
        }
        for mount in &self.mounts {
            builder = builder.mount(mount.clone());
        }
        for network in &self.networks {
            builder = builder.network(network.clone());
        }
        if let Some(dir) = &self.workdir {
            builder = builder.workdir(dir);
        }
        if let Some(hostname) = &self.hostname {
            builder = builder.hostname(hostname);
        }
        if let Some(uid) = self.uid {
            builder = builder.uid(uid);
        }
        if let Some(gid) = self.gid {
            builder = builder.gid(gid);
        }
        if let Some(root) = state_root {
            builder = builder.state_dir(root.join(&self.name));
        }
        builder.build()
    }
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("corral").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_command_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.name, "sandbox");
        assert_eq!(args.escape, ']');
        assert!(args.command.is_empty());
        assert!(args.verbosity_filter().is_none());

        let config = args.sandbox_config(false, None).unwrap();
        assert!(config.command().is_none());
        assert!(!config.tty());
        assert!(!config.interactive());
    }

    #[test]
    fn test_trailing_command_keeps_its_flags() {
        let args = parse(&["-n", "web", "--", "/bin/ls", "-l", "/"]);
        assert_eq!(args.command, ["/bin/ls", "-l", "/"]);

        let args = parse(&["-i", "/bin/sh", "-c", "echo hi"]);
        assert!(args.interactive);
        assert_eq!(args.command, ["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_full_config() {
        let args = parse(&[
            "-n", "box", "-m", "ram:/tmp=64M", "-N", "dhcp", "-e", "LANG=C", "-w", "/srv",
            "--hostname", "box", "--shell", "-v", "-v", "--", "/sbin/httpd",
        ]);
        assert_eq!(args.verbosity_filter(), Some("debug"));

        let config = args
            .sandbox_config(false, Some(Path::new("/var/tmp/corral")))
            .unwrap();
        assert_eq!(config.name(), "box");
        assert_eq!(config.mounts().len(), 1);
        assert_eq!(config.networks().len(), 1);
        assert_eq!(config.env().get("LANG").map(String::as_str), Some("C"));
        assert_eq!(config.workdir(), Some(Path::new("/srv")));
        assert_eq!(config.hostname(), Some("box"));
        assert!(config.shell());
        assert_eq!(config.state_dir(), PathBuf::from("/var/tmp/corral/box"));
    }

    #[test]
    fn test_tty_selection() {
        let auto = parse(&[]);
        assert!(auto.wants_tty(true));
        assert!(!auto.wants_tty(false));
        assert!(auto.sandbox_config(true, None).unwrap().interactive());

        assert!(parse(&["-t"]).wants_tty(false));
        assert!(!parse(&["--no-tty"]).wants_tty(true));
        assert!(Args::try_parse_from(["corral", "-t", "--no-tty"]).is_err());
    }

    #[test]
    fn test_invalid_values() {
        assert!(Args::try_parse_from(["corral", "-m", "bogus"]).is_err());
        assert!(Args::try_parse_from(["corral", "-N", "nothing"]).is_err());
        assert!(Args::try_parse_from(["corral", "-e", "NOVALUE"]).is_err());
        assert!(Args::try_parse_from(["corral", "-e", "=x"]).is_err());
    }

    #[test]
    fn test_attach_shell_implies_shell() {
        let config = parse(&["--attach-shell"]).sandbox_config(false, None).unwrap();
        assert!(config.shell());
    }
}
