//! Raw mode for the local terminal while a console is attached.

use nix::sys::termios::{self, SetArg, Termios};
use std::io::{self, IsTerminal};
use std::os::fd::AsFd;

/// Puts stdin into raw mode; restores the saved settings on drop.
pub(crate) struct RawMode {
    original: Termios,
}

impl RawMode {
    /// Enable raw mode if stdin is a terminal. `None` otherwise.
    pub(crate) fn enable() -> io::Result<Option<Self>> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }
        let original = termios::tcgetattr(stdin.as_fd())?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSAFLUSH, &raw)?;
        tracing::trace!("Terminal switched to raw mode");
        Ok(Some(Self { original }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let stdin = io::stdin();
        if let Err(e) = termios::tcsetattr(stdin.as_fd(), SetArg::TCSAFLUSH, &self.original) {
            tracing::warn!(error = %e, "Failed to restore terminal settings");
        }
    }
}
