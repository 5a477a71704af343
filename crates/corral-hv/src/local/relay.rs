//! Console relay: owns a process's I/O and bridges it to one console at a time.

use super::process::ProcessIo;
use crate::driver::ConsoleReader;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::process::Child;
use tokio::sync::mpsc;

/// Read buffer size per stream.
const BUF_SIZE: usize = 8192;

enum Outcome {
    /// The console side closed; the process keeps running.
    Detached,
    /// Every output stream of the process reached EOF.
    Exited,
}

/// A process's I/O waiting to be served to consoles.
pub(crate) struct Relay {
    pub io: ProcessIo,
    pub rx: mpsc::Receiver<DuplexStream>,
    pub label: String,
}

impl Relay {
    /// Serve console attachments until the process output ends.
    ///
    /// Each received `DuplexStream` is bridged to the process until the
    /// console closes its write side (detach) or the process output ends.
    /// Output produced while nothing is attached stays buffered in the pipe.
    /// `guard` is held for the lifetime of the relay, which lets shell
    /// consoles kill their process when the relay finishes.
    pub(crate) async fn run(self, guard: Option<Child>) {
        let Self {
            mut io,
            mut rx,
            label,
        } = self;
        while let Some(console) = rx.recv().await {
            tracing::debug!(domain = %label, "Console attached");
            match bridge(&mut io, console).await {
                Outcome::Detached => {
                    tracing::debug!(domain = %label, "Console detached");
                }
                Outcome::Exited => {
                    tracing::debug!(domain = %label, "Process output closed");
                    break;
                }
            }
        }
        drop(guard);
    }
}

async fn bridge(io: &mut ProcessIo, console: DuplexStream) -> Outcome {
    let (mut console_rd, mut console_wr) = tokio::io::split(console);
    let mut in_buf = vec![0u8; BUF_SIZE];
    let mut out_buf = vec![0u8; BUF_SIZE];
    let mut err_buf = vec![0u8; BUF_SIZE];

    let ProcessIo {
        stdin,
        stdout,
        stderr,
    } = io;

    loop {
        if stdout.is_none() && stderr.is_none() {
            let _ = console_wr.shutdown().await;
            return Outcome::Exited;
        }

        tokio::select! {
            // Console first, so a detach is seen before output is written to it.
            biased;
            r = console_rd.read(&mut in_buf) => match r {
                Ok(n) if n > 0 => {
                    if let Some(w) = stdin.as_mut() {
                        let written = async {
                            w.write_all(&in_buf[..n]).await?;
                            w.flush().await
                        };
                        if let Err(e) = written.await {
                            tracing::debug!(error = %e, "Process stdin closed");
                            *stdin = None;
                        }
                    }
                }
                _ => return Outcome::Detached,
            },
            r = read_from(stdout, &mut out_buf), if stdout.is_some() => match r {
                Ok(n) if n > 0 => {
                    if console_wr.write_all(&out_buf[..n]).await.is_err() {
                        return Outcome::Detached;
                    }
                }
                // EIO on a pty master after the child exits counts as EOF.
                _ => *stdout = None,
            },
            r = read_from(stderr, &mut err_buf), if stderr.is_some() => match r {
                Ok(n) if n > 0 => {
                    if console_wr.write_all(&err_buf[..n]).await.is_err() {
                        return Outcome::Detached;
                    }
                }
                _ => *stderr = None,
            },
        }
    }
}

async fn read_from(reader: &mut Option<ConsoleReader>, buf: &mut [u8]) -> io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}
