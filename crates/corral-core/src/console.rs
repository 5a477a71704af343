//! ConsoleChannel - local byte streams bridged to a sandbox console.

use crate::context::SandboxState;
use crate::error::{Result, SandboxError};
use crate::terminal::RawMode;
use corral_hv::{
    ConsoleReader, ConsoleStream, ConsoleTarget, ConsoleWriter, DomainHandle, HypervisorConnection,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Default escape character. Typing Ctrl+] on the local input closes the console.
pub const DEFAULT_ESCAPE: char = ']';

const BUFFER_SIZE: usize = 8 * 1024;
const NO_ESCAPE: u16 = u16::MAX;

/// How long a hangup waits for the backend to report the exit code.
const EXIT_WAIT: Duration = Duration::from_secs(5);

/// Control byte produced by Ctrl+`c`, or `None` if `c` has no control form.
///
/// ```
/// assert_eq!(corral_core::escape_byte(']'), Some(0x1d));
/// assert_eq!(corral_core::escape_byte('c'), Some(0x03));
/// assert_eq!(corral_core::escape_byte('1'), None);
/// ```
pub fn escape_byte(c: char) -> Option<u8> {
    let upper = c.to_ascii_uppercase();
    ('@'..='_').contains(&upper).then(|| upper as u8 ^ 0x40)
}

/// Why an attach cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side closed the stream (process exited, domain destroyed).
    RemoteHangup,
    /// [`ConsoleChannel::detach`] was called.
    Detached,
    /// The escape byte was read from local input.
    Escape,
    /// A read or write failed.
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteHangup => write!(f, "remote hangup"),
            Self::Detached => write!(f, "detached"),
            Self::Escape => write!(f, "escape"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// The closed event, delivered once per attach cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleClosed {
    /// Attach cycle this event ends, starting at 1.
    pub cycle: u64,
    /// Why the cycle ended.
    pub reason: CloseReason,
    /// Exit code of the sandboxed command, when the cycle ended because it
    /// exited and the backend reports it (`128 + signal` if killed).
    pub exit_code: Option<i32>,
}

type Observer = Arc<dyn Fn(&ConsoleClosed) + Send + Sync>;

/// Attach bookkeeping shared with the pump task.
struct Events {
    attached: AtomicBool,
    cycle: AtomicU64,
    closed: watch::Sender<Option<ConsoleClosed>>,
    observers: std::sync::Mutex<Vec<Observer>>,
}

impl Events {
    /// Deliver the closed event of `cycle`. Runs exactly once per cycle,
    /// after the streams of that cycle are dropped.
    fn finish(&self, cycle: u64, reason: CloseReason, exit_code: Option<i32>) {
        self.attached.store(false, Ordering::SeqCst);
        let event = ConsoleClosed {
            cycle,
            reason,
            exit_code,
        };
        tracing::debug!(cycle, reason = %event.reason, exit_code = ?exit_code, "Console closed");

        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(&event);
        }
        self.closed.send_replace(Some(event));
    }
}

struct Session {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct ChannelInner {
    connection: Arc<HypervisorConnection>,
    domain: DomainHandle,
    target: ConsoleTarget,
    tty: bool,
    context_state: watch::Receiver<SandboxState>,
    escape: AtomicU16,
    session: Mutex<Option<Session>>,
    events: Arc<Events>,
}

/// A console of a running sandbox.
///
/// Obtained from [`SandboxContext::console`](crate::SandboxContext::console)
/// or [`shell_console`](crate::SandboxContext::shell_console). Each
/// [`attach`](Self::attach) starts a cycle that forwards remote output to the
/// local output and local input to the remote side until the remote hangs
/// up, the escape byte is read, an I/O error occurs or
/// [`detach`](Self::detach) is called. Every cycle ends with exactly one
/// closed event, and nothing is written to the local output after it.
///
/// A detached channel can be attached again while its sandbox is running.
/// Cloning gives another handle to the same channel.
#[derive(Clone)]
pub struct ConsoleChannel {
    inner: Arc<ChannelInner>,
}

impl ConsoleChannel {
    pub(crate) fn new(
        connection: Arc<HypervisorConnection>,
        domain: DomainHandle,
        target: ConsoleTarget,
        tty: bool,
        context_state: watch::Receiver<SandboxState>,
    ) -> Self {
        let (closed, _) = watch::channel(None);
        let escape = escape_byte(DEFAULT_ESCAPE).map_or(NO_ESCAPE, u16::from);
        Self {
            inner: Arc::new(ChannelInner {
                connection,
                domain,
                target,
                tty,
                context_state,
                escape: AtomicU16::new(escape),
                session: Mutex::new(None),
                events: Arc::new(Events {
                    attached: AtomicBool::new(false),
                    cycle: AtomicU64::new(0),
                    closed,
                    observers: std::sync::Mutex::new(Vec::new()),
                }),
            }),
        }
    }

    /// Which console this channel is bound to.
    pub fn target(&self) -> ConsoleTarget {
        self.inner.target
    }

    /// The domain this channel is bound to.
    pub fn domain(&self) -> &DomainHandle {
        &self.inner.domain
    }

    /// Whether an attach cycle is in progress.
    pub fn is_attached(&self) -> bool {
        self.inner.events.attached.load(Ordering::SeqCst)
    }

    /// The escape byte scanned for on local input, if any.
    pub fn escape(&self) -> Option<u8> {
        match self.inner.escape.load(Ordering::SeqCst) {
            NO_ESCAPE => None,
            byte => u8::try_from(byte).ok(),
        }
    }

    /// Set the escape character (`Some(']')` for Ctrl+]) or disable it.
    ///
    /// Takes effect at the next attach.
    pub fn set_escape(&self, escape: Option<char>) -> Result<()> {
        let value = match escape {
            None => NO_ESCAPE,
            Some(c) => escape_byte(c).map(u16::from).ok_or_else(|| {
                SandboxError::InvalidConfig(format!("'{c}' has no control character"))
            })?,
        };
        self.inner.escape.store(value, Ordering::SeqCst);
        Ok(())
    }

    /// Register a callback for every closed event of this channel.
    ///
    /// Callbacks run on the console task and must not block.
    pub fn on_closed<F>(&self, f: F)
    where
        F: Fn(&ConsoleClosed) + Send + Sync + 'static,
    {
        self.inner
            .events
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(f));
    }

    /// Wait for the closed event of the latest attach cycle.
    ///
    /// Returns immediately if that cycle already ended, and `None` if the
    /// channel was never attached.
    pub async fn wait_closed(&self) -> Option<ConsoleClosed> {
        let events = &self.inner.events;
        let cycle = events.cycle.load(Ordering::SeqCst);
        if cycle == 0 {
            return None;
        }
        let mut rx = events.closed.subscribe();
        loop {
            let done = rx
                .borrow_and_update()
                .as_ref()
                .filter(|event| event.cycle >= cycle)
                .cloned();
            if done.is_some() {
                return done;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Forward remote output to `output` and `input` to the remote side.
    ///
    /// EOF on `input` stops forwarding input but keeps the cycle alive.
    pub async fn attach<R, W>(&self, input: R, output: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.start(Some(Box::new(input)), Box::new(output), None)
            .await
    }

    /// Forward remote output to `output` without any input.
    pub async fn attach_output<W>(&self, output: W) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.start(None, Box::new(output), None).await
    }

    /// Attach the process's own stdin and stdout.
    ///
    /// When the sandbox has a tty and stdin is a terminal, the terminal is in
    /// raw mode for the duration of the cycle.
    pub async fn attach_stdio(&self) -> Result<()> {
        // Restoring the terminal flushes pending input, so fail before touching it.
        self.check_attachable()?;
        let raw = if self.inner.tty {
            RawMode::enable()?
        } else {
            None
        };
        self.start(
            Some(Box::new(tokio::io::stdin())),
            Box::new(tokio::io::stdout()),
            raw,
        )
        .await
    }

    fn check_attachable(&self) -> Result<()> {
        let state = *self.inner.context_state.borrow();
        if state != SandboxState::Running {
            return Err(SandboxError::invalid_state("running", state));
        }
        if self.is_attached() {
            return Err(SandboxError::AlreadyAttached);
        }
        Ok(())
    }

    async fn start(
        &self,
        input: Option<ConsoleReader>,
        output: ConsoleWriter,
        raw: Option<RawMode>,
    ) -> Result<()> {
        let mut session = self.inner.session.lock().await;
        self.check_attachable()?;
        let events = &self.inner.events;
        // Reap the task of a cycle that ended on its own.
        if let Some(previous) = session.take() {
            let _ = previous.task.await;
        }

        let stream = self
            .inner
            .connection
            .open_console(&self.inner.domain, self.inner.target)
            .await
            .map_err(|e| SandboxError::Console(e.to_string()))?;

        let cycle = events.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        events.attached.store(true, Ordering::SeqCst);
        tracing::debug!(
            domain_id = %self.inner.domain.id(),
            console = %self.inner.target,
            cycle,
            "Console attached"
        );

        let (stop, mut stop_rx) = oneshot::channel();
        let escape = self.escape();
        let events = Arc::clone(events);
        let connection = Arc::clone(&self.inner.connection);
        let domain = self.inner.domain.clone();
        let primary = self.inner.target == ConsoleTarget::Primary;
        let task = tokio::spawn(async move {
            let reason = pump(stream, input, output, escape, &mut stop_rx).await;
            drop(raw);
            let exit_code = if primary && reason == CloseReason::RemoteHangup {
                wait_exit_code(&connection, &domain, &mut stop_rx).await
            } else {
                None
            };
            events.finish(cycle, reason, exit_code);
        });

        *session = Some(Session { stop, task });
        Ok(())
    }

    /// End the current attach cycle and wait for its closed event.
    ///
    /// A no-op when not attached; calling it twice is fine. A detach that
    /// runs concurrently with another one returns after the cycle ended.
    pub async fn detach(&self) -> Result<()> {
        // The lock is held until the task finished, so concurrent callers
        // queue behind it instead of returning early.
        let mut guard = self.inner.session.lock().await;
        let Some(session) = guard.take() else {
            return Ok(());
        };
        // The cycle may already have ended on its own.
        let _ = session.stop.send(());
        session
            .task
            .await
            .map_err(|e| SandboxError::Console(format!("console task failed: {e}")))
    }
}

impl fmt::Debug for ConsoleChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleChannel")
            .field("domain_id", &self.inner.domain.id())
            .field("target", &self.inner.target)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

/// Move bytes both ways until the cycle ends. All streams are dropped on return.
async fn pump(
    mut stream: ConsoleStream,
    mut input: Option<ConsoleReader>,
    mut output: ConsoleWriter,
    escape: Option<u8>,
    stop: &mut oneshot::Receiver<()>,
) -> CloseReason {
    let mut remote_buf = vec![0u8; BUFFER_SIZE];
    let mut local_buf = vec![0u8; BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = &mut *stop => return CloseReason::Detached,

            read = stream.reader.read(&mut remote_buf) => match read {
                Ok(0) => return CloseReason::RemoteHangup,
                Ok(n) => {
                    if let Err(reason) = forward(&mut output, &remote_buf[..n], stop, "local output").await {
                        return reason;
                    }
                }
                Err(e) => return CloseReason::Error(format!("console read: {e}")),
            },

            read = read_input(&mut input, &mut local_buf) => match read {
                Ok(0) => {
                    tracing::trace!("Local input closed");
                    input = None;
                }
                Ok(n) => {
                    let chunk = &local_buf[..n];
                    let escaped = escape.and_then(|byte| chunk.iter().position(|b| *b == byte));
                    let data = escaped.map_or(chunk, |pos| &chunk[..pos]);
                    if !data.is_empty() {
                        if let Err(reason) = forward(&mut stream.writer, data, stop, "console write").await {
                            return reason;
                        }
                    }
                    if escaped.is_some() {
                        return CloseReason::Escape;
                    }
                }
                Err(e) => return CloseReason::Error(format!("local input: {e}")),
            },
        }
    }
}

/// Exit code of the command after its console hung up.
///
/// Bounded, since output can end while the command keeps running, and
/// abandoned on detach.
async fn wait_exit_code(
    connection: &HypervisorConnection,
    domain: &DomainHandle,
    stop: &mut oneshot::Receiver<()>,
) -> Option<i32> {
    tokio::select! {
        biased;
        _ = stop => None,
        waited = tokio::time::timeout(EXIT_WAIT, connection.wait_exit(domain)) => match waited {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                tracing::debug!(domain_id = %domain.id(), error = %e, "Exit code unavailable");
                None
            }
            Err(_) => {
                tracing::debug!(domain_id = %domain.id(), "Console closed but the command is still running");
                None
            }
        },
    }
}

/// Read local input; pending forever once input is gone.
async fn read_input(input: &mut Option<ConsoleReader>, buf: &mut [u8]) -> std::io::Result<usize> {
    match input {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Write and flush `data`, giving up as soon as a detach is requested.
///
/// A stalled writer (a paused pager, a domain that stopped reading input)
/// must not keep `detach` waiting.
async fn forward(
    writer: &mut ConsoleWriter,
    data: &[u8],
    stop: &mut oneshot::Receiver<()>,
    what: &str,
) -> std::result::Result<(), CloseReason> {
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    tokio::select! {
        biased;
        _ = stop => Err(CloseReason::Detached),
        written = write => written.map_err(|e| CloseReason::Error(format!("{what}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_byte() {
        assert_eq!(escape_byte(']'), Some(0x1d));
        assert_eq!(escape_byte('a'), Some(0x01));
        assert_eq!(escape_byte('A'), Some(0x01));
        assert_eq!(escape_byte('@'), Some(0x00));
        assert_eq!(escape_byte('_'), Some(0x1f));
        assert_eq!(escape_byte('1'), None);
        assert_eq!(escape_byte('é'), None);
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::RemoteHangup.to_string(), "remote hangup");
        assert_eq!(CloseReason::Error("x".into()).to_string(), "error: x");
    }

    fn stream_pair() -> (ConsoleStream, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(1024);
        (ConsoleStream::from_duplex(local), remote)
    }

    #[tokio::test]
    async fn test_pump_stops_at_escape_without_forwarding_it() {
        let (stream, mut remote) = stream_pair();
        let (_stop, mut stop_rx) = oneshot::channel();
        let input: ConsoleReader = Box::new(&b"ls\x1dpwd"[..]);
        let output: ConsoleWriter = Box::new(tokio::io::sink());

        let reason = pump(stream, Some(input), output, Some(0x1d), &mut stop_rx).await;
        assert_eq!(reason, CloseReason::Escape);

        let mut seen = Vec::new();
        remote.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"ls");
    }

    #[tokio::test]
    async fn test_pump_remote_hangup() {
        let (stream, mut remote) = stream_pair();
        let (_stop, mut stop_rx) = oneshot::channel();
        let (out_local, mut out_remote) = tokio::io::duplex(1024);

        remote.write_all(b"bye").await.unwrap();
        drop(remote);

        let reason = pump(stream, None, Box::new(out_local), None, &mut stop_rx).await;
        assert_eq!(reason, CloseReason::RemoteHangup);

        let mut seen = Vec::new();
        out_remote.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"bye");
    }

    #[tokio::test]
    async fn test_pump_input_eof_keeps_cycle() {
        let (stream, _remote) = stream_pair();
        let (stop, mut stop_rx) = oneshot::channel();
        let input: ConsoleReader = Box::new(tokio::io::empty());

        let task = tokio::spawn(async move {
            pump(
                stream,
                Some(input),
                Box::new(tokio::io::sink()),
                None,
                &mut stop_rx,
            )
            .await
        });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        stop.send(()).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Detached);
    }
}
