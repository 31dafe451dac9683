//! One running ffmpeg process and the byte stream it feeds.
//!
//! The stream is pull-based: stdout is read only when the consumer polls,
//! so a slow client stalls ffmpeg through the pipe instead of growing a
//! buffer. Whatever ends the session first (stdout EOF, stdout error,
//! process exit, or the consumer going away) closes it exactly once, and
//! closing always kills the process if it is still alive.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{oneshot, watch};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;
const STDERR_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// Closed, process not yet reaped.
    Closing,
    Closed,
}

/// What closed the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    StdoutEnd,
    StdoutError,
    ProcessExit,
    Cancelled,
}

#[derive(Debug, Clone)]
struct Lifecycle {
    state: SessionState,
    reason: Option<EndReason>,
    exit: Option<ExitStatus>,
}

struct Shared {
    id: u64,
    upstream: String,
    referer: Option<String>,
    lifecycle: watch::Sender<Lifecycle>,
    end_signals: AtomicUsize,
    bytes_out: AtomicU64,
    cancel: CancellationToken,
    stderr: Mutex<VecDeque<String>>,
    stderr_cap: usize,
}

impl Shared {
    /// Close guard. Only the first caller wins; later triggers are no-ops.
    fn close(&self, reason: EndReason) -> bool {
        let fired = self.lifecycle.send_if_modified(|lc| {
            if lc.state != SessionState::Open {
                return false;
            }
            lc.state = if lc.exit.is_some() {
                SessionState::Closed
            } else {
                SessionState::Closing
            };
            lc.reason = Some(reason);
            true
        });

        if fired {
            self.end_signals.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            info!(
                session = self.id,
                ?reason,
                bytes = self.bytes_out.load(Ordering::Relaxed),
                "Transcode session closed"
            );
        }
        fired
    }

    fn reaped(&self, status: ExitStatus) {
        self.lifecycle.send_modify(|lc| {
            lc.exit = Some(status);
            if lc.state == SessionState::Closing {
                lc.state = SessionState::Closed;
            }
        });
    }

    fn push_stderr(&self, line: String) {
        let mut ring = self.stderr.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.len() == self.stderr_cap {
            ring.pop_front();
        }
        if self.stderr_cap > 0 {
            ring.push_back(line);
        }
    }
}

/// Observer/controller for a session, usable after the stream is gone.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn upstream(&self) -> &str {
        &self.shared.upstream
    }

    pub fn referer(&self) -> Option<&str> {
        self.shared.referer.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.borrow().state
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.shared.lifecycle.borrow().reason
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.shared.lifecycle.borrow().exit
    }

    /// How many times the end of the stream was signalled. Never above one.
    pub fn end_signals(&self) -> usize {
        self.shared.end_signals.load(Ordering::SeqCst)
    }

    pub fn bytes_out(&self) -> u64 {
        self.shared.bytes_out.load(Ordering::Relaxed)
    }

    /// Most recent ffmpeg diagnostics, oldest first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.shared
            .stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stop the session as if the consumer had gone away.
    pub fn cancel(&self) -> bool {
        self.shared.close(EndReason::Cancelled)
    }

    /// Resolves once the session is closed and the process reaped.
    pub async fn closed(&self) {
        let mut rx = self.shared.lifecycle.subscribe();
        // Sender lives in `shared`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|lc| lc.state == SessionState::Closed).await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.shared.id)
            .field("upstream", &self.shared.upstream)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Transcoded MP4 bytes. Dropping it cancels the session.
pub struct TranscodeStream {
    stdout: ReaderStream<ChildStdout>,
    exited: oneshot::Receiver<()>,
    shared: Arc<Shared>,
}

impl TranscodeStream {
    pub(crate) fn start(
        id: u64,
        upstream: String,
        referer: Option<String>,
        mut child: Child,
        stderr_cap: usize,
    ) -> io::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("transcoder stdout not captured"))?;
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            id,
            upstream,
            referer,
            lifecycle: watch::Sender::new(Lifecycle {
                state: SessionState::Open,
                reason: None,
                exit: None,
            }),
            end_signals: AtomicUsize::new(0),
            bytes_out: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            stderr: Mutex::new(VecDeque::with_capacity(stderr_cap)),
            stderr_cap,
        });

        let stderr_task = stderr.map(|stderr| tokio::spawn(read_stderr(Arc::clone(&shared), stderr)));
        let (exit_tx, exited) = oneshot::channel();
        tokio::spawn(supervise(Arc::clone(&shared), child, stderr_task, exit_tx));

        Ok(Self {
            stdout: ReaderStream::with_capacity(stdout, READ_CHUNK),
            exited,
            shared,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Stream for TranscodeStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.shared.lifecycle.borrow().state != SessionState::Open {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.stdout).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.shared
                    .bytes_out
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!(session = this.shared.id, error = %e, "Transcoder stdout failed");
                this.shared.close(EndReason::StdoutError);
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                this.shared.close(EndReason::StdoutEnd);
                Poll::Ready(None)
            }
            // Nothing buffered: the process may have died without closing stdout.
            Poll::Pending => match Pin::new(&mut this.exited).poll(cx) {
                Poll::Ready(_) => {
                    this.shared.close(EndReason::ProcessExit);
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl fmt::Debug for TranscodeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeStream")
            .field("session", &self.shared.id)
            .field("state", &self.shared.lifecycle.borrow().state)
            .finish_non_exhaustive()
    }
}

impl Drop for TranscodeStream {
    fn drop(&mut self) {
        self.shared.close(EndReason::Cancelled);
    }
}

async fn read_stderr(shared: Arc<Shared>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => {
                warn!(session = shared.id, "ffmpeg: {line}");
                shared.push_stderr(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(session = shared.id, error = %e, "Transcoder stderr read failed");
                break;
            }
        }
    }
}

/// Waits for the process to exit or the session to close, killing the
/// process in the latter case, then records the exit status.
async fn supervise(
    shared: Arc<Shared>,
    mut child: Child,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    exit_tx: oneshot::Sender<()>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = shared.cancel.cancelled() => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                debug!(session = shared.id, error = %e, "Transcoder already gone");
            }
            child.wait().await
        }
    };

    if let Some(task) = stderr_task {
        if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
            debug!(session = shared.id, "Transcoder stderr still open after exit");
        }
    }

    match status {
        Ok(status) => {
            if !status.success() {
                debug!(session = shared.id, %status, "Transcoder exited");
            }
            shared.reaped(status);
        }
        Err(e) => {
            warn!(session = shared.id, error = %e, "Failed to reap transcoder");
            // Unknown status; still let observers see the session finish.
            shared.reaped(failed_status());
        }
    }
    let _ = exit_tx.send(());
}

#[cfg(unix)]
fn failed_status() -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    ExitStatus::from_raw(1 << 8)
}

#[cfg(windows)]
fn failed_status() -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    ExitStatus::from_raw(1)
}
