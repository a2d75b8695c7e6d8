//! Process controller - owns one spawned process, its output and its exit state

use chrono::{DateTime, Utc};
use futures::stream::{FusedStream, Stream};
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::registry::{ControllerInfo, ControllerRegistry};
use super::terminate::{TermSignal, Terminator};
use super::transform::{decode_chunk, Transform, TransformStep};
use crate::error::ProcessError;

/// One line of raw stdout, terminator included
type Chunk = Vec<u8>;
type OutputQueue = mpsc::UnboundedReceiver<Chunk>;

/// How the process ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitState {
    /// OS exit code, `None` when killed by a signal or when the exit could not be observed
    pub code: Option<i32>,
    /// Name of the terminating signal, e.g. `"SIGTERM"`
    pub signal: Option<String>,
}

impl ExitState {
    fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: signal_name(&status),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    let raw = status.signal()?;
    Some(
        Signal::try_from(raw)
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|_| format!("SIG{raw}")),
    )
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

/// Details recorded by the governor when it admitted a launch
pub(crate) struct LaunchInfo {
    pub command: String,
    pub args: Vec<String>,
    pub launched_at: Instant,
}

struct Shared {
    id: String,
    pid: Option<u32>,
    command: String,
    args: Vec<String>,
    started_at: DateTime<Utc>,
    launched_at: Instant,
    running: AtomicBool,
    killed: AtomicBool,
    output: Mutex<Option<OutputQueue>>,
    exit: watch::Receiver<Option<ExitState>>,
    fault: watch::Sender<Option<String>>,
    terminator: Arc<dyn Terminator>,
}

impl Shared {
    /// Record the first fault; later ones are dropped
    fn report_fault(&self, reason: String) {
        self.fault.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn output(&self) -> MutexGuard<'_, Option<OutputQueue>> {
        self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to a spawned process. Clones share the same process.
///
/// Values of type `T` are produced from stdout lines by the controller's
/// transform; without one, `T` is the raw line as a `String`.
pub struct ProcessController<T = String> {
    shared: Arc<Shared>,
    transform: Transform<T>,
}

impl<T> Clone for ProcessController<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            transform: Arc::clone(&self.transform),
        }
    }
}

impl<T> std::fmt::Debug for ProcessController<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("id", &self.shared.id)
            .field("pid", &self.shared.pid)
            .field("command", &self.shared.command)
            .field("running", &self.is_running())
            .finish()
    }
}

impl<T: 'static> ProcessController<T> {
    /// Take ownership of a started child, register it and begin capturing output
    pub(crate) fn start(
        mut child: Child,
        transform: Transform<T>,
        launch: LaunchInfo,
        registry: &Arc<ControllerRegistry>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        let stdout = child.stdout.take();
        Self::start_with_output(child, stdout, transform, launch, registry, terminator)
    }

    /// Like `start`, reading output from `output` instead of the child's stdout
    pub(crate) fn start_with_output<R>(
        child: Child,
        output: Option<R>,
        transform: Transform<T>,
        launch: LaunchInfo,
        registry: &Arc<ControllerRegistry>,
        terminator: Arc<dyn Terminator>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (fault_tx, _) = watch::channel(None);

        let shared = Arc::new(Shared {
            id: Uuid::new_v4().to_string(),
            pid: child.id(),
            command: launch.command,
            args: launch.args,
            started_at: Utc::now(),
            launched_at: launch.launched_at,
            running: AtomicBool::new(true),
            killed: AtomicBool::new(false),
            output: Mutex::new(Some(chunk_rx)),
            exit: exit_rx,
            fault: fault_tx,
            terminator,
        });

        let controller = Self { shared, transform };
        registry.register(&controller);
        debug!(
            id = %controller.shared.id,
            pid = ?controller.shared.pid,
            command = %controller.shared.command,
            "Controller registered"
        );

        match output {
            Some(output) => {
                tokio::spawn(read_output(output, chunk_tx, Arc::clone(&controller.shared)));
            }
            None => controller
                .shared
                .report_fault("stdout was not captured".to_string()),
        }

        tokio::spawn(observe_exit(
            child,
            exit_tx,
            Arc::clone(&controller.shared),
            Arc::clone(registry),
        ));

        controller
    }
}

impl<T> ProcessController<T> {
    /// Unique identifier, usable with `ProcessContext::from_id`
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.pid
    }

    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn args(&self) -> &[String] {
        &self.shared.args
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.shared.started_at
    }

    /// When the launch governor admitted this process
    pub fn launched_at(&self) -> Instant {
        self.shared.launched_at
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }

    /// Exit state, or `None` while the process is still alive
    pub fn exit_state(&self) -> Option<ExitState> {
        (*self.shared.exit.borrow()).clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_state().and_then(|s| s.code)
    }

    pub fn exit_signal(&self) -> Option<String> {
        self.exit_state().and_then(|s| s.signal)
    }

    pub fn info(&self) -> ControllerInfo {
        ControllerInfo {
            id: self.shared.id.clone(),
            pid: self.shared.pid,
            command: self.shared.command.clone(),
            args: self.shared.args.clone(),
            started_at: self.shared.started_at,
        }
    }

    /// Stream transformed output values.
    ///
    /// Lines that arrived before this call come first, then live lines. The
    /// stream ends when stdout closes or the transform asks to stop. Dropping
    /// it leaves the process running and hands unread lines back, so a later
    /// call resumes where this one stopped.
    ///
    /// Lines nobody reads are kept until the controller is dropped, so a
    /// long-running process that is never listened to grows without bound.
    pub fn listen(&self) -> Listen<T> {
        let queue = self.shared.output().take();
        if queue.is_none() {
            debug!(id = %self.shared.id, "Output is held by another listener");
        }

        Listen {
            queue,
            shared: Arc::clone(&self.shared),
            transform: Arc::clone(&self.transform),
            done: false,
        }
    }

    /// Wait for the process to exit. Returns at once if it already has.
    pub async fn wait(&self) -> ExitState {
        let mut exit = self.shared.exit.clone();
        let observed = exit
            .wait_for(|state| state.is_some())
            .await
            .map(|state| (*state).clone());

        match observed {
            Ok(Some(state)) => state,
            // Exit observer is gone without publishing
            _ => self.exit_state().unwrap_or_default(),
        }
    }

    /// Ask the process to terminate with SIGTERM
    pub fn kill(&self) {
        self.kill_with(TermSignal::Terminate);
    }

    /// Deliver `signal`. Does nothing once the process has exited or a kill
    /// was already delivered; watch `wait` for the actual exit.
    pub fn kill_with(&self, signal: TermSignal) {
        if !self.is_running() {
            debug!(id = %self.shared.id, "Kill ignored, process not running");
            return;
        }
        if self.shared.killed.swap(true, Ordering::SeqCst) {
            debug!(id = %self.shared.id, "Kill ignored, already killed");
            return;
        }
        let Some(pid) = self.shared.pid else {
            return;
        };

        if let Err(e) = self.shared.terminator.terminate(pid, signal) {
            warn!(id = %self.shared.id, pid, error = %e, "Failed to deliver signal");
            self.shared.killed.store(false, Ordering::SeqCst);
        }
    }

    /// Resolve with the first early-failure reason seen for this process
    pub(crate) async fn fault(&self) -> String {
        let mut fault = self.shared.fault.subscribe();
        let observed = fault
            .wait_for(|reason| reason.is_some())
            .await
            .map(|reason| (*reason).clone());

        match observed {
            Ok(Some(reason)) => reason,
            _ => std::future::pending().await,
        }
    }

    /// Drop a controller from a failed launch attempt
    ///
    /// The process is force-killed unless its exit was already observed. A
    /// read fault clears `running` without the process being gone, so this
    /// bypasses the guards in `kill_with`.
    pub(crate) fn discard(&self, registry: &ControllerRegistry) {
        registry.unregister(&self.shared.id);
        if self.exit_state().is_some() {
            return;
        }
        let Some(pid) = self.shared.pid else {
            return;
        };

        self.shared.killed.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.terminator.terminate(pid, TermSignal::Kill) {
            warn!(id = %self.shared.id, pid, error = %e, "Failed to kill discarded process");
        }
    }
}

async fn read_output<R>(output: R, tx: mpsc::UnboundedSender<Chunk>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(output);
    loop {
        let mut chunk = Vec::new();
        match reader.read_until(b'\n', &mut chunk).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(chunk).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(id = %shared.id, error = %e, "Output stream failed");
                shared.running.store(false, Ordering::SeqCst);
                shared.report_fault(e.to_string());
                break;
            }
        }
    }
    debug!(id = %shared.id, "Output stream closed");
}

async fn observe_exit(
    mut child: Child,
    exit_tx: watch::Sender<Option<ExitState>>,
    shared: Arc<Shared>,
    registry: Arc<ControllerRegistry>,
) {
    let state = match child.wait().await {
        Ok(status) => ExitState::from_status(status),
        Err(e) => {
            warn!(id = %shared.id, error = %e, "Failed to observe process exit");
            shared.report_fault(e.to_string());
            ExitState::default()
        }
    };

    shared.running.store(false, Ordering::SeqCst);
    registry.unregister(&shared.id);
    debug!(id = %shared.id, code = ?state.code, signal = ?state.signal, "Process exited");

    // Published after unregistering: anyone woken by `wait` can no longer find us
    exit_tx.send_replace(Some(state));
}

/// Output stream returned by `ProcessController::listen`
pub struct Listen<T> {
    queue: Option<OutputQueue>,
    shared: Arc<Shared>,
    transform: Transform<T>,
    done: bool,
}

impl<T> Stream for Listen<T> {
    type Item = Result<T, ProcessError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let Some(queue) = this.queue.as_mut() else {
            this.done = true;
            return Poll::Ready(None);
        };

        loop {
            let chunk = match queue.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => chunk,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            };

            match (this.transform)(&decode_chunk(&chunk)) {
                Ok(TransformStep::Emit(value)) => return Poll::Ready(Some(Ok(value))),
                Ok(TransformStep::Skip) => continue,
                Ok(TransformStep::Stop) => {
                    debug!(id = %this.shared.id, "Transform stopped the stream");
                    this.done = true;
                    return Poll::Ready(None);
                }
                Err(e) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(ProcessError::Transform(e))));
                }
            }
        }
    }
}

impl<T> FusedStream for Listen<T> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl<T> Drop for Listen<T> {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            let mut slot = self.shared.output();
            if slot.is_none() {
                *slot = Some(queue);
            }
        }
    }
}
