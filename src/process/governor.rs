//! Launch governor - rate-limited, retrying process spawner
//!
//! Every spawn passes a gate that keeps launch admissions at least
//! `min_launch_interval` apart across the whole context. After the gate, the
//! process is started up to `try_count` times. Each start is watched for a
//! settle window because a process can be created and still fail right away
//! (bad executable format, missing shared library, closed pipe).

use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use super::controller::{LaunchInfo, ProcessController};
use super::registry::ControllerRegistry;
use super::terminate::Terminator;
use super::transform::{passthrough, Transform, TransformStep};

pub const DEFAULT_TRY_COUNT: u32 = 10;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MIN_LAUNCH_INTERVAL: Duration = Duration::from_millis(1000);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// What to launch and how hard to try
pub struct SpawnRequest<T = String> {
    pub command: String,
    pub args: Vec<String>,
    pub transform: Transform<T>,
    pub try_count: u32,
    pub retry_interval: Duration,
    pub settle_interval: Duration,
}

impl SpawnRequest<String> {
    /// Request yielding raw stdout lines
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            transform: passthrough(),
            try_count: DEFAULT_TRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            settle_interval: DEFAULT_SETTLE_INTERVAL,
        }
    }
}

impl<T> SpawnRequest<T> {
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the line transform, changing the value type
    pub fn transform<U, F>(self, f: F) -> SpawnRequest<U>
    where
        F: Fn(&str) -> anyhow::Result<TransformStep<U>> + Send + Sync + 'static,
    {
        self.with_transform(Arc::new(f))
    }

    pub fn with_transform<U>(self, transform: Transform<U>) -> SpawnRequest<U> {
        SpawnRequest {
            command: self.command,
            args: self.args,
            transform,
            try_count: self.try_count,
            retry_interval: self.retry_interval,
            settle_interval: self.settle_interval,
        }
    }

    pub fn try_count(mut self, count: u32) -> Self {
        self.try_count = count;
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }
}

struct Gate {
    last_launch: Option<Instant>,
    min_interval: Duration,
}

/// Rate limiter and retry loop in front of process creation
pub struct LaunchGovernor {
    gate: Mutex<Gate>,
    registry: Arc<ControllerRegistry>,
    terminator: Arc<dyn Terminator>,
}

impl LaunchGovernor {
    pub fn new(
        min_launch_interval: Duration,
        registry: Arc<ControllerRegistry>,
        terminator: Arc<dyn Terminator>,
    ) -> Self {
        Self {
            gate: Mutex::new(Gate {
                last_launch: None,
                min_interval: min_launch_interval,
            }),
            registry,
            terminator,
        }
    }

    pub fn min_launch_interval(&self) -> Duration {
        self.gate().min_interval
    }

    /// Change the spacing for launches admitted from now on
    pub fn set_min_launch_interval(&self, interval: Duration) {
        self.gate().min_interval = interval;
    }

    /// Claim the next launch slot, sleeping until it opens.
    ///
    /// The slot is reserved before sleeping, so concurrent callers queue up
    /// one interval apart instead of racing for the same slot.
    pub async fn admit(&self) -> Instant {
        let (slot, must_wait) = {
            let mut gate = self.gate();
            let now = Instant::now();
            match gate.last_launch.map(|last| last + gate.min_interval) {
                Some(next) if now < next => {
                    gate.last_launch = Some(next);
                    (next, true)
                }
                _ => {
                    gate.last_launch = Some(now);
                    (now, false)
                }
            }
        };

        if must_wait {
            let delay = slot.saturating_duration_since(Instant::now());
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for launch slot");
            sleep_until(slot).await;
        }
        slot
    }

    /// Launch a process, retrying failed attempts.
    ///
    /// Returns `None` once every attempt has failed; that is the only failure
    /// a caller sees.
    pub async fn spawn<T: 'static>(&self, request: SpawnRequest<T>) -> Option<ProcessController<T>> {
        let launched_at = self.admit().await;
        self.run_attempts(request, |request| self.launch(request, launched_at))
            .await
    }

    /// Attempt loop shared by `spawn`; `launch` starts one attempt
    async fn run_attempts<T, F>(
        &self,
        request: SpawnRequest<T>,
        mut launch: F,
    ) -> Option<ProcessController<T>>
    where
        F: FnMut(&SpawnRequest<T>) -> std::io::Result<ProcessController<T>>,
    {
        let attempts = request.try_count.max(1);

        for attempt in 1..=attempts {
            match launch(&request) {
                Ok(controller) => {
                    let fault = tokio::select! {
                        _ = sleep(request.settle_interval) => None,
                        reason = controller.fault() => Some(reason),
                    };

                    match fault {
                        None => {
                            info!(
                                id = %controller.id(),
                                pid = ?controller.pid(),
                                command = %request.command,
                                attempt,
                                "Process launched"
                            );
                            return Some(controller);
                        }
                        Some(reason) => {
                            warn!(command = %request.command, attempt, %reason, "Process failed while settling");
                            controller.discard(&self.registry);
                        }
                    }
                }
                Err(e) => {
                    warn!(command = %request.command, attempt, error = %e, "Failed to start process");
                }
            }

            if attempt < attempts {
                sleep(request.retry_interval).await;
            }
        }

        warn!(command = %request.command, attempts, "Giving up on launching process");
        None
    }

    fn launch<T: 'static>(
        &self,
        request: &SpawnRequest<T>,
        launched_at: Instant,
    ) -> std::io::Result<ProcessController<T>> {
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let child = cmd.spawn()?;

        Ok(ProcessController::start(
            child,
            Arc::clone(&request.transform),
            LaunchInfo {
                command: request.command.clone(),
                args: request.args.clone(),
                launched_at,
            },
            &self.registry,
            Arc::clone(&self.terminator),
        ))
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
