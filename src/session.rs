//! Pipeline session lifecycle
//!
//! A [`PipelineSession`] owns at most one running pipeline process at a time,
//! together with the single feeder socket that pulls the process's multipart
//! output into a [`FrameDemuxer`].
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//! ```
//!
//! Every exit path (requested stop, process exit, feeder socket failure)
//! runs the same teardown routine, which cancels both background tasks and
//! waits for them before the session returns to `Idle`. The supervisor task
//! terminates the process on cancellation; the feeder task drops its socket.
//! Because each resource has exactly one owning task, nothing is closed or
//! signalled twice.
//!
//! Readers never block on pipeline I/O: the latest frame and the state are
//! published through watch channels and read as snapshots.

use futures::{Stream, StreamExt};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::PipelineConfig;
use crate::demux::FrameDemuxer;
use crate::launcher::{Launcher, PipelineProcess};
use crate::relay_log::RelayLog;
use crate::stream::ThrottleExt;
use crate::types::{Frame, UpdateRate};
use crate::{RelayError, Result};

/// Lifecycle state of the pipeline session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Why a session was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownReason {
    Requested,
    ProcessExited,
    FeederClosed,
    ConnectFailed,
}

impl fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TeardownReason::Requested => "stop requested",
            TeardownReason::ProcessExited => "process exited",
            TeardownReason::FeederClosed => "feeder socket closed",
            TeardownReason::ConnectFailed => "sink connection failed",
        };
        f.write_str(reason)
    }
}

/// Resources of the one live session
struct ActiveSession {
    generation: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct Slot {
    state: SessionState,
    generation: u64,
    active: Option<ActiveSession>,
}

struct Inner {
    config: PipelineConfig,
    launcher: Arc<dyn Launcher>,
    log: RelayLog,
    slot: Mutex<Slot>,
    /// Serialises start/stop/teardown; `start` only ever try-locks it
    lifecycle: tokio::sync::Mutex<()>,
    state: watch::Sender<SessionState>,
    frames: watch::Sender<Option<Frame>>,
}

/// Handle to the process-wide pipeline session
///
/// Clones share the same session; construct one per service and pass it to
/// every request handler.
#[derive(Clone)]
pub struct PipelineSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for PipelineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineSession")
            .field("state", &self.state())
            .field("sink", &self.inner.config.sink_addr())
            .finish()
    }
}

impl PipelineSession {
    /// Create an idle session
    pub fn new(config: PipelineConfig, launcher: Arc<dyn Launcher>, log: RelayLog) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (frames, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                log,
                slot: Mutex::new(Slot { state: SessionState::Idle, generation: 0, active: None }),
                lifecycle: tokio::sync::Mutex::new(()),
                state,
                frames,
            }),
        }
    }

    /// Start a pipeline for an operator-supplied description
    ///
    /// Returns once the process has been spawned; the feeder connects in the
    /// background and frames appear as soon as the sink produces them.
    ///
    /// # Errors
    ///
    /// - [`RelayError::InvalidArgument`] if `pipeline` is blank
    /// - [`RelayError::Conflict`] if a session is not idle (nothing changes)
    /// - [`RelayError::Spawn`] if the process could not be started; the
    ///   session is back to idle
    pub async fn start(&self, pipeline: &str) -> Result<()> {
        let pipeline = pipeline.trim();
        if pipeline.is_empty() {
            return Err(RelayError::invalid_argument("pipeline", "must not be empty"));
        }

        let Ok(_lifecycle) = self.inner.lifecycle.try_lock() else {
            return Err(RelayError::Conflict { state: self.state() });
        };

        let generation = {
            let mut slot = self.inner.lock();
            if slot.state != SessionState::Idle {
                return Err(RelayError::Conflict { state: slot.state });
            }
            slot.generation += 1;
            self.inner.transition(&mut slot, SessionState::Starting);
            slot.generation
        };

        // Abandoning `start` mid-launch must not leave the session Starting
        let mut guard = StartGuard { inner: &self.inner, generation, armed: true };

        // Fresh demuxer output for the new session
        self.inner.frames.send_replace(None);

        let command = self.inner.config.command_for(pipeline);
        info!(generation, %command, "Starting pipeline");
        self.inner.log.append(format!("starting: {command}"));

        let process = match self.inner.launcher.launch(&command, self.inner.log.clone()).await {
            Ok(process) => process,
            Err(e) => {
                error!(generation, "Pipeline spawn failed: {}", e);
                self.inner.log.append(format!("spawn failed: {e}"));
                let mut slot = self.inner.lock();
                self.inner.transition(&mut slot, SessionState::Idle);
                return Err(e);
            }
        };

        let pid = process.id();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(Arc::clone(&self.inner).supervise(generation, process, cancel.clone()));
        tracker.spawn(Arc::clone(&self.inner).feed(generation, cancel.clone()));
        tracker.close();

        let mut slot = self.inner.lock();
        slot.active = Some(ActiveSession { generation, pid, cancel, tracker });
        self.inner.transition(&mut slot, SessionState::Running);
        guard.armed = false;
        self.inner.log.append(format!("running (pid {})", display_pid(pid)));

        Ok(())
    }

    /// Stop the running pipeline, if any
    ///
    /// Waits until the process has exited (or been killed after the grace
    /// period) and the feeder socket is closed. Calling this while idle is a
    /// no-op. Teardown runs on its own task, so dropping this future early
    /// still brings the session back to idle.
    pub async fn stop(&self) {
        let inner = Arc::clone(&self.inner);
        let teardown =
            tokio::spawn(async move { inner.teardown(None, TeardownReason::Requested).await });
        if let Err(e) = teardown.await {
            error!("Pipeline teardown task failed: {}", e);
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// OS process id of the running pipeline
    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().active.as_ref().and_then(|active| active.pid)
    }

    /// Snapshot of the newest complete frame
    pub fn latest_frame(&self) -> Option<Frame> {
        self.inner.frames.borrow().clone()
    }

    /// Stream of new frames, optionally throttled with latest-wins semantics
    ///
    /// The stream yields the current frame (if any) first and never ends on
    /// its own; it survives session restarts.
    pub fn frames(&self, rate: UpdateRate) -> impl Stream<Item = Frame> + Send + Unpin + 'static {
        let frames =
            WatchStream::new(self.inner.frames.subscribe()).filter_map(|opt| async move { opt });

        match rate.interval() {
            None => frames.boxed(),
            Some(interval) => frames.throttle(interval).boxed(),
        }
    }

    /// Address of the pipeline's output sink
    pub fn sink_addr(&self) -> SocketAddr {
        self.inner.config.sink_addr()
    }

    /// Process and lifecycle log for this session
    pub fn log(&self) -> &RelayLog {
        &self.inner.log
    }
}

/// Returns a half-started session to idle when `start` is abandoned
struct StartGuard<'a> {
    inner: &'a Inner,
    generation: u64,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = self.inner.lock();
        if slot.generation == self.generation && slot.state == SessionState::Starting {
            warn!(generation = self.generation, "Pipeline start abandoned");
            self.inner.log.append("start abandoned");
            self.inner.transition(&mut slot, SessionState::Idle);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, slot: &mut Slot, next: SessionState) {
        if slot.state == next {
            return;
        }
        debug!(from = %slot.state, to = %next, generation = slot.generation, "Session transition");
        slot.state = next;
        self.state.send_replace(next);
    }

    /// The single teardown routine for every exit path
    ///
    /// `generation` limits teardown to a specific session so a late event
    /// from an old session cannot stop a newer one.
    async fn teardown(&self, generation: Option<u64>, reason: TeardownReason) {
        let _lifecycle = self.lifecycle.lock().await;

        let active = {
            let mut slot = self.lock();
            let current = slot.active.as_ref().map(|active| active.generation);
            if current.is_none() || generation.is_some_and(|g| Some(g) != current) {
                return;
            }
            let active = slot.active.take();
            self.transition(&mut slot, SessionState::Stopping);
            active
        };
        let Some(active) = active else {
            return;
        };

        info!(generation = active.generation, %reason, "Stopping pipeline");
        self.log.append(format!("stopping: {reason}"));

        active.cancel.cancel();
        active.tracker.wait().await;

        self.frames.send_replace(None);

        let mut slot = self.lock();
        self.transition(&mut slot, SessionState::Idle);
        self.log.append("idle");
        info!(generation = active.generation, "Pipeline stopped");
    }

    /// Owns the process: reports its exit, or terminates it on cancellation
    async fn supervise(
        self: Arc<Self>,
        generation: u64,
        mut process: Box<dyn PipelineProcess>,
        cancel: CancellationToken,
    ) {
        let exited = tokio::select! {
            // An already-dead process must not be signalled
            biased;
            status = process.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        match exited {
            Some(status) => {
                let code = describe_exit(&status);
                warn!(generation, code = %code, "Pipeline process exited");
                self.log.append(format!("process exited: {code}"));
                tokio::spawn(async move {
                    self.teardown(Some(generation), TeardownReason::ProcessExited).await;
                });
            }
            None => self.shut_down(generation, process).await,
        }
    }

    async fn shut_down(&self, generation: u64, mut process: Box<dyn PipelineProcess>) {
        if let Err(e) = process.terminate() {
            warn!(generation, "Failed to signal pipeline process: {}", e);
        }

        let grace = self.config.shutdown_grace();
        let status = match tokio::time::timeout(grace, process.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(generation, ?grace, "Pipeline ignored termination, killing");
                self.log.append(format!("no exit after {grace:?}, killing"));
                if let Err(e) = process.kill() {
                    error!(generation, "Failed to kill pipeline process: {}", e);
                }
                process.wait().await
            }
        };

        let code = describe_exit(&status);
        info!(generation, code = %code, "Pipeline process stopped");
        self.log.append(format!("process exited: {code}"));
    }

    /// Owns the feeder socket: connects to the sink and drives the demuxer
    async fn feed(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let addr = self.config.sink_addr();

        let connected = self.connect(addr, &cancel).await;
        let mut stream = match connected {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                error!(generation, %addr, "Giving up on pipeline sink: {}", e);
                self.log.append(format!("sink {addr} unreachable: {e}"));
                tokio::spawn(async move {
                    self.teardown(Some(generation), TeardownReason::ConnectFailed).await;
                });
                return;
            }
            None => return,
        };

        info!(generation, %addr, "Feeder connected to pipeline sink");
        self.log.append(format!("connected to {addr}"));

        let mut demuxer =
            FrameDemuxer::with_limit(&self.config.boundary, self.config.max_frame_bytes);
        let mut buf = vec![0u8; self.config.read_chunk_bytes];

        let failure = loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(generation, "Feeder cancelled");
                    return;
                }
                read = stream.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break "end of stream".to_string(),
                Ok(n) => {
                    if demuxer.append(&buf[..n]) > 0 {
                        let frame = demuxer.latest_frame();
                        if let Some(frame) = &frame {
                            trace!(generation, sequence = frame.sequence, len = frame.len());
                        }
                        self.frames.send_replace(frame);
                    }
                }
                Err(e) => break e.to_string(),
            }
        };

        drop(stream);
        warn!(generation, frames = demuxer.frames_extracted(), "Feeder socket closed: {}", failure);
        self.log.append(format!("feeder closed: {failure}"));
        tokio::spawn(async move {
            self.teardown(Some(generation), TeardownReason::FeederClosed).await;
        });
    }

    /// Connect to the sink, retrying until the deadline
    ///
    /// Returns `None` when cancelled.
    async fn connect(
        &self,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Option<std::io::Result<TcpStream>> {
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = TcpStream::connect(addr) => result,
            };

            match result {
                Ok(stream) => return Some(Ok(stream)),
                Err(e) if tokio::time::Instant::now() >= deadline => return Some(Err(e)),
                Err(e) => {
                    if attempts == 1 || attempts % 20 == 0 {
                        debug!(%addr, attempts, "Sink not ready yet: {}", e);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.config.connect_retry()) => {}
                    }
                }
            }
        }
    }
}

fn describe_exit(status: &std::io::Result<Option<i32>>) -> String {
    match status {
        Ok(Some(code)) => format!("code {code}"),
        Ok(None) => "terminated by signal".to_string(),
        Err(e) => format!("unknown ({e})"),
    }
}

fn display_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string())
}
