//! Test doubles for the pipeline process and its TCP sink
//!
//! [`SimulatedLauncher`] stands in for the real pipeline program and
//! [`MultipartSink`] plays the role of the program's TCP server sink, so the
//! whole session lifecycle can be exercised without GStreamer installed.

#![cfg(any(test, feature = "benchmark"))]

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::demux::DEFAULT_BOUNDARY;
use crate::launcher::{Launcher, PipelineCommand, PipelineProcess};
use crate::relay_log::RelayLog;
use crate::{RelayError, Result};

/// Exit status slot: `None` while running, `Some(code)` once exited
type ExitSlot = Arc<watch::Sender<Option<Option<i32>>>>;

#[derive(Default)]
struct LauncherState {
    launches: AtomicUsize,
    terminates: AtomicUsize,
    kills: AtomicUsize,
    fail_spawn: AtomicBool,
    ignore_terminate: AtomicBool,
    launch_delay: Mutex<Duration>,
    commands: Mutex<Vec<PipelineCommand>>,
    current: Mutex<Option<ExitSlot>>,
}

/// Launcher whose processes live entirely in memory
#[derive(Clone, Default)]
pub struct SimulatedLauncher {
    state: Arc<LauncherState>,
}

impl SimulatedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent launches fail as if the program were missing
    pub fn fail_spawn(&self, fail: bool) {
        self.state.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Make processes ignore termination requests, so only a kill stops them
    pub fn ignore_terminate(&self, ignore: bool) {
        self.state.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    /// Make subsequent launches take `delay` before the process exists
    pub fn launch_delay(&self, delay: Duration) {
        *self.state.launch_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Simulate the most recently launched process exiting on its own
    pub fn exit(&self, code: i32) {
        let current = self.state.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = current.as_ref() {
            slot.send_replace(Some(Some(code)));
        }
    }

    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.state.terminates.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    /// Every command launched so far, oldest first
    pub fn commands(&self) -> Vec<PipelineCommand> {
        self.state.commands.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl Launcher for SimulatedLauncher {
    async fn launch(
        &self,
        command: &PipelineCommand,
        log: RelayLog,
    ) -> Result<Box<dyn PipelineProcess>> {
        if self.state.fail_spawn.load(Ordering::SeqCst) {
            return Err(RelayError::spawn_failed(
                command.program.clone(),
                std::io::Error::from(std::io::ErrorKind::NotFound),
            ));
        }

        let delay = *self.state.launch_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let launched = self.state.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.commands.lock().unwrap_or_else(PoisonError::into_inner).push(command.clone());

        let (exit, status) = watch::channel(None);
        let exit = Arc::new(exit);
        *self.state.current.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::clone(&exit));

        log.append(format!("[stdout] Setting pipeline to PLAYING ({launched})"));

        Ok(Box::new(SimulatedProcess {
            pid: 10_000 + launched as u32,
            exit,
            status,
            state: Arc::clone(&self.state),
        }))
    }
}

struct SimulatedProcess {
    pid: u32,
    exit: ExitSlot,
    status: watch::Receiver<Option<Option<i32>>>,
    state: Arc<LauncherState>,
}

#[async_trait::async_trait]
impl PipelineProcess for SimulatedProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = *self
            .status
            .wait_for(Option::is_some)
            .await
            .map_err(|_| std::io::Error::other("exit slot dropped"))?;
        Ok(status.flatten())
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.state.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.state.ignore_terminate.load(Ordering::SeqCst) {
            self.exit.send_if_modified(|status| {
                // Exiting twice would overwrite the first exit code
                if status.is_some() {
                    return false;
                }
                *status = Some(None);
                true
            });
        }
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.state.kills.fetch_add(1, Ordering::SeqCst);
        self.exit.send_if_modified(|status| {
            if status.is_some() {
                return false;
            }
            *status = Some(None);
            true
        });
        Ok(())
    }
}

/// Stand-in for the pipeline's TCP server sink
///
/// Every connected client receives every chunk passed to [`MultipartSink::send`].
pub struct MultipartSink {
    addr: SocketAddr,
    chunks: broadcast::Sender<Bytes>,
    accepted: Arc<watch::Sender<usize>>,
    closed: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
}

impl MultipartSink {
    /// Bind to an ephemeral loopback port and start accepting clients
    pub async fn bind() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (chunks, _) = broadcast::channel(256);
        let (accepted, _) = watch::channel(0usize);
        let (closed, _) = watch::channel(0usize);
        let (accepted, closed) = (Arc::new(accepted), Arc::new(closed));
        let cancel = CancellationToken::new();

        let sink = Self { addr, chunks, accepted, closed, cancel };
        sink.spawn_accept_loop(listener);
        Ok(sink)
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let chunks = self.chunks.clone();
        let accepted = Arc::clone(&self.accepted);
        let closed = Arc::clone(&self.closed);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let socket = tokio::select! {
                    _ = cancel.cancelled() => return,
                    accept = listener.accept() => match accept {
                        Ok((socket, _)) => socket,
                        Err(_) => return,
                    },
                };
                // Subscribe before the count is visible so no chunk is missed
                let rx = chunks.subscribe();
                accepted.send_modify(|n| *n += 1);
                tokio::spawn(serve_client(socket, rx, Arc::clone(&closed), cancel.clone()));
            }
        });
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A pipeline config pointing at this sink with test-friendly timings
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sink_port: self.addr.port(),
            connect_timeout_ms: 2_000,
            connect_retry_ms: 10,
            shutdown_grace_ms: 200,
            ..PipelineConfig::default()
        }
    }

    /// Write a chunk to every connected client
    pub fn send(&self, chunk: impl Into<Bytes>) {
        let _ = self.chunks.send(chunk.into());
    }

    /// Wait until at least `n` clients have connected in total
    pub async fn wait_for_clients(&self, n: usize) {
        let mut accepted = self.accepted.subscribe();
        let _ = accepted.wait_for(|count| *count >= n).await;
    }

    /// Wait until at least `n` clients have disconnected in total
    pub async fn wait_for_closed(&self, n: usize) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|count| *count >= n).await;
    }

    pub fn accepted(&self) -> usize {
        *self.accepted.borrow()
    }

    pub fn closed(&self) -> usize {
        *self.closed.borrow()
    }

    /// Stop accepting and close every client connection
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MultipartSink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_client(
    mut socket: TcpStream,
    mut chunks: broadcast::Receiver<Bytes>,
    closed: Arc<watch::Sender<usize>>,
    cancel: CancellationToken,
) {
    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = chunks.recv() => match chunk {
                Ok(chunk) => {
                    if socket.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            read = socket.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    closed.send_modify(|n| *n += 1);
}

/// One multipart part as written by the muxer, without the closing marker
pub fn multipart_part(body: &[u8]) -> Vec<u8> {
    let mut part = format!(
        "--{DEFAULT_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    part.extend_from_slice(body);
    part
}

/// The marker that completes the previous part
pub fn closing_marker() -> Vec<u8> {
    format!("--{DEFAULT_BOUNDARY}").into_bytes()
}
