//! Live view relay
//!
//! A tail is an independent connection to the pipeline's sink whose bytes are
//! forwarded untouched. There is no buffering or reframing, so a viewer that
//! joins mid-stream may first receive the end of a partial part.

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use tokio::net::TcpStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::session::PipelineSession;
use crate::{RelayError, Result};

/// Opens live tails onto the running pipeline
#[derive(Debug, Clone)]
pub struct StreamProxy {
    session: PipelineSession,
    active: Arc<AtomicUsize>,
}

impl StreamProxy {
    pub fn new(session: PipelineSession) -> Self {
        Self { session, active: Arc::new(AtomicUsize::new(0)) }
    }

    /// Open a new tail onto the pipeline's output
    ///
    /// The tail ends when the pipeline closes the connection (which stopping
    /// the session causes) and releases its socket as soon as it is dropped.
    ///
    /// # Errors
    ///
    /// - [`RelayError::NotRunning`] if no session is running
    /// - [`RelayError::Connection`] if the sink refused the connection
    pub async fn open_tail(&self) -> Result<Tail> {
        if !self.session.is_running() {
            return Err(RelayError::NotRunning);
        }

        let addr = self.session.sink_addr();
        let socket =
            TcpStream::connect(addr).await.map_err(|e| RelayError::connection_failed(addr, e))?;

        let open = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        info!(%addr, open, "Live tail opened");

        Ok(Tail {
            inner: ReaderStream::new(socket),
            _guard: TailGuard { active: Arc::clone(&self.active) },
        })
    }

    /// Number of tails currently open
    pub fn active_tails(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

struct TailGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for TailGuard {
    fn drop(&mut self) {
        let open = self.active.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(open, "Live tail closed");
    }
}

pin_project! {
    /// Raw byte stream from the pipeline sink
    ///
    /// Dropping the tail closes its socket.
    pub struct Tail {
        #[pin]
        inner: ReaderStream<TcpStream>,
        _guard: TailGuard,
    }
}

impl Stream for Tail {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl std::fmt::Debug for Tail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tail").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_log::RelayLog;
    use crate::test_utils::{MultipartSink, SimulatedLauncher};
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    async fn running_proxy() -> (StreamProxy, PipelineSession, MultipartSink) {
        let sink = MultipartSink::bind().await.unwrap();
        let session = PipelineSession::new(
            sink.pipeline_config(),
            Arc::new(SimulatedLauncher::new()),
            RelayLog::new(50),
        );
        session.start("videotestsrc").await.unwrap();
        timeout(WAIT, sink.wait_for_clients(1)).await.unwrap();
        (StreamProxy::new(session.clone()), session, sink)
    }

    async fn collect(tail: &mut Tail, len: usize) -> Vec<u8> {
        let mut received = Vec::new();
        while received.len() < len {
            let chunk = timeout(WAIT, tail.next()).await.unwrap().unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        received
    }

    #[tokio::test]
    async fn idle_session_has_nothing_to_tail() {
        let sink = MultipartSink::bind().await.unwrap();
        let session = PipelineSession::new(
            sink.pipeline_config(),
            Arc::new(SimulatedLauncher::new()),
            RelayLog::new(50),
        );
        let proxy = StreamProxy::new(session);

        let err = proxy.open_tail().await.unwrap_err();
        assert!(matches!(err, RelayError::NotRunning));
        assert_eq!(proxy.active_tails(), 0);
        assert_eq!(sink.accepted(), 0);
    }

    #[tokio::test]
    async fn tail_relays_bytes_verbatim() {
        let (proxy, session, sink) = running_proxy().await;

        let mut tail = proxy.open_tail().await.unwrap();
        timeout(WAIT, sink.wait_for_clients(2)).await.unwrap();

        // A partial part is forwarded as-is, no reframing
        let bytes =
            b"\xFF\xD8partial\r\n--ThisRandomString\r\nContent-Type: image/jpeg\r\n".to_vec();
        sink.send(bytes.clone());
        assert_eq!(collect(&mut tail, bytes.len()).await, bytes);

        session.stop().await;
    }

    #[tokio::test]
    async fn dropping_a_tail_releases_it() {
        let (proxy, session, sink) = running_proxy().await;

        let first = proxy.open_tail().await.unwrap();
        let second = proxy.open_tail().await.unwrap();
        assert_eq!(proxy.active_tails(), 2);

        drop(first);
        assert_eq!(proxy.active_tails(), 1);
        timeout(WAIT, sink.wait_for_closed(1)).await.unwrap();

        drop(second);
        assert_eq!(proxy.active_tails(), 0);
        timeout(WAIT, sink.wait_for_closed(2)).await.unwrap();

        // The feeder connection is unaffected
        assert!(session.is_running());
        session.stop().await;
    }

    #[tokio::test]
    async fn tail_ends_when_the_sink_closes() {
        let (proxy, session, sink) = running_proxy().await;
        let mut tail = proxy.open_tail().await.unwrap();
        timeout(WAIT, sink.wait_for_clients(2)).await.unwrap();

        sink.shutdown();

        let end = timeout(WAIT, async {
            loop {
                match tail.next().await {
                    Some(Ok(_)) => continue,
                    other => return other,
                }
            }
        })
        .await
        .unwrap();
        assert!(end.is_none() || matches!(end, Some(Err(_))));
        drop(tail);
        assert_eq!(proxy.active_tails(), 0);

        let mut states = session.subscribe_state();
        timeout(WAIT, states.wait_for(|s| *s == crate::SessionState::Idle)).await.unwrap().unwrap();
    }
}
