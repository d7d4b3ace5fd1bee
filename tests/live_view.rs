//! End-to-end video path: launcher -> loopback sink -> session frames and live tails

use futures::StreamExt;
use skyrelay::{
    GroundStation, Launcher, PipelineCommand, PipelineProcess, RelayConfig, RelayError, RelayLog,
    SessionState, UpdateRate,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);
const BOUNDARY: &str = "ThisRandomString";

/// Plays the pipeline program: serves numbered multipart parts on the sink
/// port until it is terminated.
struct LoopbackLauncher {
    listener: std::net::TcpListener,
    launches: AtomicUsize,
}

impl LoopbackLauncher {
    fn bind() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        Self { listener, launches: AtomicUsize::new(0) }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }
}

#[async_trait::async_trait]
impl Launcher for LoopbackLauncher {
    async fn launch(
        &self,
        command: &PipelineCommand,
        log: RelayLog,
    ) -> skyrelay::Result<Box<dyn PipelineProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let listener = TcpListener::from_std(self.listener.try_clone()?)?;
        log.append(format!("[stdout] loopback pipeline for {}", command.program));

        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, cancel.clone()));
        Ok(Box::new(LoopbackProcess { cancel }))
    }
}

async fn serve(listener: TcpListener, cancel: CancellationToken) {
    loop {
        let socket = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((socket, _)) => socket,
                Err(_) => return,
            },
        };
        tokio::spawn(write_parts(socket, cancel.clone()));
    }
}

async fn write_parts(mut socket: tokio::net::TcpStream, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    for n in 1u64.. {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let body = format!("frame-{n}");
        let part = format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n{body}\r\n",
            body.len()
        );
        if socket.write_all(part.as_bytes()).await.is_err() {
            return;
        }
    }
}

struct LoopbackProcess {
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl PipelineProcess for LoopbackProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        self.cancel.cancelled().await;
        Ok(None)
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.cancel.cancel();
        Ok(())
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

fn station() -> (GroundStation, Arc<LoopbackLauncher>) {
    let _ = tracing_subscriber::fmt::try_init();

    let launcher = Arc::new(LoopbackLauncher::bind());
    let yaml = format!(
        "pipeline:\n  sink_port: {}\n  connect_retry_ms: 10\n  shutdown_grace_ms: 500\n",
        launcher.port()
    );
    let config = RelayConfig::from_yaml(&yaml).unwrap();
    (GroundStation::new(config, launcher.clone()), launcher)
}

async fn next_frame_body(
    frames: &mut (impl futures::Stream<Item = skyrelay::Frame> + Unpin),
) -> String {
    let frame = tokio::time::timeout(WAIT, frames.next()).await.unwrap().unwrap();
    String::from_utf8(frame.as_bytes().to_vec()).unwrap()
}

#[tokio::test]
async fn frames_arrive_while_running() {
    let (station, _launcher) = station();
    let session = station.session();

    session.start("videotestsrc is-live=true").await.unwrap();
    let mut frames = Box::pin(session.frames(UpdateRate::Native));

    let body = next_frame_body(&mut frames).await;
    assert!(body.starts_with("frame-"), "unexpected frame {body:?}");
    assert!(body.ends_with("\r\n"));

    let first = session.latest_frame().unwrap().sequence;
    tokio::time::timeout(WAIT, async {
        while session.latest_frame().is_none_or(|f| f.sequence <= first) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    station.shutdown().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert!(session.latest_frame().is_none());

    let log = station.pipeline_log().recent(usize::MAX);
    assert!(log.iter().any(|line| line.starts_with("starting: gst-launch-1.0 -e videotestsrc")));
    assert!(log.iter().any(|line| line.contains("[stdout] loopback pipeline")));
    assert_eq!(log.last().map(String::as_str), Some("idle"));
}

#[tokio::test]
async fn tails_see_the_raw_multipart_stream() {
    let (station, _launcher) = station();
    station.session().start("videotestsrc").await.unwrap();

    let mut tail = station.proxy().open_tail().await.unwrap();
    assert_eq!(station.proxy().active_tails(), 1);

    let mut received = Vec::new();
    tokio::time::timeout(WAIT, async {
        while !String::from_utf8_lossy(&received).contains("Content-Type: image/jpeg") {
            let chunk = tail.next().await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
    })
    .await
    .unwrap();
    assert!(String::from_utf8_lossy(&received).contains(&format!("--{BOUNDARY}")));

    station.shutdown().await;

    // Stopping the pipeline closes the sink, which ends the tail
    let end = tokio::time::timeout(WAIT, async {
        loop {
            match tail.next().await {
                Some(Ok(_)) => continue,
                other => return other,
            }
        }
    })
    .await
    .unwrap();
    assert!(!matches!(end, Some(Ok(_))));

    drop(tail);
    assert_eq!(station.proxy().active_tails(), 0);
}

#[tokio::test]
async fn tails_require_a_running_pipeline() {
    let (station, _launcher) = station();

    let err = station.proxy().open_tail().await.unwrap_err();
    assert!(matches!(err, RelayError::NotRunning));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn restart_begins_a_fresh_sequence() {
    let (station, launcher) = station();
    let session = station.session();

    for round in 1..=2 {
        session.start("videotestsrc").await.unwrap();
        let mut frames = Box::pin(session.frames(UpdateRate::Max(50)));
        next_frame_body(&mut frames).await;
        assert!(session.latest_frame().unwrap().sequence >= 1);

        let err = session.start("videotestsrc").await.unwrap_err();
        assert!(matches!(err, RelayError::Conflict { .. }));

        session.stop().await;
        assert_eq!(launcher.launches.load(Ordering::SeqCst), round);
    }
}
