//! Launcher that runs the pipeline as an OS child process

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, trace};

use crate::launcher::{Launcher, PipelineCommand, PipelineProcess};
use crate::relay_log::RelayLog;
use crate::{RelayError, Result};

/// Spawns pipelines with `tokio::process`
///
/// stdout and stderr are read line by line into the session's relay log.
/// The child is killed if its handle is dropped without an orderly shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Launcher for CommandLauncher {
    async fn launch(
        &self,
        command: &PipelineCommand,
        log: RelayLog,
    ) -> Result<Box<dyn PipelineProcess>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::spawn_failed(&command.program, e))?;

        info!(pid = child.id(), program = %command.program, "Pipeline process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, "stdout", log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, "stderr", log));
        }

        Ok(Box::new(ChildProcess { child }))
    }
}

/// Copy a pipe into the log until EOF
///
/// Pipes close when the process exits, so pumps end on their own.
async fn pump_lines<R>(pipe: R, stream: &'static str, log: RelayLog)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(stream, "{}", line);
                log.append(format!("[{stream}] {line}"));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream, "Pipe read failed: {}", e);
                break;
            }
        }
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait::async_trait]
impl PipelineProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        // id() is None once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;

        // SAFETY: kill(2) has no memory-safety preconditions. The pid belongs to
        // our unreaped child, so it cannot have been recycled.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 { Ok(()) } else { Err(std::io::Error::last_os_error()) }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> PipelineCommand {
        PipelineCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[tokio::test]
    async fn output_lines_reach_the_log() {
        let log = RelayLog::new(10);
        let mut process = CommandLauncher::new()
            .launch(&sh("echo hello; echo oops >&2; exit 3"), log.clone())
            .await
            .unwrap();

        assert_eq!(process.wait().await.unwrap(), Some(3));

        // Pumps finish shortly after the pipes close
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while log.len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let lines = log.recent(10);
        assert!(lines.contains(&"[stdout] hello".to_string()), "{lines:?}");
        assert!(lines.contains(&"[stderr] oops".to_string()), "{lines:?}");
    }

    #[tokio::test]
    async fn terminate_ends_the_process() {
        let mut process =
            CommandLauncher::new().launch(&sh("exec sleep 30"), RelayLog::new(1)).await.unwrap();
        assert!(process.id().is_some());

        process.terminate().unwrap();
        let code = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .expect("process should exit after SIGTERM")
            .unwrap();
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let command =
            PipelineCommand { program: "skyrelay-no-such-program".to_string(), args: vec![] };
        let err = CommandLauncher::new().launch(&command, RelayLog::new(1)).await.err().unwrap();
        assert!(matches!(err, RelayError::Spawn { .. }));
    }
}
