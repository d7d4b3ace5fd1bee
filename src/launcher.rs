//! Process launcher traits for the video pipeline

use std::fmt;

use crate::Result;
use crate::relay_log::RelayLog;

/// A fully rendered command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for PipelineCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Spawns pipeline processes
///
/// The session only ever talks to the process through this seam, so tests
/// can substitute a simulated pipeline for the real program.
#[async_trait::async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Start `command`
    ///
    /// Implementations forward the process's output lines into `log`.
    ///
    /// Returns:
    /// - `Ok(process)` - Process is running
    /// - `Err(e)` - Process could not be started
    async fn launch(&self, command: &PipelineCommand, log: RelayLog)
    -> Result<Box<dyn PipelineProcess>>;
}

/// Handle to a running pipeline process, owned exclusively by one session
#[async_trait::async_trait]
pub trait PipelineProcess: Send + 'static {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit and return its exit code
    ///
    /// `None` means the process was ended by a signal. Must be cancel safe:
    /// the session races it against shutdown requests.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force the process to exit
    fn kill(&mut self) -> std::io::Result<()>;
}
