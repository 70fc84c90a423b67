//! Child-process helpers shared by the capture and transcoder adapters.

use std::ffi::OsStr;
use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` that never opens a console window and is
/// killed when its handle is dropped.
pub fn tokio_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// How a child process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process exited on its own within the grace period.
    Exited(Option<i32>),
    /// The grace period elapsed and the process was killed.
    Killed(Option<i32>),
}

impl StopOutcome {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) | Self::Killed(code) => *code,
        }
    }
}

/// Wait up to `grace` for `child` to exit, killing it once the grace period
/// elapses.
///
/// Callers close the child's stdin (or otherwise ask it to finish) before calling
/// this, so well-behaved processes get a chance to flush their output.
pub async fn stop_child(child: &mut Child, grace: Duration) -> io::Result<StopOutcome> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(StopOutcome::Exited(status?.code())),
        Err(_) => {
            child.kill().await?;
            let status: ExitStatus = child.wait().await?;
            Ok(StopOutcome::Killed(status.code()))
        }
    }
}
