//! Child runtimes that host the stream function body.
//!
//! The bridge only talks to [`SfnRuntime`]; each target language provides a
//! variant (Node.js, or an arbitrary command line).

mod command;
mod nodejs;
mod template;

use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::{BuildError, RunError};

pub use command::CommandRuntime;
pub use nodejs::{NodejsRuntime, PackageManager};
pub use template::{WrapperTemplate, WrapperVars};

/// Capability set every child runtime exposes.
#[async_trait]
pub trait SfnRuntime: Send + Sync + 'static {
    /// Base directory for relative lookups (socket, artifacts).
    fn work_dir(&self) -> &Path;

    /// Install dependencies, then compile the entry point.
    async fn build(&self) -> Result<(), BuildError>;

    /// Run the built artifact until it exits or `shutdown` fires.
    ///
    /// A child stopped by `shutdown` is not an error. Dropping the returned
    /// future must terminate the child.
    async fn run(&self, shutdown: &Shutdown) -> Result<(), RunError>;

    /// Function definition document stored in the working directory, if the
    /// runtime has one.
    async fn definition(&self) -> io::Result<Option<String>> {
        Ok(None)
    }
}

/// Request for a running child to stop: SIGTERM, then a kill once the grace
/// period runs out.
#[derive(Debug, Clone)]
pub struct Shutdown {
    token: CancellationToken,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Token that fires together with this shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// One external command executed as a build step.
#[derive(Debug, Clone)]
pub(crate) struct Step {
    program: OsString,
    args: Vec<OsString>,
}

impl Step {
    pub(crate) fn new<I, S>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Human-readable command line for diagnostics.
    pub(crate) fn display(&self) -> String {
        let mut line = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn command(&self, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(dir);
        cmd
    }

    /// Run to completion with output captured; non-zero exit is a build error.
    pub(crate) async fn build(&self, dir: &Path) -> Result<(), BuildError> {
        let step = self.display();
        tracing::info!(step = %step, dir = %dir.display(), "Running build step");

        let output = self
            .command(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BuildError::Spawn {
                step: step.clone(),
                source,
            })?;

        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(BuildError::Failed {
                step,
                status: output.status,
                output: captured,
            });
        }

        for line in captured.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(target: "ysfn::build", step = %step, "{}", line);
        }
        Ok(())
    }

    /// Run as the long-lived child with inherited stdio.
    pub(crate) async fn run(&self, dir: &Path, shutdown: &Shutdown) -> Result<(), RunError> {
        let program = self.display();
        let mut child = self
            .command(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program.clone(),
                source,
            })?;

        tracing::info!(program = %program, pid = ?child.id(), "Child runtime started");
        let status = tokio::select! {
            status = child.wait() => status.map_err(RunError::Wait)?,
            _ = shutdown.triggered() => {
                terminate(&mut child, shutdown.grace()).await;
                return Ok(());
            }
        };
        tracing::info!(program = %program, %status, "Child runtime exited");

        if status.success() {
            Ok(())
        } else {
            Err(RunError::from_status(status))
        }
    }
}

/// SIGTERM the child, then kill it if it outlives `grace`.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        tracing::debug!(pid, "Sending SIGTERM to child");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "Failed to signal child");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => tracing::info!(%status, "Child runtime stopped"),
        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to wait for child"),
        Err(_) => {
            tracing::warn!(?grace, "Child ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to kill child");
            }
        }
    }
}

/// Run build steps in order, stopping at the first failure.
pub(crate) async fn build_steps(steps: &[Step], dir: &Path) -> Result<(), BuildError> {
    for step in steps {
        step.build(dir).await?;
    }
    Ok(())
}
