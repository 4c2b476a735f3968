//! Error taxonomy for the bridge.
//!
//! Every concurrent task funnels into a single [`BridgeError`]; [`Phase`]
//! tells the operator which stage of the run failed.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Stage of a bridge run a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Build,
    Run,
    Accept,
    Handshake,
    Connect,
    Relay,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Run => "run",
            Phase::Accept => "accept",
            Phase::Handshake => "handshake",
            Phase::Connect => "connect",
            Phase::Relay => "relay",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build step (dependency install or compile) failed.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{step} could not be started: {source}")]
    Spawn {
        step: String,
        #[source]
        source: io::Error,
    },

    #[error("{step} exited with {status}{}", format_output(.output))]
    Failed {
        step: String,
        status: ExitStatus,
        /// Captured stdout+stderr of the failed step.
        output: String,
    },

    #[error("wrapper generation failed: {0}")]
    Generate(#[source] io::Error),
}

impl BuildError {
    pub fn step(&self) -> &str {
        match self {
            BuildError::Spawn { step, .. } | BuildError::Failed { step, .. } => step,
            BuildError::Generate(_) => "generate",
        }
    }
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{trimmed}")
    }
}

/// The child runtime process ended unexpectedly.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),

    #[error("child exited with code {0}")]
    Exited(i32),

    #[error("child terminated by signal {0}")]
    Signaled(i32),
}

impl RunError {
    /// Classify a non-success exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return RunError::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return RunError::Signaled(signal);
            }
        }
        RunError::Exited(-1)
    }
}

/// Fatal bridge error. The first one raised by any task ends the run.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to bind {}: {source}", .path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept child connection: {0}")]
    Accept(#[source] io::Error),

    #[error("child did not connect within {0:?}")]
    AcceptTimeout(Duration),

    #[error("malformed header: {0}")]
    Decode(String),

    #[error("invalid function definition: {0}")]
    InvalidDefinition(String),

    #[error("cannot load function definition: {0}")]
    Definition(#[source] io::Error),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("failed to connect to dispatcher: {0:#}")]
    Connect(#[source] anyhow::Error),

    #[error("relay i/o error: {0}")]
    RelayIo(#[source] io::Error),
}

impl BridgeError {
    pub fn phase(&self) -> Phase {
        match self {
            BridgeError::Build(_) => Phase::Build,
            BridgeError::Run(_) => Phase::Run,
            BridgeError::Bind { .. } | BridgeError::Accept(_) | BridgeError::AcceptTimeout(_) => {
                Phase::Accept
            }
            BridgeError::Decode(_)
            | BridgeError::InvalidDefinition(_)
            | BridgeError::Definition(_) => Phase::Handshake,
            BridgeError::Connect(_) => Phase::Connect,
            BridgeError::RelayIo(_) => Phase::Relay,
        }
    }

    /// Diagnostic line prefixed with the failing phase.
    pub fn diagnostic(&self) -> String {
        format!("{} failed: {}", self.phase(), self)
    }
}
