//! Top-level orchestration of one bridge run.
//!
//! Build runs first and gates everything else. After that the child process
//! and the socket accept run as concurrent tasks, both reporting into one
//! result channel. The first report wins; the rest of the run is torn down.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::bridge::protocol::SessionId;
use crate::bridge::transport::SocketBridge;
use crate::config::{BridgeConfig, DefinitionSource};
use crate::error::BridgeError;
use crate::remote::RemoteConnector;
use crate::runtime::{SfnRuntime, Shutdown};
use crate::session::{RelaySession, SessionParams, SessionState, StateTracker, Termination};

type RunResult = Result<Termination, BridgeError>;

pub struct Supervisor {
    runtime: Arc<dyn SfnRuntime>,
    connector: Arc<dyn RemoteConnector>,
    config: BridgeConfig,
    state: Arc<StateTracker>,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn SfnRuntime>,
        connector: Arc<dyn RemoteConnector>,
        config: BridgeConfig,
    ) -> Self {
        let shutdown = Shutdown::new(config.shutdown_grace);
        Self {
            runtime,
            connector,
            config,
            state: Arc::new(StateTracker::new(SessionId::new())),
            shutdown,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.state.id()
    }

    /// Observe state transitions of this run.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Handle for stopping the run from outside (e.g. on Ctrl-C).
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Build, then run the child and the session until the first result.
    pub async fn run(self) -> RunResult {
        let span = tracing::info_span!("bridge", session = %self.state.id());
        let state = Arc::clone(&self.state);

        let result = self.run_inner().instrument(span.clone()).await;
        state.enter(SessionState::Terminated);

        match &result {
            Ok(termination) => tracing::info!(parent: &span, ?termination, "Bridge run finished"),
            Err(e) => {
                tracing::error!(parent: &span, phase = %e.phase(), error = %e, "Bridge run failed")
            }
        }
        result
    }

    async fn run_inner(self) -> RunResult {
        let Self {
            runtime,
            connector,
            config,
            state,
            shutdown,
        } = self;

        state.enter(SessionState::AwaitingProcess);
        tokio::select! {
            built = runtime.build() => built?,
            _ = shutdown.triggered() => return Ok(Termination::Shutdown),
        }

        let definition_override = match config.definition_source {
            DefinitionSource::InBand => None,
            DefinitionSource::WorkDir => Some(load_definition(runtime.as_ref()).await?),
        };

        let bridge = SocketBridge::create_listener(runtime.work_dir().join(&config.socket_file))?;
        tracing::info!(path = %bridge.path().display(), "Waiting for child runtime to connect");

        let (results_tx, mut results_rx) = mpsc::channel::<RunResult>(2);

        let child_exited = CancellationToken::new();
        let process = tokio::spawn(
            supervise_process(
                Arc::clone(&runtime),
                shutdown.clone(),
                child_exited.clone(),
                results_tx.clone(),
            )
            .in_current_span(),
        );

        state.enter(SessionState::AwaitingConnection);
        let params = SessionParams {
            function_name: config.function_name.clone(),
            dispatcher_addr: config.dispatcher_addr.clone(),
            credential: config.credential.clone(),
            definition_override,
        };
        let session = {
            let state = Arc::clone(&state);
            let token = shutdown.token();
            let accept_timeout = config.accept_timeout;
            async move {
                let result = serve(
                    bridge,
                    accept_timeout,
                    connector,
                    params,
                    state,
                    child_exited,
                    token,
                )
                .await;
                let _ = results_tx.send(result).await;
            }
            .in_current_span()
        };
        let session = tokio::spawn(session);

        let result = match results_rx.recv().await {
            Some(result) => result,
            None => Err(BridgeError::RelayIo(io::Error::other(
                "bridge tasks ended without reporting a result",
            ))),
        };

        shutdown.trigger();
        if let Err(e) = session.await {
            tracing::warn!(error = %e, "Session task panicked");
        }
        if let Err(e) = process.await {
            tracing::warn!(error = %e, "Process task panicked");
        }

        // Later reports are discarded; only the first one surfaces.
        while let Ok(late) = results_rx.try_recv() {
            if let Err(e) = late {
                tracing::debug!(error = %e, "Discarding error raised after termination");
            }
        }
        result
    }
}

async fn load_definition(runtime: &dyn SfnRuntime) -> Result<String, BridgeError> {
    match runtime.definition().await.map_err(BridgeError::Definition)? {
        Some(definition) => Ok(definition),
        None => Err(BridgeError::Definition(io::Error::new(
            io::ErrorKind::NotFound,
            "runtime provides no definition file",
        ))),
    }
}

/// Run the child to completion and report how it ended.
///
/// A clean exit is not reported here: it fires `child_exited` and the
/// session decides. A connection the child made before exiting is still
/// drained to EOF; with none, the run ends as `ChildExited`.
async fn supervise_process(
    runtime: Arc<dyn SfnRuntime>,
    shutdown: Shutdown,
    child_exited: CancellationToken,
    results: mpsc::Sender<RunResult>,
) {
    let result = match runtime.run(&shutdown).await {
        Ok(()) if shutdown.is_triggered() => Ok(Termination::Shutdown),
        Ok(()) => {
            tracing::debug!("Child exited cleanly");
            child_exited.cancel();
            return;
        }
        Err(e) => Err(BridgeError::Run(e)),
    };
    let _ = results.send(result).await;
}

/// Accept the child, handshake, then relay until termination.
async fn serve(
    bridge: SocketBridge,
    accept_timeout: Option<Duration>,
    connector: Arc<dyn RemoteConnector>,
    params: SessionParams,
    state: Arc<StateTracker>,
    child_exited: CancellationToken,
    shutdown: CancellationToken,
) -> RunResult {
    let accepted = tokio::select! {
        accepted = bridge.accept_once(accept_timeout, &child_exited) => accepted?,
        _ = shutdown.cancelled() => return Ok(Termination::Shutdown),
    };
    // Held until the session ends; dropping it removes the socket file.
    let Some((stream, _guard)) = accepted else {
        return Ok(Termination::ChildExited);
    };

    let session = tokio::select! {
        established = RelaySession::establish(stream, connector.as_ref(), params, state) => established?,
        _ = shutdown.cancelled() => return Ok(Termination::Shutdown),
    };

    session.relay(shutdown).await
}
