//! Shared fixtures: a scripted child runtime and a recording remote.

#![allow(dead_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::watch;

use ysfn::{
    BridgeError, BuildError, InboundHandler, Registration, RemoteConnector, RemoteHandle,
    RunError, SfnRuntime, Shutdown, TaggedFrame, Termination,
};

pub type ChildScript =
    Arc<dyn Fn(PathBuf, Shutdown) -> BoxFuture<'static, Result<(), RunError>> + Send + Sync>;

/// Runtime whose "child" is an async closure running in-process.
pub struct ScriptedRuntime {
    dir: PathBuf,
    fail_build: bool,
    definition: Option<String>,
    child: ChildScript,
    pub runs: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new<F, Fut>(dir: &Path, child: F) -> Self
    where
        F: Fn(PathBuf, Shutdown) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RunError>> + Send + 'static,
    {
        Self {
            dir: dir.to_path_buf(),
            fail_build: false,
            definition: None,
            child: Arc::new(
                move |dir: PathBuf, shutdown: Shutdown| -> BoxFuture<'static, Result<(), RunError>> {
                    Box::pin(child(dir, shutdown))
                },
            ),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_build(mut self) -> Self {
        self.fail_build = true;
        self
    }

    pub fn with_definition(mut self, definition: &str) -> Self {
        self.definition = Some(definition.to_string());
        self
    }
}

#[async_trait]
impl SfnRuntime for ScriptedRuntime {
    fn work_dir(&self) -> &Path {
        &self.dir
    }

    async fn build(&self) -> Result<(), BuildError> {
        if self.fail_build {
            return Err(BuildError::Spawn {
                step: "tsc app.ts".into(),
                source: io::Error::new(io::ErrorKind::NotFound, "tsc not found"),
            });
        }
        Ok(())
    }

    async fn run(&self, shutdown: &Shutdown) -> Result<(), RunError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        (self.child)(self.dir.clone(), shutdown.clone()).await
    }

    async fn definition(&self) -> io::Result<Option<String>> {
        Ok(self.definition.clone())
    }
}

/// What the remote side saw during a run.
pub struct RemoteLog {
    pub creates: AtomicUsize,
    pub closes: AtomicUsize,
    pub registrations: Mutex<Vec<Registration>>,
    pub observed_tags: Mutex<Vec<u32>>,
    pub writes: Mutex<Vec<TaggedFrame>>,
    ended: watch::Sender<bool>,
}

impl RemoteLog {
    pub fn writes(&self) -> Vec<TaggedFrame> {
        self.writes.lock().unwrap().clone()
    }

    pub fn registered_names(&self) -> Vec<String> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }
}

pub struct MockConnector {
    events: Vec<TaggedFrame>,
    fail_connect: bool,
    pub log: Arc<RemoteLog>,
}

impl MockConnector {
    pub fn new(events: Vec<TaggedFrame>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            events,
            fail_connect: false,
            log: Arc::new(RemoteLog {
                creates: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                registrations: Mutex::new(Vec::new()),
                observed_tags: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                ended,
            }),
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// End the remote session; `wait` returns as soon as it is called.
    pub fn end_session(&self) {
        self.log.ended.send_replace(true);
    }
}

impl RemoteConnector for MockConnector {
    fn create(&self, registration: Registration) -> Arc<dyn RemoteHandle> {
        self.log.creates.fetch_add(1, Ordering::SeqCst);
        self.log.registrations.lock().unwrap().push(registration);
        Arc::new(MockRemote {
            log: Arc::clone(&self.log),
            events: self.events.clone(),
            fail_connect: self.fail_connect,
            handler: Mutex::new(None),
        })
    }
}

struct MockRemote {
    log: Arc<RemoteLog>,
    events: Vec<TaggedFrame>,
    fail_connect: bool,
    handler: Mutex<Option<InboundHandler>>,
}

#[async_trait]
impl RemoteHandle for MockRemote {
    fn set_observed_tags(&self, tags: &[u32]) {
        *self.log.observed_tags.lock().unwrap() = tags.to_vec();
    }

    fn set_handler(&self, handler: InboundHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.fail_connect {
            anyhow::bail!("dispatcher unreachable");
        }
        let handler = self.handler.lock().unwrap().clone();
        let tags = self.log.observed_tags.lock().unwrap().clone();
        if let Some(handler) = handler {
            let events: Vec<_> = self
                .events
                .iter()
                .filter(|e| tags.contains(&e.tag))
                .cloned()
                .collect();
            // Deliver from a foreign thread, like a real client would.
            std::thread::spawn(move || {
                for event in events {
                    handler(event);
                }
            });
        }
        Ok(())
    }

    async fn write(&self, frame: TaggedFrame) {
        self.log.writes.lock().unwrap().push(frame);
    }

    async fn close(&self) {
        self.log.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn wait(&self) {
        let mut ended = self.log.ended.subscribe();
        let _ = ended.wait_for(|e| *e).await;
    }
}

pub fn frame(tag: u32, payload: &'static str) -> TaggedFrame {
    TaggedFrame::new(tag, payload.as_bytes())
}

pub async fn connect(dir: &Path) -> UnixStream {
    UnixStream::connect(dir.join("sfn.sock")).await.unwrap()
}

/// Write a raw header message: `u32 len (LE)` + JSON body.
pub async fn send_header(stream: &mut UnixStream, tags: &[u32], definition: &str) {
    let body = serde_json::to_vec(&serde_json::json!({
        "tags": tags,
        "function_definition": definition,
    }))
    .unwrap();
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();
}

pub async fn run_bounded(
    supervisor: ysfn::Supervisor,
) -> Result<Termination, BridgeError> {
    tokio::time::timeout(Duration::from_secs(10), supervisor.run())
        .await
        .expect("bridge run did not finish")
}
