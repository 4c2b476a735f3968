//! Development stand-in for the dispatcher client.
//!
//! Logs every frame the child writes and replays a fixed list of events on
//! an interval, cycling until closed or interrupted. Events whose tag the
//! function does not observe are skipped, as a dispatcher would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{InboundHandler, Registration, RemoteConnector, RemoteHandle};
use crate::bridge::protocol::TaggedFrame;

/// Longest payload prefix echoed into the logs.
const LOG_PAYLOAD_LIMIT: usize = 256;

pub struct DevRemoteConnector {
    events: Vec<TaggedFrame>,
    interval: Duration,
}

impl DevRemoteConnector {
    pub fn new(events: Vec<TaggedFrame>) -> Self {
        Self {
            events,
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl RemoteConnector for DevRemoteConnector {
    fn create(&self, registration: Registration) -> Arc<dyn RemoteHandle> {
        Arc::new(DevRemote::new(
            registration,
            self.events.clone(),
            self.interval,
        ))
    }
}

pub struct DevRemote {
    registration: Registration,
    events: Vec<TaggedFrame>,
    interval: Duration,
    tags: Mutex<Vec<u32>>,
    handler: Mutex<Option<InboundHandler>>,
    closed: watch::Sender<bool>,
}

impl DevRemote {
    pub fn new(registration: Registration, events: Vec<TaggedFrame>, interval: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            registration,
            events,
            interval,
            tags: Mutex::new(Vec::new()),
            handler: Mutex::new(None),
            closed,
        }
    }

    fn observed_events(&self) -> Vec<TaggedFrame> {
        let tags = match self.tags.lock() {
            Ok(tags) => tags.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        self.events
            .iter()
            .filter(|e| {
                let observed = tags.contains(&e.tag);
                if !observed {
                    tracing::debug!(tag = e.tag, "Skipping event for unobserved tag");
                }
                observed
            })
            .cloned()
            .collect()
    }

    fn handler(&self) -> Option<InboundHandler> {
        match self.handler.lock() {
            Ok(h) => h.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(LOG_PAYLOAD_LIMIT);
    let mut text = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > end {
        text.push('…');
    }
    text
}

#[async_trait]
impl RemoteHandle for DevRemote {
    fn set_observed_tags(&self, tags: &[u32]) {
        match self.tags.lock() {
            Ok(mut guard) => *guard = tags.to_vec(),
            Err(poisoned) => *poisoned.into_inner() = tags.to_vec(),
        }
    }

    fn set_handler(&self, handler: InboundHandler) {
        match self.handler.lock() {
            Ok(mut guard) => *guard = Some(handler),
            Err(poisoned) => *poisoned.into_inner() = Some(handler),
        }
    }

    async fn connect(&self) -> anyhow::Result<()> {
        tracing::info!(
            name = %self.registration.name,
            dispatcher = %self.registration.dispatcher_addr,
            "Dev remote connected (no dispatcher traffic leaves this process)"
        );

        let events = self.observed_events();
        let Some(handler) = self.handler() else {
            return Ok(());
        };
        if events.is_empty() {
            return Ok(());
        }

        let interval = self.interval;
        let mut closed = self.closed.subscribe();
        tokio::spawn(async move {
            for event in events.iter().cycle() {
                tokio::select! {
                    _ = closed.wait_for(|c| *c) => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                tracing::info!(tag = event.tag, payload = %preview(&event.payload), "Dev remote -> child");
                handler(event.clone());
            }
        });
        Ok(())
    }

    async fn write(&self, frame: TaggedFrame) {
        tracing::info!(tag = frame.tag, payload = %preview(&frame.payload), "Child -> dev remote");
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    async fn wait(&self) {
        let mut closed = self.closed.subscribe();
        tokio::select! {
            _ = closed.wait_for(|c| *c) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, ending dev remote session");
            }
        }
    }
}
