//! Contract with the remote streaming client.
//!
//! The client (an upstream SDK session to the dispatcher) is an external
//! collaborator. The bridge drives it only through [`RemoteHandle`]; a
//! [`RemoteConnector`] builds one handle per session.

mod dev;

use std::sync::Arc;

use async_trait::async_trait;

use crate::bridge::protocol::TaggedFrame;

pub use dev::{DevRemote, DevRemoteConnector};

/// Callback fired for every event the dispatcher delivers.
///
/// May be invoked from any thread, concurrently with [`RemoteHandle::write`].
pub type InboundHandler = Arc<dyn Fn(TaggedFrame) + Send + Sync>;

/// Everything needed to register the function with the dispatcher.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub dispatcher_addr: String,
    pub credential: String,
    /// Function definition document, passed through verbatim.
    pub definition: String,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("dispatcher_addr", &self.dispatcher_addr)
            .field("credential", &"<redacted>")
            .field("definition", &self.definition)
            .finish()
    }
}

/// A remote session for one registered function.
///
/// Implementations must tolerate `write` and the inbound handler being
/// driven concurrently.
#[async_trait]
pub trait RemoteHandle: Send + Sync + 'static {
    fn set_observed_tags(&self, tags: &[u32]);

    fn set_handler(&self, handler: InboundHandler);

    async fn connect(&self) -> anyhow::Result<()>;

    /// Best-effort send of a frame produced by the child.
    async fn write(&self, frame: TaggedFrame);

    async fn close(&self);

    /// Block until the remote session ends.
    async fn wait(&self);
}

/// Factory for remote handles.
pub trait RemoteConnector: Send + Sync + 'static {
    fn create(&self, registration: Registration) -> Arc<dyn RemoteHandle>;
}
