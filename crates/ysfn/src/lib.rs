//! ysfn: host-side bridge between a stream function running in a child
//! runtime and the remote dispatcher session.

pub mod bridge;
pub mod config;
mod error;
pub mod remote;
pub mod runtime;
pub mod session;
mod supervisor;

pub use bridge::protocol::{FunctionDefinition, Handshake, Header, SessionId, TaggedFrame};
pub use config::{BridgeConfig, ConfigError, DefinitionSource};
pub use error::{BridgeError, BuildError, Phase, RunError};
pub use remote::{
    DevRemoteConnector, InboundHandler, Registration, RemoteConnector, RemoteHandle,
};
pub use runtime::{
    CommandRuntime, NodejsRuntime, PackageManager, SfnRuntime, Shutdown, WrapperTemplate,
};
pub use session::{SessionState, Termination};
pub use supervisor::Supervisor;
