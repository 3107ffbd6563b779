//! Connector-side runtime: resolves relayed requests to locally registered
//! targets, executes them, and answers over the tunnel link.

pub mod http_target;
pub mod registry;
pub mod runtime;
pub mod worker;

pub use registry::{RegistrationHandle, RegistryError, RelayTarget, TargetRegistry};
pub use runtime::ConnectorRuntime;
pub use worker::{RequestWorker, WorkerConfig};
