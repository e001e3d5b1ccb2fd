//! orbit: communication contexts for remote objects.
//!
//! A [`CommunicationContext`] is built from a frozen [`ConfigStore`] and a
//! populated [`TypeRegistry`]. It opens proxies and adapters through a
//! [`ResourceScope`], coordinates two-phase shutdown, and releases every
//! resource exactly once when destroyed or dropped.

mod state;
mod version;

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod context;
pub mod endpoint;
pub mod proxy;
pub mod registry;
pub mod scope;
pub mod servant;
pub mod shutdown;

pub use adapter::{AdapterError, AdapterHandle};
pub use config::{ConfigError, ConfigStore};
pub use context::{CommunicationContext, ContextControl, ContextError};
pub use endpoint::{Endpoint, EndpointError, ProxyAddress};
pub use proxy::{InvocationError, ProxyHandle};
pub use registry::{OperationSignature, Parameter, RegistryError, TypeDescriptor, TypeRef, TypeRegistry};
pub use scope::{CloseReport, ReleaseError, Resource, ResourceHandle, ResourceKind, ResourceScope, ScopeError};
pub use servant::{Current, DispatchError, Servant, decode_arg};
pub use shutdown::{ShutdownCoordinator, ShutdownError};
pub use state::ContextState;
pub use version::{ORBIT_VERSION, ProtocolVersion};
