//! Facade crate: re-exports the grange runtime under one roof.
//!
//! Clients obtain typed proxies to named server-side grains and invoke
//! methods over unreliable-channel-friendly transports; servers register
//! grain types with declarative authorization and serve activations with
//! single-threaded execution semantics per grain.

pub use grange_core::{
    CallError, DefaultPolicy, ErrorCode, GrainId, InterfaceId, MessageId, MethodOrdinal,
    ProtocolError, Role, RuntimeConfig, Session, SessionState, Transport, TransportError,
    UserIdentity, Zone, current_identity,
};

pub use grange_wire as wire;

pub use grange_registry::{InterfaceDescriptor, ManifestBuilder, RemoteDirectory, RegistryError};

pub use grange_client::{GrainClient, GrainInterface, GrainProxy, InFlight};

pub use grange_server::{
    AuthContext, Authorizer, Decision, Grain, GrainCatalog, GrainTypeRegistration, PolicyRule,
    ServerRuntime, ServerRuntimeBuilder, ServiceContainer,
};

/// Convenient imports for hosts embedding the runtime.
///
/// ```ignore
/// use grange::prelude::*;
/// ```
pub mod prelude {
    pub use grange_client::{GrainClient, GrainInterface, GrainProxy};
    pub use grange_core::{
        CallError, GrainId, InterfaceId, Role, RuntimeConfig, Transport, UserIdentity, Zone,
        current_identity,
    };
    pub use grange_server::{
        Grain, GrainTypeRegistration, PolicyRule, ServerRuntime, ServiceContainer,
    };
}
