//! Core types for the grange grain RPC runtime: identifiers, the error
//! taxonomy, session state, identity/roles, configuration, and the
//! transport seam shared by the client and server crates.

mod config;
mod error;
mod identity;
mod ids;
mod metrics;
mod session;
mod transport;

pub use config::*;
pub use error::*;
pub use identity::*;
pub use ids::*;
pub use metrics::*;
pub use session::*;
pub use transport::*;
