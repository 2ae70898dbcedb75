//! Server runtime: per-client sessions, the authorization pipeline, the
//! grain catalog with per-activation execution, and inbound dispatch from
//! decoded requests to grain method handlers.

mod auth;
mod catalog;
mod container;
mod registration;
mod runtime;

pub use auth::*;
pub use catalog::*;
pub use container::*;
pub use registration::*;
pub use runtime::*;
