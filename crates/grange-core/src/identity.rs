use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Coarse-grained authorization level. Comparison is `>=` along the
/// declaration order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    Anonymous = 0,
    Guest = 1,
    User = 2,
    Server = 3,
    Admin = 4,
}

impl Role {
    /// Whether this role meets the given requirement.
    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Anonymous => "Anonymous",
            Role::Guest => "Guest",
            Role::User => "User",
            Role::Server => "Server",
            Role::Admin => "Admin",
        };
        f.write_str(s)
    }
}

/// The authenticated principal bound to a session. Immutable once created.
#[derive(Clone, Debug)]
pub struct UserIdentity {
    pub user_id: String,
    pub user_name: String,
    pub role: Role,
    pub authenticated_at: SystemTime,
    pub connection_id: u64,
}

impl UserIdentity {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        role: Role,
        connection_id: u64,
    ) -> Self {
        UserIdentity {
            user_id: user_id.into(),
            user_name: user_name.into(),
            role,
            authenticated_at: SystemTime::now(),
            connection_id,
        }
    }

    /// Identity recorded for sessions whose transport provided no verified
    /// principal.
    pub fn anonymous(connection_id: u64) -> Self {
        Self::new("anonymous", "anonymous", Role::Anonymous, connection_id)
    }

    pub fn is_anonymous(&self) -> bool {
        self.role == Role::Anonymous
    }
}

tokio::task_local! {
    static CURRENT_IDENTITY: Arc<UserIdentity>;
}

/// Runs `fut` with `identity` installed as the current identity.
///
/// The scope is tied to the future, so it is released on every exit path:
/// completion, error, cancellation, and panic.
pub async fn with_identity<F>(identity: Arc<UserIdentity>, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_IDENTITY.scope(identity, fut).await
}

/// The identity of the request currently being dispatched, if the calling
/// task runs inside a dispatch scope.
pub fn current_identity() -> Option<Arc<UserIdentity>> {
    CURRENT_IDENTITY.try_with(|id| id.clone()).ok()
}
