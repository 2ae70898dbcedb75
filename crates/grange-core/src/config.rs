use std::time::Duration;

/// What the authorization pipeline does when no declarative policy matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultPolicy {
    /// Calls with no policy attached are allowed.
    Permissive,
    /// Calls with no policy attached are denied.
    DenyByDefault,
}

/// Runtime configuration knobs shared by client and server.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Aborts a handshake that has not been acknowledged in time.
    pub handshake_timeout: Duration,
    /// Applied when a caller gives no per-call timeout.
    pub request_timeout_default: Duration,
    /// Sessions idle longer than this are disconnected.
    pub idle_disconnect: Duration,
    /// Ready sessions emit a heartbeat this often.
    pub heartbeat_interval: Duration,
    /// Frames whose length field exceeds this are refused unread.
    pub max_frame_bytes: u32,
    /// Pending-request ceiling per connection; overflow fails `Overloaded`.
    pub max_pending_per_connection: u32,
    /// Activations idle longer than this are evicted. `None` disables
    /// eviction.
    pub eviction_idle: Option<Duration>,
    /// Fallthrough decision when no declarative policy matched.
    pub default_policy: DefaultPolicy,
    /// Require `ClientAccessible` marks for callers below `Server`.
    pub enforce_client_accessible: bool,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        RuntimeConfig {
            handshake_timeout: Duration::from_secs(5),
            request_timeout_default: Duration::from_secs(30),
            idle_disconnect: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            max_frame_bytes: 128 * 1024 * 1024,
            max_pending_per_connection: 65_536,
            eviction_idle: None,
            default_policy: DefaultPolicy::Permissive,
            enforce_client_accessible: false,
        }
    }

    /// Production preset: strict mode on.
    pub fn production() -> Self {
        Self::new().strict()
    }

    /// Strict mode overrides the authorization knobs: deny by default and
    /// client-facing grains must be explicitly marked.
    pub fn strict(mut self) -> Self {
        self.default_policy = DefaultPolicy::DenyByDefault;
        self.enforce_client_accessible = true;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
