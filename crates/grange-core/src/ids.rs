use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A zone coordinate used to partition grains across servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zone {
    pub x: i32,
    pub y: i32,
}

impl Zone {
    pub fn new(x: i32, y: i32) -> Self {
        Zone { x, y }
    }
}

impl From<(i32, i32)> for Zone {
    fn from((x, y): (i32, i32)) -> Self {
        Zone { x, y }
    }
}

impl From<Zone> for (i32, i32) {
    fn from(z: Zone) -> Self {
        (z.x, z.y)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Identifies a logical grain: an interned type name plus a key.
///
/// Grain ids are cheap to clone and never destroyed; two ids naming the
/// same `(type, key)` pair compare equal.
///
/// Keys may carry a zone suffix using the `name@x,y` convention, which the
/// dispatch engine uses for zone routing. A malformed suffix is treated as
/// part of the key, never as an error.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GrainId {
    ty: Arc<str>,
    key: Arc<str>,
}

impl GrainId {
    pub fn new(grain_type: impl AsRef<str>, key: impl AsRef<str>) -> Self {
        GrainId {
            ty: Arc::from(grain_type.as_ref()),
            key: Arc::from(key.as_ref()),
        }
    }

    pub fn grain_type(&self) -> &str {
        &self.ty
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The zone encoded in the key's `@x,y` suffix, if any.
    pub fn zone(&self) -> Option<Zone> {
        let (_, suffix) = self.key.rsplit_once('@')?;
        let (x, y) = suffix.split_once(',')?;
        Some(Zone {
            x: x.parse().ok()?,
            y: y.parse().ok()?,
        })
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ty, self.key)
    }
}

impl fmt::Debug for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GrainId({}/{})", self.ty, self.key)
    }
}

/// Identifies an interface contract, stable across client and server for a
/// given interface version.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(Arc<str>);

impl InterfaceId {
    pub fn new(id: impl AsRef<str>) -> Self {
        InterfaceId(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for InterfaceId {
    fn from(s: &str) -> Self {
        InterfaceId::new(s)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterfaceId({})", self.0)
    }
}

/// Position of a method within its interface's name-sorted method list.
///
/// Both peers must compute identical ordinals for identical interface
/// shapes; the manifest received during handshake is authoritative.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodOrdinal(pub u16);

impl fmt::Display for MethodOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A 128-bit request correlation id, globally unique per client session.
///
/// Layout: the high 64 bits are a monotonically increasing counter, the
/// low 64 bits a per-allocator random prefix. The counter in the high bits
/// lets the pending map shard by high bits without every id landing in one
/// shard.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u128);

impl MessageId {
    pub fn counter(self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub fn session_prefix(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({:032x})", self.0)
    }
}

/// Allocates message ids for one client session.
///
/// The random prefix comes from a freshly seeded `RandomState`, so no rng
/// dependency is needed; the counter starts at 1 so an all-zero id never
/// occurs on the wire.
pub struct MessageIdAllocator {
    prefix: u64,
    next: AtomicU64,
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        let prefix = RandomState::new().build_hasher().finish();
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: u64) -> Self {
        MessageIdAllocator {
            prefix,
            next: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> MessageId {
        let counter = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        MessageId(((counter as u128) << 64) | self.prefix as u128)
    }
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
