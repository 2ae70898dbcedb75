//! Wire codec: a closed set of protocol messages serialized into
//! self-delimited `[kind:1][length:4 BE][body]` frames, one frame per
//! datagram. Frame bodies and argument blobs use the structural
//! serializer behind the [`Codec`] trait.

mod blob;
mod codec;
mod frame;
mod message;

pub use blob::*;
pub use codec::*;
pub use frame::*;
pub use message::*;
