//! Control-channel codec for the master socket.
//!
//! Messages are key/value vectors framed as `key=value` pairs, each pair
//! (including the last) terminated by a NUL byte, with frames delimited by
//! the three-byte sequence `\x01\x00\x00`. The framing is wire-exact and
//! shared with the master; it must not change.

mod frame;
mod kvvec;

pub use frame::{FrameReader, ReadOutcome, send_kv};
pub use kvvec::KvVec;
