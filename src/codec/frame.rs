//! Wire framing and the streaming frame reader.

use std::os::fd::{AsFd, AsRawFd};

use nix::errno::Errno;

use super::kvvec::KvVec;

/// Frame delimiter on the wire. Pairs are NUL-terminated, so a frame ends
/// with four bytes total: the last pair's NUL followed by this sequence.
pub const MSG_DELIM: [u8; 3] = [0x01, 0x00, 0x00];

/// Key/value separator within a pair. Only the first occurrence separates;
/// values may contain further `=` bytes.
const KV_SEP: u8 = b'=';

/// Pair terminator.
const PAIR_SEP: u8 = 0;

/// Capacity of the inbound read buffer shared by all frames on the master
/// socket. Commands are small; this is generous.
const IOCACHE_SIZE: usize = 512 * 1024;

/// Scratch size for a single read(2).
const READ_CHUNK: usize = 4096;

/// Serialize a kv vector into one wire frame.
pub fn encode(kv: &KvVec) -> Vec<u8> {
    let payload: usize = kv
        .iter()
        .map(|p| p.key.len() + 1 + p.value.len() + 1)
        .sum();
    let mut buf = Vec::with_capacity(payload + MSG_DELIM.len());
    for pair in kv.iter() {
        buf.extend_from_slice(&pair.key);
        buf.push(KV_SEP);
        buf.extend_from_slice(&pair.value);
        buf.push(PAIR_SEP);
    }
    buf.extend_from_slice(&MSG_DELIM);
    buf
}

/// Decode one frame body (the bytes before the delimiter).
///
/// Lenient: a pair without `=` becomes a key with an empty value. Empty
/// segments (such as the one after the final pair terminator) are skipped.
pub fn decode(frame: &[u8]) -> KvVec {
    let mut kv = KvVec::new();
    for pair in frame.split(|&b| b == PAIR_SEP) {
        if pair.is_empty() {
            continue;
        }
        match pair.iter().position(|&b| b == KV_SEP) {
            Some(i) => kv.push(&pair[..i], &pair[i + 1..]),
            None => kv.push(pair, &b""[..]),
        }
    }
    kv
}

/// Encode and write a kv vector to `fd` in one whole-frame write.
///
/// Interleaving with other frames is impossible because the worker is
/// single-threaded; partial writes are left to the kernel send buffer.
pub fn send_kv(fd: &impl AsFd, kv: &KvVec) -> nix::Result<usize> {
    let buf = encode(kv);
    loop {
        match nix::unistd::write(fd, &buf) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Result of filling the frame reader from the master socket.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Read `n` new bytes.
    Data(usize),
    /// Nothing available right now (EAGAIN on the non-blocking socket).
    WouldBlock,
    /// Zero-length read: the peer closed the connection.
    Closed,
    /// Some other read error.
    Failed(Errno),
}

/// Streaming reader for inbound frames.
///
/// A single fixed buffer serves the one master connection for the life of
/// the process. Partial trailing bytes stay in place between fills;
/// extracted frames are compacted out. The buffer is never reset for a new
/// connection because the worker exits when the master disconnects.
pub struct FrameReader {
    buf: Box<[u8]>,
    len: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; IOCACHE_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    /// Read available bytes from `fd` into the buffer.
    pub fn fill(&mut self, fd: &impl AsFd) -> ReadOutcome {
        let mut total = 0usize;
        loop {
            let free = &mut self.buf[self.len..];
            if free.is_empty() {
                // A trusted master never sends a half-megabyte frame; if the
                // buffer fills without a delimiter we park until it drains.
                return if total > 0 {
                    ReadOutcome::Data(total)
                } else {
                    ReadOutcome::WouldBlock
                };
            }
            let want = free.len().min(READ_CHUNK);
            match nix::unistd::read(fd.as_fd().as_raw_fd(), &mut free[..want]) {
                Ok(0) => {
                    return if total > 0 {
                        ReadOutcome::Data(total)
                    } else {
                        ReadOutcome::Closed
                    };
                }
                Ok(n) => {
                    self.len += n;
                    total += n;
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => {
                    return if total > 0 {
                        ReadOutcome::Data(total)
                    } else {
                        ReadOutcome::WouldBlock
                    };
                }
                Err(e) => {
                    return if total > 0 {
                        ReadOutcome::Data(total)
                    } else {
                        ReadOutcome::Failed(e)
                    };
                }
            }
        }
    }

    /// Extract and decode the next complete frame, if any.
    ///
    /// The decoded vector owns copies of its keys and values, so the buffer
    /// may be overwritten by the next fill.
    pub fn next_frame(&mut self) -> Option<KvVec> {
        let end = find_delim(&self.buf[..self.len])?;
        let kv = decode(&self.buf[..end]);
        let consumed = end + MSG_DELIM.len();
        self.buf.copy_within(consumed..self.len, 0);
        self.len -= consumed;
        Some(kv)
    }

    /// Bytes currently buffered (complete or partial frames).
    pub fn buffered(&self) -> usize {
        self.len
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of the first frame delimiter in `buf`, if present.
fn find_delim(buf: &[u8]) -> Option<usize> {
    buf.windows(MSG_DELIM.len())
        .position(|w| w == &MSG_DELIM[..])
}
