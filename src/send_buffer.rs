//! §4.C Send Buffer.
//!
//! The original accumulates untyped chunks and later sniffs their first
//! bytes (`SUBRE`) to decide what to keep across a reconnect. Per REDESIGN
//! FLAGS we tag each chunk with its kind at enqueue time instead, so the
//! reconnect filter in `fsm.rs` is a type match rather than a regex over
//! bytes that might be a binary PUB payload.

use bytes::{Bytes, BytesMut};

pub const FLUSH_THRESHOLD: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Connect,
    Pub,
    Sub,
    Unsub,
    Ping,
    Pong,
    Other,
}

#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub kind: ChunkKind,
    pub bytes: Bytes,
}

/// Accumulates outbound bytes between flushes. `size` is always the sum of
/// `bytes.len()` across `chunks` (§3 invariant).
#[derive(Debug, Default)]
pub struct OutBuffer {
    chunks: Vec<PendingChunk>,
    size: usize,
}

impl OutBuffer {
    pub fn new() -> Self {
        OutBuffer::default()
    }

    pub fn enqueue(&mut self, kind: ChunkKind, bytes: Bytes) {
        self.size += bytes.len();
        self.chunks.push(PendingChunk { kind, bytes });
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn should_flush_sync(&self) -> bool {
        self.size > FLUSH_THRESHOLD
    }

    /// Concatenate everything into one contiguous buffer, preserving the
    /// enqueue order and never splitting a chunk's own byte boundary.
    pub fn drain_coalesced(&mut self) -> Bytes {
        if self.chunks.is_empty() {
            return Bytes::new();
        }
        if self.chunks.len() == 1 {
            self.size = 0;
            return self.chunks.drain(..).next().unwrap().bytes;
        }
        let mut out = BytesMut::with_capacity(self.size);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk.bytes);
        }
        self.size = 0;
        out.freeze()
    }

    /// §4.H pending-buffer rebuild: keep PUBs, and PINGs whose matching
    /// pong-queue slot is a real flush awaiter (`keep_ping` decides that per
    /// index); drop everything else (CONNECT, SUB/UNSUB, nop PINGs).
    pub fn rebuild_for_reconnect(&mut self, mut keep_ping: impl FnMut() -> bool) {
        let old = std::mem::take(&mut self.chunks);
        self.size = 0;
        for chunk in old {
            let keep = match chunk.kind {
                ChunkKind::Pub => true,
                ChunkKind::Ping => keep_ping(),
                _ => false,
            };
            if keep {
                self.size += chunk.bytes.len();
                self.chunks.push(chunk);
            }
        }
    }

    #[cfg(test)]
    pub fn chunk_kinds(&self) -> Vec<ChunkKind> {
        self.chunks.iter().map(|c| c.kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_tracks_enqueued_bytes() {
        let mut buf = OutBuffer::new();
        buf.enqueue(ChunkKind::Pub, Bytes::from_static(b"PUB a 5\r\nhello\r\n"));
        buf.enqueue(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));
        assert_eq!(buf.size(), 16 + 6);
    }

    #[test]
    fn drain_preserves_order_and_boundaries() {
        let mut buf = OutBuffer::new();
        buf.enqueue(ChunkKind::Sub, Bytes::from_static(b"SUB a 1\r\n"));
        buf.enqueue(ChunkKind::Pub, Bytes::from_static(b"PUB a 5\r\nhello\r\n"));
        let out = buf.drain_coalesced();
        assert_eq!(&out[..], b"SUB a 1\r\nPUB a 5\r\nhello\r\n");
        assert!(buf.is_empty());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn rebuild_keeps_pubs_and_awaited_pings_only() {
        let mut buf = OutBuffer::new();
        buf.enqueue(ChunkKind::Connect, Bytes::from_static(b"CONNECT {}\r\n"));
        buf.enqueue(ChunkKind::Sub, Bytes::from_static(b"SUB a 1\r\n"));
        buf.enqueue(ChunkKind::Pub, Bytes::from_static(b"PUB a 1\r\nx\r\n"));
        buf.enqueue(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));
        buf.enqueue(ChunkKind::Ping, Bytes::from_static(b"PING\r\n"));

        let mut awaited = vec![true, false].into_iter();
        buf.rebuild_for_reconnect(move || awaited.next().unwrap_or(false));

        assert_eq!(
            buf.chunk_kinds(),
            vec![ChunkKind::Pub, ChunkKind::Ping]
        );
    }
}
