//! Per-source receive buffering and frame reassembly.
//!
//! The transport delivers opaque element-aligned byte runs per source.
//! Each source gets one `RecvQueue`: a byte FIFO plus the framing state
//! machine (awaiting-header / awaiting-payload). Inserts come from the
//! flush engine; dequeues come from application threads and never block —
//! an incomplete message just returns `None` until a later flush delivers
//! the rest.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::comm::frame::{padded_len, FrameHeader, HEADER_SIZE};

/// Byte queue and framing state for one source peer.
///
/// The length fields shadow the locked state so `try_pop` can bail out
/// without the mutex; they are advisory on the fast path and re-checked
/// under the lock before any byte moves.
pub(crate) struct RecvQueue {
    queue: Mutex<VecDeque<u8>>,
    /// Bytes in `queue` (headers already consumed are excluded).
    buffered_len: AtomicUsize,
    /// Unpadded length of the next message once its header has been
    /// consumed; 0 means the queue front is a header (or empty).
    next_msg_len: AtomicUsize,
    /// `next_msg_len` rounded up to the element size; 0 iff it is 0.
    next_padded_len: AtomicUsize,
}

impl RecvQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            buffered_len: AtomicUsize::new(0),
            next_msg_len: AtomicUsize::new(0),
            next_padded_len: AtomicUsize::new(0),
        }
    }

    /// Append a delivered byte run and advance framing.
    pub fn insert(&self, bytes: &[u8]) {
        let mut queue = self.queue.lock();
        queue.extend(bytes);
        self.buffered_len.fetch_add(bytes.len(), Ordering::Relaxed);
        self.consume_header_locked(&mut queue);
    }

    /// If the front of the queue is a complete header, consume it and arm
    /// the payload state. Caller holds the queue lock.
    fn consume_header_locked(&self, queue: &mut VecDeque<u8>) {
        if self.next_msg_len.load(Ordering::Relaxed) != 0 {
            return;
        }
        if self.buffered_len.load(Ordering::Relaxed) < HEADER_SIZE {
            return;
        }
        let mut raw = [0u8; HEADER_SIZE];
        for (i, byte) in queue.drain(..HEADER_SIZE).enumerate() {
            raw[i] = byte;
        }
        let len = FrameHeader::from_bytes(raw).payload_len();
        debug_assert!(len > 0, "zero-length frame on the wire");
        self.buffered_len.fetch_sub(HEADER_SIZE, Ordering::Relaxed);
        self.next_msg_len.store(len, Ordering::Relaxed);
        self.next_padded_len.store(padded_len(len), Ordering::Relaxed);
    }

    /// Dequeue the next complete message, or `None` if one has not fully
    /// arrived. Never blocks beyond the queue mutex.
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        // Unlocked quick exit: either no header has been consumed yet or
        // the payload is still short. Both fields are re-checked under
        // the lock, so a stale read only costs a miss.
        let padded = self.next_padded_len.load(Ordering::Relaxed);
        if padded == 0 || padded > self.buffered_len.load(Ordering::Relaxed) {
            return None;
        }

        let mut queue = self.queue.lock();
        let padded = self.next_padded_len.load(Ordering::Relaxed);
        if padded == 0 || padded > self.buffered_len.load(Ordering::Relaxed) {
            return None;
        }
        let len = self.next_msg_len.load(Ordering::Relaxed);
        let mut payload: Vec<u8> = queue.drain(..padded).collect();
        // trailing pad bytes are transport filler
        payload.truncate(len);
        self.buffered_len.fetch_sub(padded, Ordering::Relaxed);
        self.next_msg_len.store(0, Ordering::Relaxed);
        self.next_padded_len.store(0, Ordering::Relaxed);
        // the next message's header may already be buffered
        self.consume_header_locked(&mut queue);
        Some(payload)
    }
}
