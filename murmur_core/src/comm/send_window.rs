//! Double-buffered send window.
//!
//! Two anonymous mmap'd regions of W bytes, each partitioned into N
//! element-aligned slots (one per peer). A monotonically increasing epoch
//! counter selects the current group by its low bit; application threads
//! stage bytes into the current group through a CAS length reservation,
//! while the flush engine freezes the other group, ships it, and resets
//! it. Writers never take a lock on the staging path.
//!
//! Drain gating uses shared-ownership counting: every in-flight stage
//! holds a clone of the group's `Arc` handle, and the engine's swap spins
//! until it is the sole owner. A stage that observes the epoch moving
//! under its feet releases its clone and retries, so no write ever lands
//! in a group that is already being drained.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::comm::frame::{padded_len, ELEMENT_SIZE};
use crate::error::{MurmurError, MurmurResult};

/// Cache-line aligned wrapper to prevent false sharing between the
/// per-peer length counters.
#[repr(C, align(64))]
struct CachePadded<T>(T);

/// Slot geometry derived from the window size and group size.
#[derive(Debug, Clone)]
pub(crate) struct SlotLayout {
    /// Total window size in bytes (W).
    pub window_bytes: usize,
    /// Number of peers (N).
    pub peers: usize,
    /// Bytes available per peer slot; also the slot stride. Always a
    /// multiple of the element size.
    pub per_peer_capacity: usize,
}

impl SlotLayout {
    pub fn new(window_bytes: usize, peers: usize) -> MurmurResult<Self> {
        if peers == 0 {
            return Err(MurmurError::invalid_input("peer group is empty"));
        }
        let per_peer_capacity = window_bytes / peers / ELEMENT_SIZE * ELEMENT_SIZE;
        if per_peer_capacity == 0 {
            return Err(MurmurError::memory(format!(
                "send window of {} bytes cannot fit one {}-byte element per peer ({} peers)",
                window_bytes, ELEMENT_SIZE, peers
            )));
        }
        Ok(Self {
            window_bytes,
            peers,
            per_peer_capacity,
        })
    }

    /// Byte offset of peer `i`'s slot within the window.
    #[inline]
    pub fn slot_offset(&self, peer: usize) -> usize {
        peer * self.per_peer_capacity
    }

    /// Slot offsets in transport elements, as the all-to-all wants them.
    pub fn slot_offsets_elements(&self) -> Vec<u64> {
        (0..self.peers)
            .map(|i| (self.slot_offset(i) / ELEMENT_SIZE) as u64)
            .collect()
    }
}

struct WindowMap {
    map: MmapMut,
    last_reclaim: Instant,
}

/// One mmap'd staging region. The engine replaces the mapping during
/// reclamation (under the mutex, with no writers active); stagers only
/// ever touch the published base pointer.
struct Window {
    map: Mutex<WindowMap>,
    base: AtomicPtr<u8>,
    len: usize,
}

impl Window {
    fn map_anon(len: usize) -> MurmurResult<MmapMut> {
        let map = MmapMut::map_anon(len)?;
        Ok(map)
    }

    fn new(len: usize) -> MurmurResult<Self> {
        let mut map = Self::map_anon(len)?;
        let base = AtomicPtr::new(map.as_mut_ptr());
        Ok(Self {
            map: Mutex::new(WindowMap {
                map,
                last_reclaim: Instant::now(),
            }),
            base,
            len,
        })
    }

    #[inline]
    fn base(&self) -> NonNull<u8> {
        // Acquire pairs with the Release publication in `reclaim`, so a
        // stager always sees a fully mapped region behind the pointer.
        NonNull::new(self.base.load(Ordering::Acquire)).expect("window base pointer is null")
    }

    /// Unmap and re-map the backing region if it has been at least
    /// `idle` since the last reclamation. Caller must guarantee no writer
    /// is active (drained group, before the epoch re-selects it).
    fn maybe_reclaim(&self, idle: Duration) -> MurmurResult<bool> {
        let mut guard = self.map.lock();
        if guard.last_reclaim.elapsed() < idle {
            return Ok(false);
        }
        let mut fresh = Self::map_anon(self.len)?;
        self.base.store(fresh.as_mut_ptr(), Ordering::Release);
        guard.map = fresh;
        guard.last_reclaim = Instant::now();
        Ok(true)
    }
}

// SAFETY: the raw base pointer targets an OS mapping owned by this struct;
// concurrent access is coordinated by the epoch/refcount protocol above
// and the reclaim mutex.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

/// One of the two staging groups.
struct SendGroup {
    window: Window,
    /// Per-peer staged byte counts. Every successful reservation leaves
    /// these at element multiples, bounded by `per_peer_capacity`.
    lengths: Box<[CachePadded<AtomicUsize>]>,
    /// Shared-ownership handle: one clone per in-flight stage. Unique
    /// (count == 1) means no writer is active.
    writers: Arc<()>,
}

impl SendGroup {
    fn new(layout: &SlotLayout) -> MurmurResult<Self> {
        let lengths = (0..layout.peers)
            .map(|_| CachePadded(AtomicUsize::new(0)))
            .collect();
        Ok(Self {
            window: Window::new(layout.window_bytes)?,
            lengths,
            writers: Arc::new(()),
        })
    }
}

/// The double-buffered send state: epoch selector plus both groups.
pub(crate) struct SendState {
    layout: SlotLayout,
    epoch: AtomicUsize,
    groups: [SendGroup; 2],
}

impl SendState {
    pub fn new(layout: SlotLayout) -> MurmurResult<Self> {
        let groups = [SendGroup::new(&layout)?, SendGroup::new(&layout)?];
        Ok(Self {
            layout,
            epoch: AtomicUsize::new(0),
            groups,
        })
    }

    #[inline]
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Stage up to `data.len()` bytes for `target` into the current group.
    ///
    /// Reserves space with a CAS on the target's length counter, then
    /// copies outside any lock. Returns the number of caller bytes
    /// consumed (the reservation may exceed it by up to one element of
    /// trailing padding); 0 means the slot had no room and the caller
    /// must flush before retrying.
    pub fn stage(&self, target: usize, data: &[u8]) -> usize {
        debug_assert!(target < self.layout.peers);
        debug_assert!(!data.is_empty());
        let padded = padded_len(data.len());

        loop {
            // Acquire the current group: read the epoch, take a writer
            // reference, then re-read. If the epoch moved we raced a swap
            // and the reference may point at a draining group; drop it and
            // try again.
            let seen = self.epoch.load(Ordering::Acquire);
            let group = &self.groups[seen & 1];
            let guard = Arc::clone(&group.writers);
            // Orders the refcount increment against the engine's epoch
            // bump (Dekker pattern): either the engine sees our clone, or
            // we see its new epoch.
            fence(Ordering::SeqCst);
            if self.epoch.load(Ordering::Acquire) != seen {
                drop(guard);
                continue;
            }

            // Reserve: bump the length counter by as much of `padded` as
            // fits. The grant is always an element multiple.
            let counter = &group.lengths[target].0;
            let mut old = counter.load(Ordering::Relaxed);
            let grant = loop {
                let room = self.layout.per_peer_capacity - old;
                let grant = room.min(padded);
                if grant == 0 {
                    break 0;
                }
                match counter.compare_exchange_weak(
                    old,
                    old + grant,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break grant,
                    Err(actual) => old = actual,
                }
            };
            if grant == 0 {
                drop(guard);
                return 0;
            }

            // Copy the real bytes; any reserved tail beyond `data.len()`
            // is padding the receiver discards.
            let consumed = grant.min(data.len());
            let dst_off = self.layout.slot_offset(target) + old;
            let base = group.window.base();
            // SAFETY: `old .. old + grant` was reserved exclusively by the
            // CAS above and lies within the slot (counter never exceeds
            // per_peer_capacity), so the destination range is in-bounds
            // and unaliased. The mapping outlives `guard`: reclamation
            // only runs on drained groups, and holding `guard` keeps this
            // group out of the drained state.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(dst_off), consumed);
            }
            drop(guard);
            return consumed;
        }
    }

    /// Freeze the current group and wait for its writers to drain.
    ///
    /// Bumps the epoch (flipping which group is current) and spins until
    /// the frozen group's writer handle is unique. Returns the frozen
    /// group's index, now safe for the engine to read and reset.
    pub fn swap(&self) -> usize {
        let old = self.epoch.fetch_add(1, Ordering::SeqCst);
        let idx = old & 1;
        // See `stage`: the SeqCst pair guarantees any writer that missed
        // the epoch bump is visible in the refcount by now.
        fence(Ordering::SeqCst);
        // Spin: stages are small bounded copies, so the wait is short.
        while Arc::strong_count(&self.groups[idx].writers) != 1 {
            std::hint::spin_loop();
        }
        // Pairs with the Release decrement of the last writer's dropped
        // clone, publishing its window writes to the engine.
        fence(Ordering::Acquire);
        idx
    }

    /// Per-peer staged element counts for a drained group.
    pub fn counts_elements(&self, idx: usize) -> Vec<u64> {
        self.groups[idx]
            .lengths
            .iter()
            .map(|len| {
                let bytes = len.0.load(Ordering::Relaxed);
                debug_assert_eq!(bytes % ELEMENT_SIZE, 0);
                (bytes / ELEMENT_SIZE) as u64
            })
            .collect()
    }

    /// The drained group's window as a byte slice.
    ///
    /// Only valid between a `swap` returning `idx` and the matching
    /// `reset`: during that span no writer touches the group and the
    /// mapping cannot be replaced.
    pub fn drained_window(&self, idx: usize) -> &[u8] {
        let window = &self.groups[idx].window;
        // SAFETY: caller is the flush engine, post-swap: writers have
        // quiesced (refcount unique) and reclaim only happens inside
        // `reset`, so the base pointer and contents are stable for the
        // borrow.
        unsafe { std::slice::from_raw_parts(window.base().as_ptr(), window.len) }
    }

    /// Zero a drained group's counters and opportunistically reclaim its
    /// window after `reclaim_idle` of no reclamation.
    pub fn reset(&self, idx: usize, reclaim_idle: Duration) -> MurmurResult<bool> {
        let group = &self.groups[idx];
        for len in group.lengths.iter() {
            len.0.store(0, Ordering::Relaxed);
        }
        group.window.maybe_reclaim(reclaim_idle)
    }

    /// Whether any slot of either group currently holds staged bytes.
    ///
    /// Advisory only: concurrent stagers can add bytes immediately after
    /// this returns false.
    pub fn has_pending(&self) -> bool {
        self.groups.iter().any(|g| {
            g.lengths
                .iter()
                .any(|len| len.0.load(Ordering::Relaxed) != 0)
        })
    }
}
