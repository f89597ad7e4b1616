//! The comm object: framed point-to-point messaging over a collective
//! group transport.
//!
//! Senders stage framed bytes into the double-buffered send window; a
//! dedicated flusher thread periodically swaps buffers and drives the
//! all-to-all exchange that delivers everything in flight; receivers pull
//! whole messages out of per-source queues without blocking. Shutdown is
//! a distributed agreement: every rank keeps flushing until the whole
//! group has announced it is done, so no rank is ever left alone inside a
//! collective call.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex, Once};

use crate::comm::config::CommConfig;
use crate::comm::frame::{FrameHeader, ELEMENT_SIZE};
use crate::comm::recv_queue::RecvQueue;
use crate::comm::send_window::{SendState, SlotLayout};
use crate::error::{MurmurError, MurmurResult};
use crate::transport::{Channel, Collective};

/// State shared between application threads and the background flusher.
struct CommShared {
    transport: Arc<dyn Collective>,
    config: CommConfig,
    send: SendState,
    recv: Vec<RecvQueue>,
    /// Last source an any-source receive consumed from (fairness rotation).
    rr_cursor: AtomicUsize,
    /// Serializes swap + exchange + scatter + reset.
    flush_lock: Mutex<()>,
    /// Serializes a whole background round (flush + termination
    /// reduction), so an explicit flush can never race the all-reduce.
    round_lock: Mutex<()>,
    /// Serializes external-channel exchanges (barrier_flush callers).
    external_lock: Mutex<()>,
    /// Next drain ticket, issued under the flush lock at swap time.
    /// Tickets number drains in swap order.
    drain_ticket: AtomicU64,
    /// The ticket whose scatter may proceed next. Scatters happen in
    /// ticket order, so per-source byte streams never reorder even when
    /// internal and external exchanges complete out of order.
    scatter_turn: Mutex<u64>,
    scatter_cond: Condvar,
    /// This rank has entered shutdown.
    local_done: AtomicBool,
    /// Ranks known to have entered shutdown, per the last reduction.
    peers_done: AtomicUsize,
    /// A collective failed; the group is unusable.
    failed: AtomicBool,
}

impl CommShared {
    /// Swap the send buffers and run one collective exchange on the
    /// internal channel, scattering whatever arrives into the per-source
    /// receive queues. The whole sequence holds the flush lock, so drains
    /// are strictly serialized in swap order.
    fn flush_internal(&self) -> MurmurResult<()> {
        let _flush = self.flush_lock.lock();
        let idx = self.send.swap();
        let ticket = self.drain_ticket.fetch_add(1, Ordering::Relaxed);
        let send_counts = self.send.counts_elements(idx);
        let send_offsets = self.send.layout().slot_offsets_elements();

        let received = self.exchange_and_scatter(
            Channel::Internal,
            ticket,
            self.send.drained_window(idx),
            &send_counts,
            &send_offsets,
        )?;

        let reclaimed = self.send.reset(idx, self.config.reclaim_idle())?;
        if reclaimed {
            debug!(
                "rank {}: reclaimed send window of group {}",
                self.transport.rank(),
                idx
            );
        }
        debug!(
            "rank {}: flushed {} elements out, {} in",
            self.transport.rank(),
            send_counts.iter().sum::<u64>(),
            received
        );
        Ok(())
    }

    /// A flush mixed into a barrier: swap and compact the drained slots
    /// under the flush lock, then exchange them on the external channel
    /// with the lock released.
    ///
    /// Holding the flush lock across the external exchange would wedge
    /// the group: this rank's flusher could not join an internal round
    /// another rank's flusher is already blocked in, while that rank's
    /// barrier_flush waits on its own flush lock. Compacting first keeps
    /// the engine free while the group assembles; the drain ticket taken
    /// at swap time forces the eventual scatter back into swap order, so
    /// per-source FIFO still holds against concurrent internal rounds.
    fn barrier_flush(&self) -> MurmurResult<()> {
        let _external = self.external_lock.lock();
        let (ticket, send_counts, send_offsets, send_data) = {
            let _flush = self.flush_lock.lock();
            let idx = self.send.swap();
            let ticket = self.drain_ticket.fetch_add(1, Ordering::Relaxed);
            let counts = self.send.counts_elements(idx);
            let window = self.send.drained_window(idx);

            let mut offsets = Vec::with_capacity(counts.len());
            let mut data = Vec::new();
            let mut total = 0u64;
            for (peer, &count) in counts.iter().enumerate() {
                offsets.push(total);
                let start = self.send.layout().slot_offset(peer);
                let len = count as usize * ELEMENT_SIZE;
                data.extend_from_slice(&window[start..start + len]);
                total += count;
            }
            self.send.reset(idx, self.config.reclaim_idle())?;
            (ticket, counts, offsets, data)
        };

        let received = self.exchange_and_scatter(
            Channel::External,
            ticket,
            &send_data,
            &send_counts,
            &send_offsets,
        )?;
        debug!(
            "rank {}: barrier flush moved {} elements out, {} in",
            self.transport.rank(),
            send_counts.iter().sum::<u64>(),
            received
        );
        Ok(())
    }

    /// Counts exchange, variable-length exchange, and scatter into the
    /// receive queues. Returns the number of elements received.
    ///
    /// The scatter runs strictly in `ticket` (swap) order: a drain whose
    /// exchange finishes early parks until every earlier drain has
    /// scattered. Groups are drained in the order they are swapped out,
    /// and with this gate they are delivered in that order too.
    fn exchange_and_scatter(
        &self,
        channel: Channel,
        ticket: u64,
        send_buf: &[u8],
        send_counts: &[u64],
        send_offsets: &[u64],
    ) -> MurmurResult<u64> {
        let exchanged: MurmurResult<_> = (|| {
            let recv_counts = self.transport.all_to_all_counts(channel, send_counts)?;

            let mut recv_offsets = Vec::with_capacity(recv_counts.len());
            let mut total_elements = 0u64;
            for &count in &recv_counts {
                recv_offsets.push(total_elements);
                total_elements += count;
            }
            let mut recv_buf = vec![0u8; total_elements as usize * ELEMENT_SIZE];

            self.transport.all_to_all_bytes(
                channel,
                send_buf,
                send_counts,
                send_offsets,
                &mut recv_buf,
                &recv_counts,
                &recv_offsets,
            )?;
            Ok((recv_counts, recv_offsets, recv_buf, total_elements))
        })();

        let mut turn = self.scatter_turn.lock();
        while *turn != ticket {
            self.scatter_cond.wait(&mut turn);
        }
        let result = match exchanged {
            Ok((recv_counts, recv_offsets, recv_buf, total_elements)) => {
                for (source, &count) in recv_counts.iter().enumerate() {
                    if count == 0 {
                        continue;
                    }
                    let start = recv_offsets[source] as usize * ELEMENT_SIZE;
                    let end = start + count as usize * ELEMENT_SIZE;
                    self.recv[source].insert(&recv_buf[start..end]);
                }
                Ok(total_elements)
            }
            // The turn must advance on failure too, or every later drain
            // would park forever behind this ticket.
            Err(err) => Err(err),
        };
        *turn += 1;
        self.scatter_cond.notify_all();
        result
    }

    /// One background round: internal-channel flush plus the termination
    /// reduction. Explicit `flush()` calls come through here too, so the
    /// reduction can never interleave with another flusher.
    fn round(&self) -> MurmurResult<()> {
        let _round = self.round_lock.lock();
        // Once the whole group is done no rank will enter another
        // collective; joining one now would hang forever.
        if self.peers_done.load(Ordering::Acquire) >= self.transport.size() {
            return Ok(());
        }
        self.flush_internal()?;

        let done = self.local_done.load(Ordering::Acquire) as u64;
        let total = self.transport.all_reduce_sum(Channel::Internal, done)?;
        self.peers_done.store(total as usize, Ordering::Release);
        Ok(())
    }

    fn check_usable(&self) -> MurmurResult<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(MurmurError::transport(
                "a collective exchange failed; the comm is unusable",
            ));
        }
        Ok(())
    }
}

/// Asynchronous variable-length messaging between the N ranks of a peer
/// group, built on the group's all-to-all transport.
///
/// Cheap to share: all methods take `&self`. Senders block only while
/// staging (including any flushes needed to make room); receivers never
/// block. Every rank must eventually call [`close`](Self::close) (or drop
/// the comm) for the group to shut down.
pub struct GroupComm {
    shared: Arc<CommShared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    /// Set at close entry so sends start failing immediately.
    closed: AtomicBool,
    /// Completion barrier for the shutdown work: every close caller,
    /// first or late, blocks here until the flusher join has finished.
    close_once: Once,
}

impl GroupComm {
    /// Build a comm over `transport` and start its background flusher.
    pub fn new(transport: Arc<dyn Collective>, config: CommConfig) -> MurmurResult<Self> {
        let size = transport.size();
        let rank = transport.rank();
        config.validate(size)?;

        let layout = SlotLayout::new(config.send_window_bytes, size)?;
        let send = SendState::new(layout.clone())?;
        let recv = (0..size).map(|_| RecvQueue::new()).collect();

        let shared = Arc::new(CommShared {
            transport,
            config,
            send,
            recv,
            rr_cursor: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
            round_lock: Mutex::new(()),
            external_lock: Mutex::new(()),
            drain_ticket: AtomicU64::new(0),
            scatter_turn: Mutex::new(0),
            scatter_cond: Condvar::new(),
            local_done: AtomicBool::new(false),
            peers_done: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
        });

        let flusher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("murmur-flush-{}", rank))
                .spawn(move || {
                    let size = shared.transport.size();
                    while shared.peers_done.load(Ordering::Acquire) < size {
                        thread::sleep(shared.config.flush_interval());
                        if let Err(err) = shared.round() {
                            error!(
                                "rank {}: background flush failed, comm is dead: {}",
                                shared.transport.rank(),
                                err
                            );
                            shared.failed.store(true, Ordering::Release);
                            break;
                        }
                    }
                })?
        };

        info!(
            "rank {}/{}: comm ready (window {} bytes, {} bytes per peer slot)",
            rank,
            size,
            layout.window_bytes,
            layout.per_peer_capacity
        );

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
            closed: AtomicBool::new(false),
            close_once: Once::new(),
        })
    }

    /// This rank's index in the group.
    pub fn rank(&self) -> usize {
        self.shared.transport.rank()
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.shared.transport.size()
    }

    /// Queue `payload` for delivery to `target`.
    ///
    /// Blocks until the frame (header and payload) is fully staged into
    /// send windows, flushing as needed when the target's slot fills; the
    /// message itself may still span several subsequent flushes on the
    /// wire. Delivery to `target`'s receive queues is asynchronous.
    pub fn send(&self, target: usize, payload: &[u8]) -> MurmurResult<()> {
        self.shared.check_usable()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(MurmurError::Terminated(
                "send on a closed comm".to_string(),
            ));
        }
        if target >= self.size() {
            return Err(MurmurError::invalid_input(format!(
                "target {} out of range for group of {}",
                target,
                self.size()
            )));
        }
        if payload.is_empty() {
            return Err(MurmurError::invalid_input("empty messages are not allowed"));
        }

        let header = FrameHeader::new(payload.len());
        self.stage_fully(target, header.as_bytes())?;
        self.stage_fully(target, payload)
    }

    /// Stage a byte run in full, flushing whenever the slot saturates.
    fn stage_fully(&self, target: usize, mut rest: &[u8]) -> MurmurResult<()> {
        while !rest.is_empty() {
            let consumed = self.shared.send.stage(target, rest);
            rest = &rest[consumed..];
            if !rest.is_empty() {
                debug!(
                    "rank {}: slot for peer {} saturated, flushing ({} bytes left)",
                    self.rank(),
                    target,
                    rest.len()
                );
                self.flush()?;
            }
        }
        Ok(())
    }

    /// Drain in-flight sends once on the internal channel.
    ///
    /// Collective in effect: it completes when every rank's flusher (or
    /// an explicit flush) joins the exchange, which happens within one
    /// flusher cadence.
    pub fn flush(&self) -> MurmurResult<()> {
        self.shared.check_usable()?;
        self.shared.round()
    }

    /// Synchronize all ranks, draining local sends first.
    pub fn barrier(&self) -> MurmurResult<()> {
        self.flush()?;
        while self.shared.send.has_pending() {
            self.flush()?;
        }
        self.shared.transport.barrier(Channel::External)
    }

    /// A single swap-and-exchange on the external channel: a flush mixed
    /// into a barrier-like collective. Every rank must call it. Safe to
    /// run alongside sends and background flushes; per-source FIFO order
    /// is preserved across the two channels.
    pub fn barrier_flush(&self) -> MurmurResult<()> {
        self.shared.check_usable()?;
        self.shared.barrier_flush()
    }

    /// Dequeue the next complete message from `source`, if one has fully
    /// arrived. Never blocks.
    pub fn receive_from(&self, source: usize) -> Option<Vec<u8>> {
        self.shared.recv.get(source)?.try_pop()
    }

    /// Dequeue the next complete message from any source, probing each
    /// peer once in round-robin order from just past the last hit.
    /// Returns the source rank with the payload. Never blocks.
    pub fn receive(&self) -> Option<(usize, Vec<u8>)> {
        let size = self.size();
        let start = self.shared.rr_cursor.load(Ordering::Relaxed) + 1;
        for probe in 0..size {
            let source = (start + probe) % size;
            if let Some(payload) = self.shared.recv[source].try_pop() {
                self.shared.rr_cursor.store(source, Ordering::Relaxed);
                return Some((source, payload));
            }
        }
        None
    }

    /// Announce shutdown and wait for the whole group to agree.
    ///
    /// Sets this rank's done flag and joins the background flusher, which
    /// keeps flushing (delivering any in-flight messages) until the
    /// termination reduction reports every rank done. Idempotent, and a
    /// completion barrier: concurrent callers all block until the join
    /// and failure check have finished, and all see the same outcome.
    /// Called automatically on drop.
    pub fn close(&self) -> MurmurResult<()> {
        self.closed.store(true, Ordering::Release);
        // Once::call_once parks late callers until the first caller's
        // closure returns, so nobody observes a half-finished shutdown.
        self.close_once.call_once(|| {
            self.shared.local_done.store(true, Ordering::Release);
            if let Some(handle) = self.flusher.lock().take() {
                if handle.join().is_err() {
                    error!("rank {}: background flusher panicked", self.rank());
                    self.shared.failed.store(true, Ordering::Release);
                }
            }
            if !self.shared.failed.load(Ordering::Acquire) {
                info!("rank {}/{}: comm closed", self.rank(), self.size());
            }
        });
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(MurmurError::transport(
                "background flusher aborted on a collective failure or panic",
            ));
        }
        Ok(())
    }
}

impl Drop for GroupComm {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("rank {}: close on drop failed: {}", self.rank(), err);
        }
    }
}
