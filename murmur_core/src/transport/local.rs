//! In-process group transport.
//!
//! `LocalGroup` runs an N-rank peer group inside a single process, one
//! rank handle per thread. Each channel owns a two-phase rendezvous cell:
//! every rank deposits its contribution, blocks until all N have arrived,
//! reads the full deposit set, and the last reader resets the cell for the
//! next round. That single primitive carries all four collectives.
//!
//! This is the reference transport for tests, benches and examples; a
//! production deployment supplies an MPI-or-similar implementation of
//! [`Collective`] instead.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{Channel, Collective};
use crate::comm::frame::ELEMENT_SIZE;
use crate::error::{MurmurError, MurmurResult};

/// One rank's contribution to a collective round.
///
/// All ranks must issue the same collective in the same order on a given
/// channel; a variant mismatch inside a round means the callers diverged,
/// which is unrecoverable (the real transport would deadlock), so the cell
/// panics rather than limp on.
#[derive(Clone)]
enum Deposit {
    Counts(Vec<u64>),
    /// Per-destination byte runs, indexed by receiving rank.
    Chunks(Vec<Vec<u8>>),
    Sum(u64),
    Token,
}

impl Deposit {
    fn kind(&self) -> &'static str {
        match self {
            Deposit::Counts(_) => "counts",
            Deposit::Chunks(_) => "chunks",
            Deposit::Sum(_) => "sum",
            Deposit::Token => "barrier",
        }
    }
}

struct CellState {
    deposits: Vec<Option<Deposit>>,
    arrived: usize,
    /// Ranks that have yet to pick up this round's result. Non-zero means
    /// the round is draining and the next round must wait at the door.
    readers_left: usize,
}

/// Reusable all-rank rendezvous: deposit, wait for a full house, read all.
struct RendezvousCell {
    size: usize,
    state: Mutex<CellState>,
    cond: Condvar,
}

impl RendezvousCell {
    fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(CellState {
                deposits: vec![None; size],
                arrived: 0,
                readers_left: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Deposit `value` for `rank`, wait until every rank has deposited,
    /// and return the full deposit vector in rank order.
    fn exchange(&self, rank: usize, value: Deposit) -> Vec<Deposit> {
        let size = self.size;
        let mut s = self.state.lock();
        // A rank can lap the group: wait at the door until the previous
        // round has been read out by everyone.
        while s.readers_left > 0 {
            self.cond.wait(&mut s);
        }
        debug_assert!(s.deposits[rank].is_none(), "rank {} deposited twice", rank);
        s.deposits[rank] = Some(value);
        s.arrived += 1;
        if s.arrived == size {
            s.readers_left = size;
            self.cond.notify_all();
        } else {
            // The generation cannot advance past this round until we take
            // our copy, so waiting on "reading phase open" is sufficient.
            while s.readers_left == 0 {
                self.cond.wait(&mut s);
            }
        }
        let result: Vec<Deposit> = s
            .deposits
            .iter()
            .map(|d| d.clone().expect("rendezvous slot empty in reading phase"))
            .collect();
        s.readers_left -= 1;
        if s.readers_left == 0 {
            for slot in s.deposits.iter_mut() {
                *slot = None;
            }
            s.arrived = 0;
            self.cond.notify_all();
        }
        result
    }
}

struct LocalShared {
    size: usize,
    /// One rendezvous cell per [`Channel`].
    cells: [RendezvousCell; 2],
}

/// Factory for in-process peer groups.
pub struct LocalGroup;

impl LocalGroup {
    /// Create an N-rank group and return one transport handle per rank.
    ///
    /// Hand each handle to its own thread; every handle must keep
    /// participating in collectives until its comm is closed, exactly as a
    /// real process group would.
    pub fn create(size: usize) -> Vec<Arc<LocalCollective>> {
        assert!(size > 0, "group size must be at least 1");
        let shared = Arc::new(LocalShared {
            size,
            cells: [RendezvousCell::new(size), RendezvousCell::new(size)],
        });
        (0..size)
            .map(|rank| {
                Arc::new(LocalCollective {
                    rank,
                    shared: Arc::clone(&shared),
                })
            })
            .collect()
    }
}

/// One rank's handle onto an in-process group.
pub struct LocalCollective {
    rank: usize,
    shared: Arc<LocalShared>,
}

impl LocalCollective {
    fn cell(&self, channel: Channel) -> &RendezvousCell {
        &self.shared.cells[channel.index()]
    }

    fn check_vector(&self, name: &str, v: &[u64]) -> MurmurResult<()> {
        if v.len() != self.shared.size {
            return Err(MurmurError::transport(format!(
                "{} has {} entries, group size is {}",
                name,
                v.len(),
                self.shared.size
            )));
        }
        Ok(())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_to_all_counts(&self, channel: Channel, send_counts: &[u64]) -> MurmurResult<Vec<u64>> {
        self.check_vector("send_counts", send_counts)?;
        let deposits = self
            .cell(channel)
            .exchange(self.rank, Deposit::Counts(send_counts.to_vec()));
        deposits
            .iter()
            .map(|d| match d {
                Deposit::Counts(counts) => Ok(counts[self.rank]),
                other => panic!(
                    "collective mismatch on {:?}: expected counts, rank deposited {}",
                    channel,
                    other.kind()
                ),
            })
            .collect()
    }

    fn all_to_all_bytes(
        &self,
        channel: Channel,
        send_buf: &[u8],
        send_counts: &[u64],
        send_offsets: &[u64],
        recv_buf: &mut [u8],
        recv_counts: &[u64],
        recv_offsets: &[u64],
    ) -> MurmurResult<()> {
        self.check_vector("send_counts", send_counts)?;
        self.check_vector("send_offsets", send_offsets)?;
        self.check_vector("recv_counts", recv_counts)?;
        self.check_vector("recv_offsets", recv_offsets)?;

        let mut chunks = Vec::with_capacity(self.shared.size);
        for peer in 0..self.shared.size {
            let start = send_offsets[peer] as usize * ELEMENT_SIZE;
            let len = send_counts[peer] as usize * ELEMENT_SIZE;
            let end = start
                .checked_add(len)
                .filter(|&e| e <= send_buf.len())
                .ok_or_else(|| {
                    MurmurError::transport(format!(
                        "send range for peer {} ({}..{}) exceeds buffer of {} bytes",
                        peer,
                        start,
                        start + len,
                        send_buf.len()
                    ))
                })?;
            chunks.push(send_buf[start..end].to_vec());
        }

        let deposits = self
            .cell(channel)
            .exchange(self.rank, Deposit::Chunks(chunks));

        for (peer, deposit) in deposits.iter().enumerate() {
            let run = match deposit {
                Deposit::Chunks(chunks) => &chunks[self.rank],
                other => panic!(
                    "collective mismatch on {:?}: expected chunks, rank deposited {}",
                    channel,
                    other.kind()
                ),
            };
            let expect = recv_counts[peer] as usize * ELEMENT_SIZE;
            if run.len() != expect {
                return Err(MurmurError::transport(format!(
                    "peer {} shipped {} bytes, counts exchange promised {}",
                    peer,
                    run.len(),
                    expect
                )));
            }
            let start = recv_offsets[peer] as usize * ELEMENT_SIZE;
            let end = start
                .checked_add(expect)
                .filter(|&e| e <= recv_buf.len())
                .ok_or_else(|| {
                    MurmurError::transport(format!(
                        "recv range for peer {} ({}..{}) exceeds buffer of {} bytes",
                        peer,
                        start,
                        start + expect,
                        recv_buf.len()
                    ))
                })?;
            recv_buf[start..end].copy_from_slice(run);
        }
        Ok(())
    }

    fn all_reduce_sum(&self, channel: Channel, value: u64) -> MurmurResult<u64> {
        let deposits = self.cell(channel).exchange(self.rank, Deposit::Sum(value));
        Ok(deposits
            .iter()
            .map(|d| match d {
                Deposit::Sum(v) => *v,
                other => panic!(
                    "collective mismatch on {:?}: expected sum, rank deposited {}",
                    channel,
                    other.kind()
                ),
            })
            .sum())
    }

    fn barrier(&self, channel: Channel) -> MurmurResult<()> {
        let deposits = self.cell(channel).exchange(self.rank, Deposit::Token);
        for d in &deposits {
            match d {
                Deposit::Token => {}
                other => panic!(
                    "collective mismatch on {:?}: expected barrier, rank deposited {}",
                    channel,
                    other.kind()
                ),
            }
        }
        Ok(())
    }
}
