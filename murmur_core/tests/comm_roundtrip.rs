//! End-to-end comm scenarios over the in-process transport.
//!
//! Each test spins up an N-rank group with one thread per rank, runs a
//! traffic pattern, and checks what the receivers observe: same bytes,
//! same per-source order, same unpadded lengths. Receivers poll — receive
//! never blocks — so loops sleep briefly between misses the way a real
//! polling loop would.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use murmur_core::comm::{CommConfig, GroupComm};
use murmur_core::transport::LocalGroup;

/// Run `f` once per rank, each on its own thread, with a fresh group.
fn run_ranks<F>(size: usize, config: CommConfig, f: F)
where
    F: Fn(&GroupComm) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let threads: Vec<_> = LocalGroup::create(size)
        .into_iter()
        .map(|transport| {
            let f = Arc::clone(&f);
            let config = config.clone();
            thread::spawn(move || {
                let comm = GroupComm::new(transport, config).unwrap();
                (*f)(&comm);
                comm.close().unwrap();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

fn recv_any_blocking(comm: &GroupComm) -> (usize, Vec<u8>) {
    loop {
        if let Some(hit) = comm.receive() {
            return hit;
        }
        thread::sleep(Duration::from_micros(100));
    }
}

fn recv_from_blocking(comm: &GroupComm, source: usize) -> Vec<u8> {
    loop {
        if let Some(payload) = comm.receive_from(source) {
            return payload;
        }
        thread::sleep(Duration::from_micros(100));
    }
}

#[test]
fn two_peer_ping() {
    run_ranks(2, CommConfig::with_window(1 << 20), |comm| {
        if comm.rank() == 0 {
            comm.send(1, b"hello").unwrap();
            comm.flush().unwrap();
        } else {
            let (source, payload) = recv_any_blocking(comm);
            assert_eq!(source, 0);
            assert_eq!(payload, b"hello");
        }
    });
}

#[test]
fn repeated_barriers_do_not_hang() {
    run_ranks(2, CommConfig::with_window(1 << 20), |comm| {
        for _ in 0..100 {
            comm.barrier().unwrap();
        }
    });
}

/// Chunked throughput sweep, scaled down for CI. The full-size version of
/// the original driver (64 MiB per chunk size) is below, ignored.
#[test]
fn chunked_sweep_delivers_every_size() {
    chunked_sweep(256 * 1024, 4..14, CommConfig::with_window(1 << 20));
}

#[test]
#[ignore = "full-size sweep moves 64 MiB per chunk size"]
fn chunked_sweep_full_size() {
    chunked_sweep(64 * 1024 * 1024, 4..24, CommConfig::with_window(64 << 20));
}

fn chunked_sweep(total: usize, sizes: std::ops::Range<u32>, config: CommConfig) {
    run_ranks(2, config, move |comm| {
        for i in sizes.clone() {
            let chunk = 1usize << i;
            let iterations = total / chunk;
            if comm.rank() == 0 {
                let payload = vec![i as u8; chunk];
                for _ in 0..iterations {
                    comm.send(1, &payload).unwrap();
                }
                comm.flush().unwrap();
            } else {
                for _ in 0..iterations {
                    let payload = recv_from_blocking(comm, 0);
                    assert_eq!(payload.len(), chunk);
                    assert!(payload.iter().all(|&b| b == i as u8));
                }
            }
            comm.barrier().unwrap();
        }
    });
}

/// A payload far larger than the per-peer slot still arrives as one
/// message: W = 4096 over 4 ranks leaves 1024-byte slots, so a 10 000-byte
/// send spans many flushes.
#[test]
fn message_larger_than_slot_survives_multi_flush() {
    let original: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let expected = original.clone();
    run_ranks(4, CommConfig::with_window(4096), move |comm| {
        match comm.rank() {
            0 => {
                comm.send(1, &original).unwrap();
                comm.flush().unwrap();
            }
            1 => {
                let payload = recv_from_blocking(comm, 0);
                assert_eq!(payload.len(), 10_000);
                assert_eq!(payload, expected);
                // exactly one message
                assert!(comm.receive_from(0).is_none());
            }
            _ => {}
        }
        comm.barrier().unwrap();
    });
}

/// Two producers hammer one target; per-source order must match each
/// sender's send order, cross-source order is unconstrained.
#[test]
fn per_source_fifo_with_two_producers() {
    const MESSAGES: u32 = 1000;

    fn message(source: usize, seq: u32) -> Vec<u8> {
        let mut payload = vec![source as u8; 37];
        payload[1..5].copy_from_slice(&seq.to_le_bytes());
        payload
    }

    run_ranks(3, CommConfig::with_window(1 << 20), |comm| {
        match comm.rank() {
            0 | 2 => {
                for seq in 0..MESSAGES {
                    comm.send(1, &message(comm.rank(), seq)).unwrap();
                }
                comm.flush().unwrap();
            }
            _ => {
                let mut next_seq = [0u32; 3];
                for _ in 0..2 * MESSAGES {
                    let (source, payload) = recv_any_blocking(comm);
                    assert_eq!(payload.len(), 37);
                    assert_eq!(payload[0] as usize, source);
                    let seq = u32::from_le_bytes(payload[1..5].try_into().unwrap());
                    assert_eq!(seq, next_seq[source], "out of order from rank {}", source);
                    next_seq[source] += 1;
                }
                assert_eq!(next_seq, [MESSAGES, 0, MESSAGES]);
            }
        }
        comm.barrier().unwrap();
    });
}

/// Round-robin receive returns each pending message exactly once with the
/// right source attribution.
#[test]
fn round_robin_receive_sees_both_sources() {
    run_ranks(3, CommConfig::with_window(1 << 20), |comm| {
        match comm.rank() {
            0 | 2 => {
                let payload = vec![comm.rank() as u8; 64];
                comm.send(1, &payload).unwrap();
                comm.flush().unwrap();
            }
            _ => {
                let first = recv_any_blocking(comm);
                let second = recv_any_blocking(comm);
                let mut sources = [first.0, second.0];
                sources.sort_unstable();
                assert_eq!(sources, [0, 2]);
                for (source, payload) in [first, second] {
                    assert_eq!(payload, vec![source as u8; 64]);
                }
            }
        }
        comm.barrier().unwrap();
    });
}

/// Dropping every comm tears the group down without deadlock: the
/// flushers keep exchanging until the termination reduction counts all
/// ranks done.
#[test]
fn group_terminates_on_drop() {
    let threads: Vec<_> = LocalGroup::create(4)
        .into_iter()
        .map(|transport| {
            thread::spawn(move || {
                let comm = GroupComm::new(transport, CommConfig::with_window(1 << 16)).unwrap();
                if comm.rank() == 0 {
                    comm.send(3, b"parting shot").unwrap();
                }
                // rank 0's staged bytes may or may not be delivered before
                // the group agrees to stop; drop must not hang either way
                drop(comm);
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

/// With the reclamation threshold at zero, every reset remaps its window;
/// traffic must still round-trip intact (and the length invariants hold,
/// or the counts exchange would tear).
#[test]
fn reclamation_every_flush_keeps_traffic_intact() {
    let config = CommConfig {
        send_window_bytes: 4096,
        reclaim_idle_ms: 0,
        ..CommConfig::default()
    };
    run_ranks(2, config, |comm| {
        if comm.rank() == 0 {
            for round in 0..50u8 {
                comm.send(1, &vec![round; 100]).unwrap();
                comm.flush().unwrap();
            }
        } else {
            for round in 0..50u8 {
                let payload = recv_from_blocking(comm, 0);
                assert_eq!(payload, vec![round; 100]);
            }
        }
        comm.barrier().unwrap();
    });
}

/// barrier_flush is collective on the external channel: every rank calls
/// it the same number of times, and staged bytes ride along.
#[test]
fn barrier_flush_moves_staged_bytes() {
    run_ranks(2, CommConfig::with_window(1 << 16), |comm| {
        if comm.rank() == 0 {
            comm.send(1, b"via external channel").unwrap();
        }
        comm.barrier_flush().unwrap();
        if comm.rank() == 1 {
            let payload = recv_from_blocking(comm, 0);
            assert_eq!(payload, b"via external channel");
        }
        comm.barrier().unwrap();
    });
}

/// The hard case for cross-channel ordering: a stream of numbered sends
/// to one target, flushed on the internal channel, while a second thread
/// on every rank runs barrier_flush on the external channel the whole
/// time. External exchanges finish out of step with internal rounds, but
/// scatters are gated into swap order, so the receiver must observe the
/// exact send sequence — any gap or swap here means the drain-order gate
/// regressed.
#[test]
fn barrier_flush_racing_internal_traffic_keeps_fifo() {
    const MESSAGES: u32 = 300;
    const BARRIER_FLUSHES: u32 = 40;

    run_ranks(2, CommConfig::with_window(1 << 16), |comm| {
        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..BARRIER_FLUSHES {
                    comm.barrier_flush().unwrap();
                    thread::sleep(Duration::from_micros(200));
                }
            });
            if comm.rank() == 0 {
                for seq in 0..MESSAGES {
                    comm.send(1, &seq.to_le_bytes()).unwrap();
                    if seq % 7 == 0 {
                        comm.flush().unwrap();
                    }
                }
                comm.flush().unwrap();
            } else {
                for expect in 0..MESSAGES {
                    let payload = recv_from_blocking(comm, 0);
                    let seq = u32::from_le_bytes(payload[..4].try_into().unwrap());
                    assert_eq!(
                        seq, expect,
                        "delivery order diverged from send order under barrier_flush races"
                    );
                }
            }
        });
        comm.barrier().unwrap();
    });
}

/// Concurrent closers must all wait for the real shutdown: none may
/// return while the flusher is still joining.
#[test]
fn concurrent_close_is_a_completion_barrier() {
    let threads: Vec<_> = LocalGroup::create(2)
        .into_iter()
        .map(|transport| {
            thread::spawn(move || {
                let comm = GroupComm::new(transport, CommConfig::with_window(1 << 16)).unwrap();
                thread::scope(|s| {
                    for _ in 0..4 {
                        s.spawn(|| comm.close().unwrap());
                    }
                });
                // after every closer returned, a send must be rejected
                assert!(comm.send(0, b"too late").is_err());
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

/// Contract violations are reported, not staged.
#[test]
fn invalid_sends_are_rejected() {
    run_ranks(2, CommConfig::with_window(1 << 16), |comm| {
        assert!(comm.send(7, b"no such rank").is_err());
        assert!(comm.send(0, b"").is_err());
        assert!(comm.receive_from(9).is_none());
    });
}
