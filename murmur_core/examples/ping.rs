//! Two-rank ping over the in-process transport.
//!
//! Run with: `cargo run --example ping`
//! Set `RUST_LOG=debug` to watch the flush rounds.

use std::thread;
use std::time::Duration;

use murmur_core::comm::{CommConfig, GroupComm};
use murmur_core::transport::LocalGroup;

fn main() {
    env_logger::init();

    let mut transports = LocalGroup::create(2);
    let t1 = transports.pop().unwrap();
    let t0 = transports.pop().unwrap();

    let pong = thread::spawn(move || {
        let comm = GroupComm::new(t1, CommConfig::with_window(1 << 20)).unwrap();
        loop {
            if let Some((source, payload)) = comm.receive() {
                println!(
                    "rank 1: got {:?} from rank {}",
                    String::from_utf8_lossy(&payload),
                    source
                );
                comm.send(source, b"pong").unwrap();
                comm.flush().unwrap();
                break;
            }
            thread::sleep(Duration::from_micros(100));
        }
        comm.close().unwrap();
    });

    let comm = GroupComm::new(t0, CommConfig::with_window(1 << 20)).unwrap();
    comm.send(1, b"ping").unwrap();
    comm.flush().unwrap();
    loop {
        if let Some((source, payload)) = comm.receive() {
            println!(
                "rank 0: got {:?} from rank {}",
                String::from_utf8_lossy(&payload),
                source
            );
            break;
        }
        thread::sleep(Duration::from_micros(100));
    }
    comm.close().unwrap();
    pong.join().unwrap();
}
