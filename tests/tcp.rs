use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use spmd::collective::SystemOperation;
use spmd::environment::{initialize_with_fabric, Collectives, Config};
use spmd::fabric::TcpFabric;
use spmd::traits::*;

/// Runs `f` on `size` ranks connected over loopback TCP, one thread per rank.
fn loopback<F, R>(size: usize, collectives: Collectives, f: F) -> Vec<R>
where
    F: Fn(spmd::Universe) -> R + Send + Sync + Copy + 'static,
    R: Send + 'static,
{
    let listeners: Vec<_> = (0..size)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let peers: Vec<_> = listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap())
        .collect();
    let handles: Vec<_> = listeners
        .into_iter()
        .enumerate()
        .map(|(rank, listener)| {
            let peers = peers.clone();
            thread::spawn(move || {
                let fabric =
                    TcpFabric::from_listener(rank, listener, peers, Duration::from_secs(10))
                        .unwrap();
                let config = Config {
                    collectives,
                    ..Config::default()
                };
                f(initialize_with_fabric(fabric, &config))
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect()
}

#[test]
fn ring_round_trip_over_loopback() {
    let received = loopback(3, Collectives::BinomialTree, |universe| {
        let world = universe.world();
        let size = world.size();
        let rank = world.rank();
        let next = world.process_at_rank((rank + 1) % size);
        let previous = world.process_at_rank((rank + size - 1) % size);

        let payload: Vec<u32> = (0..1000).map(|i| i * rank as u32).collect();
        next.send(&payload[..]).unwrap();
        let (msg, status) = previous.receive_vec::<u32>().unwrap();
        assert_eq!(status.source_rank(), previous.rank());
        msg[1] as i32
    });
    assert_eq!(received, vec![2, 0, 1]);
}

#[test]
fn collectives_over_loopback() {
    for collectives in [Collectives::Linear, Collectives::BinomialTree] {
        let sums = loopback(4, collectives, |universe| {
            let world = universe.world();
            let mut sum = 0i32;
            world
                .all_reduce_into(&world.rank(), &mut sum, SystemOperation::sum())
                .unwrap();

            let mut x = if world.rank() == 2 { 99u16 } else { 0 };
            world.process_at_rank(2).broadcast_into(&mut x).unwrap();
            assert_eq!(x, 99);
            world.barrier().unwrap();
            sum
        });
        assert_eq!(sums, vec![6; 4]);
    }
}
