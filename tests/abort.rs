use spmd::environment::run_threaded;
use spmd::traits::*;
use spmd::{Error, ErrorKind};

#[test]
#[should_panic(expected = "observed the abort")]
fn abort_reaches_blocked_ranks() {
    run_threaded(3, |universe| {
        let world = universe.world();
        match world.rank() {
            0 | 2 => match world.process_at_rank(1).receive::<i32>() {
                Err(Error::Aborted { rank, code }) => {
                    assert_eq!((rank, code), (1, 3));
                    panic!("rank {} observed the abort", world.rank());
                }
                other => panic!("expected an abort, got {:?}", other),
            },
            _ => world.abort(3),
        }
    });
}

#[test]
#[should_panic(expected = "worker failed")]
fn a_panicking_rank_aborts_its_peers() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 1 {
            let err = world.barrier().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Aborted);
            panic!("worker failed after {}", err);
        }
        panic!("worker failed on purpose");
    });
}
