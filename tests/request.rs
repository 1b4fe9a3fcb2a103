use spmd::environment::run_threaded;
use spmd::request::{self, RequestCollection, StaticScope, TestAny, WaitGuard};
use spmd::traits::*;

#[test]
fn immediate_send_and_receive_complete_in_a_scope() {
    run_threaded(2, |universe| {
        let world = universe.world();
        let other = world.process_at_rank(1 - world.rank());
        let mine = [world.rank() as f32; 4];
        let mut theirs = [0.0f32; 4];
        request::scope(|scope| {
            let receive = other.immediate_receive_into(scope, &mut theirs[..]);
            let send = other.immediate_send(scope, &mine[..]);
            send.wait().unwrap();
            let status = receive.wait().unwrap();
            assert_eq!(status.source_rank(), other.rank());
            assert_eq!(status.size(), 16);
        });
        assert_eq!(theirs, [other.rank() as f32; 4]);
    });
}

#[test]
fn test_returns_the_request_until_it_completes() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let mut x = 0u32;
            request::scope(|scope| {
                let mut pending = world.process_at_rank(1).immediate_receive_into(scope, &mut x);
                world.process_at_rank(1).send(&0u8).unwrap();
                loop {
                    match pending.test() {
                        Ok(status) => {
                            assert_eq!(status.unwrap().tag(), 3);
                            break;
                        }
                        Err(request) => pending = request,
                    }
                }
            });
            assert_eq!(x, 17);
        } else {
            world.process_at_rank(0).receive::<u8>().unwrap();
            world.process_at_rank(0).send_with_tag(&17u32, 3).unwrap();
        }
    });
}

#[test]
fn receive_futures_hold_their_own_buffer() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let future = world.any_process().immediate_receive::<[u64; 2]>();
            world.process_at_rank(1).send(&0u8).unwrap();
            let (value, status) = future.get().unwrap();
            assert_eq!(value, [5, 6]);
            assert_eq!(status.source_rank(), 1);
        } else {
            world.process_at_rank(0).receive::<u8>().unwrap();
            world.process_at_rank(0).send(&[5u64, 6]).unwrap();
        }
    });
}

#[test]
fn collections_complete_in_any_order() {
    run_threaded(4, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let mut buffers = vec![0i32; 3];
            request::scope(|scope| {
                let mut requests = buffers
                    .iter_mut()
                    .zip(1..)
                    .map(|(buf, source)| {
                        world.process_at_rank(source).immediate_receive_into(scope, buf)
                    })
                    .collect_requests(scope);
                assert_eq!(requests.len(), 3);

                // Release the senders one after the other, last rank first.
                for source in (1..world.size()).rev() {
                    world.process_at_rank(source).send(&0u8).unwrap();
                    let (index, status) = requests.wait_any().unwrap().unwrap();
                    assert_eq!(index, source - 1);
                    assert_eq!(status.source_rank(), source);
                }
                assert!(requests.wait_any().unwrap().is_none());
                assert!(matches!(requests.test_any().unwrap(), TestAny::NoneActive));
                assert_eq!(requests.outstanding(), 0);
            });
            assert_eq!(buffers, vec![10, 20, 30]);
        } else {
            world.process_at_rank(0).receive::<u8>().unwrap();
            world.process_at_rank(0).send(&(world.rank() * 10)).unwrap();
        }
    });
}

#[test]
fn wait_all_returns_statuses_in_request_order() {
    run_threaded(3, |universe| {
        let world = universe.world();
        let rank = world.rank();
        let size = world.size();
        let mut received = vec![0i32; size as usize];
        let sent: Vec<i32> = (0..size).map(|p| rank * 10 + p).collect();
        request::scope(|scope| {
            let mut requests = RequestCollection::with_capacity(scope, 2 * size as usize);
            for (p, buf) in received.iter_mut().enumerate() {
                requests.push(
                    world
                        .process_at_rank(p as i32)
                        .immediate_receive_into(scope, buf),
                );
            }
            for (p, value) in sent.iter().enumerate() {
                requests.push(world.process_at_rank(p as i32).immediate_send(scope, value));
            }
            let statuses = requests.wait_all().unwrap();
            assert_eq!(statuses.len(), 2 * size as usize);
            for (p, status) in statuses.iter().take(size as usize).enumerate() {
                assert_eq!(status.source_rank(), p as i32);
            }
            assert!(requests.test_all().unwrap());
        });
        let expected: Vec<i32> = (0..size).map(|p| p * 10 + rank).collect();
        assert_eq!(received, expected);
    });
}

#[test]
fn wait_guards_complete_on_drop() {
    run_threaded(2, |universe| {
        let world = universe.world();
        let other = world.process_at_rank(1 - world.rank());
        let mut theirs = 0i64;
        request::scope(|scope| {
            let _guard = WaitGuard::from(other.immediate_receive_into(scope, &mut theirs));
            other.send(&(world.rank() as i64 - 5)).unwrap();
        });
        assert_eq!(theirs, other.rank() as i64 - 5);
    });
}

#[test]
fn static_scope_accepts_static_buffers() {
    static GREETING: [u8; 5] = *b"hello";
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            world
                .process_at_rank(1)
                .immediate_send(StaticScope, &GREETING[..])
                .wait()
                .unwrap();
        } else {
            let (msg, _) = world.process_at_rank(0).receive_vec::<u8>().unwrap();
            assert_eq!(&msg[..], b"hello");
        }
    });
}

#[test]
#[should_panic]
fn dropping_an_incomplete_request_panics() {
    run_threaded(1, |universe| {
        let world = universe.world();
        let mut x = 0i32;
        request::scope(|scope| {
            let _ = world.this_process().immediate_receive_into(scope, &mut x);
        });
    });
}
