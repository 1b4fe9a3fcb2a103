use spmd::environment::run_threaded;
use spmd::point_to_point as p2p;
use spmd::traits::*;
use spmd::Error;

#[test]
fn ring_of_blocking_sends() {
    let received = run_threaded(4, |universe| {
        let world = universe.world();
        let size = world.size();
        let rank = world.rank();
        let next = world.process_at_rank((rank + 1) % size);
        let previous = world.process_at_rank((rank - 1 + size) % size);

        next.send(&rank).unwrap();
        let (msg, status) = previous.receive::<i32>().unwrap();
        assert_eq!(status.source_rank(), previous.rank());
        assert_eq!(status.tag(), 0);
        assert_eq!(status.count(i32::equivalent_datatype()), 1);
        msg
    });
    assert_eq!(received, vec![3, 0, 1, 2]);
}

#[test]
fn messages_on_one_channel_keep_their_order_across_tags() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let receiver = world.process_at_rank(1);
            for (i, tag) in [1, 2, 1, 2].iter().enumerate() {
                receiver.send_with_tag(&(i as u64), *tag).unwrap();
            }
        } else {
            let sender = world.process_at_rank(0);
            let twos: Vec<u64> = (0..2)
                .map(|_| sender.receive_with_tag::<u64>(2).unwrap().0)
                .collect();
            let ones: Vec<u64> = (0..2)
                .map(|_| sender.receive_with_tag::<u64>(1).unwrap().0)
                .collect();
            assert_eq!(twos, vec![1, 3]);
            assert_eq!(ones, vec![0, 2]);
        }
    });
}

#[test]
fn any_source_receives_every_sender() {
    let sums = run_threaded(4, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let mut sources: Vec<i32> = (1..world.size())
                .map(|_| {
                    let (value, status) = world.any_process().receive::<i32>().unwrap();
                    assert_eq!(value, status.source_rank() * 10);
                    status.source_rank()
                })
                .collect();
            sources.sort_unstable();
            sources.iter().sum()
        } else {
            world.process_at_rank(0).send(&(world.rank() * 10)).unwrap();
            0
        }
    });
    assert_eq!(sums[0], 1 + 2 + 3);
}

#[test]
fn vectors_are_received_with_their_length() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let msg = vec![4.0f64, 8.0, 15.0, 16.0, 23.0, 42.0];
            world.process_at_rank(1).send(&msg[..]).unwrap();
        } else {
            let process = world.process_at_rank(0);
            let status = process.probe().unwrap();
            assert_eq!(status.count(f64::equivalent_datatype()), 6);
            let (msg, _) = process.receive_vec::<f64>().unwrap();
            assert_eq!(msg, vec![4.0, 8.0, 15.0, 16.0, 23.0, 42.0]);
        }
    });
}

#[test]
fn oversized_message_is_truncated() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            world.process_at_rank(1).send(&[1i32, 2, 3, 4][..]).unwrap();
        } else {
            let mut buf = [0i32; 2];
            match world.process_at_rank(0).receive_into(&mut buf[..]) {
                Err(Error::Truncated { received, capacity }) => {
                    assert_eq!((received, capacity), (16, 8));
                }
                other => panic!("expected truncation, got {:?}", other),
            }
            assert_eq!(buf, [0, 0]);
        }
    });
}

#[test]
fn partial_elements_are_a_type_mismatch() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            world.process_at_rank(1).send(&[1u8, 2, 3][..]).unwrap();
        } else {
            match world.process_at_rank(0).receive_vec::<i32>() {
                Err(e @ Error::TypeMismatch { .. }) => {
                    assert_eq!(e.kind(), spmd::ErrorKind::Type)
                }
                other => panic!("expected a type mismatch, got {:?}", other),
            }
        }
    });
}

#[test]
fn matched_probe_claims_the_message() {
    run_threaded(3, |universe| {
        let world = universe.world();
        match world.rank() {
            0 => {
                let (message, status) = world.any_process().matched_probe_with_tag(7).unwrap();
                let mut buf = vec![0u16; status.count(u16::equivalent_datatype()) as usize];
                let status = message.matched_receive_into(&mut buf[..]).unwrap();
                assert_eq!(buf, vec![status.source_rank() as u16; 3]);

                let (msg, status) = (world.any_process().matched_probe_with_tag(7).unwrap())
                    .matched_receive_vec::<u16>()
                    .unwrap();
                assert_eq!(msg, vec![status.source_rank() as u16; 3]);
            }
            rank => {
                world
                    .process_at_rank(0)
                    .send_with_tag(&[rank as u16; 3][..], 7)
                    .unwrap();
            }
        }
    });
}

#[test]
fn immediate_probe_sees_nothing_before_a_send() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 1 {
            assert!(world.any_process().immediate_probe_with_tag(99).unwrap().is_none());
        }
        world.barrier().unwrap();
        if world.rank() == 0 {
            world.process_at_rank(1).send_with_tag(&1u8, 99).unwrap();
        } else {
            let status = loop {
                if let Some(status) = world.any_process().immediate_probe_with_tag(99).unwrap() {
                    break status;
                }
            };
            assert_eq!(status.size(), 1);
            let (value, _) = world.any_process().receive_with_tag::<u8>(99).unwrap();
            assert_eq!(value, 1);
        }
    });
}

#[test]
fn send_receive_shifts_around_a_ring() {
    let shifted = run_threaded(5, |universe| {
        let world = universe.world();
        let size = world.size();
        let rank = world.rank();
        let next = world.process_at_rank((rank + 1) % size);
        let previous = world.process_at_rank((rank - 1 + size) % size);

        let (from_previous, _) = p2p::send_receive::<i32, _, _, _>(&rank, &next, &previous).unwrap();

        let mut x = rank;
        p2p::send_receive_replace_into(&mut x, &previous, &next).unwrap();
        assert_eq!(x, (rank + 1) % size);

        let mut buf = [0i32; 2];
        p2p::send_receive_into(&[rank, -rank][..], &next, &mut buf[..], &previous).unwrap();
        assert_eq!(buf, [from_previous, -from_previous]);
        from_previous
    });
    assert_eq!(shifted, vec![4, 0, 1, 2, 3]);
}

#[test]
fn sending_to_oneself_is_buffered() {
    run_threaded(1, |universe| {
        let world = universe.world();
        let me = world.this_process();
        me.send(&[1.5f32, 2.5][..]).unwrap();
        let (msg, status) = me.receive_vec::<f32>().unwrap();
        assert_eq!(msg, vec![1.5, 2.5]);
        assert_eq!(status.source_rank(), 0);
    });
}

#[test]
#[should_panic]
fn negative_send_tags_are_a_usage_error() {
    run_threaded(1, |universe| {
        let world = universe.world();
        let _ = world.this_process().send_with_tag(&0i32, -3);
    });
}
