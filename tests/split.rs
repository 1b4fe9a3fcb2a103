use spmd::collective::SystemOperation;
use spmd::environment::run_threaded;
use spmd::topology::{Color, CommunicatorRelation, GroupRelation, Rank, SystemGroup};
use spmd::traits::*;

#[test]
fn split_by_parity_gives_dense_subgroups() {
    let layouts = run_threaded(5, |universe| {
        let world = universe.world();
        let color = Color::with_value(world.rank() % 2);
        let half = world.split_by_color(color).unwrap().unwrap();

        // Ranks are dense and follow the world order.
        assert_eq!(half.rank(), world.rank() / 2);

        let mut members = vec![0 as Rank; half.size() as usize];
        half.all_gather_into(&world.rank(), &mut members[..]).unwrap();
        (half.size(), members)
    });
    assert_eq!(layouts[0], (3, vec![0, 2, 4]));
    assert_eq!(layouts[1], (2, vec![1, 3]));
    assert_eq!(layouts[0].0 + layouts[1].0, 5);
}

#[test]
fn keys_order_the_new_ranks() {
    let ranks = run_threaded(4, |universe| {
        let world = universe.world();
        let reversed = world
            .split_by_color_with_key(Color::with_value(0), -world.rank())
            .unwrap()
            .unwrap();
        reversed.rank()
    });
    assert_eq!(ranks, vec![3, 2, 1, 0]);
}

#[test]
fn equal_keys_fall_back_to_the_old_rank() {
    let ranks = run_threaded(4, |universe| {
        let world = universe.world();
        let comm = world
            .split_by_color_with_key(Color::with_value(1), 7)
            .unwrap()
            .unwrap();
        comm.rank()
    });
    assert_eq!(ranks, vec![0, 1, 2, 3]);
}

#[test]
fn undefined_color_opts_out() {
    let joined = run_threaded(3, |universe| {
        let world = universe.world();
        let color = if world.rank() == 1 {
            Color::undefined()
        } else {
            Color::with_value(0)
        };
        world
            .split_by_color(color)
            .unwrap()
            .map(|comm| comm.size())
    });
    assert_eq!(joined, vec![Some(2), None, Some(2)]);
}

#[test]
fn traffic_on_sub_communicators_stays_separate() {
    run_threaded(2, |universe| {
        let world = universe.world();
        let dup = world.duplicate().unwrap();
        assert_eq!(world.compare(&dup), CommunicatorRelation::Congruent);
        assert_eq!(dup.compare(&dup), CommunicatorRelation::Identical);

        if world.rank() == 0 {
            world.process_at_rank(1).send(&1i32).unwrap();
            dup.process_at_rank(1).send(&2i32).unwrap();
        } else {
            let (on_dup, _) = dup.process_at_rank(0).receive::<i32>().unwrap();
            let (on_world, _) = world.process_at_rank(0).receive::<i32>().unwrap();
            assert_eq!((on_world, on_dup), (1, 2));
        }

        let mut sum = 0;
        dup.all_reduce_into(&(world.rank() + 1), &mut sum, SystemOperation::sum())
            .unwrap();
        assert_eq!(sum, 3);
    });
}

#[test]
fn groups_split_into_communicators() {
    run_threaded(4, |universe| {
        let world = universe.world();
        let group = world.group();
        assert_eq!(group.size(), 4);
        assert_eq!(group.rank(), Some(world.rank()));

        let odd = group.include(&[3, 1]);
        let even = group.exclude(&[1, 3]);
        assert_eq!(odd.compare(&even), GroupRelation::Unequal);
        assert_eq!(odd.union(&even).size(), 4);
        assert_eq!(odd.intersection(&even).size(), 0);
        assert_eq!(group.difference(&odd).compare(&even), GroupRelation::Identical);
        assert_eq!(odd.translate_rank(0, &group), Some(3));
        assert_eq!(SystemGroup::empty().compare(&odd.intersection(&even)), GroupRelation::Identical);

        let mine = if world.rank() % 2 == 1 { &odd } else { &even };
        let comm = world.split_by_subgroup_collective(mine).unwrap().unwrap();
        let expected = match world.rank() {
            3 => 0,
            1 => 1,
            r => r / 2,
        };
        assert_eq!(comm.rank(), expected);
        assert_eq!(comm.compare(&world), CommunicatorRelation::Unequal);

        let mut max = -1;
        comm.all_reduce_into(&world.rank(), &mut max, SystemOperation::max())
            .unwrap();
        assert_eq!(max, if world.rank() % 2 == 1 { 3 } else { 2 });
    });
}

#[test]
fn communicators_carry_names() {
    run_threaded(2, |universe| {
        let world = universe.world();
        assert_eq!(world.get_name(), "world");
        let dup = world.duplicate().unwrap();
        dup.set_name("halo exchange");
        assert_eq!(dup.get_name(), "halo exchange");
        assert_eq!(world.get_name(), "world");
    });
}
