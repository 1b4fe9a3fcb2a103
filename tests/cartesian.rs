use spmd::environment::run_threaded;
use spmd::topology::{dims_create, CartesianLayout};
use spmd::traits::*;
use spmd::ErrorKind;

#[test]
fn periodic_grid_maps_ranks_to_coordinates() {
    run_threaded(6, |universe| {
        let world = universe.world();
        let dims = dims_create(world.size(), 2).unwrap();
        assert_eq!(dims, vec![3, 2]);

        let grid = world
            .create_cartesian_communicator(&dims, &[true, false], false)
            .unwrap()
            .unwrap();
        assert_eq!(grid.num_dimensions(), 2);
        assert_eq!(grid.rank(), world.rank());

        let coords = grid.rank_to_coordinates(grid.rank());
        assert_eq!(coords, vec![world.rank() / 2, world.rank() % 2]);
        assert_eq!(grid.coordinates_to_rank(&coords), grid.rank());
        assert_eq!(
            grid.get_layout(),
            CartesianLayout {
                dims: vec![3, 2],
                periods: vec![true, false],
                coords: coords.clone(),
            }
        );

        // Row axis wraps around, column axis does not.
        assert_eq!(grid.coordinates_to_rank(&[coords[0] + 3, coords[1]]), grid.rank());
        let (up, down) = grid.shift(0, 1);
        assert_eq!(up, Some((grid.rank() + 4) % 6));
        assert_eq!(down, Some((grid.rank() + 2) % 6));
        let (left, right) = grid.shift(1, 1);
        if coords[1] == 0 {
            assert_eq!((left, right), (None, Some(grid.rank() + 1)));
        } else {
            assert_eq!((left, right), (Some(grid.rank() - 1), None));
        }

        // Neighbors along the periodic axis exchange their ranks.
        let (source, destination) = grid.shift(0, 1);
        let next = grid.process_at_rank(destination.unwrap());
        let previous = grid.process_at_rank(source.unwrap());
        next.send(&grid.rank()).unwrap();
        let (received, _) = previous.receive::<i32>().unwrap();
        assert_eq!(received, source.unwrap());
    });
}

#[test]
fn subgroups_keep_the_retained_axes() {
    run_threaded(6, |universe| {
        let world = universe.world();
        let grid = world
            .create_cartesian_communicator(&[2, 3], &[false, true], true)
            .unwrap()
            .unwrap();
        let rows = grid.subgroup(&[false, true]).unwrap();
        assert_eq!(rows.size(), 3);
        assert_eq!(rows.num_dimensions(), 1);
        assert_eq!(rows.rank(), world.rank() % 3);
        let layout = rows.get_layout();
        assert_eq!(layout.dims, vec![3]);
        assert_eq!(layout.periods, vec![true]);

        let mut members = [0i32; 3];
        rows.all_gather_into(&world.rank(), &mut members[..]).unwrap();
        let first = world.rank() / 3 * 3;
        assert_eq!(members, [first, first + 1, first + 2]);
    });
}

#[test]
fn reordering_keeps_parent_ranks() {
    run_threaded(4, |universe| {
        let world = universe.world();
        for reorder in [false, true] {
            let grid = world
                .create_cartesian_communicator(&[2, 2], &[true, true], reorder)
                .unwrap()
                .unwrap();
            assert_eq!(grid.rank(), world.rank());
            assert_eq!(grid.size(), world.size());
        }
    });
}

#[test]
fn ranks_outside_the_grid_get_nothing() {
    let members = run_threaded(5, |universe| {
        let world = universe.world();
        world
            .create_cartesian_communicator(&[2, 2], &[false, false], false)
            .unwrap()
            .map(|grid| grid.size())
    });
    assert_eq!(members, vec![Some(4), Some(4), Some(4), Some(4), None]);
}

#[test]
fn oversized_grids_are_rejected() {
    run_threaded(2, |universe| {
        let world = universe.world();
        let err = world
            .create_cartesian_communicator(&[2, 2], &[false, false], false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dims);
    });
}

#[test]
fn dims_create_balances_factors() {
    assert_eq!(dims_create(12, 2).unwrap(), vec![4, 3]);
    assert_eq!(dims_create(8, 3).unwrap(), vec![2, 2, 2]);
    assert_eq!(dims_create(7, 2).unwrap(), vec![7, 1]);
    assert_eq!(dims_create(1, 1).unwrap(), vec![1]);
}
