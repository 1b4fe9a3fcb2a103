use spmd::topology::cartesian;
use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();

    let dims = cartesian::dims_create(world.size(), 2)?;
    let periods = [true, false];
    let comm = match world.create_cartesian_communicator(&dims, &periods, false)? {
        Some(comm) => comm,
        None => return Ok(()),
    };

    let layout = comm.get_layout();
    println!(
        "Rank {} sits at {:?} in a {:?} grid with periods {:?}.",
        comm.rank(),
        layout.coords,
        layout.dims,
        layout.periods
    );
    assert_eq!(comm.coordinates_to_rank(&layout.coords), comm.rank());

    // Pass each rank along the periodic axis.
    let (source, destination) = comm.shift(0, 1);
    let (source, destination) = (
        source.expect("axis 0 is periodic"),
        destination.expect("axis 0 is periodic"),
    );
    let (from, _) = spmd::point_to_point::send_receive::<i32, _, _, _>(
        &comm.rank(),
        &comm.process_at_rank(destination),
        &comm.process_at_rank(source),
    )?;
    assert_eq!(from, source);

    let rows = comm.subgroup(&[true, false])?;
    println!(
        "Rank {} is rank {} of {} along axis 0.",
        comm.rank(),
        rows.rank(),
        rows.size()
    );
    Ok(())
}
