#![allow(clippy::float_cmp)]

use spmd::point_to_point as p2p;
use spmd::topology::Rank;
use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();
    let size = world.size();
    let rank = world.rank();

    let next_rank = (rank + 1) % size;
    let next_process = world.process_at_rank(next_rank);
    let previous_rank = (rank + size - 1) % size;
    let previous_process = world.process_at_rank(previous_rank);

    let (msg, status) = p2p::send_receive::<Rank, _, _, _>(&rank, &previous_process, &next_process)?;
    println!(
        "Process {} got message {}.\nStatus is: {:?}",
        rank, msg, status
    );
    world.barrier()?;
    assert_eq!(msg, next_rank);

    if rank > 0 {
        let msg: [u64; 4] = [rank as u64, 2, 3, 4];
        world.process_at_rank(0).send(&msg[..])?;
    } else {
        for _ in 1..size {
            let (msg, status) = world.any_process().receive_vec::<u64>()?;
            println!(
                "Process {} got long message {:?}.\nStatus is: {:?}",
                rank, msg, status
            );
        }
    }
    world.barrier()?;

    let mut x = rank as f32;
    p2p::send_receive_replace_into(&mut x, &next_process, &previous_process)?;
    assert_eq!(x, previous_rank as f32);
    Ok(())
}
