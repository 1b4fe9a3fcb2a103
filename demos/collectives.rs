use spmd::collective::{self, SystemOperation, UserOperation};
use spmd::datatype::{DynBuffer, DynBufferMut};
use spmd::topology::Rank;
use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();
    let root_rank = 0;
    let root_process = world.process_at_rank(root_rank);

    let mut x = if rank == root_rank { 2u64.pow(10) } else { 0 };
    root_process.broadcast_into(&mut x)?;
    println!("Rank {} received value: {}.", rank, x);

    let count = size as usize;
    if rank == root_rank {
        let mut all = vec![0 as Rank; count];
        root_process.gather_into_root(&rank, &mut all[..])?;
        println!("Root gathered sequence: {:?}.", all);
        assert!(all.iter().enumerate().all(|(a, &b)| b == a as Rank));
    } else {
        root_process.gather_into(&rank)?;
    }

    let mut mine = 0 as Rank;
    if rank == root_rank {
        let v: Vec<Rank> = (0..size).map(|r| r * 10).collect();
        root_process.scatter_into_root(&v[..], &mut mine)?;
    } else {
        root_process.scatter_into(&mut mine)?;
    }
    assert_eq!(mine, rank * 10);

    if rank == root_rank {
        let mut sum: Rank = 0;
        root_process.reduce_into_root(&rank, &mut sum, SystemOperation::sum())?;
        assert_eq!(sum, size * (size - 1) / 2);
    } else {
        root_process.reduce_into(&rank, SystemOperation::sum())?;
    }

    let mut max: Rank = 0;
    world.all_reduce_into(&rank, &mut max, SystemOperation::max())?;
    assert_eq!(max, size - 1);

    let mut prefix: Rank = 0;
    world.scan_into(&rank, &mut prefix, SystemOperation::sum())?;
    assert_eq!(prefix, rank * (rank + 1) / 2);

    let mut product: Rank = 0;
    world.all_reduce_into(
        &(rank + 1),
        &mut product,
        &UserOperation::commutative(|x: DynBuffer, y: DynBufferMut| {
            let x: &[Rank] = x.downcast().expect("operands are ranks");
            let y: &mut [Rank] = y.downcast().expect("operands are ranks");
            for (&x_i, y_i) in x.iter().zip(y) {
                *y_i *= x_i;
            }
        }),
    )?;
    println!("Rank {} computed {}! = {}.", rank, size, product);

    let mut h = 0b1100u8;
    collective::reduce_local_into(&0b1010u8, &mut h, SystemOperation::bitwise_and())?;
    assert_eq!(h, 0b1000);

    world.barrier()?;
    Ok(())
}
