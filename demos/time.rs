use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();

    let t_start = universe.get_time();
    world.barrier()?;
    let t_end = universe.get_time();

    println!("barrier took: {} s", t_end - t_start);
    println!(
        "the clock has a resolution of {} seconds",
        universe.get_time_res()
    );
    Ok(())
}
