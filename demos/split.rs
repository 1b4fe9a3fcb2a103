use spmd::topology::Color;
use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();

    let underworld = world
        .split_by_color(Color::with_value(world.rank() % 3))?
        .expect("every process passed a defined color");
    underworld.barrier()?;

    println!(
        "Rank {} of {} on world is rank {} of {} on underworld.",
        world.rank(),
        world.size(),
        underworld.rank(),
        underworld.size()
    );
    Ok(())
}
