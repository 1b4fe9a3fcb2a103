use spmd::traits::*;

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();
    println!(
        "Hello parallel world from process {} of {}!",
        world.rank(),
        world.size()
    );
    Ok(())
}
