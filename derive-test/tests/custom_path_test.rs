use renamed::traits::*;

/// The `spmd` dependency is renamed, so this only compiles if `#[spmd(crate)]` points the
/// generated code at `::renamed`.
#[test]
fn derive_custom_path() {
    #[derive(Equivalence, Default, Debug, PartialEq)]
    #[spmd(crate = "::renamed")]
    struct Particle {
        position: [f64; 3],
        charge: i32,
    }

    let datatype = Particle::equivalent_datatype();
    assert_eq!(datatype.as_raw().size(), 3 * 8 + 4);

    let particle = Particle {
        position: [1.0, 2.0, 3.0],
        charge: -1,
    };
    let received = renamed::environment::run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            world.process_at_rank(1).send(&particle).unwrap();
            None
        } else {
            Some(world.process_at_rank(0).receive::<Particle>().unwrap().0)
        }
    });
    assert_eq!(received[1].as_ref(), Some(&particle));
}
