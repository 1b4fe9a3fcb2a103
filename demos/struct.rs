use spmd::traits::*;

#[derive(Equivalence, Default, Debug, PartialEq)]
struct TupleType([f32; 2], u8);

#[derive(Equivalence, Default, Debug, PartialEq)]
struct ComplexDatatype {
    b: bool,
    ints: [i32; 4],
    tuple: TupleType,
}

fn main() -> spmd::Result<()> {
    let universe = spmd::initialize()?;
    let world = universe.world();
    let root_process = world.process_at_rank(0);

    let mut data = if world.rank() == 0 {
        ComplexDatatype {
            b: true,
            ints: [1, -2, 3, -4],
            tuple: TupleType([-0.1, 0.1], 7),
        }
    } else {
        ComplexDatatype::default()
    };

    root_process.broadcast_into(&mut data)?;

    assert!(data.b);
    assert_eq!([1, -2, 3, -4], data.ints);
    assert_eq!([-0.1, 0.1], data.tuple.0);
    assert_eq!(7, data.tuple.1);
    println!("Rank {} received {:?}.", world.rank(), data);
    Ok(())
}
