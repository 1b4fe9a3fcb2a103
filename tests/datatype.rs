use memoffset::offset_of;

use spmd::datatype::{self, MutView, UserDatatype, View};
use spmd::environment::run_threaded;
use spmd::point_to_point as p2p;
use spmd::topology::{Process, Rank};
use spmd::traits::*;
use spmd::Address;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Sample {
    flag: bool,
    id: u16,
    value: f64,
    readings: [i32; 3],
}

unsafe impl Equivalence for Sample {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1, 3],
            &[
                offset_of!(Sample, flag) as Address,
                offset_of!(Sample, id) as Address,
                offset_of!(Sample, value) as Address,
                offset_of!(Sample, readings) as Address,
            ],
            &[
                bool::equivalent_datatype(),
                u16::equivalent_datatype(),
                f64::equivalent_datatype(),
                i32::equivalent_datatype(),
            ],
        )
    }
}

struct Reversed([i32; 3]);

unsafe impl Equivalence for Reversed {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1],
            &[
                // Logical fields in reverse of their storage order
                (std::mem::size_of::<i32>() * 2) as Address,
                std::mem::size_of::<i32>() as Address,
                0,
            ],
            &[
                i32::equivalent_datatype(),
                i32::equivalent_datatype(),
                i32::equivalent_datatype(),
            ],
        )
    }
}

fn samples(rank: Rank) -> [Sample; 2] {
    [
        Sample {
            flag: true,
            id: 7,
            value: 0.25 * rank as f64,
            readings: [rank, -1, i32::MAX],
        },
        Sample {
            flag: false,
            id: u16::MAX,
            value: -3.5,
            readings: [0, 1, 2],
        },
    ]
}

#[test]
fn mixed_records_pack_without_padding() {
    let datatype = Sample::equivalent_datatype();
    let map = datatype.as_raw().type_map();
    assert_eq!(map.size(), 1 + 2 + 8 + 3 * 4);
    assert_eq!(map.extent() as usize, std::mem::size_of::<Sample>());

    let original = samples(3);
    let packed = datatype::pack(&original[..]);
    assert_eq!(packed.len(), 2 * map.size());

    let mut restored = [Sample::default(); 2];
    assert_eq!(datatype::unpack_into(&packed, &mut restored[..]).unwrap(), 2);
    assert_eq!(restored, original);
}

#[test]
fn mixed_records_travel_between_ranks() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            world.process_at_rank(1).send(&samples(0)[..]).unwrap();
        } else {
            let mut received = [Sample::default(); 2];
            let status = world
                .process_at_rank(0)
                .receive_into(&mut received[..])
                .unwrap();
            assert_eq!(status.count(Sample::equivalent_datatype()), 2);
            assert_eq!(received, samples(0));
        }
    });
}

fn prepare_on_root(process: Process<'_, spmd::topology::SystemCommunicator>, ints: &mut [i32]) {
    for i in ints.iter_mut() {
        *i = if process.is_self() { *i + 10 } else { -1 };
    }
}

#[test]
fn field_order_follows_the_datatype() {
    run_threaded(3, |universe| {
        let world = universe.world();
        let root_process = world.process_at_rank(0);
        let second_root = world.process_at_rank(1);

        if root_process.is_self() {
            let mut ints = Reversed([3, 2, 1]);
            root_process.broadcast_into(&mut ints).unwrap();
            assert_eq!([3, 2, 1], ints.0);
            prepare_on_root(second_root, &mut ints.0);
            second_root.broadcast_into(&mut ints).unwrap();
            assert_eq!([13, 12, 11], ints.0);
        } else {
            let mut ints: [i32; 3] = [0, 0, 0];
            root_process.broadcast_into(&mut ints[..]).unwrap();
            assert_eq!([1, 2, 3], ints);
            prepare_on_root(second_root, &mut ints);
            second_root.broadcast_into(&mut ints[..]).unwrap();
            assert_eq!([11, 12, 13], ints);
        }
    });
}

#[test]
fn vector_views_exchange_strided_elements() {
    run_threaded(3, |universe| {
        let world = universe.world();
        let rank = world.rank();
        let size = world.size();

        let fact = rank as f64;
        let b1: Vec<f64> = (1..).map(|x| fact * x as f64).take(6).collect();
        let mut b2 = vec![-1.0f64; 6];

        let t = UserDatatype::vector(2, 2, 3, &f64::equivalent_datatype());
        {
            let v1 = unsafe { View::with_count_and_datatype(&b1[..], 1, &t) };
            let mut v2 = unsafe { MutView::with_count_and_datatype(&mut b2[..], 1, &t) };
            let next = world.process_at_rank((rank + 1) % size);
            let previous = world.process_at_rank((rank + size - 1) % size);
            p2p::send_receive_into(&v1, &next, &mut v2, &previous).unwrap();
        }

        let p = ((rank + size - 1) % size) as f64;
        assert_eq!(b2, vec![p, 2.0 * p, -1.0, 4.0 * p, 5.0 * p, -1.0]);
    });
}

#[test]
fn indexed_views_pick_blocks() {
    run_threaded(2, |universe| {
        let world = universe.world();
        let t = UserDatatype::indexed(&[1, 2], &[0, 3], &u8::equivalent_datatype());
        if world.rank() == 0 {
            let data = [1u8, 2, 3, 4, 5, 6];
            let view = unsafe { View::with_count_and_datatype(&data[..], 1, &t) };
            world.process_at_rank(1).send(&view).unwrap();
        } else {
            let (msg, _) = world.process_at_rank(0).receive_vec::<u8>().unwrap();
            assert_eq!(msg, vec![1, 4, 5]);
        }
    });
}

#[test]
fn arrays_of_arrays_are_equivalent() {
    run_threaded(2, |universe| {
        let world = universe.world();
        if world.rank() == 0 {
            let grid = [[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
            world.process_at_rank(1).send(&grid).unwrap();
        } else {
            let (grid, _) = world.process_at_rank(0).receive::<[[f32; 2]; 3]>().unwrap();
            assert_eq!(grid, [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        }
    });
}

#[cfg(feature = "complex")]
#[test]
fn complex_numbers_reduce_elementwise() {
    use num_complex::Complex64;
    use spmd::collective::SystemOperation;

    run_threaded(3, |universe| {
        let world = universe.world();
        let mine = Complex64::new(world.rank() as f64, 1.0);
        let mut sum = Complex64::new(0.0, 0.0);
        world
            .all_reduce_into(&mine, &mut sum, SystemOperation::sum())
            .unwrap();
        assert_eq!(sum, Complex64::new(3.0, 3.0));

        let mut product = Complex64::new(0.0, 0.0);
        world
            .all_reduce_into(&mine, &mut product, SystemOperation::product())
            .unwrap();
        // 1i * (1 + 1i) * (2 + 1i)
        assert_eq!(product, Complex64::new(-3.0, 1.0));
    });
}

#[cfg(feature = "complex")]
#[test]
fn complex_numbers_multiply_as_complex_numbers() {
    use num_complex::{Complex32, Complex64};
    use spmd::collective::{reduce_local_into, SystemOperation};
    use spmd::datatype::Primitive;
    use spmd::{Error, ErrorKind};

    let mut z = Complex64::new(3.0, 4.0);
    reduce_local_into(&Complex64::new(1.0, 2.0), &mut z, SystemOperation::product()).unwrap();
    assert_eq!(z, Complex64::new(-5.0, 10.0));

    let mut zs = [Complex32::new(1.0, 1.0), Complex32::new(0.0, 2.0)];
    reduce_local_into(
        &[Complex32::new(1.0, -1.0), Complex32::new(0.0, 2.0)][..],
        &mut zs[..],
        SystemOperation::product(),
    )
    .unwrap();
    assert_eq!(zs, [Complex32::new(2.0, 0.0), Complex32::new(-4.0, 0.0)]);

    for op in [
        SystemOperation::max(),
        SystemOperation::min(),
        SystemOperation::logical_and(),
        SystemOperation::bitwise_xor(),
    ] {
        let mut z = Complex64::new(3.0, 4.0);
        match reduce_local_into(&Complex64::new(1.0, 2.0), &mut z, op) {
            Err(err @ Error::InvalidOperation { .. }) => {
                assert_eq!(err.kind(), ErrorKind::Op);
                assert!(matches!(
                    err,
                    Error::InvalidOperation {
                        primitive: Primitive::ComplexDouble,
                        ..
                    }
                ));
            }
            other => panic!("expected an invalid operation, got {:?}", other),
        }
        assert_eq!(z, Complex64::new(3.0, 4.0));
    }

    let map = Complex64::equivalent_datatype();
    assert_eq!(map.as_raw().type_map().size(), 16);
    assert_eq!(map.as_raw().type_map().extent(), 16);
}
