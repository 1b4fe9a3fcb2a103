#![cfg(feature = "derive")]

use spmd::datatype;
use spmd::environment::run_threaded;
use spmd::traits::*;

const CONSTANT: usize = 7;

/// `#[derive(Equivalence)]` has to cast CONSTANT to a `Count`, while the Rust array needs a
/// `usize`.
#[test]
fn derive_equivalence() {
    #[derive(Equivalence)]
    struct ArrayWrapper {
        field: [f32; CONSTANT],
    }

    let datatype = ArrayWrapper::equivalent_datatype();
    assert_eq!(datatype.as_raw().size(), 4 * CONSTANT);
}

#[derive(Equivalence, Default, Debug, PartialEq, Clone, Copy)]
struct MyDataRust {
    b: bool,
    f: f64,
    i: u16,
}

#[derive(Equivalence, Default, Debug, PartialEq)]
#[repr(C)]
struct MyDataC {
    b: bool,
    f: f64,
    i: u16,
}

#[derive(Equivalence, Default, Debug, PartialEq)]
struct MyDataOrdered {
    bf: (bool, f64),
    i: u16,
}

#[derive(Equivalence, Default, Debug, PartialEq)]
struct MyDataNestedTuple {
    bfi: (bool, (f64, u16)),
}

#[derive(Equivalence, Default, Debug, PartialEq)]
struct MyDataUnnamed(bool, f64, u16);

#[derive(Equivalence, Default, Debug, PartialEq)]
struct BoolBoolBool(bool, bool, bool);

#[derive(Equivalence, Default, Debug, PartialEq)]
struct ThreeDimensionalArray {
    b: [[[bool; 2]; 4]; 8],
}

#[derive(Equivalence, Default, Debug, PartialEq)]
struct ArrayOfTuples {
    a: [(u8, u16); 3],
}

#[derive(Equivalence, Default, Debug, PartialEq)]
struct Complex {
    data: MyDataRust,
    tuple: (bool, i8),
    items: [MyDataOrdered; 2],
}

#[derive(Equivalence, Default, Debug, PartialEq)]
struct Empty;

fn assert_round_trip<T>(value: T)
where
    T: Equivalence + Default + PartialEq + std::fmt::Debug,
{
    let packed = datatype::pack(&value);
    let mut restored = T::default();
    datatype::unpack_into(&packed, &mut restored).unwrap();
    assert_eq!(value, restored);
}

#[test]
fn derived_layouts_pack_field_for_field() {
    assert_round_trip(MyDataRust {
        b: true,
        f: 3.4,
        i: 7,
    });
    assert_round_trip(MyDataC {
        b: true,
        f: 3.4,
        i: 7,
    });
    assert_round_trip(MyDataOrdered {
        bf: (true, 3.4),
        i: 7,
    });
    assert_round_trip(MyDataNestedTuple {
        bfi: (true, (3.4, 7)),
    });
    assert_round_trip(MyDataUnnamed(true, 3.4, 7));
    assert_round_trip(BoolBoolBool(true, false, true));
    let mut b = [[[false; 2]; 4]; 8];
    b[3][2][1] = true;
    b[7][0][0] = true;
    assert_round_trip(ThreeDimensionalArray { b });
    assert_round_trip(ArrayOfTuples {
        a: [(1, 2), (3, 4), (5, 6)],
    });
    assert_round_trip(Complex {
        data: MyDataRust {
            b: false,
            f: -1.5,
            i: 9,
        },
        tuple: (true, -3),
        items: [
            MyDataOrdered {
                bf: (true, 0.5),
                i: 1,
            },
            MyDataOrdered {
                bf: (false, 2.5),
                i: 2,
            },
        ],
    });
    assert_round_trip(Empty);
}

#[test]
fn derived_types_are_sent_between_ranks() {
    run_threaded(2, |universe| {
        let world = universe.world();
        let data = [
            MyDataRust {
                b: true,
                f: 1.25,
                i: 3,
            },
            MyDataRust {
                b: false,
                f: -8.0,
                i: 65535,
            },
        ];
        if world.rank() == 0 {
            world.process_at_rank(1).send(&data[..]).unwrap();
        } else {
            let (received, _) = world.process_at_rank(0).receive_vec::<MyDataRust>().unwrap();
            assert_eq!(&received[..], &data[..]);
        }
    });
}
