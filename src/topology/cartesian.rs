//! Cartesian topologies
//!
//! Ranks of a Cartesian communicator are the row-major mixed radix numbers of their
//! coordinates: the last dimension varies fastest. Periodic dimensions wrap around.

use smallvec::SmallVec;

use super::{AsCommunicator, Color, Communicator, RawCommunicator, Rank, UserCommunicator};
use crate::error::{Error, Result};
use crate::raw::traits::*;
use crate::{Count, IntArray};

/// Contains arrays describing the layout of the
/// [`CartesianCommunicator`](struct.CartesianCommunicator.html).
///
/// dims[i] is the extent of the array in axis i, periods[i] is true if axis i is periodic, and
/// coords[i] is the cartesian coordinate for the local rank in axis i.
///
/// Each array, when received from a method in
/// [`CartesianCommunicator`](struct.CartesianCommunicator.html), will be of length
/// [`num_dimensions`](struct.CartesianCommunicator.html#method.num_dimensions).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CartesianLayout {
    /// dims[i] is the extent of the array in axis i
    pub dims: Vec<Count>,
    /// periods[i] is true if axis i is periodic, meaning an element at dims[i] - 1 in axis i
    /// is neighbors with element 0 in axis i
    pub periods: Vec<bool>,
    /// coords[i] is the cartesian coordinate for the local rank in axis i
    pub coords: Vec<Count>,
}

/// A `CartesianCommunicator` is a communicator where ranks are laid out in an n-dimensional
/// cartesian space. This gives ranks neighbors in each of those dimensions.
///
/// Obtained from
/// [`create_cartesian_communicator`](../trait.Communicator.html#method.create_cartesian_communicator).
#[derive(Debug)]
pub struct CartesianCommunicator {
    comm: UserCommunicator,
    dims: IntArray,
    periods: SmallVec<[bool; 8]>,
}

pub(super) fn create(
    raw: &RawCommunicator,
    dims: &[Count],
    periods: &[bool],
) -> Result<Option<CartesianCommunicator>> {
    assert_eq!(
        dims.len(),
        periods.len(),
        "dims and periods must be parallel, equal-sized arrays"
    );
    if let Some(d) = dims.iter().find(|&&d| d <= 0) {
        return Err(Error::Dims(format!(
            "cartesian dimensions must be positive, got {}",
            d
        )));
    }
    let cells = dims
        .iter()
        .try_fold(1 as Count, |product, &d| product.checked_mul(d))
        .filter(|&cells| cells <= raw.size())
        .ok_or_else(|| {
            Error::Dims(format!(
                "a grid of {:?} does not fit a communicator of size {}",
                dims,
                raw.size()
            ))
        })?;

    let color = if raw.rank() < cells {
        Color::with_value(0)
    } else {
        Color::undefined()
    };
    Ok(raw.split(color, raw.rank())?.map(|comm| CartesianCommunicator {
        comm: UserCommunicator(comm),
        dims: dims.iter().copied().collect(),
        periods: periods.iter().copied().collect(),
    }))
}

impl CartesianCommunicator {
    /// Returns the number of dimensions that the Cartesian communicator was established over.
    pub fn num_dimensions(&self) -> Count {
        self.dims.len() as Count
    }

    /// Returns the topological structure of the Cartesian communicator
    pub fn get_layout(&self) -> CartesianLayout {
        CartesianLayout {
            dims: self.dims.to_vec(),
            periods: self.periods.to_vec(),
            coords: self.rank_to_coordinates(self.rank()),
        }
    }

    /// Converts a set of cartesian coordinates to its rank in the CartesianCommunicator.
    ///
    /// Coordinates in periodic axes that are out of range are shifted back into the dimensions of
    /// the communicator.
    ///
    /// Panics if `coords` is not of length [`num_dimensions`](#method.num_dimensions), or if a
    /// coordinate in a non-periodic axis is out of range.
    pub fn coordinates_to_rank(&self, coords: &[Count]) -> Rank {
        assert_eq!(
            self.dims.len(),
            coords.len(),
            "The coordinates slice must be the same length as the number of dimension in the \
             CartesianCommunicator"
        );
        for (i, ((&c, &d), &periodic)) in coords.iter().zip(&self.dims).zip(&self.periods).enumerate()
        {
            if !periodic {
                assert!(
                    0 <= c && c < d,
                    "The non-periodic coordinate (coords[{}] = {}) must be within the bounds of \
                     the CartesianCommunicator (dims[{}] = {})",
                    i,
                    c,
                    i,
                    d
                );
            }
        }
        coordinates_to_rank(&self.dims, &self.periods, coords)
    }

    /// Receives into `coords` the cartesian coordinates of `rank`.
    ///
    /// Panics if `rank` is not a non-negative value less than
    /// [`size`](../trait.Communicator.html#method.size), or if `coords` is not of length
    /// [`num_dimensions`](#method.num_dimensions).
    pub fn rank_to_coordinates_into(&self, rank: Rank, coords: &mut [Count]) {
        assert!(
            rank >= 0 && rank < self.size(),
            "rank ({}) must be in the range [0,{})",
            rank,
            self.size()
        );
        assert_eq!(
            self.dims.len(),
            coords.len(),
            "The coordinates slice must be the same length as the number of dimension in the \
             CartesianCommunicator"
        );
        rank_to_coordinates_into(&self.dims, rank, coords)
    }

    /// Returns the cartesian coordinates of `rank`, where `coords[i]` is the cartesian coordinate
    /// of `rank` in axis i.
    ///
    /// Panics if `rank` is not a non-negative value less than
    /// [`size`](../trait.Communicator.html#method.size).
    pub fn rank_to_coordinates(&self, rank: Rank) -> Vec<Count> {
        let mut coords = vec![0; self.dims.len()];
        self.rank_to_coordinates_into(rank, &mut coords[..]);
        coords
    }

    /// Retrieves targets in `dimension` shifted from the current rank by displacing in the negative
    /// direction by `displacement` units for the first returned rank and in the positive direction
    /// for the second returned rank.
    ///
    /// A shift beyond the edge of a non-periodic axis yields `None`.
    ///
    /// Panics if `dimension` is not a valid axis.
    pub fn shift(&self, dimension: Count, displacement: Count) -> (Option<Rank>, Option<Rank>) {
        assert!(
            dimension >= 0,
            "dimension ({}) cannot be negative",
            dimension
        );
        assert!(
            dimension < self.num_dimensions(),
            "dimension ({}) is not valid for this communicator (num_dimensions = {})",
            dimension,
            self.num_dimensions(),
        );
        let mut coords: IntArray = smallvec::smallvec![0; self.dims.len()];
        rank_to_coordinates_into(&self.dims, self.rank(), &mut coords);
        let axis = dimension as usize;
        let neighbor = |offset: Count| {
            let mut target = coords.clone();
            target[axis] += offset;
            let inside = 0 <= target[axis] && target[axis] < self.dims[axis];
            if inside || self.periods[axis] {
                Some(coordinates_to_rank(&self.dims, &self.periods, &target))
            } else {
                None
            }
        };
        (neighbor(-displacement), neighbor(displacement))
    }

    /// Partitions an existing Cartesian communicator into a new Cartesian communicator in a lower
    /// dimension.
    ///
    /// Processes that agree on the coordinates of every dropped axis form one new communicator
    /// spanning the retained axes.
    ///
    /// Panics if `retain` is not of length [`num_dimensions`](#method.num_dimensions).
    ///
    /// This call is a collective operation.
    pub fn subgroup(&self, retain: &[bool]) -> Result<CartesianCommunicator> {
        assert_eq!(
            self.dims.len(),
            retain.len(),
            "The length of the retained dimensions array must be equal to the number of dimensions \
             in the CartesianCommunicator"
        );
        let mut coords: IntArray = smallvec::smallvec![0; self.dims.len()];
        rank_to_coordinates_into(&self.dims, self.rank(), &mut coords);

        let color = coords
            .iter()
            .zip(&self.dims)
            .zip(retain)
            .filter(|(_, keep)| !**keep)
            .fold(0, |color, ((&c, &d), _)| color * d + c);
        let comm = self
            .as_raw()
            .split(Color::with_value(color), self.rank())?
            .unwrap_or_else(|| unreachable!("every process passed a defined color"));

        let kept = |i: &usize| retain[*i];
        Ok(CartesianCommunicator {
            comm: UserCommunicator(comm),
            dims: (0..self.dims.len()).filter(kept).map(|i| self.dims[i]).collect(),
            periods: (0..self.dims.len()).filter(kept).map(|i| self.periods[i]).collect(),
        })
    }
}

impl Communicator for CartesianCommunicator {}

impl AsCommunicator for CartesianCommunicator {
    type Out = CartesianCommunicator;
    fn as_communicator(&self) -> &Self::Out {
        self
    }
}

unsafe impl AsRaw for CartesianCommunicator {
    type Raw = RawCommunicator;
    fn as_raw(&self) -> &Self::Raw {
        self.comm.as_raw()
    }
}

fn coordinates_to_rank(dims: &[Count], periods: &[bool], coords: &[Count]) -> Rank {
    dims.iter()
        .zip(periods)
        .zip(coords)
        .fold(0, |rank, ((&d, &periodic), &c)| {
            let c = if periodic { c.rem_euclid(d) } else { c };
            rank * d + c
        })
}

fn rank_to_coordinates_into(dims: &[Count], rank: Rank, coords: &mut [Count]) {
    let mut rest = rank;
    for (c, &d) in coords.iter_mut().zip(dims).rev() {
        *c = rest % d;
        rest /= d;
    }
}

/// Factorizes `nnodes` into `ndims` factors as close to each other as possible.
///
/// The factors are returned in non-increasing order and their product is `nnodes`.
///
/// # Examples
///
/// ```
/// assert_eq!(spmd::topology::dims_create(12, 2).unwrap(), vec![4, 3]);
/// assert_eq!(spmd::topology::dims_create(7, 3).unwrap(), vec![7, 1, 1]);
/// ```
pub fn dims_create(nnodes: Count, ndims: usize) -> Result<Vec<Count>> {
    let mut dims = vec![0; ndims];
    dims_create_into(nnodes, &mut dims)?;
    Ok(dims)
}

/// Fills in the zero entries of `dims` so that the product of all entries is `nnodes`.
///
/// Nonzero entries are kept as they are. The free entries receive factors as close to each other
/// as possible, in non-increasing order.
///
/// Fails with `Error::Dims` if `nnodes` is not positive, if an entry is negative, or if the
/// product of the fixed entries does not divide `nnodes`.
pub fn dims_create_into(nnodes: Count, dims: &mut [Count]) -> Result<()> {
    if nnodes <= 0 {
        return Err(Error::Dims(format!(
            "the number of nodes must be positive, got {}",
            nnodes
        )));
    }
    if let Some(d) = dims.iter().find(|&&d| d < 0) {
        return Err(Error::Dims(format!(
            "dimensions must not be negative, got {}",
            d
        )));
    }
    let fixed: i64 = dims.iter().filter(|&&d| d > 0).map(|&d| i64::from(d)).product();
    if i64::from(nnodes) % fixed != 0 {
        return Err(Error::Dims(format!(
            "{} nodes cannot be distributed over fixed dimensions {:?}",
            nnodes, dims
        )));
    }
    let remaining = (i64::from(nnodes) / fixed) as Count;
    let free = dims.iter().filter(|&&d| d == 0).count();
    if free == 0 {
        return if remaining == 1 {
            Ok(())
        } else {
            Err(Error::Dims(format!(
                "fixed dimensions {:?} do not multiply to {}",
                dims, nnodes
            )))
        };
    }

    let factors = balanced_factors(remaining, free);
    for (d, f) in dims.iter_mut().filter(|d| **d == 0).zip(factors) {
        *d = f;
    }
    Ok(())
}

/// Non-increasing factors of `n` in `slots` slots with the smallest spread between the largest
/// and the smallest factor.
fn balanced_factors(n: Count, slots: usize) -> Vec<Count> {
    let mut divisors = Vec::new();
    let mut i: Count = 1;
    while i64::from(i) * i64::from(i) <= i64::from(n) {
        if n % i == 0 {
            divisors.push(i);
            if i != n / i {
                divisors.push(n / i);
            }
        }
        i += 1;
    }
    divisors.sort_unstable_by(|a, b| b.cmp(a));

    let mut best = None;
    let mut current = Vec::with_capacity(slots);
    search(&divisors, n, slots, n, &mut current, &mut best);
    best.map(|(_, factors)| factors)
        .unwrap_or_else(|| unreachable!("n, 1, 1, ... is always a factorization"))
}

fn search(
    divisors: &[Count],
    n: Count,
    slots: usize,
    largest: Count,
    current: &mut Vec<Count>,
    best: &mut Option<(Count, Vec<Count>)>,
) {
    if slots == 1 {
        if n <= largest {
            current.push(n);
            let spread = current[0] - n;
            if best.as_ref().map_or(true, |(s, _)| spread < *s) {
                *best = Some((spread, current.clone()));
            }
            current.pop();
        }
        return;
    }
    for &f in divisors.iter().filter(|&&f| f <= largest && n % f == 0) {
        // f is the largest of the remaining factors, so it must cover n on its own.
        if (i64::from(f)).checked_pow(slots as u32).map_or(false, |p| p < i64::from(n)) {
            break;
        }
        current.push(f);
        search(divisors, n / f, slots - 1, f, current, best);
        current.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn brute_force_spread(n: Count, slots: usize) -> Count {
        fn go(n: Count, slots: usize, acc: &mut Vec<Count>, best: &mut Count) {
            if slots == 0 {
                if n == 1 {
                    let max = acc.iter().max().copied().unwrap_or(1);
                    let min = acc.iter().min().copied().unwrap_or(1);
                    *best = (*best).min(max - min);
                }
                return;
            }
            for f in (1..=n).filter(|f| n % f == 0) {
                acc.push(f);
                go(n / f, slots - 1, acc, best);
                acc.pop();
            }
        }
        let mut best = Count::MAX;
        go(n, slots, &mut Vec::new(), &mut best);
        best
    }

    #[test]
    fn balanced_factorizations() {
        assert_eq!(dims_create(12, 2).unwrap(), vec![4, 3]);
        assert_eq!(dims_create(16, 3).unwrap(), vec![4, 2, 2]);
        assert_eq!(dims_create(6, 1).unwrap(), vec![6]);
        assert_eq!(dims_create(1, 3).unwrap(), vec![1, 1, 1]);
        assert_eq!(dims_create(1, 0).unwrap(), Vec::<Count>::new());
    }

    #[test]
    fn fixed_dimensions_are_honored() {
        let mut dims = [0, 3, 0];
        dims_create_into(24, &mut dims).unwrap();
        assert_eq!(dims, [4, 3, 2]);
    }

    #[test]
    fn impossible_layouts_are_rejected() {
        assert!(matches!(dims_create(0, 2), Err(Error::Dims(_))));
        assert!(matches!(dims_create(5, 0), Err(Error::Dims(_))));
        assert!(matches!(dims_create_into(10, &mut [3, 0]), Err(Error::Dims(_))));
        assert!(matches!(dims_create_into(10, &mut [-1, 0]), Err(Error::Dims(_))));
        assert!(matches!(dims_create_into(10, &mut [2, 2]), Err(Error::Dims(_))));
        assert!(dims_create_into(10, &mut [2, 5]).is_ok());
    }

    #[test]
    fn row_major_coordinates() {
        let dims = [2, 3];
        let mut coords = [0; 2];
        rank_to_coordinates_into(&dims, 4, &mut coords);
        assert_eq!(coords, [1, 1]);
        assert_eq!(coordinates_to_rank(&dims, &[false, true], &[1, -2]), 4);
        assert_eq!(coordinates_to_rank(&dims, &[false, true], &[0, 5]), 2);
    }

    proptest! {
        #[test]
        fn coordinates_and_ranks_are_inverse(
            dims in prop::collection::vec(1i32..6, 0..4),
            periods in prop::collection::vec(any::<bool>(), 4),
            wraps in prop::collection::vec(-2i32..3, 4),
            pick in 0usize..1024,
        ) {
            let periods = &periods[..dims.len()];
            let cells: Count = dims.iter().product();
            let rank = (pick % cells as usize) as Rank;
            let mut coords = vec![0; dims.len()];
            rank_to_coordinates_into(&dims, rank, &mut coords);
            for (&c, &d) in coords.iter().zip(&dims) {
                prop_assert!(0 <= c && c < d);
            }
            prop_assert_eq!(coordinates_to_rank(&dims, periods, &coords), rank);

            let shifted: Vec<Count> = coords
                .iter()
                .zip(&dims)
                .zip(periods)
                .zip(&wraps)
                .map(|(((&c, &d), &periodic), &w)| if periodic { c + w * d } else { c })
                .collect();
            prop_assert_eq!(coordinates_to_rank(&dims, periods, &shifted), rank);
        }

        #[test]
        fn dims_create_has_minimal_spread(n in 1i32..=36, ndims in 1usize..=3) {
            let dims = dims_create(n, ndims).unwrap();
            prop_assert_eq!(dims.len(), ndims);
            prop_assert_eq!(dims.iter().product::<Count>(), n);
            prop_assert!(dims.iter().all(|&d| d > 0));
            prop_assert!(dims.windows(2).all(|w| w[0] >= w[1]));
            prop_assert_eq!(dims[0] - dims[ndims - 1], brute_force_spread(n, ndims));
        }
    }
}
