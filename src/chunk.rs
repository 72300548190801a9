//! Contiguous, array-backed storage for one range of indices.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::range::LongRange;

/// Maximum number of elements a single chunk may hold.
///
/// Larger segments must be split across several chunks before insertion.
pub const MAX_CHUNK_LEN: u64 = i32::MAX as u64;

/// A contiguous buffer of values addressed by the global indices of one
/// [`LongRange`].
///
/// The buffer holds exactly `range.len()` slots; a global index `i` maps to
/// slot `i - range.begin`. All accesses are bounds-checked against the range
/// and fail with [`Error::OutOfBounds`] rather than panicking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk<T> {
    range: LongRange,
    data: Vec<T>,
}

impl<T> Chunk<T> {
    /// Creates a chunk over `range` from an existing buffer.
    ///
    /// The buffer length must equal `range.len()`.
    pub fn from_vec(range: LongRange, data: Vec<T>) -> Result<Self> {
        if range.len() > MAX_CHUNK_LEN {
            return Err(Error::ChunkTooLarge { range });
        }
        if data.len() as u64 != range.len() {
            return Err(Error::RangeOutOfBounds {
                requested: LongRange::new(range.begin, range.begin + data.len() as i64),
                within: range,
            });
        }
        Ok(Chunk { range, data })
    }

    /// Creates a chunk over `range`, producing each element from its global
    /// index.
    pub fn from_fn(range: LongRange, mut f: impl FnMut(i64) -> T) -> Result<Self> {
        if range.len() > MAX_CHUNK_LEN {
            return Err(Error::ChunkTooLarge { range });
        }
        let data = (range.begin..range.end).map(&mut f).collect();
        Ok(Chunk { range, data })
    }

    /// The range of global indices this chunk covers.
    pub fn range(&self) -> LongRange {
        self.range
    }

    /// Number of elements stored.
    pub fn len(&self) -> u64 {
        self.range.len()
    }

    /// Whether the chunk holds no elements.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Reads the element at global index `index`.
    pub fn get(&self, index: i64) -> Result<&T> {
        self.offset(index).map(|o| &self.data[o])
    }

    /// Replaces the element at global index `index`, returning the previous
    /// value.
    pub fn set(&mut self, index: i64, value: T) -> Result<T> {
        let o = self.offset(index)?;
        Ok(std::mem::replace(&mut self.data[o], value))
    }

    /// A borrowed view of the elements in `range`.
    ///
    /// When `range` equals the chunk's full range this is the entire backing
    /// slice; no copy is made either way.
    pub fn slice(&self, range: LongRange) -> Result<&[T]> {
        let (a, b) = self.offsets(range)?;
        Ok(&self.data[a..b])
    }

    /// Mutable counterpart of [`slice`](Self::slice).
    pub fn slice_mut(&mut self, range: LongRange) -> Result<&mut [T]> {
        let (a, b) = self.offsets(range)?;
        Ok(&mut self.data[a..b])
    }

    /// Iterates `(global index, element)` pairs starting at `from`.
    pub fn iter_from(&self, from: i64) -> Result<impl Iterator<Item = (i64, &T)>> {
        if !self.range.contains(from) {
            return Err(Error::OutOfBounds {
                index: from,
                range: self.range,
            });
        }
        let offset = (from - self.range.begin) as usize;
        Ok(self.data[offset..]
            .iter()
            .enumerate()
            .map(move |(i, v)| (from + i as i64, v)))
    }

    /// Iterates `(global index, element)` pairs over the whole chunk.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &T)> {
        let begin = self.range.begin;
        self.data
            .iter()
            .enumerate()
            .map(move |(i, v)| (begin + i as i64, v))
    }

    /// Splits the chunk into two at global index `at`.
    ///
    /// The pieces cover `[begin, at)` and `[at, end)`; together they tile the
    /// original range exactly. `at` must lie strictly inside the range.
    pub fn split2(self, at: i64) -> Result<(Chunk<T>, Chunk<T>)> {
        if !(self.range.begin < at && at < self.range.end) {
            return Err(Error::OutOfBounds {
                index: at,
                range: self.range,
            });
        }
        let Chunk { range, mut data } = self;
        let right = data.split_off((at - range.begin) as usize);
        Ok((
            Chunk {
                range: LongRange::new(range.begin, at),
                data,
            },
            Chunk {
                range: LongRange::new(at, range.end),
                data: right,
            },
        ))
    }

    /// Splits the chunk into three at global indices `at1 < at2`, both
    /// strictly inside the range.
    pub fn split3(self, at1: i64, at2: i64) -> Result<(Chunk<T>, Chunk<T>, Chunk<T>)> {
        if at1 >= at2 {
            return Err(Error::OutOfBounds {
                index: at2,
                range: LongRange::new(at1, self.range.end),
            });
        }
        let (left, rest) = self.split2(at1)?;
        let (mid, right) = rest.split2(at2)?;
        Ok((left, mid, right))
    }

    /// Consumes the chunk into its range and backing buffer.
    pub fn into_parts(self) -> (LongRange, Vec<T>) {
        (self.range, self.data)
    }

    fn offset(&self, index: i64) -> Result<usize> {
        if self.range.contains(index) {
            Ok((index - self.range.begin) as usize)
        } else {
            Err(Error::OutOfBounds {
                index,
                range: self.range,
            })
        }
    }

    fn offsets(&self, range: LongRange) -> Result<(usize, usize)> {
        if self.range.contains_range(&range) {
            Ok((
                (range.begin - self.range.begin) as usize,
                (range.end - self.range.begin) as usize,
            ))
        } else {
            Err(Error::RangeOutOfBounds {
                requested: range,
                within: self.range,
            })
        }
    }
}

impl<T: Clone> Chunk<T> {
    /// Creates a chunk over `range` with every slot set to `fill`.
    pub fn filled(range: LongRange, fill: T) -> Result<Self> {
        if range.len() > MAX_CHUNK_LEN {
            return Err(Error::ChunkTooLarge { range });
        }
        Ok(Chunk {
            range,
            data: vec![fill; range.len() as usize],
        })
    }

    /// Copies the elements of `range` into an independent new chunk.
    ///
    /// `range` must be contained in this chunk and non-empty.
    pub fn clone_range(&self, range: LongRange) -> Result<Chunk<T>> {
        if range.is_empty() {
            return Err(Error::RangeOutOfBounds {
                requested: range,
                within: self.range,
            });
        }
        let data = self.slice(range)?.to_vec();
        Ok(Chunk { range, data })
    }
}

impl<T> fmt::Display for Chunk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Chunk({})", self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(begin: i64, end: i64) -> Chunk<i64> {
        Chunk::from_fn(LongRange::new(begin, end), |i| i * 100).unwrap()
    }

    #[test]
    fn get_set_bounds() {
        let mut c = chunk(10, 20);
        assert_eq!(*c.get(10).unwrap(), 1000);
        assert_eq!(*c.get(19).unwrap(), 1900);
        assert!(matches!(c.get(20), Err(Error::OutOfBounds { .. })));
        assert!(matches!(c.get(9), Err(Error::OutOfBounds { .. })));

        // set returns the previous value
        let prev = c.set(15, -1).unwrap();
        assert_eq!(prev, 1500);
        assert_eq!(*c.get(15).unwrap(), -1);
        assert!(c.set(20, 0).is_err());
    }

    #[test]
    fn from_vec_length_must_match() {
        assert!(Chunk::from_vec(LongRange::new(0, 3), vec![1, 2, 3]).is_ok());
        assert!(Chunk::from_vec(LongRange::new(0, 3), vec![1, 2]).is_err());
    }

    #[test]
    fn slice_views() {
        let c = chunk(0, 10);
        assert_eq!(c.slice(LongRange::new(2, 5)).unwrap(), &[200, 300, 400]);
        // full-range request is the whole backing slice
        assert_eq!(c.slice(c.range()).unwrap().len(), 10);
        assert!(c.slice(LongRange::new(5, 11)).is_err());
    }

    #[test]
    fn clone_range_is_independent() {
        let mut c = chunk(0, 10);
        let copy = c.clone_range(LongRange::new(3, 6)).unwrap();
        c.set(4, 0).unwrap();
        assert_eq!(*copy.get(4).unwrap(), 400);
        assert_eq!(copy.range(), LongRange::new(3, 6));
        assert!(c.clone_range(LongRange::new(8, 12)).is_err());
    }

    #[test]
    fn split2_tiles_exactly() {
        let (l, r) = chunk(0, 10).split2(4).unwrap();
        assert_eq!(l.range(), LongRange::new(0, 4));
        assert_eq!(r.range(), LongRange::new(4, 10));
        assert_eq!(*l.get(3).unwrap(), 300);
        assert_eq!(*r.get(4).unwrap(), 400);
        // boundary splits are rejected
        assert!(chunk(0, 10).split2(0).is_err());
        assert!(chunk(0, 10).split2(10).is_err());
    }

    #[test]
    fn split3_tiles_exactly() {
        let (l, m, r) = chunk(0, 100).split3(30, 70).unwrap();
        assert_eq!(l.range(), LongRange::new(0, 30));
        assert_eq!(m.range(), LongRange::new(30, 70));
        assert_eq!(r.range(), LongRange::new(70, 100));
        assert_eq!(*m.get(45).unwrap(), 4500);
        assert!(chunk(0, 100).split3(70, 30).is_err());
    }

    #[test]
    fn iter_from_start_index() {
        let c = chunk(5, 10);
        let items: Vec<(i64, i64)> = c.iter_from(8).unwrap().map(|(i, v)| (i, *v)).collect();
        assert_eq!(items, vec![(8, 800), (9, 900)]);
        assert!(c.iter_from(10).is_err());
    }

    #[test]
    fn oversized_chunk_rejected() {
        let range = LongRange::new(0, MAX_CHUNK_LEN as i64 + 1);
        assert!(matches!(
            Chunk::<u8>::filled(range, 0),
            Err(Error::ChunkTooLarge { .. })
        ));
    }
}
