//! Collective-communication substrate.
//!
//! The engine does not talk to a network itself; it drives a [`PlaceGroup`],
//! a fixed set of cooperating places exposing MPI-style collectives. Every
//! collective here is *synchronous*: all places in the group must invoke the
//! same collectives in the same order, and a place blocks inside the call
//! until the whole group has contributed. Partial participation is not
//! supported and there is no cancellation at this layer.

use crate::error::Result;
use crate::Place;

pub mod mem;

/// A fixed group of places with collective exchange primitives.
///
/// Implementations are expected to be reliable: a place that starts a
/// collective completes it. Fault tolerance belongs to the substrate, not to
/// this trait.
pub trait PlaceGroup {
    /// Number of places in the group.
    fn size(&self) -> usize;

    /// The rank of the calling place, in `0..size()`.
    fn rank(&self) -> usize;

    /// The place with the given rank.
    fn place(&self, rank: usize) -> Place {
        Place(rank)
    }

    /// The calling place.
    fn here(&self) -> Place {
        Place(self.rank())
    }

    /// Fixed-size all-to-all of unsigned integers.
    ///
    /// `send` must hold `size() * k` values for some `k >= 1`; the block
    /// `send[i*k..(i+1)*k]` goes to rank `i`. The returned vector has the
    /// same layout with block `i` received from rank `i`.
    fn all_to_all_u64(&self, send: &[u64]) -> Result<Vec<u64>>;

    /// Variable-size all-to-all of bytes.
    ///
    /// `send` is one flat buffer; `send_counts[i]` bytes of it, in rank
    /// order, go to rank `i` (offsets are the prefix sums of the counts).
    /// `recv_counts[i]` is the byte count expected from rank `i`, as learned
    /// from a preceding [`all_to_all_u64`](Self::all_to_all_u64); the
    /// returned buffer concatenates the received payloads in rank order.
    fn all_to_all_v(&self, send: &[u8], send_counts: &[usize], recv_counts: &[usize])
        -> Result<Vec<u8>>;

    /// Every place contributes `data`; every place receives all
    /// contributions, indexed by rank.
    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// One-to-all broadcast. Only the payload passed at `root` is
    /// delivered; other places' `data` is ignored.
    fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Blocks until every place in the group has entered the barrier.
    fn barrier(&self);
}

/// Prefix sums of `counts`, i.e. the displacement of each block in a flat
/// buffer.
pub(crate) fn displacements(counts: &[usize]) -> Vec<usize> {
    let mut out = Vec::with_capacity(counts.len());
    let mut acc = 0;
    for c in counts {
        out.push(acc);
        acc += c;
    }
    out
}
