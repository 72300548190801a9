//! Range-partitioned distributed list of chunks.
//!
//! A [`ChunkedList`] is one place's share of a collection partitioned across
//! the group: the locally held [`Chunk`]s (pairwise non-overlapping) plus
//! this place's replica of the [`OwnershipDirectory`]. Relocation is
//! deferred: the `move_*_at_sync` family splits chunks at the requested
//! boundaries, records the departures in the directory and queues the
//! fragments on a [`MoveManager`]; nothing crosses the group until every
//! place calls [`MoveManager::sync`] for the round. `balance` is the
//! collective rebalancing entry point built on the same queue.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::balance::{transfer_matrix, validate_weights};
use crate::chunk::Chunk;
use crate::comm::PlaceGroup;
use crate::dist::OwnershipDirectory;
use crate::error::{Error, Result};
use crate::exchange::{FragmentKind, MoveManager, MoveReceiver};
use crate::range::LongRange;
use crate::{CollectionId, Place};

/// One place's fragment of a range-partitioned distributed list.
///
/// All collective methods (`move_*_at_sync` followed by a sync, `balance`,
/// `update_dist`) must be invoked identically, in the same order, on every
/// place of the group.
#[derive(Debug)]
pub struct ChunkedList<T> {
    id: CollectionId,
    here: Place,
    chunks: BTreeMap<LongRange, Chunk<T>>,
    dist: OwnershipDirectory,
}

impl<T> ChunkedList<T> {
    /// Creates the local fragment of collection `id` on the calling place.
    ///
    /// `id` must be the same on every place of the group; it routes received
    /// fragments back to this collection.
    pub fn new<G: PlaceGroup>(id: CollectionId, group: &G) -> Self {
        let here = group.here();
        ChunkedList {
            id,
            here,
            chunks: BTreeMap::new(),
            dist: OwnershipDirectory::new(here),
        }
    }

    /// The place holding this fragment.
    pub fn here(&self) -> Place {
        self.here
    }

    /// This place's replica of the ownership directory.
    pub fn dist(&self) -> &OwnershipDirectory {
        &self.dist
    }

    /// Total number of elements held locally.
    pub fn len(&self) -> u64 {
        self.chunks.keys().map(LongRange::len).sum()
    }

    /// Whether no elements are held locally.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of locally held chunks.
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// The ranges of the locally held chunks, in index order.
    pub fn ranges(&self) -> Vec<LongRange> {
        self.chunks.keys().copied().collect()
    }

    /// Inserts a chunk into the local store and registers its range in the
    /// directory.
    ///
    /// The chunk's range must not overlap any locally held chunk.
    pub fn put_chunk(&mut self, chunk: Chunk<T>) -> Result<()> {
        let range = chunk.range();
        self.insert_chunk(chunk)?;
        self.dist.add(range)?;
        Ok(())
    }

    /// Removes and returns the chunk covering exactly `range`.
    pub fn remove_chunk(&mut self, range: LongRange) -> Result<Chunk<T>> {
        let chunk = self.chunks.remove(&range).ok_or(Error::NotFound {
            range,
            place: self.here,
        })?;
        self.dist.remove(range)?;
        Ok(chunk)
    }

    /// Arbitrary insertion is not supported by a range-indexed collection.
    ///
    /// Elements enter through [`put_chunk`](Self::put_chunk) or by
    /// relocation; there is no position an unaddressed element could take.
    pub fn add(&mut self, _value: T) -> Result<()> {
        Err(Error::Unsupported(
            "arbitrary insertion into a range-indexed collection; use put_chunk",
        ))
    }

    /// Reads the element at global index `index`.
    pub fn get(&self, index: i64) -> Result<&T> {
        self.find_chunk(index)
            .ok_or(Error::NotFound {
                range: LongRange::point(index),
                place: self.here,
            })?
            .get(index)
    }

    /// Replaces the element at global index `index`, returning the previous
    /// value.
    pub fn set(&mut self, index: i64, value: T) -> Result<T> {
        let here = self.here;
        self.find_chunk_mut(index)
            .ok_or(Error::NotFound {
                range: LongRange::point(index),
                place: here,
            })?
            .set(index, value)
    }

    /// Calls `f` on every locally held chunk, in index order.
    pub fn for_each_chunk(&self, mut f: impl FnMut(&Chunk<T>)) {
        for chunk in self.chunks.values() {
            f(chunk);
        }
    }

    /// Iterates the locally held chunks in index order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk<T>> {
        self.chunks.values()
    }

    /// Collective: reconciles every place's directory replica.
    ///
    /// Each place contributes the ranges it actually holds; all replicas are
    /// replaced with the merged snapshot and the epoch advances.
    pub fn update_dist<G: PlaceGroup>(&mut self, group: &G) -> Result<()> {
        let ranges = self.ranges();
        self.dist.update_dist(group, &ranges)
    }

    /// The locally held chunk containing `index`, if any.
    pub fn find_chunk(&self, index: i64) -> Option<&Chunk<T>> {
        let bound = LongRange {
            begin: index,
            end: i64::MAX,
        };
        self.chunks
            .range(..=bound)
            .next_back()
            .filter(|(r, _)| r.contains(index))
            .map(|(_, c)| c)
    }

    fn find_chunk_mut(&mut self, index: i64) -> Option<&mut Chunk<T>> {
        let bound = LongRange {
            begin: index,
            end: i64::MAX,
        };
        self.chunks
            .range_mut(..=bound)
            .next_back()
            .filter(|(r, _)| r.contains(index))
            .map(|(_, c)| c)
    }

    /// Inserts into the chunk map only, enforcing the local non-overlap
    /// invariant. Directory bookkeeping is the caller's responsibility.
    fn insert_chunk(&mut self, chunk: Chunk<T>) -> Result<()> {
        let range = chunk.range();
        // disjoint keys: an overlapping range would be adjacent in key order
        let existing = self
            .chunks
            .range(..range)
            .next_back()
            .map(|(r, _)| *r)
            .filter(|r| r.overlaps(&range))
            .or_else(|| {
                self.chunks
                    .range(range..)
                    .next()
                    .map(|(r, _)| *r)
                    .filter(|r| r.overlaps(&range))
            });
        if let Some(existing) = existing {
            return Err(Error::Overlap {
                incoming: range,
                existing,
                place: self.here,
            });
        }
        self.chunks.insert(range, chunk);
        Ok(())
    }
}

impl<T: Serialize> ChunkedList<T> {
    /// Queues the relocation of `target` to `dest`, splitting local chunks
    /// at the target's boundaries.
    ///
    /// Every locally held chunk overlapping `target` is classified against
    /// it: moved whole when fully inside, split once when it sticks out on
    /// one side, split twice when it sticks out on both. Splits are applied
    /// before queuing, so the local store and directory already reflect the
    /// fragment layout when [`MoveManager::sync`] runs. A destination equal
    /// to the calling place is a no-op.
    ///
    /// Collective: every place must perform the same call, then sync.
    pub fn move_at_sync(
        &mut self,
        target: LongRange,
        dest: Place,
        mover: &mut MoveManager,
    ) -> Result<()> {
        if dest == self.here || target.is_empty() {
            return Ok(());
        }
        let overlapping: Vec<LongRange> = self
            .chunks
            .keys()
            .copied()
            .filter(|r| r.overlaps(&target))
            .collect();
        trace!(%target, %dest, chunks = overlapping.len(), "relocation classification");
        for r in overlapping {
            let Some(chunk) = self.chunks.remove(&r) else {
                continue;
            };
            let moved = if target.contains_range(&r) {
                // fully inside: move as-is, the directory entry survives
                // until move_out re-points it
                chunk
            } else if r.begin < target.begin && r.end <= target.end {
                // sticks out on the left: keep the left fragment
                let (left, right) = chunk.split2(target.begin)?;
                self.dist.remove(r)?;
                self.reinsert_fragment(left)?;
                self.dist.add(right.range())?;
                right
            } else if r.begin >= target.begin && r.end > target.end {
                // sticks out on the right: keep the right fragment
                let (left, right) = chunk.split2(target.end)?;
                self.dist.remove(r)?;
                self.reinsert_fragment(right)?;
                self.dist.add(left.range())?;
                left
            } else {
                // target strictly inside: keep both sides, move the middle
                let (left, mid, right) = chunk.split3(target.begin, target.end)?;
                self.dist.remove(r)?;
                self.reinsert_fragment(left)?;
                self.reinsert_fragment(right)?;
                self.dist.add(mid.range())?;
                mid
            };
            self.queue_move(moved, dest, mover)?;
        }
        Ok(())
    }

    /// Queues the relocation of an already-known list of whole chunks.
    ///
    /// Each range must exactly match a locally held chunk; no splitting is
    /// performed. A destination equal to the calling place is a no-op.
    pub fn move_chunks_at_sync(
        &mut self,
        ranges: &[LongRange],
        dest: Place,
        mover: &mut MoveManager,
    ) -> Result<()> {
        if dest == self.here {
            return Ok(());
        }
        for &range in ranges {
            let chunk = self.chunks.remove(&range).ok_or(Error::NotFound {
                range,
                place: self.here,
            })?;
            self.queue_move(chunk, dest, mover)?;
        }
        Ok(())
    }

    /// Queues relocations following a distribution rule.
    ///
    /// For each locally held chunk, `rule` maps its range to the set of
    /// `(place, sub-range)` pairs that should own parts of it; each pair
    /// becomes a [`move_at_sync`](Self::move_at_sync) of the intersection.
    /// This generalizes single-destination moves to an arbitrary
    /// partitioning computed externally.
    pub fn move_by_rule_at_sync(
        &mut self,
        rule: impl Fn(LongRange) -> Vec<(Place, LongRange)>,
        mover: &mut MoveManager,
    ) -> Result<()> {
        let ranges = self.ranges();
        for r in ranges {
            for (place, sub) in rule(r) {
                if let Some(part) = sub.intersection(&r) {
                    self.move_at_sync(part, place, mover)?;
                }
            }
        }
        Ok(())
    }

    fn reinsert_fragment(&mut self, fragment: Chunk<T>) -> Result<()> {
        self.dist.add(fragment.range())?;
        self.insert_chunk(fragment)
    }

    fn queue_move(&mut self, chunk: Chunk<T>, dest: Place, mover: &mut MoveManager) -> Result<()> {
        let range = chunk.range();
        let tag = self.dist.move_out(range, dest)?;
        let payload = postcard::to_stdvec(&chunk)?;
        debug!(%range, %dest, ?tag, "queued chunk move");
        mover.request(dest, self.id, tag.into(), payload)
    }
}

impl<T: Serialize + DeserializeOwned + 'static> ChunkedList<T> {
    /// Collective: rebalances the collection toward a uniform distribution.
    ///
    /// Equivalent to [`balance_with`](Self::balance_with) with a uniform
    /// weight vector.
    pub fn balance<G: PlaceGroup>(&mut self, mover: &mut MoveManager, group: &G) -> Result<()> {
        let weights = vec![1.0; group.size()];
        self.balance_with(&weights, mover, group)
    }

    /// Collective: rebalances the collection toward per-place locality
    /// weights.
    ///
    /// All places exchange their local element counts; rank 0 computes the
    /// transfer matrix and broadcasts it; each place drains the counts its
    /// row demands, smallest local ranges first, splitting a chunk when the
    /// requested count falls in its middle. The round is synced before
    /// returning. `weights` must be identical on every place.
    pub fn balance_with<G: PlaceGroup>(
        &mut self,
        weights: &[f64],
        mover: &mut MoveManager,
        group: &G,
    ) -> Result<()> {
        let np = group.size();
        // validated on every place so a bad vector fails everywhere instead
        // of stranding the group in the broadcast
        validate_weights(np, weights)?;

        let counts = group.all_to_all_u64(&vec![self.len(); np])?;
        let encoded = if group.rank() == 0 {
            let matrix = transfer_matrix(&counts, weights)?;
            postcard::to_stdvec(&matrix)?
        } else {
            Vec::new()
        };
        let matrix: Vec<Vec<u64>> = postcard::from_bytes(&group.broadcast(0, encoded)?)?;
        debug!(round = mover.round(), total = counts.iter().sum::<u64>(), "balance round");

        for dst in 0..np {
            let owed = matrix[group.rank()][dst];
            if owed > 0 && dst != group.rank() {
                self.drain_to(owed, group.place(dst), mover)?;
            }
        }
        let mut receivers: [&mut dyn MoveReceiver; 1] = [self];
        mover.sync(group, &mut receivers)
    }

    /// Queues exactly `count` elements for `dest`, consuming the smallest
    /// local ranges first and splitting one chunk when the count lands
    /// inside it.
    fn drain_to(&mut self, mut count: u64, dest: Place, mover: &mut MoveManager) -> Result<()> {
        let mut ranges = self.ranges();
        ranges.sort_by_key(|r| (r.len(), *r));
        for r in ranges {
            if count == 0 {
                break;
            }
            let Some(chunk) = self.chunks.remove(&r) else {
                continue;
            };
            if r.len() <= count {
                count -= r.len();
                self.queue_move(chunk, dest, mover)?;
            } else {
                let (moved, kept) = chunk.split2(r.begin + count as i64)?;
                self.dist.remove(r)?;
                self.reinsert_fragment(kept)?;
                self.dist.add(moved.range())?;
                self.queue_move(moved, dest, mover)?;
                count = 0;
            }
        }
        if count > 0 {
            // the matrix was computed from the exchanged counts; coming up
            // short means this place mutated the store mid-round
            return Err(Error::Comm(format!(
                "{} elements short of the transfer owed to {dest}",
                count
            )));
        }
        Ok(())
    }
}

impl<T: DeserializeOwned> MoveReceiver for ChunkedList<T> {
    fn collection_id(&self) -> CollectionId {
        self.id
    }

    fn receive(&mut self, source: Place, kind: FragmentKind, payload: &[u8]) -> Result<()> {
        let chunk: Chunk<T> = postcard::from_bytes(payload)?;
        let range = chunk.range();
        trace!(%range, %source, ?kind, "received fragment");
        match kind {
            FragmentKind::MovedNew => self.dist.move_in_new(range)?,
            FragmentKind::MovedOld => self.dist.move_in_old(range, source)?,
        }
        // an overlap here is a diverged directory, fatal for the round
        self.insert_chunk(chunk)
    }
}
