//! Per-place ownership directory.
//!
//! Every place keeps its own replica of the `range -> owning place` map.
//! The replicas agree whenever the group is quiescent; while a relocation
//! round is in flight a place may have recorded moves its peers have not
//! seen yet. Those in-flight moves are applied to the local replica
//! optimistically and remembered in a [`DistDiff`], so local readers get a
//! best-effort picture without waiting for synchronization. The collective
//! [`update_dist`](OwnershipDirectory::update_dist) reconciles all replicas
//! into one authoritative snapshot, clears the diff and advances the epoch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::comm::PlaceGroup;
use crate::error::{Error, Result};
use crate::range::LongRange;
use crate::Place;

/// Tag attached to an outgoing move, telling the receiver how to apply the
/// arrival.
///
/// A range that entered the directory after the last synchronization is
/// unknown to the peers, so the receiver must insert it as a brand-new entry
/// ([`MoveTag::New`]). A range that survived a synchronization is already in
/// every replica, so the receiver merely re-points the recorded owner
/// ([`MoveTag::Old`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveTag {
    /// The range is not yet in the peers' replicas.
    New,
    /// The range is known group-wide; only its owner changes.
    Old,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    owner: Place,
    /// Whether this range was part of the last synchronized snapshot.
    synced: bool,
}

/// Pending-delta record of moves applied locally but not yet synchronized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistDiff {
    /// Ranges that left this place, with their previous owner.
    pub moved_out: Vec<(LongRange, Place)>,
    /// Ranges that arrived at this place, with their new owner.
    pub moved_in: Vec<(LongRange, Place)>,
}

impl DistDiff {
    /// Whether no moves are pending.
    pub fn is_empty(&self) -> bool {
        self.moved_out.is_empty() && self.moved_in.is_empty()
    }
}

/// One place's replica of the range ownership map.
#[derive(Debug)]
pub struct OwnershipDirectory {
    here: Place,
    entries: BTreeMap<LongRange, Entry>,
    diff: DistDiff,
    epoch: u64,
}

impl OwnershipDirectory {
    /// Creates an empty directory for the calling place.
    pub fn new(here: Place) -> Self {
        OwnershipDirectory {
            here,
            entries: BTreeMap::new(),
            diff: DistDiff::default(),
            epoch: 0,
        }
    }

    /// The place this replica belongs to.
    pub fn here(&self) -> Place {
        self.here
    }

    /// Generation counter, advanced by every [`update_dist`](Self::update_dist).
    ///
    /// Lookups are only meaningful within one epoch; a reader that must not
    /// observe data across a round boundary compares epochs around its reads.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The in-flight moves recorded since the last synchronization.
    pub fn pending(&self) -> &DistDiff {
        &self.diff
    }

    /// Registers `range` as owned by this place.
    ///
    /// Fails with [`Error::Overlap`] if the range overlaps an entry this
    /// place already publishes.
    pub fn add(&mut self, range: LongRange) -> Result<()> {
        if let Some(existing) = self.find_overlap_owned_here(&range) {
            return Err(Error::Overlap {
                incoming: range,
                existing,
                place: self.here,
            });
        }
        self.entries.insert(
            range,
            Entry {
                owner: self.here,
                synced: false,
            },
        );
        Ok(())
    }

    /// Removes the entry for exactly `range`.
    pub fn remove(&mut self, range: LongRange) -> Result<()> {
        if self.entries.remove(&range).is_none() {
            return Err(Error::NotFound {
                range,
                place: self.here,
            });
        }
        Ok(())
    }

    /// Records that `range` leaves this place for `dest`.
    ///
    /// The local replica is re-pointed at `dest` immediately and the
    /// departure is remembered in the diff. Returns the [`MoveTag`] the
    /// receiver needs to apply the arrival. Moving out a range overlapping
    /// one already pending departure in the same round is rejected.
    pub fn move_out(&mut self, range: LongRange, dest: Place) -> Result<MoveTag> {
        if let Some((pending, _)) = self
            .diff
            .moved_out
            .iter()
            .find(|(r, _)| r.overlaps(&range))
        {
            return Err(Error::AlreadyMoving { range: *pending });
        }
        let entry = self.entries.get_mut(&range).ok_or(Error::NotFound {
            range,
            place: self.here,
        })?;
        if entry.owner != self.here {
            return Err(Error::NotFound {
                range,
                place: self.here,
            });
        }
        let tag = if entry.synced { MoveTag::Old } else { MoveTag::New };
        entry.owner = dest;
        self.diff.moved_out.push((range, self.here));
        trace!(%range, %dest, ?tag, "directory move out");
        Ok(tag)
    }

    /// Applies the arrival of a brand-new range at this place.
    ///
    /// The range must not already have an entry: a pre-existing exact entry
    /// means the sender's and this place's replicas have diverged.
    pub fn move_in_new(&mut self, range: LongRange) -> Result<()> {
        if self.entries.contains_key(&range) {
            return Err(Error::Overlap {
                incoming: range,
                existing: range,
                place: self.here,
            });
        }
        self.entries.insert(
            range,
            Entry {
                owner: self.here,
                synced: false,
            },
        );
        self.diff.moved_in.push((range, self.here));
        trace!(%range, "directory move in (new)");
        Ok(())
    }

    /// Applies the arrival of a group-wide known range at this place.
    ///
    /// The range must already have an entry recording `source` as its owner;
    /// anything else means the replicas have diverged.
    pub fn move_in_old(&mut self, range: LongRange, source: Place) -> Result<()> {
        let entry = self.entries.get_mut(&range).ok_or(Error::NotFound {
            range,
            place: self.here,
        })?;
        if entry.owner != source {
            return Err(Error::Overlap {
                incoming: range,
                existing: range,
                place: entry.owner,
            });
        }
        entry.owner = self.here;
        self.diff.moved_in.push((range, self.here));
        trace!(%range, %source, "directory move in (old)");
        Ok(())
    }

    /// The entry whose range contains `point`, if any.
    ///
    /// This is an explicit search over the `(begin, end)`-ordered entries;
    /// ranges themselves carry no point-lookup comparator. During a
    /// relocation round the replica may hold a stale wide entry next to a
    /// freshly received narrow one, so the backward scan cannot stop at the
    /// first entry that ends at or before `point`; it walks every entry whose
    /// `begin <= point` and reports the narrowest match.
    pub fn find_containing(&self, point: i64) -> Option<(LongRange, Place)> {
        let bound = LongRange {
            begin: point,
            end: i64::MAX,
        };
        self.entries
            .range(..=bound)
            .rev()
            .filter(|(r, _)| r.contains(point))
            .min_by_key(|(r, _)| r.len())
            .map(|(r, e)| (*r, e.owner))
    }

    /// The place currently recorded as owning `point`, if any.
    pub fn owner_of(&self, point: i64) -> Option<Place> {
        self.find_containing(point).map(|(_, p)| p)
    }

    /// The ranges currently attributed to `place` by this replica.
    pub fn ranges_of(&self, place: Place) -> Vec<LongRange> {
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == place)
            .map(|(r, _)| *r)
            .collect()
    }

    /// Total number of entries in this replica.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this replica holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collective reconciliation of all replicas.
    ///
    /// Every place contributes the ranges it actually holds locally
    /// (`local_ranges`); the contributions are merged into one authoritative
    /// snapshot installed on every place. The pending diff is cleared and the
    /// epoch advances. Fails with [`Error::Overlap`] if the merged ranges do
    /// not tile without overlap, which indicates a diverged round.
    pub fn update_dist<G: PlaceGroup>(
        &mut self,
        group: &G,
        local_ranges: &[LongRange],
    ) -> Result<()> {
        let encoded = postcard::to_stdvec(&local_ranges)?;
        let gathered = group.all_gather(&encoded)?;

        let mut merged: BTreeMap<LongRange, Entry> = BTreeMap::new();
        let mut prev: Option<LongRange> = None;
        let mut all: Vec<(LongRange, Place)> = Vec::new();
        for (rank, bytes) in gathered.iter().enumerate() {
            let ranges: Vec<LongRange> = postcard::from_bytes(bytes)?;
            for range in ranges {
                all.push((range, group.place(rank)));
            }
        }
        all.sort_by_key(|(r, _)| *r);
        for (range, owner) in all {
            if let Some(p) = prev {
                if p.overlaps(&range) {
                    return Err(Error::Overlap {
                        incoming: range,
                        existing: p,
                        place: owner,
                    });
                }
            }
            prev = Some(range);
            merged.insert(
                range,
                Entry {
                    owner,
                    synced: true,
                },
            );
        }

        self.entries = merged;
        self.diff = DistDiff::default();
        self.epoch += 1;
        debug!(
            epoch = self.epoch,
            entries = self.entries.len(),
            "directory synchronized"
        );
        Ok(())
    }

    fn find_overlap_owned_here(&self, range: &LongRange) -> Option<LongRange> {
        // entries are only guaranteed disjoint among those this place owns
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == self.here)
            .map(|(r, _)| *r)
            .find(|r| r.overlaps(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir() -> OwnershipDirectory {
        OwnershipDirectory::new(Place(0))
    }

    #[test]
    fn add_rejects_local_overlap() {
        let mut d = dir();
        d.add(LongRange::new(0, 10)).unwrap();
        d.add(LongRange::new(10, 20)).unwrap();
        assert!(matches!(
            d.add(LongRange::new(5, 15)),
            Err(Error::Overlap { .. })
        ));
        assert!(matches!(
            d.add(LongRange::new(0, 10)),
            Err(Error::Overlap { .. })
        ));
    }

    #[test]
    fn remove_requires_exact_entry() {
        let mut d = dir();
        d.add(LongRange::new(0, 10)).unwrap();
        assert!(matches!(
            d.remove(LongRange::new(0, 5)),
            Err(Error::NotFound { .. })
        ));
        d.remove(LongRange::new(0, 10)).unwrap();
        assert!(d.is_empty());
    }

    #[test]
    fn move_out_tags_unsynced_as_new() {
        let mut d = dir();
        d.add(LongRange::new(0, 10)).unwrap();
        let tag = d.move_out(LongRange::new(0, 10), Place(1)).unwrap();
        assert_eq!(tag, MoveTag::New);
        // local replica re-points immediately
        assert_eq!(d.owner_of(5), Some(Place(1)));
        assert_eq!(d.pending().moved_out, vec![(LongRange::new(0, 10), Place(0))]);
    }

    #[test]
    fn double_move_out_of_overlapping_ranges_rejected() {
        let mut d = dir();
        d.add(LongRange::new(0, 10)).unwrap();
        d.add(LongRange::new(10, 20)).unwrap();
        d.move_out(LongRange::new(0, 10), Place(1)).unwrap();
        assert!(matches!(
            d.move_out(LongRange::new(0, 10), Place(2)),
            Err(Error::AlreadyMoving { .. })
        ));
        // disjoint pending moves are fine
        d.move_out(LongRange::new(10, 20), Place(1)).unwrap();
    }

    #[test]
    fn move_in_new_rejects_existing_entry() {
        let mut d = dir();
        d.move_in_new(LongRange::new(0, 10)).unwrap();
        assert_eq!(d.owner_of(3), Some(Place(0)));
        assert!(matches!(
            d.move_in_new(LongRange::new(0, 10)),
            Err(Error::Overlap { .. })
        ));
    }

    #[test]
    fn move_in_old_repoints_known_entry() {
        let mut d = dir();
        // simulate a synced entry owned by place 1
        d.entries.insert(
            LongRange::new(0, 10),
            Entry {
                owner: Place(1),
                synced: true,
            },
        );
        d.move_in_old(LongRange::new(0, 10), Place(1)).unwrap();
        assert_eq!(d.owner_of(5), Some(Place(0)));
        // wrong source place means divergence
        let mut d2 = dir();
        d2.entries.insert(
            LongRange::new(0, 10),
            Entry {
                owner: Place(2),
                synced: true,
            },
        );
        assert!(d2.move_in_old(LongRange::new(0, 10), Place(1)).is_err());
        // absent entry means divergence
        assert!(matches!(
            dir().move_in_old(LongRange::new(0, 10), Place(1)),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn find_containing_searches_by_point() {
        let mut d = dir();
        d.add(LongRange::new(0, 10)).unwrap();
        d.add(LongRange::new(10, 20)).unwrap();
        d.add(LongRange::new(30, 40)).unwrap();
        assert_eq!(d.find_containing(0), Some((LongRange::new(0, 10), Place(0))));
        assert_eq!(d.find_containing(9), Some((LongRange::new(0, 10), Place(0))));
        assert_eq!(
            d.find_containing(10),
            Some((LongRange::new(10, 20), Place(0)))
        );
        assert_eq!(d.find_containing(25), None);
        assert_eq!(
            d.find_containing(39),
            Some((LongRange::new(30, 40), Place(0)))
        );
        assert_eq!(d.find_containing(40), None);
    }

    #[test]
    fn find_containing_sees_past_a_fresh_narrow_entry() {
        // receiver replica mid-round: the wide synced entry is stale but
        // still the only coverage for indices outside the moved fragment
        let mut d = dir();
        d.entries.insert(
            LongRange::new(0, 100),
            Entry {
                owner: Place(1),
                synced: true,
            },
        );
        d.move_in_new(LongRange::new(30, 70)).unwrap();
        // inside the fragment the fresh narrow entry wins
        assert_eq!(
            d.find_containing(45),
            Some((LongRange::new(30, 70), Place(0)))
        );
        // outside it the stale wide entry still answers
        assert_eq!(
            d.find_containing(80),
            Some((LongRange::new(0, 100), Place(1)))
        );
        assert_eq!(
            d.find_containing(10),
            Some((LongRange::new(0, 100), Place(1)))
        );
    }
}
