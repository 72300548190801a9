//! Batched collective byte exchange for relocation rounds.
//!
//! A [`MoveManager`] accumulates serialized fragments per destination over
//! any number of relocation calls, then [`sync`](MoveManager::sync) realizes
//! the whole round as one collective exchange: a fixed-size all-to-all of
//! `(round, byte length)` pairs, then a single variable-size all-to-all of
//! the payloads. Each receiver replays the fragments, in the order they were
//! written, against the collections registered for the round.
//!
//! Wire layout per ordered `(src, dst)` pair with a nonzero payload:
//!
//! ```text
//! postcard(Vec<FragmentMeta>) || fragment bytes ...
//! ```
//!
//! The descriptor list tells the receiver which collection and
//! reconstruction routine each fragment belongs to; no out-of-band schema is
//! needed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::comm::{displacements, PlaceGroup};
use crate::dist::MoveTag;
use crate::error::{Error, Result};
use crate::{CollectionId, Place};

/// How a received fragment must be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentKind {
    /// Insert as a brand-new range the group has never synchronized.
    MovedNew,
    /// Insert as a known range returning from a previous relocation.
    MovedOld,
}

impl From<MoveTag> for FragmentKind {
    fn from(tag: MoveTag) -> Self {
        match tag {
            MoveTag::New => FragmentKind::MovedNew,
            MoveTag::Old => FragmentKind::MovedOld,
        }
    }
}

/// Descriptor of one fragment in a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentMeta {
    /// The collection the fragment belongs to.
    pub collection: CollectionId,
    /// The reconstruction routine to apply.
    pub kind: FragmentKind,
    /// Byte length of the fragment payload.
    pub len: u32,
}

/// A collection able to absorb fragments received in a relocation round.
pub trait MoveReceiver {
    /// The id this collection was registered under, identical on every place.
    fn collection_id(&self) -> CollectionId;

    /// Reconstructs one fragment received from `source`.
    fn receive(&mut self, source: Place, kind: FragmentKind, payload: &[u8]) -> Result<()>;
}

struct Queued {
    meta: FragmentMeta,
    payload: Vec<u8>,
}

/// Accumulator for one relocation round's outgoing fragments.
///
/// `sync` is a strict collective: every place in the group must call it
/// exactly once per round, even with nothing queued (zero-length sends are
/// still part of the all-to-all). The manager tracks a round number that is
/// exchanged with the byte counts, so a place whose collective call sequence
/// has drifted from its peers fails with [`Error::RoundMismatch`] instead of
/// hanging in the transport.
pub struct MoveManager {
    num_places: usize,
    round: u64,
    queues: Vec<Vec<Queued>>,
}

impl MoveManager {
    /// Creates a manager for a group of `num_places` places.
    pub fn new(num_places: usize) -> Self {
        MoveManager {
            num_places,
            round: 0,
            queues: (0..num_places).map(|_| Vec::new()).collect(),
        }
    }

    /// The current round number.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Whether nothing is queued for the current round.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }

    /// Number of fragments queued for `dest`.
    pub fn pending_for(&self, dest: Place) -> usize {
        self.queues.get(dest.0).map_or(0, Vec::len)
    }

    /// Appends one serialized fragment bound for `dest`.
    pub fn request(
        &mut self,
        dest: Place,
        collection: CollectionId,
        kind: FragmentKind,
        payload: Vec<u8>,
    ) -> Result<()> {
        let queue = self
            .queues
            .get_mut(dest.0)
            .ok_or_else(|| Error::Comm(format!("destination {dest} outside the group")))?;
        trace!(%dest, %collection, ?kind, bytes = payload.len(), "queued fragment");
        queue.push(Queued {
            meta: FragmentMeta {
                collection,
                kind,
                len: payload.len() as u32,
            },
            payload,
        });
        Ok(())
    }

    /// Executes the collective exchange for this round.
    ///
    /// Serializes each destination's descriptor list and fragments,
    /// exchanges byte counts, then the payloads, and replays every received
    /// fragment in order against the matching receiver in `receivers`. The
    /// queues are cleared and the manager is ready for the next round.
    pub fn sync<G: PlaceGroup>(
        &mut self,
        group: &G,
        receivers: &mut [&mut dyn MoveReceiver],
    ) -> Result<()> {
        let np = group.size();
        if np != self.num_places {
            return Err(Error::Comm(format!(
                "manager sized for {} places used with a group of {np}",
                self.num_places
            )));
        }

        // phase 0: encode per-destination payloads
        let mut send = Vec::new();
        let mut send_counts = vec![0usize; np];
        for (dst, queue) in self.queues.iter().enumerate() {
            if queue.is_empty() {
                continue;
            }
            let metas: Vec<&FragmentMeta> = queue.iter().map(|q| &q.meta).collect();
            let before = send.len();
            send.extend_from_slice(&postcard::to_stdvec(&metas)?);
            for q in queue {
                send.extend_from_slice(&q.payload);
            }
            send_counts[dst] = send.len() - before;
        }

        // phase 1: exchange (round, byte count) per destination
        let mut header = Vec::with_capacity(np * 2);
        for count in &send_counts {
            header.push(self.round);
            header.push(*count as u64);
        }
        let recv_header = group.all_to_all_u64(&header)?;
        let mut recv_counts = vec![0usize; np];
        for src in 0..np {
            let remote_round = recv_header[src * 2];
            if remote_round != self.round {
                return Err(Error::RoundMismatch {
                    local: self.round,
                    place: group.place(src),
                    remote: remote_round,
                });
            }
            recv_counts[src] = recv_header[src * 2 + 1] as usize;
        }

        // phase 2: one variable all-to-all of the payloads
        let recv = Bytes::from(group.all_to_all_v(&send, &send_counts, &recv_counts)?);
        debug!(
            round = self.round,
            sent = send.len(),
            received = recv.len(),
            "relocation round exchanged"
        );

        // phase 3: replay fragments in the order they were written
        let offsets = displacements(&recv_counts);
        for src in 0..np {
            if recv_counts[src] == 0 {
                continue;
            }
            let payload = recv.slice(offsets[src]..offsets[src] + recv_counts[src]);
            let (metas, mut rest) = postcard::take_from_bytes::<Vec<FragmentMeta>>(&payload)?;
            for meta in metas {
                let len = meta.len as usize;
                if rest.len() < len {
                    return Err(Error::Comm(format!(
                        "truncated payload from {}",
                        group.place(src)
                    )));
                }
                let (fragment, tail) = rest.split_at(len);
                rest = tail;
                let receiver = receivers
                    .iter_mut()
                    .find(|r| r.collection_id() == meta.collection)
                    .ok_or(Error::UnknownCollection(meta.collection))?;
                receiver.receive(group.place(src), meta.kind, fragment)?;
            }
        }

        for queue in &mut self.queues {
            queue.clear();
        }
        self.round += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::mem::MemGroup;
    use std::thread;

    struct Sink {
        id: CollectionId,
        got: Vec<(Place, FragmentKind, Vec<u8>)>,
    }

    impl MoveReceiver for Sink {
        fn collection_id(&self) -> CollectionId {
            self.id
        }
        fn receive(&mut self, source: Place, kind: FragmentKind, payload: &[u8]) -> Result<()> {
            self.got.push((source, kind, payload.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn fragments_arrive_in_request_order() {
        let handles: Vec<_> = MemGroup::create(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mut mover = MoveManager::new(2);
                    let mut sink = Sink {
                        id: CollectionId(7),
                        got: Vec::new(),
                    };
                    if group.rank() == 0 {
                        for i in 0..3u8 {
                            mover
                                .request(
                                    Place(1),
                                    CollectionId(7),
                                    FragmentKind::MovedNew,
                                    vec![i, i, i],
                                )
                                .unwrap();
                        }
                    }
                    mover.sync(&group, &mut [&mut sink]).unwrap();
                    (group.rank(), sink.got)
                })
            })
            .collect();
        for h in handles {
            let (rank, got) = h.join().unwrap();
            if rank == 0 {
                assert!(got.is_empty());
            } else {
                assert_eq!(got.len(), 3);
                for (i, (source, kind, payload)) in got.iter().enumerate() {
                    assert_eq!(*source, Place(0));
                    assert_eq!(*kind, FragmentKind::MovedNew);
                    assert_eq!(payload, &vec![i as u8; 3]);
                }
            }
        }
    }

    #[test]
    fn empty_round_still_completes() {
        let handles: Vec<_> = MemGroup::create(3)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mut mover = MoveManager::new(3);
                    // two consecutive rounds with nothing queued
                    mover.sync(&group, &mut []).unwrap();
                    mover.sync(&group, &mut []).unwrap();
                    mover.round()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 2);
        }
    }

    #[test]
    fn round_mismatch_is_detected() {
        let handles: Vec<_> = MemGroup::create(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mut mover = MoveManager::new(2);
                    if group.rank() == 0 {
                        // rank 0 skipped a round its peer completed alone:
                        // forge the drift by bumping the local round counter
                        mover.round += 1;
                    }
                    mover.sync(&group, &mut []).err().map(|e| e.to_string())
                })
            })
            .collect();
        let errors: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(errors.iter().any(|e| e
            .as_deref()
            .is_some_and(|m| m.contains("round mismatch"))));
    }

    #[test]
    fn unknown_collection_fails_the_round() {
        let handles: Vec<_> = MemGroup::create(2)
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let mut mover = MoveManager::new(2);
                    if group.rank() == 0 {
                        mover
                            .request(Place(1), CollectionId(9), FragmentKind::MovedNew, vec![1])
                            .unwrap();
                    }
                    mover.sync(&group, &mut [])
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::UnknownCollection(CollectionId(9))))));
    }
}
