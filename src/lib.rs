//! Range-partitioned distributed collections over collective transports.
//!
//! A collection is physically partitioned across a fixed group of
//! cooperating *places*. Elements are addressed by half-open index ranges
//! ([`LongRange`]), stored locally in contiguous [`Chunk`]s, and tracked
//! group-wide by a per-place [`OwnershipDirectory`] replica. Arbitrary
//! sub-ranges can be carved out of existing chunks and relocated between
//! places; relocations are deferred, batched per destination, and executed
//! as one collective round through a [`MoveManager`] driving a
//! [`PlaceGroup`] transport. A locality-weighted load balancer
//! ([`balance::transfer_matrix`] plus [`ChunkedList::balance`]) converges
//! the global distribution toward a per-place weight vector in a single
//! round.
//!
//! All cross-place coordination is collective and synchronous: every place
//! must invoke the same sequence of `move_*_at_sync`/`balance`/`update_dist`
//! calls, each round concluded by exactly one [`MoveManager::sync`].
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod balance;
pub mod chunk;
pub mod comm;
pub mod dist;
pub mod error;
pub mod exchange;
pub mod range;
pub mod store;

pub use chunk::Chunk;
pub use comm::PlaceGroup;
pub use dist::{MoveTag, OwnershipDirectory};
pub use error::{Error, Result};
pub use exchange::{FragmentKind, MoveManager, MoveReceiver};
pub use range::LongRange;
pub use store::ChunkedList;

/// One participant process in the collective group, identified by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Place(pub usize);

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "place({})", self.0)
    }
}

/// Identifier routing received fragments to their collection.
///
/// Collections taking part in the same relocation rounds must be created
/// with the same id on every place of the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionId(pub u64);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection({})", self.0)
    }
}
