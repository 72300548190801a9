//! Error taxonomy for the collection engine.

use crate::range::LongRange;
use crate::Place;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by chunk storage, the ownership directory, the relocation
/// protocol and the collective transport.
///
/// Boundary and unsupported-operation errors are programmer errors and are
/// surfaced immediately. Partition-invariant violations indicate that the
/// ownership directory has diverged across places; they abort the current
/// round and must not be absorbed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An index fell outside the bounds of a chunk or view.
    #[error("index {index} out of bounds of {range}")]
    OutOfBounds {
        /// The offending index.
        index: i64,
        /// The bounds it was checked against.
        range: LongRange,
    },
    /// A requested sub-range is not contained in the source range.
    #[error("range {requested} not contained in {within}")]
    RangeOutOfBounds {
        /// The requested sub-range.
        requested: LongRange,
        /// The range it must fall inside.
        within: LongRange,
    },
    /// A chunk larger than [`MAX_CHUNK_LEN`](crate::chunk::MAX_CHUNK_LEN) was requested.
    #[error("chunk over {range} exceeds the maximum chunk length")]
    ChunkTooLarge {
        /// The oversized range.
        range: LongRange,
    },
    /// Inserting a chunk or directory entry that overlaps an existing one.
    ///
    /// When raised while receiving a relocated fragment this is fatal: it
    /// means the ownership directory has diverged between places.
    #[error("range {incoming} overlaps existing range {existing} at place {place}")]
    Overlap {
        /// The range being inserted.
        incoming: LongRange,
        /// The range already present.
        existing: LongRange,
        /// The place on which the collision was detected.
        place: Place,
    },
    /// A range expected to be present was not found.
    #[error("range {range} not present at place {place}")]
    NotFound {
        /// The missing range.
        range: LongRange,
        /// The place that looked for it.
        place: Place,
    },
    /// `move_out` was called for a range overlapping one already moving out
    /// in the same round.
    #[error("range {range} is already moving out (pending sync)")]
    AlreadyMoving {
        /// The range with a pending outgoing move.
        range: LongRange,
    },
    /// A received fragment addressed a collection id with no registered receiver.
    #[error("no receiver registered for collection {0}")]
    UnknownCollection(crate::CollectionId),
    /// Peers disagreed on the relocation round number.
    ///
    /// Raised when places call collective operations a different number of
    /// times or in a different order; without this check the mismatch would
    /// manifest as a hang in the transport.
    #[error("relocation round mismatch: local round {local}, place {place} is at round {remote}")]
    RoundMismatch {
        /// This place's round number.
        local: u64,
        /// The disagreeing peer.
        place: Place,
        /// The peer's round number.
        remote: u64,
    },
    /// An operation this collection variant deliberately does not support.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// A rebalancing weight vector that cannot define a target distribution.
    #[error("invalid weight vector: {0}")]
    InvalidWeights(&'static str),
    /// Failure in the underlying collective transport.
    #[error("collective transport: {0}")]
    Comm(String),
    /// Fragment or snapshot encoding/decoding failed.
    #[error(transparent)]
    Encoding(#[from] postcard::Error),
}
