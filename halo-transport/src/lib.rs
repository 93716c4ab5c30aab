//! Communication group abstraction used by the decompositions.
//!
//! A [`Communicator`] is one node's view of a fixed process group. The
//! byte-level collectives are what a backend has to provide; the typed
//! collectives (`all_to_all`, `broadcast`, `reduce`, `all_reduce`) are
//! built on top of them with the group's [`PayloadCodec`].

mod codec;
mod local;

use halo_core::Rank;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use self::codec::{CodecError, PayloadCodec, SerializeObject};
pub use self::local::{LocalCommunicator, ProcessGroup};

// --- Error Type ---

/// Failures of a collective operation.
///
/// None of these are recoverable at the decomposition layer: a collective
/// that fails leaves the group in an unknown state.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("Peer {peer} disconnected")]
    Disconnected { peer: Rank },

    #[error("Payload codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Collective mismatch with peer {peer}: expected {expected:?} #{expected_seq}, got {got:?} #{got_seq}")]
    ProtocolMismatch {
        peer: Rank,
        expected: CollectiveOp,
        expected_seq: u64,
        got: CollectiveOp,
        got_seq: u64,
    },

    #[error("Rank {rank} is outside a group of {size}")]
    InvalidRank { rank: Rank, size: usize },

    #[error("Expected one buffer per rank ({expected}), got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Broadcast root {root} provided no value")]
    MissingRootValue { root: Rank },
}

/// Kind of collective a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectiveOp {
    Broadcast,
    AllToAll,
    Gather,
}

/// Running totals of what a node has put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub messages: u64,
    pub bytes: u64,
}

// --- Traits ---

/// One node's handle on a process group.
///
/// All collectives are blocking and must be entered by every rank of the
/// group in the same order.
pub trait Communicator: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    fn codec(&self) -> PayloadCodec;

    /// What this node has sent so far.
    fn traffic(&self) -> Traffic;

    /// Sends `payload` from `root` to every other rank. Non-root ranks pass
    /// `None` and receive the root's bytes.
    fn broadcast_bytes(&self, root: Rank, payload: Option<Vec<u8>>) -> Result<Vec<u8>, CommError>;

    /// Sends `outgoing[r]` to rank `r`; returns what every rank sent here,
    /// indexed by source.
    fn all_to_all_bytes(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError>;

    /// Collects one payload per rank at `root` (indexed by source rank).
    /// Non-root ranks get `None`.
    fn gather_bytes(&self, root: Rank, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError>;

    fn all_to_all<T>(&self, outgoing: Vec<T>) -> Result<Vec<T>, CommError>
    where
        T: Serialize + DeserializeOwned,
        Self: Sized,
    {
        let codec = self.codec();
        let encoded = outgoing
            .iter()
            .map(|item| codec.encode(item))
            .collect::<Result<Vec<_>, _>>()?;
        self.all_to_all_bytes(encoded)?
            .iter()
            .map(|bytes| codec.decode(bytes).map_err(CommError::from))
            .collect()
    }

    fn broadcast<T>(&self, root: Rank, value: Option<T>) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
        Self: Sized,
    {
        let codec = self.codec();
        let payload = match (self.rank() == root, value) {
            (true, Some(v)) => Some(codec.encode(&v)?),
            (true, None) => return Err(CommError::MissingRootValue { root }),
            (false, _) => None,
        };
        let bytes = self.broadcast_bytes(root, payload)?;
        Ok(codec.decode(&bytes)?)
    }

    /// Combines every rank's `value` at `root`, folding in rank order so the
    /// result is identical on every run. Non-root ranks get `None`.
    fn reduce<T, F>(&self, root: Rank, value: T, op: F) -> Result<Option<T>, CommError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
        Self: Sized,
    {
        let codec = self.codec();
        let gathered = self.gather_bytes(root, codec.encode(&value)?)?;
        let Some(parts) = gathered else {
            return Ok(None);
        };

        let mut acc: Option<T> = None;
        for bytes in &parts {
            let v: T = codec.decode(bytes)?;
            acc = Some(match acc {
                Some(a) => op(a, v),
                None => v,
            });
        }
        Ok(acc)
    }

    fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(T, T) -> T,
        Self: Sized,
    {
        let reduced = self.reduce(0, value, op)?;
        self.broadcast(0, reduced)
    }

    fn barrier(&self) -> Result<(), CommError>
    where
        Self: Sized,
    {
        self.all_reduce((), |_, _| ())
    }
}
