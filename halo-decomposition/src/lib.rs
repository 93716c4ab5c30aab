//! Distribution of particles over the nodes of a process group.
//!
//! A decomposition decides which node owns which particle, keeps ghost
//! mirrors of remote particles and builds the schedules that keep those
//! mirrors in sync. [`AtomDecomposition`] is the flat scheme: one cell per
//! node, ownership by particle id.

pub mod atom;
pub mod ghost;
pub mod schedule;
pub mod trigger;

use halo_core::{BoxGeometry, CellArena, CellHandle, DVec3, Particle, ParticleChange, ParticleId, Rank};
use halo_transport::{CodecError, CommError};
use thiserror::Error;

pub use self::atom::AtomDecomposition;
pub use self::ghost::{ghost_communicator, DataParts, ExchangeStats};
pub use self::schedule::{GhostCommunication, GhostCommunicator, GhostKind};
pub use self::trigger::{resort_required, RebuildReference};

// --- Error Types ---

/// Failures that leave the distributed state unusable. Callers are expected
/// to abort the run.
#[derive(Error, Debug)]
pub enum DecompositionError {
    #[error("Communication failed: {0}")]
    Comm(#[from] CommError),

    #[error("Ghost payload could not be encoded: {0}")]
    Codec(#[from] CodecError),

    #[error("Ghost list of cell {cell} holds {expected} particles, received {got}")]
    GhostLengthMismatch { cell: usize, expected: usize, got: usize },

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// An interaction range the decomposition cannot serve. Recoverable: the
/// caller can pick a smaller cutoff and try again.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RangeError {
    #[error("Cutoff {requested} exceeds the supported range {supported:?}")]
    CutoffTooLarge { requested: f64, supported: DVec3 },
}

// --- Helpers ---

/// Owning node of a particle.
pub fn id_to_rank(id: ParticleId, nodes: usize) -> Rank {
    debug_assert!(nodes > 0);
    id.get() as usize % nodes
}

/// Checks `cutoff` against a per-axis maximum.
pub fn check_cutoff_against(cutoff: f64, max: DVec3) -> Result<(), RangeError> {
    if cutoff > max.min_element() {
        return Err(RangeError::CutoffTooLarge {
            requested: cutoff,
            supported: max,
        });
    }
    Ok(())
}

// --- Traits ---

/// Operations shared by every decomposition scheme, so that integrators and
/// force drivers do not depend on a particular one.
pub trait ParticleDecomposition {
    fn cells(&self) -> &CellArena;

    fn cells_mut(&mut self) -> &mut CellArena;

    /// Cells whose particles this node owns.
    fn local_cells(&self) -> &[CellHandle];

    /// Cells mirroring particles owned elsewhere.
    fn ghost_cells(&self) -> &[CellHandle];

    fn box_geo(&self) -> &BoxGeometry;

    /// Schedule pushing local data into remote mirrors.
    fn exchange_ghosts_comm(&self) -> &GhostCommunicator;

    /// Schedule reducing mirror forces into their owners.
    fn collect_ghost_force_comm(&self) -> &GhostCommunicator;

    /// Local cell a particle belongs in, or `None` if another node owns it.
    fn particle_to_cell(&self, particle: &Particle) -> Option<CellHandle>;

    /// Folds positions back into the box and, if `global` is set, moves
    /// every particle to its owning node.
    fn resort(&mut self, global: bool) -> Result<Vec<ParticleChange>, DecompositionError>;

    /// Replays the forward schedule carrying `parts`.
    fn exchange_ghosts(&mut self, parts: DataParts) -> Result<ExchangeStats, DecompositionError>;

    /// Replays the reduction schedule.
    fn collect_ghost_forces(&mut self) -> Result<ExchangeStats, DecompositionError>;

    fn max_cutoff(&self) -> DVec3;

    fn max_range(&self) -> DVec3;

    fn check_cutoff(&self, cutoff: f64) -> Result<(), RangeError> {
        check_cutoff_against(cutoff, self.max_cutoff())
    }
}
