use crate::cell::CellHandle;
use crate::particle::ParticleId;

/// Incremental change record emitted by a resort.
///
/// Consumers such as neighbor-list rebuilders or bond trackers react to
/// these instead of rescanning every particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticleChange {
    /// The particle left this node.
    RemovedParticle { id: ParticleId },
    /// The referenced local list was modified (particles were added).
    ModifiedList { cell: CellHandle },
}

impl ParticleChange {
    pub fn removed_id(&self) -> Option<ParticleId> {
        match self {
            ParticleChange::RemovedParticle { id } => Some(*id),
            ParticleChange::ModifiedList { .. } => None,
        }
    }
}
