use std::collections::HashMap;

use halo_core::{BoxGeometry, DVec3, ParticleId, ParticleList};
use rayon::prelude::*;

/// Unfolded positions of the local particles at the last global resort.
///
/// Local resorts fold positions and refresh the per-particle rebuild cache
/// every step, so drift is measured against this snapshot instead.
#[derive(Debug, Clone, Default)]
pub struct RebuildReference {
    positions: HashMap<ParticleId, DVec3>,
}

impl RebuildReference {
    pub fn capture(particles: &ParticleList, box_geo: &BoxGeometry) -> Self {
        Self {
            positions: particles
                .iter()
                .map(|p| (p.id(), box_geo.unfolded_position(p.pos, p.image_box)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Distance `id` travelled since the snapshot, `None` if it was not
    /// local at that time.
    pub fn displacement(&self, id: ParticleId, unfolded: DVec3) -> Option<f64> {
        self.positions.get(&id).map(|start| (unfolded - *start).length())
    }
}

/// Whether any particle in `particles` moved more than half the Verlet
/// skin since `reference` was captured. A particle missing from the
/// reference always requires a resort.
pub fn resort_required(
    particles: &ParticleList,
    reference: &RebuildReference,
    box_geo: &BoxGeometry,
    skin: f64,
) -> bool {
    let limit = 0.5 * skin;
    particles.as_slice().par_iter().any(|p| {
        let unfolded = box_geo.unfolded_position(p.pos, p.image_box);
        reference
            .displacement(p.id(), unfolded)
            .map_or(true, |d| d > limit)
    })
}
