//! Data model shared by every halo crate: particles, cells, the neighbor
//! relation between cells, the periodic box and particle change records.

pub mod cell;
pub mod change;
pub mod geometry;
pub mod particle;

pub use cell::{Cell, CellArena, CellHandle, Neighbors};
pub use change::ParticleChange;
pub use geometry::{fold_coordinate, BoxGeometry};
pub use glam::{DVec3, IVec3};
pub use particle::{Particle, ParticleId, ParticleList};

/// Index of a node inside its communication group.
pub type Rank = usize;
