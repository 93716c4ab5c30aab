use crate::particle::ParticleList;
use serde::{Deserialize, Serialize};

/// Stable index of a cell inside a [`CellArena`].
///
/// Handles stay valid for as long as the arena that issued them; they are
/// the only way cells refer to one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellHandle(usize);

impl CellHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Neighbor relation of a cell, split so that every unordered pair of
/// cells is visited from exactly one side.
///
/// `first` holds the cells of lower-ranked nodes, `second` those of
/// higher-ranked nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighbors {
    first: Vec<CellHandle>,
    second: Vec<CellHandle>,
}

impl Neighbors {
    pub fn new(first: Vec<CellHandle>, second: Vec<CellHandle>) -> Self {
        Self { first, second }
    }

    pub fn first(&self) -> &[CellHandle] {
        &self.first
    }

    pub fn second(&self) -> &[CellHandle] {
        &self.second
    }

    /// All neighbors, `first` before `second`.
    pub fn all(&self) -> impl Iterator<Item = CellHandle> + '_ {
        self.first.iter().chain(self.second.iter()).copied()
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The unit of particle storage a decomposition manipulates.
#[derive(Debug, Clone, Default)]
pub struct Cell {
    particles: ParticleList,
    pub neighbors: Neighbors,
}

impl Cell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn particles(&self) -> &ParticleList {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut ParticleList {
        &mut self.particles
    }
}

/// Owns every cell of a decomposition and hands out [`CellHandle`]s.
#[derive(Debug, Default)]
pub struct CellArena {
    cells: Vec<Cell>,
}

impl CellArena {
    /// Creates an arena holding `count` empty cells with handles `0..count`.
    pub fn with_cells(count: usize) -> Self {
        Self {
            cells: (0..count).map(|_| Cell::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Handle for the cell at `index`, if it exists.
    pub fn handle(&self, index: usize) -> Option<CellHandle> {
        (index < self.cells.len()).then_some(CellHandle(index))
    }

    pub fn handles(&self) -> impl Iterator<Item = CellHandle> {
        (0..self.cells.len()).map(CellHandle)
    }

    pub fn get(&self, handle: CellHandle) -> &Cell {
        &self.cells[handle.0]
    }

    pub fn get_mut(&mut self, handle: CellHandle) -> &mut Cell {
        &mut self.cells[handle.0]
    }

    pub fn particles(&self, handle: CellHandle) -> &ParticleList {
        self.get(handle).particles()
    }

    pub fn particles_mut(&mut self, handle: CellHandle) -> &mut ParticleList {
        self.get_mut(handle).particles_mut()
    }
}
