//! Flat decomposition: every node owns one cell and mirrors the cell of
//! every other node.
//!
//! The arena holds one cell per node, indexed by rank. On rank `r` cell `r`
//! is the local cell and all others are ghosts. Ownership follows
//! [`id_to_rank`], not position, so interactions of any range are covered.

use halo_core::{BoxGeometry, CellArena, CellHandle, DVec3, Neighbors, Particle, ParticleChange, ParticleId, Rank};
use halo_transport::Communicator;
use log::{debug, error, info};
use rayon::prelude::*;

use crate::ghost::{ghost_communicator, DataParts, ExchangeStats};
use crate::schedule::{GhostCommunication, GhostCommunicator, GhostKind};
use crate::{id_to_rank, DecompositionError, ParticleDecomposition};

pub struct AtomDecomposition<C: Communicator> {
    comm: C,
    cells: CellArena,
    /// Cell of node `i` at index `i`.
    node_cells: Vec<CellHandle>,
    local_cells: Vec<CellHandle>,
    ghost_cells: Vec<CellHandle>,
    exchange_ghosts_comm: GhostCommunicator,
    collect_ghost_force_comm: GhostCommunicator,
    box_geo: BoxGeometry,
}

impl<C: Communicator> AtomDecomposition<C> {
    /// Builds the cells, neighbor relation and both schedules. The result
    /// is ready for use.
    pub fn new(comm: C, box_geo: BoxGeometry) -> Self {
        let cells = CellArena::with_cells(comm.size());
        let node_cells = cells.handles().collect();

        let mut decomposition = Self {
            comm,
            cells,
            node_cells,
            local_cells: Vec::new(),
            ghost_cells: Vec::new(),
            exchange_ghosts_comm: GhostCommunicator::empty(),
            collect_ghost_force_comm: GhostCommunicator::empty(),
            box_geo,
        };

        decomposition.configure_comms();
        decomposition.configure_neighbors();
        decomposition.mark_cells();

        info!(
            "rank {}/{}: atom decomposition ready, {} ghost steps",
            decomposition.comm.rank(),
            decomposition.comm.size(),
            decomposition.exchange_ghosts_comm.len()
        );
        decomposition
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// This node's cell.
    pub fn local(&self) -> CellHandle {
        self.node_cells[self.comm.rank()]
    }

    /// Neighbor relation of the local cell.
    pub fn neighbors(&self) -> &Neighbors {
        &self.cells.get(self.local()).neighbors
    }

    pub fn id_to_rank(&self, id: ParticleId) -> Rank {
        id_to_rank(id, self.comm.size())
    }

    /// One broadcast step per node, addressing that node's cell. Empty for
    /// a single node.
    pub fn prepare_comm(&self) -> GhostCommunicator {
        let size = self.comm.size();
        if size == 1 {
            return GhostCommunicator::empty();
        }

        GhostCommunicator {
            communications: (0..size)
                .map(|n| GhostCommunication::new(n, vec![self.node_cells[n]]))
                .collect(),
        }
    }

    /// Builds the forward and reduction schedules and sets step kinds and
    /// prefetch flags for this rank.
    pub fn configure_comms(&mut self) {
        let rank = self.comm.rank();

        self.exchange_ghosts_comm = self.prepare_comm();
        self.collect_ghost_force_comm = self.prepare_comm();

        for (n, step) in self.exchange_ghosts_comm.communications.iter_mut().enumerate() {
            step.kind = GhostKind::Broadcast;
            step.prefetch = rank != 0 && rank == n;
        }
        // rank 0 sends first; everyone else can stage its buffer while
        // receiving from it
        if rank != 0 {
            if let Some(first) = self.exchange_ghosts_comm.communications.first_mut() {
                first.prefetch = true;
            }
        }

        for step in self.collect_ghost_force_comm.communications.iter_mut() {
            step.kind = GhostKind::Reduce;
            step.prefetch = false;
        }
    }

    /// Splits the other nodes' cells into lower (`first`) and higher
    /// (`second`) ranks.
    pub fn configure_neighbors(&mut self) {
        let rank = self.comm.rank();
        let neighbors = Neighbors::new(
            self.node_cells[..rank].to_vec(),
            self.node_cells[rank + 1..].to_vec(),
        );
        let local = self.local();
        self.cells.get_mut(local).neighbors = neighbors;
    }

    pub fn mark_cells(&mut self) {
        let local = self.local();
        self.local_cells = vec![local];
        self.ghost_cells = self.node_cells.iter().copied().filter(|&c| c != local).collect();
    }

    /// Number of particles owned across the whole group.
    pub fn total_particles(&self) -> Result<u64, DecompositionError> {
        let local = self.cells.particles(self.local()).len() as u64;
        Ok(self.comm.all_reduce(local, |a, b| a + b)?)
    }

    fn fold_local(&mut self) -> Result<(), DecompositionError> {
        let box_geo = self.box_geo;
        let local = self.local();
        self.cells
            .particles_mut(local)
            .as_mut_slice()
            .par_iter_mut()
            .try_for_each(|p| {
                let (pos, image_box) = box_geo.fold_position(p.pos, p.image_box).ok_or_else(|| {
                    DecompositionError::Invariant(format!(
                        "particle {} at {} with image {} cannot be folded into the box",
                        p.id(),
                        p.pos,
                        p.image_box
                    ))
                })?;
                p.pos = pos;
                p.image_box = image_box;
                p.pos_at_last_verlet_update = pos;
                Ok(())
            })
    }
}

impl<C: Communicator> ParticleDecomposition for AtomDecomposition<C> {
    fn cells(&self) -> &CellArena {
        &self.cells
    }

    fn cells_mut(&mut self) -> &mut CellArena {
        &mut self.cells
    }

    fn local_cells(&self) -> &[CellHandle] {
        &self.local_cells
    }

    fn ghost_cells(&self) -> &[CellHandle] {
        &self.ghost_cells
    }

    fn box_geo(&self) -> &BoxGeometry {
        &self.box_geo
    }

    fn exchange_ghosts_comm(&self) -> &GhostCommunicator {
        &self.exchange_ghosts_comm
    }

    fn collect_ghost_force_comm(&self) -> &GhostCommunicator {
        &self.collect_ghost_force_comm
    }

    fn particle_to_cell(&self, particle: &Particle) -> Option<CellHandle> {
        (self.id_to_rank(particle.id()) == self.comm.rank()).then(|| self.local())
    }

    fn resort(&mut self, global: bool) -> Result<Vec<ParticleChange>, DecompositionError> {
        self.fold_local()?;

        let size = self.comm.size();
        if !global || size == 1 {
            return Ok(Vec::new());
        }

        let rank = self.comm.rank();
        let local = self.local();
        let mut diff = Vec::new();
        let mut send_buf: Vec<Vec<Particle>> = vec![Vec::new(); size];

        let leaving = self
            .cells
            .particles_mut(local)
            .extract_where(|p| id_to_rank(p.id(), size) != rank);
        for p in leaving {
            diff.push(ParticleChange::RemovedParticle { id: p.id() });
            send_buf[id_to_rank(p.id(), size)].push(p);
        }
        let sent = diff.len();

        let recv_buf = self.comm.all_to_all(send_buf)?;

        diff.push(ParticleChange::ModifiedList { cell: local });

        // drain everything before reporting, so the local cell is complete
        let mut received = 0;
        let mut misrouted = Vec::new();
        for (src, particles) in recv_buf.into_iter().enumerate() {
            for p in particles {
                if id_to_rank(p.id(), size) != rank {
                    misrouted.push((src, p.id()));
                    continue;
                }
                self.cells.particles_mut(local).insert(p);
                received += 1;
            }
        }

        if let Some(&(src, id)) = misrouted.first() {
            error!(
                "rank {}: dropped {} particles sent to the wrong node during resort",
                rank,
                misrouted.len()
            );
            return Err(DecompositionError::Invariant(format!(
                "rank {} received {} misrouted particles, first {} from rank {} (owner is rank {})",
                rank,
                misrouted.len(),
                id,
                src,
                id_to_rank(id, size)
            )));
        }

        debug!("rank {}: resort sent {} particles, received {}", rank, sent, received);
        Ok(diff)
    }

    fn exchange_ghosts(&mut self, parts: DataParts) -> Result<ExchangeStats, DecompositionError> {
        ghost_communicator(&self.comm, &self.exchange_ghosts_comm, &mut self.cells, parts)
    }

    fn collect_ghost_forces(&mut self) -> Result<ExchangeStats, DecompositionError> {
        ghost_communicator(&self.comm, &self.collect_ghost_force_comm, &mut self.cells, DataParts::FORCE)
    }

    fn max_cutoff(&self) -> DVec3 {
        DVec3::splat(f64::INFINITY)
    }

    fn max_range(&self) -> DVec3 {
        DVec3::splat(f64::INFINITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_transport::{PayloadCodec, ProcessGroup};

    /// Decomposition as seen by `rank` in a group of `size`. Only
    /// construction is exercised, so the other members are dropped.
    fn view(size: usize, rank: usize) -> AtomDecomposition<halo_transport::LocalCommunicator> {
        let comm = ProcessGroup::local(size, PayloadCodec::Binary).remove(rank);
        AtomDecomposition::new(comm, BoxGeometry::new(DVec3::splat(10.0)))
    }

    fn indices(handles: &[CellHandle]) -> Vec<usize> {
        handles.iter().map(|c| c.index()).collect()
    }

    #[test]
    fn neighbors_split_by_rank() {
        let d = view(4, 2);
        assert_eq!(indices(d.neighbors().first()), vec![0, 1]);
        assert_eq!(indices(d.neighbors().second()), vec![3]);
    }

    #[test]
    fn neighbors_cover_every_other_rank_once() {
        for size in 1..=6 {
            for rank in 0..size {
                let d = view(size, rank);
                let mut all: Vec<usize> = d.neighbors().all().map(|c| c.index()).collect();
                assert_eq!(all.len(), size - 1);
                all.sort_unstable();
                let expected: Vec<usize> = (0..size).filter(|&r| r != rank).collect();
                assert_eq!(all, expected);
            }
        }
    }

    #[test]
    fn configure_neighbors_is_idempotent() {
        let mut d = view(5, 3);
        let before = d.neighbors().clone();
        d.configure_neighbors();
        d.configure_neighbors();
        assert_eq!(d.neighbors(), &before);
    }

    #[test]
    fn one_local_cell_and_the_rest_ghosts() {
        let d = view(4, 1);
        assert_eq!(indices(d.local_cells()), vec![1]);
        assert_eq!(indices(d.ghost_cells()), vec![0, 2, 3]);
    }

    #[test]
    fn single_node_has_no_schedule() {
        let d = view(1, 0);
        assert!(d.prepare_comm().is_empty());
        assert!(d.exchange_ghosts_comm().is_empty());
        assert!(d.collect_ghost_force_comm().is_empty());
        assert!(d.ghost_cells().is_empty());
    }

    #[test]
    fn prepared_steps_address_node_cells() {
        let d = view(3, 0);
        let schedule = d.prepare_comm();
        assert_eq!(schedule.len(), 3);
        for (n, step) in schedule.iter().enumerate() {
            assert_eq!(step.node, n);
            assert_eq!(indices(&step.part_lists), vec![n]);
        }
    }

    #[test]
    fn rank_zero_never_prefetches() {
        let d = view(4, 0);
        assert!(d.exchange_ghosts_comm().iter().all(|s| !s.prefetch));
    }

    #[test]
    fn other_ranks_prefetch_their_own_send() {
        for rank in 1..4 {
            let d = view(4, rank);
            let steps = &d.exchange_ghosts_comm().communications;
            assert!(steps[0].prefetch, "rank {} should stage during rank 0's round", rank);
            assert!(steps[rank].prefetch);
            assert!(steps[rank].is_prefetchable(rank));
            for (n, step) in steps.iter().enumerate() {
                if n != 0 && n != rank {
                    assert!(!step.prefetch);
                }
            }
        }
    }

    #[test]
    fn reduction_steps_never_prefetch() {
        let d = view(4, 2);
        assert!(d
            .collect_ghost_force_comm()
            .iter()
            .all(|s| s.kind == GhostKind::Reduce && !s.prefetch));
        assert!(d.exchange_ghosts_comm().iter().all(|s| s.kind == GhostKind::Broadcast));
    }

    #[test]
    fn single_node_resort_only_folds() {
        let mut d = view(1, 0);
        let local = d.local();
        let mut p = Particle::new(ParticleId::new(5), DVec3::new(12.5, -1.0, 3.0));
        p.pos_at_last_verlet_update = DVec3::ZERO;
        d.cells_mut().particles_mut(local).insert(p);

        let diff = d.resort(true).unwrap();
        assert!(diff.is_empty());
        assert_eq!(d.comm().traffic().messages, 0);

        let p = d.cells().particles(local).get(0).unwrap();
        assert!((p.pos - DVec3::new(2.5, 9.0, 3.0)).length() < 1e-12);
        assert_eq!(p.image_box, halo_core::IVec3::new(1, -1, 0));
        assert_eq!(p.pos_at_last_verlet_update, p.pos);
    }

    #[test]
    fn particle_to_cell_follows_ownership() {
        let d = view(3, 1);
        let mine = Particle::new(ParticleId::new(4), DVec3::ZERO);
        let theirs = Particle::new(ParticleId::new(5), DVec3::ZERO);
        assert_eq!(d.particle_to_cell(&mine), Some(d.local()));
        assert_eq!(d.particle_to_cell(&theirs), None);
    }

    #[test]
    fn range_is_unbounded() {
        let d = view(2, 0);
        assert_eq!(d.max_cutoff(), DVec3::splat(f64::INFINITY));
        assert_eq!(d.max_range(), DVec3::splat(f64::INFINITY));
        assert!(d.check_cutoff(1e9).is_ok());
    }

    #[test]
    fn unfoldable_particle_is_fatal() {
        let mut d = view(1, 0);
        let local = d.local();
        let mut p = Particle::new(ParticleId::new(2), DVec3::ONE);
        p.image_box = halo_core::IVec3::new(i32::MAX, 0, 0);
        p.pos.x = 25.0;
        d.cells_mut().particles_mut(local).insert(p);

        assert!(matches!(d.resort(false), Err(DecompositionError::Invariant(_))));
    }
}
