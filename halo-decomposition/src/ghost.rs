//! Replays a [`GhostCommunicator`] schedule.
//!
//! Forward schedules push local particle data into the mirrors held by the
//! other nodes; reduction schedules pull the forces accumulated on those
//! mirrors back into the owning node. The engine only knows how to run a
//! step of a given kind; which steps exist is decided by the decomposition.

use std::ops::BitOr;

use halo_core::{CellArena, CellHandle, DVec3, IVec3, Particle, ParticleId, ParticleList, Rank};
use halo_transport::{Communicator, PayloadCodec};
use log::trace;
use serde::{Deserialize, Serialize};

use crate::schedule::{GhostCommunication, GhostCommunicator, GhostKind};
use crate::DecompositionError;

/// Selection of particle fields carried by a forward replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataParts(u8);

impl DataParts {
    /// Identity and fixed flag. Rebuilds the mirrors from scratch.
    pub const PROPERTIES: DataParts = DataParts(1);
    /// Position and image box.
    pub const POSITION: DataParts = DataParts(1 << 1);
    pub const MOMENTUM: DataParts = DataParts(1 << 2);
    pub const FORCE: DataParts = DataParts(1 << 3);

    pub fn empty() -> Self {
        DataParts(0)
    }

    pub fn all() -> Self {
        Self::PROPERTIES | Self::POSITION | Self::MOMENTUM | Self::FORCE
    }

    pub fn contains(&self, other: DataParts) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DataParts {
    type Output = DataParts;

    fn bitor(self, rhs: Self) -> Self::Output {
        DataParts(self.0 | rhs.0)
    }
}

/// What one replay did on this node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub steps: usize,
    pub sends: usize,
    pub receives: usize,
    /// Send buffers staged ahead of their round.
    pub prefetched: usize,
    pub bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct GhostRecord {
    properties: Option<(ParticleId, bool)>,
    position: Option<(DVec3, IVec3)>,
    momentum: Option<DVec3>,
    force: Option<DVec3>,
}

impl GhostRecord {
    fn pack(p: &Particle, parts: DataParts) -> Self {
        GhostRecord {
            properties: parts.contains(DataParts::PROPERTIES).then(|| (p.id(), p.fixed)),
            position: parts.contains(DataParts::POSITION).then(|| (p.pos, p.image_box)),
            momentum: parts.contains(DataParts::MOMENTUM).then_some(p.vel),
            force: parts.contains(DataParts::FORCE).then_some(p.force),
        }
    }

    fn apply(&self, p: &mut Particle) {
        if let Some((_, fixed)) = self.properties {
            p.fixed = fixed;
        }
        if let Some((pos, image)) = self.position {
            p.pos = pos;
            p.image_box = image;
        }
        if let Some(vel) = self.momentum {
            p.vel = vel;
        }
        if let Some(force) = self.force {
            p.force = force;
        }
    }

    fn into_particle(self) -> Option<Particle> {
        let (id, _) = self.properties?;
        let mut p = Particle::new(id, self.position.map_or(DVec3::ZERO, |(pos, _)| pos));
        self.apply(&mut p);
        Some(p)
    }
}

/// Executes every step of `schedule` on this node.
///
/// `parts` only affects broadcast steps; reduction steps always carry
/// forces. An empty schedule does nothing.
pub fn ghost_communicator<C: Communicator>(
    comm: &C,
    schedule: &GhostCommunicator,
    cells: &mut CellArena,
    parts: DataParts,
) -> Result<ExchangeStats, DecompositionError> {
    let rank = comm.rank();
    let codec = comm.codec();
    let traffic_before = comm.traffic();
    let mut stats = ExchangeStats::default();

    // (step index, buffer) staged by an earlier round
    let mut staged: Option<(usize, Vec<u8>)> = None;

    for (i, ghost_comm) in schedule.iter().enumerate() {
        let mut send_buffer = None;

        if ghost_comm.is_send_op(rank) {
            let buffer = match staged.take() {
                Some((step, buffer)) if step == i => buffer,
                other => {
                    staged = other;
                    prepare_send_buffer(codec, ghost_comm, cells, parts, rank)?
                }
            };
            send_buffer = Some(buffer);
            stats.sends += 1;
        } else if ghost_comm.prefetch && staged.is_none() {
            // we only receive this round; stage our next prefetchable send
            let next = schedule
                .iter()
                .enumerate()
                .skip(i + 1)
                .find(|(_, c)| c.is_prefetchable(rank));
            if let Some((step, next_comm)) = next {
                staged = Some((step, prepare_send_buffer(codec, next_comm, cells, parts, rank)?));
                stats.prefetched += 1;
                trace!("rank {}: staged send buffer of step {} during step {}", rank, step, i);
            }
        }

        match ghost_comm.kind {
            GhostKind::Broadcast => {
                let bytes = comm.broadcast_bytes(ghost_comm.node, send_buffer)?;
                if ghost_comm.is_recv_op(rank) {
                    put_recv_buffer(codec, &bytes, ghost_comm, cells, parts)?;
                    stats.receives += 1;
                }
            }
            GhostKind::Reduce => {
                let payload = send_buffer.unwrap_or_default();
                if let Some(contributions) = comm.gather_bytes(ghost_comm.node, payload)? {
                    add_forces(codec, contributions, ghost_comm, cells)?;
                    stats.receives += 1;
                }
            }
        }
        stats.steps += 1;
    }

    stats.bytes = comm.traffic().bytes - traffic_before.bytes;
    trace!("rank {}: ghost replay {:?}", rank, stats);
    Ok(stats)
}

fn prepare_send_buffer(
    codec: PayloadCodec,
    ghost_comm: &GhostCommunication,
    cells: &CellArena,
    parts: DataParts,
    rank: Rank,
) -> Result<Vec<u8>, DecompositionError> {
    match ghost_comm.kind {
        GhostKind::Broadcast => {
            let lists: Vec<Vec<GhostRecord>> = ghost_comm
                .part_lists
                .iter()
                .map(|&cell| {
                    cells
                        .particles(cell)
                        .iter()
                        .map(|p| GhostRecord::pack(p, parts))
                        .collect()
                })
                .collect();
            Ok(codec.encode(&lists)?)
        }
        GhostKind::Reduce => {
            // the root's own forces are already where they belong
            let forces: Vec<Vec<DVec3>> = if ghost_comm.node == rank {
                Vec::new()
            } else {
                ghost_comm
                    .part_lists
                    .iter()
                    .map(|&cell| cells.particles(cell).iter().map(|p| p.force).collect())
                    .collect()
            };
            Ok(codec.encode(&forces)?)
        }
    }
}

fn put_recv_buffer(
    codec: PayloadCodec,
    bytes: &[u8],
    ghost_comm: &GhostCommunication,
    cells: &mut CellArena,
    parts: DataParts,
) -> Result<(), DecompositionError> {
    let lists: Vec<Vec<GhostRecord>> = codec.decode(bytes)?;
    check_list_count(ghost_comm, lists.len())?;

    for (&cell, records) in ghost_comm.part_lists.iter().zip(lists) {
        let target = cells.particles_mut(cell);
        if parts.contains(DataParts::PROPERTIES) {
            let rebuilt: Option<Vec<Particle>> = records.into_iter().map(GhostRecord::into_particle).collect();
            let rebuilt = rebuilt.ok_or_else(|| {
                DecompositionError::Invariant("ghost record without identity in a properties exchange".to_string())
            })?;
            target.replace(rebuilt);
        } else {
            check_length(cell, target, records.len())?;
            for (p, record) in target.iter_mut().zip(&records) {
                record.apply(p);
            }
        }
    }
    Ok(())
}

fn add_forces(
    codec: PayloadCodec,
    contributions: Vec<Vec<u8>>,
    ghost_comm: &GhostCommunication,
    cells: &mut CellArena,
) -> Result<(), DecompositionError> {
    for (src, bytes) in contributions.iter().enumerate() {
        if src == ghost_comm.node {
            continue;
        }
        let lists: Vec<Vec<DVec3>> = codec.decode(bytes)?;
        check_list_count(ghost_comm, lists.len())?;

        for (&cell, forces) in ghost_comm.part_lists.iter().zip(&lists) {
            let target = cells.particles_mut(cell);
            check_length(cell, target, forces.len())?;
            for (p, f) in target.iter_mut().zip(forces) {
                p.force += *f;
            }
        }
    }
    Ok(())
}

fn check_list_count(ghost_comm: &GhostCommunication, got: usize) -> Result<(), DecompositionError> {
    if got != ghost_comm.part_lists.len() {
        return Err(DecompositionError::Invariant(format!(
            "step of node {} expects {} particle lists, received {}",
            ghost_comm.node,
            ghost_comm.part_lists.len(),
            got
        )));
    }
    Ok(())
}

fn check_length(cell: CellHandle, list: &ParticleList, got: usize) -> Result<(), DecompositionError> {
    if list.len() != got {
        return Err(DecompositionError::GhostLengthMismatch {
            cell: cell.index(),
            expected: list.len(),
            got,
        });
    }
    Ok(())
}
