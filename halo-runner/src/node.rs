//! The per-node simulation loop.

use std::time::Instant;

use halo_config::{Placement, RunConfig};
use halo_core::{BoxGeometry, DVec3, Particle, ParticleId};
use halo_decomposition::{
    id_to_rank, resort_required, AtomDecomposition, DataParts, ParticleDecomposition, RebuildReference,
};
use halo_transport::Communicator;
use hdrhistogram::Histogram;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::RunnerError;

/// What a node hands back once its loop is done.
pub struct NodeReport {
    pub rank: usize,
    /// Wall time per step, in microseconds.
    pub step_times: Histogram<u64>,
    pub global_resorts: u64,
    pub ghost_bytes: u64,
    pub local_particles: usize,
}

/// Generates the initial particles this node starts out with.
///
/// Every node draws the full sequence from the same seed and keeps its
/// share, so the set is identical for any node count.
pub fn seed_particles(config: &RunConfig, seed: u64, rank: usize) -> Vec<Particle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let setup = &config.particles;
    let length = DVec3::from_array(config.box_length);
    let speed = setup.max_speed;

    let mut particles = Vec::new();
    for id in 0..setup.count {
        let unit = DVec3::new(rng.gen(), rng.gen(), rng.gen());
        let vel = DVec3::new(
            rng.gen_range(-speed..=speed),
            rng.gen_range(-speed..=speed),
            rng.gen_range(-speed..=speed),
        );

        let id = ParticleId::new(id);
        let keep = match setup.placement {
            Placement::AllOnRoot => rank == 0,
            Placement::Scattered => id_to_rank(id, config.nodes) == rank,
        };
        if keep {
            let fixed = setup.fixed_every > 0 && id.get() % setup.fixed_every == 0;
            particles.push(
                Particle::new(id, unit * length)
                    .with_velocity(vel)
                    .with_fixed(fixed),
            );
        }
    }
    particles
}

fn drift<D: ParticleDecomposition>(decomposition: &mut D, dt: f64) {
    let local_cells = decomposition.local_cells().to_vec();
    let ghost_cells = decomposition.ghost_cells().to_vec();
    let cells = decomposition.cells_mut();

    for cell in local_cells {
        for p in cells.particles_mut(cell).iter_mut() {
            p.force = DVec3::ZERO;
            if !p.fixed {
                p.pos += p.vel * dt;
            }
        }
    }
    for cell in ghost_cells {
        for p in cells.particles_mut(cell).iter_mut() {
            p.force = DVec3::ZERO;
        }
    }
}

pub fn run_node<C: Communicator>(comm: C, config: &RunConfig) -> Result<NodeReport, RunnerError> {
    let box_geo = BoxGeometry::with_periodicity(DVec3::from_array(config.box_length), config.periodic);
    let mut decomposition = AtomDecomposition::new(comm, box_geo);
    decomposition.check_cutoff(config.interaction_cutoff)?;

    let rank = decomposition.comm().rank();
    let seed = match config.particles.seed {
        Some(seed) => seed,
        None => decomposition.comm().broadcast(0, (rank == 0).then(rand::random::<u64>))?,
    };

    let local = decomposition.local();
    let initial = seed_particles(config, seed, rank);
    debug!("rank {}: seeded {} particles (seed {})", rank, initial.len(), seed);
    decomposition.cells_mut().particles_mut(local).extend(initial);

    let changes = decomposition.resort(true)?;
    debug!("rank {}: initial resort produced {} change records", rank, changes.len());
    let mut reference = RebuildReference::capture(decomposition.cells().particles(local), &box_geo);
    let mut ghost_bytes = decomposition
        .exchange_ghosts(DataParts::PROPERTIES | DataParts::POSITION | DataParts::MOMENTUM)?
        .bytes;

    let mut step_times = Histogram::<u64>::new(3)?;
    let mut global_resorts = 1;

    for step in 1..=config.steps {
        let started = Instant::now();

        drift(&mut decomposition, config.time_step);

        let moved = resort_required(
            decomposition.cells().particles(local),
            &reference,
            &box_geo,
            config.resort.skin,
        );
        let due = config.resort.interval.map_or(false, |n| step % n == 0);
        // every node has to agree before entering the exchange
        let global = decomposition.comm().all_reduce(moved, |a, b| a || b)? || due;

        let changes = decomposition.resort(global)?;
        let parts = if global {
            global_resorts += 1;
            debug!("rank {}: step {} global resort, {} change records", rank, step, changes.len());
            reference = RebuildReference::capture(decomposition.cells().particles(local), &box_geo);
            DataParts::PROPERTIES | DataParts::POSITION | DataParts::MOMENTUM
        } else {
            DataParts::POSITION | DataParts::MOMENTUM
        };

        ghost_bytes += decomposition.exchange_ghosts(parts)?.bytes;
        ghost_bytes += decomposition.collect_ghost_forces()?.bytes;

        step_times.saturating_record(started.elapsed().as_micros() as u64);
    }

    let total = decomposition.total_particles()?;
    if total != u64::from(config.particles.count) {
        return Err(RunnerError::Invariant(format!(
            "{} particles at the end of the run, started with {}",
            total, config.particles.count
        )));
    }

    let local_particles = decomposition.cells().particles(local).len();
    info!(
        "rank {}: finished with {} local particles, {} global resorts",
        rank, local_particles, global_resorts
    );

    Ok(NodeReport {
        rank,
        step_times,
        global_resorts,
        ghost_bytes,
        local_particles,
    })
}
