use glam::{DVec3, IVec3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-wide unique particle identity.
///
/// Ids are unsigned and bounded by `u32`, so every id has a well defined
/// owner under the modulo mapping used by the decompositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticleId(u32);

impl ParticleId {
    pub fn new(id: u32) -> Self {
        ParticleId(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ParticleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ParticleId {
    fn from(id: u32) -> Self {
        ParticleId(id)
    }
}

/// A single simulated particle.
///
/// Owned by exactly one node at a time; every other copy of it is a ghost
/// mirror refreshed by the ghost exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    id: ParticleId,
    pub pos: DVec3,
    pub vel: DVec3,
    pub force: DVec3,
    /// Position at the last neighbor-list rebuild (refreshed by every resort).
    pub pos_at_last_verlet_update: DVec3,
    /// Number of periodic box lengths crossed per axis.
    pub image_box: IVec3,
    /// Fixed particles are never moved by the integrator.
    pub fixed: bool,
}

impl Particle {
    pub fn new(id: ParticleId, pos: DVec3) -> Self {
        Particle {
            id,
            pos,
            vel: DVec3::ZERO,
            force: DVec3::ZERO,
            pos_at_last_verlet_update: pos,
            image_box: IVec3::ZERO,
            fixed: false,
        }
    }

    pub fn with_velocity(mut self, vel: DVec3) -> Self {
        self.vel = vel;
        self
    }

    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn id(&self) -> ParticleId {
        self.id
    }
}

/// Ordered particle storage backing a cell.
///
/// Insertion appends; removal keeps the relative order of the remaining
/// particles so that iteration order is stable across resorts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticleList {
    particles: Vec<Particle>,
}

impl ParticleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn insert(&mut self, particle: Particle) {
        self.particles.push(particle);
    }

    /// Removes the particle at `index`, shifting the tail down.
    pub fn erase(&mut self, index: usize) -> Particle {
        self.particles.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&Particle> {
        self.particles.get(index)
    }

    pub fn find(&self, id: ParticleId) -> Option<&Particle> {
        self.particles.iter().find(|p| p.id() == id)
    }

    pub fn contains(&self, id: ParticleId) -> bool {
        self.find(id).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Particle> {
        self.particles.iter_mut()
    }

    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }

    pub fn as_mut_slice(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn ids(&self) -> Vec<ParticleId> {
        self.particles.iter().map(Particle::id).collect()
    }

    /// Removes every particle for which `predicate` returns true and hands
    /// them back in their original order.
    pub fn extract_where<F>(&mut self, mut predicate: F) -> Vec<Particle>
    where
        F: FnMut(&Particle) -> bool,
    {
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.particles).into_iter().partition(|p| predicate(p));
        self.particles = kept;
        taken
    }

    /// Replaces the whole content, used when a ghost mirror is rebuilt.
    pub fn replace(&mut self, particles: Vec<Particle>) {
        self.particles = particles;
    }

    pub fn clear(&mut self) {
        self.particles.clear();
    }
}

impl FromIterator<Particle> for ParticleList {
    fn from_iter<I: IntoIterator<Item = Particle>>(iter: I) -> Self {
        ParticleList { particles: iter.into_iter().collect() }
    }
}

impl Extend<Particle> for ParticleList {
    fn extend<I: IntoIterator<Item = Particle>>(&mut self, iter: I) {
        self.particles.extend(iter);
    }
}

impl IntoIterator for ParticleList {
    type Item = Particle;
    type IntoIter = std::vec::IntoIter<Particle>;

    fn into_iter(self) -> Self::IntoIter {
        self.particles.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParticleList {
    type Item = &'a Particle;
    type IntoIter = std::slice::Iter<'a, Particle>;

    fn into_iter(self) -> Self::IntoIter {
        self.particles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(ids: &[u32]) -> ParticleList {
        ids.iter()
            .map(|&i| Particle::new(ParticleId::new(i), DVec3::splat(i as f64)))
            .collect()
    }

    #[test]
    fn extract_keeps_order_on_both_sides() {
        let mut list = list_of(&[0, 1, 2, 3, 4, 5]);
        let odd = list.extract_where(|p| p.id().get() % 2 == 1);

        let odd_ids: Vec<u32> = odd.iter().map(|p| p.id().get()).collect();
        let kept_ids: Vec<u32> = list.ids().iter().map(|id| id.get()).collect();
        assert_eq!(odd_ids, vec![1, 3, 5]);
        assert_eq!(kept_ids, vec![0, 2, 4]);
    }

    #[test]
    fn erase_shifts_tail() {
        let mut list = list_of(&[7, 8, 9]);
        let removed = list.erase(1);
        assert_eq!(removed.id(), ParticleId::new(8));
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(1).unwrap().id(), ParticleId::new(9));
    }

    #[test]
    fn new_particle_caches_rebuild_position() {
        let p = Particle::new(ParticleId::new(3), DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(p.pos_at_last_verlet_update, p.pos);
        assert!(!p.fixed);
    }

    #[test]
    fn particle_survives_binary_encoding() {
        let p = Particle::new(ParticleId::new(42), DVec3::new(0.5, 1.5, 2.5))
            .with_velocity(DVec3::X)
            .with_fixed(true);
        let bytes = bincode::serialize(&p).unwrap();
        let back: Particle = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, p);
    }
}
