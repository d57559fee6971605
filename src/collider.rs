//! Broad-phase collision detection by sweep-and-prune on the x axis. The
//! collider proposes candidate pairs to the interaction registry and is the
//! only component that decides when a non-real candidate is forgotten.

use log::debug;

use crate::body::{BodyContainer, BodyId};
use crate::geometry::{Aabb, Real};
use crate::interaction_container::{InteractionContainer, ShouldErase};
use crate::parallel::WorkerPool;

/// Erase predicate: a non-real pair is dropped once either body is gone or
/// the two bounds stopped overlapping.
pub struct BoundsOverlap<'a> {
    pub bodies: &'a BodyContainer,
}

impl ShouldErase for BoundsOverlap<'_> {
    fn should_be_erased(&self, id1: BodyId, id2: BodyId) -> bool {
        match (self.bodies.get(id1), self.bodies.get(id2)) {
            (Some(b1), Some(b2)) => match (&b1.bound, &b2.bound) {
                (Some(a), Some(b)) => !a.overlaps(b),
                _ => true,
            },
            _ => true,
        }
    }
}

#[derive(Clone, Copy)]
struct Endpoint {
    value: Real,
    id: BodyId,
    is_min: bool,
}

/// Return all pairs (lower id first) whose bounds overlap.
pub fn sweep_and_prune(bounds: &[(BodyId, Aabb)]) -> Vec<(BodyId, BodyId)> {
    let mut endpoints = Vec::with_capacity(2 * bounds.len());
    let mut lookup = std::collections::HashMap::with_capacity(bounds.len());

    for (id, aabb) in bounds {
        lookup.insert(*id, *aabb);
        endpoints.push(Endpoint { value: aabb.min.x, id: *id, is_min: true });
        endpoints.push(Endpoint { value: aabb.max.x, id: *id, is_min: false });
    }

    // Openings sort before closings at equal coordinates, so touching boxes
    // are reported.
    endpoints.sort_by(|a, b| {
        a.value
            .partial_cmp(&b.value)
            .unwrap_or(core::cmp::Ordering::Equal)
            .then(b.is_min.cmp(&a.is_min))
    });

    let mut pairs = Vec::new();
    let mut active: Vec<BodyId> = Vec::new();

    for ep in endpoints {
        if ep.is_min {
            for &other in &active {
                if lookup[&ep.id].overlaps(&lookup[&other]) {
                    pairs.push(if ep.id < other { (ep.id, other) } else { (other, ep.id) });
                }
            }
            active.push(ep.id);
        } else {
            active.retain(|&x| x != ep.id);
        }
    }
    pairs
}

/// Sweep-and-prune collider with a Verlet distance added to every bound.
pub struct Collider {
    pub verlet_dist: Real,
}

impl Collider {
    pub fn new(verlet_dist: Real) -> Self {
        Self { verlet_dist }
    }

    /// Recompute the bound of every body present in the container. This is
    /// the bound-dispatch pass that `Subdomain::set_min_max` relies on.
    pub fn update_bounds(&self, bodies: &mut BodyContainer) {
        for b in bodies.iter_mut() {
            b.update_bound(self.verlet_dist)
        }
    }

    /// Insert candidates for all overlapping pairs, then erase non-real
    /// interactions whose bounds separated. Returns (inserted, erased).
    pub fn run(
        &self,
        bodies: &mut BodyContainer,
        interactions: &mut InteractionContainer,
        pool: &WorkerPool,
        iter: u64,
    ) -> (usize, usize) {
        self.update_bounds(bodies);

        if interactions.body_count() < bodies.size() {
            interactions.set_body_count(bodies.size());
        }

        let bounds: Vec<_> = bodies
            .iter()
            .filter_map(|b| b.bound.map(|aabb| (b.id, aabb)))
            .collect();

        let mut inserted = 0;
        for (a, b) in sweep_and_prune(&bounds) {
            if interactions.insert(a, b) {
                inserted += 1
            }
        }
        let erased = interactions.conditionally_erase_non_real(&BoundsOverlap { bodies: &*bodies }, pool);
        interactions.iter_collider_last_run = Some(iter);

        debug!(
            "collider at iteration {}: {} inserted, {} erased, {} total",
            iter,
            inserted,
            erased,
            interactions.len()
        );
        (inserted, erased)
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::{sweep_and_prune, Collider};
    use crate::body::{Body, BodyContainer};
    use crate::geometry::{Aabb, Vector3r};
    use crate::interaction_container::InteractionContainer;
    use crate::parallel::WorkerPool;

    fn unit_box(x: f64) -> Aabb {
        Aabb::new(Vector3r::new(x, 0.0, 0.0), Vector3r::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn sweep_and_prune_finds_overlaps_only() {
        let bounds = vec![(4, unit_box(0.0)), (1, unit_box(0.5)), (2, unit_box(3.0))];
        assert_eq!(sweep_and_prune(&bounds), vec![(1, 4)]);
    }

    #[test]
    fn collider_inserts_then_forgets_separated_pairs() {
        let pool = WorkerPool::new(2).unwrap();
        let mut bodies = BodyContainer::new();
        bodies.insert(Body::sphere(0, Vector3r::new(0.0, 0.0, 0.0), 0.5));
        bodies.insert(Body::sphere(0, Vector3r::new(0.9, 0.0, 0.0), 0.5));
        bodies.insert(Body::sphere(0, Vector3r::new(5.0, 0.0, 0.0), 0.5));
        let mut intrs = InteractionContainer::new();

        let collider = Collider::new(0.0);
        assert_eq!(collider.run(&mut bodies, &mut intrs, &pool, 0), (1, 0));
        assert!(intrs.found(0, 1));

        bodies.get_mut(1).unwrap().state.pos.x = 3.0;
        assert_eq!(collider.run(&mut bodies, &mut intrs, &pool, 1), (0, 1));
        assert!(intrs.is_empty());
        assert_eq!(intrs.iter_collider_last_run, Some(1));
    }
}
