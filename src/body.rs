use serde::{Deserialize, Serialize};

use crate::geometry::{Aabb, Quaternionr, Real, Vector3r};

/// Stable body identifier. Ids are global: every rank indexes its body
/// container with the same ids, and slots of bodies owned elsewhere may be
/// empty.
pub type BodyId = usize;




/**
 * Kinematic state of a body.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub pos: Vector3r,
    pub vel: Vector3r,
    pub ang_vel: Vector3r,
    pub ori: Quaternionr,
}

impl Default for State {
    fn default() -> Self {
        Self {
            pos: Vector3r::zeros(),
            vel: Vector3r::zeros(),
            ang_vel: Vector3r::zeros(),
            ori: Quaternionr::identity(),
        }
    }
}




/**
 * Geometric description of a body. `FluidDomain` is the shape of the
 * massless pseudo-bodies standing for an external solver's partition; its
 * bound is the partition's box and never moves.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Sphere { radius: Real },
    Box { half_extents: Vector3r },
    FluidDomain { domain_rank: usize, bbox: Aabb },
}




/**
 * A body: the collaborator that the interaction registry and the subdomain
 * index into.
 */
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Body {
    pub id: BodyId,
    pub subdomain: usize,
    pub state: State,
    pub shape: Shape,
    pub bound: Option<Aabb>,
}




// ============================================================================
impl Body {

    pub fn sphere(id: BodyId, pos: Vector3r, radius: Real) -> Self {
        Self {
            id,
            subdomain: 0,
            state: State {
                pos,
                ..State::default()
            },
            shape: Shape::Sphere { radius },
            bound: None,
        }
    }

    pub fn radius(&self) -> Option<Real> {
        match self.shape {
            Shape::Sphere { radius } => Some(radius),
            _ => None,
        }
    }

    pub fn is_fluid_domain(&self) -> bool {
        matches!(self.shape, Shape::FluidDomain { .. })
    }

    /**
     * Recompute the body's axis-aligned bound from its shape and position,
     * enlarged by `verlet_dist`. Fluid-domain pseudo-bodies get their fixed
     * box.
     */
    pub fn update_bound(&mut self, verlet_dist: Real) {
        let pos = self.state.pos;
        self.bound = Some(match &self.shape {
            Shape::Sphere { radius } => {
                let r = Vector3r::repeat(radius + verlet_dist);
                Aabb::new(pos - r, pos + r)
            }
            Shape::Box { half_extents } => {
                let h = half_extents.add_scalar(verlet_dist);
                Aabb::new(pos - h, pos + h)
            }
            Shape::FluidDomain { bbox, .. } => *bbox,
        });
    }
}




/**
 * Body collection indexed by global body id. Slots are `None` for bodies that
 * were never created on this rank or that migrated away.
 */
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BodyContainer {
    body: Vec<Option<Body>>,
}




// ============================================================================
impl BodyContainer {

    pub fn new() -> Self {
        Self::default()
    }

    /**
     * Number of slots, i.e. one past the largest id ever stored. This is the
     * upper bound on valid body ids.
     */
    pub fn size(&self) -> usize {
        self.body.len()
    }

    /**
     * Number of occupied slots.
     */
    pub fn count(&self) -> usize {
        self.body.iter().filter(|b| b.is_some()).count()
    }

    /**
     * Append a body at the next free id and return that id. The body's `id`
     * field is overwritten.
     */
    pub fn insert(&mut self, mut body: Body) -> BodyId {
        let id = self.body.len();
        body.id = id;
        self.body.push(Some(body));
        id
    }

    /**
     * Place a body at its own id, growing the container if needed. Returns
     * the previous occupant of the slot.
     */
    pub fn insert_at(&mut self, body: Body) -> Option<Body> {
        let id = body.id;
        if id >= self.body.len() {
            self.body.resize_with(id + 1, || None);
        }
        self.body[id].replace(body)
    }

    pub fn erase(&mut self, id: BodyId) -> Option<Body> {
        self.body.get_mut(id).and_then(Option::take)
    }

    pub fn exists(&self, id: BodyId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: BodyId) -> Option<&Body> {
        self.body.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: BodyId) -> Option<&mut Body> {
        self.body.get_mut(id).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Body> {
        self.body.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Body> {
        self.body.iter_mut().flatten()
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Body, BodyContainer};
    use crate::geometry::Vector3r;

    #[test]
    fn container_insert_at_grows_and_erase_leaves_hole() {
        let mut bodies = BodyContainer::new();
        let a = bodies.insert(Body::sphere(99, Vector3r::zeros(), 1.0));
        assert_eq!(a, 0);

        let mut far = Body::sphere(0, Vector3r::zeros(), 1.0);
        far.id = 5;
        assert!(bodies.insert_at(far).is_none());
        assert_eq!(bodies.size(), 6);
        assert_eq!(bodies.count(), 2);

        assert!(bodies.erase(0).is_some());
        assert!(!bodies.exists(0));
        assert!(bodies.erase(0).is_none());
        assert_eq!(bodies.size(), 6);
    }

    #[test]
    fn sphere_bound_includes_verlet_distance() {
        let mut b = Body::sphere(0, Vector3r::new(1.0, 2.0, 3.0), 0.5);
        b.update_bound(0.1);
        let bound = b.bound.unwrap();
        assert!((bound.min - Vector3r::new(0.4, 1.4, 2.4)).norm() < 1e-12);
        assert!((bound.max - Vector3r::new(1.6, 2.6, 3.6)).norm() < 1e-12);
    }
}
