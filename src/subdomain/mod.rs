//! One rank's slice of the body population, and the protocol by which ranks
//! keep the bodies near their shared boundaries in sync.
//!
//! Every rank holds its owned bodies plus ghost copies of foreign bodies
//! close to its boundary. Each step, a rank pushes the kinematic state of its
//! owned boundary bodies (`intersections[r]`) to rank `r`, and overwrites its
//! ghosts (`mirror_intersections[r]`) with what `r` pushed. Bodies whose
//! owner changes are migrated as full records; see the `migration` module.

mod exchange;
mod migration;

pub use exchange::{ExchangePhase, TAG_BOUNDS, TAG_INTERSECTIONS, TAG_STATES};
pub use migration::{MigrationPacket, TAG_BODY, TAG_GHOST, TAG_MERGE};

use log::error;
use nalgebra::Quaternion;

use crate::body::{Body, BodyContainer, BodyId};
use crate::error::{Error, Result};
use crate::geometry::{Aabb, Quaternionr, Real, Vector3r};

/// Values per body in the kinematic state layout: position, velocity,
/// angular velocity (3 each) and orientation coefficients (x, y, z, w).
pub const STATE_VALUES: usize = 13;

/// Values per body when the bound (min, max) is appended.
pub const STATE_BOUNDS_VALUES: usize = 19;




/**
 * A receive that was posted with `mpi_irecv_states` and not waited yet.
 */
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingRecv {
    pub expected: usize,
}




/**
 * One partition of the scene.
 */
#[derive(Debug)]
pub struct Subdomain {
    pub rank: usize,
    pub comm_size: usize,

    /// Margin added on every side of the union of the members' bounds.
    pub extra_length: Real,

    /// Corners of the partition box, including the margin. NaN until
    /// `set_min_max` has run with at least one bounded member.
    pub bounds_min: Vector3r,
    pub bounds_max: Vector3r,

    /// Ids of the bodies owned by this rank.
    pub ids: Vec<BodyId>,

    /// Send side: `intersections[r]` lists owned bodies whose bound
    /// overlaps rank `r`'s box, in the order their state is sent.
    pub intersections: Vec<Vec<BodyId>>,

    /// Receive side: `mirror_intersections[r]` lists the bodies rank `r`
    /// sends state for, in the order it sends them.
    pub mirror_intersections: Vec<Vec<BodyId>>,

    /// Most recently received flat state array from each rank.
    pub state_buffer: Vec<Vec<Real>>,

    /// Last known box of every rank, own included.
    pub peer_bounds: Vec<Aabb>,

    pending: Vec<Option<PendingRecv>>,
    phase: ExchangePhase,
}




// ============================================================================
impl Subdomain {

    pub fn new(rank: usize, comm_size: usize, extra_length: Real) -> Self {
        let nan = Vector3r::repeat(Real::NAN);
        Self {
            rank,
            comm_size,
            extra_length,
            bounds_min: nan,
            bounds_max: nan,
            ids: Vec::new(),
            intersections: vec![Vec::new(); comm_size],
            mirror_intersections: vec![Vec::new(); comm_size],
            state_buffer: vec![Vec::new(); comm_size],
            peer_bounds: vec![Aabb::undefined(); comm_size],
            pending: vec![None; comm_size],
            phase: ExchangePhase::Idle,
        }
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(self.bounds_min, self.bounds_max)
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    /**
     * Iterate the ranks other than this one.
     */
    pub fn peers(&self) -> impl Iterator<Item = usize> {
        let rank = self.rank;
        (0..self.comm_size).filter(move |&r| r != rank)
    }

    /**
     * Recompute the partition box as the union of the owned bodies' bounds,
     * inflated by `extra_length`.
     *
     * The members' bounds must be current (the collider's bound pass must
     * have run since they last moved); stale bounds are used as they are.
     */
    pub fn set_min_max(&mut self, bodies: &BodyContainer) {
        let union = self
            .ids
            .iter()
            .filter_map(|&id| bodies.get(id).and_then(|b| b.bound))
            .fold(Aabb::undefined(), |acc, b| acc.union(&b));

        let bounds = if union.is_defined() {
            union.inflate(self.extra_length)
        } else {
            union
        };
        self.bounds_min = bounds.min;
        self.bounds_max = bounds.max;
    }

    /**
     * Replace the list of owned ids.
     */
    pub fn set_ids(&mut self, ids: Vec<BodyId>) {
        self.ids = ids
    }

    pub fn clear_ids(&mut self) {
        self.ids.clear()
    }

    /**
     * Rebuild the list of owned ids from the bodies' `subdomain` field.
     * Fluid partition pseudo-bodies are never owned.
     */
    pub fn rederive_ids(&mut self, bodies: &BodyContainer) {
        self.ids = bodies
            .iter()
            .filter(|b| b.subdomain == self.rank && !b.is_fluid_domain())
            .map(|b| b.id)
            .collect()
    }

    pub(crate) fn check_peer(&self, other: usize) -> Result<()> {
        if other == self.rank {
            error!("subdomain {} cannot exchange with itself", self.rank);
            return Err(Error::SelfExchange(other));
        }
        if other >= self.comm_size {
            error!(
                "subdomain {}: rank {} exceeds the number of subdomains ({})",
                self.rank, other, self.comm_size
            );
            return Err(Error::RankOutOfRange {
                rank: other,
                size: self.comm_size,
            });
        }
        Ok(())
    }




    // ========================================================================
    // State values


    /**
     * Return the 13-value state of the listed bodies, concatenated in list
     * order.
     */
    pub fn state_values_from_ids(bodies: &BodyContainer, ids: &[BodyId]) -> Result<Vec<Real>> {
        let mut values = Vec::with_capacity(ids.len() * STATE_VALUES);
        for &id in ids {
            push_state(&mut values, lookup(bodies, id)?);
        }
        Ok(values)
    }

    /**
     * Return the 19-value state of the listed bodies: the 13 kinematic
     * values followed by the bound's min and max corners. A body without a
     * bound contributes zeros there.
     */
    pub fn state_bounds_values_from_ids(bodies: &BodyContainer, ids: &[BodyId]) -> Result<Vec<Real>> {
        let mut values = Vec::with_capacity(ids.len() * STATE_BOUNDS_VALUES);
        for &id in ids {
            let body = lookup(bodies, id)?;
            push_state(&mut values, body);

            match &body.bound {
                Some(bound) => {
                    values.extend(bound.min.iter());
                    values.extend(bound.max.iter());
                }
                None => values.extend([0.0; 6]),
            }
        }
        Ok(values)
    }

    /**
     * Return the state values of the bodies this rank sends to `other`.
     */
    pub fn state_values(&self, bodies: &BodyContainer, other: usize) -> Result<Vec<Real>> {
        self.check_peer(other)?;
        Self::state_values_from_ids(bodies, &self.intersections[other])
    }

    /**
     * Overwrite the state of the listed bodies from a flat array of 13
     * values per body. Nothing is written unless the array length matches
     * and every listed body is present.
     */
    pub fn set_state_values_from_ids(
        &self,
        bodies: &mut BodyContainer,
        ids: &[BodyId],
        values: &[Real],
    ) -> Result<()> {
        self.check_state_len("set_state_values_from_ids", STATE_VALUES, ids, values)?;
        check_present(bodies, ids)?;

        for (&id, chunk) in ids.iter().zip(values.chunks_exact(STATE_VALUES)) {
            if let Some(body) = bodies.get_mut(id) {
                read_state(body, chunk)
            }
        }
        Ok(())
    }

    /**
     * As `set_state_values_from_ids`, with 19 values per body. Bodies
     * without a bound get one.
     */
    pub fn set_state_bounds_values_from_ids(
        &self,
        bodies: &mut BodyContainer,
        ids: &[BodyId],
        values: &[Real],
    ) -> Result<()> {
        self.check_state_len("set_state_bounds_values_from_ids", STATE_BOUNDS_VALUES, ids, values)?;
        check_present(bodies, ids)?;

        for (&id, chunk) in ids.iter().zip(values.chunks_exact(STATE_BOUNDS_VALUES)) {
            if let Some(body) = bodies.get_mut(id) {
                read_state(body, chunk);
                body.bound = Some(Aabb::from_slice(&chunk[13..19]));
            }
        }
        Ok(())
    }

    /**
     * Apply the state most recently received from `other` to the bodies
     * listed in `mirror_intersections[other]`.
     */
    pub fn set_state_values_from_buffer(&self, bodies: &mut BodyContainer, other: usize) -> Result<()> {
        self.check_peer(other)?;
        self.set_state_values_from_ids(bodies, &self.mirror_intersections[other], &self.state_buffer[other])
    }

    fn check_state_len(
        &self,
        context: &'static str,
        per_body: usize,
        ids: &[BodyId],
        values: &[Real],
    ) -> Result<()> {
        if ids.len() * per_body != values.len() {
            error!(
                "size mismatch in {} on subdomain {}: {} ids need {} values, got {}",
                context,
                self.rank,
                ids.len(),
                ids.len() * per_body,
                values.len()
            );
            return Err(Error::LengthMismatch {
                context,
                expected: ids.len() * per_body,
                actual: values.len(),
            });
        }
        Ok(())
    }
}

fn lookup(bodies: &BodyContainer, id: BodyId) -> Result<&Body> {
    bodies.get(id).ok_or(Error::MissingBody(id))
}

fn check_present(bodies: &BodyContainer, ids: &[BodyId]) -> Result<()> {
    match ids.iter().find(|&&id| !bodies.exists(id)) {
        Some(&id) => {
            error!("body {} is listed for a state update but is not present", id);
            Err(Error::MissingBody(id))
        }
        None => Ok(()),
    }
}

fn push_state(values: &mut Vec<Real>, body: &Body) {
    let s = &body.state;
    values.extend(s.pos.iter());
    values.extend(s.vel.iter());
    values.extend(s.ang_vel.iter());
    // Quaternion coefficients are stored (x, y, z, w).
    values.extend(s.ori.quaternion().coords.iter());
}

fn read_state(body: &mut Body, v: &[Real]) {
    let s = &mut body.state;
    s.pos = Vector3r::new(v[0], v[1], v[2]);
    s.vel = Vector3r::new(v[3], v[4], v[5]);
    s.ang_vel = Vector3r::new(v[6], v[7], v[8]);
    // The constructor takes (w, x, y, z).
    s.ori = Quaternionr::new_unchecked(Quaternion::new(v[12], v[9], v[10], v[11]));
}




// ============================================================================
#[cfg(test)]
mod test {

    use approx::assert_relative_eq;

    use super::{Subdomain, STATE_BOUNDS_VALUES, STATE_VALUES};
    use crate::body::{Body, BodyContainer};
    use crate::error::Error;
    use crate::geometry::{Quaternionr, Vector3r};

    fn bodies() -> BodyContainer {
        let mut bodies = BodyContainer::new();
        for k in 0..4 {
            let mut b = Body::sphere(0, Vector3r::new(k as f64, 0.5, -1.0), 0.25);
            b.state.vel = Vector3r::new(0.0, k as f64, 0.0);
            b.state.ang_vel = Vector3r::new(0.1, 0.2, 0.3 * k as f64);
            b.state.ori = Quaternionr::from_euler_angles(0.1 * k as f64, 0.2, -0.3);
            bodies.insert(b);
        }
        bodies
    }

    #[test]
    fn state_layout_puts_quaternion_w_last() {
        let bodies = bodies();
        let values = Subdomain::state_values_from_ids(&bodies, &[2]).unwrap();
        let ori = bodies.get(2).unwrap().state.ori;
        assert_eq!(values.len(), STATE_VALUES);
        assert_eq!(&values[0..3], &[2.0, 0.5, -1.0]);
        assert_eq!(values[9], ori.i);
        assert_eq!(values[10], ori.j);
        assert_eq!(values[11], ori.k);
        assert_eq!(values[12], ori.w);
    }

    #[test]
    fn state_values_round_trip_through_another_container() {
        let source = bodies();
        let mut target = BodyContainer::new();
        for _ in 0..4 {
            target.insert(Body::sphere(0, Vector3r::zeros(), 0.25));
        }
        let sub = Subdomain::new(1, 2, 0.0);
        let ids = [3, 0, 2];
        let values = Subdomain::state_values_from_ids(&source, &ids).unwrap();
        sub.set_state_values_from_ids(&mut target, &ids, &values).unwrap();

        for id in ids {
            let a = &source.get(id).unwrap().state;
            let b = &target.get(id).unwrap().state;
            assert_relative_eq!(a.pos, b.pos);
            assert_relative_eq!(a.vel, b.vel);
            assert_relative_eq!(a.ang_vel, b.ang_vel);
            assert_relative_eq!(a.ori.coords, b.ori.coords);
        }
        assert_eq!(target.get(1).unwrap().state.pos, Vector3r::zeros());
    }

    #[test]
    fn length_mismatch_applies_nothing() {
        let mut bodies = bodies();
        let sub = Subdomain::new(0, 2, 0.0);
        let before = bodies.get(1).unwrap().state.clone();
        let values = vec![9.0; 2 * STATE_VALUES - 1];

        let result = sub.set_state_values_from_ids(&mut bodies, &[1, 2], &values);
        assert!(matches!(
            result,
            Err(Error::LengthMismatch { expected: 26, actual: 25, .. })
        ));
        assert_eq!(bodies.get(1).unwrap().state, before);
    }

    #[test]
    fn missing_body_applies_nothing() {
        let mut bodies = bodies();
        let sub = Subdomain::new(0, 2, 0.0);
        let values = vec![9.0; 2 * STATE_VALUES];
        assert!(matches!(
            sub.set_state_values_from_ids(&mut bodies, &[1, 17], &values),
            Err(Error::MissingBody(17))
        ));
        assert_eq!(bodies.get(1).unwrap().state.pos.x, 1.0);
    }

    #[test]
    fn bounds_variant_creates_missing_bounds() {
        let mut source = bodies();
        source.get_mut(0).unwrap().update_bound(0.0);
        let values = Subdomain::state_bounds_values_from_ids(&source, &[0, 1]).unwrap();
        assert_eq!(values.len(), 2 * STATE_BOUNDS_VALUES);
        assert_eq!(&values[32..38], &[0.0; 6]);

        let mut target = bodies();
        let sub = Subdomain::new(0, 2, 0.0);
        sub.set_state_bounds_values_from_ids(&mut target, &[0, 1], &values).unwrap();
        let bound = target.get(0).unwrap().bound.unwrap();
        assert_relative_eq!(bound.min, Vector3r::new(-0.25, 0.25, -1.25));
        assert!(target.get(1).unwrap().bound.is_some());
    }

    #[test]
    fn state_values_rejects_self_and_unknown_ranks() {
        let bodies = bodies();
        let sub = Subdomain::new(1, 3, 0.0);
        assert!(matches!(sub.state_values(&bodies, 1), Err(Error::SelfExchange(1))));
        assert!(matches!(
            sub.state_values(&bodies, 3),
            Err(Error::RankOutOfRange { rank: 3, size: 3 })
        ));
        assert!(sub.state_values(&bodies, 2).unwrap().is_empty());
    }

    #[test]
    fn set_min_max_inflates_union_of_member_bounds() {
        let mut bodies = bodies();
        for b in bodies.iter_mut() {
            b.update_bound(0.0)
        }
        let mut sub = Subdomain::new(0, 1, 0.5);
        assert!(!sub.bounds().is_defined());

        sub.set_min_max(&bodies);
        assert!(!sub.bounds().is_defined());

        sub.set_ids(vec![1, 2]);
        sub.set_min_max(&bodies);
        assert_relative_eq!(sub.bounds_min, Vector3r::new(0.25, -0.25, -1.75));
        assert_relative_eq!(sub.bounds_max, Vector3r::new(2.75, 1.25, -0.25));

        sub.clear_ids();
        assert!(sub.ids.is_empty());
    }
}
