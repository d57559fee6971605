use log::{debug, error, trace};

use super::{PendingRecv, Subdomain, STATE_VALUES};
use crate::body::{Body, BodyContainer, BodyId};
use crate::error::{Error, Result};
use crate::geometry::{Aabb, Real};
use crate::message::{Communicator, Tag};
use crate::scene::Scene;

/// Tag of boundary-state messages.
pub const TAG_STATES: Tag = 177;

/// Tag of partition box messages.
pub const TAG_BOUNDS: Tag = 178;

/// Tag of intersection list messages.
pub const TAG_INTERSECTIONS: Tag = 179;




/**
 * Where a rank is within one simulation step's exchange. Boundary state is
 * exchanged every step; migration and the partition rebuild only when the
 * caller asks for them.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangePhase {
    Idle,
    SendBoundaryState,
    RecvBoundaryState,
    ApplyReceived,
    MigrateBodies,
    RebuildPartition,
}

impl ExchangePhase {
    /**
     * Whether `next` may directly follow this phase.
     */
    pub fn allows(self, next: ExchangePhase) -> bool {
        use ExchangePhase::*;
        matches!(
            (self, next),
            (Idle, SendBoundaryState)
                | (SendBoundaryState, RecvBoundaryState)
                | (RecvBoundaryState, ApplyReceived)
                | (ApplyReceived, Idle)
                | (ApplyReceived, MigrateBodies)
                | (MigrateBodies, RebuildPartition)
                | (RebuildPartition, Idle)
        )
    }
}




// ============================================================================
impl Subdomain {

    fn enter(&mut self, next: ExchangePhase) {
        assert!(
            self.phase.allows(next),
            "subdomain {}: {:?} cannot follow {:?}",
            self.rank,
            next,
            self.phase
        );
        trace!("subdomain {}: {:?} -> {:?}", self.rank, self.phase, next);
        self.phase = next;
    }

    fn check_mirror(&self, other: usize) -> Result<()> {
        self.check_peer(other)?;
        if self.mirror_intersections.len() <= other || self.state_buffer.len() <= other {
            error!(
                "subdomain {}: inconsistent size of mirror_intersections ({}) and/or state_buffer ({}) for rank {}",
                self.rank,
                self.mirror_intersections.len(),
                self.state_buffer.len(),
                other
            );
            return Err(Error::RankOutOfRange {
                rank: other,
                size: self.mirror_intersections.len(),
            });
        }
        Ok(())
    }

    /**
     * Store a received state array after checking it against the length
     * implied by `mirror_intersections[other]`.
     */
    fn accept_states(&mut self, other: usize, expected: usize, values: Vec<Real>) -> Result<()> {
        if values.len() != expected {
            error!(
                "subdomain {}: state message from rank {} has {} values, expected {} for {} bodies",
                self.rank,
                other,
                values.len(),
                expected,
                expected / STATE_VALUES
            );
            return Err(Error::LengthMismatch {
                context: "boundary state",
                expected,
                actual: values.len(),
            });
        }
        self.state_buffer[other] = values;
        Ok(())
    }




    // ========================================================================
    // Boundary state


    /**
     * Send the state of `intersections[other]` to rank `other`. Returns
     * without waiting for the matching receive.
     */
    pub fn mpi_send_states<C: Communicator>(&self, comm: &C, bodies: &BodyContainer, other: usize) -> Result<()> {
        let values = self.state_values(bodies, other)?;
        comm.send_f64s(other, TAG_STATES, &values)
    }

    /**
     * Block until rank `other`'s state message arrives and store it in
     * `state_buffer[other]`. The message must hold exactly 13 values per
     * body of `mirror_intersections[other]`.
     */
    pub fn mpi_recv_states<C: Communicator>(&mut self, comm: &C, other: usize) -> Result<()> {
        self.check_mirror(other)?;
        if self.pending[other].is_some() {
            error!("subdomain {}: blocking receive from rank {} while a posted receive is outstanding", self.rank, other);
            return Err(Error::OutstandingReceive(other));
        }
        let expected = STATE_VALUES * self.mirror_intersections[other].len();
        let values = comm.recv_f64s(other, TAG_STATES)?;
        self.accept_states(other, expected, values)
    }

    /**
     * Post a receive for rank `other`'s state message. At most one posted
     * receive per peer may be outstanding; it must be completed with
     * `mpi_wait_received` (or `mpi_test_received`) before another is posted.
     */
    pub fn mpi_irecv_states(&mut self, other: usize) -> Result<()> {
        self.check_mirror(other)?;
        if self.pending[other].is_some() {
            error!("subdomain {}: a receive from rank {} is already outstanding", self.rank, other);
            return Err(Error::OutstandingReceive(other));
        }
        self.pending[other] = Some(PendingRecv {
            expected: STATE_VALUES * self.mirror_intersections[other].len(),
        });
        Ok(())
    }

    /**
     * Complete the receive posted for `other`. Upon return the state buffer
     * is set and the peer slot is free again.
     */
    pub fn mpi_wait_received<C: Communicator>(&mut self, comm: &C, other: usize) -> Result<()> {
        let posted = self
            .pending
            .get_mut(other)
            .and_then(Option::take)
            .ok_or(Error::NoPendingReceive(other))?;
        let values = comm.recv_f64s(other, TAG_STATES)?;
        self.accept_states(other, posted.expected, values)
    }

    /**
     * Complete the receive posted for `other` if its message has arrived.
     * Returns false, leaving the receive posted, if it has not.
     */
    pub fn mpi_test_received<C: Communicator>(&mut self, comm: &C, other: usize) -> Result<bool> {
        let posted = match self.pending.get(other).copied().flatten() {
            Some(posted) => posted,
            None => return Err(Error::NoPendingReceive(other)),
        };
        match comm.try_recv(other, TAG_STATES)? {
            Some(bytes) => {
                self.pending[other] = None;
                let values = crate::message::util::decode_f64s(&bytes)?;
                self.accept_states(other, posted.expected, values)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /**
     * Whether a posted receive from `other` has not been completed.
     */
    pub fn has_outstanding_receive(&self, other: usize) -> bool {
        matches!(self.pending.get(other), Some(Some(_)))
    }




    // ========================================================================
    // Partition tables


    /**
     * Share partition boxes: afterwards `peer_bounds[r]` is rank `r`'s box
     * for every rank. Collective.
     */
    pub fn exchange_bounds<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        let own = self.bounds();
        let values = [
            own.min.x, own.min.y, own.min.z, own.max.x, own.max.y, own.max.z,
        ];
        for r in self.peers() {
            comm.send_f64s(r, TAG_BOUNDS, &values)?;
        }
        let peers: Vec<_> = self.peers().collect();
        for r in peers {
            let received = comm.recv_f64s(r, TAG_BOUNDS)?;
            if received.len() != 6 {
                error!("subdomain {}: bounds message from rank {} has {} values", self.rank, r, received.len());
                return Err(Error::LengthMismatch {
                    context: "partition bounds",
                    expected: 6,
                    actual: received.len(),
                });
            }
            self.peer_bounds[r] = Aabb::from_slice(&received);
        }
        self.peer_bounds[self.rank] = own;
        Ok(())
    }

    /**
     * Rebuild the send tables: `intersections[r]` becomes the owned bodies
     * whose bound overlaps `peer_bounds[r]`, in ascending id order.
     */
    pub fn update_intersections(&mut self, bodies: &BodyContainer) {
        let mut ids = self.ids.clone();
        ids.sort_unstable();

        for r in 0..self.comm_size {
            self.intersections[r] = if r == self.rank {
                Vec::new()
            } else {
                let peer = self.peer_bounds[r];
                ids.iter()
                    .copied()
                    .filter(|&id| {
                        bodies
                            .get(id)
                            .and_then(|b| b.bound)
                            .map_or(false, |bound| bound.overlaps(&peer))
                    })
                    .collect()
            };
        }
    }

    /**
     * Send every peer the list of bodies it will receive state for, and
     * fill `mirror_intersections` from what the peers send. Afterwards rank
     * A's `intersections[B]` equals rank B's `mirror_intersections[A]`.
     * Collective.
     */
    pub fn exchange_intersections<C: Communicator>(&mut self, comm: &C) -> Result<()> {
        for r in self.peers() {
            let bytes = rmp_serde::to_vec(&self.intersections[r]).map_err(|e| Error::Codec(e.to_string()))?;
            comm.send(r, TAG_INTERSECTIONS, bytes)?;
        }
        let peers: Vec<_> = self.peers().collect();
        for r in peers {
            let bytes = comm.recv(r, TAG_INTERSECTIONS)?;
            let ids: Vec<BodyId> = rmp_serde::from_slice(&bytes).map_err(|e| {
                error!("subdomain {}: malformed intersection list from rank {}: {}", self.rank, r, e);
                Error::Codec(e.to_string())
            })?;
            self.mirror_intersections[r] = ids;
        }
        self.mirror_intersections[self.rank].clear();
        Ok(())
    }

    /**
     * Re-derive the partition: box, peer boxes, send and receive tables, and
     * ghost copies. Collective. The owned bodies' bounds must be current.
     */
    pub fn rebuild_partition<C: Communicator>(&mut self, comm: &C, scene: &mut Scene) -> Result<()> {
        self.set_min_max(&scene.bodies);
        self.exchange_bounds(comm)?;
        self.update_intersections(&scene.bodies);
        self.exchange_intersections(comm)?;
        self.refresh_ghosts(comm, scene)
    }




    // ========================================================================
    // Per-step driver


    /**
     * Run one boundary-state exchange: push owned boundary state to every
     * peer, receive every peer's state, and apply it to the ghosts.
     * Collective.
     */
    pub fn exchange_step<C: Communicator>(&mut self, comm: &C, scene: &mut Scene) -> Result<()> {
        self.run_step(comm, scene, None)
    }

    /**
     * As `exchange_step`, then migrate every owned body for which
     * `owner_of` names another rank, and rebuild the partition. Collective.
     */
    pub fn exchange_step_with_migration<C, F>(&mut self, comm: &C, scene: &mut Scene, owner_of: F) -> Result<()>
    where
        C: Communicator,
        F: Fn(&Body) -> usize,
    {
        let owner_of: &dyn Fn(&Body) -> usize = &owner_of;
        self.run_step(comm, scene, Some(owner_of))
    }

    /**
     * A failed step leaves no receive posted and the phase back at `Idle`;
     * the error itself is for the caller to act on.
     */
    fn run_step<C: Communicator>(
        &mut self,
        comm: &C,
        scene: &mut Scene,
        owner_of: Option<&dyn Fn(&Body) -> usize>,
    ) -> Result<()> {
        let result = self.step_phases(comm, scene, owner_of);
        if result.is_err() {
            error!("subdomain {}: exchange failed during {:?}", self.rank, self.phase);
            self.pending.iter_mut().for_each(|p| *p = None);
            self.phase = ExchangePhase::Idle;
        }
        result
    }

    fn step_phases<C: Communicator>(
        &mut self,
        comm: &C,
        scene: &mut Scene,
        owner_of: Option<&dyn Fn(&Body) -> usize>,
    ) -> Result<()> {
        let peers: Vec<_> = self.peers().collect();

        self.enter(ExchangePhase::SendBoundaryState);
        for &r in &peers {
            self.mpi_send_states(comm, &scene.bodies, r)?;
        }

        self.enter(ExchangePhase::RecvBoundaryState);
        for &r in &peers {
            self.mpi_irecv_states(r)?;
        }
        for &r in &peers {
            self.mpi_wait_received(comm, r)?;
        }

        self.enter(ExchangePhase::ApplyReceived);
        for &r in &peers {
            self.set_state_values_from_buffer(&mut scene.bodies, r)?;
        }

        if let Some(owner_of) = owner_of {
            self.enter(ExchangePhase::MigrateBodies);
            let mut outgoing = vec![Vec::new(); self.comm_size];
            for &id in &self.ids {
                if let Some(body) = scene.bodies.get(id) {
                    let owner = owner_of(body);
                    if owner != self.rank && owner < self.comm_size {
                        outgoing[owner].push(id)
                    }
                }
            }
            for &r in &peers {
                self.send_bodies(comm, scene, r, &outgoing[r])?;
            }
            let mut arrived = 0;
            for &r in &peers {
                arrived += self.receive_bodies(comm, scene, r)?.len();
            }
            debug!(
                "subdomain {} at iteration {}: {} bodies out, {} in",
                self.rank,
                scene.iter,
                outgoing.iter().map(Vec::len).sum::<usize>(),
                arrived
            );

            self.enter(ExchangePhase::RebuildPartition);
            self.rebuild_partition(comm, scene)?;
        }

        self.enter(ExchangePhase::Idle);
        Ok(())
    }
}
