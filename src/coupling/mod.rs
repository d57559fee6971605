//! Bridge to an external fluid solver running on its own ranks.
//!
//! In parallel mode every fluid rank reports the bounding box of its mesh
//! partition once; each box becomes a massless pseudo-body so that the
//! ordinary collider finds the coupled particles that may lie in it. Each
//! exchange cycle then ships particle data to the intersecting fluid ranks,
//! collects their search results and hydrodynamic forces, and applies the
//! forces. The serial mode, where a single DEM rank broadcasts everything,
//! lives in `serial`.

pub mod serial;

use std::collections::{BTreeMap, HashMap};

use log::{debug, error, info};

use crate::body::{Body, BodyId, Shape};
use crate::config::{CouplingConfig, LostParticlePolicy};
use crate::error::{Error, Result};
use crate::geometry::{Aabb, Real, Vector3r};
use crate::message::{Communicator, ReduceOp, Tag};
use crate::scene::Scene;

pub const TAG_GRID_BBOX: Tag = 1001;
pub const TAG_SZ_BUFF: Tag = 1002;
pub const TAG_PRT_DATA: Tag = 1003;
pub const TAG_SEARCH_RES: Tag = 1004;
pub const TAG_FORCE: Tag = 1005;
pub const TAG_FLUID_DT: Tag = 1006;
pub const TAG_YADE_DT: Tag = 1007;
pub const TAG_DT_BCAST: Tag = 1008;
pub const TAG_DT_REDUCE: Tag = 1009;

/// Values per particle sent to the fluid: position, velocity, angular
/// velocity (3 each) and radius.
pub const PARTICLE_VALUES: usize = 10;

/// Values per particle received from the fluid: force and torque.
pub const FORCE_VALUES: usize = 6;




/**
 * Per-cycle bookkeeping of one external partition. The partition itself is
 * the pseudo-body `body_id`, whose shape holds the box.
 */
#[derive(Clone, Debug)]
pub struct FluidDomainBbox {
    pub body_id: BodyId,
    pub domain_rank: usize,
    pub bbox: Aabb,

    /// Coupled bodies found to intersect the partition this cycle, in the
    /// order their data is sent.
    pub b_ids: Vec<BodyId>,
    pub has_intersection: bool,
}




/**
 * A coupled particle that no external partition accounted for.
 */
#[derive(Clone, Debug, PartialEq)]
pub struct LostParticle {
    pub id: BodyId,
    pub pos: Vector3r,
}




/**
 * The coupling engine.
 */
pub struct FoamCoupling {
    pub config: CouplingConfig,
    body_list: Vec<BodyId>,
    local_ids: Vec<BodyId>,
    fluid_domains: Vec<FluidDomainBbox>,

    /// Coupled bodies intersecting more than one partition, with the index
    /// of the body in each partition's `b_ids`, keyed by domain rank.
    shared_ids: Vec<(BodyId, BTreeMap<usize, usize>)>,

    /// Coupled bodies intersecting no partition this cycle.
    unintersected: Vec<BodyId>,

    h_force: Vec<(usize, Vec<Real>)>,
    pub fluid_dt: Real,

    // serial mode
    proc_list: Vec<i32>,
    hydro_force: Vec<Real>,
}




// ============================================================================
impl FoamCoupling {

    pub fn new(config: CouplingConfig) -> Self {
        Self {
            config,
            body_list: Vec::new(),
            local_ids: Vec::new(),
            fluid_domains: Vec::new(),
            shared_ids: Vec::new(),
            unintersected: Vec::new(),
            h_force: Vec::new(),
            fluid_dt: 0.0,
            proc_list: Vec::new(),
            hydro_force: Vec::new(),
        }
    }




    // ========================================================================
    // Coupled id list


    pub fn set_id_list(&mut self, ids: &[BodyId]) {
        self.body_list = ids.to_vec()
    }

    pub fn insert_body_id(&mut self, id: BodyId) {
        self.body_list.push(id)
    }

    /**
     * Remove an id from the coupled list. Returns false, and logs, if it was
     * not there.
     */
    pub fn erase_id(&mut self, id: BodyId) -> bool {
        match self.body_list.iter().position(|&x| x == id) {
            Some(index) => {
                self.body_list.remove(index);
                true
            }
            None => {
                error!("id {} not found in list of ids in coupling", id);
                false
            }
        }
    }

    pub fn num_bodies(&self) -> usize {
        self.body_list.len()
    }

    pub fn id_list(&self) -> &[BodyId] {
        &self.body_list
    }

    pub fn local_ids(&self) -> &[BodyId] {
        &self.local_ids
    }

    pub fn fluid_domains(&self) -> &[FluidDomainBbox] {
        &self.fluid_domains
    }

    /**
     * The current exchange stride, in iterations.
     */
    pub fn data_exchange_interval(&self) -> u64 {
        self.config.data_exchange_interval
    }

    /**
     * Restrict the coupled list to the bodies this rank owns.
     */
    pub fn build_local_ids(&mut self, owned: &[BodyId]) {
        if self.body_list.is_empty() {
            error!("ids for coupling have not been set");
            return;
        }
        self.local_ids = self
            .body_list
            .iter()
            .copied()
            .filter(|id| owned.contains(id))
            .collect();
    }




    // ========================================================================
    // Parallel mode


    /**
     * Receive one box (6 values) from every fluid rank and insert a
     * pseudo-body for each. The pseudo-bodies belong to the master rank.
     */
    pub fn recv_fluid_domain_bboxes<W: Communicator>(&mut self, world: &W, scene: &mut Scene) -> Result<()> {
        let offset = self.config.fluid_rank_offset;
        let mut boxes = Vec::with_capacity(self.config.num_fluid_ranks);

        for fd in 0..self.config.num_fluid_ranks {
            let values = world.recv_f64s(offset + fd, TAG_GRID_BBOX)?;
            if values.len() != 6 {
                error!("grid bounds from fluid rank {} has {} values", offset + fd, values.len());
                return Err(Error::LengthMismatch {
                    context: "fluid grid bounds",
                    expected: 6,
                    actual: values.len(),
                });
            }
            boxes.push(Aabb::from_slice(&values));
        }

        for (fd, bbox) in boxes.into_iter().enumerate() {
            let domain_rank = offset + fd;
            let body_id = scene.insert_body(Body {
                id: 0,
                subdomain: self.config.yade_master,
                state: Default::default(),
                shape: Shape::FluidDomain { domain_rank, bbox },
                bound: Some(bbox),
            });
            if let Some(body) = scene.bodies.get_mut(body_id) {
                body.subdomain = self.config.yade_master;
            }
            self.fluid_domains.push(FluidDomainBbox {
                body_id,
                domain_rank,
                bbox,
                b_ids: Vec::new(),
                has_intersection: false,
            });
        }
        info!("received {} fluid grid bounds on rank {}", self.fluid_domains.len(), scene.rank);
        Ok(())
    }

    /**
     * Fill each partition's `b_ids` from the interactions between local
     * coupled bodies and the pseudo-bodies, and record the shared ids.
     */
    pub fn build_shared_ids_map(&mut self, scene: &Scene) {
        let index_of_body: HashMap<BodyId, usize> = self
            .fluid_domains
            .iter()
            .enumerate()
            .map(|(k, fd)| (fd.body_id, k))
            .collect();

        let mut domains_of: HashMap<BodyId, Vec<usize>> = HashMap::new();
        for intr in scene.interactions.iter() {
            let (a, b) = (intr.id1(), intr.id2());
            if let Some(&k) = index_of_body.get(&b) {
                domains_of.entry(a).or_default().push(k)
            }
            if let Some(&k) = index_of_body.get(&a) {
                domains_of.entry(b).or_default().push(k)
            }
        }

        for &id in &self.local_ids {
            let mut domains = domains_of.remove(&id).unwrap_or_default();
            domains.sort_unstable();

            let mut found_in = BTreeMap::new();
            for k in domains {
                let fd = &mut self.fluid_domains[k];
                fd.b_ids.push(id);
                fd.has_intersection = true;
                found_in.insert(fd.domain_rank, fd.b_ids.len() - 1);
            }
            match found_in.len() {
                0 => self.unintersected.push(id),
                1 => {}
                _ => self.shared_ids.push((id, found_in)),
            }
        }
    }

    /**
     * Tell every fluid rank how many particles each partition will receive,
     * or -1 for a partition with none.
     */
    pub fn send_intersection_to_fluid_procs<W: Communicator>(&self, world: &W) -> Result<()> {
        let counts: Vec<i32> = self
            .fluid_domains
            .iter()
            .map(|fd| if fd.has_intersection { fd.b_ids.len() as i32 } else { -1 })
            .collect();

        for rnk in 0..self.config.num_fluid_ranks {
            world.send_i32s(self.config.fluid_rank_offset + rnk, TAG_SZ_BUFF, &counts)?;
        }
        Ok(())
    }

    /**
     * Send 10 values per particle to every intersecting partition.
     * Positions are wrapped into the periodic cell if there is one.
     */
    pub fn send_body_data<W: Communicator>(&self, world: &W, scene: &Scene) -> Result<()> {
        for fd in self.fluid_domains.iter().filter(|fd| fd.has_intersection) {
            let data = particle_data(scene, &fd.b_ids)?;
            world.send_f64s(fd.domain_rank, TAG_PRT_DATA, &data)?;
        }
        Ok(())
    }

    /**
     * Receive every partition's search result and return the particles that
     * were lost: those not found by the only partition they intersect,
     * shared ones found by none of theirs, and (unless the policy says to
     * ignore them) those intersecting no partition at all.
     */
    pub fn verify_particle_detection<W: Communicator>(&self, world: &W, scene: &Scene) -> Result<Vec<LostParticle>> {
        let mut tracking = BTreeMap::new();
        for fd in &self.fluid_domains {
            let found = world.recv_i32s(fd.domain_rank, TAG_SEARCH_RES)?;
            if found.len() != fd.b_ids.len() {
                error!(
                    "search result from fluid rank {} has {} entries for {} particles",
                    fd.domain_rank,
                    found.len(),
                    fd.b_ids.len()
                );
                return Err(Error::LengthMismatch {
                    context: "particle search result",
                    expected: fd.b_ids.len(),
                    actual: found.len(),
                });
            }
            tracking.insert(fd.domain_rank, found);
        }

        let is_shared = |id: BodyId| self.shared_ids.iter().any(|(s, _)| *s == id);
        let mut lost = Vec::new();

        for fd in &self.fluid_domains {
            for (&id, &found) in fd.b_ids.iter().zip(&tracking[&fd.domain_rank]) {
                if found <= 0 && !is_shared(id) {
                    lost.push(id)
                }
            }
        }
        for (id, found_in) in &self.shared_ids {
            let found = found_in
                .iter()
                .any(|(rank, &index)| tracking.get(rank).map_or(false, |vt| vt[index] > 0));
            if !found {
                lost.push(*id)
            }
        }
        if self.config.lost_particle_policy == LostParticlePolicy::ReportUnintersected {
            lost.extend(self.unintersected.iter().copied());
        }

        let lost = lost
            .into_iter()
            .map(|id| {
                let pos = scene.bodies.get(id).map_or_else(Vector3r::zeros, |b| b.state.pos);
                error!(
                    "particle id = {} pos = {} {} {} was not found in fluid domain",
                    id, pos.x, pos.y, pos.z
                );
                LostParticle { id, pos }
            })
            .collect();
        Ok(lost)
    }

    /**
     * Receive force and torque (6 values per particle) from every partition.
     * Partitions without particles send an empty array.
     */
    pub fn get_particle_force<W: Communicator>(&mut self, world: &W) -> Result<()> {
        self.h_force.clear();
        for fd in &self.fluid_domains {
            let forces = world.recv_f64s(fd.domain_rank, TAG_FORCE)?;
            let expected = FORCE_VALUES * fd.b_ids.len();
            if forces.len() != expected {
                error!(
                    "force message from fluid rank {} has {} values, expected {}",
                    fd.domain_rank,
                    forces.len(),
                    expected
                );
                return Err(Error::LengthMismatch {
                    context: "hydrodynamic force",
                    expected,
                    actual: forces.len(),
                });
            }
            self.h_force.push((fd.domain_rank, forces));
        }
        Ok(())
    }

    /**
     * Add the received forces and torques to the particles' accumulators.
     * Shared particles receive the sum over their partitions.
     */
    pub fn set_particle_force_parallel(&self, scene: &mut Scene) {
        for (fd, (_, forces)) in self.fluid_domains.iter().zip(&self.h_force) {
            for (&id, ft) in fd.b_ids.iter().zip(forces.chunks_exact(FORCE_VALUES)) {
                scene.forces.add_force(id, &Vector3r::new(ft[0], ft[1], ft[2]));
                scene.forces.add_torque(id, &Vector3r::new(ft[3], ft[4], ft[5]));
            }
        }
    }

    /**
     * Clear the per-cycle bookkeeping.
     */
    pub fn reset_communications(&mut self) {
        for fd in &mut self.fluid_domains {
            fd.b_ids.clear();
            fd.has_intersection = false;
        }
        self.shared_ids.clear();
        self.unintersected.clear();
        self.h_force.clear();
    }

    /**
     * Agree on the time step with the fluid: the master receives the fluid
     * step and shares it with the other DEM ranks, the DEM ranks agree on
     * their minimum step, and the master reports it back. The exchange
     * stride becomes the number of DEM steps per fluid step.
     */
    pub fn exchange_delta_t_parallel<W, L>(&mut self, world: &W, local: &L, scene: &Scene) -> Result<()>
    where
        W: Communicator,
        L: Communicator,
    {
        let master = self.config.yade_master;
        let fluid_master = self.config.fluid_rank_offset;
        let is_master = local.rank() == master;

        let fluid_dt = if is_master {
            Some(single_value(world.recv_f64s(fluid_master, TAG_FLUID_DT)?, "fluid time step")?)
        } else {
            None
        };
        let fluid_dt = single_value(
            local.broadcast_f64s(master, TAG_DT_BCAST, fluid_dt.as_ref().map(core::slice::from_ref))?,
            "fluid time step",
        )?;
        let yade_dt = single_value(
            local.all_reduce_f64(TAG_DT_REDUCE, &[scene.dt], ReduceOp::Min)?,
            "DEM time step",
        )?;

        if is_master {
            world.send_f64s(fluid_master, TAG_YADE_DT, &[yade_dt])?;
        }
        self.fluid_dt = fluid_dt;
        self.config.data_exchange_interval = exchange_interval(yade_dt, fluid_dt);
        debug!(
            "fluid dt = {}, DEM dt = {}, exchanging every {} iterations",
            fluid_dt, yade_dt, self.config.data_exchange_interval
        );
        Ok(())
    }

    /**
     * Whether this rank takes part in the particle exchange. With several
     * DEM ranks the master holds no particles and only relays time steps.
     */
    fn exchanges_particles<L: Communicator>(&self, local: &L) -> bool {
        local.size() == 1 || local.rank() != self.config.yade_master
    }

    /**
     * One parallel exchange cycle. Forces are applied before the per-cycle
     * bookkeeping is cleared.
     */
    pub fn run_coupling_parallel<W, L>(&mut self, world: &W, local: &L, scene: &mut Scene) -> Result<Vec<LostParticle>>
    where
        W: Communicator,
        L: Communicator,
    {
        if self.fluid_domains.is_empty() && self.config.num_fluid_ranks > 0 {
            self.recv_fluid_domain_bboxes(world, scene)?;
        }
        if !self.exchanges_particles(local) {
            return Ok(Vec::new());
        }
        if self.fluid_domains.is_empty() {
            return Err(Error::MissingFluidDomains);
        }
        self.build_shared_ids_map(scene);
        let result = self.exchange_particles(world, scene);
        self.reset_communications();
        result
    }

    fn exchange_particles<W: Communicator>(&mut self, world: &W, scene: &mut Scene) -> Result<Vec<LostParticle>> {
        self.send_intersection_to_fluid_procs(world)?;
        self.send_body_data(world, scene)?;
        let lost = self.verify_particle_detection(world, scene)?;
        self.get_particle_force(world)?;
        self.set_particle_force_parallel(scene);
        Ok(lost)
    }




    // ========================================================================
    // Driver


    /**
     * Whether the current iteration is an exchange iteration.
     */
    pub fn exchange_data(&self, scene: &Scene) -> bool {
        scene.iter % self.config.data_exchange_interval.max(1) == 0
    }

    /**
     * Run the coupling for this iteration: a full exchange and time step
     * agreement on exchange iterations. In serial mode the last received
     * forces are applied on every iteration. Returns the lost particles of
     * this iteration's exchange.
     */
    pub fn action<W, L>(&mut self, world: &W, local: &L, scene: &mut Scene) -> Result<Vec<LostParticle>>
    where
        W: Communicator,
        L: Communicator,
    {
        let mut lost = Vec::new();

        if self.config.parallel_mode {
            if self.exchange_data(scene) {
                lost = self.run_coupling_parallel(world, local, scene)?;
                self.exchange_delta_t_parallel(world, local, scene)?;
            }
        } else {
            if self.exchange_data(scene) {
                lost = self.run_coupling(world, scene)?;
                self.exchange_delta_t(world, scene)?;
            }
            self.set_hydro_force(scene);
        }
        Ok(lost)
    }
}

/**
 * 10 values per particle: position (wrapped if periodic), velocity, angular
 * velocity, radius. Only spheres can be coupled.
 */
fn particle_data(scene: &Scene, ids: &[BodyId]) -> Result<Vec<Real>> {
    let mut data = Vec::with_capacity(PARTICLE_VALUES * ids.len());
    for &id in ids {
        let body = scene.bodies.get(id).ok_or(Error::MissingBody(id))?;
        let radius = body.radius().ok_or(Error::UnsupportedShape(id))?;
        let pos = match &scene.cell {
            Some(cell) => cell.wrap_pt(&body.state.pos),
            None => body.state.pos,
        };
        data.extend(pos.iter());
        data.extend(body.state.vel.iter());
        data.extend(body.state.ang_vel.iter());
        data.push(radius);
    }
    Ok(data)
}

fn single_value(values: Vec<Real>, context: &'static str) -> Result<Real> {
    match values.as_slice() {
        [x] => Ok(*x),
        _ => Err(Error::LengthMismatch {
            context,
            expected: 1,
            actual: values.len(),
        }),
    }
}

/**
 * DEM steps per fluid step, at least one.
 */
pub fn exchange_interval(dem_dt: Real, fluid_dt: Real) -> u64 {
    if dem_dt < fluid_dt {
        ((fluid_dt / dem_dt) as u64).max(1)
    } else {
        1
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{exchange_interval, particle_data, FoamCoupling};
    use crate::body::{Body, Shape};
    use crate::config::CouplingConfig;
    use crate::error::Error;
    use crate::geometry::{PeriodicCell, Vector3r};
    use crate::parallel::WorkerPool;
    use crate::scene::Scene;

    #[test]
    fn exchange_interval_is_fluid_over_dem_step() {
        assert_eq!(exchange_interval(1e-4, 1e-3), 10);
        assert_eq!(exchange_interval(1e-3, 1e-4), 1);
        assert_eq!(exchange_interval(1e-3, 1e-3), 1);
    }

    #[test]
    fn id_list_management() {
        let mut coupling = FoamCoupling::new(CouplingConfig::default());
        coupling.build_local_ids(&[1, 2]);
        assert!(coupling.local_ids().is_empty());

        coupling.set_id_list(&[4, 1, 9]);
        coupling.insert_body_id(2);
        assert_eq!(coupling.num_bodies(), 4);
        assert!(coupling.erase_id(9));
        assert!(!coupling.erase_id(9));
        assert_eq!(coupling.id_list(), &[4, 1, 2]);

        coupling.build_local_ids(&[2, 3, 4]);
        assert_eq!(coupling.local_ids(), &[4, 2]);
    }

    #[test]
    fn only_spheres_can_be_described_to_the_fluid() {
        let mut scene = Scene::new(0, 1e-3, WorkerPool::new(1).unwrap());
        let sphere = scene.insert_body(Body::sphere(0, Vector3r::new(2.5, 0.5, -0.5), 0.2));
        let mut cube = Body::sphere(0, Vector3r::zeros(), 1.0);
        cube.shape = Shape::Box {
            half_extents: Vector3r::repeat(0.5),
        };
        let cube = scene.insert_body(cube);

        assert!(matches!(particle_data(&scene, &[sphere, cube]), Err(Error::UnsupportedShape(id)) if id == cube));
        assert!(matches!(particle_data(&scene, &[5]), Err(Error::MissingBody(5))));

        scene.cell = Some(PeriodicCell {
            size: Vector3r::repeat(2.0),
        });
        let data = particle_data(&scene, &[sphere]).unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(data[9], 0.2);
        assert!((data[0] - 0.5).abs() < 1e-12);
        assert!((data[2] - 1.5).abs() < 1e-12);
    }
}
