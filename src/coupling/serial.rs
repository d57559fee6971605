//! Serial coupling: a single DEM rank broadcasts every coupled particle to
//! all fluid ranks, which each report whether the particle lies in their
//! partition and return its hydrodynamic force.

use log::{debug, warn};

use super::{exchange_interval, FoamCoupling, LostParticle, FORCE_VALUES, TAG_FLUID_DT};
use crate::error::{Error, Result};
use crate::geometry::Vector3r;
use crate::message::{Communicator, ReduceOp, Tag};
use crate::scene::Scene;

pub const TAG_SERIAL_COUNT: Tag = 1101;
pub const TAG_SERIAL_DATA: Tag = 1102;
pub const TAG_SERIAL_PROC: Tag = 1103;
pub const TAG_SERIAL_FORCE: Tag = 1104;
pub const TAG_SERIAL_SUM: Tag = 1105;
pub const TAG_SERIAL_DT: Tag = 1106;
pub const TAG_SERIAL_CMD: Tag = 1107;

/// Value a fluid rank contributes for a particle outside its partition.
pub const NOT_FOUND: i32 = -5;

/// Command broadcast to the fluid ranks to end the run.
pub const TERMINATE: i32 = 10;




// ============================================================================
impl FoamCoupling {

    /**
     * Broadcast the number of coupled particles. Resets the owner list and
     * the force buffer to that size.
     */
    pub fn set_num_particles<W: Communicator>(&mut self, world: &W, num: usize) -> Result<()> {
        world.broadcast_i32s(self.config.yade_master, TAG_SERIAL_COUNT, Some(&[num as i32]))?;
        self.proc_list = vec![-1; num];
        self.hydro_force = vec![1e-50; FORCE_VALUES * num];
        Ok(())
    }

    /**
     * Broadcast the count, then 10 values per coupled particle.
     */
    pub fn cast_particle<W: Communicator>(&mut self, world: &W, scene: &Scene) -> Result<()> {
        let data = super::particle_data(scene, &self.body_list)?;
        self.set_num_particles(world, self.body_list.len())?;
        world.broadcast_f64s(self.config.yade_master, TAG_SERIAL_DATA, Some(&data))?;
        Ok(())
    }

    /**
     * Learn which fluid rank holds each particle: a max-reduction over the
     * ranks' reports, where a rank that does not hold the particle reports
     * `NOT_FOUND`. Returns the ids no rank holds.
     */
    pub fn update_proc_list<W: Communicator>(&mut self, world: &W) -> Result<Vec<usize>> {
        let local = vec![NOT_FOUND; self.body_list.len()];
        self.proc_list = world.all_reduce_i32(TAG_SERIAL_PROC, &local, ReduceOp::Max)?;

        let lost: Vec<_> = self
            .body_list
            .iter()
            .zip(&self.proc_list)
            .filter(|(_, &proc)| proc < 0)
            .map(|(&id, _)| id)
            .collect();

        for id in &lost {
            warn!("particle {} not found in any fluid rank", id);
        }
        Ok(lost)
    }

    /**
     * Receive force and torque of each particle from the fluid rank holding
     * it. Particles no rank holds keep a zero force.
     */
    pub fn recv_hydro_force<W: Communicator>(&mut self, world: &W) -> Result<()> {
        for (k, &proc) in self.proc_list.iter().enumerate() {
            let slot = &mut self.hydro_force[FORCE_VALUES * k..FORCE_VALUES * (k + 1)];
            if proc < 0 {
                slot.fill(0.0);
                continue;
            }
            let ft = world.recv_f64s(proc as usize, TAG_SERIAL_FORCE)?;
            if ft.len() != FORCE_VALUES {
                return Err(Error::LengthMismatch {
                    context: "hydrodynamic force",
                    expected: FORCE_VALUES,
                    actual: ft.len(),
                });
            }
            slot.copy_from_slice(&ft);
        }
        Ok(())
    }

    /**
     * Gaussian interpolation spreads a particle over several fluid ranks;
     * its force is the sum of their contributions.
     */
    pub fn sum_hydro_force<W: Communicator>(&mut self, world: &W) -> Result<()> {
        let zeros = vec![0.0; FORCE_VALUES * self.body_list.len()];
        self.hydro_force = world.all_reduce_f64(TAG_SERIAL_SUM, &zeros, ReduceOp::Sum)?;
        Ok(())
    }

    /**
     * Add the last received forces to the coupled particles.
     */
    pub fn set_hydro_force(&self, scene: &mut Scene) {
        for (&id, ft) in self.body_list.iter().zip(self.hydro_force.chunks_exact(FORCE_VALUES)) {
            scene.forces.add_force(id, &Vector3r::new(ft[0], ft[1], ft[2]));
            scene.forces.add_torque(id, &Vector3r::new(ft[3], ft[4], ft[5]));
        }
    }

    /**
     * Receive the fluid time step from the fluid master, broadcast the DEM
     * step, and set the exchange stride.
     */
    pub fn exchange_delta_t<W: Communicator>(&mut self, world: &W, scene: &Scene) -> Result<()> {
        let values = world.recv_f64s(self.config.fluid_rank_offset, TAG_FLUID_DT)?;
        self.fluid_dt = match values.as_slice() {
            [dt] => *dt,
            _ => {
                return Err(Error::LengthMismatch {
                    context: "fluid time step",
                    expected: 1,
                    actual: values.len(),
                })
            }
        };
        world.broadcast_f64s(self.config.yade_master, TAG_SERIAL_DT, Some(&[scene.dt]))?;
        self.config.data_exchange_interval = exchange_interval(scene.dt, self.fluid_dt);
        debug!("fluid dt = {}, exchanging every {} iterations", self.fluid_dt, self.config.data_exchange_interval);
        Ok(())
    }

    pub fn cast_terminate<W: Communicator>(&self, world: &W) -> Result<()> {
        world.broadcast_i32s(self.config.yade_master, TAG_SERIAL_CMD, Some(&[TERMINATE]))?;
        Ok(())
    }

    /**
     * One serial exchange cycle. Returns the particles no fluid rank holds.
     */
    pub fn run_coupling<W: Communicator>(&mut self, world: &W, scene: &Scene) -> Result<Vec<LostParticle>> {
        self.cast_particle(world, scene)?;
        let lost = self.update_proc_list(world)?;

        if self.config.gaussian_interp {
            self.sum_hydro_force(world)?
        } else {
            self.recv_hydro_force(world)?
        }
        Ok(lost
            .into_iter()
            .map(|id| LostParticle {
                id,
                pos: scene.bodies.get(id).map_or_else(Vector3r::zeros, |b| b.state.pos),
            })
            .collect())
    }
}
