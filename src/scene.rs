use crate::body::{Body, BodyContainer, BodyId};
use crate::config::Config;
use crate::error::Result;
use crate::forces::ForceContainer;
use crate::geometry::{PeriodicCell, Real};
use crate::interaction_container::InteractionContainer;
use crate::parallel::WorkerPool;




/**
 * The simulation context of one rank. Everything that operates on bodies,
 * interactions or forces takes a reference to a `Scene` instead of reaching
 * for process-wide state.
 */
pub struct Scene {
    pub bodies: BodyContainer,
    pub interactions: InteractionContainer,
    pub forces: ForceContainer,
    pub iter: u64,
    pub dt: Real,
    pub cell: Option<PeriodicCell>,
    pub rank: usize,
    pub pool: WorkerPool,
}




// ============================================================================
impl Scene {

    pub fn new(rank: usize, dt: Real, pool: WorkerPool) -> Self {
        Self {
            bodies: BodyContainer::new(),
            interactions: InteractionContainer::new(),
            forces: ForceContainer::new(),
            iter: 0,
            dt,
            cell: None,
            rank,
            pool,
        }
    }

    /**
     * Build a scene from a configuration: the worker pool size and pinning,
     * and the registry's sorted-serialization flag.
     */
    pub fn from_config(rank: usize, dt: Real, config: &Config) -> Result<Self> {
        let pool = if config.pin_threads {
            WorkerPool::pinned(config.num_threads)?
        } else {
            WorkerPool::new(config.num_threads)?
        };
        let mut scene = Self::new(rank, dt, pool);
        scene.interactions.serialize_sorted = config.serialize_sorted;
        Ok(scene)
    }

    /**
     * Append a body at the next free id. The body is owned by this scene's
     * rank.
     */
    pub fn insert_body(&mut self, mut body: Body) -> BodyId {
        body.subdomain = self.rank;
        let id = self.bodies.insert(body);
        self.sync_body_count();
        id
    }

    /**
     * Place a body at its own id. Used when bodies arrive from another rank,
     * so the body's `subdomain` is left as is.
     */
    pub fn insert_body_at(&mut self, body: Body) -> Option<Body> {
        let previous = self.bodies.insert_at(body);
        self.sync_body_count();
        previous
    }

    /**
     * Remove a body and every interaction it takes part in.
     */
    pub fn erase_body(&mut self, id: BodyId) -> Option<Body> {
        let others: Vec<_> = self
            .interactions
            .interactions_of(id)
            .map(|i| i.other(id))
            .collect();

        for other in others {
            self.interactions.erase(id, other, None);
        }
        self.bodies.erase(id)
    }

    pub fn sync_body_count(&mut self) {
        if self.interactions.body_count() < self.bodies.size() {
            self.interactions.set_body_count(self.bodies.size())
        }
    }

    /**
     * Advance the iteration counter and clear the force accumulators.
     */
    pub fn advance(&mut self) {
        self.iter += 1;
        self.forces.reset();
    }
}
