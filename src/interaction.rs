use serde::{Deserialize, Serialize};

use crate::body::BodyId;
use crate::geometry::{Real, Vector3r};

/// Sentinel for an interaction that is not stored in a registry.
pub const NO_POSITION: usize = usize::MAX;




/**
 * Contact geometry attached by a narrow-phase functor.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactGeometry {
    pub normal: Vector3r,
    pub penetration_depth: Real,
}




/**
 * Contact physics attached by a constitutive law. The registry never looks
 * inside it.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactPhysics {
    pub normal_force: Vector3r,
    pub shear_force: Vector3r,
}




/**
 * A potential or real pairwise relationship between two bodies. An
 * interaction is real once both geometry and physics are attached; a fresh
 * interaction, or one that was reset, is potential.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    id1: BodyId,
    id2: BodyId,
    pub geom: Option<ContactGeometry>,
    pub phys: Option<ContactPhysics>,
    pub iter_made_real: Option<u64>,
    pub iter_last_seen: Option<u64>,

    #[serde(skip, default = "no_position")]
    pub(crate) lin_ix: usize,
}

fn no_position() -> usize {
    NO_POSITION
}




// ============================================================================
impl Interaction {

    pub fn new(id1: BodyId, id2: BodyId) -> Self {
        Self {
            id1,
            id2,
            geom: None,
            phys: None,
            iter_made_real: None,
            iter_last_seen: None,
            lin_ix: NO_POSITION,
        }
    }

    pub fn id1(&self) -> BodyId {
        self.id1
    }

    pub fn id2(&self) -> BodyId {
        self.id2
    }

    pub fn is_real(&self) -> bool {
        self.geom.is_some() && self.phys.is_some()
    }

    /**
     * Return the position of this interaction in the dense sequence of the
     * registry that holds it.
     */
    pub fn lin_ix(&self) -> usize {
        self.lin_ix
    }

    /**
     * The id pair as (min, max). This is the unordered identity of the
     * interaction.
     */
    pub fn ordered_ids(&self) -> (BodyId, BodyId) {
        ordered(self.id1, self.id2)
    }

    /**
     * Given one endpoint, return the other.
     */
    pub fn other(&self, id: BodyId) -> BodyId {
        if id == self.id1 {
            self.id2
        } else {
            self.id1
        }
    }

    /**
     * Drop geometry and physics, returning the interaction to its initial
     * potential state.
     */
    pub fn reset(&mut self) {
        self.geom = None;
        self.phys = None;
        self.iter_made_real = None;
    }

    pub fn make_real(&mut self, geom: ContactGeometry, phys: ContactPhysics, iter: u64) {
        self.geom = Some(geom);
        self.phys = Some(phys);
        self.iter_made_real = Some(iter);
    }
}

pub fn ordered(a: BodyId, b: BodyId) -> (BodyId, BodyId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}
