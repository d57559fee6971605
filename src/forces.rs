use crate::body::BodyId;
use crate::geometry::Vector3r;

/// Per-body force and torque accumulators, reset at the start of each step.
///
#[derive(Clone, Debug, Default)]
pub struct ForceContainer {
    force: Vec<Vector3r>,
    torque: Vec<Vector3r>,
}

impl ForceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, id: BodyId) {
        if id >= self.force.len() {
            self.force.resize(id + 1, Vector3r::zeros());
            self.torque.resize(id + 1, Vector3r::zeros());
        }
    }

    pub fn add_force(&mut self, id: BodyId, f: &Vector3r) {
        self.ensure(id);
        self.force[id] += f;
    }

    pub fn add_torque(&mut self, id: BodyId, t: &Vector3r) {
        self.ensure(id);
        self.torque[id] += t;
    }

    pub fn force(&self, id: BodyId) -> Vector3r {
        self.force.get(id).copied().unwrap_or_else(Vector3r::zeros)
    }

    pub fn torque(&self, id: BodyId) -> Vector3r {
        self.torque.get(id).copied().unwrap_or_else(Vector3r::zeros)
    }

    pub fn reset(&mut self) {
        for f in self.force.iter_mut().chain(self.torque.iter_mut()) {
            *f = Vector3r::zeros()
        }
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::ForceContainer;
    use crate::geometry::Vector3r;

    #[test]
    fn forces_accumulate_and_reset() {
        let mut forces = ForceContainer::new();
        forces.add_force(3, &Vector3r::new(1.0, 0.0, 0.0));
        forces.add_force(3, &Vector3r::new(0.5, 2.0, 0.0));
        forces.add_torque(1, &Vector3r::new(0.0, 0.0, 1.0));
        assert_eq!(forces.force(3), Vector3r::new(1.5, 2.0, 0.0));
        assert_eq!(forces.torque(1), Vector3r::new(0.0, 0.0, 1.0));
        assert_eq!(forces.force(7), Vector3r::zeros());
        forces.reset();
        assert_eq!(forces.force(3), Vector3r::zeros());
    }
}
