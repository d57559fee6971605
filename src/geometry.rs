use serde::{Deserialize, Serialize};




/// Scalar type used for every physical quantity. The arbitrary-precision
/// variants of the simulation are consumed through this alias only.
pub type Real = f64;

pub type Vector3r = nalgebra::Vector3<Real>;

pub type Quaternionr = nalgebra::UnitQuaternion<Real>;




/**
 * An axis-aligned box with min and max corners. Two boxes that only touch on
 * a face are considered overlapping, which is what a broad phase wants.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vector3r,
    pub max: Vector3r,
}




// ============================================================================
impl Aabb {

    pub fn new(min: Vector3r, max: Vector3r) -> Self {
        Self { min, max }
    }

    /**
     * Build a box from six values in (min x, min y, min z, max x, max y, max
     * z) order, which is how external solvers report their grid extent.
     */
    pub fn from_slice(values: &[Real]) -> Self {
        Self {
            min: Vector3r::new(values[0], values[1], values[2]),
            max: Vector3r::new(values[3], values[4], values[5]),
        }
    }

    /**
     * A box with NaN corners. Any union with a real box yields the real box;
     * it overlaps nothing.
     */
    pub fn undefined() -> Self {
        let nan = Vector3r::repeat(Real::NAN);
        Self { min: nan, max: nan }
    }

    pub fn is_defined(&self) -> bool {
        self.min.iter().chain(self.max.iter()).all(|x| !x.is_nan())
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        (0..3).all(|k| self.min[k] <= other.max[k] && other.min[k] <= self.max[k])
    }

    /**
     * Return the smallest box containing both boxes. Undefined boxes are
     * ignored.
     */
    pub fn union(&self, other: &Aabb) -> Aabb {
        if !self.is_defined() {
            return *other;
        }
        if !other.is_defined() {
            return *self;
        }
        Aabb {
            min: self.min.inf(&other.min),
            max: self.max.sup(&other.max),
        }
    }

    pub fn inflate(&self, length: Real) -> Aabb {
        let d = Vector3r::repeat(length);
        Aabb {
            min: self.min - d,
            max: self.max + d,
        }
    }
}




/**
 * A periodic cell anchored at the origin. Positions shipped to external
 * solvers are wrapped into the cell.
 */
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PeriodicCell {
    pub size: Vector3r,
}

impl PeriodicCell {
    pub fn wrap_pt(&self, p: &Vector3r) -> Vector3r {
        Vector3r::from_fn(|k, _| {
            let l = self.size[k];
            p[k] - l * (p[k] / l).floor()
        })
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{Aabb, PeriodicCell, Vector3r};

    fn unit_box_at(x: f64) -> Aabb {
        Aabb::new(Vector3r::new(x, 0.0, 0.0), Vector3r::new(x + 1.0, 1.0, 1.0))
    }

    #[test]
    fn boxes_overlap_works() {
        assert!(unit_box_at(0.0).overlaps(&unit_box_at(0.5)));
        assert!(unit_box_at(0.0).overlaps(&unit_box_at(1.0)));
        assert!(!unit_box_at(0.0).overlaps(&unit_box_at(1.5)));
        assert!(!unit_box_at(0.0).overlaps(&Aabb::undefined()));
    }

    #[test]
    fn union_ignores_undefined_boxes() {
        let u = Aabb::undefined().union(&unit_box_at(2.0)).union(&unit_box_at(-1.0));
        assert_eq!(u.min, Vector3r::new(-1.0, 0.0, 0.0));
        assert_eq!(u.max, Vector3r::new(3.0, 1.0, 1.0));
        assert!(!Aabb::undefined().is_defined());
    }

    #[test]
    fn wrap_point_into_cell() {
        let cell = PeriodicCell { size: Vector3r::new(1.0, 2.0, 4.0) };
        let p = cell.wrap_pt(&Vector3r::new(1.25, -0.5, 4.0));
        assert!((p - Vector3r::new(0.25, 1.5, 0.0)).norm() < 1e-12);
    }
}
