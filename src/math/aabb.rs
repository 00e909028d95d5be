//! Axis-aligned bounding box

use crate::core::types::{IVec3, Vec3};

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Bounding box of a sphere
    pub fn from_sphere(center: Vec3, radius: f32) -> Self {
        Self {
            min: center - Vec3::splat(radius),
            max: center + Vec3::splat(radius),
        }
    }

    /// Grow to include `p`.
    pub fn including(&self, p: Vec3) -> Aabb {
        Aabb {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    /// Integer lattice points covered by this box, as inclusive `(lo, hi)`.
    ///
    /// `lo > hi` on some axis means no lattice point lies inside.
    pub fn lattice_range(&self) -> (IVec3, IVec3) {
        (self.min.ceil().as_ivec3(), self.max.floor().as_ivec3())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sphere() {
        let a = Aabb::from_sphere(Vec3::splat(4.0), 0.5);
        assert_eq!(a.min, Vec3::splat(3.5));
        assert_eq!(a.max, Vec3::splat(4.5));
    }

    #[test]
    fn test_including() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ZERO).including(Vec3::new(1.0, -2.0, 0.5));
        assert_eq!(a.min, Vec3::new(0.0, -2.0, 0.0));
        assert_eq!(a.max, Vec3::new(1.0, 0.0, 0.5));
    }

    #[test]
    fn test_lattice_range() {
        let aabb = Aabb::new(Vec3::new(-1.5, 0.0, 2.2), Vec3::new(1.5, 0.9, 4.0));
        let (lo, hi) = aabb.lattice_range();
        assert_eq!(lo, IVec3::new(-1, 0, 3));
        assert_eq!(hi, IVec3::new(1, 0, 4));

        let (lo, hi) = Aabb::new(Vec3::splat(0.2), Vec3::splat(0.8)).lattice_range();
        assert!(lo.cmpgt(hi).all());
    }
}
