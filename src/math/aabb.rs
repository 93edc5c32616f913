//! Axis-aligned bounding box

use crate::core::types::Vec3;

/// Axis-aligned bounding box defined by min and max corners
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Aabb {
    /// Inverted box; expanding it by any point yields that point.
    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };

    /// Create AABB from min and max corners
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box containing every point, or `EMPTY` for no points
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Self {
        let mut aabb = Self::EMPTY;
        for p in points {
            aabb.expand(p);
        }
        aabb
    }

    /// True if min exceeds max on any axis
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Expand AABB to include point
    pub fn expand(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Return merged AABB containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Flatten to `[min.x, min.y, min.z, max.x, max.y, max.z]`
    pub fn to_array(&self) -> [f32; 6] {
        [self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z]
    }

    pub fn from_array(v: [f32; 6]) -> Self {
        Self {
            min: Vec3::new(v[0], v[1], v[2]),
            max: Vec3::new(v[3], v[4], v[5]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_accessors() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(aabb.size(), Vec3::ONE);
        assert!(!aabb.is_empty());
    }

    #[test]
    fn test_empty_expand() {
        let mut aabb = Aabb::default();
        assert!(aabb.is_empty());
        aabb.expand(Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(aabb.min, aabb.max);
        assert!(!aabb.is_empty());
    }

    #[test]
    fn test_merged_with_empty() {
        let a = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(a.merged(&Aabb::EMPTY), a);
    }

    #[test]
    fn test_array_conversion() {
        let a = Aabb::new(Vec3::new(-1.0, 0.0, 2.0), Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(Aabb::from_array(a.to_array()), a);
    }
}
