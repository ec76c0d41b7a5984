use glam::Vec3;

/// An axis-aligned box in world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    #[inline]
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn from_center_and_extent(center: Vec3, extent: Vec3) -> Self {
        Self {
            min: center - extent,
            max: center + extent,
        }
    }

    /// An empty box that any union will replace.
    #[inline]
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::MAX),
            max: Vec3::splat(f32::MIN),
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Half-size per axis.
    #[inline]
    pub fn extent(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    #[inline]
    pub fn volume(&self) -> f32 {
        let s = self.max - self.min;
        s.x * s.y * s.z
    }

    #[inline]
    pub fn expanded_by(&self, amount: f32) -> Self {
        Self {
            min: self.min - Vec3::splat(amount),
            max: self.max + Vec3::splat(amount),
        }
    }

    #[inline]
    pub fn expanded_by_vec(&self, amount: Vec3) -> Self {
        Self {
            min: self.min - amount,
            max: self.max + amount,
        }
    }

    #[inline]
    pub fn union_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        point.cmpge(self.min).all() && point.cmple(self.max).all()
    }

    /// True if `other` is fully inside `self`, edge overlap included.
    #[inline]
    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        self.contains_point(other.min) && self.contains_point(other.max)
    }

    /// Intersection test that ignores overlaps where only a single face is
    /// touching and nothing else.
    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        if self.min.cmpgt(other.max).any() || other.min.cmpgt(self.max).any() {
            return false;
        }

        for axis in 0..3 {
            if self.min[axis] == other.max[axis] || other.min[axis] == self.max[axis] {
                return false;
            }
        }

        true
    }

    #[inline]
    pub fn intersects_any(&self, bounds: &[Aabb]) -> bool {
        bounds.iter().any(|b| b.intersects(self))
    }

    #[inline]
    pub fn any_contains(bounds: &[Aabb], test: &Aabb) -> bool {
        bounds.iter().any(|b| b.contains_aabb(test))
    }

    /// The overlapping region. Only meaningful if an intersection test has
    /// already passed.
    #[inline]
    pub fn overlap(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    #[inline]
    pub fn closest_point(&self, point: Vec3) -> Vec3 {
        point.clamp(self.min, self.max)
    }

    /// Slab test returning the entry and exit parameters along `dir`.
    ///
    /// `dir` need not be normalized; the parameters are in units of its
    /// length. Returns false when the ray misses (or only grazes behind the
    /// origin).
    /// <https://tavianator.com/fast-branchless-raybounding-box-intersections-part-2-nans/>
    #[inline]
    pub fn ray_intersect(&self, origin: Vec3, dir: Vec3, t_min: &mut f32, t_max: &mut f32) -> bool {
        let t1 = (self.min.x - origin.x) * (1.0 / dir.x);
        let t2 = (self.max.x - origin.x) * (1.0 / dir.x);

        *t_min = t1.min(t2);
        *t_max = t1.max(t2);

        for axis in 1..3 {
            if dir[axis] != 0.0 {
                let t1 = (self.min[axis] - origin[axis]) * (1.0 / dir[axis]);
                let t2 = (self.max[axis] - origin[axis]) * (1.0 / dir[axis]);

                *t_min = t_min.max(t1.min(t2));
                *t_max = t_max.min(t1.max(t2));
            }
        }

        *t_max > t_min.max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_hits_box_from_outside() {
        let aabb = Aabb::new(Vec3::splat(1.0), Vec3::splat(2.0));
        let (mut t0, mut t1) = (0.0, 0.0);
        assert!(aabb.ray_intersect(Vec3::ZERO, Vec3::ONE.normalize(), &mut t0, &mut t1));
        assert!(t0 > 0.0 && t1 > t0);

        // Pointing away.
        assert!(!aabb.ray_intersect(Vec3::ZERO, -Vec3::ONE.normalize(), &mut t0, &mut t1));
    }

    #[test]
    fn ray_from_inside_reports_exit() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::splat(4.0));
        let (mut t0, mut t1) = (0.0, 0.0);
        assert!(aabb.ray_intersect(Vec3::splat(2.0), Vec3::X, &mut t0, &mut t1));
        assert!(t0 <= 0.0);
        assert!((t1 - 2.0).abs() < 1e-4);
    }

    #[test]
    fn face_touch_does_not_intersect() {
        let a = Aabb::new(Vec3::ZERO, Vec3::splat(1.0));
        let b = Aabb::new(Vec3::new(1.0, 0.0, 0.0), Vec3::new(2.0, 1.0, 1.0));
        assert!(!a.intersects(&b));

        let c = Aabb::new(Vec3::splat(0.5), Vec3::splat(1.5));
        assert!(a.intersects(&c));
    }

    #[test]
    fn closest_point_clamps() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::splat(2.0));
        assert_eq!(aabb.closest_point(Vec3::new(5.0, 1.0, -3.0)), Vec3::new(2.0, 1.0, 0.0));
        assert_eq!(aabb.closest_point(Vec3::ONE), Vec3::ONE);
    }
}
