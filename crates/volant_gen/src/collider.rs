use volant_core::aabb::Aabb;

use glam::Vec3;

/// One triangle of collision geometry, in the same frame as the octree's
/// seed location. No winding constraint; the rasterizer picks its own
/// projection axis.
#[derive(Clone, Copy, Debug)]
pub struct Triangle {
    pub vertices: [Vec3; 3],
}

impl Triangle {
    #[inline]
    pub fn new(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self { vertices: [a, b, c] }
    }

    /// Unnormalized normal; its dominant component picks the projection
    /// axis during rasterization.
    #[inline]
    pub fn normal(&self) -> Vec3 {
        let [a, b, c] = self.vertices;
        (b - a).cross(c - a)
    }
}

/// A half space. Points with `normal . p <= distance` are inside.
#[derive(Clone, Copy, Debug)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    #[inline]
    pub fn new(normal: Vec3, distance: f32) -> Self {
        Self { normal, distance }
    }

    #[inline]
    pub fn from_point_and_normal(point: Vec3, normal: Vec3) -> Self {
        Self {
            normal,
            distance: normal.dot(point),
        }
    }
}

/// A convex volume that blocks navigation wholesale, defined by its
/// bounding planes. The host flattens any instance transforms before
/// handing these over.
#[derive(Clone, Debug)]
pub struct ConvexBlocker {
    pub planes: Vec<Plane>,
    pub bounds: Aabb,
}

impl ConvexBlocker {
    /// Builds a blocker from its corner planes, deriving loose bounds from
    /// a point set (usually the hull's vertices).
    pub fn new(planes: Vec<Plane>, hull_points: &[Vec3]) -> Self {
        let mut bounds = Aabb::empty();
        for &p in hull_points {
            bounds.union_point(p);
        }

        Self { planes, bounds }
    }

    #[inline]
    pub fn contains_point(&self, point: Vec3) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.normal.dot(point) <= plane.distance)
    }
}

/// Collision geometry gathered for one tile's expanded bounds.
#[derive(Clone, Debug, Default)]
pub struct ColliderSet {
    pub triangles: Vec<Triangle>,
    pub blockers: Vec<ConvexBlocker>,
}

impl ColliderSet {
    #[inline]
    pub fn has_collision_data(&self) -> bool {
        !self.triangles.is_empty() || !self.blockers.is_empty()
    }

    pub fn clear(&mut self) {
        self.triangles.clear();
        self.blockers.clear();
    }
}

/// Implemented by the host to feed collision geometry to the generator.
///
/// `gather` is always called on the scheduler's thread; the gathered set is
/// what gets shipped to the worker, never the source itself.
pub trait GeometrySource {
    fn gather(&self, bounds: &Aabb, out: &mut ColliderSet);
}

/// A fixed set of geometry, gathered by AABB overlap. Useful for tests and
/// hosts with pre-extracted geometry.
#[derive(Clone, Debug, Default)]
pub struct StaticGeometry {
    pub triangles: Vec<Triangle>,
    pub blockers: Vec<ConvexBlocker>,
}

impl GeometrySource for StaticGeometry {
    fn gather(&self, bounds: &Aabb, out: &mut ColliderSet) {
        for tri in &self.triangles {
            let mut tri_bounds = Aabb::empty();
            for &v in &tri.vertices {
                tri_bounds.union_point(v);
            }

            if tri_bounds.intersects(bounds) {
                out.triangles.push(*tri);
            }
        }

        for blocker in &self.blockers {
            if blocker.bounds.intersects(bounds) {
                out.blockers.push(blocker.clone());
            }
        }
    }
}
