//! Post-processing for portal-point paths: collinear cleanup, raycast
//! string pulling, and Catmull-Rom smoothing.

use crate::filter::PathPoint;

use volant_svo::octree::SparseVoxelOctree;
use volant_svo::raycast::RaycastResult;

use glam::Vec3;

/// Removes every middle point that lies on the straight line between its
/// neighbors.
pub fn clean_up_path(path_points: &mut Vec<PathPoint>) {
    let mut idx = 0;
    while path_points.len() >= 3 && idx < path_points.len() - 2 {
        let a = path_points[idx].location;
        let b = path_points[idx + 1].location;
        let c = path_points[idx + 2].location;

        let dir_ab = (b - a).normalize_or_zero();
        let dir_bc = (c - b).normalize_or_zero();

        if dir_ab.abs_diff_eq(dir_bc, 1e-4) {
            path_points.remove(idx + 1);
            // The new triple starting here may be collinear too.
        } else {
            idx += 1;
        }
    }
}

/// For each point, finds the farthest later point it can see and removes
/// everything in between.
///
/// This isn't true string pulling (no funnel), just line-of-sight pruning;
/// it keeps the path from zigzagging between portal centers.
pub fn string_pull_path(octree: &SparseVoxelOctree, path_points: &mut Vec<PathPoint>) {
    let mut result = RaycastResult::default();
    let mut idx = 0;

    while idx + 1 < path_points.len() {
        let from = path_points[idx].location;
        let next_idx = idx + 1;

        // Find the farthest point we can reach directly.
        let mut future_idx = path_points.len() - 1;
        while future_idx > next_idx {
            let to = path_points[future_idx].location;

            if !octree.raycast(from, to, &mut result) {
                path_points.drain(next_idx..future_idx);
                break;
            }

            future_idx -= 1;
        }

        idx += 1;
    }
}

/// Catmull-Rom interpolation over four control points with an arbitrary
/// knot parameterization.
/// <https://qroph.github.io/2018/07/30/smooth-paths-using-catmull-rom-splines.html>
fn catmull_rom(
    p0: Vec3,
    p1: Vec3,
    p2: Vec3,
    p3: Vec3,
    t0: f32,
    t1: f32,
    t2: f32,
    t3: f32,
    t: f32,
) -> Vec3 {
    // Degenerate knots (coincident points) would divide by zero; the
    // segment start is as good an answer as any there.
    if (t1 - t0).abs() < f32::EPSILON
        || (t2 - t1).abs() < f32::EPSILON
        || (t3 - t2).abs() < f32::EPSILON
    {
        return p1;
    }

    let a1 = p0 * ((t1 - t) / (t1 - t0)) + p1 * ((t - t0) / (t1 - t0));
    let a2 = p1 * ((t2 - t) / (t2 - t1)) + p2 * ((t - t1) / (t2 - t1));
    let a3 = p2 * ((t3 - t) / (t3 - t2)) + p3 * ((t - t2) / (t3 - t2));

    let b1 = a1 * ((t2 - t) / (t2 - t0)) + a2 * ((t - t0) / (t2 - t0));
    let b2 = a2 * ((t3 - t) / (t3 - t1)) + a3 * ((t - t1) / (t3 - t1));

    b1 * ((t2 - t) / (t2 - t1)) + b2 * ((t - t1) / (t2 - t1))
}

/// Smooths harsh angles by inserting Catmull-Rom interpolated points along
/// each segment.
///
/// `alpha` picks the spline shape: 0 uniform, 0.5 centripetal, 1 chordal.
/// `iterations` is the number of points inserted per segment. An inserted
/// point is only accepted if it lands in an open node and both its
/// neighbors on the segment have line of sight to it.
pub fn smooth_path(
    octree: &SparseVoxelOctree,
    path_points: &mut Vec<PathPoint>,
    alpha: f32,
    iterations: u8,
) {
    // Straight lines have nothing to smooth.
    if path_points.len() < 3 {
        return;
    }

    let num_points = path_points.len();
    let last_idx = num_points - 1;
    let second_last_idx = num_points - 2;

    // Catmull-Rom needs a point before and after each segment. The path is
    // extended past both ends by mirroring the first and last segments so
    // the end segments get curves too; the phantom points are never added
    // to the path.
    let first_delta = path_points[0].location - path_points[1].location;
    let first_phantom = path_points[0].location + first_delta.normalize_or_zero() * first_delta.length();

    let last_delta = path_points[last_idx].location - path_points[second_last_idx].location;
    let last_phantom =
        path_points[last_idx].location + last_delta.normalize_or_zero() * last_delta.length();

    let mut result = RaycastResult::default();
    let mut new_points: Vec<PathPoint> = Vec::with_capacity(num_points * (iterations as usize + 1));

    for idx in 0..last_idx {
        let p0 = if idx == 0 {
            first_phantom
        } else {
            path_points[idx - 1].location
        };
        let p1 = path_points[idx].location;
        let p2 = path_points[idx + 1].location;
        let p3 = if idx == second_last_idx {
            last_phantom
        } else {
            path_points[idx + 2].location
        };

        // The segment's starting handle. The end handle is emitted by the
        // next segment (or the tail push below).
        new_points.push(path_points[idx]);

        for iteration in 1..=iterations as u32 {
            let t = iteration as f32 / (iterations as f32 + 1.0);

            let t0 = 0.0;
            let t1 = t0 + p0.distance(p1).powf(alpha);
            let t2 = t1 + p1.distance(p2).powf(alpha);
            let t3 = t2 + p2.distance(p3).powf(alpha);

            let new_point = catmull_rom(p0, p1, p2, p3, t0, t1, t2, t3, t1 + (t2 - t1) * t);

            // Only keep points that are actually navigable and can be
            // reached from both segment endpoints without clipping
            // geometry.
            let node_link = octree.link_for_location(new_point, false);
            if node_link.is_valid()
                && !octree.raycast(new_point, p1, &mut result)
                && !octree.raycast(new_point, p2, &mut result)
            {
                new_points.push(PathPoint::new(new_point, node_link.id()));
            }
        }
    }

    new_points.push(path_points[num_points - 1]);

    *path_points = new_points;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::INVALID_NODE_REF;

    fn point(x: f32, y: f32, z: f32) -> PathPoint {
        PathPoint::new(Vec3::new(x, y, z), INVALID_NODE_REF)
    }

    #[test]
    fn collinear_middles_are_dropped() {
        let mut path = vec![
            point(0.0, 0.0, 0.0),
            point(1.0, 0.0, 0.0),
            point(2.0, 0.0, 0.0),
            point(3.0, 0.0, 0.0),
            point(3.0, 4.0, 0.0),
        ];

        clean_up_path(&mut path);

        let locations: Vec<Vec3> = path.iter().map(|p| p.location).collect();
        assert_eq!(
            locations,
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(3.0, 0.0, 0.0),
                Vec3::new(3.0, 4.0, 0.0),
            ]
        );
    }

    #[test]
    fn short_paths_are_untouched() {
        let mut path = vec![point(0.0, 0.0, 0.0), point(1.0, 0.0, 0.0)];
        clean_up_path(&mut path);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn catmull_rom_interpolates_between_handles() {
        let p0 = Vec3::new(-1.0, 0.0, 0.0);
        let p1 = Vec3::ZERO;
        let p2 = Vec3::new(1.0, 1.0, 0.0);
        let p3 = Vec3::new(2.0, 1.0, 0.0);

        // Centripetal knots.
        let t0 = 0.0;
        let t1 = t0 + p0.distance(p1).powf(0.5);
        let t2 = t1 + p1.distance(p2).powf(0.5);
        let t3 = t2 + p2.distance(p3).powf(0.5);

        // The curve passes through the handles at their knots.
        assert!(catmull_rom(p0, p1, p2, p3, t0, t1, t2, t3, t1).abs_diff_eq(p1, 1e-5));
        assert!(catmull_rom(p0, p1, p2, p3, t0, t1, t2, t3, t2).abs_diff_eq(p2, 1e-5));

        // A midpoint lands between them.
        let mid = catmull_rom(p0, p1, p2, p3, t0, t1, t2, t3, (t1 + t2) * 0.5);
        assert!(mid.x > 0.0 && mid.x < 1.0);
        assert!(mid.y > 0.0 && mid.y < 1.0);
    }
}
