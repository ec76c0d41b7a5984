use crate::link::{NodeLink, NO_VOXEL};
use crate::node::NodeState;
use crate::octree::SparseVoxelOctree;

use volant_core::aabb::Aabb;
use volant_core::coords;
use volant_core::morton::{self, MortonCode};
use volant_core::neighbor::{self, Neighbor};

use glam::Vec3;

// Intersect parameters are pushed/pulled by this epsilon to guarantee
// overlaps, and the ray parameter advances by at least this much per step so
// the walk can never stall.
const RAYCAST_EPSILON: f32 = 0.01;

/// Result of a raycast through the octree.
#[derive(Clone, Copy, Debug)]
pub struct RaycastResult {
    /// Normalized hit parameter in `[0, 1]` along the ray, or `f32::MAX`
    /// when nothing was hit.
    pub hit_time: f32,
    /// The hit point, or the ray end on a miss.
    pub hit_location: Vec3,
    /// The blocked entity that was hit.
    pub hit_link: NodeLink,
}

impl Default for RaycastResult {
    fn default() -> Self {
        Self {
            hit_time: f32::MAX,
            hit_location: Vec3::ZERO,
            hit_link: NodeLink::INVALID,
        }
    }
}

impl RaycastResult {
    #[inline]
    pub fn has_hit(&self) -> bool {
        self.hit_time != f32::MAX
    }
}

struct TileIntersection {
    min_t: f32,
    max_t: f32,
    min_location: Vec3,
    tile_link: NodeLink,
    tile_min_location: Vec3,
}

struct RayInfo {
    start: Vec3,
    segment: Vec3,
    dir: Vec3,
    length: f32,
}

enum AdvanceRay {
    Success,
    Done,
    Error,
}

impl SparseVoxelOctree {
    /// Casts a ray through the octree. Returns true on a hit and fills out
    /// `result`; on a miss the result's location is the ray end.
    ///
    /// The walk is a stack-free DDA over hierarchical octants: descend into
    /// whichever node contains the current sample, advance the sample to
    /// that node's exit face, then follow its neighbor link. Numerical edge
    /// cases (a neighbor that should exist but doesn't, or a diagonal step)
    /// climb one level and retry.
    pub fn raycast(&self, ray_start: Vec3, ray_end: Vec3, result: &mut RaycastResult) -> bool {
        result.hit_time = f32::MAX;
        result.hit_location = ray_end;
        result.hit_link = NodeLink::INVALID;

        if !self.is_valid() {
            return false;
        }

        let segment = ray_end - ray_start;
        let length = segment.length();
        if length <= RAYCAST_EPSILON {
            return false;
        }
        let dir = segment / length;

        let mut ray_bounds = Aabb::empty();
        ray_bounds.union_point(ray_start);
        ray_bounds.union_point(ray_end);

        // Collect the tiles the ray passes through, nearest first.
        let mut intersections: Vec<TileIntersection> = Vec::new();

        self.tiles_in_bounds(&ray_bounds, |tile| {
            let tile_location = self.config.tile_coord_to_location(tile.coord());
            let tile_bounds = self.config.tile_bounds_at_location(tile_location);

            let (mut tile_min_t, mut tile_max_t) = (0.0, 0.0);
            if tile_bounds.ray_intersect(ray_start, dir, &mut tile_min_t, &mut tile_max_t) {
                // The intersect can return parameters outside the segment;
                // clamp them to it.
                tile_min_t = (tile_min_t + RAYCAST_EPSILON).max(RAYCAST_EPSILON);
                tile_max_t = (tile_max_t - RAYCAST_EPSILON).max(RAYCAST_EPSILON).min(length);

                if tile_max_t > 0.0 && (tile_max_t - tile_min_t) > RAYCAST_EPSILON {
                    intersections.push(TileIntersection {
                        min_t: tile_min_t,
                        max_t: tile_max_t,
                        min_location: ray_start + dir * tile_min_t,
                        tile_link: tile.self_link(),
                        tile_min_location: tile_bounds.min,
                    });
                }
            }

            true
        });

        if intersections.is_empty() {
            return false;
        }

        intersections.sort_by(|a, b| a.min_t.total_cmp(&b.min_t));

        let ray = RayInfo {
            start: ray_start,
            segment,
            dir,
            length,
        };

        for tile_info in &intersections {
            if self.raycast_tile(&ray, tile_info, result) {
                return true;
            }
        }

        false
    }

    fn raycast_tile(
        &self,
        ray: &RayInfo,
        info: &TileIntersection,
        result: &mut RaycastResult,
    ) -> bool {
        let mut cur_t = info.min_t;
        let mut cur_location = info.min_location;
        let mut cur_link = info.tile_link;

        while cur_link.is_valid() {
            // Out of this tile without a hit; let the next tile have a try.
            if cur_t >= info.max_t {
                return false;
            }

            let Some(node) = self.node_from_link(cur_link) else {
                // Numerical edge case: the walk stepped onto a slot that no
                // longer resolves. Exit the tile rather than loop.
                log::debug!("raycast: link {cur_link:?} did not resolve, exiting tile");
                return false;
            };

            let tile = self.tile(cur_link.tile_id).expect("tile resolved above");
            let node_location = self.location_for_node(node, tile);
            let node_resolution = self.config.resolution_for_layer(cur_link.layer_idx());
            let node_morton: MortonCode = cur_link.node_idx();
            let node_sibling_idx = morton::child_index(node_morton);

            let state = node.state();

            // A fully blocked node ends the walk.
            if state == NodeState::Blocked {
                result.hit_time = cur_t / ray.length;
                result.hit_location = ray.start + ray.segment * result.hit_time;
                result.hit_link = cur_link;
                return true;
            }

            // An open node means we advance to its far side and move into a
            // neighbor.
            let mut advance = state == NodeState::Open;

            if state == NodeState::PartiallyBlocked {
                if cur_link.is_leaf() {
                    let voxel_coord = self.relative_child_coord(cur_link, cur_location);

                    // Entering the leaf for the first time: pin down the
                    // voxel under the sample. After that the link itself
                    // tracks which voxel we're in.
                    if !cur_link.is_voxel() && coords::is_voxel_coord_valid(voxel_coord) {
                        cur_link.set_voxel_idx(coords::voxel_index_for_coord(voxel_coord));
                    }

                    if cur_link.is_voxel() {
                        if node.is_voxel_blocked(cur_link.voxel_idx()) {
                            result.hit_time = cur_t / ray.length;
                            result.hit_location = ray.start + ray.segment * result.hit_time;
                            result.hit_link = cur_link;
                            return true;
                        }

                        match self.advance_ray(cur_link, ray, info, &mut cur_t, &mut cur_location) {
                            AdvanceRay::Done => return false,
                            AdvanceRay::Error => {
                                cur_link = node.parent_link();
                                continue;
                            }
                            AdvanceRay::Success => (),
                        }

                        let neighbor_voxel_coord =
                            self.relative_child_coord(cur_link, cur_location);

                        // The sample must have left the voxel; if not, the
                        // epsilon push already happened, so climb and retry.
                        if neighbor_voxel_coord == voxel_coord {
                            cur_link = node.parent_link();
                            continue;
                        }

                        if coords::is_voxel_coord_valid(neighbor_voxel_coord) {
                            cur_link.set_voxel_idx(coords::voxel_index_for_coord(
                                neighbor_voxel_coord,
                            ));
                        } else {
                            // Off the edge of this leaf: process the leaf's
                            // own neighbors instead.
                            cur_link.set_voxel_idx(NO_VOXEL);
                            advance = true;
                        }
                    }
                } else {
                    // Descend into the child under the sample, if it really
                    // is ours.
                    let child_resolution =
                        self.config.child_resolution_for_layer(cur_link.layer_idx());
                    let child_morton = self.config.location_to_morton(
                        info.tile_min_location,
                        cur_location,
                        child_resolution,
                    );

                    if (child_morton >> 3) == node_morton {
                        cur_link = node.child_link(morton::child_index(child_morton));
                    } else {
                        // The sample is not inside this node; climb back up
                        // to find the containing node.
                        cur_link = node.parent_link();
                    }
                }
            }

            if advance {
                match self.advance_ray(cur_link, ray, info, &mut cur_t, &mut cur_location) {
                    AdvanceRay::Done => return false,
                    AdvanceRay::Error => {
                        cur_link = node.parent_link();
                        continue;
                    }
                    AdvanceRay::Success => (),
                }

                let node_coord = self.config.location_to_coord(node_location, node_resolution);
                let neighbor_coord = self.config.location_to_coord(cur_location, node_resolution);

                // The epsilon push should always move us to a different
                // cell; if it didn't, climb and retry.
                if neighbor_coord == node_coord {
                    cur_link = node.parent_link();
                    continue;
                }

                // The walk can leave the Morton space of this tile; no
                // further coords would be valid, so hand over to the next
                // tile.
                let min_tile_coord = self
                    .config
                    .location_to_coord(info.tile_min_location, node_resolution);
                let neighbor_morton_coord = neighbor_coord - min_tile_coord;
                if !morton::is_valid_morton_coord(neighbor_morton_coord) {
                    return false;
                }

                let neighbor_morton = morton::coord_to_morton(neighbor_morton_coord);

                let mut neighbor = neighbor::neighbor_between_siblings(
                    morton::child_index(neighbor_morton),
                    node_sibling_idx,
                );

                if neighbor != Neighbor::Self_ {
                    // When the step leaves our parent, the face we see from
                    // our side is the opposite of the face the neighbor's
                    // child slot implies.
                    if !morton::are_siblings(node_morton, neighbor_morton) {
                        neighbor = neighbor.opposite();
                    }

                    cur_link = node.neighbor_link_in(self, neighbor);
                } else {
                    // A diagonal step; we only link the six faces, so climb
                    // until some ancestor covers the sample.
                    cur_link = node.parent_link();
                }
            }
        }

        false
    }

    /// Moves the sample to the exit of the entity `cur_link` names, clamped
    /// so it always advances by at least the epsilon.
    fn advance_ray(
        &self,
        cur_link: NodeLink,
        ray: &RayInfo,
        info: &TileIntersection,
        cur_t: &mut f32,
        cur_location: &mut Vec3,
    ) -> AdvanceRay {
        let Some(bounds) = self.bounds_for_link(cur_link) else {
            return AdvanceRay::Error;
        };

        // Inflate the bounds a bit to absorb edge and corner overlaps.
        let bounds = bounds.expanded_by(RAYCAST_EPSILON);

        let (mut node_min_t, mut node_max_t) = (0.0, 0.0);
        let intersects = bounds.ray_intersect(ray.start, ray.dir, &mut node_min_t, &mut node_max_t);

        // Force the parameter forward so the walk can never stall.
        node_max_t = node_max_t.max(*cur_t + RAYCAST_EPSILON).min(info.max_t);

        *cur_t = node_max_t;
        *cur_location = ray.start + ray.dir * *cur_t;

        // Reached the edge of the tile; evaluate the next tile.
        if *cur_t >= info.max_t {
            return AdvanceRay::Done;
        }

        if *cur_t >= ray.length {
            return AdvanceRay::Done;
        }

        // This *should* always intersect. When it doesn't, the parameter
        // has already been pushed out, so the caller climbs and retries.
        if !intersects {
            return AdvanceRay::Error;
        }

        AdvanceRay::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SvoConfig;
    use crate::editable::EditableSvo;
    use crate::tile::{tile_id_for_coord, SvoTile};

    use glam::IVec3;

    fn test_config() -> SvoConfig {
        SvoConfig::new(Vec3::ZERO, 25.0, 32, 2)
    }

    /// One tile whose +X half (layer-1 children with x = 1) is solid.
    fn half_blocked_octree() -> EditableSvo {
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        let coord = IVec3::ZERO;
        let mut tile = SvoTile::new(tile_id_for_coord(coord), config.tile_layer_idx(), coord);
        tile.allocate_nodes(config.num_nodes_per_tile(), config.tile_layer_idx());
        tile.node_info_mut().set_state(NodeState::PartiallyBlocked);

        for i in 0..8u8 {
            let (node, _) = tile.ensure_node(1, i as u32).unwrap();
            // Sibling bit 0 is the x axis.
            node.set_state(if i & 1 != 0 {
                NodeState::Blocked
            } else {
                NodeState::Open
            });
        }

        tile.trim_excess_nodes();
        tile.link_internal_neighbors();
        svo.assume_tile(&mut tile, true);
        svo
    }

    #[test]
    fn ray_hits_solid_half() {
        let svo = half_blocked_octree();
        let tile_res = svo.config().tile_resolution();

        // Straight down +X through the middle of the tile; the wall starts
        // at the half-way plane.
        let start = Vec3::new(tile_res * 0.1, tile_res * 0.25, tile_res * 0.25);
        let end = Vec3::new(tile_res * 0.9, tile_res * 0.25, tile_res * 0.25);

        let mut result = RaycastResult::default();
        assert!(svo.raycast(start, end, &mut result));
        assert!(result.has_hit());

        // Hit lands at the blocked boundary, within the walk's epsilon
        // slack.
        assert!((result.hit_location.x - tile_res * 0.5).abs() < 1.0);
        assert!(result.hit_link.is_valid());
    }

    #[test]
    fn ray_misses_open_half() {
        let svo = half_blocked_octree();
        let tile_res = svo.config().tile_resolution();

        let start = Vec3::new(tile_res * 0.25, tile_res * 0.1, tile_res * 0.25);
        let end = Vec3::new(tile_res * 0.25, tile_res * 0.9, tile_res * 0.25);

        let mut result = RaycastResult::default();
        assert!(!svo.raycast(start, end, &mut result));
        assert!(!result.has_hit());
        assert_eq!(result.hit_location, end);
    }

    #[test]
    fn hit_flag_is_direction_independent() {
        let svo = half_blocked_octree();
        let tile_res = svo.config().tile_resolution();

        let a = Vec3::new(tile_res * 0.1, tile_res * 0.25, tile_res * 0.25);
        let b = Vec3::new(tile_res * 0.9, tile_res * 0.25, tile_res * 0.25);

        let mut forward = RaycastResult::default();
        let mut backward = RaycastResult::default();
        assert_eq!(
            svo.raycast(a, b, &mut forward),
            svo.raycast(b, a, &mut backward)
        );

        let c = Vec3::new(tile_res * 0.25, tile_res * 0.1, tile_res * 0.25);
        let d = Vec3::new(tile_res * 0.25, tile_res * 0.9, tile_res * 0.25);
        assert_eq!(
            svo.raycast(c, d, &mut forward),
            svo.raycast(d, c, &mut backward)
        );
    }

    #[test]
    fn empty_octree_misses() {
        let svo = EditableSvo::new(test_config());
        let mut result = RaycastResult::default();
        assert!(!svo.raycast(Vec3::ZERO, Vec3::splat(100.0), &mut result));
    }
}
