use crate::astar::{AstarSearch, SearchPolicy, TieBreaker, Visit};
use crate::filter::{NodeRef, QueryFilter, QueryResults};

use volant_core::aabb::Aabb;
use volant_core::coords;

use volant_svo::node::{NodeState, SvoNode};
use volant_svo::octree::SparseVoxelOctree;
use volant_svo::NodeLink;

use glam::Vec3;
use rand::Rng;
use std::collections::VecDeque;

// Points returned on node surfaces are pulled inward by this much so they
// never sit exactly on an edge.
const CLOSEST_POINT_EPSILON: f32 = 0.01;

/// Location-centric queries: closest node, reachability searches, and
/// random points.
pub struct NodeQuery {
    search: AstarSearch,

    // Half-extents of the box searched by `find_closest_node`.
    node_query_extent: Vec3,
}

struct ReachablePolicy<'a> {
    start_link: NodeLink,
    distance_limit: f32,
    randomize_cost: bool,
    rng: rand::rngs::ThreadRng,
    visitor: Option<&'a mut dyn FnMut(NodeRef) -> bool>,
}

impl SearchPolicy for ReachablePolicy<'_> {
    fn goal(&self) -> NodeLink {
        // Reachability searches measure everything against where they
        // started.
        self.start_link
    }

    fn tie_breaker(&self) -> TieBreaker {
        TieBreaker::Nearest
    }

    fn heuristic_scale(&mut self, filter: &QueryFilter) -> f32 {
        if self.randomize_cost {
            self.rng.gen_range(0.0..32767.0)
        } else {
            filter.heuristic_scale
        }
    }

    fn traversal_cost(
        &mut self,
        octree: &SparseVoxelOctree,
        filter: &QueryFilter,
        from: NodeLink,
        to: NodeLink,
        portal_location: Vec3,
    ) -> f32 {
        if self.randomize_cost {
            self.rng.gen_range(0.0..32767.0)
        } else {
            let _ = (from, portal_location);
            let config = octree.config();
            filter.base_traversal_cost
                * (1.0 - config.resolution_for_link(to) / config.tile_resolution())
        }
    }

    fn can_open_neighbor(
        &mut self,
        _neighbor: volant_core::neighbor::Neighbor,
        _link: NodeLink,
        _node: &SvoNode,
        _total_cost: f32,
        travel_dist: f32,
    ) -> bool {
        !(self.distance_limit > 0.0 && travel_dist > self.distance_limit)
    }

    fn on_node_visited(&mut self, link: NodeLink, _node: &SvoNode) -> Visit {
        if let Some(visitor) = &mut self.visitor {
            if !visitor(link.id()) {
                return Visit::Stop;
            }
        }

        Visit::Continue
    }
}

struct RelevantNode {
    link: NodeLink,
    bounds: Aabb,
}

impl NodeQuery {
    pub fn new(max_search_nodes: u32, node_query_extent: Vec3) -> Self {
        Self {
            search: AstarSearch::new(max_search_nodes),
            node_query_extent,
        }
    }

    /// Finds the closest open entity to `origin` within the query extent,
    /// along with the closest point on it (pulled slightly inside).
    ///
    /// If `origin` already lies in open space its own link comes straight
    /// back; otherwise tiles in range are searched nearest first,
    /// descending through children and voxels.
    pub fn find_closest_node(
        &self,
        octree: &SparseVoxelOctree,
        origin: Vec3,
    ) -> (NodeLink, Option<Vec3>) {
        if !octree.is_valid() {
            return (NodeLink::INVALID, None);
        }

        let location_link = octree.link_for_location(origin, false);
        if location_link.is_valid() {
            return (location_link, Some(origin));
        }

        let config = octree.config();
        let query_bounds = Aabb::from_center_and_extent(origin, self.node_query_extent);
        let max_search_nodes = self.search.pool().max_nodes();
        if max_search_nodes == 0 {
            return (NodeLink::INVALID, None);
        }

        // Gather the tiles in range, closest first.
        let mut relevant_tiles: Vec<RelevantNode> = Vec::new();
        octree.tiles_in_bounds(&query_bounds, |tile| {
            relevant_tiles.push(RelevantNode {
                link: tile.self_link(),
                bounds: config.tile_bounds(tile.coord()),
            });
            (relevant_tiles.len() as u32) < max_search_nodes
        });

        if relevant_tiles.is_empty() {
            return (NodeLink::INVALID, None);
        }

        relevant_tiles.sort_by(|a, b| {
            let da = a.bounds.center().distance_squared(origin);
            let db = b.bounds.center().distance_squared(origin);
            da.total_cmp(&db)
        });

        let mut queue: VecDeque<RelevantNode> = relevant_tiles.into();

        let mut best_link = NodeLink::INVALID;
        let mut best_point = None;
        let mut closest_dist_sq = f32::MAX;
        let mut num_searched = 0u32;

        while let Some(relevant) = queue.pop_front() {
            if num_searched >= max_search_nodes {
                break;
            }
            num_searched += 1;

            let Some(node) = octree.node_from_link(relevant.link) else {
                continue;
            };

            match node.state() {
                NodeState::Blocked => (),
                NodeState::Open => {
                    let closest = relevant.bounds.closest_point(origin);
                    let dist_sq = origin.distance_squared(closest);

                    if dist_sq < closest_dist_sq {
                        closest_dist_sq = dist_sq;
                        best_link = relevant.link;
                        best_point = Some(pull_inside(closest, &relevant.bounds));
                    }
                }
                NodeState::PartiallyBlocked => {
                    if node.is_leaf() {
                        // Check each open voxel on the leaf.
                        for voxel_idx in 0..coords::VOXELS_PER_LEAF as u8 {
                            if node.is_voxel_blocked(voxel_idx) {
                                continue;
                            }

                            let voxel_link = relevant.link.with_voxel_idx(voxel_idx);
                            let Some(voxel_bounds) = octree.bounds_for_link(voxel_link) else {
                                continue;
                            };

                            if !query_bounds.intersects(&voxel_bounds) {
                                continue;
                            }

                            let closest = voxel_bounds.closest_point(origin);
                            let dist_sq = origin.distance_squared(closest);

                            if dist_sq < closest_dist_sq {
                                closest_dist_sq = dist_sq;
                                best_link = voxel_link;
                                best_point = Some(pull_inside(closest, &voxel_bounds));
                            }
                        }
                    } else {
                        // Queue up the unblocked children still in range.
                        for child_idx in 0..8 {
                            let child_link = node.child_link(child_idx);
                            let Some(child_node) = octree.node_from_link(child_link) else {
                                continue;
                            };

                            if child_node.state() == NodeState::Blocked {
                                continue;
                            }

                            let Some(child_bounds) = octree.bounds_for_node(child_node) else {
                                continue;
                            };

                            if !query_bounds.intersects(&child_bounds) {
                                continue;
                            }

                            let closest = child_bounds.closest_point(origin);
                            if origin.distance_squared(closest) < closest_dist_sq {
                                queue.push_back(RelevantNode {
                                    link: child_link,
                                    bounds: child_bounds,
                                });
                            }
                        }
                    }
                }
            }
        }

        (best_link, best_point)
    }

    /// The closest node reachable from `origin` within `distance_limit`
    /// along the neighbor graph (not straight-line distance).
    pub fn find_closest_reachable_node(
        &mut self,
        octree: &SparseVoxelOctree,
        origin: Vec3,
        distance_limit: f32,
        filter: &QueryFilter,
        results: &mut QueryResults,
    ) -> NodeLink {
        let (start_link, _) = self.find_closest_node(octree, origin);

        let mut policy = ReachablePolicy {
            start_link,
            distance_limit,
            randomize_cost: false,
            rng: rand::thread_rng(),
            visitor: None,
        };

        if self
            .search
            .search(octree, start_link, filter, &mut policy, results)
        {
            if let Some(best_idx) = self.search.best_node_idx() {
                return self.search.pool().node(best_idx).link;
            }
        }

        NodeLink::INVALID
    }

    /// A pseudo-random reachable node within `distance_limit` of `origin`:
    /// heuristic and traversal cost are uniformly random per call, so the
    /// search fans out in no particular direction.
    pub fn find_random_reachable_node(
        &mut self,
        octree: &SparseVoxelOctree,
        origin: Vec3,
        distance_limit: f32,
        filter: &QueryFilter,
        results: &mut QueryResults,
    ) -> NodeLink {
        let (start_link, _) = self.find_closest_node(octree, origin);

        let mut policy = ReachablePolicy {
            start_link,
            distance_limit,
            randomize_cost: true,
            rng: rand::thread_rng(),
            visitor: None,
        };

        if self
            .search
            .search(octree, start_link, filter, &mut policy, results)
        {
            if let Some(best_idx) = self.search.best_node_idx() {
                return self.search.pool().node(best_idx).link;
            }
        }

        NodeLink::INVALID
    }

    /// Visits every node reachable from `origin` within `distance_limit`.
    /// The visitor returning false stops the search.
    pub fn search_reachable_nodes(
        &mut self,
        octree: &SparseVoxelOctree,
        origin: Vec3,
        distance_limit: f32,
        mut visitor: impl FnMut(NodeRef) -> bool,
        filter: &QueryFilter,
        results: &mut QueryResults,
    ) -> bool {
        let (start_link, _) = self.find_closest_node(octree, origin);

        let mut policy = ReachablePolicy {
            start_link,
            distance_limit,
            randomize_cost: false,
            rng: rand::thread_rng(),
            visitor: Some(&mut visitor),
        };

        self.search
            .search(octree, start_link, filter, &mut policy, results)
    }

    /// Closest point to `origin` within the named node's bounds.
    pub fn find_closest_point_in_node(
        &self,
        octree: &SparseVoxelOctree,
        link: NodeLink,
        origin: Vec3,
    ) -> Option<Vec3> {
        octree
            .bounds_for_link(link)
            .map(|bounds| bounds.closest_point(origin))
    }

    /// Uniform random point within the named node's bounds.
    pub fn find_random_point_in_node(
        &self,
        octree: &SparseVoxelOctree,
        link: NodeLink,
    ) -> Option<Vec3> {
        let bounds = octree.bounds_for_link(link)?;
        let mut rng = rand::thread_rng();

        Some(Vec3::new(
            rng.gen_range(bounds.min.x..=bounds.max.x),
            rng.gen_range(bounds.min.y..=bounds.max.y),
            rng.gen_range(bounds.min.z..=bounds.max.z),
        ))
    }

}

/// Nudges a surface point toward the box center so results never lie on an
/// exact edge.
fn pull_inside(point: Vec3, bounds: &Aabb) -> Vec3 {
    let to_center = bounds.center() - point;
    point + to_center.normalize_or_zero() * CLOSEST_POINT_EPSILON
}
