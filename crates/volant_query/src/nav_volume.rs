use crate::filter::{
    NodeRef, PathPoint, PathQueryResults, QueryFilter, QueryResults, QueryStatus, INVALID_NODE_REF,
};
use crate::location::NodeQuery;
use crate::path::PathQuery;
use crate::path_ops;

use volant_core::aabb::Aabb;

use volant_svo::raycast::RaycastResult;
use volant_svo::serialize::{self, SerializeError};
use volant_svo::{EditableSvo, NodeLink, SparseVoxelOctree, SvoConfig};

use glam::Vec3;
use std::io::{Read, Write};
use std::ops::Deref;

/// How a finished corridor is turned into a followable path.
#[derive(Clone, Copy, Debug)]
pub struct PathOptions {
    /// Tighten the path with line-of-sight pruning.
    pub string_pull: bool,
    /// Smooth harsh angles with a Catmull-Rom spline.
    pub smooth: bool,
    /// Spline shape: 0 uniform, 0.5 centripetal, 1 chordal.
    pub smooth_alpha: f32,
    /// Points inserted per segment while smoothing.
    pub smooth_iterations: u8,
}

impl Default for PathOptions {
    fn default() -> Self {
        Self {
            string_pull: true,
            smooth: true,
            smooth_alpha: 0.5,
            smooth_iterations: 3,
        }
    }
}

/// A found path, ready to follow.
#[derive(Debug, Default)]
pub struct PathResult {
    pub status: QueryStatus,
    /// Waypoints from the requested start toward the goal. Partial paths
    /// end at the best reachable node instead of the goal.
    pub points: Vec<PathPoint>,
    /// Length over the final waypoints.
    pub length: f32,
    /// Accumulated traversal cost of the corridor.
    pub cost: f32,
    /// True when the goal itself was not reached.
    pub partial: bool,
}

impl PathResult {
    fn failed(status: QueryStatus) -> Self {
        let mut result = Self::default();
        result.status.insert(QueryStatus::FAILURE);
        result.status.insert(status);
        result
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// The host-facing navigation volume: owns the editable octree and answers
/// every query over it.
///
/// Generation mutates the octree through [`Self::octree_mut`] (handed to
/// the generator scheduler between query windows); queries run against the
/// read surface, each with its own scratch state, so any number may run
/// concurrently as long as no edit batch is open.
pub struct NavVolume {
    octree: EditableSvo,

    /// Half-extents searched when snapping an arbitrary location to the
    /// nearest open node.
    pub default_query_extent: Vec3,
}

impl Deref for NavVolume {
    type Target = SparseVoxelOctree;

    #[inline]
    fn deref(&self) -> &SparseVoxelOctree {
        self.octree.octree()
    }
}

impl NavVolume {
    pub fn new(config: SvoConfig) -> Self {
        let default_query_extent = Vec3::splat(config.leaf_resolution());

        Self {
            octree: EditableSvo::new(config),
            default_query_extent,
        }
    }

    pub fn from_octree(octree: EditableSvo) -> Self {
        let default_query_extent = Vec3::splat(octree.config().leaf_resolution());

        Self {
            octree,
            default_query_extent,
        }
    }

    #[inline]
    pub fn octree(&self) -> &EditableSvo {
        &self.octree
    }

    /// Mutable access for the generator; callers must not run queries
    /// while an edit batch is open.
    #[inline]
    pub fn octree_mut(&mut self) -> &mut EditableSvo {
        &mut self.octree
    }

    /// Finds a path between two world locations.
    pub fn find_path(
        &self,
        start_location: Vec3,
        end_location: Vec3,
        cost_limit: f32,
        filter: &QueryFilter,
        allow_partial: bool,
    ) -> PathResult {
        self.find_path_with_options(
            start_location,
            end_location,
            cost_limit,
            filter,
            allow_partial,
            &PathOptions::default(),
        )
    }

    pub fn find_path_with_options(
        &self,
        start_location: Vec3,
        end_location: Vec3,
        cost_limit: f32,
        filter: &QueryFilter,
        allow_partial: bool,
        options: &PathOptions,
    ) -> PathResult {
        let node_query = NodeQuery::new(filter.max_search_nodes, self.default_query_extent);

        // Snap both endpoints to open space first.
        let (start_link, start_point) = node_query.find_closest_node(self, start_location);
        if !start_link.is_valid() {
            return PathResult::failed(QueryStatus::UNKNOWN_LOCATION);
        }
        let (end_link, end_point) = node_query.find_closest_node(self, end_location);
        if !end_link.is_valid() {
            return PathResult::failed(QueryStatus::UNKNOWN_LOCATION);
        }

        let start_point = start_point.unwrap_or(start_location);
        let end_point = end_point.unwrap_or(end_location);

        let mut query_results = PathQueryResults::default();
        let mut path_query = PathQuery::new(filter.max_search_nodes);
        let found = path_query.find_path(
            self,
            start_link,
            end_link,
            cost_limit,
            filter,
            &mut query_results,
        );

        if !found {
            let mut result = PathResult::failed(QueryStatus::default());
            result.status.insert(query_results.query.status);
            return result;
        }

        let partial = query_results.is_partial();
        if partial && !allow_partial {
            let mut result = PathResult::failed(QueryStatus::default());
            result.status.insert(query_results.query.status);
            return result;
        }

        // Assemble the followable path: requested start, the portal
        // corridor, and the end point (unless we never got there).
        let mut points = Vec::with_capacity(query_results.path_portal_points.len() + 2);
        points.push(PathPoint::new(start_point, start_link.id()));
        points.extend_from_slice(&query_results.path_portal_points);
        if !partial {
            points.push(PathPoint::new(end_point, end_link.id()));
        }

        path_ops::clean_up_path(&mut points);
        if options.string_pull {
            path_ops::string_pull_path(self, &mut points);
        }
        if options.smooth {
            path_ops::smooth_path(self, &mut points, options.smooth_alpha, options.smooth_iterations);
        }

        let length = points
            .windows(2)
            .map(|pair| pair[0].location.distance(pair[1].location))
            .sum();

        PathResult {
            status: query_results.query.status,
            points,
            length,
            cost: query_results.path_cost,
            partial,
        }
    }

    /// Whether a path exists between two world locations.
    pub fn test_path(
        &self,
        start_location: Vec3,
        end_location: Vec3,
        cost_limit: f32,
        filter: &QueryFilter,
    ) -> bool {
        let node_query = NodeQuery::new(filter.max_search_nodes, self.default_query_extent);

        let (start_link, _) = node_query.find_closest_node(self, start_location);
        let (end_link, _) = node_query.find_closest_node(self, end_location);
        if !start_link.is_valid() || !end_link.is_valid() {
            return false;
        }

        let mut query_results = PathQueryResults::default();
        let mut path_query = PathQuery::new(filter.max_search_nodes);
        path_query.test_path(
            self,
            start_link,
            end_link,
            cost_limit,
            filter,
            &mut query_results,
        )
    }

    /// Path length and cost between two locations, without extracting the
    /// corridor points.
    pub fn calc_path_length_and_cost(
        &self,
        start_location: Vec3,
        end_location: Vec3,
        filter: &QueryFilter,
    ) -> (f32, f32, QueryStatus) {
        let node_query = NodeQuery::new(filter.max_search_nodes, self.default_query_extent);

        let (start_link, _) = node_query.find_closest_node(self, start_location);
        let (end_link, _) = node_query.find_closest_node(self, end_location);
        if !start_link.is_valid() || !end_link.is_valid() {
            let mut status = QueryStatus::FAILURE;
            status.insert(QueryStatus::UNKNOWN_LOCATION);
            return (0.0, 0.0, status);
        }

        let mut query_results = PathQueryResults::default();
        let mut path_query = PathQuery::new(filter.max_search_nodes);
        path_query.find_path(self, start_link, end_link, 0.0, filter, &mut query_results);

        (
            query_results.path_length,
            query_results.path_cost,
            query_results.query.status,
        )
    }

    /// Casts a ray against the blocked space of the octree.
    pub fn raycast(&self, ray_start: Vec3, ray_end: Vec3) -> RaycastResult {
        let mut result = RaycastResult::default();
        self.octree.raycast(ray_start, ray_end, &mut result);
        result
    }

    /// Projects a point to the nearest open node within `extent`. The
    /// returned location is pulled fractionally inside the node so it
    /// never sits on an open/blocked boundary.
    pub fn project_point(
        &self,
        point: Vec3,
        extent: Vec3,
        filter: &QueryFilter,
    ) -> Option<(Vec3, NodeRef)> {
        let node_query = NodeQuery::new(filter.max_search_nodes, extent);

        let (link, closest_point) = node_query.find_closest_node(self, point);
        if !link.is_valid() {
            return None;
        }

        closest_point.map(|location| (location, link.id()))
    }

    /// A random point inside a random node reachable within `radius` of
    /// `origin`.
    pub fn random_reachable_point_in_radius(
        &self,
        origin: Vec3,
        radius: f32,
        filter: &QueryFilter,
    ) -> Option<(Vec3, NodeRef)> {
        if radius < 0.0 {
            return None;
        }

        let mut node_query = NodeQuery::new(filter.max_search_nodes, self.default_query_extent);
        let mut results = QueryResults::default();

        let link =
            node_query.find_random_reachable_node(self, origin, radius, filter, &mut results);
        if !link.is_valid() {
            return None;
        }

        node_query
            .find_random_point_in_node(self, link)
            .map(|location| (location, link.id()))
    }

    /// The closest node reachable from `origin` within `max_distance` of
    /// travel.
    pub fn closest_reachable_node(
        &self,
        origin: Vec3,
        max_distance: f32,
        filter: &QueryFilter,
    ) -> NodeRef {
        let mut node_query = NodeQuery::new(filter.max_search_nodes, self.default_query_extent);
        let mut results = QueryResults::default();

        let link =
            node_query.find_closest_reachable_node(self, origin, max_distance, filter, &mut results);
        if link.is_valid() {
            link.id()
        } else {
            INVALID_NODE_REF
        }
    }

    /// Visits every node reachable from `origin` within `max_distance` of
    /// travel; the visitor returning false stops the iteration.
    pub fn for_each_reachable_node(
        &self,
        origin: Vec3,
        max_distance: f32,
        visitor: impl FnMut(NodeRef) -> bool,
        filter: &QueryFilter,
    ) -> bool {
        let mut node_query = NodeQuery::new(filter.max_search_nodes, self.default_query_extent);
        let mut results = QueryResults::default();

        node_query.search_reachable_nodes(self, origin, max_distance, visitor, filter, &mut results)
    }

    /// World-space center of a node the host has a handle for.
    pub fn node_location(&self, node_ref: NodeRef) -> Option<Vec3> {
        self.location_for_link(NodeLink::from_id(node_ref))
    }

    pub fn node_bounds(&self, node_ref: NodeRef) -> Option<Aabb> {
        self.bounds_for_link(NodeLink::from_id(node_ref))
    }

    /// The open node containing `location`, if any.
    pub fn node_at_location(&self, location: Vec3) -> NodeRef {
        let link = self.link_for_location(location, false);
        if link.is_valid() {
            link.id()
        } else {
            INVALID_NODE_REF
        }
    }

    pub fn is_node_ref_valid(&self, node_ref: NodeRef) -> bool {
        node_ref != INVALID_NODE_REF
            && self.node_from_link(NodeLink::from_id(node_ref)).is_some()
    }

    pub fn does_node_contain_location(&self, node_ref: NodeRef, location: Vec3) -> bool {
        self.node_bounds(node_ref)
            .is_some_and(|bounds| bounds.contains_point(location))
    }

    /// Saves the octree, finalizing any outstanding edits first so the
    /// stored neighbor links are complete.
    pub fn save(&mut self, writer: impl Write) -> Result<(), SerializeError> {
        debug_assert!(!self.octree.is_batch_editing());
        self.octree.finalize();

        serialize::save(&self.octree, writer)
    }

    pub fn load(reader: impl Read) -> Result<Self, SerializeError> {
        let octree = serialize::load(reader)?;
        Ok(Self::from_octree(EditableSvo::from_octree(octree)))
    }
}
