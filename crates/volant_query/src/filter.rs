use volant_core::aabb::Aabb;

use glam::Vec3;
use std::fmt;

/// Opaque 64-bit handle the host uses to name octree entities (the id of a
/// [`volant_svo::NodeLink`]).
pub type NodeRef = u64;
pub const INVALID_NODE_REF: NodeRef = u64::MAX;

pub const DEFAULT_MAX_SEARCH_NODES: u32 = 2048;
pub const DEFAULT_HEURISTIC_SCALE: f32 = 2.0;
pub const DEFAULT_BASE_TRAVERSAL_COST: f32 = 1.0;

/// Bitfield describing how a query ended. Every query returns a status,
/// even when it partially succeeds; none of these are fatal.
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub struct QueryStatus(pub u16);

impl QueryStatus {
    pub const SUCCESS: Self = Self(1 << 0);
    pub const FAILURE: Self = Self(1 << 1);
    pub const INVALID_PARAM: Self = Self(1 << 2);
    pub const UNKNOWN_LOCATION: Self = Self(1 << 3);
    pub const OUT_OF_MEMORY: Self = Self(1 << 4);
    pub const OUT_OF_NODES: Self = Self(1 << 5);
    pub const PARTIAL_PATH: Self = Self(1 << 6);
    pub const CYCLICAL_PATH: Self = Self(1 << 7);
    pub const REACHED_NODE_LIMIT: Self = Self(1 << 8);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn is_success(self) -> bool {
        self.contains(Self::SUCCESS)
    }
}

impl fmt::Debug for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 9] = [
            (1 << 0, "SUCCESS"),
            (1 << 1, "FAILURE"),
            (1 << 2, "INVALID_PARAM"),
            (1 << 3, "UNKNOWN_LOCATION"),
            (1 << 4, "OUT_OF_MEMORY"),
            (1 << 5, "OUT_OF_NODES"),
            (1 << 6, "PARTIAL_PATH"),
            (1 << 7, "CYCLICAL_PATH"),
            (1 << 8, "REACHED_NODE_LIMIT"),
        ];

        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    write!(f, " | ")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

/// Spatial constraints a query must respect: every portal and result must
/// lie within all of these bounds.
#[derive(Default)]
pub struct QueryConstraints {
    bounds: Vec<Aabb>,
}

impl QueryConstraints {
    #[inline]
    pub fn has_constraints(&self) -> bool {
        !self.bounds.is_empty()
    }

    #[inline]
    pub fn bounds(&self) -> &[Aabb] {
        &self.bounds
    }

    pub fn add_bounds_constraint(&mut self, bounds: Aabb) {
        self.bounds.push(bounds);
    }

    pub fn set_bounds_constraints(&mut self, bounds: &[Aabb]) {
        self.bounds = bounds.to_vec();
    }

    /// Shrinks `bounds` to fit every constraint. Returns false when the
    /// clipped box is empty (the bounds lie outside a constraint).
    pub fn constrain_bounds(&self, bounds: &mut Aabb) -> bool {
        for constraint in &self.bounds {
            if !constraint.intersects(bounds) {
                return false;
            }
            *bounds = constraint.overlap(bounds);
        }

        true
    }

    pub fn reset(&mut self) {
        self.bounds.clear();
    }
}

/// Per-query configuration. Shared by every query type.
pub struct QueryFilter {
    /// Cap on the search node pool.
    pub max_search_nodes: u32,

    /// Multiplier on the Manhattan heuristic. Larger favors expanding
    /// toward the goal regardless of obstacles.
    pub heuristic_scale: f32,

    /// Minimum cost of moving into a new node. Larger favors paths with
    /// fewer nodes overall.
    pub base_traversal_cost: f32,

    pub constraints: QueryConstraints,

    /// Called every time a node is visited; returning false stops the
    /// search with its best-so-far result.
    pub on_node_visited: Option<Box<dyn Fn(NodeRef) -> bool>>,
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self {
            max_search_nodes: DEFAULT_MAX_SEARCH_NODES,
            heuristic_scale: DEFAULT_HEURISTIC_SCALE,
            base_traversal_cost: DEFAULT_BASE_TRAVERSAL_COST,
            constraints: QueryConstraints::default(),
            on_node_visited: None,
        }
    }
}

/// Bookkeeping shared by all queries.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryResults {
    pub status: QueryStatus,

    /// Nodes checked for whether they could be opened.
    pub num_nodes_queried: u32,
    /// Unique nodes opened.
    pub num_nodes_opened: u32,
    /// Nodes that were re-opened with a cheaper path.
    pub num_nodes_reopened: u32,
    /// Nodes visited (popped and expanded).
    pub num_nodes_visited: u32,

    pub mem_used: u32,
}

impl QueryResults {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One waypoint of a path: a portal (or endpoint) location plus the node it
/// belongs to.
#[derive(Clone, Copy, Debug)]
pub struct PathPoint {
    pub location: Vec3,
    pub node_ref: NodeRef,
}

impl PathPoint {
    #[inline]
    pub fn new(location: Vec3, node_ref: NodeRef) -> Self {
        Self { location, node_ref }
    }
}

/// Path query output: search bookkeeping plus the path itself.
#[derive(Debug, Default)]
pub struct PathQueryResults {
    pub query: QueryResults,

    pub path_node_count: u32,
    pub path_length: f32,
    pub path_cost: f32,
    /// Portal points along the corridor, start-side first. The requested
    /// start/end locations are not included; the caller appends them.
    pub path_portal_points: Vec<PathPoint>,
}

impl PathQueryResults {
    pub fn reset(&mut self) {
        self.query.reset();
        self.path_node_count = 0;
        self.path_length = 0.0;
        self.path_cost = 0.0;
        self.path_portal_points.clear();
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        self.query.status.contains(QueryStatus::PARTIAL_PATH)
    }

    #[inline]
    pub fn ran_out_of_nodes(&self) -> bool {
        self.query.status.contains(QueryStatus::OUT_OF_NODES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_flags_compose() {
        let mut status = QueryStatus::default();
        status.insert(QueryStatus::SUCCESS);
        status.insert(QueryStatus::PARTIAL_PATH);

        assert!(status.is_success());
        assert!(status.contains(QueryStatus::PARTIAL_PATH));
        assert!(!status.contains(QueryStatus::FAILURE));
        assert_eq!(format!("{status:?}"), "SUCCESS | PARTIAL_PATH");
    }

    #[test]
    fn constraints_clip_bounds() {
        let mut constraints = QueryConstraints::default();
        constraints.add_bounds_constraint(Aabb::new(Vec3::ZERO, Vec3::splat(10.0)));
        constraints.add_bounds_constraint(Aabb::new(Vec3::splat(5.0), Vec3::splat(20.0)));

        let mut bounds = Aabb::new(Vec3::splat(4.0), Vec3::splat(12.0));
        assert!(constraints.constrain_bounds(&mut bounds));
        assert_eq!(bounds.min, Vec3::splat(5.0));
        assert_eq!(bounds.max, Vec3::splat(10.0));

        let mut outside = Aabb::new(Vec3::splat(30.0), Vec3::splat(40.0));
        assert!(!constraints.constrain_bounds(&mut outside));
    }
}
