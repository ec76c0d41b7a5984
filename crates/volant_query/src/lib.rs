//! Queries over the `volant` navigation octree: A* path finding with a
//! pluggable filter, closest/random/bounded reachability searches, point
//! projection, and path post-processing (collinear cleanup, line-of-sight
//! pulling, Catmull-Rom smoothing).
//!
//! [`NavVolume`] is the host-facing facade tying the octree, generator
//! output, and queries together.

pub mod astar;
pub mod filter;
pub mod location;
pub mod nav_volume;
pub mod path;
pub mod path_ops;

pub use filter::{
    NodeRef, PathPoint, PathQueryResults, QueryConstraints, QueryFilter, QueryResults,
    QueryStatus, INVALID_NODE_REF,
};
pub use location::NodeQuery;
pub use nav_volume::{NavVolume, PathOptions, PathResult};
pub use path::PathQuery;

pub mod prelude {
    pub use super::{
        NavVolume, NodeQuery, NodeRef, PathOptions, PathPoint, PathQuery, PathQueryResults,
        PathResult, QueryFilter, QueryResults, QueryStatus,
    };
}
