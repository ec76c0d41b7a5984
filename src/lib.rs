//! 3D navigation for flying and swimming agents, built on a sparse voxel
//! octree generated from world collision geometry.
//!
//! This library is organized into several crates:
//! - **core**: Morton codes, lattice coordinates, and AABB math
//! - **svo**: the sparse voxel octree containers, editing, raycasting, and
//!   versioned serialization
//! - **gen**: tile generation (voxelize, pad, build, collapse) and the
//!   incremental async scheduler
//! - **query**: A* path finding, reachability queries, path post-processing,
//!   and the host-facing `NavVolume` facade

pub use volant_core as core;
pub use volant_svo as svo;

pub mod prelude {
    pub use super::core::prelude::*;
    pub use super::svo::prelude::*;

    #[cfg(feature = "gen")]
    pub use super::gen::prelude::*;

    #[cfg(feature = "query")]
    pub use super::query::prelude::*;
}

#[cfg(feature = "gen")]
pub use volant_gen as gen;

#[cfg(feature = "query")]
pub use volant_query as query;
