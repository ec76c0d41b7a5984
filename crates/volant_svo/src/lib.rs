//! The sparse voxel octree at the heart of the `volant` navigation crates.
//!
//! The world is a sparse grid of **tiles**, each the root of a small octree
//! whose nodes are stored in a dense Morton-ordered pool. Uniformly open or
//! blocked regions are collapsed to a single node; the finest subdivision is
//! the **leaf**, a 4x4x4 grid of voxels packed into one 64-bit mask. Every
//! addressable entity (tile, node, voxel) is named by a 64-bit [`NodeLink`],
//! and nodes store links to their six face neighbors so queries can walk the
//! graph without re-descending from the root.
//!
//! [`SparseVoxelOctree`] is the read-only surface shared by all queries;
//! [`EditableSvo`] layers batch-edit discipline and deferred neighbor
//! re-linking on top of it.

pub mod config;
pub mod editable;
pub mod link;
pub mod neighbor_iter;
pub mod node;
pub mod octree;
pub mod raycast;
pub mod serialize;
pub mod tile;

pub use config::SvoConfig;
pub use editable::EditableSvo;
pub use link::{NodeLink, NodeLinkBase};
pub use neighbor_iter::{NeighborIter, NeighborRef};
pub use node::{NodeState, SvoNode};
pub use octree::SparseVoxelOctree;
pub use raycast::RaycastResult;
pub use tile::{tile_id_for_coord, SvoTile};

pub mod prelude {
    pub use super::{
        EditableSvo, NeighborIter, NodeLink, NodeState, RaycastResult, SparseVoxelOctree,
        SvoConfig, SvoNode, SvoTile,
    };
}
