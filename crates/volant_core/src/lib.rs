//! The core data types for the `volant` navigation crates:
//! - 30-bit 3D Morton codes and iterators over Morton boxes
//! - integer lattice coordinates and world-space conversions
//! - axis-aligned bounding boxes with a slab ray test
//! - the six-direction neighbor enum and its lookup tables

pub mod aabb;
pub mod coords;
pub mod morton;
pub mod neighbor;

pub use aabb::Aabb;
pub use coords::{CellOffset, CoordIter};
pub use morton::{MortonCode, MortonIter};
pub use neighbor::{Neighbor, NeighborFlags};

pub use glam;

pub mod prelude {
    pub use super::aabb::Aabb;
    pub use super::coords::{CellOffset, CoordIter};
    pub use super::morton::{MortonCode, MortonIter};
    pub use super::neighbor::{Neighbor, NeighborFlags};
    pub use glam::{IVec3, Vec3};
}
