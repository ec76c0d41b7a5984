use crate::link::{NodeLink, LEAF_LAYER, MAX_LAYERS};

use volant_core::aabb::Aabb;
use volant_core::coords::{self, CellOffset, VOXEL_GRID_EXTENT};
use volant_core::morton::{self, MortonCode};

use glam::{IVec3, Vec3};

/// Configuration that defines an octree. Two octrees can only exchange
/// tiles when their seed location, voxel size, and tile layer index match.
#[derive(Clone, Debug)]
pub struct SvoConfig {
    // Location from which all tile coords are relative.
    seed_location: Vec3,

    // Size of a voxel, the finest resolution of the octree.
    voxel_size: f32,

    // Number of tiles available before the pool must grow (or creation
    // fails, when fixed).
    tile_pool_size: u32,
    fixed_tile_pool_size: bool,

    // The layer at which nodes are tiles.
    tile_layer_idx: u8,

    // Derived values, recomputed by `init`.
    num_nodes_per_tile: u32,
    voxel_extent: Vec3,
    tile_resolution: f32,
    tile_extent: Vec3,
    leaf_resolution: f32,
    leaf_extent: Vec3,
}

impl SvoConfig {
    pub fn new(seed_location: Vec3, voxel_size: f32, tile_pool_size: u32, tile_layer_idx: u8) -> Self {
        let mut config = Self {
            seed_location,
            voxel_size,
            tile_pool_size,
            fixed_tile_pool_size: false,
            tile_layer_idx,
            num_nodes_per_tile: 0,
            voxel_extent: Vec3::ZERO,
            tile_resolution: 0.0,
            tile_extent: Vec3::ZERO,
            leaf_resolution: 0.0,
            leaf_extent: Vec3::ZERO,
        };
        config.init();
        config
    }

    pub(crate) fn init(&mut self) {
        self.tile_layer_idx = self.tile_layer_idx.min(MAX_LAYERS - 1).max(1);

        self.voxel_extent = Vec3::splat(self.voxel_size * 0.5);

        self.tile_resolution = self.resolution_for_layer(self.tile_layer_idx);
        self.tile_extent = Vec3::splat(self.tile_resolution * 0.5);

        self.leaf_resolution = self.resolution_for_layer(LEAF_LAYER);
        self.leaf_extent = Vec3::splat(self.leaf_resolution * 0.5);

        self.num_nodes_per_tile = (0..self.tile_layer_idx as u32)
            .map(|layer_idx| 8u32.pow(layer_idx + 1))
            .sum();
    }

    #[inline]
    pub fn seed_location(&self) -> Vec3 {
        self.seed_location
    }

    #[inline]
    pub fn voxel_size(&self) -> f32 {
        self.voxel_size
    }

    #[inline]
    pub fn voxel_extent(&self) -> Vec3 {
        self.voxel_extent
    }

    #[inline]
    pub fn tile_pool_size(&self) -> u32 {
        self.tile_pool_size
    }

    #[inline]
    pub fn set_tile_pool_size(&mut self, size: u32) {
        self.tile_pool_size = size;
    }

    #[inline]
    pub fn is_tile_pool_size_fixed(&self) -> bool {
        self.fixed_tile_pool_size
    }

    #[inline]
    pub fn set_tile_pool_size_fixed(&mut self, fixed: bool) {
        self.fixed_tile_pool_size = fixed;
    }

    #[inline]
    pub fn tile_layer_idx(&self) -> u8 {
        self.tile_layer_idx
    }

    #[inline]
    pub fn num_nodes_per_tile(&self) -> u32 {
        self.num_nodes_per_tile
    }

    #[inline]
    pub fn tile_resolution(&self) -> f32 {
        self.tile_resolution
    }

    #[inline]
    pub fn tile_extent(&self) -> Vec3 {
        self.tile_extent
    }

    #[inline]
    pub fn leaf_resolution(&self) -> f32 {
        self.leaf_resolution
    }

    #[inline]
    pub fn leaf_extent(&self) -> Vec3 {
        self.leaf_extent
    }

    /// Whether tiles can be exchanged between octrees with this config and
    /// `other` without rebuilding.
    pub fn is_compatible_with(&self, other: &SvoConfig) -> bool {
        self.seed_location == other.seed_location
            && self.voxel_size == other.voxel_size
            && self.tile_layer_idx == other.tile_layer_idx
    }

    /// Node edge length at a layer. A leaf covers a 4x4x4 voxel grid, so
    /// layer 0 is four voxels wide and each layer above doubles it.
    #[inline]
    pub fn resolution_for_layer(&self, layer_idx: u8) -> f32 {
        let layer0_resolution = self.voxel_size * VOXEL_GRID_EXTENT as f32;
        if layer_idx == LEAF_LAYER {
            layer0_resolution
        } else {
            layer0_resolution * (1 << layer_idx) as f32
        }
    }

    /// Like [`Self::resolution_for_layer`], but voxel links resolve to the
    /// voxel size.
    #[inline]
    pub fn resolution_for_link(&self, link: NodeLink) -> f32 {
        if link.is_voxel() {
            self.voxel_size
        } else {
            self.resolution_for_layer(link.layer_idx())
        }
    }

    /// Resolution one step below the given layer, bottoming out at the
    /// voxel size.
    #[inline]
    pub fn child_resolution_for_layer(&self, layer_idx: u8) -> f32 {
        if layer_idx == LEAF_LAYER {
            self.voxel_size
        } else {
            self.resolution_for_layer(layer_idx - 1)
        }
    }

    /// The location of the first (Morton 0) child of a node centered at
    /// `node_location`.
    pub fn first_child_location(
        &self,
        node_location: Vec3,
        node_layer_idx: u8,
        offset: CellOffset,
    ) -> Vec3 {
        let node_extent = Vec3::splat(self.resolution_for_layer(node_layer_idx) * 0.5);
        let mut location = node_location - node_extent;

        match offset {
            CellOffset::Min => (),
            CellOffset::Center => {
                location += Vec3::splat(self.child_resolution_for_layer(node_layer_idx) * 0.5);
            }
            CellOffset::Max => {
                location += Vec3::splat(self.child_resolution_for_layer(node_layer_idx));
            }
        }

        location
    }

    /// Center of a voxel given its leaf node's center.
    pub fn voxel_location(&self, voxel_idx: u8, node_location: Vec3) -> Vec3 {
        let voxel_coord = coords::voxel_coord_from_index(voxel_idx);
        let first = self.first_child_location(node_location, LEAF_LAYER, CellOffset::Center);
        first + voxel_coord.as_vec3() * self.voxel_size
    }

    pub fn tile_bounds_at_location(&self, tile_location: Vec3) -> Aabb {
        Aabb::new(tile_location - self.tile_extent, tile_location + self.tile_extent)
    }

    pub fn tile_bounds(&self, tile_coord: IVec3) -> Aabb {
        self.tile_bounds_at_location(self.tile_coord_to_location(tile_coord))
    }

    #[inline]
    pub fn location_to_coord(&self, location: Vec3, resolution: f32) -> IVec3 {
        coords::location_to_coord(self.seed_location, location, resolution)
    }

    #[inline]
    pub fn coord_to_location(&self, coord: IVec3, resolution: f32, offset: CellOffset) -> Vec3 {
        coords::coord_to_location(self.seed_location, coord, resolution, offset)
    }

    #[inline]
    pub fn tile_coord_to_location(&self, coord: IVec3) -> Vec3 {
        self.coord_to_location(coord, self.tile_resolution, CellOffset::Center)
    }

    #[inline]
    pub fn location_to_tile_coord(&self, location: Vec3) -> IVec3 {
        self.location_to_coord(location, self.tile_resolution)
    }

    /// Morton code of `location` at the given resolution, relative to a
    /// tile's minimum corner.
    pub fn location_to_morton(
        &self,
        tile_min_location: Vec3,
        location: Vec3,
        resolution: f32,
    ) -> MortonCode {
        let location_coord = self.location_to_coord(location, resolution);
        let min_tile_coord = self.location_to_coord(tile_min_location, resolution);
        morton::coord_to_morton(location_coord - min_tile_coord)
    }

    /// Center of a Morton cell relative to a tile's minimum corner.
    pub fn morton_to_location(
        &self,
        tile_min_location: Vec3,
        code: MortonCode,
        resolution: f32,
    ) -> Vec3 {
        let coord = morton::morton_to_coord(code);
        tile_min_location - self.seed_location
            + self.coord_to_location(coord, resolution, CellOffset::Center)
    }
}
