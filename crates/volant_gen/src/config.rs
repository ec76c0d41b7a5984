use volant_core::coords::VOXEL_GRID_EXTENT;
use volant_core::morton::{self, MortonCode};

use volant_svo::SvoConfig;

use glam::{IVec3, Vec3};
use std::ops::Deref;

/// The octree config plus everything the tile generation pipeline keeps
/// reaching for: agent padding in voxels, the padded leaf grid layout, and
/// the Morton range of the leaves that actually land in the tile.
#[derive(Clone, Debug)]
pub struct GeneratorConfig {
    svo: SvoConfig,

    // Agent padding in voxels: radius in XY, half-height in Z.
    agent_radius_voxels: u32,
    agent_half_height_voxels: u32,

    // The leaf grid each tile is voxelized into: the tile's own leaves plus
    // padding on every side, rounded up to a power of two so the Morton
    // range stays contiguous.
    num_leaf_nodes_per_axis: u32,
    actual_leaves_per_axis: u32,
    first_actual_leaf: u32,

    // Morton codes of the first and last leaf that belong to the tile
    // itself. Iterating this box skips the padding leaves.
    min_actual_leaf_code: MortonCode,
    max_actual_leaf_code: MortonCode,

    // Dirty bounds are expanded by this before gathering so neighboring
    // geometry can contribute padding into this tile.
    bounds_padding: Vec3,
}

impl Deref for GeneratorConfig {
    type Target = SvoConfig;

    #[inline]
    fn deref(&self) -> &SvoConfig {
        &self.svo
    }
}

impl GeneratorConfig {
    /// `agent_radius` and `agent_height` are in world units; padding is XY
    /// by radius and Z by half the height.
    pub fn new(svo: SvoConfig, agent_radius: f32, agent_height: f32) -> Self {
        let voxel_size = svo.voxel_size();

        let agent_radius_voxels = (agent_radius / voxel_size).ceil() as u32;
        let agent_half_height_voxels = (agent_height * 0.5 / voxel_size).ceil() as u32;

        // Enough padding for whichever axis needs the most.
        let num_padding_voxels = agent_radius_voxels.max(agent_half_height_voxels);
        let min_padding_leaves = num_padding_voxels / VOXEL_GRID_EXTENT as u32 + 1;

        let actual_leaves_per_axis =
            (svo.tile_resolution() / svo.leaf_resolution()).round() as u32;

        // Rounding up to a power of two wastes some leaves, but the Morton
        // range over the grid must be contiguous.
        let num_leaf_nodes_per_axis =
            (actual_leaves_per_axis + min_padding_leaves * 2).next_power_of_two();
        let first_actual_leaf = (num_leaf_nodes_per_axis - actual_leaves_per_axis) / 2;

        let min_actual_leaf = IVec3::splat(first_actual_leaf as i32);
        let max_actual_leaf =
            IVec3::splat((first_actual_leaf + actual_leaves_per_axis - 1) as i32);

        let xy_padding = voxel_size * agent_radius_voxels as f32;
        let z_padding = voxel_size * agent_half_height_voxels as f32;

        Self {
            svo,
            agent_radius_voxels,
            agent_half_height_voxels,
            num_leaf_nodes_per_axis,
            actual_leaves_per_axis,
            first_actual_leaf,
            min_actual_leaf_code: morton::coord_to_morton(min_actual_leaf),
            max_actual_leaf_code: morton::coord_to_morton(max_actual_leaf),
            bounds_padding: Vec3::new(xy_padding, xy_padding, z_padding),
        }
    }

    #[inline]
    pub fn svo_config(&self) -> &SvoConfig {
        &self.svo
    }

    #[inline]
    pub fn agent_radius_voxels(&self) -> u32 {
        self.agent_radius_voxels
    }

    #[inline]
    pub fn agent_half_height_voxels(&self) -> u32 {
        self.agent_half_height_voxels
    }

    #[inline]
    pub fn num_leaf_nodes_per_axis(&self) -> u32 {
        self.num_leaf_nodes_per_axis
    }

    #[inline]
    pub fn actual_leaves_per_axis(&self) -> u32 {
        self.actual_leaves_per_axis
    }

    /// Leaf-grid coordinate where the tile's own leaves begin.
    #[inline]
    pub fn first_actual_leaf(&self) -> u32 {
        self.first_actual_leaf
    }

    #[inline]
    pub fn min_actual_leaf_code(&self) -> MortonCode {
        self.min_actual_leaf_code
    }

    #[inline]
    pub fn max_actual_leaf_code(&self) -> MortonCode {
        self.max_actual_leaf_code
    }

    #[inline]
    pub fn grid_voxels_per_axis(&self) -> u32 {
        self.num_leaf_nodes_per_axis * VOXEL_GRID_EXTENT as u32
    }

    #[inline]
    pub fn bounds_padding(&self) -> Vec3 {
        self.bounds_padding
    }

    /// World-space minimum corner of a tile's voxel grid (tile minimum
    /// pulled back by the leading padding leaves).
    pub fn grid_origin(&self, tile_coord: IVec3) -> Vec3 {
        let tile_bounds = self.svo.tile_bounds(tile_coord);
        tile_bounds.min - Vec3::splat(self.first_actual_leaf as f32 * self.svo.leaf_resolution())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_axes_follow_agent_shape() {
        let svo = SvoConfig::new(Vec3::ZERO, 32.0, 16, 2);
        // Radius 50 -> 2 voxels in XY; height 200 -> half-height 100 -> 4
        // voxels in Z.
        let config = GeneratorConfig::new(svo, 50.0, 200.0);

        assert_eq!(config.agent_radius_voxels(), 2);
        assert_eq!(config.agent_half_height_voxels(), 4);
        assert_eq!(config.bounds_padding(), Vec3::new(64.0, 64.0, 128.0));
    }

    #[test]
    fn leaf_grid_is_padded_power_of_two() {
        let svo = SvoConfig::new(Vec3::ZERO, 32.0, 16, 2);
        let config = GeneratorConfig::new(svo, 32.0, 64.0);

        // 4 actual leaves + 1 padding leaf per side, rounded up to 8.
        assert_eq!(config.actual_leaves_per_axis(), 4);
        assert_eq!(config.num_leaf_nodes_per_axis(), 8);
        assert_eq!(config.first_actual_leaf(), 2);

        assert_eq!(
            config.min_actual_leaf_code(),
            morton::coord_to_morton(IVec3::splat(2))
        );
        assert_eq!(
            config.max_actual_leaf_code(),
            morton::coord_to_morton(IVec3::splat(5))
        );
    }

    #[test]
    fn grid_origin_precedes_tile_min() {
        let svo = SvoConfig::new(Vec3::ZERO, 32.0, 16, 2);
        let config = GeneratorConfig::new(svo, 32.0, 64.0);

        let tile_bounds = config.svo_config().tile_bounds(IVec3::ZERO);
        let origin = config.grid_origin(IVec3::ZERO);

        let lead = config.first_actual_leaf() as f32 * config.leaf_resolution();
        assert_eq!(origin, tile_bounds.min - Vec3::splat(lead));
    }
}
