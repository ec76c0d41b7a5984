use crate::config::SvoConfig;
use crate::link::NodeLink;
use crate::neighbor_iter::NeighborIter;
use crate::octree::SparseVoxelOctree;
use crate::tile::SvoTile;

use volant_core::neighbor::NeighborFlags;

use fnv::FnvHashMap;
use glam::IVec3;
use std::ops::Deref;

/// The mutating surface over a [`SparseVoxelOctree`].
///
/// Edits are bracketed by [`Self::begin_batch`]/[`Self::end_batch`]
/// (re-entrant via a ref count). Installing or removing a tile marks the
/// affected faces of its neighbors dirty; when the last batch closes,
/// [`Self::finalize_nodes`] re-links every dirty face, parents before
/// children.
pub struct EditableSvo {
    octree: SparseVoxelOctree,

    // Nodes whose neighbor links need refreshing once the batch closes,
    // with the set of faces to refresh.
    dirty_nodes: FnvHashMap<NodeLink, NeighborFlags>,

    batch_edit_ref_count: u32,
}

impl Deref for EditableSvo {
    type Target = SparseVoxelOctree;

    #[inline]
    fn deref(&self) -> &SparseVoxelOctree {
        &self.octree
    }
}

impl EditableSvo {
    pub fn new(config: SvoConfig) -> Self {
        Self::from_octree(SparseVoxelOctree::new(config))
    }

    /// Wraps an already-built octree, e.g. one freshly deserialized.
    pub fn from_octree(octree: SparseVoxelOctree) -> Self {
        Self {
            octree,
            dirty_nodes: FnvHashMap::default(),
            batch_edit_ref_count: 0,
        }
    }

    #[inline]
    pub fn octree(&self) -> &SparseVoxelOctree {
        &self.octree
    }

    /// Destroys all data within the octree.
    pub fn reset(&mut self) {
        self.octree.reset();
        self.dirty_nodes.clear();
    }

    #[inline]
    pub fn begin_batch(&mut self) {
        self.batch_edit_ref_count += 1;
    }

    pub fn end_batch(&mut self) {
        debug_assert!(self.batch_edit_ref_count > 0);
        self.batch_edit_ref_count = self.batch_edit_ref_count.saturating_sub(1);

        if self.batch_edit_ref_count == 0 {
            self.finalize_nodes();
        }
    }

    #[inline]
    pub fn is_batch_editing(&self) -> bool {
        self.batch_edit_ref_count > 0
    }

    /// Whether all edits have been finalized and the octree is safe for
    /// normal operation.
    #[inline]
    pub fn are_nodes_finalized(&self) -> bool {
        self.dirty_nodes.is_empty()
    }

    /// Forces any deferred neighbor re-linking to run now. No-op while a
    /// batch is still open.
    pub fn finalize(&mut self) {
        if !self.is_batch_editing() {
            self.finalize_nodes();
        }
    }

    /// Installs a deep copy of `source_tile` at its coord. With
    /// `preserve_links`, already-valid neighbor links on the incoming tile
    /// are kept and only invalid slots are refreshed.
    pub fn copy_tile(&mut self, source_tile: &SvoTile, preserve_links: bool) {
        let Some(dest_tile) = self.octree.ensure_tile_at_coord(source_tile.coord()) else {
            return;
        };
        let tile_link = dest_tile.self_link();

        self.begin_batch();

        if let Some(dest_tile) = self.octree.tile_mut(tile_link.tile_id) {
            dest_tile.copy_from(source_tile);
        }

        self.octree
            .link_neighbors_for_node_hierarchically(tile_link, preserve_links);
        self.mark_neighbors_dirty(tile_link);

        self.end_batch();
    }

    /// Installs tiles from another octree by copy. The configs must be
    /// compatible.
    pub fn copy_tiles_from(
        &mut self,
        source: &SparseVoxelOctree,
        tile_coords: &[IVec3],
        preserve_links: bool,
    ) {
        if !self.config().is_compatible_with(source.config()) {
            return;
        }

        self.begin_batch();
        for &coord in tile_coords {
            if let Some(source_tile) = source.tile_at_coord(coord) {
                self.copy_tile(source_tile, preserve_links);
            }
        }
        self.end_batch();
    }

    /// Installs `source_tile` at its coord by moving its node pool in.
    pub fn assume_tile(&mut self, source_tile: &mut SvoTile, preserve_links: bool) {
        let Some(dest_tile) = self.octree.ensure_tile_at_coord(source_tile.coord()) else {
            return;
        };
        let tile_link = dest_tile.self_link();

        self.begin_batch();

        if let Some(dest_tile) = self.octree.tile_mut(tile_link.tile_id) {
            dest_tile.assume_from(source_tile);
        }

        self.octree
            .link_neighbors_for_node_hierarchically(tile_link, preserve_links);
        self.mark_neighbors_dirty(tile_link);

        self.end_batch();
    }

    /// Moves every tile out of `source` into this octree. The configs must
    /// be compatible.
    pub fn assume_tiles_from(&mut self, source: &mut SparseVoxelOctree, preserve_links: bool) {
        if !self.config().is_compatible_with(source.config()) {
            return;
        }

        self.begin_batch();
        let mut tiles = std::mem::take(&mut source.tiles);
        for tile in tiles.values_mut() {
            self.assume_tile(tile, preserve_links);
        }
        self.end_batch();
    }

    /// Removes the tile a link names, marking its neighbors dirty for
    /// re-linking and releasing its memory.
    pub fn remove_tile(&mut self, tile_link: NodeLink) {
        if !tile_link.is_valid() {
            return;
        }
        debug_assert_eq!(tile_link.layer_idx(), self.config().tile_layer_idx());

        self.begin_batch();

        self.mark_neighbors_dirty(tile_link);

        // If the tile being removed is itself pending a refresh, drop the
        // entry rather than trying to update a dead tile.
        self.dirty_nodes.remove(&tile_link);

        self.octree.release_tile(tile_link.tile_id);

        self.end_batch();
    }

    pub fn remove_tile_at_coord(&mut self, coord: IVec3) {
        if self.has_tile_at_coord(coord) {
            let tile_link = self.tile_link_at_coord(coord);
            self.remove_tile(tile_link);
        }
    }

    /// Removes every tile whose coord is present in `source`. The configs
    /// must be compatible.
    pub fn remove_matching_tiles(&mut self, source: &SparseVoxelOctree) {
        if !self.config().is_compatible_with(source.config()) {
            return;
        }

        self.begin_batch();
        let coords: Vec<IVec3> = source.tiles().map(|tile| tile.coord()).collect();
        for coord in coords {
            self.remove_tile_at_coord(coord);
        }
        self.end_batch();
    }

    /// Marks the faces of `link`'s neighbors that point back at it dirty.
    ///
    /// Only same-layer neighbors matter: lower resolution neighbors cannot
    /// link to us (they would be linking to a smaller node), and higher
    /// resolution neighbors do not exist by construction.
    fn mark_neighbors_dirty(&mut self, link: NodeLink) {
        let mut dirty: Vec<(NodeLink, NeighborFlags)> = Vec::new();

        for entry in NeighborIter::new(&self.octree, link) {
            debug_assert!(entry.link.layer_idx() >= link.layer_idx());

            if entry.link.layer_idx() == link.layer_idx() {
                let mut flags = NeighborFlags::default();
                flags.set(entry.neighbor.opposite());
                dirty.push((entry.link, flags));
            }
        }

        for (neighbor_link, flags) in dirty {
            self.dirty_nodes
                .entry(neighbor_link)
                .or_default()
                .bits |= flags.bits;
        }
    }

    /// Runs when the last batch closes: re-links the dirty faces of every
    /// dirty node, and of every child touching those faces.
    ///
    /// Nodes are processed from the highest layer down. Child linking
    /// consults the parent's neighbor links, so parents must be fully
    /// linked before any of their children.
    fn finalize_nodes(&mut self) {
        if self.dirty_nodes.is_empty() {
            return;
        }

        let mut dirty: Vec<(NodeLink, NeighborFlags)> = self.dirty_nodes.drain().collect();
        dirty.sort_by(|a, b| b.0.layer_idx().cmp(&a.0.layer_idx()));

        for (node_link, flags) in dirty {
            debug_assert!(flags.any());

            for neighbor in volant_core::neighbor::Neighbor::ALL {
                if flags.is_set(neighbor) {
                    self.octree
                        .link_neighbor_for_node_hierarchically(node_link, neighbor);
                }
            }
        }

        #[cfg(feature = "verify_nodes")]
        self.octree.verify_node_data(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LEAF_LAYER;
    use crate::node::NodeState;

    use glam::Vec3;
    use volant_core::neighbor::Neighbor;

    fn test_config() -> SvoConfig {
        SvoConfig::new(Vec3::ZERO, 25.0, 32, 2)
    }

    /// Builds a standalone tile whose first leaf has one blocked voxel, the
    /// way the generator would emit it.
    fn partial_tile(config: &SvoConfig, coord: IVec3) -> SvoTile {
        let tile_id = crate::tile::tile_id_for_coord(coord);
        let mut tile = SvoTile::new(tile_id, config.tile_layer_idx(), coord);
        tile.allocate_nodes(config.num_nodes_per_tile(), config.tile_layer_idx());

        tile.node_info_mut().set_state(NodeState::PartiallyBlocked);

        // Tile children: node 0 partially blocked, the rest open.
        for i in 0..8 {
            let (node, _) = tile.ensure_node(1, i).unwrap();
            node.set_state(if i == 0 {
                NodeState::PartiallyBlocked
            } else {
                NodeState::Open
            });
        }

        // Node 0's leaves: leaf 0 has a single blocked voxel.
        for i in 0..8 {
            let (leaf, _) = tile.ensure_node(LEAF_LAYER, i).unwrap();
            if i == 0 {
                leaf.set_voxel_blocked(0);
            }
        }

        tile.trim_excess_nodes();
        tile.link_internal_neighbors();
        tile
    }

    #[test]
    fn assume_tile_links_both_sides() {
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        let mut a = partial_tile(&config, IVec3::ZERO);
        let mut b = partial_tile(&config, IVec3::new(1, 0, 0));

        svo.begin_batch();
        svo.assume_tile(&mut a, true);
        svo.assume_tile(&mut b, true);
        svo.end_batch();

        assert!(svo.are_nodes_finalized());

        // Tiles link to each other.
        let tile_a = svo.tile_at_coord(IVec3::ZERO).unwrap();
        let tile_b = svo.tile_at_coord(IVec3::new(1, 0, 0)).unwrap();
        assert_eq!(tile_a.neighbor_link(Neighbor::Front), tile_b.self_link());
        assert_eq!(tile_b.neighbor_link(Neighbor::Back), tile_a.self_link());

        // Full reciprocity holds across the whole octree.
        svo.verify_node_data(true);
    }

    #[test]
    fn remove_tile_invalidates_neighbor_links() {
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        let mut a = partial_tile(&config, IVec3::ZERO);
        let mut b = partial_tile(&config, IVec3::new(1, 0, 0));

        svo.begin_batch();
        svo.assume_tile(&mut a, true);
        svo.assume_tile(&mut b, true);
        svo.end_batch();

        svo.remove_tile_at_coord(IVec3::new(1, 0, 0));

        assert!(svo.tile_at_coord(IVec3::new(1, 0, 0)).is_none());

        let tile_a = svo.tile_at_coord(IVec3::ZERO).unwrap();
        assert!(!tile_a.neighbor_link(Neighbor::Front).is_valid());

        svo.verify_node_data(true);
    }

    #[test]
    fn batch_defers_finalization() {
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        let mut a = partial_tile(&config, IVec3::ZERO);
        let mut b = partial_tile(&config, IVec3::new(1, 0, 0));

        svo.begin_batch();
        svo.begin_batch();
        svo.assume_tile(&mut a, true);
        svo.assume_tile(&mut b, true);
        svo.end_batch();
        assert!(svo.is_batch_editing());
        assert!(!svo.are_nodes_finalized());

        svo.end_batch();
        assert!(!svo.is_batch_editing());
        assert!(svo.are_nodes_finalized());
    }

    #[test]
    fn copy_preserves_source(){
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        let tile = partial_tile(&config, IVec3::ZERO);
        svo.copy_tile(&tile, false);

        assert!(tile.has_nodes_allocated());
        assert!(svo.tile_at_coord(IVec3::ZERO).unwrap().has_nodes_allocated());
        svo.verify_node_data(true);
    }
}
