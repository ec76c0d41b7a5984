use crate::link::NodeLink;
use crate::node::{NodeState, SvoNode};
use crate::octree::SparseVoxelOctree;

use volant_core::coords;
use volant_core::neighbor::{self, Neighbor};

/// One adjacent entity of a node, produced by [`NeighborIter`].
pub struct NeighborRef<'a> {
    pub neighbor: Neighbor,
    /// Link to the adjacent entity. For voxel sources this may name a voxel
    /// of the adjacent leaf.
    pub link: NodeLink,
    /// The adjacent node. For a voxel link this is the owning leaf, and the
    /// link selects the voxel within it. It can also be a lower resolution
    /// node when the neighboring region is uniform.
    pub node: &'a SvoNode,
}

/// Walks the (up to six) face-adjacent entities of a node, leaf, or voxel,
/// resolving cross-tile and cross-resolution links on the fly. Faces with
/// nothing on the other side are skipped.
pub struct NeighborIter<'a> {
    octree: &'a SparseVoxelOctree,
    node: Option<&'a SvoNode>,
    node_link: NodeLink,
    face: u8,
}

impl<'a> NeighborIter<'a> {
    pub fn new(octree: &'a SparseVoxelOctree, node_link: NodeLink) -> Self {
        let node = octree.node_from_link(node_link);
        debug_assert!(node.is_some());

        Self {
            octree,
            node,
            node_link,
            face: 0,
        }
    }

    fn neighbor_voxel_coord(&self, neighbor: Neighbor) -> glam::IVec3 {
        coords::voxel_coord_from_index(self.node_link.voxel_idx()) + neighbor.direction()
    }

    fn resolve(&self, neighbor: Neighbor) -> Option<NeighborRef<'a>> {
        let node = self.node?;

        // A voxel whose neighbor is inside the same leaf just needs its
        // index recomputed.
        if self.node_link.is_voxel() {
            let voxel_coord = self.neighbor_voxel_coord(neighbor);
            if coords::is_voxel_coord_valid(voxel_coord) {
                return Some(NeighborRef {
                    neighbor,
                    link: self
                        .node_link
                        .with_voxel_idx(coords::voxel_index_for_coord(voxel_coord)),
                    node,
                });
            }
        }

        // We hit the edge of the node, so follow the owning node's link in
        // the same direction.
        let mut neighbor_link = node.neighbor_link_in(self.octree, neighbor);
        let neighbor_node = self.octree.node_from_link(neighbor_link)?;

        // Moving from a voxel into another leaf: if that leaf is only
        // partially blocked, land on the exact complement voxel. A uniform
        // leaf is already the highest resolution answer.
        if self.node_link.is_voxel()
            && neighbor_link.is_leaf()
            && neighbor_node.state() == NodeState::PartiallyBlocked
        {
            neighbor_link = neighbor_link
                .with_voxel_idx(neighbor::neighbor_voxel(self.node_link.voxel_idx(), neighbor));
        }

        Some(NeighborRef {
            neighbor,
            link: neighbor_link,
            node: neighbor_node,
        })
    }
}

impl<'a> Iterator for NeighborIter<'a> {
    type Item = NeighborRef<'a>;

    fn next(&mut self) -> Option<NeighborRef<'a>> {
        while self.face < 6 {
            let neighbor = Neighbor::from_index(self.face);
            self.face += 1;

            if let Some(entry) = self.resolve(neighbor) {
                return Some(entry);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SvoConfig;
    use crate::editable::EditableSvo;
    use crate::link::LEAF_LAYER;
    use crate::node::NodeState;
    use crate::tile::{tile_id_for_coord, SvoTile};

    use glam::{IVec3, Vec3};

    fn test_config() -> SvoConfig {
        SvoConfig::new(Vec3::ZERO, 25.0, 32, 2)
    }

    /// A tile where every leaf exists and leaf 0 has voxel 0 blocked.
    fn build_octree() -> EditableSvo {
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        let coord = IVec3::ZERO;
        let mut tile = SvoTile::new(tile_id_for_coord(coord), config.tile_layer_idx(), coord);
        tile.allocate_nodes(config.num_nodes_per_tile(), config.tile_layer_idx());
        tile.node_info_mut().set_state(NodeState::PartiallyBlocked);

        for i in 0..8 {
            let (node, _) = tile.ensure_node(1, i).unwrap();
            node.set_state(if i == 0 {
                NodeState::PartiallyBlocked
            } else {
                NodeState::Open
            });
        }
        for i in 0..8 {
            let (leaf, _) = tile.ensure_node(LEAF_LAYER, i).unwrap();
            if i == 0 {
                leaf.set_voxel_blocked(0);
            }
        }
        tile.trim_excess_nodes();
        tile.link_internal_neighbors();

        svo.assume_tile(&mut tile, true);
        svo
    }

    #[test]
    fn voxel_neighbors_inside_leaf() {
        let svo = build_octree();

        // Voxel (1,1,1) of leaf 0: all six neighbors stay inside the leaf.
        let leaf_link = NodeLink::new(tile_id_for_coord(IVec3::ZERO), LEAF_LAYER, 0);
        let voxel_link =
            leaf_link.with_voxel_idx(coords::voxel_index_for_coord(IVec3::new(1, 1, 1)));

        let entries: Vec<_> = NeighborIter::new(&svo, voxel_link).collect();
        assert_eq!(entries.len(), 6);

        for entry in &entries {
            assert!(entry.link.is_voxel());
            let expected =
                coords::voxel_coord_from_index(voxel_link.voxel_idx()) + entry.neighbor.direction();
            assert_eq!(
                coords::voxel_coord_from_index(entry.link.voxel_idx()),
                expected
            );
        }
    }

    #[test]
    fn voxel_neighbors_cross_into_sibling_leaf() {
        let svo = build_octree();

        // Voxel (3,0,0) of leaf 0: the +X neighbor lives in leaf 1. That
        // leaf is fully open, so the leaf itself comes back rather than a
        // voxel of it.
        let leaf_link = NodeLink::new(tile_id_for_coord(IVec3::ZERO), LEAF_LAYER, 0);
        let voxel_link =
            leaf_link.with_voxel_idx(coords::voxel_index_for_coord(IVec3::new(3, 0, 0)));

        let front = NeighborIter::new(&svo, voxel_link)
            .find(|e| e.neighbor == Neighbor::Front)
            .unwrap();

        assert_eq!(front.link.node_idx(), 1);
        assert!(!front.link.is_voxel());
        assert_eq!(front.node.state(), NodeState::Open);
    }

    #[test]
    fn node_neighbors_skip_missing_tiles() {
        let svo = build_octree();

        // The tile has no neighbors, so iterating its own link yields
        // nothing.
        let tile_link = svo.tile_link_at_coord(IVec3::ZERO);
        assert_eq!(NeighborIter::new(&svo, tile_link).count(), 0);

        // An interior layer-1 node has neighbors on the faces that point
        // into the tile, but not on the three faces leaving it.
        let node_link = NodeLink::new(tile_id_for_coord(IVec3::ZERO), 1, 0);
        let entries: Vec<_> = NeighborIter::new(&svo, node_link).collect();
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert!(matches!(
                entry.neighbor,
                Neighbor::Front | Neighbor::Right | Neighbor::Top
            ));
        }
    }
}
