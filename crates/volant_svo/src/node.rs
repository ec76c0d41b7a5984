use crate::link::{NodeLink, NodeLinkBase};
use crate::octree::SparseVoxelOctree;
use crate::tile::{tile_id_for_coord, SvoTile};

use volant_core::neighbor::Neighbor;

/// Occupancy of a region of space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum NodeState {
    /// Nothing blocked inside: this is the highest resolution node for the
    /// region and it has no children.
    Open = 0,
    /// Some of the space is blocked; recurse into the children (or voxels)
    /// to find out which.
    PartiallyBlocked = 1,
    /// Completely filled with collision; no children.
    Blocked = 2,
}

const DATA_TILE_BIT: u64 = 1;
const DATA_STATE_SHIFT: u64 = 8;

/// A region of space in the collision octree. Non-leaf nodes subdivide into
/// 8 higher resolution children (unless uniformly open or blocked); leaves
/// subdivide into 64 voxels packed into a single bit mask.
///
/// Sized to exactly one cache line; the reserved bytes keep room for future
/// per-node data without changing the wire format.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct SvoNode {
    self_link: NodeLink,
    neighbor_links: [NodeLinkBase; 6],
    reserved: [u8; 24],
    // Leaf nodes: the 64-voxel blocked mask (bit set = blocked, linear
    // x + 4y + 16z order). Non-leaf nodes: packed `is_tile` and state.
    data: u64,
}

const _: () = assert!(std::mem::size_of::<SvoNode>() == 64);
const _: () = assert!(std::mem::size_of::<NodeLink>() == 8);

impl Default for SvoNode {
    #[inline]
    fn default() -> Self {
        Self {
            self_link: NodeLink::INVALID,
            neighbor_links: [NodeLinkBase::INVALID; 6],
            reserved: [0; 24],
            data: 0,
        }
    }
}

impl SvoNode {
    /// Whether this node is currently in use by the octree.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.self_link.is_valid()
    }

    #[inline]
    pub fn self_link(&self) -> NodeLink {
        self.self_link
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.self_link.is_leaf()
    }

    #[inline]
    pub fn is_tile(&self) -> bool {
        !self.is_leaf() && (self.data & DATA_TILE_BIT) != 0
    }

    /// The parent link, or invalid for tiles (tiles have no parent).
    #[inline]
    pub fn parent_link(&self) -> NodeLink {
        if self.self_link.is_valid() && (self.is_leaf() || !self.is_tile()) {
            self.self_link.parent()
        } else {
            NodeLink::INVALID
        }
    }

    /// Leaf states are derived from the voxel mask; non-leaf states are
    /// stored explicitly.
    #[inline]
    pub fn state(&self) -> NodeState {
        if self.is_leaf() {
            match self.data {
                0 => NodeState::Open,
                u64::MAX => NodeState::Blocked,
                _ => NodeState::PartiallyBlocked,
            }
        } else {
            match (self.data >> DATA_STATE_SHIFT) as u8 {
                0 => NodeState::Open,
                2 => NodeState::Blocked,
                _ => NodeState::PartiallyBlocked,
            }
        }
    }

    #[inline]
    pub fn set_state(&mut self, state: NodeState) {
        debug_assert!(!self.is_leaf());
        self.data = (self.data & DATA_TILE_BIT) | ((state as u64) << DATA_STATE_SHIFT);
    }

    /// Leaves never report children; their subdivision is the voxel mask.
    #[inline]
    pub fn has_children(&self) -> bool {
        !self.is_leaf() && self.state() == NodeState::PartiallyBlocked
    }

    #[inline]
    pub fn child_link(&self, child_index: u8) -> NodeLink {
        debug_assert!(self.has_children() && child_index < 8);
        self.self_link.child(child_index)
    }

    #[inline]
    pub fn is_voxel_blocked(&self, voxel_idx: u8) -> bool {
        debug_assert!(self.is_leaf() && voxel_idx < 64);
        (self.data & (1u64 << voxel_idx)) != 0
    }

    #[inline]
    pub fn set_voxel_blocked(&mut self, voxel_idx: u8) {
        debug_assert!(self.is_leaf() && voxel_idx < 64);
        self.data |= 1u64 << voxel_idx;
    }

    #[inline]
    pub fn set_voxel_open(&mut self, voxel_idx: u8) {
        debug_assert!(self.is_leaf() && voxel_idx < 64);
        self.data &= !(1u64 << voxel_idx);
    }

    #[inline]
    pub fn clear_voxels(&mut self) {
        debug_assert!(self.is_leaf());
        self.data = 0;
    }

    #[inline]
    pub fn voxel_mask(&self) -> u64 {
        debug_assert!(self.is_leaf());
        self.data
    }

    #[inline]
    pub fn set_voxel_mask(&mut self, mask: u64) {
        debug_assert!(self.is_leaf());
        self.data = mask;
    }

    /// Initializes a node for use in the octree. The link must be valid.
    #[inline]
    pub fn init(&mut self, self_link: NodeLink, is_tile: bool) {
        debug_assert!(self_link.is_valid());
        self.self_link = self_link;
        if !self.is_leaf() {
            self.data = if is_tile { DATA_TILE_BIT } else { 0 };
        } else {
            self.data = 0;
        }
    }

    /// Returns the node to its pooled, inactive state.
    #[inline]
    pub fn reset(&mut self) {
        self.self_link = NodeLink::INVALID;
        self.neighbor_links = [NodeLinkBase::INVALID; 6];
        self.data = 0;
    }

    /// The raw per-face link base. Use [`Self::neighbor_link`] to expand it
    /// into a full link.
    #[inline]
    pub fn neighbor_base(&self, neighbor: Neighbor) -> NodeLinkBase {
        self.neighbor_links[neighbor.index()]
    }

    /// Stores a neighbor link in compact form: the user-data bits record
    /// whether the neighbor shares our tile (`Self_`) or lies across the
    /// given face, which is all that is needed to reconstruct its tile id.
    #[inline]
    pub fn set_neighbor_link(&mut self, neighbor: Neighbor, link: NodeLink) {
        debug_assert!(neighbor != Neighbor::Self_);

        let user_data = if link.tile_id == self.self_link.tile_id {
            Neighbor::Self_ as u8
        } else {
            neighbor as u8
        };
        self.neighbor_links[neighbor.index()] = link.base.with_user_data(user_data);
    }

    /// Expands the compact neighbor base into a full link, resolving the
    /// neighbor's tile id through the owning tile's coord. A node can have a
    /// lower resolution neighbor but never a higher resolution one (it links
    /// to the covering node in that case).
    pub fn neighbor_link(&self, parent_tile: &SvoTile, neighbor: Neighbor) -> NodeLink {
        debug_assert!(neighbor != Neighbor::Self_);

        let base = self.neighbor_links[neighbor.index()];
        if !base.is_valid() {
            return NodeLink::INVALID;
        }

        let tile_id = if base.user_data() == Neighbor::Self_ as u8 {
            parent_tile.id()
        } else {
            debug_assert_eq!(base.user_data(), neighbor as u8);
            tile_id_for_coord(parent_tile.coord() + neighbor.direction())
        };

        NodeLink::from_base(tile_id, base.with_user_data(0))
    }

    /// As [`Self::neighbor_link`], resolving the owning tile first.
    pub fn neighbor_link_in(&self, octree: &SparseVoxelOctree, neighbor: Neighbor) -> NodeLink {
        match octree.tile(self.self_link.tile_id) {
            Some(tile) => self.neighbor_link(tile, neighbor),
            None => NodeLink::INVALID,
        }
    }

    pub(crate) fn neighbor_links_mut(&mut self) -> &mut [NodeLinkBase; 6] {
        &mut self.neighbor_links
    }

    pub(crate) fn data(&self) -> u64 {
        self.data
    }

    pub(crate) fn set_data(&mut self, data: u64) {
        self.data = data;
    }

    pub(crate) fn set_self_link(&mut self, link: NodeLink) {
        self.self_link = link;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LEAF_LAYER;

    use glam::IVec3;

    #[test]
    fn leaf_state_derives_from_mask() {
        let mut node = SvoNode::default();
        node.init(NodeLink::new(0, LEAF_LAYER, 0), false);

        assert_eq!(node.state(), NodeState::Open);

        node.set_voxel_blocked(17);
        assert!(node.is_voxel_blocked(17));
        assert_eq!(node.state(), NodeState::PartiallyBlocked);

        node.set_voxel_mask(u64::MAX);
        assert_eq!(node.state(), NodeState::Blocked);

        node.set_voxel_open(63);
        assert_eq!(node.state(), NodeState::PartiallyBlocked);

        node.clear_voxels();
        assert_eq!(node.state(), NodeState::Open);
    }

    #[test]
    fn non_leaf_state_is_explicit() {
        let mut node = SvoNode::default();
        node.init(NodeLink::new(0, 2, 5), false);

        assert_eq!(node.state(), NodeState::Open);
        assert!(!node.has_children());

        node.set_state(NodeState::PartiallyBlocked);
        assert!(node.has_children());

        node.set_state(NodeState::Blocked);
        assert!(!node.has_children());
    }

    #[test]
    fn tiles_have_no_parent() {
        let mut tile_node = SvoNode::default();
        tile_node.init(NodeLink::new(9, 3, 0), true);
        assert!(tile_node.is_tile());
        assert!(!tile_node.parent_link().is_valid());

        let mut node = SvoNode::default();
        node.init(NodeLink::new(9, 2, 5), false);
        assert_eq!(node.parent_link(), NodeLink::new(9, 3, 0));
    }

    #[test]
    fn neighbor_base_same_tile_and_cross_tile() {
        let tile = SvoTile::new(tile_id_for_coord(IVec3::ZERO), 2, IVec3::ZERO);

        let mut node = SvoNode::default();
        node.init(NodeLink::new(tile.id(), 1, 3), false);

        // Same-tile neighbor.
        let sibling = NodeLink::new(tile.id(), 1, 2);
        node.set_neighbor_link(Neighbor::Left, sibling);
        assert_eq!(
            node.neighbor_base(Neighbor::Left).user_data(),
            Neighbor::Self_ as u8
        );
        assert_eq!(node.neighbor_link(&tile, Neighbor::Left), sibling);

        // Cross-tile neighbor: the stored base only keeps the direction; the
        // tile id comes back from the coord table.
        let front_tile_id = tile_id_for_coord(IVec3::new(1, 0, 0));
        let across = NodeLink::new(front_tile_id, 1, 2);
        node.set_neighbor_link(Neighbor::Front, across);
        assert_eq!(
            node.neighbor_base(Neighbor::Front).user_data(),
            Neighbor::Front as u8
        );
        assert_eq!(node.neighbor_link(&tile, Neighbor::Front), across);

        // Unset faces expand to invalid.
        assert!(!node.neighbor_link(&tile, Neighbor::Top).is_valid());
    }
}
