use std::fmt;
use std::hash::{Hash, Hasher};

/// ID of the leaf layer.
pub const LEAF_LAYER: u8 = 0;
/// Maximum number of layers per tile (8^6 = 262,144 total leaf slots).
pub const MAX_LAYERS: u8 = 6;
/// Maximum node index within a layer (8^6).
pub const MAX_NODES: u32 = 262_144;
/// Maximum node coordinate component within a tile (64 per axis at the leaf
/// layer).
pub const MAX_NODE_COORD: i32 = 63;

/// Voxel field value meaning "the whole node, not a specific voxel".
pub const NO_VOXEL: u8 = 0x7F;

pub const INVALID_NODE_ID: u32 = u32::MAX;
pub const INVALID_LINK_ID: u64 = u64::MAX;

const LAYER_BITS: u32 = 3;
const NODE_BITS: u32 = 18;
const VOXEL_BITS: u32 = 7;

const LAYER_SHIFT: u32 = 0;
const NODE_SHIFT: u32 = LAYER_BITS;
const VOXEL_SHIFT: u32 = LAYER_BITS + NODE_BITS;
const USERDATA_SHIFT: u32 = LAYER_BITS + NODE_BITS + VOXEL_BITS;

const LAYER_MASK: u32 = (1 << LAYER_BITS) - 1;
const NODE_MASK: u32 = (1 << NODE_BITS) - 1;
const VOXEL_MASK: u32 = (1 << VOXEL_BITS) - 1;

/// Masks out the user data of a node id or link id.
pub const NODE_USERDATA_MASK: u32 = 0xF000_0000;
/// Masks out the voxel field of a link id.
pub const LINK_VOXEL_MASK: u64 = 0x0000_0000_0FE0_0000;
/// Masks out the user data of a link id.
pub const LINK_USERDATA_MASK: u64 = NODE_USERDATA_MASK as u64;

/// The node-side fields of a link: layer, node index, voxel index, and four
/// user-data bits, packed in 32 bits. Stored per-face on every node; the
/// tile id is reconstructed at read time (see [`crate::node::SvoNode`]).
///
/// Explicit shift/mask accessors, never compiler bitfields: the packing is
/// part of the wire format and must stay endian-stable.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct NodeLinkBase(pub u32);

impl NodeLinkBase {
    pub const INVALID: Self = Self(INVALID_NODE_ID);

    #[inline]
    pub fn new(layer_idx: u8, node_idx: u32, voxel_idx: u8) -> Self {
        debug_assert!(layer_idx < MAX_LAYERS);
        debug_assert!(node_idx < MAX_NODES);
        debug_assert!(voxel_idx < 64 || voxel_idx == NO_VOXEL);

        Self(
            ((layer_idx as u32 & LAYER_MASK) << LAYER_SHIFT)
                | ((node_idx & NODE_MASK) << NODE_SHIFT)
                | ((voxel_idx as u32 & VOXEL_MASK) << VOXEL_SHIFT),
        )
    }

    #[inline]
    pub fn layer_idx(self) -> u8 {
        ((self.0 >> LAYER_SHIFT) & LAYER_MASK) as u8
    }

    #[inline]
    pub fn node_idx(self) -> u32 {
        (self.0 >> NODE_SHIFT) & NODE_MASK
    }

    #[inline]
    pub fn voxel_idx(self) -> u8 {
        ((self.0 >> VOXEL_SHIFT) & VOXEL_MASK) as u8
    }

    #[inline]
    pub fn user_data(self) -> u8 {
        (self.0 >> USERDATA_SHIFT) as u8
    }

    #[inline]
    pub fn with_user_data(self, user_data: u8) -> Self {
        Self((self.0 & !NODE_USERDATA_MASK) | ((user_data as u32) << USERDATA_SHIFT))
    }

    #[inline]
    pub fn with_voxel_idx(self, voxel_idx: u8) -> Self {
        debug_assert!(voxel_idx < 64 || voxel_idx == NO_VOXEL);
        Self((self.0 & !(VOXEL_MASK << VOXEL_SHIFT)) | ((voxel_idx as u32 & VOXEL_MASK) << VOXEL_SHIFT))
    }

    /// Whether the link contains valid data, ignoring any user data.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.layer_idx() < MAX_LAYERS
            && self.node_idx() < MAX_NODES
            && (self.voxel_idx() < 64 || self.voxel_idx() == NO_VOXEL)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.layer_idx() == LEAF_LAYER
    }

    #[inline]
    pub fn is_voxel(self) -> bool {
        self.is_leaf() && self.voxel_idx() != NO_VOXEL
    }
}

impl Default for NodeLinkBase {
    #[inline]
    fn default() -> Self {
        Self::INVALID
    }
}

/// Names any addressable entity in the octree: a tile, a node within a
/// tile's layer, or a single voxel of a leaf.
///
/// The *identity* of a link is its 64-bit value with the user-data bits
/// forced set, so two links are equal iff tile, layer, node, and voxel all
/// match; user data is carried but never part of comparisons.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct NodeLink {
    pub tile_id: u32,
    pub base: NodeLinkBase,
}

impl NodeLink {
    pub const INVALID: Self = Self {
        tile_id: u32::MAX,
        base: NodeLinkBase::INVALID,
    };

    #[inline]
    pub fn new(tile_id: u32, layer_idx: u8, node_idx: u32) -> Self {
        Self {
            tile_id,
            base: NodeLinkBase::new(layer_idx, node_idx, NO_VOXEL),
        }
    }

    #[inline]
    pub fn new_voxel(tile_id: u32, layer_idx: u8, node_idx: u32, voxel_idx: u8) -> Self {
        Self {
            tile_id,
            base: NodeLinkBase::new(layer_idx, node_idx, voxel_idx),
        }
    }

    #[inline]
    pub fn from_base(tile_id: u32, base: NodeLinkBase) -> Self {
        Self { tile_id, base }
    }

    /// The unique 64-bit id for this link, ignoring any user data.
    #[inline]
    pub fn id(self) -> u64 {
        ((self.tile_id as u64) << 32) | (self.base.0 | NODE_USERDATA_MASK) as u64
    }

    #[inline]
    pub fn from_id(id: u64) -> Self {
        Self {
            tile_id: (id >> 32) as u32,
            base: NodeLinkBase(id as u32),
        }
    }

    #[inline]
    pub fn layer_idx(self) -> u8 {
        self.base.layer_idx()
    }

    #[inline]
    pub fn node_idx(self) -> u32 {
        self.base.node_idx()
    }

    #[inline]
    pub fn voxel_idx(self) -> u8 {
        self.base.voxel_idx()
    }

    #[inline]
    pub fn set_voxel_idx(&mut self, voxel_idx: u8) {
        self.base = self.base.with_voxel_idx(voxel_idx);
    }

    #[inline]
    pub fn with_voxel_idx(self, voxel_idx: u8) -> Self {
        Self {
            tile_id: self.tile_id,
            base: self.base.with_voxel_idx(voxel_idx),
        }
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.base.is_valid()
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.base.is_leaf()
    }

    #[inline]
    pub fn is_voxel(self) -> bool {
        self.base.is_voxel()
    }

    /// The parent link. This does not know what the tile layer is, so
    /// calling it with a tile link produces an invalid link.
    #[inline]
    pub fn parent(self) -> Self {
        if self.is_valid() {
            Self::new(self.tile_id, self.layer_idx() + 1, self.node_idx() >> 3)
        } else {
            Self::INVALID
        }
    }

    #[inline]
    pub fn child(self, child_index: u8) -> Self {
        debug_assert!(self.layer_idx() > 0 && child_index < 8);
        if self.is_valid() {
            Self::new(
                self.tile_id,
                self.layer_idx() - 1,
                (self.node_idx() << 3) + child_index as u32,
            )
        } else {
            Self::INVALID
        }
    }
}

impl Default for NodeLink {
    #[inline]
    fn default() -> Self {
        Self::INVALID
    }
}

impl PartialEq for NodeLink {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NodeLink {}

impl Hash for NodeLink {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "NodeLink(invalid)");
        }
        write!(
            f,
            "NodeLink(tile={:08x} layer={} node={} voxel={})",
            self.tile_id,
            self.layer_idx(),
            self.node_idx(),
            self.voxel_idx(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;

    #[test]
    fn field_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let tile_id: u32 = rng.gen();
            let layer = rng.gen_range(0..MAX_LAYERS);
            let node = rng.gen_range(0..MAX_NODES);
            let voxel = if rng.gen() { rng.gen_range(0..64) } else { NO_VOXEL };

            let link = NodeLink::new_voxel(tile_id, layer, node, voxel);
            assert!(link.is_valid());
            assert_eq!(link.tile_id, tile_id);
            assert_eq!(link.layer_idx(), layer);
            assert_eq!(link.node_idx(), node);
            assert_eq!(link.voxel_idx(), voxel);

            assert_eq!(NodeLink::from_id(link.id()), link);
        }
    }

    #[test]
    fn identity_ignores_user_data() {
        let link = NodeLink::new(7, 2, 13);
        let mut tagged = link;
        tagged.base = tagged.base.with_user_data(0xA);

        assert_eq!(link, tagged);
        assert_eq!(link.id(), tagged.id());
    }

    #[test]
    fn invalid_is_all_ones() {
        assert_eq!(NodeLink::INVALID.id(), INVALID_LINK_ID);
        assert!(!NodeLink::INVALID.is_valid());
    }

    #[test]
    fn parent_child_arithmetic() {
        let link = NodeLink::new(1, 2, 0b101_011);
        for i in 0..8 {
            let child = link.child(i);
            assert_eq!(child.layer_idx(), 1);
            assert_eq!(child.node_idx(), (0b101_011 << 3) + i as u32);
            assert_eq!(child.parent(), link);
        }
    }

    #[test]
    fn voxel_links() {
        let leaf = NodeLink::new(3, LEAF_LAYER, 9);
        assert!(leaf.is_leaf() && !leaf.is_voxel());

        let voxel = leaf.with_voxel_idx(42);
        assert!(voxel.is_voxel());
        assert_ne!(leaf, voxel);

        // The parent of a voxel link is the leaf's parent, not the leaf.
        assert_eq!(voxel.parent(), NodeLink::new(3, 1, 1));
    }
}
