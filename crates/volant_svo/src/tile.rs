use crate::link::{NodeLink, LEAF_LAYER};
use crate::node::{NodeState, SvoNode};
use crate::octree::SparseVoxelOctree;

use volant_core::neighbor::{self, Neighbor};

use fnv::FnvHasher;
use glam::IVec3;
use std::hash::{Hash, Hasher};

/// Stable hash of a tile coord, used as the tile's id. Part of the wire
/// format, so it must not depend on `RandomState`-style seeding.
#[inline]
pub fn tile_id_for_coord(coord: IVec3) -> u32 {
    let mut hasher = FnvHasher::default();
    coord.x.hash(&mut hasher);
    coord.y.hash(&mut hasher);
    coord.z.hash(&mut hasher);
    let h = hasher.finish();
    (h as u32) ^ ((h >> 32) as u32)
}

/// One layer's slice of the tile's node pool.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SvoLayer {
    pub start_node: u32,
    pub num_nodes: u32,
    pub max_nodes: u32,
}

/// A tile is the top level node of the octree. The navigable space is
/// partitioned into a sparse 3D grid of tiles.
///
/// Nodes live in a dense pool partitioned into layers, the tile's immediate
/// children first, leaves last. Within a layer, nodes are addressed by their
/// Morton index; inactive slots simply hold an invalid self link.
#[derive(Clone)]
pub struct SvoTile {
    // Basic node info about this tile.
    node_info: SvoNode,

    // Coordinate of the tile relative to the seed location.
    coord: IVec3,

    node_pool: Vec<SvoNode>,
    layers: Vec<SvoLayer>,
}

impl SvoTile {
    pub fn new(tile_id: u32, tile_layer_idx: u8, coord: IVec3) -> Self {
        let mut node_info = SvoNode::default();
        node_info.init(NodeLink::new(tile_id, tile_layer_idx, 0), true);

        Self {
            node_info,
            coord,
            node_pool: Vec::new(),
            layers: Vec::new(),
        }
    }

    /// Preallocates the full node pool and carves it into `num_layers`
    /// layers: the slice for layer `num_layers - 1` comes first and holds 8
    /// slots, down to layer 0 holding `8^num_layers`.
    pub fn allocate_nodes(&mut self, num_nodes: u32, num_layers: u8) {
        self.node_pool.clear();
        self.layers.clear();

        if num_nodes == 0 {
            return;
        }

        self.node_pool.resize(num_nodes as usize, SvoNode::default());
        self.layers.resize(num_layers as usize, SvoLayer::default());

        let top_layer_idx = num_layers as usize - 1;
        let mut node_start_idx = 0;

        for i in 0..num_layers as usize {
            let layer = &mut self.layers[top_layer_idx - i];
            layer.start_node = node_start_idx;
            layer.max_nodes = 8u32.pow(i as u32 + 1);
            node_start_idx += layer.max_nodes;
        }

        debug_assert!(node_start_idx <= num_nodes);
    }

    pub fn release_memory(&mut self) {
        self.node_pool = Vec::new();
        self.layers = Vec::new();
    }

    /// Drops the trailing inactive slots of every layer and shrinks the
    /// pool. Lookups are index based and layers are contiguous, so unused
    /// tail slots can be released as long as the starts of the layers after
    /// them shift down to match. Only call once the tile is read-only.
    pub fn trim_excess_nodes(&mut self) {
        // A uniformly open or blocked tile needs no nodes at all.
        if self.node_info.state() != NodeState::PartiallyBlocked {
            self.release_memory();
            return;
        }

        // Pool order: highest layer first.
        for i in (0..self.layers.len()).rev() {
            let layer = self.layers[i];
            let layer_start = layer.start_node as usize;
            let layer_end = (layer.start_node + layer.max_nodes) as usize;

            let num_to_remove = self.node_pool[layer_start..layer_end]
                .iter()
                .rev()
                .take_while(|node| !node.is_active())
                .count();

            if num_to_remove == 0 {
                continue;
            }

            self.node_pool.drain(layer_end - num_to_remove..layer_end);
            self.layers[i].max_nodes -= num_to_remove as u32;
            debug_assert!(self.layers[i].num_nodes <= self.layers[i].max_nodes);

            // Layers after this slice in the pool start lower now.
            for j in 0..i {
                self.layers[j].start_node -= num_to_remove as u32;
            }
        }

        self.node_pool.shrink_to_fit();
    }

    /// Deep clone of another tile's data.
    pub fn copy_from(&mut self, source: &SvoTile) {
        self.node_info = source.node_info;
        self.coord = source.coord;
        self.node_pool = source.node_pool.clone();
        self.layers = source.layers.clone();
    }

    /// Takes over another tile's data, leaving it empty.
    pub fn assume_from(&mut self, source: &mut SvoTile) {
        self.release_memory();

        self.node_info = source.node_info;
        self.coord = source.coord;
        self.node_pool = std::mem::take(&mut source.node_pool);
        self.layers = std::mem::take(&mut source.layers);

        if self.node_pool.is_empty() && self.node_info.state() == NodeState::PartiallyBlocked {
            self.node_info.set_state(NodeState::Open);
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.node_info.self_link().tile_id
    }

    #[inline]
    pub fn self_link(&self) -> NodeLink {
        self.node_info.self_link()
    }

    #[inline]
    pub fn node_info(&self) -> &SvoNode {
        &self.node_info
    }

    #[inline]
    pub fn node_info_mut(&mut self) -> &mut SvoNode {
        &mut self.node_info
    }

    /// Coordinate relative to the seed location this tile was generated at.
    #[inline]
    pub fn coord(&self) -> IVec3 {
        self.coord
    }

    #[inline]
    pub fn has_nodes_allocated(&self) -> bool {
        !self.node_pool.is_empty()
    }

    /// Number of active nodes in a layer.
    pub fn num_nodes(&self, layer_idx: u8) -> u32 {
        self.layers
            .get(layer_idx as usize)
            .map_or(0, |layer| layer.num_nodes)
    }

    /// Number of allocated slots in a layer (not the same as the number of
    /// active nodes).
    pub fn max_nodes(&self, layer_idx: u8) -> u32 {
        self.layers
            .get(layer_idx as usize)
            .map_or(0, |layer| layer.max_nodes)
    }

    pub fn get_node(&self, layer_idx: u8, node_idx: u32, active_only: bool) -> Option<&SvoNode> {
        if let Some(layer) = self.layers.get(layer_idx as usize) {
            if node_idx < layer.max_nodes {
                let node = &self.node_pool[(layer.start_node + node_idx) as usize];
                if !active_only || node.is_active() {
                    return Some(node);
                }
            }
        } else if layer_idx == self.node_info.self_link().layer_idx() {
            // The tile layer was requested; the tile is its own node.
            debug_assert_eq!(node_idx, 0);
            return Some(&self.node_info);
        }

        None
    }

    pub fn get_node_mut(
        &mut self,
        layer_idx: u8,
        node_idx: u32,
        active_only: bool,
    ) -> Option<&mut SvoNode> {
        if let Some(layer) = self.layers.get(layer_idx as usize) {
            if node_idx < layer.max_nodes {
                let node = &mut self.node_pool[(layer.start_node + node_idx) as usize];
                if !active_only || node.is_active() {
                    return Some(node);
                }
            }
        } else if layer_idx == self.node_info.self_link().layer_idx() {
            debug_assert_eq!(node_idx, 0);
            return Some(&mut self.node_info);
        }

        None
    }

    /// Activates the node slot if it isn't already. Returns the node and
    /// whether it was created by this call.
    pub fn ensure_node(&mut self, layer_idx: u8, node_idx: u32) -> Option<(&mut SvoNode, bool)> {
        let tile_id = self.id();

        if let Some(layer) = self.layers.get_mut(layer_idx as usize) {
            if node_idx < layer.max_nodes {
                let pool_idx = (layer.start_node + node_idx) as usize;
                let node = &mut self.node_pool[pool_idx];

                let mut created = false;
                if !node.is_active() {
                    node.init(NodeLink::new(tile_id, layer_idx, node_idx), false);
                    layer.num_nodes += 1;
                    created = true;
                }

                return Some((node, created));
            }
        }

        None
    }

    /// Deactivates a node, returning its slot to the layer. The caller is
    /// responsible for having detached it from parents and neighbors.
    pub fn release_node(&mut self, layer_idx: u8, node_idx: u32) {
        if let Some(layer) = self.layers.get_mut(layer_idx as usize) {
            if node_idx < layer.max_nodes {
                let node = &mut self.node_pool[(layer.start_node + node_idx) as usize];
                if node.is_active() {
                    node.reset();
                    layer.num_nodes -= 1;
                }
            }
        }
    }

    /// All active nodes of a layer.
    pub fn nodes_for_layer(&self, layer_idx: u8) -> impl Iterator<Item = &SvoNode> {
        let slice = match self.layers.get(layer_idx as usize) {
            Some(layer) if layer.num_nodes > 0 => {
                let start = layer.start_node as usize;
                &self.node_pool[start..start + layer.max_nodes as usize]
            }
            _ => &[],
        };

        slice.iter().filter(|node| node.is_active())
    }

    pub fn neighbor_link(&self, neighbor: Neighbor) -> NodeLink {
        self.node_info.neighbor_link(self, neighbor)
    }

    /// Links every node of a standalone tile to its same-tile neighbors,
    /// from the lowest resolution layer down (child linking consults parent
    /// links). Faces whose neighbor lies outside the tile stay invalid;
    /// those are resolved when the tile is installed into an octree.
    pub fn link_internal_neighbors(&mut self) {
        let tile_layer_idx = self.node_info.self_link().layer_idx();

        for layer_idx in (0..tile_layer_idx).rev() {
            let links: Vec<NodeLink> = self
                .nodes_for_layer(layer_idx)
                .map(|node| node.self_link())
                .collect();

            for link in links {
                for face in Neighbor::ALL {
                    self.link_internal_neighbor(link, face);
                }
            }
        }
    }

    fn link_internal_neighbor(&mut self, node_link: NodeLink, face: Neighbor) {
        let sibling_idx = (node_link.node_idx() % 8) as u8;

        let parent_neighbor_dir = neighbor::child_to_parent_neighbor(sibling_idx, face);
        let neighbor_sibling_idx = neighbor::child_neighbor_slot(sibling_idx, face);

        let mut new_link = NodeLink::INVALID;

        if parent_neighbor_dir == Neighbor::Self_ {
            new_link = NodeLink::new(
                node_link.tile_id,
                node_link.layer_idx(),
                (node_link.node_idx() - sibling_idx as u32) + neighbor_sibling_idx as u32,
            );
        } else {
            let parent_link = node_link.parent();
            if let Some(parent) = self.get_node(parent_link.layer_idx(), parent_link.node_idx(), true)
            {
                let parent_neighbor_link = parent.neighbor_link(self, parent_neighbor_dir);

                // Anything leaving the tile is not ours to resolve here.
                if parent_neighbor_link.is_valid()
                    && parent_neighbor_link.tile_id == self.id()
                {
                    if let Some(parent_neighbor) = self.get_node(
                        parent_neighbor_link.layer_idx(),
                        parent_neighbor_link.node_idx(),
                        true,
                    ) {
                        new_link = if parent_neighbor.has_children() {
                            parent_neighbor.child_link(neighbor_sibling_idx)
                        } else {
                            parent_neighbor_link
                        };
                    }
                }
            }
        }

        if let Some(node) = self.get_node_mut(node_link.layer_idx(), node_link.node_idx(), true) {
            node.set_neighbor_link(face, new_link);
        }
    }

    /// Resets all data for this tile, making it invalid.
    pub fn reset(&mut self) {
        self.node_info.reset();
        self.release_memory();
    }

    pub(crate) fn pool(&self) -> &[SvoNode] {
        &self.node_pool
    }

    pub(crate) fn layers(&self) -> &[SvoLayer] {
        &self.layers
    }

    pub(crate) fn from_parts(
        node_info: SvoNode,
        coord: IVec3,
        node_pool: Vec<SvoNode>,
        layers: Vec<SvoLayer>,
    ) -> Self {
        Self {
            node_info,
            coord,
            node_pool,
            layers,
        }
    }

    /// Structural validation. Passing the octree also verifies links that
    /// cross into other tiles.
    pub fn verify(&self, octree: Option<&SparseVoxelOctree>) {
        assert!(self.node_info.is_active());
        assert!(!self.node_info.parent_link().is_valid());
        assert!(self.node_info.self_link().is_valid());

        if self.node_info.has_children() {
            self.verify_children(&self.node_info, octree);
        }

        for (i, layer) in self.layers.iter().enumerate().rev() {
            assert!((layer.start_node + layer.max_nodes) as usize <= self.node_pool.len());

            // The active-only iterator and the active count must agree.
            let num_active = self.nodes_for_layer(i as u8).count() as u32;
            assert_eq!(num_active, layer.num_nodes);

            if i > 0 {
                let next = &self.layers[i - 1];
                assert_eq!(layer.start_node + layer.max_nodes, next.start_node);
            }
        }
    }

    fn verify_children(&self, node: &SvoNode, octree: Option<&SparseVoxelOctree>) {
        for i in 0..8 {
            let child_link = node.child_link(i);
            assert!(child_link.is_valid());

            let child = self
                .get_node(child_link.layer_idx(), child_link.node_idx(), true)
                .expect("partially blocked node is missing a child");

            assert_eq!(child.self_link(), child_link);

            if !child.is_leaf() || child.is_active() {
                for neighbor in Neighbor::ALL {
                    self.verify_neighbor(child, neighbor, octree);
                }
            }

            if child.has_children() {
                self.verify_children(child, octree);
            }
        }
    }

    /// Checks the reciprocity invariant: our neighbor either links straight
    /// back at us, or the link back lands on one of our ancestors (a larger
    /// low-resolution neighbor covers several smaller nodes on our side).
    fn verify_neighbor(&self, node: &SvoNode, neighbor: Neighbor, octree: Option<&SparseVoxelOctree>) {
        let neighbor_link = node.neighbor_link(self, neighbor);
        if !neighbor_link.is_valid() {
            return;
        }

        let neighbor_tile = if neighbor_link.tile_id == node.self_link().tile_id {
            Some(self)
        } else {
            octree.and_then(|octree| octree.tile(neighbor_link.tile_id))
        };

        let Some(neighbor_tile) = neighbor_tile else {
            return;
        };

        let neighbor_node = neighbor_tile
            .get_node(neighbor_link.layer_idx(), neighbor_link.node_idx(), true)
            .expect("neighbor link points at an inactive node");

        let back_link = neighbor_node.neighbor_link(neighbor_tile, neighbor.opposite());
        assert!(back_link.is_valid());

        if back_link == node.self_link() {
            return;
        }

        // The link back must land in our own tile, on our parent chain.
        assert_eq!(back_link.tile_id, node.self_link().tile_id);

        let mut parent_link = node.parent_link();
        while parent_link.is_valid() {
            if back_link == parent_link {
                return;
            }

            match self.get_node(parent_link.layer_idx(), parent_link.node_idx(), true) {
                Some(parent) => parent_link = parent.parent_link(),
                None => break,
            }
        }

        panic!(
            "neighbor reciprocity violated between {:?} and {:?}",
            node.self_link(),
            neighbor_link
        );
    }
}
