use crate::config::SvoConfig;
use crate::link::{NodeLink, LINK_USERDATA_MASK, LINK_VOXEL_MASK, NO_VOXEL};
use crate::node::{NodeState, SvoNode};
use crate::tile::{tile_id_for_coord, SvoTile};

use volant_core::aabb::Aabb;
use volant_core::coords::{self, CellOffset};
use volant_core::neighbor::{self, Neighbor};

use fnv::FnvHashMap;
use glam::{IVec3, Vec3};
use std::sync::Once;

static TILE_POOL_WARNING: Once = Once::new();

/// A sparse voxel octree: a tile table keyed by hashed tile coord, plus the
/// config all tiles share.
///
/// This is the read-only surface shared by every query. All mutation goes
/// through [`crate::editable::EditableSvo`] so neighbor links can be
/// repaired in batches.
pub struct SparseVoxelOctree {
    pub(crate) config: SvoConfig,
    pub(crate) tiles: FnvHashMap<u32, SvoTile>,
    pub(crate) max_tiles: u32,
}

impl SparseVoxelOctree {
    pub fn new(config: SvoConfig) -> Self {
        let max_tiles = config.tile_pool_size();
        let mut tiles = FnvHashMap::default();
        if max_tiles > 0 {
            tiles.reserve(max_tiles as usize);
        }

        Self {
            config,
            tiles,
            max_tiles,
        }
    }

    /// Destroys all data within the octree.
    pub fn reset(&mut self) {
        self.tiles.clear();
    }

    /// Whether this octree has been generated or not.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.tiles.is_empty()
    }

    #[inline]
    pub fn config(&self) -> &SvoConfig {
        &self.config
    }

    #[inline]
    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    #[inline]
    pub fn tile(&self, tile_id: u32) -> Option<&SvoTile> {
        self.tiles.get(&tile_id)
    }

    #[inline]
    pub fn tile_mut(&mut self, tile_id: u32) -> Option<&mut SvoTile> {
        self.tiles.get_mut(&tile_id)
    }

    #[inline]
    pub fn tile_at_coord(&self, coord: IVec3) -> Option<&SvoTile> {
        self.tile(tile_id_for_coord(coord))
    }

    #[inline]
    pub fn tile_at_location(&self, location: Vec3) -> Option<&SvoTile> {
        self.tile_at_coord(self.config.location_to_tile_coord(location))
    }

    #[inline]
    pub fn tile_for_link(&self, link: NodeLink) -> Option<&SvoTile> {
        self.tile(link.tile_id)
    }

    #[inline]
    pub fn has_tile_at_coord(&self, coord: IVec3) -> bool {
        self.tile_at_coord(coord).is_some()
    }

    pub fn tiles(&self) -> impl Iterator<Item = &SvoTile> {
        self.tiles.values()
    }

    /// Constructs the link a tile at `coord` would have. No lookup: the
    /// link is valid whether or not the tile exists.
    #[inline]
    pub fn tile_link_at_coord(&self, coord: IVec3) -> NodeLink {
        NodeLink::new(tile_id_for_coord(coord), self.config.tile_layer_idx(), 0)
    }

    #[inline]
    pub fn tile_link_at_location(&self, location: Vec3) -> NodeLink {
        self.tile_link_at_coord(self.config.location_to_tile_coord(location))
    }

    #[inline]
    pub fn contains_location(&self, location: Vec3) -> bool {
        self.tile_at_location(location).is_some()
    }

    /// Resolves a link to its node. The voxel field is ignored during
    /// lookup; a voxel link resolves to its leaf.
    pub fn node_from_link(&self, link: NodeLink) -> Option<&SvoNode> {
        if !link.is_valid() {
            return None;
        }

        let tile = self.tile(link.tile_id)?;

        let node = if link.layer_idx() == self.config.tile_layer_idx() {
            Some(tile.node_info())
        } else {
            tile.get_node(link.layer_idx(), link.node_idx(), true)
        };

        if let Some(node) = node {
            debug_assert_eq!(
                node.self_link().id() | LINK_VOXEL_MASK | LINK_USERDATA_MASK,
                link.id() | LINK_VOXEL_MASK | LINK_USERDATA_MASK,
            );
        }

        node
    }

    /// Union of all active tile bounds.
    pub fn bounds(&self) -> Aabb {
        let mut bounds = Aabb::empty();

        for tile in self.tiles.values() {
            let tile_location = self.config.tile_coord_to_location(tile.coord());
            bounds.union_point(tile_location - self.config.tile_extent());
            bounds.union_point(tile_location + self.config.tile_extent());
        }

        bounds
    }

    /// World-space center of the entity a link names.
    pub fn location_for_link(&self, link: NodeLink) -> Option<Vec3> {
        if !link.is_valid() {
            return None;
        }

        let tile = self.tile(link.tile_id)?;

        if link.layer_idx() == self.config.tile_layer_idx() {
            return Some(self.config.tile_coord_to_location(tile.coord()));
        }

        let node = tile.get_node(link.layer_idx(), link.node_idx(), true)?;
        let mut location = self.location_for_node(node, tile);

        if link.is_voxel() {
            location = self.config.voxel_location(link.voxel_idx(), location);
        }

        Some(location)
    }

    pub(crate) fn location_for_node(&self, node: &SvoNode, tile: &SvoTile) -> Vec3 {
        let node_link = node.self_link();

        let tile_location = self.config.tile_coord_to_location(tile.coord());
        let tile_bounds = self.config.tile_bounds_at_location(tile_location);
        let node_size = self.config.resolution_for_link(node_link.with_voxel_idx(NO_VOXEL));

        self.config
            .morton_to_location(tile_bounds.min, node_link.node_idx(), node_size)
    }

    /// World-space bounds of the entity a link names.
    pub fn bounds_for_link(&self, link: NodeLink) -> Option<Aabb> {
        let location = self.location_for_link(link)?;
        let resolution = self.config.resolution_for_link(link);

        Some(Aabb::from_center_and_extent(
            location,
            Vec3::splat(resolution * 0.5),
        ))
    }

    pub fn bounds_for_node(&self, node: &SvoNode) -> Option<Aabb> {
        let tile = self.tile(node.self_link().tile_id)?;
        let location = self.location_for_node(node, tile);
        let resolution = self.config.resolution_for_layer(node.self_link().layer_idx());

        Some(Aabb::from_center_and_extent(
            location,
            Vec3::splat(resolution * 0.5),
        ))
    }

    /// Finds the highest resolution unblocked entity containing `location`:
    /// descends from the containing tile, and at leaves indexes into the
    /// voxel grid. `allow_blocked` returns blocked entities too (mostly for
    /// debugging).
    pub fn link_for_location(&self, location: Vec3, allow_blocked: bool) -> NodeLink {
        if !self.is_valid() {
            return NodeLink::INVALID;
        }

        let tile_link = self.tile_link_at_location(location);
        let Some(tile) = self.tile_for_link(tile_link) else {
            return NodeLink::INVALID;
        };

        let mut cur_link = tile_link;

        while cur_link.is_valid() {
            let cur_node = if cur_link.layer_idx() == self.config.tile_layer_idx() {
                Some(tile.node_info())
            } else {
                tile.get_node(cur_link.layer_idx(), cur_link.node_idx(), true)
            };

            let Some(cur_node) = cur_node else {
                log::warn!("link_for_location: failed to find node for {cur_link:?}");
                return NodeLink::INVALID;
            };

            debug_assert_eq!(cur_node.self_link(), cur_link);

            if cur_link.is_leaf() {
                return match cur_node.state() {
                    NodeState::Open => cur_node.self_link(),
                    NodeState::Blocked => {
                        // Fully blocked leaves have no open voxel to return.
                        if allow_blocked {
                            cur_node.self_link()
                        } else {
                            NodeLink::INVALID
                        }
                    }
                    NodeState::PartiallyBlocked => {
                        // The location is inside this leaf, so the voxel
                        // falls out of the relative coord.
                        let mut voxel_coord = self.relative_child_coord(cur_link, location);

                        // Floating point error can push a component negative
                        // by one; absorb it. The error is never more than a
                        // single cell.
                        if !coords::is_voxel_coord_valid(voxel_coord) {
                            voxel_coord += IVec3::new(
                                (voxel_coord.x < 0) as i32,
                                (voxel_coord.y < 0) as i32,
                                (voxel_coord.z < 0) as i32,
                            );
                            debug_assert!(coords::is_voxel_coord_valid(voxel_coord));
                        }

                        let voxel_idx = coords::voxel_index_for_coord(voxel_coord);

                        if !cur_node.is_voxel_blocked(voxel_idx) || allow_blocked {
                            cur_link.with_voxel_idx(voxel_idx)
                        } else {
                            NodeLink::INVALID
                        }
                    }
                };
            } else if cur_node.state() == NodeState::PartiallyBlocked {
                let child_coord = self.relative_child_coord(cur_link, location);
                let child_extents = IVec3::splat(2);

                if coords::is_coord_valid(child_coord, child_extents) {
                    let child_idx = coords::index_for_coord(child_coord, child_extents);
                    cur_link = cur_node.child_link(child_idx as u8);
                } else {
                    return NodeLink::INVALID;
                }
            } else {
                // No children. If open, this is the highest resolution link
                // for the location.
                return if cur_node.state() == NodeState::Open || allow_blocked {
                    cur_link
                } else {
                    NodeLink::INVALID
                };
            }
        }

        NodeLink::INVALID
    }

    /// The location's coordinate relative to the first child of the node,
    /// in child-resolution cells. May be out of the child grid; callers
    /// handle that.
    pub(crate) fn relative_child_coord(&self, node_link: NodeLink, location: Vec3) -> IVec3 {
        // A voxel link would make "child" meaningless; use its leaf.
        let node_link = node_link.with_voxel_idx(NO_VOXEL);

        let node_location = self
            .location_for_link(node_link)
            .expect("relative_child_coord: unknown link");
        let first_child_location = self.config.first_child_location(
            node_location,
            node_link.layer_idx(),
            CellOffset::Center,
        );

        let child_resolution = self.config.child_resolution_for_layer(node_link.layer_idx());

        let first_child_coord = self.config.location_to_coord(first_child_location, child_resolution);
        let location_coord = self.config.location_to_coord(location, child_resolution);

        location_coord - first_child_coord
    }

    /// Calls `f` for each active tile whose coord lies in `bounds`; stops
    /// early when `f` returns false.
    pub fn tiles_in_bounds(&self, bounds: &Aabb, mut f: impl FnMut(&SvoTile) -> bool) {
        if !self.is_valid() {
            return;
        }

        let (min_coord, max_coord) = coords::coords_for_bounds(
            self.config.seed_location(),
            bounds,
            self.config.tile_resolution(),
        );

        for coord in coords::CoordIter::new(min_coord, max_coord) {
            if let Some(tile) = self.tile_at_coord(coord) {
                if !f(tile) {
                    return;
                }
            }
        }
    }

    /// Coords of all active tiles overlapping any of the given bounds.
    pub fn tile_coords_in_bounds(&self, bounds_list: &[Aabb]) -> Vec<IVec3> {
        let mut out = Vec::new();

        for bounds in bounds_list {
            let (min_coord, max_coord) = coords::coords_for_bounds(
                self.config.seed_location(),
                bounds,
                self.config.tile_resolution(),
            );

            for coord in coords::CoordIter::new(min_coord, max_coord) {
                if self.has_tile_at_coord(coord) {
                    out.push(coord);
                }
            }
        }

        out
    }

    /// Returns the tile at `coord`, creating an empty one if needed. Fails
    /// (with a one-shot warning) when a fixed pool is exhausted.
    pub(crate) fn ensure_tile_at_coord(&mut self, coord: IVec3) -> Option<&mut SvoTile> {
        let tile_id = tile_id_for_coord(coord);

        if !self.tiles.contains_key(&tile_id) {
            if self.tiles.len() as u32 == self.max_tiles {
                if self.config.is_tile_pool_size_fixed() {
                    TILE_POOL_WARNING.call_once(|| {
                        log::warn!("ensure_tile_at_coord: out of tiles; aborting");
                    });
                    return None;
                }

                self.max_tiles += self.config.tile_pool_size();
                self.tiles.reserve(self.config.tile_pool_size() as usize);
            }

            let tile = SvoTile::new(tile_id, self.config.tile_layer_idx(), coord);
            debug_assert!(!tile.node_info().has_children());
            self.tiles.insert(tile_id, tile);
        }

        self.tiles.get_mut(&tile_id)
    }

    pub(crate) fn release_tile(&mut self, tile_id: u32) {
        if let Some(mut tile) = self.tiles.remove(&tile_id) {
            tile.reset();
        }
    }

    /// Links every neighbor of every node, tiles first (so nodes can link
    /// across tile boundaries), then layers from lowest resolution to
    /// highest (child linking consults parent links).
    pub(crate) fn link_neighbors(&mut self) {
        if !self.is_valid() {
            return;
        }

        let tile_links: Vec<NodeLink> = self.tiles.values().map(|t| t.self_link()).collect();
        for link in &tile_links {
            self.link_neighbors_for_node(*link);
        }

        for tile_link in tile_links {
            for layer_idx in (0..self.config.tile_layer_idx()).rev() {
                let node_links: Vec<NodeLink> = self
                    .tile(tile_link.tile_id)
                    .map(|tile| tile.nodes_for_layer(layer_idx).map(|n| n.self_link()).collect())
                    .unwrap_or_default();

                for node_link in node_links {
                    self.link_neighbors_for_node(node_link);
                }
            }
        }
    }

    pub(crate) fn link_neighbors_for_node(&mut self, node_link: NodeLink) {
        for neighbor in Neighbor::ALL {
            self.link_neighbor_for_node(node_link, neighbor);
        }
    }

    /// Computes and stores one face link of one node. Does not update the
    /// neighbor's link back towards this node.
    pub(crate) fn link_neighbor_for_node(&mut self, node_link: NodeLink, neighbor: Neighbor) {
        if node_link.layer_idx() == self.config.tile_layer_idx() {
            // Tiles always link to the tile next to them; there are no
            // lower resolution nodes to worry about.
            let Some(tile) = self.tile(node_link.tile_id) else {
                return;
            };
            let neighbor_tile_coord = tile.coord() + neighbor.direction();
            let neighbor_link = self.tile_link_at_coord(neighbor_tile_coord);

            let new_link = if self.tile_for_link(neighbor_link).is_some() {
                neighbor_link
            } else {
                NodeLink::INVALID
            };

            if let Some(tile) = self.tile_mut(node_link.tile_id) {
                tile.node_info_mut().set_neighbor_link(neighbor, new_link);
            }
            return;
        }

        // Every node has 8 siblings, so the sibling index is just the low
        // Morton bits.
        let sibling_idx = (node_link.node_idx() % 8) as u8;

        // Which parent face holds this node's neighbor, and which child slot
        // over there it is.
        let parent_neighbor_dir = neighbor::child_to_parent_neighbor(sibling_idx, neighbor);
        let neighbor_sibling_idx = neighbor::child_neighbor_slot(sibling_idx, neighbor);

        // Default to invalid; it only stays that way when the node touches a
        // tile face with no tile on the other side.
        let mut new_link = NodeLink::INVALID;

        if parent_neighbor_dir == Neighbor::Self_ {
            // The neighbor is one of our siblings.
            new_link = NodeLink::new(
                node_link.tile_id,
                node_link.layer_idx(),
                (node_link.node_idx() - sibling_idx as u32) + neighbor_sibling_idx as u32,
            );
        } else {
            let parent_link = node_link.parent();
            if let Some(parent_node) = self.node_from_link(parent_link) {
                let parent_neighbor_link = parent_node.neighbor_link_in(self, parent_neighbor_dir);
                if parent_neighbor_link.is_valid() {
                    if let Some(parent_neighbor_node) = self.node_from_link(parent_neighbor_link) {
                        if parent_neighbor_node.has_children() {
                            new_link = parent_neighbor_node.child_link(neighbor_sibling_idx);
                        } else {
                            // A uniform open/blocked region: link to the
                            // covering node itself.
                            new_link = parent_neighbor_link;
                        }
                    }
                }
            }
        }

        if let Some(tile) = self.tile_mut(node_link.tile_id) {
            if let Some(node) = tile.get_node_mut(node_link.layer_idx(), node_link.node_idx(), true) {
                node.set_neighbor_link(neighbor, new_link);
            }
        }
    }

    /// Re-links one face for a node and recursively for every child that
    /// touches that face.
    pub(crate) fn link_neighbor_for_node_hierarchically(
        &mut self,
        node_link: NodeLink,
        neighbor: Neighbor,
    ) {
        let Some(node) = self.node_from_link(node_link) else {
            return;
        };
        if !node.is_active() {
            return;
        }

        self.link_neighbor_for_node(node_link, neighbor);

        let Some(node) = self.node_from_link(node_link) else {
            return;
        };
        if node.has_children() {
            let children: Vec<NodeLink> = neighbor::children_touching_neighbor(neighbor)
                .iter()
                .map(|&child_idx| node.child_link(child_idx))
                .collect();

            for child_link in children {
                self.link_neighbor_for_node_hierarchically(child_link, neighbor);
            }
        }
    }

    /// Re-links all faces for a node and its children. With `invalid_only`,
    /// faces that already hold a valid link are left alone.
    pub(crate) fn link_neighbors_for_node_hierarchically(
        &mut self,
        node_link: NodeLink,
        invalid_only: bool,
    ) {
        let Some(tile) = self.tile_for_link(node_link) else {
            return;
        };
        let Some(node) = (if node_link.layer_idx() == self.config.tile_layer_idx() {
            Some(tile.node_info())
        } else {
            tile.get_node(node_link.layer_idx(), node_link.node_idx(), true)
        }) else {
            return;
        };

        let faces: Vec<(Neighbor, bool)> = Neighbor::ALL
            .iter()
            .map(|&n| (n, node.neighbor_link(tile, n).is_valid()))
            .collect();

        for (neighbor, was_valid) in faces {
            if !invalid_only || !was_valid {
                self.link_neighbor_for_node_hierarchically(node_link, neighbor);
            }
        }
    }

    /// Ensures all node data within the octree is valid. Panics on
    /// violation; intended for tests and the `verify_nodes` feature.
    pub fn verify_node_data(&self, verify_external_links: bool) {
        assert!(self.tiles.len() as u32 <= self.max_tiles);

        for tile in self.tiles.values() {
            tile.verify(verify_external_links.then_some(self));
            assert_eq!(tile_id_for_coord(tile.coord()), tile.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SvoConfig {
        SvoConfig::new(Vec3::ZERO, 25.0, 32, 2)
    }

    /// A tile whose space is fully open (no nodes needed).
    fn insert_open_tile(octree: &mut SparseVoxelOctree, coord: IVec3) {
        octree.ensure_tile_at_coord(coord).unwrap();
    }

    #[test]
    fn tile_identity() {
        let mut octree = SparseVoxelOctree::new(test_config());
        for coord in [IVec3::ZERO, IVec3::new(4, -2, 9)] {
            insert_open_tile(&mut octree, coord);
            let tile = octree.tile_at_coord(coord).unwrap();
            assert_eq!(tile.id(), tile_id_for_coord(coord));
            assert_eq!(tile.coord(), coord);
        }

        octree.verify_node_data(true);
    }

    #[test]
    fn fixed_pool_exhaustion_fails() {
        let mut config = test_config();
        config.set_tile_pool_size(2);
        config.set_tile_pool_size_fixed(true);

        let mut octree = SparseVoxelOctree::new(config);
        assert!(octree.ensure_tile_at_coord(IVec3::ZERO).is_some());
        assert!(octree.ensure_tile_at_coord(IVec3::X).is_some());
        assert!(octree.ensure_tile_at_coord(IVec3::Y).is_none());

        // Growable pools expand instead.
        let mut config = test_config();
        config.set_tile_pool_size(2);
        let mut octree = SparseVoxelOctree::new(config);
        for i in 0..5 {
            assert!(octree.ensure_tile_at_coord(IVec3::new(i, 0, 0)).is_some());
        }
    }

    #[test]
    fn link_for_location_open_tile() {
        let mut octree = SparseVoxelOctree::new(test_config());
        insert_open_tile(&mut octree, IVec3::ZERO);

        let tile_res = octree.config().tile_resolution();
        let inside = Vec3::splat(tile_res * 0.5);

        // A fully open tile resolves to the tile link itself.
        let link = octree.link_for_location(inside, false);
        assert_eq!(link, octree.tile_link_at_coord(IVec3::ZERO));

        // Outside any tile resolves to nothing.
        let outside = Vec3::splat(-tile_res * 0.5);
        assert!(!octree.link_for_location(outside, false).is_valid());
    }

    #[test]
    fn tiles_in_bounds_early_exit() {
        let mut octree = SparseVoxelOctree::new(test_config());
        for x in 0..3 {
            insert_open_tile(&mut octree, IVec3::new(x, 0, 0));
        }

        let bounds = octree.bounds();
        let mut visited = 0;
        octree.tiles_in_bounds(&bounds, |_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }

    #[test]
    fn tile_level_neighbor_links() {
        let mut octree = SparseVoxelOctree::new(test_config());
        insert_open_tile(&mut octree, IVec3::ZERO);
        insert_open_tile(&mut octree, IVec3::new(1, 0, 0));
        octree.link_neighbors();

        let tile = octree.tile_at_coord(IVec3::ZERO).unwrap();
        let front = tile.neighbor_link(Neighbor::Front);
        assert_eq!(front, octree.tile_link_at_coord(IVec3::new(1, 0, 0)));
        assert!(!tile.neighbor_link(Neighbor::Back).is_valid());

        let other = octree.tile_at_coord(IVec3::new(1, 0, 0)).unwrap();
        assert_eq!(
            other.neighbor_link(Neighbor::Back),
            octree.tile_link_at_coord(IVec3::ZERO)
        );

        octree.verify_node_data(true);
    }
}
