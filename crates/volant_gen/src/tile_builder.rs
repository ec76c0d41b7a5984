use crate::collider::{ColliderSet, GeometrySource, Triangle};
use crate::config::GeneratorConfig;

use volant_core::coords::{self, CoordIter};
use volant_core::morton::{self, MortonCode};

use volant_svo::node::NodeState;
use volant_svo::tile::{tile_id_for_coord, SvoTile};

use glam::{IVec3, Vec3};

/// Remaps an intra-leaf Morton bit index to the linear `x + 4y + 16z` index
/// the leaf voxel mask uses.
#[inline]
fn intra_morton_to_linear(m: u32) -> u32 {
    let x = (m & 1) | ((m >> 3) & 1) << 1;
    let y = ((m >> 1) & 1) | ((m >> 4) & 1) << 1;
    let z = ((m >> 2) & 1) | ((m >> 5) & 1) << 1;
    x + 4 * y + 16 * z
}

/// A Morton-indexed bit grid of voxels. One `u64` word per leaf: the word
/// index is the leaf's Morton code and the bit index the voxel's intra-leaf
/// Morton code, so a whole leaf is a single aligned load.
#[derive(Clone)]
struct VoxelGrid {
    words: Vec<u64>,
    voxels_per_axis: i32,
}

impl VoxelGrid {
    fn new(leaves_per_axis: u32) -> Self {
        Self {
            words: vec![0; (leaves_per_axis * leaves_per_axis * leaves_per_axis) as usize],
            voxels_per_axis: (leaves_per_axis * coords::VOXEL_GRID_EXTENT as u32) as i32,
        }
    }

    #[inline]
    fn in_bounds(&self, voxel_coord: IVec3) -> bool {
        coords::is_coord_valid(voxel_coord, IVec3::splat(self.voxels_per_axis))
    }

    #[inline]
    fn set(&mut self, code: MortonCode) {
        self.words[(code >> 6) as usize] |= 1u64 << (code & 63);
    }

    #[inline]
    fn set_coord(&mut self, voxel_coord: IVec3) {
        debug_assert!(self.in_bounds(voxel_coord));
        self.set(morton::coord_to_morton(voxel_coord));
    }

    /// The 64 voxels of a leaf, remapped to the linear mask order.
    fn leaf_mask(&self, leaf_code: MortonCode) -> u64 {
        let mut word = self.words[leaf_code as usize];
        if word == 0 || word == u64::MAX {
            return word;
        }

        let mut mask = 0u64;
        while word != 0 {
            let bit = word.trailing_zeros();
            mask |= 1u64 << intra_morton_to_linear(bit);
            word &= word - 1;
        }
        mask
    }
}

/// Generation work for a single tile.
struct TileBuildData {
    coord: IVec3,
    // The gather bounds (tile bounds padded by the agent, so neighboring
    // geometry can block voxels inside the tile) in grid voxel
    // coordinates, clamped to the grid.
    fill_min: IVec3,
    fill_max: IVec3,
    colliders: ColliderSet,
}

/// Voxelizes and builds a batch of tiles. Filled on the scheduler's thread
/// (tile by tile, gathering geometry as it goes), then shipped to a worker
/// to run [`Self::do_work`], then drained tile by tile on the way back in.
pub struct TileBuilder {
    config: GeneratorConfig,

    // The dilation kernel as coordinate offsets plus their precomputed
    // Morton offset codes.
    padding_offsets: Vec<(IVec3, MortonCode)>,

    tiles: Vec<TileBuildData>,
    generated: Vec<SvoTile>,
    next_generated: usize,

    /// Ticks this builder has sat gathering without launching.
    pub pending_ticks: u32,
    /// Triangles gathered so far, for the scheduler's soft cap.
    pub tri_count: u32,
}

impl TileBuilder {
    pub fn new(config: GeneratorConfig) -> Self {
        let padding_offsets = build_padding_offsets(
            config.agent_radius_voxels() as i32,
            config.agent_half_height_voxels() as i32,
        );

        Self {
            config,
            padding_offsets,
            tiles: Vec::new(),
            generated: Vec::new(),
            next_generated: 0,
            pending_ticks: 0,
            tri_count: 0,
        }
    }

    /// Gathers geometry for `coord` and queues it for building. Returns
    /// whether any collision data was found; either way the tile will be
    /// built (a tile with no geometry is still navigable open space).
    pub fn add_tile(&mut self, coord: IVec3, source: &dyn GeometrySource) -> bool {
        let tile_bounds = self.config.tile_bounds(coord);
        let gather_bounds = tile_bounds.expanded_by_vec(self.config.bounds_padding());

        let mut colliders = ColliderSet::default();
        source.gather(&gather_bounds, &mut colliders);

        let has_collision = colliders.has_collision_data();
        self.tri_count += colliders.triangles.len() as u32;

        let grid_origin = self.config.grid_origin(coord);
        let voxel_size = self.config.voxel_size();
        let max_voxel = IVec3::splat(self.config.grid_voxels_per_axis() as i32 - 1);

        let fill_min = ((gather_bounds.min - grid_origin) / voxel_size)
            .floor()
            .as_ivec3()
            .clamp(IVec3::ZERO, max_voxel);
        let fill_max = ((gather_bounds.max - grid_origin) / voxel_size)
            .floor()
            .as_ivec3()
            .clamp(IVec3::ZERO, max_voxel);

        self.tiles.push(TileBuildData {
            coord,
            fill_min,
            fill_max,
            colliders,
        });

        has_collision
    }

    #[inline]
    pub fn has_tiles(&self) -> bool {
        !self.tiles.is_empty()
    }

    #[inline]
    pub fn num_tiles(&self) -> usize {
        self.tiles.len()
    }

    pub fn tile_coords(&self) -> impl Iterator<Item = IVec3> + '_ {
        self.tiles.iter().map(|tile| tile.coord)
    }

    pub fn contains_tile_in_bounds(&self, min_coord: IVec3, max_coord: IVec3) -> bool {
        self.tiles
            .iter()
            .any(|tile| coords::coord_in_bounds(tile.coord, min_coord, max_coord))
    }

    /// Runs the whole pipeline for every queued tile. Safe to call off the
    /// main thread; only this builder's own data is touched.
    pub fn do_work(&mut self) {
        for tile_idx in 0..self.tiles.len() {
            let mut grid = VoxelGrid::new(self.config.num_leaf_nodes_per_axis());

            self.fill_triangles(tile_idx, &mut grid);
            self.fill_blockers(tile_idx, &mut grid);

            let padded = self.pad_voxels(&grid);

            let mut tile = self.create_tile_from_voxels(&self.tiles[tile_idx], &padded);
            collapse_unneeded_nodes(&mut tile);
            tile.trim_excess_nodes();
            tile.link_internal_neighbors();

            self.generated.push(tile);
        }
    }

    /// Hands back generated tiles one at a time; `None` when drained.
    pub fn next_generated_tile(&mut self) -> Option<&mut SvoTile> {
        let idx = self.next_generated;
        if idx < self.generated.len() {
            self.next_generated += 1;
            Some(&mut self.generated[idx])
        } else {
            None
        }
    }

    fn fill_triangles(&self, tile_idx: usize, grid: &mut VoxelGrid) {
        let tile = &self.tiles[tile_idx];
        let grid_origin = self.config.grid_origin(tile.coord);
        let inv_voxel = 1.0 / self.config.voxel_size();

        for triangle in &tile.colliders.triangles {
            self.rasterize_triangle(triangle, grid_origin, inv_voxel, tile, grid);
        }
    }

    /// Dominant-axis rasterization: swizzle so the triangle's largest
    /// normal component becomes the w axis, clip the triangle into grid
    /// columns in (u, v), and mark every voxel along each column's w span.
    fn rasterize_triangle(
        &self,
        triangle: &Triangle,
        grid_origin: Vec3,
        inv_voxel: f32,
        tile: &TileBuildData,
        grid: &mut VoxelGrid,
    ) {
        let normal = triangle.normal();
        if normal == Vec3::ZERO {
            return;
        }

        let abs_normal = normal.abs();
        let w_axis = if abs_normal.x >= abs_normal.y && abs_normal.x >= abs_normal.z {
            0
        } else if abs_normal.y >= abs_normal.z {
            1
        } else {
            2
        };
        let u_axis = (w_axis + 1) % 3;
        let v_axis = (w_axis + 2) % 3;

        // Triangle in grid voxel units, swizzled to (u, v, w).
        let poly: Vec<Vec3> = triangle
            .vertices
            .iter()
            .map(|&vert| {
                let g = (vert - grid_origin) * inv_voxel;
                Vec3::new(g[u_axis], g[v_axis], g[w_axis])
            })
            .collect();

        // Cell range to scan, clamped to the fill bounds.
        let cell_min = IVec3::new(
            tile.fill_min[u_axis],
            tile.fill_min[v_axis],
            tile.fill_min[w_axis],
        );
        let cell_max = IVec3::new(
            tile.fill_max[u_axis],
            tile.fill_max[v_axis],
            tile.fill_max[w_axis],
        );

        let mut poly_min = poly[0];
        let mut poly_max = poly[0];
        for &p in &poly[1..] {
            poly_min = poly_min.min(p);
            poly_max = poly_max.max(p);
        }

        let v0 = (poly_min.y.floor() as i32).max(cell_min.y);
        let v1 = (poly_max.y.floor() as i32).min(cell_max.y);

        let mut rest_of_rows = poly;

        for v in v0..=v1 {
            let (row, rest) = divide_poly(&rest_of_rows, 1, (v + 1) as f32);
            rest_of_rows = rest;

            if row.len() < 3 {
                continue;
            }

            let mut row_min = row[0].x;
            let mut row_max = row[0].x;
            for p in &row[1..] {
                row_min = row_min.min(p.x);
                row_max = row_max.max(p.x);
            }

            let u0 = (row_min.floor() as i32).max(cell_min.x);
            let u1 = (row_max.floor() as i32).min(cell_max.x);

            let mut rest_of_cells = row;

            for u in u0..=u1 {
                let (cell, rest) = divide_poly(&rest_of_cells, 0, (u + 1) as f32);
                rest_of_cells = rest;

                if cell.len() < 3 {
                    continue;
                }

                // The span of w the triangle occupies over this column.
                let mut w_min = cell[0].z;
                let mut w_max = cell[0].z;
                for p in &cell[1..] {
                    w_min = w_min.min(p.z);
                    w_max = w_max.max(p.z);
                }

                let w0 = (w_min.floor() as i32).max(cell_min.z);
                let w1 = (w_max.floor() as i32).min(cell_max.z);

                for w in w0..=w1 {
                    let mut voxel_coord = IVec3::ZERO;
                    voxel_coord[u_axis] = u;
                    voxel_coord[v_axis] = v;
                    voxel_coord[w_axis] = w;
                    grid.set_coord(voxel_coord);
                }
            }
        }
    }

    /// Marks every voxel whose center lies inside a convex blocker.
    fn fill_blockers(&self, tile_idx: usize, grid: &mut VoxelGrid) {
        let tile = &self.tiles[tile_idx];
        let grid_origin = self.config.grid_origin(tile.coord);
        let voxel_size = self.config.voxel_size();

        for blocker in &tile.colliders.blockers {
            let blocker_min = ((blocker.bounds.min - grid_origin) / voxel_size)
                .floor()
                .as_ivec3()
                .clamp(tile.fill_min, tile.fill_max);
            let blocker_max = ((blocker.bounds.max - grid_origin) / voxel_size)
                .floor()
                .as_ivec3()
                .clamp(tile.fill_min, tile.fill_max);

            for voxel_coord in CoordIter::new(blocker_min, blocker_max) {
                let center = grid_origin + (voxel_coord.as_vec3() + Vec3::splat(0.5)) * voxel_size;
                if blocker.contains_point(center) {
                    grid.set_coord(voxel_coord);
                }
            }
        }
    }

    /// Morphological dilation of the blocked set by the agent kernel, so an
    /// agent centered on any open voxel cannot overlap geometry.
    fn pad_voxels(&self, grid: &VoxelGrid) -> VoxelGrid {
        let mut padded = grid.clone();

        for (word_idx, &word) in grid.words.iter().enumerate() {
            if word == 0 {
                continue;
            }

            let mut bits = word;
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;

                let code = ((word_idx as u32) << 6) | bit;
                let coord = morton::morton_to_coord(code);

                for &(offset, offset_code) in &self.padding_offsets {
                    if grid.in_bounds(coord + offset) {
                        padded.set(morton::offset_morton(code, offset_code));
                    }
                }
            }
        }

        padded
    }

    /// Builds the tile's node hierarchy from the padded grid: leaf states
    /// come straight off the grid words, parent states are derived bottom
    /// up, and nodes are emitted top down so only partially blocked nodes
    /// materialize children.
    fn create_tile_from_voxels(&self, data: &TileBuildData, grid: &VoxelGrid) -> SvoTile {
        let tile_layer_idx = self.config.tile_layer_idx();
        let first = self.config.first_actual_leaf() as i32;

        let num_leaf_slots = 8usize.pow(tile_layer_idx as u32);
        let mut leaf_masks = vec![0u64; num_leaf_slots];

        // The Morton box iterator stays inside the actual-leaf range, so
        // padding leaves never generate nodes.
        for grid_leaf_code in morton::MortonIter::new(
            self.config.min_actual_leaf_code(),
            self.config.max_actual_leaf_code(),
        ) {
            let local_coord = morton::morton_to_coord(grid_leaf_code) - IVec3::splat(first);
            let local_code = morton::coord_to_morton(local_coord);
            leaf_masks[local_code as usize] = grid.leaf_mask(grid_leaf_code);
        }

        // States per layer, bottom up. A node is uniform iff all 8 children
        // are uniform with the same state.
        let mut layer_states: Vec<Vec<NodeState>> = Vec::with_capacity(tile_layer_idx as usize + 1);
        layer_states.push(
            leaf_masks
                .iter()
                .map(|&mask| match mask {
                    0 => NodeState::Open,
                    u64::MAX => NodeState::Blocked,
                    _ => NodeState::PartiallyBlocked,
                })
                .collect(),
        );

        for layer_idx in 1..=tile_layer_idx as usize {
            let child_states = &layer_states[layer_idx - 1];
            let num_nodes = child_states.len() / 8;

            let states = (0..num_nodes)
                .map(|node_idx| {
                    let children = &child_states[node_idx * 8..node_idx * 8 + 8];
                    if children.iter().all(|&s| s == children[0]) {
                        children[0]
                    } else {
                        NodeState::PartiallyBlocked
                    }
                })
                .collect();
            layer_states.push(states);
        }

        let mut tile = SvoTile::new(tile_id_for_coord(data.coord), tile_layer_idx, data.coord);

        let root_state = layer_states[tile_layer_idx as usize][0];
        tile.node_info_mut().set_state(root_state);

        if root_state == NodeState::PartiallyBlocked {
            tile.allocate_nodes(self.config.num_nodes_per_tile(), tile_layer_idx);
            self.emit_children(&mut tile, tile_layer_idx, 0, &layer_states, &leaf_masks);
        }

        tile
    }

    /// Materializes the 8 children of a partially blocked node.
    fn emit_children(
        &self,
        tile: &mut SvoTile,
        parent_layer_idx: u8,
        parent_idx: u32,
        layer_states: &[Vec<NodeState>],
        leaf_masks: &[u64],
    ) {
        let child_layer_idx = parent_layer_idx - 1;

        for k in 0..8u32 {
            let child_idx = parent_idx * 8 + k;
            let (child, _) = tile
                .ensure_node(child_layer_idx, child_idx)
                .expect("child slot exists in a fully allocated tile");

            if child_layer_idx == 0 {
                child.set_voxel_mask(leaf_masks[child_idx as usize]);
            } else {
                let state = layer_states[child_layer_idx as usize][child_idx as usize];
                child.set_state(state);

                if state == NodeState::PartiallyBlocked {
                    self.emit_children(tile, child_layer_idx, child_idx, layer_states, leaf_masks);
                }
            }
        }
    }
}

fn build_padding_offsets(radius: i32, half_height: i32) -> Vec<(IVec3, MortonCode)> {
    let mut offsets = Vec::new();

    for dz in -half_height..=half_height {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let offset = IVec3::new(dx, dy, dz);
                if offset == IVec3::ZERO {
                    continue;
                }
                offsets.push((offset, morton::calc_morton_offset(offset)));
            }
        }
    }

    offsets
}

/// Splits a convex polygon by the plane `p[axis] = threshold`, returning
/// the parts below and above. Both keep the vertices on the plane.
fn divide_poly(poly: &[Vec3], axis: usize, threshold: f32) -> (Vec<Vec3>, Vec<Vec3>) {
    let mut below = Vec::with_capacity(poly.len() + 1);
    let mut above = Vec::with_capacity(poly.len() + 1);

    for i in 0..poly.len() {
        let a = poly[i];
        let b = poly[(i + 1) % poly.len()];

        let da = threshold - a[axis];
        let db = threshold - b[axis];

        if da >= 0.0 {
            below.push(a);
        }
        if da <= 0.0 {
            above.push(a);
        }

        // The edge crosses the plane; both sides get the intersection.
        if (da > 0.0) != (db > 0.0) {
            let t = da / (da - db);
            below.push(a + (b - a) * t);
            above.push(a + (b - a) * t);
        }
    }

    (below, above)
}

/// Walks the tile top down, replacing any node whose children all share one
/// uniform state with that state and releasing the children.
pub(crate) fn collapse_unneeded_nodes(tile: &mut SvoTile) {
    if !tile.node_info().has_children() {
        return;
    }

    let tile_layer_idx = tile.self_link().layer_idx();
    let state = collapse_node(tile, tile_layer_idx, 0);
    if state != NodeState::PartiallyBlocked {
        tile.node_info_mut().set_state(state);
    }
}

fn collapse_node(tile: &mut SvoTile, layer_idx: u8, node_idx: u32) -> NodeState {
    let child_layer_idx = layer_idx - 1;

    let mut child_states = [NodeState::Open; 8];
    for k in 0..8u32 {
        let child_idx = node_idx * 8 + k;

        let Some(child) = tile.get_node(child_layer_idx, child_idx, true) else {
            return NodeState::PartiallyBlocked;
        };

        child_states[k as usize] = if child.has_children() {
            collapse_node(tile, child_layer_idx, child_idx)
        } else {
            child.state()
        };
    }

    let first = child_states[0];
    if first != NodeState::PartiallyBlocked && child_states.iter().all(|&s| s == first) {
        for k in 0..8u32 {
            tile.release_node(child_layer_idx, node_idx * 8 + k);
        }

        if let Some(node) = tile.get_node_mut(layer_idx, node_idx, true) {
            node.set_state(first);
        }

        first
    } else {
        NodeState::PartiallyBlocked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collider::{ConvexBlocker, Plane, StaticGeometry};

    use volant_svo::SvoConfig;

    fn test_config() -> GeneratorConfig {
        // Tile layer 2: 4 leaves (16 voxels) per tile axis, tile res 400.
        GeneratorConfig::new(SvoConfig::new(Vec3::ZERO, 25.0, 32, 2), 25.0, 50.0)
    }

    fn build_one(config: &GeneratorConfig, geometry: &StaticGeometry, coord: IVec3) -> SvoTile {
        let mut builder = TileBuilder::new(config.clone());
        builder.add_tile(coord, geometry);
        builder.do_work();
        let tile = builder.next_generated_tile().unwrap().clone();
        assert!(builder.next_generated_tile().is_none());
        tile
    }

    #[test]
    fn empty_geometry_builds_open_tile() {
        let config = test_config();
        let tile = build_one(&config, &StaticGeometry::default(), IVec3::ZERO);

        assert_eq!(tile.node_info().state(), NodeState::Open);
        assert!(!tile.has_nodes_allocated());
    }

    #[test]
    fn single_triangle_blocks_and_pads() {
        let config = test_config();

        // A small triangle in the middle of the tile, axis aligned in Z.
        let center = Vec3::splat(200.0);
        let geometry = StaticGeometry {
            triangles: vec![Triangle::new(
                center + Vec3::new(-10.0, -10.0, 0.0),
                center + Vec3::new(10.0, -10.0, 0.0),
                center + Vec3::new(0.0, 10.0, 0.0),
            )],
            blockers: Vec::new(),
        };

        let tile = build_one(&config, &geometry, IVec3::ZERO);
        assert_eq!(tile.node_info().state(), NodeState::PartiallyBlocked);
        tile.verify(None);

        // The center voxel's leaf must carry blocked voxels.
        let blocked: u32 = tile
            .nodes_for_layer(0)
            .map(|leaf| leaf.voxel_mask().count_ones())
            .sum();
        // Triangle coverage plus the dilation kernel.
        assert!(blocked > 1, "expected padded blockage, got {blocked}");
    }

    #[test]
    fn padding_respects_agent_shape() {
        // Radius 1 voxel, half-height 2 voxels.
        let config = GeneratorConfig::new(SvoConfig::new(Vec3::ZERO, 25.0, 32, 2), 25.0, 100.0);

        let offsets = build_padding_offsets(
            config.agent_radius_voxels() as i32,
            config.agent_half_height_voxels() as i32,
        );

        // 3 * 3 * 5 minus the origin.
        assert_eq!(offsets.len(), 3 * 3 * 5 - 1);
        assert!(offsets.iter().all(|(o, _)| o.x.abs() <= 1 && o.y.abs() <= 1 && o.z.abs() <= 2));
    }

    #[test]
    fn geometry_outside_tile_pads_into_it() {
        let config = test_config();

        // A wall just outside the -X face of tile (0,0,0). Padding is one
        // voxel of radius, so the boundary voxels of the tile become
        // blocked even though the wall itself is outside.
        let wall_x = -5.0;
        let geometry = StaticGeometry {
            triangles: vec![
                Triangle::new(
                    Vec3::new(wall_x, 0.0, 0.0),
                    Vec3::new(wall_x, 400.0, 0.0),
                    Vec3::new(wall_x, 400.0, 400.0),
                ),
                Triangle::new(
                    Vec3::new(wall_x, 0.0, 0.0),
                    Vec3::new(wall_x, 400.0, 400.0),
                    Vec3::new(wall_x, 0.0, 400.0),
                ),
            ],
            blockers: Vec::new(),
        };

        let tile = build_one(&config, &geometry, IVec3::ZERO);
        assert_eq!(tile.node_info().state(), NodeState::PartiallyBlocked);

        // Some voxel on the -X face of the tile is blocked by padding.
        let any_blocked = tile.nodes_for_layer(0).any(|leaf| leaf.voxel_mask() != 0);
        assert!(any_blocked);
    }

    #[test]
    fn blocker_volume_fills_voxels() {
        let config = test_config();

        // An axis-aligned convex box blocker covering one leaf.
        let min = Vec3::splat(100.0);
        let max = Vec3::splat(200.0);
        let planes = vec![
            Plane::new(Vec3::X, max.x),
            Plane::new(Vec3::NEG_X, -min.x),
            Plane::new(Vec3::Y, max.y),
            Plane::new(Vec3::NEG_Y, -min.y),
            Plane::new(Vec3::Z, max.z),
            Plane::new(Vec3::NEG_Z, -min.z),
        ];
        let geometry = StaticGeometry {
            triangles: Vec::new(),
            blockers: vec![ConvexBlocker::new(planes, &[min, max])],
        };

        let tile = build_one(&config, &geometry, IVec3::ZERO);
        assert_eq!(tile.node_info().state(), NodeState::PartiallyBlocked);

        // At least a full leaf (64 voxels) plus padding got blocked.
        let blocked: u32 = tile
            .nodes_for_layer(0)
            .map(|leaf| leaf.voxel_mask().count_ones())
            .sum();
        assert!(blocked >= 64, "got {blocked}");
    }

    #[test]
    fn collapse_folds_redundant_children() {
        let config = test_config();

        // Hand-build a tile where node 0's children are all blocked but
        // were materialized anyway.
        let coord = IVec3::new(2, 0, 0);
        let mut tile = SvoTile::new(tile_id_for_coord(coord), 2, coord);
        tile.allocate_nodes(config.num_nodes_per_tile(), 2);
        tile.node_info_mut().set_state(NodeState::PartiallyBlocked);

        for i in 0..8u32 {
            let (node, _) = tile.ensure_node(1, i).unwrap();
            node.set_state(if i == 0 {
                NodeState::PartiallyBlocked
            } else {
                NodeState::Open
            });
        }
        for i in 0..8u32 {
            let (leaf, _) = tile.ensure_node(0, i).unwrap();
            leaf.set_voxel_mask(u64::MAX);
        }

        collapse_unneeded_nodes(&mut tile);

        // Node 0 folded to Blocked; its leaves were released.
        let node0 = tile.get_node(1, 0, true).unwrap();
        assert_eq!(node0.state(), NodeState::Blocked);
        assert!(!node0.has_children());
        assert_eq!(tile.num_nodes(0), 0);

        // The tile stays partial (children differ).
        assert_eq!(tile.node_info().state(), NodeState::PartiallyBlocked);
    }
}
