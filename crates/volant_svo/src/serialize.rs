//! Versioned persistence for octrees.
//!
//! The stream is a leading format version followed by one `bincode` record.
//! Saving always writes [`LATEST_VERSION`]; loading migrates the formats
//! still in the wild:
//!
//! - coord recomputed from the tile's saved world location (pre
//!   [`NODE_LINK_BASE_ADDED`] tiles stored a location, not a coord)
//! - full `(tile_id, node_id)` neighbor pairs converted to the compact
//!   same-tile/direction bases
//! - non-leaf state recomputed from the legacy flag bits (pre
//!   [`NODE_PROPS_CHANGED`] nodes stored `is_tile`/`has_children` flags)

use crate::config::SvoConfig;
use crate::link::{NodeLink, NodeLinkBase, LEAF_LAYER};
use crate::node::{NodeState, SvoNode};
use crate::octree::SparseVoxelOctree;
use crate::tile::{SvoLayer, SvoTile};

use volant_core::neighbor::Neighbor;

use fnv::FnvHashMap;
use glam::{IVec3, Vec3};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// First version this loader understands.
pub const INITIAL_VERSION: u32 = 9;
/// Non-leaf node payloads became `{is_tile, state}` instead of flag bits.
pub const NODE_PROPS_CHANGED: u32 = 10;
/// Neighbor links shrank to 32-bit bases and tiles store coords, not
/// locations.
pub const NODE_LINK_BASE_ADDED: u32 = 11;

pub const LATEST_VERSION: u32 = NODE_LINK_BASE_ADDED;

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("unsupported octree format version {0}")]
    UnsupportedVersion(u32),
}

#[derive(Serialize, Deserialize)]
struct ConfigRecord {
    seed_location: [f32; 3],
    voxel_size: f32,
    tile_layer_idx: u8,
    tile_pool_size: u32,
    fixed_tile_pool_size: bool,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    tile_id: u32,
    node_id: u32,
    neighbors: [u32; 6],
    data: u64,
}

#[derive(Serialize, Deserialize)]
struct LayerRecord {
    start_node: u32,
    num_nodes: u32,
    max_nodes: u32,
}

#[derive(Serialize, Deserialize)]
struct TileRecord {
    node_info: NodeRecord,
    coord: [i32; 3],
    pool: Vec<NodeRecord>,
    layers: Vec<LayerRecord>,
}

#[derive(Serialize, Deserialize)]
struct SvoRecord {
    config: ConfigRecord,
    max_tiles: u32,
    tiles: Vec<TileRecord>,
}

// Legacy records: neighbor links as full (tile_id, node_id) pairs, tile
// addressed by world location.

#[derive(Serialize, Deserialize)]
struct LegacyNodeRecord {
    tile_id: u32,
    node_id: u32,
    neighbors: [(u32, u32); 6],
    data: u64,
}

#[derive(Serialize, Deserialize)]
struct LegacyTileRecord {
    node_info: LegacyNodeRecord,
    location: [f32; 3],
    pool: Vec<LegacyNodeRecord>,
    layers: Vec<LayerRecord>,
}

#[derive(Serialize, Deserialize)]
struct LegacySvoRecord {
    config: ConfigRecord,
    max_tiles: u32,
    tiles: Vec<LegacyTileRecord>,
}

/// Writes the octree in the latest format.
pub fn save(octree: &SparseVoxelOctree, mut writer: impl Write) -> Result<(), SerializeError> {
    bincode::serialize_into(&mut writer, &LATEST_VERSION)?;

    let record = SvoRecord {
        config: config_record(octree.config()),
        max_tiles: octree.max_tiles,
        tiles: octree.tiles().map(tile_record).collect(),
    };

    bincode::serialize_into(&mut writer, &record)?;
    Ok(())
}

/// Reads an octree, migrating older formats as needed.
pub fn load(mut reader: impl Read) -> Result<SparseVoxelOctree, SerializeError> {
    let version: u32 = bincode::deserialize_from(&mut reader)?;

    match version {
        NODE_LINK_BASE_ADDED => {
            let record: SvoRecord = bincode::deserialize_from(&mut reader)?;
            Ok(octree_from_record(record))
        }
        INITIAL_VERSION | NODE_PROPS_CHANGED => {
            let record: LegacySvoRecord = bincode::deserialize_from(&mut reader)?;
            Ok(octree_from_legacy_record(record, version))
        }
        other => Err(SerializeError::UnsupportedVersion(other)),
    }
}

fn config_record(config: &SvoConfig) -> ConfigRecord {
    ConfigRecord {
        seed_location: config.seed_location().to_array(),
        voxel_size: config.voxel_size(),
        tile_layer_idx: config.tile_layer_idx(),
        tile_pool_size: config.tile_pool_size(),
        fixed_tile_pool_size: config.is_tile_pool_size_fixed(),
    }
}

fn config_from_record(record: &ConfigRecord) -> SvoConfig {
    let mut config = SvoConfig::new(
        Vec3::from_array(record.seed_location),
        record.voxel_size,
        record.tile_pool_size,
        record.tile_layer_idx,
    );
    config.set_tile_pool_size_fixed(record.fixed_tile_pool_size);
    config
}

fn node_record(node: &SvoNode) -> NodeRecord {
    NodeRecord {
        tile_id: node.self_link().tile_id,
        node_id: node.self_link().base.0,
        neighbors: Neighbor::ALL.map(|n| node.neighbor_base(n).0),
        data: node.data(),
    }
}

fn node_from_record(record: &NodeRecord) -> SvoNode {
    let mut node = SvoNode::default();
    node.set_self_link(NodeLink::from_base(record.tile_id, NodeLinkBase(record.node_id)));
    for (slot, bits) in node.neighbor_links_mut().iter_mut().zip(record.neighbors) {
        *slot = NodeLinkBase(bits);
    }
    node.set_data(record.data);
    node
}

fn tile_record(tile: &SvoTile) -> TileRecord {
    TileRecord {
        node_info: node_record(tile.node_info()),
        coord: tile.coord().to_array(),
        pool: tile.pool().iter().map(node_record).collect(),
        layers: tile
            .layers()
            .iter()
            .map(|layer| LayerRecord {
                start_node: layer.start_node,
                num_nodes: layer.num_nodes,
                max_nodes: layer.max_nodes,
            })
            .collect(),
    }
}

fn octree_from_record(record: SvoRecord) -> SparseVoxelOctree {
    let config = config_from_record(&record.config);
    let mut octree = SparseVoxelOctree::new(config);
    octree.max_tiles = record.max_tiles.max(octree.max_tiles);

    for tile in record.tiles {
        let node_info = node_from_record(&tile.node_info);
        let coord = IVec3::from_array(tile.coord);
        let pool = tile.pool.iter().map(node_from_record).collect();
        let layers = tile
            .layers
            .iter()
            .map(|layer| SvoLayer {
                start_node: layer.start_node,
                num_nodes: layer.num_nodes,
                max_nodes: layer.max_nodes,
            })
            .collect();

        let tile = SvoTile::from_parts(node_info, coord, pool, layers);
        octree.tiles.insert(tile.id(), tile);
    }

    #[cfg(feature = "verify_nodes")]
    octree.verify_node_data(false);

    octree
}

/// Converts a legacy full neighbor pair into the compact base: the user
/// data records same-tile, or the face the pair crossed (the slot index is
/// the face).
fn migrate_neighbor(
    slot: Neighbor,
    neighbor_tile_id: u32,
    neighbor_node_id: u32,
    self_tile_id: u32,
) -> NodeLinkBase {
    let base = NodeLinkBase(neighbor_node_id);
    if !base.is_valid() {
        return NodeLinkBase::INVALID;
    }

    let user_data = if neighbor_tile_id == self_tile_id {
        Neighbor::Self_ as u8
    } else {
        slot as u8
    };
    base.with_user_data(user_data)
}

fn migrate_node(record: &LegacyNodeRecord, version: u32) -> SvoNode {
    let mut node = SvoNode::default();
    let self_link = NodeLink::from_base(record.tile_id, NodeLinkBase(record.node_id));
    node.set_self_link(self_link);

    for (i, slot) in node.neighbor_links_mut().iter_mut().enumerate() {
        let (neighbor_tile_id, neighbor_node_id) = record.neighbors[i];
        *slot = migrate_neighbor(
            Neighbor::ALL[i],
            neighbor_tile_id,
            neighbor_node_id,
            record.tile_id,
        );
    }

    if version < NODE_PROPS_CHANGED
        && self_link.is_valid()
        && self_link.layer_idx() != LEAF_LAYER
    {
        // Legacy flag bits: bit 0 = is_tile, bit 1 = has_children.
        let is_tile = record.data & 0b01 != 0;
        let has_children = record.data & 0b10 != 0;

        node.init(self_link, is_tile);
        node.set_state(if has_children {
            NodeState::PartiallyBlocked
        } else {
            NodeState::Open
        });
    } else {
        node.set_data(record.data);
    }

    node
}

fn octree_from_legacy_record(record: LegacySvoRecord, version: u32) -> SparseVoxelOctree {
    let config = config_from_record(&record.config);
    let tile_resolution = config.tile_resolution();
    let seed_location = config.seed_location();

    let mut octree = SparseVoxelOctree::new(config);
    octree.max_tiles = record.max_tiles.max(octree.max_tiles);

    for tile in record.tiles {
        let node_info = migrate_node(&tile.node_info, version);

        // Tiles used to carry their world location; the coord is derived.
        let coord = volant_core::coords::location_to_coord(
            seed_location,
            Vec3::from_array(tile.location),
            tile_resolution,
        );

        let pool = tile
            .pool
            .iter()
            .map(|node| migrate_node(node, version))
            .collect();
        let layers = tile
            .layers
            .iter()
            .map(|layer| SvoLayer {
                start_node: layer.start_node,
                num_nodes: layer.num_nodes,
                max_nodes: layer.max_nodes,
            })
            .collect();

        let tile = SvoTile::from_parts(node_info, coord, pool, layers);
        octree.tiles.insert(tile.id(), tile);
    }

    #[cfg(feature = "verify_nodes")]
    octree.verify_node_data(false);

    octree
}

/// Structural equality for tests and tooling: same config, same tile set,
/// same nodes.
pub fn octrees_equal(a: &SparseVoxelOctree, b: &SparseVoxelOctree) -> bool {
    if !a.config().is_compatible_with(b.config()) || a.num_tiles() != b.num_tiles() {
        return false;
    }

    let b_tiles: FnvHashMap<u32, &SvoTile> = b.tiles().map(|tile| (tile.id(), tile)).collect();

    a.tiles().all(|tile_a| {
        let Some(tile_b) = b_tiles.get(&tile_a.id()) else {
            return false;
        };

        let layers_equal = tile_a.layers().len() == tile_b.layers().len()
            && tile_a.layers().iter().zip(tile_b.layers().iter()).all(|(a, b)| {
                a.start_node == b.start_node
                    && a.num_nodes == b.num_nodes
                    && a.max_nodes == b.max_nodes
            });

        layers_equal
            && tile_a.coord() == tile_b.coord()
            && nodes_equal(tile_a.node_info(), tile_b.node_info())
            && tile_a.pool().len() == tile_b.pool().len()
            && tile_a
                .pool()
                .iter()
                .zip(tile_b.pool().iter())
                .all(|(a, b)| nodes_equal(a, b))
    })
}

fn nodes_equal(a: &SvoNode, b: &SvoNode) -> bool {
    a.self_link() == b.self_link()
        && a.data() == b.data()
        && Neighbor::ALL.iter().all(|&n| a.neighbor_base(n).0 == b.neighbor_base(n).0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editable::EditableSvo;
    use crate::tile::tile_id_for_coord;

    fn test_config() -> SvoConfig {
        SvoConfig::new(Vec3::ZERO, 25.0, 32, 2)
    }

    fn partial_tile(config: &SvoConfig, coord: IVec3) -> SvoTile {
        let tile_id = tile_id_for_coord(coord);
        let mut tile = SvoTile::new(tile_id, config.tile_layer_idx(), coord);
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
                leaf.set_voxel_blocked(13);
            }
        }

        tile.trim_excess_nodes();
        tile.link_internal_neighbors();
        tile
    }

    fn build_octree() -> EditableSvo {
        let config = test_config();
        let mut svo = EditableSvo::new(config.clone());

        svo.begin_batch();
        for coord in [IVec3::ZERO, IVec3::new(1, 0, 0), IVec3::new(0, 0, 1)] {
            let mut tile = partial_tile(&config, coord);
            svo.assume_tile(&mut tile, true);
        }
        svo.end_batch();

        svo
    }

    #[test]
    fn roundtrip_preserves_structure() {
        let svo = build_octree();

        let mut bytes = Vec::new();
        save(&svo, &mut bytes).unwrap();

        let loaded = load(bytes.as_slice()).unwrap();

        assert!(octrees_equal(&svo, &loaded));
        loaded.verify_node_data(true);
    }

    #[test]
    fn unknown_version_is_rejected(){
        let mut bytes = Vec::new();
        bincode::serialize_into(&mut bytes, &99u32).unwrap();
        assert!(matches!(
            load(bytes.as_slice()),
            Err(SerializeError::UnsupportedVersion(99))
        ));
    }

    /// Re-encodes an octree in the legacy layout so migration paths can be
    /// exercised without blessed binary fixtures.
    fn legacy_bytes(svo: &SparseVoxelOctree, version: u32) -> Vec<u8> {
        let legacy_node = |node: &SvoNode| {
            let self_tile = node.self_link().tile_id;
            let tile = svo.tile(self_tile);

            let neighbors = Neighbor::ALL.map(|n| {
                let link = tile
                    .map(|tile| node.neighbor_link(tile, n))
                    .unwrap_or(NodeLink::INVALID);
                (link.tile_id, link.base.0)
            });

            let data = if version < NODE_PROPS_CHANGED
                && node.is_active()
                && !node.is_leaf()
            {
                (node.is_tile() as u64) | ((node.has_children() as u64) << 1)
            } else {
                node.data()
            };

            LegacyNodeRecord {
                tile_id: node.self_link().tile_id,
                node_id: node.self_link().base.0,
                neighbors,
                data,
            }
        };

        let record = LegacySvoRecord {
            config: config_record(svo.config()),
            max_tiles: svo.max_tiles,
            tiles: svo
                .tiles()
                .map(|tile| LegacyTileRecord {
                    node_info: legacy_node(tile.node_info()),
                    location: svo
                        .config()
                        .tile_coord_to_location(tile.coord())
                        .to_array(),
                    pool: tile.pool().iter().map(legacy_node).collect(),
                    layers: tile
                        .layers()
                        .iter()
                        .map(|layer| LayerRecord {
                            start_node: layer.start_node,
                            num_nodes: layer.num_nodes,
                            max_nodes: layer.max_nodes,
                        })
                        .collect(),
                })
                .collect(),
        };

        let mut bytes = Vec::new();
        bincode::serialize_into(&mut bytes, &version).unwrap();
        bincode::serialize_into(&mut bytes, &record).unwrap();
        bytes
    }

    #[test]
    fn migrates_node_link_base_version() {
        let svo = build_octree();
        let bytes = legacy_bytes(&svo, NODE_PROPS_CHANGED);

        let loaded = load(bytes.as_slice()).unwrap();

        // Coords recomputed from locations, neighbor pairs recompacted.
        assert!(octrees_equal(&svo, &loaded));
        loaded.verify_node_data(true);
    }

    #[test]
    fn migrates_initial_version_flag_bits() {
        let svo = build_octree();
        let bytes = legacy_bytes(&svo, INITIAL_VERSION);

        let loaded = load(bytes.as_slice()).unwrap();
        loaded.verify_node_data(true);

        // Structure survives; per-node states match what the flag bits can
        // express.
        let tile = loaded.tile_at_coord(IVec3::ZERO).unwrap();
        assert_eq!(tile.node_info().state(), NodeState::PartiallyBlocked);
        assert!(tile.node_info().is_tile());

        let partial = tile.get_node(1, 0, true).unwrap();
        assert_eq!(partial.state(), NodeState::PartiallyBlocked);
        let open = tile.get_node(1, 1, true).unwrap();
        assert_eq!(open.state(), NodeState::Open);

        // Leaf masks are untouched by the props migration.
        let leaf = tile.get_node(LEAF_LAYER, 0, true).unwrap();
        assert!(leaf.is_voxel_blocked(13));
    }
}
