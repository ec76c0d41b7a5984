use crate::aabb::Aabb;

use glam::{IVec3, Vec3};

/// Voxels per leaf axis. A leaf node holds a 4x4x4 grid of voxels.
pub const VOXEL_GRID_EXTENT: i32 = 4;
/// Voxels stored per leaf node.
pub const VOXELS_PER_LEAF: u32 = 64;

const VOXEL_GRID_EXTENTS: IVec3 = IVec3::splat(VOXEL_GRID_EXTENT);

/// Which point of a cell a coord→location conversion should return.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellOffset {
    Min,
    Center,
    Max,
}

/// The lattice cell containing `location` at the given resolution, relative
/// to `seed_location`.
#[inline]
pub fn location_to_coord(seed_location: Vec3, location: Vec3, resolution: f32) -> IVec3 {
    let seed_relative = location - seed_location;

    // Floor the relative location before dividing so very small numbers
    // aren't divided by very large ones, which magnifies floating point
    // error.
    let floored = seed_relative.floor();

    (floored / resolution).floor().as_ivec3()
}

#[inline]
pub fn coord_to_location(
    seed_location: Vec3,
    coord: IVec3,
    resolution: f32,
    offset: CellOffset,
) -> Vec3 {
    let location = seed_location + coord.as_vec3() * resolution;

    match offset {
        CellOffset::Min => location,
        CellOffset::Center => location + Vec3::splat(resolution * 0.5),
        CellOffset::Max => location + Vec3::splat(resolution),
    }
}

/// The inclusive coord range covered by `bounds` at the given resolution.
///
/// A max bound lying exactly on a cell edge belongs to the cell below it,
/// not the cell whose minimum it touches, so each max axis is pulled back by
/// one when the bound does not extend past that cell's minimum.
pub fn coords_for_bounds(
    seed_location: Vec3,
    bounds: &Aabb,
    resolution: f32,
) -> (IVec3, IVec3) {
    let min_coord = location_to_coord(seed_location, bounds.min, resolution);
    let mut max_coord = location_to_coord(seed_location, bounds.max, resolution);

    if min_coord != max_coord {
        let max_cell_min = coord_to_location(seed_location, max_coord, resolution, CellOffset::Min);

        for axis in 0..3 {
            if bounds.max[axis] <= max_cell_min[axis] && max_coord[axis] > min_coord[axis] {
                max_coord[axis] -= 1;
            }
        }
    }

    debug_assert!(max_coord.cmpge(min_coord).all());

    (min_coord, max_coord)
}

#[inline]
pub fn is_coord_valid(coord: IVec3, extents: IVec3) -> bool {
    coord.cmpge(IVec3::ZERO).all() && coord.cmplt(extents).all()
}

#[inline]
pub fn coord_in_bounds(coord: IVec3, bounds_min: IVec3, bounds_max: IVec3) -> bool {
    coord.cmpge(bounds_min).all() && coord.cmple(bounds_max).all()
}

/// Row-major (x fastest) linear index of a coord within a grid.
#[inline]
pub fn index_for_coord(coord: IVec3, extents: IVec3) -> u32 {
    (coord.x + coord.y * extents.x + coord.z * extents.x * extents.y) as u32
}

#[inline]
pub fn coord_from_index(mut index: u32, extents: IVec3) -> IVec3 {
    let x = index % extents.x as u32;
    index /= extents.x as u32;
    let y = index % extents.y as u32;
    index /= extents.y as u32;

    IVec3::new(x as i32, y as i32, index as i32)
}

/// Linear index (`x + 4y + 16z`) of a voxel within a leaf's 4x4x4 grid.
#[inline]
pub fn voxel_index_for_coord(voxel_coord: IVec3) -> u8 {
    index_for_coord(voxel_coord, VOXEL_GRID_EXTENTS) as u8
}

#[inline]
pub fn voxel_coord_from_index(index: u8) -> IVec3 {
    coord_from_index(index as u32, VOXEL_GRID_EXTENTS)
}

#[inline]
pub fn is_voxel_coord_valid(voxel_coord: IVec3) -> bool {
    is_coord_valid(voxel_coord, VOXEL_GRID_EXTENTS)
}

#[inline]
pub fn manhattan_distance(a: IVec3, b: IVec3) -> u32 {
    let d = (a - b).abs();
    (d.x + d.y + d.z) as u32
}

/// Walks an inclusive coord box in row-major (x fastest) order.
#[derive(Clone, Copy)]
pub struct CoordIter {
    min: IVec3,
    max: IVec3,
    cur: IVec3,
    done: bool,
}

impl CoordIter {
    #[inline]
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self {
            min,
            max,
            cur: min,
            done: max.cmplt(min).any(),
        }
    }

    #[inline]
    pub fn num_coords(&self) -> u32 {
        if self.max.cmplt(self.min).any() {
            return 0;
        }
        let e = self.max - self.min + IVec3::ONE;
        (e.x * e.y * e.z) as u32
    }
}

impl Iterator for CoordIter {
    type Item = IVec3;

    #[inline]
    fn next(&mut self) -> Option<IVec3> {
        if self.done {
            return None;
        }

        let coord = self.cur;

        self.cur.x += 1;
        if self.cur.x > self.max.x {
            self.cur.x = self.min.x;
            self.cur.y += 1;
            if self.cur.y > self.max.y {
                self.cur.y = self.min.y;
                self.cur.z += 1;
                if self.cur.z > self.max.z {
                    self.done = true;
                }
            }
        }

        Some(coord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use itertools::iproduct;

    #[test]
    fn location_coord_roundtrip_negative() {
        let seed = Vec3::new(100.0, -50.0, 3.0);
        for (z, y, x) in iproduct!(-3..3, -3..3, -3..3) {
            let coord = IVec3::new(x, y, z);
            let center = coord_to_location(seed, coord, 32.0, CellOffset::Center);
            assert_eq!(location_to_coord(seed, center, 32.0), coord);
        }
    }

    #[test]
    fn coords_for_bounds_max_on_cell_edge() {
        let seed = Vec3::ZERO;
        // The max face lies exactly on the boundary between cells 1 and 2,
        // so it belongs to cell 1.
        let bounds = Aabb::new(Vec3::splat(8.0), Vec3::splat(64.0));
        let (min, max) = coords_for_bounds(seed, &bounds, 32.0);
        assert_eq!(min, IVec3::ZERO);
        assert_eq!(max, IVec3::ONE);
    }

    #[test]
    fn coord_iter_matches_linear_index() {
        let min = IVec3::new(-2, 0, 1);
        let max = IVec3::new(1, 2, 3);
        let extents = max - min + IVec3::ONE;

        let mut count = 0;
        for (i, coord) in CoordIter::new(min, max).enumerate() {
            assert_eq!(index_for_coord(coord - min, extents), i as u32);
            assert_eq!(coord_from_index(i as u32, extents), coord - min);
            count += 1;
        }
        assert_eq!(count, CoordIter::new(min, max).num_coords());
    }

    #[test]
    fn voxel_index_roundtrip() {
        for i in 0..VOXELS_PER_LEAF as u8 {
            assert_eq!(voxel_index_for_coord(voxel_coord_from_index(i)), i);
        }
        assert!(!is_voxel_coord_valid(IVec3::new(4, 0, 0)));
        assert!(!is_voxel_coord_valid(IVec3::new(0, -1, 0)));
    }
}
