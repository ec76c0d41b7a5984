use crate::neighbor::Neighbor;

use bitintr::{Pdep, Pext};
use glam::IVec3;

/// A 30-bit 3D Morton code with X in the lowest bit.
///
/// <https://en.wikipedia.org/wiki/Z-order_curve>
pub type MortonCode = u32;

// Only 10 bits can be set in each mask.
pub const MORTON_X_MASK: u32 = 0x0924_9249;
pub const MORTON_Y_MASK: u32 = 0x1249_2492;
pub const MORTON_Z_MASK: u32 = 0x2492_4924;

const AXIS_MASKS: [u32; 3] = [MORTON_X_MASK, MORTON_Y_MASK, MORTON_Z_MASK];

/// The largest coordinate component encodable in a 30-bit code.
pub const MAX_MORTON_COORD: i32 = 1023;

/// Morton codes of the unit step along each axis.
const MORTON_MINUS_X: u32 = 0x1;
const MORTON_MINUS_Y: u32 = 0x2;
const MORTON_MINUS_Z: u32 = 0x4;

#[inline]
pub fn is_valid_morton_coord(coord: IVec3) -> bool {
    coord.cmpge(IVec3::ZERO).all() && coord.cmple(IVec3::splat(MAX_MORTON_COORD)).all()
}

#[inline]
pub fn coord_to_morton(coord: IVec3) -> MortonCode {
    debug_assert!(is_valid_morton_coord(coord));

    (coord.x as u32).pdep(MORTON_X_MASK)
        | (coord.y as u32).pdep(MORTON_Y_MASK)
        | (coord.z as u32).pdep(MORTON_Z_MASK)
}

#[inline]
pub fn morton_to_coord(code: MortonCode) -> IVec3 {
    IVec3::new(
        code.pext(MORTON_X_MASK) as i32,
        code.pext(MORTON_Y_MASK) as i32,
        code.pext(MORTON_Z_MASK) as i32,
    )
}

/// The Morton index of a node among its 7 siblings.
#[inline]
pub fn child_index(code: MortonCode) -> u8 {
    (code & 0x7) as u8
}

/// True if both codes have the same direct parent.
#[inline]
pub fn are_siblings(code_a: MortonCode, code_b: MortonCode) -> bool {
    (code_a & !0x7) == (code_b & !0x7)
}

// For each direction: the mask of the axis being stepped, the masked offset
// to subtract (subtracting the full axis mask adds one in masked
// arithmetic), and the axis value at which the step would leave [0, 1023]
// and must saturate instead.
const NEIGHBOR_STEP_LUT: [[u32; 3]; 6] = [
    [MORTON_X_MASK, MORTON_X_MASK, MORTON_X_MASK], // Front
    [MORTON_Y_MASK, MORTON_Y_MASK, MORTON_Y_MASK], // Right
    [MORTON_Z_MASK, MORTON_Z_MASK, MORTON_Z_MASK], // Top
    [MORTON_X_MASK, MORTON_MINUS_X, 0],            // Back
    [MORTON_Y_MASK, MORTON_MINUS_Y, 0],            // Left
    [MORTON_Z_MASK, MORTON_MINUS_Z, 0],            // Bottom
];

/// Steps a Morton code one cell along a face direction without decoding it.
///
/// Saturates: if the step would wrap past 0 or 1023 on that axis, the input
/// code is returned unchanged. Callers bounding coords below 1023 still need
/// their own upper-bound check.
#[inline]
pub fn morton_neighbor(code: MortonCode, neighbor: Neighbor) -> MortonCode {
    let [axis_mask, offset, axis_edge] = NEIGHBOR_STEP_LUT[neighbor as usize];
    let axis_value = code & axis_mask;

    if axis_value == axis_edge {
        code
    } else {
        (code & !axis_mask) | (axis_value.wrapping_sub(offset) & axis_mask)
    }
}

/// Converts a (possibly negative) offset into a code usable with
/// [`offset_morton`]. Relies on masked arithmetic wrapping, so the same
/// subtraction works for both signs.
#[inline]
pub fn calc_morton_offset(offset: IVec3) -> MortonCode {
    let transl = |v: i32| -> u32 {
        debug_assert!(v.abs() <= MAX_MORTON_COORD);
        if v <= 0 {
            (-v) as u32
        } else {
            (1024 - v) as u32
        }
    };

    transl(offset.x).pdep(MORTON_X_MASK)
        | transl(offset.y).pdep(MORTON_Y_MASK)
        | transl(offset.z).pdep(MORTON_Z_MASK)
}

/// Offsets a code by an offset code from [`calc_morton_offset`]. No
/// saturation: an offset that leaves [0, 1023] wraps around.
#[inline]
pub fn offset_morton(code: MortonCode, offset_code: MortonCode) -> MortonCode {
    let x = (code & MORTON_X_MASK).wrapping_sub(offset_code & MORTON_X_MASK) & MORTON_X_MASK;
    let y = (code & MORTON_Y_MASK).wrapping_sub(offset_code & MORTON_Y_MASK) & MORTON_Y_MASK;
    let z = (code & MORTON_Z_MASK).wrapping_sub(offset_code & MORTON_Z_MASK) & MORTON_Z_MASK;
    x | y | z
}

/// The next Morton code greater than `code` whose decoded coordinates lie in
/// the box `[min_code, max_code]`, where `code` is in that range and below
/// `max_code`.
///
/// This is the BIGMIN decision table from "Multidimensional Range Search in
/// Dynamically Balanced Trees" (Tropf & Herzog), locked to 3D 10-bit codes
/// so the axis masks can be precomputed.
/// <https://www.vision-tools.com/h-tropf/multidimensionalrangequery.pdf>
pub fn next_morton(code: MortonCode, min_code: MortonCode, max_code: MortonCode) -> MortonCode {
    let mut big_min = 0;
    let mut min_code = min_code;
    let mut max_code = max_code;

    for cur_bit in (0..30).rev() {
        let mask = 1u32 << cur_bit;
        let code_set = code & mask != 0;
        let min_set = min_code & mask != 0;
        let max_set = max_code & mask != 0;

        match (code_set, min_set, max_set) {
            (false, false, true) => {
                // The bits of the current axis below the current bit.
                let lower_axis_bits = (mask - 1) & AXIS_MASKS[cur_bit % 3];

                // BIGMIN candidate: min with this axis's lower bits cleared
                // and the current bit set.
                big_min = (min_code & !lower_axis_bits) | mask;

                // Max continues with this axis's lower bits saturated and
                // the current bit cleared.
                max_code = (max_code | lower_axis_bits) & !mask;
            }
            (true, false, true) => {
                let lower_axis_bits = (mask - 1) & AXIS_MASKS[cur_bit % 3];
                min_code = mask | (min_code & !lower_axis_bits);
            }
            (false, true, true) => return min_code,
            (true, false, false) => return big_min,
            // Impossible while min <= max.
            (_, true, false) => debug_assert!(false, "next_morton: min > max"),
            _ => (),
        }
    }

    big_min
}

/// Iterates every Morton code in the inclusive box `[min_code, max_code]`,
/// in increasing code order.
///
/// Faster than walking coordinates and re-encoding, and always moves forward
/// in memory. A naive increment is attempted first; only at discontinuities
/// is the BIGMIN computation paid.
#[derive(Clone, Copy)]
pub struct MortonIter {
    min_code: MortonCode,
    max_code: MortonCode,
    next_code: Option<MortonCode>,
}

impl MortonIter {
    #[inline]
    pub fn new(min_code: MortonCode, max_code: MortonCode) -> Self {
        debug_assert!(min_code <= max_code);
        Self {
            min_code,
            max_code,
            next_code: Some(min_code),
        }
    }

    #[inline]
    fn in_range(&self, code: MortonCode) -> bool {
        for mask in AXIS_MASKS {
            let axis = code & mask;
            if axis < (self.min_code & mask) || axis > (self.max_code & mask) {
                return false;
            }
        }
        true
    }

    fn advance(&self, code: MortonCode) -> Option<MortonCode> {
        if code == self.max_code {
            return None;
        }

        // A naive increment can step outside of the box at a discontinuity,
        // so each candidate has to be range-checked.
        for i in 1..4 {
            if self.in_range(code + i) {
                return Some(code + i);
            }
        }

        // A discontinuity big enough to be worth the BIGMIN computation.
        Some(next_morton(code, self.min_code, self.max_code))
    }
}

impl Iterator for MortonIter {
    type Item = MortonCode;

    #[inline]
    fn next(&mut self) -> Option<MortonCode> {
        let code = self.next_code?;
        self.next_code = self.advance(code);
        Some(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::Rng;
    use std::collections::BTreeSet;

    #[test]
    fn roundtrip_all_low_coords() {
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..8 {
                    let c = IVec3::new(x, y, z);
                    assert_eq!(morton_to_coord(coord_to_morton(c)), c);
                }
            }
        }
    }

    #[test]
    fn roundtrip_limits() {
        let max = IVec3::splat(MAX_MORTON_COORD);
        assert_eq!(coord_to_morton(IVec3::ZERO), 0);
        assert_eq!(coord_to_morton(max), (1 << 30) - 1);
        assert_eq!(morton_to_coord(coord_to_morton(max)), max);
    }

    #[test]
    fn octants_are_contiguous_in_morton_space() {
        // The eight children of any node occupy consecutive codes.
        let base = coord_to_morton(IVec3::new(4, 6, 2));
        for i in 0..8u32 {
            let c = morton_to_coord(base + i);
            assert_eq!(coord_to_morton(c), base + i);
            assert!(are_siblings(base, base + i));
        }
        assert!(!are_siblings(base, base + 8));
    }

    #[test]
    fn neighbor_steps_match_coord_steps() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let c = IVec3::new(
                rng.gen_range(0..=MAX_MORTON_COORD),
                rng.gen_range(0..=MAX_MORTON_COORD),
                rng.gen_range(0..=MAX_MORTON_COORD),
            );
            let code = coord_to_morton(c);
            for n in Neighbor::ALL {
                let stepped = c + n.direction();
                let expected = if is_valid_morton_coord(stepped) {
                    coord_to_morton(stepped)
                } else {
                    code
                };
                assert_eq!(morton_neighbor(code, n), expected, "{c:?} {n:?}");
            }
        }
    }

    #[test]
    fn neighbor_saturates_at_edges() {
        let top = coord_to_morton(IVec3::new(5, 5, MAX_MORTON_COORD));
        assert_eq!(morton_neighbor(top, Neighbor::Top), top);

        let origin = coord_to_morton(IVec3::ZERO);
        assert_eq!(morton_neighbor(origin, Neighbor::Back), origin);
        assert_eq!(morton_neighbor(origin, Neighbor::Left), origin);
        assert_eq!(morton_neighbor(origin, Neighbor::Bottom), origin);
    }

    #[test]
    fn offset_morton_matches_coord_offsets() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let c = IVec3::new(
                rng.gen_range(8..56),
                rng.gen_range(8..56),
                rng.gen_range(8..56),
            );
            let offset = IVec3::new(
                rng.gen_range(-7..=7),
                rng.gen_range(-7..=7),
                rng.gen_range(-7..=7),
            );
            let offset_code = calc_morton_offset(offset);
            assert_eq!(
                morton_to_coord(offset_morton(coord_to_morton(c), offset_code)),
                c + offset
            );
        }
    }

    #[test]
    fn next_morton_stays_in_box_and_increases() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let min = IVec3::new(
                rng.gen_range(0..20),
                rng.gen_range(0..20),
                rng.gen_range(0..20),
            );
            let max = min
                + IVec3::new(
                    rng.gen_range(0..6),
                    rng.gen_range(0..6),
                    rng.gen_range(0..6),
                );
            let min_code = coord_to_morton(min);
            let max_code = coord_to_morton(max);

            let mut code = min_code;
            while code < max_code {
                let next = next_morton(code, min_code, max_code);
                assert!(next > code);
                let c = morton_to_coord(next);
                assert!(c.cmpge(min).all() && c.cmple(max).all());
                code = next;
            }
        }
    }

    #[test]
    fn morton_iter_covers_box_exactly() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let min = IVec3::new(
                rng.gen_range(0..12),
                rng.gen_range(0..12),
                rng.gen_range(0..12),
            );
            let max = min
                + IVec3::new(
                    rng.gen_range(0..5),
                    rng.gen_range(0..5),
                    rng.gen_range(0..5),
                );

            let mut expected = BTreeSet::new();
            for z in min.z..=max.z {
                for y in min.y..=max.y {
                    for x in min.x..=max.x {
                        expected.insert(coord_to_morton(IVec3::new(x, y, z)));
                    }
                }
            }

            let visited: Vec<_> =
                MortonIter::new(coord_to_morton(min), coord_to_morton(max)).collect();

            // Increasing order with no duplicates, covering the whole box.
            assert!(visited.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(visited.into_iter().collect::<BTreeSet<_>>(), expected);
        }
    }
}
