//! Uniform spatial hash grid for proximity queries.
//!
//! Space is partitioned into cubic cells of side `cutoff`; each cell stores
//! the indices of the points falling in it. A query enumerates the 3×3×3
//! block of cells around the query point, which is guaranteed to contain
//! every point within `cutoff` of it (no false negatives). The grid is a
//! coarse filter only: callers must re-check exact distances, since cell
//! membership admits points well beyond the cutoff.
//!
//! A grid is built once per point set and cutoff, queried read-only, and
//! discarded; it is never reused across a cutoff change.

use std::collections::HashMap;

use nalgebra::Point3;

use crate::geometry::R_SMALL4;

/// A uniform 3D cell grid over a point set.
pub struct SpatialGrid {
    inv_cell_size: f32,
    cells: HashMap<(i32, i32, i32), Vec<u32>>,
}

impl SpatialGrid {
    /// Build a grid with cell side `cutoff` over `points`.
    ///
    /// Points whose entry in `present` is `false` are never inserted and thus
    /// never returned by queries; indices of the remaining points are
    /// preserved. Non-positive cutoffs are clamped to a small epsilon so a
    /// degenerate request still yields a usable (if dense) grid.
    pub fn build(points: &[Point3<f32>], cutoff: f32, present: Option<&[bool]>) -> Self {
        let cell_size = cutoff.abs().max(R_SMALL4);
        let inv_cell_size = 1.0 / cell_size;
        let mut cells: HashMap<(i32, i32, i32), Vec<u32>> = HashMap::new();

        for (i, p) in points.iter().enumerate() {
            if let Some(mask) = present {
                if !mask[i] {
                    continue;
                }
            }
            cells
                .entry(Self::cell_of(p, inv_cell_size))
                .or_default()
                .push(i as u32);
        }

        Self {
            inv_cell_size,
            cells,
        }
    }

    #[inline]
    fn cell_of(p: &Point3<f32>, inv_cell_size: f32) -> (i32, i32, i32) {
        (
            (p.x * inv_cell_size).floor() as i32,
            (p.y * inv_cell_size).floor() as i32,
            (p.z * inv_cell_size).floor() as i32,
        )
    }

    /// Collect into `out` the indices of all points whose cell lies in the
    /// 3×3×3 neighborhood of the cell containing `p`.
    ///
    /// `out` is cleared first so a scratch buffer can be reused across a hot
    /// loop. The result is a superset of the points within the build cutoff
    /// of `p`; the exact distance test is the caller's job.
    pub fn candidates(&self, p: &Point3<f32>, out: &mut Vec<u32>) {
        out.clear();
        let (cx, cy, cz) = Self::cell_of(p, self.inv_cell_size);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(bucket) = self.cells.get(&(cx + dx, cy + dy, cz + dz)) {
                        out.extend_from_slice(bucket);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::within;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, seed: u64) -> Vec<Point3<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                )
            })
            .collect()
    }

    #[test]
    fn no_false_negatives_vs_brute_force() {
        let cutoff = 2.5;
        let points = random_points(200, 7);
        let grid = SpatialGrid::build(&points, cutoff, None);

        let mut scratch = Vec::new();
        for (i, p) in points.iter().enumerate() {
            grid.candidates(p, &mut scratch);
            for (j, q) in points.iter().enumerate() {
                if j != i && within(p, q, cutoff) {
                    assert!(
                        scratch.contains(&(j as u32)),
                        "point {j} within cutoff of {i} but not returned"
                    );
                }
            }
        }
    }

    #[test]
    fn present_mask_excludes_points() {
        let points = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.2, 0.0, 0.0),
        ];
        let present = vec![true, false, true];
        let grid = SpatialGrid::build(&points, 1.0, Some(&present));

        let mut out = Vec::new();
        grid.candidates(&points[0], &mut out);
        assert!(out.contains(&0));
        assert!(!out.contains(&1));
        assert!(out.contains(&2));
    }

    #[test]
    fn empty_point_set() {
        let grid = SpatialGrid::build(&[], 1.0, None);
        let mut out = vec![99];
        grid.candidates(&Point3::origin(), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn negative_cutoff_is_usable() {
        let points = random_points(50, 3);
        let grid = SpatialGrid::build(&points, -1.5, None);
        let mut out = Vec::new();
        grid.candidates(&points[0], &mut out);
        assert!(out.contains(&0));
    }
}
