//! Solvent-accessible dot cloud generation.
//!
//! Samples the locus of the probe-sphere center rolled over the van der
//! Waals surface: for every atom, candidate dots are cast along a sphere
//! template at radius `vdw + probe` and kept only where the probe does not
//! overlap any other atom's expanded shell. Optional passes add
//! circumscribed arcs where two shells intersect, carve out cavity-adjacent
//! dots, and run the inverted island cull used for interior cavity lining.

use std::f32::consts::TAU;

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::context::RunContext;
use crate::error::SurfaceError;
use crate::geometry::{orthonormal_frame, try_normalized, within, R_SMALL4};
use crate::grid::SpatialGrid;
use crate::sphere::SphereTemplate;

/// Dot code: ordinary shell sample.
pub const DOT_PLAIN: i32 = 0;
/// Dot code: circumscribed intersection-arc sample, exempt from later culls.
pub const DOT_ARC: i32 = 1;

/// Surface sample cloud as three parallel arrays.
///
/// The arrays always have equal length; dots are removed by stable in-place
/// compaction, never by leaving holes.
#[derive(Debug, Default, Clone)]
pub struct DotSet {
    /// Sample positions.
    pub positions: Vec<Point3<f32>>,
    /// Outward unit normals, parallel to `positions`.
    pub normals: Vec<Vector3<f32>>,
    /// Per-dot code, [`DOT_PLAIN`] or [`DOT_ARC`].
    pub codes: Vec<i32>,
}

impl DotSet {
    fn with_capacity(cap: usize) -> Self {
        Self {
            positions: Vec::with_capacity(cap),
            normals: Vec::with_capacity(cap),
            codes: Vec::with_capacity(cap),
        }
    }

    /// Number of dots in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True when the set holds no dots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn push(&mut self, position: Point3<f32>, normal: Vector3<f32>, code: i32) {
        self.positions.push(position);
        self.normals.push(normal);
        self.codes.push(code);
    }

    /// Keep exactly the dots whose flag equals `keep_flagged`, preserving
    /// relative order of the survivors.
    pub(crate) fn retain_flagged(&mut self, flags: &[bool], keep_flagged: bool) {
        debug_assert_eq!(flags.len(), self.len());
        let mut w = 0;
        for r in 0..self.len() {
            if flags[r] == keep_flagged {
                if w != r {
                    self.positions[w] = self.positions[r];
                    self.normals[w] = self.normals[r];
                    self.codes[w] = self.codes[r];
                }
                w += 1;
            }
        }
        self.positions.truncate(w);
        self.normals.truncate(w);
        self.codes.truncate(w);
    }
}

/// Tuning knobs for dot generation, fixed for the duration of a job.
#[derive(Debug, Clone)]
pub struct SolventDotParams {
    /// Radius of the rolling solvent probe, in Angstroms.
    pub probe_radius: f32,
    /// Number of arc segments circumscribed around each shell intersection;
    /// 0 disables the pass.
    pub circumscribe: u32,
    /// Generate the solvent-accessible surface instead of the excluded one.
    pub surface_solvent: bool,
    /// Neighbor-count threshold of the inverted island cull; 0 disables.
    pub cavity_cull: i32,
    /// Largest van der Waals radius in the atom set; sizes the grids.
    pub max_vdw: f32,
    /// 0 disables cavity detection; 1 skips the island cull afterwards.
    pub cavity_mode: i32,
    /// Negative values mean "probe-radius multiples".
    pub cavity_radius: f32,
    /// Negative values mean "cavity-radius plus probe-radius multiples".
    pub cavity_cutoff: f32,
}

#[inline]
fn is_present(present: Option<&[bool]>, i: usize) -> bool {
    present.map_or(true, |m| m[i])
}

/// Exact-equality coincidence test for the duplicate-atom singularity rule.
///
/// Deliberately bitwise: two atoms count as twins only when both radius and
/// all three coordinates compare equal, matching the reference behavior.
#[inline]
fn coincident_twin(coords: &[Point3<f32>], radii: &[f32], a: usize, j: usize) -> bool {
    radii[j] == radii[a] && coords[j] == coords[a]
}

/// True when a later-indexed present twin of `a` exists among `candidates`.
/// Such an atom emits no dots itself; the trailing duplicate wins.
fn has_trailing_twin(
    coords: &[Point3<f32>],
    radii: &[f32],
    present: Option<&[bool]>,
    a: usize,
    candidates: &[u32],
) -> bool {
    candidates.iter().any(|&j| {
        let j = j as usize;
        j > a && is_present(present, j) && coincident_twin(coords, radii, a, j)
    })
}

/// Per-atom shell scan shared by the main and cavity passes: casts template
/// dots at radius `radii[a] + offset` and keeps those whose probe position
/// clears every other atom's `vdw + offset` shell.
fn scan_atom_shell(
    coords: &[Point3<f32>],
    radii: &[f32],
    present: Option<&[bool]>,
    grid: &SpatialGrid,
    sp: &SphereTemplate,
    a: usize,
    offset: f32,
) -> Vec<(Point3<f32>, Vector3<f32>)> {
    let mut scratch: Vec<u32> = Vec::new();
    grid.candidates(&coords[a], &mut scratch);
    if has_trailing_twin(coords, radii, present, a, &scratch) {
        return Vec::new();
    }

    let shell = radii[a] + offset;
    let mut accepted = Vec::new();
    'dots: for dir in &sp.dots {
        let v = coords[a] + dir * shell;
        grid.candidates(&v, &mut scratch);
        for &j in &scratch {
            let j = j as usize;
            if j == a || !is_present(present, j) {
                continue;
            }
            if coincident_twin(coords, radii, a, j) {
                continue;
            }
            if within(&coords[j], &v, radii[j] + offset) {
                continue 'dots;
            }
        }
        accepted.push((v, *dir));
    }
    accepted
}

/// Generate the solvent dot cloud for one atom set.
///
/// Accepted dots are capped at `n_atoms * n_template_dots + 2*circumscribe`;
/// zero present atoms yield an empty set, which is not an error.
pub fn generate(
    ctx: &RunContext,
    coords: &[Point3<f32>],
    radii: &[f32],
    present: Option<&[bool]>,
    sp: &SphereTemplate,
    params: &SolventDotParams,
) -> Result<DotSet, SurfaceError> {
    debug_assert_eq!(coords.len(), radii.len());
    let n = coords.len();
    let probe = params.probe_radius;
    let stop_dot = n * sp.n_dots() + 2 * params.circumscribe as usize;
    let mut dots = DotSet::with_capacity(stop_dot.min(n * sp.n_dots()));

    let grid = SpatialGrid::build(coords, params.max_vdw + probe, present);
    if ctx.interrupted() {
        return Err(SurfaceError::Interrupted);
    }

    // Main shell scan, one atom per task; results merged in index order so
    // the output is deterministic regardless of scheduling.
    let per_atom: Vec<Vec<(Point3<f32>, Vector3<f32>)>> = (0..n)
        .into_par_iter()
        .map(|a| {
            if ctx.interrupted() || !is_present(present, a) {
                return Vec::new();
            }
            scan_atom_shell(coords, radii, present, &grid, sp, a, probe)
        })
        .collect();
    if ctx.interrupted() {
        return Err(SurfaceError::Interrupted);
    }
    for (a, batch) in per_atom.into_iter().enumerate() {
        ctx.report_progress(a, n);
        for (pos, dir) in batch {
            if dots.len() >= stop_dot {
                break;
            }
            dots.push(pos, dir, DOT_PLAIN);
        }
    }

    if params.circumscribe > 0 && !params.surface_solvent {
        circumscribe_intersections(ctx, coords, radii, present, &grid, params, stop_dot, &mut dots)?;
    }

    if params.cavity_mode != 0 {
        remove_cavity_adjacent(ctx, coords, radii, present, sp, params, stop_dot, &mut dots)?;
    }

    if params.cavity_mode != 1
        && params.cavity_cull > 0
        && probe > 0.75
        && !params.surface_solvent
    {
        cull_islands_inverted(ctx, params.cavity_cull, probe, &mut dots)?;
    }

    debug!(n_dots = dots.len(), "solvent dot cloud generated");
    Ok(dots)
}

/// Sample evenly spaced points on the circle where two expanded shells
/// intersect, keeping those not covered by a third atom's shell.
///
/// The circle is recovered from the triangle with sides `vdw_a+probe`,
/// `vdw_b+probe` and the center distance: Heron's formula gives its area,
/// twice the area over the base is the circle radius, and the foot of the
/// height locates the circle center along the inter-atom axis.
#[allow(clippy::too_many_arguments)]
fn circumscribe_intersections(
    ctx: &RunContext,
    coords: &[Point3<f32>],
    radii: &[f32],
    present: Option<&[bool]>,
    coverage_grid: &SpatialGrid,
    params: &SolventDotParams,
    stop_dot: usize,
    dots: &mut DotSet,
) -> Result<(), SurfaceError> {
    let probe = params.probe_radius;
    let pair_grid = SpatialGrid::build(coords, 2.0 * (params.max_vdw + probe), present);
    let mut pairs: Vec<u32> = Vec::new();
    let mut cover: Vec<u32> = Vec::new();

    for a in 0..coords.len() {
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }
        if !is_present(present, a) {
            continue;
        }
        let shell_a = radii[a] + probe;

        pair_grid.candidates(&coords[a], &mut pairs);
        if has_trailing_twin(coords, radii, present, a, &pairs) {
            continue;
        }

        for idx in 0..pairs.len() {
            let b = pairs[idx] as usize;
            if b <= a || !is_present(present, b) {
                continue;
            }
            let shell_b = radii[b] + probe;
            let axis = coords[b] - coords[a];
            let dist = axis.norm();
            if dist <= R_SMALL4 || dist >= shell_a + shell_b {
                continue;
            }

            let s = (shell_a + shell_b + dist) * 0.5;
            let area = (s * (s - shell_a) * (s - shell_b) * (s - dist)).max(0.0).sqrt();
            let ring_radius = 2.0 * area / dist;
            let foot = (shell_a * shell_a - ring_radius * ring_radius).max(0.0).sqrt();
            let Some((az, u, v)) = orthonormal_frame(axis) else {
                continue;
            };
            let ring_center = coords[a] + az * foot;

            for seg in 0..=params.circumscribe {
                let theta = (seg as f32) * TAU / (params.circumscribe as f32);
                let pos = ring_center
                    + u * (theta.cos() * ring_radius)
                    + v * (theta.sin() * ring_radius);

                let mut covered = false;
                coverage_grid.candidates(&pos, &mut cover);
                for &j in &cover {
                    let j = j as usize;
                    if j == a || j == b || !is_present(present, j) {
                        continue;
                    }
                    if coincident_twin(coords, radii, a, j)
                        || coincident_twin(coords, radii, b, j)
                    {
                        continue;
                    }
                    if within(&coords[j], &pos, radii[j] + probe) {
                        covered = true;
                        break;
                    }
                }
                if covered || dots.len() >= stop_dot {
                    continue;
                }

                let (Some(to_a), Some(to_b)) = (
                    try_normalized(coords[a] - pos),
                    try_normalized(coords[b] - pos),
                ) else {
                    continue;
                };
                let Some(normal) = try_normalized(-(to_a + to_b)) else {
                    continue;
                };
                dots.push(pos, normal, DOT_ARC);
            }
        }
    }
    Ok(())
}

/// Generate an independent dot cloud at the cavity radius and drop every
/// main dot lying within the cavity cutoff of it.
fn remove_cavity_adjacent(
    ctx: &RunContext,
    coords: &[Point3<f32>],
    radii: &[f32],
    present: Option<&[bool]>,
    sp: &SphereTemplate,
    params: &SolventDotParams,
    stop_dot: usize,
    dots: &mut DotSet,
) -> Result<(), SurfaceError> {
    let probe = params.probe_radius;
    let mut cavity_radius = params.cavity_radius;
    if cavity_radius < 0.0 {
        cavity_radius = -probe * cavity_radius;
    }
    let mut cavity_cutoff = params.cavity_cutoff;
    if cavity_cutoff < 0.0 {
        cavity_cutoff = cavity_radius - cavity_cutoff * probe;
    }

    let grid = SpatialGrid::build(coords, params.max_vdw + cavity_radius, present);
    if ctx.interrupted() {
        return Err(SurfaceError::Interrupted);
    }
    let per_atom: Vec<Vec<(Point3<f32>, Vector3<f32>)>> = (0..coords.len())
        .into_par_iter()
        .map(|a| {
            if ctx.interrupted() || !is_present(present, a) {
                return Vec::new();
            }
            scan_atom_shell(coords, radii, present, &grid, sp, a, cavity_radius)
        })
        .collect();
    if ctx.interrupted() {
        return Err(SurfaceError::Interrupted);
    }

    let mut cavity_points: Vec<Point3<f32>> = Vec::new();
    for batch in per_atom {
        for (pos, _) in batch {
            if cavity_points.len() >= stop_dot {
                break;
            }
            cavity_points.push(pos);
        }
    }
    debug!(n_cavity = cavity_points.len(), "cavity dot cloud generated");

    let cavity_grid = SpatialGrid::build(&cavity_points, cavity_cutoff, None);
    let mut flags = vec![false; dots.len()];
    let mut scratch: Vec<u32> = Vec::new();
    for a in 0..dots.len() {
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }
        cavity_grid.candidates(&dots.positions[a], &mut scratch);
        for &j in &scratch {
            if within(&cavity_points[j as usize], &dots.positions[a], cavity_cutoff) {
                flags[a] = true;
                break;
            }
        }
    }
    dots.retain_flagged(&flags, false);
    Ok(())
}

/// Iterative island cull with the inverted selection: a dot is flagged when
/// it neighbors an already-flagged dot or has more than `cavity_cull`
/// neighbors within `1.5 * probe`; after the fixpoint, the *flagged* dots
/// are the survivors. This carves the interior cavity lining out of the
/// solid surface; changing the selection would change the mesh topology.
fn cull_islands_inverted(
    ctx: &RunContext,
    cavity_cull: i32,
    probe: f32,
    dots: &mut DotSet,
) -> Result<(), SurfaceError> {
    let cutoff = probe * 1.5;
    let grid = SpatialGrid::build(&dots.positions, cutoff, None);
    let mut flags = vec![false; dots.len()];
    let mut scratch: Vec<u32> = Vec::new();

    let mut changed = true;
    while changed {
        changed = false;
        for a in 0..dots.len() {
            if flags[a] {
                continue;
            }
            grid.candidates(&dots.positions[a], &mut scratch);
            let mut cnt = 0;
            for &j in &scratch {
                let j = j as usize;
                if j == a {
                    continue;
                }
                if within(&dots.positions[j], &dots.positions[a], cutoff) {
                    if flags[j] {
                        flags[a] = true;
                        changed = true;
                        break;
                    }
                    cnt += 1;
                    if cnt > cavity_cull {
                        flags[a] = true;
                        changed = true;
                        break;
                    }
                }
            }
        }
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }
    }
    dots.retain_flagged(&flags, true);
    Ok(())
}
