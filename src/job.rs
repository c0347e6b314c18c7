//! Surface job orchestration.
//!
//! A [`SurfaceJob`] owns one atom set and its parameters, runs the full
//! pipeline (solvent dot generation, shell re-sampling, refinement,
//! triangulation) and leaves the mesh in [`SurfaceJob::result`]. A failed or
//! interrupted run always leaves the result empty; callers never observe a
//! partial mesh. Post-hoc per-vertex coloring is available through
//! [`SurfaceJob::colorize`].

use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::context::{RunContext, Stage};
use crate::error::SurfaceError;
use crate::geometry::{try_normalized, within, R_SMALL4};
use crate::grid::SpatialGrid;
use crate::solvent::{self, DotSet, SolventDotParams, DOT_PLAIN};
use crate::sphere;
use crate::triangulate;

/// Job parameters, immutable once a run starts.
#[derive(Debug, Clone)]
pub struct SurfaceParams {
    /// Radius of the rolling solvent probe, in Angstroms.
    pub probe_radius: f32,
    /// Quality level, -3 (miserable) through 4 (impractically fine).
    pub quality: i32,
    /// Surface variant, 0 (solid) through 6 (fully scribed).
    pub surface_type: i32,
    /// Produce the solvent-accessible surface instead of the excluded one.
    pub surface_solvent: bool,
    /// Neighbor-count threshold for the island cull; 0 disables.
    pub cavity_cull: i32,
    /// 0 disables cavity detection; 1 skips the island cull afterwards.
    pub cavity_mode: i32,
    /// Cavity probe radius; negative means probe-radius multiples.
    pub cavity_radius: f32,
    /// Cavity adjacency cutoff; negative means cavity-radius-relative.
    pub cavity_cutoff: f32,
    /// Curvature trim threshold on the neighborhood-averaged normal dot.
    pub trim_cutoff: f32,
    /// Curvature trim neighborhood, in point-separation multiples.
    pub trim_factor: f32,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            probe_radius: 1.4,
            quality: 0,
            surface_type: 0,
            surface_solvent: false,
            cavity_cull: 10,
            cavity_mode: 0,
            cavity_radius: 7.0,
            cavity_cutoff: -3.0,
            trim_cutoff: 0.2,
            trim_factor: 2.0,
        }
    }
}

const QUALITY_BEST_SEP: f32 = 0.25;
const QUALITY_NORMAL_SEP: f32 = 0.5;
const QUALITY_POOR_SEP: f32 = 0.85;
const QUALITY_MISERABLE_SEP: f32 = 2.0;

/// Discrete tuning derived from the quality level and surface type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityTuning {
    /// Target separation between surface points, in Angstroms.
    pub point_sep: f32,
    /// Sphere template level used to re-sample the probe shells.
    pub sphere_level: usize,
    /// Sphere template level used for the solvent dot cloud.
    pub solvent_sphere_level: usize,
    /// Arc segments scribed around shell intersections; 0 disables.
    pub circumscribe: u32,
}

impl QualityTuning {
    /// Fixed lookup keyed by quality level. Scribing only applies to
    /// excluded surfaces, so `circumscribe` is zeroed whenever
    /// `surface_solvent` is set.
    pub fn configure(quality: i32, surface_type: i32, surface_solvent: bool) -> Self {
        let mut t = if quality >= 4 {
            Self {
                point_sep: QUALITY_BEST_SEP / 4.0,
                sphere_level: 4,
                solvent_sphere_level: 4,
                circumscribe: 91,
            }
        } else {
            match quality {
                3 => Self {
                    point_sep: QUALITY_BEST_SEP / 3.0,
                    sphere_level: 4,
                    solvent_sphere_level: 3,
                    circumscribe: 71,
                },
                2 => Self {
                    point_sep: QUALITY_BEST_SEP / 2.0,
                    sphere_level: 3,
                    solvent_sphere_level: 3,
                    circumscribe: 41,
                },
                1 => Self {
                    point_sep: QUALITY_BEST_SEP,
                    sphere_level: 2,
                    solvent_sphere_level: 3,
                    circumscribe: 40,
                },
                0 => Self {
                    point_sep: QUALITY_NORMAL_SEP,
                    sphere_level: 1,
                    solvent_sphere_level: 2,
                    circumscribe: if surface_type == 6 { 30 } else { 0 },
                },
                -1 => Self {
                    point_sep: QUALITY_POOR_SEP,
                    sphere_level: 1,
                    solvent_sphere_level: 2,
                    circumscribe: if surface_type == 6 { 10 } else { 0 },
                },
                -2 => Self {
                    point_sep: QUALITY_POOR_SEP * 1.5,
                    sphere_level: 1,
                    solvent_sphere_level: 1,
                    circumscribe: 0,
                },
                -3 => Self {
                    point_sep: QUALITY_MISERABLE_SEP,
                    sphere_level: 1,
                    solvent_sphere_level: 1,
                    circumscribe: 0,
                },
                _ => Self {
                    point_sep: QUALITY_MISERABLE_SEP * 1.18,
                    sphere_level: 0,
                    solvent_sphere_level: 1,
                    circumscribe: 0,
                },
            }
        };
        if surface_solvent {
            t.circumscribe = 0;
        }
        t
    }
}

/// Output mesh of a completed run.
///
/// `vertex_colors` and `vertex_alphas` are only filled by
/// [`SurfaceJob::colorize`]; a uniform assignment collapses to the scalar
/// `one_color`/`one_alpha` and the per-vertex array stays `None`, so
/// consumers must handle both shapes.
#[derive(Debug)]
pub struct SurfaceResult {
    /// Final surface vertices.
    pub vertices: Vec<Point3<f32>>,
    /// Outward unit normals, parallel to `vertices`.
    pub normals: Vec<Vector3<f32>>,
    /// Flat triangle index array, three entries per triangle.
    pub triangles: Vec<u32>,
    /// Optional strip encoding of the triangles; `None` when plain.
    pub strip_lengths: Option<Vec<u32>>,
    /// Per-vertex colors, when coloring did not collapse to a scalar.
    pub vertex_colors: Option<Vec<i32>>,
    /// Uniform color, or -1 when unset or per-vertex.
    pub one_color: i32,
    /// Per-vertex alphas, when coloring did not collapse to a scalar.
    pub vertex_alphas: Option<Vec<f32>>,
    /// Uniform alpha, or -1.0 when unset or per-vertex.
    pub one_alpha: f32,
}

impl Default for SurfaceResult {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            normals: Vec::new(),
            triangles: Vec::new(),
            strip_lengths: None,
            vertex_colors: None,
            one_color: -1,
            vertex_alphas: None,
            one_alpha: -1.0,
        }
    }
}

impl SurfaceResult {
    /// Number of vertices in the final mesh.
    pub fn n_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles in the final mesh.
    pub fn n_triangles(&self) -> usize {
        self.triangles.len() / 3
    }

    fn purge(&mut self) {
        *self = Self::default();
    }
}

/// One surface computation over a fixed atom set.
pub struct SurfaceJob {
    coords: Vec<Point3<f32>>,
    radii: Vec<f32>,
    present: Option<Vec<bool>>,
    max_vdw: f32,
    params: SurfaceParams,
    tuning: QualityTuning,
    /// Output mesh; empty until a successful [`run`](Self::run).
    pub result: SurfaceResult,
}

impl SurfaceJob {
    /// # Panics
    /// When `radii` or a supplied `present` mask disagree with `coords` in
    /// length.
    pub fn new(
        coords: Vec<Point3<f32>>,
        radii: Vec<f32>,
        present: Option<Vec<bool>>,
        params: SurfaceParams,
    ) -> Self {
        assert_eq!(coords.len(), radii.len());
        if let Some(mask) = &present {
            assert_eq!(mask.len(), coords.len());
        }
        let max_vdw = radii.iter().copied().fold(0.0f32, f32::max);
        let tuning =
            QualityTuning::configure(params.quality, params.surface_type, params.surface_solvent);
        Self {
            coords,
            radii,
            present,
            max_vdw,
            params,
            tuning,
            result: SurfaceResult::default(),
        }
    }

    /// The discrete quality tuning this job runs with.
    pub fn tuning(&self) -> &QualityTuning {
        &self.tuning
    }

    fn n_present(&self) -> usize {
        match &self.present {
            Some(mask) => mask.iter().filter(|&&p| p).count(),
            None => self.coords.len(),
        }
    }

    /// Run the full pipeline. On error the result is purged so callers
    /// never see a partial mesh.
    pub fn run(&mut self, ctx: &RunContext) -> Result<(), SurfaceError> {
        self.result.purge();
        let outcome = self.run_inner(ctx);
        if outcome.is_err() {
            self.result.purge();
        }
        outcome
    }

    fn run_inner(&mut self, ctx: &RunContext) -> Result<(), SurfaceError> {
        let surface_type = self.params.surface_type;
        let point_sep = self.tuning.point_sep;
        let circumscribe = self.tuning.circumscribe;
        let ssp = sphere::template(self.tuning.solvent_sphere_level);
        let sp = sphere::template(self.tuning.sphere_level);

        ctx.enter_stage(Stage::DotGeneration);
        let dot_params = SolventDotParams {
            probe_radius: self.params.probe_radius,
            circumscribe,
            surface_solvent: self.params.surface_solvent,
            cavity_cull: self.params.cavity_cull,
            max_vdw: self.max_vdw,
            cavity_mode: self.params.cavity_mode,
            cavity_radius: self.params.cavity_radius,
            cavity_cutoff: self.params.cavity_cutoff,
        };
        let sol = solvent::generate(
            ctx,
            &self.coords,
            &self.radii,
            self.present.as_deref(),
            ssp,
            &dot_params,
        )?;

        ctx.enter_stage(Stage::Refinement);
        let capacity = self.n_present().max(1) * sp.n_dots().max(ssp.n_dots());
        let mut vertices: Vec<Point3<f32>> = Vec::with_capacity(capacity.min(1 << 20));
        let mut normals: Vec<Vector3<f32>> = Vec::with_capacity(capacity.min(1 << 20));
        let mut probe_radius = self.params.probe_radius;

        if !self.params.surface_solvent {
            // Minimum probe radius the resampling can resolve.
            if probe_radius < 2.5 * point_sep {
                probe_radius = 2.5 * point_sep;
            }
            self.resample_probe_shells(
                ctx,
                &sol,
                sp,
                probe_radius,
                &mut vertices,
                &mut normals,
            )?;
        } else {
            vertices.extend_from_slice(&sol.positions);
            normals.extend_from_slice(&sol.normals);
        }
        drop(sol);
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }

        let ref_count = if surface_type == 0 && circumscribe > 0 {
            2
        } else {
            1
        };
        for _ in 0..ref_count {
            if surface_type == 0 && circumscribe > 0 && !vertices.is_empty() {
                self.fill_gaps(ctx, point_sep, &mut vertices, &mut normals)?;
                self.retrim_to_atoms(ctx, probe_radius, &mut vertices, &mut normals)?;
            }
            if !vertices.is_empty() {
                collapse_points(ctx, surface_type, point_sep, &mut vertices, &mut normals)?;
            }
            if surface_type != 3
                && !vertices.is_empty()
                && self.params.trim_cutoff > 0.0
                && self.params.trim_factor > 0.0
            {
                self.trim_high_curvature(ctx, point_sep, &mut vertices, &mut normals)?;
            }
            if ctx.interrupted() {
                return Err(SurfaceError::Interrupted);
            }
        }

        vertices.shrink_to_fit();
        normals.shrink_to_fit();

        ctx.enter_stage(Stage::Triangulation);
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }
        if !vertices.is_empty() && surface_type != 1 {
            let mut cutoff = point_sep * 5.0;
            if cutoff > probe_radius && !self.params.surface_solvent {
                cutoff = probe_radius;
            }
            let mesh =
                triangulate::triangulate(&vertices, &normals, cutoff, self.params.cavity_mode);
            self.result.triangles = mesh.indices;
            self.result.strip_lengths = mesh.strip_lengths;
        }
        debug!(
            n_vertices = vertices.len(),
            n_triangles = self.result.triangles.len() / 3,
            "surface job complete"
        );
        self.result.vertices = vertices;
        self.result.normals = normals;
        Ok(())
    }

    /// Re-sample each solvent dot's probe sphere into excluded-surface
    /// vertices: a candidate survives when it is not buried inside any other
    /// probe position and still hugs a present atom's shell.
    fn resample_probe_shells(
        &self,
        ctx: &RunContext,
        sol: &DotSet,
        sp: &sphere::SphereTemplate,
        probe_radius: f32,
        vertices: &mut Vec<Point3<f32>>,
        normals: &mut Vec<Vector3<f32>>,
    ) -> Result<(), SurfaceError> {
        let surface_type = self.params.surface_type;
        let solv_tole = self.tuning.point_sep * 0.04;
        let probe_rad_more = probe_radius * (1.0 + solv_tole);
        let probe_rad_less = match surface_type {
            0 | 3 | 4 | 5 | 6 => probe_radius,
            _ => probe_radius * (1.0 - solv_tole),
        };

        // Types 5 and 6 double-weight the probe centers themselves, pulled
        // back onto the surface along their normals.
        if surface_type >= 5 {
            for a in 0..sol.len() {
                vertices.push(sol.positions[a] - sol.normals[a] * probe_radius);
                normals.push(sol.normals[a]);
            }
        }
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }

        let atom_grid = SpatialGrid::build(
            &self.coords,
            self.max_vdw + probe_rad_more,
            self.present.as_deref(),
        );
        let solv_grid = SpatialGrid::build(&sol.positions, probe_rad_less, None);
        let offsets: Vec<Vector3<f32>> =
            sp.dots.iter().map(|d| d * probe_radius).collect();

        // One task per solvent dot; batches are merged in index order so the
        // vertex ordering is deterministic regardless of scheduling.
        let per_dot: Vec<Vec<(Point3<f32>, Vector3<f32>)>> = (0..sol.len())
            .into_par_iter()
            .map(|a| {
                // Type 6 surfaces grow only from the scribed arc dots.
                if ctx.interrupted() || (sol.codes[a] == DOT_PLAIN && surface_type >= 6) {
                    return Vec::new();
                }
                let mut out = Vec::new();
                let mut dot_nbrs: Vec<u32> = Vec::new();
                let mut atom_nbrs: Vec<u32> = Vec::new();
                for (b, off) in offsets.iter().enumerate() {
                    let v = sol.positions[a] + off;
                    solv_grid.candidates(&v, &mut dot_nbrs);
                    let buried = dot_nbrs.iter().any(|&jj| {
                        jj as usize != a
                            && within(&sol.positions[jj as usize], &v, probe_rad_less)
                    });
                    if buried {
                        continue;
                    }
                    atom_grid.candidates(&v, &mut atom_nbrs);
                    let hugs_atom = atom_nbrs.iter().any(|&j| {
                        let j = j as usize;
                        within(&self.coords[j], &v, self.radii[j] + probe_rad_more)
                    });
                    if hugs_atom {
                        out.push((v, -sp.dots[b]));
                    }
                }
                out
            })
            .collect();
        if ctx.interrupted() {
            return Err(SurfaceError::Interrupted);
        }

        let total = sol.len();
        for (a, batch) in per_dot.into_iter().enumerate() {
            ctx.report_progress(a, total);
            for (v, n) in batch {
                vertices.push(v);
                normals.push(n);
            }
        }
        Ok(())
    }

    /// Synthesize midpoints where nearby vertices diverge sharply in normal
    /// direction or leave a gap with no third point near their midpoint.
    /// New vertices are appended after the scan, never mid-scan.
    fn fill_gaps(
        &self,
        ctx: &RunContext,
        point_sep: f32,
        vertices: &mut Vec<Point3<f32>>,
        normals: &mut Vec<Vector3<f32>>,
    ) -> Result<(), SurfaceError> {
        let neighborhood = 2.6 * point_sep;
        let dot_cutoff = 0.666;
        let insert_cutoff = 1.1 * point_sep;
        let map_cutoff = neighborhood.max(2.9 * point_sep);

        let grid = SpatialGrid::build(vertices, map_cutoff, None);
        let mut nbrs: Vec<u32> = Vec::new();
        let mut mid_nbrs: Vec<u32> = Vec::new();
        let mut new_points: Vec<Point3<f32>> = Vec::new();
        let mut new_normals: Vec<Vector3<f32>> = Vec::new();

        for a in 0..vertices.len() {
            if ctx.interrupted() {
                return Err(SurfaceError::Interrupted);
            }
            grid.candidates(&vertices[a], &mut nbrs);
            for &j in &nbrs {
                let j = j as usize;
                if j <= a || !within(&vertices[j], &vertices[a], map_cutoff) {
                    continue;
                }
                let mid = Point3::from((vertices[a].coords + vertices[j].coords) * 0.5);
                let divergent = normals[j].dot(&normals[a]) < dot_cutoff
                    && within(&vertices[j], &vertices[a], neighborhood);
                let add_new = if divergent {
                    true
                } else {
                    grid.candidates(&mid, &mut mid_nbrs);
                    !mid_nbrs.iter().any(|&jj| {
                        jj as usize != j
                            && within(&vertices[jj as usize], &mid, insert_cutoff)
                    })
                };
                if add_new {
                    if let Some(n) = try_normalized(normals[a] + normals[j]) {
                        new_points.push(mid);
                        new_normals.push(n);
                    }
                }
            }
        }
        debug!(n_new = new_points.len(), "gap fill");
        vertices.extend_from_slice(&new_points);
        normals.extend_from_slice(&new_normals);
        Ok(())
    }

    /// Drop vertices that drifted away from every present atom; scribed
    /// solid surfaces accumulate such strays around the arc seams.
    fn retrim_to_atoms(
        &self,
        ctx: &RunContext,
        probe_radius: f32,
        vertices: &mut Vec<Point3<f32>>,
        normals: &mut Vec<Vector3<f32>>,
    ) -> Result<(), SurfaceError> {
        let cutoff = 0.5 * probe_radius;
        let grid = SpatialGrid::build(
            &self.coords,
            self.max_vdw + probe_radius,
            self.present.as_deref(),
        );
        let mut nbrs: Vec<u32> = Vec::new();
        let mut keep = vec![false; vertices.len()];
        for (a, v) in vertices.iter().enumerate() {
            if ctx.interrupted() {
                return Err(SurfaceError::Interrupted);
            }
            grid.candidates(v, &mut nbrs);
            keep[a] = nbrs.iter().any(|&j| {
                let j = j as usize;
                within(&self.coords[j], v, self.radii[j] + cutoff)
            });
        }
        compact(vertices, normals, &keep, false);
        Ok(())
    }

    /// Iteratively drop vertices whose neighborhood-averaged normal
    /// agreement falls below the trim threshold.
    fn trim_high_curvature(
        &self,
        ctx: &RunContext,
        point_sep: f32,
        vertices: &mut Vec<Point3<f32>>,
        normals: &mut Vec<Vector3<f32>>,
    ) -> Result<(), SurfaceError> {
        let mut trim_cutoff = self.params.trim_cutoff;
        let neighborhood = self.params.trim_factor * point_sep;
        if self.params.surface_type == 6 {
            trim_cutoff *= 1.5;
        }

        let mut nbrs: Vec<u32> = Vec::new();
        loop {
            let grid = SpatialGrid::build(vertices, neighborhood, None);
            let mut keep = vec![true; vertices.len()];
            let mut repeat = false;
            for a in 0..vertices.len() {
                if ctx.interrupted() {
                    return Err(SurfaceError::Interrupted);
                }
                if !keep[a] {
                    continue;
                }
                grid.candidates(&vertices[a], &mut nbrs);
                let mut n_nbr = 0usize;
                let mut dot_sum = 0.0f32;
                for &j in &nbrs {
                    let j = j as usize;
                    if j != a && keep[j] && within(&vertices[j], &vertices[a], neighborhood) {
                        dot_sum += normals[j].dot(&normals[a]);
                        n_nbr += 1;
                    }
                }
                if n_nbr > 0 && dot_sum / (n_nbr as f32) < trim_cutoff {
                    keep[a] = false;
                    repeat = true;
                }
            }
            compact(vertices, normals, &keep, true);
            if !repeat {
                return Ok(());
            }
        }
    }

    /// Assign per-vertex colors (and optionally alphas) from the nearest
    /// atom by surface distance. Uniform assignments collapse to the scalar
    /// fields; mixed alphas also force the per-vertex colors to be kept, so
    /// the two arrays stay consistent for blending consumers.
    pub fn colorize(&mut self, colors: &[i32], transp: Option<&[f32]>) {
        assert_eq!(colors.len(), self.coords.len());
        if let Some(transp) = transp {
            assert_eq!(transp.len(), self.coords.len());
        }
        let n = self.result.vertices.len();
        if n == 0 {
            return;
        }
        self.result.one_color = -1;
        self.result.one_alpha = -1.0;

        let grid = SpatialGrid::build(
            &self.coords,
            2.0 * self.max_vdw + self.params.probe_radius,
            self.present.as_deref(),
        );

        let nearest: Vec<i32> = self
            .result
            .vertices
            .par_iter()
            .map(|v| {
                let mut nbrs: Vec<u32> = Vec::new();
                grid.candidates(v, &mut nbrs);
                let mut best = -1i32;
                let mut best_dist = f32::MAX;
                for &j in &nbrs {
                    let j = j as usize;
                    let dist = (v - self.coords[j]).norm() - self.radii[j];
                    if dist < best_dist {
                        best = j as i32;
                        best_dist = dist;
                    }
                }
                best
            })
            .collect();

        let vc: Vec<i32> = nearest
            .iter()
            .map(|&i0| if i0 >= 0 { colors[i0 as usize] } else { -1 })
            .collect();
        let mut one_color_flag = true;
        let mut c0 = -1i32;
        for &c1 in &vc {
            if c0 >= 0 {
                if c0 != c1 {
                    one_color_flag = false;
                }
            } else {
                c0 = c1;
            }
        }

        let mut one_alpha_flag = true;
        let mut a0 = -1.0f32;
        let va: Option<Vec<f32>> = transp.map(|transp| {
            let va: Vec<f32> = nearest
                .iter()
                .map(|&i0| {
                    if i0 >= 0 {
                        1.0 - transp[i0 as usize]
                    } else {
                        -1.0
                    }
                })
                .collect();
            for &a1 in &va {
                if a0 >= 0.0 {
                    if a0 != a1 {
                        one_alpha_flag = false;
                    }
                } else {
                    a0 = a1;
                }
            }
            va
        });

        if one_alpha_flag {
            self.result.one_alpha = a0;
            self.result.vertex_alphas = None;
        } else {
            one_color_flag = false;
            self.result.vertex_alphas = va;
        }
        if one_color_flag {
            self.result.one_color = c0;
            self.result.vertex_colors = None;
        } else {
            self.result.vertex_colors = Some(vc);
        }
    }
}

/// Merge vertices closer than `point_sep` until no pair remains, averaging
/// positions and accumulating normals, then renormalize the survivors.
/// Types >= 3 collapse onto the true nearest neighbor with an index
/// tie-break for determinism; lower types take the first neighbor found.
fn collapse_points(
    ctx: &RunContext,
    surface_type: i32,
    point_sep: f32,
    vertices: &mut Vec<Point3<f32>>,
    normals: &mut Vec<Vector3<f32>>,
) -> Result<(), SurfaceError> {
    let min_dot = 0.1f32;
    let min_sep2 = point_sep * point_sep;
    let mut nbrs: Vec<u32> = Vec::new();
    let mut repeat = true;

    while repeat {
        repeat = false;
        let mut keep = vec![true; vertices.len()];

        if surface_type >= 3 {
            let grid = SpatialGrid::build(vertices, point_sep + 0.05, None);
            for a in 0..vertices.len() {
                if ctx.interrupted() {
                    return Err(SurfaceError::Interrupted);
                }
                if !keep[a] {
                    continue;
                }
                grid.candidates(&vertices[a], &mut nbrs);
                let mut jj = usize::MAX;
                let mut nearest = point_sep + 1.0;
                for &j in &nbrs {
                    let j = j as usize;
                    if j <= a || !keep[j] || normals[j].dot(&normals[a]) <= min_dot {
                        continue;
                    }
                    let d2 = (vertices[j] - vertices[a]).norm_squared();
                    if d2 > min_sep2 {
                        continue;
                    }
                    repeat = true;
                    let dist = d2.sqrt();
                    if dist < nearest || (j < jj && (dist - nearest).abs() < R_SMALL4) {
                        jj = j;
                        nearest = dist;
                    }
                }
                if jj != usize::MAX {
                    keep[jj] = false;
                    normals[a] = normals[a] + normals[jj];
                    vertices[a] =
                        Point3::from((vertices[a].coords + vertices[jj].coords) * 0.5);
                }
            }
        } else {
            let grid = SpatialGrid::build(vertices, point_sep, None);
            for a in 0..vertices.len() {
                if ctx.interrupted() {
                    return Err(SurfaceError::Interrupted);
                }
                if !keep[a] {
                    continue;
                }
                grid.candidates(&vertices[a], &mut nbrs);
                for &j in &nbrs {
                    let j = j as usize;
                    if j == a || !keep[j] || !within(&vertices[j], &vertices[a], point_sep) {
                        continue;
                    }
                    keep[j] = false;
                    normals[a] = normals[a] + normals[j];
                    vertices[a] = Point3::from((vertices[a].coords + vertices[j].coords) * 0.5);
                    repeat = true;
                }
            }
        }

        compact(vertices, normals, &keep, true);
    }
    Ok(())
}

/// Stable in-place compaction of the vertex and normal arrays; optionally
/// renormalizes surviving normals (accumulated during collapsing).
fn compact(
    vertices: &mut Vec<Point3<f32>>,
    normals: &mut Vec<Vector3<f32>>,
    keep: &[bool],
    renormalize: bool,
) {
    debug_assert_eq!(keep.len(), vertices.len());
    let mut w = 0;
    for r in 0..keep.len() {
        if keep[r] {
            vertices[w] = vertices[r];
            normals[w] = if renormalize {
                try_normalized(normals[r]).unwrap_or(normals[r])
            } else {
                normals[r]
            };
            w += 1;
        }
    }
    vertices.truncate(w);
    normals.truncate(w);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn run_job(
        coords: Vec<Point3<f32>>,
        radii: Vec<f32>,
        present: Option<Vec<bool>>,
        params: SurfaceParams,
    ) -> SurfaceJob {
        let ctx = RunContext::new();
        let mut job = SurfaceJob::new(coords, radii, present, params);
        job.run(&ctx).expect("job should succeed");
        job
    }

    /// Count connected components among the vertices referenced by the
    /// triangle list, with union-find over shared vertices.
    fn n_mesh_components(n_vertices: usize, triangles: &[u32]) -> usize {
        fn find(parent: &mut [u32], mut x: u32) -> u32 {
            while parent[x as usize] != x {
                parent[x as usize] = parent[parent[x as usize] as usize];
                x = parent[x as usize];
            }
            x
        }
        let mut parent: Vec<u32> = (0..n_vertices as u32).collect();
        let mut used = vec![false; n_vertices];
        for tri in triangles.chunks_exact(3) {
            for &v in tri {
                used[v as usize] = true;
            }
            for &v in &tri[1..] {
                let r0 = find(&mut parent, tri[0]);
                let r1 = find(&mut parent, v);
                parent[r1 as usize] = r0;
            }
        }
        let mut roots: Vec<u32> = (0..n_vertices as u32)
            .filter(|&v| used[v as usize])
            .map(|v| find(&mut parent, v))
            .collect();
        roots.sort_unstable();
        roots.dedup();
        roots.len()
    }

    #[test]
    fn quality_table_matches_levels() {
        let t = QualityTuning::configure(0, 0, false);
        assert_eq!(t.point_sep, 0.5);
        assert_eq!(t.sphere_level, 1);
        assert_eq!(t.solvent_sphere_level, 2);
        assert_eq!(t.circumscribe, 0);

        let t = QualityTuning::configure(2, 0, false);
        assert_eq!(t.circumscribe, 41);
        let t = QualityTuning::configure(0, 6, false);
        assert_eq!(t.circumscribe, 30);
        // Accessible-surface jobs never scribe arcs.
        let t = QualityTuning::configure(2, 0, true);
        assert_eq!(t.circumscribe, 0);
        // Below the table the coarsest settings apply.
        let t = QualityTuning::configure(-7, 0, false);
        assert_eq!(t.sphere_level, 0);
    }

    #[test]
    fn zero_atoms_runs_clean() {
        let job = run_job(Vec::new(), Vec::new(), None, SurfaceParams::default());
        assert_eq!(job.result.n_vertices(), 0);
        assert_eq!(job.result.n_triangles(), 0);
    }

    #[test]
    fn accessible_surface_is_the_dot_cloud() {
        let params = SurfaceParams {
            surface_solvent: true,
            ..SurfaceParams::default()
        };
        let job = run_job(
            vec![Point3::origin()],
            vec![1.7],
            None,
            params,
        );
        let expected = sphere::template(job.tuning().solvent_sphere_level).n_dots();
        assert_eq!(job.result.n_vertices(), expected);
        assert_eq!(job.tuning().circumscribe, 0);
        for v in &job.result.vertices {
            let d = (v - Point3::origin()).norm();
            assert!((d - 3.1).abs() < 1e-3, "vertex at {d}, expected 3.1");
        }
        assert!(job.result.n_triangles() > 0);
    }

    #[test]
    fn dumbbell_produces_connected_mesh() {
        let job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            None,
            SurfaceParams::default(),
        );
        assert!(job.result.n_vertices() > 0);
        assert!(job.result.n_triangles() > 0);
        assert_eq!(job.result.vertices.len(), job.result.normals.len());
        for v in &job.result.vertices {
            let hugs = job
                .coords
                .iter()
                .zip(&job.radii)
                .any(|(c, r)| (v - c).norm() <= r + job.params.probe_radius + 0.1);
            assert!(hugs, "vertex floats free of both atoms");
        }
        // The two lobes merge into a single surface, so the triangles must
        // form one connected component.
        assert_eq!(
            n_mesh_components(job.result.n_vertices(), &job.result.triangles),
            1
        );
    }

    #[test]
    fn present_mask_hides_an_atom() {
        let job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            Some(vec![true, false]),
            SurfaceParams::default(),
        );
        // The surface must hug only the present atom.
        for v in &job.result.vertices {
            assert!((v - Point3::origin()).norm() <= 1.5 + 1.4 + 0.1);
        }
    }

    #[test]
    fn repeated_runs_are_identical() {
        let mut rng = StdRng::seed_from_u64(11);
        let coords: Vec<Point3<f32>> = (0..5)
            .map(|_| {
                Point3::new(
                    rng.gen_range(-4.0..4.0),
                    rng.gen_range(-4.0..4.0),
                    rng.gen_range(-4.0..4.0),
                )
            })
            .collect();
        let radii: Vec<f32> = (0..5).map(|_| rng.gen_range(1.2..1.9)).collect();

        let a = run_job(coords.clone(), radii.clone(), None, SurfaceParams::default());
        let b = run_job(coords, radii, None, SurfaceParams::default());
        assert_eq!(a.result.vertices, b.result.vertices);
        assert_eq!(a.result.normals, b.result.normals);
        assert_eq!(a.result.triangles, b.result.triangles);
    }

    #[test]
    fn interrupt_leaves_empty_result() {
        let ctx = RunContext::new();
        ctx.request_interrupt();
        let mut job = SurfaceJob::new(
            vec![Point3::origin()],
            vec![1.5],
            None,
            SurfaceParams::default(),
        );
        assert!(matches!(job.run(&ctx), Err(SurfaceError::Interrupted)));
        assert_eq!(job.result.n_vertices(), 0);
        assert_eq!(job.result.normals.len(), 0);
        assert_eq!(job.result.n_triangles(), 0);
    }

    // An interrupt raised while a refinement phase is running must abort it
    // at the next poll point without mutating the vertex arrays.
    #[test]
    fn interrupt_aborts_each_refinement_phase() {
        let job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            None,
            SurfaceParams::default(),
        );
        let mut vertices = job.result.vertices.clone();
        let mut normals = job.result.normals.clone();
        assert!(!vertices.is_empty());
        let n_before = vertices.len();
        let point_sep = job.tuning().point_sep;
        let probe = job.params.probe_radius;

        let live = RunContext::new();
        let dot_params = SolventDotParams {
            probe_radius: probe,
            circumscribe: job.tuning().circumscribe,
            surface_solvent: false,
            cavity_cull: job.params.cavity_cull,
            max_vdw: 1.5,
            cavity_mode: 0,
            cavity_radius: 7.0,
            cavity_cutoff: -3.0,
        };
        let sol = solvent::generate(
            &live,
            &job.coords,
            &job.radii,
            None,
            sphere::template(job.tuning().solvent_sphere_level),
            &dot_params,
        )
        .expect("dot generation should succeed");

        let ctx = RunContext::new();
        ctx.request_interrupt();

        let sp = sphere::template(job.tuning().sphere_level);
        let err = job.resample_probe_shells(&ctx, &sol, sp, probe, &mut vertices, &mut normals);
        assert_eq!(err.unwrap_err(), SurfaceError::Interrupted);
        let err = job.fill_gaps(&ctx, point_sep, &mut vertices, &mut normals);
        assert_eq!(err.unwrap_err(), SurfaceError::Interrupted);
        let err = job.retrim_to_atoms(&ctx, probe, &mut vertices, &mut normals);
        assert_eq!(err.unwrap_err(), SurfaceError::Interrupted);
        let err = collapse_points(&ctx, 0, point_sep, &mut vertices, &mut normals);
        assert_eq!(err.unwrap_err(), SurfaceError::Interrupted);
        let err = job.trim_high_curvature(&ctx, point_sep, &mut vertices, &mut normals);
        assert_eq!(err.unwrap_err(), SurfaceError::Interrupted);

        assert_eq!(vertices.len(), n_before);
        assert_eq!(normals.len(), n_before);
    }

    #[test]
    fn failed_run_purges_a_previous_result() {
        let ctx = RunContext::new();
        let mut job = SurfaceJob::new(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            None,
            SurfaceParams::default(),
        );
        job.run(&ctx).expect("first run should succeed");
        assert!(job.result.n_vertices() > 0);
        assert!(job.result.n_triangles() > 0);

        // The mesh from the first run must not survive a failed second run.
        ctx.request_interrupt();
        assert!(matches!(job.run(&ctx), Err(SurfaceError::Interrupted)));
        assert_eq!(job.result.n_vertices(), 0);
        assert_eq!(job.result.normals.len(), 0);
        assert_eq!(job.result.n_triangles(), 0);

        ctx.clear_interrupt();
        job.run(&ctx).expect("cleared context runs again");
        assert!(job.result.n_vertices() > 0);
    }

    #[test]
    #[should_panic]
    fn colorize_rejects_short_color_table() {
        let mut job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            None,
            SurfaceParams::default(),
        );
        job.colorize(&[1], None);
    }

    #[test]
    fn uniform_coloring_collapses_to_scalar() {
        let mut job = run_job(
            vec![Point3::origin()],
            vec![1.5],
            None,
            SurfaceParams::default(),
        );
        job.colorize(&[7], None);
        assert_eq!(job.result.one_color, 7);
        assert!(job.result.vertex_colors.is_none());
        assert!(job.result.vertex_alphas.is_none());
        assert_eq!(job.result.one_alpha, -1.0);
    }

    #[test]
    fn mixed_coloring_stays_per_vertex() {
        let mut job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            None,
            SurfaceParams::default(),
        );
        job.colorize(&[1, 2], None);
        let vc = job.result.vertex_colors.as_ref().expect("per-vertex colors");
        assert_eq!(vc.len(), job.result.n_vertices());
        assert!(vc.iter().all(|&c| c == 1 || c == 2));
        assert!(vc.contains(&1) && vc.contains(&2));
        assert_eq!(job.result.one_color, -1);
    }

    #[test]
    fn mixed_alphas_force_per_vertex_colors() {
        let mut job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            None,
            SurfaceParams::default(),
        );
        job.colorize(&[3, 3], Some(&[0.0, 0.5]));
        assert!(job.result.vertex_alphas.is_some());
        // Even though the colors are uniform, mixed alphas keep them
        // expanded per vertex.
        assert!(job.result.vertex_colors.is_some());
    }

    #[test]
    fn colorize_only_picks_present_atoms() {
        let mut job = run_job(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(3.0, 0.0, 0.0)],
            vec![1.5, 1.5],
            Some(vec![true, false]),
            SurfaceParams::default(),
        );
        job.colorize(&[4, 9], None);
        assert_eq!(job.result.one_color, 4);
        assert!(job.result.vertex_colors.is_none());
    }
}
