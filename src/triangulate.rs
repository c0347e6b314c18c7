//! Triangulation of the refined dot cloud.
//!
//! An advancing-front reconstruction over the proximity graph: seed
//! triangles are formed from mutually close triples with consistent
//! normals, then the mesh grows by attaching the best candidate vertex to
//! each open edge until the front is exhausted. Degenerate triangles
//! (near-zero area or coincident corners) are rejected, and winding is
//! chosen so the face normal agrees with the sampled vertex normals.

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::geometry::R_SMALL4;
use crate::grid::SpatialGrid;

/// Triangle mesh connectivity over an externally owned vertex array.
#[derive(Debug, Default)]
pub struct Triangulation {
    /// Flat triangle index array, three entries per triangle.
    pub indices: Vec<u32>,
    /// Optional strip encoding; the advancing-front builder emits plain
    /// triangles, so this stays `None`.
    pub strip_lengths: Option<Vec<u32>>,
}

impl Triangulation {
    /// Number of triangles in the mesh.
    #[inline]
    pub fn n_triangles(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Clone, Copy, Default)]
struct EdgeInfo {
    /// Triangles sharing this edge; 1 = open front edge, 2 = closed.
    tri_count: u8,
    /// Third vertex of the first triangle on the edge, for winding.
    third_vertex: u32,
}

struct Front {
    edges: HashMap<(u32, u32), EdgeInfo>,
    active: Vec<(u32, u32)>,
    indices: Vec<u32>,
}

impl Front {
    fn new(capacity: usize) -> Self {
        Self {
            edges: HashMap::with_capacity(capacity * 3),
            active: Vec::with_capacity(capacity),
            indices: Vec::with_capacity(capacity * 3),
        }
    }

    #[inline]
    fn key(v1: u32, v2: u32) -> (u32, u32) {
        if v1 < v2 {
            (v1, v2)
        } else {
            (v2, v1)
        }
    }

    fn can_use(&self, v1: u32, v2: u32) -> bool {
        self.edges
            .get(&Self::key(v1, v2))
            .map_or(true, |e| e.tri_count < 2)
    }

    fn third_vertex(&self, v1: u32, v2: u32) -> Option<u32> {
        self.edges.get(&Self::key(v1, v2)).map(|e| e.third_vertex)
    }

    fn push_triangle(&mut self, v0: u32, v1: u32, v2: u32) {
        self.indices.extend_from_slice(&[v0, v1, v2]);
        self.track_edge(v0, v1, v2);
        self.track_edge(v1, v2, v0);
        self.track_edge(v2, v0, v1);
    }

    fn track_edge(&mut self, v1: u32, v2: u32, third: u32) {
        let key = Self::key(v1, v2);
        let info = self.edges.entry(key).or_default();
        info.tri_count += 1;
        if info.tri_count == 1 {
            info.third_vertex = third;
            self.active.push(key);
        } else if info.tri_count == 2 {
            if let Some(pos) = self.active.iter().position(|&e| e == key) {
                self.active.swap_remove(pos);
            }
        }
    }
}

#[inline]
fn face_normal(p0: &Point3<f32>, p1: &Point3<f32>, p2: &Point3<f32>) -> Vector3<f32> {
    (p1 - p0).cross(&(p2 - p0))
}

/// Near-zero area or coincident corners.
fn degenerate(p0: &Point3<f32>, p1: &Point3<f32>, p2: &Point3<f32>) -> bool {
    let eps2 = R_SMALL4 * R_SMALL4;
    (p1 - p0).norm_squared() <= eps2
        || (p2 - p0).norm_squared() <= eps2
        || (p2 - p1).norm_squared() <= eps2
        || face_normal(p0, p1, p2).norm_squared() <= eps2
}

/// All three vertex normals on the same side of the face plane.
///
/// With cavity handling active the cloud mixes outward- and inward-facing
/// patches, so the test is skipped there.
fn normals_consistent(
    vertices: &[Point3<f32>],
    normals: &[Vector3<f32>],
    v0: u32,
    v1: u32,
    v2: u32,
    cavity_mode: i32,
) -> bool {
    if cavity_mode != 0 {
        return true;
    }
    let fnorm = face_normal(
        &vertices[v0 as usize],
        &vertices[v1 as usize],
        &vertices[v2 as usize],
    );
    let d0 = fnorm.dot(&normals[v0 as usize]);
    let d1 = fnorm.dot(&normals[v1 as usize]);
    let d2 = fnorm.dot(&normals[v2 as usize]);
    (d0 > 0.0 && d1 > 0.0 && d2 > 0.0) || (d0 < 0.0 && d1 < 0.0 && d2 < 0.0)
}

/// Face normal aligned with the averaged vertex normals.
fn orientation_ok(
    vertices: &[Point3<f32>],
    normals: &[Vector3<f32>],
    v0: u32,
    v1: u32,
    v2: u32,
) -> bool {
    let fnorm = face_normal(
        &vertices[v0 as usize],
        &vertices[v1 as usize],
        &vertices[v2 as usize],
    );
    let avg = normals[v0 as usize] + normals[v1 as usize] + normals[v2 as usize];
    fnorm.dot(&avg) > 0.0
}

fn accept(
    vertices: &[Point3<f32>],
    normals: &[Vector3<f32>],
    v0: u32,
    v1: u32,
    v2: u32,
    cavity_mode: i32,
) -> bool {
    !degenerate(
        &vertices[v0 as usize],
        &vertices[v1 as usize],
        &vertices[v2 as usize],
    ) && normals_consistent(vertices, normals, v0, v1, v2, cavity_mode)
}

fn seed_triangles(
    vertices: &[Point3<f32>],
    normals: &[Vector3<f32>],
    grid: &SpatialGrid,
    cutoff_sq: f32,
    cavity_mode: i32,
    front: &mut Front,
) {
    let mut neighbors: Vec<u32> = Vec::with_capacity(64);
    let mut used = vec![false; vertices.len()];

    for i in 0..vertices.len() {
        if used[i] {
            continue;
        }
        let pi = &vertices[i];
        grid.candidates(pi, &mut neighbors);

        'pairs: for (idx_j, &j) in neighbors.iter().enumerate() {
            if j as usize <= i || used[j as usize] {
                continue;
            }
            if (vertices[j as usize] - pi).norm_squared() > cutoff_sq {
                continue;
            }
            for &k in neighbors.iter().skip(idx_j + 1) {
                if k <= j || used[k as usize] {
                    continue;
                }
                let pk = &vertices[k as usize];
                if (pk - pi).norm_squared() > cutoff_sq
                    || (pk - vertices[j as usize]).norm_squared() > cutoff_sq
                {
                    continue;
                }
                if !accept(vertices, normals, i as u32, j, k, cavity_mode) {
                    continue;
                }
                if orientation_ok(vertices, normals, i as u32, j, k) {
                    front.push_triangle(i as u32, j, k);
                } else {
                    front.push_triangle(i as u32, k, j);
                }
                used[i] = true;
                used[j as usize] = true;
                used[k as usize] = true;
                break 'pairs;
            }
        }
    }
}

fn expand_front(
    vertices: &[Point3<f32>],
    normals: &[Vector3<f32>],
    grid: &SpatialGrid,
    cutoff_sq: f32,
    cavity_mode: i32,
    front: &mut Front,
) {
    let mut neighbors: Vec<u32> = Vec::with_capacity(64);
    let mut extra: Vec<u32> = Vec::with_capacity(64);
    let max_iterations = vertices.len() * 12;
    let mut iteration = 0;

    while let Some((v1, v2)) = front.active.pop() {
        iteration += 1;
        if iteration > max_iterations {
            break;
        }
        if !front.can_use(v1, v2) {
            continue;
        }
        let p1 = vertices[v1 as usize];
        let p2 = vertices[v2 as usize];
        let existing_third = front.third_vertex(v1, v2);

        let mid = Point3::from((p1.coords + p2.coords) * 0.5);
        grid.candidates(&mid, &mut neighbors);
        grid.candidates(&p1, &mut extra);
        neighbors.extend_from_slice(&extra);
        grid.candidates(&p2, &mut extra);
        neighbors.extend_from_slice(&extra);
        neighbors.sort_unstable();
        neighbors.dedup();

        // Attach the candidate spanning the smallest pair of new edges.
        let mut best: Option<u32> = None;
        let mut best_score = f32::MAX;
        for &candidate in &neighbors {
            if candidate == v1 || candidate == v2 || Some(candidate) == existing_third {
                continue;
            }
            let pc = &vertices[candidate as usize];
            let d1 = (pc - p1).norm_squared();
            let d2 = (pc - p2).norm_squared();
            if d1 > cutoff_sq || d2 > cutoff_sq {
                continue;
            }
            if !front.can_use(v1, candidate) || !front.can_use(v2, candidate) {
                continue;
            }
            if !accept(vertices, normals, v1, v2, candidate, cavity_mode) {
                continue;
            }
            let score = d1 + d2;
            if score < best_score {
                best_score = score;
                best = Some(candidate);
            }
        }

        let Some(v3) = best else {
            continue;
        };

        if orientation_ok(vertices, normals, v1, v2, v3) {
            front.push_triangle(v1, v2, v3);
        } else {
            front.push_triangle(v1, v3, v2);
        }
    }
}

/// Reconstruct a triangle mesh from the de-duplicated dot cloud.
///
/// `cutoff` bounds every triangle edge; `cavity_mode != 0` relaxes the
/// normal-consistency rejection so interior cavity lining can close.
pub fn triangulate(
    vertices: &[Point3<f32>],
    normals: &[Vector3<f32>],
    cutoff: f32,
    cavity_mode: i32,
) -> Triangulation {
    debug_assert_eq!(vertices.len(), normals.len());
    if vertices.len() < 3 {
        return Triangulation::default();
    }

    let cutoff_sq = cutoff * cutoff;
    let grid = SpatialGrid::build(vertices, cutoff, None);
    let mut front = Front::new(vertices.len() * 2);

    seed_triangles(vertices, normals, &grid, cutoff_sq, cavity_mode, &mut front);
    expand_front(vertices, normals, &grid, cutoff_sq, cavity_mode, &mut front);

    debug!(
        n_vertices = vertices.len(),
        n_triangles = front.indices.len() / 3,
        "triangulation complete"
    );
    Triangulation {
        indices: front.indices,
        strip_lengths: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sphere;

    fn sphere_cloud(radius: f32) -> (Vec<Point3<f32>>, Vec<Vector3<f32>>) {
        let sp = sphere::template(1);
        let vertices = sp
            .dots
            .iter()
            .map(|d| Point3::origin() + d * radius)
            .collect();
        let normals = sp.dots.clone();
        (vertices, normals)
    }

    #[test]
    fn too_few_points_yield_empty_mesh() {
        let (v, n) = sphere_cloud(2.0);
        let t = triangulate(&v[..2], &n[..2], 5.0, 0);
        assert_eq!(t.n_triangles(), 0);
        assert!(t.strip_lengths.is_none());
    }

    #[test]
    fn sphere_cloud_produces_closed_ish_mesh() {
        let (v, n) = sphere_cloud(2.0);
        // Level-1 neighbors on a radius-2 sphere are ~1.1 apart.
        let t = triangulate(&v, &n, 1.6, 0);
        assert!(t.n_triangles() >= v.len(), "too few triangles");
        for idx in &t.indices {
            assert!((*idx as usize) < v.len());
        }
        // Every edge respects the cutoff and no triangle is degenerate.
        for tri in t.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            assert!(a != b && b != c && a != c);
            assert!((v[a] - v[b]).norm() <= 1.6 + 1e-5);
            assert!((v[b] - v[c]).norm() <= 1.6 + 1e-5);
            assert!((v[a] - v[c]).norm() <= 1.6 + 1e-5);
            assert!(!degenerate(&v[a], &v[b], &v[c]));
        }
    }

    #[test]
    fn winding_agrees_with_vertex_normals() {
        let (v, n) = sphere_cloud(2.0);
        let t = triangulate(&v, &n, 1.6, 0);
        let mut aligned = 0usize;
        for tri in t.indices.chunks_exact(3) {
            let (a, b, c) = (tri[0] as usize, tri[1] as usize, tri[2] as usize);
            let fnorm = face_normal(&v[a], &v[b], &v[c]);
            if fnorm.dot(&(n[a] + n[b] + n[c])) > 0.0 {
                aligned += 1;
            }
        }
        assert_eq!(aligned, t.n_triangles(), "all faces should wind outward");
    }

    #[test]
    fn collinear_points_rejected() {
        let v = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
        ];
        let n = vec![Vector3::z(); 3];
        let t = triangulate(&v, &n, 3.0, 0);
        assert_eq!(t.n_triangles(), 0);
    }

    #[test]
    fn coincident_points_rejected() {
        let v = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ];
        let n = vec![Vector3::z(); 3];
        let t = triangulate(&v, &n, 3.0, 0);
        assert_eq!(t.n_triangles(), 0);
    }
}
