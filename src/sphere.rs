//! Pre-tessellated unit-sphere templates for dot placement.
//!
//! Five subdivision levels of an icosahedron, matching the classic dot
//! tables used by molecular surface generators:
//!
//! | Level | Dots  | Triangles |
//! |-------|-------|-----------|
//! | 0     | 12    | 20        |
//! | 1     | 42    | 80        |
//! | 2     | 162   | 320       |
//! | 3     | 642   | 1280      |
//! | 4     | 2562  | 5120      |
//!
//! Templates are built once on first use and shared read-only for the
//! lifetime of the process.

use std::collections::HashMap;
use std::sync::OnceLock;

use nalgebra::Vector3;

/// Highest available subdivision level.
pub const MAX_LEVEL: usize = 4;

/// A tessellated unit sphere: dot directions plus triangle connectivity.
///
/// Each dot direction is unit length and doubles as the outward normal of
/// the corresponding surface sample.
#[derive(Debug, Clone)]
pub struct SphereTemplate {
    /// Unit-sphere sample directions.
    pub dots: Vec<Vector3<f32>>,
    /// Triangle indices into `dots`.
    pub triangles: Vec<[u32; 3]>,
}

impl SphereTemplate {
    /// Number of sample directions at this level.
    #[inline]
    pub fn n_dots(&self) -> usize {
        self.dots.len()
    }
}

const PHI: f32 = 1.618_034;

fn icosahedron() -> (Vec<Vector3<f32>>, Vec<[u32; 3]>) {
    let norm = (1.0 + PHI * PHI).sqrt();
    let a = 1.0 / norm;
    let b = PHI / norm;

    let vertices = vec![
        Vector3::new(-a, b, 0.0),
        Vector3::new(a, b, 0.0),
        Vector3::new(-a, -b, 0.0),
        Vector3::new(a, -b, 0.0),
        Vector3::new(0.0, -a, b),
        Vector3::new(0.0, a, b),
        Vector3::new(0.0, -a, -b),
        Vector3::new(0.0, a, -b),
        Vector3::new(b, 0.0, -a),
        Vector3::new(b, 0.0, a),
        Vector3::new(-b, 0.0, -a),
        Vector3::new(-b, 0.0, a),
    ];

    let triangles = vec![
        [0, 11, 5],
        [0, 5, 1],
        [0, 1, 7],
        [0, 7, 10],
        [0, 10, 11],
        [1, 5, 9],
        [5, 11, 4],
        [11, 10, 2],
        [10, 7, 6],
        [7, 1, 8],
        [3, 9, 4],
        [3, 4, 2],
        [3, 2, 6],
        [3, 6, 8],
        [3, 8, 9],
        [4, 9, 5],
        [2, 4, 11],
        [6, 2, 10],
        [8, 6, 7],
        [9, 8, 1],
    ];

    (vertices, triangles)
}

/// Midpoint vertex lookup for edge `(v1, v2)`, deduplicated across triangles.
fn midpoint(
    v1: u32,
    v2: u32,
    vertices: &mut Vec<Vector3<f32>>,
    cache: &mut HashMap<(u32, u32), u32>,
) -> u32 {
    let key = if v1 < v2 { (v1, v2) } else { (v2, v1) };
    if let Some(&idx) = cache.get(&key) {
        return idx;
    }
    let mid = ((vertices[v1 as usize] + vertices[v2 as usize]) * 0.5).normalize();
    let idx = vertices.len() as u32;
    vertices.push(mid);
    cache.insert(key, idx);
    idx
}

/// Split every triangle into four, projecting new vertices onto the sphere.
fn subdivide(vertices: &mut Vec<Vector3<f32>>, triangles: Vec<[u32; 3]>) -> Vec<[u32; 3]> {
    let mut cache: HashMap<(u32, u32), u32> = HashMap::new();
    let mut out = Vec::with_capacity(triangles.len() * 4);
    for [v0, v1, v2] in triangles {
        let m01 = midpoint(v0, v1, vertices, &mut cache);
        let m12 = midpoint(v1, v2, vertices, &mut cache);
        let m20 = midpoint(v2, v0, vertices, &mut cache);
        out.push([v0, m01, m20]);
        out.push([v1, m12, m01]);
        out.push([v2, m20, m12]);
        out.push([m01, m12, m20]);
    }
    out
}

fn generate(level: usize) -> SphereTemplate {
    let (mut dots, mut triangles) = icosahedron();
    for _ in 0..level {
        triangles = subdivide(&mut dots, triangles);
    }
    SphereTemplate { dots, triangles }
}

static LEVELS: [OnceLock<SphereTemplate>; MAX_LEVEL + 1] = [
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
    OnceLock::new(),
];

/// Shared sphere template at subdivision `level`, clamped to [`MAX_LEVEL`].
pub fn template(level: usize) -> &'static SphereTemplate {
    let level = level.min(MAX_LEVEL);
    LEVELS[level].get_or_init(|| generate(level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_sizes_match_tables() {
        let expected = [(12, 20), (42, 80), (162, 320), (642, 1280), (2562, 5120)];
        for (level, (n_dots, n_tris)) in expected.iter().enumerate() {
            let sp = template(level);
            assert_eq!(sp.n_dots(), *n_dots, "level {level} dot count");
            assert_eq!(sp.triangles.len(), *n_tris, "level {level} triangle count");
        }
    }

    #[test]
    fn dots_are_unit_length() {
        for dot in &template(2).dots {
            assert!((dot.norm() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn level_clamped() {
        assert_eq!(template(9).n_dots(), template(MAX_LEVEL).n_dots());
    }
}
