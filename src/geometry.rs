//! Shared single-precision geometry helpers for the surface pipeline.

use nalgebra::{Point3, Vector3};

/// Threshold below which lengths, distances and areas are treated as degenerate.
pub const R_SMALL4: f32 = 1.0e-4;

/// True when `a` and `b` are within `cutoff` of each other (inclusive).
#[inline]
pub fn within(a: &Point3<f32>, b: &Point3<f32>, cutoff: f32) -> bool {
    (a - b).norm_squared() <= cutoff * cutoff
}

/// Normalize `v`, returning `None` for near-zero vectors.
#[inline]
pub fn try_normalized(v: Vector3<f32>) -> Option<Vector3<f32>> {
    let m = v.norm();
    if m < R_SMALL4 {
        None
    } else {
        Some(v / m)
    }
}

/// Build a right-handed orthonormal frame around `axis`.
///
/// Returns `(unit_axis, u, v)` where `u` and `v` span the plane perpendicular
/// to `axis`, or `None` when `axis` is degenerate. The perpendicular seed is
/// the component-swap vector `(y²+z², x²+z², x²+y²)`, which is never parallel
/// to `axis` except near the space diagonal, where `(1, 0, 0)` is used.
pub fn orthonormal_frame(axis: Vector3<f32>) -> Option<(Vector3<f32>, Vector3<f32>, Vector3<f32>)> {
    let n = try_normalized(axis)?;
    let mut seed = Vector3::new(
        n.y * n.y + n.z * n.z,
        n.x * n.x + n.z * n.z,
        n.x * n.x + n.y * n.y,
    );
    seed.normalize_mut();
    if seed.dot(&n).abs() > 0.99 {
        seed = Vector3::new(1.0, 0.0, 0.0);
    }
    let u = try_normalized(n.cross(&seed))?;
    let v = n.cross(&u);
    Some((n, u, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_is_inclusive() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(3.0, 0.0, 0.0);
        assert!(within(&a, &b, 3.0));
        assert!(!within(&a, &b, 2.999));
    }

    #[test]
    fn frame_is_orthonormal() {
        for axis in [
            Vector3::new(0.0, 0.0, 2.5),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(-0.3, 0.7, 0.1),
        ] {
            let (n, u, v) = orthonormal_frame(axis).unwrap();
            assert!((n.norm() - 1.0).abs() < 1e-5);
            assert!((u.norm() - 1.0).abs() < 1e-5);
            assert!((v.norm() - 1.0).abs() < 1e-5);
            assert!(n.dot(&u).abs() < 1e-5);
            assert!(n.dot(&v).abs() < 1e-5);
            assert!(u.dot(&v).abs() < 1e-5);
            // right-handed
            assert!((u.cross(&v) - n).norm() < 1e-5);
        }
    }

    #[test]
    fn degenerate_axis_rejected() {
        assert!(orthonormal_frame(Vector3::zeros()).is_none());
        assert!(try_normalized(Vector3::new(1e-6, 0.0, 0.0)).is_none());
    }
}
