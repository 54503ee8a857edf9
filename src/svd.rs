//! Least-squares computation of sharp isosurface points from gradient data
//!
//! Given sample points with gradients and scalar values, the kernel computes the
//! point minimizing `sum((g_i . (x - p_i) - (isovalue - s_i))^2)` with a thin SVD,
//! classifies the cube by the number of singular values above the tolerance and
//! falls back to the centroid of the edge-isosurface intersections when the
//! system is too degenerate.

use crate::numeric_types::{Index, Real};
use crate::uniform_grid::{GradientGrid, ScalarGrid};
use crate::SharpIsovertParameters;
use nalgebra::{DMatrix, DVector, Vector3};

/// How the sharp point of a fit was obtained
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FitLocation {
    /// Point is the least-squares SVD solution
    Svd,
    /// Point fell back to the centroid of the edge-isosurface intersections
    Centroid,
    /// SVD solution was outside the admissibility ball and was clamped
    Far,
    /// Point was additionally constrained to a plane
    OnPlane,
}

/// Result of a sharp-point fit for one cube
#[derive(Clone, Debug)]
pub struct SharpFit<R: Real> {
    /// The computed sharp point in world coordinates
    pub coord: Vector3<R>,
    /// Edge direction (2 large singular values) or surface normal (1)
    pub direction: Vector3<R>,
    /// Number of singular values above the tolerance, at most 3
    pub num_large_eigenvalues: usize,
    /// Provenance of the point
    pub location: FitLocation,
    /// True if the point was constrained to a plane
    pub on_plane: bool,
}

/// Centroid of the intersections of the isosurface with the cube edges.
///
/// Returns None if no cube edge is bipolar.
pub fn compute_edge_intersection_centroid<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    cube: I,
    isovalue: R,
) -> Option<Vector3<R>> {
    let grid = &scalar.grid;
    let mut sum = Vector3::zeros();
    let mut count = 0usize;
    for edge_dir in 0..3 {
        for k2 in 0..4 {
            let v0 = grid.cube_facet_vertex(cube, edge_dir, k2);
            let v1 = grid.next_vertex(v0, edge_dir);
            if scalar.is_bipolar(v0, v1, isovalue) {
                let s0 = scalar.scalar(v0);
                let s1 = scalar.scalar(v1);
                let alpha = (isovalue - s0) / (s1 - s0);
                let p0 = grid.scaled_coord(v0);
                let p1 = grid.scaled_coord(v1);
                sum += p0 * (R::one() - alpha) + p1 * alpha;
                count += 1;
            }
        }
    }
    (count > 0).then(|| sum / <R as Real>::from_f64(count as f64))
}

/// Samples scalar values and gradients at the eight corners of the cube
/// expanded by `offset` cube widths per axis (the gradient selection voxel).
///
/// Values are trilinearly interpolated from the grids, clamped to the domain.
fn gather_offset_voxel_samples<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    cube: I,
    offset: R,
) -> ([Vector3<R>; 8], [Vector3<R>; 8], [R; 8]) {
    let grid = &scalar.grid;
    let cube_min = grid.scaled_coord(cube);
    let mut points = [Vector3::zeros(); 8];
    let mut grads = [Vector3::zeros(); 8];
    let mut scalars = [R::zero(); 8];
    for k in 0..8usize {
        let mut p = cube_min;
        for d in 0..3 {
            if (k >> d) & 1 == 1 {
                p[d] += (R::one() + offset) * grid.spacing(d);
            } else {
                p[d] -= offset * grid.spacing(d);
            }
        }
        points[k] = p;
        grads[k] = gradients.interpolate(grid, &p);
        scalars[k] = scalar.interpolate(&p);
    }
    (points, grads, scalars)
}

/// Assembles the unit-normal constraint rows `n_i . x = b_i` relative to the anchor
fn assemble_constraints<R: Real>(
    points: &[Vector3<R>],
    gradients: &[Vector3<R>],
    scalars: &[R],
    isovalue: R,
    anchor: &Vector3<R>,
    max_small_magnitude: R,
) -> (Vec<Vector3<R>>, Vec<R>) {
    let mut normals = Vec::with_capacity(points.len());
    let mut rhs = Vec::with_capacity(points.len());
    for ((p, g), s) in points.iter().zip(gradients.iter()).zip(scalars.iter()) {
        let mag = g.norm();
        if mag <= max_small_magnitude {
            continue;
        }
        let n = g / mag;
        let b = (g.dot(p) + isovalue - *s) / mag;
        normals.push(n);
        rhs.push(b - n.dot(anchor));
    }
    (normals, rhs)
}

/// Thin-SVD least squares solve of `N x = b`, counting singular values above
/// `tolerance * sigma_max`.
///
/// Returns the solution offset (relative to the anchor the rhs was reduced by),
/// the number of large singular values and the direction vector of the
/// suppressed subspace.
fn solve_thin_svd<R: Real>(
    normals: &[Vector3<R>],
    rhs: &[R],
    tolerance: R,
) -> (Vector3<R>, usize, Vector3<R>) {
    if normals.is_empty() {
        return (Vector3::zeros(), 0, Vector3::zeros());
    }

    let n = normals.len();
    let mut data = Vec::with_capacity(3 * n);
    for normal in normals {
        data.extend_from_slice(&[normal.x, normal.y, normal.z]);
    }
    let a = DMatrix::from_row_slice(n, 3, &data);
    let b = DVector::from_column_slice(rhs);

    let svd = a.svd(true, true);
    let u = svd.u.expect("svd computed with u");
    let v_t = svd.v_t.expect("svd computed with v_t");
    let sigma = &svd.singular_values;

    let sigma_max = sigma[0];
    if sigma_max <= R::zero() {
        return (Vector3::zeros(), 0, Vector3::zeros());
    }

    let num_large = (0..sigma.len())
        .filter(|&i| sigma[i] > tolerance * sigma_max)
        .count();

    let mut x = Vector3::zeros();
    for i in 0..num_large {
        let coef = u.column(i).dot(&b) / sigma[i];
        x += Vector3::new(v_t[(i, 0)], v_t[(i, 1)], v_t[(i, 2)]) * coef;
    }

    let right_singular = |i: usize| Vector3::new(v_t[(i, 0)], v_t[(i, 1)], v_t[(i, 2)]);
    let direction = match num_large {
        // Edge direction: the right-singular vector of the suppressed subspace
        2 => {
            if v_t.nrows() >= 3 {
                right_singular(2)
            } else {
                right_singular(0).cross(&right_singular(1))
            }
        }
        // Surface normal
        1 => right_singular(0),
        _ => Vector3::zeros(),
    };

    (x, num_large, direction)
}

/// Computes the sharp point of a cube from the gradients in its offset voxel.
///
/// The solve is anchored at `anchor` if given, else at the centroid of the
/// edge-isosurface intersections (Lindstrom). Fewer than two large singular
/// values fall back to the centroid; a solution outside the admissibility ball
/// of radius `max_dist` (scaled L∞ around the cube center) is clamped and
/// tagged [FitLocation::Far].
pub fn svd_compute_sharp_vertex_for_cube<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    cube: I,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    offset: R,
    anchor: Option<Vector3<R>>,
) -> SharpFit<R> {
    let grid = &scalar.grid;
    let centroid = compute_edge_intersection_centroid(scalar, cube, isovalue)
        .unwrap_or_else(|| grid.cube_center_scaled_coord(cube));
    let anchor = anchor.unwrap_or(centroid);

    let (points, grads, scalars) = gather_offset_voxel_samples(scalar, gradients, cube, offset);
    let (normals, rhs) = assemble_constraints(
        &points,
        &grads,
        &scalars,
        isovalue,
        &anchor,
        param.max_small_magnitude,
    );
    let (x, num_large, direction) = solve_thin_svd(&normals, &rhs, param.singular_value_tolerance);

    if num_large < 2 {
        return SharpFit {
            coord: centroid,
            direction,
            num_large_eigenvalues: num_large,
            location: FitLocation::Centroid,
            on_plane: false,
        };
    }

    let mut coord = anchor + x;
    if grid.linf_distance_from_cube_center(cube, &coord) > param.max_dist {
        let center = grid.cube_center_scaled_coord(cube);
        for d in 0..3 {
            let r = param.max_dist * grid.spacing(d);
            coord[d] = coord[d].clamp(center[d] - r, center[d] + r);
        }
        return SharpFit {
            coord,
            direction,
            num_large_eigenvalues: num_large,
            location: FitLocation::Far,
            on_plane: false,
        };
    }

    SharpFit {
        coord,
        direction,
        num_large_eigenvalues: num_large,
        location: FitLocation::Svd,
        on_plane: false,
    }
}

/// Computes the sharp point of a cube constrained to the given plane.
///
/// The solve runs in the two-dimensional subspace of the plane through
/// `plane_point` with unit normal `plane_normal`; the plane-normal direction
/// counts as one fully constrained singular direction.
pub fn svd_compute_sharp_vertex_on_plane<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    cube: I,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    offset: R,
    plane_point: &Vector3<R>,
    plane_normal: &Vector3<R>,
) -> SharpFit<R> {
    let (points, grads, scalars) = gather_offset_voxel_samples(scalar, gradients, cube, offset);
    let (normals, rhs) = assemble_constraints(
        &points,
        &grads,
        &scalars,
        isovalue,
        plane_point,
        param.max_small_magnitude,
    );

    let (basis1, basis2) = plane_basis(plane_normal);
    if normals.is_empty() {
        return SharpFit {
            coord: *plane_point,
            direction: Vector3::zeros(),
            num_large_eigenvalues: 1,
            location: FitLocation::Centroid,
            on_plane: false,
        };
    }

    let n = normals.len();
    let mut data = Vec::with_capacity(2 * n);
    for normal in &normals {
        data.push(normal.dot(&basis1));
        data.push(normal.dot(&basis2));
    }
    let a = DMatrix::from_row_slice(n, 2, &data);
    let b = DVector::from_column_slice(&rhs);

    let svd = a.svd(true, true);
    let u = svd.u.expect("svd computed with u");
    let v_t = svd.v_t.expect("svd computed with v_t");
    let sigma = &svd.singular_values;

    let sigma_max = sigma[0];
    let num_large_in_plane = if sigma_max > R::zero() {
        (0..sigma.len())
            .filter(|&i| sigma[i] > param.singular_value_tolerance * sigma_max)
            .count()
    } else {
        0
    };

    if num_large_in_plane == 0 {
        return SharpFit {
            coord: *plane_point,
            direction: Vector3::zeros(),
            num_large_eigenvalues: 1,
            location: FitLocation::Centroid,
            on_plane: false,
        };
    }

    let mut y0 = R::zero();
    let mut y1 = R::zero();
    for i in 0..num_large_in_plane {
        let coef = u.column(i).dot(&b) / sigma[i];
        y0 += v_t[(i, 0)] * coef;
        if v_t.ncols() > 1 {
            y1 += v_t[(i, 1)] * coef;
        }
    }
    let coord = plane_point + basis1 * y0 + basis2 * y1;

    // Suppressed in-plane direction when only one in-plane constraint is large
    let direction = if num_large_in_plane == 1 && v_t.ncols() > 1 {
        basis1 * (-v_t[(0, 1)]) + basis2 * v_t[(0, 0)]
    } else {
        Vector3::zeros()
    };

    SharpFit {
        coord,
        direction,
        num_large_eigenvalues: 1 + num_large_in_plane,
        location: FitLocation::OnPlane,
        on_plane: true,
    }
}

/// Orthonormal basis of the plane orthogonal to the given unit normal
fn plane_basis<R: Real>(normal: &Vector3<R>) -> (Vector3<R>, Vector3<R>) {
    let mut smallest = 0;
    for d in 1..3 {
        if normal[d].abs() < normal[smallest].abs() {
            smallest = d;
        }
    }
    let mut e = Vector3::zeros();
    e[smallest] = R::one();
    let b1 = normal.cross(&e).normalize();
    let b2 = normal.cross(&b1);
    (b1, b2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform_grid::UniformGrid;

    fn params() -> SharpIsovertParameters<f64> {
        SharpIsovertParameters::default()
    }

    fn setup(
        f: impl Fn(&Vector3<f64>) -> f64 + Copy,
        g: impl Fn(&Vector3<f64>) -> Vector3<f64>,
    ) -> (ScalarGrid<i32, f64>, GradientGrid<i32, f64>) {
        let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
        let scalar = ScalarGrid::from_fn(grid.clone(), f);
        let gradients = GradientGrid::from_fn(&grid, g);
        (scalar, gradients)
    }

    #[test]
    fn test_smooth_plane_has_one_eigenvalue() {
        let (scalar, gradients) = setup(|p| p.x - 2.5, |_| Vector3::new(1.0, 0.0, 0.0));
        let cube = scalar.grid.flatten_coord([2, 1, 1]);
        let fit =
            svd_compute_sharp_vertex_for_cube(&scalar, &gradients, cube, 0.0, &params(), 0.0, None);
        assert_eq!(fit.num_large_eigenvalues, 1);
        assert_eq!(fit.location, FitLocation::Centroid);
        // Normal direction of the plane
        assert!((fit.direction.x.abs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_two_planes_give_edge_point() {
        let f = |p: &Vector3<f64>| p.y.max(p.z) - 2.25;
        let g = |p: &Vector3<f64>| {
            if p.y >= p.z {
                Vector3::new(0.0, 1.0, 0.0)
            } else {
                Vector3::new(0.0, 0.0, 1.0)
            }
        };
        let (scalar, gradients) = setup(f, g);
        let cube = scalar.grid.flatten_coord([1, 2, 2]);
        let fit =
            svd_compute_sharp_vertex_for_cube(&scalar, &gradients, cube, 0.0, &params(), 0.0, None);
        assert_eq!(fit.num_large_eigenvalues, 2);
        assert_eq!(fit.location, FitLocation::Svd);
        assert!((fit.coord.y - 2.25).abs() < 1e-6);
        assert!((fit.coord.z - 2.25).abs() < 1e-6);
        // Edge direction along x
        assert!(fit.direction.x.abs() > 0.99);
    }

    #[test]
    fn test_three_planes_give_corner_point() {
        let f = |p: &Vector3<f64>| p.x.max(p.y).max(p.z) - 2.25;
        let g = |p: &Vector3<f64>| {
            if p.x >= p.y && p.x >= p.z {
                Vector3::new(1.0, 0.0, 0.0)
            } else if p.y >= p.z {
                Vector3::new(0.0, 1.0, 0.0)
            } else {
                Vector3::new(0.0, 0.0, 1.0)
            }
        };
        let (scalar, gradients) = setup(f, g);
        let cube = scalar.grid.flatten_coord([2, 2, 2]);
        let fit =
            svd_compute_sharp_vertex_for_cube(&scalar, &gradients, cube, 0.0, &params(), 0.0, None);
        assert_eq!(fit.num_large_eigenvalues, 3);
        assert!((fit.coord - Vector3::new(2.25, 2.25, 2.25)).norm() < 1e-6);
    }

    #[test]
    fn test_plane_constrained_solve_stays_on_plane() {
        let f = |p: &Vector3<f64>| p.y.max(p.z) - 2.25;
        let g = |p: &Vector3<f64>| {
            if p.y >= p.z {
                Vector3::new(0.0, 1.0, 0.0)
            } else {
                Vector3::new(0.0, 0.0, 1.0)
            }
        };
        let (scalar, gradients) = setup(f, g);
        let cube = scalar.grid.flatten_coord([1, 2, 2]);
        let inv_sqrt2 = 1.0 / 2.0f64.sqrt();
        let plane_normal = Vector3::new(0.0, inv_sqrt2, inv_sqrt2);
        let plane_point = Vector3::new(2.0, 2.25, 2.25);
        let fit = svd_compute_sharp_vertex_on_plane(
            &scalar,
            &gradients,
            cube,
            0.0,
            &params(),
            0.0,
            &plane_point,
            &plane_normal,
        );
        assert!(fit.on_plane);
        assert!(fit.num_large_eigenvalues >= 2);
        let offset = (fit.coord - plane_point).dot(&plane_normal);
        assert!(offset.abs() < 1e-9);
    }
}
