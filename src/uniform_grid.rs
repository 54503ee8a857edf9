//! Uniform background grid, flat indexing, neighbor access and boundary classification
//!
//! Cubes are identified by the flat vertex index of their minimum corner.
//! All distance comparisons are performed on coordinates scaled by the
//! per-axis spacing; raw integer coordinates are used for containment and
//! neighbor arithmetic only.

use crate::numeric_types::{Index, Real};
use crate::topology::NEIGHBOR_26_OFFSETS;
use bitflags::bitflags;
use nalgebra::Vector3;
use thiserror::Error as ThisError;

bitflags! {
    /// Flags indicating which grid boundary faces a cube touches
    pub struct BoundaryBits: u8 {
        const X_NEG = 0b00000001;
        const X_POS = 0b00000010;
        const Y_NEG = 0b00000100;
        const Y_POS = 0b00001000;
        const Z_NEG = 0b00010000;
        const Z_POS = 0b00100000;
    }
}

impl BoundaryBits {
    /// Returns the flag of facet `2*d + side`
    pub fn facet(d: usize, side: usize) -> Self {
        BoundaryBits::from_bits_truncate(1u8 << (2 * d + side))
    }
}

/// Error type for invalid grid dimensions
#[derive(Clone, Debug, ThisError)]
pub enum GridConstructionError {
    /// An axis has fewer than two vertices, so the grid contains no cube
    #[error("grid axis {axis} has fewer than two vertices")]
    AxisTooSmall { axis: usize },
    /// An axis spacing is not strictly positive
    #[error("grid axis {axis} has non-positive spacing")]
    NonPositiveSpacing { axis: usize },
    /// The supplied per-vertex data does not match the number of grid vertices
    #[error("data length {data_len} does not match the number of grid vertices {num_vertices}")]
    DataSizeMismatch { data_len: usize, num_vertices: usize },
}

/// A uniform axis-aligned 3D grid with per-axis spacing
#[derive(Clone, Debug, PartialEq)]
pub struct UniformGrid<I: Index, R: Real> {
    /// Number of vertices per axis
    axis_size: [I; 3],
    /// Edge length per axis
    spacing: Vector3<R>,
    /// Flat index increment per axis step
    axis_increment: [i64; 3],
}

impl<I: Index, R: Real> UniformGrid<I, R> {
    /// Constructs a grid with the given number of vertices and spacing per axis
    pub fn new(axis_size: [I; 3], spacing: [R; 3]) -> Result<Self, GridConstructionError> {
        for d in 0..3 {
            if axis_size[d].to_i64() < 2 {
                return Err(GridConstructionError::AxisTooSmall { axis: d });
            }
            if spacing[d] <= R::zero() {
                return Err(GridConstructionError::NonPositiveSpacing { axis: d });
            }
        }
        let nx = axis_size[0].to_i64();
        let ny = axis_size[1].to_i64();
        Ok(Self {
            axis_size,
            spacing: Vector3::new(spacing[0], spacing[1], spacing[2]),
            axis_increment: [1, nx, nx * ny],
        })
    }

    /// Constructs a grid with unit spacing
    pub fn new_unit(axis_size: [I; 3]) -> Result<Self, GridConstructionError> {
        Self::new(axis_size, [R::one(), R::one(), R::one()])
    }

    /// Number of vertices along axis `d`
    pub fn axis_size(&self, d: usize) -> I {
        self.axis_size[d]
    }

    /// Number of cubes along axis `d`
    pub fn num_cubes_axis(&self, d: usize) -> i64 {
        self.axis_size[d].to_i64() - 1
    }

    /// Spacing along axis `d`
    pub fn spacing(&self, d: usize) -> R {
        self.spacing[d]
    }

    /// Spacing of all three axes
    pub fn spacing_vector(&self) -> Vector3<R> {
        self.spacing
    }

    /// Total number of grid vertices
    pub fn num_vertices(&self) -> usize {
        (self.axis_size[0].to_i64() * self.axis_size[1].to_i64() * self.axis_size[2].to_i64())
            as usize
    }

    /// Flat index increment per step along axis `d`
    pub fn axis_increment(&self, d: usize) -> i64 {
        self.axis_increment[d]
    }

    /// Flattens an integer vertex coordinate into a flat vertex index
    pub fn flatten_coord(&self, coord: [i64; 3]) -> I {
        I::from_i64(
            coord[0] * self.axis_increment[0]
                + coord[1] * self.axis_increment[1]
                + coord[2] * self.axis_increment[2],
        )
    }

    /// Computes the integer coordinate of a flat vertex index
    pub fn compute_coord(&self, index: I) -> [i64; 3] {
        let nx = self.axis_size[0].to_i64();
        let ny = self.axis_size[1].to_i64();
        let index = index.to_i64();
        [index % nx, (index / nx) % ny, index / (nx * ny)]
    }

    /// Next vertex along axis `d`
    pub fn next_vertex(&self, vertex: I, d: usize) -> I {
        I::from_i64(vertex.to_i64() + self.axis_increment[d])
    }

    /// Previous vertex along axis `d`
    pub fn prev_vertex(&self, vertex: I, d: usize) -> I {
        I::from_i64(vertex.to_i64() - self.axis_increment[d])
    }

    /// Adjacent vertex along axis `d`, `side` 0 negative, 1 positive
    pub fn adjacent_vertex(&self, vertex: I, d: usize, side: usize) -> I {
        if side == 0 {
            self.prev_vertex(vertex, d)
        } else {
            self.next_vertex(vertex, d)
        }
    }

    /// Corner `k` of the cube, bit `d` of `k` selecting the positive side on axis `d`
    pub fn cube_vertex(&self, cube: I, k: usize) -> I {
        let mut index = cube.to_i64();
        for d in 0..3 {
            if (k >> d) & 1 == 1 {
                index += self.axis_increment[d];
            }
        }
        I::from_i64(index)
    }

    /// Vertex `k` of the negative cube facet orthogonal to `orth_dir`.
    ///
    /// Bit 0 of `k` steps along `(orth_dir+1)%3`, bit 1 along `(orth_dir+2)%3`.
    pub fn cube_facet_vertex(&self, cube: I, orth_dir: usize, k: usize) -> I {
        let d1 = (orth_dir + 1) % 3;
        let d2 = (orth_dir + 2) % 3;
        let mut index = cube.to_i64();
        if k & 1 == 1 {
            index += self.axis_increment[d1];
        }
        if (k >> 1) & 1 == 1 {
            index += self.axis_increment[d2];
        }
        I::from_i64(index)
    }

    /// Returns true if the integer coordinate addresses a valid cube
    pub fn is_cube_coord_valid(&self, coord: [i64; 3]) -> bool {
        (0..3).all(|d| coord[d] >= 0 && coord[d] < self.num_cubes_axis(d))
    }

    /// Returns the cube neighbor at the given coordinate offset, or None if it
    /// falls outside the grid. This is the boundary-safe path.
    pub fn cube_neighbor(&self, cube: I, offset: [i64; 3]) -> Option<I> {
        let coord = self.compute_coord(cube);
        let neighbor = [
            coord[0] + offset[0],
            coord[1] + offset[1],
            coord[2] + offset[2],
        ];
        if self.is_cube_coord_valid(neighbor) {
            Some(self.flatten_coord(neighbor))
        } else {
            None
        }
    }

    /// Returns the cube neighbor at the given offset by pure index arithmetic.
    ///
    /// Fast path for interior cubes; the caller must have checked
    /// `boundary_bits(cube).is_empty()` for unit offsets (distance-2 offsets
    /// additionally require distance 2 to the grid boundary).
    pub fn cube_neighbor_unchecked(&self, cube: I, offset: [i64; 3]) -> I {
        I::from_i64(
            cube.to_i64()
                + offset[0] * self.axis_increment[0]
                + offset[1] * self.axis_increment[1]
                + offset[2] * self.axis_increment[2],
        )
    }

    /// Iterates over all cubes of the grid in flat index order
    pub fn cubes(&self) -> impl Iterator<Item = I> + '_ {
        let ncx = self.num_cubes_axis(0);
        let ncy = self.num_cubes_axis(1);
        let ncz = self.num_cubes_axis(2);
        (0..ncz).flat_map(move |z| {
            (0..ncy).flat_map(move |y| (0..ncx).map(move |x| self.flatten_coord([x, y, z])))
        })
    }

    /// Computes which grid boundary faces the cube touches
    pub fn compute_boundary_bits(&self, cube: I) -> BoundaryBits {
        let coord = self.compute_coord(cube);
        let mut bits = BoundaryBits::empty();
        for d in 0..3 {
            if coord[d] == 0 {
                bits |= BoundaryBits::facet(d, 0);
            }
            if coord[d] + 1 == self.num_cubes_axis(d) {
                bits |= BoundaryBits::facet(d, 1);
            }
        }
        bits
    }

    /// Computes which grid boundary faces the vertex lies on
    pub fn vertex_boundary_bits(&self, vertex: I) -> BoundaryBits {
        let coord = self.compute_coord(vertex);
        let mut bits = BoundaryBits::empty();
        for d in 0..3 {
            if coord[d] == 0 {
                bits |= BoundaryBits::facet(d, 0);
            }
            if coord[d] + 1 == self.axis_size[d].to_i64() {
                bits |= BoundaryBits::facet(d, 1);
            }
        }
        bits
    }

    /// L∞ distance to the grid boundary in cubes
    pub fn cube_distance_to_grid_boundary(&self, cube: I) -> i64 {
        let coord = self.compute_coord(cube);
        (0..3)
            .map(|d| coord[d].min(self.num_cubes_axis(d) - 1 - coord[d]))
            .min()
            .expect("three dimensions")
    }

    /// Scaled world coordinate of a grid vertex
    pub fn scaled_coord(&self, vertex: I) -> Vector3<R> {
        let coord = self.compute_coord(vertex);
        self.scaled_coord_of(coord)
    }

    /// Scaled world coordinate of an integer coordinate
    pub fn scaled_coord_of(&self, coord: [i64; 3]) -> Vector3<R> {
        Vector3::new(
            <R as Real>::from_f64(coord[0] as f64) * self.spacing[0],
            <R as Real>::from_f64(coord[1] as f64) * self.spacing[1],
            <R as Real>::from_f64(coord[2] as f64) * self.spacing[2],
        )
    }

    /// Scaled world coordinate of the cube center
    pub fn cube_center_scaled_coord(&self, cube: I) -> Vector3<R> {
        let half = <R as Real>::from_f64(0.5);
        self.scaled_coord(cube) + self.spacing * half
    }

    /// Returns true if the point lies inside the cube.
    ///
    /// Half-open on the max side, closed on the max side where the cube
    /// touches the grid boundary.
    pub fn cube_contains_point(&self, cube: I, point: &Vector3<R>) -> bool {
        let coord = self.compute_coord(cube);
        let min = self.scaled_coord_of(coord);
        for d in 0..3 {
            let max = min[d] + self.spacing[d];
            if point[d] < min[d] {
                return false;
            }
            let on_grid_boundary = coord[d] + 1 == self.num_cubes_axis(d);
            if on_grid_boundary {
                if point[d] > max {
                    return false;
                }
            } else if point[d] >= max {
                return false;
            }
        }
        true
    }

    /// Returns true if the point lies inside the grid extents
    pub fn contains_point(&self, point: &Vector3<R>) -> bool {
        for d in 0..3 {
            let max = <R as Real>::from_f64((self.axis_size[d].to_i64() - 1) as f64) * self.spacing[d];
            if point[d] < R::zero() || point[d] > max {
                return false;
            }
        }
        true
    }

    /// Returns the cube containing the point, or None if the point is outside the grid
    pub fn cube_containing_point(&self, point: &Vector3<R>) -> Option<I> {
        if !self.contains_point(point) {
            return None;
        }
        let mut coord = [0i64; 3];
        for d in 0..3 {
            let c = (point[d] / self.spacing[d]).floor().to_f64() as i64;
            coord[d] = c.clamp(0, self.num_cubes_axis(d) - 1);
        }
        Some(self.flatten_coord(coord))
    }

    /// Scaled L∞ distance from the cube center to the point
    pub fn linf_distance_from_cube_center(&self, cube: I, point: &Vector3<R>) -> R {
        let center = self.cube_center_scaled_coord(cube);
        let mut dist = R::zero();
        for d in 0..3 {
            let x = (point[d] - center[d]).abs() / self.spacing[d];
            if x > dist {
                dist = x;
            }
        }
        dist
    }

    /// Scaled L∞ distance from a grid vertex to the point
    pub fn linf_distance_from_vertex(&self, vertex: I, point: &Vector3<R>) -> R {
        let vcoord = self.scaled_coord(vertex);
        let mut dist = R::zero();
        for d in 0..3 {
            let x = (point[d] - vcoord[d]).abs() / self.spacing[d];
            if x > dist {
                dist = x;
            }
        }
        dist
    }

    /// L∞ distance between two cubes in integer grid coordinates
    pub fn linf_distance_between_cubes(&self, cube_a: I, cube_b: I) -> i64 {
        let a = self.compute_coord(cube_a);
        let b = self.compute_coord(cube_b);
        (0..3)
            .map(|d| (a[d] - b[d]).abs())
            .max()
            .expect("three dimensions")
    }

    /// Returns true if the grid edge lies on the grid boundary
    pub fn is_edge_on_grid_boundary(&self, iend0: I, edge_dir: usize) -> bool {
        let coord = self.compute_coord(iend0);
        for d in 0..3 {
            if d == edge_dir {
                continue;
            }
            if coord[d] == 0 || coord[d] + 1 == self.axis_size[d].to_i64() {
                return true;
            }
        }
        false
    }

    /// Visits every grid edge not on the grid boundary
    pub fn for_each_interior_edge(&self, mut f: impl FnMut(I, usize)) {
        for edge_dir in 0..3 {
            let d1 = (edge_dir + 1) % 3;
            let d2 = (edge_dir + 2) % 3;
            let mut range = [0i64; 3];
            range[edge_dir] = self.axis_size[edge_dir].to_i64() - 1;
            range[d1] = self.axis_size[d1].to_i64();
            range[d2] = self.axis_size[d2].to_i64();
            for c2 in 1..range[d2] - 1 {
                for c1 in 1..range[d1] - 1 {
                    for c0 in 0..range[edge_dir] {
                        let mut coord = [0i64; 3];
                        coord[edge_dir] = c0;
                        coord[d1] = c1;
                        coord[d2] = c2;
                        f(self.flatten_coord(coord), edge_dir);
                    }
                }
            }
        }
    }

    /// All active cube neighbors of the full 26-neighborhood, boundary safe
    pub fn neighborhood_26(&self, cube: I) -> impl Iterator<Item = I> + '_ {
        let coord = self.compute_coord(cube);
        NEIGHBOR_26_OFFSETS.iter().filter_map(move |offset| {
            let neighbor = [
                coord[0] + offset[0],
                coord[1] + offset[1],
                coord[2] + offset[2],
            ];
            if self.is_cube_coord_valid(neighbor) {
                Some(self.flatten_coord(neighbor))
            } else {
                None
            }
        })
    }
}

/// A uniform grid together with a scalar sample per vertex
#[derive(Clone, Debug)]
pub struct ScalarGrid<I: Index, R: Real> {
    pub grid: UniformGrid<I, R>,
    values: Vec<R>,
}

impl<I: Index, R: Real> ScalarGrid<I, R> {
    /// Wraps a grid and per-vertex values, checking the data length
    pub fn new(grid: UniformGrid<I, R>, values: Vec<R>) -> Result<Self, GridConstructionError> {
        if values.len() != grid.num_vertices() {
            return Err(GridConstructionError::DataSizeMismatch {
                data_len: values.len(),
                num_vertices: grid.num_vertices(),
            });
        }
        Ok(Self { grid, values })
    }

    /// Samples a scalar field at every grid vertex
    pub fn from_fn(grid: UniformGrid<I, R>, f: impl Fn(&Vector3<R>) -> R) -> Self {
        let mut values = Vec::with_capacity(grid.num_vertices());
        let nx = grid.axis_size(0).to_i64();
        let ny = grid.axis_size(1).to_i64();
        let nz = grid.axis_size(2).to_i64();
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    values.push(f(&grid.scaled_coord_of([x, y, z])));
                }
            }
        }
        Self { grid, values }
    }

    /// Scalar value at a grid vertex
    pub fn scalar(&self, vertex: I) -> R {
        self.values[vertex.to_usize()]
    }

    /// Returns true if the edge straddles the isovalue
    pub fn is_bipolar(&self, v0: I, v1: I, isovalue: R) -> bool {
        let s0 = self.scalar(v0);
        let s1 = self.scalar(v1);
        let (min, max) = if s0 < s1 { (s0, s1) } else { (s1, s0) };
        isovalue > min && isovalue <= max
    }

    /// Returns true if the cube's scalar range straddles the isovalue
    pub fn is_cube_active(&self, cube: I, isovalue: R) -> bool {
        let mut min = self.scalar(cube);
        let mut max = min;
        for k in 1..8 {
            let s = self.scalar(self.grid.cube_vertex(cube, k));
            if s < min {
                min = s;
            }
            if s > max {
                max = s;
            }
        }
        isovalue > min && isovalue <= max
    }

    /// Returns true if facet `j` of the cube is bipolar.
    ///
    /// Facet `j` is the facet shared with facet neighbor `j`.
    pub fn is_facet_bipolar(&self, cube: I, facet: usize, isovalue: R) -> bool {
        let orth_dir = facet / 2;
        let side = facet % 2;
        let base = if side == 0 {
            cube
        } else {
            self.grid.next_vertex(cube, orth_dir)
        };
        let mut min = None;
        let mut max = None;
        for k in 0..4 {
            let s = self.scalar(self.grid.cube_facet_vertex(base, orth_dir, k));
            min = Some(min.map_or(s, |m: R| if s < m { s } else { m }));
            max = Some(max.map_or(s, |m: R| if s > m { s } else { m }));
        }
        let (min, max) = (min.expect("facet vertices"), max.expect("facet vertices"));
        isovalue > min && isovalue <= max
    }

    /// Returns true if any boundary facet of the cube is bipolar
    pub fn has_bipolar_boundary_facet(
        &self,
        cube: I,
        boundary_bits: BoundaryBits,
        isovalue: R,
    ) -> bool {
        for facet in 0..6 {
            if boundary_bits.contains(BoundaryBits::facet(facet / 2, facet % 2))
                && self.is_facet_bipolar(cube, facet, isovalue)
            {
                return true;
            }
        }
        false
    }

    /// Trilinearly interpolates the scalar field at a scaled point, clamped to the grid
    pub fn interpolate(&self, point: &Vector3<R>) -> R {
        let (base, frac) = interpolation_cell(&self.grid, point);
        let mut value = R::zero();
        for k in 0..8usize {
            let mut w = R::one();
            let mut coord = base;
            for d in 0..3 {
                if (k >> d) & 1 == 1 {
                    w *= frac[d];
                    coord[d] += 1;
                } else {
                    w *= R::one() - frac[d];
                }
            }
            value += w * self.values[self.grid.flatten_coord(coord).to_usize()];
        }
        value
    }
}

/// A uniform grid of per-vertex gradients with the same shape as a scalar grid
#[derive(Clone, Debug)]
pub struct GradientGrid<I: Index, R: Real> {
    axis_size: [I; 3],
    data: Vec<Vector3<R>>,
}

impl<I: Index, R: Real> GradientGrid<I, R> {
    /// Samples a gradient field at every vertex of the given grid
    pub fn from_fn(grid: &UniformGrid<I, R>, f: impl Fn(&Vector3<R>) -> Vector3<R>) -> Self {
        let mut data = Vec::with_capacity(grid.num_vertices());
        let nx = grid.axis_size(0).to_i64();
        let ny = grid.axis_size(1).to_i64();
        let nz = grid.axis_size(2).to_i64();
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    data.push(f(&grid.scaled_coord_of([x, y, z])));
                }
            }
        }
        Self {
            axis_size: [grid.axis_size(0), grid.axis_size(1), grid.axis_size(2)],
            data,
        }
    }

    /// Estimates gradients from a scalar grid by central differences
    /// (one-sided at the grid boundary)
    pub fn from_central_differences(scalar: &ScalarGrid<I, R>) -> Self {
        let grid = &scalar.grid;
        let nx = grid.axis_size(0).to_i64();
        let ny = grid.axis_size(1).to_i64();
        let nz = grid.axis_size(2).to_i64();
        let mut data = Vec::with_capacity(grid.num_vertices());
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let coord = [x, y, z];
                    let mut g = Vector3::zeros();
                    for d in 0..3 {
                        let n = grid.axis_size(d).to_i64();
                        let mut lo = coord;
                        let mut hi = coord;
                        lo[d] = (coord[d] - 1).max(0);
                        hi[d] = (coord[d] + 1).min(n - 1);
                        let ds = scalar.scalar(grid.flatten_coord(hi))
                            - scalar.scalar(grid.flatten_coord(lo));
                        let dx = <R as Real>::from_f64((hi[d] - lo[d]) as f64) * grid.spacing(d);
                        g[d] = ds / dx;
                    }
                    data.push(g);
                }
            }
        }
        Self {
            axis_size: [grid.axis_size(0), grid.axis_size(1), grid.axis_size(2)],
            data,
        }
    }

    /// Gradient at a grid vertex
    pub fn gradient(&self, vertex: I) -> Vector3<R> {
        self.data[vertex.to_usize()]
    }

    /// Returns true if this gradient grid has the same shape as the given grid
    pub fn matches(&self, grid: &UniformGrid<I, R>) -> bool {
        (0..3).all(|d| self.axis_size[d] == grid.axis_size(d))
    }

    /// Trilinearly interpolates the gradient at a scaled point, clamped to the grid
    pub fn interpolate(&self, grid: &UniformGrid<I, R>, point: &Vector3<R>) -> Vector3<R> {
        let (base, frac) = interpolation_cell(grid, point);
        let mut value = Vector3::zeros();
        for k in 0..8usize {
            let mut w = R::one();
            let mut coord = base;
            for d in 0..3 {
                if (k >> d) & 1 == 1 {
                    w *= frac[d];
                    coord[d] += 1;
                } else {
                    w *= R::one() - frac[d];
                }
            }
            value += self.data[grid.flatten_coord(coord).to_usize()] * w;
        }
        value
    }
}

/// Returns the base vertex coordinate and per-axis fractions for trilinear
/// interpolation at the given scaled point, clamped to the grid interior
fn interpolation_cell<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    point: &Vector3<R>,
) -> ([i64; 3], Vector3<R>) {
    let mut base = [0i64; 3];
    let mut frac = Vector3::zeros();
    for d in 0..3 {
        let x = point[d] / grid.spacing(d);
        let c = (x.floor().to_f64() as i64).clamp(0, grid.num_cubes_axis(d) - 1);
        base[d] = c;
        let f = x - <R as Real>::from_f64(c as f64);
        frac[d] = f.clamp(R::zero(), R::one());
    }
    (base, frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_5x5x5() -> UniformGrid<i32, f64> {
        UniformGrid::new_unit([5, 5, 5]).unwrap()
    }

    #[test]
    fn test_flatten_unflatten_roundtrip() {
        let grid = grid_5x5x5();
        for z in 0..5 {
            for y in 0..5 {
                for x in 0..5 {
                    let index = grid.flatten_coord([x, y, z]);
                    assert_eq!(grid.compute_coord(index), [x, y, z]);
                }
            }
        }
    }

    #[test]
    fn test_boundary_bits() {
        let grid = grid_5x5x5();
        let interior = grid.flatten_coord([2, 2, 2]);
        assert!(grid.compute_boundary_bits(interior).is_empty());
        let corner = grid.flatten_coord([0, 0, 0]);
        let bits = grid.compute_boundary_bits(corner);
        assert!(bits.contains(BoundaryBits::X_NEG));
        assert!(bits.contains(BoundaryBits::Y_NEG));
        assert!(bits.contains(BoundaryBits::Z_NEG));
        // Cube with max corner at the grid boundary
        let max_cube = grid.flatten_coord([3, 3, 3]);
        let bits = grid.compute_boundary_bits(max_cube);
        assert!(bits.contains(BoundaryBits::X_POS));
    }

    #[test]
    fn test_cube_neighbor_fast_path_matches_safe_path() {
        let grid = grid_5x5x5();
        let cube = grid.flatten_coord([2, 2, 2]);
        assert!(grid.compute_boundary_bits(cube).is_empty());
        for offset in NEIGHBOR_26_OFFSETS.iter() {
            let safe = grid.cube_neighbor(cube, *offset);
            let fast = grid.cube_neighbor_unchecked(cube, *offset);
            assert_eq!(safe, Some(fast));
        }
    }

    #[test]
    fn test_cube_containment_half_open() {
        let grid = grid_5x5x5();
        let cube = grid.flatten_coord([1, 1, 1]);
        assert!(grid.cube_contains_point(cube, &Vector3::new(1.0, 1.0, 1.0)));
        assert!(grid.cube_contains_point(cube, &Vector3::new(1.5, 1.9, 1.0)));
        assert!(!grid.cube_contains_point(cube, &Vector3::new(2.0, 1.5, 1.5)));
        // Closed max side at the grid boundary
        let last = grid.flatten_coord([3, 3, 3]);
        assert!(grid.cube_contains_point(last, &Vector3::new(4.0, 4.0, 4.0)));
    }

    #[test]
    fn test_linf_distances_scaled_by_spacing() {
        let grid = UniformGrid::<i32, f64>::new([5, 5, 5], [1.0, 2.0, 1.0]).unwrap();
        let cube = grid.flatten_coord([0, 0, 0]);
        // Cube center at (0.5, 1.0, 0.5)
        let p = Vector3::new(0.5, 3.0, 0.5);
        assert!((grid.linf_distance_from_cube_center(cube, &p) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_active_cube_and_bipolar_edge() {
        let grid = grid_5x5x5();
        let scalar = ScalarGrid::from_fn(grid, |p| p.x - 2.5);
        let active = scalar.grid.flatten_coord([2, 0, 0]);
        let inactive = scalar.grid.flatten_coord([0, 0, 0]);
        assert!(scalar.is_cube_active(active, 0.0));
        assert!(!scalar.is_cube_active(inactive, 0.0));
        let v0 = scalar.grid.flatten_coord([2, 0, 0]);
        let v1 = scalar.grid.flatten_coord([3, 0, 0]);
        assert!(scalar.is_bipolar(v0, v1, 0.0));
    }

    #[test]
    fn test_interpolation_matches_vertices() {
        let grid = grid_5x5x5();
        let scalar = ScalarGrid::from_fn(grid, |p| p.x + 2.0 * p.y - p.z);
        let p = Vector3::new(1.25, 2.5, 3.75);
        assert!((scalar.interpolate(&p) - (1.25 + 5.0 - 3.75)).abs() < 1e-12);
    }
}
