//! Selection of sharp cubes whose isovertices become mesh vertices
//!
//! Corner cubes are selected first, then edge cubes near covered corners, then
//! interior edge cubes, with recompute and resort passes in between. Selecting
//! a cube stamps its 26-neighborhood into the covered grid; a reselect pass
//! replaces selected edge cubes whose neighborhood barely overlaps another
//! selection.

use crate::bin_grid::BinGrid;
use crate::isovert::{get_corner_or_edge_cubes, sort_gcube_list, CubeFlag, IsovertSet};
use crate::numeric_types::{Index, Real};
use crate::placement::{
    check_and_set_covered_point, check_covered_point, recompute_covered_point_positions,
    recompute_isovert_position_around_edge, recompute_isovert_position_around_vertex,
    reset_covered_isovert_positions,
};
use crate::uniform_grid::ScalarGrid;
use crate::{ReconstructionError, SharpIsovertParameters};
use itertools::Itertools;
use crate::topology::{EDGE_NEIGHBOR_OFFSETS, FACET_NEIGHBOR_OFFSETS, VERTEX_NEIGHBOR_OFFSETS};
use crate::uniform_grid::GradientGrid;

/// Computes the overlap of the 3x3x3 regions around two cubes.
///
/// Returns the overlap dimension: -1 for no overlap, otherwise the number of
/// axes along which the overlap region is more than one vertex wide.
pub(crate) fn find_3x3x3_overlap(cube_a_coord: [i64; 3], cube_b_coord: [i64; 3]) -> i32 {
    let mut overlap_dim = 0;
    for d in 0..3 {
        let rmin = (cube_a_coord[d] - 1).max(cube_b_coord[d] - 1);
        let rmax = (cube_a_coord[d] + 2).min(cube_b_coord[d] + 2);
        if rmin > rmax {
            return -1;
        }
        if rmin < rmax {
            overlap_dim += 1;
        }
    }
    overlap_dim
}

/// Returns true if two cubes are connected by a bipolar edge in the overlap of
/// their 3x3x3 regions
pub(crate) fn are_connected<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    cube1: I,
    cube2: I,
    isovalue: R,
) -> bool {
    let grid = &scalar.grid;
    let a = grid.compute_coord(cube1);
    let b = grid.compute_coord(cube2);

    let mut rmin = [0i64; 3];
    let mut rmax = [0i64; 3];
    let mut overlap_dim = 0;
    for d in 0..3 {
        rmin[d] = (a[d] - 1).max(b[d] - 1).max(0);
        rmax[d] = (a[d] + 2).min(b[d] + 2).min(grid.axis_size(d).to_i64() - 1);
        if rmin[d] > rmax[d] {
            return false;
        }
        if rmin[d] < rmax[d] {
            overlap_dim += 1;
        }
    }
    if overlap_dim < 2 {
        return false;
    }

    for d0 in 0..3 {
        let d1 = (d0 + 1) % 3;
        let d2 = (d0 + 2) % 3;
        for i1 in rmin[d1]..=rmax[d1] {
            for i2 in rmin[d2]..=rmax[d2] {
                for i0 in rmin[d0]..rmax[d0] {
                    let mut coord = [0i64; 3];
                    coord[d0] = i0;
                    coord[d1] = i1;
                    coord[d2] = i2;
                    let v0 = grid.flatten_coord(coord);
                    let v1 = grid.next_vertex(v0, d0);
                    if scalar.is_bipolar(v0, v1, isovalue) {
                        return true;
                    }
                }
            }
        }
    }

    false
}

/// Cosine of the angle at `apex` in the triangle of the three isoverts
fn compute_cos_angle<I: Index, R: Real>(
    isovert: &IsovertSet<I, R>,
    slot1: usize,
    apex: usize,
    slot3: usize,
) -> R {
    let eps = <R as Real>::from_f64(1e-3);
    let v12 = isovert.isovert_coord(apex) - isovert.isovert_coord(slot1);
    let v32 = isovert.isovert_coord(apex) - isovert.isovert_coord(slot3);
    let m12 = v12.norm();
    let m32 = v32.norm();
    if m12 < eps || m32 < eps {
        return R::one();
    }
    (v12 / m12).dot(&(v32 / m32))
}

/// Returns true if the triangle of the three cubes' isoverts has an angle
/// larger than the threshold angle (cosine below `threshold`)
fn is_angle_large<I: Index, R: Real>(
    isovert: &IsovertSet<I, R>,
    cube0: I,
    threshold: R,
    cube1: I,
    cube2: I,
) -> bool {
    let (Some(slot1), Some(slot2), Some(slot0)) = (
        isovert.gcube_index(cube1),
        isovert.gcube_index(cube2),
        isovert.gcube_index(cube0),
    ) else {
        return false;
    };

    let cos_at_0 = compute_cos_angle(isovert, slot1, slot0, slot2);
    let cos_at_1 = compute_cos_angle(isovert, slot0, slot1, slot2);
    let cos_at_2 = compute_cos_angle(isovert, slot0, slot2, slot1);

    cos_at_0 < threshold || cos_at_1 < threshold || cos_at_2 < threshold
}

/// State of one selection run: the covered grid and the bin grid of selected cubes
pub(crate) struct Selector<'a, I: Index, R: Real> {
    scalar: &'a ScalarGrid<I, R>,
    isovalue: R,
    param: &'a SharpIsovertParameters<R>,
    pub(crate) covered_grid: Vec<bool>,
    bin_grid: BinGrid<I>,
    selected_scratch: Vec<I>,
}

impl<'a, I: Index, R: Real> Selector<'a, I, R> {
    pub(crate) fn new(
        scalar: &'a ScalarGrid<I, R>,
        isovalue: R,
        param: &'a SharpIsovertParameters<R>,
    ) -> Self {
        Self {
            scalar,
            isovalue,
            param,
            covered_grid: vec![false; scalar.grid.num_vertices()],
            bin_grid: BinGrid::new(&scalar.grid, param.bin_width),
            selected_scratch: Vec::new(),
        }
    }

    /// Returns true if selecting this cube creates a triangle with a large
    /// angle together with two nearby selected cubes
    fn creates_triangle(&mut self, isovert: &IsovertSet<I, R>, cube0: I) -> bool {
        let threshold = <R as Real>::from_f64((140.0f64).to_radians().cos());
        let grid = &self.scalar.grid;

        self.bin_grid
            .get_selected(grid, cube0, &mut self.selected_scratch);

        let connected: Vec<I> = self
            .selected_scratch
            .iter()
            .copied()
            .filter(|&c| are_connected(self.scalar, cube0, c, self.isovalue))
            .collect();

        for (&cube1, &cube2) in connected.iter().tuple_combinations() {
            let d01 = grid.linf_distance_between_cubes(cube0, cube1);
            let d02 = grid.linf_distance_between_cubes(cube0, cube2);
            let d12 = grid.linf_distance_between_cubes(cube1, cube2);
            if d01 < 3 && d02 < 3 && d12 < 3 && is_angle_large(isovert, cube0, threshold, cube1, cube2)
            {
                return true;
            }
        }

        false
    }

    /// Marks the cube selected and stamps its neighborhood into the covered grid
    fn select_cube(&mut self, slot: usize, covered_flag: CubeFlag, isovert: &mut IsovertSet<I, R>) {
        let cube = isovert.cube_index(slot);
        isovert.record_mut(slot).flag = CubeFlag::Selected;
        self.covered_grid[cube.to_usize()] = true;
        self.bin_grid.insert(&self.scalar.grid, cube);
        log::debug!(
            "Selecting cube {:?}, linf_dist {:?}",
            cube,
            isovert.record(slot).linf_dist
        );

        let neighbors: Vec<I> = self.scalar.grid.neighborhood_26(cube).collect();
        for neighbor in neighbors {
            self.covered_grid[neighbor.to_usize()] = true;
            if let Some(neighbor_slot) = isovert.gcube_index(neighbor) {
                let record = isovert.record_mut(neighbor_slot);
                if record.flag != CubeFlag::Selected {
                    record.flag = covered_flag;
                }
                if record.covered_by == record.cube_index {
                    record.covered_by = cube;
                }
            }
        }
    }

    /// Unselects a cube and uncovers its neighborhood.
    ///
    /// Precondition: the neighbors are covered only by this cube.
    fn unselect_cube(&mut self, slot: usize, isovert: &mut IsovertSet<I, R>) {
        let cube = isovert.cube_index(slot);
        isovert.record_mut(slot).flag = CubeFlag::Available;
        self.bin_grid.remove(&self.scalar.grid, cube);

        if isovert.record(slot).boundary_bits.is_empty() {
            self.covered_grid[cube.to_usize()] = false;
            let neighbors: Vec<I> = self.scalar.grid.neighborhood_26(cube).collect();
            for neighbor in neighbors {
                self.covered_grid[neighbor.to_usize()] = false;
                if let Some(neighbor_slot) = isovert.gcube_index(neighbor) {
                    let record = isovert.record_mut(neighbor_slot);
                    if record.num_eigenvalues > 1 && !record.flag_centroid_location {
                        record.flag = CubeFlag::Available;
                    } else {
                        record.flag = CubeFlag::Smooth;
                    }
                    record.covered_by = record.cube_index;
                }
            }
        } else {
            // Boundary cubes are not unselected beyond their own record;
            // selection never reaches cubes with boundary bits set.
        }
    }

    /// Runs the admissibility checks and selects the cube if they pass
    fn check_and_select_cube(
        &mut self,
        slot: usize,
        covered_flag: CubeFlag,
        isovert: &mut IsovertSet<I, R>,
    ) {
        if check_covered_point(&self.covered_grid, isovert, slot) {
            isovert.record_mut(slot).flag = CubeFlag::CoveredPoint;
            return;
        }

        let cube = isovert.cube_index(slot);
        if self.creates_triangle(isovert, cube) {
            isovert.record_mut(slot).flag = CubeFlag::Unavailable;
        } else {
            self.select_cube(slot, covered_flag, isovert);
        }
    }

    /// Selects corner cubes (three large eigenvalues)
    fn select_corner_cubes(&mut self, sorted_list: &[usize], isovert: &mut IsovertSet<I, R>) {
        let linf_threshold = self.param.linf_dist_thresh_merge_sharp;
        for &slot in sorted_list {
            let record = isovert.record(slot);
            if record.boundary_bits.is_empty()
                && record.flag == CubeFlag::Available
                && record.linf_dist < linf_threshold
                && record.num_eigenvalues > 2
            {
                self.check_and_select_cube(slot, CubeFlag::CoveredCorner, isovert);
            }
        }
    }

    /// Returns true if any facet, edge or vertex adjacent neighbor has the flag
    fn is_neighbor(&self, isovert: &IsovertSet<I, R>, cube: I, flag: CubeFlag) -> bool {
        let grid = &self.scalar.grid;
        for offset in FACET_NEIGHBOR_OFFSETS
            .iter()
            .chain(EDGE_NEIGHBOR_OFFSETS.iter())
            .chain(VERTEX_NEIGHBOR_OFFSETS.iter())
        {
            if let Some(neighbor) = grid.cube_neighbor(cube, *offset) {
                if isovert.is_flag(neighbor, flag) {
                    return true;
                }
            }
        }
        false
    }

    /// Selects edge cubes adjacent to a covered corner with a small distance
    fn select_cubes_near_corners(&mut self, sorted_list: &[usize], isovert: &mut IsovertSet<I, R>) {
        let half = <R as Real>::from_f64(0.5);
        for &slot in sorted_list {
            let record = isovert.record(slot);
            if record.flag != CubeFlag::Available {
                continue;
            }
            if record.boundary_bits.is_empty() && record.linf_dist <= half {
                let cube = record.cube_index;
                if self.is_neighbor(isovert, cube, CubeFlag::CoveredCorner) {
                    self.check_and_select_cube(slot, CubeFlag::CoveredA, isovert);
                }
                if isovert.record(slot).flag == CubeFlag::Selected {
                    isovert.record_mut(slot).flag_near_corner = true;
                }
            }
        }
    }

    /// Selects interior edge cubes (two large eigenvalues)
    fn select_edge_cubes(&mut self, sorted_list: &[usize], isovert: &mut IsovertSet<I, R>) {
        let linf_threshold = self.param.linf_dist_thresh_merge_sharp;
        for &slot in sorted_list {
            check_and_set_covered_point(&self.covered_grid, isovert, slot);

            let record = isovert.record(slot);
            if record.boundary_bits.is_empty()
                && record.flag == CubeFlag::Available
                && record.linf_dist < linf_threshold
                && record.num_eigenvalues == 2
                && !record.flag_conflict
            {
                self.check_and_select_cube(slot, CubeFlag::CoveredA, isovert);
            }
        }
    }

    /// Selects the first admissible edge cube from the list, returning its slot
    fn select_one_edge_cube(
        &mut self,
        from_list: &[usize],
        isovert: &mut IsovertSet<I, R>,
    ) -> Option<usize> {
        let linf_threshold = self.param.linf_dist_thresh_merge_sharp;
        for &slot in from_list {
            let record = isovert.record(slot);
            if record.boundary_bits.is_empty()
                && record.flag == CubeFlag::Available
                && record.linf_dist < linf_threshold
                && record.num_eigenvalues == 2
                && !record.flag_conflict
            {
                self.check_and_select_cube(slot, CubeFlag::CoveredA, isovert);
                if isovert.record(slot).flag == CubeFlag::Selected {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Sharp cubes in the 26-neighborhood of the given cube, sorted
    fn get_corner_or_edge_cubes_around_cube(
        &self,
        isovert: &IsovertSet<I, R>,
        slot: usize,
    ) -> Vec<usize> {
        let mut neighbor_list = Vec::new();
        if !isovert.record(slot).boundary_bits.is_empty() {
            return neighbor_list;
        }
        let cube = isovert.cube_index(slot);
        for neighbor in self.scalar.grid.neighborhood_26(cube) {
            if let Some(neighbor_slot) = isovert.gcube_index(neighbor) {
                if isovert.record(neighbor_slot).num_eigenvalues > 1 {
                    neighbor_list.push(neighbor_slot);
                }
            }
        }
        sort_gcube_list(isovert, &mut neighbor_list);
        neighbor_list
    }

    /// Unselects the cube and tries to select two replacement edge cubes;
    /// reselects the original if the first replacement fails
    fn reselect_two_edge_cubes(
        &mut self,
        slot: usize,
        from_list: &[usize],
        isovert: &mut IsovertSet<I, R>,
    ) {
        let neighbor_list = self.get_corner_or_edge_cubes_around_cube(isovert, slot);

        self.unselect_cube(slot, isovert);

        if self.select_one_edge_cube(from_list, isovert).is_some() {
            let _ = self.select_one_edge_cube(&neighbor_list, isovert);
        } else {
            // Both replacements failed, reselect the original cube
            self.select_cube(slot, CubeFlag::CoveredA, isovert);
        }
    }

    /// Reselects around one selected edge cube whose 3x3x3 region overlaps
    /// another selection in fewer than three dimensions
    fn reselect_edge_cubes_around(
        &mut self,
        slot: usize,
        nearby_selected: &[I],
        isovert: &mut IsovertSet<I, R>,
    ) {
        let grid = &self.scalar.grid;
        let cube = isovert.cube_index(slot);
        let cube_coord = grid.compute_coord(cube);

        let mut max_overlap_dim = -1;
        let mut max_overlap_cube = None;
        for &other in nearby_selected {
            if other == cube {
                continue;
            }
            let overlap_dim = find_3x3x3_overlap(cube_coord, grid.compute_coord(other));
            if overlap_dim > max_overlap_dim {
                max_overlap_dim = overlap_dim;
                max_overlap_cube = Some(other);
            }
        }

        if max_overlap_dim >= 3 {
            // Some cube is covered by both this cube and another selection
            return;
        }
        let Some(max_overlap_cube) = max_overlap_cube else {
            return;
        };

        if !isovert.record(slot).boundary_bits.is_empty() {
            // Boundary cubes keep their selection untouched
            return;
        }

        let overlap_coord = grid.compute_coord(max_overlap_cube);
        let mut from_list = Vec::new();
        for neighbor in grid.neighborhood_26(cube) {
            if let Some(neighbor_slot) = isovert.gcube_index(neighbor) {
                if find_3x3x3_overlap(overlap_coord, grid.compute_coord(neighbor)) >= 3 {
                    from_list.push(neighbor_slot);
                }
            }
        }

        if !from_list.is_empty() {
            sort_gcube_list(isovert, &mut from_list);
            self.reselect_two_edge_cubes(slot, &from_list, isovert);
        }
    }

    /// The reselect pass over all selected edge cubes
    fn reselect_edge_cubes(&mut self, sorted_list: &[usize], isovert: &mut IsovertSet<I, R>) {
        for &slot in sorted_list {
            let record = isovert.record(slot);
            if record.flag == CubeFlag::Selected
                && record.num_eigenvalues == 2
                && !record.flag_near_corner
            {
                let cube = record.cube_index;
                let mut nearby = std::mem::take(&mut self.selected_scratch);
                self.bin_grid.get_selected(&self.scalar.grid, cube, &mut nearby);
                self.reselect_edge_cubes_around(slot, &nearby, isovert);
                self.selected_scratch = nearby;
            }
        }
    }
}

/// Selects sharp isosurface cubes, interleaving selection phases with
/// recompute and reset passes
pub fn select_sharp_isovert<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    isovert: &mut IsovertSet<I, R>,
) -> Result<(), ReconstructionError<I>> {
    let mut sharp_gcube_list = get_corner_or_edge_cubes(isovert);
    isovert.initialize_covered_by();

    let mut selector = Selector::new(scalar, isovalue, param);

    log::info!(
        "Selecting sharp cubes among {} candidates",
        sharp_gcube_list.len()
    );

    selector.select_corner_cubes(&sharp_gcube_list, isovert);

    recompute_covered_point_positions(
        scalar,
        gradients,
        &selector.covered_grid,
        isovalue,
        param,
        isovert,
    );
    reset_covered_isovert_positions(&scalar.grid, &selector.covered_grid, isovert)?;
    sort_gcube_list(isovert, &mut sharp_gcube_list);

    selector.select_cubes_near_corners(&sharp_gcube_list, isovert);

    recompute_covered_point_positions(
        scalar,
        gradients,
        &selector.covered_grid,
        isovalue,
        param,
        isovert,
    );
    reset_covered_isovert_positions(&scalar.grid, &selector.covered_grid, isovert)?;
    sort_gcube_list(isovert, &mut sharp_gcube_list);

    selector.select_edge_cubes(&sharp_gcube_list, isovert);

    recompute_covered_point_positions(
        scalar,
        gradients,
        &selector.covered_grid,
        isovalue,
        param,
        isovert,
    );
    reset_covered_isovert_positions(&scalar.grid, &selector.covered_grid, isovert)?;
    sort_gcube_list(isovert, &mut sharp_gcube_list);

    selector.reselect_edge_cubes(&sharp_gcube_list, isovert);

    recompute_isovert_position_around_vertex(
        scalar,
        gradients,
        &selector.covered_grid,
        isovalue,
        param,
        isovert,
    );
    recompute_isovert_position_around_edge(
        scalar,
        gradients,
        &selector.covered_grid,
        isovalue,
        param,
        isovert,
    );

    // Retry selecting edge cubes whose positions were recomputed on faces
    selector.select_edge_cubes(&sharp_gcube_list, isovert);

    recompute_covered_point_positions(
        scalar,
        gradients,
        &selector.covered_grid,
        isovalue,
        param,
        isovert,
    );
    reset_covered_isovert_positions(&scalar.grid, &selector.covered_grid, isovert)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::compute_all_isovert_positions;
    use crate::uniform_grid::UniformGrid;
    use nalgebra::Vector3;

    fn corner_field() -> (ScalarGrid<i32, f64>, GradientGrid<i32, f64>) {
        let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
        let scalar = ScalarGrid::from_fn(grid.clone(), |p| p.x.max(p.y).max(p.z) - 2.25);
        let gradients = GradientGrid::from_fn(&grid, |p| {
            if p.x >= p.y && p.x >= p.z {
                Vector3::new(1.0, 0.0, 0.0)
            } else if p.y >= p.z {
                Vector3::new(0.0, 1.0, 0.0)
            } else {
                Vector3::new(0.0, 0.0, 1.0)
            }
        });
        (scalar, gradients)
    }

    #[test]
    fn test_corner_field_selects_single_corner_cube() {
        let (scalar, gradients) = corner_field();
        let param = SharpIsovertParameters::default();
        let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        compute_all_isovert_positions(&scalar, &gradients, 0.0, &param, &mut isovert);
        select_sharp_isovert(&scalar, &gradients, 0.0, &param, &mut isovert).unwrap();

        let corner_cube = scalar.grid.flatten_coord([2, 2, 2]);
        let slot = isovert.gcube_index(corner_cube).unwrap();
        assert_eq!(isovert.record(slot).flag, CubeFlag::Selected);
        assert_eq!(isovert.record(slot).num_eigenvalues, 3);

        // All other selected cubes must not be within 3x3x3 of the corner
        for other in 0..isovert.len() {
            if other == slot {
                continue;
            }
            if isovert.record(other).flag == CubeFlag::Selected {
                let dist = scalar
                    .grid
                    .linf_distance_between_cubes(corner_cube, isovert.cube_index(other));
                assert!(dist >= 2, "selected cube inside covered region");
            }
        }
    }

    #[test]
    fn test_covered_cubes_point_to_selected_cube() {
        let (scalar, gradients) = corner_field();
        let param = SharpIsovertParameters::default();
        let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        compute_all_isovert_positions(&scalar, &gradients, 0.0, &param, &mut isovert);
        select_sharp_isovert(&scalar, &gradients, 0.0, &param, &mut isovert).unwrap();

        for slot in 0..isovert.len() {
            let record = isovert.record(slot);
            if matches!(record.flag, CubeFlag::CoveredA | CubeFlag::CoveredCorner) {
                let covering_slot = isovert
                    .gcube_index(record.covered_by)
                    .expect("covering cube is active");
                assert_eq!(isovert.record(covering_slot).flag, CubeFlag::Selected);
                let dist = scalar
                    .grid
                    .linf_distance_between_cubes(record.cube_index, record.covered_by);
                assert!(dist <= 1);
            }
        }
    }

    #[test]
    fn test_find_3x3x3_overlap_dimensions() {
        assert_eq!(find_3x3x3_overlap([2, 2, 2], [2, 2, 2]), 3);
        assert_eq!(find_3x3x3_overlap([2, 2, 2], [5, 2, 2]), 2);
        assert_eq!(find_3x3x3_overlap([2, 2, 2], [5, 5, 2]), 1);
        assert_eq!(find_3x3x3_overlap([2, 2, 2], [5, 5, 5]), 0);
        assert_eq!(find_3x3x3_overlap([2, 2, 2], [6, 2, 2]), -1);
    }
}
