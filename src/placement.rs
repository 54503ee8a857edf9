//! Placement of sharp isosurface points in active cubes and the recompute passes
//!
//! Each active cube gets a primary point from the SVD kernel and an alternate
//! point from a second solve anchored at the nearest cube vertex. Later passes
//! recompute points of covered or conflicting cubes, substitute the alternate
//! coordinate, and solve constrained to bisector planes around grid vertices
//! and edges shared by two covered cubes.

use crate::isovert::{get_corner_or_edge_cubes, CubeFlag, IsovertSet};
use crate::numeric_types::{Index, Real};
use crate::svd::{
    compute_edge_intersection_centroid, svd_compute_sharp_vertex_for_cube,
    svd_compute_sharp_vertex_on_plane, FitLocation, SharpFit,
};
use crate::uniform_grid::{GradientGrid, ScalarGrid, UniformGrid};
use crate::{ReconstructionError, SharpIsovertParameters};
use nalgebra::Vector3;
use numeric_literals::replace_float_literals;

/// Computes the primary and alternate isovert coordinates of every active cube
pub fn compute_all_isovert_positions<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    isovert: &mut IsovertSet<I, R>,
) {
    log::info!("Computing isovert positions for {} cubes", isovert.len());
    for slot in 0..isovert.len() {
        compute_isovert_position(
            scalar,
            gradients,
            isovalue,
            param,
            param.grad_selection_cube_offset,
            slot,
            isovert,
        );
    }
    isovert.store_boundary_bits(&scalar.grid);
    set_cube_containing_isovert_all(scalar, isovalue, isovert);
}

/// Computes the isovert position of a single cube at the given gradient
/// selection offset, filling the primary and alternate coordinates
pub(crate) fn compute_isovert_position<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    offset: R,
    slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let grid = &scalar.grid;
    let cube = isovert.cube_index(slot);

    let anchor = if param.use_lindstrom {
        None
    } else {
        Some(grid.cube_center_scaled_coord(cube))
    };
    let fit = svd_compute_sharp_vertex_for_cube(
        scalar, gradients, cube, isovalue, param, offset, anchor,
    );

    let alt = if fit.num_large_eigenvalues > 2 || grid.cube_contains_point(cube, &fit.coord) {
        fit.coord
    } else {
        let anchor = snap_to_cube_vertex(grid, cube, &fit.coord);
        let fit_alt = svd_compute_sharp_vertex_for_cube(
            scalar,
            gradients,
            cube,
            isovalue,
            param,
            offset,
            Some(anchor),
        );
        if fit_alt.location == FitLocation::Svd {
            fit_alt.coord
        } else {
            fit.coord
        }
    };

    let record = isovert.record_mut(slot);
    record.isovert_coord_alt = alt;
    store_svd_info(grid, slot, &fit, isovert);
}

/// Stores the result of an SVD fit in the cube record
fn store_svd_info<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    slot: usize,
    fit: &SharpFit<R>,
    isovert: &mut IsovertSet<I, R>,
) {
    let cube = isovert.cube_index(slot);
    let record = isovert.record_mut(slot);
    record.isovert_coord = fit.coord;
    record.direction = fit.direction;
    record.num_eigenvalues = fit.num_large_eigenvalues.min(3) as u8;

    record.flag = if fit.num_large_eigenvalues > 1 && fit.location == FitLocation::Svd {
        CubeFlag::Available
    } else {
        CubeFlag::Smooth
    };
    record.flag_centroid_location = fit.location == FitLocation::Centroid;
    record.flag_far = fit.location == FitLocation::Far;
    record.flag_using_substitute_coord = false;
    record.flag_coord_from_other_cube = false;

    let coord = record.isovert_coord;
    isovert.record_mut(slot).linf_dist = grid.linf_distance_from_cube_center(cube, &coord);
}

/// Locates the cube containing the isovert of every record
pub fn set_cube_containing_isovert_all<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &mut IsovertSet<I, R>,
) {
    for slot in 0..isovert.len() {
        set_cube_containing_isovert(scalar, isovalue, slot, isovert);
    }
}

/// Locates the cube containing the isovert of one record and updates the
/// conflict flag.
///
/// An isovert outside the grid is clamped to the cube itself with no
/// conflict. A point on a facet shared with an active cube conflicts with
/// that active cube even when its own containing cube is inactive.
pub(crate) fn set_cube_containing_isovert<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    _isovalue: R,
    slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let grid = &scalar.grid;
    let cube = isovert.cube_index(slot);
    let point = isovert.record(slot).isovert_coord;

    if grid.cube_contains_point(cube, &point) || !grid.contains_point(&point) {
        let record = isovert.record_mut(slot);
        record.cube_containing_isovert = cube;
        record.flag_conflict = false;
        return;
    }

    let containing = grid
        .cube_containing_point(&point)
        .expect("point is inside the grid");

    if isovert.is_active(containing) {
        let record = isovert.record_mut(slot);
        record.cube_containing_isovert = containing;
        record.flag_conflict = true;
        return;
    }

    // Check whether the point lies on a facet shared with an active cube
    let containing_coord = grid.compute_coord(containing);
    let min = grid.scaled_coord_of(containing_coord);
    let mut on_min_face = [false; 3];
    let mut on_boundary = false;
    for d in 0..3 {
        if point[d] == min[d] && containing_coord[d] > 0 {
            on_min_face[d] = true;
            on_boundary = true;
        }
    }

    let mut conflicting = None;
    if on_boundary {
        'combinations: for k in 1..8usize {
            let mut coord = containing_coord;
            for d in 0..3 {
                if (k >> d) & 1 == 1 {
                    if !on_min_face[d] {
                        continue 'combinations;
                    }
                    coord[d] -= 1;
                }
            }
            if grid.is_cube_coord_valid(coord) {
                let candidate = grid.flatten_coord(coord);
                if isovert.is_active(candidate) {
                    conflicting = Some(candidate);
                    break;
                }
            }
        }
    }

    let record = isovert.record_mut(slot);
    match conflicting {
        Some(candidate) => {
            record.cube_containing_isovert = candidate;
            record.flag_conflict = true;
        }
        None => {
            record.cube_containing_isovert = containing;
            record.flag_conflict = false;
        }
    }
}

/// Snaps a point to the nearest vertex of the cube
pub(crate) fn snap_to_cube_vertex<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    cube: I,
    point: &Vector3<R>,
) -> Vector3<R> {
    let min = grid.scaled_coord(cube);
    let mut snapped = Vector3::zeros();
    for d in 0..3 {
        let x0 = min[d];
        let x1 = min[d] + grid.spacing(d);
        let mid = (x0 + x1) / <R as Real>::from_f64(2.0);
        snapped[d] = if point[d] <= mid { x0 } else { x1 };
    }
    snapped
}

/// Sets the isovert position of a record and updates the dependent state.
///
/// A covered-point or smooth cube receiving a sharp position becomes available
/// again; an available cube receiving a smooth position becomes smooth.
pub(crate) fn set_isovert_position<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    slot: usize,
    new_coord: &Vector3<R>,
    num_eigenvalues: u8,
    isovert: &mut IsovertSet<I, R>,
) {
    let cube = isovert.cube_index(slot);
    let record = isovert.record_mut(slot);
    record.isovert_coord = *new_coord;
    record.num_eigenvalues = num_eigenvalues;
    record.cube_containing_isovert = cube;
    record.flag_conflict = false;
    record.flag_centroid_location = false;

    if num_eigenvalues > 1 {
        if record.flag == CubeFlag::CoveredPoint || record.flag == CubeFlag::Smooth {
            record.flag = CubeFlag::Available;
        }
    } else if record.flag == CubeFlag::Available {
        record.flag = CubeFlag::Smooth;
    }

    record.linf_dist = grid.linf_distance_from_cube_center(cube, new_coord);
}

/// Sets the isovert position of a record from another cube's coordinate
pub(crate) fn set_isovert_position_from_other_cube<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    slot: usize,
    new_coord: &Vector3<R>,
    num_eigenvalues: u8,
    isovert: &mut IsovertSet<I, R>,
) {
    set_isovert_position(grid, slot, new_coord, num_eigenvalues, isovert);
    isovert.record_mut(slot).flag_coord_from_other_cube = true;
}

/// Replaces the isovert position of a record by its substitute coordinate
pub(crate) fn replace_with_substitute_coord<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let record = isovert.record(slot);
    let alt = record.isovert_coord_alt;
    let num_eigenvalues = record.num_eigenvalues;
    set_isovert_position(grid, slot, &alt, num_eigenvalues, isovert);
    isovert.record_mut(slot).flag_using_substitute_coord = true;
}

/// Returns true if the sharp vertex of the record lies in a covered cube
pub(crate) fn check_covered_point<I: Index, R: Real>(
    covered_grid: &[bool],
    isovert: &IsovertSet<I, R>,
    slot: usize,
) -> bool {
    let containing = isovert.record(slot).cube_containing_isovert;

    if covered_grid[containing.to_usize()] {
        return true;
    }

    if isovert.record(slot).cube_index != containing {
        if let Some(containing_slot) = isovert.gcube_index(containing) {
            return isovert.record(containing_slot).flag == CubeFlag::CoveredA;
        }
    }

    false
}

/// Marks an available cube whose sharp vertex lies in a covered cube
pub(crate) fn check_and_set_covered_point<I: Index, R: Real>(
    covered_grid: &[bool],
    isovert: &mut IsovertSet<I, R>,
    slot: usize,
) {
    if isovert.record(slot).flag == CubeFlag::Available
        && isovert.record(slot).cube_index != isovert.record(slot).cube_containing_isovert
        && check_covered_point(covered_grid, isovert, slot)
    {
        isovert.record_mut(slot).flag = CubeFlag::CoveredPoint;
    }
}

/// If the sharp vertex lies in a covered cube, switch to the substitute coordinate
pub(crate) fn check_covered_and_substitute<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    if check_covered_point(covered_grid, isovert, slot) {
        replace_with_substitute_coord(&scalar.grid, slot, isovert);
        set_cube_containing_isovert(scalar, isovalue, slot, isovert);
        check_and_set_covered_point(covered_grid, isovert, slot);
    }
}

/// If the sharp vertex is not contained in the cube but the substitute is,
/// switch to the substitute coordinate
pub(crate) fn check_not_contained_and_substitute<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let grid = &scalar.grid;
    let record = isovert.record(slot);
    let cube = record.cube_index;
    if !grid.cube_contains_point(cube, &record.isovert_coord)
        && grid.cube_contains_point(cube, &record.isovert_coord_alt)
    {
        replace_with_substitute_coord(grid, slot, isovert);
    }
}

/// Recomputes the isovert position of one cube at the given gradient
/// selection offset, tagging the record as recomputed
#[allow(clippy::too_many_arguments)]
pub fn recompute_isovert_position<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    offset: R,
    flag_min_offset: bool,
    slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    log::debug!(
        "Recomputing isovert coord for cube {:?} at offset {:?}",
        isovert.cube_index(slot),
        offset
    );
    compute_isovert_position(scalar, gradients, isovalue, param, offset, slot, isovert);
    let record = isovert.record_mut(slot);
    record.flag_recomputed_coord = true;
    record.flag_recomputed_coord_min_offset = flag_min_offset;
    set_cube_containing_isovert(scalar, isovalue, slot, isovert);
}

/// Recomputes isovert positions of cubes whose sharp vertex lies in a covered
/// cube, first at offset 0.5 (if the default offset is larger), then at 0
#[replace_float_literals(<R as Real>::from_f64(literal))]
pub fn recompute_covered_point_positions<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    isovert: &mut IsovertSet<I, R>,
) {
    if param.grad_selection_cube_offset > 0.5 {
        recompute_covered_point_positions_at_offset(
            scalar,
            gradients,
            covered_grid,
            isovalue,
            param,
            0.5,
            false,
            isovert,
        );
    }
    recompute_covered_point_positions_at_offset(
        scalar,
        gradients,
        covered_grid,
        isovalue,
        param,
        0.0,
        true,
        isovert,
    );
}

#[allow(clippy::too_many_arguments)]
fn recompute_covered_point_positions_at_offset<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    offset: R,
    flag_min_offset: bool,
    isovert: &mut IsovertSet<I, R>,
) {
    for slot in 0..isovert.len() {
        let record = isovert.record(slot);
        if (record.flag == CubeFlag::CoveredPoint || record.flag_far)
            && !record.flag_recomputed_coord_min_offset
        {
            recompute_isovert_position(
                scalar,
                gradients,
                isovalue,
                param,
                offset,
                flag_min_offset,
                slot,
                isovert,
            );
            check_covered_and_substitute(scalar, covered_grid, isovalue, slot, isovert);
        }
    }
}

/// Recomputes positions of unselected, uncovered cubes whose sharp vertex is
/// not contained in the cube; cubes still not contained fall back to the
/// centroid of the edge-isosurface intersections
#[replace_float_literals(<R as Real>::from_f64(literal))]
pub fn recompute_isovert_positions<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    isovert: &mut IsovertSet<I, R>,
) {
    let recompute_flags = |flag: CubeFlag| {
        matches!(
            flag,
            CubeFlag::Available | CubeFlag::Unavailable | CubeFlag::CoveredPoint
        )
    };

    if param.use_lindstrom {
        for (offset, flag_min_offset) in [(0.5, false), (0.0, true)] {
            if offset >= param.grad_selection_cube_offset && !flag_min_offset {
                continue;
            }
            for slot in 0..isovert.len() {
                let record = isovert.record(slot);
                if recompute_flags(record.flag)
                    && !scalar
                        .grid
                        .cube_contains_point(record.cube_index, &record.isovert_coord)
                {
                    recompute_isovert_position(
                        scalar,
                        gradients,
                        isovalue,
                        param,
                        offset,
                        flag_min_offset,
                        slot,
                        isovert,
                    );
                    check_not_contained_and_substitute(scalar, slot, isovert);
                }
            }
        }
    }

    for slot in 0..isovert.len() {
        let record = isovert.record(slot);
        if recompute_flags(record.flag)
            && !scalar
                .grid
                .cube_contains_point(record.cube_index, &record.isovert_coord)
        {
            let cube = record.cube_index;
            if let Some(centroid) = compute_edge_intersection_centroid(scalar, cube, isovalue) {
                let record = isovert.record_mut(slot);
                record.isovert_coord = centroid;
                record.flag_centroid_location = true;
            }
        }
    }
}

/// Swaps isovert positions of one record pair
fn swap_positions_of_pair<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    slot_a: usize,
    slot_b: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let coord_a = isovert.record(slot_a).isovert_coord;
    let num_a = isovert.record(slot_a).num_eigenvalues;
    let coord_b = isovert.record(slot_b).isovert_coord;
    let num_b = isovert.record(slot_b).num_eigenvalues;

    set_isovert_position_from_other_cube(grid, slot_a, &coord_b, num_b, isovert);
    set_isovert_position_from_other_cube(grid, slot_b, &coord_a, num_a, isovert);
}

/// Copies the isovert position from one record to another
pub(crate) fn copy_isovert_position<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    from_slot: usize,
    to_slot: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let coord = isovert.record(from_slot).isovert_coord;
    let num = isovert.record(from_slot).num_eigenvalues;
    set_isovert_position_from_other_cube(grid, to_slot, &coord, num, isovert);
}

/// Swaps or copies isovert positions of sharp cubes whose points conflict
pub fn swap_isovert_positions<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    max_dist_to_set_other: R,
    isovert: &mut IsovertSet<I, R>,
) -> Result<(), ReconstructionError<I>> {
    let sharp_list = get_corner_or_edge_cubes(isovert);

    for &slot_a in sharp_list.iter() {
        if !isovert.record(slot_a).flag_conflict {
            continue;
        }
        let conflicting_cube = isovert.record(slot_a).cube_containing_isovert;
        let slot_b = isovert.gcube_index(conflicting_cube).ok_or(
            ReconstructionError::InternalInconsistency {
                cube_index: conflicting_cube,
            },
        )?;

        if isovert.record(slot_b).linf_dist > max_dist_to_set_other {
            continue;
        }

        let record_b = isovert.record(slot_b);
        if record_b.flag_conflict || record_b.flag_centroid_location {
            let cube_a = isovert.cube_index(slot_a);
            if isovert.record(slot_b).cube_containing_isovert == cube_a {
                swap_positions_of_pair(grid, slot_a, slot_b, isovert);
            } else {
                copy_isovert_position(grid, slot_a, slot_b, isovert);
            }
        }
    }

    Ok(())
}

/// Applies the substitute coordinate where it falls inside the cube or inside
/// another conflicting cube
pub fn apply_secondary_isovert_positions<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    max_dist_to_set_other: R,
    isovert: &mut IsovertSet<I, R>,
) {
    let sharp_list = get_corner_or_edge_cubes(isovert);

    for &slot_a in sharp_list.iter() {
        if !isovert.record(slot_a).flag_conflict {
            continue;
        }
        let alt = isovert.record(slot_a).isovert_coord_alt;
        let cube_a = isovert.cube_index(slot_a);

        if grid.cube_contains_point(cube_a, &alt) {
            replace_with_substitute_coord(grid, slot_a, isovert);
        } else if grid.contains_point(&alt) {
            if isovert.record(slot_a).linf_dist > max_dist_to_set_other {
                continue;
            }
            let cube_b = grid
                .cube_containing_point(&alt)
                .expect("point is inside the grid");
            if let Some(slot_b) = isovert.gcube_index(cube_b) {
                if isovert.record(slot_b).flag_conflict {
                    let num = isovert.record(slot_a).num_eigenvalues;
                    set_isovert_position_from_other_cube(grid, slot_b, &alt, num, isovert);
                    isovert.record_mut(slot_b).flag_using_substitute_coord = true;
                }
            }
        }
    }
}

/// Copies a sharp cube's isovert to the unselected cube that owns its point,
/// when that cube's own point lies in covered territory
pub fn reset_covered_isovert_positions<I: Index, R: Real>(
    grid: &UniformGrid<I, R>,
    covered_grid: &[bool],
    isovert: &mut IsovertSet<I, R>,
) -> Result<(), ReconstructionError<I>> {
    let sharp_list = get_corner_or_edge_cubes(isovert);

    for &slot_a in sharp_list.iter() {
        if !isovert.record(slot_a).flag_conflict {
            continue;
        }
        let conflicting_cube = isovert.record(slot_a).cube_containing_isovert;
        let slot_b = isovert.gcube_index(conflicting_cube).ok_or(
            ReconstructionError::InternalInconsistency {
                cube_index: conflicting_cube,
            },
        )?;

        if isovert.record(slot_b).flag == CubeFlag::Selected {
            continue;
        }

        let cube_b = isovert.cube_index(slot_b);
        let cube_c = isovert.record(slot_b).cube_containing_isovert;
        if cube_c != cube_b && covered_grid[cube_c.to_usize()] {
            copy_isovert_position(grid, slot_a, slot_b, isovert);
        }
    }

    Ok(())
}

/// Sets the isovert position of a covered-point or smooth cube from a point
/// computed on a grid vertex or edge, reactivating it for selection
fn set_isovert_position_from_face<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    cube_index: I,
    coord: &Vector3<R>,
    num_eigenvalues: u8,
    from_vertex: bool,
    isovert: &mut IsovertSet<I, R>,
) -> bool {
    let Some(slot) = isovert.gcube_index(cube_index) else {
        return false;
    };

    let flag = isovert.record(slot).flag;
    if flag != CubeFlag::CoveredPoint && flag != CubeFlag::Smooth {
        return false;
    }

    set_isovert_position(&scalar.grid, slot, coord, num_eigenvalues, isovert);
    if from_vertex {
        isovert.record_mut(slot).flag_coord_from_vertex = true;
    } else {
        isovert.record_mut(slot).flag_coord_from_edge = true;
    }
    // The point may lie in a neighboring cube, not in this one
    set_cube_containing_isovert(scalar, isovalue, slot, isovert);
    true
}

/// Recomputes isovert positions on the bisector planes of grid vertices shared
/// by exactly two covered cubes in general position
#[replace_float_literals(<R as Real>::from_f64(literal))]
pub fn recompute_isovert_position_around_vertex<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    isovert: &mut IsovertSet<I, R>,
) {
    for slot in 0..isovert.len() {
        if isovert.record(slot).flag != CubeFlag::CoveredA {
            continue;
        }
        let cube = isovert.cube_index(slot);
        for k in 0..4 {
            let vertex = scalar.grid.cube_facet_vertex(cube, 0, k);
            recompute_around_one_vertex(
                scalar,
                gradients,
                covered_grid,
                isovalue,
                param,
                vertex,
                isovert,
            );
        }
    }
}

#[replace_float_literals(<R as Real>::from_f64(literal))]
fn recompute_around_one_vertex<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    vertex: I,
    isovert: &mut IsovertSet<I, R>,
) {
    let grid = &scalar.grid;
    if !grid.vertex_boundary_bits(vertex).is_empty() {
        return;
    }

    // Cube whose maximum corner is the vertex; its cube corners enumerate the
    // eight cubes incident on the vertex.
    let base_cube = grid.flatten_coord({
        let c = grid.compute_coord(vertex);
        [c[0] - 1, c[1] - 1, c[2] - 1]
    });

    let mut covered_cubes = [I::default(); 2];
    let mut num_covered = 0usize;
    let mut num_active_covered = 0usize;
    for k in 0..8 {
        let cube = grid.cube_vertex(base_cube, k);
        if covered_grid[cube.to_usize()] {
            num_covered += 1;
            if num_covered > 2 {
                return;
            }
            if isovert.is_active(cube) {
                if num_active_covered < 2 {
                    covered_cubes[num_active_covered] = cube;
                }
                num_active_covered += 1;
            }
        }
    }
    if num_covered != 2 || num_active_covered != 2 {
        return;
    }

    let coord0 = grid.compute_coord(covered_cubes[0]);
    let coord1 = grid.compute_coord(covered_cubes[1]);
    let one_div_sqrt3 = 1.0 / 3.0.sqrt();
    let mut plane_normal = Vector3::zeros();
    for d in 0..3 {
        if coord0[d] == coord1[d] {
            return;
        }
        plane_normal[d] = if coord0[d] < coord1[d] {
            one_div_sqrt3
        } else {
            -one_div_sqrt3
        };
    }

    let vertex_coord = grid.scaled_coord(vertex);
    let fit = svd_compute_sharp_vertex_on_plane(
        scalar,
        gradients,
        covered_cubes[0],
        isovalue,
        param,
        param.grad_selection_cube_offset,
        &vertex_coord,
        &plane_normal,
    );

    if fit.num_large_eigenvalues < 2 || !fit.on_plane || fit.location == FitLocation::Centroid {
        return;
    }
    if grid.linf_distance_from_vertex(vertex, &fit.coord) > 1.0 {
        return;
    }

    let num_eigenvalues = fit.num_large_eigenvalues.min(3) as u8;
    let mut flag_set = false;
    for k in 0..8 {
        let cube = grid.cube_vertex(base_cube, k);
        if grid.cube_contains_point(cube, &fit.coord)
            && set_isovert_position_from_face(
                scalar,
                isovalue,
                cube,
                &fit.coord,
                num_eigenvalues,
                true,
                isovert,
            )
        {
            flag_set = true;
        }
    }

    if !flag_set {
        // The containing cube is inactive or unavailable; offer the point to
        // every cube around the vertex instead.
        for k in 0..8 {
            let cube = grid.cube_vertex(base_cube, k);
            set_isovert_position_from_face(
                scalar,
                isovalue,
                cube,
                &fit.coord,
                num_eigenvalues,
                true,
                isovert,
            );
        }
    }
}

/// Recomputes isovert positions on the bisector planes of grid edges shared
/// by exactly two covered cubes in general position
pub fn recompute_isovert_position_around_edge<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    isovert: &mut IsovertSet<I, R>,
) {
    for slot in 0..isovert.len() {
        if isovert.record(slot).flag != CubeFlag::CoveredA {
            continue;
        }
        let cube = isovert.cube_index(slot);
        for edge_dir in 0..3 {
            let d1 = (edge_dir + 1) % 3;
            recompute_around_one_edge(
                scalar,
                gradients,
                covered_grid,
                isovalue,
                param,
                cube,
                edge_dir,
                isovert,
            );
            let iend0 = scalar.grid.next_vertex(cube, d1);
            recompute_around_one_edge(
                scalar,
                gradients,
                covered_grid,
                isovalue,
                param,
                iend0,
                edge_dir,
                isovert,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
#[replace_float_literals(<R as Real>::from_f64(literal))]
fn recompute_around_one_edge<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    covered_grid: &[bool],
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    iend0: I,
    edge_dir: usize,
    isovert: &mut IsovertSet<I, R>,
) {
    let grid = &scalar.grid;
    if !grid.vertex_boundary_bits(iend0).is_empty() {
        return;
    }

    let d1 = (edge_dir + 1) % 3;
    let d2 = (edge_dir + 2) % 3;

    let cube_around = |j1: i64, j2: i64| {
        let c = grid.compute_coord(iend0);
        let mut coord = c;
        coord[d1] -= j1;
        coord[d2] -= j2;
        grid.flatten_coord(coord)
    };

    let mut covered_cubes = [I::default(); 2];
    let mut num_covered = 0usize;
    let mut num_active_covered = 0usize;
    for j1 in 0..2i64 {
        for j2 in 0..2i64 {
            let cube = cube_around(j1, j2);
            if covered_grid[cube.to_usize()] {
                num_covered += 1;
                if num_covered > 2 {
                    return;
                }
                if isovert.is_active(cube) {
                    if num_active_covered < 2 {
                        covered_cubes[num_active_covered] = cube;
                    }
                    num_active_covered += 1;
                }
            }
        }
    }
    if num_covered != 2 || num_active_covered != 2 {
        return;
    }

    let coord0 = grid.compute_coord(covered_cubes[0]);
    let coord1 = grid.compute_coord(covered_cubes[1]);
    if coord0[d1] == coord1[d1] || coord0[d2] == coord1[d2] {
        return;
    }

    let one_div_sqrt2 = 1.0 / 2.0.sqrt();
    let mut plane_normal = Vector3::zeros();
    for d in [d1, d2] {
        plane_normal[d] = if coord0[d] < coord1[d] {
            one_div_sqrt2
        } else {
            -one_div_sqrt2
        };
    }

    let mut point_x = grid.scaled_coord(iend0);
    point_x[edge_dir] += grid.spacing(edge_dir) / 2.0;

    let fit = svd_compute_sharp_vertex_on_plane(
        scalar,
        gradients,
        covered_cubes[0],
        isovalue,
        param,
        param.grad_selection_cube_offset,
        &point_x,
        &plane_normal,
    );

    if fit.num_large_eigenvalues < 2 || !fit.on_plane || fit.location == FitLocation::Centroid {
        return;
    }
    if grid.linf_distance_from_vertex(iend0, &fit.coord) > 1.0 {
        return;
    }

    let num_eigenvalues = fit.num_large_eigenvalues.min(3) as u8;
    let mut flag_set = false;
    for j1 in 0..2i64 {
        for j2 in 0..2i64 {
            let cube = cube_around(j1, j2);
            if grid.cube_contains_point(cube, &fit.coord)
                && set_isovert_position_from_face(
                    scalar,
                    isovalue,
                    cube,
                    &fit.coord,
                    num_eigenvalues,
                    false,
                    isovert,
                )
            {
                flag_set = true;
            }
        }
    }

    if !flag_set {
        for j1 in 0..2i64 {
            for j2 in 0..2i64 {
                let cube = cube_around(j1, j2);
                set_isovert_position_from_face(
                    scalar,
                    isovalue,
                    cube,
                    &fit.coord,
                    num_eigenvalues,
                    false,
                    isovert,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform_grid::UniformGrid;

    fn edge_field() -> (ScalarGrid<i32, f64>, GradientGrid<i32, f64>) {
        let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
        let scalar = ScalarGrid::from_fn(grid.clone(), |p| p.y.max(p.z) - 2.25);
        let gradients = GradientGrid::from_fn(&grid, |p| {
            if p.y >= p.z {
                Vector3::new(0.0, 1.0, 0.0)
            } else {
                Vector3::new(0.0, 0.0, 1.0)
            }
        });
        (scalar, gradients)
    }

    #[test]
    fn test_compute_all_positions_classifies_edge_cubes() {
        let (scalar, gradients) = edge_field();
        let param = SharpIsovertParameters::default();
        let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        compute_all_isovert_positions(&scalar, &gradients, 0.0, &param, &mut isovert);

        // The cube containing the sharp edge has two large eigenvalues and its
        // isovert on the edge (y, z) = (2.25, 2.25)
        let edge_cube = scalar.grid.flatten_coord([1, 2, 2]);
        let slot = isovert.gcube_index(edge_cube).unwrap();
        let record = isovert.record(slot);
        assert_eq!(record.num_eigenvalues, 2);
        assert_eq!(record.flag, CubeFlag::Available);
        assert!((record.isovert_coord.y - 2.25).abs() < 1e-6);
        assert!((record.isovert_coord.z - 2.25).abs() < 1e-6);
        assert!(!record.flag_conflict);
        assert_eq!(record.cube_containing_isovert, edge_cube);
    }

    #[test]
    fn test_containment_invariant_after_placement() {
        let (scalar, gradients) = edge_field();
        let param = SharpIsovertParameters::default();
        let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        compute_all_isovert_positions(&scalar, &gradients, 0.0, &param, &mut isovert);

        for slot in 0..isovert.len() {
            let record = isovert.record(slot);
            if record.flag_centroid_location {
                continue;
            }
            if scalar.grid.contains_point(&record.isovert_coord) {
                assert!(
                    scalar
                        .grid
                        .cube_contains_point(record.cube_containing_isovert, &record.isovert_coord),
                    "containment invariant violated for cube {:?}",
                    record.cube_index
                );
            } else {
                assert_eq!(record.cube_containing_isovert, record.cube_index);
                assert!(!record.flag_conflict);
            }
        }
    }

    #[test]
    fn test_snap_to_cube_vertex() {
        let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
        let cube = grid.flatten_coord([1, 1, 1]);
        let p = Vector3::new(1.2, 1.8, 1.5);
        let snapped = snap_to_cube_vertex(&grid, cube, &p);
        assert_eq!(snapped, Vector3::new(1.0, 2.0, 1.0));
    }
}
