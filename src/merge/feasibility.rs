//! Feasibility predicates guarding every proposed entry of the cube-to-vertex map
//!
//! Each predicate returns bool; a false result prevents the mapping and is not
//! an error. Predicates that need lookahead temporarily commit entries of the
//! map through [MapGuard], which restores the previous values when dropped, so
//! a failed check always leaves the map byte-identical to its state before.

use crate::dual_table::IsodualCubeTable;
use crate::isovert::{CubeFlag, IsovertSet};
use crate::numeric_types::{Index, Real};
use crate::selection::are_connected;
use crate::topology::FACET_NEIGHBOR_OFFSETS;
use crate::uniform_grid::ScalarGrid;
use crate::MergeParameters;
use arrayvec::ArrayVec;
use smallvec::SmallVec;

/// Selected cubes connected to a cube through the scalar field
pub(crate) type ConnectedSharp<I> = SmallVec<[I; 8]>;

/// Scope guard for temporary map mutations: restores the saved entries on drop
pub(crate) struct MapGuard<'a> {
    map: &'a mut Vec<usize>,
    saved: SmallVec<[(usize, usize); 4]>,
}

impl<'a> MapGuard<'a> {
    pub(crate) fn new(map: &'a mut Vec<usize>) -> Self {
        Self {
            map,
            saved: SmallVec::new(),
        }
    }

    /// Temporarily sets `map[slot] = to`
    pub(crate) fn set(&mut self, slot: usize, to: usize) {
        self.saved.push((slot, self.map[slot]));
        self.map[slot] = to;
    }

    /// View of the map with the temporary entries applied
    pub(crate) fn map(&self) -> &[usize] {
        self.map.as_slice()
    }
}

impl Drop for MapGuard<'_> {
    fn drop(&mut self) {
        for &(slot, value) in self.saved.iter().rev() {
            self.map[slot] = value;
        }
    }
}

/// Parameters of one map-feasibility check
pub(crate) struct MapCheckParams<'a, R: Real> {
    /// Extended mapping: looser separation, stricter manifold checks
    pub extended: bool,
    /// Strict or loose distortion tolerance
    pub strict: bool,
    /// Whether cubes with ambiguous facets may be mapped individually
    pub ambiguous: bool,
    /// Lookup table for multi-isovertex cubes, if running in multi mode
    pub table: Option<&'a IsodualCubeTable>,
    pub merge_param: &'a MergeParameters<R>,
}

/// Returns true if some facet-adjacent cube of `cube0` already maps to
/// `to_cube` and the shared facet is bipolar
pub(crate) fn is_unselected_cube_connected_to<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    cube0: I,
    to_cube: I,
    gcube_map: &[usize],
) -> bool {
    let Some(slot0) = isovert.gcube_index(cube0) else {
        return false;
    };
    let Some(to_slot) = isovert.gcube_index(to_cube) else {
        return false;
    };
    let boundary_bits = isovert.record(slot0).boundary_bits;

    for (facet, offset) in FACET_NEIGHBOR_OFFSETS.iter().enumerate() {
        let neighbor = if boundary_bits.is_empty() {
            scalar.grid.cube_neighbor_unchecked(cube0, *offset)
        } else {
            match scalar.grid.cube_neighbor(cube0, *offset) {
                Some(neighbor) => neighbor,
                None => continue,
            }
        };
        if let Some(neighbor_slot) = isovert.gcube_index(neighbor) {
            if scalar.is_facet_bipolar(cube0, facet, isovalue)
                && gcube_map[neighbor_slot] == to_slot
            {
                return true;
            }
        }
    }

    false
}

/// Collects the distinct selected cubes that the 26-neighborhood of `cube0`
/// maps to and that are connected to `cube0` through the scalar field
pub(crate) fn find_connected_sharp<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    cube0: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
) -> ConnectedSharp<I> {
    let mut connected = ConnectedSharp::new();
    for neighbor in scalar.grid.neighborhood_26(cube0) {
        let Some(neighbor_slot) = isovert.gcube_index(neighbor) else {
            continue;
        };
        let target_slot = gcube_map[neighbor_slot];
        if isovert.record(target_slot).flag != CubeFlag::Selected {
            continue;
        }
        let target_cube = isovert.cube_index(target_slot);
        if connected.contains(&target_cube) {
            continue;
        }
        if are_connected(scalar, cube0, target_cube, isovalue) {
            connected.push(target_cube);
        }
    }
    connected
}

/// Returns true if `cube0` maps to `to_cube`
fn does_cube_map_to<I: Index, R: Real>(
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
    cube0: I,
    to_cube: I,
) -> bool {
    match (isovert.gcube_index(cube0), isovert.gcube_index(to_cube)) {
        (Some(slot0), Some(to_slot)) => gcube_map[slot0] == to_slot,
        _ => false,
    }
}

/// Counts the bipolar edges around `cube0` where one adjacent cube maps to
/// `to_cube` and the diagonally opposite cube does not
pub(crate) fn count_edge_mappings_around_cube<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    cube0: I,
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
) -> usize {
    let Some(slot0) = isovert.gcube_index(cube0) else {
        return 0;
    };
    if !isovert.record(slot0).boundary_bits.is_empty() {
        return 0;
    }

    let grid = &scalar.grid;
    let mut num_count = 0;
    for edge_dir in 0..3 {
        let d1 = (edge_dir + 1) % 3;
        let d2 = (edge_dir + 2) % 3;
        for j1 in 0..2usize {
            for j2 in 0..2usize {
                let iend0 = I::from_i64(
                    cube0.to_i64()
                        + (j1 as i64) * grid.axis_increment(d1)
                        + (j2 as i64) * grid.axis_increment(d2),
                );
                let iend1 = grid.next_vertex(iend0, edge_dir);
                if !scalar.is_bipolar(iend0, iend1, isovalue) {
                    continue;
                }
                let iv1 = grid.adjacent_vertex(cube0, d1, j1);
                let iv2 = grid.adjacent_vertex(cube0, d2, j2);
                let iv3 = grid.adjacent_vertex(iv1, d2, j2);

                let flag_v1 = does_cube_map_to(isovert, gcube_map, iv1, to_cube);
                let flag_v2 = does_cube_map_to(isovert, gcube_map, iv2, to_cube);
                let flag_v3 = does_cube_map_to(isovert, gcube_map, iv3, to_cube);

                if flag_v1 != flag_v3 {
                    num_count += 1;
                }
                if flag_v2 != flag_v3 {
                    num_count += 1;
                }
            }
        }
    }
    num_count
}

/// Returns true if the boundary between the cubes mapping to each connected
/// sharp cube and the rest stays manifold around `cube0`
pub(crate) fn check_adjacent_cubes_manifold<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    cube0: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
    connected_sharp: &ConnectedSharp<I>,
) -> bool {
    for &sharp_cube in connected_sharp.iter() {
        let count =
            count_edge_mappings_around_cube(scalar, isovalue, cube0, sharp_cube, isovert, gcube_map);
        if count > 2 {
            return false;
        }
    }
    true
}

/// Edge-manifold test: after hypothetically mapping `from_cube` to `to_cube`,
/// no bipolar grid edge incident to `from_cube` may have its surrounding cubes
/// map to three or more distinct selected cubes.
///
/// In extended mode the stricter per-target boundary-transition count is
/// checked as well.
pub(crate) fn check_edge_manifold<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    from_cube: I,
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    extended: bool,
) -> bool {
    let (Some(from_slot), Some(to_slot)) =
        (isovert.gcube_index(from_cube), isovert.gcube_index(to_cube))
    else {
        return false;
    };

    let grid = &scalar.grid;
    let from_coord = grid.compute_coord(from_cube);

    {
        let mut guard = MapGuard::new(gcube_map);
        guard.set(from_slot, to_slot);
        let map = guard.map();

        for edge_dir in 0..3 {
            let d1 = (edge_dir + 1) % 3;
            let d2 = (edge_dir + 2) % 3;
            for k2 in 0..4usize {
                // Minimum endpoint of cube edge (edge_dir, k2)
                let mut end_coord = from_coord;
                end_coord[d1] += (k2 & 1) as i64;
                end_coord[d2] += (k2 >> 1) as i64;
                let iend0 = grid.flatten_coord(end_coord);
                let iend1 = grid.next_vertex(iend0, edge_dir);
                if !scalar.is_bipolar(iend0, iend1, isovalue) {
                    continue;
                }

                // Distinct selected targets of the cubes sharing the edge
                let mut targets: ArrayVec<usize, 4> = ArrayVec::new();
                for a in 0..2i64 {
                    for b in 0..2i64 {
                        let mut cube_coord = end_coord;
                        cube_coord[d1] -= a;
                        cube_coord[d2] -= b;
                        if !grid.is_cube_coord_valid(cube_coord) {
                            continue;
                        }
                        let cube = grid.flatten_coord(cube_coord);
                        if let Some(slot) = isovert.gcube_index(cube) {
                            let target = map[slot];
                            if isovert.record(target).flag == CubeFlag::Selected
                                && !targets.contains(&target)
                            {
                                targets.push(target);
                            }
                        }
                    }
                }
                if targets.len() >= 3 {
                    return false;
                }
            }
        }
    }

    if extended {
        let mut guard = MapGuard::new(gcube_map);
        guard.set(from_slot, to_slot);
        let connected = find_connected_sharp(scalar, isovalue, from_cube, isovert, guard.map());
        if !check_adjacent_cubes_manifold(
            scalar,
            isovalue,
            from_cube,
            isovert,
            guard.map(),
            &connected,
        ) {
            return false;
        }
    }

    true
}

/// Returns true if every cube of the region spanned by two cube coordinates
/// that matches `coord` is a corner vertex of the region
fn region_between_contains<I: Index, R: Real>(
    isovert: &IsovertSet<I, R>,
    region_a: [i64; 3],
    region_b: [i64; 3],
    slot: usize,
) -> bool {
    let coord = isovert.record(slot).cube_coord;
    let mut is_region_vertex = true;
    for d in 0..3 {
        let min = region_a[d].min(region_b[d]);
        let max = region_a[d].max(region_b[d]);
        if coord[d] < min || coord[d] > max {
            return false;
        }
        if coord[d] > min && coord[d] < max {
            is_region_vertex = false;
        }
    }
    !is_region_vertex
}

/// Separating-cube test: mapping must not jump over another selected sharp
/// cube lying between the target and a sharp cube connected to `from_cube`
pub(crate) fn check_separating_cubes<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    from_cube: I,
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
    _extended: bool,
) -> bool {
    let Some(to_slot) = isovert.gcube_index(to_cube) else {
        return false;
    };
    let to_coord = isovert.record(to_slot).cube_coord;

    let connected = find_connected_sharp(scalar, isovalue, from_cube, isovert, gcube_map);

    for i in 0..connected.len() {
        if connected[i] == to_cube {
            continue;
        }
        let slot_a = isovert
            .gcube_index(connected[i])
            .expect("connected cubes are active");
        let coord_a = isovert.record(slot_a).cube_coord;

        for j in 0..connected.len() {
            if connected[j] == to_cube || j == i {
                continue;
            }
            let Some(slot_b) = isovert.gcube_index(connected[j]) else {
                continue;
            };
            // Corner cubes never separate
            if isovert.record(slot_b).num_eigenvalues == 3 {
                continue;
            }
            if region_between_contains(isovert, to_coord, coord_a, slot_b) {
                return false;
            }
        }
    }

    true
}

/// Returns true if the triangle of `from`, `to` and the mapped positions of
/// two neighbors collapses or acquires a small angle when `from` moves to `to`
fn is_triangle_distorted<I: Index, R: Real>(
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    ca_slot: usize,
    cb_slot: usize,
    gcube_map: &[usize],
    min_distance: R,
    max_cos: R,
) -> bool {
    let from_coord = isovert.isovert_coord(from_slot);
    let to_coord = isovert.isovert_coord(to_slot);
    let ca_coord = isovert.isovert_coord(gcube_map[ca_slot]);
    let cb_coord = isovert.isovert_coord(gcube_map[cb_slot]);

    let v0 = to_coord - cb_coord;
    let v1 = ca_coord - cb_coord;
    let v2 = from_coord - cb_coord;

    let m0 = v0.norm();
    let m1 = v1.norm();
    let m2 = v2.norm();
    if m0 <= min_distance || m1 <= min_distance || m2 <= min_distance {
        // Points too close to determine distortion, assume distorted
        return true;
    }

    let cos_angle = (v0 / m0).dot(&(v1 / m1));
    cos_angle > max_cos
}

/// Returns true if moving the isovert of `from` onto `to` distorts a triangle
/// formed with two facet-adjacent neighbors
pub(crate) fn does_cube_merge_distort_triangles<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_map: &[usize],
    min_distance: R,
    max_cos: R,
) -> bool {
    let grid = &scalar.grid;
    let from_coord = isovert.record(from_slot).cube_coord;

    for d in 0..3 {
        let d1 = (d + 1) % 3;
        let d2 = (d + 2) % 3;
        for j1 in [-1i64, 1] {
            if j1 < 0 && from_coord[d1] == 0 {
                continue;
            }
            if j1 > 0 && from_coord[d1] + 1 >= grid.num_cubes_axis(d1) {
                continue;
            }
            for j2 in [-1i64, 1] {
                if j2 < 0 && from_coord[d2] == 0 {
                    continue;
                }
                if j2 > 0 && from_coord[d2] + 1 >= grid.num_cubes_axis(d2) {
                    continue;
                }

                let mut c1_coord = from_coord;
                c1_coord[d1] += j1;
                let mut c2_coord = from_coord;
                c2_coord[d2] += j2;
                let c1 = grid.flatten_coord(c1_coord);
                let c2 = grid.flatten_coord(c2_coord);

                let (Some(c1_slot), Some(c2_slot)) =
                    (isovert.gcube_index(c1), isovert.gcube_index(c2))
                else {
                    continue;
                };

                if gcube_map[c1_slot] != to_slot
                    && gcube_map[c2_slot] != to_slot
                    && gcube_map[c1_slot] != gcube_map[c2_slot]
                    && is_triangle_distorted(
                        isovert,
                        from_slot,
                        to_slot,
                        c1_slot,
                        c2_slot,
                        gcube_map,
                        min_distance,
                        max_cos,
                    )
                {
                    return true;
                }
            }
        }
    }

    false
}

/// Distortion gate of the feasibility stack
pub(crate) fn check_distortion<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
    from_slot: usize,
    to_slot: usize,
    strict: bool,
    merge_param: &MergeParameters<R>,
) -> bool {
    let max_cos = if strict {
        merge_param.cos_max_small_angle_strict
    } else {
        merge_param.cos_max_small_angle_loose
    };
    !does_cube_merge_distort_triangles(
        scalar,
        isovert,
        from_slot,
        to_slot,
        gcube_map,
        merge_param.min_distance_between_isovert,
        max_cos,
    )
}

/// Returns true if the unmapped prev/next neighbor of `from` along some axis
/// would end up on the wrong side of the target
pub(crate) fn does_merge_reverse_isovert_order<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_map: &[usize],
) -> bool {
    let grid = &scalar.grid;
    let from_cube = isovert.cube_index(from_slot);
    let from_coord = isovert.record(from_slot).cube_coord;
    let to_coord = isovert.record(to_slot).cube_coord;

    if !isovert.record(from_slot).boundary_bits.is_empty() {
        return false;
    }

    for d in 0..3 {
        let prev = grid.prev_vertex(from_cube, d);
        if let Some(prev_slot) = isovert.gcube_index(prev) {
            if gcube_map[prev_slot] == prev_slot && to_coord[d] < from_coord[d] - 1 {
                return true;
            }
        }
        let next = grid.next_vertex(from_cube, d);
        if let Some(next_slot) = isovert.gcube_index(next) {
            if gcube_map[next_slot] == next_slot && to_coord[d] > from_coord[d] + 1 {
                return true;
            }
        }
    }

    false
}

/// Returns true if the facet neighbor of `from_cube` in direction `(d, j)`
/// maps to one of the two given targets
fn does_adjacent_cube_map_to<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_cube: I,
    d: usize,
    j: i64,
    to_slot: usize,
    to_slot_b: usize,
    gcube_map: &[usize],
) -> bool {
    let mut offset = [0i64; 3];
    offset[d] = j;
    let Some(neighbor) = scalar.grid.cube_neighbor(from_cube, offset) else {
        return false;
    };
    let Some(neighbor_slot) = isovert.gcube_index(neighbor) else {
        return false;
    };
    gcube_map[neighbor_slot] == to_slot || gcube_map[neighbor_slot] == to_slot_b
}

/// Returns true if the three cubes diagonal to `from_cube` in directions
/// `(d1, j1)` and `(d2, j2)` are all mapped
fn are_cubes_mapped_iii<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_cube: I,
    d1: usize,
    j1: i64,
    d2: usize,
    j2: i64,
    gcube_map: &[usize],
) -> bool {
    let offsets = [
        {
            let mut o = [0i64; 3];
            o[d1] = j1;
            o
        },
        {
            let mut o = [0i64; 3];
            o[d2] = j2;
            o
        },
        {
            let mut o = [0i64; 3];
            o[d1] = j1;
            o[d2] = j2;
            o
        },
    ];
    for offset in offsets {
        let Some(cube) = scalar.grid.cube_neighbor(from_cube, offset) else {
            continue;
        };
        let Some(slot) = isovert.gcube_index(cube) else {
            continue;
        };
        if gcube_map[slot] == slot {
            return false;
        }
    }
    true
}

fn is_order_correct(d: usize, j: i64, coord_a: [i64; 3], coord_b: [i64; 3]) -> bool {
    if j < 0 {
        coord_a[d] <= coord_b[d]
    } else {
        coord_a[d] >= coord_b[d]
    }
}

fn is_strict_order_correct(d: usize, j: i64, coord_a: [i64; 3], coord_b: [i64; 3]) -> bool {
    if j < 0 {
        coord_a[d] < coord_b[d]
    } else {
        coord_a[d] > coord_b[d]
    }
}

/// Returns true if the merge would identify the target's axis coordinate with
/// that of a facet-adjacent neighbor's target.
///
/// The non-strict comparison applies only to `gcube_c`, the selected cube that
/// a facet-adjacent neighbor of `from` already maps to.
fn does_merge_identify_facet_adjacent_axis_coord<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_c: Option<usize>,
    gcube_map: &[usize],
) -> bool {
    let grid = &scalar.grid;
    let from_cube = isovert.cube_index(from_slot);
    let to_coord = isovert.record(to_slot).cube_coord;

    if !isovert.record(from_slot).boundary_bits.is_empty() {
        return false;
    }

    for d in 0..3 {
        for (vertex, side) in [
            (grid.prev_vertex(from_cube, d), -1i64),
            (grid.next_vertex(from_cube, d), 1i64),
        ] {
            let Some(adjacent_slot) = isovert.gcube_index(vertex) else {
                continue;
            };
            let to_slot_b = gcube_map[adjacent_slot];
            if to_slot_b == to_slot {
                continue;
            }
            let to_coord_b = isovert.record(to_slot_b).cube_coord;

            if Some(to_slot_b) == gcube_c {
                if !is_strict_order_correct(d, side, to_coord_b, to_coord)
                    && to_coord[d] != to_coord_b[d]
                {
                    return true;
                }
            } else if !is_strict_order_correct(d, side, to_coord_b, to_coord) {
                return true;
            }
        }
    }

    false
}

/// Edge-adjacent variant of the axis-coordinate identification check
fn does_merge_identify_edge_adjacent_axis_coord<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_c: Option<usize>,
    gcube_map: &[usize],
    rule_set_b: bool,
) -> bool {
    let grid = &scalar.grid;
    let from_cube = isovert.cube_index(from_slot);
    let to_coord = isovert.record(to_slot).cube_coord;

    if !isovert.record(from_slot).boundary_bits.is_empty() {
        return false;
    }

    for edge_dir in 0..3 {
        let d1 = (edge_dir + 1) % 3;
        let d2 = (edge_dir + 2) % 3;
        for j1 in [-1i64, 1] {
            for j2 in [-1i64, 1] {
                let mut offset = [0i64; 3];
                offset[d1] = j1;
                offset[d2] = j2;
                let Some(cube_b) = grid.cube_neighbor(from_cube, offset) else {
                    continue;
                };
                let Some(slot_b) = isovert.gcube_index(cube_b) else {
                    continue;
                };
                let to_slot_b = gcube_map[slot_b];
                if to_slot_b == to_slot {
                    continue;
                }
                let to_coord_b = isovert.record(to_slot_b).cube_coord;

                // Rule set B (corner targets) relaxes neighbors that map away;
                // otherwise only gcube_c gets the relaxed comparison.
                let relaxed = if rule_set_b {
                    to_slot_b != slot_b
                } else {
                    Some(to_slot_b) == gcube_c
                };

                if relaxed {
                    if are_cubes_mapped_iii(
                        scalar, isovert, from_cube, d1, j1, d2, j2, gcube_map,
                    ) {
                        continue;
                    }
                    if !is_order_correct(d1, j1, to_coord_b, to_coord)
                        && !does_adjacent_cube_map_to(
                            scalar, isovert, from_cube, d2, j2, to_slot, to_slot_b, gcube_map,
                        )
                    {
                        return true;
                    }
                    if !is_order_correct(d2, j2, to_coord_b, to_coord)
                        && !does_adjacent_cube_map_to(
                            scalar, isovert, from_cube, d1, j1, to_slot, to_slot_b, gcube_map,
                        )
                    {
                        return true;
                    }
                } else {
                    if !is_strict_order_correct(d1, j1, to_coord_b, to_coord) {
                        return true;
                    }
                    if !is_strict_order_correct(d2, j2, to_coord_b, to_coord) {
                        return true;
                    }
                }
            }
        }
    }

    false
}

/// Vertex-adjacent variant of the axis-coordinate identification check
fn does_merge_identify_vertex_adjacent_axis_coord<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_c: Option<usize>,
    gcube_map: &[usize],
    rule_set_b: bool,
) -> bool {
    let grid = &scalar.grid;
    let from_cube = isovert.cube_index(from_slot);
    let to_coord = isovert.record(to_slot).cube_coord;

    if !isovert.record(from_slot).boundary_bits.is_empty() {
        return false;
    }

    for j0 in [-1i64, 1] {
        for j1 in [-1i64, 1] {
            for j2 in [-1i64, 1] {
                let offset = [j0, j1, j2];
                let Some(cube_b) = grid.cube_neighbor(from_cube, offset) else {
                    continue;
                };
                let Some(slot_b) = isovert.gcube_index(cube_b) else {
                    continue;
                };
                let to_slot_b = gcube_map[slot_b];
                if to_slot_b == to_slot {
                    continue;
                }
                let to_coord_b = isovert.record(to_slot_b).cube_coord;

                let relaxed = if rule_set_b {
                    to_slot_b != slot_b
                } else {
                    Some(to_slot_b) == gcube_c
                };

                for d in 0..3 {
                    let j = offset[d];
                    if relaxed {
                        let da = (d + 1) % 3;
                        let db = (d + 2) % 3;
                        if !is_order_correct(d, j, to_coord_b, to_coord)
                            && !does_adjacent_cube_map_to(
                                scalar, isovert, from_cube, da, offset[da], to_slot, to_slot_b,
                                gcube_map,
                            )
                            && !does_adjacent_cube_map_to(
                                scalar, isovert, from_cube, db, offset[db], to_slot, to_slot_b,
                                gcube_map,
                            )
                        {
                            return true;
                        }
                    } else if !is_strict_order_correct(d, j, to_coord_b, to_coord) {
                        return true;
                    }
                }
            }
        }
    }

    false
}

/// Order-preservation gate of the basic feasibility stack: for every adjacent
/// cube A with target to', the axis coordinates of to and to' must be
/// consistent with the relative position of `from` and A. Only a strict
/// reversal fails; equal coordinates are allowed.
pub(crate) fn does_merge_strictly_reverse_order<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_map: &[usize],
) -> bool {
    let grid = &scalar.grid;
    let from_cube = isovert.cube_index(from_slot);
    let to_coord = isovert.record(to_slot).cube_coord;

    for offset in crate::topology::NEIGHBOR_26_OFFSETS.iter() {
        let Some(neighbor) = grid.cube_neighbor(from_cube, *offset) else {
            continue;
        };
        let Some(neighbor_slot) = isovert.gcube_index(neighbor) else {
            continue;
        };
        let target = gcube_map[neighbor_slot];
        if target == to_slot {
            continue;
        }
        let target_coord = isovert.record(target).cube_coord;
        for d in 0..3 {
            if offset[d] != 0 && !is_order_correct(d, offset[d], target_coord, to_coord) {
                return true;
            }
        }
    }

    false
}

/// Merge permission for corner extensions: order must not reverse and
/// triangles must not distort
pub(crate) fn is_corner_cube_merge_permitted<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_map: &[usize],
    merge_param: &MergeParameters<R>,
) -> bool {
    if does_merge_reverse_isovert_order(scalar, isovert, from_slot, to_slot, gcube_map) {
        return false;
    }
    if does_cube_merge_distort_triangles(
        scalar,
        isovert,
        from_slot,
        to_slot,
        gcube_map,
        merge_param.min_distance_between_isovert,
        merge_param.cos_max_small_angle_strict,
    ) {
        return false;
    }
    true
}

/// Order-preservation gate: facet, edge and vertex adjacent neighbors must end
/// up on consistent sides of the target.
///
/// Corner targets (three eigenvalues) use the coarser rule set B for the edge
/// and vertex checks.
pub(crate) fn is_cube_merge_permitted<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_c: Option<usize>,
    gcube_map: &[usize],
    merge_param: &MergeParameters<R>,
) -> bool {
    if does_merge_identify_facet_adjacent_axis_coord(
        scalar, isovert, from_slot, to_slot, gcube_c, gcube_map,
    ) {
        return false;
    }

    let rule_set_b = isovert.record(to_slot).num_eigenvalues == 3;
    if does_merge_identify_edge_adjacent_axis_coord(
        scalar, isovert, from_slot, to_slot, gcube_c, gcube_map, rule_set_b,
    ) {
        return false;
    }
    if does_merge_identify_vertex_adjacent_axis_coord(
        scalar, isovert, from_slot, to_slot, gcube_c, gcube_map, rule_set_b,
    ) {
        return false;
    }

    if does_cube_merge_distort_triangles(
        scalar,
        isovert,
        from_slot,
        to_slot,
        gcube_map,
        merge_param.min_distance_between_isovert,
        merge_param.cos_max_small_angle_strict,
    ) {
        return false;
    }

    true
}

/// Pair variant of the merge permission: each cube is checked with the other
/// temporarily committed
pub(crate) fn is_cube_merge_permitted_pair<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    slot_a: usize,
    slot_b: usize,
    to_slot: usize,
    gcube_c: Option<usize>,
    gcube_map: &mut Vec<usize>,
    merge_param: &MergeParameters<R>,
) -> bool {
    let slots = [slot_a, slot_b];
    for i0 in 0..2 {
        let i1 = (i0 + 1) % 2;
        let mut guard = MapGuard::new(gcube_map);
        guard.set(slots[i1], to_slot);
        let permitted = is_cube_merge_permitted(
            scalar,
            isovert,
            slots[i0],
            to_slot,
            gcube_c,
            guard.map(),
            merge_param,
        );
        drop(guard);
        if !permitted {
            return false;
        }
    }
    true
}

/// Ambiguous-facet consistency: a multi-isovertex cube may only map when every
/// neighbor across an ambiguous facet already maps to the same target
pub(crate) fn check_cubes_with_multi_isov<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: &IsodualCubeTable,
    from_cube: I,
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
) -> bool {
    let Some(from_slot) = isovert.gcube_index(from_cube) else {
        return false;
    };
    let Some(to_slot) = isovert.gcube_index(to_cube) else {
        return false;
    };
    let table_index = isovert.record(from_slot).table_index;

    if table.num_iso_vertices(table_index) < 2 {
        return true;
    }

    for (facet, offset) in FACET_NEIGHBOR_OFFSETS.iter().enumerate() {
        if !table.is_facet_ambiguous(table_index, facet) {
            continue;
        }
        let Some(neighbor) = scalar.grid.cube_neighbor(from_cube, *offset) else {
            continue;
        };
        let Some(neighbor_slot) = isovert.gcube_index(neighbor) else {
            continue;
        };
        if gcube_map[neighbor_slot] != to_slot {
            return false;
        }
    }

    true
}

/// The full feasibility stack for a single-cube map proposal.
///
/// The map is only temporarily mutated for lookahead and is always restored.
pub(crate) fn check_map<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    from_cube: I,
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) -> bool {
    let (Some(from_slot), Some(to_slot)) =
        (isovert.gcube_index(from_cube), isovert.gcube_index(to_cube))
    else {
        return false;
    };

    if !is_unselected_cube_connected_to(scalar, isovalue, isovert, from_cube, to_cube, gcube_map) {
        return false;
    }

    if let Some(table) = check.table {
        if check.ambiguous {
            if !check_cubes_with_multi_isov(scalar, table, from_cube, to_cube, isovert, gcube_map) {
                return false;
            }
        } else if table.is_ambiguous(isovert.record(from_slot).table_index) {
            return false;
        }
    }

    if !check_edge_manifold(
        scalar,
        isovalue,
        from_cube,
        to_cube,
        isovert,
        gcube_map,
        check.extended,
    ) {
        return false;
    }

    if !check_separating_cubes(
        scalar,
        isovalue,
        from_cube,
        to_cube,
        isovert,
        gcube_map,
        check.extended,
    ) {
        return false;
    }

    if !check_distortion(
        scalar,
        isovert,
        gcube_map,
        from_slot,
        to_slot,
        check.strict,
        check.merge_param,
    ) {
        return false;
    }

    if does_merge_strictly_reverse_order(scalar, isovert, from_slot, to_slot, gcube_map) {
        return false;
    }

    true
}

/// Feasibility of mapping two cubes together: each is checked with the other
/// temporarily committed, plus the pairwise manifold and separation tests
pub(crate) fn check_map_pair<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    cubes: [I; 2],
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) -> bool {
    let Some(to_slot) = isovert.gcube_index(to_cube) else {
        return false;
    };
    let slots = [
        match isovert.gcube_index(cubes[0]) {
            Some(slot) => slot,
            None => return false,
        },
        match isovert.gcube_index(cubes[1]) {
            Some(slot) => slot,
            None => return false,
        },
    ];

    for i0 in 0..2 {
        let i1 = (i0 + 1) % 2;
        let mut guard = MapGuard::new(gcube_map);
        guard.set(slots[i1], to_slot);
        let connected = is_unselected_cube_connected_to(
            scalar,
            isovalue,
            isovert,
            cubes[i0],
            to_cube,
            guard.map(),
        ) && check_distortion(
            scalar,
            isovert,
            guard.map(),
            slots[i0],
            to_slot,
            check.strict,
            check.merge_param,
        ) && check_separating_cubes(
            scalar,
            isovalue,
            cubes[i0],
            to_cube,
            isovert,
            guard.map(),
            check.extended,
        ) && !does_merge_strictly_reverse_order(
            scalar,
            isovert,
            slots[i0],
            to_slot,
            guard.map(),
        );
        drop(guard);
        if !connected {
            return false;
        }

        // Manifold check with the partner committed
        let mut guard = MapGuard::new(gcube_map);
        guard.set(slots[i1], to_slot);
        let connected_sharp =
            find_connected_sharp(scalar, isovalue, cubes[i0], isovert, guard.map());
        let manifold = check_adjacent_cubes_manifold(
            scalar,
            isovalue,
            cubes[i0],
            isovert,
            guard.map(),
            &connected_sharp,
        );
        drop(guard);
        if !manifold {
            return false;
        }
    }

    true
}

/// Feasibility of mapping three cubes around a grid edge together: two are
/// temporarily committed before the single-cube check runs on the third
pub(crate) fn check_map_triple<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    cubes: [I; 3],
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) -> bool {
    let Some(to_slot) = isovert.gcube_index(to_cube) else {
        return false;
    };
    let mut slots = [0usize; 3];
    for (i, &cube) in cubes.iter().enumerate() {
        match isovert.gcube_index(cube) {
            Some(slot) => slots[i] = slot,
            None => return false,
        }
    }

    for i0 in 0..3 {
        let i1 = (i0 + 1) % 3;
        let i2 = (i0 + 2) % 3;
        let mut guard = MapGuard::new(gcube_map);
        guard.set(slots[i1], to_slot);
        guard.set(slots[i2], to_slot);
        let connected = is_unselected_cube_connected_to(
            scalar,
            isovalue,
            isovert,
            cubes[i0],
            to_cube,
            guard.map(),
        ) && check_distortion(
            scalar,
            isovert,
            guard.map(),
            slots[i0],
            to_slot,
            check.strict,
            check.merge_param,
        ) && check_separating_cubes(
            scalar,
            isovalue,
            cubes[i0],
            to_cube,
            isovert,
            guard.map(),
            check.extended,
        ) && !does_merge_strictly_reverse_order(
            scalar,
            isovert,
            slots[i0],
            to_slot,
            guard.map(),
        );
        drop(guard);
        if !connected {
            return false;
        }

        let mut guard = MapGuard::new(gcube_map);
        guard.set(slots[i1], to_slot);
        guard.set(slots[i2], to_slot);
        let connected_sharp =
            find_connected_sharp(scalar, isovalue, cubes[i0], isovert, guard.map());
        let manifold = check_adjacent_cubes_manifold(
            scalar,
            isovalue,
            cubes[i0],
            isovert,
            guard.map(),
            &connected_sharp,
        );
        drop(guard);
        if !manifold {
            return false;
        }
    }

    true
}

/// Feasibility of mapping a pair of cubes sharing an ambiguous facet.
///
/// Not both cubes may carry multiple isosurface vertices.
pub(crate) fn check_map_ambig_pair<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: &IsodualCubeTable,
    isovalue: R,
    cubes: [I; 2],
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) -> bool {
    let (Some(slot0), Some(slot1)) = (isovert.gcube_index(cubes[0]), isovert.gcube_index(cubes[1]))
    else {
        return false;
    };

    let num_isov0 = table.num_iso_vertices(isovert.record(slot0).table_index);
    let num_isov1 = table.num_iso_vertices(isovert.record(slot1).table_index);
    if num_isov0 > 1 && num_isov1 > 1 {
        return false;
    }

    check_map_pair(scalar, isovalue, cubes, to_cube, isovert, gcube_map, check)
}

/// Returns true if `from` is facet adjacent to two cubes which share an edge
/// and map to two different selected cubes, one of them `to_slot`.
///
/// The other target is returned for the asymmetric merge-permission rules.
pub(crate) fn check_facet_adjacent_maps<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    gcube_map: &[usize],
    from_cube: I,
    to_slot: usize,
) -> Option<usize> {
    let grid = &scalar.grid;
    let Some(from_slot) = isovert.gcube_index(from_cube) else {
        return None;
    };
    if !isovert.record(from_slot).boundary_bits.is_empty() {
        // Boundary cubes never take part in extended mapping
        return None;
    }

    for edge_dir in 0..3 {
        let d1 = (edge_dir + 1) % 3;
        let d2 = (edge_dir + 2) % 3;
        for j1 in 0..2usize {
            let cube1 = grid.adjacent_vertex(from_cube, d1, j1);
            let Some(slot1) = isovert.gcube_index(cube1) else {
                continue;
            };
            let record1 = isovert.record(slot1);
            if !record1.is_covered_or_selected() || record1.flag == CubeFlag::CoveredB {
                continue;
            }
            for j2 in 0..2usize {
                let cube2 = grid.adjacent_vertex(from_cube, d2, j2);
                let Some(slot2) = isovert.gcube_index(cube2) else {
                    continue;
                };
                let record2 = isovert.record(slot2);
                if !record2.is_covered_or_selected() || record2.flag == CubeFlag::CoveredB {
                    continue;
                }

                if gcube_map[slot1] == to_slot {
                    return Some(gcube_map[slot2]);
                } else if gcube_map[slot2] == to_slot {
                    return Some(gcube_map[slot1]);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform_grid::UniformGrid;

    fn flat_field() -> ScalarGrid<i32, f64> {
        let grid = UniformGrid::<i32, f64>::new_unit([7, 7, 7]).unwrap();
        ScalarGrid::from_fn(grid, |p| p.z - 2.5)
    }

    fn active_set(scalar: &ScalarGrid<i32, f64>) -> IsovertSet<i32, f64> {
        let mut isovert = IsovertSet::create_active_cubes(scalar, 0.0);
        isovert.store_boundary_bits(&scalar.grid);
        // Place every isovert at the cube center
        for slot in 0..isovert.len() {
            let cube = isovert.cube_index(slot);
            let center = scalar.grid.cube_center_scaled_coord(cube);
            let record = isovert.record_mut(slot);
            record.isovert_coord = center;
            record.cube_containing_isovert = cube;
        }
        isovert
    }

    #[test]
    fn test_map_guard_restores_on_drop() {
        let mut map = vec![0, 1, 2, 3];
        {
            let mut guard = MapGuard::new(&mut map);
            guard.set(1, 9);
            guard.set(2, 9);
            assert_eq!(guard.map(), &[0, 9, 9, 3]);
        }
        assert_eq!(map, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_connected_through_bipolar_facet() {
        let scalar = flat_field();
        let isovert = active_set(&scalar);
        let mut gcube_map: Vec<usize> = (0..isovert.len()).collect();

        let a = scalar.grid.flatten_coord([2, 2, 2]);
        let b = scalar.grid.flatten_coord([3, 2, 2]);
        // Not connected before b maps anywhere near a
        assert!(is_unselected_cube_connected_to(
            &scalar, 0.0, &isovert, a, b, &gcube_map
        ));

        // Facet between a and a distant cube is not shared
        let far = scalar.grid.flatten_coord([5, 2, 2]);
        assert!(!is_unselected_cube_connected_to(
            &scalar, 0.0, &isovert, a, far, &gcube_map
        ));

        // After the in-between cube maps to far, a is connected to far
        let between = scalar.grid.flatten_coord([3, 2, 2]);
        let between_slot = isovert.gcube_index(between).unwrap();
        let far_slot = isovert.gcube_index(far).unwrap();
        gcube_map[between_slot] = far_slot;
        assert!(is_unselected_cube_connected_to(
            &scalar, 0.0, &isovert, a, far, &gcube_map
        ));
    }

    #[test]
    fn test_order_reversal_is_rejected() {
        let scalar = flat_field();
        let mut isovert = active_set(&scalar);
        let mut gcube_map: Vec<usize> = (0..isovert.len()).collect();

        let from = scalar.grid.flatten_coord([3, 3, 2]);
        let to = scalar.grid.flatten_coord([1, 3, 2]);
        let from_slot = isovert.gcube_index(from).unwrap();
        let to_slot = isovert.gcube_index(to).unwrap();
        isovert.record_mut(to_slot).flag = CubeFlag::Selected;

        // The unmapped cube at [2, 3, 2] sits between from and to, so the
        // merge would reverse the order along x
        assert!(does_merge_reverse_isovert_order(
            &scalar, &isovert, from_slot, to_slot, &gcube_map
        ));
        assert!(does_merge_strictly_reverse_order(
            &scalar, &isovert, from_slot, to_slot, &gcube_map
        ));

        // Mapping to the facet-adjacent selected cube preserves the order
        let near = scalar.grid.flatten_coord([2, 3, 2]);
        let near_slot = isovert.gcube_index(near).unwrap();
        isovert.record_mut(near_slot).flag = CubeFlag::Selected;
        assert!(!does_merge_strictly_reverse_order(
            &scalar, &isovert, from_slot, near_slot, &gcube_map
        ));

        // Feasibility rollback: the map is untouched by the failed checks
        let identity: Vec<usize> = (0..isovert.len()).collect();
        assert_eq!(gcube_map, identity);
        let mut map_copy = gcube_map.clone();
        let merge_param = MergeParameters::default();
        let check = MapCheckParams {
            extended: false,
            strict: true,
            ambiguous: false,
            table: None,
            merge_param: &merge_param,
        };
        let _ = check_map(&scalar, 0.0, from, to, &isovert, &mut map_copy, &check);
        assert_eq!(map_copy, gcube_map);
    }

    #[test]
    fn test_ambig_pair_with_two_multi_isov_cubes_is_rejected() {
        let scalar = flat_field();
        let mut isovert = active_set(&scalar);
        let mut gcube_map: Vec<usize> = (0..isovert.len()).collect();
        let table = IsodualCubeTable::new();

        let to = scalar.grid.flatten_coord([2, 3, 2]);
        let from0 = scalar.grid.flatten_coord([3, 3, 2]);
        let from1 = scalar.grid.flatten_coord([4, 3, 2]);
        let to_slot = isovert.gcube_index(to).unwrap();
        isovert.record_mut(to_slot).flag = CubeFlag::Selected;

        // Both cubes carry a two-isovertex configuration
        let multi_index = 0b0000_1001;
        assert_eq!(table.num_iso_vertices(multi_index), 2);
        for cube in [from0, from1] {
            let slot = isovert.gcube_index(cube).unwrap();
            isovert.record_mut(slot).table_index = multi_index;
        }

        let merge_param = MergeParameters::default();
        let check = MapCheckParams {
            extended: false,
            strict: true,
            ambiguous: true,
            table: Some(&table),
            merge_param: &merge_param,
        };
        assert!(!check_map_ambig_pair(
            &scalar,
            &table,
            0.0,
            [from0, from1],
            to,
            &isovert,
            &mut gcube_map,
            &check,
        ));

        // An ambiguous cube is also rejected from individual mapping when
        // ambiguous mapping is disabled
        let check_no_ambig = MapCheckParams {
            ambiguous: false,
            ..check
        };
        assert!(!check_map(
            &scalar,
            0.0,
            from0,
            to,
            &isovert,
            &mut gcube_map,
            &check_no_ambig,
        ));

        // The map is untouched by the rejected proposals
        let identity: Vec<usize> = (0..isovert.len()).collect();
        assert_eq!(gcube_map, identity);
    }

    #[test]
    fn test_edge_manifold_rejects_third_target() {
        let scalar = flat_field();
        let mut isovert = active_set(&scalar);
        let mut gcube_map: Vec<usize> = (0..isovert.len()).collect();

        // Three selected cubes around the edge of cube `from`
        let from = scalar.grid.flatten_coord([3, 3, 2]);
        let s1 = scalar.grid.flatten_coord([2, 3, 2]);
        let s2 = scalar.grid.flatten_coord([3, 2, 2]);
        let s3 = scalar.grid.flatten_coord([2, 2, 2]);
        for s in [s1, s2, s3] {
            let slot = isovert.gcube_index(s).unwrap();
            isovert.record_mut(slot).flag = CubeFlag::Selected;
        }

        // The four cubes around the shared edge map to three distinct
        // selected cubes once `from` maps to s1
        assert!(!check_edge_manifold(
            &scalar,
            0.0,
            from,
            s1,
            &isovert,
            &mut gcube_map,
            false
        ));

        // With only two distinct targets the edge stays manifold
        let s3_slot = isovert.gcube_index(s3).unwrap();
        let s1_slot = isovert.gcube_index(s1).unwrap();
        isovert.record_mut(s3_slot).flag = CubeFlag::CoveredA;
        gcube_map[s3_slot] = s1_slot;
        assert!(check_edge_manifold(
            &scalar,
            0.0,
            from,
            s1,
            &isovert,
            &mut gcube_map,
            false
        ));
    }
}
