//! The core merge engine: mapping active cubes onto selected sharp cubes
//!
//! `gcube_map` maps record slots to record slots, initially the identity.
//! Corner cubes claim a small contracted region first, then edge cubes run
//! the 3x3x3 map with ambiguous pairs and triples, then the optional extended
//! passes reach cubes at distance two, and a loose re-pass absorbs stragglers.
//! The proposal order is part of the contract: it decides which cube wins when
//! several selected cubes could accept a mapping.

pub(crate) mod feasibility;

use crate::bin_grid::BinGrid;
use crate::disk_patch::unmap_non_disk_isopatches;
use crate::dual_table::IsodualCubeTable;
use crate::isovert::{
    get_corner_or_edge_cubes, get_selected_corner_cubes, get_selected_cubes, CubeFlag, IsovertSet,
};
use crate::numeric_types::{Index, Real};
use crate::topology::{
    shared_edge_of_edge_neighbor, EDGE_NEIGHBOR_OFFSETS, FACET_NEIGHBOR_OFFSETS,
    VERTEX_NEIGHBOR_OFFSETS,
};
use crate::uniform_grid::ScalarGrid;
use crate::{MergeParameters, ReconstructionError};
use feasibility::{
    check_adjacent_cubes_manifold, check_facet_adjacent_maps, check_map, check_map_ambig_pair,
    check_map_pair, check_map_triple, find_connected_sharp, is_corner_cube_merge_permitted,
    is_cube_merge_permitted, is_cube_merge_permitted_pair, MapCheckParams,
};

/// Statistics returned by the merge
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MergeInfo {
    pub num_merged_iso_vertices: usize,
    pub num_non_disk_isopatches: usize,
}

/// Result of the merge: the slot-to-slot map and merge statistics
#[derive(Clone, Debug)]
pub struct MergeOutcome {
    pub gcube_map: Vec<usize>,
    pub info: MergeInfo,
}

/// An axis-aligned box of cube coordinates
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region {
    pub min: [i64; 3],
    pub max: [i64; 3],
}

impl Region {
    fn contains(&self, coord: [i64; 3]) -> bool {
        (0..3).all(|d| coord[d] >= self.min[d] && coord[d] <= self.max[d])
    }
}

/// Commits `gcube_map[from] = to` unless the cube's isosurface patch touches
/// a bipolar boundary facet of the grid
fn map_iso_vertex<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    from_slot: usize,
    to_slot: usize,
    gcube_map: &mut [usize],
) {
    let record = isovert.record(from_slot);
    if record.flag == CubeFlag::Selected || gcube_map[from_slot] != from_slot {
        return;
    }

    let boundary_bits = record.boundary_bits;
    if boundary_bits.is_empty() {
        gcube_map[from_slot] = to_slot;
    } else if !scalar.has_bipolar_boundary_facet(record.cube_index, boundary_bits, isovalue) {
        gcube_map[from_slot] = to_slot;
    }
}

/// Checks and maps a single cube onto a selected target
#[allow(clippy::too_many_arguments)]
fn check_and_map_isov<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    from_cube: I,
    to_cube: I,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
    region: Option<&Region>,
) -> bool {
    let Some(from_slot) = isovert.gcube_index(from_cube) else {
        return false;
    };
    if gcube_map[from_slot] != from_slot {
        return false;
    }
    if let Some(region) = region {
        if !region.contains(isovert.record(from_slot).cube_coord) {
            return false;
        }
    }

    if check_map(scalar, isovalue, from_cube, to_cube, isovert, gcube_map, check) {
        let to_slot = isovert
            .gcube_index(to_cube)
            .expect("target cube is active");
        map_iso_vertex(scalar, isovalue, isovert, from_slot, to_slot, gcube_map);
        return gcube_map[from_slot] == to_slot;
    }
    false
}

/// Returns true if edge neighbor `k` of the cube is connected to it by the
/// shared bipolar edge or through a cube already mapped to it
fn is_cube_edge_neighbor_connected_by_iso_edge<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    cube0: I,
    k: usize,
    gcube_map: &[usize],
) -> bool {
    let grid = &scalar.grid;
    let offset = EDGE_NEIGHBOR_OFFSETS[k];
    let Some(cube1) = grid.cube_neighbor(cube0, offset) else {
        return false;
    };
    if !isovert.is_active(cube1) {
        return false;
    }

    let (edge_dir, endpoint) = shared_edge_of_edge_neighbor(k);
    let coord0 = grid.compute_coord(cube0);
    let iv0 = grid.flatten_coord([
        coord0[0] + endpoint[0],
        coord0[1] + endpoint[1],
        coord0[2] + endpoint[2],
    ]);
    let iv1 = grid.next_vertex(iv0, edge_dir);
    if scalar.is_bipolar(iv0, iv1, isovalue) {
        return true;
    }

    feasibility::is_unselected_cube_connected_to(scalar, isovalue, isovert, cube1, cube0, gcube_map)
}

/// One pass of single-cube maps (facet, edge, vertex order) over a list of
/// selected cubes
fn map_singles_pass<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_list: &[usize],
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
    region_of: impl Fn(usize) -> Option<Region>,
) {
    // Facet-adjacent neighbors of every selected cube first, then edge, then
    // vertex: separate sweeps so closer adjacencies win.
    for sweep in 0..3 {
        for &to_slot in selected_list {
            if isovert.record(to_slot).flag != CubeFlag::Selected {
                continue;
            }
            let to_cube = isovert.cube_index(to_slot);
            let region = region_of(to_slot);
            let mut candidates: Vec<I> = Vec::new();
            {
                let boundary_bits = isovert.record(to_slot).boundary_bits;
                let grid = &scalar.grid;
                match sweep {
                    0 => {
                        for (facet, offset) in FACET_NEIGHBOR_OFFSETS.iter().enumerate() {
                            let mask =
                                crate::uniform_grid::BoundaryBits::facet(facet / 2, facet % 2);
                            if boundary_bits.contains(mask) {
                                continue;
                            }
                            if let Some(neighbor) = grid.cube_neighbor(to_cube, *offset) {
                                candidates.push(neighbor);
                            }
                        }
                    }
                    1 => {
                        if boundary_bits.is_empty() {
                            for k in 0..EDGE_NEIGHBOR_OFFSETS.len() {
                                if is_cube_edge_neighbor_connected_by_iso_edge(
                                    scalar, isovalue, isovert, to_cube, k, gcube_map,
                                ) {
                                    candidates.push(
                                        grid.cube_neighbor_unchecked(
                                            to_cube,
                                            EDGE_NEIGHBOR_OFFSETS[k],
                                        ),
                                    );
                                }
                            }
                        }
                    }
                    _ => {
                        if boundary_bits.is_empty() {
                            for offset in VERTEX_NEIGHBOR_OFFSETS.iter() {
                                candidates.push(grid.cube_neighbor_unchecked(to_cube, *offset));
                            }
                        }
                    }
                }
            }
            for from_cube in candidates {
                check_and_map_isov(
                    scalar,
                    isovalue,
                    from_cube,
                    to_cube,
                    isovert,
                    gcube_map,
                    check,
                    region.as_ref(),
                );
            }
        }
    }
}

/// Maps pairs of cubes sharing an ambiguous facet onto selected cubes
fn map_ambiguous_pairs_pass<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: &IsodualCubeTable,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_list: &[usize],
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) {
    let grid = &scalar.grid;
    for &to_slot in selected_list {
        if isovert.record(to_slot).flag != CubeFlag::Selected {
            continue;
        }
        if !isovert.record(to_slot).boundary_bits.is_empty() {
            continue;
        }
        let to_cube = isovert.cube_index(to_slot);

        for offset in FACET_NEIGHBOR_OFFSETS.iter() {
            let from0 = grid.cube_neighbor_unchecked(to_cube, *offset);
            let Some(from0_slot) = isovert.gcube_index(from0) else {
                continue;
            };
            if gcube_map[from0_slot] != from0_slot
                || isovert.record(from0_slot).flag == CubeFlag::Selected
                || !isovert.record(from0_slot).boundary_bits.is_empty()
            {
                continue;
            }
            let table_index = isovert.record(from0_slot).table_index;

            // Partner across an ambiguous facet of from0
            for (facet, partner_offset) in FACET_NEIGHBOR_OFFSETS.iter().enumerate() {
                if !table.is_facet_ambiguous(table_index, facet) {
                    continue;
                }
                let Some(from1) = grid.cube_neighbor(from0, *partner_offset) else {
                    continue;
                };
                let Some(from1_slot) = isovert.gcube_index(from1) else {
                    continue;
                };
                if from1 == to_cube
                    || gcube_map[from1_slot] != from1_slot
                    || isovert.record(from1_slot).flag == CubeFlag::Selected
                {
                    continue;
                }

                if check_map_ambig_pair(
                    scalar,
                    table,
                    isovalue,
                    [from0, from1],
                    to_cube,
                    isovert,
                    gcube_map,
                    check,
                ) {
                    map_iso_vertex(scalar, isovalue, isovert, from0_slot, to_slot, gcube_map);
                    map_iso_vertex(scalar, isovalue, isovert, from1_slot, to_slot, gcube_map);
                }
            }
        }
    }
}

/// Maps triples of cubes around a grid edge onto selected cubes
fn map_triples_pass<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_list: &[usize],
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) {
    let grid = &scalar.grid;
    for &to_slot in selected_list {
        if isovert.record(to_slot).flag != CubeFlag::Selected {
            continue;
        }
        if !isovert.record(to_slot).boundary_bits.is_empty() {
            continue;
        }
        let to_cube = isovert.cube_index(to_slot);
        let to_coord = grid.compute_coord(to_cube);

        // Grid edges of the target cube: the cubes around each shared edge
        // form a quad containing the target itself.
        for edge_dir in 0..3 {
            let d1 = (edge_dir + 1) % 3;
            let d2 = (edge_dir + 2) % 3;
            for k2 in 0..4usize {
                let mut end_coord = to_coord;
                end_coord[d1] += (k2 & 1) as i64;
                end_coord[d2] += (k2 >> 1) as i64;
                let iend0 = grid.flatten_coord(end_coord);
                let iend1 = grid.next_vertex(iend0, edge_dir);
                if !scalar.is_bipolar(iend0, iend1, isovalue) {
                    continue;
                }

                let mut others = [I::default(); 3];
                let mut num_others = 0usize;
                let mut all_valid = true;
                for a in 0..2i64 {
                    for b in 0..2i64 {
                        let mut cube_coord = end_coord;
                        cube_coord[d1] -= a;
                        cube_coord[d2] -= b;
                        if !grid.is_cube_coord_valid(cube_coord) {
                            all_valid = false;
                            continue;
                        }
                        let cube = grid.flatten_coord(cube_coord);
                        if cube == to_cube {
                            continue;
                        }
                        if num_others < 3 {
                            others[num_others] = cube;
                        }
                        num_others += 1;
                    }
                }
                if !all_valid || num_others != 3 {
                    continue;
                }

                // All three must be active, unselected and unmapped
                let mut slots = [0usize; 3];
                let mut eligible = true;
                for (i, &cube) in others.iter().enumerate() {
                    match isovert.gcube_index(cube) {
                        Some(slot)
                            if gcube_map[slot] == slot
                                && isovert.record(slot).flag != CubeFlag::Selected =>
                        {
                            slots[i] = slot;
                        }
                        _ => {
                            eligible = false;
                            break;
                        }
                    }
                }
                if !eligible {
                    continue;
                }

                if check_map_triple(
                    scalar, isovalue, others, to_cube, isovert, gcube_map, check,
                ) {
                    for slot in slots {
                        map_iso_vertex(scalar, isovalue, isovert, slot, to_slot, gcube_map);
                    }
                }
            }
        }
    }
}

/// Maps pairs (from0, from1) where from0 is facet adjacent to a selected cube
/// and from1 is facet adjacent to from0
fn map_facet_adjacent_pairs_pass<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_list: &[usize],
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) {
    let grid = &scalar.grid;
    for &to_slot in selected_list {
        if isovert.record(to_slot).flag != CubeFlag::Selected {
            continue;
        }
        if !isovert.record(to_slot).boundary_bits.is_empty() {
            continue;
        }
        let to_cube = isovert.cube_index(to_slot);

        for offset in FACET_NEIGHBOR_OFFSETS.iter() {
            let from0 = grid.cube_neighbor_unchecked(to_cube, *offset);
            let Some(from0_slot) = isovert.gcube_index(from0) else {
                continue;
            };
            if gcube_map[from0_slot] != from0_slot
                || isovert.record(from0_slot).flag == CubeFlag::Selected
                || !isovert.record(from0_slot).boundary_bits.is_empty()
            {
                continue;
            }

            for partner_offset in FACET_NEIGHBOR_OFFSETS.iter() {
                let Some(from1) = grid.cube_neighbor(from0, *partner_offset) else {
                    continue;
                };
                let Some(from1_slot) = isovert.gcube_index(from1) else {
                    continue;
                };
                if from1 == to_cube
                    || gcube_map[from1_slot] != from1_slot
                    || isovert.record(from1_slot).flag == CubeFlag::Selected
                {
                    continue;
                }

                if check_map_pair(
                    scalar,
                    isovalue,
                    [from0, from1],
                    to_cube,
                    isovert,
                    gcube_map,
                    check,
                ) {
                    map_iso_vertex(scalar, isovalue, isovert, from0_slot, to_slot, gcube_map);
                    map_iso_vertex(scalar, isovalue, isovert, from1_slot, to_slot, gcube_map);
                }
            }
        }
    }
}

/// Maps facet-adjacent cube pairs onto two different selected targets
fn map_adjacent_cubes_to_different_pass<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_list: &[usize],
    gcube_map: &mut Vec<usize>,
    check: &MapCheckParams<'_, R>,
) {
    let grid = &scalar.grid;
    for &to_slot in selected_list {
        if isovert.record(to_slot).flag != CubeFlag::Selected {
            continue;
        }
        if !isovert.record(to_slot).boundary_bits.is_empty() {
            continue;
        }
        let to_cube = isovert.cube_index(to_slot);

        for offset in FACET_NEIGHBOR_OFFSETS.iter() {
            let from0 = grid.cube_neighbor_unchecked(to_cube, *offset);
            let Some(from0_slot) = isovert.gcube_index(from0) else {
                continue;
            };
            if gcube_map[from0_slot] != from0_slot
                || isovert.record(from0_slot).flag == CubeFlag::Selected
                || !isovert.record(from0_slot).boundary_bits.is_empty()
            {
                continue;
            }

            for partner_offset in FACET_NEIGHBOR_OFFSETS.iter() {
                let Some(from1) = grid.cube_neighbor(from0, *partner_offset) else {
                    continue;
                };
                let Some(from1_slot) = isovert.gcube_index(from1) else {
                    continue;
                };
                if from1 == to_cube
                    || gcube_map[from1_slot] != from1_slot
                    || isovert.record(from1_slot).flag == CubeFlag::Selected
                {
                    continue;
                }

                // Other target connected to from1
                let connected = find_connected_sharp(scalar, isovalue, from1, isovert, gcube_map);
                let Some(&other_to_cube) = connected.iter().find(|&&c| c != to_cube) else {
                    continue;
                };
                let other_to_slot = isovert
                    .gcube_index(other_to_cube)
                    .expect("connected cubes are active");

                // Each mapping must pass with the partner committed; the
                // entries are restored before returning either way
                let saved = gcube_map[from1_slot];
                gcube_map[from1_slot] = other_to_slot;
                let ok0 = check_map(scalar, isovalue, from0, to_cube, isovert, gcube_map, check);
                gcube_map[from1_slot] = saved;
                if !ok0 {
                    continue;
                }

                let saved = gcube_map[from0_slot];
                gcube_map[from0_slot] = to_slot;
                let ok1 = check_map(
                    scalar,
                    isovalue,
                    from1,
                    other_to_cube,
                    isovert,
                    gcube_map,
                    check,
                );
                gcube_map[from0_slot] = saved;
                if !ok1 {
                    continue;
                }

                map_iso_vertex(scalar, isovalue, isovert, from0_slot, to_slot, gcube_map);
                map_iso_vertex(
                    scalar,
                    isovalue,
                    isovert,
                    from1_slot,
                    other_to_slot,
                    gcube_map,
                );
            }
        }
    }
}

/// Builds the bounded mapping region around a selected corner cube: one cube
/// in every direction, contracted where another selected cube at L∞ distance
/// three is separated from the corner by a third selected cube
fn construct_small_corner_cube_region<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    bin_grid: &BinGrid<I>,
    isovert: &IsovertSet<I, R>,
    corner_cube: I,
) -> Region {
    let grid = &scalar.grid;
    let corner_coord = grid.compute_coord(corner_cube);

    let mut region = Region {
        min: corner_coord,
        max: corner_coord,
    };
    for d in 0..3 {
        if corner_coord[d] > 0 {
            region.min[d] = corner_coord[d] - 1;
        }
        if corner_coord[d] + 1 < grid.num_cubes_axis(d) {
            region.max[d] = corner_coord[d] + 1;
        }
    }

    let mut selected_list = Vec::new();
    bin_grid.get_selected(grid, corner_cube, &mut selected_list);

    for &selected_cube in selected_list.iter() {
        if selected_cube == corner_cube {
            continue;
        }
        let selected_coord = grid.compute_coord(selected_cube);
        if grid.linf_distance_between_cubes(corner_cube, selected_cube) != 3 {
            continue;
        }

        // Separating cube strictly between the corner and the far selection
        let separating = selected_list.iter().copied().find(|&candidate| {
            if candidate == corner_cube || candidate == selected_cube {
                return false;
            }
            let coord = grid.compute_coord(candidate);
            (0..3).all(|d| {
                let min = corner_coord[d].min(selected_coord[d]);
                let max = corner_coord[d].max(selected_coord[d]);
                coord[d] >= min && coord[d] <= max
            })
        });

        if let Some(separating_cube) = separating {
            let separating_coord = grid.compute_coord(separating_cube);
            for d in 0..3 {
                if separating_coord[d] < corner_coord[d] {
                    region.min[d] = corner_coord[d];
                } else if separating_coord[d] > corner_coord[d] {
                    region.max[d] = corner_coord[d];
                }
            }
        }
    }

    region
}

/// Maps cubes onto selected corner cubes inside their contracted regions
#[allow(clippy::too_many_arguments)]
fn map_adjacent_corner_cubes<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: Option<&IsodualCubeTable>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_corner_list: &[usize],
    bin_grid: &BinGrid<I>,
    merge_param: &MergeParameters<R>,
    gcube_map: &mut Vec<usize>,
) {
    let check = MapCheckParams {
        extended: false,
        strict: true,
        ambiguous: false,
        table,
        merge_param,
    };

    let regions: Vec<Region> = selected_corner_list
        .iter()
        .map(|&slot| {
            construct_small_corner_cube_region(scalar, bin_grid, isovert, isovert.cube_index(slot))
        })
        .collect();

    map_singles_pass(
        scalar,
        isovalue,
        isovert,
        selected_corner_list,
        gcube_map,
        &check,
        |to_slot| {
            let pos = selected_corner_list
                .iter()
                .position(|&slot| slot == to_slot)
                .expect("slot from the corner list");
            Some(regions[pos])
        },
    );

    // Pairs facet adjacent to the corner cubes
    map_facet_adjacent_pairs_pass(
        scalar,
        isovalue,
        isovert,
        selected_corner_list,
        gcube_map,
        &check,
    );
}

/// The 3x3x3 mapping phase around selected cubes
fn map_adjacent_cubes_3x3x3<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: Option<&IsodualCubeTable>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    selected_list: &[usize],
    merge_param: &MergeParameters<R>,
    gcube_map: &mut Vec<usize>,
) {
    let check = MapCheckParams {
        extended: false,
        strict: true,
        ambiguous: false,
        table,
        merge_param,
    };

    map_singles_pass(
        scalar,
        isovalue,
        isovert,
        selected_list,
        gcube_map,
        &check,
        |_| None,
    );

    if let Some(table) = table {
        map_ambiguous_pairs_pass(
            scalar,
            table,
            isovalue,
            isovert,
            selected_list,
            gcube_map,
            &check,
        );
    }

    map_triples_pass(scalar, isovalue, isovert, selected_list, gcube_map, &check);

    map_facet_adjacent_pairs_pass(scalar, isovalue, isovert, selected_list, gcube_map, &check);

    // Absorb cubes enabled by the pair and triple maps
    map_singles_pass(
        scalar,
        isovalue,
        isovert,
        selected_list,
        gcube_map,
        &check,
        |_| None,
    );

    map_adjacent_cubes_to_different_pass(
        scalar,
        isovalue,
        isovert,
        selected_list,
        gcube_map,
        &check,
    );

    if let Some(table) = table {
        map_ambiguous_pairs_pass(
            scalar,
            table,
            isovalue,
            isovert,
            selected_list,
            gcube_map,
            &check,
        );
    }
    map_facet_adjacent_pairs_pass(scalar, isovalue, isovert, selected_list, gcube_map, &check);

    map_singles_pass(
        scalar,
        isovalue,
        isovert,
        selected_list,
        gcube_map,
        &check,
        |_| None,
    );
}

/// The extended gate: a cube at distance two may map when it is wedged
/// between two differently-mapped covered cubes, the asymmetric merge
/// permission holds, and the extended feasibility stack passes
#[allow(clippy::too_many_arguments)]
fn check_extended_and_map<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    from_cube: I,
    to_cube: I,
    merge_param: &MergeParameters<R>,
    table: Option<&IsodualCubeTable>,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let (Some(from_slot), Some(to_slot)) =
        (isovert.gcube_index(from_cube), isovert.gcube_index(to_cube))
    else {
        return;
    };
    if isovert.record(from_slot).is_covered_or_selected() {
        return;
    }
    if gcube_map[from_slot] != from_slot {
        return;
    }

    let Some(gcube_c) = check_facet_adjacent_maps(scalar, isovert, gcube_map, from_cube, to_slot)
    else {
        return;
    };

    if !is_cube_merge_permitted(
        scalar,
        isovert,
        from_slot,
        to_slot,
        Some(gcube_c),
        gcube_map,
        merge_param,
    ) {
        return;
    }

    let check = MapCheckParams {
        extended: true,
        strict: true,
        ambiguous: false,
        table,
        merge_param,
    };
    if !check_map(
        scalar, isovalue, from_cube, to_cube, isovert, gcube_map, &check,
    ) {
        return;
    }

    let connected = find_connected_sharp(scalar, isovalue, from_cube, isovert, gcube_map);
    if !check_adjacent_cubes_manifold(scalar, isovalue, from_cube, isovert, gcube_map, &connected) {
        return;
    }

    map_iso_vertex(scalar, isovalue, isovert, from_slot, to_slot, gcube_map);
    if gcube_map[from_slot] == to_slot {
        isovert.record_mut(from_slot).flag = CubeFlag::CoveredB;
    }
}

/// Extends the mapping of a selected cube to the distance-two shell
fn extend_mapping_to_cube<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    to_slot: usize,
    merge_param: &MergeParameters<R>,
    table: Option<&IsodualCubeTable>,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let grid = &scalar.grid;
    let to_cube = isovert.cube_index(to_slot);

    if grid.cube_distance_to_grid_boundary(to_cube) < 2 {
        return;
    }

    for d0 in 0..3 {
        for j0 in [-1i64, 1] {
            let mut slab_center_offset = [0i64; 3];
            slab_center_offset[d0] = 2 * j0;

            // The 3x3 plane slab of cubes at distance two in direction (d0, j0)
            let d1 = (d0 + 1) % 3;
            let d2 = (d0 + 2) % 3;
            for a in -1i64..=1 {
                for b in -1i64..=1 {
                    let mut offset = slab_center_offset;
                    offset[d1] += a;
                    offset[d2] += b;
                    let Some(from_cube) = grid.cube_neighbor(to_cube, offset) else {
                        continue;
                    };
                    check_extended_and_map(
                        scalar,
                        isovalue,
                        from_cube,
                        to_cube,
                        merge_param,
                        table,
                        isovert,
                        gcube_map,
                    );
                }
            }
        }
    }
}

/// Extends the mapping of pairs at distance two: both cubes of a facet
/// adjacent pair in the slab map together
fn extend_mapping_pairs_to_cube<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    to_slot: usize,
    merge_param: &MergeParameters<R>,
    table: Option<&IsodualCubeTable>,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let grid = &scalar.grid;
    let to_cube = isovert.cube_index(to_slot);

    if grid.cube_distance_to_grid_boundary(to_cube) < 2 {
        return;
    }

    let check = MapCheckParams {
        extended: true,
        strict: true,
        ambiguous: false,
        table,
        merge_param,
    };

    for d0 in 0..3 {
        for j0 in [-1i64, 1] {
            let d1 = (d0 + 1) % 3;
            let d2 = (d0 + 2) % 3;
            for a in -1i64..=1 {
                for b in -1i64..=1 {
                    let mut offset = [0i64; 3];
                    offset[d0] = 2 * j0;
                    offset[d1] += a;
                    offset[d2] += b;
                    let Some(from0) = grid.cube_neighbor(to_cube, offset) else {
                        continue;
                    };
                    let Some(from0_slot) = isovert.gcube_index(from0) else {
                        continue;
                    };
                    if gcube_map[from0_slot] != from0_slot
                        || isovert.record(from0_slot).is_covered_or_selected()
                    {
                        continue;
                    }

                    for partner_offset in FACET_NEIGHBOR_OFFSETS.iter() {
                        let Some(from1) = grid.cube_neighbor(from0, *partner_offset) else {
                            continue;
                        };
                        let Some(from1_slot) = isovert.gcube_index(from1) else {
                            continue;
                        };
                        if from1 == to_cube
                            || gcube_map[from1_slot] != from1_slot
                            || isovert.record(from1_slot).is_covered_or_selected()
                        {
                            continue;
                        }

                        if !is_cube_merge_permitted_pair(
                            scalar,
                            isovert,
                            from0_slot,
                            from1_slot,
                            to_slot,
                            None,
                            gcube_map,
                            merge_param,
                        ) {
                            continue;
                        }

                        if check_map_pair(
                            scalar,
                            isovalue,
                            [from0, from1],
                            to_cube,
                            isovert,
                            gcube_map,
                            &check,
                        ) {
                            map_iso_vertex(
                                scalar, isovalue, isovert, from0_slot, to_slot, gcube_map,
                            );
                            map_iso_vertex(
                                scalar, isovalue, isovert, from1_slot, to_slot, gcube_map,
                            );
                            for slot in [from0_slot, from1_slot] {
                                if gcube_map[slot] == to_slot {
                                    isovert.record_mut(slot).flag = CubeFlag::CoveredB;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Extends the mapping outwards from selected corner cubes to distance two
fn extend_mapping_corner_cubes<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    merge_param: &MergeParameters<R>,
    table: Option<&IsodualCubeTable>,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let corner_list = get_selected_corner_cubes(isovert);
    for &to_slot in corner_list.iter() {
        let to_cube = isovert.cube_index(to_slot);
        let grid = &scalar.grid;
        if grid.cube_distance_to_grid_boundary(to_cube) < 2 {
            continue;
        }

        let to_coord = grid.compute_coord(to_cube);
        // Every cube of the 5x5x5 shell at L∞ distance exactly two
        for dz in -2i64..=2 {
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    if dx.abs().max(dy.abs()).max(dz.abs()) != 2 {
                        continue;
                    }
                    let coord = [to_coord[0] + dx, to_coord[1] + dy, to_coord[2] + dz];
                    if !grid.is_cube_coord_valid(coord) {
                        continue;
                    }
                    let from_cube = grid.flatten_coord(coord);
                    let Some(from_slot) = isovert.gcube_index(from_cube) else {
                        continue;
                    };
                    if gcube_map[from_slot] != from_slot
                        || isovert.record(from_slot).is_covered_or_selected()
                    {
                        continue;
                    }

                    if !is_corner_cube_merge_permitted(
                        scalar,
                        isovert,
                        from_slot,
                        to_slot,
                        gcube_map,
                        merge_param,
                    ) {
                        continue;
                    }

                    let check = MapCheckParams {
                        extended: true,
                        strict: true,
                        ambiguous: false,
                        table,
                        merge_param,
                    };
                    if check_map(
                        scalar, isovalue, from_cube, to_cube, isovert, gcube_map, &check,
                    ) {
                        map_iso_vertex(scalar, isovalue, isovert, from_slot, to_slot, gcube_map);
                        if gcube_map[from_slot] == to_slot {
                            isovert.record_mut(from_slot).flag = CubeFlag::CoveredB;
                        }
                    }
                }
            }
        }
    }
}

/// Extends the mapping over facet neighbors of already-mapped covered cubes
fn extend_map_adjacent_pairs_covered<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    merge_param: &MergeParameters<R>,
    table: Option<&IsodualCubeTable>,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let grid = &scalar.grid;
    let num_slots = isovert.len();
    for covered_slot in 0..num_slots {
        let to_slot = gcube_map[covered_slot];
        if to_slot == covered_slot {
            continue;
        }
        if isovert.record(to_slot).flag != CubeFlag::Selected {
            continue;
        }
        let covered_cube = isovert.cube_index(covered_slot);
        if !isovert.record(covered_slot).boundary_bits.is_empty() {
            continue;
        }
        let to_cube = isovert.cube_index(to_slot);

        for offset in FACET_NEIGHBOR_OFFSETS.iter() {
            let from_cube = grid.cube_neighbor_unchecked(covered_cube, *offset);
            check_extended_and_map(
                scalar, isovalue, from_cube, to_cube, merge_param, table, isovert, gcube_map,
            );
        }
    }
}

/// Extends the mapping over triples of unmapped cubes around bipolar edges
/// near selected cubes
fn extend_map_around_edges<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    strict: bool,
    merge_param: &MergeParameters<R>,
    table: Option<&IsodualCubeTable>,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let selected_list = get_selected_cubes(isovert);
    let check = MapCheckParams {
        extended: true,
        strict,
        ambiguous: false,
        table,
        merge_param,
    };
    map_triples_pass(scalar, isovalue, isovert, &selected_list, gcube_map, &check);
}

/// Collapses triangles whose apex angle is too wide by remapping one apex
fn collapse_triangles_with_small_angles<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: Option<&IsodualCubeTable>,
    isovalue: R,
    merge_param: &MergeParameters<R>,
    isovert: &IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
) {
    let grid = &scalar.grid;
    let cos_min_angle = merge_param.cos_collapse_angle;

    grid.for_each_interior_edge(|iend0, edge_dir| {
        let iend1 = grid.next_vertex(iend0, edge_dir);
        if !scalar.is_bipolar(iend0, iend1, isovalue) {
            return;
        }

        let d1 = (edge_dir + 1) % 3;
        let d2 = (edge_dir + 2) % 3;
        let end_coord = grid.compute_coord(iend0);

        // The four cubes around the edge, in cyclic order
        let mut quad_slots = [0usize; 4];
        for (i, &(a, b)) in [(1i64, 1i64), (0, 1), (0, 0), (1, 0)].iter().enumerate() {
            let mut coord = end_coord;
            coord[d1] -= a;
            coord[d2] -= b;
            if !grid.is_cube_coord_valid(coord) {
                return;
            }
            let Some(slot) = isovert.gcube_index(grid.flatten_coord(coord)) else {
                return;
            };
            quad_slots[i] = gcube_map[slot];
        }

        // Collect the distinct vertices; only degenerate quads (triangles)
        // are candidates for collapse
        let mut tri_slots = [0usize; 3];
        let mut num_distinct = 1;
        tri_slots[0] = quad_slots[0];
        for i in 1..4 {
            if quad_slots[i] != quad_slots[i - 1]
                && (i < 3 || quad_slots[i] != quad_slots[0])
            {
                if num_distinct == 3 {
                    return;
                }
                tri_slots[num_distinct] = quad_slots[i];
                num_distinct += 1;
            }
        }
        if num_distinct != 3 {
            return;
        }

        for i0 in 0..3 {
            let i1 = (i0 + 1) % 3;
            let i2 = (i0 + 2) % 3;

            if let Some(table) = table {
                if table.num_iso_vertices(isovert.record(tri_slots[i0]).table_index) != 1
                    || table.num_iso_vertices(isovert.record(tri_slots[i2]).table_index) != 1
                {
                    continue;
                }
            }

            let apex = isovert.isovert_coord(tri_slots[i1]);
            let v_a = isovert.isovert_coord(tri_slots[i0]) - apex;
            let v_b = isovert.isovert_coord(tri_slots[i2]) - apex;
            let (m_a, m_b) = (v_a.norm(), v_b.norm());
            if m_a <= merge_param.min_distance_between_isovert
                || m_b <= merge_param.min_distance_between_isovert
            {
                continue;
            }
            let cos_angle = (v_a / m_a).dot(&(v_b / m_b));
            if cos_angle < cos_min_angle {
                continue;
            }

            let cube0 = isovert.cube_index(tri_slots[i0]);
            let cube2 = isovert.cube_index(tri_slots[i2]);

            let collapse_ok = |from_slot: usize,
                               from_cube: I,
                               to_cube: I,
                               gcube_map: &mut Vec<usize>| {
                if isovert.record(from_slot).flag == CubeFlag::Selected {
                    return false;
                }
                if gcube_map[from_slot] != from_slot {
                    return false;
                }
                let Some(to_slot) = isovert.gcube_index(to_cube) else {
                    return false;
                };
                feasibility::check_distortion(
                    scalar,
                    isovert,
                    gcube_map,
                    from_slot,
                    to_slot,
                    true,
                    merge_param,
                ) && feasibility::check_edge_manifold(
                    scalar, isovalue, from_cube, to_cube, isovert, gcube_map, true,
                )
            };

            if collapse_ok(tri_slots[i2], cube2, cube0, gcube_map) {
                gcube_map[tri_slots[i2]] = tri_slots[i0];
            } else if collapse_ok(tri_slots[i0], cube0, cube2, gcube_map) {
                gcube_map[tri_slots[i0]] = tri_slots[i2];
            }
        }
    });
}

/// Writes `maps_to_cube` of every record from the final map
fn store_map<I: Index, R: Real>(
    gcube_map: &[usize],
    isovert: &mut IsovertSet<I, R>,
) -> Result<(), ReconstructionError<I>> {
    for slot in 0..isovert.len() {
        let to_slot = gcube_map[slot];
        if to_slot >= isovert.len() {
            return Err(ReconstructionError::InternalInconsistency {
                cube_index: isovert.cube_index(slot),
            });
        }
        let to_cube = isovert.cube_index(to_slot);
        isovert.record_mut(slot).maps_to_cube = to_cube;
    }
    Ok(())
}

/// Shared phase driver of the single and multi merge paths
fn determine_gcube_map<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: Option<&IsodualCubeTable>,
    isovalue: R,
    isovert: &mut IsovertSet<I, R>,
    merge_param: &MergeParameters<R>,
    info: &mut MergeInfo,
) -> Vec<usize> {
    let mut gcube_map: Vec<usize> = (0..isovert.len()).collect();

    let selected_list = get_selected_cubes(isovert);
    let selected_corner_list = get_selected_corner_cubes(isovert);
    let sharp_list = get_corner_or_edge_cubes(isovert);
    let selected_sharp_list: Vec<usize> = sharp_list
        .iter()
        .copied()
        .filter(|&slot| isovert.record(slot).flag == CubeFlag::Selected)
        .collect();

    log::info!(
        "Merging cubes onto {} selected cubes ({} corners)",
        selected_list.len(),
        selected_corner_list.len()
    );

    let mut bin_grid = BinGrid::new(&scalar.grid, merge_param.bin_width);
    for &slot in selected_list.iter() {
        bin_grid.insert(&scalar.grid, isovert.cube_index(slot));
    }

    // Corner cubes claim their contracted regions first
    map_adjacent_corner_cubes(
        scalar,
        table,
        isovalue,
        isovert,
        &selected_corner_list,
        &bin_grid,
        merge_param,
        &mut gcube_map,
    );

    // The 3x3x3 map around every selected cube, in selection priority order
    map_adjacent_cubes_3x3x3(
        scalar,
        table,
        isovalue,
        isovert,
        &selected_sharp_list,
        merge_param,
        &mut gcube_map,
    );

    if merge_param.flag_map_extended {
        extend_mapping_corner_cubes(
            scalar, isovalue, merge_param, table, isovert, &mut gcube_map,
        );
        extend_map_adjacent_pairs_covered(
            scalar, isovalue, merge_param, table, isovert, &mut gcube_map,
        );
        extend_map_around_edges(
            scalar,
            isovalue,
            true,
            merge_param,
            table,
            isovert,
            &mut gcube_map,
        );
        for &to_slot in selected_sharp_list.iter() {
            extend_mapping_to_cube(
                scalar, isovalue, to_slot, merge_param, table, isovert, &mut gcube_map,
            );
        }
        for &to_slot in selected_sharp_list.iter() {
            extend_mapping_pairs_to_cube(
                scalar, isovalue, to_slot, merge_param, table, isovert, &mut gcube_map,
            );
        }
    }

    // Loose pass: relaxed distortion tolerance absorbs the stragglers
    {
        let check = MapCheckParams {
            extended: merge_param.flag_map_extended,
            strict: false,
            ambiguous: false,
            table,
            merge_param,
        };
        map_singles_pass(
            scalar,
            isovalue,
            isovert,
            &selected_sharp_list,
            &mut gcube_map,
            &check,
            |_| None,
        );
        if let Some(table) = table {
            map_ambiguous_pairs_pass(
                scalar,
                table,
                isovalue,
                isovert,
                &selected_sharp_list,
                &mut gcube_map,
                &check,
            );
        }
        if merge_param.flag_map_extended {
            extend_map_adjacent_pairs_covered(
                scalar, isovalue, merge_param, table, isovert, &mut gcube_map,
            );
            extend_map_around_edges(
                scalar,
                isovalue,
                false,
                merge_param,
                table,
                isovert,
                &mut gcube_map,
            );
        }
    }

    if merge_param.flag_collapse_triangles_with_small_angles {
        collapse_triangles_with_small_angles(
            scalar, table, isovalue, merge_param, isovert, &mut gcube_map,
        );
    }

    if merge_param.flag_check_disk {
        unmap_non_disk_isopatches(scalar, table, isovalue, isovert, &mut gcube_map, info);
    }

    gcube_map
}

/// Merges isosurface vertices in cubes adjacent to selected sharp cubes
pub fn merge_sharp_iso_vertices<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovalue: R,
    isovert: &mut IsovertSet<I, R>,
    merge_param: &MergeParameters<R>,
) -> Result<MergeOutcome, ReconstructionError<I>> {
    let mut info = MergeInfo::default();
    let gcube_map = determine_gcube_map(scalar, None, isovalue, isovert, merge_param, &mut info);

    info.num_merged_iso_vertices = gcube_map
        .iter()
        .enumerate()
        .filter(|&(slot, &to)| slot != to)
        .count();

    store_map(&gcube_map, isovert)?;

    log::info!(
        "Merged {} isosurface vertices, reverted {} non-disk patches",
        info.num_merged_iso_vertices,
        info.num_non_disk_isopatches
    );

    Ok(MergeOutcome { gcube_map, info })
}

/// Merges isosurface vertices allowing multiple vertices per cube.
///
/// Requires the table indices of the records to be stored beforehand.
pub fn merge_sharp_iso_vertices_multi<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: &IsodualCubeTable,
    isovalue: R,
    isovert: &mut IsovertSet<I, R>,
    merge_param: &MergeParameters<R>,
) -> Result<MergeOutcome, ReconstructionError<I>> {
    let mut info = MergeInfo::default();
    let gcube_map = determine_gcube_map(
        scalar,
        Some(table),
        isovalue,
        isovert,
        merge_param,
        &mut info,
    );

    info.num_merged_iso_vertices = gcube_map
        .iter()
        .enumerate()
        .filter(|&(slot, &to)| slot != to)
        .count();

    store_map(&gcube_map, isovert)?;

    log::info!(
        "Merged {} isosurface vertices (multi), reverted {} non-disk patches",
        info.num_merged_iso_vertices,
        info.num_non_disk_isopatches
    );

    Ok(MergeOutcome { gcube_map, info })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::compute_all_isovert_positions;
    use crate::selection::select_sharp_isovert;
    use crate::uniform_grid::{GradientGrid, UniformGrid};
    use crate::SharpIsovertParameters;
    use nalgebra::Vector3;

    fn corner_setup() -> (
        ScalarGrid<i32, f64>,
        GradientGrid<i32, f64>,
        IsovertSet<i32, f64>,
    ) {
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
        let param = SharpIsovertParameters::default();
        let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        compute_all_isovert_positions(&scalar, &gradients, 0.0, &param, &mut isovert);
        select_sharp_isovert(&scalar, &gradients, 0.0, &param, &mut isovert).unwrap();
        (scalar, gradients, isovert)
    }

    #[test]
    fn test_map_targets_are_selected() {
        let (scalar, _gradients, mut isovert) = corner_setup();
        let merge_param = MergeParameters::default();
        let outcome =
            merge_sharp_iso_vertices(&scalar, 0.0, &mut isovert, &merge_param).unwrap();

        for (slot, &to_slot) in outcome.gcube_map.iter().enumerate() {
            assert!(to_slot < isovert.len());
            if to_slot != slot {
                assert_eq!(
                    isovert.record(to_slot).flag,
                    CubeFlag::Selected,
                    "cube {:?} maps to a non-selected cube",
                    isovert.cube_index(slot)
                );
            }
        }
    }

    #[test]
    fn test_corner_neighbors_map_to_corner() {
        let (scalar, _gradients, mut isovert) = corner_setup();
        let merge_param = MergeParameters::default();
        let outcome =
            merge_sharp_iso_vertices(&scalar, 0.0, &mut isovert, &merge_param).unwrap();

        let corner_cube = scalar.grid.flatten_coord([2, 2, 2]);
        let corner_slot = isovert.gcube_index(corner_cube).unwrap();
        assert_eq!(isovert.record(corner_slot).flag, CubeFlag::Selected);

        // Facet neighbors of the corner cube collapse onto it
        let mut num_mapped = 0;
        for offset in FACET_NEIGHBOR_OFFSETS.iter() {
            let neighbor = scalar.grid.cube_neighbor(corner_cube, *offset).unwrap();
            if let Some(slot) = isovert.gcube_index(neighbor) {
                if outcome.gcube_map[slot] == corner_slot {
                    num_mapped += 1;
                    assert_eq!(isovert.record(slot).maps_to_cube, corner_cube);
                }
            }
        }
        assert!(num_mapped > 0, "no facet neighbor merged onto the corner");
    }

    #[test]
    fn test_merge_is_deterministic() {
        let (scalar, _gradients, mut isovert_a) = corner_setup();
        let (_, _, mut isovert_b) = corner_setup();
        let merge_param = MergeParameters::default();
        let outcome_a =
            merge_sharp_iso_vertices(&scalar, 0.0, &mut isovert_a, &merge_param).unwrap();
        let outcome_b =
            merge_sharp_iso_vertices(&scalar, 0.0, &mut isovert_b, &merge_param).unwrap();
        assert_eq!(outcome_a.gcube_map, outcome_b.gcube_map);
        for slot in 0..isovert_a.len() {
            assert_eq!(isovert_a.record(slot).flag, isovert_b.record(slot).flag);
            assert_eq!(
                isovert_a.record(slot).isovert_coord,
                isovert_b.record(slot).isovert_coord
            );
        }
    }
}
