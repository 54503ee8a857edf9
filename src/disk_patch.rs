//! Topological disk test for the isosurface patch around a selected cube and
//! the repair loop reverting selections whose patch is not a disk
//!
//! The patch of a selected cube is the set of dual polygons of the bipolar
//! grid edges on the boundary of its merged cube region. A patch is a disk
//! when no edge lies in more than two polygons and the edges lying in exactly
//! one polygon form a single simple cycle.

use crate::dual_table::IsodualCubeTable;
use crate::isovert::{CubeFlag, IsovertSet};
use crate::merge::MergeInfo;
use crate::numeric_types::{Index, Real};
use crate::uniform_grid::ScalarGrid;
use crate::{new_map, MapType};

/// Vertices of the patch polygons are either the mapped record slot (one
/// isovertex per cube) or slot and component id for multi-isovertex cubes.
/// Components are packed into the key; a cube has at most four components.
const MAX_COMPONENTS: usize = 4;

/// Returns all cubes within `dist2cube` of `cube0` that map to it
pub fn get_merged_cubes<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &IsovertSet<I, R>,
    cube0: I,
    gcube_map: &[usize],
    dist2cube: i64,
) -> Vec<I> {
    let grid = &scalar.grid;
    let gcube0 = isovert
        .gcube_index(cube0)
        .expect("patch center cube is active");
    let coord0 = grid.compute_coord(cube0);

    let mut merged = Vec::new();
    for dz in -dist2cube..=dist2cube {
        for dy in -dist2cube..=dist2cube {
            for dx in -dist2cube..=dist2cube {
                let coord = [coord0[0] + dx, coord0[1] + dy, coord0[2] + dz];
                if !grid.is_cube_coord_valid(coord) {
                    continue;
                }
                let cube = grid.flatten_coord(coord);
                if let Some(slot) = isovert.gcube_index(cube) {
                    if gcube_map[slot] == gcube0 {
                        merged.push(cube);
                    }
                }
            }
        }
    }
    merged
}

/// Returns the grid edges on the boundary of the merged cube set.
///
/// An edge interior to the set is shared by four merged cubes; every other
/// incidence count makes it a boundary edge. Edges are keyed as
/// `(min endpoint, direction)`.
pub fn get_merged_boundary_edges<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    merged_cube_list: &[I],
) -> Vec<(I, usize)> {
    let grid = &scalar.grid;
    let mut edge_count: MapType<(I, usize), usize> = new_map();

    for &cube in merged_cube_list {
        for edge_dir in 0..3 {
            for k2 in 0..4 {
                let iend0 = grid.cube_facet_vertex(cube, edge_dir, k2);
                *edge_count.entry((iend0, edge_dir)).or_insert(0) += 1;
            }
        }
    }

    let mut boundary: Vec<(I, usize)> = edge_count
        .into_iter()
        .filter_map(|(edge, count)| (count != 4).then_some(edge))
        .collect();
    // Deterministic processing order independent of the hash layout
    boundary.sort_unstable_by_key(|&(iend0, dir)| (iend0.to_i64(), dir));
    boundary
}

/// The dual polygon vertex of a cube incident to a bipolar edge
fn patch_vertex<I: Index, R: Real>(
    isovert: &IsovertSet<I, R>,
    table: Option<&IsodualCubeTable>,
    gcube_map: &[usize],
    cube_slot: usize,
    local_edge: usize,
) -> usize {
    let target = gcube_map[cube_slot];
    if target != cube_slot || isovert.record(target).flag == CubeFlag::Selected {
        // Merged cubes contribute the single vertex of their target
        return target * MAX_COMPONENTS;
    }
    match table {
        Some(table) => {
            let component = table
                .incident_isov(isovert.record(cube_slot).table_index, local_edge)
                .expect("bipolar edge has an incident isosurface vertex");
            cube_slot * MAX_COMPONENTS + component
        }
        None => cube_slot * MAX_COMPONENTS,
    }
}

/// Extracts the dual isosurface patch incident on the merged region of a
/// selected cube: triangles and quads keyed by patch vertex ids.
///
/// Degenerate quads (two adjacent vertices merged) become triangles; quads
/// with fewer than three distinct vertices are dropped.
pub fn extract_dual_isopatch_incident_on<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: Option<&IsodualCubeTable>,
    isovalue: R,
    isovert: &IsovertSet<I, R>,
    cube0: I,
    gcube_map: &[usize],
    dist2cube: i64,
) -> (Vec<usize>, Vec<usize>) {
    let grid = &scalar.grid;
    let merged = get_merged_cubes(scalar, isovert, cube0, gcube_map, dist2cube);
    let boundary_edges = get_merged_boundary_edges(scalar, &merged);

    let mut tri_vert = Vec::new();
    let mut quad_vert = Vec::new();

    for (iend0, edge_dir) in boundary_edges {
        if grid.is_edge_on_grid_boundary(iend0, edge_dir) {
            continue;
        }
        let iend1 = grid.next_vertex(iend0, edge_dir);
        if !scalar.is_bipolar(iend0, iend1, isovalue) {
            continue;
        }

        let d1 = (edge_dir + 1) % 3;
        let d2 = (edge_dir + 2) % 3;
        let end_coord = grid.compute_coord(iend0);

        // The four cubes around a bipolar interior edge are all active;
        // visit them in cyclic order around the edge.
        let mut quad = [0usize; 4];
        let mut all_active = true;
        for (i, &(a, b)) in [(0i64, 0i64), (1, 0), (1, 1), (0, 1)].iter().enumerate() {
            let coord = [
                end_coord[0] - if d1 == 0 { a } else { 0 } - if d2 == 0 { b } else { 0 },
                end_coord[1] - if d1 == 1 { a } else { 0 } - if d2 == 1 { b } else { 0 },
                end_coord[2] - if d1 == 2 { a } else { 0 } - if d2 == 2 { b } else { 0 },
            ];
            if !grid.is_cube_coord_valid(coord) {
                all_active = false;
                break;
            }
            let cube = grid.flatten_coord(coord);
            let Some(slot) = isovert.gcube_index(cube) else {
                all_active = false;
                break;
            };
            // Cube edge of this cube matching the grid edge: the edge's min
            // endpoint is offset (a, b) from the cube's min corner
            let k2 = (a + 2 * b) as usize;
            let local_edge = 4 * edge_dir + k2;
            quad[i] = patch_vertex(isovert, table, gcube_map, slot, local_edge);
        }
        if !all_active {
            continue;
        }

        // Collapse repeated vertices along the cyclic order
        let mut distinct = [0usize; 4];
        let mut num_distinct = 0;
        for i in 0..4 {
            let v = quad[i];
            if num_distinct == 0
                || (v != distinct[num_distinct - 1] && !(i == 3 && v == distinct[0]))
            {
                distinct[num_distinct] = v;
                num_distinct += 1;
            }
        }

        match num_distinct {
            4 => quad_vert.extend_from_slice(&distinct),
            3 => tri_vert.extend_from_slice(&distinct[..3]),
            _ => {}
        }
    }

    (tri_vert, quad_vert)
}

#[derive(Clone, Copy, Debug, Default)]
struct CycleVertex {
    adjacent: [usize; 2],
    num_adjacent: usize,
    is_visited: bool,
}

/// Inserts the edges of the polygons into the undirected edge count table
fn insert_poly_edges(poly_vert: &[usize], num_vert_per_poly: usize, edge_hash: &mut MapType<(usize, usize), usize>) {
    let num_poly = poly_vert.len() / num_vert_per_poly;
    for i in 0..num_poly {
        for k0 in 0..num_vert_per_poly {
            let iv0 = poly_vert[i * num_vert_per_poly + k0];
            let iv1 = poly_vert[i * num_vert_per_poly + (k0 + 1) % num_vert_per_poly];
            let key = (iv0.min(iv1), iv0.max(iv1));
            *edge_hash.entry(key).or_insert(0) += 1;
        }
    }
}

/// Walks the boundary cycle starting at `iv0`, marking visited vertices
fn search_cycle(iv0: usize, cycle_vertex: &mut [CycleVertex]) {
    let mut iv = iv0;
    let mut iv_prev = cycle_vertex[iv0].adjacent[0];
    while !cycle_vertex[iv].is_visited {
        cycle_vertex[iv].is_visited = true;
        if cycle_vertex[iv].adjacent[0] == iv_prev {
            iv_prev = iv;
            iv = cycle_vertex[iv].adjacent[1];
        } else {
            iv_prev = iv;
            iv = cycle_vertex[iv].adjacent[0];
        }
    }
}

/// Returns true if the patch of triangles and quads is a topological disk.
///
/// No undirected edge may appear in more than two polygons, and the edges
/// appearing in exactly one polygon must form a single simple cycle of length
/// at least three.
pub fn is_isopatch_disk3d(tri_vert: &[usize], quad_vert: &[usize]) -> bool {
    // Renumber vertices to 0..num_vert-1
    let mut vertex_hash: MapType<usize, usize> = new_map();
    for &v in tri_vert.iter().chain(quad_vert.iter()) {
        let n = vertex_hash.len();
        vertex_hash.entry(v).or_insert(n);
    }
    let num_vert = vertex_hash.len();
    let tri: Vec<usize> = tri_vert.iter().map(|v| vertex_hash[v]).collect();
    let quad: Vec<usize> = quad_vert.iter().map(|v| vertex_hash[v]).collect();

    // Check for edges in more than two isosurface polygons
    let mut edge_hash: MapType<(usize, usize), usize> = new_map();
    insert_poly_edges(&tri, 3, &mut edge_hash);
    insert_poly_edges(&quad, 4, &mut edge_hash);

    if edge_hash.values().any(|&count| count > 2) {
        return false;
    }

    // Check that the boundary is a single cycle
    let mut cycle_vertex = vec![CycleVertex::default(); num_vert];
    for (&(iv0, iv1), &count) in edge_hash.iter() {
        if count == 1 {
            for (a, b) in [(iv0, iv1), (iv1, iv0)] {
                let num_adjacent = cycle_vertex[a].num_adjacent;
                if num_adjacent < 2 {
                    cycle_vertex[a].adjacent[num_adjacent] = b;
                }
                cycle_vertex[a].num_adjacent += 1;
            }
        }
    }

    let mut num_boundary_vertices = 0;
    let mut first_adjacent = 0;
    for (i, v) in cycle_vertex.iter().enumerate() {
        if v.num_adjacent == 2 {
            first_adjacent = i;
            num_boundary_vertices += 1;
        } else if v.num_adjacent != 0 {
            return false;
        }
    }

    if num_boundary_vertices < 3 {
        // A disk has at least three boundary cycle vertices
        return false;
    }

    search_cycle(first_adjacent, &mut cycle_vertex);

    cycle_vertex
        .iter()
        .all(|v| v.num_adjacent != 2 || v.is_visited)
}

/// Reverts the selection of `cube0`: the cube becomes NON_DISK and every cube
/// merged onto it is released back to the identity map
fn unmap_merged_cubes<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    isovert: &mut IsovertSet<I, R>,
    cube0: I,
    dist2cube: i64,
    gcube_map: &mut [usize],
) {
    let gcube0 = isovert
        .gcube_index(cube0)
        .expect("patch center cube is active");
    isovert.record_mut(gcube0).flag = CubeFlag::NonDisk;

    let merged = get_merged_cubes(scalar, isovert, cube0, gcube_map, dist2cube);
    for cube in merged {
        let slot = isovert
            .gcube_index(cube)
            .expect("merged cubes are active");
        if gcube_map[slot] == gcube0 && slot != gcube0 {
            gcube_map[slot] = slot;
            if isovert.record(slot).flag == CubeFlag::CoveredA {
                isovert.record_mut(slot).flag = CubeFlag::Smooth;
            }
        }
    }
    gcube_map[gcube0] = gcube0;
}

/// Repair loop: reverts selected cubes whose incident isopatch is not a disk
/// until every remaining selected cube passes.
///
/// Terminates because every round that changes anything strictly decreases
/// the number of selected cubes.
pub fn unmap_non_disk_isopatches<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    table: Option<&IsodualCubeTable>,
    isovalue: R,
    isovert: &mut IsovertSet<I, R>,
    gcube_map: &mut Vec<usize>,
    info: &mut MergeInfo,
) {
    let dist2cube = 1;

    loop {
        let mut passed_all_disk_checks = true;

        for slot in 0..isovert.len() {
            if isovert.record(slot).flag != CubeFlag::Selected {
                continue;
            }
            let cube = isovert.cube_index(slot);

            let (tri_vert, quad_vert) = extract_dual_isopatch_incident_on(
                scalar, table, isovalue, isovert, cube, gcube_map, dist2cube,
            );

            if !is_isopatch_disk3d(&tri_vert, &quad_vert) {
                log::debug!("Reverting non-disk patch around cube {:?}", cube);
                unmap_merged_cubes(scalar, isovert, cube, dist2cube, gcube_map);
                info.num_non_disk_isopatches += 1;
                passed_all_disk_checks = false;
            }
        }

        if passed_all_disk_checks {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_quad_is_a_disk() {
        let quad = vec![0, 1, 2, 3];
        assert!(is_isopatch_disk3d(&[], &quad));
    }

    #[test]
    fn test_quad_fan_is_a_disk() {
        // Four quads around a central vertex 0
        let quad = vec![
            0, 1, 2, 3, //
            0, 3, 4, 5, //
            0, 5, 6, 7, //
            0, 7, 8, 1,
        ];
        assert!(is_isopatch_disk3d(&[], &quad));
    }

    #[test]
    fn test_figure_eight_is_not_a_disk() {
        // Two triangles sharing only the apex vertex 0: the boundary is two
        // cycles joined at a degree-four vertex
        let tri = vec![0, 1, 2, 0, 3, 4];
        assert!(!is_isopatch_disk3d(&tri, &[]));
    }

    #[test]
    fn test_overfolded_edge_is_not_a_disk() {
        // Edge (0, 1) appears in three triangles
        let tri = vec![0, 1, 2, 0, 1, 3, 0, 1, 4];
        assert!(!is_isopatch_disk3d(&tri, &[]));
    }

    #[test]
    fn test_two_disjoint_quads_are_not_a_disk() {
        let quad = vec![0, 1, 2, 3, 4, 5, 6, 7];
        assert!(!is_isopatch_disk3d(&[], &quad));
    }

    #[test]
    fn test_closed_surface_is_not_a_disk() {
        // Tetrahedron: every edge lies in two triangles, no boundary at all
        let tri = vec![0, 1, 2, 0, 1, 3, 0, 2, 3, 1, 2, 3];
        assert!(!is_isopatch_disk3d(&tri, &[]));
    }
}
