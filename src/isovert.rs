//! Per-cube records for sharp isosurface vertices and the record store
//!
//! An active cube is one whose scalar range straddles the isovalue. The store
//! keeps one record per active cube in a dense list; a sparse index grid maps
//! cube indices back to record slots. Records never move once allocated, so
//! slots are stable identities used for cross-references.

use crate::numeric_types::{Index, Real};
use crate::uniform_grid::{BoundaryBits, ScalarGrid, UniformGrid};
use nalgebra::Vector3;
use std::fmt;

/// Lifecycle tag of an active cube
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum CubeFlag {
    /// Cube is available for selection
    Available,
    /// Cube contains a sharp vertex
    Selected,
    /// Cube is near a cube containing a sharp vertex
    CoveredA,
    /// Cube is covered by extended mapping
    CoveredB,
    /// Cube covers a cube with three large eigenvalues
    CoveredCorner,
    /// The sharp vertex is in a covered cube
    CoveredPoint,
    /// Selecting the cube would create a triangle with a large angle
    Unavailable,
    /// Merging the cube creates a non-disk patch
    NonDisk,
    /// Cube contains a smooth isosurface patch
    Smooth,
}

impl fmt::Display for CubeFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CubeFlag::Available => "Available",
            CubeFlag::Selected => "Selected",
            CubeFlag::CoveredA => "Covered (A)",
            CubeFlag::CoveredB => "Covered (B)",
            CubeFlag::CoveredCorner => "Covered by corner",
            CubeFlag::CoveredPoint => "Isovert covered",
            CubeFlag::Unavailable => "Unavailable",
            CubeFlag::NonDisk => "Non-disk patch",
            CubeFlag::Smooth => "Smooth",
        };
        f.write_str(s)
    }
}

/// Record of one active grid cube
#[derive(Clone, Debug)]
pub struct GridCube<I: Index, R: Real> {
    /// Index of the cube in the scalar grid
    pub cube_index: I,
    /// Integer coordinate of the cube's minimum corner
    pub cube_coord: [i64; 3],
    /// Location of the sharp isovertex
    pub isovert_coord: Vector3<R>,
    /// Substitute location
    pub isovert_coord_alt: Vector3<R>,
    /// Edge direction (2 eigenvalues) or direction orthogonal to the isosurface (1)
    pub direction: Vector3<R>,
    /// Number of large eigenvalues
    pub num_eigenvalues: u8,
    /// Lifecycle tag of the cube
    pub flag: CubeFlag,
    /// Which grid boundary faces the cube touches
    pub boundary_bits: BoundaryBits,
    /// Scaled L∞ distance from the isovert to the cube center
    pub linf_dist: R,
    /// True if the location is the centroid of the edge-isosurface intersections
    pub flag_centroid_location: bool,
    /// True if some other active cube contains the isovert coordinate
    pub flag_conflict: bool,
    /// True if the cube was selected by the near-corner pass
    pub flag_near_corner: bool,
    /// True if the isovert coordinate was determined by an adjacent cube
    pub flag_coord_from_other_cube: bool,
    /// True if the isovert coordinate was determined by a grid vertex
    pub flag_coord_from_vertex: bool,
    /// True if the isovert coordinate was determined by a grid edge
    pub flag_coord_from_edge: bool,
    /// True if the substitute coordinate replaced the primary one
    pub flag_using_substitute_coord: bool,
    /// True if the coordinate has been recomputed
    pub flag_recomputed_coord: bool,
    /// True if the coordinate has been recomputed with minimum gradient cube offset
    pub flag_recomputed_coord_min_offset: bool,
    /// True if the SVD coordinate was farther than the admissibility radius
    pub flag_far: bool,
    /// Index of the cube configuration in the isosurface lookup table
    pub table_index: usize,
    /// Grid index of the cube which covered this cube
    pub covered_by: I,
    /// Grid index of the cube which this cube maps to
    pub maps_to_cube: I,
    /// Grid index of the active cube which contains this record's isovert coordinate
    pub cube_containing_isovert: I,
}

impl<I: Index, R: Real> GridCube<I, R> {
    fn new(cube_index: I, cube_coord: [i64; 3]) -> Self {
        Self {
            cube_index,
            cube_coord,
            isovert_coord: Vector3::zeros(),
            isovert_coord_alt: Vector3::zeros(),
            direction: Vector3::zeros(),
            num_eigenvalues: 0,
            flag: CubeFlag::Available,
            boundary_bits: BoundaryBits::empty(),
            linf_dist: R::zero(),
            flag_centroid_location: false,
            flag_conflict: false,
            flag_near_corner: false,
            flag_coord_from_other_cube: false,
            flag_coord_from_vertex: false,
            flag_coord_from_edge: false,
            flag_using_substitute_coord: false,
            flag_recomputed_coord: false,
            flag_recomputed_coord_min_offset: false,
            flag_far: false,
            table_index: 0,
            covered_by: cube_index,
            maps_to_cube: cube_index,
            cube_containing_isovert: cube_index,
        }
    }

    /// Returns true if the cube is covered or selected
    pub fn is_covered_or_selected(&self) -> bool {
        matches!(
            self.flag,
            CubeFlag::Selected
                | CubeFlag::CoveredA
                | CubeFlag::CoveredB
                | CubeFlag::CoveredCorner
                | CubeFlag::CoveredPoint
        )
    }
}

/// Statistics collected over the pipeline
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IsovertInfo {
    pub num_sharp_corners: usize,
    pub num_sharp_edges: usize,
    pub num_smooth_vertices: usize,
    pub num_merged_iso_vertices: usize,
    pub num_conflicts: usize,
    pub num_non_disk_isopatches: usize,
}

const NO_SLOT: usize = usize::MAX;

/// Store of all active cube records and the sparse cube-to-slot index grid
#[derive(Clone, Debug)]
pub struct IsovertSet<I: Index, R: Real> {
    gcube_list: Vec<GridCube<I, R>>,
    /// Per grid vertex, the record slot of the cube anchored there, or no slot
    index_grid: Vec<usize>,
}

impl<I: Index, R: Real> IsovertSet<I, R> {
    /// Scans the grid and allocates a record for every active cube
    pub fn create_active_cubes(scalar: &ScalarGrid<I, R>, isovalue: R) -> Self {
        let grid = &scalar.grid;
        let mut index_grid = vec![NO_SLOT; grid.num_vertices()];
        let mut gcube_list = Vec::new();
        for cube in grid.cubes() {
            if scalar.is_cube_active(cube, isovalue) {
                index_grid[cube.to_usize()] = gcube_list.len();
                gcube_list.push(GridCube::new(cube, grid.compute_coord(cube)));
            }
        }
        log::info!("Found {} active cubes", gcube_list.len());
        Self {
            gcube_list,
            index_grid,
        }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.gcube_list.len()
    }

    /// Returns true if there are no active cubes
    pub fn is_empty(&self) -> bool {
        self.gcube_list.is_empty()
    }

    /// Record slot of the cube, or None if the cube is not active
    pub fn gcube_index(&self, cube_index: I) -> Option<usize> {
        let slot = self.index_grid[cube_index.to_usize()];
        (slot != NO_SLOT).then_some(slot)
    }

    /// Cube index of the record in the given slot
    pub fn cube_index(&self, slot: usize) -> I {
        self.gcube_list[slot].cube_index
    }

    /// Isovert coordinate of the record in the given slot
    pub fn isovert_coord(&self, slot: usize) -> Vector3<R> {
        self.gcube_list[slot].isovert_coord
    }

    /// Returns true if the cube is active
    pub fn is_active(&self, cube_index: I) -> bool {
        self.gcube_index(cube_index).is_some()
    }

    /// Returns true if the cube is active and carries the given flag
    pub fn is_flag(&self, cube_index: I, flag: CubeFlag) -> bool {
        self.gcube_index(cube_index)
            .map(|slot| self.gcube_list[slot].flag == flag)
            .unwrap_or(false)
    }

    /// Shared access to the record list
    pub fn records(&self) -> &[GridCube<I, R>] {
        &self.gcube_list
    }

    /// Mutable access to the record list
    pub fn records_mut(&mut self) -> &mut [GridCube<I, R>] {
        &mut self.gcube_list
    }

    /// Shared access to one record
    pub fn record(&self, slot: usize) -> &GridCube<I, R> {
        &self.gcube_list[slot]
    }

    /// Mutable access to one record
    pub fn record_mut(&mut self, slot: usize) -> &mut GridCube<I, R> {
        &mut self.gcube_list[slot]
    }

    /// All active cube indices in slot order
    pub fn get_cube_list(&self) -> Vec<I> {
        self.gcube_list.iter().map(|c| c.cube_index).collect()
    }

    /// Stores the boundary bits of every record
    pub fn store_boundary_bits(&mut self, grid: &UniformGrid<I, R>) {
        for gcube in self.gcube_list.iter_mut() {
            gcube.boundary_bits = grid.compute_boundary_bits(gcube.cube_index);
        }
    }

    /// Stores the isosurface lookup table index of every record.
    ///
    /// Fails if the number of indices does not match the number of records.
    pub fn store_table_index(
        &mut self,
        table_index: &[usize],
    ) -> Result<(), crate::ReconstructionError<I>> {
        if table_index.len() != self.gcube_list.len() {
            return Err(crate::ReconstructionError::BadInput(format!(
                "numbers of elements in table_index ({}) and gcube_list ({}) differ",
                table_index.len(),
                self.gcube_list.len()
            )));
        }
        for (gcube, &index) in self.gcube_list.iter_mut().zip(table_index.iter()) {
            gcube.table_index = index;
        }
        Ok(())
    }

    /// Sets `covered_by` of every record back to the record's own cube
    pub fn initialize_covered_by(&mut self) {
        for gcube in self.gcube_list.iter_mut() {
            gcube.covered_by = gcube.cube_index;
        }
    }

    /// Marks every non-smooth cube as selected, bypassing the geometric selector
    pub fn select_non_smooth(&mut self) {
        for gcube in self.gcube_list.iter_mut() {
            if gcube.flag != CubeFlag::Smooth {
                gcube.flag = CubeFlag::Selected;
            }
        }
    }

    /// Counts sharp corner, sharp edge, smooth and conflicting vertices
    pub fn count_vertices(&self) -> IsovertInfo {
        let mut info = IsovertInfo::default();
        for gcube in self.gcube_list.iter() {
            match gcube.flag {
                CubeFlag::Selected => {
                    if gcube.num_eigenvalues == 2 {
                        info.num_sharp_edges += 1;
                    } else if gcube.num_eigenvalues == 3 {
                        info.num_sharp_corners += 1;
                    }
                }
                CubeFlag::Smooth => info.num_smooth_vertices += 1,
                _ => {}
            }
            if gcube.flag_conflict {
                info.num_conflicts += 1;
            }
        }
        info
    }
}

/// Returns the slots of all cubes with more than one eigenvalue, sorted by
/// decreasing eigenvalue count, then cubes which generated their own isovert
/// first, then increasing L∞ distance from the cube center.
///
/// The sort is stable, so ties keep slot order.
pub fn get_corner_or_edge_cubes<I: Index, R: Real>(isovert: &IsovertSet<I, R>) -> Vec<usize> {
    let mut list: Vec<usize> = (0..isovert.len())
        .filter(|&slot| isovert.record(slot).num_eigenvalues > 1)
        .collect();
    sort_gcube_list(isovert, &mut list);
    list
}

/// Sorts a slot list with the selection ordering (see [get_corner_or_edge_cubes])
pub fn sort_gcube_list<I: Index, R: Real>(isovert: &IsovertSet<I, R>, list: &mut [usize]) {
    list.sort_by(|&i, &j| {
        let a = isovert.record(i);
        let b = isovert.record(j);
        b.num_eigenvalues
            .cmp(&a.num_eigenvalues)
            .then(a.flag_coord_from_other_cube.cmp(&b.flag_coord_from_other_cube))
            .then(a.linf_dist.partial_cmp(&b.linf_dist).expect("finite distances"))
    });
}

/// Returns the slots of all selected cubes in slot order
pub fn get_selected_cubes<I: Index, R: Real>(isovert: &IsovertSet<I, R>) -> Vec<usize> {
    (0..isovert.len())
        .filter(|&slot| isovert.record(slot).flag == CubeFlag::Selected)
        .collect()
}

/// Returns the slots of all selected corner cubes in slot order
pub fn get_selected_corner_cubes<I: Index, R: Real>(isovert: &IsovertSet<I, R>) -> Vec<usize> {
    (0..isovert.len())
        .filter(|&slot| {
            let gcube = isovert.record(slot);
            gcube.flag == CubeFlag::Selected && gcube.num_eigenvalues == 3
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform_grid::ScalarGrid;
    use crate::uniform_grid::UniformGrid;

    #[test]
    fn test_create_active_cubes() {
        let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
        let scalar = ScalarGrid::from_fn(grid, |p| p.x - 2.5);
        let isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        // Only the x in [2, 3] cube layer is active
        assert_eq!(isovert.len(), 16);
        for gcube in isovert.records() {
            assert_eq!(gcube.cube_coord[0], 2);
            assert_eq!(gcube.flag, CubeFlag::Available);
            assert_eq!(gcube.covered_by, gcube.cube_index);
        }
        let inactive = scalar.grid.flatten_coord([0, 0, 0]);
        assert!(!isovert.is_active(inactive));
    }

    #[test]
    fn test_selection_sort_order() {
        let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
        let scalar = ScalarGrid::from_fn(grid, |p| p.x - 2.5);
        let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
        for (i, gcube) in isovert.records_mut().iter_mut().enumerate() {
            gcube.num_eigenvalues = if i % 2 == 0 { 2 } else { 3 };
            gcube.linf_dist = 1.0 - 0.01 * i as f64;
        }
        let sorted = get_corner_or_edge_cubes(&isovert);
        // Corners first, then by increasing distance
        let mut seen_edge = false;
        let mut prev_dist = f64::NEG_INFINITY;
        for slot in sorted {
            let gcube = isovert.record(slot);
            if gcube.num_eigenvalues == 2 {
                seen_edge = true;
            } else {
                assert!(!seen_edge);
            }
            if seen_edge && gcube.num_eigenvalues == 2 {
                assert!(gcube.linf_dist >= prev_dist);
                prev_dist = gcube.linf_dist;
            }
        }
    }

    #[test]
    fn test_flag_display() {
        assert_eq!(CubeFlag::CoveredA.to_string(), "Covered (A)");
        assert_eq!(CubeFlag::NonDisk.to_string(), "Non-disk patch");
    }
}
