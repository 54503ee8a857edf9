//!
//! Library for reconstructing isosurface vertices that preserve sharp features (edges and
//! corners) from a uniform scalar grid with gradients. Entry point is the
//! [reconstruct_sharp_isovert] function, or the [compute_dual_isovert] /
//! [select_sharp_isovert] / [merge_sharp_iso_vertices] stages individually.
//!

/// Re-export the version of nalgebra used by this crate
pub use nalgebra;

/// Coarse spatial hashing of selected cubes
pub mod bin_grid;
/// Topological disk test for isosurface patches and the non-disk repair loop
pub mod disk_patch;
/// Dual isosurface cube configurations (vertex counts, ambiguous facets)
pub mod dual_table;
/// Per-cube records for sharp isosurface vertices and the record store
pub mod isovert;
/// Mapping of active cubes onto selected sharp cubes
pub mod merge;
mod numeric_types;
/// Placement of sharp points in active cubes and the recompute passes
pub mod placement;
/// Selection of the sharp cubes whose isovertices become mesh vertices
pub mod selection;
/// Least-squares sharp-point computation from gradients
pub mod svd;
/// Helper types for cartesian coordinate system topology
pub mod topology;
/// Types for the uniform background grid holding scalars and gradients
pub mod uniform_grid;

use log::info;
use thiserror::Error as ThisError;

pub use crate::numeric_types::{Index, Real};
use crate::uniform_grid::{GradientGrid, ScalarGrid};
pub use dual_table::IsodualCubeTable;
pub use isovert::{CubeFlag, GridCube, IsovertInfo, IsovertSet};
pub use merge::{merge_sharp_iso_vertices, merge_sharp_iso_vertices_multi, MergeInfo, MergeOutcome};
pub use selection::select_sharp_isovert;
pub use uniform_grid::{BoundaryBits, GridConstructionError, UniformGrid};

pub(crate) type HashState = fxhash::FxBuildHasher;
pub(crate) type MapType<K, V> = std::collections::HashMap<K, V, HashState>;
pub(crate) fn new_map<K, V>() -> MapType<K, V> {
    MapType::with_hasher(HashState::default())
}

/// Parameters for the placement and selection of sharp isosurface vertices
#[derive(Clone, Debug)]
pub struct SharpIsovertParameters<R: Real> {
    /// Cube offset used to select the gradients entering the least-squares fit
    pub grad_selection_cube_offset: R,
    /// Relative singular value threshold of the SVD classification
    pub singular_value_tolerance: R,
    /// Gradients with a magnitude at or below this value are ignored
    pub max_small_magnitude: R,
    /// Maximum scaled L∞ distance from the cube center for a cube to be selectable
    pub linf_dist_thresh_merge_sharp: R,
    /// Radius of the admissibility ball around the cube center; points beyond it are clamped
    pub max_dist: R,
    /// Maximum distance for moving a sharp point into another conflicting cube
    pub max_dist_to_set_other: R,
    /// Bucket side of the bin grid, in cubes
    pub bin_width: usize,
    /// Anchor the least-squares solve at the edge-intersection centroid
    pub use_lindstrom: bool,
}

impl<R: Real> Default for SharpIsovertParameters<R> {
    fn default() -> Self {
        Self {
            grad_selection_cube_offset: R::one(),
            singular_value_tolerance: <R as Real>::from_f64(0.1),
            max_small_magnitude: <R as Real>::from_f64(1e-4),
            linf_dist_thresh_merge_sharp: <R as Real>::from_f64(0.6),
            max_dist: R::one(),
            max_dist_to_set_other: <R as Real>::from_f64(0.5),
            bin_width: 5,
            use_lindstrom: true,
        }
    }
}

impl<R: Real> SharpIsovertParameters<R> {
    /// Tries to convert the parameters from one [Real] type to another [Real] type, returns None if conversion fails
    pub fn try_convert<T: Real>(&self) -> Option<SharpIsovertParameters<T>> {
        Some(SharpIsovertParameters {
            grad_selection_cube_offset: self.grad_selection_cube_offset.try_convert()?,
            singular_value_tolerance: self.singular_value_tolerance.try_convert()?,
            max_small_magnitude: self.max_small_magnitude.try_convert()?,
            linf_dist_thresh_merge_sharp: self.linf_dist_thresh_merge_sharp.try_convert()?,
            max_dist: self.max_dist.try_convert()?,
            max_dist_to_set_other: self.max_dist_to_set_other.try_convert()?,
            bin_width: self.bin_width,
            use_lindstrom: self.use_lindstrom,
        })
    }
}

/// Parameters for merging isosurface vertices onto selected sharp cubes
#[derive(Clone, Debug)]
pub struct MergeParameters<R: Real> {
    /// Bucket side of the bin grid, in cubes
    pub bin_width: usize,
    /// Enable the extended mapping passes reaching cubes at distance two
    pub flag_map_extended: bool,
    /// Enable the disk check and repair loop
    pub flag_check_disk: bool,
    /// Enable collapsing triangles with small angles after mapping
    pub flag_collapse_triangles_with_small_angles: bool,
    /// Apex angle cosine at or above which a degenerate quad's triangle is collapsed
    pub cos_collapse_angle: R,
    /// Distortion tolerance of the strict feasibility checks
    pub cos_max_small_angle_strict: R,
    /// Distortion tolerance of the loose feasibility checks
    pub cos_max_small_angle_loose: R,
    /// Isovert positions closer than this are considered coincident
    pub min_distance_between_isovert: R,
}

impl<R: Real> Default for MergeParameters<R> {
    fn default() -> Self {
        Self {
            bin_width: 5,
            flag_map_extended: false,
            flag_check_disk: true,
            flag_collapse_triangles_with_small_angles: false,
            cos_collapse_angle: <R as Real>::from_f64((10.0f64).to_radians().cos()),
            cos_max_small_angle_strict: <R as Real>::from_f64((5.0f64).to_radians().cos()),
            cos_max_small_angle_loose: <R as Real>::from_f64((1.0f64).to_radians().cos()),
            min_distance_between_isovert: <R as Real>::from_f64(1e-3),
        }
    }
}

impl<R: Real> MergeParameters<R> {
    /// Tries to convert the parameters from one [Real] type to another [Real] type, returns None if conversion fails
    pub fn try_convert<T: Real>(&self) -> Option<MergeParameters<T>> {
        Some(MergeParameters {
            bin_width: self.bin_width,
            flag_map_extended: self.flag_map_extended,
            flag_check_disk: self.flag_check_disk,
            flag_collapse_triangles_with_small_angles: self
                .flag_collapse_triangles_with_small_angles,
            cos_collapse_angle: self.cos_collapse_angle.try_convert()?,
            cos_max_small_angle_strict: self.cos_max_small_angle_strict.try_convert()?,
            cos_max_small_angle_loose: self.cos_max_small_angle_loose.try_convert()?,
            min_distance_between_isovert: self.min_distance_between_isovert.try_convert()?,
        })
    }
}

/// Error type returned when the sharp vertex reconstruction fails
#[non_exhaustive]
#[derive(Debug, ThisError)]
pub enum ReconstructionError<I: Index> {
    /// The gradient grid does not have the same shape as the scalar grid
    #[error("gradient grid does not match the scalar grid")]
    GridMismatch,
    /// A structural invariant was violated, carries the offending cube index
    #[error("internal inconsistency at cube {cube_index:?}")]
    InternalInconsistency { cube_index: I },
    /// Invalid input data
    #[error("bad input: {0}")]
    BadInput(String),
    /// Any error that is not represented by some other explicit variant
    #[error("unknown error")]
    Unknown(#[from] anyhow::Error),
}

/// Result data of a successful sharp vertex reconstruction
#[derive(Clone, Debug)]
pub struct SharpReconstruction<I: Index, R: Real> {
    isovert: IsovertSet<I, R>,
    gcube_map: Vec<usize>,
    info: MergeInfo,
}

impl<I: Index, R: Real> SharpReconstruction<I, R> {
    /// Returns a reference to the per-cube record store
    pub fn isovert(&self) -> &IsovertSet<I, R> {
        &self.isovert
    }

    /// Returns the final cube-to-vertex merge relation (slot to slot)
    pub fn gcube_map(&self) -> &[usize] {
        &self.gcube_map
    }

    /// Returns the merge statistics
    pub fn merge_info(&self) -> MergeInfo {
        self.info
    }

    /// Counts sharp corner, edge and smooth vertices of the final records
    pub fn count_vertices(&self) -> IsovertInfo {
        let mut counts = self.isovert.count_vertices();
        counts.num_merged_iso_vertices = self.info.num_merged_iso_vertices;
        counts.num_non_disk_isopatches = self.info.num_non_disk_isopatches;
        counts
    }
}

impl<I: Index, R: Real> From<SharpReconstruction<I, R>> for IsovertSet<I, R> {
    /// Extracts the record store
    fn from(result: SharpReconstruction<I, R>) -> Self {
        result.isovert
    }
}

/// Computes the candidate sharp isosurface vertex of every active cube.
///
/// Runs the SVD placement for every cube whose scalar range straddles the
/// isovalue, records primary and alternate coordinates, then resolves
/// conflicting positions by swapping and substitution.
pub fn compute_dual_isovert<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
) -> Result<IsovertSet<I, R>, ReconstructionError<I>> {
    if !gradients.matches(&scalar.grid) {
        return Err(ReconstructionError::GridMismatch);
    }

    let mut isovert = IsovertSet::create_active_cubes(scalar, isovalue);
    placement::compute_all_isovert_positions(scalar, gradients, isovalue, param, &mut isovert);
    placement::swap_isovert_positions(&scalar.grid, param.max_dist_to_set_other, &mut isovert)?;
    placement::apply_secondary_isovert_positions(
        &scalar.grid,
        param.max_dist_to_set_other,
        &mut isovert,
    );

    Ok(isovert)
}

/// Runs the full pipeline: activate cubes, place isoverts, select sharp cubes,
/// map adjacent cubes and repair non-disk patches
#[inline(never)]
pub fn reconstruct_sharp_isovert<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    merge_param: &MergeParameters<R>,
) -> Result<SharpReconstruction<I, R>, ReconstructionError<I>> {
    let mut isovert = compute_dual_isovert(scalar, gradients, isovalue, param)?;

    select_sharp_isovert(scalar, gradients, isovalue, param, &mut isovert)?;

    placement::recompute_isovert_positions(scalar, gradients, isovalue, param, &mut isovert);

    let outcome = merge_sharp_iso_vertices(scalar, isovalue, &mut isovert, merge_param)?;

    let counts = isovert.count_vertices();
    info!(
        "Reconstruction found {} sharp corners, {} sharp edges, {} smooth vertices",
        counts.num_sharp_corners, counts.num_sharp_edges, counts.num_smooth_vertices
    );

    Ok(SharpReconstruction {
        isovert,
        gcube_map: outcome.gcube_map,
        info: outcome.info,
    })
}

/// Runs the full pipeline in multi-isovertex mode: cube configurations are
/// looked up in the isodual table and ambiguous facets constrain the merge
pub fn reconstruct_sharp_isovert_multi<I: Index, R: Real>(
    scalar: &ScalarGrid<I, R>,
    gradients: &GradientGrid<I, R>,
    isovalue: R,
    param: &SharpIsovertParameters<R>,
    merge_param: &MergeParameters<R>,
) -> Result<SharpReconstruction<I, R>, ReconstructionError<I>> {
    let table = IsodualCubeTable::new();

    let mut isovert = compute_dual_isovert(scalar, gradients, isovalue, param)?;

    let table_indices: Vec<usize> = isovert
        .get_cube_list()
        .into_iter()
        .map(|cube| IsodualCubeTable::compute_table_index(scalar, cube, isovalue))
        .collect();
    isovert.store_table_index(&table_indices)?;

    select_sharp_isovert(scalar, gradients, isovalue, param, &mut isovert)?;

    placement::recompute_isovert_positions(scalar, gradients, isovalue, param, &mut isovert);

    let outcome =
        merge_sharp_iso_vertices_multi(scalar, &table, isovalue, &mut isovert, merge_param)?;

    Ok(SharpReconstruction {
        isovert,
        gcube_map: outcome.gcube_map,
        info: outcome.info,
    })
}
