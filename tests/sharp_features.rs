//! End-to-end tests of the sharp vertex reconstruction pipeline on synthetic
//! scalar fields with known sharp features

use nalgebra::Vector3;
use sharpsurf_lib::disk_patch::{
    extract_dual_isopatch_incident_on, is_isopatch_disk3d, unmap_non_disk_isopatches,
};
use sharpsurf_lib::uniform_grid::{GradientGrid, ScalarGrid, UniformGrid};
use sharpsurf_lib::{
    reconstruct_sharp_isovert, reconstruct_sharp_isovert_multi, CubeFlag, IsovertSet,
    MergeInfo, MergeParameters, SharpIsovertParameters,
};

/// Two half planes meeting along an edge parallel to the x axis
fn edge_field(
    axis_size: [i32; 3],
) -> (ScalarGrid<i32, f64>, GradientGrid<i32, f64>) {
    let grid = UniformGrid::<i32, f64>::new_unit(axis_size).unwrap();
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

/// Three planes meeting at a corner
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

/// Two parallel sharp creases five cubes apart along y
fn two_creases_field() -> (ScalarGrid<i32, f64>, GradientGrid<i32, f64>) {
    let grid = UniformGrid::<i32, f64>::new_unit([6, 9, 6]).unwrap();
    let scalar = ScalarGrid::from_fn(grid.clone(), |p| {
        (p.z - 2.25).max((p.y - 1.25).min(6.25 - p.y))
    });
    let gradients = GradientGrid::from_fn(&grid, |p| {
        let wall = (p.y - 1.25).min(6.25 - p.y);
        if p.z - 2.25 >= wall {
            Vector3::new(0.0, 0.0, 1.0)
        } else if p.y - 1.25 <= 6.25 - p.y {
            Vector3::new(0.0, 1.0, 0.0)
        } else {
            Vector3::new(0.0, -1.0, 0.0)
        }
    });
    (scalar, gradients)
}

fn check_universal_invariants(
    scalar: &ScalarGrid<i32, f64>,
    isovert: &IsovertSet<i32, f64>,
    gcube_map: &[usize],
) {
    for slot in 0..isovert.len() {
        let record = isovert.record(slot);
        let to_slot = gcube_map[slot];

        // gcube_map integrity: valid slot, either identity or a selected cube
        assert!(to_slot < isovert.len());
        if to_slot != slot {
            assert_eq!(isovert.record(to_slot).flag, CubeFlag::Selected);
            assert_eq!(record.maps_to_cube, isovert.cube_index(to_slot));
        }

        // Covered coverage: covered cubes point to a selected cube in their
        // 26-neighborhood
        if matches!(record.flag, CubeFlag::CoveredA | CubeFlag::CoveredCorner) {
            let covering_slot = isovert
                .gcube_index(record.covered_by)
                .expect("covering cube is active");
            assert_eq!(isovert.record(covering_slot).flag, CubeFlag::Selected);
            assert!(
                scalar
                    .grid
                    .linf_distance_between_cubes(record.cube_index, record.covered_by)
                    <= 1
            );
        }

        // Containment: the isovert lies in its recorded containing cube
        if !record.flag_centroid_location && scalar.grid.contains_point(&record.isovert_coord) {
            assert!(scalar
                .grid
                .cube_contains_point(record.cube_containing_isovert, &record.isovert_coord));
        }
    }
}

#[test]
fn test_single_sharp_edge() {
    let (scalar, gradients) = edge_field([6, 6, 6]);
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters::default();

    let result =
        reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let isovert = result.isovert();

    let mut num_selected = 0;
    for slot in 0..isovert.len() {
        let record = isovert.record(slot);
        if record.flag != CubeFlag::Selected {
            continue;
        }
        num_selected += 1;

        // Every selected cube sits on the crease: two large eigenvalues,
        // direction along x, point on the line (y, z) = (2.25, 2.25)
        assert_eq!(record.num_eigenvalues, 2);
        assert!(
            record.direction.x.abs() > 0.99,
            "edge direction {:?} is not parallel to x",
            record.direction
        );
        assert!((record.isovert_coord.y - 2.25).abs() < 1e-4);
        assert!((record.isovert_coord.z - 2.25).abs() < 1e-4);
    }
    assert!(num_selected > 0, "no cube was selected along the crease");

    check_universal_invariants(&scalar, isovert, result.gcube_map());
}

#[test]
fn test_corner() {
    let (scalar, gradients) = corner_field();
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters::default();

    let result =
        reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let isovert = result.isovert();

    // Exactly one selected corner cube near (2.25, 2.25, 2.25)
    let corner_slots: Vec<usize> = (0..isovert.len())
        .filter(|&slot| {
            isovert.record(slot).flag == CubeFlag::Selected
                && isovert.record(slot).num_eigenvalues == 3
        })
        .collect();
    assert_eq!(corner_slots.len(), 1);
    let corner = isovert.record(corner_slots[0]);
    assert!((corner.isovert_coord - Vector3::new(2.25, 2.25, 2.25)).norm() < 1e-4);

    // Sharp neighbors of the corner cube are covered by it
    let corner_cube = corner.cube_index;
    for slot in 0..isovert.len() {
        let record = isovert.record(slot);
        if slot == corner_slots[0] {
            continue;
        }
        if scalar
            .grid
            .linf_distance_between_cubes(record.cube_index, corner_cube)
            == 1
            && record.num_eigenvalues >= 2
        {
            assert_eq!(
                record.flag,
                CubeFlag::CoveredCorner,
                "sharp neighbor {:?} of the corner is not covered by it",
                record.cube_index
            );
        }
    }

    check_universal_invariants(&scalar, isovert, result.gcube_map());
}

#[test]
fn test_adjacent_parallel_creases() {
    let (scalar, gradients) = two_creases_field();
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters::default();

    let result =
        reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let isovert = result.isovert();

    // Two families of selected edge cubes, one per crease
    let mut selected_near_a = Vec::new();
    let mut selected_near_b = Vec::new();
    for slot in 0..isovert.len() {
        let record = isovert.record(slot);
        if record.flag != CubeFlag::Selected {
            continue;
        }
        assert_eq!(record.num_eigenvalues, 2);
        if record.cube_coord[1] <= 2 {
            selected_near_a.push(slot);
        } else {
            selected_near_b.push(slot);
        }
    }
    assert!(!selected_near_a.is_empty());
    assert!(!selected_near_b.is_empty());

    // Mapped cubes collapse onto the nearer crease
    for (slot, &to_slot) in result.gcube_map().iter().enumerate() {
        if to_slot == slot {
            continue;
        }
        let from_y = isovert.record(slot).cube_coord[1];
        let to_y = isovert.record(to_slot).cube_coord[1];
        let dist_a = (from_y - 1).abs();
        let dist_b = (from_y - 6).abs();
        if dist_a < dist_b {
            assert!(to_y <= 2, "cube near crease A mapped to the far crease");
        } else if dist_b < dist_a {
            assert!(to_y >= 4, "cube near crease B mapped to the far crease");
        }
    }

    check_universal_invariants(&scalar, isovert, result.gcube_map());
}

#[test]
fn test_disk_patches_at_exit() {
    let (scalar, gradients) = corner_field();
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters {
        flag_check_disk: true,
        ..MergeParameters::default()
    };

    let result =
        reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let isovert = result.isovert();

    for slot in 0..isovert.len() {
        if isovert.record(slot).flag != CubeFlag::Selected {
            continue;
        }
        let (tri, quad) = extract_dual_isopatch_incident_on(
            &scalar,
            None,
            0.0,
            isovert,
            isovert.cube_index(slot),
            result.gcube_map(),
            1,
        );
        assert!(
            is_isopatch_disk3d(&tri, &quad),
            "selected cube {:?} has a non-disk patch at pipeline exit",
            isovert.cube_index(slot)
        );
    }
}

#[test]
fn test_non_disk_repair_releases_merged_cubes() {
    // A flat plane field; cube S with two diagonally-attached merged cubes
    // produces a pinched patch that fails the disk test
    let grid = UniformGrid::<i32, f64>::new_unit([7, 7, 7]).unwrap();
    let scalar = ScalarGrid::from_fn(grid, |p| p.z - 2.5);

    let mut isovert = IsovertSet::create_active_cubes(&scalar, 0.0);
    isovert.store_boundary_bits(&scalar.grid);

    let s = scalar.grid.flatten_coord([3, 3, 2]);
    let a = scalar.grid.flatten_coord([2, 2, 2]);
    let b = scalar.grid.flatten_coord([4, 4, 2]);
    let s_slot = isovert.gcube_index(s).unwrap();
    let a_slot = isovert.gcube_index(a).unwrap();
    let b_slot = isovert.gcube_index(b).unwrap();

    isovert.record_mut(s_slot).flag = CubeFlag::Selected;
    isovert.record_mut(a_slot).flag = CubeFlag::CoveredA;
    isovert.record_mut(b_slot).flag = CubeFlag::CoveredA;

    let mut gcube_map: Vec<usize> = (0..isovert.len()).collect();
    gcube_map[a_slot] = s_slot;
    gcube_map[b_slot] = s_slot;

    // The pinched patch is not a disk
    let (tri, quad) =
        extract_dual_isopatch_incident_on(&scalar, None, 0.0, &isovert, s, &gcube_map, 1);
    assert!(!is_isopatch_disk3d(&tri, &quad));

    let mut info = MergeInfo::default();
    unmap_non_disk_isopatches(&scalar, None, 0.0, &mut isovert, &mut gcube_map, &mut info);

    // The selection is reverted and every merged cube released
    assert_eq!(isovert.record(s_slot).flag, CubeFlag::NonDisk);
    assert_eq!(isovert.record(a_slot).flag, CubeFlag::Smooth);
    assert_eq!(isovert.record(b_slot).flag, CubeFlag::Smooth);
    let identity: Vec<usize> = (0..isovert.len()).collect();
    assert_eq!(gcube_map, identity);
    assert_eq!(info.num_non_disk_isopatches, 1);
}

#[test]
fn test_pipeline_is_idempotent() {
    let (scalar, gradients) = edge_field([6, 6, 6]);
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters::default();

    let first = reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let second = reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();

    assert_eq!(first.gcube_map(), second.gcube_map());
    for slot in 0..first.isovert().len() {
        let record_a = first.isovert().record(slot);
        let record_b = second.isovert().record(slot);
        assert_eq!(record_a.flag, record_b.flag);
        assert_eq!(record_a.isovert_coord, record_b.isovert_coord);
        assert_eq!(record_a.num_eigenvalues, record_b.num_eigenvalues);
    }
}

#[test]
fn test_multi_pipeline_on_corner_field() {
    let (scalar, gradients) = corner_field();
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters::default();

    let result =
        reconstruct_sharp_isovert_multi(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let isovert = result.isovert();

    // The corner field has unambiguous configurations everywhere, so the
    // multi path agrees with the single path on the selected corner
    let corner_slots: Vec<usize> = (0..isovert.len())
        .filter(|&slot| {
            isovert.record(slot).flag == CubeFlag::Selected
                && isovert.record(slot).num_eigenvalues == 3
        })
        .collect();
    assert_eq!(corner_slots.len(), 1);

    check_universal_invariants(&scalar, isovert, result.gcube_map());
}

#[test]
fn test_gradient_grid_mismatch_is_rejected() {
    let grid = UniformGrid::<i32, f64>::new_unit([5, 5, 5]).unwrap();
    let small_grid = UniformGrid::<i32, f64>::new_unit([4, 4, 4]).unwrap();
    let scalar = ScalarGrid::from_fn(grid, |p| p.x - 2.0);
    let gradients = GradientGrid::from_fn(&small_grid, |_| Vector3::new(1.0, 0.0, 0.0));

    let param = SharpIsovertParameters::default();
    let result = sharpsurf_lib::compute_dual_isovert(&scalar, &gradients, 0.0, &param);
    assert!(result.is_err());
}

#[test]
fn test_counts_on_edge_field() {
    let (scalar, gradients) = edge_field([6, 6, 6]);
    let param = SharpIsovertParameters::default();
    let merge_param = MergeParameters::default();

    let result =
        reconstruct_sharp_isovert(&scalar, &gradients, 0.0, &param, &merge_param).unwrap();
    let counts = result.count_vertices();

    assert_eq!(counts.num_sharp_corners, 0);
    assert!(counts.num_sharp_edges > 0);
    assert!(counts.num_smooth_vertices > 0);
    assert!(counts.num_merged_iso_vertices > 0);
}
