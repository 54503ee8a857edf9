//! Coarse spatial hashing of selected cubes for nearby-selected lookup

use crate::numeric_types::{Index, Real};
use crate::uniform_grid::UniformGrid;
use smallvec::SmallVec;

/// A coarse grid of buckets over the cube grid, bucket side `bin_width` cubes
#[derive(Clone, Debug)]
pub struct BinGrid<I: Index> {
    axis_size: [i64; 3],
    bin_width: i64,
    bins: Vec<SmallVec<[I; 4]>>,
}

impl<I: Index> BinGrid<I> {
    /// Creates an empty bin grid covering the given grid
    pub fn new<R: Real>(grid: &UniformGrid<I, R>, bin_width: usize) -> Self {
        let bin_width = (bin_width as i64).max(1);
        let mut axis_size = [0i64; 3];
        for d in 0..3 {
            axis_size[d] = (grid.axis_size(d).to_i64() + bin_width - 1) / bin_width;
        }
        let num_bins = (axis_size[0] * axis_size[1] * axis_size[2]) as usize;
        Self {
            axis_size,
            bin_width,
            bins: vec![SmallVec::new(); num_bins],
        }
    }

    fn bin_of(&self, cube_coord: [i64; 3]) -> usize {
        let bx = cube_coord[0] / self.bin_width;
        let by = cube_coord[1] / self.bin_width;
        let bz = cube_coord[2] / self.bin_width;
        (bx + self.axis_size[0] * (by + self.axis_size[1] * bz)) as usize
    }

    /// Inserts a cube into its bucket
    pub fn insert<R: Real>(&mut self, grid: &UniformGrid<I, R>, cube_index: I) {
        let bin = self.bin_of(grid.compute_coord(cube_index));
        self.bins[bin].push(cube_index);
    }

    /// Removes a cube from its bucket
    pub fn remove<R: Real>(&mut self, grid: &UniformGrid<I, R>, cube_index: I) {
        let bin = self.bin_of(grid.compute_coord(cube_index));
        if let Some(pos) = self.bins[bin].iter().position(|&c| c == cube_index) {
            self.bins[bin].remove(pos);
        }
    }

    /// Collects all stored cubes within one bucket of the given cube.
    ///
    /// The cube's own bucket is listed first; results are in deterministic
    /// bucket-scan order.
    pub fn get_selected<R: Real>(
        &self,
        grid: &UniformGrid<I, R>,
        cube_index: I,
        selected_list: &mut Vec<I>,
    ) {
        selected_list.clear();
        let coord = grid.compute_coord(cube_index);
        let center = [
            coord[0] / self.bin_width,
            coord[1] / self.bin_width,
            coord[2] / self.bin_width,
        ];
        let center_bin = self.bin_of(coord);
        selected_list.extend_from_slice(&self.bins[center_bin]);
        for bz in (center[2] - 1).max(0)..=(center[2] + 1).min(self.axis_size[2] - 1) {
            for by in (center[1] - 1).max(0)..=(center[1] + 1).min(self.axis_size[1] - 1) {
                for bx in (center[0] - 1).max(0)..=(center[0] + 1).min(self.axis_size[0] - 1) {
                    let bin = (bx + self.axis_size[0] * (by + self.axis_size[1] * bz)) as usize;
                    if bin != center_bin {
                        selected_list.extend_from_slice(&self.bins[bin]);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_query_remove() {
        let grid = UniformGrid::<i32, f64>::new_unit([20, 20, 20]).unwrap();
        let mut bins = BinGrid::new(&grid, 5);
        let a = grid.flatten_coord([2, 2, 2]);
        let b = grid.flatten_coord([6, 2, 2]);
        let far = grid.flatten_coord([18, 18, 18]);
        bins.insert(&grid, a);
        bins.insert(&grid, b);
        bins.insert(&grid, far);

        let mut nearby = Vec::new();
        bins.get_selected(&grid, grid.flatten_coord([3, 3, 3]), &mut nearby);
        assert!(nearby.contains(&a));
        assert!(nearby.contains(&b));
        assert!(!nearby.contains(&far));

        bins.remove(&grid, b);
        bins.get_selected(&grid, grid.flatten_coord([3, 3, 3]), &mut nearby);
        assert!(!nearby.contains(&b));
    }
}
