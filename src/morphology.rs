//! Binary dilation with a disk structuring element.
//!
//! A pixel is set when some target pixel lies within `r` pixels of it,
//! i.e. the disk `x² + y² ≤ r²` centred on the pixel touches a target.
//! Pixels outside the raster count as background. The dilation is computed
//! through an exact squared Euclidean distance transform so that large radii
//! stay linear in the number of pixels.

use ndarray::Array2;
use rayon::prelude::*;

/// Metres per degree used to convert distances to pixel radii.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Disk {
    radius_px: f64,
}

impl Disk {
    pub fn new(radius_px: f64) -> Self {
        Self {
            radius_px: radius_px.max(0.0),
        }
    }

    /// Radius `distance_m / (res_deg · 111320)` pixels.
    pub fn from_distance(distance_m: f64, res_deg: f64) -> Self {
        Self::new(distance_m / (res_deg * METERS_PER_DEGREE))
    }

    pub fn radius_px(&self) -> f64 {
        self.radius_px
    }

    /// Offsets `(dy, dx)` covered by the disk.
    pub fn offsets(&self) -> Vec<(isize, isize)> {
        let reach = self.radius_px.floor() as isize;
        let r2 = self.radius_px * self.radius_px;
        let mut offsets = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                if ((dx * dx + dy * dy) as f64) <= r2 {
                    offsets.push((dy, dx));
                }
            }
        }
        offsets
    }
}

/// Lower envelope of parabolas rooted at the finite entries of `f`
/// (Felzenszwalb and Huttenlocher). Writes `min_p (q - p)² + f[p]` into `d`.
fn distance_1d(f: &[f64], d: &mut [f64]) {
    let n = f.len();
    let mut roots: Vec<usize> = Vec::with_capacity(n);
    let mut bounds: Vec<f64> = Vec::with_capacity(n + 1);
    for q in 0..n {
        if !f[q].is_finite() {
            continue;
        }
        let fq = f[q] + (q * q) as f64;
        loop {
            match roots.last() {
                None => {
                    roots.push(q);
                    bounds.push(f64::NEG_INFINITY);
                    break;
                }
                Some(&p) => {
                    let fp = f[p] + (p * p) as f64;
                    let s = (fq - fp) / (2.0 * (q as f64 - p as f64));
                    if s <= bounds[bounds.len() - 1] {
                        roots.pop();
                        bounds.pop();
                    } else {
                        roots.push(q);
                        bounds.push(s);
                        break;
                    }
                }
            }
        }
    }
    if roots.is_empty() {
        d.fill(f64::INFINITY);
        return;
    }
    bounds.push(f64::INFINITY);
    let mut k = 0;
    for (q, out) in d.iter_mut().enumerate() {
        while bounds[k + 1] < q as f64 {
            k += 1;
        }
        let p = roots[k];
        let dq = q as f64 - p as f64;
        *out = dq * dq + f[p];
    }
}

/// Squared pixel distance from every pixel to the nearest `true` pixel;
/// infinite when there is none.
pub fn squared_distance(targets: &Array2<bool>) -> Array2<f64> {
    let (rows, cols) = targets.dim();
    let columns: Vec<Vec<f64>> = (0..cols)
        .into_par_iter()
        .map(|col| {
            let f: Vec<f64> = (0..rows)
                .map(|row| if targets[[row, col]] { 0.0 } else { f64::INFINITY })
                .collect();
            let mut d = vec![0.0; rows];
            distance_1d(&f, &mut d);
            d
        })
        .collect();

    let data: Vec<f64> = (0..rows)
        .into_par_iter()
        .flat_map_iter(|row| {
            let f: Vec<f64> = columns.iter().map(|column| column[row]).collect();
            let mut d = vec![0.0; cols];
            distance_1d(&f, &mut d);
            d
        })
        .collect();
    Array2::from_shape_vec((rows, cols), data)
        .unwrap_or_else(|_| Array2::from_elem((rows, cols), f64::INFINITY))
}

/// Dilates the pixels equal to 1. Returns a 0/1 array; NaN inputs are
/// background.
pub fn binary_dilation(data: &Array2<f32>, disk: &Disk) -> Array2<f32> {
    let targets = data.mapv(|v| v == 1.0);
    let r2 = disk.radius_px() * disk.radius_px();
    squared_distance(&targets).mapv(|d| if d <= r2 { 1.0 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn brute_force(data: &Array2<f32>, disk: &Disk) -> Array2<f32> {
        let (rows, cols) = data.dim();
        let offsets = disk.offsets();
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let hit = offsets.iter().any(|&(dy, dx)| {
                let (nr, nc) = (r as isize + dy, c as isize + dx);
                nr >= 0
                    && nc >= 0
                    && (nr as usize) < rows
                    && (nc as usize) < cols
                    && data[[nr as usize, nc as usize]] == 1.0
            });
            if hit {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_radius_from_distance() {
        let disk = Disk::from_distance(500.0, 0.00025);
        assert!((disk.radius_px() - 500.0 / 27.83).abs() < 1e-9);
    }

    #[test]
    fn test_disk_offsets_radius_one() {
        let mut offsets = Disk::new(1.0).offsets();
        offsets.sort();
        assert_eq!(offsets, vec![(-1, 0), (0, -1), (0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_single_pixel_dilation() {
        let mut data = Array2::<f32>::zeros((7, 7));
        data[[3, 3]] = 1.0;
        let out = binary_dilation(&data, &Disk::new(2.0));
        assert_eq!(out.sum() as usize, Disk::new(2.0).offsets().len());
        assert_eq!(out[[1, 3]], 1.0);
        assert_eq!(out[[2, 2]], 1.0);
        assert_eq!(out[[1, 2]], 0.0);
    }

    #[test]
    fn test_no_targets_stays_empty() {
        let data = Array2::<f32>::from_elem((4, 5), 0.0);
        let out = binary_dilation(&data, &Disk::new(3.0));
        assert_eq!(out.sum(), 0.0);
    }

    #[test]
    fn test_nan_is_background() {
        let mut data = Array2::<f32>::from_elem((3, 3), f32::NAN);
        data[[0, 0]] = 1.0;
        let out = binary_dilation(&data, &Disk::new(1.0));
        assert_eq!(out[[0, 1]], 1.0);
        assert_eq!(out[[2, 2]], 0.0);
    }

    #[test]
    fn test_matches_brute_force_on_random_masks() {
        let mut rng = StdRng::seed_from_u64(7);
        for radius in [0.5, 1.0, 1.7, 2.5, 4.0] {
            let data = Array2::from_shape_fn((23, 17), |_| {
                if rng.gen_bool(0.04) {
                    1.0
                } else {
                    0.0
                }
            });
            let disk = Disk::new(radius);
            assert_eq!(binary_dilation(&data, &disk), brute_force(&data, &disk));
        }
    }
}
