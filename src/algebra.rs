//! Raster calculator primitives over aligned `f32` arrays.
//!
//! Every pixelwise operation follows calculator semantics: if any input pixel
//! is NaN the output pixel is NaN.

use itertools::Itertools;
use ndarray::Array2;
use rayon::prelude::*;

use crate::config::{Multipliers, Unmapped};
use crate::error::{PipelineError, Result};

pub fn indicator(condition: bool) -> f32 {
    if condition {
        1.0
    } else {
        0.0
    }
}

fn check_shapes(inputs: &[&Array2<f32>]) -> Result<(usize, usize)> {
    let Some(first) = inputs.first() else {
        return Err(PipelineError::Config("no input rasters".into()));
    };
    let shape = first.dim();
    for other in inputs.iter().skip(1) {
        let (rows, cols) = other.dim();
        if (rows, cols) != shape {
            return Err(PipelineError::GridMismatch(shape.0, shape.1, rows, cols));
        }
    }
    Ok(shape)
}

/// Applies `f` to the stacked pixel values of `N` aligned arrays.
pub fn combine<const N: usize, F>(inputs: [&Array2<f32>; N], f: F) -> Result<Array2<f32>>
where
    F: Fn([f32; N]) -> f32 + Sync,
{
    let shape = check_shapes(&inputs)?;
    let standard: Vec<_> = inputs.iter().map(|a| a.as_standard_layout()).collect();
    let slices = standard
        .iter()
        .map(|a| {
            a.as_slice()
                .ok_or_else(|| PipelineError::Config("non-contiguous raster".into()))
        })
        .collect::<Result<Vec<&[f32]>>>()?;

    let mut out = vec![0.0f32; shape.0 * shape.1];
    out.par_iter_mut().enumerate().for_each(|(i, value)| {
        let mut pixel = [0.0f32; N];
        for (slot, slice) in pixel.iter_mut().zip(&slices) {
            *slot = slice[i];
        }
        *value = if pixel.iter().any(|v| v.is_nan()) {
            f32::NAN
        } else {
            f(pixel)
        };
    });
    Ok(Array2::from_shape_vec(shape, out)?)
}

/// `Σ (layer == class)` over any number of layers.
pub fn count_equal(layers: &[&Array2<f32>], class: f32) -> Result<Array2<f32>> {
    let shape = check_shapes(layers)?;
    let mut sum = Array2::<f32>::zeros(shape);
    for layer in layers {
        sum.zip_mut_with(*layer, |acc, v| {
            *acc = if v.is_nan() || acc.is_nan() {
                f32::NAN
            } else {
                *acc + indicator(*v == class)
            };
        });
    }
    Ok(sum)
}

/// `Σ layer` over any number of layers.
pub fn sum(layers: &[&Array2<f32>]) -> Result<Array2<f32>> {
    let shape = check_shapes(layers)?;
    let mut total = Array2::<f32>::zeros(shape);
    for layer in layers {
        total.zip_mut_with(*layer, |acc, v| *acc += *v);
    }
    Ok(total)
}

/// Maps class values through a multiplier table and divides by `divisor`.
/// Returns the normalised array and the values the table could not score.
pub fn normalize(data: &Array2<f32>, table: &Multipliers, divisor: f64) -> (Array2<f32>, Unmapped) {
    let mut unmapped = Unmapped::default();
    let out = data.mapv(|v| match table.score(v, &mut unmapped) {
        Some(score) => (score / divisor) as f32,
        None => f32::NAN,
    });
    (out, unmapped)
}

/// Compact description of unmapped values for log lines.
pub fn describe_unmapped(unmapped: &Unmapped) -> String {
    const SHOWN: usize = 10;
    let classes = &unmapped.classes;
    let mut text = classes.iter().take(SHOWN).join(", ");
    if classes.len() > SHOWN {
        text = format!("{text}, … ({} values)", classes.len());
    }
    if unmapped.fractional > 0 {
        let fractional = format!("{} non-integral pixels", unmapped.fractional);
        text = if text.is_empty() {
            fractional
        } else {
            format!("{text}; {fractional}")
        };
    }
    text
}

/// `Σ_i (G_i = 1)·year_i·Π_{j>i}(G_j ≠ 1)`: the last listed year in which
/// the pixel is mangrove, or 0 when it never is.
pub fn latest_presence_year(layers: &[(i32, &Array2<f32>)]) -> Result<Array2<f32>> {
    let arrays: Vec<&Array2<f32>> = layers.iter().map(|(_, a)| *a).collect();
    let shape = check_shapes(&arrays)?;
    let mut out = Array2::<f32>::zeros(shape);
    for ((row, col), value) in out.indexed_iter_mut() {
        let mut year = 0.0;
        for (y, layer) in layers {
            let v = layer[[row, col]];
            if v.is_nan() {
                year = f32::NAN;
                break;
            }
            if v == 1.0 {
                year = *y as f32;
            }
        }
        *value = year;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_combine_propagates_nan() {
        let a = arr2(&[[1.0, f32::NAN], [3.0, 4.0]]);
        let b = arr2(&[[10.0, 20.0], [f32::NAN, 40.0]]);
        let out = combine([&a, &b], |[x, y]| x + y).unwrap();
        assert_eq!(out[[0, 0]], 11.0);
        assert!(out[[0, 1]].is_nan());
        assert!(out[[1, 0]].is_nan());
        assert_eq!(out[[1, 1]], 44.0);
    }

    #[test]
    fn test_combine_rejects_mismatched_shapes() {
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 3));
        assert!(matches!(
            combine([&a, &b], |[x, _]| x),
            Err(PipelineError::GridMismatch(2, 2, 2, 3))
        ));
    }

    #[test]
    fn test_count_equal() {
        let a = arr2(&[[1.0, 0.0, 1.0]]);
        let b = arr2(&[[1.0, 1.0, 0.0]]);
        let c = arr2(&[[1.0, 0.0, 0.0]]);
        assert_eq!(
            count_equal(&[&a, &b, &c], 1.0).unwrap(),
            arr2(&[[3.0, 1.0, 1.0]])
        );
    }

    #[test]
    fn test_normalize_divides_and_reports() {
        let table = Multipliers::new([(1, 50.0), (2, 89.0), (3, 100.0)]).unwrap();
        let data = arr2(&[[0.0, 1.0], [3.0, f32::NAN]]);
        let (out, unmapped) = normalize(&data, &table, 100.0);
        assert_eq!(out[[0, 0]], 0.0);
        assert_eq!(out[[0, 1]], 0.5);
        assert_eq!(out[[1, 0]], 1.0);
        assert!(out[[1, 1]].is_nan());
        assert_eq!(unmapped.classes.into_iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(unmapped.fractional, 0);
    }

    #[test]
    fn test_normalized_scores_stay_in_unit_range() {
        let table = Multipliers::new([(1, 0.0), (2, 100.0), (3, 42.0)]).unwrap();
        let data = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f32 - 3.0);
        let (out, _) = normalize(&data, &table, 100.0);
        assert!(out.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_latest_presence_year() {
        let g2010 = arr2(&[[1.0, 1.0, 0.0, 0.0]]);
        let g2015 = arr2(&[[0.0, 1.0, 1.0, 0.0]]);
        let g2020 = arr2(&[[0.0, 0.0, 0.0, 0.0]]);
        let exp =
            latest_presence_year(&[(2010, &g2010), (2015, &g2015), (2020, &g2020)]).unwrap();
        assert_eq!(exp, arr2(&[[2010.0, 2015.0, 2015.0, 0.0]]));
    }

    fn unmapped(classes: impl IntoIterator<Item = i64>, fractional: usize) -> Unmapped {
        Unmapped {
            classes: classes.into_iter().collect(),
            fractional,
        }
    }

    #[test]
    fn test_describe_unmapped_truncates() {
        assert_eq!(describe_unmapped(&unmapped([0, 4], 0)), "0, 4");
        assert!(describe_unmapped(&unmapped(0..25, 0)).ends_with("(25 values)"));
    }

    #[test]
    fn test_fractional_values_are_reported() {
        let table = Multipliers::new([(1, 50.0), (2, 100.0)]).unwrap();
        let data = arr2(&[[1.5, 1.0], [2.25, 2.0]]);
        let (out, missed) = normalize(&data, &table, 100.0);
        assert_eq!(out, arr2(&[[0.0, 0.5], [0.0, 1.0]]));
        assert!(!missed.is_empty());
        assert_eq!(missed.fractional, 2);
        assert_eq!(describe_unmapped(&missed), "2 non-integral pixels");
        assert_eq!(describe_unmapped(&unmapped([3], 1)), "3; 1 non-integral pixels");
    }
}
