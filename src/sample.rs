//! Pixel sampling for exploring how historical mangrove presence relates
//! to the other layers of a tile.
//!
//! Every feature raster of one tile is stacked into a table with one row
//! per pixel. Rows are labelled with a history class and an equal number
//! of rows is drawn from each class.

use std::fs;
use std::path::{Path, PathBuf};

use itertools::{izip, Itertools};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PipelineError, Result};
use crate::model;
use crate::raster::read_layer;
use crate::record::write_table;
use crate::tile::TileId;

pub const CLASS_COLUMN: &str = "HIS_REC";

/// Pixel values by column; nodata is stored as 0.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl FeatureTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    fn column_or_zero(&self, row: &[f64], name: &str) -> f64 {
        self.column_index(name).map(|i| row[i]).unwrap_or(0.0)
    }

    pub fn drop_columns(&mut self, names: &[&str]) {
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&i| !names.contains(&self.columns[i].as_str()))
            .collect();
        self.columns = keep.iter().map(|&i| self.columns[i].clone()).collect();
        for row in &mut self.rows {
            *row = keep.iter().map(|&i| row[i]).collect();
        }
    }

    pub fn column(&self, index: usize) -> Vec<f64> {
        self.rows.iter().map(|r| r[index]).collect()
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect();
        write_table(path, &self.columns, &rows)
    }
}

/// Feature rasters of `tile` in `folder`, named by their three-letter
/// prefix. Yearly GMW extents are skipped and `R25` is kept for 2020 only.
pub fn feature_rasters(folder: &Path, tile: &TileId) -> Result<Vec<(String, PathBuf)>> {
    let tile = tile.to_string();
    let mut rasters = Vec::new();
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.to_lowercase().ends_with(".tif") {
            continue;
        }
        let parts: Vec<&str> = name.split('_').collect();
        if parts.len() < 2 || name.starts_with("GMW") {
            continue;
        }
        let second = parts[1].trim_end_matches(".tif");
        if second != tile {
            continue;
        }
        if name.starts_with("R25") && !name.ends_with("_2020.tif") {
            continue;
        }
        rasters.push((name.chars().take(3).collect::<String>(), path));
    }
    rasters.sort();
    Ok(rasters)
}

/// One row per pixel, one column per raster.
pub fn stack(rasters: &[(String, PathBuf)]) -> Result<FeatureTable> {
    let mut columns = Vec::with_capacity(rasters.len());
    let mut values: Vec<Vec<f32>> = Vec::with_capacity(rasters.len());
    for (name, path) in rasters {
        let layer = read_layer(path)?;
        if let Some(first) = values.first() {
            if first.len() != layer.data.len() {
                let (rows, cols) = layer.grid.shape();
                return Err(PipelineError::GridMismatch(first.len(), 1, rows, cols));
            }
        }
        columns.push(name.clone());
        values.push(layer.data.iter().copied().collect());
    }
    let pixels = values.first().map_or(0, Vec::len);
    let rows = (0..pixels)
        .map(|i| {
            values
                .iter()
                .map(|column| {
                    let v = column[i];
                    if v.is_nan() {
                        0.0
                    } else {
                        f64::from(v)
                    }
                })
                .collect()
        })
        .collect();
    Ok(FeatureTable { columns, rows })
}

/// `1` when the pixel's last mangrove year is 2019 or earlier.
pub fn history_class(his: f64) -> f64 {
    if his > 0.0 && his <= 2019.0 {
        1.0
    } else {
        0.0
    }
}

/// `2` when the pixel recruited mangroves in 2007 or later.
pub fn recruitment_class(rec: f64) -> f64 {
    if rec >= 2007.0 {
        2.0
    } else {
        0.0
    }
}

/// Drops empty pixels and replaces `HIS`, `REC` and `ACC` with the
/// `HIS_REC` class column.
pub fn label_history(mut table: FeatureTable) -> FeatureTable {
    let signal: Vec<usize> = (0..table.columns.len())
        .filter(|&i| table.columns[i] != "GTS")
        .collect();
    let rows = std::mem::take(&mut table.rows);
    let mut kept = Vec::with_capacity(rows.len());
    for mut row in rows {
        let total: f64 = signal.iter().map(|&i| row[i]).sum();
        if total == 0.0 {
            continue;
        }
        let his = table.column_or_zero(&row, "HIS");
        let rec = table.column_or_zero(&row, "REC");
        if his == 0.0 && rec == 0.0 {
            continue;
        }
        row.push(history_class(his) + recruitment_class(rec));
        kept.push(row);
    }
    table.rows = kept;
    table.columns.push(CLASS_COLUMN.to_string());
    table.drop_columns(&["R25", "ACC", "HIS", "REC"]);
    table
}

/// Up to `per_class` random rows of every class, classes in ascending
/// order. The same seed always draws the same rows.
pub fn stratified_sample(table: &FeatureTable, class_column: &str, per_class: usize, seed: u64) -> Result<FeatureTable> {
    let class_idx = table
        .column_index(class_column)
        .ok_or_else(|| PipelineError::Config(format!("no {class_column} column")))?;
    let classes: Vec<i64> = table
        .rows
        .iter()
        .map(|r| r[class_idx] as i64)
        .sorted()
        .dedup()
        .collect();
    let mut rows = Vec::new();
    for class in classes {
        let members: Vec<&Vec<f64>> = table
            .rows
            .iter()
            .filter(|r| r[class_idx] as i64 == class)
            .collect();
        if members.len() < per_class {
            warn!(
                "Class {class} has {} rows, fewer than {per_class}; keeping all",
                members.len()
            );
        }
        let mut rng = StdRng::seed_from_u64(seed);
        rows.extend(
            members
                .choose_multiple(&mut rng, per_class)
                .map(|r| (*r).clone()),
        );
    }
    Ok(FeatureTable {
        columns: table.columns.clone(),
        rows,
    })
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    if a.len() < 2 {
        return f64::NAN;
    }
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in izip!(a, b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return f64::NAN;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Pearson correlation of every pair of columns; NaN for constant columns.
pub fn correlation_matrix(table: &FeatureTable) -> Vec<Vec<f64>> {
    let columns: Vec<Vec<f64>> = (0..table.columns.len()).map(|i| table.column(i)).collect();
    columns
        .iter()
        .map(|a| columns.iter().map(|b| pearson(a, b)).collect())
        .collect()
}

fn write_correlation(path: &Path, table: &FeatureTable, matrix: &[Vec<f64>]) -> Result<()> {
    let header: Vec<String> = std::iter::once(String::new())
        .chain(table.columns.iter().cloned())
        .collect();
    let rows: Vec<Vec<String>> = izip!(&table.columns, matrix)
        .map(|(name, values)| {
            std::iter::once(name.clone())
                .chain(values.iter().map(|v| {
                    if v.is_nan() {
                        String::new()
                    } else {
                        v.to_string()
                    }
                }))
                .collect()
        })
        .collect();
    write_table(path, &header, &rows)
}

/// Samples one tile of `folder` into `folder/Results_<tile>/`, fits a
/// random forest of `trees` trees on the sample and returns that directory.
pub fn run(folder: &Path, tile: &TileId, per_class: usize, trees: u16, seed: u64) -> Result<PathBuf> {
    let results = folder.join(format!("Results_{tile}"));
    fs::create_dir_all(&results)?;
    let rasters = feature_rasters(folder, tile)?;
    info!("Found {} raster(s)", rasters.len());
    if rasters.is_empty() {
        return Err(PipelineError::EmptyInput(folder.to_path_buf()));
    }
    let table = label_history(stack(&rasters)?);
    info!("{} labelled pixels", table.rows.len());
    let sampled = stratified_sample(&table, CLASS_COLUMN, per_class, seed)?;
    sampled.write(&results.join("df_sampled.csv"))?;
    let matrix = correlation_matrix(&sampled);
    write_correlation(&results.join("correlation_matrix.csv"), &sampled, &matrix)?;
    let evaluation = model::fit_forest(&sampled, CLASS_COLUMN, trees, seed)?;
    info!("Test accuracy {:.3}", evaluation.accuracy());
    model::write_results(&results.join("model_results.txt"), &evaluation)?;
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table(columns: &[&str], rows: Vec<Vec<f64>>) -> FeatureTable {
        FeatureTable {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn test_label_history() {
        let t = table(
            &["ACC", "GTS", "HIS", "REC", "SEE"],
            vec![
                vec![0.0, 1.5, 0.0, 0.0, 0.0],
                vec![1.0, 1.5, 0.0, 0.0, 0.3],
                vec![1.0, 1.5, 2010.0, 0.0, 0.3],
                vec![1.0, 1.5, 0.0, 2016.0, 0.3],
                vec![1.0, 1.5, 2016.0, 2020.0, 0.3],
            ],
        );
        let labelled = label_history(t);
        assert_eq!(labelled.columns, vec!["GTS", "SEE", CLASS_COLUMN]);
        let classes: Vec<f64> = labelled.rows.iter().map(|r| r[2]).collect();
        assert_eq!(classes, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_stratified_sample_is_seeded_and_balanced() {
        let rows: Vec<Vec<f64>> = (0..30)
            .map(|i| vec![i as f64, (i % 3) as f64])
            .collect();
        let t = table(&["SEE", CLASS_COLUMN], rows);
        let a = stratified_sample(&t, CLASS_COLUMN, 4, 42).unwrap();
        let b = stratified_sample(&t, CLASS_COLUMN, 4, 42).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.rows.len(), 12);
        for class in 0..3 {
            let n = a.rows.iter().filter(|r| r[1] == class as f64).count();
            assert_eq!(n, 4);
        }
    }

    #[test]
    fn test_small_class_keeps_every_row() {
        let t = table(&["SEE", CLASS_COLUMN], vec![vec![0.1, 0.0], vec![0.2, 1.0]]);
        let s = stratified_sample(&t, CLASS_COLUMN, 5, 1).unwrap();
        assert_eq!(s.rows.len(), 2);
    }

    #[test]
    fn test_correlation() {
        let t = table(
            &["A", "B", "C"],
            vec![vec![1.0, 2.0, 5.0], vec![2.0, 4.0, 5.0], vec![3.0, 6.0, 5.0]],
        );
        let m = correlation_matrix(&t);
        assert_relative_eq!(m[0][1], 1.0, epsilon = 1e-12);
        assert_relative_eq!(m[0][0], 1.0, epsilon = 1e-12);
        assert!(m[0][2].is_nan());
    }
}
