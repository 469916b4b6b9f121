//! Random forest classification of the sampled history classes.
//!
//! The sampled table is split 70/30 within each class, a forest is fitted
//! on the training rows and scored on the rest. Feature importances are
//! the drop in test accuracy when one column is shuffled.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use itertools::{izip, Itertools};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use smartcore::ensemble::random_forest_classifier::{
    RandomForestClassifier, RandomForestClassifierParameters,
};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::error::{PipelineError, Result};
use crate::sample::FeatureTable;

pub const TREES: u16 = 200;
pub const TEST_FRACTION: f64 = 0.3;

type Forest = RandomForestClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// Scores of a forest on the held-out rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Labels present in the test truth or predictions, ascending.
    pub classes: Vec<i32>,
    /// `confusion[truth][predicted]`, indexed like `classes`.
    pub confusion: Vec<Vec<usize>>,
    /// Feature name and importance, most important first.
    pub importances: Vec<(String, f64)>,
}

/// Train and test row indices. Every class contributes
/// `round(len * test_fraction)` rows to the test set; the draw depends
/// only on `seed`.
pub fn stratified_split(labels: &[i32], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let (mut train, mut test) = (Vec::new(), Vec::new());
    for class in labels.iter().copied().sorted().dedup() {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        let n_test = (members.len() as f64 * test_fraction).round() as usize;
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

pub fn confusion_matrix(classes: &[i32], truth: &[i32], predicted: &[i32]) -> Vec<Vec<usize>> {
    let mut matrix = vec![vec![0; classes.len()]; classes.len()];
    for (t, p) in izip!(truth, predicted) {
        if let (Some(i), Some(j)) = (
            classes.iter().position(|c| c == t),
            classes.iter().position(|c| c == p),
        ) {
            matrix[i][j] += 1;
        }
    }
    matrix
}

fn accuracy(truth: &[i32], predicted: &[i32]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = izip!(truth, predicted).filter(|(t, p)| t == p).count();
    hits as f64 / truth.len() as f64
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl Evaluation {
    pub fn support(&self) -> usize {
        self.confusion.iter().flatten().sum()
    }

    pub fn accuracy(&self) -> f64 {
        let hits: usize = (0..self.classes.len()).map(|i| self.confusion[i][i]).sum();
        ratio(hits, self.support())
    }

    /// Precision, recall, f1 and support of class `i`.
    fn class_scores(&self, i: usize) -> (f64, f64, f64, usize) {
        let hits = self.confusion[i][i];
        let support: usize = self.confusion[i].iter().sum();
        let predicted: usize = self.confusion.iter().map(|row| row[i]).sum();
        let precision = ratio(hits, predicted);
        let recall = ratio(hits, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        (precision, recall, f1, support)
    }

    /// Rows like `[[12  0]\n [ 1  9]]`.
    pub fn confusion_text(&self) -> String {
        let width = self
            .confusion
            .iter()
            .flatten()
            .map(|v| v.to_string().len())
            .max()
            .unwrap_or(1);
        let rows: Vec<String> = self
            .confusion
            .iter()
            .map(|row| format!("[{}]", row.iter().map(|v| format!("{v:>width$}")).join(" ")))
            .collect();
        format!("[{}]", rows.join("\n "))
    }

    /// Per-class precision, recall and f1 followed by accuracy, macro and
    /// weighted averages.
    pub fn report_text(&self) -> String {
        let mut out = format!(
            "{:>12} {:>9} {:>9} {:>9} {:>9}\n\n",
            "", "precision", "recall", "f1-score", "support"
        );
        let scores: Vec<_> = (0..self.classes.len()).map(|i| self.class_scores(i)).collect();
        for (class, (p, r, f, n)) in izip!(&self.classes, &scores) {
            let _ = writeln!(out, "{class:>12} {p:>9.2} {r:>9.2} {f:>9.2} {n:>9}");
        }
        let total = self.support();
        let _ = writeln!(
            out,
            "\n{:>12} {:>9} {:>9} {:>9.2} {total:>9}",
            "accuracy",
            "",
            "",
            self.accuracy()
        );
        let k = scores.len().max(1) as f64;
        let macro_avg = scores
            .iter()
            .fold((0.0, 0.0, 0.0), |acc, s| (acc.0 + s.0, acc.1 + s.1, acc.2 + s.2));
        let _ = writeln!(
            out,
            "{:>12} {:>9.2} {:>9.2} {:>9.2} {total:>9}",
            "macro avg",
            macro_avg.0 / k,
            macro_avg.1 / k,
            macro_avg.2 / k
        );
        let weight = |s: &(f64, f64, f64, usize)| s.3 as f64 / total.max(1) as f64;
        let weighted = scores.iter().fold((0.0, 0.0, 0.0), |acc, s| {
            let w = weight(s);
            (acc.0 + w * s.0, acc.1 + w * s.1, acc.2 + w * s.2)
        });
        let _ = writeln!(
            out,
            "{:>12} {:>9.2} {:>9.2} {:>9.2} {total:>9}",
            "weighted avg", weighted.0, weighted.1, weighted.2
        );
        out
    }

    pub fn importance_text(&self) -> String {
        let width = self.importances.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        self.importances
            .iter()
            .map(|(name, value)| format!("{name:<width$}    {value:.6}"))
            .join("\n")
    }
}

fn model_error(err: impl std::fmt::Display) -> PipelineError {
    PipelineError::Model(err.to_string())
}

fn matrix(rows: &[Vec<f64>]) -> DenseMatrix<f64> {
    DenseMatrix::from_2d_vec(&rows.to_vec())
}

fn predict(forest: &Forest, rows: &[Vec<f64>]) -> Result<Vec<i32>> {
    forest.predict(&matrix(rows)).map_err(model_error)
}

/// Fits a forest of `trees` trees on 70% of `table` and scores it on the
/// other 30%.
pub fn fit_forest(table: &FeatureTable, class_column: &str, trees: u16, seed: u64) -> Result<Evaluation> {
    let class_idx = table
        .column_index(class_column)
        .ok_or_else(|| PipelineError::Config(format!("no {class_column} column")))?;
    let labels: Vec<i32> = table.rows.iter().map(|r| r[class_idx] as i32).collect();
    let features: Vec<Vec<f64>> = table
        .rows
        .iter()
        .map(|r| {
            r.iter()
                .enumerate()
                .filter(|&(i, _)| i != class_idx)
                .map(|(_, v)| *v)
                .collect()
        })
        .collect();
    let names: Vec<String> = table
        .columns
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != class_idx)
        .map(|(_, c)| c.clone())
        .collect();

    let (train, test) = stratified_split(&labels, TEST_FRACTION, seed);
    if train.is_empty() || test.is_empty() || names.is_empty() {
        return Err(PipelineError::Model(format!(
            "{} training and {} test rows over {} features",
            train.len(),
            test.len(),
            names.len()
        )));
    }
    let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<i32>) {
        (
            idx.iter().map(|&i| features[i].clone()).collect(),
            idx.iter().map(|&i| labels[i]).collect(),
        )
    };
    let (x_train, y_train) = pick(&train);
    let (x_test, y_test) = pick(&test);
    info!("Fitting {trees} trees on {} rows, testing on {}", train.len(), test.len());

    let parameters = RandomForestClassifierParameters::default()
        .with_n_trees(trees)
        .with_seed(seed);
    let forest: Forest =
        RandomForestClassifier::fit(&matrix(&x_train), &y_train, parameters).map_err(model_error)?;
    let y_pred = predict(&forest, &x_test)?;
    let baseline = accuracy(&y_test, &y_pred);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut importances = Vec::with_capacity(names.len());
    for (j, name) in names.iter().enumerate() {
        let mut column: Vec<f64> = x_test.iter().map(|r| r[j]).collect();
        column.shuffle(&mut rng);
        let shuffled: Vec<Vec<f64>> = izip!(&x_test, &column)
            .map(|(row, v)| {
                let mut row = row.clone();
                row[j] = *v;
                row
            })
            .collect();
        let drop = baseline - accuracy(&y_test, &predict(&forest, &shuffled)?);
        importances.push((name.clone(), drop));
    }
    importances.sort_by(|a, b| b.1.total_cmp(&a.1));

    let classes: Vec<i32> = y_test.iter().chain(&y_pred).copied().sorted().dedup().collect();
    let confusion = confusion_matrix(&classes, &y_test, &y_pred);
    Ok(Evaluation {
        classes,
        confusion,
        importances,
    })
}

pub fn write_results(path: &Path, evaluation: &Evaluation) -> Result<()> {
    let text = format!(
        "Confusion Matrix:\n{}\n\nClassification Report:\n{}\n\nFeature Importances:\n{}\n",
        evaluation.confusion_text(),
        evaluation.report_text(),
        evaluation.importance_text()
    );
    fs::write(path, text)?;
    info!("Saved: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Three classes told apart by `SEE` alone; `ELE` repeats across them.
    fn separable() -> FeatureTable {
        let mut rows = Vec::new();
        for class in 0..3 {
            for i in 0..30 {
                let see = f64::from(class) * 10.0 + f64::from(i % 5) * 0.1;
                rows.push(vec![f64::from(i), see, f64::from(class)]);
            }
        }
        FeatureTable {
            columns: vec!["ELE".into(), "SEE".into(), "HIS_REC".into()],
            rows,
        }
    }

    #[test]
    fn test_stratified_split_keeps_class_shares() {
        let labels: Vec<i32> = [vec![0; 10], vec![1; 20]].concat();
        let (train, test) = stratified_split(&labels, 0.3, 42);
        assert_eq!(train.len() + test.len(), 30);
        assert_eq!(test.iter().filter(|&&i| labels[i] == 0).count(), 3);
        assert_eq!(test.iter().filter(|&&i| labels[i] == 1).count(), 6);
        assert!(train.iter().all(|i| !test.contains(i)));
        assert_eq!(stratified_split(&labels, 0.3, 42), (train, test));
    }

    #[test]
    fn test_confusion_matrix_and_report() {
        let evaluation = Evaluation {
            classes: vec![0, 1],
            confusion: confusion_matrix(&[0, 1], &[0, 0, 1, 1], &[0, 1, 1, 1]),
            importances: vec![("SEE".into(), 0.5), ("ELE".into(), 0.0)],
        };
        assert_eq!(evaluation.confusion, vec![vec![1, 1], vec![0, 2]]);
        assert_eq!(evaluation.confusion_text(), "[[1 1]\n [0 2]]");
        assert_eq!(evaluation.accuracy(), 0.75);
        let report = evaluation.report_text();
        assert!(report.contains("precision"));
        assert!(report.contains("accuracy"));
        assert!(report.contains("weighted avg"));
        assert!(evaluation.importance_text().starts_with("SEE    0.500000"));
    }

    #[test]
    fn test_forest_beats_chance_on_separable_classes() {
        let evaluation = fit_forest(&separable(), "HIS_REC", 20, 42).unwrap();
        assert_eq!(evaluation.classes, vec![0, 1, 2]);
        assert_eq!(evaluation.support(), 27);
        assert!(evaluation.accuracy() > 1.0 / 3.0);
        assert_eq!(evaluation.importances[0].0, "SEE");
    }

    #[test]
    fn test_results_file_sections() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("model_results.txt");
        let evaluation = fit_forest(&separable(), "HIS_REC", 10, 7).unwrap();
        write_results(&path, &evaluation).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Confusion Matrix:\n[["));
        assert!(text.contains("\n\nClassification Report:\n"));
        assert!(text.contains("\n\nFeature Importances:\n"));
    }

    #[test]
    fn test_missing_class_column_is_an_error() {
        assert!(fit_forest(&separable(), "NOPE", 5, 42).is_err());
    }
}
