//! Classification labels and top-k ranking of prediction vectors.

use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// Number of labels joined into the summary string.
pub const SUMMARY_TOP_K: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub index: usize,
    pub label: String,
    pub probability: f32,
}

/// Read one label per line, trimming whitespace. Blank lines are kept so
/// line numbers stay aligned with class indices.
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text.lines().map(|line| line.trim().to_string()).collect())
}

/// Rank `predictions` and return the `k` most probable classes, highest
/// first. Ties keep the lower class index first.
pub fn top_k(predictions: &[f32], labels: &[String], k: usize) -> Result<Vec<Classification>> {
    if predictions.is_empty() {
        return Err(Error::EmptyPredictions);
    }
    if labels.len() < predictions.len() {
        return Err(Error::LabelCount {
            labels: labels.len(),
            predictions: predictions.len(),
        });
    }

    let mut ranked: Vec<usize> = (0..predictions.len()).collect();
    ranked.sort_by(|&a, &b| predictions[b].total_cmp(&predictions[a]));

    Ok(ranked
        .into_iter()
        .take(k)
        .map(|index| Classification {
            index,
            label: labels[index].clone(),
            probability: predictions[index],
        })
        .collect())
}

/// Top-5 labels joined by `|`, most probable first.
pub fn format_top_labels(predictions: &[f32], labels: &[String]) -> Result<String> {
    let top = top_k(predictions, labels, SUMMARY_TOP_K)?;
    Ok(top
        .iter()
        .map(|c| c.label.as_str())
        .collect::<Vec<_>>()
        .join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ranks_highest_first() {
        let preds = [0.1, 0.7, 0.05, 0.15];
        let top = top_k(&preds, &labels(&["a", "b", "c", "d"]), 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].index, 1);
        assert_eq!(top[0].label, "b");
        assert_eq!(top[1].index, 3);
    }

    #[test]
    fn ties_keep_class_order() {
        let preds = [0.5, 0.5, 0.5];
        let top = top_k(&preds, &labels(&["x", "y", "z"]), 3).unwrap();
        let order: Vec<usize> = top.iter().map(|c| c.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn summary_joins_top_five() {
        let preds = [0.0, 0.6, 0.1, 0.05, 0.2, 0.03, 0.02];
        let names = labels(&["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(format_top_labels(&preds, &names).unwrap(), "b|e|c|d|f");
    }

    #[test]
    fn summary_with_fewer_than_five_classes() {
        let names = labels(&["cat", "dog"]);
        assert_eq!(format_top_labels(&[0.2, 0.8], &names).unwrap(), "dog|cat");
    }

    #[test]
    fn empty_predictions_are_an_error() {
        let err = top_k(&[], &labels(&["a"]), 5).unwrap_err();
        assert!(matches!(err, Error::EmptyPredictions));
        assert_eq!(err.to_string(), "empty predictions");
    }

    #[test]
    fn short_label_file_is_an_error() {
        let err = top_k(&[0.1, 0.2, 0.3], &labels(&["a"]), 1).unwrap_err();
        assert!(matches!(
            err,
            Error::LabelCount {
                labels: 1,
                predictions: 3
            }
        ));
    }

    #[test]
    fn load_labels_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "background\n  tench \n\ngoldfish\n").unwrap();

        let loaded = load_labels(&path).unwrap();
        assert_eq!(loaded, labels(&["background", "tench", "", "goldfish"]));
    }

    #[test]
    fn load_labels_missing_file() {
        let err = load_labels(Path::new("/nonexistent/labels.txt")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
