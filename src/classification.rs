//! Top-K selection and label lookup for image classifiers.

use std::path::Path;

use tracing::debug;

use crate::error::Result;

/// Indices of the `k` highest scores, best first. Ties keep the lower index first.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    indices.truncate(k);
    indices
}

pub fn softmax(x: &[f32]) -> Vec<f32> {
    if x.is_empty() {
        return Vec::new();
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = x.iter().map(|v| (v - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|v| v / sum).collect()
}

/// Class names indexed by model output position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels {
    names: Vec<String>,
}

impl Labels {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Reads one label per line. Blank lines are kept so indices stay aligned.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let names: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
        debug!(path = %path.display(), count = names.len(), "loaded labels");
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: usize) -> String {
        match self.names.get(index) {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("class {}", index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassScore {
    pub index: usize,
    pub label: String,
    pub score: f32,
}

/// Softmax over raw model output followed by top-K with label lookup.
pub fn classify(logits: &[f32], k: usize, labels: &Labels) -> Vec<ClassScore> {
    let probs = softmax(logits);
    top_k(&probs, k)
        .into_iter()
        .map(|index| ClassScore {
            index,
            label: labels.name(index),
            score: probs[index],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_k_orders_descending() {
        let scores = [0.1, 0.7, 0.05, 0.9, 0.3];
        assert_eq!(top_k(&scores, 3), vec![3, 1, 4]);
    }

    #[test]
    fn test_top_k_ties_and_clamping() {
        let scores = [0.5, 0.5, 0.2];
        assert_eq!(top_k(&scores, 10), vec![0, 1, 2]);
        assert!(top_k(&[], 3).is_empty());
    }

    #[test]
    fn test_softmax() {
        let result = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = result.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result[2] > result[1] && result[1] > result[0]);
        assert!(softmax(&[]).is_empty());
    }

    #[test]
    fn test_labels_fall_back_to_index() {
        let labels = Labels::new(vec!["tench".into(), "".into()]);
        assert_eq!(labels.name(0), "tench");
        assert_eq!(labels.name(1), "class 1");
        assert_eq!(labels.name(7), "class 7");
    }

    #[test]
    fn test_labels_load_keeps_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.txt");
        std::fs::write(&path, "tench\ngoldfish\n\ngreat white shark\n").unwrap();

        let labels = Labels::load(&path).unwrap();
        assert_eq!(labels.len(), 4);
        assert_eq!(labels.name(3), "great white shark");
        assert_eq!(labels.name(2), "class 2");
    }

    #[test]
    fn test_classify_applies_softmax_and_labels() {
        let labels = Labels::new(vec!["cat".into(), "dog".into(), "fox".into()]);
        let result = classify(&[0.0, 5.0, 1.0], 2, &labels);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].label, "dog");
        assert_eq!(result[1].label, "fox");
        assert!(result[0].score > 0.9 && result[0].score <= 1.0);
    }
}
