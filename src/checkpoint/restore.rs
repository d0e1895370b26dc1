use burn::tensor::backend::Backend;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use super::{read_meta, CheckpointError, Checkpointable, ComponentSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub found: Vec<usize>,
}

/// Outcome of matching a model's components against a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub mismatched: Vec<ShapeMismatch>,
}

impl RestoreReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.missing.is_empty() {
            parts.push(format!("missing components: {}", self.missing.join(", ")));
        }
        if !self.unexpected.is_empty() {
            parts.push(format!("unexpected components: {}", self.unexpected.join(", ")));
        }
        for m in &self.mismatched {
            parts.push(format!(
                "shape mismatch for {}: checkpoint {:?}, model {:?}",
                m.name, m.found, m.expected
            ));
        }
        if parts.is_empty() {
            write!(f, "all {} components matched", self.loaded.len())
        } else {
            write!(f, "{}", parts.join("; "))
        }
    }
}

pub fn plan_restore(expected: &[ComponentSpec], saved: &[ComponentSpec]) -> RestoreReport {
    let mut report = RestoreReport::default();
    for spec in expected {
        match saved.iter().find(|s| s.name == spec.name) {
            None => report.missing.push(spec.name.clone()),
            Some(found) if found.shape != spec.shape => report.mismatched.push(ShapeMismatch {
                name: spec.name.clone(),
                expected: spec.shape.clone(),
                found: found.shape.clone(),
            }),
            Some(_) => report.loaded.push(spec.name.clone()),
        }
    }
    report.unexpected = saved
        .iter()
        .filter(|s| !expected.iter().any(|e| e.name == s.name))
        .map(|s| s.name.clone())
        .collect();
    report
}

/// Load every compatible component of the checkpoint at `dir` into `model`.
///
/// With `strict` any missing, unexpected or mismatched component fails the
/// restore before anything is loaded; otherwise those are logged and the
/// model keeps its own parameters for them.
pub fn restore_components<B: Backend, M: Checkpointable<B>>(
    model: M,
    dir: &Path,
    strict: bool,
    device: &B::Device,
) -> Result<(M, RestoreReport), CheckpointError> {
    let meta = read_meta(dir)?;
    let report = plan_restore(&model.component_specs(), &meta.components);

    if !report.is_clean() {
        if strict {
            return Err(CheckpointError::Mismatch {
                path: dir.to_path_buf(),
                details: report.to_string(),
            });
        }
        warn!("Non-strict restore from {:?}: {}", dir, report);
    }

    let mut model = model;
    for name in &report.loaded {
        model = model.load_component(name, dir, device)?;
    }
    info!(
        "Restored {} of {} components from {:?}",
        report.loaded.len(),
        meta.components.len(),
        dir
    );
    Ok((model, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_classifies_components() {
        let expected = vec![
            ComponentSpec::new("prompt_table", &[10, 32]),
            ComponentSpec::new("lm_head", &[32, 97]),
            ComponentSpec::new("task_embedding", &[3, 32]),
        ];
        let saved = vec![
            ComponentSpec::new("prompt_table", &[10, 32]),
            ComponentSpec::new("lm_head", &[32, 64]),
            ComponentSpec::new("old_adapter", &[4]),
        ];
        let report = plan_restore(&expected, &saved);
        assert_eq!(report.loaded, vec!["prompt_table"]);
        assert_eq!(report.missing, vec!["task_embedding"]);
        assert_eq!(report.unexpected, vec!["old_adapter"]);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.mismatched[0].found, vec![32, 64]);
        assert!(!report.is_clean());
        assert!(report.to_string().contains("lm_head"));
    }

    #[test]
    fn test_identical_specs_are_clean() {
        let specs = vec![ComponentSpec::new("a", &[1, 2])];
        let report = plan_restore(&specs, &specs);
        assert!(report.is_clean());
        assert_eq!(report.loaded, vec!["a"]);
    }
}
