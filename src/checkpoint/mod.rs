//! Checkpoint layout shared by model exports and trainer checkpoints.
//!
//! A checkpoint is a directory holding `meta.json` plus one burn record per
//! named model component (`<component>.mpk`). Trainer checkpoints also carry
//! `optimizer.mpk` and the loop progress in the metadata.

mod record;
mod restore;

pub use record::{
    list_checkpoints, load_component, load_record, load_state_dict, read_meta, remove_checkpoint,
    save_component, save_model, save_record, save_state_dict, META_FILE, OPTIMIZER_FILE,
};
pub use restore::{plan_restore, restore_components, RestoreReport, ShapeMismatch};

use burn::module::Module;
use burn::record::RecorderError;
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint not found: {0:?}")]
    NotFound(PathBuf),
    #[error("invalid checkpoint metadata {path:?}: {reason}")]
    Metadata { path: PathBuf, reason: String },
    #[error("failed to record '{name}' at {path:?}: {source}")]
    Record {
        name: String,
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("parameter '{param}' in {path:?} has shape {found:?}, model expects {expected:?}")]
    ParamShape {
        path: PathBuf,
        param: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("strict restore from {path:?} failed: {details}")]
    Mismatch { path: PathBuf, details: String },
    #[error("checkpoint I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A named group of parameters and the shape it was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ComponentSpec {
    pub fn new(name: &str, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
        }
    }
}

/// Loop position stored in trainer checkpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingProgress {
    /// Epochs fully completed.
    pub epoch: usize,
    pub global_step: usize,
    #[serde(default)]
    pub callbacks: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model_config: Value,
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub progress: Option<TrainingProgress>,
    pub timestamp: u64,
}

/// Models whose parameters are saved and restored component by component.
pub trait Checkpointable<B: Backend>: Module<B> + Sized {
    /// Hyperparameters the model was built with, stored alongside the weights.
    fn model_config(&self) -> Value;

    fn component_specs(&self) -> Vec<ComponentSpec>;

    fn save_component(&self, name: &str, dir: &Path) -> Result<(), CheckpointError>;

    fn load_component(self, name: &str, dir: &Path, device: &B::Device) -> Result<Self, CheckpointError>;
}
