//! Run directories, checkpoint callback and metrics file for a trainer.

use burn::tensor::backend::AutodiffBackend;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{ConfigError, ConfigTree};
use crate::trainer::{Callback, CheckpointParams, ModelCheckpoint, Trainer};

#[derive(Debug, Error)]
pub enum ExpManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create run directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("resume_if_exists is set but no '*-last' checkpoint exists in {0:?}")]
    NoCheckpoint(PathBuf),
    #[error(
        "the trainer already has a ModelCheckpoint callback; set trainer.enable_checkpointing=false \
         or exp_manager.create_checkpoint_callback=false"
    )]
    DuplicateCheckpointCallback,
}

/// The `exp_manager` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpManagerConfig {
    pub exp_dir: Option<PathBuf>,
    pub name: String,
    pub version: Option<String>,
    pub use_datetime_version: bool,
    pub create_checkpoint_callback: bool,
    pub checkpoint_callback_params: CheckpointParams,
    pub resume_if_exists: bool,
    pub resume_ignore_no_checkpoint: bool,
    pub log_metrics: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ExpManagerConfig {
    fn default() -> Self {
        Self {
            exp_dir: None,
            name: "default".to_string(),
            version: None,
            use_datetime_version: true,
            create_checkpoint_callback: true,
            checkpoint_callback_params: CheckpointParams::default(),
            resume_if_exists: false,
            resume_ignore_no_checkpoint: false,
            log_metrics: true,
            extra: Map::new(),
        }
    }
}

impl ExpManagerConfig {
    /// `<exp_dir>/<name>[/<version>]`. Resumable runs get no datetime
    /// version so a restart lands in the same directory.
    pub fn log_dir(&self) -> PathBuf {
        let base = self
            .exp_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("experiments"))
            .join(&self.name);
        let version = match &self.version {
            Some(version) if !version.is_empty() => Some(version.clone()),
            _ if self.use_datetime_version && !self.resume_if_exists => {
                Some(Local::now().format("%Y-%m-%d_%H-%M-%S").to_string())
            }
            _ => None,
        };
        match version {
            Some(version) => base.join(version),
            None => base,
        }
    }
}

/// Hook run once between trainer construction and model construction.
pub trait ExperimentManager<B: AutodiffBackend> {
    /// `cfg` is the `exp_manager` section; `None` means all defaults.
    fn configure(&mut self, trainer: &mut Trainer<B>, cfg: Option<&ConfigTree>) -> Result<Option<PathBuf>, ExpManagerError>;
}

/// Directory layout, checkpointing and metrics for a run.
#[derive(Debug, Clone, Default)]
pub struct ExpManager;

fn find_last_checkpoint(dir: &Path) -> Option<PathBuf> {
    let last: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_str().is_some_and(|n| n.ends_with("-last")))
        .map(|e| e.into_path())
        .collect();
    if last.len() > 1 {
        warn!("Several '-last' checkpoints in {:?}, using {:?}", dir, last[0]);
    }
    last.into_iter().next()
}

impl<B: AutodiffBackend> ExperimentManager<B> for ExpManager {
    fn configure(&mut self, trainer: &mut Trainer<B>, cfg: Option<&ConfigTree>) -> Result<Option<PathBuf>, ExpManagerError> {
        let config: ExpManagerConfig = match cfg {
            Some(cfg) => cfg.section("")?,
            None => ExpManagerConfig::default(),
        };
        if !config.extra.is_empty() {
            let keys: Vec<&str> = config.extra.keys().map(String::as_str).collect();
            warn!("exp_manager options not supported here and ignored: {}", keys.join(", "));
        }

        let log_dir = config.log_dir();
        let checkpoint_dir = log_dir.join("checkpoints");

        if config.resume_if_exists {
            match find_last_checkpoint(&checkpoint_dir) {
                Some(last) => {
                    info!("Resuming training from checkpoint {:?}", last);
                    trainer.set_resume_from(last);
                }
                None if config.resume_ignore_no_checkpoint => {
                    warn!("No checkpoint found in {:?}, training from scratch", checkpoint_dir);
                }
                None => return Err(ExpManagerError::NoCheckpoint(checkpoint_dir)),
            }
        }

        if config.create_checkpoint_callback {
            if trainer.checkpoint_callback().is_some() {
                return Err(ExpManagerError::DuplicateCheckpointCallback);
            }
            trainer.add_callback(Callback::ModelCheckpoint(ModelCheckpoint::new(
                checkpoint_dir,
                &config.name,
                config.checkpoint_callback_params.clone(),
            )));
        }

        if trainer.is_global_zero() {
            fs::create_dir_all(&log_dir).map_err(|source| ExpManagerError::Io {
                path: log_dir.clone(),
                source,
            })?;
        }
        if config.log_metrics {
            trainer.set_metrics_path(log_dir.join("metrics.jsonl"));
        }
        trainer.set_log_dir(log_dir.clone());

        info!("Experiments will be logged at {:?}", log_dir);
        Ok(Some(log_dir))
    }
}
