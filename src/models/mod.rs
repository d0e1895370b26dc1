//! Trainable models and the choice of how to construct them.

pub mod diarize;
pub mod prompt_learning;

pub use diarize::{DeepDiarizeModel, DiarizeModelConfig};
pub use prompt_learning::{CharLanguageModel, PromptModelConfig, UniversalPromptModel};

use anyhow::{bail, Context, Result};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::checkpoint::{load_state_dict, restore_components, Checkpointable};
use crate::config::{ConfigError, ConfigTree};
use crate::data::DataLoader;
use crate::trainer::Trainer;

/// `model.optim`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub name: String,
    pub lr: f64,
    pub weight_decay: f32,
    pub betas: [f32; 2],
    pub eps: f32,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            name: "adam".to_string(),
            lr: 1e-3,
            weight_decay: 0.0,
            betas: [0.9, 0.999],
            eps: 1e-8,
        }
    }
}

impl OptimConfig {
    /// Adam settings with the trainer's gradient clipping applied.
    pub fn adam(&self, gradient_clip_val: Option<f32>) -> Result<AdamConfig> {
        match self.name.as_str() {
            "adam" | "fused_adam" => {}
            other => bail!("unsupported optimizer '{}', expected 'adam' or 'fused_adam'", other),
        }
        let mut config = AdamConfig::new()
            .with_beta_1(self.betas[0])
            .with_beta_2(self.betas[1])
            .with_epsilon(self.eps);
        if self.weight_decay > 0.0 {
            config = config.with_weight_decay(Some(WeightDecayConfig::new(self.weight_decay)));
        }
        if let Some(clip) = gradient_clip_val.filter(|v| *v > 0.0) {
            config = config.with_grad_clipping(Some(GradientClippingConfig::Norm(clip)));
        }
        Ok(config)
    }
}

/// A model the trainer can fit: it builds its own data loaders and computes
/// its losses.
pub trait TrainableModel<B: AutodiffBackend>: AutodiffModule<B> + Checkpointable<B> + 'static {
    type Batch: 'static;

    /// Build a model with fresh parameters from the `model` config section.
    fn from_config(cfg: &ConfigTree, trainer: &Trainer<B>) -> Result<Self>;

    fn train_dataloader(&self, device: &B::Device) -> Result<Box<dyn DataLoader<Self::Batch>>>;

    fn val_dataloader(&self, device: &B::Device) -> Result<Option<Box<dyn DataLoader<Self::Batch>>>>;

    /// Loss of one training batch, ready for `backward`.
    fn training_step(&self, batch: Self::Batch) -> Tensor<B, 1>;

    fn validation_step(&self, batch: Self::Batch) -> f32;

    fn optim_config(&self) -> &OptimConfig;

    /// Called once parameters are final, right before the first step.
    fn on_fit_start(self) -> Self {
        self
    }
}

/// Parameters from a checkpoint directory, hyperparameters from `override_cfg`.
pub fn restore_from<B, M>(path: &Path, override_cfg: &ConfigTree, strict: bool, trainer: &Trainer<B>) -> Result<M>
where
    B: AutodiffBackend,
    M: TrainableModel<B>,
{
    let model = M::from_config(override_cfg, trainer)?;
    let (model, report) = restore_components(model, path, strict, trainer.device())
        .with_context(|| format!("Failed to restore model from {:?}", path))?;
    info!("Restored model from {:?} ({})", path, report);
    Ok(model)
}

/// How the run obtains its model; decided once from config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelInit {
    Fresh,
    /// Checkpoint restore with the current run's hyperparameters.
    Restore { path: PathBuf, strict: bool },
    /// Fresh model with a whole-model weight file merged in.
    PretrainedWeights { path: PathBuf },
}

impl ModelInit {
    /// `model.restore_path` selects a non-strict restore.
    pub fn for_prompt_learning(cfg: &ConfigTree) -> Self {
        match cfg.get_str("model.restore_path").filter(|p| !p.is_empty()) {
            Some(path) => Self::Restore {
                path: PathBuf::from(path),
                strict: false,
            },
            None => Self::Fresh,
        }
    }

    /// `model.pretrained_weights` selects a weight merge. Setting it together
    /// with `model.restore_path` is ambiguous and rejected.
    pub fn for_diarization(cfg: &ConfigTree) -> Result<Self, ConfigError> {
        let weights = cfg.get_str("model.pretrained_weights").filter(|p| !p.is_empty());
        let restore = cfg.get_str("model.restore_path").filter(|p| !p.is_empty());
        match (weights, restore) {
            (Some(_), Some(_)) => Err(ConfigError::Conflict(
                "model.pretrained_weights and model.restore_path are both set; choose one".to_string(),
            )),
            (Some(path), None) => Ok(Self::PretrainedWeights {
                path: PathBuf::from(path),
            }),
            (None, Some(path)) => Ok(Self::Restore {
                path: PathBuf::from(path),
                strict: false,
            }),
            (None, None) => Ok(Self::Fresh),
        }
    }

    /// Build the model; `model_cfg` is the `model` section.
    pub fn build<B, M>(&self, model_cfg: &ConfigTree, trainer: &Trainer<B>) -> Result<M>
    where
        B: AutodiffBackend,
        M: TrainableModel<B>,
    {
        match self {
            Self::Fresh => M::from_config(model_cfg, trainer),
            Self::Restore { path, strict } => restore_from(path, model_cfg, *strict, trainer),
            Self::PretrainedWeights { path } => {
                info!("Loading pre-trained model weights from {:?}", path);
                let model = M::from_config(model_cfg, trainer)?;
                load_state_dict(model, path, trainer.device())
                    .with_context(|| format!("Failed to load pretrained weights {:?}", path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cfg(model: serde_json::Value) -> ConfigTree {
        ConfigTree::new(json!({ "model": model }))
    }

    #[test]
    fn test_prompt_learning_init_choice() {
        assert_eq!(ModelInit::for_prompt_learning(&cfg(json!({}))), ModelInit::Fresh);
        assert_eq!(
            ModelInit::for_prompt_learning(&cfg(json!({"restore_path": null}))),
            ModelInit::Fresh
        );
        assert_eq!(ModelInit::for_prompt_learning(&cfg(json!({"restore_path": ""}))), ModelInit::Fresh);
        assert_eq!(
            ModelInit::for_prompt_learning(&cfg(json!({"restore_path": "runs/p.model"}))),
            ModelInit::Restore {
                path: PathBuf::from("runs/p.model"),
                strict: false
            }
        );
    }

    #[test]
    fn test_diarization_init_choice() {
        assert_eq!(ModelInit::for_diarization(&cfg(json!({}))).unwrap(), ModelInit::Fresh);
        assert_eq!(
            ModelInit::for_diarization(&cfg(json!({"pretrained_weights": "w.mpk"}))).unwrap(),
            ModelInit::PretrainedWeights {
                path: PathBuf::from("w.mpk")
            }
        );
        assert!(matches!(
            ModelInit::for_diarization(&cfg(json!({"pretrained_weights": "w.mpk", "restore_path": "r"}))),
            Err(ConfigError::Conflict(_))
        ));
    }

    #[test]
    fn test_adam_rejects_unknown_optimizer() {
        let optim = OptimConfig {
            name: "sgd".into(),
            ..OptimConfig::default()
        };
        assert!(optim.adam(None).is_err());
        assert!(OptimConfig::default().adam(Some(1.0)).is_ok());
    }
}
