use anyhow::{bail, Context, Result};
use burn::constant;
use burn::module::Module;
use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{activation, ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{OptimConfig, TrainableModel};
use crate::checkpoint::{self, CheckpointError, Checkpointable, ComponentSpec};
use crate::config::ConfigTree;
use crate::data::diarize::{load_dataset, synthetic_sessions};
use crate::data::{BatchLoader, DataLoader, DiarizeBatch, DiarizeCollate, DiarizeDatasetConfig, DiarizeSample, FrameLayout};
use crate::trainer::Trainer;

/// The `model` section for neural diarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiarizeModelConfig {
    pub pretrained_weights: Option<PathBuf>,
    pub restore_path: Option<PathBuf>,
    pub feat_dim: usize,
    pub max_speakers: usize,
    pub frame_shift: f64,
    pub segment_frames: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub dropout: f64,
    pub seed: u64,
    pub train_ds: DiarizeDatasetConfig,
    pub validation_ds: Option<DiarizeDatasetConfig>,
    pub optim: OptimConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for DiarizeModelConfig {
    fn default() -> Self {
        Self {
            pretrained_weights: None,
            restore_path: None,
            feat_dim: 16,
            max_speakers: 2,
            frame_shift: 0.01,
            segment_frames: 32,
            hidden_size: 32,
            num_layers: 2,
            num_attention_heads: 4,
            dropout: 0.1,
            seed: 42,
            train_ds: DiarizeDatasetConfig::default(),
            validation_ds: None,
            optim: OptimConfig::default(),
            extra: Map::new(),
        }
    }
}

impl DiarizeModelConfig {
    pub fn layout(&self) -> FrameLayout {
        FrameLayout {
            feat_dim: self.feat_dim,
            max_speakers: self.max_speakers,
            frame_shift: self.frame_shift,
            segment_frames: self.segment_frames,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.feat_dim == 0 || self.max_speakers == 0 || self.segment_frames == 0 {
            bail!("feat_dim, max_speakers and segment_frames must be positive");
        }
        if self.frame_shift <= 0.0 {
            bail!("frame_shift must be positive, got {}", self.frame_shift);
        }
        if self.hidden_size % self.num_attention_heads.max(1) != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        Ok(())
    }
}

impl fmt::Display for DiarizeModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

constant!(DiarizeModelConfig);

/// Frame-level speaker activity detector over acoustic features.
#[derive(Module, Debug)]
pub struct DeepDiarizeModel<B: Backend> {
    input_proj: Linear<B>,
    position_embedding: Embedding<B>,
    encoder: TransformerEncoder<B>,
    head: Linear<B>,
    #[module(skip)]
    config: DiarizeModelConfig,
}

impl<B: Backend> DeepDiarizeModel<B> {
    pub fn new(config: DiarizeModelConfig, device: &B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            input_proj: LinearConfig::new(config.feat_dim, config.hidden_size).init(device),
            position_embedding: EmbeddingConfig::new(config.segment_frames, config.hidden_size).init(device),
            encoder: TransformerEncoderConfig::new(
                config.hidden_size,
                config.hidden_size * 4,
                config.num_attention_heads,
                config.num_layers,
            )
            .with_dropout(config.dropout)
            .with_norm_first(true)
            .init(device),
            head: LinearConfig::new(config.hidden_size, config.max_speakers).init(device),
            config,
        })
    }

    pub fn config(&self) -> &DiarizeModelConfig {
        &self.config
    }

    /// Speaker logits, `[batch, frames, max_speakers]`.
    pub fn forward(&self, features: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, frames, _] = features.dims();
        let device = features.device();

        let positions = Tensor::arange(0..frames as i64, &device)
            .reshape([1, frames])
            .repeat_dim(0, batch);
        let hidden = self.input_proj.forward(features) + self.position_embedding.forward(positions);
        let hidden = self.encoder.forward(TransformerEncoderInput::new(hidden));
        self.head.forward(hidden)
    }

    /// Per-frame speaker activity probabilities.
    pub fn predict(&self, features: Tensor<B, 3>) -> Tensor<B, 3> {
        activation::sigmoid(self.forward(features))
    }

    pub fn loss(&self, batch: DiarizeBatch<B>) -> Tensor<B, 1> {
        let logits = self.forward(batch.features);
        let [b, frames, speakers] = logits.dims();
        let loss_fn = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device());
        loss_fn.forward(
            logits.reshape([b * frames, speakers]),
            batch.labels.reshape([b * frames, speakers]),
        )
    }

    fn samples(&self, ds: &DiarizeDatasetConfig, seed: u64) -> Result<Vec<DiarizeSample>> {
        let layout = self.config.layout();
        match &ds.manifest_filepath {
            Some(manifest) => load_dataset(manifest, &layout),
            None => {
                info!("No manifest configured, using {} synthetic sessions", ds.synthetic_sessions);
                Ok(synthetic_sessions(ds.synthetic_sessions, &layout, seed))
            }
        }
    }

    fn loader(
        &self,
        samples: Vec<DiarizeSample>,
        ds: &DiarizeDatasetConfig,
        device: &B::Device,
    ) -> Box<dyn DataLoader<DiarizeBatch<B>>> {
        let collate = DiarizeCollate {
            layout: self.config.layout(),
        };
        let loader = BatchLoader::<B, _>::new(samples, collate, ds.batch_size, device.clone());
        if ds.shuffle {
            Box::new(loader.with_shuffle(self.config.seed))
        } else {
            Box::new(loader)
        }
    }
}

impl<B: Backend> Checkpointable<B> for DeepDiarizeModel<B> {
    fn model_config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn component_specs(&self) -> Vec<ComponentSpec> {
        let c = &self.config;
        vec![
            ComponentSpec::new("input_proj", &[c.feat_dim, c.hidden_size]),
            ComponentSpec::new("position_embedding", &[c.segment_frames, c.hidden_size]),
            ComponentSpec::new("encoder", &[c.num_layers, c.hidden_size, c.num_attention_heads]),
            ComponentSpec::new("head", &[c.hidden_size, c.max_speakers]),
        ]
    }

    fn save_component(&self, name: &str, dir: &Path) -> Result<(), CheckpointError> {
        match name {
            "input_proj" => checkpoint::save_component(&self.input_proj, dir, name),
            "position_embedding" => checkpoint::save_component(&self.position_embedding, dir, name),
            "encoder" => checkpoint::save_component(&self.encoder, dir, name),
            "head" => checkpoint::save_component(&self.head, dir, name),
            other => Err(CheckpointError::UnknownComponent(other.to_string())),
        }
    }

    fn load_component(mut self, name: &str, dir: &Path, device: &B::Device) -> Result<Self, CheckpointError> {
        match name {
            "input_proj" => self.input_proj = checkpoint::load_component(self.input_proj, dir, name, device)?,
            "position_embedding" => {
                self.position_embedding = checkpoint::load_component(self.position_embedding, dir, name, device)?
            }
            "encoder" => self.encoder = checkpoint::load_component(self.encoder, dir, name, device)?,
            "head" => self.head = checkpoint::load_component(self.head, dir, name, device)?,
            other => return Err(CheckpointError::UnknownComponent(other.to_string())),
        }
        Ok(self)
    }
}

impl<B: AutodiffBackend> TrainableModel<B> for DeepDiarizeModel<B> {
    type Batch = DiarizeBatch<B>;

    fn from_config(cfg: &ConfigTree, trainer: &Trainer<B>) -> Result<Self> {
        let config: DiarizeModelConfig =
            serde_json::from_value(cfg.as_value().clone()).context("Invalid diarization model config")?;
        let model = Self::new(config, trainer.device())?;
        info!(
            "Deep diarize model: {} features, {} speakers, {} frames per segment",
            model.config.feat_dim, model.config.max_speakers, model.config.segment_frames
        );
        Ok(model)
    }

    fn train_dataloader(&self, device: &B::Device) -> Result<Box<dyn DataLoader<DiarizeBatch<B>>>> {
        let ds = &self.config.train_ds;
        let samples = self.samples(ds, self.config.seed)?;
        if samples.is_empty() {
            bail!("training dataset is empty");
        }
        Ok(self.loader(samples, ds, device))
    }

    fn val_dataloader(&self, device: &B::Device) -> Result<Option<Box<dyn DataLoader<DiarizeBatch<B>>>>> {
        let Some(ds) = &self.config.validation_ds else {
            return Ok(None);
        };
        let samples = self.samples(ds, self.config.seed.wrapping_add(1))?;
        let ds = DiarizeDatasetConfig {
            shuffle: false,
            ..ds.clone()
        };
        Ok(Some(self.loader(samples, &ds, device)))
    }

    fn training_step(&self, batch: DiarizeBatch<B>) -> Tensor<B, 1> {
        self.loss(batch)
    }

    fn validation_step(&self, batch: DiarizeBatch<B>) -> f32 {
        self.loss(batch).into_scalar().elem::<f32>()
    }

    fn optim_config(&self) -> &OptimConfig {
        &self.config.optim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{load_state_dict, save_state_dict};
    use crate::data::Collate;
    use burn::backend::Autodiff;
    use burn::module::AutodiffModule;
    use burn_ndarray::NdArray;
    use serde_json::json;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn config() -> DiarizeModelConfig {
        serde_json::from_value(json!({
            "feat_dim": 4,
            "max_speakers": 2,
            "frame_shift": 0.1,
            "segment_frames": 8,
            "hidden_size": 8,
            "num_layers": 1,
            "num_attention_heads": 2,
            "dropout": 0.0
        }))
        .unwrap()
    }

    #[test]
    fn test_forward_and_loss() {
        let device = Default::default();
        let model = DeepDiarizeModel::<TestBackend>::new(config(), &device).unwrap();
        let samples = synthetic_sessions(2, &model.config.layout(), 5);
        let refs: Vec<_> = samples.iter().take(2).collect();
        let batch: DiarizeBatch<TestBackend> =
            Collate::<TestBackend>::collate(&DiarizeCollate { layout: model.config.layout() }, &refs, &device);

        let probs = model.predict(batch.features.clone());
        assert_eq!(probs.dims(), [2, 8, 2]);
        let max = probs.max().into_scalar().elem::<f32>();
        assert!(max <= 1.0);

        let loss = model.loss(batch).into_scalar().elem::<f32>();
        assert!(loss.is_finite() && loss > 0.0);
    }

    fn assert_trainable<M: TrainableModel<TestBackend>>() {}

    #[test]
    fn test_inference_copy_keeps_config() {
        assert_trainable::<DeepDiarizeModel<TestBackend>>();
        let device = Default::default();
        let model = DeepDiarizeModel::<TestBackend>::new(config(), &device).unwrap();
        assert!(model.config().to_string().contains("hidden_size: 8"));

        let inner = model.valid();
        assert_eq!(inner.config(), model.config());
        let probs = inner.predict(Tensor::zeros([1, 8, 4], &device));
        assert_eq!(probs.dims(), [1, 8, 2]);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = config();
        config.frame_shift = 0.0;
        assert!(DeepDiarizeModel::<TestBackend>::new(config, &Default::default()).is_err());
    }

    #[test]
    fn test_pretrained_weights_merge() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let source = DeepDiarizeModel::<TestBackend>::new(config(), &device).unwrap();
        let path = save_state_dict(&source, &dir.path().join("weights")).unwrap();

        let fresh = DeepDiarizeModel::<TestBackend>::new(config(), &device).unwrap();
        let merged = load_state_dict(fresh, &path, &device).unwrap();
        assert_eq!(
            merged.head.weight.val().into_data(),
            source.head.weight.val().into_data()
        );
    }

    #[test]
    fn test_weights_with_other_hidden_size_rejected() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let wide = DeepDiarizeModel::<TestBackend>::new(
            DiarizeModelConfig {
                hidden_size: 16,
                ..config()
            },
            &device,
        )
        .unwrap();
        let path = save_state_dict(&wide, &dir.path().join("wide")).unwrap();

        let narrow = DeepDiarizeModel::<TestBackend>::new(config(), &device).unwrap();
        let err = load_state_dict(narrow, &path, &device).unwrap_err();
        match &err {
            CheckpointError::ParamShape {
                path: at,
                param,
                expected,
                found,
            } => {
                assert_eq!(at, &path);
                assert_eq!(param, "input_proj.weight");
                assert_eq!(expected, &vec![4, 8]);
                assert_eq!(found, &vec![4, 16]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("wide.mpk") && message.contains("input_proj.weight"));
    }

    #[test]
    fn test_missing_weights_names_path() {
        let device = Default::default();
        let fresh = DeepDiarizeModel::<TestBackend>::new(config(), &device).unwrap();
        let err = load_state_dict(fresh, Path::new("/nonexistent/diar_weights.mpk"), &device).unwrap_err();
        assert!(err.to_string().contains("diar_weights"));
    }
}
