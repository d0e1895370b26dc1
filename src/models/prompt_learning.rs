use anyhow::{bail, Context, Result};
use burn::constant;
use burn::module::Module;
use burn::nn::attention::generate_autoregressive_mask;
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{OptimConfig, TrainableModel};
use crate::checkpoint::{self, CheckpointError, Checkpointable, ComponentSpec};
use crate::config::ConfigTree;
use crate::data::prompt::{load_samples, synthetic_samples};
use crate::data::{
    BatchLoader, CharTokenizer, DataLoader, PromptBatch, PromptCollate, PromptDataConfig, PromptSample, TaskTemplate,
    Tokenizer,
};
use crate::trainer::Trainer;

/// Size of the frozen character language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageModelConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub ffn_hidden_size: Option<usize>,
    pub max_position_embeddings: usize,
    pub dropout: f64,
}

impl Default for LanguageModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 32,
            num_layers: 2,
            num_attention_heads: 4,
            ffn_hidden_size: None,
            max_position_embeddings: 128,
            dropout: 0.0,
        }
    }
}

impl LanguageModelConfig {
    pub fn ffn_size(&self) -> usize {
        self.ffn_hidden_size.unwrap_or(self.hidden_size * 4)
    }
}

/// The `model` section for universal prompt learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptModelConfig {
    pub precision: Option<Value>,
    pub restore_path: Option<PathBuf>,
    /// Whole-model weights of a trained `CharLanguageModel`.
    pub language_model_path: Option<PathBuf>,
    pub tokenizer_path: Option<PathBuf>,
    pub freeze_language_model: bool,
    /// Train prompts against a frozen, randomly initialised language model.
    pub allow_random_language_model: bool,
    pub language_model: LanguageModelConfig,
    pub task_templates: Vec<TaskTemplate>,
    pub data: PromptDataConfig,
    pub optim: OptimConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PromptModelConfig {
    fn default() -> Self {
        Self {
            precision: None,
            restore_path: None,
            language_model_path: None,
            tokenizer_path: None,
            freeze_language_model: true,
            allow_random_language_model: false,
            language_model: LanguageModelConfig::default(),
            task_templates: Vec::new(),
            data: PromptDataConfig::default(),
            optim: OptimConfig::default(),
            extra: Map::new(),
        }
    }
}

impl PromptModelConfig {
    /// Weight file for the language model. A frozen language model needs
    /// one unless a checkpoint restore supplies the weights or random
    /// weights are explicitly allowed.
    pub fn language_model_source(&self) -> Result<Option<&Path>> {
        let path = self
            .language_model_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty());
        let restoring = self.restore_path.as_ref().is_some_and(|p| !p.as_os_str().is_empty());
        if path.is_none() && self.freeze_language_model && !restoring {
            if !self.allow_random_language_model {
                bail!(
                    "model.language_model_path is required when model.freeze_language_model is true; \
                     set model.allow_random_language_model=true to train against random weights"
                );
            }
            warn!("Language model is frozen with random weights (model.allow_random_language_model=true)");
        }
        Ok(path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_templates.is_empty() {
            bail!("model.task_templates must list at least one task");
        }
        for template in &self.task_templates {
            template.validate()?;
        }
        let virtual_tokens = self.virtual_tokens();
        if let Some(other) = self
            .task_templates
            .iter()
            .find(|t| t.total_virtual_tokens != virtual_tokens)
        {
            bail!(
                "task '{}' uses {} virtual tokens but '{}' uses {}; the universal prompt needs one length",
                other.taskname,
                other.total_virtual_tokens,
                self.task_templates[0].taskname,
                virtual_tokens
            );
        }
        let lm = &self.language_model;
        if lm.hidden_size % lm.num_attention_heads.max(1) != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                lm.hidden_size,
                lm.num_attention_heads
            );
        }
        if virtual_tokens + self.data.max_seq_length > lm.max_position_embeddings {
            bail!(
                "{} virtual tokens plus max_seq_length {} exceed max_position_embeddings {}",
                virtual_tokens,
                self.data.max_seq_length,
                lm.max_position_embeddings
            );
        }
        Ok(())
    }

    pub fn virtual_tokens(&self) -> usize {
        self.task_templates.first().map(|t| t.total_virtual_tokens).unwrap_or(0)
    }
}

impl fmt::Display for PromptModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

constant!(PromptModelConfig);
constant!(CharTokenizer);

/// Causal character language model: embeddings, masked encoder and head.
#[derive(Module, Debug)]
pub struct CharLanguageModel<B: Backend> {
    token_embedding: Embedding<B>,
    position_embedding: Embedding<B>,
    encoder: TransformerEncoder<B>,
    head: Linear<B>,
}

impl<B: Backend> CharLanguageModel<B> {
    pub fn new(config: &LanguageModelConfig, vocab_size: usize, device: &B::Device) -> Self {
        Self {
            token_embedding: EmbeddingConfig::new(vocab_size, config.hidden_size).init(device),
            position_embedding: EmbeddingConfig::new(config.max_position_embeddings, config.hidden_size)
                .init(device),
            encoder: TransformerEncoderConfig::new(
                config.hidden_size,
                config.ffn_size(),
                config.num_attention_heads,
                config.num_layers,
            )
            .with_dropout(config.dropout)
            .with_norm_first(true)
            .init(device),
            head: LinearConfig::new(config.hidden_size, vocab_size).init(device),
        }
    }

    pub fn embed(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.token_embedding.forward(tokens)
    }

    /// Add positions and run the encoder under a causal mask.
    pub fn encode(&self, embeddings: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, seq_len, _] = embeddings.dims();
        let device = embeddings.device();

        let positions = Tensor::arange(0..seq_len as i64, &device)
            .reshape([1, seq_len])
            .repeat_dim(0, batch);
        let hidden = embeddings + self.position_embedding.forward(positions);

        let mask = generate_autoregressive_mask::<B>(batch, seq_len, &device);
        self.encoder
            .forward(TransformerEncoderInput::new(hidden).mask_attn(mask))
    }

    pub fn logits(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        self.head.forward(hidden)
    }

    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.logits(self.encode(self.embed(tokens)))
    }
}

/// Prompt-tuned language model: one virtual prompt shared by all tasks,
/// shifted per task by a learned task embedding.
#[derive(Module, Debug)]
pub struct UniversalPromptModel<B: Backend> {
    language_model: CharLanguageModel<B>,
    prompt_table: Embedding<B>,
    task_embedding: Embedding<B>,
    #[module(skip)]
    config: PromptModelConfig,
    #[module(skip)]
    tokenizer: CharTokenizer,
}

impl<B: Backend> UniversalPromptModel<B> {
    pub fn new(config: PromptModelConfig, tokenizer: CharTokenizer, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let hidden = config.language_model.hidden_size;
        Ok(Self {
            language_model: CharLanguageModel::new(&config.language_model, tokenizer.vocab_size(), device),
            prompt_table: EmbeddingConfig::new(config.virtual_tokens(), hidden).init(device),
            task_embedding: EmbeddingConfig::new(config.task_templates.len(), hidden).init(device),
            config,
            tokenizer,
        })
    }

    pub fn config(&self) -> &PromptModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &CharTokenizer {
        &self.tokenizer
    }

    pub fn language_model(&self) -> &CharLanguageModel<B> {
        &self.language_model
    }

    /// Next-token logits for the text positions only, `[batch, seq_len, vocab]`.
    pub fn forward(&self, tokens: Tensor<B, 2, Int>, task_ids: Tensor<B, 1, Int>) -> Tensor<B, 3> {
        let [batch, seq_len] = tokens.dims();
        let virtual_tokens = self.config.virtual_tokens();

        let prompt = self
            .prompt_table
            .weight
            .val()
            .unsqueeze_dim::<3>(0)
            .repeat_dim(0, batch);
        let task = self
            .task_embedding
            .forward(task_ids.unsqueeze_dim::<2>(1))
            .repeat_dim(1, virtual_tokens);
        let prompt = prompt + task;

        let text = self.language_model.embed(tokens);
        let hidden = self.language_model.encode(Tensor::cat(vec![prompt, text], 1));
        let text_hidden = hidden.slice([0..batch, virtual_tokens..virtual_tokens + seq_len]);
        self.language_model.logits(text_hidden)
    }

    pub fn loss(&self, batch: PromptBatch<B>) -> Tensor<B, 1> {
        let logits = self.forward(batch.tokens, batch.task_ids);
        let [b, s, vocab] = logits.dims();
        let loss_fn = CrossEntropyLossConfig::new()
            .with_pad_tokens(Some(vec![self.tokenizer.pad_id() as usize]))
            .init(&logits.device());
        loss_fn.forward(logits.reshape([b * s, vocab]), batch.targets.reshape([b * s]))
    }

    fn loader(&self, samples: Vec<PromptSample>, shuffle: bool, device: &B::Device) -> Box<dyn DataLoader<PromptBatch<B>>> {
        let data = &self.config.data;
        let collate = PromptCollate {
            pad_id: self.tokenizer.pad_id(),
        };
        let loader = BatchLoader::<B, _>::new(samples, collate, data.batch_size, device.clone());
        if shuffle {
            Box::new(loader.with_shuffle(data.seed))
        } else {
            Box::new(loader)
        }
    }
}

impl<B: Backend> Checkpointable<B> for UniversalPromptModel<B> {
    fn model_config(&self) -> Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }

    fn component_specs(&self) -> Vec<ComponentSpec> {
        let lm = &self.config.language_model;
        let vocab = self.tokenizer.vocab_size();
        let hidden = lm.hidden_size;
        vec![
            ComponentSpec::new("prompt_table", &[self.config.virtual_tokens(), hidden]),
            ComponentSpec::new("task_embedding", &[self.config.task_templates.len(), hidden]),
            ComponentSpec::new("lm_token_embedding", &[vocab, hidden]),
            ComponentSpec::new("lm_position_embedding", &[lm.max_position_embeddings, hidden]),
            ComponentSpec::new(
                "lm_encoder",
                &[lm.num_layers, hidden, lm.num_attention_heads, lm.ffn_size()],
            ),
            ComponentSpec::new("lm_head", &[hidden, vocab]),
        ]
    }

    fn save_component(&self, name: &str, dir: &Path) -> Result<(), CheckpointError> {
        let lm = &self.language_model;
        match name {
            "prompt_table" => checkpoint::save_component(&self.prompt_table, dir, name),
            "task_embedding" => checkpoint::save_component(&self.task_embedding, dir, name),
            "lm_token_embedding" => checkpoint::save_component(&lm.token_embedding, dir, name),
            "lm_position_embedding" => checkpoint::save_component(&lm.position_embedding, dir, name),
            "lm_encoder" => checkpoint::save_component(&lm.encoder, dir, name),
            "lm_head" => checkpoint::save_component(&lm.head, dir, name),
            other => Err(CheckpointError::UnknownComponent(other.to_string())),
        }
    }

    fn load_component(mut self, name: &str, dir: &Path, device: &B::Device) -> Result<Self, CheckpointError> {
        match name {
            "prompt_table" => {
                self.prompt_table = checkpoint::load_component(self.prompt_table, dir, name, device)?
            }
            "task_embedding" => {
                self.task_embedding = checkpoint::load_component(self.task_embedding, dir, name, device)?
            }
            "lm_token_embedding" => {
                self.language_model.token_embedding =
                    checkpoint::load_component(self.language_model.token_embedding, dir, name, device)?
            }
            "lm_position_embedding" => {
                self.language_model.position_embedding =
                    checkpoint::load_component(self.language_model.position_embedding, dir, name, device)?
            }
            "lm_encoder" => {
                self.language_model.encoder =
                    checkpoint::load_component(self.language_model.encoder, dir, name, device)?
            }
            "lm_head" => {
                self.language_model.head = checkpoint::load_component(self.language_model.head, dir, name, device)?
            }
            other => return Err(CheckpointError::UnknownComponent(other.to_string())),
        }
        Ok(self)
    }
}

impl<B: AutodiffBackend> TrainableModel<B> for UniversalPromptModel<B> {
    type Batch = PromptBatch<B>;

    fn from_config(cfg: &ConfigTree, trainer: &Trainer<B>) -> Result<Self> {
        let config: PromptModelConfig =
            serde_json::from_value(cfg.as_value().clone()).context("Invalid prompt learning model config")?;
        let language_model_path = config.language_model_source()?.map(Path::to_path_buf);
        let tokenizer = match &config.tokenizer_path {
            Some(path) => CharTokenizer::load(path)?,
            None => CharTokenizer::ascii(),
        };

        let device = trainer.device();
        let mut model = Self::new(config, tokenizer, device)?;
        if let Some(path) = language_model_path {
            model.language_model = checkpoint::load_state_dict(model.language_model, &path, device)
                .with_context(|| format!("Failed to load language model {:?}", path))?;
        }

        info!(
            "Universal prompt model: {} tasks, {} virtual tokens, vocab {}",
            model.config.task_templates.len(),
            model.config.virtual_tokens(),
            model.tokenizer.vocab_size()
        );
        Ok(model)
    }

    fn train_dataloader(&self, device: &B::Device) -> Result<Box<dyn DataLoader<PromptBatch<B>>>> {
        let data = &self.config.data;
        let samples = if data.train_ds.is_empty() {
            info!("No train_ds configured, using {} synthetic records per task", data.synthetic_samples);
            synthetic_samples(
                &self.config.task_templates,
                &self.tokenizer,
                data.synthetic_samples,
                data.seed,
                data.max_seq_length,
            )?
        } else {
            load_samples(&data.train_ds, &self.config.task_templates, &self.tokenizer, data.max_seq_length)?
        };
        if samples.is_empty() {
            bail!("training dataset is empty");
        }
        Ok(self.loader(samples, data.shuffle, device))
    }

    fn val_dataloader(&self, device: &B::Device) -> Result<Option<Box<dyn DataLoader<PromptBatch<B>>>>> {
        let data = &self.config.data;
        let samples = if !data.validation_ds.is_empty() {
            load_samples(&data.validation_ds, &self.config.task_templates, &self.tokenizer, data.max_seq_length)?
        } else if data.train_ds.is_empty() {
            synthetic_samples(
                &self.config.task_templates,
                &self.tokenizer,
                (data.synthetic_samples / 4).max(1),
                data.seed.wrapping_add(1),
                data.max_seq_length,
            )?
        } else {
            return Ok(None);
        };
        Ok(Some(self.loader(samples, false, device)))
    }

    fn training_step(&self, batch: PromptBatch<B>) -> Tensor<B, 1> {
        self.loss(batch)
    }

    fn validation_step(&self, batch: PromptBatch<B>) -> f32 {
        self.loss(batch).into_scalar().elem::<f32>()
    }

    fn optim_config(&self) -> &OptimConfig {
        &self.config.optim
    }

    fn on_fit_start(mut self) -> Self {
        if self.config.freeze_language_model {
            self.language_model = self.language_model.no_grad();
            info!("Language model frozen, training the prompt encoder only");
        }
        self
    }
}
