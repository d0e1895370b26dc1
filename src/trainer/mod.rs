//! The training-loop driver and everything attached to it at construction.

pub mod callbacks;
pub mod environment;
mod fit;
pub mod options;
pub mod plugins;
pub mod strategy;

pub use callbacks::{Callback, CheckpointParams, ModelCheckpoint, MonitorMode, Timer, TimerKind};
pub use environment::{ClusterTopology, ElasticEnvironment, EnvironmentError};
pub use options::{BatchLimit, Precision, TrainerOptions};
pub use plugins::{assemble_plugins, plugin_rules, GradScaler, Plugin, PluginRule, PrecisionPlugin, BATCH_CLUSTER};
pub use strategy::{DdpStrategy, Strategy};

use burn::tensor::backend::AutodiffBackend;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::checkpoint::TrainingProgress;
use crate::config::{ConfigError, ConfigTree};

#[derive(Debug, Error)]
pub enum TrainerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cluster environment: {0}")]
    Environment(#[from] EnvironmentError),
}

/// Collects the pieces of a [`Trainer`] before it is built.
#[derive(Debug, Clone)]
pub struct TrainerBuilder {
    options: TrainerOptions,
    plugins: Option<Vec<Plugin>>,
    strategy: Option<Strategy>,
    use_stateless_timer: bool,
    topology: Option<ClusterTopology>,
}

impl TrainerBuilder {
    pub fn new(options: TrainerOptions) -> Self {
        Self {
            options,
            plugins: None,
            strategy: None,
            use_stateless_timer: false,
            topology: None,
        }
    }

    /// Options from the `trainer` section of `cfg`.
    pub fn from_config(cfg: &ConfigTree) -> Result<Self, TrainerError> {
        Ok(Self::new(cfg.section("trainer")?))
    }

    pub fn plugins(mut self, plugins: Vec<Plugin>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Install the `max_time` timer as [`TimerKind::Stateless`].
    pub fn use_stateless_timer(mut self, enabled: bool) -> Self {
        self.use_stateless_timer = enabled;
        self
    }

    /// Use this topology instead of detecting it from the cluster plugin.
    pub fn topology(mut self, topology: ClusterTopology) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn build<B: AutodiffBackend>(self, device: B::Device) -> Result<Trainer<B>, TrainerError> {
        let options = self.options;
        let precision = options.precision()?;

        if self.strategy.is_some() && options.strategy.is_some() {
            return Err(ConfigError::Conflict(
                "trainer.strategy is set in the config but the launcher supplies its own strategy".to_string(),
            )
            .into());
        }
        let configured_plugins = options.plugins.as_ref().filter(|v| !v.is_null());
        if self.plugins.is_some() && configured_plugins.is_some() {
            return Err(ConfigError::Conflict(
                "trainer.plugins is set in the config but the launcher supplies its own plugins".to_string(),
            )
            .into());
        }
        if let Some(value) = configured_plugins {
            warn!("trainer.plugins {} cannot be instantiated from config and is ignored", value);
        }
        if !options.extra.is_empty() {
            let keys: Vec<&str> = options.extra.keys().map(String::as_str).collect();
            warn!("Unrecognized trainer options passed through: {}", keys.join(", "));
        }

        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => Strategy::from_name(options.strategy.as_deref())?,
        };
        let plugins = self.plugins.unwrap_or_default();

        let topology = match self.topology {
            Some(topology) => topology,
            None => match plugins.iter().find_map(|p| match p {
                Plugin::ClusterEnvironment(env) => Some(*env),
                _ => None,
            }) {
                Some(env) => env.detect()?,
                None => ClusterTopology::single_process(),
            },
        };
        let requested = options.device_count() * options.num_nodes.max(1);
        if requested > topology.world_size {
            warn!(
                "{} devices requested but this process group has world size {}; running on one device per process",
                requested, topology.world_size
            );
        }

        let mut callbacks = Vec::new();
        if let Some(duration) = options.max_duration()? {
            let kind = if self.use_stateless_timer {
                TimerKind::Stateless
            } else {
                TimerKind::Stateful
            };
            let max_time = options.max_time.clone().unwrap_or(Value::Null);
            callbacks.push(Callback::Timer(Timer::new(kind, duration, max_time)));
        }
        if options.enable_checkpointing {
            let dir = options.root_dir().join("checkpoints");
            callbacks.push(Callback::ModelCheckpoint(ModelCheckpoint::new(
                dir,
                "model",
                CheckpointParams::default(),
            )));
        }

        info!(
            "Trainer: precision {}, strategy {}, plugins [{}], rank {}/{}",
            precision,
            strategy,
            plugins.iter().map(Plugin::name).collect::<Vec<_>>().join(", "),
            topology.global_rank,
            topology.world_size
        );

        Ok(Trainer {
            options,
            precision,
            plugins,
            strategy,
            callbacks,
            topology,
            device,
            log_dir: None,
            metrics_path: None,
            resume_from: None,
            progress: TrainingProgress::default(),
        })
    }
}

/// Owns the run configuration of one `fit` call.
#[derive(Debug)]
pub struct Trainer<B: AutodiffBackend> {
    options: TrainerOptions,
    precision: Precision,
    plugins: Vec<Plugin>,
    strategy: Strategy,
    callbacks: Vec<Callback>,
    topology: ClusterTopology,
    device: B::Device,
    log_dir: Option<PathBuf>,
    metrics_path: Option<PathBuf>,
    resume_from: Option<PathBuf>,
    progress: TrainingProgress,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn options(&self) -> &TrainerOptions {
        &self.options
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn plugins(&self) -> &[Plugin] {
        &self.plugins
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn callbacks(&self) -> &[Callback] {
        &self.callbacks
    }

    pub fn add_callback(&mut self, callback: Callback) {
        self.callbacks.push(callback);
    }

    pub fn timer(&self) -> Option<&Timer> {
        self.callbacks.iter().find_map(|c| match c {
            Callback::Timer(timer) => Some(timer),
            _ => None,
        })
    }

    pub fn checkpoint_callback(&self) -> Option<&ModelCheckpoint> {
        self.callbacks.iter().find_map(|c| match c {
            Callback::ModelCheckpoint(checkpoint) => Some(checkpoint),
            _ => None,
        })
    }

    fn checkpoint_callback_mut(&mut self) -> Option<&mut ModelCheckpoint> {
        self.callbacks.iter_mut().find_map(|c| match c {
            Callback::ModelCheckpoint(checkpoint) => Some(checkpoint),
            _ => None,
        })
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn is_global_zero(&self) -> bool {
        self.topology.is_global_zero()
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    pub fn set_log_dir(&mut self, dir: PathBuf) {
        self.log_dir = Some(dir);
    }

    pub fn metrics_path(&self) -> Option<&Path> {
        self.metrics_path.as_deref()
    }

    pub fn set_metrics_path(&mut self, path: PathBuf) {
        self.metrics_path = Some(path);
    }

    pub fn resume_from(&self) -> Option<&Path> {
        self.resume_from.as_deref()
    }

    pub fn set_resume_from(&mut self, checkpoint: PathBuf) {
        self.resume_from = Some(checkpoint);
    }

    pub fn current_epoch(&self) -> usize {
        self.progress.epoch
    }

    pub fn global_step(&self) -> usize {
        self.progress.global_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use serde_json::json;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn options(value: Value) -> TrainerOptions {
        serde_json::from_value(value).unwrap()
    }

    fn timers(trainer: &Trainer<TestBackend>, kind: TimerKind) -> usize {
        trainer
            .callbacks()
            .iter()
            .filter(|c| matches!(c, Callback::Timer(t) if t.kind() == kind))
            .count()
    }

    #[test]
    fn test_stateless_timer_replaces_stateful() {
        let max_time = json!("00:00:30:00");
        let trainer = TrainerBuilder::new(options(json!({"max_time": max_time, "enable_checkpointing": false})))
            .use_stateless_timer(true)
            .build::<TestBackend>(Default::default())
            .unwrap();
        assert_eq!(timers(&trainer, TimerKind::Stateful), 0);
        assert_eq!(timers(&trainer, TimerKind::Stateless), 1);
        let timer = trainer.timer().unwrap();
        assert_eq!(timer.max_time(), &max_time);
        assert_eq!(timer.duration().as_secs(), 30 * 60);
    }

    #[test]
    fn test_stateful_timer_by_default() {
        let trainer = TrainerBuilder::new(options(json!({"max_time": {"hours": 1}})))
            .build::<TestBackend>(Default::default())
            .unwrap();
        assert_eq!(timers(&trainer, TimerKind::Stateful), 1);
        assert_eq!(timers(&trainer, TimerKind::Stateless), 0);
        assert!(trainer.checkpoint_callback().is_some());
    }

    #[test]
    fn test_no_timer_without_max_time() {
        let trainer = TrainerBuilder::new(TrainerOptions::default())
            .use_stateless_timer(true)
            .build::<TestBackend>(Default::default())
            .unwrap();
        assert!(trainer.timer().is_none());
    }

    #[test]
    fn test_duplicate_strategy_is_rejected() {
        let err = TrainerBuilder::new(options(json!({"strategy": "ddp"})))
            .strategy(Strategy::Ddp(DdpStrategy::without_hooks()))
            .build::<TestBackend>(Default::default())
            .unwrap_err();
        assert!(matches!(err, TrainerError::Config(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_duplicate_plugins_are_rejected() {
        let err = TrainerBuilder::new(options(json!({"plugins": ["x"]})))
            .plugins(Vec::new())
            .build::<TestBackend>(Default::default())
            .unwrap_err();
        assert!(matches!(err, TrainerError::Config(ConfigError::Conflict(_))));
    }

    #[test]
    fn test_strategy_from_options() {
        let trainer = TrainerBuilder::new(options(json!({"strategy": "ddp", "custom_flag": 3})))
            .build::<TestBackend>(Default::default())
            .unwrap();
        assert!(trainer.strategy().is_distributed());
        assert_eq!(trainer.options().extra.get("custom_flag"), Some(&json!(3)));
    }

    #[test]
    fn test_explicit_topology_wins() {
        let topology = ClusterTopology {
            global_rank: 1,
            world_size: 2,
            ..ClusterTopology::single_process()
        };
        let trainer = TrainerBuilder::new(TrainerOptions::default())
            .plugins(vec![Plugin::ClusterEnvironment(ElasticEnvironment)])
            .topology(topology.clone())
            .build::<TestBackend>(Default::default())
            .unwrap();
        assert_eq!(trainer.topology(), &topology);
        assert!(!trainer.is_global_zero());
    }
}
