use anyhow::{Context, Result};
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use serde_json::{json, Map, Value};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use super::callbacks::{Callback, SavedCheckpoint};
use super::options::BatchLimit;
use super::Trainer;
use crate::checkpoint::{
    load_record, read_meta, remove_checkpoint, restore_components, save_model, save_record, TrainingProgress,
    OPTIMIZER_FILE,
};
use crate::data::DataLoader;
use crate::models::TrainableModel;

/// Averages collected during one epoch.
#[derive(Debug, Default)]
struct EpochMetrics {
    train_loss: Option<f64>,
    val_loss: Option<f64>,
}

impl EpochMetrics {
    fn get(&self, name: &str) -> Option<f64> {
        match name {
            "train_loss" => self.train_loss,
            "val_loss" => self.val_loss,
            _ => None,
        }
    }
}

fn batch_limit(limit: Option<BatchLimit>, available: Option<usize>) -> Option<usize> {
    limit.and_then(|l| l.resolve(available))
}

fn stopped_mid_epoch(seen: usize, limit: Option<usize>, available: Option<usize>) -> bool {
    let total = match (limit, available) {
        (Some(limit), Some(available)) => Some(limit.min(available)),
        (limit, available) => limit.or(available),
    };
    total.map_or(true, |total| seen < total)
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Train `model` until an epoch, step or time budget runs out and return it.
    pub fn fit<M: TrainableModel<B>>(&mut self, model: M) -> Result<M> {
        let device = self.device.clone();
        let optim_config = model.optim_config().clone();
        let lr = optim_config.lr;
        let mut optim = optim_config
            .adam(self.options.gradient_clip_val)?
            .init::<B, M>();
        let mut model = model;

        if let Some(dir) = self.resume_from.clone() {
            (model, optim) = self.resume(model, optim, &dir)?;
        }

        self.write_hparams(&model)?;
        model = model.on_fit_start();

        let mut train_loader = model.train_dataloader(&device)?;
        let mut val_loader = model.val_dataloader(&device)?;
        let train_limit = batch_limit(self.options.limit_train_batches, train_loader.num_batches());
        let val_limit = batch_limit(
            self.options.limit_val_batches,
            val_loader.as_ref().and_then(|l| l.num_batches()),
        );

        let max_epochs = self.options.epoch_budget();
        let max_steps = self.options.step_budget();
        let accumulate = self.options.accumulate_grad_batches.max(1);
        let log_every = self.options.log_every_n_steps.max(1);
        let check_val_every = self.options.check_val_every_n_epoch.max(1);

        for callback in &mut self.callbacks {
            if let Callback::Timer(timer) = callback {
                timer.start();
            }
        }

        info!(
            "Starting fit at epoch {} step {} (max_epochs {:?}, max_steps {:?}, {} batches per epoch)",
            self.progress.epoch,
            self.progress.global_step,
            self.options.max_epochs,
            max_steps,
            train_limit
                .or(train_loader.num_batches())
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string())
        );

        let step_budget_spent = |step: usize| max_steps.is_some_and(|max| step >= max);
        let mut stop = step_budget_spent(self.progress.global_step);

        while !stop && self.progress.epoch < max_epochs {
            train_loader.reset();
            let mut accumulator = GradientsAccumulator::new();
            let mut pending = 0usize;
            let mut loss_sum = 0.0f64;
            let mut loss_count = 0usize;
            let mut index = 0usize;

            while let Some(batch) = train_loader.next_batch()? {
                if train_limit.is_some_and(|limit| index >= limit) {
                    break;
                }
                let owned = self.topology.owns_batch(index);
                index += 1;
                if !owned {
                    continue;
                }

                let loss = model.training_step(batch);
                let value = loss.clone().into_scalar().elem::<f32>();
                if !value.is_finite() {
                    warn!("Non-finite training loss at step {}", self.progress.global_step);
                }
                loss_sum += f64::from(value);
                loss_count += 1;

                let grads = GradientsParams::from_grads(loss.div_scalar(accumulate as f32).backward(), &model);
                accumulator.accumulate(&model, grads);
                pending += 1;

                if pending == accumulate {
                    model = optim.step(lr, model, accumulator.grads());
                    pending = 0;
                    self.progress.global_step += 1;

                    if self.progress.global_step % log_every == 0 {
                        info!(
                            "Epoch {} step {}: train_loss={:.4}",
                            self.progress.epoch, self.progress.global_step, value
                        );
                        self.log_metrics(json!({
                            "epoch": self.progress.epoch,
                            "step": self.progress.global_step,
                            "train_loss": value,
                            "lr": lr,
                        }))?;
                    }
                    if step_budget_spent(self.progress.global_step) {
                        info!("max_steps={} reached", self.progress.global_step);
                        stop = true;
                    }
                }

                if self.timer().is_some_and(|t| t.is_expired()) {
                    info!("Time limit reached, stopping");
                    stop = true;
                }
                if stop {
                    break;
                }
            }

            // A partial epoch skips validation and epoch-end checkpoints.
            if stop && stopped_mid_epoch(index, train_limit, train_loader.num_batches()) {
                if pending > 0 {
                    debug!("Dropping {} accumulated batches at stop", pending);
                }
                break;
            }
            if pending > 0 {
                model = optim.step(lr, model, accumulator.grads());
                self.progress.global_step += 1;
            }

            self.progress.epoch += 1;
            let mut metrics = EpochMetrics {
                train_loss: (loss_count > 0).then(|| loss_sum / loss_count as f64),
                val_loss: None,
            };
            if self.progress.epoch % check_val_every == 0 {
                if let Some(loader) = val_loader.as_deref_mut() {
                    metrics.val_loss = self.validate(&model, loader, val_limit)?;
                }
            }

            info!(
                "Epoch {} done: train_loss={} val_loss={}",
                self.progress.epoch - 1,
                metrics.train_loss.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into()),
                metrics.val_loss.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into()),
            );
            self.log_metrics(json!({
                "epoch": self.progress.epoch - 1,
                "step": self.progress.global_step,
                "train_loss_epoch": metrics.train_loss,
                "val_loss": metrics.val_loss,
            }))?;

            self.save_epoch_checkpoint(&model, &optim, &metrics)?;
        }

        self.on_train_end(&model, &optim)?;
        info!(
            "Fit finished after {} epochs, {} steps",
            self.progress.epoch, self.progress.global_step
        );
        Ok(model)
    }

    fn validate<M: TrainableModel<B>>(
        &self,
        model: &M,
        loader: &mut dyn DataLoader<M::Batch>,
        limit: Option<usize>,
    ) -> Result<Option<f64>> {
        loader.reset();
        let mut sum = 0.0f64;
        let mut count = 0usize;
        let mut index = 0usize;
        while let Some(batch) = loader.next_batch()? {
            if limit.is_some_and(|limit| index >= limit) {
                break;
            }
            let owned = self.topology.owns_batch(index);
            index += 1;
            if owned {
                sum += f64::from(model.validation_step(batch));
                count += 1;
            }
        }
        Ok((count > 0).then(|| sum / count as f64))
    }

    fn resume<M, O>(&mut self, model: M, optim: O, dir: &Path) -> Result<(M, O)>
    where
        M: TrainableModel<B>,
        O: Optimizer<M, B>,
    {
        info!("Resuming from checkpoint {:?}", dir);
        let (model, _) = restore_components(model, dir, true, &self.device)
            .with_context(|| format!("Failed to resume from {:?}", dir))?;

        let optim_path = dir.join(OPTIMIZER_FILE);
        let optim = if optim_path.exists() {
            optim.load_record(load_record::<B, O::Record>(&optim_path, &self.device)?)
        } else {
            warn!("No optimizer state in {:?}, starting with a fresh optimizer", dir);
            optim
        };

        if let Some(progress) = read_meta(dir)?.progress {
            for callback in &mut self.callbacks {
                if let Some(state) = progress.callbacks.get(callback.state_key()) {
                    callback.load_state_dict(state);
                }
            }
            self.progress = TrainingProgress {
                epoch: progress.epoch,
                global_step: progress.global_step,
                callbacks: Map::new(),
            };
        }
        Ok((model, optim))
    }

    fn write_hparams<M: TrainableModel<B>>(&self, model: &M) -> Result<()> {
        let Some(dir) = self.log_dir.as_ref().filter(|_| self.is_global_zero()) else {
            return Ok(());
        };
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        let path = dir.join("hparams.json");
        let json = serde_json::to_string_pretty(&model.model_config())?;
        fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
        debug!("Hyperparameters written to {:?}", path);
        Ok(())
    }

    fn log_metrics(&self, record: Value) -> Result<()> {
        let Some(path) = self.metrics_path.as_ref().filter(|_| self.is_global_zero()) else {
            return Ok(());
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open metrics file {:?}", path))?;
        writeln!(file, "{}", record).with_context(|| format!("Failed to write metrics to {:?}", path))?;
        Ok(())
    }

    fn callback_states(&self) -> Map<String, Value> {
        self.callbacks
            .iter()
            .filter_map(|c| c.state_dict().map(|state| (c.state_key().to_string(), state)))
            .collect()
    }

    fn write_checkpoint<M, O>(&self, model: &M, optim: &O, dir: &Path) -> Result<()>
    where
        M: TrainableModel<B>,
        O: Optimizer<M, B>,
    {
        let progress = TrainingProgress {
            epoch: self.progress.epoch,
            global_step: self.progress.global_step,
            callbacks: self.callback_states(),
        };
        save_model(model, dir, Some(progress))?;
        save_record::<B, O::Record>(optim.to_record(), &dir.join(OPTIMIZER_FILE))?;
        Ok(())
    }

    fn save_epoch_checkpoint<M, O>(&mut self, model: &M, optim: &O, metrics: &EpochMetrics) -> Result<()>
    where
        M: TrainableModel<B>,
        O: Optimizer<M, B>,
    {
        if !self.is_global_zero() {
            return Ok(());
        }
        let epoch = self.progress.epoch;
        let step = self.progress.global_step;
        let Some(callback) = self.checkpoint_callback_mut() else {
            return Ok(());
        };
        if !callback.should_save(epoch) {
            return Ok(());
        }

        let score = metrics.get(&callback.params().monitor);
        if score.is_none() {
            debug!("Monitored metric '{}' not available", callback.params().monitor);
        }
        let path = callback.checkpoint_path(epoch - 1, step, score);
        let save_last = callback.params().save_last;
        let last_path = callback.last_path();
        let pruned = callback.register(SavedCheckpoint {
            path: path.clone(),
            score,
            step,
        });

        if !pruned.contains(&path) {
            self.write_checkpoint(model, optim, &path)?;
        }
        for old in pruned.iter().filter(|p| **p != path) {
            remove_checkpoint(old)?;
        }
        if save_last {
            remove_checkpoint(&last_path)?;
            self.write_checkpoint(model, optim, &last_path)?;
        }
        Ok(())
    }

    fn on_train_end<M, O>(&self, model: &M, optim: &O) -> Result<()>
    where
        M: TrainableModel<B>,
        O: Optimizer<M, B>,
    {
        if !self.is_global_zero() {
            return Ok(());
        }
        let Some(callback) = self.checkpoint_callback() else {
            return Ok(());
        };
        if callback.params().save_last {
            let last_path = callback.last_path();
            remove_checkpoint(&last_path)?;
            self.write_checkpoint(model, optim, &last_path)?;
        }
        if callback.params().save_model_on_train_end {
            let export = callback.model_export_path();
            remove_checkpoint(&export)?;
            save_model(model, &export, None)?;
            info!("Final model saved to {:?}", export);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::list_checkpoints;
    use crate::config::ConfigTree;
    use crate::models::{DeepDiarizeModel, TrainableModel};
    use crate::trainer::{ClusterTopology, TrainerBuilder, TrainerOptions};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn model_cfg() -> ConfigTree {
        ConfigTree::new(json!({
            "feat_dim": 4,
            "max_speakers": 2,
            "frame_shift": 0.1,
            "segment_frames": 8,
            "hidden_size": 8,
            "num_layers": 1,
            "num_attention_heads": 2,
            "dropout": 0.0,
            "train_ds": {"batch_size": 2, "synthetic_sessions": 3},
            "validation_ds": {"batch_size": 2, "synthetic_sessions": 1}
        }))
    }

    fn trainer(root: &Path, options: Value) -> Trainer<TestBackend> {
        let mut options: TrainerOptions = serde_json::from_value(options).unwrap();
        options.default_root_dir = Some(root.to_path_buf());
        TrainerBuilder::new(options).build(Default::default()).unwrap()
    }

    #[test]
    fn test_fit_respects_max_steps() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(dir.path(), json!({"max_steps": 2, "enable_checkpointing": false}));
        let model = DeepDiarizeModel::from_config(&model_cfg(), &trainer).unwrap();
        trainer.fit(model).unwrap();
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn test_fit_checkpoints_and_resumes() {
        let dir = TempDir::new().unwrap();
        let metrics = dir.path().join("metrics.jsonl");
        let mut first = trainer(dir.path(), json!({"max_epochs": 1, "log_every_n_steps": 1}));
        first.set_metrics_path(metrics.clone());
        let model = DeepDiarizeModel::from_config(&model_cfg(), &first).unwrap();
        first.fit(model).unwrap();
        let steps = first.global_step();
        assert!(steps > 0);

        let checkpoints = dir.path().join("checkpoints");
        let last = checkpoints.join("model-last");
        assert!(last.join(OPTIMIZER_FILE).exists());
        assert!(checkpoints.join("model.model").join("meta.json").exists());
        assert!(!list_checkpoints(&checkpoints).is_empty());
        assert!(fs::read_to_string(&metrics).unwrap().lines().count() > steps);

        let mut second = trainer(dir.path(), json!({"max_epochs": 2}));
        second.set_resume_from(last);
        let model = DeepDiarizeModel::from_config(&model_cfg(), &second).unwrap();
        second.fit(model).unwrap();
        assert_eq!(second.current_epoch(), 2);
        assert_eq!(second.global_step(), steps * 2);
    }

    #[test]
    fn test_accumulation_and_batch_limit() {
        let dir = TempDir::new().unwrap();
        let mut trainer = trainer(
            dir.path(),
            json!({"max_epochs": 1, "limit_train_batches": 2, "accumulate_grad_batches": 2, "enable_checkpointing": false}),
        );
        let model = DeepDiarizeModel::from_config(&model_cfg(), &trainer).unwrap();
        trainer.fit(model).unwrap();
        assert_eq!(trainer.global_step(), 1);
    }

    #[test]
    fn test_non_zero_rank_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut options: TrainerOptions = serde_json::from_value(json!({"max_epochs": 1})).unwrap();
        options.default_root_dir = Some(dir.path().to_path_buf());
        let mut trainer = TrainerBuilder::new(options)
            .topology(ClusterTopology {
                global_rank: 1,
                world_size: 2,
                ..ClusterTopology::single_process()
            })
            .build::<TestBackend>(Default::default())
            .unwrap();
        let model = DeepDiarizeModel::from_config(&model_cfg(), &trainer).unwrap();
        trainer.fit(model).unwrap();
        assert!(!dir.path().join("checkpoints").exists());
    }
}
