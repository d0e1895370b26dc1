//! The two training entry points: config in, trainer and model built, `fit`.

use anyhow::{Context, Result};
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use crate::config::ConfigTree;
use crate::exp_manager::ExperimentManager;
use crate::models::{DeepDiarizeModel, ModelInit, UniversalPromptModel};
use crate::trainer::{assemble_plugins, DdpStrategy, Strategy, Trainer, TrainerBuilder};

fn model_section(cfg: &ConfigTree) -> ConfigTree {
    cfg.subtree("model").unwrap_or_default()
}

/// Trainer and model for universal prompt learning, with the experiment
/// manager configured in between.
pub fn build_prompt_learning<B, E>(
    cfg: &mut ConfigTree,
    exp_manager: &mut E,
    device: B::Device,
) -> Result<(Trainer<B>, UniversalPromptModel<B>)>
where
    B: AutodiffBackend,
    E: ExperimentManager<B>,
{
    info!("\n\n************** Experiment configuration ***********");
    info!("\n{}", cfg);

    let plugins = assemble_plugins(cfg)?;
    let mut trainer = TrainerBuilder::from_config(cfg)?
        .plugins(plugins)
        .strategy(Strategy::Ddp(DdpStrategy::without_hooks()))
        .use_stateless_timer(true)
        .build::<B>(device)?;

    exp_manager
        .configure(&mut trainer, cfg.subtree("exp_manager").as_ref())
        .context("Experiment manager setup failed")?;

    // Interpolated references to trainer.precision do not survive into the
    // model config, so the resolved value is copied across.
    cfg.set("model.precision", trainer.options().precision.clone())?;

    let init = ModelInit::for_prompt_learning(cfg);
    let model = init.build(&model_section(cfg), &trainer)?;
    Ok((trainer, model))
}

pub fn run_prompt_learning<B, E>(mut cfg: ConfigTree, exp_manager: &mut E, device: B::Device) -> Result<()>
where
    B: AutodiffBackend,
    E: ExperimentManager<B>,
{
    let (mut trainer, model) = build_prompt_learning(&mut cfg, exp_manager, device)?;
    trainer.fit(model)?;
    Ok(())
}

/// Trainer and model for neural diarization.
pub fn build_deep_diarize<B, E>(
    cfg: &ConfigTree,
    exp_manager: &mut E,
    device: B::Device,
) -> Result<(Trainer<B>, DeepDiarizeModel<B>)>
where
    B: AutodiffBackend,
    E: ExperimentManager<B>,
{
    info!("Hydra config: {}", cfg);
    let init = ModelInit::for_diarization(cfg)?;

    let mut trainer = TrainerBuilder::from_config(cfg)?.build::<B>(device)?;
    exp_manager
        .configure(&mut trainer, cfg.subtree("exp_manager").as_ref())
        .context("Experiment manager setup failed")?;

    let model = init.build(&model_section(cfg), &trainer)?;
    Ok((trainer, model))
}

pub fn run_deep_diarize<B, E>(cfg: ConfigTree, exp_manager: &mut E, device: B::Device) -> Result<()>
where
    B: AutodiffBackend,
    E: ExperimentManager<B>,
{
    let (mut trainer, model) = build_deep_diarize(&cfg, exp_manager, device)?;
    trainer.fit(model)?;
    Ok(())
}
