use anyhow::Result;
use clap::Parser;
use tracing::info;

use fitrun::backend::TrainBackend;
use fitrun::cli::{init_tracing, LaunchArgs};
use fitrun::exp_manager::ExpManager;
use fitrun::launch::run_prompt_learning;

#[derive(Debug, Parser)]
#[command(author, version, about = "Universal prompt learning on a frozen language model")]
struct Cli {
    #[command(flatten)]
    launch: LaunchArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = cli.launch.load_config("conf", "megatron_gpt_universal_prompt_config")?;
    run_prompt_learning::<TrainBackend, _>(cfg, &mut ExpManager, Default::default())?;

    info!("Training complete!");
    Ok(())
}
