use anyhow::Result;
use clap::Parser;
use tracing::info;

use fitrun::backend::TrainBackend;
use fitrun::cli::{init_tracing, LaunchArgs};
use fitrun::exp_manager::ExpManager;
use fitrun::launch::run_deep_diarize;

#[derive(Debug, Parser)]
#[command(author, version, about = "Train the deep speaker diarization model")]
struct Cli {
    #[command(flatten)]
    launch: LaunchArgs,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let cfg = cli.launch.load_config("conf/neural_diarizer", "deep_diarize")?;
    run_deep_diarize::<TrainBackend, _>(cfg, &mut ExpManager, Default::default())?;

    info!("Training complete!");
    Ok(())
}
