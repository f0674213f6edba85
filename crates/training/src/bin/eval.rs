use std::path::PathBuf;

use clap::Parser;
use training::util::evaluate_checkpoint;

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Validate the EMA networks of a checkpoint (precision, recall, mAP, bpp)"
)]
struct Args {
    /// Checkpoint directory (e.g. runs/train/weights/best).
    #[arg(long, default_value = "runs/train/weights/best")]
    checkpoint: PathBuf,
    /// Dataset descriptor; defaults to the one the run was trained with.
    #[arg(long)]
    data: Option<PathBuf>,
    /// Bit estimator record; defaults to the run's.
    #[arg(long)]
    bit_estimator: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let report = evaluate_checkpoint(
        &args.checkpoint,
        args.data.as_deref(),
        args.bit_estimator.as_deref(),
    )?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("fitness {:.5}", report.fitness());
    Ok(())
}
