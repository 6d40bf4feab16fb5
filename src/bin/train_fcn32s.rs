/// Train FCN-32s on PASCAL VOC style segmentation data
use clap::Parser;
use fcn_train::run::{run_train, TrainArgs};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = TrainArgs::parse();
    log::info!("=== FCN-32s training ({:?} preset) ===", args.preset);
    run_train(args)
}
