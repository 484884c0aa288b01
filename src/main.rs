use std::path::PathBuf;

use clap::Parser;
use log::error;

use eplumber::orchestrator::{self, Args as RunArgs};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to eplumber.json, overriding the usual discovery order
    /// (current directory, then the user config directory).
    #[clap(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP API on.
    #[clap(long, default_value = "0.0.0.0:8000")]
    bind: String,
}

fn main() {
    let args = Args::parse();
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    if let Err(e) = orchestrator::run(RunArgs {
        config_override: args.config,
        bind: args.bind,
    }) {
        error!("eplumber failed to start: {e:#}");
        std::process::exit(1);
    }
}
