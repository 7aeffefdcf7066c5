use clap::Parser;
use std::{error::Error, path::PathBuf};
use tracing_subscriber::EnvFilter;

mod checkpoint;
mod error;
mod generate;
mod grid;
mod model;

#[derive(Parser)]
#[clap(
    name = "stylegan-sample",
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
struct Entry {
    /// Checkpoint path
    path: PathBuf,
    /// Size of the image
    #[clap(long, default_value = "1024")]
    size: u32,
    /// Checkpoint entry holding the generator weights
    #[clap(long, default_value = "g_running")]
    key: String,
    /// Output directory
    #[clap(long, default_value = ".")]
    out_dir: PathBuf,
    /// Random seed
    #[clap(long)]
    seed: Option<i64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stylegan_sample=info")),
        )
        .init();

    let args = Entry::parse();
    let config = generate::Config {
        checkpoint: args.path,
        size: args.size,
        key: args.key,
        out_dir: args.out_dir,
        seed: args.seed,
    };
    generate::generate(&config)?;
    Ok(())
}
