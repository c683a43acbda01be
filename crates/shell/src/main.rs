//! `pennsim`: the interactive shell binary (spec §2 "Boot").

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use pennsim_kernel::context::KernelConfig;

/// Boot the PennSim pedagogical OS against a formatted filesystem image.
#[derive(Debug, Parser)]
#[command(name = "pennsim", version, about)]
struct Args {
    /// Backing filesystem image; must already exist (see `pennsim-mkfs`).
    /// Overrides `PENNSIM_FS_IMAGE` when given.
    image: Option<PathBuf>,

    /// Scheduler tick length in milliseconds. Overrides `PENNSIM_TICK_MS`.
    #[arg(long)]
    tick_ms: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("PENNSIM_LOG")
                .ok()
                .and_then(|v| tracing_subscriber::EnvFilter::try_new(v).ok())
                .or_else(|| tracing_subscriber::EnvFilter::try_from_default_env().ok())
                .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = KernelConfig::from_env();
    if let Some(image) = args.image {
        config.fs_image_path = image;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_ms = tick_ms;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(pennsim_shell::boot::run(config))
}
