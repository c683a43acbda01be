//! Standalone filesystem-formatting CLI (spec §1: "out of scope, specified
//! only as collaborator"). A thin wrapper over [`pennsim_kernel::fat::mkfs`];
//! no correctness logic lives here.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

/// Format a PennSim FAT filesystem image.
#[derive(Debug, Parser)]
#[command(name = "pennsim-mkfs", version, about)]
struct Args {
    /// Path of the backing file to create (overwritten if it exists).
    image: PathBuf,

    /// Number of FAT blocks, 1..=32 (spec §3 "FAT" entry 0 upper byte).
    #[arg(short = 'f', long, default_value_t = 1)]
    fat_blocks: u16,

    /// Block-size index into {256, 512, 1024, 2048, 4096}, 0..=4.
    #[arg(short = 'b', long, default_value_t = 0)]
    block_size_index: u8,
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
    if !(1..=32).contains(&args.fat_blocks) {
        bail!("fat-blocks must be in 1..=32, got {}", args.fat_blocks);
    }
    if !(0..=4).contains(&args.block_size_index) {
        bail!("block-size-index must be in 0..=4, got {}", args.block_size_index);
    }

    pennsim_kernel::fat::mkfs(&args.image, args.fat_blocks, args.block_size_index)
        .with_context(|| format!("failed to format {}", args.image.display()))?;

    tracing::info!(
        image = %args.image.display(),
        fat_blocks = args.fat_blocks,
        block_size_index = args.block_size_index,
        "filesystem image created"
    );
    println!(
        "created {} ({} FAT block(s), block size index {})",
        args.image.display(),
        args.fat_blocks,
        args.block_size_index
    );
    Ok(())
}
