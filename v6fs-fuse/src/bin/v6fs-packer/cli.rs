use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Host directory whose regular files are copied into the root directory
    #[arg(long, short)]
    pub source: PathBuf,

    /// Output image file
    #[arg(long, short)]
    pub out: PathBuf,

    /// Total blocks of the image, including the reserved area
    #[arg(long, short, default_value_t = 8192)]
    pub blocks: u32,

    /// Do not store "." and ".." in directories
    #[arg(long)]
    pub no_dots: bool,

    /// Mark the volume read-only after packing
    #[arg(long)]
    pub read_only: bool,

    /// Number of block cache slots, at least 3
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u16).range(3..))]
    pub cache_slots: u16,
}
