mod cli;

use std::error::Error;
use std::fs;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use v6fs::layout::{SUPER_BLOCK_SECTOR, SuperBlock};
use v6fs::{BLOCK_SIZE, BlockCache, CacheConfig, DeviceId, DotLayout, FileKind, FormatOptions, Volume};
use v6fs_fuse::BlockFile;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nout={:?}", cli.source, cli.out);

    let block_file = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cli.out)?;
        fd.set_len(cli.blocks as u64 * BLOCK_SIZE as u64)?;

        fd
    })));

    let cache = Arc::new(BlockCache::new(CacheConfig {
        slots: cli.cache_slots.into(),
    }));
    let dev = cache.attach(block_file);
    let dots = if cli.no_dots {
        DotLayout::Absent
    } else {
        DotLayout::Embedded
    };
    Volume::format(
        &cache,
        dev,
        &FormatOptions {
            total_blocks: cli.blocks,
            dots,
            read_only: false,
        },
    )?;

    {
        let volume = Volume::load(Arc::clone(&cache), dev)?;
        let root = volume.root()?;
        for entry in fs::read_dir(&cli.source)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            println!("file: {name:?}");
            let data = fs::read(entry.path())?;
            let inode = root.create(name.as_encoded_bytes(), FileKind::Regular)?;
            inode.write_at(0, &data)?;
        }
        println!("files: {:?}", root.ls()?);
    }

    if cli.read_only {
        seal(&cache, dev)?;
    }
    cache.flush(Some(dev))?;
    Ok(())
}

/// 在超级块上打只读标记
fn seal(cache: &BlockCache, dev: DeviceId) -> v6fs::Result<()> {
    let mut bytes = [0; SuperBlock::SIZE];
    for (sector, chunk) in (SUPER_BLOCK_SECTOR..).zip(bytes.chunks_exact_mut(BLOCK_SIZE)) {
        chunk.copy_from_slice(&cache.read_block(dev, sector)?[..]);
    }
    let mut sb = SuperBlock::load(&bytes)?;
    sb.read_only = 1;
    sb.store(&mut bytes)?;
    for (sector, chunk) in (SUPER_BLOCK_SECTOR..).zip(bytes.chunks_exact(BLOCK_SIZE)) {
        let mut buf = cache.get_block(dev, sector);
        buf.copy_from_slice(chunk);
        cache.write_block(buf)?;
    }
    Ok(())
}
