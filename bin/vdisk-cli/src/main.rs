//! VDisk CLI - Admin Command Line Interface
//!
//! Creates, inspects and edits virtual disk images.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vdisk_common::{BlockOffset, DiskConfig};
use vdisk_storage::{
    BlockKind, BlockView, ContinuationBlock, DirectoryEntry, Synchronizer, VirtualDirectory,
    VirtualDisk, VirtualPath,
};

#[derive(Parser, Debug)]
#[command(name = "vdisk-cli")]
#[command(about = "VDisk image admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "vdisk.toml")]
    config: PathBuf,

    /// Disk image to operate on
    #[arg(short, long, env = "VDISK_IMAGE")]
    image: PathBuf,

    /// Block size for new images (overrides the config file)
    #[arg(long)]
    block_size: Option<u32>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and format a new image
    Create {
        /// Capacity in bytes
        #[arg(long)]
        capacity: u64,
    },
    /// Show image details
    Info {
        #[arg(long)]
        json: bool,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Replace a file's content with stdin, creating the file if needed
    Write { path: String },
    /// Print a file
    Cat { path: String },
    /// Delete a file or a directory tree
    Rm { path: String },
    /// Move a file or directory into another directory
    Mv { path: String, dest: String },
    /// Rename a file or directory in place
    Rename { path: String, name: String },
    /// List blocks changed after a point in time
    Changes {
        /// RFC 3339 timestamp; defaults to the last synchronization
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        json: bool,
    },
    /// Set or clear the server association
    Associate { name: Option<String> },
    /// Decode one block as the given kind
    Inspect {
        offset: u32,
        #[arg(value_enum)]
        kind: KindArg,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Directory,
    DirectoryContinuation,
    File,
    FileContinuation,
    FreeList,
    Journal,
}

impl From<KindArg> for BlockKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Directory => Self::Directory,
            KindArg::DirectoryContinuation => Self::DirectoryContinuation,
            KindArg::File => Self::File,
            KindArg::FileContinuation => Self::FileContinuation,
            KindArg::FreeList => Self::FreeList,
            KindArg::Journal => Self::Journal,
        }
    }
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct Config {
    disk: DiskConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

#[derive(Debug, Serialize)]
struct DiskInfo {
    image: String,
    block_size: u32,
    block_count: u32,
    space_break: u32,
    free_blocks: u32,
    available_blocks: u32,
    total_size: u64,
    journal_records: usize,
    association: Option<String>,
    last_synchronized: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChangeRecord {
    offset: u32,
    at: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(block_size) = args.block_size {
        config.disk.block_size = block_size;
    }
    let log_level = args.log_level.unwrap_or(config.logging.level);

    // Initialize logging; stdout carries command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    info!("Using image {}", args.image.display());
    execute(
        args.command,
        &args.image,
        &config.disk,
        &mut io::stdin().lock(),
        &mut io::stdout().lock(),
    )
}

fn execute(
    command: Commands,
    image: &Path,
    config: &DiskConfig,
    input: &mut dyn Read,
    out: &mut dyn Write,
) -> Result<()> {
    if let Commands::Create { capacity } = command {
        let disk = VirtualDisk::create(image, capacity, config)?;
        writeln!(
            out,
            "Created {} ({} blocks of {} bytes)",
            image.display(),
            disk.manager().block_count(),
            disk.manager().block_size()
        )?;
        disk.close()?;
        return Ok(());
    }

    let disk = VirtualDisk::open(image, config)
        .with_context(|| format!("failed to open {}", image.display()))?;
    let result = run(&disk, command, input, out);
    disk.close()?;
    result
}

fn run(
    disk: &VirtualDisk,
    command: Commands,
    input: &mut dyn Read,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Create { .. } => bail!("image already exists"),
        Commands::Info { json } => {
            let info = disk_info(disk)?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
            } else {
                writeln!(out, "Image: {}", info.image)?;
                writeln!(out, "Block size: {}", info.block_size)?;
                writeln!(
                    out,
                    "Blocks: {} ({} in use, {} free)",
                    info.block_count, info.space_break, info.free_blocks
                )?;
                writeln!(out, "Available: {}", info.available_blocks)?;
                writeln!(out, "Total file size: {}", info.total_size)?;
                writeln!(out, "Journal records: {}", info.journal_records)?;
                writeln!(out, "Association: {}", info.association.as_deref().unwrap_or("-"))?;
                writeln!(
                    out,
                    "Last synchronized: {}",
                    info.last_synchronized.as_deref().unwrap_or("never")
                )?;
            }
        }
        Commands::Ls { path } => {
            let dir = disk.navigate(&path)?.into_directory()?;
            let mut children = dir.children()?;
            children.sort_by(|a, b| a.name().cmp(b.name()));
            for child in children {
                let kind = if child.is_directory() { 'd' } else { '-' };
                writeln!(out, "{kind} {:>12} {}", child.size()?, child.name())?;
            }
        }
        Commands::Mkdir { path } => {
            let (parent, name) = split_parent(disk, &path)?;
            parent.create_directory(&name)?;
        }
        Commands::Write { path } => {
            let mut content = Vec::new();
            input.read_to_end(&mut content)?;
            let file = match disk.navigate(&path) {
                Ok(node) => node.into_file()?,
                Err(err) if err.is_not_found() => {
                    let (parent, name) = split_parent(disk, &path)?;
                    parent.create_file(&name)?
                }
                Err(err) => return Err(err.into()),
            };
            file.write_all(&content)?;
            debug!("Wrote {} bytes to {}", content.len(), path);
        }
        Commands::Cat { path } => {
            let file = disk.navigate(&path)?.into_file()?;
            io::copy(&mut file.open(), out)?;
        }
        Commands::Rm { path } => {
            disk.navigate(&path)?.delete()?;
        }
        Commands::Mv { path, dest } => {
            let dest = disk.navigate(&dest)?.into_directory()?;
            disk.navigate(&path)?.move_to(&dest)?;
        }
        Commands::Rename { path, name } => {
            disk.navigate(&path)?.rename(&name)?;
        }
        Commands::Changes { since, json } => {
            let since = match since {
                Some(since) => since,
                None => disk
                    .last_synchronized()?
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            };
            let changes: Vec<_> = disk
                .changes_since(since)?
                .into_iter()
                .map(|change| ChangeRecord {
                    offset: change.offset.get(),
                    at: change.at.to_rfc3339(),
                })
                .collect();
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&changes)?)?;
            } else {
                for change in changes {
                    writeln!(out, "{:>8} {}", change.offset, change.at)?;
                }
            }
        }
        Commands::Associate { name } => {
            disk.associate(name.as_deref())?;
        }
        Commands::Inspect { offset, kind } => {
            inspect(disk, BlockOffset::new(offset), kind.into(), out)?;
        }
    }
    Ok(())
}

fn disk_info(disk: &VirtualDisk) -> Result<DiskInfo> {
    let manager = disk.manager();
    Ok(DiskInfo {
        image: disk
            .path()
            .map_or_else(|| "<memory>".to_string(), |path| path.display().to_string()),
        block_size: manager.block_size(),
        block_count: manager.block_count(),
        space_break: manager.space_break(),
        free_blocks: manager.free_block_count()?,
        available_blocks: manager.available_blocks()?,
        total_size: disk.root()?.total_size()?,
        journal_records: manager.journal_len()?,
        association: disk.association()?,
        last_synchronized: disk.last_synchronized()?.map(|at| at.to_rfc3339()),
    })
}

/// Resolve the parent directory of `path` and the final name
fn split_parent(disk: &VirtualDisk, path: &str) -> Result<(VirtualDirectory, String)> {
    let parsed = VirtualPath::parse(path)?;
    let Some(name) = parsed.file_name() else {
        bail!("{path} names the root directory");
    };
    let parent = format!("/{}", parsed.parent_segments().join("/"));
    let dir = disk.navigate(&parent)?.into_directory()?;
    Ok((dir, name.to_string()))
}

fn join_offsets(offsets: &[BlockOffset]) -> String {
    offsets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_entries(out: &mut dyn Write, entries: &[DirectoryEntry]) -> Result<()> {
    for entry in entries {
        let kind = if entry.is_directory() { 'd' } else { '-' };
        writeln!(out, "  {kind} {:>8} {}", entry.target, entry.name)?;
    }
    Ok(())
}

fn inspect(
    disk: &VirtualDisk,
    offset: BlockOffset,
    kind: BlockKind,
    out: &mut dyn Write,
) -> Result<()> {
    let view = disk.manager().view(offset, kind)?;
    writeln!(out, "Block {offset} as {}", view.kind())?;
    match &view {
        BlockView::Directory(block) => {
            writeln!(out, "Total size: {}", block.total_size()?)?;
            write_entries(out, &block.entries()?)?;
        }
        BlockView::DirectoryContinuation(block) => write_entries(out, &block.entries()?)?,
        BlockView::File(block) => {
            writeln!(out, "Size: {}", block.size()?)?;
            writeln!(out, "Offsets: {}", join_offsets(&block.offsets()?))?;
        }
        BlockView::FileContinuation(block) => {
            writeln!(out, "Offsets: {}", join_offsets(&block.offsets()?))?;
        }
        BlockView::FreeList(block) => {
            writeln!(out, "Total free: {}", block.total_free()?)?;
            writeln!(out, "Offsets: {}", join_offsets(&block.offsets()?))?;
        }
        BlockView::Journal(block) => {
            for entry in block.entries()? {
                writeln!(out, "  {:>8} {}", entry.offset, entry.at.to_rfc3339())?;
            }
        }
    }
    match view.next()? {
        Some(next) => writeln!(out, "Next: {next}")?,
        None => writeln!(out, "Next: none")?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        image: PathBuf,
        config: DiskConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let image = dir.path().join("test.vdisk");
            let fixture = Self {
                _dir: dir,
                image,
                config: DiskConfig::with_block_size(512),
            };
            fixture.run(Commands::Create { capacity: 256 * 512 });
            fixture
        }

        fn run_with_input(&self, command: Commands, input: &[u8]) -> String {
            let mut out = Vec::new();
            execute(command, &self.image, &self.config, &mut &input[..], &mut out).unwrap();
            String::from_utf8(out).unwrap()
        }

        fn run(&self, command: Commands) -> String {
            self.run_with_input(command, b"")
        }

        fn try_run(&self, command: Commands) -> Result<()> {
            execute(command, &self.image, &self.config, &mut io::empty(), &mut io::sink())
        }
    }

    #[test]
    fn test_write_and_cat() {
        let fixture = Fixture::new();
        fixture.run(Commands::Mkdir { path: "/docs".into() });
        fixture.run_with_input(Commands::Write { path: "/docs/a".into() }, b"hello");
        assert_eq!(fixture.run(Commands::Cat { path: "/docs/a".into() }), "hello");

        fixture.run_with_input(Commands::Write { path: "/docs/a".into() }, b"replaced");
        assert_eq!(fixture.run(Commands::Cat { path: "docs/a".into() }), "replaced");

        let listing = fixture.run(Commands::Ls { path: "/".into() });
        assert!(listing.starts_with("d "));
        assert!(listing.trim_end().ends_with("docs"));
    }

    #[test]
    fn test_mv_rename_rm() {
        let fixture = Fixture::new();
        fixture.run(Commands::Mkdir { path: "/a".into() });
        fixture.run(Commands::Mkdir { path: "/b".into() });
        fixture.run_with_input(Commands::Write { path: "/a/f".into() }, b"data");

        fixture.run(Commands::Mv {
            path: "/a/f".into(),
            dest: "/b".into(),
        });
        fixture.run(Commands::Rename {
            path: "/b/f".into(),
            name: "g".into(),
        });
        assert_eq!(fixture.run(Commands::Cat { path: "/b/g".into() }), "data");
        assert!(fixture.try_run(Commands::Cat { path: "/a/f".into() }).is_err());

        fixture.run(Commands::Rm { path: "/b".into() });
        assert_eq!(fixture.run(Commands::Ls { path: "/".into() }).lines().count(), 1);
    }

    #[test]
    fn test_write_into_missing_directory_fails() {
        let fixture = Fixture::new();
        let err = fixture
            .try_run(Commands::Write { path: "/missing/f".into() })
            .unwrap_err();
        assert!(err.to_string().contains("path not found"));
    }

    #[test]
    fn test_info_and_changes_json() {
        let fixture = Fixture::new();
        fixture.run(Commands::Associate {
            name: Some("server-a".into()),
        });
        fixture.run_with_input(Commands::Write { path: "/f".into() }, &[1u8; 600]);

        let info: serde_json::Value =
            serde_json::from_str(&fixture.run(Commands::Info { json: true })).unwrap();
        assert_eq!(info["block_size"], 512);
        assert_eq!(info["total_size"], 600);
        assert_eq!(info["association"], "server-a");

        let changes: Vec<serde_json::Value> = serde_json::from_str(&fixture.run(Commands::Changes {
            since: None,
            json: true,
        }))
        .unwrap();
        let offsets: Vec<_> = changes
            .iter()
            .map(|change| change["offset"].as_u64().unwrap())
            .collect();
        assert!(offsets.contains(&1));
        assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[test]
    fn test_inspect_root() {
        let fixture = Fixture::new();
        fixture.run(Commands::Mkdir { path: "/docs".into() });
        let text = fixture.run(Commands::Inspect {
            offset: 1,
            kind: KindArg::Directory,
        });
        assert!(text.starts_with("Block 1 as directory"));
        assert!(text.contains("docs"));
        assert!(text.ends_with("Next: none\n"));
    }

    #[test]
    fn test_load_config() {
        let dir = tempdir().unwrap();
        let missing = load_config(&dir.path().join("none.toml")).unwrap();
        assert_eq!(missing.disk.block_size, 4096);
        assert_eq!(missing.logging.level, "warn");

        let path = dir.path().join("vdisk.toml");
        let toml = "[disk]\nblock_size = 1024\n\n[logging]\nlevel = \"debug\"\n";
        std::fs::write(&path, toml).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.disk.block_size, 1024);
        assert_eq!(config.logging.level, "debug");

        std::fs::write(&path, "[disk]\nblock_size = \"big\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
