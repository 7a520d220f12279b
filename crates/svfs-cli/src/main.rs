//! svfs command-line front end.
//!
//! Mounts the index image named in a configuration file, registers its
//! datastores, runs one operation, syncs and unmounts. Paths are virtual
//! paths from the svfs root.
//!
//! ```bash
//! svfs -c svfs.toml mkdir /dir1
//! echo hello | svfs -c svfs.toml write /dir1/f1
//! svfs -c svfs.toml cat /dir1/f1
//! svfs -c svfs.toml stat /dir1/f1
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt};

use svfs_kernel::vfs::{DatastoreInfo, ROOT_INO};
use svfs_kernel::{CreateOptions, FileAttr, FileType, Ino, SetAttr, Svfs, SvfsConfig, WriteFlags};

/// Stacking metadata filesystem tool.
#[derive(Parser, Debug)]
#[command(name = "svfs")]
#[command(about = "Operate on an svfs namespace")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "svfs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty file
    Touch {
        path: String,
        /// Defer datastore assignment until the first write
        #[arg(long)]
        delay_alloc: bool,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Create a symlink
    Ln { target: String, path: String },
    /// List a directory
    Ls { path: Option<String> },
    /// Print file contents
    Cat { path: String },
    /// Write stdin to a file, creating it if needed
    Write {
        path: String,
        /// Append instead of overwriting from offset 0
        #[arg(long)]
        append: bool,
    },
    /// Set a file's size
    Truncate { path: String, size: u64 },
    /// Remove a file or symlink
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Move an entry
    Mv { from: String, to: String },
    /// Print attributes as JSON
    Stat { path: String },
    /// Print capacity as JSON
    Statfs,
    /// List registered datastores
    Datastores,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = SvfsConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.tracing.filter.as_deref().unwrap_or("info"))
    });
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let svfs = Svfs::from_config(&config).context("mounting")?;
    let result = run(&svfs, args.command);
    svfs.unmount().context("unmounting")?;
    result
}

fn run(svfs: &Svfs, command: Command) -> Result<()> {
    match command {
        Command::Touch { path, delay_alloc } => {
            let (parent, name) = split_parent(svfs, &path)?;
            let opts = if delay_alloc {
                CreateOptions::new().with_delay_alloc(true)
            } else {
                CreateOptions::new()
            };
            let attr = svfs.create(parent, name, &opts)?;
            tracing::info!(path = %path, ino = attr.ino, "created");
        }
        Command::Mkdir { path } => {
            let (parent, name) = split_parent(svfs, &path)?;
            svfs.mkdir(parent, name, &CreateOptions::new())?;
        }
        Command::Ln { target, path } => {
            let (parent, name) = split_parent(svfs, &path)?;
            svfs.symlink(parent, name, &target)?;
        }
        Command::Ls { path } => {
            let dir = svfs.resolve(path.as_deref().unwrap_or("/"))?;
            let mut stdout = std::io::stdout().lock();
            let mut cookie = ROOT_INO;
            loop {
                let page = svfs.readdir(dir, cookie, 128)?;
                let Some(last) = page.last() else { break };
                cookie = last.ino;
                for entry in &page {
                    let marker = match entry.kind {
                        FileType::Directory => "/",
                        FileType::Symlink => "@",
                        FileType::File => "",
                    };
                    writeln!(stdout, "{:>6}  {}{}", entry.ino, entry.name, marker)?;
                }
            }
        }
        Command::Cat { path } => {
            let ino = svfs.resolve(&path)?;
            let size = svfs.getattr(ino)?.size;
            let data = svfs.read(ino, 0, usize::try_from(size)?)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Write { path, append } => {
            let mut data = Vec::new();
            std::io::stdin().read_to_end(&mut data)?;
            let ino = match svfs.resolve(&path) {
                Ok(ino) => ino,
                Err(e) if e.is_not_found() => {
                    let (parent, name) = split_parent(svfs, &path)?;
                    svfs.create(parent, name, &CreateOptions::new())?.ino
                }
                Err(e) => return Err(e.into()),
            };
            let flags = if append {
                WriteFlags::append()
            } else {
                svfs.setattr(ino, &SetAttr::new().with_size(0))?;
                WriteFlags::default()
            };
            let n = svfs.write(ino, 0, &data, flags)?;
            svfs.fsync(ino)?;
            tracing::info!(path = %path, bytes = n, "written");
        }
        Command::Truncate { path, size } => {
            let ino = svfs.resolve(&path)?;
            svfs.truncate(ino, size)?;
        }
        Command::Rm { path } => {
            let (parent, name) = split_parent(svfs, &path)?;
            svfs.unlink(parent, name)?;
        }
        Command::Rmdir { path } => {
            let (parent, name) = split_parent(svfs, &path)?;
            svfs.rmdir(parent, name)?;
        }
        Command::Mv { from, to } => {
            let (old_parent, old_name) = split_parent(svfs, &from)?;
            let (new_parent, new_name) = split_parent(svfs, &to)?;
            svfs.rename(old_parent, old_name, new_parent, new_name)?;
        }
        Command::Stat { path } => {
            let ino = svfs.resolve(&path)?;
            print_json(&Stat::new(svfs, ino, svfs.getattr(ino)?))?;
        }
        Command::Statfs => print_json(&svfs.statfs())?,
        Command::Datastores => {
            let stores: Vec<_> = svfs.registry().list().iter().map(StoreRow::from).collect();
            print_json(&stores)?;
        }
    }
    Ok(())
}

/// Split `/a/b/c` into the inode of `/a/b` and `c`.
fn split_parent<'a>(svfs: &Svfs, path: &'a str) -> Result<(Ino, &'a str)> {
    let trimmed = path.trim_end_matches('/');
    let Some((dir, name)) = trimmed.rsplit_once('/') else {
        bail!("{path}: expected an absolute path");
    };
    if name.is_empty() {
        bail!("{path}: no name component");
    }
    let parent = svfs.resolve(if dir.is_empty() { "/" } else { dir })?;
    Ok((parent, name))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

#[derive(Serialize)]
struct Stat {
    #[serde(flatten)]
    attr: FileAttr,
    index_path: String,
    datastore: Option<String>,
    connection: Option<String>,
}

impl Stat {
    fn new(svfs: &Svfs, ino: Ino, attr: FileAttr) -> Self {
        let entry = svfs.index().entry(ino).ok();
        Self {
            index_path: svfs.reconstruct_path(ino).unwrap_or_default(),
            datastore: entry
                .and_then(|e| e.backing)
                .map(|b| format!("{}:{:#x}", b.kind, b.fsid)),
            connection: svfs.connection_state(ino).map(|s| format!("{s:?}")),
            attr,
        }
    }
}

#[derive(Serialize)]
struct StoreRow {
    kind: String,
    fsid: String,
    path: PathBuf,
}

impl From<&DatastoreInfo> for StoreRow {
    fn from(info: &DatastoreInfo) -> Self {
        Self {
            kind: info.kind.to_string(),
            fsid: format!("{:#x}", info.fsid),
            path: info.path.clone(),
        }
    }
}
