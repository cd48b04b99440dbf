use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::codec::Method;
use crate::entry::{DesMode, Encryption};
use crate::workers::inspect::HashKind;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every subcommand.
#[derive(ClapArgs, Clone, Debug, Default)]
pub struct GlobalOpts {
    /// Number of worker threads. [default: one per entry, capped at the CPU count]
    #[arg(long, global = true)]
    pub threads: Option<usize>,

    /// Disable CPU-based worker throttling.
    #[arg(long, global = true)]
    pub no_monitor: bool,

    /// JSON file with engine settings. Missing fields keep their defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `packforge=trace`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Show a progress line on stderr.
    #[arg(long, global = true)]
    pub progress: bool,

    /// Passphrase for the secondary encryption layer. Falls back to PACKFORGE_KEY.
    #[arg(long, global = true)]
    pub key: Option<String>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create a new container from files and directories.
    #[command(alias = "c")]
    Create {
        /// One or more input files or directories.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Path of the container to write.
        #[arg(short, long)]
        output: PathBuf,

        /// Compression method for every file.
        #[arg(long, value_enum, default_value_t = Method::Zlib)]
        method: Method,

        /// Encrypt every file with this layer.
        #[arg(long, value_enum)]
        encrypt: Option<EncryptMode>,
    },

    /// List the entries of a container.
    #[command(alias = "l")]
    List {
        #[arg(required = true)]
        archive: PathBuf,
    },

    /// Extract entries to a directory.
    #[command(alias = "x")]
    Extract {
        #[arg(required = true)]
        archive: PathBuf,

        /// Entries or directories to extract. If empty, everything is extracted.
        files: Vec<String>,

        /// Destination directory. Defaults to the current directory.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rewrite a container: recompress, change encryption, add, remove or defragment.
    #[command(alias = "r")]
    Repack {
        #[arg(required = true)]
        archive: PathBuf,

        /// Write the result here instead of replacing the container.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Re-encode every entry with this method.
        #[arg(long, value_enum)]
        recompress: Option<Method>,

        /// Switch every entry to this encryption.
        #[arg(long, value_enum)]
        encrypt: Option<EncryptMode>,

        /// Drop stale padding between entries.
        #[arg(long)]
        defragment: bool,

        /// Files or directories to add.
        #[arg(long)]
        add: Vec<PathBuf>,

        /// Entries to remove (case-insensitive).
        #[arg(long)]
        remove: Vec<String>,
    },

    /// Print a digest of every entry's content.
    Hash {
        #[arg(required = true)]
        archive: PathBuf,

        #[arg(long, value_enum, default_value_t = HashKind::Blake3)]
        algo: HashKind,
    },

    /// Detect entries whose payload looks encrypted but is not flagged.
    Classify {
        #[arg(required = true)]
        archive: PathBuf,
    },
}

/// Encryption selectable on the command line.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum EncryptMode {
    /// Remove all encryption.
    None,
    /// DES over the leading blocks.
    Des,
    /// DES over the leading blocks plus cyclic blocks and shuffling.
    Mixed,
    /// The passphrase-keyed secondary layer.
    Secondary,
}

impl From<EncryptMode> for Encryption {
    fn from(mode: EncryptMode) -> Self {
        match mode {
            EncryptMode::None => Encryption::NONE,
            EncryptMode::Des => Encryption { des: Some(DesMode::Header), secondary: false },
            EncryptMode::Mixed => Encryption { des: Some(DesMode::Mixed), secondary: false },
            EncryptMode::Secondary => Encryption { des: None, secondary: true },
        }
    }
}

/// Gets the secondary-layer passphrase from the command-line option or the
/// `PACKFORGE_KEY` environment variable.
pub fn key_from_opt_or_env(key_opt: Option<String>) -> Option<String> {
    key_opt.or_else(|| std::env::var("PACKFORGE_KEY").ok())
}

/// Parses command-line arguments using `clap`.
pub fn run() -> Result<Args, clap::Error> {
    Args::try_parse()
}
