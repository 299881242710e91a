use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cask_types::{BlobId, LifecycleState};

#[derive(Parser)]
#[command(
    name = "cask",
    about = "Cask: file-based blob store administration",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file with one or more `[[store]]` tables
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Store root directory; overrides --config
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    /// Store to use from the configuration file (default: the first)
    #[arg(short, long, global = true)]
    pub store: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the store layout
    Init,
    /// Store a file as a new blob
    Put(PutArgs),
    /// Write a blob's content to a file or stdout
    Get(GetArgs),
    /// Copy a blob under new headers
    Cp(CpArgs),
    /// Delete a blob
    Rm(RmArgs),
    /// List blob ids
    Ls(LsArgs),
    /// Purge blobs marked for deletion
    Compact,
    /// Remove stale temporary blobs and ingest files
    Sweep(SweepArgs),
    /// Show store metrics and quota status
    Metrics,
}

#[derive(Args)]
pub struct PutArgs {
    pub file: PathBuf,
    /// Blob name header (default: the file name)
    #[arg(short, long)]
    pub name: Option<String>,
    #[arg(long)]
    pub content_type: Option<String>,
    /// Store as a temporary blob
    #[arg(long)]
    pub temporary: bool,
    /// Store at directpath/<name>, replacing any blob already there
    #[arg(long, conflicts_with = "temporary")]
    pub direct_path: bool,
}

#[derive(Args)]
pub struct GetArgs {
    pub id: BlobId,
    /// Output file (default: stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Also return blobs marked for deletion
    #[arg(long)]
    pub include_deleted: bool,
}

#[derive(Args)]
pub struct CpArgs {
    pub id: BlobId,
    /// Blob name header of the copy
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct RmArgs {
    pub id: BlobId,
    /// Remove files immediately instead of marking for deletion
    #[arg(long)]
    pub hard: bool,
    #[arg(long, default_value = "deleted from cli")]
    pub reason: String,
}

#[derive(Args)]
pub struct LsArgs {
    /// Only ids in this state (creating, alive, marked-for-deletion)
    #[arg(long)]
    pub state: Option<LifecycleState>,
    /// Only direct-path blobs below this directory ("." for all)
    #[arg(long, conflicts_with = "state")]
    pub prefix: Option<String>,
}

#[derive(Args)]
pub struct SweepArgs {
    /// Minimum age in seconds of what gets removed
    #[arg(long, default_value = "86400")]
    pub max_age_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_with_root() {
        let cli = Cli::try_parse_from(["cask", "--root", "/tmp/store", "init"]).unwrap();
        assert!(matches!(cli.command, Command::Init));
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/store")));
    }

    #[test]
    fn parse_put() {
        let cli = Cli::try_parse_from(["cask", "put", "a.jar", "--name", "lib/a.jar", "--temporary"]).unwrap();
        if let Command::Put(args) = cli.command {
            assert_eq!(args.file, PathBuf::from("a.jar"));
            assert_eq!(args.name, Some("lib/a.jar".into()));
            assert!(args.temporary);
            assert!(!args.direct_path);
        } else { panic!("wrong command"); }
        assert!(Cli::try_parse_from(["cask", "put", "a.jar", "--temporary", "--direct-path"]).is_err());
    }

    #[test]
    fn parse_get_output() {
        let cli = Cli::try_parse_from(["cask", "get", "abc", "-o", "out.bin"]).unwrap();
        if let Command::Get(args) = cli.command {
            assert_eq!(args.id.as_str(), "abc");
            assert_eq!(args.output, Some(PathBuf::from("out.bin")));
            assert!(!args.include_deleted);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_rm_hard() {
        let cli = Cli::try_parse_from(["cask", "rm", "abc", "--hard"]).unwrap();
        if let Command::Rm(args) = cli.command {
            assert!(args.hard);
            assert_eq!(args.reason, "deleted from cli");
        } else { panic!("wrong command"); }
    }

    #[test]
    fn rejects_unsafe_blob_id() {
        assert!(Cli::try_parse_from(["cask", "get", "../etc/passwd"]).is_err());
    }

    #[test]
    fn parse_ls_state() {
        let cli = Cli::try_parse_from(["cask", "ls", "--state", "marked-for-deletion"]).unwrap();
        if let Command::Ls(args) = cli.command {
            assert_eq!(args.state, Some(LifecycleState::MarkedForDeletion));
        } else { panic!("wrong command"); }
        assert!(Cli::try_parse_from(["cask", "ls", "--state", "zombie"]).is_err());
        let cli = Cli::try_parse_from(["cask", "ls", "--prefix", "health-check"]).unwrap();
        if let Command::Ls(args) = cli.command {
            assert_eq!(args.prefix.as_deref(), Some("health-check"));
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_sweep_default_age() {
        let cli = Cli::try_parse_from(["cask", "sweep"]).unwrap();
        if let Command::Sweep(args) = cli.command {
            assert_eq!(args.max_age_secs, 86400);
        } else { panic!("wrong command"); }
    }

    #[test]
    fn parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["cask", "metrics", "--format", "json", "-c", "cask.toml", "-s", "main"]).unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        assert_eq!(cli.config, Some(PathBuf::from("cask.toml")));
        assert_eq!(cli.store, Some("main".into()));
    }
}
