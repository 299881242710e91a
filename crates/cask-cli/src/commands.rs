use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::json;
use tracing::{debug, info};

use cask_metrics::SoftQuotaService;
use cask_store::{
    validate_configs, Blob, BlobStore, CaskConfig, FileBlobStore, FixedDirectories, StoreConfig,
};
use cask_types::{
    Headers, LifecycleState, BLOB_NAME_HEADER, CONTENT_TYPE_HEADER, DIRECT_PATH_BLOB_HEADER,
    TEMPORARY_BLOB_HEADER,
};

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let store = open_store(&cli)?;
    store.start().with_context(|| format!("starting blob store {}", store.name()))?;
    let command = command_name(&cli.command);
    debug!(store = %store.name(), command, "running command");
    let result = execute(&store, cli.command, &cli.format);
    if let Err(e) = &result {
        info!(store = %store.name(), command, error = %e, "command failed");
    }
    store.stop()?;
    result
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Init => "init",
        Command::Put(_) => "put",
        Command::Get(_) => "get",
        Command::Cp(_) => "cp",
        Command::Rm(_) => "rm",
        Command::Ls(_) => "ls",
        Command::Compact => "compact",
        Command::Sweep(_) => "sweep",
        Command::Metrics => "metrics",
    }
}

fn open_store(cli: &Cli) -> anyhow::Result<FileBlobStore> {
    let (config, dirs) = match (&cli.root, &cli.config) {
        (Some(root), _) => {
            let name = cli.store.clone().unwrap_or_else(|| "default".into());
            (StoreConfig::new(name, root), None)
        }
        (None, Some(path)) => {
            let file = CaskConfig::load(path)
                .with_context(|| format!("reading configuration {}", path.display()))?;
            let work_dir = file
                .work_dir
                .clone()
                .unwrap_or_else(|| path.parent().map(Path::to_path_buf).unwrap_or_default());
            debug!(config = %path.display(), work_dir = %work_dir.display(), "loaded configuration");
            let dirs = FixedDirectories::new(work_dir);
            validate_configs(&file.stores, &dirs, &SoftQuotaService)?;
            let config = match &cli.store {
                Some(name) => file
                    .store(name)
                    .with_context(|| format!("no store named {name} in {}", path.display()))?
                    .clone(),
                None => match file.stores.first() {
                    Some(config) => config.clone(),
                    None => bail!("{} defines no stores", path.display()),
                },
            };
            (config, Some(dirs))
        }
        (None, None) => bail!("either --root or --config is required"),
    };
    debug!(store = %config.name, node = config.node_id(), "opening blob store");

    let mut builder = FileBlobStore::builder(config);
    if let Some(dirs) = dirs {
        builder = builder.directories(Arc::new(dirs));
    }
    Ok(builder.build()?)
}

fn execute(store: &FileBlobStore, command: Command, format: &OutputFormat) -> anyhow::Result<()> {
    match command {
        Command::Init => cmd_init(store, format),
        Command::Put(args) => cmd_put(store, args, format),
        Command::Get(args) => cmd_get(store, args),
        Command::Cp(args) => cmd_cp(store, args, format),
        Command::Rm(args) => cmd_rm(store, args, format),
        Command::Ls(args) => cmd_ls(store, args, format),
        Command::Compact => cmd_compact(store, format),
        Command::Sweep(args) => cmd_sweep(store, args, format),
        Command::Metrics => cmd_metrics(store, format),
    }
}

fn print_json(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn blob_json(blob: &dyn Blob) -> serde_json::Value {
    json!({
        "id": blob.id().as_str(),
        "name": blob.headers().blob_name(),
        "size": blob.metrics().content_size,
        "sha1": blob.metrics().sha1,
        "created_ms": blob.metrics().created_ms,
    })
}

fn cmd_init(store: &FileBlobStore, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(json!({
            "name": store.name(),
            "root": store.root().display().to_string(),
        })),
        OutputFormat::Text => {
            println!(
                "{} Initialized blob store {} in {}",
                "✓".green().bold(),
                store.name().bold(),
                store.root().display()
            );
            Ok(())
        }
    }
}

fn cmd_put(store: &FileBlobStore, args: PutArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("file has no name; pass --name")?,
    };
    let mut headers = Headers::new().with(BLOB_NAME_HEADER, name);
    if let Some(content_type) = args.content_type {
        headers.insert(CONTENT_TYPE_HEADER, content_type);
    }
    if args.temporary {
        headers.insert(TEMPORARY_BLOB_HEADER, "true");
    }
    if args.direct_path {
        headers.insert(DIRECT_PATH_BLOB_HEADER, "true");
    }

    let mut file = File::open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;
    let blob = store.create(&mut file, headers)?;
    match format {
        OutputFormat::Json => print_json(blob_json(blob.as_ref())),
        OutputFormat::Text => {
            println!("{} Stored {}", "✓".green().bold(), blob.id().to_string().yellow());
            println!("  Size: {} bytes", blob.metrics().content_size);
            if let Some(sha1) = &blob.metrics().sha1 {
                println!("  SHA-1: {}", sha1.dimmed());
            }
            Ok(())
        }
    }
}

fn cmd_get(store: &FileBlobStore, args: GetArgs) -> anyhow::Result<()> {
    let blob = if args.include_deleted {
        store.get_including_deleted(&args.id)?
    } else {
        store.get(&args.id)?
    };
    let Some(blob) = blob else {
        bail!("blob {} not found", args.id);
    };
    let mut stream = blob.input_stream()?;
    match args.output {
        Some(path) => {
            let mut out = File::create(&path)
                .with_context(|| format!("creating {}", path.display()))?;
            io::copy(&mut stream, &mut out)?;
            out.sync_all()?;
        }
        None => {
            let mut out = io::stdout().lock();
            io::copy(&mut stream, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn cmd_cp(store: &FileBlobStore, args: CpArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let mut headers = Headers::new();
    if let Some(name) = args.name {
        headers.insert(BLOB_NAME_HEADER, name);
    } else if let Some(source) = store.get(&args.id)? {
        headers = source.headers().clone();
    }
    let copy = store.copy(&args.id, headers)?;
    match format {
        OutputFormat::Json => print_json(blob_json(copy.as_ref())),
        OutputFormat::Text => {
            println!(
                "{} Copied {} → {}",
                "✓".green().bold(),
                args.id.to_string().yellow(),
                copy.id().to_string().yellow()
            );
            Ok(())
        }
    }
}

fn cmd_rm(store: &FileBlobStore, args: RmArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let deleted = if args.hard {
        store.delete_hard(&args.id)?
    } else {
        store.delete(&args.id, &args.reason)?
    };
    match format {
        OutputFormat::Json => print_json(json!({
            "id": args.id.as_str(),
            "deleted": deleted,
            "hard": args.hard,
        })),
        OutputFormat::Text => {
            if deleted {
                let how = if args.hard { "Deleted" } else { "Marked for deletion:" };
                println!("{} {} {}", "✓".green().bold(), how, args.id.to_string().yellow());
            } else {
                println!("Nothing to delete for {}", args.id.to_string().yellow());
            }
            Ok(())
        }
    }
}

fn cmd_ls(store: &FileBlobStore, args: LsArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let ids = match (args.state, args.prefix) {
        (Some(state), _) => store.blob_ids_with_state(state),
        (None, Some(prefix)) => store.direct_path_blob_ids(&prefix)?,
        (None, None) => store.blob_ids()?,
    };
    match format {
        OutputFormat::Json => print_json(json!(ids.iter().map(|id| id.as_str()).collect::<Vec<_>>())),
        OutputFormat::Text => {
            for id in &ids {
                let state = match store.metadata().get(id)? {
                    Some(attributes) => attributes.state,
                    None => LifecycleState::Creating,
                };
                let label = match state {
                    LifecycleState::Alive => state.as_str().green(),
                    LifecycleState::MarkedForDeletion => state.as_str().red(),
                    LifecycleState::Creating => state.as_str().dimmed(),
                };
                println!("{}  {}", id, label);
            }
            Ok(())
        }
    }
}

fn cmd_compact(store: &FileBlobStore, format: &OutputFormat) -> anyhow::Result<()> {
    let report = store.compact_with_report()?;
    match format {
        OutputFormat::Json => print_json(json!({
            "purged": report.purged,
            "deferred": report.deferred,
            "metadata_live": report.metadata.live,
            "metadata_reclaimed": report.metadata.reclaimed,
        })),
        OutputFormat::Text => {
            println!("{} Compacted: {} blobs purged", "✓".green(), report.purged);
            if report.deferred > 0 {
                println!("  {} blobs still in use, kept for next time", report.deferred.to_string().yellow());
            }
            Ok(())
        }
    }
}

fn cmd_sweep(store: &FileBlobStore, args: SweepArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let report = store.sweep_temporary(Duration::from_secs(args.max_age_secs))?;
    match format {
        OutputFormat::Json => print_json(json!({
            "blobs": report.blobs,
            "ingest_files": report.ingest_files,
        })),
        OutputFormat::Text => {
            println!(
                "{} Swept {} temporary blobs, {} ingest files",
                "✓".green(),
                report.blobs,
                report.ingest_files
            );
            Ok(())
        }
    }
}

fn cmd_metrics(store: &FileBlobStore, format: &OutputFormat) -> anyhow::Result<()> {
    store.flush_metrics()?;
    let metrics = store.metrics()?;
    let quota = store.metrics_store().last_quota_result();
    match format {
        OutputFormat::Json => print_json(json!({
            "blob_count": metrics.blob_count,
            "total_size": metrics.total_size,
            "available_space": metrics.available_space,
            "storage_available": store.is_storage_available(),
            "quota": quota.map(|q| json!({ "violation": q.violation, "message": q.message })),
        })),
        OutputFormat::Text => {
            println!("Blob store {}", store.name().bold());
            println!("  Blobs: {}", metrics.blob_count);
            println!("  Total size: {} bytes", metrics.total_size);
            println!("  Available space: {} bytes", metrics.available_space);
            if let Some(q) = quota {
                if q.violation {
                    println!("  Quota: {} {}", "violated".red().bold(), q.message);
                } else {
                    println!("  Quota: {}", "ok".green());
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run(args: &[&str]) -> anyhow::Result<()> {
        run_command(Cli::try_parse_from(args).unwrap())
    }

    fn reopen(root: &Path) -> FileBlobStore {
        let store = FileBlobStore::builder(StoreConfig::new("default", root)).build().unwrap();
        store.start().unwrap();
        store
    }

    #[test]
    fn put_then_rm_then_compact() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let root_arg = root.to_str().unwrap();
        let input = dir.path().join("hello.txt");
        std::fs::write(&input, b"hello").unwrap();

        run(&["cask", "--root", root_arg, "init"]).unwrap();
        run(&["cask", "--root", root_arg, "put", input.to_str().unwrap()]).unwrap();

        let id = {
            let store = reopen(&root);
            let ids = store.blob_ids().unwrap();
            assert_eq!(ids.len(), 1);
            let blob = store.get(&ids[0]).unwrap().unwrap();
            assert_eq!(blob.headers().blob_name(), Some("hello.txt"));
            assert_eq!(store.metrics().unwrap().total_size, 5);
            store.stop().unwrap();
            ids[0].clone()
        };

        let out = dir.path().join("out.txt");
        run(&["cask", "--root", root_arg, "get", id.as_str(), "-o", out.to_str().unwrap()]).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello");

        run(&["cask", "--root", root_arg, "rm", id.as_str()]).unwrap();
        run(&["cask", "--root", root_arg, "--format", "json", "compact"]).unwrap();

        let store = reopen(&root);
        assert!(store.blob_ids().unwrap().is_empty());
        assert_eq!(store.metrics().unwrap().blob_count, 0);
    }

    #[test]
    fn put_direct_path_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let root_arg = root.to_str().unwrap();
        let input = dir.path().join("status.txt");

        std::fs::write(&input, b"first").unwrap();
        run(&["cask", "--root", root_arg, "put", input.to_str().unwrap(), "--name", "health/status.txt", "--direct-path"]).unwrap();
        std::fs::write(&input, b"second!").unwrap();
        run(&["cask", "--root", root_arg, "put", input.to_str().unwrap(), "--name", "health/status.txt", "--direct-path"]).unwrap();
        run(&["cask", "--root", root_arg, "ls", "--prefix", "health"]).unwrap();

        let store = reopen(&root);
        let ids = store.direct_path_blob_ids("health").unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].as_str(), "path$health/status.txt");
        assert_eq!(store.metrics().unwrap().total_size, 7);
    }

    #[test]
    fn get_of_missing_blob_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        assert!(run(&["cask", "--root", &root, "get", "missing"]).is_err());
    }

    #[test]
    fn store_selected_from_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("cask.toml");
        std::fs::write(
            &config,
            "[[store]]\nname = \"one\"\npath = \"one\"\n\n[[store]]\nname = \"two\"\npath = \"two\"\n",
        )
        .unwrap();
        let config_arg = config.to_str().unwrap();

        run(&["cask", "--config", config_arg, "--store", "two", "init"]).unwrap();
        assert!(dir.path().join("blobs/two/metadata.properties").exists());
        assert!(!dir.path().join("blobs/one").exists());

        assert!(run(&["cask", "--config", config_arg, "--store", "three", "init"]).is_err());
    }

    #[test]
    fn requires_a_store_location() {
        assert!(run(&["cask", "metrics"]).is_err());
    }
}
