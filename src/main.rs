//! Interactive Syncbox client.
//!
//! Starts the reconciliation engine, the filesystem watcher, and the server
//! subscription, then serves a small command REPL on stdin. The REPL is just
//! another producer of operations; synchronization keeps running between
//! commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use syncbox::cli::{ClientOpts, Command};
use syncbox::client::{commands, sync, ClientConfig, SyncEngine};
use syncbox::protocol::format_timestamp;
use syncbox::watcher;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let sync_dir = opts
        .sync_dir
        .unwrap_or_else(|| PathBuf::from(format!("sync_dir_{}", opts.username)));
    std::fs::create_dir_all(&sync_dir)
        .with_context(|| format!("create sync dir {}", sync_dir.display()))?;

    let config = ClientConfig {
        server: opts.server,
        username: opts.username,
        sync_dir,
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run(config))
}

async fn run(config: ClientConfig) -> Result<()> {
    let engine = SyncEngine::start(config.clone());
    let _watcher = watcher::spawn(engine.clone())?;
    let _subscription = sync::spawn(engine.clone());

    println!("Connected to {} as {}", config.server, config.username);
    println!("Sync directory: {}", config.sync_dir.display());
    println!("Commands: upload, download, delete, list_server, list_client, get_sync_dir, exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            prompt();
            continue;
        }
        match Command::parse(&line) {
            Command::Exit => break,
            command => run_command(&config, command).await,
        }
        prompt();
    }
    Ok(())
}

fn prompt() {
    use std::io::Write;
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn run_command(config: &ClientConfig, command: Command) {
    match command {
        Command::Upload(path) => {
            if path.is_empty() {
                println!("Expected usage: upload <path/filename.ext>");
                return;
            }
            match commands::upload(config, Path::new(&path)).await {
                Ok(()) => println!("File uploaded successfully."),
                Err(e) => println!("Upload failed: {e:#}"),
            }
        }
        Command::Download(filename) => {
            if filename.is_empty() {
                println!("Expected usage: download <filename.ext>");
                return;
            }
            // An explicit download is a copy into the working directory; only
            // the sync directory is reconciled automatically.
            let result = match std::env::current_dir() {
                Ok(cwd) => commands::download(config, &filename, &cwd).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(path) => println!("Downloaded to {}", path.display()),
                Err(e) => println!("Download failed: {e:#}"),
            }
        }
        Command::Delete(filename) => {
            if filename.is_empty() {
                println!("Expected usage: delete <filename.ext>");
                return;
            }
            match commands::delete(config, &filename).await {
                Ok(true) => println!("File deleted successfully."),
                Ok(false) => println!("File not found."),
                Err(e) => println!("Delete failed: {e:#}"),
            }
        }
        Command::ListServer => match commands::list_server(config).await {
            Ok(files) => {
                println!("filename\tmtime\tatime\tctime");
                for file in files {
                    println!(
                        "{}\t{}\t{}\t{}",
                        file.filename,
                        format_timestamp(file.mtime),
                        format_timestamp(file.atime),
                        format_timestamp(file.ctime)
                    );
                }
            }
            Err(e) => println!("List failed: {e:#}"),
        },
        Command::ListClient => {
            if let Err(e) = list_local(&config.sync_dir) {
                println!("List failed: {e:#}");
            }
        }
        Command::GetSyncDir => println!("{}", config.sync_dir.display()),
        Command::Invalid(input) => {
            println!("Unknown command: {input}");
            println!("Commands: upload, download, delete, list_server, list_client, get_sync_dir, exit");
        }
        Command::Exit => {}
    }
}

fn list_local(dir: &Path) -> Result<()> {
    println!("filename\tmtime\tatime\tctime");
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime: DateTime<Utc> = meta.modified()?.into();
        let atime: DateTime<Utc> = meta.accessed().unwrap_or(meta.modified()?).into();
        let ctime: DateTime<Utc> = meta.created().unwrap_or(meta.modified()?).into();
        println!(
            "{}\t{}\t{}\t{}",
            entry.file_name().to_string_lossy(),
            format_timestamp(mtime),
            format_timestamp(atime),
            format_timestamp(ctime)
        );
    }
    Ok(())
}
