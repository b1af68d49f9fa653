//! Shared CLI fragments and the interactive command grammar.

use clap::Parser;
use std::path::PathBuf;

/// Daemon options for syncboxd
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Syncbox daemon - per-user synchronized file trees")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:9004")]
    pub bind: String,

    /// Storage root; each user gets a directory beneath it
    #[arg(long, default_value = "out")]
    pub root: PathBuf,
}

/// Client options for the interactive syncbox binary
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Syncbox client - keep a local directory in sync with the server")]
pub struct ClientOpts {
    /// Username to log in as
    pub username: String,

    /// Server address (host:port)
    pub server: String,

    /// Local sync directory (default: sync_dir_<username>)
    #[arg(long)]
    pub sync_dir: Option<PathBuf>,
}

/// One line of REPL input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload(String),
    Download(String),
    Delete(String),
    ListServer,
    ListClient,
    GetSyncDir,
    Exit,
    Invalid(String),
}

impl Command {
    pub fn parse(input: &str) -> Command {
        let input = input.trim();
        let (keyword, parameter) = match input.split_once(char::is_whitespace) {
            Some((k, p)) => (k, p.trim().to_string()),
            None => (input, String::new()),
        };
        match keyword {
            "upload" => Command::Upload(parameter),
            "download" => Command::Download(parameter),
            "delete" => Command::Delete(parameter),
            "list_server" => Command::ListServer,
            "list_client" => Command::ListClient,
            "get_sync_dir" => Command::GetSyncDir,
            "exit" => Command::Exit,
            _ => Command::Invalid(input.to_string()),
        }
    }
}
