//! Client operations over fresh per-operation connections.
//!
//! Each function opens its own connection (with login handshake), runs one
//! command round trip plus its sub-protocol, and drops the connection. Used
//! both by the reconciliation engine's spawned tasks and by the REPL.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::ClientConfig;
use crate::message::{Message, ResponseCode};
use crate::protocol::is_filename_valid;
use crate::transfer;
use crate::wire::{Connection, ProtocolError};

/// One row of a server listing.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub filename: String,
    pub mtime: DateTime<Utc>,
    pub atime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
}

async fn connect(config: &ClientConfig) -> Result<Connection> {
    Connection::connect(&config.server, &config.username).await
}

fn unexpected(expected: &'static str, got: &Message) -> anyhow::Error {
    ProtocolError::Unexpected {
        expected,
        got: got.kind_name(),
    }
    .into()
}

/// Upload the file at `path`; the server stores it under its basename.
pub async fn upload(config: &ClientConfig, path: &Path) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("no filename in {}", path.display()))?;
    anyhow::ensure!(is_filename_valid(filename), "invalid filename {filename:?}");

    let mut conn = connect(config).await?;
    let reply = conn
        .request(&Message::Upload { filename: filename.to_string() })
        .await?;
    if !reply.is_ok() {
        return Err(unexpected("Response(Ok)", &reply));
    }
    transfer::send_file(&mut conn, path).await
}

/// Download `filename` into `dest_dir`; returns the written path.
pub async fn download(config: &ClientConfig, filename: &str, dest_dir: &Path) -> Result<PathBuf> {
    anyhow::ensure!(is_filename_valid(filename), "invalid filename {filename:?}");

    let mut conn = connect(config).await?;
    let reply = conn
        .request(&Message::Download { filename: filename.to_string() })
        .await?;
    match reply {
        Message::Response(ResponseCode::Ok) => {}
        Message::Response(ResponseCode::FileNotFound) => {
            anyhow::bail!("file not found on server: {filename}")
        }
        other => return Err(unexpected("Response", &other)),
    }
    let path = dest_dir.join(filename);
    transfer::receive_file(&mut conn, &path).await?;
    Ok(path)
}

/// Delete `filename` on the server. `Ok(false)` means it was not there,
/// which callers treat as a legitimate outcome, not an error.
pub async fn delete(config: &ClientConfig, filename: &str) -> Result<bool> {
    anyhow::ensure!(is_filename_valid(filename), "invalid filename {filename:?}");

    let mut conn = connect(config).await?;
    let reply = conn
        .request(&Message::Delete { filename: filename.to_string() })
        .await?;
    match reply {
        Message::Response(ResponseCode::Ok) => {}
        Message::Response(ResponseCode::FileNotFound) => return Ok(false),
        other => return Err(unexpected("Response", &other)),
    }
    let reply = conn.request(&Message::Start).await?;
    if !reply.is_ok() {
        return Err(unexpected("Response(Ok)", &reply));
    }
    Ok(true)
}

/// Fetch the server's listing for this user.
pub async fn list_server(config: &ClientConfig) -> Result<Vec<RemoteFile>> {
    let mut conn = connect(config).await?;
    let reply = conn.request(&Message::List).await?;
    if !reply.is_ok() {
        return Err(unexpected("Response(Ok)", &reply));
    }

    let mut files = Vec::new();
    let mut msg = conn.request(&Message::Start).await?;
    loop {
        match msg {
            Message::FileInfo {
                filename,
                mtime,
                atime,
                ctime,
            } => {
                files.push(RemoteFile {
                    filename,
                    mtime,
                    atime,
                    ctime,
                });
                msg = conn.request(&Message::ok()).await?;
            }
            Message::End => {
                // Terminal acknowledgement; the server expects no reply to it.
                conn.send(&Message::ok()).await?;
                return Ok(files);
            }
            other => return Err(unexpected("FileInfo or End", &other)),
        }
    }
}
