//! The Start/Data/End data-transfer sub-protocol.
//!
//! Both directions are symmetric: the sending side opens with `Start` and
//! closes with `End`, and every frame it sends is acknowledged by
//! `Response(Ok)` from the receiving side. Used by client uploads, server
//! reads, and client downloads alike.

use std::path::Path;

use anyhow::Result;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::message::Message;
use crate::protocol::DATA_CHUNK_SIZE;
use crate::wire::{Connection, ProtocolError};

/// Stream the file at `path` to the peer.
pub async fn send_file(conn: &mut Connection, path: &Path) -> Result<()> {
    let mut file = File::open(path).await?;

    conn.send(&Message::Start).await?;
    conn.expect_ok().await?;

    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        conn.send(&Message::Data(buf[..n].to_vec())).await?;
        conn.expect_ok().await?;
    }

    conn.send(&Message::End).await?;
    conn.expect_ok().await?;
    Ok(())
}

/// Receive a file stream from the peer into `path`, overwriting it.
pub async fn receive_file(conn: &mut Connection, path: &Path) -> Result<()> {
    match conn.recv().await? {
        Message::Start => {}
        Message::Empty => return Err(ProtocolError::ConnectionLost.into()),
        other => return Err(unexpected("Start", &other)),
    }
    let mut file = File::create(path).await?;
    conn.send(&Message::ok()).await?;

    loop {
        match conn.recv().await? {
            Message::Data(chunk) => {
                file.write_all(&chunk).await?;
                conn.send(&Message::ok()).await?;
            }
            Message::End => {
                file.flush().await?;
                conn.send(&Message::ok()).await?;
                return Ok(());
            }
            Message::Empty => return Err(ProtocolError::ConnectionLost.into()),
            other => return Err(unexpected("Data or End", &other)),
        }
    }
}

fn unexpected(expected: &'static str, got: &Message) -> anyhow::Error {
    ProtocolError::Unexpected {
        expected,
        got: got.kind_name(),
    }
    .into()
}
