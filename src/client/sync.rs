//! The background subscription: one long-lived connection translating server
//! pushes into engine operations.

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{FileOperation, SyncEngine};
use crate::message::Message;
use crate::wire::{Connection, ProtocolError};

pub fn spawn(engine: SyncEngine) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run(&engine).await {
            error!(error = %e, "subscription failed");
        }
    })
}

async fn run(engine: &SyncEngine) -> Result<()> {
    let config = engine.config();
    let mut conn = Connection::connect(&config.server, &config.username).await?;
    let reply = conn.request(&Message::Subscribe).await?;
    if !reply.is_ok() {
        return Err(ProtocolError::Unexpected {
            expected: "Response(Ok)",
            got: reply.kind_name(),
        }
        .into());
    }
    info!(server = %config.server, "subscribed to updates");

    // The server streams a full baseline first, then pushes as files change.
    // Each push is acknowledged to keep the stream flowing.
    let mut msg = conn.request(&Message::Start).await?;
    loop {
        match msg {
            Message::FileUpdate {
                filename,
                timestamp,
            } => {
                info!(file = %filename, "update received");
                engine.queue(FileOperation::ServerUpdate {
                    filename,
                    timestamp,
                });
                msg = conn.request(&Message::ok()).await?;
            }
            Message::FileDelete {
                filename,
                timestamp,
            } => {
                info!(file = %filename, "delete received");
                engine.queue(FileOperation::ServerDelete {
                    filename,
                    timestamp,
                });
                msg = conn.request(&Message::ok()).await?;
            }
            Message::End | Message::Empty => {
                info!("server ended the subscription");
                return Ok(());
            }
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "FileUpdate, FileDelete or End",
                    got: other.kind_name(),
                }
                .into())
            }
        }
    }
}
