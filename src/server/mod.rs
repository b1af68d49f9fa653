//! Server side: accept loop, login handshake, and per-session action readers.
//!
//! Each logical operation arrives on its own connection (subscriptions keep
//! theirs open). After login the session is handed to the engine; an action
//! reader pulls exactly one command, turns it into a [`FileAction`], and the
//! spawned I/O task re-arms a fresh reader on the same connection when it
//! succeeds, so a session can issue further operations; a failed transfer
//! closes the connection so the peer observes end-of-stream.

mod state;
mod subs;

use std::path::Path;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::protocol;
use crate::wire::Connection;

pub use state::{ActionKind, Engine, FileAction};

/// One connected client: numeric id, username, and the owned connection.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub username: String,
    pub conn: Connection,
}

/// Bind and serve forever. Per-user trees live under `root/<username>/`.
pub async fn serve(bind: &str, root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("create storage root {}", root.display()))?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind, root = %root.display(), "syncbox daemon listening");

    let engine = Engine::new(root.to_path_buf());
    let mut next_id: u64 = 0;
    loop {
        let (stream, peer) = listener.accept().await?;
        let id = next_id;
        next_id += 1;
        debug!(client = id, %peer, "connection accepted");

        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_login(engine, Connection::new(stream), id).await {
                warn!(client = id, error = %e, "connection rejected");
            }
        });
    }
}

/// Login is the mandatory first message; anything else closes the connection.
async fn handle_login(engine: Engine, mut conn: Connection, id: u64) -> Result<()> {
    let username = match conn.recv().await? {
        Message::Login { username } => username,
        other => {
            let _ = conn.send(&Message::Response(crate::message::ResponseCode::Invalid)).await;
            anyhow::bail!("expected Login, got {}", other.kind_name());
        }
    };
    tokio::fs::create_dir_all(engine.user_dir(&username))
        .await
        .with_context(|| format!("create user dir for {username}"))?;
    conn.send(&Message::ok()).await?;
    info!(client = id, user = %username, "logged in");

    engine.attach(Session { id, username, conn });
    Ok(())
}

pub(crate) fn spawn_session(engine: Engine, session: Session) {
    tokio::spawn(expect_action(engine, session));
}

/// Read one command from the session and submit it. Ends the task either by
/// handing the session (and its connection) to the engine or by tearing the
/// session down on end-of-stream.
async fn expect_action(engine: Engine, mut session: Session) {
    loop {
        let msg = match session.conn.recv().await {
            Ok(msg) => msg,
            Err(e) => {
                warn!(client = session.id, error = %e, "session read failed");
                return;
            }
        };
        let timestamp = protocol::now();
        let (kind, filename) = match msg {
            Message::Upload { filename } => (ActionKind::Upload, filename),
            Message::Download { filename } => (ActionKind::Read, filename),
            Message::Delete { filename } => (ActionKind::Delete, filename),
            Message::List => (ActionKind::ListServer, String::new()),
            Message::Subscribe => (ActionKind::Subscribe, String::new()),
            Message::Empty => {
                info!(client = session.id, user = %session.username, "session closed");
                return;
            }
            other => {
                // Not valid between operations; drop it, keep the session.
                warn!(client = session.id, got = other.kind_name(), "unexpected message while idle");
                continue;
            }
        };
        debug!(client = session.id, user = %session.username, action = ?kind, file = %filename, "queued");
        engine.submit(FileAction {
            session,
            filename,
            kind,
            timestamp,
        });
        return;
    }
}
