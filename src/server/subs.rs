//! Subscriber registry and push fan-out.
//!
//! A subscription keeps its connection open for the life of the client; the
//! connection sits behind a mutex so baseline streaming and later pushes
//! serialize on it. Every push is acknowledged by the client with
//! `Response(Ok)`; a failed push drops the subscriber.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::state::{Engine, ServerOp, UserFiles};
use super::Session;
use crate::message::Message;
use crate::wire::{Connection, ProtocolError};

#[derive(Clone)]
pub(crate) struct Subscriber {
    pub(crate) id: u64,
    conn: Arc<Mutex<Connection>>,
}

/// Register the session's connection and stream the full resync baseline:
/// one FileUpdate per currently known file.
pub(crate) fn register(
    engine: &Engine,
    user: &mut UserFiles,
    session: Session,
    baseline: Vec<(String, DateTime<Utc>)>,
) {
    let Session { id, username, conn } = session;
    let conn = Arc::new(Mutex::new(conn));
    // Take the lock before any fan-out task can see the subscriber, so a
    // concurrent push cannot slip a frame in ahead of the Ok/Start handshake.
    let guard = conn.clone().try_lock_owned().ok();
    let subscriber = Subscriber { id, conn };
    user.subscribers.push(subscriber.clone());
    info!(client = id, user = %username, "subscribed");
    tokio::spawn(send_baseline(engine.clone(), username, subscriber, guard, baseline));
}

async fn send_baseline(
    engine: Engine,
    username: String,
    subscriber: Subscriber,
    guard: Option<OwnedMutexGuard<Connection>>,
    baseline: Vec<(String, DateTime<Utc>)>,
) {
    let mut conn = match guard {
        Some(guard) => guard,
        None => subscriber.conn.clone().lock_owned().await,
    };
    let result: Result<()> = async {
        conn.send(&Message::ok()).await?;
        match conn.recv().await? {
            Message::Start => {}
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "Start",
                    got: other.kind_name(),
                }
                .into())
            }
        }
        for (filename, timestamp) in baseline {
            push_acked(&mut conn, &Message::FileUpdate {
                filename,
                timestamp,
            })
            .await?;
        }
        Ok(())
    }
    .await;
    if let Err(e) = result {
        warn!(client = subscriber.id, user = %username, error = %e, "baseline failed");
        engine.enqueue(ServerOp::Unsubscribe {
            username,
            subscriber: subscriber.id,
        });
    }
}

/// Push `push` to every subscriber snapshot entry, each on its own task.
pub(crate) fn fan_out(
    engine: &Engine,
    username: &str,
    subscribers: Vec<Subscriber>,
    push: Message,
) {
    for subscriber in subscribers {
        tokio::spawn(push_one(
            engine.clone(),
            username.to_string(),
            subscriber,
            push.clone(),
        ));
    }
}

async fn push_one(engine: Engine, username: String, subscriber: Subscriber, push: Message) {
    let mut conn = subscriber.conn.lock().await;
    match push_acked(&mut conn, &push).await {
        Ok(()) => debug!(client = subscriber.id, user = %username, push = push.kind_name(), "pushed"),
        Err(e) => {
            debug!(client = subscriber.id, user = %username, error = %e, "subscriber dropped");
            engine.enqueue(ServerOp::Unsubscribe {
                username,
                subscriber: subscriber.id,
            });
        }
    }
}

async fn push_acked(conn: &mut Connection, push: &Message) -> Result<()> {
    let reply = conn.request(push).await?;
    match reply {
        Message::Empty => Err(ProtocolError::ConnectionLost.into()),
        reply if reply.is_ok() => Ok(()),
        reply => Err(ProtocolError::Unexpected {
            expected: "Response(Ok)",
            got: reply.kind_name(),
        }
        .into()),
    }
}
