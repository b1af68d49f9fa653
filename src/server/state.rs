//! The per-file state machine and its single-threaded dispatcher.
//!
//! The dispatcher drains one queue and never touches a socket or the disk:
//! it computes the transition for each action and spawns an I/O task to carry
//! it out. Tasks on the same file are causally chained through a
//! `tokio::sync::watch` completion channel stored in the file's state, so a
//! writer never runs concurrently with the task it supersedes, while readers
//! behind readers proceed in parallel. Unrelated files are fully independent.
//!
//! State (and with it the timestamp history) is in-memory only; a daemon
//! restart starts from empty states over whatever files are on disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::subs::{self, Subscriber};
use super::Session;
use crate::message::Message;
use crate::transfer;
use crate::wire::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Upload,
    Read,
    Delete,
    ListServer,
    Subscribe,
}

/// A queued intent against one file (or the whole tree for list/subscribe),
/// carrying the requesting session. Consumed exactly once.
#[derive(Debug)]
pub struct FileAction {
    pub session: Session,
    pub filename: String,
    pub kind: ActionKind,
    pub timestamp: DateTime<Utc>,
}

pub(crate) enum ServerOp {
    Action(FileAction),
    /// A delete task finished; reset that entry to Empty if it still is the
    /// generation that scheduled it.
    Settle {
        username: String,
        filename: String,
        generation: u64,
    },
    /// A completed upload/delete; fan the push out to subscribers.
    Broadcast { username: String, push: Message },
    Unsubscribe { username: String, subscriber: u64 },
}

/// Handle to the dispatcher. Submission never blocks.
#[derive(Clone)]
pub struct Engine {
    ops: mpsc::UnboundedSender<ServerOp>,
    root: Arc<PathBuf>,
}

impl Engine {
    pub fn new(root: PathBuf) -> Engine {
        let (ops, rx) = mpsc::unbounded_channel();
        let engine = Engine {
            ops,
            root: Arc::new(root),
        };
        tokio::spawn(run_dispatcher(rx, engine.clone()));
        engine
    }

    pub fn submit(&self, action: FileAction) {
        let _ = self.ops.send(ServerOp::Action(action));
    }

    pub(crate) fn enqueue(&self, op: ServerOp) {
        let _ = self.ops.send(op);
    }

    /// Arm an action reader for the session's next command.
    pub fn attach(&self, session: Session) {
        super::spawn_session(self.clone(), session);
    }

    pub fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateTag {
    Empty,
    Updating,
    Reading,
    Deleting,
}

struct FileState {
    tag: StateTag,
    generation: u64,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    accessed: DateTime<Utc>,
    /// Completion signal of the in-flight task; successors await it.
    done: Option<watch::Receiver<bool>>,
}

impl FileState {
    fn new(timestamp: DateTime<Utc>) -> FileState {
        FileState {
            tag: StateTag::Empty,
            generation: 0,
            created: timestamp,
            modified: timestamp,
            accessed: timestamp,
            done: None,
        }
    }
}

#[derive(Default)]
pub(crate) struct UserFiles {
    states: HashMap<String, FileState>,
    pub(crate) subscribers: Vec<Subscriber>,
}

/// Per-user filename/state map plus subscriber lists. Owned by the
/// dispatcher task; nothing else reads or writes it.
#[derive(Default)]
struct FilesManager {
    users: HashMap<String, UserFiles>,
}

impl FilesManager {
    fn user_mut(&mut self, username: &str) -> &mut UserFiles {
        self.users.entry(username.to_string()).or_default()
    }

    fn settle(&mut self, username: &str, filename: &str, generation: u64) {
        if let Some(user) = self.users.get_mut(username) {
            let deletable = user
                .states
                .get(filename)
                .map(|s| s.tag == StateTag::Deleting && s.generation == generation)
                .unwrap_or(false);
            if deletable {
                user.states.remove(filename);
                debug!(user = username, file = filename, "settled to empty");
            }
        }
    }

    /// Snapshot for ListServer: every live file with its timestamps.
    fn listing(&mut self, username: &str) -> Vec<ListEntry> {
        self.user_mut(username)
            .states
            .iter()
            .filter(|(_, state)| state.tag != StateTag::Deleting)
            .map(|(name, state)| ListEntry {
                filename: name.clone(),
                mtime: state.modified,
                atime: state.accessed,
                ctime: state.created,
            })
            .collect()
    }

    /// Snapshot for a new subscriber's full resync baseline.
    fn baseline(&mut self, username: &str) -> Vec<(String, DateTime<Utc>)> {
        self.user_mut(username)
            .states
            .iter()
            .filter(|(_, state)| state.tag != StateTag::Deleting)
            .map(|(name, state)| (name.clone(), state.modified))
            .collect()
    }

    fn drop_subscriber(&mut self, username: &str, id: u64) {
        if let Some(user) = self.users.get_mut(username) {
            user.subscribers.retain(|s| s.id != id);
        }
    }
}

struct ListEntry {
    filename: String,
    mtime: DateTime<Utc>,
    atime: DateTime<Utc>,
    ctime: DateTime<Utc>,
}

/// What the spawned I/O task has to do. Computed together with the next tag
/// by [`plan_transition`]; the pair is the whole transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskPlan {
    /// Reply FileNotFound (after the predecessor, if any, has finished).
    Reject { wait_prev: bool },
    /// Accept an upload stream. Chains behind whatever it supersedes.
    Receive { wait_prev: bool },
    /// Stream the file out. Waits for a writer predecessor before starting;
    /// behind a reader it streams immediately and only joins the predecessor
    /// before signalling its own completion, so reads overlap but a later
    /// writer still waits for all of them.
    Send { wait_prev: bool, join_prev: bool },
    /// Remove the file after the predecessor finishes.
    Remove { wait_prev: bool },
}

pub(crate) fn plan_transition(prev: StateTag, kind: ActionKind) -> (Option<StateTag>, TaskPlan) {
    use StateTag::*;
    match kind {
        ActionKind::Upload => (
            Some(Updating),
            TaskPlan::Receive {
                wait_prev: prev != Empty,
            },
        ),
        ActionKind::Read => match prev {
            Empty => (None, TaskPlan::Reject { wait_prev: false }),
            Deleting => (None, TaskPlan::Reject { wait_prev: true }),
            Updating => (
                Some(Reading),
                TaskPlan::Send {
                    wait_prev: true,
                    join_prev: false,
                },
            ),
            Reading => (
                Some(Reading),
                TaskPlan::Send {
                    wait_prev: false,
                    join_prev: true,
                },
            ),
        },
        ActionKind::Delete => match prev {
            Empty => (None, TaskPlan::Reject { wait_prev: false }),
            Deleting => (None, TaskPlan::Reject { wait_prev: true }),
            Updating | Reading => (Some(Deleting), TaskPlan::Remove { wait_prev: true }),
        },
        // List/Subscribe never touch per-file state; handled before planning.
        ActionKind::ListServer | ActionKind::Subscribe => {
            (None, TaskPlan::Reject { wait_prev: false })
        }
    }
}

async fn run_dispatcher(mut rx: mpsc::UnboundedReceiver<ServerOp>, engine: Engine) {
    let mut manager = FilesManager::default();
    while let Some(op) = rx.recv().await {
        match op {
            ServerOp::Action(action) => dispatch(&mut manager, &engine, action),
            ServerOp::Settle {
                username,
                filename,
                generation,
            } => manager.settle(&username, &filename, generation),
            ServerOp::Broadcast { username, push } => {
                let subscribers = manager.user_mut(&username).subscribers.clone();
                subs::fan_out(&engine, &username, subscribers, push);
            }
            ServerOp::Unsubscribe {
                username,
                subscriber,
            } => manager.drop_subscriber(&username, subscriber),
        }
    }
}

fn dispatch(manager: &mut FilesManager, engine: &Engine, action: FileAction) {
    match action.kind {
        ActionKind::ListServer => {
            let listing = manager.listing(&action.session.username);
            tokio::spawn(run_list_task(engine.clone(), action.session, listing));
        }
        ActionKind::Subscribe => {
            let baseline = manager.baseline(&action.session.username);
            let user = manager.user_mut(&action.session.username);
            subs::register(engine, user, action.session, baseline);
        }
        _ => dispatch_file(manager, engine, action),
    }
}

fn dispatch_file(manager: &mut FilesManager, engine: &Engine, action: FileAction) {
    let FileAction {
        session,
        filename,
        kind,
        timestamp,
    } = action;
    let username = session.username.clone();
    let path = engine.user_dir(&username).join(&filename);
    let user = manager.user_mut(&username);

    let prev_tag = user
        .states
        .get(&filename)
        .map(|s| s.tag)
        .unwrap_or(StateTag::Empty);
    let prev_done = user.states.get(&filename).and_then(|s| s.done.clone());
    let (next_tag, plan) = plan_transition(prev_tag, kind);
    debug!(
        user = %username,
        file = %filename,
        from = ?prev_tag,
        to = ?next_tag,
        action = ?kind,
        "transition"
    );

    let mut completion = None;
    if let Some(next) = next_tag {
        let (tx, rx_done) = watch::channel(false);
        let entry = user
            .states
            .entry(filename.clone())
            .or_insert_with(|| FileState::new(timestamp));
        entry.generation += 1;
        entry.tag = next;
        match kind {
            ActionKind::Upload => {
                entry.modified = timestamp;
                if matches!(prev_tag, StateTag::Empty | StateTag::Deleting) {
                    entry.created = timestamp;
                    entry.accessed = timestamp;
                }
            }
            ActionKind::Read => entry.accessed = timestamp,
            _ => {}
        }
        entry.done = Some(rx_done);
        completion = Some((tx, entry.generation));
    }

    tokio::spawn(run_file_task(
        engine.clone(),
        session,
        filename,
        path,
        timestamp,
        plan,
        prev_done,
        completion,
    ));
}

async fn await_done(rx: Option<watch::Receiver<bool>>) {
    if let Some(mut rx) = rx {
        let _ = rx.wait_for(|done| *done).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_file_task(
    engine: Engine,
    mut session: Session,
    filename: String,
    path: PathBuf,
    timestamp: DateTime<Utc>,
    plan: TaskPlan,
    prev_done: Option<watch::Receiver<bool>>,
    completion: Option<(watch::Sender<bool>, u64)>,
) {
    let username = session.username.clone();
    match plan {
        TaskPlan::Reject { wait_prev } => {
            if wait_prev {
                await_done(prev_done).await;
            }
            match session.conn.send(&Message::not_found()).await {
                Ok(()) => engine.attach(session),
                Err(e) => warn!(user = %username, file = %filename, error = %e, "reply failed"),
            }
        }

        TaskPlan::Receive { wait_prev } => {
            if wait_prev {
                await_done(prev_done).await;
            }
            let result = async {
                session.conn.send(&Message::ok()).await?;
                transfer::receive_file(&mut session.conn, &path).await
            }
            .await;
            if let Some((tx, _)) = &completion {
                let _ = tx.send(true);
            }
            match result {
                Ok(()) => {
                    info!(user = %username, file = %filename, "upload complete");
                    engine.enqueue(ServerOp::Broadcast {
                        username,
                        push: Message::FileUpdate {
                            filename,
                            timestamp,
                        },
                    });
                    engine.attach(session);
                }
                Err(e) => {
                    // The frame boundary is unknown after a mid-stream
                    // failure; closing the socket is what lets the peer
                    // observe it and reset.
                    warn!(user = %username, file = %filename, error = %e, "upload aborted, closing session");
                }
            }
        }

        TaskPlan::Send {
            wait_prev,
            join_prev,
        } => {
            if wait_prev {
                await_done(prev_done.clone()).await;
            }
            let result = async {
                session.conn.send(&Message::ok()).await?;
                transfer::send_file(&mut session.conn, &path).await
            }
            .await;
            if join_prev {
                await_done(prev_done).await;
            }
            if let Some((tx, _)) = &completion {
                let _ = tx.send(true);
            }
            match result {
                Ok(()) => {
                    debug!(user = %username, file = %filename, "read complete");
                    engine.attach(session);
                }
                Err(e) => {
                    warn!(user = %username, file = %filename, error = %e, "read aborted, closing session");
                }
            }
        }

        TaskPlan::Remove { wait_prev } => {
            if wait_prev {
                await_done(prev_done).await;
            }
            let result = async {
                session.conn.send(&Message::ok()).await?;
                match session.conn.recv().await? {
                    Message::Start => {}
                    other => {
                        return Err(ProtocolError::Unexpected {
                            expected: "Start",
                            got: other.kind_name(),
                        }
                        .into())
                    }
                }
                tokio::fs::remove_file(&path).await?;
                session.conn.send(&Message::ok()).await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            if let Some((tx, generation)) = &completion {
                let _ = tx.send(true);
                engine.enqueue(ServerOp::Settle {
                    username: username.clone(),
                    filename: filename.clone(),
                    generation: *generation,
                });
            }
            match result {
                Ok(()) => {
                    info!(user = %username, file = %filename, "deleted");
                    engine.enqueue(ServerOp::Broadcast {
                        username,
                        push: Message::FileDelete {
                            filename,
                            timestamp,
                        },
                    });
                    engine.attach(session);
                }
                Err(e) => {
                    warn!(user = %username, file = %filename, error = %e, "delete aborted, closing session");
                }
            }
        }
    }
}

async fn run_list_task(engine: Engine, mut session: Session, listing: Vec<ListEntry>) {
    let result = async {
        session.conn.send(&Message::ok()).await?;
        match session.conn.recv().await? {
            Message::Start => {}
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "Start",
                    got: other.kind_name(),
                }
                .into())
            }
        }
        for entry in listing {
            let reply = session
                .conn
                .request(&Message::FileInfo {
                    filename: entry.filename,
                    mtime: entry.mtime,
                    atime: entry.atime,
                    ctime: entry.ctime,
                })
                .await?;
            if !reply.is_ok() {
                return Err(ProtocolError::Unexpected {
                    expected: "Response(Ok)",
                    got: reply.kind_name(),
                }
                .into());
            }
        }
        let reply = session.conn.request(&Message::End).await?;
        if !reply.is_ok() {
            return Err(ProtocolError::Unexpected {
                expected: "Response(Ok)",
                got: reply.kind_name(),
            }
            .into());
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;
    match result {
        Ok(()) => engine.attach(session),
        Err(e) => {
            warn!(client = session.id, error = %e, "list aborted, closing session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActionKind::*;
    use StateTag::*;

    #[test]
    fn read_on_empty_rejects_without_entering_the_chain() {
        assert_eq!(
            plan_transition(Empty, Read),
            (None, TaskPlan::Reject { wait_prev: false })
        );
    }

    #[test]
    fn reads_behind_a_reader_run_concurrently() {
        let (next, plan) = plan_transition(Reading, Read);
        assert_eq!(next, Some(Reading));
        assert_eq!(
            plan,
            TaskPlan::Send {
                wait_prev: false,
                join_prev: true
            }
        );
    }

    #[test]
    fn a_read_behind_a_writer_waits_for_it() {
        let (next, plan) = plan_transition(Updating, Read);
        assert_eq!(next, Some(Reading));
        assert_eq!(
            plan,
            TaskPlan::Send {
                wait_prev: true,
                join_prev: false
            }
        );
    }

    #[test]
    fn uploads_always_supersede_and_chain() {
        assert_eq!(
            plan_transition(Empty, Upload),
            (Some(Updating), TaskPlan::Receive { wait_prev: false })
        );
        for prev in [Updating, Reading, Deleting] {
            assert_eq!(
                plan_transition(prev, Upload),
                (Some(Updating), TaskPlan::Receive { wait_prev: true })
            );
        }
    }

    #[test]
    fn deletes_report_missing_files() {
        assert_eq!(
            plan_transition(Empty, Delete),
            (None, TaskPlan::Reject { wait_prev: false })
        );
        // Already being deleted: gone by the time the predecessor finishes.
        assert_eq!(
            plan_transition(Deleting, Delete),
            (None, TaskPlan::Reject { wait_prev: true })
        );
        assert_eq!(
            plan_transition(Updating, Delete),
            (Some(Deleting), TaskPlan::Remove { wait_prev: true })
        );
    }

    #[test]
    fn read_behind_a_delete_waits_then_rejects() {
        assert_eq!(
            plan_transition(Deleting, Read),
            (None, TaskPlan::Reject { wait_prev: true })
        );
    }

    #[test]
    fn settle_only_applies_to_the_scheduling_generation() {
        let mut manager = FilesManager::default();
        let ts = crate::protocol::now();
        let user = manager.user_mut("alice");
        let mut state = FileState::new(ts);
        state.tag = StateTag::Deleting;
        state.generation = 2;
        user.states.insert("a.txt".into(), state);

        // Stale settle from generation 1 is ignored.
        manager.settle("alice", "a.txt", 1);
        assert!(manager.user_mut("alice").states.contains_key("a.txt"));

        manager.settle("alice", "a.txt", 2);
        assert!(!manager.user_mut("alice").states.contains_key("a.txt"));
    }

    #[test]
    fn listing_skips_files_being_deleted() {
        let mut manager = FilesManager::default();
        let ts = crate::protocol::now();
        let user = manager.user_mut("alice");
        let mut live = FileState::new(ts);
        live.tag = StateTag::Updating;
        user.states.insert("keep.txt".into(), live);
        let mut dying = FileState::new(ts);
        dying.tag = StateTag::Deleting;
        user.states.insert("gone.txt".into(), dying);

        let listing = manager.listing("alice");
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].filename, "keep.txt");
    }
}
