//! Client-side reconciliation engine.
//!
//! One state per filename under the local sync directory. The engine merges
//! locally observed filesystem events with server push notifications by
//! timestamp comparison, triggers uploads and downloads as spawned tasks, and
//! suppresses echo loops (a file just downloaded must not be re-uploaded when
//! the watcher reports our own write).
//!
//! The queue worker mirrors the server dispatcher: it only decides
//! transitions, never performs I/O itself.

pub mod commands;
pub mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{self, ECHO_GRACE_SECS};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub server: String,
    pub username: String,
    pub sync_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalChange {
    Created,
    Modified,
    Deleted,
}

/// Inputs to the reconciliation state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    LocalUpdate {
        filename: String,
        change: LocalChange,
    },
    ServerUpdate {
        filename: String,
        timestamp: DateTime<Utc>,
    },
    ServerDelete {
        filename: String,
        timestamp: DateTime<Utc>,
    },
    DownloadComplete {
        filename: String,
        timestamp: DateTime<Utc>,
    },
    UploadCompleted {
        filename: String,
        timestamp: DateTime<Utc>,
    },
    Fail {
        filename: String,
    },
}

impl FileOperation {
    fn filename(&self) -> &str {
        match self {
            FileOperation::LocalUpdate { filename, .. }
            | FileOperation::ServerUpdate { filename, .. }
            | FileOperation::ServerDelete { filename, .. }
            | FileOperation::DownloadComplete { filename, .. }
            | FileOperation::UploadCompleted { filename, .. }
            | FileOperation::Fail { filename } => filename,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateTag {
    Inexistent,
    Downloading,
    Uploading,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileState {
    tag: StateTag,
    created_at: Option<DateTime<Utc>>,
    last_accessed_at: Option<DateTime<Utc>>,
    /// Timestamp last agreed with the server; the pivot for update decisions.
    last_modified_at: Option<DateTime<Utc>>,
    download_completed_at: Option<DateTime<Utc>>,
}

impl FileState {
    fn inexistent() -> FileState {
        FileState {
            tag: StateTag::Inexistent,
            created_at: None,
            last_accessed_at: None,
            last_modified_at: None,
            download_completed_at: None,
        }
    }
}

/// Side effect the worker launches after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Effect {
    Download {
        filename: String,
        timestamp: DateTime<Utc>,
    },
    Upload {
        filename: String,
    },
    DeleteRemote {
        filename: String,
    },
    RemoveLocal {
        filename: String,
    },
}

/// The whole transition table, pure: no clock, no I/O.
fn decide(state: &FileState, op: &FileOperation, now: DateTime<Utc>) -> (FileState, Option<Effect>) {
    use StateTag::*;
    let mut next = state.clone();

    match op {
        FileOperation::LocalUpdate { filename, change } => match change {
            LocalChange::Created | LocalChange::Modified => {
                if matches!(state.tag, Downloading | Uploading) {
                    // In-flight transfer; the event is an artifact of it.
                    return (next, None);
                }
                if let Some(done) = state.download_completed_at {
                    if (now - done).num_seconds() <= ECHO_GRACE_SECS {
                        // Self-echo of our own download write.
                        return (next, None);
                    }
                }
                if state.tag == Inexistent {
                    next.created_at = Some(now);
                }
                next.tag = Uploading;
                next.last_accessed_at = Some(now);
                (next, Some(Effect::Upload { filename: filename.clone() }))
            }
            LocalChange::Deleted => {
                if state.tag == Inexistent {
                    // Nothing to propagate; also ends the delete echo after
                    // a ServerDelete removed the local copy.
                    return (next, None);
                }
                (
                    FileState::inexistent(),
                    Some(Effect::DeleteRemote { filename: filename.clone() }),
                )
            }
        },

        FileOperation::ServerUpdate { filename, timestamp } => match state.tag {
            Inexistent => {
                next.tag = Downloading;
                next.created_at = Some(now);
                (
                    next,
                    Some(Effect::Download {
                        filename: filename.clone(),
                        timestamp: *timestamp,
                    }),
                )
            }
            Ready => match state.last_modified_at {
                Some(agreed) if *timestamp <= agreed => (next, None),
                _ => {
                    next.tag = Downloading;
                    (
                        next,
                        Some(Effect::Download {
                            filename: filename.clone(),
                            timestamp: *timestamp,
                        }),
                    )
                }
            },
            // Transfer already in flight; ignore.
            Downloading | Uploading => (next, None),
        },

        FileOperation::ServerDelete { filename, .. } => {
            if state.tag == Inexistent {
                return (next, None);
            }
            (
                FileState::inexistent(),
                Some(Effect::RemoveLocal { filename: filename.clone() }),
            )
        }

        FileOperation::DownloadComplete { timestamp, .. } => {
            if state.tag != Downloading {
                return (next, None);
            }
            next.tag = Ready;
            next.last_modified_at = Some(*timestamp);
            next.last_accessed_at = Some(now);
            next.download_completed_at = Some(now);
            (next, None)
        }

        FileOperation::UploadCompleted { timestamp, .. } => {
            if state.tag != Uploading {
                return (next, None);
            }
            next.tag = Ready;
            next.last_modified_at = Some(*timestamp);
            (next, None)
        }

        FileOperation::Fail { .. } => {
            if matches!(state.tag, Downloading | Uploading) {
                // Clean retry on the next observed event.
                (FileState::inexistent(), None)
            } else {
                (next, None)
            }
        }
    }
}

/// Handle to the client engine. Cloneable; queueing never blocks.
#[derive(Clone)]
pub struct SyncEngine {
    ops: mpsc::UnboundedSender<FileOperation>,
    config: Arc<ClientConfig>,
}

impl SyncEngine {
    pub fn start(config: ClientConfig) -> SyncEngine {
        let (ops, rx) = mpsc::unbounded_channel();
        let engine = SyncEngine {
            ops,
            config: Arc::new(config),
        };
        tokio::spawn(run_worker(rx, engine.clone()));
        engine
    }

    pub fn queue(&self, op: FileOperation) {
        let _ = self.ops.send(op);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<FileOperation>, engine: SyncEngine) {
    let mut states: HashMap<String, FileState> = HashMap::new();
    while let Some(op) = rx.recv().await {
        let filename = op.filename().to_string();
        let state = states
            .entry(filename.clone())
            .or_insert_with(FileState::inexistent);
        let (next, effect) = decide(state, &op, protocol::now());
        debug!(file = %filename, ?op, from = ?state.tag, to = ?next.tag, "operation");
        *state = next;
        if let Some(effect) = effect {
            perform(&engine, effect);
        }
    }
}

fn perform(engine: &SyncEngine, effect: Effect) {
    let engine = engine.clone();
    match effect {
        Effect::Download {
            filename,
            timestamp,
        } => {
            tokio::spawn(async move {
                let config = engine.config();
                match commands::download(config, &filename, &config.sync_dir).await {
                    Ok(path) => {
                        stamp_mtime(&path, timestamp);
                        info!(file = %filename, "download complete");
                        engine.queue(FileOperation::DownloadComplete {
                            filename,
                            timestamp,
                        });
                    }
                    Err(e) => {
                        warn!(file = %filename, error = %e, "download failed");
                        engine.queue(FileOperation::Fail { filename });
                    }
                }
            });
        }
        Effect::Upload { filename } => {
            tokio::spawn(async move {
                let config = engine.config();
                let path = config.sync_dir.join(&filename);
                let timestamp = protocol::now();
                match commands::upload(config, &path).await {
                    Ok(()) => {
                        info!(file = %filename, "upload complete");
                        engine.queue(FileOperation::UploadCompleted {
                            filename,
                            timestamp,
                        });
                    }
                    Err(e) => {
                        warn!(file = %filename, error = %e, "upload failed");
                        engine.queue(FileOperation::Fail { filename });
                    }
                }
            });
        }
        Effect::DeleteRemote { filename } => {
            tokio::spawn(async move {
                match commands::delete(engine.config(), &filename).await {
                    Ok(true) => info!(file = %filename, "remote delete complete"),
                    Ok(false) => debug!(file = %filename, "remote file already gone"),
                    Err(e) => warn!(file = %filename, error = %e, "remote delete failed"),
                }
            });
        }
        Effect::RemoveLocal { filename } => {
            tokio::spawn(async move {
                let path = engine.config().sync_dir.join(&filename);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => info!(file = %filename, "local copy removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(file = %filename, error = %e, "local remove failed"),
                }
            });
        }
    }
}

/// Align the local mtime with the server-agreed timestamp.
fn stamp_mtime(path: &std::path::Path, timestamp: DateTime<Utc>) {
    let mtime = filetime::FileTime::from_unix_time(timestamp.timestamp(), 0);
    if let Err(e) = filetime::set_file_mtime(path, mtime) {
        debug!(path = %path.display(), error = %e, "could not stamp mtime");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ready(agreed: DateTime<Utc>, downloaded: DateTime<Utc>) -> FileState {
        FileState {
            tag: StateTag::Ready,
            created_at: Some(agreed),
            last_accessed_at: Some(agreed),
            last_modified_at: Some(agreed),
            download_completed_at: Some(downloaded),
        }
    }

    fn local_modified(name: &str) -> FileOperation {
        FileOperation::LocalUpdate {
            filename: name.into(),
            change: LocalChange::Modified,
        }
    }

    #[test]
    fn server_update_on_unknown_file_starts_a_download() {
        let now = crate::protocol::now();
        let (next, effect) = decide(
            &FileState::inexistent(),
            &FileOperation::ServerUpdate {
                filename: "a.txt".into(),
                timestamp: now,
            },
            now,
        );
        assert_eq!(next.tag, StateTag::Downloading);
        assert_eq!(
            effect,
            Some(Effect::Download {
                filename: "a.txt".into(),
                timestamp: now
            })
        );
    }

    #[test]
    fn replaying_the_agreed_timestamp_is_idempotent() {
        let now = crate::protocol::now();
        let state = ready(now, now);
        let op = FileOperation::ServerUpdate {
            filename: "a.txt".into(),
            timestamp: now,
        };
        let (next, effect) = decide(&state, &op, now);
        assert_eq!(next, state);
        assert_eq!(effect, None);
        // Twice, for good measure.
        let (next, effect) = decide(&next, &op, now);
        assert_eq!(next, state);
        assert_eq!(effect, None);
    }

    #[test]
    fn newer_server_timestamp_triggers_a_redownload() {
        let now = crate::protocol::now();
        let state = ready(now, now - Duration::seconds(60));
        let (next, effect) = decide(
            &state,
            &FileOperation::ServerUpdate {
                filename: "a.txt".into(),
                timestamp: now + Duration::seconds(5),
            },
            now,
        );
        assert_eq!(next.tag, StateTag::Downloading);
        assert!(matches!(effect, Some(Effect::Download { .. })));
    }

    #[test]
    fn older_server_timestamp_is_ignored() {
        let now = crate::protocol::now();
        let state = ready(now, now - Duration::seconds(60));
        let (next, effect) = decide(
            &state,
            &FileOperation::ServerUpdate {
                filename: "a.txt".into(),
                timestamp: now - Duration::seconds(5),
            },
            now,
        );
        assert_eq!(next.tag, StateTag::Ready);
        assert_eq!(effect, None);
    }

    #[test]
    fn echo_window_suppresses_the_post_download_event() {
        let now = crate::protocol::now();
        // Observed 2s after the download finished: our own write.
        let state = ready(now, now - Duration::seconds(2));
        let (next, effect) = decide(&state, &local_modified("a.txt"), now);
        assert_eq!(next.tag, StateTag::Ready);
        assert_eq!(effect, None);

        // 4s after: a real local edit.
        let state = ready(now, now - Duration::seconds(4));
        let (next, effect) = decide(&state, &local_modified("a.txt"), now);
        assert_eq!(next.tag, StateTag::Uploading);
        assert_eq!(effect, Some(Effect::Upload { filename: "a.txt".into() }));
    }

    #[test]
    fn local_events_during_a_download_are_artifacts() {
        let now = crate::protocol::now();
        let mut state = FileState::inexistent();
        state.tag = StateTag::Downloading;
        let (next, effect) = decide(&state, &local_modified("a.txt"), now);
        assert_eq!(next.tag, StateTag::Downloading);
        assert_eq!(effect, None);
    }

    #[test]
    fn download_complete_records_the_agreed_timestamp() {
        let now = crate::protocol::now();
        let server_ts = now - Duration::seconds(30);
        let mut state = FileState::inexistent();
        state.tag = StateTag::Downloading;
        let (next, effect) = decide(
            &state,
            &FileOperation::DownloadComplete {
                filename: "a.txt".into(),
                timestamp: server_ts,
            },
            now,
        );
        assert_eq!(next.tag, StateTag::Ready);
        assert_eq!(next.last_modified_at, Some(server_ts));
        assert_eq!(next.download_completed_at, Some(now));
        assert_eq!(effect, None);
    }

    #[test]
    fn failure_resets_for_a_clean_retry() {
        let now = crate::protocol::now();
        for tag in [StateTag::Downloading, StateTag::Uploading] {
            let mut state = ready(now, now);
            state.tag = tag;
            let (next, effect) =
                decide(&state, &FileOperation::Fail { filename: "a.txt".into() }, now);
            assert_eq!(next, FileState::inexistent());
            assert_eq!(effect, None);
        }
    }

    #[test]
    fn server_delete_removes_the_local_copy_once() {
        let now = crate::protocol::now();
        let state = ready(now, now);
        let op = FileOperation::ServerDelete {
            filename: "a.txt".into(),
            timestamp: now,
        };
        let (next, effect) = decide(&state, &op, now);
        assert_eq!(next, FileState::inexistent());
        assert_eq!(effect, Some(Effect::RemoveLocal { filename: "a.txt".into() }));

        // The watcher will report our own removal; it must not bounce back.
        let (next, effect) = decide(
            &next,
            &FileOperation::LocalUpdate {
                filename: "a.txt".into(),
                change: LocalChange::Deleted,
            },
            now,
        );
        assert_eq!(next, FileState::inexistent());
        assert_eq!(effect, None);
    }

    #[test]
    fn local_delete_propagates_to_the_server() {
        let now = crate::protocol::now();
        let state = ready(now, now);
        let (next, effect) = decide(
            &state,
            &FileOperation::LocalUpdate {
                filename: "a.txt".into(),
                change: LocalChange::Deleted,
            },
            now,
        );
        assert_eq!(next, FileState::inexistent());
        assert_eq!(effect, Some(Effect::DeleteRemote { filename: "a.txt".into() }));
    }
}
