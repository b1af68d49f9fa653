//! Filesystem watch source: translates `notify` events on the sync directory
//! into `LocalUpdate` operations for the client engine.
//!
//! Directory events are ignored; moves are treated as delete + create.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::client::{FileOperation, LocalChange, SyncEngine};

/// Start watching the engine's sync directory. The returned watcher must be
/// kept alive for events to keep flowing.
pub fn spawn(engine: SyncEngine) -> Result<RecommendedWatcher> {
    let dir = engine.config().sync_dir.clone();
    let forward = engine.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for op in translate(&event) {
                forward.queue(op);
            }
        }
        Err(e) => warn!(error = %e, "watch error"),
    })
    .context("start filesystem watcher")?;
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watch {}", dir.display()))?;
    info!(dir = %dir.display(), "watching sync directory");
    Ok(watcher)
}

fn translate(event: &Event) -> Vec<FileOperation> {
    // A rename carries both ends in order: old path out, new path in.
    if let EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind {
        let mut ops = Vec::new();
        if let Some(from) = event.paths.first() {
            ops.extend(local_update(from, LocalChange::Deleted));
        }
        if let Some(to) = event.paths.get(1) {
            ops.extend(local_update(to, LocalChange::Created));
        }
        return ops;
    }

    let change = match event.kind {
        EventKind::Create(_) => LocalChange::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => LocalChange::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => LocalChange::Created,
        EventKind::Modify(_) => LocalChange::Modified,
        EventKind::Remove(_) => LocalChange::Deleted,
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .flat_map(|path| local_update(path, change))
        .collect()
}

fn local_update(path: &std::path::Path, change: LocalChange) -> Option<FileOperation> {
    // Folder events are not synchronized.
    if change != LocalChange::Deleted && path.is_dir() {
        return None;
    }
    let filename = path.file_name()?.to_str()?.to_string();
    Some(FileOperation::LocalUpdate { filename, change })
}
