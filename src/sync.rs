//! Sync orchestration.
//!
//! Bridges filesystem events to worker commands. Raw notify events are
//! debounced twice: once by notify-debouncer-full (event storm smoothing)
//! and once by the pending-change map, which holds a path until it has
//! been quiet for the global idle window — or the much longer active-file
//! window for the note currently being edited, so a live typing session
//! never thrashes the embedder. Deletes skip the queue entirely.

use crate::config::AppConfig;
use crate::engine::EngineHandle;
use crate::error::EngineResult;
use crate::fsadapter::{validate_vault_path, FsAdapter, VaultFs};
use crate::model::FileUpdate;
use crate::state::ServerEvent;
use dashmap::DashMap;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, RecommendedCache};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Raw watcher debounce before events reach the pending map.
const WATCHER_DEBOUNCE_MS: u64 = 500;
/// Pending map poll cadence.
const FLUSH_TICK_MS: u64 = 500;

struct WatcherHandle {
    _watcher: notify_debouncer_full::Debouncer<notify::RecommendedWatcher, RecommendedCache>,
}

#[derive(Debug, Clone)]
struct PendingChange {
    queued_at: Instant,
}

pub struct SyncOrchestrator {
    handle: EngineHandle,
    fs: Arc<VaultFs>,
    config: AppConfig,
    pending: Arc<DashMap<String, PendingChange>>,
    active_file: Arc<Mutex<Option<String>>>,
    event_tx: broadcast::Sender<ServerEvent>,
    watcher: Mutex<Option<WatcherHandle>>,
    stop: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        handle: EngineHandle,
        fs: Arc<VaultFs>,
        config: AppConfig,
        event_tx: broadcast::Sender<ServerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            fs,
            config,
            pending: Arc::new(DashMap::new()),
            active_file: Arc::new(Mutex::new(None)),
            event_tx,
            watcher: Mutex::new(None),
            stop: CancellationToken::new(),
        })
    }

    /// The note the user is editing right now; its updates wait for the
    /// long debounce window.
    pub fn set_active_file(&self, path: Option<String>) {
        *self.active_file.lock() = path;
    }

    pub fn stop(&self) {
        self.stop.cancel();
        *self.watcher.lock() = None;
    }

    /// Registers the filesystem watcher and starts the flusher task.
    pub fn start(self: &Arc<Self>) -> Result<(), notify::Error> {
        let root = PathBuf::from(&self.config.vault_dir);
        let pending = self.pending.clone();
        let active_file = self.active_file.clone();
        let event_tx = self.event_tx.clone();
        let handle = self.handle.clone();
        let vault_root = root.clone();
        let excluded = self.config.engine.excluded_folders.clone();
        let rt_handle = tokio::runtime::Handle::try_current().ok();

        let mut debouncer = new_debouncer(
            Duration::from_millis(WATCHER_DEBOUNCE_MS),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in &events {
                        dispatch_event(
                            event,
                            &vault_root,
                            &excluded,
                            &pending,
                            &active_file,
                            &event_tx,
                            &handle,
                            rt_handle.as_ref(),
                        );
                    }
                }
                Err(errors) => {
                    for e in errors {
                        warn!("File watcher error: {e:?}");
                    }
                }
            },
        )?;
        debouncer.watch(root.as_path(), RecursiveMode::Recursive)?;
        *self.watcher.lock() = Some(WatcherHandle {
            _watcher: debouncer,
        });

        let this = self.clone();
        tokio::spawn(async move {
            this.flush_loop().await;
        });

        info!(
            vault = %self.config.vault_dir,
            debounce_ms = self.config.global_idle_debounce_ms,
            active_debounce_ms = self.config.active_file_debounce_ms,
            "Sync orchestrator watching vault"
        );
        Ok(())
    }

    async fn flush_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_millis(FLUSH_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.flush_due().await {
                warn!("Pending flush failed: {e}");
            }
        }
    }

    /// Drains pending paths that have been quiet long enough, batching
    /// them into one `update_files` call.
    async fn flush_due(&self) -> EngineResult<()> {
        let global = Duration::from_millis(self.config.global_idle_debounce_ms);
        let active = Duration::from_millis(self.config.active_file_debounce_ms);
        let active_path = self.active_file.lock().clone();

        let mut due: Vec<String> = Vec::new();
        for entry in self.pending.iter() {
            let window = if Some(entry.key()) == active_path.as_ref() {
                active
            } else {
                global
            };
            if entry.value().queued_at.elapsed() >= window {
                due.push(entry.key().clone());
            }
        }
        if due.is_empty() {
            return Ok(());
        }
        due.truncate(self.config.update_batch_size.max(1));
        for path in &due {
            self.pending.remove(path);
        }

        let mut updates = Vec::new();
        for path in due {
            match self.read_update(&path) {
                Some(update) => updates.push(update),
                // Vanished since the event fired.
                None => self.handle.delete_file(&path).await.unwrap_or_else(|e| {
                    debug!(path = %path, "Deferred delete failed: {e}");
                }),
            }
        }
        if updates.is_empty() {
            return Ok(());
        }

        let batch_paths: Vec<String> = updates.iter().map(|u| u.path.clone()).collect();
        match self.handle.update_files_background(updates).await {
            Ok(outcome) => {
                // Transient failures re-enter the queue and ride the next
                // window.
                for path in outcome.failed {
                    self.requeue(path);
                }
                Ok(())
            }
            // A worker swap dropped the whole batch; re-issue it under the
            // new session rather than losing the edits.
            Err(e) if e.is_retryable() => {
                debug!("Batch dropped ({e}), re-queueing {} paths", batch_paths.len());
                for path in batch_paths {
                    self.requeue(path);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn requeue(&self, path: String) {
        self.pending.insert(
            path,
            PendingChange {
                queued_at: Instant::now(),
            },
        );
    }

    fn read_update(&self, path: &str) -> Option<FileUpdate> {
        read_update_from(self.fs.as_ref(), path)
    }

    /// Full delta scan: prune what vanished, re-index what changed. Runs
    /// at startup and after every committed config change.
    pub async fn scan(&self) -> EngineResult<()> {
        let listed = {
            let fs = self.fs.clone();
            tokio::task::spawn_blocking(move || fs.list_markdown())
                .await
                .map_err(|e| crate::error::EngineError::Fatal(format!("scan task: {e}")))??
        };
        let excluded = &self.config.engine.excluded_folders;
        let listed: Vec<_> = listed
            .into_iter()
            .filter(|entry| !is_excluded(&entry.path, excluded))
            .collect();

        let states = self.handle.file_states().await?;
        let current_paths: Vec<String> = listed.iter().map(|e| e.path.clone()).collect();
        self.handle.prune_orphans(current_paths).await?;

        let changed: Vec<String> = listed
            .iter()
            .filter(|entry| {
                states
                    .get(&entry.path)
                    .is_none_or(|s| s.mtime != entry.mtime || s.size != entry.size)
            })
            .map(|entry| entry.path.clone())
            .collect();

        if changed.is_empty() {
            info!(total = listed.len(), "Delta scan: index up to date");
            return Ok(());
        }
        info!(
            total = listed.len(),
            changed = changed.len(),
            "Delta scan: enqueueing changed files"
        );

        for batch_paths in changed.chunks(self.config.update_batch_size.max(1)) {
            // Parallel file reading; the worker re-checks content hashes so
            // racing edits are harmless.
            let fs = self.fs.clone();
            let paths: Vec<String> = batch_paths.to_vec();
            let updates: Vec<FileUpdate> = tokio::task::spawn_blocking(move || {
                use rayon::prelude::*;
                paths
                    .par_iter()
                    .filter_map(|path| read_update_from(fs.as_ref(), path))
                    .collect()
            })
            .await
            .map_err(|e| crate::error::EngineError::Fatal(format!("scan read task: {e}")))?;
            if updates.is_empty() {
                continue;
            }
            let batch_paths: Vec<String> = updates.iter().map(|u| u.path.clone()).collect();
            match self.handle.update_files_background(updates).await {
                Ok(outcome) => {
                    for path in outcome.failed {
                        self.requeue(path);
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!("Scan batch dropped ({e}), re-queueing");
                    for path in batch_paths {
                        self.requeue(path);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Config-change protocol: stage, commit (freeze-save + swap + shard
    /// load happen inside the worker), then delta-scan the vault into the
    /// new identity.
    pub async fn commit_config_change(
        &self,
        config: crate::config::EngineConfig,
    ) -> EngineResult<()> {
        self.pending.clear();
        self.handle.update_config(config).await?;
        self.handle.commit_config().await?;
        self.scan().await
    }
}

fn read_update_from(fs: &VaultFs, path: &str) -> Option<FileUpdate> {
    let content = fs.read(path).ok()?;
    let (mtime, size) = fs.stat(path).ok().flatten()?;
    Some(FileUpdate {
        path: path.to_string(),
        content,
        mtime,
        size,
        title: None,
        links: None,
    })
}

fn is_excluded(path: &str, excluded: &[String]) -> bool {
    excluded.iter().any(|folder| {
        let prefix = format!("{}/", folder.trim_end_matches('/'));
        path.starts_with(&prefix)
    })
}

/// Routes one debounced event: create/modify feed the pending map, rename
/// is a delete of the old path plus a pending update of the new, delete
/// goes straight to the worker.
#[allow(clippy::too_many_arguments)]
fn dispatch_event(
    event: &DebouncedEvent,
    vault_root: &std::path::Path,
    excluded: &[String],
    pending: &DashMap<String, PendingChange>,
    active_file: &Mutex<Option<String>>,
    event_tx: &broadcast::Sender<ServerEvent>,
    handle: &EngineHandle,
    rt_handle: Option<&tokio::runtime::Handle>,
) {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    let relative = |p: &std::path::Path| -> Option<String> {
        let rel = p
            .strip_prefix(vault_root)
            .ok()?
            .to_string_lossy()
            .replace('\\', "/");
        if !rel.ends_with(".md") || validate_vault_path(&rel).is_err() || is_excluded(&rel, excluded)
        {
            return None;
        }
        Some(rel)
    };

    let enqueue = |path: String, change_type: &str| {
        let _ = event_tx.send(ServerEvent::FileChanged {
            path: path.clone(),
            change_type: change_type.to_string(),
        });
        if change_type == "modify" {
            *active_file.lock() = Some(path.clone());
        }
        pending.insert(
            path,
            PendingChange {
                queued_at: Instant::now(),
            },
        );
    };

    let delete_now = |path: String| {
        let _ = event_tx.send(ServerEvent::FileChanged {
            path: path.clone(),
            change_type: "delete".to_string(),
        });
        pending.remove(&path);
        if let Some(rt) = rt_handle {
            let handle = handle.clone();
            rt.spawn(async move {
                if let Err(e) = handle.delete_file(&path).await {
                    debug!(path = %path, "Watcher delete failed: {e}");
                }
            });
        }
    };

    match event.kind {
        EventKind::Create(_) => {
            for path in event.paths.iter().filter_map(|p| relative(p)) {
                enqueue(path, "create");
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // paths = [from, to]; old identity dies, new one is indexed.
            if let (Some(from), Some(to)) = (event.paths.first(), event.paths.get(1)) {
                if let Some(old) = relative(from) {
                    delete_now(old);
                }
                if let Some(new) = relative(to) {
                    enqueue(new, "rename");
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in event.paths.iter().filter_map(|p| relative(p)) {
                delete_now(path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in event.paths.iter().filter_map(|p| relative(p)) {
                enqueue(path, "rename");
            }
        }
        EventKind::Modify(_) => {
            for path in event.paths.iter().filter_map(|p| relative(p)) {
                enqueue(path, "modify");
            }
        }
        EventKind::Remove(_) => {
            for path in event.paths.iter().filter_map(|p| relative(p)) {
                delete_now(path);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excluded_prefix_matching() {
        let excluded = vec!["Archive".to_string(), "Templates/".to_string()];
        assert!(is_excluded("Archive/old.md", &excluded));
        assert!(is_excluded("Templates/daily.md", &excluded));
        assert!(!is_excluded("Archives/new.md", &excluded));
        assert!(!is_excluded("notes/a.md", &excluded));
    }
}
