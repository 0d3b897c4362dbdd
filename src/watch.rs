//! File watcher feeding incremental re-indexing.
//!
//! Raw notify events are coalesced in a ~200 ms debounce window before the
//! hooks fire. Configuration files additionally get a stable-size check: a
//! file still growing between ticks stays pending, so half-written config
//! never reaches the reload hook.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Debounce window: wait this long after the last event before processing.
const DEBOUNCE_MS: u64 = 200;

/// File names treated as configuration (stable-size checked, reload hook).
const CONFIG_FILES: &[&str] = &["scopegraph.toml", ".mcpignore", ".gitignore"];

/// What the owner wants to hear about.
pub struct WatchHooks {
    /// A file was created or modified (workspace-relative path).
    pub on_change: Box<dyn Fn(&str) + Send + Sync>,
    /// A file disappeared.
    pub on_remove: Box<dyn Fn(&str) + Send + Sync>,
    /// A configuration file settled after changing.
    pub on_config_change: Box<dyn Fn(&str) + Send + Sync>,
}

/// Start watching `root` recursively. Returns the watcher handle — dropping
/// it stops the watcher.
pub fn start_watcher(root: &Path, hooks: WatchHooks) -> Option<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "failed to create file watcher");
            return None;
        }
    };

    if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
        warn!(root = %root.display(), error = %e, "failed to watch workspace root");
        return None;
    }
    debug!(root = %root.display(), "watching workspace");

    let root = root.to_path_buf();
    let hooks = Arc::new(hooks);
    std::thread::spawn(move || debounce_loop(rx, root, hooks));
    Some(watcher)
}

struct Pending {
    last_event: Instant,
    /// Size at the previous tick, for the config stable-size check.
    last_size: Option<u64>,
}

fn is_config_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| CONFIG_FILES.contains(&n))
        .unwrap_or(false)
}

/// Collect events and fire hooks once paths go quiet.
fn debounce_loop(rx: mpsc::Receiver<Event>, root: PathBuf, hooks: Arc<WatchHooks>) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(DEBOUNCE_MS)) {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let now = Instant::now();
                    for path in event.paths {
                        pending
                            .entry(path)
                            .and_modify(|p| p.last_event = now)
                            .or_insert(Pending { last_event: now, last_size: None });
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - Duration::from_millis(DEBOUNCE_MS);
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, p)| p.last_event <= cutoff)
                    .map(|(path, _)| path.clone())
                    .collect();

                for path in ready {
                    if path.is_dir() {
                        pending.remove(&path);
                        continue;
                    }
                    let exists = path.exists();

                    if exists && is_config_file(&path) {
                        // Stable-size check: hold the event until two ticks
                        // agree on the file size.
                        let size = std::fs::metadata(&path).map(|m| m.len()).ok();
                        let entry = pending.get_mut(&path).unwrap();
                        if entry.last_size != size {
                            entry.last_size = size;
                            entry.last_event = Instant::now();
                            continue;
                        }
                    }
                    pending.remove(&path);

                    let Some(rel) = crate::types::rel_path_of(&root, &path) else {
                        continue;
                    };
                    if exists {
                        if is_config_file(&path) {
                            (hooks.on_config_change)(&rel);
                        } else {
                            (hooks.on_change)(&rel);
                        }
                    } else {
                        (hooks.on_remove)(&rel);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn wait_for<F: Fn() -> bool>(predicate: F, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        predicate()
    }

    #[test]
    fn test_change_and_remove_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let changes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let removals: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&changes);
        let r = Arc::clone(&removals);
        let watcher = start_watcher(
            &root,
            WatchHooks {
                on_change: Box::new(move |p| c.lock().unwrap().push(p.to_string())),
                on_remove: Box::new(move |p| r.lock().unwrap().push(p.to_string())),
                on_config_change: Box::new(|_| {}),
            },
        );
        let Some(_watcher) = watcher else {
            // Watch backends can be unavailable in minimal environments.
            return;
        };
        std::thread::sleep(Duration::from_millis(100));

        std::fs::write(root.join("new.rs"), "pub fn created() {}").unwrap();
        assert!(
            wait_for(|| changes.lock().unwrap().iter().any(|p| p == "new.rs"), 3000),
            "change event should arrive, got {:?}",
            changes.lock().unwrap()
        );

        std::fs::remove_file(root.join("new.rs")).unwrap();
        assert!(
            wait_for(|| removals.lock().unwrap().iter().any(|p| p == "new.rs"), 3000),
            "remove event should arrive"
        );
    }

    #[test]
    fn test_config_change_routed_separately() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let configs: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let changes: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let cfg = Arc::clone(&configs);
        let c = Arc::clone(&changes);
        let watcher = start_watcher(
            &root,
            WatchHooks {
                on_change: Box::new(move |p| c.lock().unwrap().push(p.to_string())),
                on_remove: Box::new(|_| {}),
                on_config_change: Box::new(move |p| cfg.lock().unwrap().push(p.to_string())),
            },
        );
        let Some(_watcher) = watcher else { return };
        std::thread::sleep(Duration::from_millis(100));

        std::fs::write(root.join("scopegraph.toml"), "mode = \"ci\"\n").unwrap();
        assert!(
            wait_for(|| configs.lock().unwrap().iter().any(|p| p == "scopegraph.toml"), 4000),
            "config hook should fire after the size stabilizes"
        );
        assert!(
            !changes.lock().unwrap().iter().any(|p| p == "scopegraph.toml"),
            "config files do not hit the plain change hook"
        );
    }
}
