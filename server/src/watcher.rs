//! Multi-tenant directory watch multiplexer.
//!
//! Uses inotify (Linux) / kqueue (macOS) via the `notify` crate. A single OS
//! watcher is shared by every subscriber in the process: paths are added to
//! it on first subscription and released on last unsubscription. Events are
//! fanned out to the subscribers registered for the affected path's parent
//! directory, keyed by (path, username) so each logged-in user holds at most
//! one subscription per directory.

use crate::connection::{ClientHandle, RemoteCallback};
use crate::handlers::file::entry_for;
use crate::protocol::{to_value, ChangeEvent, ChangeKind, DirEntry};
use log::{debug, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Capacity of the channel between the notify callback thread and the event
/// loop. Overflow drops events rather than blocking the notify thread.
const EVENT_CHANNEL_CAPACITY: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Add {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// One (path, username) binding with its delivery handle.
struct Subscription {
    client_id: u64,
    callback: RemoteCallback,
}

struct MuxInner {
    /// The underlying OS watcher (inotify/kqueue). Lives under the same lock
    /// as the registry so the path-present check and the OS add/remove are
    /// one atomic step.
    watcher: RecommendedWatcher,
    /// Watched path -> username -> subscription. A path is present iff its
    /// OS watch is active.
    registry: HashMap<PathBuf, HashMap<String, Subscription>>,
}

/// Process-wide watch state. Constructed once at startup and passed to
/// handlers through the server state.
pub struct WatchMux {
    inner: Mutex<MuxInner>,
}

impl WatchMux {
    /// Create the multiplexer and start its event loop task.
    pub fn new() -> Result<Arc<Self>, notify::Error> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |event: notify::Result<Event>| {
                if let Ok(event) = event {
                    // Only forward events that indicate filesystem mutations
                    match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                            let _ = tx.try_send(event);
                        }
                        _ => {} // Ignore Access, Other events
                    }
                }
            },
            Config::default(),
        )?;

        let mux = Arc::new(Self {
            inner: Mutex::new(MuxInner {
                watcher,
                registry: HashMap::new(),
            }),
        });

        tokio::spawn(event_loop(Arc::clone(&mux), rx));

        Ok(mux)
    }

    /// Register `username`'s change callback for `path` and bind the
    /// subscription to the client's disconnect signal.
    ///
    /// The first subscriber of a path starts the OS watch; the registry entry
    /// is created only after that add succeeded. A repeat subscribe for the
    /// same (path, username) replaces the callback without touching the OS
    /// watch.
    pub fn subscribe(
        mux: &Arc<Self>,
        path: &Path,
        username: &str,
        callback: RemoteCallback,
        client: &ClientHandle,
    ) -> Result<StopHandle, WatchError> {
        let sub = Subscription {
            client_id: client.id(),
            callback,
        };

        {
            let mut inner = lock_or_recover(&mux.inner);
            match inner.registry.get_mut(path) {
                Some(subs) => {
                    subs.insert(username.to_string(), sub);
                }
                None => {
                    inner
                        .watcher
                        .watch(path, RecursiveMode::NonRecursive)
                        .map_err(|source| WatchError::Add {
                            path: path.to_path_buf(),
                            source,
                        })?;
                    let mut subs = HashMap::new();
                    subs.insert(username.to_string(), sub);
                    inner.registry.insert(path.to_path_buf(), subs);
                }
            }
        }
        debug!("client {}: {} watching {}", client.id(), username, path.display());

        {
            let mux = Arc::clone(mux);
            let path = path.to_path_buf();
            let username = username.to_string();
            client.on_disconnect(Box::new(move || mux.unsubscribe(&path, &username)));
        }

        Ok(StopHandle {
            mux: Arc::clone(mux),
            path: path.to_path_buf(),
            username: username.to_string(),
        })
    }

    /// Remove `username`'s subscription for `path`; release the OS watch when
    /// the last subscriber leaves. A no-op when the subscription is already
    /// gone, so the stop callback and the disconnect hook can both fire.
    pub fn unsubscribe(&self, path: &Path, username: &str) {
        let mut inner = lock_or_recover(&self.inner);
        let Some(subs) = inner.registry.get_mut(path) else {
            return;
        };
        if subs.remove(username).is_none() {
            return;
        }
        if subs.is_empty() {
            inner.registry.remove(path);
            if let Err(e) = inner.watcher.unwatch(path) {
                warn!("failed to release watch on {}: {}", path.display(), e);
            }
            debug!("released watch on {}", path.display());
        }
    }

    /// Paths with at least one live subscriber.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        lock_or_recover(&self.inner).registry.keys().cloned().collect()
    }

    /// Snapshot the delivery handles subscribed to `parent`, tagged with the
    /// originating client of each subscription.
    fn subscribers_of(&self, parent: &Path) -> Vec<(u64, RemoteCallback)> {
        lock_or_recover(&self.inner)
            .registry
            .get(parent)
            .map(|subs| {
                subs.values()
                    .map(|s| (s.client_id, s.callback.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Helper to lock a std::sync::Mutex, recovering from poisoning.
/// The data is still valid after a panic, so we just unwrap the poison error.
fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Teardown handle returned from subscribe; the `stopWatching` callback wraps
/// it on the connection.
pub struct StopHandle {
    mux: Arc<WatchMux>,
    path: PathBuf,
    username: String,
}

impl StopHandle {
    pub fn stop(&self) {
        self.mux.unsubscribe(&self.path, &self.username);
    }
}

/// Background task: consumes raw OS events and fans them out to subscribers.
async fn event_loop(mux: Arc<WatchMux>, mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        for (kind, path) in classify(&event) {
            deliver(&mux, kind, &path).await;
        }
    }
}

/// Map a raw OS event onto change classes per affected path.
///
/// A rename shows up as a removal of the old name and an appearance of the
/// new one. In-place data/metadata writes are not forwarded.
fn classify(event: &Event) -> Vec<(ChangeKind, PathBuf)> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (ChangeKind::Added, p.clone()))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (ChangeKind::Removed, p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| (ChangeKind::Removed, p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| (ChangeKind::Added, p.clone()))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // Old name first, new name second
            let mut out = Vec::with_capacity(2);
            if let Some(p) = event.paths.first() {
                out.push((ChangeKind::Removed, p.clone()));
            }
            if let Some(p) = event.paths.get(1) {
                out.push((ChangeKind::Added, p.clone()));
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Send one change to every subscriber of the affected path's parent
/// directory. Late events for unwatched paths are dropped.
async fn deliver(mux: &Arc<WatchMux>, kind: ChangeKind, path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    let targets = mux.subscribers_of(parent);
    if targets.is_empty() {
        return;
    }

    let file = match kind {
        // Stat the new entry; if it vanished again already there is nothing
        // coherent to report.
        ChangeKind::Added => match entry_for(path).await {
            Ok(entry) => entry,
            Err(_) => return,
        },
        ChangeKind::Removed => DirEntry::removed(path),
    };

    let payload = to_value(&ChangeEvent { event: kind, file });
    for (client_id, callback) in targets {
        debug!(
            "fs change {:?} {} -> client {}",
            kind,
            path.display(),
            client_id
        );
        callback.invoke(payload.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::duplex_client;
    use crate::protocol::from_value;
    use rmpv::Value;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn read_change(far: &mut tokio::io::DuplexStream) -> ChangeEvent {
        let frame = tokio::time::timeout(Duration::from_secs(10), async {
            let mut len_buf = [0u8; 4];
            far.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            far.read_exact(&mut buf).await.unwrap();
            buf
        })
        .await
        .expect("no change notification arrived");

        let value: Value = rmp_serde::from_slice(&frame).unwrap();
        let params = value
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some("params")))
            .map(|(_, v)| v.clone())
            .unwrap();
        let args = params
            .as_map()
            .and_then(|m| m.iter().find(|(k, _)| k.as_str() == Some("args")))
            .and_then(|(_, v)| v.as_array().cloned())
            .unwrap();
        from_value(args[0].clone()).unwrap()
    }

    #[tokio::test]
    async fn last_unsubscribe_releases_the_path() {
        let mux = WatchMux::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (alice, _a) = duplex_client();
        let (bob, _b) = duplex_client();

        WatchMux::subscribe(&mux, dir.path(), "alice", alice.remote_callback(1), &alice)
            .unwrap();
        WatchMux::subscribe(&mux, dir.path(), "bob", bob.remote_callback(1), &bob)
            .unwrap();
        assert_eq!(mux.watched_paths(), vec![dir.path().to_path_buf()]);

        mux.unsubscribe(dir.path(), "alice");
        assert_eq!(mux.watched_paths(), vec![dir.path().to_path_buf()]);

        mux.unsubscribe(dir.path(), "bob");
        assert!(mux.watched_paths().is_empty());

        // Double teardown is a no-op
        mux.unsubscribe(dir.path(), "bob");
        assert!(mux.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn repeat_subscribe_replaces_not_duplicates() {
        let mux = WatchMux::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (client, _far) = duplex_client();

        WatchMux::subscribe(&mux, dir.path(), "alice", client.remote_callback(1), &client)
            .unwrap();
        WatchMux::subscribe(&mux, dir.path(), "alice", client.remote_callback(2), &client)
            .unwrap();
        assert_eq!(mux.watched_paths().len(), 1);

        // One unsubscribe removes the single replaced subscription
        mux.unsubscribe(dir.path(), "alice");
        assert!(mux.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn disconnect_tears_down_subscriptions() {
        let mux = WatchMux::new().unwrap();
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (alice, _a) = duplex_client();
        let (bob, _b) = duplex_client();

        WatchMux::subscribe(&mux, dir_a.path(), "alice", alice.remote_callback(1), &alice)
            .unwrap();
        WatchMux::subscribe(&mux, dir_b.path(), "alice", alice.remote_callback(2), &alice)
            .unwrap();
        WatchMux::subscribe(&mux, dir_a.path(), "bob", bob.remote_callback(1), &bob)
            .unwrap();

        alice.disconnected();
        assert_eq!(mux.watched_paths(), vec![dir_a.path().to_path_buf()]);

        bob.disconnected();
        assert!(mux.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn stop_handle_and_disconnect_converge() {
        let mux = WatchMux::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (client, _far) = duplex_client();

        let stop =
            WatchMux::subscribe(&mux, dir.path(), "alice", client.remote_callback(1), &client)
                .unwrap();
        stop.stop();
        assert!(mux.watched_paths().is_empty());

        // The disconnect hook then finds nothing to tear down
        client.disconnected();
        assert!(mux.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn watching_a_missing_path_fails_and_leaves_no_state() {
        let mux = WatchMux::new().unwrap();
        let (client, _far) = duplex_client();

        let missing = Path::new("/nonexistent/surely/missing");
        let result =
            WatchMux::subscribe(&mux, missing, "alice", client.remote_callback(1), &client);
        assert!(result.is_err());
        assert!(mux.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn create_and_remove_reach_the_subscriber() {
        let mux = WatchMux::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (client, mut far) = duplex_client();

        WatchMux::subscribe(&mux, dir.path(), "alice", client.remote_callback(1), &client)
            .unwrap();

        let path = dir.path().join("f");
        tokio::fs::write(&path, b"hi").await.unwrap();
        let change = read_change(&mut far).await;
        assert_eq!(change.event, ChangeKind::Added);
        assert_eq!(change.file.name, "f");
        assert!(!change.file.is_dir);

        tokio::fs::remove_file(&path).await.unwrap();
        let change = read_change(&mut far).await;
        assert_eq!(change.event, ChangeKind::Removed);
        assert_eq!(change.file.name, "f");
        assert_eq!(change.file.full_path, path.to_string_lossy());
    }

    #[test]
    fn rename_classifies_as_removed_then_added() {
        let mut event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)));
        event = event.add_path(PathBuf::from("/d/old"));
        event = event.add_path(PathBuf::from("/d/new"));

        let classes = classify(&event);
        assert_eq!(
            classes,
            vec![
                (ChangeKind::Removed, PathBuf::from("/d/old")),
                (ChangeKind::Added, PathBuf::from("/d/new")),
            ]
        );
    }

    #[test]
    fn plain_writes_do_not_emit() {
        use notify::event::DataChange;
        let mut event = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)));
        event = event.add_path(PathBuf::from("/d/f"));
        assert!(classify(&event).is_empty());
    }
}
