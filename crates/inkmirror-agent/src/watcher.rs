//! Filesystem watching with debounced coalescing
//!
//! The device writes notebook files in bursts: a single pen stroke can
//! touch the page file, the content manifest, and the metadata file within
//! milliseconds. Raw OS events are therefore filtered to the extensions we
//! sync and held in a debounce buffer; a path is only released for upload
//! once it has been quiet for the configured window (~500 ms).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// File extensions the agent uploads
const WATCHED_EXTENSIONS: &[&str] = &["rm", "content", "metadata", "pdf"];

/// A relevant filesystem change, decoupled from notify's event types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A watched file was created or modified
    Upserted(PathBuf),
    /// A watched file was removed
    Removed(PathBuf),
}

impl WatchEvent {
    /// The path this event concerns
    pub fn path(&self) -> &Path {
        match self {
            WatchEvent::Upserted(p) | WatchEvent::Removed(p) => p,
        }
    }
}

fn is_watched(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| WATCHED_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Converts a raw notify event into at most one [`WatchEvent`]
///
/// Access events and paths outside the watched extension set are dropped.
/// Renames surface as an upsert of the destination path; the stale source
/// path ages out server-side (the notebook source is authoritative).
fn map_event(event: &notify::Event) -> Option<WatchEvent> {
    let path = match &event.kind {
        EventKind::Create(_) | EventKind::Modify(_) => event.paths.last()?,
        EventKind::Remove(_) => event.paths.first()?,
        _ => return None,
    };
    if !is_watched(path) {
        return None;
    }
    match &event.kind {
        EventKind::Remove(_) => Some(WatchEvent::Removed(path.clone())),
        _ => Some(WatchEvent::Upserted(path.clone())),
    }
}

/// Watches the notebook source directory recursively
///
/// Events pass through [`map_event`] and land on an mpsc channel; the
/// watcher stays alive as long as this struct does.
pub struct NotebookWatcher {
    watcher: RecommendedWatcher,
}

impl NotebookWatcher {
    /// Creates the watcher and returns the event receiver
    pub fn new() -> Result<(Self, mpsc::Receiver<WatchEvent>)> {
        let (tx, rx) = mpsc::channel::<WatchEvent>(1024);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(mapped) = map_event(&event) {
                        if tx.blocking_send(mapped).is_err() {
                            debug!("Watch event dropped (receiver closed)");
                        }
                    }
                }
                Err(err) => error!(error = %err, "Filesystem watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `root` and everything beneath it
    pub fn watch(&mut self, root: &Path) -> Result<()> {
        info!(root = %root.display(), "Watching notebook directory");
        self.watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))
    }
}

// ============================================================================
// Debouncing
// ============================================================================

/// Coalesces bursts of events per path behind a quiet-period window
///
/// Each push replaces any pending event for the same path and restarts its
/// clock, so a file being actively written keeps extending its own window
/// and is released exactly once after the burst ends.
pub struct DebounceBuffer {
    pending: HashMap<PathBuf, (WatchEvent, Instant)>,
    window: Duration,
}

impl DebounceBuffer {
    /// Creates a buffer with the given quiet-period window
    pub fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window,
        }
    }

    /// Records an event, replacing any pending one for the same path
    pub fn push(&mut self, event: WatchEvent) {
        self.pending
            .insert(event.path().to_path_buf(), (event, Instant::now()));
    }

    /// Removes and returns every event whose window has elapsed
    pub fn drain_settled(&mut self) -> Vec<WatchEvent> {
        let now = Instant::now();
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();

        settled
            .into_iter()
            .filter_map(|path| self.pending.remove(&path).map(|(event, _)| event))
            .collect()
    }

    /// Number of paths still inside their window
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(p: &str) -> WatchEvent {
        WatchEvent::Upserted(PathBuf::from(p))
    }

    #[test]
    fn test_extension_filter() {
        assert!(is_watched(Path::new("/nb/page-1.rm")));
        assert!(is_watched(Path::new("/nb/book.content")));
        assert!(is_watched(Path::new("/nb/book.metadata")));
        assert!(is_watched(Path::new("/nb/export.pdf")));
        assert!(!is_watched(Path::new("/nb/thumbnail.png")));
        assert!(!is_watched(Path::new("/nb/noext")));
    }

    #[test]
    fn test_map_event_filters_and_maps() {
        let create = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/nb/p.rm")],
            attrs: Default::default(),
        };
        assert_eq!(map_event(&create), Some(upsert("/nb/p.rm")));

        let remove = notify::Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/nb/p.rm")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(&remove),
            Some(WatchEvent::Removed(PathBuf::from("/nb/p.rm")))
        );

        let unwatched = notify::Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/nb/thumb.png")],
            attrs: Default::default(),
        };
        assert_eq!(map_event(&unwatched), None);

        let access = notify::Event {
            kind: EventKind::Access(notify::event::AccessKind::Read),
            paths: vec![PathBuf::from("/nb/p.rm")],
            attrs: Default::default(),
        };
        assert_eq!(map_event(&access), None);
    }

    #[test]
    fn test_rename_uses_destination_path() {
        let rename = notify::Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![PathBuf::from("/nb/old.rm"), PathBuf::from("/nb/new.rm")],
            attrs: Default::default(),
        };
        assert_eq!(map_event(&rename), Some(upsert("/nb/new.rm")));
    }

    #[test]
    fn test_debounce_coalesces_bursts() {
        let mut buffer = DebounceBuffer::new(Duration::from_millis(0));
        buffer.push(upsert("/nb/p.rm"));
        buffer.push(upsert("/nb/p.rm"));
        buffer.push(upsert("/nb/p.rm"));
        assert_eq!(buffer.pending_len(), 1);

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(buffer.drain_settled().len(), 1);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_debounce_holds_recent_events() {
        let mut buffer = DebounceBuffer::new(Duration::from_secs(60));
        buffer.push(upsert("/nb/p.rm"));
        assert!(buffer.drain_settled().is_empty());
        assert_eq!(buffer.pending_len(), 1);
    }

    #[test]
    fn test_debounce_push_restarts_window() {
        let mut buffer = DebounceBuffer::new(Duration::from_millis(40));
        buffer.push(upsert("/nb/p.rm"));
        std::thread::sleep(Duration::from_millis(25));
        // Another write arrives before the window closes
        buffer.push(upsert("/nb/p.rm"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(buffer.drain_settled().is_empty());
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(buffer.drain_settled().len(), 1);
    }

    #[test]
    fn test_drain_is_per_path() {
        let mut buffer = DebounceBuffer::new(Duration::from_millis(30));
        buffer.push(upsert("/nb/old.rm"));
        std::thread::sleep(Duration::from_millis(40));
        buffer.push(upsert("/nb/new.rm"));

        let settled = buffer.drain_settled();
        assert_eq!(settled, vec![upsert("/nb/old.rm")]);
        assert_eq!(buffer.pending_len(), 1);
    }
}
