//! Filesystem-backed shared medium.
//!
//! Every namespace is a directory under the root. Writes land in a hidden
//! temp file in the same directory and are renamed (or hard-linked, for
//! exclusive create) onto the final name, so readers never observe a
//! partially written blob.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{keys, ChangeKind, Medium, MediumEvent, Namespace};
use crate::util::blocking;
use crate::{hlog_debug, hlog_warn, Error, Result};

/// A CAS guard older than this is assumed to belong to a dead process.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(10);

/// How long a CAS waits for a contended guard before giving up.
const GUARD_WAIT_LIMIT: Duration = Duration::from_secs(15);

const GUARD_RETRY: Duration = Duration::from_millis(2);

const EVENT_CAPACITY: usize = 1024;

pub struct FsMedium {
    root: PathBuf,
    events: Option<broadcast::Sender<MediumEvent>>,
    // Dropping the watcher stops notifications.
    watcher: Option<Mutex<RecommendedWatcher>>,
}

impl std::fmt::Debug for FsMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsMedium")
            .field("root", &self.root)
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl FsMedium {
    /// Open (creating if needed) a medium rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        for ns in Namespace::ALL {
            fs::create_dir_all(root.join(ns.as_str()))?;
        }
        // Watch events report canonical paths; keep the root comparable.
        let root = fs::canonicalize(root)?;
        Ok(Self {
            root,
            events: None,
            watcher: None,
        })
    }

    /// Enable change notifications through the platform file watcher.
    pub fn with_watch(mut self) -> Result<Self> {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let sender = tx.clone();
        let root = self.root.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        hlog_warn!("Medium watcher error: {}", e);
                        return;
                    }
                };
                let kind = match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => ChangeKind::Written,
                    EventKind::Remove(_) => ChangeKind::Removed,
                    _ => return,
                };
                for path in &event.paths {
                    // Renames report the destination as a modify; a missing
                    // destination means the blob went away.
                    let kind = if kind == ChangeKind::Written && !path.exists() {
                        ChangeKind::Removed
                    } else {
                        kind
                    };
                    if let Some(key) = key_for_path(&root, path) {
                        // No receivers is fine.
                        let _ = sender.send(MediumEvent { key, kind });
                    }
                }
            },
            NotifyConfig::default(),
        )
        .map_err(watch_error)?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(watch_error)?;
        hlog_debug!("Watching medium at {}", self.root.display());

        self.events = Some(tx);
        self.watcher = Some(Mutex::new(watcher));
        Ok(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let (dir, name) =
            keys::split(key).ok_or_else(|| Error::Validation(format!("invalid key: {:?}", key)))?;
        if dir.starts_with('.') || name.starts_with('.') {
            return Err(Error::Validation(format!("invalid key: {:?}", key)));
        }
        Ok(self.root.join(dir).join(name))
    }
}

fn watch_error(e: notify::Error) -> Error {
    Error::Io(std::io::Error::new(ErrorKind::Other, e))
}

/// Map an absolute path back to `"<namespace>/<name>"`, skipping temp files.
fn key_for_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = rel.components();
    let dir = parts.next()?.as_os_str().to_str()?;
    let name = parts.next()?.as_os_str().to_str()?;
    if parts.next().is_some() || name.starts_with('.') {
        return None;
    }
    Some(format!("{}/{}", dir, name))
}

fn temp_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

fn write_temp(final_path: &Path, data: &[u8]) -> std::io::Result<PathBuf> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(final_path);
    let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
    if let Err(e) = file.write_all(data) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(tmp)
}

fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = write_temp(path, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn read_optional(path: &Path) -> std::io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove_optional(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Exclusive per-key guard serialising compare-and-swap across processes.
struct CasGuard {
    path: PathBuf,
}

impl CasGuard {
    fn acquire(final_path: &Path) -> std::io::Result<Self> {
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = final_path.with_file_name(format!(".{}.guard", name));
        let started = Instant::now();

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if guard_is_abandoned(&path) {
                        hlog_warn!("Breaking abandoned CAS guard {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() > GUARD_WAIT_LIMIT {
                        return Err(std::io::Error::new(
                            ErrorKind::TimedOut,
                            format!("CAS guard {} contended", path.display()),
                        ));
                    }
                    std::thread::sleep(GUARD_RETRY);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for CasGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn guard_is_abandoned(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > GUARD_STALE_AFTER)
}

#[async_trait]
impl Medium for FsMedium {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_of(key)?;
        blocking(move || Ok(atomic_write(&path, &data)?)).await
    }

    async fn create(&self, key: &str, data: Vec<u8>) -> Result<bool> {
        let path = self.path_of(key)?;
        blocking(move || {
            let tmp = write_temp(&path, &data)?;
            let linked = fs::hard_link(&tmp, &path);
            let _ = fs::remove_file(&tmp);
            match linked {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(key)?;
        blocking(move || Ok(read_optional(&path)?)).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_of(key)?;
        blocking(move || Ok(remove_optional(&path)?)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir, name_prefix) = prefix
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("list prefix needs a namespace: {:?}", prefix)))?;
        if dir.is_empty() || dir.starts_with('.') {
            return Err(Error::Validation(format!("invalid list prefix: {:?}", prefix)));
        }
        let dir = dir.to_string();
        let name_prefix = name_prefix.to_string();
        let dir_path = self.root.join(&dir);

        blocking(move || {
            let entries = match fs::read_dir(&dir_path) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            let mut found = Vec::new();
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || !name.starts_with(&name_prefix) {
                    continue;
                }
                if entry.file_type()?.is_file() {
                    found.push(format!("{}/{}", dir, name));
                }
            }
            found.sort();
            Ok(found)
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        new: Option<Vec<u8>>,
    ) -> Result<bool> {
        let path = self.path_of(key)?;
        let expected = expected.to_vec();
        blocking(move || {
            let _guard = CasGuard::acquire(&path)?;
            match read_optional(&path)? {
                Some(current) if current == expected => {}
                _ => return Ok(false),
            }
            match new {
                Some(data) => atomic_write(&path, &data)?,
                None => {
                    remove_optional(&path)?;
                }
            }
            Ok(true)
        })
        .await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<MediumEvent>> {
        self.events.as_ref().map(|tx| tx.subscribe())
    }
}
