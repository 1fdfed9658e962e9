//! Reference-counted file content.
//!
//! Content is cached only while at least one [`FileHandle`] is alive. Dropping the last handle
//! saves pending edits and unloads the entry. Edits mark the entry dirty and schedule a
//! debounced save; every edit bumps a generation counter so a save only clears the dirty flag
//! when nothing changed while it was writing.
//!
//! Structured files (`.json`, `.toml`) are held as a JSON value and can be edited with merge
//! patches, so two writers touching unrelated fields converge.
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    error::TreeError,
    fs::FileSystem,
    node::{DataKind, NodeKind},
    paths::{contains, fold, rebase},
    patch::{apply_merge_patch, diff},
    tasks::ActiveTasks,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Structured(Value),
}

impl Content {
    pub fn parse(kind: Option<DataKind>, text: &str) -> Result<Content, TreeError> {
        match kind {
            None => Ok(Content::Text(text.to_string())),
            Some(_) if text.trim().is_empty() => {
                Ok(Content::Structured(Value::Object(Default::default())))
            }
            Some(DataKind::Json) => Ok(Content::Structured(serde_json::from_str(text)?)),
            Some(DataKind::Toml) => {
                let value: toml::Value = toml::from_str(text)?;
                Ok(Content::Structured(serde_json::to_value(value)?))
            }
        }
    }

    pub fn empty(kind: Option<DataKind>) -> Content {
        match kind {
            None => Content::Text(String::new()),
            Some(_) => Content::Structured(Value::Object(Default::default())),
        }
    }

    pub fn to_text(&self, kind: Option<DataKind>) -> Result<String, TreeError> {
        match (self, kind) {
            (Content::Text(text), _) => Ok(text.clone()),
            (Content::Structured(value), Some(DataKind::Toml)) => Ok(toml::to_string(value)?),
            (Content::Structured(value), _) => Ok(serde_json::to_string_pretty(value)?),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Structured(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Content::Structured(value) => Some(value),
            Content::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    Unloaded,
    Loading,
    Loaded,
    /// Not yet persisted. Reads and writes behave like `Loaded`.
    New,
    /// The file went away. Pending saves are dropped.
    Deleted,
}

struct Entry {
    path: String,
    kind: Option<DataKind>,
    state: ContentState,
    content: Content,
    saved: Content,
    dirty: bool,
    refs: usize,
    generation: u64,
    io: Arc<AsyncMutex<()>>,
}

impl Entry {
    fn new(path: &str, kind: Option<DataKind>) -> Entry {
        Entry {
            path: path.to_string(),
            kind,
            state: ContentState::Unloaded,
            content: Content::empty(kind),
            saved: Content::empty(kind),
            dirty: false,
            refs: 0,
            generation: 0,
            io: Arc::new(AsyncMutex::new(())),
        }
    }

    fn is_readable(&self) -> bool {
        matches!(self.state, ContentState::Loaded | ContentState::New)
    }
}

fn data_kind(path: &str) -> Option<DataKind> {
    match NodeKind::for_path(path) {
        NodeKind::Data { kind } => Some(kind),
        _ => None,
    }
}

/// Called with the path of every successful save.
pub type SaveHook = Arc<dyn Fn(String) + Send + Sync>;

struct ContentInner {
    fs: Arc<dyn FileSystem>,
    tasks: ActiveTasks,
    entries: Mutex<HashMap<String, Entry>>,
    write_debounce: Duration,
    case_sensitive: bool,
    on_saved: Option<SaveHook>,
}

#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<ContentInner>,
}

/// An open reference to one file's content. Dropping it releases the reference.
pub struct FileHandle {
    cache: ContentCache,
    key: String,
}

impl FileHandle {
    pub fn path(&self) -> String {
        self.cache
            .inner
            .entries
            .lock()
            .get(&self.key)
            .map(|entry| entry.path.clone())
            .unwrap_or_default()
    }

    pub fn content(&self) -> Option<Content> {
        self.cache.with_entry(&self.key, |entry| {
            entry.is_readable().then(|| entry.content.clone())
        })
        .flatten()
    }

    pub fn text(&self) -> Option<String> {
        self.content()
            .and_then(|content| content.as_text().map(str::to_string))
    }

    pub fn state(&self) -> ContentState {
        self.cache
            .with_entry(&self.key, |entry| entry.state)
            .unwrap_or(ContentState::Unloaded)
    }

    pub fn is_dirty(&self) -> bool {
        self.cache
            .with_entry(&self.key, |entry| entry.dirty)
            .unwrap_or(false)
    }

    /// Replace the whole content.
    pub fn set(&self, content: Content) -> Result<(), TreeError> {
        self.edit(|current| {
            *current = content;
            Ok(true)
        })
    }

    /// Edit text in place. `edit` returns whether it changed anything.
    pub fn update_text<F>(&self, edit: F) -> Result<bool, TreeError>
    where
        F: FnOnce(&mut String) -> bool,
    {
        let mut changed = false;
        self.edit(|content| match content {
            Content::Text(text) => {
                changed = edit(text);
                Ok(changed)
            }
            Content::Structured(_) => Err(TreeError::Command(
                "Text edit on structured content".to_string(),
            )),
        })?;
        Ok(changed)
    }

    pub fn apply_patch(&self, patch: &Value) -> Result<(), TreeError> {
        self.edit(|content| match content {
            Content::Structured(value) => {
                let before = value.clone();
                apply_merge_patch(value, patch);
                Ok(*value != before)
            }
            Content::Text(_) => Err(TreeError::Command(
                "Merge patch on text content".to_string(),
            )),
        })
    }

    /// Merge patch from the last saved state to the current one.
    pub fn diff_since_saved(&self) -> Option<Value> {
        self.cache
            .with_entry(&self.key, |entry| match (&entry.saved, &entry.content) {
                (Content::Structured(saved), Content::Structured(current)) => {
                    diff(saved, current)
                }
                _ => None,
            })
            .flatten()
    }

    fn edit<F>(&self, edit: F) -> Result<(), TreeError>
    where
        F: FnOnce(&mut Content) -> Result<bool, TreeError>,
    {
        let generation = {
            let mut entries = self.cache.inner.entries.lock();
            let entry = entries
                .get_mut(&self.key)
                .ok_or_else(|| TreeError::NotFound(self.key.clone()))?;
            if !entry.is_readable() {
                return Err(TreeError::Command(format!(
                    "'{}' is not loaded ({:?})",
                    entry.path, entry.state
                )));
            }
            if !edit(&mut entry.content)? {
                return Ok(());
            }
            entry.dirty = true;
            entry.generation += 1;
            entry.generation
        };
        self.cache.schedule_save(&self.key, generation);
        Ok(())
    }

    pub async fn save(&self) -> Result<bool, TreeError> {
        self.cache.save_key(&self.key).await
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

impl ContentCache {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        tasks: ActiveTasks,
        write_debounce: Duration,
        case_sensitive: bool,
        on_saved: Option<SaveHook>,
    ) -> ContentCache {
        ContentCache {
            inner: Arc::new(ContentInner {
                fs,
                tasks,
                entries: Mutex::new(HashMap::new()),
                write_debounce,
                case_sensitive,
                on_saved,
            }),
        }
    }

    fn key(&self, path: &str) -> String {
        fold(path, self.inner.case_sensitive)
    }

    fn with_entry<T>(&self, key: &str, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        self.inner.entries.lock().get(key).map(f)
    }

    fn acquire(&self, path: &str) -> (FileHandle, Arc<AsyncMutex<()>>) {
        let key = self.key(path);
        let io = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(key.clone())
                .or_insert_with(|| Entry::new(path, data_kind(path)));
            entry.refs += 1;
            entry.io.clone()
        };
        (
            FileHandle {
                cache: self.clone(),
                key,
            },
            io,
        )
    }

    /// Open existing file content, loading it from disk on first use.
    pub async fn open(&self, path: &str) -> Result<FileHandle, TreeError> {
        let (handle, io) = self.acquire(path);
        let _io = io.lock().await;
        let needs_load = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(&handle.key) {
                Some(entry) if entry.state == ContentState::Unloaded => {
                    entry.state = ContentState::Loading;
                    Some((entry.path.clone(), entry.kind))
                }
                Some(entry) if entry.state == ContentState::Deleted => {
                    return Err(TreeError::NotFound(entry.path.clone()));
                }
                _ => None,
            }
        };
        if let Some((path, kind)) = needs_load {
            let loaded = match self.inner.fs.read_file(&path).await {
                Ok(text) => Content::parse(kind, &text),
                Err(e) => Err(e),
            };
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(&handle.key) {
                match loaded {
                    Ok(content) => {
                        entry.content = content.clone();
                        entry.saved = content;
                        entry.state = ContentState::Loaded;
                    }
                    Err(e) => {
                        entry.state = ContentState::Unloaded;
                        return Err(e);
                    }
                }
            }
        }
        Ok(handle)
    }

    /// Open content for a file that does not exist on disk yet. The first save creates it.
    pub fn create(&self, path: &str, content: Option<Content>) -> FileHandle {
        let (handle, _) = self.acquire(path);
        let generation = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(&handle.key) else {
                return handle;
            };
            if entry.is_readable() {
                return handle;
            }
            entry.content = content.unwrap_or_else(|| Content::empty(entry.kind));
            entry.saved = Content::empty(entry.kind);
            entry.state = ContentState::New;
            entry.dirty = true;
            entry.generation += 1;
            entry.generation
        };
        self.schedule_save(&handle.key, generation);
        handle
    }

    pub fn is_open(&self, path: &str) -> bool {
        self.with_entry(&self.key(path), |entry| entry.refs > 0)
            .unwrap_or(false)
    }

    pub fn is_dirty(&self, path: &str) -> bool {
        self.with_entry(&self.key(path), |entry| entry.dirty)
            .unwrap_or(false)
    }

    /// Current text of an open, loaded text file.
    pub fn text(&self, path: &str) -> Option<String> {
        self.with_entry(&self.key(path), |entry| {
            if entry.is_readable() {
                entry.content.as_text().map(str::to_string)
            } else {
                None
            }
        })
        .flatten()
    }

    /// An external writer changed the file. Clean entries take the new text; dirty entries
    /// keep their in-memory edits. Returns whether the entry was refreshed.
    pub fn refresh_from_disk(&self, path: &str, text: &str) -> bool {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(&self.key(path)) else {
            return false;
        };
        if entry.dirty || !entry.is_readable() {
            if entry.dirty {
                tracing::warn!(
                    "[ContentCache] {} changed on disk while it has unsaved edits, keeping edits",
                    entry.path
                );
            }
            return false;
        }
        match Content::parse(entry.kind, text) {
            Ok(content) => {
                entry.content = content.clone();
                entry.saved = content;
                entry.state = ContentState::Loaded;
                true
            }
            Err(e) => {
                tracing::warn!("[ContentCache] cannot refresh {}: {}", entry.path, e);
                false
            }
        }
    }

    /// Re-key every entry under `old` to live under `new`.
    pub fn rename(&self, old: &str, new: &str) {
        let mut entries = self.inner.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| contains(old, &entry.path))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(mut entry) = entries.remove(&key) {
                if let Some(path) = rebase(&entry.path, old, new) {
                    entry.path = path;
                }
                entries.insert(fold(&entry.path, self.inner.case_sensitive), entry);
            }
        }
    }

    /// Hold the write locks of every entry under `path`, so no save races a rename or delete.
    pub async fn lock_subtree(&self, path: &str) -> Vec<OwnedMutexGuard<()>> {
        let locks: Vec<Arc<AsyncMutex<()>>> = self
            .inner
            .entries
            .lock()
            .values()
            .filter(|entry| contains(path, &entry.path))
            .map(|entry| entry.io.clone())
            .collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    pub fn mark_deleted(&self, path: &str) {
        let mut entries = self.inner.entries.lock();
        for entry in entries.values_mut().filter(|entry| contains(path, &entry.path)) {
            entry.state = ContentState::Deleted;
            entry.dirty = false;
        }
    }

    /// A deleted path was re-created; open entries can load again.
    pub fn mark_restored(&self, path: &str) {
        if let Some(entry) = self.inner.entries.lock().get_mut(&self.key(path)) {
            if entry.state == ContentState::Deleted {
                entry.state = ContentState::Unloaded;
            }
        }
    }

    fn schedule_save(&self, key: &str, generation: u64) {
        let cache = self.clone();
        let key = key.to_string();
        let delay = self.inner.write_debounce;
        self.inner.tasks.spawn(format!("save {key}"), async move {
            tokio::time::sleep(delay).await;
            let current = cache.with_entry(&key, |entry| entry.generation);
            if current != Some(generation) {
                return Ok(());
            }
            cache.save_key(&key).await.map(|_| ())
        });
    }

    pub async fn save(&self, path: &str) -> Result<bool, TreeError> {
        self.save_key(&self.key(path)).await
    }

    /// Persist every dirty entry.
    pub async fn save_all(&self) -> Vec<TreeError> {
        let keys: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, _)| key.clone())
            .collect();
        let mut errors = Vec::new();
        for key in keys {
            if let Err(e) = self.save_key(&key).await {
                errors.push(e);
            }
        }
        errors
    }

    async fn save_key(&self, key: &str) -> Result<bool, TreeError> {
        let Some(io) = self.with_entry(key, |entry| entry.io.clone()) else {
            return Ok(false);
        };
        let _io = io.lock().await;
        let snapshot = {
            let entries = self.inner.entries.lock();
            match entries.get(key) {
                Some(entry) if entry.dirty && entry.is_readable() => Some((
                    entry.path.clone(),
                    entry.content.clone(),
                    entry.content.to_text(entry.kind)?,
                    entry.generation,
                )),
                _ => None,
            }
        };
        let Some((path, content, text, generation)) = snapshot else {
            return Ok(false);
        };
        tracing::debug!("[ContentCache] writing {}", path);
        self.inner.fs.write_file(&path, &text).await?;
        {
            let mut entries = self.inner.entries.lock();
            if let Some(entry) = entries.get_mut(key) {
                entry.saved = content;
                entry.state = ContentState::Loaded;
                if entry.generation == generation {
                    entry.dirty = false;
                }
            }
        }
        if let Some(hook) = self.inner.on_saved.as_ref() {
            hook(path);
        }
        Ok(true)
    }

    fn release(&self, key: &str) {
        let (remaining, dirty) = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                tracing::error!("[ContentCache] released unknown entry {}", key);
                return;
            };
            entry.refs = entry.refs.saturating_sub(1);
            (entry.refs, entry.dirty)
        };
        if remaining > 0 {
            return;
        }
        if !dirty {
            self.unload_if_unused(key);
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!(
                "[ContentCache] dropping unsaved edits to {}: no runtime to save on",
                key
            );
            self.unload_if_unused(key);
            return;
        }
        let cache = self.clone();
        let key = key.to_string();
        self.inner.tasks.spawn(format!("unload {key}"), async move {
            let saved = cache.save_key(&key).await;
            cache.unload_if_unused(&key);
            saved.map(|_| ())
        });
    }

    fn unload_if_unused(&self, key: &str) {
        let mut entries = self.inner.entries.lock();
        if entries
            .get(key)
            .map(|entry| entry.refs == 0 && !entry.dirty)
            .unwrap_or(false)
        {
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
