//! The authoritative backend: owns the canonical [`NodeStore`], the link graph derived from
//! parsed content, and the reconciliation loop that absorbs filesystem events.
//!
//! ## Key Components
//!
//! - [`Backend`] - cheap to clone; every clone addresses the same workspace state.
//! - `index` - parsing files and folding their links into `meta.structure` / `meta.inLinks`,
//!   including placeholder creation and virtual garbage collection.
//! - `rename` - moves, link path remapping and link-rename propagation.
//! - `reconcile` - the per-path debounce state machine fed by the watcher.
//! - `operations` - the command surface ([`crate::commands::Op`]).
//!
//! ## Serialization
//!
//! All mutation of the store happens while holding the state lock, and the resulting
//! [`TreeChange`] is emitted before that lock is released. Subscribers therefore observe one
//! linear stream of changes in the order the store went through them. The lock is never held
//! across an `.await`; async steps re-validate what they looked up before suspending.
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    watch,
};

use crate::{
    cache::{CachedIndex, IndexCache},
    commands::CommandEnvelope,
    config::WorkspaceConfig,
    content::{ContentCache, SaveHook},
    delta::{ChangeBuilder, TreeChange},
    fs::FileSystem,
    links::LinkStyle,
    node::{NodeId, NodeRef},
    parser::ParserMap,
    store::{Lookup, NodeStore},
    tasks::ActiveTasks,
};

mod index;
mod operations;
mod reconcile;
mod rename;

/// Counters exposed for tests and tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    /// Completed watcher reconciliation passes.
    pub reconcile_passes: u64,
    /// Files actually run through a parser.
    pub index_passes: u64,
    /// Link spans rewritten by rename propagation.
    pub link_rewrites: u64,
    /// Files indexed from the persisted cache instead of parsing.
    pub cache_hits: u64,
}

/// Outcome of [`Backend::load`]. `messages` holds human-readable problems worth showing a
/// user; an empty list means a clean load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub messages: Vec<String>,
    pub nodes: usize,
    pub indexed: usize,
    pub cached: usize,
}

/// A path with a pending watcher event: a debounce timer identified by `generation`, and a
/// channel flipped to `true` once the reconciliation pass for the path has finished.
pub(crate) struct DirtyEntry {
    generation: u64,
    settled: watch::Sender<bool>,
}

pub(crate) struct State {
    pub(crate) store: NodeStore,
    dirty: HashMap<String, DirtyEntry>,
    parsed: HashMap<NodeId, CachedIndex>,
    stats: BackendStats,
}

struct Inner {
    config: WorkspaceConfig,
    fs: Arc<dyn FileSystem>,
    parsers: ParserMap,
    link_style: Arc<dyn LinkStyle>,
    tasks: ActiveTasks,
    content: ContentCache,
    state: Mutex<State>,
    subscribers: Mutex<Vec<UnboundedSender<TreeChange>>>,
}

#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

impl Backend {
    pub fn new(fs: Arc<dyn FileSystem>, config: WorkspaceConfig) -> Backend {
        Backend::with_parsers(fs, config, ParserMap::create())
    }

    pub fn with_parsers(
        fs: Arc<dyn FileSystem>,
        config: WorkspaceConfig,
        parsers: ParserMap,
    ) -> Backend {
        let tasks = ActiveTasks::new();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let hook_tasks = tasks.clone();
            let on_saved: SaveHook = Arc::new(move |path: String| {
                if let Some(inner) = weak.upgrade() {
                    let backend = Backend { inner };
                    hook_tasks.spawn(format!("index after save {path}"), async move {
                        backend.after_save(&path).await
                    });
                }
            });
            Inner {
                content: ContentCache::new(
                    fs.clone(),
                    tasks.clone(),
                    config.write_debounce(),
                    config.case_sensitive,
                    Some(on_saved),
                ),
                link_style: config.link_style.style(),
                state: Mutex::new(State {
                    store: NodeStore::new(config.case_sensitive),
                    dirty: HashMap::new(),
                    parsed: HashMap::new(),
                    stats: BackendStats::default(),
                }),
                subscribers: Mutex::new(Vec::new()),
                config,
                fs,
                parsers,
                tasks,
            }
        });
        Backend { inner }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.inner.config
    }

    pub fn content(&self) -> &ContentCache {
        &self.inner.content
    }

    pub fn tasks(&self) -> &ActiveTasks {
        &self.inner.tasks
    }

    pub fn fs(&self) -> Arc<dyn FileSystem> {
        self.inner.fs.clone()
    }

    /// Swap the link rendering strategy used by rename propagation.
    pub fn with_link_style(self, style: Arc<dyn LinkStyle>) -> Backend {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.link_style = style;
                Backend {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("[Backend] link style can only be replaced before sharing");
                Backend { inner }
            }
        }
    }

    pub fn get(&self, path: &str) -> Option<NodeRef> {
        self.inner.state.lock().store.get(path)
    }

    pub fn get_fuzzy(&self, query: &str) -> Lookup {
        self.inner.state.lock().store.get_fuzzy(query)
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.state.lock().store.paths()
    }

    pub fn check_invariants(&self) -> Vec<String> {
        self.inner.state.lock().store.check_invariants()
    }

    pub fn stats(&self) -> BackendStats {
        self.inner.state.lock().stats
    }

    /// Number of paths with a pending (not yet started) reconciliation.
    pub fn dirty_len(&self) -> usize {
        self.inner.state.lock().dirty.len()
    }

    /// Subscribe to the change stream. The first change received lists every existing node
    /// as `added`, in an order that can be applied to an empty store.
    pub fn subscribe(&self) -> UnboundedReceiver<TreeChange> {
        let (tx, rx) = unbounded_channel();
        let state = self.inner.state.lock();
        let initial = TreeChange {
            added: state
                .store
                .iter()
                .into_iter()
                .map(|node| node.read().snapshot())
                .collect(),
            ..Default::default()
        };
        if !initial.is_empty() && tx.send(initial).is_err() {
            return rx;
        }
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Send the builder's change to every subscriber. Callers hold the state lock.
    fn emit(&self, builder: ChangeBuilder) {
        if builder.is_empty() {
            return;
        }
        let change = builder.finish();
        if change.is_empty() {
            return;
        }
        tracing::debug!("[Backend] emitting {}", change);
        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Resolves once no path is dirty and no backend task is in flight. Finishing one wave of
    /// work can start another, so the check repeats after every wake-up.
    pub async fn watcher_idle(&self) {
        loop {
            let notified = self.inner.tasks.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let idle = self.inner.state.lock().dirty.is_empty() && self.inner.tasks.is_empty();
            if idle {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of the parse results worth persisting, keyed by current path.
    pub fn index_cache(&self) -> IndexCache {
        let state = self.inner.state.lock();
        let mut cache = IndexCache::default();
        for node in state.store.iter() {
            let node = node.read();
            if node.is_virtual() || !node.kind.has_content() {
                continue;
            }
            if let Some(entry) = state.parsed.get(&node.id) {
                cache.entries.insert(node.path.clone(), entry.clone());
            }
        }
        cache
    }

    /// Flush pending writes, wait for the backend to settle and persist the index cache.
    #[tracing::instrument(skip_all)]
    pub async fn close(&self) -> Vec<String> {
        let mut messages = Vec::new();
        self.watcher_idle().await;
        for e in self.inner.content.save_all().await {
            messages.push(format!("Could not save pending changes: {e}"));
        }
        self.watcher_idle().await;
        let cache = self.index_cache();
        if let Err(e) = cache
            .write(self.inner.fs.as_ref(), &self.inner.config.cache_file)
            .await
        {
            messages.push(format!("Could not write the index cache: {e}"));
        }
        self.inner.subscribers.lock().clear();
        tracing::info!("[Backend] closed with {} message(s)", messages.len());
        messages
    }

    /// Execute commands until every sender is dropped.
    pub async fn serve(self, mut commands: UnboundedReceiver<CommandEnvelope>) {
        while let Some(envelope) = commands.recv().await {
            tracing::debug!(
                "[Backend] request {}: {}",
                envelope.request_id,
                envelope.op
            );
            let result = self.execute(envelope.op).await;
            if let Err(e) = result.as_ref() {
                tracing::warn!("[Backend] request {} failed: {}", envelope.request_id, e);
            }
            if envelope.reply.send(result).is_err() {
                tracing::debug!(
                    "[Backend] requester of {} went away before the reply",
                    envelope.request_id
                );
            }
        }
        tracing::info!("[Backend] command channel closed");
    }
}
