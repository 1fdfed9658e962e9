//! View-side replica of the backend's node store.
//!
//! A [`Mirror`] holds its own [`NodeStore`] and converges on the backend by applying every
//! [`TreeChange`] in arrival order. Nodes are updated in place so that [`NodeRef`]s held by
//! views (and by [`LinkHandle`]s) stay valid across changes.
//!
//! File creation is optimistic: the node appears in the mirror immediately and is either
//! superseded by the backend's authoritative node or rolled back when the command fails.
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{
    mpsc::{error::TryRecvError, UnboundedReceiver, UnboundedSender},
    oneshot, Mutex as AsyncMutex,
};

use crate::{
    commands::{CommandEnvelope, Op, OpResult},
    config::WorkspaceConfig,
    delta::TreeChange,
    error::TreeError,
    handle::{ExternalDescriber, HandleShared, HandleTarget, LinkHandle},
    node::{LinkForm, Node, NodeKind, NodeRef, TAG_PREFIX},
    paths::{contains, normalize, parent},
    store::{Lookup, NodeStore},
};

/// What undoing an optimistic creation means for one node.
enum Rollback {
    Remove,
    Restore(Node),
}

struct Provisional {
    node: NodeRef,
    request_id: u64,
    rollback: Rollback,
}

pub(crate) struct MirrorState {
    pub(crate) store: NodeStore,
    provisional: HashMap<String, Vec<Provisional>>,
    pub(crate) handles: Vec<Weak<HandleShared>>,
    applied: u64,
}

pub(crate) struct MirrorInner {
    pub(crate) state: Mutex<MirrorState>,
    pub(crate) config: WorkspaceConfig,
    pub(crate) describer: Option<Arc<dyn ExternalDescriber>>,
    changes: AsyncMutex<UnboundedReceiver<TreeChange>>,
    commands: UnboundedSender<CommandEnvelope>,
    next_request: AtomicU64,
}

#[derive(Clone)]
pub struct Mirror {
    inner: Arc<MirrorInner>,
}

/// An optimistic creation awaiting the backend's answer.
pub struct Pending {
    pub node: NodeRef,
    pub request_id: u64,
    reply: oneshot::Receiver<Result<OpResult, TreeError>>,
    mirror: Mirror,
}

impl Pending {
    /// Wait for the backend. On success the mirror has caught up with every change emitted
    /// before the reply; on failure the optimistic node is rolled back.
    pub async fn confirmed(self) -> Result<NodeRef, TreeError> {
        let reply = match self.reply.await {
            Ok(reply) => reply,
            Err(e) => Err(e.into()),
        };
        match reply {
            Ok(_) => {
                self.mirror.sync_pending();
                self.mirror.settle(self.request_id);
                Ok(self.node)
            }
            Err(e) => {
                tracing::warn!(
                    "[Mirror] request {} failed, rolling back: {}",
                    self.request_id,
                    e
                );
                self.mirror.sync_pending();
                self.mirror.rollback(self.request_id);
                Err(e)
            }
        }
    }
}

impl Mirror {
    pub fn new(
        changes: UnboundedReceiver<TreeChange>,
        commands: UnboundedSender<CommandEnvelope>,
        config: WorkspaceConfig,
    ) -> Mirror {
        Mirror::with_describer(changes, commands, config, None)
    }

    pub fn with_describer(
        changes: UnboundedReceiver<TreeChange>,
        commands: UnboundedSender<CommandEnvelope>,
        config: WorkspaceConfig,
        describer: Option<Arc<dyn ExternalDescriber>>,
    ) -> Mirror {
        Mirror {
            inner: Arc::new(MirrorInner {
                state: Mutex::new(MirrorState {
                    store: NodeStore::new(config.case_sensitive),
                    provisional: HashMap::new(),
                    handles: Vec::new(),
                    applied: 0,
                }),
                config,
                describer,
                changes: AsyncMutex::new(changes),
                commands,
                next_request: AtomicU64::new(0),
            }),
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

    pub fn children(&self, path: &str) -> Vec<NodeRef> {
        self.inner.state.lock().store.children(path)
    }

    pub fn check_invariants(&self) -> Vec<String> {
        self.inner.state.lock().store.check_invariants()
    }

    /// Number of changes applied so far.
    pub fn applied(&self) -> u64 {
        self.inner.state.lock().applied
    }

    pub fn handle_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.handles.retain(|handle| handle.strong_count() > 0);
        state.handles.len()
    }

    /// Apply one change from the backend.
    pub fn apply(&self, change: TreeChange) {
        let touched: Vec<NodeRef>;
        let handles: Vec<Arc<HandleShared>>;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let store = &mut state.store;

            for path in change.removed.iter() {
                if store.remove(path).is_none() {
                    tracing::error!("[Mirror] removal of unknown path {}", path);
                }
                let removed = store.key(path);
                state.provisional.retain(|key, _| !contains(&removed, key));
            }

            let mut updated = Vec::new();
            for moved in change.moved.iter() {
                let at_old = store
                    .get(&moved.old_path)
                    .filter(|node| node.read().id == moved.node.id);
                let node = match at_old {
                    Some(node) => match store.move_node(&moved.old_path, &moved.node.path) {
                        Ok(_) => Some(node),
                        Err(e) => {
                            tracing::error!(
                                "[Mirror] cannot move {} to {}: {}",
                                moved.old_path,
                                moved.node.path,
                                e
                            );
                            None
                        }
                    },
                    // Descendants travel with their moved ancestor
                    None => store
                        .get(&moved.node.path)
                        .filter(|node| node.read().id == moved.node.id),
                };
                match node {
                    Some(node) => {
                        node.write().apply_snapshot(&moved.node);
                        updated.push(node);
                    }
                    None => tracing::error!("[Mirror] moved node {} is unknown", moved.old_path),
                }
            }

            for added in change.added.iter() {
                if state.provisional.remove(&store.key(&added.path)).is_some() {
                    tracing::debug!("[Mirror] {} confirmed by the backend", added.path);
                }
                if let Some(existing) = store.get(&added.path) {
                    let replaceable = {
                        let existing = existing.read();
                        existing.is_virtual() && existing.id != added.id
                    };
                    if !replaceable {
                        existing.write().apply_snapshot(added);
                        updated.push(existing);
                        continue;
                    }
                }
                if let Err(e) = store.add(added.clone()) {
                    tracing::error!("[Mirror] cannot add {}: {}", added.path, e);
                }
            }

            for changed in change.changed.iter() {
                match store.get(&changed.path) {
                    Some(existing) => {
                        if existing.read().id != changed.id {
                            tracing::debug!("[Mirror] {} changed identity", changed.path);
                        }
                        existing.write().apply_snapshot(changed);
                        updated.push(existing);
                    }
                    None => tracing::error!("[Mirror] change to unknown node {}", changed.path),
                }
            }

            state.applied += 1;
            state.handles.retain(|handle| handle.strong_count() > 0);
            handles = state.handles.iter().filter_map(Weak::upgrade).collect();
            touched = updated;
        }

        let case_sensitive = self.inner.config.case_sensitive;
        for handle in handles {
            if touched.iter().any(|node| handle.holds(node)) {
                handle.node_updated();
            }
            handle.check_tree_change(&change, case_sensitive);
        }
    }

    /// Apply every change already queued, without waiting. Returns how many were applied.
    pub fn sync_pending(&self) -> usize {
        let Ok(mut changes) = self.inner.changes.try_lock() else {
            return 0;
        };
        let mut applied = 0;
        loop {
            match changes.try_recv() {
                Ok(change) => {
                    self.apply(change);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("[Mirror] change stream closed");
                    break;
                }
            }
        }
        applied
    }

    /// Wait for and apply the next change. None once the backend is gone.
    pub async fn next_change(&self) -> Option<TreeChange> {
        let change = self.inner.changes.lock().await.recv().await?;
        self.apply(change.clone());
        Some(change)
    }

    /// Apply changes until the backend closes the stream.
    pub async fn run(self) {
        while self.next_change().await.is_some() {}
        tracing::info!("[Mirror] change stream ended");
    }

    fn dispatch(&self, op: Op) -> Result<(u64, oneshot::Receiver<Result<OpResult, TreeError>>), TreeError> {
        let request_id = self.inner.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let (reply, rx) = oneshot::channel();
        self.inner.commands.send(CommandEnvelope {
            request_id,
            op,
            reply,
        })?;
        Ok((request_id, rx))
    }

    /// Round-trip a command to the backend, then catch up with the changes it caused.
    pub async fn send(&self, op: Op) -> Result<OpResult, TreeError> {
        let (_, rx) = self.dispatch(op)?;
        let result = rx.await?;
        self.sync_pending();
        result
    }

    /// Create a file optimistically. The returned node is live in the mirror right away.
    pub fn create_file(&self, path: &str, contents: Option<String>) -> Result<Pending, TreeError> {
        let path = normalize(path);
        let request_id = self.inner.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let node = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if path.is_empty() || path.starts_with(TAG_PREFIX) {
                return Err(TreeError::Command(format!("Cannot create '{path}'")));
            }
            if let Some(occupant) = state.store.get(&path) {
                if !occupant.read().is_virtual() {
                    return Err(TreeError::PathCollision(path));
                }
            }
            let mut entries = Vec::new();
            let (_, created) = state.store.ensure_folder_exists(
                parent(&path),
                |_, name| Node::folder(name),
                false,
            )?;
            for folder in created {
                entries.push((
                    state.store.key(&folder.read().path),
                    Provisional {
                        node: folder.clone(),
                        request_id,
                        rollback: Rollback::Remove,
                    },
                ));
            }
            let node = match state.store.get(&path) {
                Some(existing) if existing.read().is_virtual() => {
                    let before = existing.read().snapshot();
                    existing.write().meta.is_virtual = false;
                    entries.push((
                        state.store.key(&path),
                        Provisional {
                            node: existing.clone(),
                            request_id,
                            rollback: Rollback::Restore(before),
                        },
                    ));
                    existing
                }
                _ => {
                    let node = state.store.add(Node::new(&path, NodeKind::for_path(&path)))?;
                    entries.push((
                        state.store.key(&path),
                        Provisional {
                            node: node.clone(),
                            request_id,
                            rollback: Rollback::Remove,
                        },
                    ));
                    node
                }
            };
            for (key, entry) in entries {
                state.provisional.entry(key).or_default().push(entry);
            }
            node
        };
        tracing::debug!("[Mirror] optimistic create of {} (request {})", path, request_id);
        self.notify_handles(&TreeChange {
            added: vec![node.read().snapshot()],
            ..Default::default()
        });

        let (reply, rx) = oneshot::channel();
        let sent = self.inner.commands.send(CommandEnvelope {
            request_id,
            op: Op::CreateFile { path, contents },
            reply,
        });
        if let Err(e) = sent {
            self.rollback(request_id);
            return Err(e.into());
        }
        Ok(Pending {
            node,
            request_id,
            reply: rx,
            mirror: self.clone(),
        })
    }

    /// Forget provisional entries of a confirmed request.
    fn settle(&self, request_id: u64) {
        let mut state = self.inner.state.lock();
        state.provisional.retain(|_, entries| {
            entries.retain(|entry| entry.request_id != request_id);
            !entries.is_empty()
        });
    }

    fn rollback(&self, request_id: u64) {
        let mut undone = TreeChange::default();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut entries: Vec<Provisional> = Vec::new();
            state.provisional.retain(|_, pending| {
                let (mine, others): (Vec<Provisional>, Vec<Provisional>) = pending
                    .drain(..)
                    .partition(|entry| entry.request_id == request_id);
                entries.extend(mine);
                *pending = others;
                !pending.is_empty()
            });
            // Innermost first, so folders are empty by the time they go
            entries.sort_by_key(|entry| std::cmp::Reverse(entry.node.read().depth));
            for entry in entries {
                let path = entry.node.read().path.clone();
                match entry.rollback {
                    Rollback::Remove => {
                        let empty = entry.node.read().children.is_empty();
                        if empty && state.store.remove(&path).is_some() {
                            undone.removed.push(path);
                        }
                    }
                    Rollback::Restore(snapshot) => {
                        entry.node.write().apply_snapshot(&snapshot);
                        undone.changed.push(snapshot);
                    }
                }
            }
        }
        if !undone.is_empty() {
            self.notify_handles(&undone);
        }
    }

    fn notify_handles(&self, change: &TreeChange) {
        let handles: Vec<Arc<HandleShared>> = {
            let state = self.inner.state.lock();
            state.handles.iter().filter_map(Weak::upgrade).collect()
        };
        for handle in handles {
            handle.check_tree_change(change, self.inner.config.case_sensitive);
        }
    }

    fn register(&self, target: HandleTarget) -> LinkHandle {
        let shared = HandleShared::new(Arc::downgrade(&self.inner), target);
        self.inner.state.lock().handles.push(Arc::downgrade(&shared));
        LinkHandle { shared }
    }

    /// Handle tracking the target of a link written in `from`.
    pub fn link_handle(&self, from: &str, href: &str, form: LinkForm) -> LinkHandle {
        self.register(HandleTarget::Link {
            from: normalize(from),
            href: href.to_string(),
            form,
        })
    }

    /// Handle holding a node directly.
    pub fn node_handle(&self, node: NodeRef) -> LinkHandle {
        self.register(HandleTarget::Node(node))
    }
}
