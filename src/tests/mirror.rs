//! Mirror convergence, optimistic creation and link handle dirty checks

use super::helpers::*;
use crate::{
    backend::Backend,
    commands::{ContentUpdate, Op},
    delta::TreeChange,
    error::TreeError,
    fs::DiskFs,
    handle::{Dependency, ExternalDescriber, ExternalMeta, Resolved},
    mirror::Mirror,
    node::{LinkForm, Node, NodeKind},
};
use async_trait::async_trait;
use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;
use test_log::test;
use tokio::sync::{mpsc::unbounded_channel, Notify};

fn connect(backend: &Backend) -> Mirror {
    let (commands, rx) = unbounded_channel();
    tokio::spawn(backend.clone().serve(rx));
    let mirror = Mirror::new(backend.subscribe(), commands, backend.config().clone());
    mirror.sync_pending();
    mirror
}

async fn connected(files: &[(&str, &str)]) -> (TempDir, Backend, Mirror) {
    let (dir, backend) = loaded_backend(files).await;
    let mirror = connect(&backend);
    (dir, backend, mirror)
}

/// Same paths, ids, states and metadata on both sides.
fn assert_converged(backend: &Backend, mirror: &Mirror) {
    assert_eq!(backend.paths(), mirror.paths());
    for path in backend.paths() {
        let ours = backend.get(&path).unwrap();
        let theirs = mirror.get(&path).unwrap();
        let (ours, theirs) = (ours.read(), theirs.read());
        assert_eq!(ours.id, theirs.id, "id of {path}");
        assert_eq!(ours.state, theirs.state, "state of {path}");
        assert_eq!(ours.meta, theirs.meta, "meta of {path}");
        assert_eq!(ours.children, theirs.children, "children of {path}");
    }
    assert!(mirror.check_invariants().is_empty());
}

#[test(tokio::test)]
async fn test_delta_stream_rebuilds_backend_tree() {
    init_logging();
    let dir = TempDir::new().unwrap();
    write_files(
        dir.path(),
        &[
            ("Rename Target.md", "# Target\n#topic\n"),
            ("B.md", "[[Rename Target]] [[Ghost]] [[Folder/Deep/Nested]]\n"),
            ("Keep/Data.json", "{}"),
        ],
    );
    let backend = Backend::new(Arc::new(DiskFs::new(dir.path())), test_config());
    // Subscribed before load: the mirror starts from an empty store.
    let mirror = connect(&backend);
    assert!(mirror.paths().is_empty());
    backend.load(None).await;

    mirror.send(Op::Move {
        from: "Rename Target.md".to_string(),
        to: "Folder/Rename Target.md".to_string(),
    })
    .await
    .unwrap();
    mirror.send(Op::CreateFile {
        path: "Ghost.md".to_string(),
        contents: Some("[[B]]".to_string()),
    })
    .await
    .unwrap();
    mirror.send(Op::Delete("Keep".to_string())).await.unwrap();
    mirror
        .send(Op::UpdateFileContents {
            path: "B.md".to_string(),
            update: ContentUpdate::Text("Only [[Ghost]] now\n".to_string()),
        })
        .await
        .unwrap();
    write_files(dir.path(), &[("External/New.md", "#topic/sub\n")]);
    backend.notify_path_changed("External/New.md");
    backend.watcher_idle().await;
    mirror.sync_pending();

    assert!(backend.get("Folder/Deep/Nested.md").is_none());
    assert!(backend.get("#topic/sub").is_some());
    assert_converged(&backend, &mirror);
}

#[test(tokio::test)]
async fn test_optimistic_create_is_confirmed_in_place() {
    let (_dir, backend, mirror) = connected(&[("A.md", "")]).await;

    let pending = mirror.create_file("Inbox/Fresh.md", None).unwrap();
    let optimistic = mirror.get("Inbox/Fresh.md").expect("visible before the round trip");
    assert!(Arc::ptr_eq(&optimistic, &pending.node));
    assert!(backend.get("Inbox/Fresh.md").is_none());

    let confirmed = pending.confirmed().await.unwrap();
    assert!(Arc::ptr_eq(&confirmed, &optimistic));
    let authoritative = backend.get("Inbox/Fresh.md").unwrap();
    assert_eq!(confirmed.read().id, authoritative.read().id);
    assert!(!confirmed.read().is_virtual());
    backend.watcher_idle().await;
    mirror.sync_pending();
    assert_converged(&backend, &mirror);
}

#[test(tokio::test)]
async fn test_failed_optimistic_create_rolls_back() {
    let (dir, backend, mirror) = connected(&[("A.md", "")]).await;
    // A plain file the backend has not seen yet blocks the folder on disk.
    std::fs::write(dir.path().join("Sub"), "a file where a folder should be").unwrap();

    let pending = mirror.create_file("Sub/Blocked.md", None).unwrap();
    assert!(mirror.get("Sub/Blocked.md").is_some());
    assert!(mirror.get("Sub").unwrap().read().kind.is_folder());

    assert!(pending.confirmed().await.is_err());
    assert!(mirror.get("Sub/Blocked.md").is_none());
    assert!(mirror.get("Sub").is_none());
    assert!(backend.get("Sub").is_none());
    assert!(mirror.check_invariants().is_empty());

    assert!(matches!(
        mirror.create_file("A.md", None),
        Err(TreeError::PathCollision(_))
    ));
    assert!(matches!(
        mirror.create_file("#tag", None),
        Err(TreeError::Command(_))
    ));
}

#[test(tokio::test)]
async fn test_racing_create_converges_on_backend_node() {
    let (_dir, backend, mirror) = connected(&[]).await;
    backend.create_file("Race.md", None).await.unwrap();

    // The mirror has not applied the backend's change yet.
    let pending = mirror.create_file("Race.md", None).unwrap();
    assert!(matches!(
        pending.confirmed().await,
        Err(TreeError::PathCollision(_))
    ));
    let node = mirror.get("Race.md").unwrap();
    assert_eq!(node.read().id, backend.get("Race.md").unwrap().read().id);
    assert_converged(&backend, &mirror);
}

#[test(tokio::test)]
async fn test_handle_follows_placeholder_promotion_without_resolving() {
    let (_dir, _backend, mirror) = connected(&[("A.md", "[[New Note]]\n")]).await;
    let handle = mirror.link_handle("A.md", "New Note", LinkForm::Wiki);
    let placeholder = match handle.get() {
        Resolved::Node(node) => node,
        other => panic!("expected the placeholder, got {other}"),
    };
    assert!(placeholder.read().is_virtual());
    assert_eq!(handle.resolve_count(), 1);
    assert!(handle
        .dependencies()
        .contains(&Dependency::Held("New Note.md".to_string())));

    let mut updates = handle.subscribe();
    mirror.send(Op::CreateFile {
        path: "New Note.md".to_string(),
        contents: None,
    })
    .await
    .unwrap();

    assert!(updates.has_changed().unwrap());
    let current = updates.borrow_and_update().clone();
    let node = current.node().expect("still resolved");
    assert!(Arc::ptr_eq(node, &placeholder));
    assert!(!node.read().is_virtual());
    assert_eq!(handle.resolve_count(), 1);
}

#[test(tokio::test)]
async fn test_handle_ignores_disjoint_changes() {
    let (_dir, _backend, mirror) = connected(&[("Notes/A.md", "[[Target]]\n"), ("Notes/Target.md", "")]).await;
    let handle = mirror.link_handle("Notes/A.md", "Target", LinkForm::Wiki);
    assert_eq!(handle.get().paths(), vec!["Notes/Target.md".to_string()]);

    mirror
        .send(Op::CreateFile {
            path: "Elsewhere/Unrelated.md".to_string(),
            contents: Some("text".to_string()),
        })
        .await
        .unwrap();
    assert!(!handle.is_dirty());
    assert_eq!(handle.resolve_count(), 1);

    // A second note with the same stem could change a bare-name resolution.
    mirror
        .send(Op::CreateFile {
            path: "Elsewhere/Target.md".to_string(),
            contents: None,
        })
        .await
        .unwrap();
    assert!(handle.is_dirty());
    assert_eq!(handle.get().paths(), vec!["Notes/Target.md".to_string()]);
    assert_eq!(handle.resolve_count(), 2);
}

#[test(tokio::test)]
async fn test_handle_tracks_moved_target() {
    let (_dir, backend, mirror) =
        connected(&[("Rename Target.md", ""), ("B.md", "[[Rename Target]]\n")]).await;
    let handle = mirror.node_handle(mirror.get("Rename Target.md").unwrap());
    let link = mirror.link_handle("B.md", "Rename Target", LinkForm::Wiki);
    assert_eq!(mirror.handle_count(), 2);

    mirror
        .send(Op::Move {
            from: "Rename Target.md".to_string(),
            to: "Folder/Rename Target.md".to_string(),
        })
        .await
        .unwrap();
    assert!(handle.is_dirty());
    assert_eq!(handle.get().paths(), vec!["Folder/Rename Target.md".to_string()]);
    // Fuzzy resolution still finds the moved note by name.
    assert_eq!(link.get().paths(), vec!["Folder/Rename Target.md".to_string()]);

    backend.watcher_idle().await;
    mirror.sync_pending();
    drop(link);
    assert_eq!(mirror.handle_count(), 1);
}

#[test(tokio::test)]
async fn test_handle_reports_untracked_and_empty() {
    let (_dir, _backend, mirror) = connected(&[("A.md", "")]).await;
    let external = mirror.link_handle("A.md", "https://example.com/page", LinkForm::Url);
    assert!(matches!(external.get(), Resolved::Untracked(url) if url == "https://example.com/page"));

    let missing = mirror.link_handle("A.md", "Not Yet", LinkForm::Wiki);
    assert!(matches!(missing.get(), Resolved::Untracked(path) if path == "Not Yet.md"));

    let empty = mirror.link_handle("A.md", "", LinkForm::Wiki);
    assert!(matches!(empty.get(), Resolved::Empty));
}

/// Describer whose first call blocks until released. Titles carry the call number.
#[derive(Default)]
struct GatedDescriber {
    calls: AtomicUsize,
    finished: AtomicUsize,
    release_first: Notify,
}

#[async_trait]
impl ExternalDescriber for GatedDescriber {
    async fn describe(&self, target: &str) -> Option<ExternalMeta> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == 1 {
            self.release_first.notified().await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        Some(ExternalMeta {
            url: target.to_string(),
            title: Some(format!("call {call}")),
            description: None,
        })
    }
}

fn title(resolved: &Resolved) -> Option<String> {
    match resolved {
        Resolved::External(meta) => meta.title.clone(),
        _ => None,
    }
}

#[test(tokio::test)]
async fn test_late_description_of_superseded_request_is_dropped() {
    let (_dir, backend) = loaded_backend(&[("A.md", "")]).await;
    let (commands, rx) = unbounded_channel();
    tokio::spawn(backend.clone().serve(rx));
    let describer = Arc::new(GatedDescriber::default());
    let mirror = Mirror::with_describer(
        backend.subscribe(),
        commands,
        backend.config().clone(),
        Some(describer.clone() as Arc<dyn ExternalDescriber>),
    );
    mirror.sync_pending();

    let handle = mirror.link_handle("A.md", "https://example.com/page", LinkForm::Url);
    let mut values = handle.subscribe();
    while describer.calls.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // A second request overtakes the first, still blocked, one.
    assert!(matches!(handle.resolve(), Resolved::Untracked(_)));
    tokio::time::timeout(
        Duration::from_secs(5),
        values.wait_for(|value| title(value).is_some()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(title(&handle.get()).as_deref(), Some("call 2"));

    describer.release_first.notify_one();
    while describer.finished.load(Ordering::SeqCst) < 2 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!values.has_changed().unwrap());
    assert_eq!(title(&handle.get()).as_deref(), Some("call 2"));
}

/// Log sink for asserting on emitted events.
#[derive(Clone, Default)]
struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_inconsistent_change_is_logged_as_error() {
    let (_changes, rx) = unbounded_channel();
    let (commands, _requests) = unbounded_channel();
    let mirror = Mirror::new(rx, commands, test_config());

    let change = TreeChange {
        removed: vec!["Gone.md".to_string()],
        changed: vec![Node::new("Ghost.md", NodeKind::for_path("Ghost.md"))],
        ..Default::default()
    };
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    tracing::subscriber::with_default(subscriber, || mirror.apply(change));

    let logs = String::from_utf8(captured.0.lock().clone()).unwrap();
    assert!(logs.contains("ERROR"), "{logs}");
    assert!(logs.contains("removal of unknown path Gone.md"), "{logs}");
    assert!(logs.contains("change to unknown node Ghost.md"), "{logs}");
    assert!(!logs.contains("WARN"), "{logs}");
    assert_eq!(mirror.applied(), 1);
    assert!(mirror.paths().is_empty());
}
