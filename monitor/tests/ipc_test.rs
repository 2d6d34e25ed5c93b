//! Socket-level tests for the listener, the peer slot and the connecting side.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use esmon_monitor::ipc::{
    IpcChannel, IpcListener, PeerConnection, PeerHandler, PeerId, PeerPolicy, SendError,
};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const RECORD: &str = r#"{"eventtype":"file::unlink","processpath":"/bin/rm","pid":3,"ppid":1,"isplatform":true,"timestamp":1,"username":"root","signingid":"com.apple.rm","props":{"dir":"/tmp","path":"/tmp/x"}}"#;

#[derive(Default)]
struct RecordingHandler {
    attached: Mutex<Vec<PeerId>>,
    detached: Mutex<Vec<PeerId>>,
}

impl RecordingHandler {
    fn attached(&self) -> Vec<PeerId> {
        self.attached.lock().unwrap().clone()
    }

    fn detached(&self) -> Vec<PeerId> {
        self.detached.lock().unwrap().clone()
    }
}

impl PeerHandler for RecordingHandler {
    fn on_peer_attach(&self, peer: PeerId) -> bool {
        self.attached.lock().unwrap().push(peer);
        true
    }

    fn on_peer_detach(&self, peer: PeerId) {
        self.detached.lock().unwrap().push(peer);
    }
}

struct Harness {
    dir: TempDir,
    path: PathBuf,
    channel: IpcChannel,
    handler: Arc<RecordingHandler>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(policy: PeerPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esmon.sock");
        let channel = IpcChannel::new(16);
        let listener = IpcListener::bind(&path, channel.clone(), policy).unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(listener.run(Arc::clone(&handler), async move {
            let _ = rx.await;
        }));

        Self {
            dir,
            path,
            channel,
            handler,
            shutdown: Some(tx),
            task,
        }
    }

    /// Shuts the listener down; the socket directory outlives it.
    async fn stop(mut self) -> TempDir {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.task.await.unwrap();
        self.dir
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

fn current_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

#[tokio::test]
async fn register_attaches_and_close_detaches() {
    let harness = Harness::start(PeerPolicy::allow_any());

    let mut conn = PeerConnection::connect(&harness.path).await.unwrap();
    assert!(conn.register().await.unwrap());

    let attached = harness.handler.attached();
    assert_eq!(attached.len(), 1);
    assert_eq!(harness.channel.current_peer(), Some(attached[0]));

    drop(conn);
    wait_until(|| harness.handler.detached().len() == 1).await;
    assert_eq!(harness.handler.detached(), attached);
    assert_eq!(harness.channel.current_peer(), None);

    harness.stop().await;
}

#[tokio::test]
async fn events_reach_registered_peer_in_order() {
    let harness = Harness::start(PeerPolicy::allow_any());

    let mut conn = PeerConnection::connect(&harness.path).await.unwrap();
    assert!(conn.register().await.unwrap());

    for _ in 0..3 {
        harness.channel.send_current(RECORD.as_bytes().to_vec()).unwrap();
    }
    for _ in 0..3 {
        let event = conn.next_event().await.unwrap().unwrap();
        assert_eq!(event.prop("path"), Some("/tmp/x"));
    }

    harness.stop().await;
}

#[tokio::test]
async fn concurrent_registrations_leave_one_active_peer() {
    let harness = Harness::start(PeerPolicy::allow_any());

    let mut first = PeerConnection::connect(&harness.path).await.unwrap();
    let mut second = PeerConnection::connect(&harness.path).await.unwrap();
    let _ = tokio::join!(first.register(), second.register());

    wait_until(|| harness.handler.attached().len() == 2).await;
    let attached = harness.handler.attached();
    let active = harness.channel.current_peer().unwrap();
    assert!(attached.contains(&active));
    let stale = *attached.iter().find(|id| **id != active).unwrap();

    assert_eq!(
        harness.channel.send(stale, RECORD.as_bytes().to_vec()),
        Err(SendError::PeerUnreachable)
    );
    harness
        .channel
        .send(active, RECORD.as_bytes().to_vec())
        .unwrap();

    let mut delivered = 0;
    for conn in [&mut first, &mut second] {
        if let Ok(Ok(Some(event))) =
            tokio::time::timeout(Duration::from_secs(2), conn.next_event()).await
        {
            assert_eq!(event.pid(), 3);
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1);
    assert_eq!(harness.channel.current_peer(), Some(active));
    assert!(harness.handler.detached().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn replaced_peer_is_closed() {
    let harness = Harness::start(PeerPolicy::allow_any());

    let mut old = PeerConnection::connect(&harness.path).await.unwrap();
    assert!(old.register().await.unwrap());
    let mut new = PeerConnection::connect(&harness.path).await.unwrap();
    assert!(new.register().await.unwrap());

    let closed = tokio::time::timeout(Duration::from_secs(2), old.next_event())
        .await
        .unwrap();
    assert!(!matches!(closed, Ok(Some(_))));

    harness.channel.send_current(RECORD.as_bytes().to_vec()).unwrap();
    assert!(new.next_event().await.unwrap().is_some());
    assert!(harness.handler.detached().is_empty());

    harness.stop().await;
}

#[tokio::test]
async fn unauthorized_user_is_rejected() {
    let harness = Harness::start(PeerPolicy::allow_uids([current_uid().wrapping_add(1)]));

    let mut conn = PeerConnection::connect(&harness.path).await.unwrap();
    assert!(conn.register().await.is_err());
    assert!(harness.handler.attached().is_empty());
    assert_eq!(harness.channel.current_peer(), None);

    harness.stop().await;
}

#[tokio::test]
async fn authorized_user_is_admitted() {
    let harness = Harness::start(PeerPolicy::allow_uids([current_uid()]));

    let mut conn = PeerConnection::connect(&harness.path).await.unwrap();
    assert!(conn.register().await.unwrap());

    harness.stop().await;
}

#[tokio::test]
async fn shutdown_detaches_peer_and_removes_socket() {
    let harness = Harness::start(PeerPolicy::allow_any());
    let path = harness.path.clone();
    let handler = Arc::clone(&harness.handler);

    let mut conn = PeerConnection::connect(&path).await.unwrap();
    assert!(conn.register().await.unwrap());
    let attached = handler.attached();

    let _dir = harness.stop().await;

    assert_eq!(handler.detached(), attached);
    assert!(!path.exists());
    assert!(!matches!(conn.next_event().await, Ok(Some(_))));
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("esmon.sock");
    std::fs::write(&path, b"stale").unwrap();

    let listener = IpcListener::bind(&path, IpcChannel::default(), PeerPolicy::allow_any()).unwrap();
    assert_eq!(listener.path(), path.as_path());
    assert!(PeerConnection::connect(&path).await.is_ok());
}
