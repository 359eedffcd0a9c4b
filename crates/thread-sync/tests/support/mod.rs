#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::json;
use thread_sync::{
    ChannelConnector, ChannelHandle, ChannelPeer, ControllerConfig, KeepaliveConfig, Message,
    MessagePatch, ReconnectPolicy, SnapshotFetcher, SyncError, Thread, ThreadId, ThreadSnapshot,
    ThreadView,
};
use tokio::sync::{mpsc, watch};

pub const WAIT: Duration = Duration::from_secs(5);

/// Controller settings scaled down for tests: fast reconnects, no probing.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        connect_timeout: Duration::from_secs(1),
        reconnect: ReconnectPolicy::Fixed {
            delay: Duration::from_millis(50),
        },
        keepalive: KeepaliveConfig {
            interval: Duration::from_secs(60),
            reply_timeout: Some(Duration::from_secs(10)),
        },
        poll_interval: None,
        journal_capacity: 64,
    }
}

/// Connector that hands every opened channel's peer side to the test.
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<(ThreadId, ChannelPeer)>,
    failures: Mutex<VecDeque<SyncError>>,
    opens: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ThreadId, ChannelPeer)>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                failures: Mutex::new(VecDeque::new()),
                opens: AtomicUsize::new(0),
            },
            peer_rx,
        )
    }

    /// Make the next `open` fail with `error`.
    pub fn fail_next(&self, error: SyncError) {
        self.failures
            .lock()
            .expect("failures lock")
            .push_back(error);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn open(&self, thread_id: &ThreadId) -> thread_sync::Result<ChannelHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().expect("failures lock").pop_front() {
            return Err(error);
        }
        let (handle, peer) = ChannelHandle::pair();
        let _ = self.peers.send((thread_id.clone(), peer));
        Ok(handle)
    }
}

/// In-memory stand-in for the threads API. Unknown threads answer `NotFound`.
#[derive(Default)]
pub struct MemoryFetcher {
    threads: Mutex<HashMap<ThreadId, ThreadSnapshot>>,
    delays: Mutex<HashMap<ThreadId, Duration>>,
    snapshot_calls: AtomicUsize,
}

impl MemoryFetcher {
    pub fn with_thread(self, thread_id: &str, messages: Vec<Message>) -> Self {
        self.put(thread_id, messages);
        self
    }

    pub fn put(&self, thread_id: &str, messages: Vec<Message>) {
        let id = ThreadId::from(thread_id);
        let snapshot = ThreadSnapshot {
            thread: Some(Thread {
                id: id.clone(),
                title: format!("thread {thread_id}"),
                created_at: None,
                updated_at: None,
                running: false,
            }),
            messages,
        };
        self.threads.lock().expect("threads lock").insert(id, snapshot);
    }

    /// Append or merge a message the way the server would before announcing it.
    pub fn record(&self, thread_id: &str, message: &Message) {
        let mut threads = self.threads.lock().expect("threads lock");
        let Some(snapshot) = threads.get_mut(&ThreadId::from(thread_id)) else {
            return;
        };
        match snapshot
            .messages
            .iter_mut()
            .find(|existing| existing.id == message.id)
        {
            Some(existing) => {
                existing.merge(&MessagePatch::from(message.clone()));
            }
            None => snapshot.messages.push(message.clone()),
        }
    }

    pub fn remove(&self, thread_id: &str) {
        self.threads
            .lock()
            .expect("threads lock")
            .remove(&ThreadId::from(thread_id));
    }

    pub fn delay(&self, thread_id: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delays lock")
            .insert(ThreadId::from(thread_id), delay);
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    async fn wait_configured_delay(&self, thread_id: &ThreadId) {
        let delay = self
            .delays
            .lock()
            .expect("delays lock")
            .get(thread_id)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn snapshot(&self, thread_id: &ThreadId) -> thread_sync::Result<ThreadSnapshot> {
        self.threads
            .lock()
            .expect("threads lock")
            .get(thread_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("/threads/{thread_id}")))
    }
}

#[async_trait]
impl SnapshotFetcher for MemoryFetcher {
    async fn fetch_snapshot(&self, thread_id: &ThreadId) -> thread_sync::Result<ThreadSnapshot> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_configured_delay(thread_id).await;
        self.snapshot(thread_id)
    }
}

pub async fn next_peer(
    peers: &mut mpsc::UnboundedReceiver<(ThreadId, ChannelPeer)>,
) -> anyhow::Result<(ThreadId, ChannelPeer)> {
    tokio::time::timeout(WAIT, peers.recv())
        .await
        .map_err(|_| anyhow!("timed out waiting for a channel to open"))?
        .context("connector dropped")
}

/// Wait until the published view satisfies `predicate`.
pub async fn wait_for<F>(
    views: &mut watch::Receiver<ThreadView>,
    what: &str,
    predicate: F,
) -> anyhow::Result<ThreadView>
where
    F: Fn(&ThreadView) -> bool,
{
    let view = tokio::time::timeout(WAIT, views.wait_for(|view| predicate(view)))
        .await
        .map_err(|_| anyhow!("timed out waiting for {what}"))??
        .clone();
    Ok(view)
}

pub fn message_ids(view: &ThreadView) -> Vec<&str> {
    view.messages.iter().map(|message| message.id.as_str()).collect()
}

pub fn insert_frame(message: &Message) -> String {
    json!({ "type": "message_insert", "message": message }).to_string()
}

pub fn update_frame(patch: &serde_json::Value) -> String {
    json!({ "type": "message_update", "message": patch }).to_string()
}
