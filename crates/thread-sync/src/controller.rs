//! Channel ownership for the selected thread.
//!
//! One [`ConnectionController`] belongs to one view. Each `bind` starts a new
//! epoch with two tasks:
//!
//! - the driver: connect, pump frames, keepalive, reconnect delays;
//! - the fetch worker: snapshot fetches, coalesced, plus the optional polling
//!   interval.
//!
//! Every time the channel opens the store is re-baselined from a full snapshot.
//! Rows changed while the channel was down are only visible that way.
//!
//! Rebinding or unbinding bumps the epoch before aborting both tasks, so a
//! result that is still in flight can only land as a stale apply.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::channel::{ChannelConnector, ChannelEvent, ChannelHandle, OutboundSender};
use crate::client::require_text;
use crate::error::{Result, SyncError};
use crate::fetcher::SnapshotFetcher;
use crate::frame::{InboundFrame, OutboundFrame, decode_frame};
use crate::keepalive::{KeepaliveAction, KeepaliveConfig, KeepaliveMonitor};
use crate::lifecycle::{ChannelHealth, ChannelLifecycle, DisconnectReason, ReconnectPolicy};
use crate::model::{Message, Thread, ThreadId};
use crate::reconciler::{ApplyDecision, DEFAULT_JOURNAL_CAPACITY, Epoch, Reconciler};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub keepalive: KeepaliveConfig,
    /// Full re-fetch interval; `None` disables polling.
    pub poll_interval: Option<Duration>,
    pub journal_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            keepalive: KeepaliveConfig::default(),
            poll_interval: None,
            journal_capacity: DEFAULT_JOURNAL_CAPACITY,
        }
    }
}

/// What the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadView {
    pub thread_id: Option<ThreadId>,
    pub epoch: Epoch,
    pub thread: Option<Thread>,
    pub messages: Vec<Message>,
    pub running: bool,
    pub awaiting_input: bool,
    pub connection: ChannelHealth,
    /// Last snapshot fetch failure, cleared by the next successful fetch.
    pub last_error: Option<String>,
}

/// Why a snapshot fetch was requested. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchReason {
    Opened,
    Reopened,
    /// The first connect failed before anything was fetched.
    Unreachable,
    Notice,
    Manual,
    Poll,
    JournalOverflow,
}

impl FetchReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Reopened => "reopened",
            Self::Unreachable => "unreachable",
            Self::Notice => "notice",
            Self::Manual => "manual",
            Self::Poll => "poll",
            Self::JournalOverflow => "journal_overflow",
        }
    }
}

struct Shared {
    reconciler: Reconciler,
    lifecycle: ChannelLifecycle,
    outbound: Option<OutboundSender>,
    last_error: Option<String>,
}

impl Shared {
    fn view(&self) -> ThreadView {
        ThreadView {
            thread_id: self.reconciler.thread_id().cloned(),
            epoch: self.reconciler.epoch(),
            thread: self.reconciler.thread().cloned(),
            messages: self.reconciler.messages().to_vec(),
            running: self.reconciler.running(),
            awaiting_input: self.reconciler.awaiting_input(),
            connection: self.lifecycle.health(),
            last_error: self.last_error.clone(),
        }
    }
}

struct Binding {
    requests: mpsc::UnboundedSender<FetchReason>,
    driver: JoinHandle<()>,
    fetch_worker: JoinHandle<()>,
}

impl Binding {
    fn abort(self) {
        self.driver.abort();
        self.fetch_worker.abort();
    }
}

struct BindingContext {
    epoch: Epoch,
    thread_id: ThreadId,
    config: ControllerConfig,
    connector: Arc<dyn ChannelConnector>,
    fetcher: Arc<dyn SnapshotFetcher>,
    shared: Arc<Mutex<Shared>>,
    view: Arc<watch::Sender<ThreadView>>,
    requests: mpsc::UnboundedSender<FetchReason>,
    gone: Notify,
}

impl BindingContext {
    fn is_current(&self, shared: &Shared) -> bool {
        shared.reconciler.is_current(self.epoch)
    }

    fn publish(&self, shared: &Shared) {
        self.view.send_replace(shared.view());
    }

    fn request(&self, reason: FetchReason) {
        let _ = self.requests.send(reason);
    }
}

pub struct ConnectionController {
    connector: Arc<dyn ChannelConnector>,
    fetcher: Arc<dyn SnapshotFetcher>,
    config: ControllerConfig,
    shared: Arc<Mutex<Shared>>,
    view: Arc<watch::Sender<ThreadView>>,
    binding: Option<Binding>,
}

impl ConnectionController {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        fetcher: Arc<dyn SnapshotFetcher>,
        config: ControllerConfig,
    ) -> Self {
        let shared = Shared {
            reconciler: Reconciler::new(config.journal_capacity),
            lifecycle: ChannelLifecycle::new(config.reconnect),
            outbound: None,
            last_error: None,
        };
        let (view, _) = watch::channel(shared.view());
        Self {
            connector,
            fetcher,
            config,
            shared: Arc::new(Mutex::new(shared)),
            view: Arc::new(view),
            binding: None,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ThreadView> {
        self.view.subscribe()
    }

    #[must_use]
    pub fn view(&self) -> ThreadView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn health(&self) -> ChannelHealth {
        self.view.borrow().connection.clone()
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Select `thread_id`: tear down the current channel without reconnecting,
    /// start a new epoch and open a channel for the new thread. The snapshot is
    /// fetched once the channel is open.
    pub async fn bind(&mut self, thread_id: ThreadId) -> Epoch {
        let previous = self.binding.take();
        let (requests, request_rx) = mpsc::unbounded_channel();

        let epoch = {
            let mut shared = self.shared.lock().await;
            let epoch = shared.reconciler.rebind(thread_id.clone());
            shared.lifecycle = ChannelLifecycle::new(self.config.reconnect);
            shared.outbound = None;
            shared.last_error = None;
            self.view.send_replace(shared.view());
            epoch
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(thread_id = %thread_id, epoch, "thread bound");

        let context = Arc::new(BindingContext {
            epoch,
            thread_id,
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            fetcher: Arc::clone(&self.fetcher),
            shared: Arc::clone(&self.shared),
            view: Arc::clone(&self.view),
            requests: requests.clone(),
            gone: Notify::new(),
        });
        let fetch_worker = tokio::spawn(run_fetch_worker(Arc::clone(&context), request_rx));
        let driver = tokio::spawn(run_driver(context));
        self.binding = Some(Binding {
            requests,
            driver,
            fetch_worker,
        });
        epoch
    }

    /// Close the channel without reconnecting and clear the view.
    pub async fn unbind(&mut self) {
        let previous = self.binding.take();
        {
            let mut shared = self.shared.lock().await;
            let epoch = shared.reconciler.release();
            shared.outbound = None;
            shared.lifecycle.mark_unbound();
            shared.last_error = None;
            self.view.send_replace(shared.view());
            debug!(epoch, "thread unbound");
        }
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Write a frame to the open channel.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let shared = self.shared.lock().await;
        if !shared.lifecycle.is_open() {
            return Err(SyncError::NotConnected);
        }
        let outbound = shared.outbound.as_ref().ok_or(SyncError::NotConnected)?;
        outbound.send(frame).map_err(|_| SyncError::NotConnected)
    }

    pub async fn send_user_input(&self, text: &str) -> Result<()> {
        let content = require_text("content", text)?;
        self.send(OutboundFrame::UserInput {
            content: content.to_string(),
        })
        .await
    }

    /// Re-fetch the snapshot for the bound thread.
    pub fn refresh(&self) -> Result<()> {
        let binding = self.binding.as_ref().ok_or(SyncError::NotConnected)?;
        binding
            .requests
            .send(FetchReason::Manual)
            .map_err(|_| SyncError::NotConnected)
    }
}

impl Drop for ConnectionController {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.try_lock() {
            shared.reconciler.release();
            shared.outbound = None;
        }
        if let Some(binding) = self.binding.take() {
            binding.abort();
        }
    }
}

enum PumpExit {
    Closed {
        reason: DisconnectReason,
        detail: Option<String>,
    },
    Stop,
}

async fn run_driver(context: Arc<BindingContext>) {
    let mut opened_before = false;
    let mut fetched_unreachable = false;
    loop {
        {
            let mut shared = context.shared.lock().await;
            if !context.is_current(&shared) || shared.lifecycle.is_gone() {
                return;
            }
            shared.lifecycle.mark_connecting();
            context.publish(&shared);
        }
        debug!(thread_id = %context.thread_id, "connecting channel");

        let opened = timeout(
            context.config.connect_timeout,
            context.connector.open(&context.thread_id),
        )
        .await;
        let (reason, detail) = match opened {
            Ok(Ok(handle)) => {
                let fetch = if opened_before {
                    FetchReason::Reopened
                } else {
                    FetchReason::Opened
                };
                opened_before = true;
                match pump(&context, handle, fetch).await {
                    PumpExit::Closed { reason, detail } => (reason, detail),
                    PumpExit::Stop => return,
                }
            }
            Ok(Err(error)) => {
                warn!(thread_id = %context.thread_id, "channel connect failed: {}", error);
                let reason = if error.is_terminal() {
                    DisconnectReason::ResourceGone
                } else {
                    DisconnectReason::Network
                };
                (reason, Some(error.to_string()))
            }
            Err(_) => (
                DisconnectReason::ConnectTimeout,
                Some(format!(
                    "connect timed out after {:?}",
                    context.config.connect_timeout
                )),
            ),
        };

        // Paint from a snapshot while the first connect keeps failing.
        if !opened_before && !fetched_unreachable && reason != DisconnectReason::ResourceGone {
            fetched_unreachable = true;
            context.request(FetchReason::Unreachable);
        }

        let plan = {
            let mut shared = context.shared.lock().await;
            if !context.is_current(&shared) {
                return;
            }
            shared.outbound = None;
            let plan = shared.lifecycle.mark_disconnect(reason, detail.clone());
            context.publish(&shared);
            plan
        };
        let Some(plan) = plan else {
            info!(
                thread_id = %context.thread_id,
                reason = reason.as_str(),
                "channel gone, not reconnecting"
            );
            return;
        };
        info!(
            thread_id = %context.thread_id,
            reason = reason.as_str(),
            detail = detail.as_deref().unwrap_or(""),
            delay_ms = plan.delay.as_millis() as u64,
            attempt = plan.attempt,
            "channel closed, reconnect scheduled"
        );

        tokio::select! {
            () = sleep(plan.delay) => {}
            () = context.gone.notified() => return,
        }
    }
}

async fn pump(
    context: &BindingContext,
    mut handle: ChannelHandle,
    fetch: FetchReason,
) -> PumpExit {
    {
        let mut shared = context.shared.lock().await;
        if !context.is_current(&shared) || shared.lifecycle.is_gone() {
            return PumpExit::Stop;
        }
        shared.lifecycle.mark_open();
        shared.outbound = Some(handle.sender());
        context.publish(&shared);
    }
    info!(thread_id = %context.thread_id, epoch = context.epoch, "channel open");
    context.request(fetch);

    let mut keepalive = KeepaliveMonitor::new(context.config.keepalive, Instant::now());
    loop {
        let deadline = keepalive.next_deadline();
        tokio::select! {
            event = handle.recv() => match event {
                Some(ChannelEvent::Frame(text)) => {
                    handle_frame(context, &handle, &mut keepalive, &text).await;
                }
                Some(ChannelEvent::Closed { reason, detail }) => {
                    return PumpExit::Closed { reason, detail };
                }
                None => {
                    return PumpExit::Closed {
                        reason: DisconnectReason::Network,
                        detail: Some("channel dropped".to_string()),
                    };
                }
            },
            () = sleep_until_deadline(deadline) => {
                let now = Instant::now();
                match keepalive.poll(now) {
                    KeepaliveAction::SendProbe => {
                        if handle.send(OutboundFrame::Probe).is_err() {
                            return PumpExit::Closed {
                                reason: DisconnectReason::Network,
                                detail: Some("writer closed".to_string()),
                            };
                        }
                        keepalive.record_probe_sent(now);
                        debug!(thread_id = %context.thread_id, "probe sent");
                    }
                    KeepaliveAction::LivenessFailure { waited } => {
                        warn!(
                            thread_id = %context.thread_id,
                            waited_ms = waited.as_millis() as u64,
                            "no probe reply, closing channel"
                        );
                        let mut shared = context.shared.lock().await;
                        if context.is_current(&shared) {
                            shared.outbound = None;
                            shared.lifecycle.mark_closing();
                            context.publish(&shared);
                        }
                        return PumpExit::Closed {
                            reason: DisconnectReason::LivenessTimeout,
                            detail: Some(format!("no probe reply within {waited:?}")),
                        };
                    }
                    KeepaliveAction::Idle => {}
                }
            }
            () = context.gone.notified() => {
                let mut shared = context.shared.lock().await;
                if context.is_current(&shared) {
                    shared.outbound = None;
                    context.publish(&shared);
                }
                return PumpExit::Stop;
            }
        }
    }
}

async fn handle_frame(
    context: &BindingContext,
    handle: &ChannelHandle,
    keepalive: &mut KeepaliveMonitor,
    text: &str,
) {
    match decode_frame(text) {
        Err(error) => {
            warn!(thread_id = %context.thread_id, "dropping malformed frame: {}", error);
        }
        Ok(None) => debug!(thread_id = %context.thread_id, "ignoring frame of unknown type"),
        Ok(Some(InboundFrame::ProbeReply)) => keepalive.record_reply(),
        Ok(Some(InboundFrame::Probe)) => {
            let _ = handle.send(OutboundFrame::ProbeReply);
        }
        Ok(Some(InboundFrame::RefreshRequested { thread_id })) => {
            if thread_id.as_ref().is_none_or(|id| id == &context.thread_id) {
                context.request(FetchReason::Notice);
            }
        }
        Ok(Some(InboundFrame::Event(event))) => {
            let mut shared = context.shared.lock().await;
            let decision = shared.reconciler.apply_event(context.epoch, event);
            debug!(thread_id = %context.thread_id, ?decision, "event applied");
            if decision.is_change() {
                context.publish(&shared);
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending::<()>().await,
    }
}

async fn run_fetch_worker(
    context: Arc<BindingContext>,
    mut requests: mpsc::UnboundedReceiver<FetchReason>,
) {
    let mut poll = context.config.poll_interval.map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let mut in_flight: JoinSet<()> = JoinSet::new();
    // Requests arriving while a fetch is in flight collapse into one follow-up.
    let mut queued: Option<FetchReason> = None;

    loop {
        let next = tokio::select! {
            request = requests.recv() => match request {
                Some(reason) => Some(reason),
                None => return,
            },
            () = next_poll(&mut poll) => Some(FetchReason::Poll),
            Some(_) = in_flight.join_next() => queued.take(),
        };
        let Some(reason) = next else {
            continue;
        };
        if in_flight.is_empty() {
            in_flight.spawn(fetch_once(Arc::clone(&context), reason));
        } else {
            queued.get_or_insert(reason);
        }
    }
}

async fn next_poll(poll: &mut Option<tokio::time::Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn fetch_once(context: Arc<BindingContext>, reason: FetchReason) {
    let ticket = {
        let mut shared = context.shared.lock().await;
        shared.reconciler.begin_snapshot(context.epoch)
    };
    let Some(ticket) = ticket else {
        return;
    };
    debug!(thread_id = %context.thread_id, reason = reason.as_str(), "fetching snapshot");

    let fetched = context.fetcher.fetch_snapshot(&context.thread_id).await;

    let mut shared = context.shared.lock().await;
    match fetched {
        Ok(snapshot) => {
            let decision = shared.reconciler.apply_snapshot(ticket, snapshot);
            debug!(thread_id = %context.thread_id, ?decision, "snapshot applied");
            if matches!(decision, ApplyDecision::StaleEpoch { .. }) {
                return;
            }
            shared.last_error = None;
            context.publish(&shared);
            if let ApplyDecision::Replaced { truncated: true, .. } = decision {
                context.request(FetchReason::JournalOverflow);
            }
        }
        Err(error) => {
            shared.reconciler.abandon_snapshot(ticket);
            if !context.is_current(&shared) {
                return;
            }
            if error.is_terminal() {
                info!(thread_id = %context.thread_id, "thread not found, closing channel");
                shared.outbound = None;
                shared.lifecycle.mark_gone(Some(error.to_string()));
                context.gone.notify_one();
            } else {
                warn!(thread_id = %context.thread_id, "snapshot fetch failed: {}", error);
            }
            shared.last_error = Some(error.to_string());
            context.publish(&shared);
        }
    }
}
