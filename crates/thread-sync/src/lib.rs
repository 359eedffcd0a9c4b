//! Thread synchronization engine.
//!
//! Keeps a local, ordered, deduplicated view of one conversation thread in step
//! with a remote source of truth: a snapshot over HTTP plus incremental events
//! over a per-thread live channel.

pub mod channel;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetcher;
pub mod frame;
pub mod keepalive;
pub mod lifecycle;
pub mod model;
pub mod reconciler;
pub mod store;

pub use channel::{ChannelConnector, ChannelEvent, ChannelHandle, ChannelPeer, WsConnector};
pub use client::{ThreadsClient, ThreadsClientConfig};
pub use config::{ConfigError, SyncConfig};
pub use controller::{ConnectionController, ControllerConfig, ThreadView};
pub use error::{Result, SyncError};
pub use fetcher::SnapshotFetcher;
pub use frame::{InboundFrame, OutboundFrame, ThreadEvent, decode_frame};
pub use keepalive::{KeepaliveConfig, KeepaliveMonitor};
pub use lifecycle::{
    ChannelHealth, ChannelLifecycle, ChannelState, DisconnectReason, ReconnectPolicy,
};
pub use model::{
    AgentState, ContentKind, MediaRef, Message, MessageContent, MessageId, MessagePatch,
    MessageRole, Thread, ThreadId, ThreadSnapshot,
};
pub use reconciler::{ApplyDecision, Epoch, Reconciler, SnapshotTicket};
pub use store::MessageStore;
