//! Per-thread live channel.
//!
//! A [`ChannelConnector`] opens one duplex channel for a thread and hands back a
//! [`ChannelHandle`]: an outbound frame sender plus an inbound event receiver.
//! Dropping every outbound sender closes the channel gracefully.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, SyncError};
use crate::frame::OutboundFrame;
use crate::lifecycle::{DisconnectReason, classify_close_code};
use crate::model::ThreadId;

/// Event delivered by an open channel, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Frame(String),
    /// Always the last event of a channel.
    Closed {
        reason: DisconnectReason,
        detail: Option<String>,
    },
}

pub type OutboundSender = mpsc::UnboundedSender<OutboundFrame>;

/// Engine side of an open channel.
#[derive(Debug)]
pub struct ChannelHandle {
    outbound: OutboundSender,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Transport side of an open channel, for connectors that are not WebSocket backed.
#[derive(Debug)]
pub struct ChannelPeer {
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelHandle {
    #[must_use]
    pub fn new(
        outbound: OutboundSender,
        inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Connected handle/peer pair backed by in-process queues.
    #[must_use]
    pub fn pair() -> (Self, ChannelPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self::new(outbound_tx, inbound_rx),
            ChannelPeer {
                outbound: outbound_rx,
                inbound: inbound_tx,
            },
        )
    }

    #[must_use]
    pub fn sender(&self) -> OutboundSender {
        self.outbound.clone()
    }

    pub fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| SyncError::NotConnected)
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.inbound.recv().await
    }
}

impl ChannelPeer {
    /// Deliver an inbound text frame. Returns false once the engine side is gone.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.inbound.send(ChannelEvent::Frame(text.into())).is_ok()
    }

    pub fn close(&self, reason: DisconnectReason, detail: Option<String>) -> bool {
        self.inbound
            .send(ChannelEvent::Closed { reason, detail })
            .is_ok()
    }

    /// Next frame written by the engine; `None` once the engine closed the channel.
    pub async fn next_outbound(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Whether the engine side has dropped the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn open(&self, thread_id: &ThreadId) -> Result<ChannelHandle>;
}

/// WebSocket connector for `{base}/threads/{id}/ws`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base: Url,
}

impl WsConnector {
    pub fn new(ws_base_url: &str) -> Result<Self> {
        let base = Url::parse(ws_base_url.trim())?;
        if base.scheme() != "ws" && base.scheme() != "wss" {
            return Err(SyncError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                base.scheme()
            )));
        }
        Ok(Self { base })
    }

    pub fn channel_url(&self, thread_id: &ThreadId) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| SyncError::InvalidUrl(self.base.to_string()))?;
            segments
                .pop_if_empty()
                .push("threads")
                .push(thread_id.as_str())
                .push("ws");
        }
        Ok(url)
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn open(&self, thread_id: &ThreadId) -> Result<ChannelHandle> {
        let url = self.channel_url(thread_id)?;
        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| map_connect_error(thread_id, error))?;
        debug!(url = %url, "channel connected");

        let (mut writer, mut reader) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let channel_url = url.to_string();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(error) => {
                        warn!("dropping unencodable frame for {}: {}", channel_url, error);
                        continue;
                    }
                };
                if let Err(error) = writer.send(Message::Text(text.into())).await {
                    debug!("websocket write error on {}: {}", channel_url, error);
                    return;
                }
            }
            // Every sender dropped: the engine let go of this channel.
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
            debug!("channel closed locally: {}", channel_url);
        });

        let channel_url = url.to_string();
        tokio::spawn(async move {
            let closed = loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(ChannelEvent::Frame(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => break close_event(frame),
                    Some(Ok(Message::Ping(payload))) => {
                        debug!("received ping from {} ({} bytes)", channel_url, payload.len());
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Err(error)) => {
                        warn!("websocket read error on {}: {}", channel_url, error);
                        break ChannelEvent::Closed {
                            reason: DisconnectReason::Network,
                            detail: Some(error.to_string()),
                        };
                    }
                    None => {
                        break ChannelEvent::Closed {
                            reason: DisconnectReason::Network,
                            detail: Some("stream ended".to_string()),
                        };
                    }
                }
            };
            let _ = inbound_tx.send(closed);
        });

        Ok(ChannelHandle::new(outbound_tx, inbound_rx))
    }
}

fn close_event(frame: Option<CloseFrame<'_>>) -> ChannelEvent {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            ChannelEvent::Closed {
                reason: classify_close_code(code),
                detail: Some(format!("close {}: {}", code, frame.reason)),
            }
        }
        None => ChannelEvent::Closed {
            reason: DisconnectReason::RemoteClosed,
            detail: None,
        },
    }
}

fn map_connect_error(thread_id: &ThreadId, error: WsError) -> SyncError {
    match error {
        WsError::Http(response) if response.status().as_u16() == 404 => {
            SyncError::NotFound(format!("thread {thread_id}"))
        }
        other => SyncError::Transport(other.to_string()),
    }
}
