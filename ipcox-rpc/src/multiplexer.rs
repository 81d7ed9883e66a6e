//! Many named virtual channels over one physical [`MessagePort`].
//!
//! Each side of a port can open a [`Channel`] by id.  The opener sends an `open` frame and the
//! channel becomes usable once the remote answers `ready`; opening an id that is already open
//! returns the existing channel.  Channel traffic travels as `data` frames carrying the id, and
//! `close` frames tear a single channel down.  When the underlying port closes, every channel is
//! force-closed with the port's close reason.
//!
//! Frames are JSON objects tagged by `kind`:
//!
//! ```json
//! {"kind":"open","id":"rpc.host"}
//! {"kind":"data","id":"rpc.host","content":"..."}
//! ```
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use ipcox_core::sync::MutexExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::connection::{CloseEvent, CloseListener, MessageListener, MessagePort, MessageSender, PortId};
use crate::event::{Emitter, Subscription};
use crate::{Result, RpcError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum Frame {
    Open { id: String },
    Ready { id: String },
    Data { id: String, content: String },
    Close { id: String, reason: String },
}

#[derive(Clone)]
pub struct ChannelMultiplexer {
    inner: Arc<MultiplexerInner>,
}

struct MultiplexerInner {
    port: Arc<dyn MessagePort>,
    channels: Mutex<HashMap<String, Channel>>,
    pending_opens: Mutex<HashMap<String, Vec<oneshot::Sender<Result<Channel>>>>>,
    /// Set once the underlying port closed
    closed: Mutex<Option<String>>,
    on_did_open_channel: Emitter<Channel>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ChannelMultiplexer {
    pub fn new(port: impl MessagePort + 'static) -> Self {
        Self::from_port(Arc::new(port))
    }

    pub fn from_port(port: Arc<dyn MessagePort>) -> Self {
        let inner = Arc::new(MultiplexerInner {
            port: port.clone(),
            channels: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            closed: Mutex::new(None),
            on_did_open_channel: Emitter::new(),
            subscriptions: Mutex::new(Vec::new()),
        });

        let on_message = {
            let inner = Arc::downgrade(&inner);
            port.on_message(Box::new(move |message: &str| {
                if let Some(inner) = inner.upgrade() {
                    inner.handle_frame(message);
                }
            }))
        };
        let on_close = {
            let inner = Arc::downgrade(&inner);
            port.on_close(Box::new(move |event: &CloseEvent| {
                if let Some(inner) = inner.upgrade() {
                    inner.close_all(&event.reason);
                }
            }))
        };
        inner
            .subscriptions
            .lock_unpoisoned()
            .extend([on_message, on_close]);

        Self { inner }
    }

    /// Open the channel `id`, or return it if it is already open.
    ///
    /// Completes once the remote side acknowledged the channel.  Fails with
    /// [`RpcError::ConnectionClosed`] if the underlying port closes first.
    pub async fn open(&self, id: impl Into<String>) -> Result<Channel> {
        let id = id.into();
        let existing = self.inner.channels.lock_unpoisoned().get(&id).cloned();
        if let Some(channel) = existing {
            return Ok(channel);
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.add_pending_open(&id, tx)? {
            tracing::debug!(channel = %id, "Opening channel");
            if let Err(e) = self.inner.send_frame(&Frame::Open { id: id.clone() }) {
                self.inner.pending_opens.lock_unpoisoned().remove(&id);
                return Err(e);
            }
        }

        rx.await.map_err(|_| RpcError::ConnectionClosed {
            reason: "Multiplexer was dropped".to_string(),
        })?
    }

    /// Channel `id` if it is open.
    pub fn get(&self, id: &str) -> Option<Channel> {
        self.inner.channels.lock_unpoisoned().get(id).cloned()
    }

    /// Ids of all open channels.
    pub fn channel_ids(&self) -> Vec<String> {
        self.inner.channels.lock_unpoisoned().keys().cloned().collect()
    }

    /// Listen for channels the remote side opened.
    ///
    /// Listeners run before the remote is told the channel is ready, so a listener that attaches
    /// to the channel sees every message sent on it.
    pub fn on_did_open_channel(&self, listener: impl Fn(&Channel) + Send + Sync + 'static) -> Subscription {
        self.inner.on_did_open_channel.listen(listener)
    }

    pub fn port(&self) -> &Arc<dyn MessagePort> {
        &self.inner.port
    }
}

impl MultiplexerInner {
    /// Queue a waiter for channel `id`.  Returns whether it is the first one, which has to send
    /// the `open` frame.
    ///
    /// `closed` is checked under the `pending_opens` lock, so a waiter is either refused here or
    /// drained by [`Self::close_all`].
    fn add_pending_open(&self, id: &str, waiter: oneshot::Sender<Result<Channel>>) -> Result<bool> {
        let mut pending = self.pending_opens.lock_unpoisoned();
        if let Some(reason) = self.closed.lock_unpoisoned().clone() {
            return Err(RpcError::ConnectionClosed { reason });
        }

        let waiters = pending.entry(id.to_string()).or_default();
        waiters.push(waiter);
        Ok(waiters.len() == 1)
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let message = serde_json::to_string(frame).map_err(|source| RpcError::Serialize {
            source,
            type_name: std::any::type_name::<Frame>(),
        })?;
        self.port.send_message(message)
    }

    fn handle_frame(self: &Arc<Self>, message: &str) {
        let frame: Frame = match serde_json::from_str(message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding message that is not a multiplexer frame");
                return;
            }
        };

        match frame {
            Frame::Open { id } => {
                let (channel, created) = self.get_or_create(&id);
                if created {
                    tracing::debug!(channel = %id, "Remote opened channel");
                    self.on_did_open_channel.fire(&channel);
                }
                if let Err(e) = self.send_frame(&Frame::Ready { id: id.clone() }) {
                    tracing::warn!(channel = %id, error = %e, "Failed to acknowledge channel");
                }
                self.resolve_pending(&id, &channel);
            }
            Frame::Ready { id } => {
                let (channel, _) = self.get_or_create(&id);
                self.resolve_pending(&id, &channel);
            }
            Frame::Data { id, content } => {
                let channel = self.channels.lock_unpoisoned().get(&id).cloned();
                match channel {
                    Some(channel) => channel.deliver(content),
                    None => tracing::debug!(channel = %id, "Dropping data for unknown channel"),
                }
            }
            Frame::Close { id, reason } => {
                let channel = self.channels.lock_unpoisoned().remove(&id);
                if let Some(channel) = channel {
                    tracing::debug!(channel = %id, %reason, "Remote closed channel");
                    channel.finish_close(reason);
                }
            }
        }
    }

    fn get_or_create(self: &Arc<Self>, id: &str) -> (Channel, bool) {
        let mut channels = self.channels.lock_unpoisoned();
        if let Some(channel) = channels.get(id) {
            return (channel.clone(), false);
        }
        let channel = Channel::new(id.to_string(), Arc::downgrade(self));
        channels.insert(id.to_string(), channel.clone());
        (channel, true)
    }

    fn resolve_pending(&self, id: &str, channel: &Channel) {
        let waiters = self.pending_opens.lock_unpoisoned().remove(id);
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Ok(channel.clone()));
        }
    }

    fn close_all(&self, reason: &str) {
        tracing::debug!(%reason, "Underlying port closed; closing all channels");
        *self.closed.lock_unpoisoned() = Some(reason.to_string());

        let channels: Vec<Channel> = self
            .channels
            .lock_unpoisoned()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            channel.finish_close(reason.to_string());
        }

        let pending: Vec<_> = self.pending_opens.lock_unpoisoned().drain().collect();
        for (_, waiters) in pending {
            for waiter in waiters {
                let _ = waiter.send(Err(RpcError::ConnectionClosed {
                    reason: reason.to_string(),
                }));
            }
        }
    }
}

impl Drop for MultiplexerInner {
    fn drop(&mut self) {
        let subscriptions = self
            .subscriptions
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for subscription in subscriptions.iter_mut() {
            subscription.dispose();
        }
    }
}

/// One virtual channel of a [`ChannelMultiplexer`].
///
/// Inbound messages are buffered until the first message listener attaches, then delivered in
/// arrival order.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: String,
    port_id: PortId,
    multiplexer: Weak<MultiplexerInner>,
    state: Mutex<ChannelState>,
    on_message: Emitter<String>,
    on_close: Emitter<CloseEvent>,
}

#[derive(Default)]
struct ChannelState {
    inbox: VecDeque<String>,
    /// A task is currently delivering the inbox to listeners
    draining: bool,
    closed: Option<String>,
}

impl Channel {
    fn new(id: String, multiplexer: Weak<MultiplexerInner>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id,
                port_id: PortId::next(),
                multiplexer,
                state: Mutex::new(ChannelState::default()),
                on_message: Emitter::new(),
                on_close: Emitter::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn close_reason(&self) -> Option<String> {
        self.inner.state.lock_unpoisoned().closed.clone()
    }

    fn deliver(&self, message: String) {
        self.inner.state.lock_unpoisoned().inbox.push_back(message);
        self.drain();
    }

    /// Hand buffered messages to the listeners, one at a time and outside the lock so listeners
    /// can use the channel.  Only one caller drains at a time, which keeps the order.
    fn drain(&self) {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.draining || self.inner.on_message.listener_count() == 0 {
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.inner.state.lock_unpoisoned();
                match state.inbox.pop_front() {
                    Some(message) => message,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            self.inner.on_message.fire(&next);
        }
    }

    /// Mark the channel closed and notify listeners.  Returns false if it was closed already.
    fn finish_close(&self, reason: String) -> bool {
        {
            let mut state = self.inner.state.lock_unpoisoned();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(reason.clone());
            state.inbox.clear();
        }
        self.inner.on_close.fire(&CloseEvent { reason });
        true
    }
}

impl MessageSender for Channel {
    fn send_message(&self, message: String) -> Result<()> {
        let closed = self.inner.state.lock_unpoisoned().closed.clone();
        if let Some(reason) = closed {
            return Err(RpcError::ChannelClosed {
                id: self.inner.id.clone(),
                reason,
            });
        }

        let Some(multiplexer) = self.inner.multiplexer.upgrade() else {
            return Err(RpcError::ChannelClosed {
                id: self.inner.id.clone(),
                reason: "Multiplexer was dropped".to_string(),
            });
        };
        multiplexer.send_frame(&Frame::Data {
            id: self.inner.id.clone(),
            content: message,
        })
    }
}

impl MessagePort for Channel {
    fn port_id(&self) -> PortId {
        self.inner.port_id
    }

    fn on_message(&self, listener: MessageListener) -> Subscription {
        let subscription = self
            .inner
            .on_message
            .listen(move |message: &String| listener(message));
        self.drain();
        subscription
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.inner.on_close.listen(move |event: &CloseEvent| listener(event))
    }

    fn close(&self, reason: &str) {
        if !self.finish_close(reason.to_string()) {
            return;
        }

        tracing::debug!(channel = %self.inner.id, %reason, "Closing channel");
        if let Some(multiplexer) = self.inner.multiplexer.upgrade() {
            multiplexer.channels.lock_unpoisoned().remove(&self.inner.id);
            let frame = Frame::Close {
                id: self.inner.id.clone(),
                reason: reason.to_string(),
            };
            if let Err(e) = multiplexer.send_frame(&frame) {
                tracing::debug!(channel = %self.inner.id, error = %e, "Could not tell remote about channel close");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.state.lock_unpoisoned().closed.is_some()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("port_id", &self.inner.port_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
