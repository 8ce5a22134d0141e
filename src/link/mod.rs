//! # MAVLink Transport Module
//!
//! This module owns the byte channel to the vehicle and turns it into a stream of typed
//! [`MavMessage`] values. It provides the primitives every higher-level sequence is built
//! from.
//!
//! ## Features
//!
//! - **Reader task**: incremental framing over arbitrary chunk boundaries, checksum
//!   verification and resynchronisation ([`framer`]), payload decoding ([`codec`])
//! - **Subscriptions**: [`Link::read`] registers a handler that sees every decoded
//!   message in arrival order; dropping the returned [`Subscription`] removes it
//! - **Waiting**: [`Link::receive`] resolves with the first matching message after the
//!   call; [`Link::completion`] is the broadcast flavour observable by many waiters
//! - **Retry**: [`Link::retry`] resends a message with a geometrically growing window
//!   until the expected reply arrives or the caller cancels
//!
//! ## Ordering
//!
//! Frames are dispatched strictly in arrival order. Every subscriber registered when a
//! message is dispatched sees it before the next message is processed. A subscription is
//! registered synchronously when [`Link::receive`] is called, so a reply that arrived
//! before the call can never satisfy it.
//!
//! ## Cancellation
//!
//! Every suspending operation takes a [`CancellationToken`]. Cancellation is not an error:
//! it resolves as [`Outcome::Cancelled`] and releases the underlying subscription.
//!
//! ```rust,no_run
//! use groundlink::link::{Link, LinkIdentity, Outcome, RetryTuning};
//! use mavlink::common::MavMessage;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(stream: tokio::net::TcpStream, ping: MavMessage) -> anyhow::Result<()> {
//! let link = Link::open(stream, LinkIdentity::default(), RetryTuning::default());
//! let cancel = CancellationToken::new();
//! let pong = link.receive(
//!     |m| matches!(m, MavMessage::COMMAND_ACK(_)).then_some(()),
//!     &cancel,
//! );
//! if let Outcome::Completed(()) = link.retry(&ping, pong, &cancel).await? {
//!     println!("acknowledged");
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod framer;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use mavlink::common::MavMessage;
use mavlink::{MavHeader, Message};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::logutil::hex_snippet;
use crate::metrics;

/// Errors surfaced by the transport.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The channel refused the bytes.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The codec could not serialize the message.
    #[error("encode error: {0}")]
    Encode(String),

    /// The link was destroyed (or the channel hit EOF) while the operation was pending.
    #[error("link closed")]
    Closed,
}

/// Result of a wait that may be abandoned through its cancellation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}

/// Any duplex byte stream the link can run over.
pub trait Channel: AsyncRead + AsyncWrite + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + 'static> Channel for T {}

/// Our own address on the MAVLink network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkIdentity {
    pub system_id: u8,
    pub component_id: u8,
}

impl Default for LinkIdentity {
    fn default() -> Self {
        // 190 = MAV_COMP_ID_MISSIONPLANNER
        Self {
            system_id: 255,
            component_id: 190,
        }
    }
}

/// Resend window schedule: `min(max, base * factor^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryTuning {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 1.25,
            max: Duration::from_millis(10_000),
        }
    }
}

impl RetryTuning {
    /// Wait window after the `attempt`-th write (0-based).
    pub fn window(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

type Handler = Box<dyn FnMut(&MavMessage) + Send>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: BTreeMap<u64, Handler>,
    closed: bool,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    registry: Mutex<Registry>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    sequence: AtomicU8,
    identity: LinkIdentity,
    tuning: RetryTuning,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Cancelled by `destroy`; writes stuck on a stalled channel give up on it.
    closing: CancellationToken,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, message: &MavMessage) {
        let mut registry = self.registry();
        for handler in registry.handlers.values_mut() {
            handler(message);
        }
    }

    /// Drop every handler and refuse new ones. Pending waits observe `LinkError::Closed`.
    fn close_subscribers(&self) {
        let handlers = {
            let mut registry = self.registry();
            registry.closed = true;
            std::mem::take(&mut registry.handlers)
        };
        if !handlers.is_empty() {
            debug!("Link: released {} subscriber(s)", handlers.len());
        }
    }

    fn stop_reader(&self) {
        let task = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Ok(slot) = self.reader.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Handle on a registered [`Link::read`] handler. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its handler immediately"]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            let removed = shared.registry().handlers.remove(&self.id);
            drop(removed);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

type WaitFuture<T> = Pin<Box<dyn Future<Output = Result<Outcome<T>, LinkError>> + Send>>;

/// Single-shot wait created by [`Link::receive`]. The subscription lives as long as this
/// future and is released when it resolves or is dropped.
#[must_use = "futures do nothing unless awaited"]
pub struct Receive<T> {
    inner: WaitFuture<T>,
}

impl<T> Future for Receive<T> {
    type Output = Result<Outcome<T>, LinkError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().inner.as_mut().poll(cx)
    }
}

/// Broadcast wait created by [`Link::completion`]: the first matching message is kept
/// and every clone observes it without consuming it.
pub struct Completion<T> {
    rx: watch::Receiver<Option<T>>,
    _subscription: Arc<Subscription>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            _subscription: Arc::clone(&self._subscription),
        }
    }
}

impl<T: Clone + Send + Sync> Completion<T> {
    /// The settled value, if any, without waiting.
    pub fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub async fn wait(mut self, cancel: &CancellationToken) -> Result<Outcome<T>, LinkError> {
        tokio::select! {
            biased;
            settled = Self::settled(&mut self.rx) => settled.map(Outcome::Completed),
            _ = cancel.cancelled() => Ok(Outcome::Cancelled),
        }
    }

    async fn settled(rx: &mut watch::Receiver<Option<T>>) -> Result<T, LinkError> {
        let value = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| LinkError::Closed)?;
        (*value).clone().ok_or(LinkError::Closed)
    }
}

/// Cloneable handle on one MAVLink connection.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
}

impl Link {
    /// Take ownership of `channel` and start the reader task. Must be called within a
    /// Tokio runtime.
    pub fn open<C: Channel>(channel: C, identity: LinkIdentity, tuning: RetryTuning) -> Self {
        let (reader, writer) = tokio::io::split(channel);
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            sequence: AtomicU8::new(0),
            identity,
            tuning,
            reader: Mutex::new(None),
            closing: CancellationToken::new(),
        });
        let task = tokio::spawn(read_loop(reader, Arc::downgrade(&shared)));
        *shared.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        info!(
            "Link open as system {} component {}",
            identity.system_id, identity.component_id
        );
        Self { shared }
    }

    pub fn identity(&self) -> LinkIdentity {
        self.shared.identity
    }

    pub fn tuning(&self) -> RetryTuning {
        self.shared.tuning
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry().closed
    }

    /// Register `handler` for every decoded inbound message, in arrival order.
    pub fn read<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(&MavMessage) + Send + 'static,
    {
        let mut registry = self.shared.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        if !registry.closed {
            registry.handlers.insert(id, Box::new(handler));
        }
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Encode and send `message` once. Completion means the channel accepted the bytes.
    pub async fn write(&self, message: &MavMessage) -> Result<(), LinkError> {
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let header = MavHeader {
            system_id: self.shared.identity.system_id,
            component_id: self.shared.identity.component_id,
            sequence,
        };
        let bytes = codec::encode(header, message)?;

        tokio::select! {
            biased;
            _ = self.shared.closing.cancelled() => return Err(LinkError::Closed),
            sent = self.send_bytes(&bytes) => sent?,
        }

        metrics::inc_messages_sent();
        trace!(
            "Sent {} seq={} ({} bytes): {}",
            message.message_name(),
            sequence,
            bytes.len(),
            hex_snippet(&bytes, 32)
        );
        Ok(())
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::Closed)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Wait for the first message for which `select` returns `Some`.
    ///
    /// The subscription is registered before this returns; messages that arrived earlier
    /// never match.
    pub fn receive<T, F>(&self, mut select: F, cancel: &CancellationToken) -> Receive<T>
    where
        T: Send + 'static,
        F: FnMut(&MavMessage) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        let subscription = self.read(move |message| {
            if tx.is_some() {
                if let Some(value) = select(message) {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(value);
                    }
                }
            }
        });
        let cancel = cancel.clone();
        Receive {
            inner: Box::pin(async move {
                let _subscription = subscription;
                tokio::select! {
                    biased;
                    received = rx => {
                        received.map(Outcome::Completed).map_err(|_| LinkError::Closed)
                    }
                    _ = cancel.cancelled() => Ok(Outcome::Cancelled),
                }
            }),
        }
    }

    /// Broadcast variant of [`Link::receive`]; see [`Completion`].
    pub fn completion<T, F>(&self, mut select: F) -> Completion<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut(&MavMessage) -> Option<T> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        let subscription = self.read(move |message| {
            let settled = tx.borrow().is_some();
            if !settled {
                if let Some(value) = select(message) {
                    tx.send_replace(Some(value));
                }
            }
        });
        Completion {
            rx,
            _subscription: Arc::new(subscription),
        }
    }

    /// Send `message`, then wait for `expected`; resend each time the window elapses.
    ///
    /// There is no attempt limit: the loop ends when `expected` resolves, `cancel` fires,
    /// or a write fails. No write happens after cancellation.
    pub async fn retry<T, E>(
        &self,
        message: &MavMessage,
        expected: E,
        cancel: &CancellationToken,
    ) -> Result<Outcome<T>, LinkError>
    where
        E: Future<Output = Result<Outcome<T>, LinkError>>,
    {
        tokio::pin!(expected);
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            self.write(message).await?;
            let window = self.shared.tuning.window(attempt);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                result = &mut expected => return result,
                _ = tokio::time::sleep(window) => {}
            }
            attempt = attempt.saturating_add(1);
            metrics::inc_retries();
            warn!(
                "Retry {} (attempt {}, no reply within {}ms)",
                message.message_name(),
                attempt,
                window.as_millis()
            );
        }
    }

    /// Unsubscribe every handler, stop the reader task and close the writer.
    ///
    /// Writes blocked on a channel that stopped draining fail with `Closed` instead of
    /// holding the writer.
    pub async fn destroy(&self) {
        self.shared.closing.cancel();
        self.shared.close_subscribers();
        self.shared.stop_reader();
        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("Link writer shutdown: {}", e);
            }
        }
        info!("Link destroyed");
    }
}

async fn read_loop<R>(mut reader: R, shared: Weak<Shared>)
where
    R: AsyncRead + Unpin,
{
    debug!("Link reader task started");
    let mut framer = codec::frame_decoder();
    let mut buffer = [0u8; 1024];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => {
                info!("Link channel reached end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Link read error: {} - stopping reader", e);
                break;
            }
        };
        trace!("RAW {} bytes: {}", n, hex_snippet(&buffer[..n], 64));
        framer.push(&buffer[..n]);

        let Some(shared) = shared.upgrade() else {
            debug!("Link dropped; reader exiting");
            return;
        };
        while let Some(frame) = framer.next_frame() {
            match codec::decode(&frame) {
                Some(message) => {
                    metrics::inc_frames_decoded();
                    shared.dispatch(&message);
                }
                None => {
                    metrics::inc_frames_dropped();
                    trace!(
                        "Dropped undecodable frame msgid={} from {}:{}",
                        frame.message_id,
                        frame.system_id,
                        frame.component_id
                    );
                }
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.close_subscribers();
    }
}
