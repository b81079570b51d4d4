//! # Publish Bridge
//!
//! All producers (GPIO drain, radio roles) talk to the broker through one
//! [`PublishBridge`]. They never touch the transport: [`Publisher`] copies the
//! request into a bounded outbox and returns a locally allocated
//! [`MessageId`] at once. A single [`BridgeRunner`] owns the client session,
//! drains the outbox and reports the session lifecycle as [`BridgeEvent`]s.
//!
//! Requests submitted while no session is up stay in the outbox and go out
//! once the next session is established. A full outbox is reported to the
//! caller as [`GatewayError::OutboxFull`]; nothing blocks.

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::once_lock::OnceLock;
use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};
use portable_atomic::{AtomicU8, AtomicU16, Ordering};

use crate::config::Topics;
use crate::connectivity::ConnectivityStatus;
use crate::error::{ClientError, GatewayError, Result};
use crate::supervisor::BootStage;

pub const TOPIC_CAPACITY: usize = 64;
pub const PAYLOAD_CAPACITY: usize = 192;
pub const OUTBOX_DEPTH: usize = 8;
pub const EVENT_DEPTH: usize = 8;

pub type Topic = heapless::String<TOPIC_CAPACITY>;
pub type Payload = heapless::Vec<u8, PAYLOAD_CAPACITY>;

/// Delivery guarantee of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Identifier handed back for every submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// Owned copy of a producer's request, waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub id: MessageId,
    pub kind: RequestKind,
    pub topic: Topic,
    pub payload: Payload,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundRequest {
    fn new(
        id: MessageId,
        kind: RequestKind,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<Self> {
        let topic = Topic::try_from(topic).map_err(|_| GatewayError::PayloadTooLarge {
            len: topic.len(),
            capacity: TOPIC_CAPACITY,
        })?;
        let payload = Payload::from_slice(payload).map_err(|_| GatewayError::PayloadTooLarge {
            len: payload.len(),
            capacity: PAYLOAD_CAPACITY,
        })?;
        Ok(Self {
            id,
            kind,
            topic,
            payload,
            qos,
            retain,
        })
    }

    /// Publishes of QoS 1 and above survive a broken session.
    fn is_retryable(&self) -> bool {
        self.kind == RequestKind::Publish && self.qos >= QoS::AtLeastOnce
    }
}

/// Lifecycle notifications of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected,
    Disconnected,
    Subscribed(MessageId),
    Unsubscribed(MessageId),
    Published(MessageId),
    Data { topic: Topic, payload: Payload },
    Error(GatewayError),
}

/// Session lifecycle as seen from outside the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connected = 1,
    Subscribed = 2,
    Disconnected = 3,
    Errored = 4,
}

impl SessionState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connected,
            2 => SessionState::Subscribed,
            3 => SessionState::Disconnected,
            4 => SessionState::Errored,
            _ => SessionState::Idle,
        }
    }
}

/// The process-wide bridge. Lives in a [`BridgeSlot`].
pub struct PublishBridge {
    outbox: Channel<CriticalSectionRawMutex, OutboundRequest, OUTBOX_DEPTH>,
    events: Channel<CriticalSectionRawMutex, BridgeEvent, EVENT_DEPTH>,
    state: AtomicU8,
    next_id: AtomicU16,
}

impl Default for PublishBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishBridge {
    pub const fn new() -> Self {
        Self {
            outbox: Channel::new(),
            events: Channel::new(),
            state: AtomicU8::new(SessionState::Idle as u8),
            next_id: AtomicU16::new(1),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Next free id. Zero is never handed out.
    fn allocate_id(&self) -> MessageId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return MessageId(id);
            }
        }
    }

    fn submit(
        &self,
        kind: RequestKind,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId> {
        let id = self.allocate_id();
        let request = OutboundRequest::new(id, kind, topic, payload, qos, retain)?;
        self.outbox
            .try_send(request)
            .map_err(|_| GatewayError::OutboxFull)?;
        Ok(id)
    }

    /// Requests waiting for a session.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    #[cfg(test)]
    pub(crate) fn take_queued(&self) -> Option<OutboundRequest> {
        self.outbox.try_receive().ok()
    }

    /// Waits for the next lifecycle event.
    pub async fn next_event(&self) -> BridgeEvent {
        self.events.receive().await
    }

    pub fn try_next_event(&self) -> Option<BridgeEvent> {
        self.events.try_receive().ok()
    }

    /// Events are best effort: with nobody listening the oldest ones win.
    fn emit(&self, event: BridgeEvent) {
        if self.events.try_send(event).is_err() {
            warn!("Bridge event dropped, no listener keeping up");
        }
    }
}

/// Holder of the one [`PublishBridge`], filled exactly once during boot.
pub struct BridgeSlot {
    cell: OnceLock<PublishBridge>,
}

impl Default for BridgeSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl BridgeSlot {
    pub const fn new() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }

    /// Creates the bridge. A second install is refused.
    pub fn install(&self) -> Result<&PublishBridge> {
        if self.cell.init(PublishBridge::new()).is_err() {
            error!("Publish bridge installed twice");
            return Err(GatewayError::InitializationFailure(BootStage::PublishBridge));
        }
        self.get()
            .ok_or(GatewayError::InitializationFailure(BootStage::PublishBridge))
    }

    pub fn get(&self) -> Option<&PublishBridge> {
        self.cell.try_get()
    }

    pub fn is_installed(&self) -> bool {
        self.get().is_some()
    }
}

/// Producer handle. Cheap to copy into every task.
#[derive(Clone, Copy)]
pub struct Publisher<'a> {
    slot: &'a BridgeSlot,
}

impl<'a> Publisher<'a> {
    pub const fn new(slot: &'a BridgeSlot) -> Self {
        Self { slot }
    }

    /// Whether the bridge is installed and accepts requests.
    pub fn is_ready(&self) -> bool {
        self.slot.is_installed()
    }

    fn bridge(&self) -> Result<&'a PublishBridge> {
        self.slot.get().ok_or(GatewayError::BridgeUnavailable)
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<MessageId> {
        self.bridge()?
            .submit(RequestKind::Publish, topic, payload, qos, retain)
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<MessageId> {
        self.bridge()?
            .submit(RequestKind::Subscribe, topic, &[], qos, false)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<MessageId> {
        self.bridge()?
            .submit(RequestKind::Unsubscribe, topic, &[], QoS::AtMostOnce, false)
    }
}

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An inbound publish on a subscribed topic.
    Message { topic: Topic, payload: Payload },
    /// Nothing arrived for a while; the session kept itself alive.
    Idle,
}

/// An open session with the broker.
#[allow(async_fn_in_trait)]
pub trait PubSubSession {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> core::result::Result<(), ClientError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> core::result::Result<(), ClientError>;

    async fn unsubscribe(&mut self, topic: &str) -> core::result::Result<(), ClientError>;

    /// Waits until inbound traffic is pending or the session needs upkeep.
    ///
    /// Must be cancel-safe: the runner races it against the outbox and drops
    /// it whenever a request wins, so it may not consume anything from the
    /// connection.
    async fn wait_inbound(&mut self) -> core::result::Result<(), ClientError>;

    /// Reads what [`wait_inbound`](Self::wait_inbound) announced.
    ///
    /// Always driven to completion, never raced.
    async fn next_event(&mut self) -> core::result::Result<SessionEvent, ClientError>;
}

/// Opens sessions. A failed open is a client error like any other.
#[allow(async_fn_in_trait)]
pub trait SessionFactory {
    type Session<'s>: PubSubSession
    where
        Self: 's;

    async fn open(&mut self) -> core::result::Result<Self::Session<'_>, ClientError>;
}

/// The single writer. Owns every open session.
pub struct BridgeRunner<'a> {
    bridge: &'a PublishBridge,
    topics: Topics,
    pending: Option<OutboundRequest>,
}

impl<'a> BridgeRunner<'a> {
    pub fn new(bridge: &'a PublishBridge, topics: Topics) -> Self {
        Self {
            bridge,
            topics,
            pending: None,
        }
    }

    /// Request held back from a failed session.
    pub fn pending(&self) -> Option<&OutboundRequest> {
        self.pending.as_ref()
    }

    /// Drives `session` until it fails and returns the failure.
    ///
    /// On entry the bridge announces itself: `hop` on the status topic and a
    /// subscription to the command topic, confirmed with `oke`.
    pub async fn serve<S: PubSubSession>(&mut self, session: &mut S) -> ClientError {
        match self.serve_inner(session).await {
            Ok(never) => match never {},
            Err(e) => {
                self.record_error(&e);
                e
            }
        }
    }

    async fn serve_inner<S: PubSubSession>(
        &mut self,
        session: &mut S,
    ) -> core::result::Result<core::convert::Infallible, ClientError> {
        info!("MQTT_EVENT_CONNECTED");
        self.bridge.set_state(SessionState::Connected);
        self.bridge.emit(BridgeEvent::Connected);
        self.announce(session).await?;

        if let Some(request) = self.pending.take() {
            info!("Retrying message {} from previous session", request.id.0);
            self.execute(session, request).await?;
        }

        loop {
            match select(self.bridge.outbox.receive(), session.wait_inbound()).await {
                Either::First(request) => self.execute(session, request).await?,
                Either::Second(ready) => {
                    ready?;
                    match session.next_event().await? {
                        SessionEvent::Message { topic, payload } => {
                            self.on_data(session, topic, payload).await?
                        }
                        SessionEvent::Idle => {}
                    }
                }
            }
        }
    }

    async fn announce<S: PubSubSession>(
        &mut self,
        session: &mut S,
    ) -> core::result::Result<(), ClientError> {
        let hop = self.bridge.allocate_id();
        session
            .publish(self.topics.status, b"hop", QoS::AtLeastOnce, false)
            .await?;
        info!("sent publish successful, msg_id={}", hop.0);
        self.bridge.emit(BridgeEvent::Published(hop));

        let sub = self.bridge.allocate_id();
        session
            .subscribe(self.topics.command, QoS::AtLeastOnce)
            .await?;
        info!("MQTT_EVENT_SUBSCRIBED, msg_id={}", sub.0);
        self.bridge.set_state(SessionState::Subscribed);
        self.bridge.emit(BridgeEvent::Subscribed(sub));

        let oke = self.bridge.allocate_id();
        session
            .publish(self.topics.status, b"oke", QoS::AtLeastOnce, false)
            .await?;
        self.bridge.emit(BridgeEvent::Published(oke));
        Ok(())
    }

    async fn execute<S: PubSubSession>(
        &mut self,
        session: &mut S,
        request: OutboundRequest,
    ) -> core::result::Result<(), ClientError> {
        let outcome = match request.kind {
            RequestKind::Publish => session
                .publish(&request.topic, &request.payload, request.qos, request.retain)
                .await
                .map(|()| BridgeEvent::Published(request.id)),
            RequestKind::Subscribe => session
                .subscribe(&request.topic, request.qos)
                .await
                .map(|()| BridgeEvent::Subscribed(request.id)),
            RequestKind::Unsubscribe => session
                .unsubscribe(&request.topic)
                .await
                .map(|()| BridgeEvent::Unsubscribed(request.id)),
        };
        match outcome {
            Ok(event) => {
                self.bridge.emit(event);
                Ok(())
            }
            Err(e) => {
                if request.is_retryable() {
                    self.pending = Some(request);
                } else {
                    warn!("Dropping message {} with the session", request.id.0);
                }
                Err(e)
            }
        }
    }

    async fn on_data<S: PubSubSession>(
        &mut self,
        session: &mut S,
        topic: Topic,
        payload: Payload,
    ) -> core::result::Result<(), ClientError> {
        info!("MQTT_EVENT_DATA TOPIC={} ({} bytes)", topic, payload.len());
        if topic.as_str() == self.topics.command {
            let id = self.bridge.allocate_id();
            session
                .publish(self.topics.status, &payload, QoS::AtLeastOnce, false)
                .await?;
            self.bridge.emit(BridgeEvent::Published(id));
        }
        self.bridge.emit(BridgeEvent::Data { topic, payload });
        Ok(())
    }

    /// Logs every failed layer of `err` on its own and marks the session down.
    pub fn record_error(&self, err: &ClientError) {
        self.bridge.set_state(SessionState::Errored);
        for cause in err.causes() {
            match cause {
                GatewayError::Transport { code } => {
                    error!("Last error reported from esp-tls: 0x{:x}", code)
                }
                GatewayError::SecureChannel { code } => {
                    error!("Last error reported from tls stack: 0x{:x}", code)
                }
                GatewayError::Socket { errno } => error!(
                    "Last error captured as transport's socket errno: 0x{:x} ({})",
                    errno,
                    crate::error::errno_name(errno)
                ),
                other => error!("MQTT_EVENT_ERROR: {}", other),
            }
            self.bridge.emit(BridgeEvent::Error(cause));
        }
        info!("MQTT_EVENT_DISCONNECTED");
        self.bridge.set_state(SessionState::Disconnected);
        self.bridge.emit(BridgeEvent::Disconnected);
    }

    /// Keeps a session up for as long as the process lives.
    ///
    /// Sessions are only opened while the station is connected; after a
    /// failure the next attempt waits `backoff_ms`.
    pub async fn run<F: SessionFactory, D: DelayNs>(
        &mut self,
        factory: &mut F,
        link: &ConnectivityStatus,
        delay: &mut D,
        backoff_ms: u32,
    ) -> ! {
        loop {
            if !link.is_connected() {
                delay.delay_ms(backoff_ms).await;
                continue;
            }
            match factory.open().await {
                Ok(mut session) => {
                    self.serve(&mut session).await;
                }
                Err(e) => self.record_error(&e),
            }
            delay.delay_ms(backoff_ms).await;
        }
    }
}
