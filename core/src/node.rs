// Peer node: one identity and one transport shared by the Ping and Echo handlers
//
// `NodeContext` is what the handlers see of the node: envelope construction,
// signing, authentication, stream helpers and the exchange event channel.
// `PeerNode` owns the handlers, the optional relay manager and the spawned
// tasks that serve inbound streams and sweep timed-out requests.

use crate::config::NodeConfig;
use crate::identity::IdentityKeys;
use crate::message::{self, MessageData, Signed, SigningError};
use crate::protocol::{
    EchoProtocol, ExchangeEvent, ExchangeOutcome, PingProtocol, ProtocolHandler, ProtocolKind,
};
use crate::relay::{RelayConnectivityManager, RelayError, RelayPeer, Reservation};
use crate::transport::{OpenStreamOptions, PeerStream, Transport, TransportError};
use anyhow::Result;
use futures::StreamExt;
use libp2p::{PeerId, StreamProtocol};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

pub struct NodeContext<T: Transport> {
    keys: IdentityKeys,
    transport: Arc<T>,
    client_version: String,
    events: broadcast::Sender<ExchangeEvent>,
}

impl<T: Transport> NodeContext<T> {
    pub fn new(keys: IdentityKeys, transport: Arc<T>, client_version: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            keys,
            transport,
            client_version: client_version.into(),
            events,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.keys.peer_id()
    }

    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    /// Unsigned envelope from the local identity
    pub fn new_message_data(&self, message_id: String, gossip: bool) -> MessageData {
        message::new_message_data(&self.keys, &self.client_version, message_id, gossip)
    }

    /// Envelope for a new exchange, with a fresh random message id
    pub fn new_request_data(&self) -> MessageData {
        self.new_message_data(uuid::Uuid::new_v4().to_string(), false)
    }

    /// Sign `msg` with the local key and attach the signature
    pub fn sign<M: Signed + Clone>(&self, msg: &mut M) -> Result<(), SigningError> {
        message::sign_in_place(&self.keys, msg)
    }

    pub fn authenticate<M: Signed + Clone>(&self, msg: &M) -> bool {
        message::authenticate(msg)
    }

    pub fn publish(
        &self,
        protocol: ProtocolKind,
        peer: PeerId,
        message_id: String,
        outcome: ExchangeOutcome,
    ) {
        // no subscribers is fine
        let _ = self.events.send(ExchangeEvent {
            protocol,
            peer,
            message_id,
            outcome,
        });
    }

    /// Open a fresh stream to `peer` and write one frame on it
    pub async fn send_frame(
        &self,
        peer: PeerId,
        protocol: StreamProtocol,
        frame: &[u8],
        options: OpenStreamOptions,
    ) -> Result<(), TransportError> {
        let stream = self.transport.open_stream(peer, protocol, options).await?;
        self.write_frame(stream, frame).await
    }

    /// Write one frame and close; a failed write resets the stream
    pub async fn write_frame(&self, mut stream: PeerStream, frame: &[u8]) -> Result<(), TransportError> {
        if let Err(e) = stream.write_all(frame).await {
            stream.reset();
            return Err(e);
        }
        stream.close().await
    }
}

pub struct PeerNode<T: Transport> {
    ctx: Arc<NodeContext<T>>,
    ping: Arc<PingProtocol<T>>,
    echo: Arc<EchoProtocol<T>>,
    relay: Option<RelayConnectivityManager<T>>,
    request_timeout: Option<Duration>,
    sweep_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> PeerNode<T> {
    pub fn new(keys: IdentityKeys, transport: Arc<T>, client_version: impl Into<String>) -> Self {
        let ctx = Arc::new(NodeContext::new(keys, transport, client_version));
        Self {
            ping: Arc::new(PingProtocol::new(ctx.clone())),
            echo: Arc::new(EchoProtocol::new(ctx.clone())),
            ctx,
            relay: None,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Node wired from a config: client version, relay and sweep timings
    pub fn from_config(keys: IdentityKeys, transport: Arc<T>, config: &NodeConfig) -> Result<Self> {
        let mut node = Self::new(keys, transport, config.client_version.clone())
            .with_request_timeout(config.request_timeout())
            .with_sweep_interval(config.sweep_interval());
        if let Some(relay) = config.relay_peer()? {
            node = node.with_relay(relay);
        }
        Ok(node)
    }

    pub fn with_relay(mut self, relay: RelayPeer) -> Self {
        self.relay = Some(RelayConnectivityManager::new(
            self.ctx.transport().clone(),
            relay,
        ));
        self
    }

    /// `None` keeps pending requests until answered
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Clamped to at least one millisecond
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    pub fn peer_id(&self) -> PeerId {
        self.ctx.peer_id()
    }

    pub fn context(&self) -> &Arc<NodeContext<T>> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.ctx.subscribe()
    }

    pub fn ping_protocol(&self) -> &PingProtocol<T> {
        &self.ping
    }

    pub fn echo_protocol(&self) -> &EchoProtocol<T> {
        &self.echo
    }

    pub fn relay(&self) -> Option<&RelayConnectivityManager<T>> {
        self.relay.as_ref()
    }

    fn handlers(&self) -> Vec<Arc<dyn ProtocolHandler>> {
        let ping: Arc<dyn ProtocolHandler> = self.ping.clone();
        let echo: Arc<dyn ProtocolHandler> = self.echo.clone();
        vec![ping, echo]
    }

    /// Register every request and response protocol with the transport and
    /// spawn the serving tasks plus the timeout sweeper
    pub fn start(&self) -> Result<(), TransportError> {
        let transport = self.ctx.transport();
        let mut tasks = Vec::new();

        for handler in self.handlers() {
            let mut requests = transport.accept(handler.request_protocol())?;
            let mut responses = transport.accept(handler.response_protocol())?;

            let h = handler.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(stream) = requests.next().await {
                    let h = h.clone();
                    tokio::spawn(async move { h.on_request(stream).await });
                }
            }));

            let h = handler.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(stream) = responses.next().await {
                    let h = h.clone();
                    tokio::spawn(async move { h.on_response(stream).await });
                }
            }));
        }

        if let Some(timeout) = self.request_timeout {
            let handlers = self.handlers();
            let period = self.sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let now = Instant::now();
                    let evicted: usize = handlers.iter().map(|h| h.evict_expired(timeout, now)).sum();
                    if evicted > 0 {
                        tracing::debug!(evicted, "Swept timed-out requests");
                    }
                }
            }));
        }

        tracing::info!(peer = %self.peer_id(), "Node started");
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Evict timed-out requests now; returns how many were evicted
    pub fn sweep(&self) -> usize {
        let Some(timeout) = self.request_timeout else {
            return 0;
        };
        let now = Instant::now();
        self.handlers()
            .iter()
            .map(|h| h.evict_expired(timeout, now))
            .sum()
    }

    pub async fn ping(&self, peer: PeerId) -> bool {
        self.ping.ping(peer).await
    }

    pub async fn echo(&self, peer: PeerId) -> bool {
        self.echo.echo(peer).await
    }

    pub async fn echo_with(&self, peer: PeerId, text: impl Into<String>) -> bool {
        self.echo.echo_with(peer, text).await
    }

    /// Reserve a slot on the configured relay so peers can reach us through it
    pub async fn reserve_relay(&self) -> Option<Result<Reservation, RelayError>> {
        match &self.relay {
            Some(relay) => Some(relay.reserve().await),
            None => None,
        }
    }

    /// Stop serving streams and sweeping
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(peer = %self.peer_id(), "Node stopped");
    }
}

impl<T: Transport> Drop for PeerNode<T> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
