//! The per-node connection state machine: one actor task owns a
//! socket, a FIFO of pending requests, and the receive buffer; `Node` is a
//! cheap, cloneable handle to that actor.

use crate::binary;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::event::Event;
use crate::text::{Reply, ReplyParser, ResponseShape};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The socket abstraction a `Node` drives. Each async runtime adapter
/// (e.g. `ringcache-tokio`) provides one concrete implementation; the
/// core actor loop never touches a real `TcpStream` directly.
#[async_trait]
pub trait Transport: Sized + Send + 'static {
    /// Open a fresh connection to `endpoint`, bounded by `timeout`. When
    /// `keepalive` is set, the implementation enables TCP keep-alive with
    /// probes spaced `keepalive_delay` apart.
    async fn connect(
        endpoint: &Endpoint,
        timeout: Duration,
        keepalive: bool,
        keepalive_delay: Duration,
    ) -> Result<Self, Error>;
    /// Read into `buf`, returning the number of bytes read (0 = EOF).
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
    /// Write the entire buffer, applying write back-pressure as needed.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;
}

/// SASL PLAIN credentials, applied during the connection handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub timeout: Duration,
    pub keepalive: bool,
    pub keepalive_delay: Duration,
    pub weight: u32,
    pub credentials: Option<Credentials>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            timeout: Duration::from_millis(5000),
            keepalive: true,
            keepalive_delay: Duration::from_millis(1000),
            weight: 1,
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Authenticated = 3,
    Closing = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Disconnected,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Authenticated,
            _ => ConnState::Closing,
        }
    }
}

/// What the caller wants done with one command: the already-framed bytes,
/// how to classify the reply, and the retry/event-emission metadata from
/// the request's own metadata.
pub struct CommandOpts {
    pub shape: ResponseShape,
    pub requested_keys: Option<Vec<Vec<u8>>>,
    pub idempotent: bool,
}

impl CommandOpts {
    pub fn new(shape: ResponseShape) -> Self {
        CommandOpts {
            shape,
            requested_keys: None,
            idempotent: false,
        }
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_requested_keys(mut self, keys: Vec<Vec<u8>>) -> Self {
        self.requested_keys = Some(keys);
        self
    }
}

struct PendingCommand {
    bytes: Vec<u8>,
    shape: ResponseShape,
    requested_keys: Option<Vec<Vec<u8>>>,
    respond_to: oneshot::Sender<Result<Reply, Error>>,
}

enum ActorMessage {
    Command(PendingCommand),
    Connect(oneshot::Sender<Result<(), Error>>),
    Reconnect(oneshot::Sender<Result<(), Error>>),
    Disconnect(oneshot::Sender<()>),
    Quit(oneshot::Sender<()>),
    SetWeight(u32),
}

/// A cheap, cloneable handle to one node's connection actor. Cloning a
/// `Node` shares the same underlying socket and FIFO; it does not open a
/// second connection.
pub struct Node<T: Transport> {
    id: String,
    endpoint: Endpoint,
    weight: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
    cmd_tx: mpsc::UnboundedSender<ActorMessage>,
    events: broadcast::Sender<Event>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Transport> Clone for Node<T> {
    fn clone(&self) -> Self {
        Node {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            weight: self.weight.clone(),
            state: self.state.clone(),
            cmd_tx: self.cmd_tx.clone(),
            events: self.events.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Transport> Node<T> {
    /// Spawn the actor task and return a handle to it. The socket is not
    /// opened until `connect()` is called: a node's socket is created
    /// lazily on first connect().
    pub fn spawn(id: impl Into<String>, endpoint: Endpoint, config: NodeConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(crate::event::EVENT_CHANNEL_CAPACITY);
        let weight = Arc::new(AtomicU32::new(config.weight));
        let state = Arc::new(AtomicU8::new(ConnState::Disconnected as u8));
        let id = id.into();

        let actor = NodeActor::<T> {
            id: id.clone(),
            endpoint: endpoint.clone(),
            config,
            weight: weight.clone(),
            state: state.clone(),
            events: events.clone(),
            cmd_rx,
            socket: None,
            fifo: VecDeque::new(),
            deadline: None,
            recv_buf: Vec::new(),
            current_parser: None,
        };
        tokio::spawn(actor.run());

        Node {
            id,
            endpoint,
            weight,
            state,
            cmd_tx,
            events,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
        let _ = self.cmd_tx.send(ActorMessage::SetWeight(weight));
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            ConnState::from_u8(self.state.load(Ordering::Acquire)),
            ConnState::Connected | ConnState::Authenticated
        )
    }

    pub fn is_authenticated(&self) -> bool {
        ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Authenticated
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Idempotent when already Ready (Connected, or Authenticated when
    /// credentials are configured).
    pub async fn connect(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorMessage::Connect(tx))
            .map_err(|_| Error::ConnectionClosed("actor task is gone"))?;
        rx.await.map_err(|_| Error::ConnectionClosed("actor task is gone"))?
    }

    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ActorMessage::Disconnect(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// disconnect() + fail-pending("reset for reconnection") + clear
    /// buffers + connect().
    pub async fn reconnect(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(ActorMessage::Reconnect(tx))
            .map_err(|_| Error::ConnectionClosed("actor task is gone"))?;
        rx.await.map_err(|_| Error::ConnectionClosed("actor task is gone"))?
    }

    /// Best-effort `quit` command, then disconnect.
    pub async fn quit(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(ActorMessage::Quit(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Enqueue one request and await its typed reply. Rejects with
    /// `NotConnected` if the node is not Ready.
    pub async fn command(&self, bytes: Vec<u8>, opts: CommandOpts) -> Result<Reply, Error> {
        let (respond_to, rx) = oneshot::channel();
        let pending = PendingCommand {
            bytes,
            shape: opts.shape,
            requested_keys: opts.requested_keys,
            respond_to,
        };
        self.cmd_tx
            .send(ActorMessage::Command(pending))
            .map_err(|_| Error::ConnectionClosed("actor task is gone"))?;
        rx.await.map_err(|_| Error::ConnectionClosed("actor task is gone"))?
    }
}

struct NodeActor<T: Transport> {
    id: String,
    endpoint: Endpoint,
    config: NodeConfig,
    weight: Arc<AtomicU32>,
    state: Arc<AtomicU8>,
    events: broadcast::Sender<Event>,
    cmd_rx: mpsc::UnboundedReceiver<ActorMessage>,
    socket: Option<T>,
    fifo: VecDeque<PendingCommand>,
    deadline: Option<Instant>,
    recv_buf: Vec<u8>,
    current_parser: Option<ReplyParser>,
}

impl<T: Transport> NodeActor<T> {
    async fn run(mut self) {
        loop {
            let timeout_fut = match self.deadline {
                Some(deadline) => futures::future::Either::Left(tokio::time::sleep_until(deadline)),
                None => futures::future::Either::Right(futures::future::pending()),
            };

            tokio::select! {
                msg = self.cmd_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            self.teardown(Error::ConnectionClosed("handle dropped")).await;
                            return;
                        }
                    }
                }
                chunk = read_chunk(&mut self.socket) => {
                    self.handle_chunk(chunk).await;
                }
                _ = timeout_fut => {
                    self.handle_timeout().await;
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Command(cmd) => self.handle_enqueue(cmd).await,
            ActorMessage::Connect(ack) => {
                let result = self.do_connect().await;
                let _ = ack.send(result);
            }
            ActorMessage::Reconnect(ack) => {
                self.teardown(Error::ConnectionClosed("reset for reconnection")).await;
                let result = self.do_connect().await;
                let _ = ack.send(result);
            }
            ActorMessage::Disconnect(ack) => {
                self.teardown(Error::ConnectionClosed("disconnect() called")).await;
                let _ = ack.send(());
            }
            ActorMessage::Quit(ack) => {
                if self.socket.is_some() {
                    let bytes = crate::text::command_line(&[b"quit"]);
                    let _ = self.write_raw(&bytes).await;
                }
                self.teardown(Error::ConnectionClosed("quit() called")).await;
                let _ = ack.send(());
            }
            ActorMessage::SetWeight(w) => {
                self.weight.store(w, Ordering::Relaxed);
            }
        }
    }

    async fn do_connect(&mut self) -> Result<(), Error> {
        let ready = matches!(
            ConnState::from_u8(self.state.load(Ordering::Acquire)),
            ConnState::Authenticated
        ) || (self.config.credentials.is_none()
            && ConnState::from_u8(self.state.load(Ordering::Acquire)) == ConnState::Connected);
        if ready {
            return Ok(());
        }

        self.set_state(ConnState::Connecting);
        let mut socket = match T::connect(
            &self.endpoint,
            self.config.timeout,
            self.config.keepalive,
            self.config.keepalive_delay,
        )
        .await
        {
            Ok(s) => s,
            Err(err) => {
                self.set_state(ConnState::Disconnected);
                self.emit(Event::Error {
                    node: Some(self.id.clone()),
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        if let Some(creds) = self.config.credentials.clone() {
            match self.sasl_handshake(&mut socket, &creds).await {
                Ok(()) => {
                    self.set_state(ConnState::Authenticated);
                    self.emit(Event::Authenticated { node: self.id.clone() });
                }
                Err(err) => {
                    self.set_state(ConnState::Disconnected);
                    self.emit(Event::Error {
                        node: Some(self.id.clone()),
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
        } else {
            self.set_state(ConnState::Connected);
        }

        self.socket = Some(socket);
        self.reset_deadline();
        self.emit(Event::Connect { node: self.id.clone() });
        debug!(node = %self.id, "connected");
        Ok(())
    }

    async fn sasl_handshake(&mut self, socket: &mut T, creds: &Credentials) -> Result<(), Error> {
        let list_mechs = binary::sasl_list_mechs_request();
        socket.write_all(&list_mechs.to_bytes()).await?;
        let _mechs = read_one_binary_packet(socket).await?;

        let auth = binary::sasl_plain_auth_request(&creds.username, &creds.password);
        socket.write_all(&auth.to_bytes()).await?;
        let resp = read_one_binary_packet(socket).await?;
        binary::sasl_auth_outcome(resp.header.status)
    }

    async fn handle_enqueue(&mut self, cmd: PendingCommand) {
        if self.socket.is_none() {
            let _ = cmd.respond_to.send(Err(Error::NotConnected));
            return;
        }
        if let Err(err) = self.write_raw(&cmd.bytes).await {
            let _ = cmd.respond_to.send(Err(err));
            return;
        }
        self.fifo.push_back(cmd);
        self.reset_deadline();
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match self.socket.as_mut() {
            Some(socket) => {
                trace!(node = %self.id, bytes = bytes.len(), "write");
                socket.write_all(bytes).await
            }
            None => Err(Error::NotConnected),
        }
    }

    async fn handle_chunk(&mut self, chunk: Result<Vec<u8>, Error>) {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                self.emit(Event::Error {
                    node: Some(self.id.clone()),
                    message: err.to_string(),
                });
                self.teardown(Error::ConnectionClosed("read error")).await;
                return;
            }
        };
        if bytes.is_empty() {
            self.teardown(Error::ConnectionClosed("remote closed")).await;
            return;
        }

        self.reset_deadline();
        self.recv_buf.extend_from_slice(&bytes);

        loop {
            if self.fifo.is_empty() {
                break;
            }
            if self.current_parser.is_none() {
                let front = self.fifo.front().unwrap();
                self.current_parser = Some(ReplyParser::new(front.shape, front.requested_keys.clone()));
            }
            let parser = self.current_parser.as_mut().unwrap();
            match parser.feed(&mut self.recv_buf) {
                Ok(Some(reply)) => {
                    self.current_parser = None;
                    let cmd = self.fifo.pop_front().unwrap();
                    self.emit_hit_miss(&cmd, &reply);
                    let _ = cmd.respond_to.send(Ok(reply));
                }
                Ok(None) => break,
                Err(err) => {
                    self.current_parser = None;
                    let cmd = self.fifo.pop_front().unwrap();
                    let _ = cmd.respond_to.send(Err(err));
                }
            }
        }
    }

    fn emit_hit_miss(&self, cmd: &PendingCommand, reply: &Reply) {
        if let Reply::Values(values) = reply {
            for entry in &values.values {
                self.emit(Event::Hit {
                    node: self.id.clone(),
                    key: entry.key.clone(),
                    value: entry.data.clone(),
                });
            }
            for key in &values.missing_keys {
                self.emit(Event::Miss {
                    node: self.id.clone(),
                    key: key.clone(),
                });
            }
        }
        let _ = cmd;
    }

    async fn handle_timeout(&mut self) {
        warn!(node = %self.id, "inactivity timeout");
        self.emit(Event::Timeout { node: self.id.clone() });
        self.teardown(Error::ConnectionTimeout).await;
    }

    async fn teardown(&mut self, reason: Error) {
        if self.socket.is_none() && self.fifo.is_empty() {
            self.set_state(ConnState::Disconnected);
            return;
        }
        self.socket = None;
        self.deadline = None;
        self.recv_buf.clear();
        self.current_parser = None;
        while let Some(cmd) = self.fifo.pop_front() {
            let err = clone_error(&reason);
            let _ = cmd.respond_to.send(Err(err));
        }
        self.set_state(ConnState::Disconnected);
        self.emit(Event::Close { node: self.id.clone() });
        debug!(node = %self.id, reason = %reason, "closed");
    }

    fn reset_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.config.timeout);
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }
}

fn clone_error(err: &Error) -> Error {
    match *err {
        Error::ConnectionClosed(reason) => Error::ConnectionClosed(reason),
        Error::ConnectionTimeout => Error::ConnectionTimeout,
        ref other => Error::Protocol(other.to_string()),
    }
}

async fn read_chunk<T: Transport>(socket: &mut Option<T>) -> Result<Vec<u8>, Error> {
    match socket {
        Some(socket) => {
            let mut buf = [0u8; 8192];
            let n = socket.read(&mut buf).await?;
            Ok(buf[..n].to_vec())
        }
        None => futures::future::pending().await,
    }
}

async fn read_one_binary_packet<T: Transport>(socket: &mut T) -> Result<binary::Packet, Error> {
    let mut header_buf = [0u8; binary::HEADER_LEN];
    read_exact(socket, &mut header_buf).await?;
    let header = binary::Header::try_from(&header_buf[..])?;
    let mut body = vec![0u8; header.body_len as usize];
    if !body.is_empty() {
        read_exact(socket, &mut body).await?;
    }
    binary::Packet::from_response_body(header, &body)
}

async fn read_exact<T: Transport>(socket: &mut T, buf: &mut [u8]) -> Result<(), Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = socket.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed("remote closed during handshake"));
        }
        filled += n;
    }
    Ok(())
}
