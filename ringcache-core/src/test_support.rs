//! An in-process `Transport` test double, shared by `node`'s and
//! `cluster`'s unit tests so neither needs a real socket or Docker. A
//! process-wide registry keyed by endpoint id lets test code script a
//! node's wire (queue reply bytes, force a connect failure, simulate the
//! remote closing) before the code under test ever calls `connect()`.

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::node::Transport;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;

struct Wire {
    inbound: Mutex<VecDeque<u8>>,
    writes: Mutex<Vec<u8>>,
    notify: Notify,
    fail_next_connect: AtomicBool,
    closed: AtomicBool,
}

impl Wire {
    fn new() -> Self {
        Wire {
            inbound: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            notify: Notify::new(),
            fail_next_connect: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

fn registry() -> &'static Mutex<HashMap<String, Arc<Wire>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<Wire>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn wire_for(id: &str) -> Arc<Wire> {
    registry().lock().unwrap().entry(id.to_string()).or_insert_with(|| Arc::new(Wire::new())).clone()
}

/// A handle test code uses to script one mock node's wire.
pub struct MockHandle {
    wire: Arc<Wire>,
}

/// Look up (or create) the mock wire for `id`, matching the id a `Node`
/// or `Cluster` in the test was built against.
pub fn mock_node(id: &str) -> MockHandle {
    MockHandle { wire: wire_for(id) }
}

impl MockHandle {
    /// Queue bytes the node will read back on its next socket read.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.wire.inbound.lock().unwrap().extend(bytes.iter().copied());
        self.wire.notify.notify_waiters();
    }

    /// Fail the very next `connect()` attempt with `ConnectionClosed`,
    /// then behave normally on the one after.
    pub fn fail_next_connect(&self) {
        self.wire.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// Simulate the remote closing the socket: the next read (or the one
    /// in flight) observes EOF.
    pub fn close(&self) {
        self.wire.closed.store(true, Ordering::SeqCst);
        self.wire.notify.notify_waiters();
    }

    /// Bytes written by the node since the last call, draining the buffer.
    pub fn take_writes(&self) -> Vec<u8> {
        std::mem::take(&mut *self.wire.writes.lock().unwrap())
    }
}

/// A `Transport` whose endpoint id is a key into the in-process wire
/// registry; no real socket is ever opened.
pub struct MockTransport {
    wire: Arc<Wire>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        endpoint: &Endpoint,
        _timeout: Duration,
        _keepalive: bool,
        _keepalive_delay: Duration,
    ) -> Result<Self, Error> {
        let wire = wire_for(&endpoint.id());
        if wire.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("mock refused the connection"));
        }
        Ok(MockTransport { wire })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        loop {
            {
                let mut inbound = self.wire.inbound.lock().unwrap();
                if !inbound.is_empty() {
                    let n = inbound.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = inbound.pop_front().unwrap();
                    }
                    return Ok(n);
                }
                if self.wire.closed.swap(false, Ordering::SeqCst) {
                    return Ok(0);
                }
            }
            self.wire.notify.notified().await;
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        self.wire.writes.lock().unwrap().extend_from_slice(data);
        Ok(())
    }
}
