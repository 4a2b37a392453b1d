//! The per-connection request/response multiplexer.
//!
//! A single wire carries interleaved outbound requests, outbound responses,
//! inbound requests and inbound responses. The [`Router`] is the piece that
//! keeps those streams straight: it correlates an outbound request with its
//! eventual reply, dispatches inbound requests without blocking the receive
//! loop, and tears down cleanly on shutdown or transport failure.
//!
//! The pipe loop services exactly one of {next outbound queue item, next
//! inbound frame} per iteration, then re-arms both sources fresh for the
//! next one. `mpsc::Receiver::recv` and `Transport::receive` are both
//! cancel-safe, so nothing is lost by re-awaiting either branch from
//! scratch each time around.

use crate::error::{Error, Result};
use crate::packet::{Envelope, EnvelopeType};
use crate::transport::Transport;
use crate::{codec, codec::Frame};
use futures::future::BoxFuture;
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Depth at which the outbound queue starts emitting a congestion warning.
/// The Router never throttles; applications requiring backpressure must
/// enforce it above this layer.
const CONGESTION_THRESHOLD: usize = 50;

/// A pre-bound function that sends the response for one specific inbound
/// request, handed to the registered receiver alongside the request data.
pub type ReplyFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The single inbound-request handler a [`Router`] can have registered.
pub type ReceiveHandler = Arc<dyn Fn(Value, ReplyFn) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouterState {
    Open,
    Draining,
    Closed,
}

struct Shared {
    outbound_tx: mpsc::UnboundedSender<Envelope>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    receiver: RwLock<Option<ReceiveHandler>>,
    queue_depth: AtomicUsize,
    congestion_warned: AtomicBool,
    state: Mutex<RouterState>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    pipe_task: Mutex<Option<JoinHandle<()>>>,
    /// Whether the pipe loop has been spawned. `outbound_tx.send` succeeds
    /// even with no pipe loop running (the paired `Receiver` is still held,
    /// just unpolled), so `close()` can't rely on a send failure to detect
    /// "never connected" — it checks this flag instead.
    started: AtomicBool,
}

/// The per-connection multiplexer. Cheaply cloneable; every clone shares the
/// same outbound queue, pending-slot map and receiver.
#[derive(Clone)]
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    /// Construct a Router with no transport attached yet. Call
    /// [`Router::connect_client`] or [`Router::connect_server`] to start the
    /// pipe loop.
    pub fn new() -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            pending: Mutex::new(HashMap::new()),
            receiver: RwLock::new(None),
            queue_depth: AtomicUsize::new(0),
            congestion_warned: AtomicBool::new(false),
            state: Mutex::new(RouterState::Open),
            closed_tx,
            closed_rx,
            pipe_task: Mutex::new(None),
            started: AtomicBool::new(false),
        });
        Self { shared }
    }

    /// Install the single inbound-request handler.
    pub fn register_receiver<F, Fut>(&self, handler: F)
    where
        F: Fn(Value, ReplyFn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: ReceiveHandler = Arc::new(move |data, reply| Box::pin(handler(data, reply)));
        *self.shared.receiver.write().unwrap() = Some(boxed);
    }

    /// Enqueue a fresh outbound request and return a handle the caller can
    /// await for the eventual response. Never blocks on the wire.
    pub fn send(&self, data: Value) -> Result<PendingResponse> {
        let packet_id = generate_packet_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.insert(packet_id.clone(), tx);
        }
        let envelope = Envelope::request(packet_id.clone(), data);
        if let Err(e) = self.enqueue(envelope) {
            // enqueue failed (Router not Open): the slot we just registered
            // will never be resolved by the pipe loop, since it already
            // tore down. Remove it so it doesn't outlive the Router.
            self.shared.pending.lock().unwrap().remove(&packet_id);
            return Err(e);
        }
        Ok(PendingResponse { rx })
    }

    /// Enqueue a response envelope for a previously received request. No
    /// completion is tracked for responses.
    pub fn send_response(&self, packet_id: impl Into<String>, data: Value) -> Result<()> {
        let envelope = Envelope::response(packet_id.into(), data);
        self.enqueue(envelope)
    }

    fn enqueue(&self, envelope: Envelope) -> Result<()> {
        if *self.shared.state.lock().unwrap() != RouterState::Open {
            return Err(Error::RouterClosed);
        }
        let depth = self.shared.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
        if depth > CONGESTION_THRESHOLD && !self.shared.congestion_warned.swap(true, Ordering::SeqCst) {
            warn!(depth, "outbound queue depth exceeded {CONGESTION_THRESHOLD}; the Router does not throttle");
        }
        self.shared
            .outbound_tx
            .send(envelope)
            .map_err(|_| Error::RouterClosed)
    }

    /// Open a client-side transport, start the pipe loop, then perform the
    /// IDENTIFY handshake and resolve once the server acknowledges.
    pub async fn connect_client(&self, transport: Box<dyn Transport>, identify_data: Value) -> Result<Value> {
        self.spawn_pipe_loop(transport)?;
        let handle = self.send(identify_data)?;
        handle.await
    }

    /// Start the pipe loop over a transport the host has already accepted.
    pub fn connect_server(&self, transport: Box<dyn Transport>) -> Result<()> {
        self.spawn_pipe_loop(transport)
    }

    fn spawn_pipe_loop(&self, transport: Box<dyn Transport>) -> Result<()> {
        let outbound_rx = self
            .shared
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("Router pipe loop already started")))?;
        let shared = self.shared.clone();
        self.shared.started.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_pipe_loop(shared, transport, outbound_rx));
        *self.shared.pipe_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Enqueue a close sentinel. Idempotent: calling this more than once is
    /// a no-op after the first.
    pub fn close(&self) {
        let already_closing = {
            let mut state = self.shared.state.lock().unwrap();
            if *state != RouterState::Open {
                true
            } else {
                *state = RouterState::Draining;
                false
            }
        };
        if already_closing {
            return;
        }
        // If the pipe loop hasn't started yet, the paired Receiver is still
        // held (just unpolled) so this send would succeed without anyone
        // ever observing the sentinel; transition straight to Closed so
        // block_until_closed doesn't hang on a Router that was never
        // connected. Once started, a send failure means the pipe loop
        // already exited and tore down on its own.
        let not_started = !self.shared.started.load(Ordering::SeqCst);
        if not_started || self.shared.outbound_tx.send(close_sentinel()).is_err() {
            *self.shared.state.lock().unwrap() = RouterState::Closed;
            let _ = self.shared.closed_tx.send(true);
        }
    }

    /// Await terminal shutdown of this Router.
    pub async fn block_until_closed(&self) {
        let mut rx = self.shared.closed_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Whether the Router has reached the `Closed` state.
    pub fn is_closed(&self) -> bool {
        *self.shared.state.lock().unwrap() == RouterState::Closed
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// A sentinel envelope recognized by the pipe loop as a request to close.
/// `packet_id` is empty, which can never collide with a real (128-bit
/// random) packet id.
fn close_sentinel() -> Envelope {
    Envelope {
        packet_id: String::new(),
        r#type: EnvelopeType::Request,
        data: Value::Null,
    }
}

fn is_close_sentinel(envelope: &Envelope) -> bool {
    envelope.packet_id.is_empty() && envelope.data.is_null() && envelope.r#type == EnvelopeType::Request
}

/// The future returned by [`Router::send`]; awaiting it yields the eventual
/// response (or an error if the connection is lost before one arrives).
pub struct PendingResponse {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionLost)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn generate_packet_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn run_pipe_loop(
    shared: Arc<Shared>,
    mut transport: Box<dyn Transport>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                match outbound {
                    None => break,
                    Some(envelope) if is_close_sentinel(&envelope) => break,
                    Some(envelope) => {
                        let remaining = shared.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;
                        if remaining <= CONGESTION_THRESHOLD {
                            shared.congestion_warned.store(false, Ordering::SeqCst);
                        }
                        let packet_id = envelope.packet_id.clone();
                        match codec::encode(&envelope) {
                            Ok(text) => {
                                if let Err(e) = transport.send(text).await {
                                    error!(%e, "transport send failed; failing this request and tearing down");
                                    fail_one(&shared, &packet_id, Error::Transport(e.to_string()));
                                    fail_all_pending(&shared);
                                    break;
                                }
                            }
                            Err(e) => {
                                error!(%e, "failed to encode outbound envelope");
                                fail_one(&shared, &packet_id, e);
                            }
                        }
                    }
                }
            }
            inbound = transport.receive() => {
                match inbound {
                    Err(e) => {
                        debug!(%e, "transport receive failed; tearing down");
                        fail_all_pending(&shared);
                        break;
                    }
                    Ok(text) => handle_inbound_text(&shared, text),
                }
            }
        }
    }

    transition_to_closed(&shared, transport).await;
}

fn handle_inbound_text(shared: &Arc<Shared>, text: String) {
    let envelope = match codec::decode(Frame::Text(text)) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(%e, "discarding undecodable inbound frame");
            return;
        }
    };

    match envelope.r#type {
        EnvelopeType::Response => {
            let slot = shared.pending.lock().unwrap().remove(&envelope.packet_id);
            match slot {
                Some(tx) => {
                    let _ = tx.send(Ok(envelope.data));
                }
                None => {
                    warn!(packet_id = %envelope.packet_id, "response for unknown packet id");
                }
            }
        }
        EnvelopeType::Request => {
            let handler = shared.receiver.read().unwrap().clone();
            let outbound_tx = shared.outbound_tx.clone();
            let packet_id = envelope.packet_id.clone();
            match handler {
                None => {
                    warn!(%packet_id, error = %Error::MissingReceiveHandler, "inbound request arrived with no receiver registered");
                }
                Some(handler) => {
                    tokio::spawn(async move {
                        let reply: ReplyFn = Arc::new(move |data: Value| {
                            let outbound_tx = outbound_tx.clone();
                            let packet_id = packet_id.clone();
                            Box::pin(async move {
                                let envelope = Envelope::response(packet_id, data);
                                outbound_tx.send(envelope).map_err(|_| Error::RouterClosed)
                            })
                        });
                        handler(envelope.data, reply).await;
                    });
                }
            }
        }
    }
}

fn fail_one(shared: &Arc<Shared>, packet_id: &str, err: Error) {
    if let Some(tx) = shared.pending.lock().unwrap().remove(packet_id) {
        let _ = tx.send(Err(err));
    }
}

fn fail_all_pending(shared: &Arc<Shared>) {
    let mut pending = shared.pending.lock().unwrap();
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(Error::ConnectionLost));
    }
}

async fn transition_to_closed(shared: &Arc<Shared>, mut transport: Box<dyn Transport>) {
    {
        let mut state = shared.state.lock().unwrap();
        *state = RouterState::Draining;
    }
    fail_all_pending(shared);
    let _ = transport.close().await;
    {
        let mut state = shared.state.lock().unwrap();
        *state = RouterState::Closed;
    }
    let _ = shared.closed_tx.send(true);
}
