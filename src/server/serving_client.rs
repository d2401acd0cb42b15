//! Per-client state on the serving side.
//!
//! A serving client is created at first handshake and keyed by the client
//! id; a reconnect with the same id replaces the active connection while
//! the endpoint registry reference and the request table stay put. All
//! outgoing frames of a client funnel through one bounded queue with a
//! single sender task per active connection.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossfire::{MAsyncRx, MAsyncTx, MTx, mpmc};
use dashmap::DashMap;
use rmpv::Value;
use tokio::net::tcp::OwnedWriteHalf;

use super::endpoint::{Endpoint, EndpointKind, EndpointShape};
use super::serving_request::ServingRequest;
use crate::codec::MsgWriter;
use crate::config::ServerConfig;
use crate::error::*;
use crate::proto::{self, MessageType};
use crate::typedef::verify;

struct ActiveConn {
    writer: Arc<MsgWriter<OwnedWriteHalf>>,
    // Dropping this ends the connection's read loop
    _close_tx: MTx<()>,
}

pub(crate) struct ServingClient {
    pub client_id: i64,
    conn: Mutex<Option<ActiveConn>>,
    registry: Arc<DashMap<String, Arc<Endpoint>>>,
    config: ServerConfig,
    out_tx: Mutex<Option<MAsyncTx<Value>>>,
    out_rx: MAsyncRx<Value>,
    requests: DashMap<i64, Arc<ServingRequest>>,
    cancelled: DashMap<i64, ()>,
    closed: AtomicBool,
}

impl ServingClient {
    pub fn new(
        client_id: i64, registry: Arc<DashMap<String, Arc<Endpoint>>>, config: ServerConfig,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpmc::bounded_async(config.outgoing_queue_cap);
        let cli = Arc::new(Self {
            client_id,
            conn: Mutex::new(None),
            registry,
            config,
            out_tx: Mutex::new(Some(out_tx)),
            out_rx,
            requests: DashMap::new(),
            cancelled: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let sender = cli.clone();
        let rx = cli.out_rx.clone();
        tokio::spawn(async move { sender.sender(rx).await });
        cli
    }

    /// Install a (possibly replacement) connection. The sender task picks
    /// it up on the next frame. Returns the close signal for the
    /// connection's read loop.
    pub fn replace_conn(&self, writer: Arc<MsgWriter<OwnedWriteHalf>>) -> MAsyncRx<()> {
        let (close_tx, close_rx) = mpmc::unbounded_async::<()>();
        let mut guard = self.conn.lock().unwrap();
        if guard.take().is_some() {
            // dropping the old conn ends its read loop and shuts the
            // socket down
            debug!("client {} conn replaced", self.client_id);
        }
        *guard = Some(ActiveConn { writer, _close_tx: close_tx });
        close_rx
    }

    /// The writer task: the queue's only reader, alive for the whole
    /// serving client, surviving connection replacement.
    async fn sender(&self, rx: MAsyncRx<Value>) {
        while let Ok(msg) = rx.recv().await {
            let writer = { self.conn.lock().unwrap().as_ref().map(|c| c.writer.clone()) };
            match writer {
                None => {
                    debug!("client {} sender dropped a frame, no active conn", self.client_id);
                }
                Some(writer) => {
                    if let Err(e) = writer.send(&msg).await {
                        warn!("client {} sender write err: {}", self.client_id, e);
                        // park this conn, frames flow again after a reconnect
                        let mut guard = self.conn.lock().unwrap();
                        if let Some(cur) = guard.as_ref() {
                            if Arc::ptr_eq(&cur.writer, &writer) {
                                guard.take();
                            }
                        }
                    }
                }
            }
        }
        info!("stop serving client {}", self.client_id);
    }

    /// Enqueue an outgoing frame. Blocks when the queue is full.
    pub async fn send(&self, msg: Value) -> Result<(), RpcError> {
        let tx = { self.out_tx.lock().unwrap().clone() };
        match tx {
            None => Err(RpcIntErr::Closed.into()),
            Some(tx) => tx.send(msg).await.map_err(|_| RpcIntErr::Closed.into()),
        }
    }

    pub fn remove_request(&self, rid: i64) {
        self.requests.remove(&rid);
    }

    pub fn forget_cancel(&self, rid: i64) {
        self.cancelled.remove(&rid);
    }

    pub fn close(&self) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        for r in self.requests.iter() {
            r.value().close();
        }
        self.requests.clear();
        self.cancelled.clear();
        self.out_tx.lock().unwrap().take();
        // dropping the conn ends the read loop and closes the socket
        self.conn.lock().unwrap().take();
    }

    /// Route one inbound frame: to the running-request state machine, to
    /// the cancelled set, or to new-request dispatch.
    pub async fn process_request(self: &Arc<Self>, mut req: Value) -> Result<(), RpcError> {
        let t = match proto::msg_type(&req) {
            Some(t) => t,
            None => return Err(RpcError::Text(format!("empty message type in {}", req))),
        };
        let rid = match proto::request_id(&req) {
            Some(rid) => rid,
            None => return Err(RpcError::Text(format!("request id not found in {}", req))),
        };
        let running = self.requests.get(&rid).map(|r| r.value().clone());
        if let Some(sr) = running {
            return sr.serve_running(t, &mut req, self).await;
        }
        if t == MessageType::CancelRequest {
            // cancel raced ahead of its request, consume it at dispatch
            self.cancelled.insert(rid, ());
            return Ok(());
        }
        self.serve_new(t, req)
    }

    fn serve_new(self: &Arc<Self>, t: MessageType, req: Value) -> Result<(), RpcError> {
        let shape = match t {
            MessageType::FunctionRequest => EndpointShape::Single,
            MessageType::GetStreamRequest => EndpointShape::OutStream,
            MessageType::PutStreamRequest => EndpointShape::InStream,
            MessageType::ChatRequest => EndpointShape::Chat,
            _ => {
                return Err(RpcError::Text(format!(
                    "unknown message type {} for new request {}",
                    t, req
                )));
            }
        };
        let cli = self.clone();
        tokio::spawn(async move {
            if let Some(resp) = cli.serve_function_request(shape, req).await {
                let _ = cli.send(resp).await;
            }
        });
        Ok(())
    }

    async fn serve_function_request(self: &Arc<Self>, shape: EndpointShape, mut req: Value) -> Option<Value> {
        let rid = match proto::request_id(&req) {
            Some(rid) => rid,
            None => return Some(proto::error_response(None, "request id not found".to_string())),
        };
        let name = match proto::get_str(&req, proto::FIELD_FUNCTION) {
            Some(name) => name.to_string(),
            None => {
                return Some(proto::error_response(
                    Some(rid),
                    "function name field not found".to_string(),
                ));
            }
        };
        let ep = match self.registry.get(&name).map(|e| e.value().clone()) {
            Some(ep) => ep,
            None => {
                return Some(proto::error_response(
                    Some(rid),
                    format!("function not found {}", name),
                ));
            }
        };
        let args = proto::take_field(&mut req, proto::FIELD_ARGS);
        if !verify(args.as_ref(), &ep.args) {
            return Some(proto::error_response(
                Some(rid),
                format!("function '{}' invalid args {}", name, display_args(&args)),
            ));
        }
        if ep.shape() != shape {
            return Some(proto::error_response(
                Some(rid),
                format!(
                    "function wrong type {}, expected {}, actual {}",
                    ep.name,
                    ep.shape(),
                    shape
                ),
            ));
        }
        if self.cancelled.remove(&rid).is_some() {
            debug!("client {} request {} canceled before start", self.client_id, rid);
            return Some(proto::error_response(
                Some(rid),
                format!("function '{}' canceled request {}", name, rid),
            ));
        }

        match &ep.kind {
            EndpointKind::Single { res, f } => match f(args).await {
                Err(e) => Some(proto::error_response(
                    Some(rid),
                    format!("function {} call err: {}", name, e),
                )),
                Ok(result) => {
                    if !verify(result.as_ref(), res) {
                        return Some(proto::error_response(
                            Some(rid),
                            format!("function '{}' invalid result", name),
                        ));
                    }
                    Some(proto::function_response(rid, result))
                }
            },
            EndpointKind::OutStream(f) => {
                let (sr, _) = self.new_serving_request(shape, rid);
                match f(args).await {
                    Err(e) => {
                        sr.close_request(self);
                        Some(proto::error_response(
                            Some(rid),
                            format!("out stream function {} call err: {}", name, e),
                        ))
                    }
                    Ok(out_rx) => {
                        tokio::spawn(sr.outgoing_streamer(out_rx, self.clone()));
                        None
                    }
                }
            }
            EndpointKind::InStream(f) => {
                let (sr, in_rx) = self.new_serving_request(shape, rid);
                match f(args, in_rx.expect("instream channel")).await {
                    Err(e) => {
                        sr.close_request(self);
                        Some(proto::error_response(
                            Some(rid),
                            format!("in stream function {} call err: {}", name, e),
                        ))
                    }
                    Ok(()) => Some(proto::stream_ready(rid)),
                }
            }
            EndpointKind::Chat(f) => {
                let (sr, in_rx) = self.new_serving_request(shape, rid);
                match f(args, in_rx.expect("chat channel")).await {
                    Err(e) => {
                        sr.close_request(self);
                        Some(proto::error_response(
                            Some(rid),
                            format!("chat function {} call err: {}", name, e),
                        ))
                    }
                    Ok(out_rx) => {
                        tokio::spawn(sr.outgoing_streamer(out_rx, self.clone()));
                        None
                    }
                }
            }
        }
    }

    fn new_serving_request(
        &self, shape: EndpointShape, rid: i64,
    ) -> (Arc<ServingRequest>, Option<crossfire::AsyncRx<Value>>) {
        let (sr, in_rx) = ServingRequest::new(shape, rid, self.config.incoming_queue_cap);
        self.requests.insert(rid, sr.clone());
        (sr, in_rx)
    }
}

fn display_args(args: &Option<Value>) -> String {
    match args {
        Some(v) => v.to_string(),
        None => "nil".to_string(),
    }
}
