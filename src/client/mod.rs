//! The calling side: connection management, request issuing, response
//! demultiplexing.
//!
//! ```no_run
//! use value_rpc::client::RpcClient;
//! use value_rpc::{ClientConfig, Value};
//!
//! async fn call() -> Result<(), value_rpc::RpcError> {
//!     let client = RpcClient::new(ClientConfig::new("127.0.0.1:9999"));
//!     client.connect().await?;
//!     let name = client.call_function("getName", None).await?;
//!     println!("{}", name);
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod conn;
mod request;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use crossfire::AsyncRx;
use dashmap::DashMap;
use rmpv::Value;
use tokio::sync::oneshot;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::*;
use crate::proto::{self, MessageType};
use conn::RpcConn;
use request::{GET_OPEN, PUT_OPEN, RequestCtx, RequestHandles};

/// Callback for completed calls, invoked with the function name and the
/// elapsed time in microseconds. Must be fast.
pub type PerformanceMonitor = Arc<dyn Fn(&str, i64) + Send + Sync>;

/// Callback invoked with the handshake response when a connection turns
/// active.
pub type ConnectionHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Where the client reports failures that have no blocking caller to
/// return to.
pub trait ErrorHandler: Send + Sync + 'static {
    fn bad_connection(&self, err: &RpcError);

    fn protocol_error(&self, msg: &Value, err: &RpcError);

    fn stream_error(&self, rid: i64, err: &RpcError);
}

/// Default handler, logs and moves on.
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn bad_connection(&self, err: &RpcError) {
        warn!("rpc client connection err: {}", err);
    }

    fn protocol_error(&self, msg: &Value, err: &RpcError) {
        warn!("rpc client protocol err: {} in {}", err, msg);
    }

    fn stream_error(&self, rid: i64, err: &RpcError) {
        warn!("rpc client stream rid={} err: {}", rid, err);
    }
}

static DEFAULT_CLIENT_ID: AtomicI64 = AtomicI64::new(0);

/// Set the process-wide client id used by clients whose config leaves
/// `client_id` at 0. The server coalesces reconnects by this id.
pub fn set_default_client_id(id: i64) {
    DEFAULT_CLIENT_ID.store(id, Ordering::Release);
}

/// A client multiplexing any number of concurrent requests over one
/// connection. All operations are usable from multiple tasks.
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        let client_id = if config.client_id != 0 {
            config.client_id
        } else {
            DEFAULT_CLIENT_ID.load(Ordering::Acquire)
        };
        let (conn_tx, _conn_rx) = watch::channel(None);
        let timeout_ms = config.timeout_ms;
        Self {
            inner: Arc::new(ClientInner {
                config,
                client_id,
                timeout_ms: AtomicI64::new(timeout_ms),
                next_rid: AtomicI64::new(1),
                requests: DashMap::new(),
                conn_tx,
                connecting: tokio::sync::Mutex::new(()),
                active: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                monitor: Mutex::new(None),
                conn_handler: Mutex::new(None),
                error_handler: Mutex::new(Arc::new(LogErrorHandler)),
                sent: AtomicI64::new(0),
                received: AtomicI64::new(0),
            }),
        }
    }

    #[inline]
    pub fn client_id(&self) -> i64 {
        self.inner.client_id
    }

    /// Dial and start the connection tasks. The connection counts as
    /// active once the handshake response arrives, see
    /// [is_active](Self::is_active).
    pub async fn connect(&self) -> Result<(), RpcError> {
        let _g = self.inner.connecting.lock().await;
        if self.inner.conn_tx.borrow().is_some() {
            return Ok(());
        }
        self.inner.shutdown.store(false, Ordering::Release);
        let conn = RpcConn::open(&self.inner).await?;
        self.inner.conn_tx.send_replace(Some(conn));
        Ok(())
    }

    /// Drop the current connection and dial again with the same client
    /// id. Outstanding requests observe errors on their channels; they
    /// are not resumed.
    pub async fn reconnect(&self) -> Result<(), RpcError> {
        let _g = self.inner.connecting.lock().await;
        self.inner.reset(RpcIntErr::Closed.into());
        let conn = RpcConn::open(&self.inner).await?;
        self.inner.conn_tx.send_replace(Some(conn));
        Ok(())
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        let _g = self.inner.connecting.lock().await;
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.reset(RpcIntErr::Closed.into());
    }

    /// Adjust the per-request timeout applied to subsequent blocking
    /// calls, in milliseconds. 0 means fire-and-forget.
    pub fn set_timeout(&self, timeout_ms: i64) {
        self.inner.timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn set_monitor<F: Fn(&str, i64) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.monitor.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn set_connection_handler<F: Fn(&Value) + Send + Sync + 'static>(&self, f: F) {
        *self.inner.conn_handler.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn set_error_handler<H: ErrorHandler>(&self, h: H) {
        *self.inner.error_handler.lock().unwrap() = Arc::new(h);
    }

    pub fn stats(&self) -> HashMap<String, i64> {
        let inner = &self.inner;
        let mut m = HashMap::new();
        m.insert("requests".to_string(), inner.requests.len() as i64);
        m.insert("active".to_string(), inner.active.load(Ordering::Acquire) as i64);
        m.insert("client_id".to_string(), inner.client_id);
        m.insert("timeout_ms".to_string(), inner.timeout_ms.load(Ordering::Acquire));
        m.insert("frames_sent".to_string(), inner.sent.load(Ordering::Acquire));
        m.insert("frames_received".to_string(), inner.received.load(Ordering::Acquire));
        m
    }

    /// Invoke a single-call function and wait for its result up to the
    /// configured timeout. On expiry a best-effort CancelRequest goes out
    /// and `Timeout` is returned.
    pub async fn call_function(&self, name: &str, args: Option<Value>) -> Result<Value, RpcError> {
        let timeout_ms = self.inner.timeout_ms.load(Ordering::Acquire);
        let (ctx, handles) = self.inner.register(name, GET_OPEN, 1);
        let msg = proto::function_request(ctx.rid, name, args, timeout_ms);
        if let Err(e) = self.inner.send_msg(msg).await {
            self.inner.requests.remove(&ctx.rid);
            return Err(e);
        }
        if timeout_ms <= 0 {
            // no response expected
            self.inner.cancel_local(&ctx).await;
            return Err(ctx.error_or(RpcIntErr::Timeout));
        }
        match tokio::time::timeout(
            Duration::from_millis(timeout_ms as u64),
            handles.result_rx.recv(),
        )
        .await
        {
            Ok(Ok(res)) => {
                self.inner.monitor_call(name, ctx.elapsed_micros());
                self.inner.maybe_remove(&ctx);
                Ok(res)
            }
            Ok(Err(_)) => {
                self.inner.maybe_remove(&ctx);
                Err(ctx.error_or(RpcIntErr::NoResponse))
            }
            Err(_) => {
                self.inner.cancel_local(&ctx).await;
                Err(ctx.error_or(RpcIntErr::Timeout))
            }
        }
    }

    /// Open a server-to-client stream. The returned channel yields values
    /// until the stream ends; the rid addresses cancel and throttle
    /// frames.
    pub async fn get_stream(
        &self, name: &str, args: Option<Value>, receive_cap: usize,
    ) -> Result<(AsyncRx<Value>, i64), RpcError> {
        let timeout_ms = self.inner.timeout_ms.load(Ordering::Acquire);
        let (ctx, handles) = self.inner.register(name, GET_OPEN, receive_cap);
        let msg = proto::get_stream_request(ctx.rid, name, args, timeout_ms);
        if let Err(e) = self.inner.send_msg(msg).await {
            self.inner.requests.remove(&ctx.rid);
            return Err(e);
        }
        Ok((handles.result_rx, ctx.rid))
    }

    /// Open a client-to-server stream. Returns once the server reports
    /// StreamReady; an uploader task then forwards every value read from
    /// `put_rx` and ends the stream when `put_rx` closes.
    pub async fn put_stream(
        &self, name: &str, args: Option<Value>, put_rx: AsyncRx<Value>,
    ) -> Result<(), RpcError> {
        let timeout_ms = self.inner.timeout_ms.load(Ordering::Acquire);
        let (ctx, handles) = self.inner.register(name, PUT_OPEN, 1);
        let msg = proto::put_stream_request(ctx.rid, name, args, timeout_ms);
        if let Err(e) = self.inner.send_msg(msg).await {
            self.inner.requests.remove(&ctx.rid);
            return Err(e);
        }
        self.inner.wait_ready(&ctx, handles.ready_rx).await?;
        let inner = self.inner.clone();
        tokio::spawn(uploader(inner, ctx, put_rx));
        Ok(())
    }

    /// Open a bidirectional chat: an uploader forwards `put_rx`, the
    /// returned channel yields the peer's values.
    pub async fn chat(
        &self, name: &str, args: Option<Value>, receive_cap: usize, put_rx: AsyncRx<Value>,
    ) -> Result<(AsyncRx<Value>, i64), RpcError> {
        let timeout_ms = self.inner.timeout_ms.load(Ordering::Acquire);
        let (ctx, handles) = self.inner.register(name, GET_OPEN | PUT_OPEN, receive_cap);
        let msg = proto::chat_request(ctx.rid, name, args, timeout_ms);
        if let Err(e) = self.inner.send_msg(msg).await {
            self.inner.requests.remove(&ctx.rid);
            return Err(e);
        }
        self.inner.wait_ready(&ctx, handles.ready_rx).await?;
        let inner = self.inner.clone();
        let ctx2 = ctx.clone();
        tokio::spawn(uploader(inner, ctx2, put_rx));
        Ok((handles.result_rx, ctx.rid))
    }

    /// Ask the peer to abandon a request and close the local context.
    pub async fn cancel_request(&self, rid: i64) {
        let _ = self.inner.try_send_msg(proto::cancel_request(rid)).await;
        if let Some((_, ctx)) = self.inner.requests.remove(&rid) {
            ctx.set_error(RpcIntErr::Cancelled.into());
            ctx.close();
        }
    }

    /// Slow the producer of a server stream down by one more millisecond
    /// between values.
    pub async fn throttle_increase(&self, rid: i64) -> Result<(), RpcError> {
        if let Some(ctx) = self.inner.requests.get(&rid) {
            ctx.throttle_on_server.fetch_add(1, Ordering::AcqRel);
        }
        self.inner.try_send_msg(proto::throttle_increase(rid)).await
    }

    /// Undo one [throttle_increase](Self::throttle_increase).
    pub async fn throttle_decrease(&self, rid: i64) -> Result<(), RpcError> {
        if let Some(ctx) = self.inner.requests.get(&rid) {
            ctx.throttle_on_server.fetch_sub(1, Ordering::AcqRel);
        }
        self.inner.try_send_msg(proto::throttle_decrease(rid)).await
    }
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    client_id: i64,
    timeout_ms: AtomicI64,
    next_rid: AtomicI64,
    requests: DashMap<i64, Arc<RequestCtx>>,
    conn_tx: watch::Sender<Option<Arc<RpcConn>>>,
    connecting: tokio::sync::Mutex<()>,
    active: AtomicBool,
    shutdown: AtomicBool,
    monitor: Mutex<Option<PerformanceMonitor>>,
    conn_handler: Mutex<Option<ConnectionHandler>>,
    error_handler: Mutex<Arc<dyn ErrorHandler>>,
    sent: AtomicI64,
    received: AtomicI64,
}

impl ClientInner {
    #[inline]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[inline]
    pub fn client_id(&self) -> i64 {
        self.client_id
    }

    #[inline]
    pub fn error_handler(&self) -> Arc<dyn ErrorHandler> {
        self.error_handler.lock().unwrap().clone()
    }

    #[inline]
    pub fn count_sent(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn count_received(&self) {
        self.received.fetch_add(1, Ordering::AcqRel);
    }

    fn register(&self, name: &str, open: u32, receive_cap: usize) -> (Arc<RequestCtx>, RequestHandles) {
        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        let (ctx, handles) = RequestCtx::new(rid, name, open, receive_cap);
        self.requests.insert(rid, ctx.clone());
        (ctx, handles)
    }

    /// Wait for the connection cell to hold an open connection. Gives up
    /// only on a deliberate [RpcClient::close].
    async fn get_conn(&self) -> Result<Arc<RpcConn>, RpcError> {
        let mut rx = self.conn_tx.subscribe();
        let conn = match rx
            .wait_for(|c| c.is_some() || self.shutdown.load(Ordering::Acquire))
            .await
        {
            Ok(guard) => guard.clone(),
            Err(_) => return Err(RpcIntErr::Closed.into()),
        };
        match conn {
            Some(c) => Ok(c),
            None => Err(RpcIntErr::Closed.into()),
        }
    }

    pub(crate) async fn send_msg(&self, msg: Value) -> Result<(), RpcError> {
        let conn = self.get_conn().await?;
        conn.enqueue(msg).await
    }

    /// Best-effort send on whatever connection is present right now, used
    /// for cancel, throttle and stream teardown frames that must never
    /// wait for a reconnect.
    async fn try_send_msg(&self, msg: Value) -> Result<(), RpcError> {
        let conn = { self.conn_tx.borrow().clone() };
        match conn {
            Some(c) => c.enqueue(msg).await,
            None => Err(RpcIntErr::Closed.into()),
        }
    }

    fn monitor_call(&self, name: &str, elapsed_micros: i64) {
        let monitor = { self.monitor.lock().unwrap().clone() };
        if let Some(m) = monitor {
            m(name, elapsed_micros);
        }
    }

    fn maybe_remove(&self, ctx: &Arc<RequestCtx>) {
        if ctx.is_done() {
            self.requests.remove(&ctx.rid);
        }
    }

    async fn cancel_local(&self, ctx: &Arc<RequestCtx>) {
        let _ = self.try_send_msg(proto::cancel_request(ctx.rid)).await;
        ctx.close();
        self.requests.remove(&ctx.rid);
    }

    async fn wait_ready(
        &self, ctx: &Arc<RequestCtx>, ready_rx: oneshot::Receiver<()>,
    ) -> Result<(), RpcError> {
        let mut ms = self.timeout_ms.load(Ordering::Acquire);
        if ms <= 0 {
            ms = 30_000;
        }
        match tokio::time::timeout(Duration::from_millis(ms as u64), ready_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                // the context was torn down before the stream came up
                self.maybe_remove(ctx);
                Err(ctx.error_or(RpcIntErr::NoResponse))
            }
            Err(_) => {
                self.cancel_local(ctx).await;
                Err(ctx.error_or(RpcIntErr::Timeout))
            }
        }
    }

    /// Tear the client state down after a deliberate close or before a
    /// reconnect.
    fn reset(&self, err: RpcError) {
        self.active.store(false, Ordering::Release);
        let old = self.conn_tx.send_replace(None);
        if let Some(conn) = old {
            conn.close();
        }
        self.fail_outstanding(err);
    }

    /// Invoked by the connection tasks when the transport dies under us.
    pub(crate) fn on_conn_broken(&self, conn: &Arc<RpcConn>, err: RpcError) {
        let is_current = self
            .conn_tx
            .borrow()
            .as_ref()
            .map(|c| Arc::ptr_eq(c, conn))
            .unwrap_or(false);
        conn.close();
        if !is_current {
            return;
        }
        warn!("client {} connection broken: {}", self.client_id, err);
        self.active.store(false, Ordering::Release);
        self.conn_tx.send_replace(None);
        self.fail_outstanding(err);
    }

    fn fail_outstanding(&self, err: RpcError) {
        let rids: Vec<i64> = self.requests.iter().map(|r| *r.key()).collect();
        for rid in rids {
            if let Some((_, ctx)) = self.requests.remove(&rid) {
                ctx.set_error(err.clone());
                ctx.close();
            }
        }
    }

    /// Response demultiplexer, driven by the reader task.
    pub(crate) async fn process_response(&self, mut msg: Value) {
        let t = match proto::msg_type(&msg) {
            Some(t) => t,
            None => {
                self.error_handler().protocol_error(&msg, &RpcIntErr::Protocol.into());
                return;
            }
        };
        if t == MessageType::HandshakeResponse {
            self.active.store(true, Ordering::Release);
            debug!("client {} connection active", self.client_id);
            let handler = { self.conn_handler.lock().unwrap().clone() };
            if let Some(h) = handler {
                h(&msg);
            }
            return;
        }
        let rid = match proto::request_id(&msg) {
            Some(rid) => rid,
            None => {
                self.error_handler().protocol_error(&msg, &RpcIntErr::Protocol.into());
                return;
            }
        };
        let ctx = match self.requests.get(&rid).map(|r| r.value().clone()) {
            Some(ctx) => ctx,
            None => {
                // normal after a cancel or timeout raced the response
                debug!("client {} response for unknown request {}", self.client_id, rid);
                return;
            }
        };
        match t {
            MessageType::FunctionResponse => {
                let res = proto::take_field(&mut msg, proto::FIELD_RESULT).unwrap_or(Value::Nil);
                ctx.notify_result(res).await;
                ctx.try_get_close();
            }
            MessageType::ErrorResponse => {
                let text = proto::get_str(&msg, proto::FIELD_ERROR).unwrap_or("unknown");
                ctx.set_error(RpcError::Remote(text.to_string()));
                ctx.close();
            }
            MessageType::StreamReady => {
                ctx.notify_ready();
            }
            MessageType::StreamValue => {
                if let Some(val) = proto::take_field(&mut msg, proto::FIELD_VALUE) {
                    ctx.notify_result(val).await;
                }
            }
            MessageType::StreamEnd => {
                if let Some(val) = proto::take_field(&mut msg, proto::FIELD_VALUE) {
                    ctx.notify_result(val).await;
                }
                ctx.try_get_close();
            }
            _ => {
                // the request stays outstanding
                self.error_handler().stream_error(rid, &RpcIntErr::Protocol.into());
                return;
            }
        }
        self.maybe_remove(&ctx);
    }
}

/// Forwards a put-side channel onto the wire, one task per stream. In
/// flight uploads die with their connection, they are not resumed.
async fn uploader(inner: Arc<ClientInner>, ctx: Arc<RequestCtx>, put_rx: AsyncRx<Value>) {
    loop {
        match put_rx.recv().await {
            Ok(val) => {
                if !ctx.is_put_open() {
                    break;
                }
                if inner.try_send_msg(proto::stream_value(ctx.rid, val)).await.is_err() {
                    break;
                }
            }
            Err(_) => {
                let _ = inner.try_send_msg(proto::stream_end(ctx.rid, None)).await;
                break;
            }
        }
    }
    ctx.try_put_close();
    inner.maybe_remove(&ctx);
}
