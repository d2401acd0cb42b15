//! The serving side: endpoint registry, accept loop, per-connection read
//! loops.
//!
//! ```no_run
//! use std::sync::Arc;
//! use value_rpc::server::RpcServer;
//! use value_rpc::{ServerConfig, TypeDef, Value};
//!
//! async fn serve() -> std::io::Result<()> {
//!     let server = Arc::new(RpcServer::bind("127.0.0.1:9999", ServerConfig::default()).await?);
//!     server
//!         .add_function("getName", TypeDef::Void, value_rpc::typedef::STRING.into(), |_args| async {
//!             Ok(Some(Value::from("Alex Shu")))
//!         })
//!         .expect("register");
//!     let runner = server.clone();
//!     tokio::spawn(async move { runner.run().await });
//!     // ... later
//!     server.close();
//!     Ok(())
//! }
//! ```

mod endpoint;
mod serving_client;
mod serving_request;

pub use endpoint::{EndpointShape, HandlerResult};

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossfire::{AsyncRx, MAsyncRx, MTx, mpmc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::pin_mut;
use rmpv::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::codec::{MsgReader, MsgWriter};
use crate::config::ServerConfig;
use crate::error::*;
use crate::proto::{self, MessageType};
use crate::typedef::TypeDef;
use endpoint::{ChatFn, Endpoint, EndpointKind, FunctionFn, InStreamFn, OutStreamFn};
use serving_client::ServingClient;

type Clients = Arc<DashMap<i64, Arc<ServingClient>>>;
type Registry = Arc<DashMap<String, Arc<Endpoint>>>;

/// A server publishing named endpoints of the four shapes. Endpoints stay
/// registered for the lifetime of the server, there is no unregister.
pub struct RpcServer {
    listener: TcpListener,
    config: ServerConfig,
    registry: Registry,
    clients: Clients,
    close_tx: Mutex<Option<MTx<()>>>,
    close_rx: MAsyncRx<()>,
    closed: AtomicBool,
}

impl RpcServer {
    /// Bind the listening socket eagerly. Accepting starts with [run](Self::run).
    pub async fn bind(address: &str, config: ServerConfig) -> io::Result<Self> {
        let listener = match TcpListener::bind(address).await {
            Ok(l) => l,
            Err(e) => {
                error!("bind addr {:?} err: {:?}", address, e);
                return Err(e);
            }
        };
        info!("start vRPC server on {:?}", address);
        let (tx, rx) = mpmc::unbounded_async::<()>();
        Ok(Self {
            listener,
            config,
            registry: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            close_tx: Mutex::new(Some(tx)),
            close_rx: rx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Register a single-call function with argument and result schemas.
    pub fn add_function<F, Fut>(
        &self, name: &str, args: TypeDef, res: TypeDef, f: F,
    ) -> Result<(), RpcError>
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Option<Value>>> + Send + 'static,
    {
        let f: FunctionFn = Box::new(move |args| Box::pin(f(args)));
        self.register(name, args, EndpointKind::Single { res, f })
    }

    /// Register a server-to-client stream. The handler returns the channel
    /// the streamer drains; the result schema is void.
    pub fn add_outgoing_stream<F, Fut>(&self, name: &str, args: TypeDef, f: F) -> Result<(), RpcError>
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<AsyncRx<Value>>> + Send + 'static,
    {
        let f: OutStreamFn = Box::new(move |args| Box::pin(f(args)));
        self.register(name, args, EndpointKind::OutStream(f))
    }

    /// Register a client-to-server stream. The handler receives the
    /// inbound channel and is expected to consume it asynchronously.
    pub fn add_incoming_stream<F, Fut>(&self, name: &str, args: TypeDef, f: F) -> Result<(), RpcError>
    where
        F: Fn(Option<Value>, AsyncRx<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        let f: InStreamFn = Box::new(move |args, in_rx| Box::pin(f(args, in_rx)));
        self.register(name, args, EndpointKind::InStream(f))
    }

    /// Register a bidirectional chat: inbound channel in, outbound channel
    /// returned.
    pub fn add_chat<F, Fut>(&self, name: &str, args: TypeDef, f: F) -> Result<(), RpcError>
    where
        F: Fn(Option<Value>, AsyncRx<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<AsyncRx<Value>>> + Send + 'static,
    {
        let f: ChatFn = Box::new(move |args, in_rx| Box::pin(f(args, in_rx)));
        self.register(name, args, EndpointKind::Chat(f))
    }

    fn register(&self, name: &str, args: TypeDef, kind: EndpointKind) -> Result<(), RpcError> {
        use dashmap::mapref::entry::Entry;
        match self.registry.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RpcIntErr::Exists.into()),
            Entry::Vacant(e) => {
                e.insert(Arc::new(Endpoint { name: name.to_string(), args, kind }));
                Ok(())
            }
        }
    }

    /// Accept connections until [close](Self::close) is called.
    pub async fn run(&self) {
        loop {
            let close_f = self.close_rx.recv().fuse();
            let accept_f = self.listener.accept().fuse();
            pin_mut!(close_f, accept_f);
            futures::select! {
                _ = close_f => {
                    debug!("listener exits");
                    return;
                }
                r = accept_f => match r {
                    Ok((stream, peer)) => {
                        info!("new connection from {}", peer);
                        let clients = self.clients.clone();
                        let registry = self.registry.clone();
                        let config = self.config.clone();
                        tokio::spawn(handle_connection(clients, registry, config, stream));
                    }
                    Err(e) => {
                        if self.closed.load(Ordering::Acquire) {
                            return;
                        }
                        warn!("accept err: {:?}", e);
                    }
                },
            }
        }
    }

    /// Stop accepting and close every serving client. Idempotent.
    pub fn close(&self) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return;
        }
        info!("shutdown vRPC server");
        for c in self.clients.iter() {
            c.value().close();
        }
        self.close_tx.lock().unwrap().take();
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_connection(
    clients: Clients, registry: Registry, config: ServerConfig, stream: TcpStream,
) {
    let peer = match stream.peer_addr() {
        Ok(a) => a.to_string(),
        Err(_) => "unknown".to_string(),
    };
    let (rd, wr) = stream.into_split();
    let mut reader = MsgReader::new(rd);
    let writer = Arc::new(MsgWriter::new(wr, config.write_timeout));

    let (cli, close_rx) =
        match handshake(&clients, &registry, &config, &mut reader, &writer).await {
            Ok(r) => r,
            Err(e) => {
                // wrong client, close the connection without a response
                warn!("handshake with {} err: {}", peer, e);
                writer.shutdown().await;
                return;
            }
        };

    read_loop(&cli, &mut reader, close_rx, &peer).await;
}

async fn handshake(
    clients: &Clients, registry: &Registry, config: &ServerConfig,
    reader: &mut MsgReader<OwnedReadHalf>, writer: &Arc<MsgWriter<OwnedWriteHalf>>,
) -> Result<(Arc<ServingClient>, MAsyncRx<()>), RpcError> {
    let req = reader.read_msg().await?;
    if proto::msg_type(&req) != Some(MessageType::HandshakeRequest) {
        return Err(RpcError::Text(format!("on handshake, wrong message type in {}", req)));
    }
    if !proto::valid_magic_and_version(&req) {
        return Err(RpcIntErr::Version.into());
    }
    let cid = match proto::get_i64(&req, proto::FIELD_CLIENT_ID) {
        Some(cid) => cid,
        None => return Err(RpcError::Text(format!("on handshake, no client id in {}", req))),
    };
    let cli = {
        let entry = clients
            .entry(cid)
            .or_insert_with(|| ServingClient::new(cid, registry.clone(), config.clone()));
        entry.value().clone()
    };
    let close_rx = cli.replace_conn(writer.clone());
    writer.send(&proto::handshake_response()).await?;
    Ok((cli, close_rx))
}

async fn read_loop(
    cli: &Arc<ServingClient>, reader: &mut MsgReader<OwnedReadHalf>, close_rx: MAsyncRx<()>,
    peer: &str,
) {
    loop {
        let close_f = close_rx.recv().fuse();
        let read_f = reader.read_msg().fuse();
        pin_mut!(close_f, read_f);
        futures::select! {
            _ = close_f => {
                debug!("reader for {} told to exit", peer);
                return;
            }
            r = read_f => match r {
                Ok(msg) => {
                    if let Err(e) = cli.process_request(msg).await {
                        // app level error, keep the connection
                        debug!("process request from {} err: {}", peer, e);
                    }
                }
                Err(e) => {
                    if e == RpcIntErr::Closed {
                        debug!("{} disconnected", peer);
                    } else {
                        warn!("read from {} err: {}", peer, e);
                    }
                    return;
                }
            },
        }
    }
}
