//! One client connection: dial, outgoing-request task, response-reader
//! task.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossfire::{AsyncRx, MAsyncTx, mpsc};
use rmpv::Value;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use super::ClientInner;
use crate::codec::{MsgReader, MsgWriter};
use crate::error::*;
use crate::net;
use crate::proto;

pub(crate) struct RpcConn {
    send_tx: Mutex<Option<MAsyncTx<Value>>>,
    writer: Arc<MsgWriter<OwnedWriteHalf>>,
    shutting_down: AtomicBool,
}

impl RpcConn {
    /// Dial, start the writer task, enqueue the handshake, start the
    /// reader task.
    pub async fn open(inner: &Arc<ClientInner>) -> Result<Arc<Self>, RpcError> {
        let config = inner.config();
        let stream = net::dial(&config.address, config.socks5.as_deref()).await?;
        let (rd, wr) = stream.into_split();
        let writer = Arc::new(MsgWriter::new(wr, config.write_timeout));
        let (send_tx, send_rx) = mpsc::bounded_async(config.sending_cap);
        let conn = Arc::new(Self {
            send_tx: Mutex::new(Some(send_tx)),
            writer: writer.clone(),
            shutting_down: AtomicBool::new(false),
        });

        {
            let inner = inner.clone();
            let conn = conn.clone();
            tokio::spawn(async move { request_loop(writer, send_rx, inner, conn).await });
        }
        conn.enqueue(proto::handshake_request(inner.client_id())).await?;
        {
            let inner = inner.clone();
            let conn = conn.clone();
            let reader = MsgReader::new(rd);
            tokio::spawn(async move { response_loop(reader, inner, conn).await });
        }
        Ok(conn)
    }

    /// Queue a frame for the writer task. Blocks when the send channel is
    /// full.
    pub async fn enqueue(&self, msg: Value) -> Result<(), RpcError> {
        let tx = { self.send_tx.lock().unwrap().clone() };
        match tx {
            None => Err(RpcIntErr::Closed.into()),
            Some(tx) => tx.send(msg).await.map_err(|_| RpcIntErr::Closed.into()),
        }
    }

    /// Deliberate local close: the reader stops reporting errors after
    /// this.
    pub fn close(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.send_tx.lock().unwrap().take();
        let writer = self.writer.clone();
        tokio::spawn(async move { writer.shutdown().await });
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

async fn request_loop(
    writer: Arc<MsgWriter<OwnedWriteHalf>>, send_rx: AsyncRx<Value>, inner: Arc<ClientInner>,
    conn: Arc<RpcConn>,
) {
    while let Ok(msg) = send_rx.recv().await {
        if let Err(e) = writer.send(&msg).await {
            if !conn.is_shutting_down() {
                inner.error_handler().bad_connection(&e);
                inner.on_conn_broken(&conn, e);
            }
            return;
        }
        inner.count_sent();
    }
    debug!("client {} request loop exits", inner.client_id());
}

async fn response_loop(mut reader: MsgReader<OwnedReadHalf>, inner: Arc<ClientInner>, conn: Arc<RpcConn>) {
    loop {
        match reader.read_msg().await {
            Ok(msg) => {
                inner.count_received();
                inner.process_response(msg).await;
            }
            Err(e) => {
                if !conn.is_shutting_down() {
                    inner.error_handler().bad_connection(&e);
                    inner.on_conn_broken(&conn, e);
                } else {
                    debug!("client {} response loop exits", inner.client_id());
                }
                return;
            }
        }
    }
}
