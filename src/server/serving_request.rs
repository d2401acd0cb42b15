//! Per-request state on the serving side.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use crossfire::{AsyncRx, MAsyncTx, mpsc};
use rmpv::Value;

use super::endpoint::EndpointShape;
use super::serving_client::ServingClient;
use crate::error::*;
use crate::proto::{self, MessageType};

pub(crate) struct ServingRequest {
    pub shape: EndpointShape,
    pub rid: i64,
    // Writer side of the inbound stream, present for InStream and Chat.
    // Taken out on close so the handler's receiver observes the end.
    in_tx: Mutex<Option<MAsyncTx<Value>>>,
    // Milliseconds slept between outbound stream values when positive
    throttle_outgoing: AtomicI64,
    closed: AtomicBool,
}

impl ServingRequest {
    /// The inbound receiver exists only for the shapes that consume a
    /// client stream.
    pub fn new(shape: EndpointShape, rid: i64, incoming_cap: usize) -> (Arc<Self>, Option<AsyncRx<Value>>) {
        let mut in_tx = None;
        let mut in_rx = None;
        if shape == EndpointShape::InStream || shape == EndpointShape::Chat {
            let (tx, rx) = mpsc::bounded_async(incoming_cap);
            in_tx = Some(tx);
            in_rx = Some(rx);
        }
        let sr = Arc::new(Self {
            shape,
            rid,
            in_tx: Mutex::new(in_tx),
            throttle_outgoing: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        });
        (sr, in_rx)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            // dropping the sender ends the handler's inbound receiver
            self.in_tx.lock().unwrap().take();
        }
    }

    /// Remove every trace of this request from the serving client.
    pub fn close_request(&self, cli: &ServingClient) {
        cli.remove_request(self.rid);
        self.close();
        cli.forget_cancel(self.rid);
    }

    /// State machine for frames addressed to an existing request.
    pub async fn serve_running(
        &self, t: MessageType, req: &mut Value, cli: &ServingClient,
    ) -> Result<(), RpcError> {
        match t {
            MessageType::CancelRequest => {
                self.close_request(cli);
                Ok(())
            }
            MessageType::StreamValue => match proto::take_field(req, proto::FIELD_VALUE) {
                Some(val) => self.push_incoming(val).await,
                None => Ok(()),
            },
            MessageType::StreamEnd => {
                if let Some(val) = proto::take_field(req, proto::FIELD_VALUE) {
                    let _ = self.push_incoming(val).await;
                }
                self.close_request(cli);
                Ok(())
            }
            MessageType::ThrottleIncrease => {
                self.throttle_outgoing.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            MessageType::ThrottleDecrease => {
                self.throttle_outgoing.fetch_sub(1, Ordering::AcqRel);
                Ok(())
            }
            _ => Err(RpcError::Text(format!(
                "unexpected message type {} for running request {}",
                t, self.rid
            ))),
        }
    }

    async fn push_incoming(&self, val: Value) -> Result<(), RpcError> {
        let tx = { self.in_tx.lock().unwrap().clone() };
        match tx {
            None => Err(RpcError::Text(format!(
                "no incoming stream in serving request {}",
                self.rid
            ))),
            // a full queue stalls the connection's read loop, which is the
            // backpressure signal towards the handler
            Some(tx) => tx.send(val).await.map_err(|_| RpcIntErr::Closed.into()),
        }
    }

    /// Drains the handler's outbound channel onto the wire. One task per
    /// OutStream/Chat request.
    pub async fn outgoing_streamer(self: Arc<Self>, out_rx: AsyncRx<Value>, cli: Arc<ServingClient>) {
        if cli.send(proto::stream_ready(self.rid)).await.is_err() {
            return;
        }
        loop {
            match out_rx.recv().await {
                Ok(val) => {
                    if self.is_closed() {
                        break;
                    }
                    if cli.send(proto::stream_value(self.rid, val)).await.is_err() {
                        return;
                    }
                    let th = self.throttle_outgoing.load(Ordering::Acquire);
                    if th > 0 {
                        tokio::time::sleep(Duration::from_millis(th as u64)).await;
                    }
                }
                Err(_) => break,
            }
        }
        // StreamEnd is the final frame under this rid
        let _ = cli.send(proto::stream_end(self.rid, None)).await;
        if self.shape == EndpointShape::OutStream {
            // a chat stays open, the client may still be sending
            self.close_request(&cli);
        }
    }
}
