//! Outstanding request bookkeeping on the client.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Instant;

use crossfire::{AsyncRx, MAsyncTx, mpsc};
use rmpv::Value;
use tokio::sync::oneshot;

use crate::error::*;

pub(crate) const GET_OPEN: u32 = 1;
pub(crate) const PUT_OPEN: u32 = 2;

/// Per-request context. The 2-bit open state separates the receiving side
/// (`GET_OPEN`, result channel) from the sending side (`PUT_OPEN`,
/// uploader). The result channel is closed exactly once, on the
/// transition that clears `GET_OPEN`.
pub(crate) struct RequestCtx {
    pub rid: i64,
    pub name: String,
    start: Instant,
    state: AtomicU32,
    result_tx: Mutex<Option<MAsyncTx<Value>>>,
    ready_tx: Mutex<Option<oneshot::Sender<()>>>,
    err: Mutex<Option<RpcError>>,
    // Net throttle delta this client has asked the server to apply
    pub throttle_on_server: AtomicI64,
}

pub(crate) struct RequestHandles {
    pub result_rx: AsyncRx<Value>,
    pub ready_rx: oneshot::Receiver<()>,
}

impl RequestCtx {
    pub fn new(rid: i64, name: &str, open: u32, receive_cap: usize) -> (Arc<Self>, RequestHandles) {
        let (result_tx, result_rx) = mpsc::bounded_async(receive_cap.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = Arc::new(Self {
            rid,
            name: name.to_string(),
            start: Instant::now(),
            state: AtomicU32::new(open),
            result_tx: Mutex::new(Some(result_tx)),
            ready_tx: Mutex::new(Some(ready_tx)),
            err: Mutex::new(None),
            throttle_on_server: AtomicI64::new(0),
        });
        (ctx, RequestHandles { result_rx, ready_rx })
    }

    #[inline]
    pub fn is_get_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & GET_OPEN > 0
    }

    #[inline]
    pub fn is_put_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & PUT_OPEN > 0
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == 0
    }

    pub fn elapsed_micros(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    /// Deliver a value on the result channel, dropped once the get side
    /// has closed. Blocks when the receiver lags behind.
    pub async fn notify_result(&self, val: Value) {
        if !self.is_get_open() {
            return;
        }
        let tx = { self.result_tx.lock().unwrap().clone() };
        if let Some(tx) = tx {
            let _ = tx.send(val).await;
        }
    }

    /// Unblock the put-side sender waiting for StreamReady.
    pub fn notify_ready(&self) {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub fn set_error(&self, e: RpcError) {
        let mut guard = self.err.lock().unwrap();
        if guard.is_none() {
            *guard = Some(e);
        }
    }

    /// The stored error, or the given default.
    pub fn error_or(&self, default: RpcIntErr) -> RpcError {
        match self.err.lock().unwrap().clone() {
            Some(e) => e,
            None => default.into(),
        }
    }

    /// Clear `GET_OPEN`; the caller that wins the race closes the result
    /// channel. Returns true when the get side is closed after the call.
    pub fn try_get_close(&self) -> bool {
        loop {
            let st = self.state.load(Ordering::Acquire);
            if st & GET_OPEN == 0 {
                return true;
            }
            if self
                .state
                .compare_exchange(st, st & !GET_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.result_tx.lock().unwrap().take();
                return true;
            }
        }
    }

    /// Clear `PUT_OPEN`. The result channel is untouched, it belongs to
    /// the get side.
    pub fn try_put_close(&self) -> bool {
        loop {
            let st = self.state.load(Ordering::Acquire);
            if st & PUT_OPEN == 0 {
                return true;
            }
            if self
                .state
                .compare_exchange(st, st & !PUT_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Close both sides and drop the ready signal.
    pub fn close(&self) {
        self.try_get_close();
        self.try_put_close();
        self.ready_tx.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_transitions_single() {
        // single and out-stream requests open with the get side only
        let (ctx, handles) = RequestCtx::new(1, "getName", GET_OPEN, 1);
        assert!(ctx.is_get_open());
        assert!(!ctx.is_put_open());
        ctx.try_get_close();
        assert!(ctx.is_done());
        // channel observed closed exactly once
        assert!(handles.result_rx.try_recv().is_err());
        // second close is a no-op
        ctx.try_get_close();
        assert!(ctx.is_done());
    }

    #[test]
    fn test_flag_transitions_chat() {
        let (ctx, _handles) = RequestCtx::new(2, "echoChat", GET_OPEN | PUT_OPEN, 4);
        assert!(ctx.is_get_open());
        assert!(ctx.is_put_open());
        ctx.try_put_close();
        assert!(ctx.is_get_open());
        assert!(!ctx.is_done());
        ctx.try_get_close();
        assert!(ctx.is_done());
    }

    #[test]
    fn test_flag_transitions_put_only() {
        let (ctx, _handles) = RequestCtx::new(3, "uploadNames", PUT_OPEN, 1);
        assert!(!ctx.is_get_open());
        ctx.try_put_close();
        assert!(ctx.is_done());
    }

    #[test]
    fn test_error_slot() {
        let (ctx, _handles) = RequestCtx::new(4, "x", GET_OPEN, 1);
        assert_eq!(ctx.error_or(RpcIntErr::NoResponse), RpcIntErr::NoResponse);
        ctx.set_error(RpcError::Remote("boom".to_string()));
        // first error wins
        ctx.set_error(RpcError::Rpc(RpcIntErr::Timeout));
        assert_eq!(ctx.error_or(RpcIntErr::NoResponse), RpcError::Remote("boom".to_string()));
    }

    #[test]
    fn test_ready_signal_consumed_once() {
        let (ctx, handles) = RequestCtx::new(5, "x", PUT_OPEN, 1);
        ctx.notify_ready();
        let mut ready_rx = handles.ready_rx;
        assert!(ready_rx.try_recv().is_ok());
        // closing after the signal was consumed is fine
        ctx.close();
    }
}
