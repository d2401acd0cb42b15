//! Endpoint registry entries.
//!
//! An endpoint is a sum over the four shapes, each variant carrying its
//! own handler payload. Shape agreement with the incoming message type is
//! checked once, at dispatch.

use std::fmt;

use crossfire::AsyncRx;
use futures::future::BoxFuture;
use rmpv::Value;

use crate::error::RpcError;
use crate::typedef::TypeDef;

/// What a handler returns. An `Err` is surfaced to the caller as an
/// ErrorResponse carrying the error text.
pub type HandlerResult<T> = Result<T, RpcError>;

pub(crate) type FunctionFn =
    Box<dyn Fn(Option<Value>) -> BoxFuture<'static, HandlerResult<Option<Value>>> + Send + Sync>;

pub(crate) type OutStreamFn =
    Box<dyn Fn(Option<Value>) -> BoxFuture<'static, HandlerResult<AsyncRx<Value>>> + Send + Sync>;

pub(crate) type InStreamFn = Box<
    dyn Fn(Option<Value>, AsyncRx<Value>) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync,
>;

pub(crate) type ChatFn = Box<
    dyn Fn(Option<Value>, AsyncRx<Value>) -> BoxFuture<'static, HandlerResult<AsyncRx<Value>>>
        + Send
        + Sync,
>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointShape {
    Single,
    OutStream,
    InStream,
    Chat,
}

impl fmt::Display for EndpointShape {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Single => write!(f, "function"),
            Self::OutStream => write!(f, "outgoing stream"),
            Self::InStream => write!(f, "incoming stream"),
            Self::Chat => write!(f, "chat"),
        }
    }
}

pub(crate) enum EndpointKind {
    Single { res: TypeDef, f: FunctionFn },
    OutStream(OutStreamFn),
    InStream(InStreamFn),
    Chat(ChatFn),
}

pub(crate) struct Endpoint {
    pub name: String,
    pub args: TypeDef,
    pub kind: EndpointKind,
}

impl Endpoint {
    #[inline]
    pub fn shape(&self) -> EndpointShape {
        match &self.kind {
            EndpointKind::Single { .. } => EndpointShape::Single,
            EndpointKind::OutStream(_) => EndpointShape::OutStream,
            EndpointKind::InStream(_) => EndpointShape::InStream,
            EndpointKind::Chat(_) => EndpointShape::Chat,
        }
    }
}
