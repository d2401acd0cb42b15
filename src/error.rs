use std::fmt;

/// "rpc_" prefix is reserved for errors raised by the runtime itself
pub const RPC_ERR_PREFIX: &'static str = "rpc_";

/// Internal error taxonomy of the rpc runtime.
///
/// Transport and lifecycle errors surface through this enum; anything the
/// peer reports as text arrives as [RpcError::Remote] instead.
#[derive(strum::Display, strum::EnumString, strum::AsRefStr, PartialEq, Clone, Copy, thiserror::Error)]
pub enum RpcIntErr {
    /// Dial or proxy handshake failed
    #[strum(serialize = "rpc_unreachable")]
    Unreachable,
    /// Read/write failed, write deadline exceeded included
    #[strum(serialize = "rpc_io_err")]
    IO,
    /// Connection or channel already closed
    #[strum(serialize = "rpc_closed")]
    Closed,
    /// Request timeout
    #[strum(serialize = "rpc_timeout")]
    Timeout,
    /// Result channel closed without a response
    #[strum(serialize = "rpc_no_response")]
    NoResponse,
    /// Malformed or unexpected message
    #[strum(serialize = "rpc_protocol")]
    Protocol,
    /// Magic or version check failed
    #[strum(serialize = "rpc_invalid_ver")]
    Version,
    #[strum(serialize = "rpc_encode")]
    Encode,
    #[strum(serialize = "rpc_decode")]
    Decode,
    /// Endpoint name already registered
    #[strum(serialize = "rpc_exists")]
    Exists,
    /// Request cancelled locally or by the peer
    #[strum(serialize = "rpc_cancelled")]
    Cancelled,
}

// The default Debug derive would ignore the strum string form
impl fmt::Debug for RpcIntErr {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<std::io::Error> for RpcIntErr {
    #[inline(always)]
    fn from(_e: std::io::Error) -> Self {
        Self::IO
    }
}

/// The error type seen on the public API surface.
#[derive(Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// Raised by the runtime
    #[error("{0}")]
    Rpc(RpcIntErr),
    /// Error text received from the peer in an ErrorResponse
    #[error("remote error: {0}")]
    Remote(String),
    /// Locally produced text, e.g. returned by a server handler
    #[error("{0}")]
    Text(String),
}

impl fmt::Debug for RpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<RpcIntErr> for RpcError {
    #[inline(always)]
    fn from(e: RpcIntErr) -> Self {
        Self::Rpc(e)
    }
}

impl From<std::io::Error> for RpcError {
    #[inline(always)]
    fn from(_e: std::io::Error) -> Self {
        Self::Rpc(RpcIntErr::IO)
    }
}

impl From<&str> for RpcError {
    #[inline(always)]
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for RpcError {
    #[inline(always)]
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl std::cmp::PartialEq<RpcIntErr> for RpcError {
    #[inline]
    fn eq(&self, other: &RpcIntErr) -> bool {
        if let Self::Rpc(e) = self {
            return e == other;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_internal_error_strings() {
        let s = RpcIntErr::Timeout.as_ref();
        assert_eq!(s, "rpc_timeout");
        assert!(s.starts_with(RPC_ERR_PREFIX));
        let e = RpcIntErr::from_str(s).expect("parse");
        assert_eq!(e, RpcIntErr::Timeout);
        assert!(RpcIntErr::from_str("timeoutss").is_err());
    }

    #[test]
    fn test_rpc_error_forms() {
        let e = RpcError::from(RpcIntErr::IO);
        assert_eq!(e, RpcIntErr::IO);
        let e = RpcError::from("boom");
        assert_eq!(format!("{}", e), "boom");
        let e = RpcError::Remote("division by zero".to_string());
        assert_eq!(format!("{}", e), "remote error: division by zero");
    }
}
