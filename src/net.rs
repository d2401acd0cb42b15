//! Connection acquisition: direct TCP or through a SOCKS5 proxy.

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

use crate::error::*;

pub async fn dial(address: &str, socks5: Option<&str>) -> Result<TcpStream, RpcError> {
    match socks5 {
        Some(proxy) if !proxy.is_empty() => {
            match Socks5Stream::connect(proxy, address).await {
                Ok(stream) => Ok(stream.into_inner()),
                Err(e) => {
                    warn!("socks5 {} dial {} err: {:?}", proxy, address, e);
                    Err(RpcIntErr::Unreachable.into())
                }
            }
        }
        _ => match TcpStream::connect(address).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                warn!("dial {} err: {:?}", address, e);
                Err(RpcIntErr::Unreachable.into())
            }
        },
    }
}
