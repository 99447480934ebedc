mod mux;
mod tcp;
mod tls;

pub use mux::MuxTransporter;
pub use tcp::{connect_tcp, TcpTransporter};
pub use tls::TlsTransporter;

use anyhow::Result;
use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

/// 传输层连接抽象
///
/// 统一封装 TCP、TLS、yamux 子流以及经过上一跳建立的隧道连接
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

// 为所有满足条件的类型自动实现 Transport
impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl std::fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Transport")
    }
}

/// 装箱后的传输层连接，每一跳独占上一跳的连接
pub type BoxedTransport = Pin<Box<dyn Transport>>;

/// 传输层拨号接口
///
/// `underlying` 为 `None` 时直接拨号 `addr`；否则 `underlying` 已经是通往 `addr`
/// 的隧道，传输层只需在其上叠加自己的封装（TLS、多路复用等）
#[async_trait]
pub trait Transporter: Send + Sync {
    /// 拨号并返回传输层连接
    async fn dial(&self, addr: &str, underlying: Option<BoxedTransport>)
        -> Result<BoxedTransport>;

    /// 传输名称（tcp, tls, mtcp, mtls）
    fn name(&self) -> &'static str;

    /// 是否为多路复用传输
    fn is_multiplexed(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn Transporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transporter({})", self.name())
    }
}
