use super::{BoxedTransport, Transporter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// TCP keepalive 首次探测时间
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// TCP keepalive 探测间隔
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// 建立 TCP 连接并设置 TCP_NODELAY 与 keepalive
pub async fn connect_tcp(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
        warn!("Failed to set TCP keepalive for {}: {}", addr, e);
    }

    Ok(stream)
}

/// 原始 TCP 传输
///
/// 经过上一跳拨号时不做任何封装，直接返回隧道连接
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransporter;

impl TcpTransporter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transporter for TcpTransporter {
    async fn dial(
        &self,
        addr: &str,
        underlying: Option<BoxedTransport>,
    ) -> Result<BoxedTransport> {
        if let Some(conn) = underlying {
            return Ok(conn);
        }

        debug!("Dialing {} via TCP", addr);
        let stream = connect_tcp(addr).await?;
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
