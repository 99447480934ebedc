mod forward;
pub(crate) mod http;
mod socks4;
pub(crate) mod socks5;

pub use forward::ForwardConnector;
pub use http::HttpConnector;
pub use socks4::Socks4Connector;
pub use socks5::Socks5Connector;

use crate::transport::BoxedTransport;
use anyhow::Result;
use async_trait::async_trait;

/// 协议握手接口
///
/// 在已经拨通的传输层连接上请求对端转发到 `target`，
/// 成功后返回的连接即为通往 `target` 的透明管道
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, conn: BoxedTransport, target: &str) -> Result<BoxedTransport>;

    /// 是否支持 [`Connector::connect_datagram`]
    fn supports_datagram(&self) -> bool {
        false
    }

    /// 请求对端建立 UDP 隧道
    ///
    /// 返回的连接按 [`crate::datagram::Datagram`] 的帧格式收发数据报，目的地址由每个数据报携带
    async fn connect_datagram(&self, conn: BoxedTransport) -> Result<BoxedTransport> {
        drop(conn);
        anyhow::bail!("{} proxies cannot relay datagrams", self.name())
    }

    /// 协议名称
    fn name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connector({})", self.name())
    }
}

/// 用户名/密码认证信息
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }
}

// 避免在日志中输出密码
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// 拆分 `host:port`，支持 `[ipv6]:port`
pub fn split_host_port(addr: &str) -> Result<(&str, u16)> {
    let colon = addr
        .rfind(':')
        .ok_or_else(|| anyhow::anyhow!("Missing port in address: {}", addr))?;
    let host = &addr[..colon];
    let port = addr[colon + 1..]
        .parse::<u16>()
        .map_err(|_| anyhow::anyhow!("Invalid port in address: {}", addr))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        anyhow::bail!("Missing host in address: {}", addr);
    }
    Ok((host, port))
}
