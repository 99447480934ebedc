use super::{split_host_port, Connector};
use crate::transport::BoxedTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_CMD_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 0x5A;

/// SOCKS4 / SOCKS4a CONNECT 握手
///
/// SOCKS4 只能携带 IPv4 地址，域名在本地解析；
/// SOCKS4a 把域名交给代理解析
#[derive(Debug, Clone)]
pub struct Socks4Connector {
    user_id: String,
    remote_resolve: bool,
}

impl Socks4Connector {
    pub fn new(user_id: Option<String>, remote_resolve: bool) -> Self {
        Self {
            user_id: user_id.unwrap_or_default(),
            remote_resolve,
        }
    }

    async fn build_request(&self, target: &str) -> Result<BytesMut> {
        let (host, port) = split_host_port(target)?;

        let mut buf = BytesMut::with_capacity(16 + host.len() + self.user_id.len());
        buf.put_u8(SOCKS4_VERSION);
        buf.put_u8(SOCKS4_CMD_CONNECT);
        buf.put_u16(port);

        let domain = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                buf.put_slice(&ip.octets());
                None
            }
            Ok(IpAddr::V6(_)) => anyhow::bail!("SOCKS4 does not support IPv6 target {}", target),
            Err(_) if self.remote_resolve => {
                // 0.0.0.x (x != 0) 表示由代理解析域名
                buf.put_slice(&[0, 0, 0, 1]);
                Some(host)
            }
            Err(_) => {
                let ip = tokio::net::lookup_host((host, port))
                    .await
                    .with_context(|| format!("Failed to resolve {}", host))?
                    .find_map(|addr| match addr.ip() {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    })
                    .ok_or_else(|| anyhow::anyhow!("No IPv4 address for {}", host))?;
                buf.put_slice(&Ipv4Addr::octets(&ip));
                None
            }
        };

        buf.put_slice(self.user_id.as_bytes());
        buf.put_u8(0);
        if let Some(domain) = domain {
            buf.put_slice(domain.as_bytes());
            buf.put_u8(0);
        }
        Ok(buf)
    }
}

#[async_trait]
impl Connector for Socks4Connector {
    async fn connect(&self, mut conn: BoxedTransport, target: &str) -> Result<BoxedTransport> {
        let request = self.build_request(target).await?;
        conn.write_all(&request).await?;
        conn.flush().await?;

        let mut reply = [0u8; 8];
        conn.read_exact(&mut reply)
            .await
            .context("Failed to read SOCKS4 reply")?;
        if reply[1] != SOCKS4_GRANTED {
            anyhow::bail!(
                "SOCKS4 proxy rejected CONNECT to {} (code {:#04x})",
                target,
                reply[1]
            );
        }

        debug!("SOCKS4 tunnel established to {}", target);
        Ok(conn)
    }

    fn name(&self) -> &'static str {
        if self.remote_resolve {
            "socks4a"
        } else {
            "socks4"
        }
    }
}
