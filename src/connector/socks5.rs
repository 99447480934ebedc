//! SOCKS5 客户端握手 (RFC 1928 / RFC 1929)

use super::{split_host_port, Connector, Credentials};
use crate::transport::BoxedTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

pub(crate) const SOCKS5_VERSION: u8 = 0x05;
pub(crate) const METHOD_NO_AUTH: u8 = 0x00;
pub(crate) const METHOD_USER_PASS: u8 = 0x02;
pub(crate) const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub(crate) const CMD_CONNECT: u8 = 0x01;
pub(crate) const CMD_UDP_ASSOCIATE: u8 = 0x03;
/// 扩展命令：在当前 TCP 连接上分帧传输 UDP 数据报
pub(crate) const CMD_UDP_TUNNEL: u8 = 0xF3;
pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 CONNECT 握手，另支持 UDP 隧道
#[derive(Debug, Clone, Default)]
pub struct Socks5Connector {
    auth: Option<Credentials>,
}

impl Socks5Connector {
    pub fn new(auth: Option<Credentials>) -> Self {
        Self { auth }
    }
}

/// 编码 SOCKS5 地址（ATYP + ADDR + PORT）
pub(crate) fn encode_address(buf: &mut BytesMut, target: &str) -> Result<()> {
    let (host, port) = split_host_port(target)?;

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                anyhow::bail!("Domain name too long: {}", host);
            }
            buf.put_u8(ATYP_DOMAIN);
            buf.put_u8(host.len() as u8);
            buf.put_slice(host.as_bytes());
        }
    }
    buf.put_u16(port);
    Ok(())
}

/// 读取 SOCKS5 地址并格式化为 `host:port`
pub(crate) async fn read_address<R>(reader: &mut R, atyp: u8) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            reader.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            if len == 0 {
                anyhow::bail!("Invalid SOCKS5 domain name length: {}", len);
            }
            let mut domain = vec![0u8; len];
            reader.read_exact(&mut domain).await?;
            String::from_utf8(domain).context("SOCKS5 domain is not valid UTF-8")?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            reader.read_exact(&mut addr).await?;
            format!("[{}]", std::net::Ipv6Addr::from(addr))
        }
        _ => anyhow::bail!("Unsupported address type: {}", atyp),
    };
    let port = reader.read_u16().await?;
    Ok(format!("{}:{}", host, port))
}

/// SOCKS5 应答码的可读描述
fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

impl Socks5Connector {
    /// 方法协商及可选的用户名/密码认证
    async fn negotiate(&self, conn: &mut BoxedTransport) -> Result<()> {
        let greeting: &[u8] = if self.auth.is_some() {
            &[SOCKS5_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[SOCKS5_VERSION, 1, METHOD_NO_AUTH]
        };
        conn.write_all(greeting).await?;
        conn.flush().await?;

        let mut choice = [0u8; 2];
        conn.read_exact(&mut choice)
            .await
            .context("Failed to read SOCKS5 method selection")?;
        if choice[0] != SOCKS5_VERSION {
            anyhow::bail!("Unsupported SOCKS version from proxy: {}", choice[0]);
        }

        match choice[1] {
            METHOD_NO_AUTH => Ok(()),
            METHOD_USER_PASS => {
                let auth = self
                    .auth
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("Proxy requires authentication"))?;
                let username = auth.username.as_bytes();
                let password = auth.password().as_bytes();
                if username.len() > 255 || password.len() > 255 {
                    anyhow::bail!("SOCKS5 username or password too long");
                }

                let mut buf = BytesMut::with_capacity(3 + username.len() + password.len());
                buf.put_u8(0x01);
                buf.put_u8(username.len() as u8);
                buf.put_slice(username);
                buf.put_u8(password.len() as u8);
                buf.put_slice(password);
                conn.write_all(&buf).await?;
                conn.flush().await?;

                let mut status = [0u8; 2];
                conn.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    anyhow::bail!("SOCKS5 authentication rejected");
                }
                Ok(())
            }
            METHOD_NO_ACCEPTABLE => anyhow::bail!("Proxy accepted none of the offered methods"),
            other => anyhow::bail!("Proxy selected unsupported method: {}", other),
        }
    }

    /// 发送请求并读取应答，返回代理报告的绑定地址
    async fn request(
        &self,
        conn: &mut BoxedTransport,
        command: u8,
        target: &str,
    ) -> Result<String> {
        let mut request = BytesMut::with_capacity(262);
        request.put_slice(&[SOCKS5_VERSION, command, 0x00]);
        encode_address(&mut request, target)?;
        conn.write_all(&request).await?;
        conn.flush().await?;

        let mut reply = [0u8; 4];
        conn.read_exact(&mut reply)
            .await
            .context("Failed to read SOCKS5 reply")?;
        if reply[0] != SOCKS5_VERSION {
            anyhow::bail!("Invalid SOCKS5 reply version: {}", reply[0]);
        }
        if reply[1] != 0x00 {
            let name = if command == CMD_CONNECT {
                "CONNECT"
            } else {
                "UDP tunnel"
            };
            anyhow::bail!(
                "SOCKS5 proxy rejected {} to {}: {}",
                name,
                target,
                reply_message(reply[1])
            );
        }
        read_address(conn, reply[3]).await
    }
}

#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(&self, mut conn: BoxedTransport, target: &str) -> Result<BoxedTransport> {
        self.negotiate(&mut conn).await?;
        let bound = self.request(&mut conn, CMD_CONNECT, target).await?;
        debug!("SOCKS5 tunnel established to {} (bound {})", target, bound);
        Ok(conn)
    }

    fn supports_datagram(&self) -> bool {
        true
    }

    async fn connect_datagram(&self, mut conn: BoxedTransport) -> Result<BoxedTransport> {
        self.negotiate(&mut conn).await?;
        let bound = self.request(&mut conn, CMD_UDP_TUNNEL, "0.0.0.0:0").await?;
        debug!("SOCKS5 UDP tunnel established (bound {})", bound);
        Ok(conn)
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_address_variants() {
        let mut buf = BytesMut::new();
        encode_address(&mut buf, "10.0.0.1:80").unwrap();
        assert_eq!(&buf[..], &[ATYP_IPV4, 10, 0, 0, 1, 0, 80]);

        let mut buf = BytesMut::new();
        encode_address(&mut buf, "example.com:443").unwrap();
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "example.com".len());
        assert_eq!(&buf[buf.len() - 2..], &443u16.to_be_bytes());

        let mut buf = BytesMut::new();
        encode_address(&mut buf, "[::1]:53").unwrap();
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf.len(), 1 + 16 + 2);
    }

    #[tokio::test]
    async fn test_connect_with_auth() {
        let (client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, METHOD_NO_AUTH, METHOD_USER_PASS]);
            server.write_all(&[5, METHOD_USER_PASS]).await.unwrap();

            let mut auth = [0u8; 1 + 1 + 4 + 1 + 6];
            server.read_exact(&mut auth).await.unwrap();
            assert_eq!(&auth[2..6], b"user");
            assert_eq!(&auth[7..], b"secret");
            server.write_all(&[1, 0]).await.unwrap();

            let mut head = [0u8; 4];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head[1], CMD_CONNECT);
            let target = read_address(&mut server, head[3]).await.unwrap();
            assert_eq!(target, "example.com:443");

            server
                .write_all(&[5, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            server
        });

        let connector = Socks5Connector::new(Some(Credentials::new("user", Some("secret".into()))));
        let result = connector.connect(Box::pin(client), "example.com:443").await;
        assert!(result.is_ok());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, METHOD_NO_AUTH]).await.unwrap();

            let mut head = [0u8; 4];
            server.read_exact(&mut head).await.unwrap();
            let _ = read_address(&mut server, head[3]).await.unwrap();
            server
                .write_all(&[5, 0x05, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let result = Socks5Connector::new(None)
            .connect(Box::pin(client), "10.1.1.1:22")
            .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_connect_datagram_sends_tunnel_command() {
        let (client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, METHOD_NO_AUTH]).await.unwrap();

            let mut head = [0u8; 4];
            server.read_exact(&mut head).await.unwrap();
            assert_eq!(head[1], CMD_UDP_TUNNEL);
            assert_eq!(read_address(&mut server, head[3]).await.unwrap(), "0.0.0.0:0");
            server
                .write_all(&[5, 0, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            server
        });

        let connector = Socks5Connector::new(None);
        assert!(connector.supports_datagram());
        assert!(connector.connect_datagram(Box::pin(client)).await.is_ok());
        server_task.await.unwrap();
    }
}
