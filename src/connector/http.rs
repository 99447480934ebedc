use super::{Connector, Credentials};
use crate::transport::BoxedTransport;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// HTTP 响应头最大长度
const MAX_RESPONSE_HEADER_SIZE: usize = 16384;

/// HTTP CONNECT 隧道握手
#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    auth: Option<Credentials>,
}

impl HttpConnector {
    pub fn new(auth: Option<Credentials>) -> Self {
        Self { auth }
    }

    fn build_request(&self, target: &str) -> String {
        let mut request = format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: keep-alive\r\n"
        );
        if let Some(ref auth) = self.auth {
            let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password()));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        request.push_str("\r\n");
        request
    }
}

/// 逐字节读取到 `\r\n\r\n`，避免读走隧道中的后续数据
pub(crate) async fn read_header_block<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            anyhow::bail!("Unexpected EOF while reading HTTP header");
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
        if buf.len() >= limit {
            anyhow::bail!("HTTP header too long");
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, mut conn: BoxedTransport, target: &str) -> Result<BoxedTransport> {
        let request = self.build_request(target);
        conn.write_all(request.as_bytes()).await?;
        conn.flush().await?;

        let header = read_header_block(&mut conn, MAX_RESPONSE_HEADER_SIZE)
            .await
            .context("Failed to read CONNECT response")?;
        let header = String::from_utf8_lossy(&header);
        let status_line = header.lines().next().unwrap_or_default();

        let mut parts = status_line.split_whitespace();
        let version = parts.next().unwrap_or_default();
        let status = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            anyhow::bail!("Invalid CONNECT response: {}", status_line);
        }
        if status != "200" {
            anyhow::bail!("Proxy refused CONNECT to {}: {}", target, status_line);
        }

        debug!("HTTP CONNECT tunnel established to {}", target);
        Ok(conn)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
