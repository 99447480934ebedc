//! HTTP 代理入站：CONNECT 隧道与普通请求转发

use crate::connector::http::read_header_block;
use crate::connector::Credentials;
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// HTTP 请求头最大长度
const MAX_REQUEST_HEADER_SIZE: usize = 16384;

/// 解析后的 HTTP 请求头
#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub target: String,
    /// 保持原始顺序，键为小写
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// 入站请求解析结果
#[derive(Debug)]
pub(crate) enum HttpInbound {
    /// CONNECT，拨号成功后回复 200
    Connect { target: String },
    /// 普通请求，拨号成功后把改写后的请求头发给远端
    Forward { target: String, head: Vec<u8> },
}

impl HttpInbound {
    pub fn target(&self) -> &str {
        match self {
            HttpInbound::Connect { target } | HttpInbound::Forward { target, .. } => target,
        }
    }
}

pub(crate) fn parse_request(raw: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        bail!("Invalid HTTP request line: {}", request_line);
    };

    let headers = lines
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    Ok(HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        headers,
    })
}

fn check_auth(request: &HttpRequest, expected: &Credentials) -> bool {
    let Some(value) = request.header("proxy-authorization") else {
        return false;
    };
    let Some(token) = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
    else {
        return false;
    };
    match STANDARD.decode(token.trim()) {
        Ok(decoded) => {
            decoded == format!("{}:{}", expected.username, expected.password()).as_bytes()
        }
        Err(_) => false,
    }
}

/// 普通代理请求：绝对 URL 改写为相对路径，去掉逐跳头部
fn rewrite_forward(request: &HttpRequest) -> Result<(String, Vec<u8>)> {
    let (target, path) = if request.target.starts_with("http://") {
        let url = url::Url::parse(&request.target).context("Invalid request URL")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("No host in URL {}", request.target))?;
        let port = url.port_or_known_default().unwrap_or(80);
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        (format!("{}:{}", host, port), path)
    } else if let Some(host) = request.header("host") {
        (with_default_port(host, 80), request.target.clone())
    } else {
        bail!("Cannot determine target of HTTP request {}", request.target);
    };

    let mut head = format!("{} {} HTTP/1.1\r\n", request.method, path).into_bytes();
    for (key, value) in &request.headers {
        if !matches!(
            key.as_str(),
            "proxy-connection" | "proxy-authorization" | "connection" | "keep-alive"
        ) {
            head.extend(format!("{}: {}\r\n", key, value).into_bytes());
        }
    }
    head.extend(b"Connection: close\r\n\r\n");

    Ok((target, head))
}

fn with_default_port(host: &str, port: u16) -> String {
    let has_port = match host.rfind(']') {
        Some(end) => host[end..].contains(':'),
        None => host.contains(':'),
    };
    if has_port {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// 读取并解析入站请求；认证失败时回复 407
pub(crate) async fn accept<S>(stream: &mut S, auth: Option<&Credentials>) -> Result<HttpInbound>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = read_header_block(stream, MAX_REQUEST_HEADER_SIZE).await?;
    let request = parse_request(&raw)?;

    if let Some(expected) = auth {
        if !check_auth(&request, expected) {
            stream
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"chain-tunnel\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await?;
            stream.flush().await?;
            bail!("HTTP proxy authentication failed");
        }
    }

    if request.method.eq_ignore_ascii_case("CONNECT") {
        return Ok(HttpInbound::Connect {
            target: with_default_port(&request.target, 443),
        });
    }

    let (target, head) = rewrite_forward(&request)?;
    Ok(HttpInbound::Forward { target, head })
}

pub(crate) async fn send_established<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    stream.flush().await
}

pub(crate) async fn send_bad_gateway<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_request() {
        let raw = b"GET http://a.com/x HTTP/1.1\r\nHost: a.com\r\nX-Test:  1 \r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "http://a.com/x");
        assert_eq!(request.header("host"), Some("a.com"));
        assert_eq!(request.header("x-test"), Some("1"));
        assert!(parse_request(b"\r\n\r\n").is_err());
    }

    #[test]
    fn test_rewrite_absolute_url() {
        let request = parse_request(
            b"GET http://example.com:8080/path?q=1 HTTP/1.1\r\n\
              Host: example.com:8080\r\n\
              Proxy-Connection: keep-alive\r\n\r\n",
        )
        .unwrap();
        let (target, head) = rewrite_forward(&request).unwrap();
        let head = String::from_utf8(head).unwrap();

        assert_eq!(target, "example.com:8080");
        assert!(head.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(head.contains("host: example.com:8080\r\n"));
        assert!(!head.to_ascii_lowercase().contains("proxy-connection"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn test_rewrite_relative_uses_host_header() {
        let request = parse_request(b"GET /index.html HTTP/1.1\r\nHost: intranet\r\n\r\n").unwrap();
        let (target, _) = rewrite_forward(&request).unwrap();
        assert_eq!(target, "intranet:80");

        let request = parse_request(b"GET /index.html HTTP/1.1\r\n\r\n").unwrap();
        assert!(rewrite_forward(&request).is_err());
    }

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("a.com", 443), "a.com:443");
        assert_eq!(with_default_port("a.com:8443", 443), "a.com:8443");
        assert_eq!(with_default_port("[::1]", 443), "[::1]:443");
        assert_eq!(with_default_port("[::1]:80", 443), "[::1]:80");
    }

    #[tokio::test]
    async fn test_accept_connect() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nhello")
            .await
            .unwrap();

        let inbound = accept(&mut server, None).await.unwrap();
        assert!(matches!(inbound, HttpInbound::Connect { .. }));
        assert_eq!(inbound.target(), "example.com:443");

        // 请求头之后的数据留在连接中
        let mut rest = [0u8; 5];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");
    }

    #[tokio::test]
    async fn test_accept_auth_required() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let creds = Credentials::new("user", Some("pass".into()));

        client
            .write_all(b"CONNECT db:5432 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(accept(&mut server, Some(&creds)).await.is_err());

        let mut buf = vec![0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 407");
    }

    #[tokio::test]
    async fn test_accept_auth_ok() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let creds = Credentials::new("user", Some("pass".into()));

        client
            .write_all(
                b"CONNECT db:5432 HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n",
            )
            .await
            .unwrap();
        let inbound = accept(&mut server, Some(&creds)).await.unwrap();
        assert_eq!(inbound.target(), "db:5432");
    }
}
