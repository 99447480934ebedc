use super::{connect_tcp, BoxedTransport, Transporter};
use crate::tls::server_name;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// TLS 传输
///
/// 直接拨号时先建立 TCP 连接；经过上一跳时在隧道上完成 TLS 握手
pub struct TlsTransporter {
    connector: TlsConnector,
    sni: Option<ServerName<'static>>,
}

impl TlsTransporter {
    /// `sni` 为 `None` 时使用拨号地址的主机部分
    pub fn new(connector: TlsConnector, sni: Option<ServerName<'static>>) -> Self {
        Self { connector, sni }
    }

    fn server_name_for(&self, addr: &str) -> Result<ServerName<'static>> {
        if let Some(ref sni) = self.sni {
            return Ok(sni.clone());
        }
        let host = match addr.rfind(':') {
            Some(pos) => &addr[..pos],
            None => addr,
        };
        server_name(host)
    }
}

#[async_trait]
impl Transporter for TlsTransporter {
    async fn dial(
        &self,
        addr: &str,
        underlying: Option<BoxedTransport>,
    ) -> Result<BoxedTransport> {
        let server_name = self.server_name_for(addr)?;

        let conn: BoxedTransport = match underlying {
            Some(conn) => conn,
            None => Box::pin(connect_tcp(addr).await?),
        };

        debug!("Starting TLS handshake with {}", addr);
        let tls_stream = self
            .connector
            .connect(server_name, conn)
            .await
            .with_context(|| format!("TLS handshake with {} failed", addr))?;

        debug!("TLS connection established to {}", addr);
        Ok(Box::pin(tls_stream))
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{client_config, TlsOptions};

    fn connector() -> TlsConnector {
        let options = TlsOptions {
            skip_verify: true,
            ..TlsOptions::default()
        };
        TlsConnector::from(client_config(&options).unwrap())
    }

    #[test]
    fn test_server_name_from_addr() {
        let transporter = TlsTransporter::new(connector(), None);

        let name = transporter.server_name_for("example.com:443").unwrap();
        assert_eq!(name, ServerName::try_from("example.com").unwrap());

        let name = transporter.server_name_for("[::1]:443").unwrap();
        assert_eq!(name, ServerName::try_from("::1").unwrap());
    }

    #[test]
    fn test_explicit_sni_wins() {
        let sni = ServerName::try_from("cdn.example.org").unwrap();
        let transporter = TlsTransporter::new(connector(), Some(sni.clone()));

        assert_eq!(transporter.server_name_for("10.0.0.1:443").unwrap(), sni);
    }
}
