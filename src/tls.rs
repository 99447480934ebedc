//! TLS 类传输（`tls`、`mtls`）的客户端配置

use crate::node::NodeSpec;
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls;

/// 节点上的 TLS 参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    /// 只信任该 PEM 文件中的 CA
    pub ca: Option<PathBuf>,
    /// 不校验服务端证书
    pub skip_verify: bool,
    /// 覆盖由节点地址推导的 SNI
    pub sni: Option<String>,
}

impl TlsOptions {
    /// 读取 `ca`、`sni`、`skip_verify` 参数；`secure=false` 等同于 `skip_verify=true`
    pub fn from_spec(spec: &NodeSpec) -> Self {
        let skip_verify = spec
            .param_bool("skip_verify")
            .or_else(|| spec.param_bool("secure").map(|secure| !secure))
            .unwrap_or(false);
        Self {
            ca: spec.param("ca").map(PathBuf::from),
            skip_verify,
            sni: spec.param("sni").map(str::to_string),
        }
    }

    pub fn server_name(&self) -> Result<Option<ServerName<'static>>> {
        self.sni.as_deref().map(server_name).transpose()
    }
}

/// 构造客户端配置
///
/// 优先级：`ca` > 跳过校验 > 系统根证书
pub fn client_config(options: &TlsOptions) -> Result<Arc<rustls::ClientConfig>> {
    let roots = match options.ca {
        Some(ref path) => ca_root_store(path)?,
        None if options.skip_verify => RootCertStore::empty(),
        None => native_root_store(),
    };

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if options.skip_verify {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyCertificate));
    }
    Ok(Arc::new(config))
}

fn ca_root_store(path: &Path) -> Result<RootCertStore> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CA file {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<CertificateDer<'static>>, _>>()
        .with_context(|| format!("Failed to parse CA file {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in CA file {}", path.display());
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).context("Failed to add CA certificate")?;
    }
    Ok(roots)
}

fn native_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
    roots
}

/// 由主机名或 IP 生成 SNI，IPv6 可带方括号
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).with_context(|| format!("Invalid server name: {}", host))
}

/// `skip_verify` 节点使用
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        use SignatureScheme::*;
        vec![
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            ED25519,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
        ]
    }
}
