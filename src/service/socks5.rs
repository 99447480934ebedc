//! SOCKS5 入站（服务端握手）

use crate::connector::socks5::{
    encode_address, read_address, CMD_CONNECT, CMD_UDP_ASSOCIATE, CMD_UDP_TUNNEL,
    METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, METHOD_USER_PASS, SOCKS5_VERSION,
};
use crate::connector::Credentials;
use crate::error::TunnelError;
use anyhow::{bail, Result};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const REPLY_SUCCEEDED: u8 = 0x00;
pub(crate) const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub(crate) const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// 客户端请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Connect(String),
    /// 经本地 UDP 端口转发数据报
    UdpAssociate,
    /// 在当前连接上分帧转发数据报
    UdpTunnel,
}

/// 完成方法协商（及可选的用户名/密码认证）并读取请求
pub(crate) async fn accept<S>(stream: &mut S, auth: Option<&Credentials>) -> Result<Command>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version: {}", header[0]);
    }
    let nmethods = header[1] as usize;
    if nmethods == 0 {
        bail!("Invalid number of methods: {}", nmethods);
    }
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    let wanted = if auth.is_some() {
        METHOD_USER_PASS
    } else {
        METHOD_NO_AUTH
    };
    if !methods.contains(&wanted) {
        stream
            .write_all(&[SOCKS5_VERSION, METHOD_NO_ACCEPTABLE])
            .await?;
        bail!("Client offered no acceptable authentication method");
    }
    stream.write_all(&[SOCKS5_VERSION, wanted]).await?;
    stream.flush().await?;

    if let Some(expected) = auth {
        authenticate(stream, expected).await?;
    }

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS5_VERSION {
        bail!("Invalid SOCKS5 request version: {}", request[0]);
    }
    match request[1] {
        CMD_CONNECT => Ok(Command::Connect(read_address(stream, request[3]).await?)),
        // 客户端声明的 UDP 来源地址不可靠，以第一个数据报的来源为准
        CMD_UDP_ASSOCIATE => {
            read_address(stream, request[3]).await?;
            Ok(Command::UdpAssociate)
        }
        CMD_UDP_TUNNEL => {
            read_address(stream, request[3]).await?;
            Ok(Command::UdpTunnel)
        }
        other => {
            send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            bail!("Unsupported SOCKS5 command: {}", other);
        }
    }
}

/// RFC 1929 用户名/密码子协商
async fn authenticate<S>(stream: &mut S, expected: &Credentials) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != 0x01 {
        bail!("Unsupported auth sub-negotiation version: {}", version);
    }
    let ulen = stream.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    stream.read_exact(&mut username).await?;
    let plen = stream.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    stream.read_exact(&mut password).await?;

    let ok = username == expected.username.as_bytes() && password == expected.password().as_bytes();
    stream.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    stream.flush().await?;
    if !ok {
        bail!(
            "SOCKS5 authentication failed for user '{}'",
            String::from_utf8_lossy(&username)
        );
    }
    Ok(())
}

/// 发送 CONNECT 应答，绑定地址固定为 0.0.0.0:0
pub(crate) async fn send_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

/// 发送带绑定地址的应答
pub(crate) async fn send_reply_bound<S>(stream: &mut S, code: u8, bound: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut reply = BytesMut::with_capacity(22);
    reply.put_slice(&[SOCKS5_VERSION, code, 0x00]);
    encode_address(&mut reply, &bound.to_string())?;
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// 拨号失败对应的应答码
pub(crate) fn failure_code(err: &TunnelError) -> u8 {
    match err {
        TunnelError::ChainBuild { .. }
        | TunnelError::RouteExhausted { .. }
        | TunnelError::ConnectionFailed { .. }
        | TunnelError::Timeout { .. } => REPLY_CONNECTION_REFUSED,
        _ => REPLY_GENERAL_FAILURE,
    }
}
