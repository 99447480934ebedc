//! SOCKS5 UDP 转发
//!
//! `UDP ASSOCIATE` 为客户端分配本地 UDP 端口，收到的数据报装进经代理链建立的 UDP 隧道，
//! 没有代理链时直接发往目的地址。关联随控制连接关闭而结束。
//!
//! UDP 隧道命令让数据报直接在 TCP 连接上分帧传输，用作链路最后一跳的服务端。

use super::socks5;
use crate::datagram::{Datagram, MAX_DATAGRAM_SIZE};
use crate::error::TunnelError;
use crate::transport::BoxedTransport;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, info};

/// 客户端请求的数据报转发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatagramMode {
    Associate,
    Tunnel,
}

/// UDP 关联：分配本地端口并回复客户端
pub(crate) async fn associate(
    mut control: TcpStream,
    tunnel: Option<BoxedTransport>,
) -> Result<()> {
    let local_ip = control.local_addr()?.ip();
    let socket = match UdpSocket::bind(SocketAddr::new(local_ip, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = socks5::send_reply(&mut control, socks5::REPLY_GENERAL_FAILURE).await;
            return Err(e).context("Failed to bind UDP relay socket");
        }
    };
    let relay_addr = socket.local_addr()?;
    socks5::send_reply_bound(&mut control, socks5::REPLY_SUCCEEDED, relay_addr).await?;
    info!("UDP association ready on {}", relay_addr);

    let client = OnceLock::new();
    let result = match tunnel {
        Some(tunnel) => {
            let (mut reader, mut writer) = tokio::io::split(tunnel);
            tokio::select! {
                _ = until_closed(&mut control) => Ok(()),
                r = client_to_tunnel(&socket, &client, &mut writer) => r,
                r = tunnel_to_client(&socket, &client, &mut reader) => r,
            }
        }
        None => {
            let outbound = bind_outbound().await?;
            tokio::select! {
                _ = until_closed(&mut control) => Ok(()),
                r = client_to_remote(&socket, &client, &outbound) => r,
                r = remote_to_client(&socket, &client, &outbound) => r,
            }
        }
    };
    info!("UDP association on {} closed", relay_addr);
    result
}

/// UDP 隧道服务端：回复后在当前连接上分帧转发
pub(crate) async fn tunnel(mut stream: TcpStream, upstream: Option<BoxedTransport>) -> Result<()> {
    socks5::send_reply(&mut stream, socks5::REPLY_SUCCEEDED).await?;

    match upstream {
        // 上游同样是分帧的 UDP 隧道，逐字节转发即可
        Some(mut upstream) => {
            let (sent, received) = tokio::io::copy_bidirectional(&mut stream, &mut upstream)
                .await
                .unwrap_or_default();
            debug!("UDP tunnel closed (sent {} bytes, received {} bytes)", sent, received);
            Ok(())
        }
        None => {
            let outbound = bind_outbound().await?;
            let (mut reader, mut writer) = stream.split();
            info!("UDP tunnel relaying directly from {}", outbound.local_addr()?);
            tokio::select! {
                r = frames_to_remote(&mut reader, &outbound) => r,
                r = remote_to_frames(&outbound, &mut writer) => r,
            }
        }
    }
}

/// 拨号失败时回复客户端
pub(crate) async fn reject(stream: &mut TcpStream, err: &TunnelError) {
    if let Err(e) = socks5::send_reply(stream, socks5::failure_code(err)).await {
        debug!("Failed to send failure reply: {}", e);
    }
}

async fn bind_outbound() -> Result<UdpSocket> {
    UdpSocket::bind("0.0.0.0:0")
        .await
        .context("Failed to bind outbound UDP socket")
}

async fn until_closed(control: &mut TcpStream) {
    let mut buf = [0u8; 256];
    while let Ok(n) = control.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
    debug!("UDP association control connection closed");
}

/// 读取下一个来自客户端的数据报，丢弃其他来源与格式错误的报文
async fn recv_from_client(
    socket: &UdpSocket,
    client: &OnceLock<SocketAddr>,
    buf: &mut [u8],
) -> Result<Datagram> {
    loop {
        let (n, from) = socket.recv_from(buf).await?;
        let expected = *client.get_or_init(|| from);
        if from != expected {
            debug!("Dropping datagram from unexpected peer {}", from);
            continue;
        }
        match Datagram::from_packet(&buf[..n]).await {
            Ok(datagram) => return Ok(datagram),
            Err(e) => debug!("Dropping malformed datagram from {}: {:#}", from, e),
        }
    }
}

async fn send_to_client(
    socket: &UdpSocket,
    client: &OnceLock<SocketAddr>,
    datagram: &Datagram,
) -> Result<()> {
    // 客户端尚未发送过数据报
    let Some(addr) = client.get() else {
        return Ok(());
    };
    socket.send_to(&datagram.to_packet()?, addr).await?;
    Ok(())
}

/// 发往目的地址，仅支持 IPv4 目标
async fn send_to_remote(outbound: &UdpSocket, datagram: &Datagram) -> Result<()> {
    let target = lookup_host(&datagram.addr)
        .await?
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("No IPv4 address for {}", datagram.addr))?;
    outbound.send_to(&datagram.payload, target).await?;
    Ok(())
}

async fn client_to_tunnel<W>(
    socket: &UdpSocket,
    client: &OnceLock<SocketAddr>,
    tunnel: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let datagram = recv_from_client(socket, client, &mut buf).await?;
        datagram.write_to(tunnel).await?;
    }
}

async fn tunnel_to_client<R>(
    socket: &UdpSocket,
    client: &OnceLock<SocketAddr>,
    tunnel: &mut R,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let datagram = Datagram::read_from(tunnel).await?;
        send_to_client(socket, client, &datagram).await?;
    }
}

async fn client_to_remote(
    socket: &UdpSocket,
    client: &OnceLock<SocketAddr>,
    outbound: &UdpSocket,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let datagram = recv_from_client(socket, client, &mut buf).await?;
        if let Err(e) = send_to_remote(outbound, &datagram).await {
            debug!("Dropping datagram to {}: {:#}", datagram.addr, e);
        }
    }
}

async fn remote_to_client(
    socket: &UdpSocket,
    client: &OnceLock<SocketAddr>,
    outbound: &UdpSocket,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = outbound.recv_from(&mut buf).await?;
        let datagram = Datagram::new(from.to_string(), buf[..n].to_vec());
        send_to_client(socket, client, &datagram).await?;
    }
}

async fn frames_to_remote<R>(tunnel: &mut R, outbound: &UdpSocket) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let datagram = Datagram::read_from(tunnel).await?;
        if let Err(e) = send_to_remote(outbound, &datagram).await {
            debug!("Dropping datagram to {}: {:#}", datagram.addr, e);
        }
    }
}

async fn remote_to_frames<W>(outbound: &UdpSocket, tunnel: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = outbound.recv_from(&mut buf).await?;
        Datagram::new(from.to_string(), buf[..n].to_vec())
            .write_to(tunnel)
            .await?;
    }
}
