//! UDP 数据报的 SOCKS5 封装
//!
//! 报文格式为 `RSV(2) FRAG(1) ATYP ADDR PORT DATA`。在 UDP 上收发时 RSV 为 0；
//! 经由字节流（UDP 隧道）传输时 RSV 携带 DATA 的长度，用于在流中分帧。

use crate::connector::socks5::{encode_address, read_address};
use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// 单个 UDP 报文的最大长度
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// 带对端地址的数据报
///
/// 发往远端时 `addr` 是目的地址，从远端返回时是来源地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub addr: String,
    pub payload: Bytes,
}

impl Datagram {
    pub fn new(addr: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            addr: addr.into(),
            payload: payload.into(),
        }
    }

    fn encode(&self, rsv: u16) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(3 + 262 + self.payload.len());
        buf.put_u16(rsv);
        buf.put_u8(0);
        encode_address(&mut buf, &self.addr)?;
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// 编码为 SOCKS5 UDP 报文
    pub fn to_packet(&self) -> Result<BytesMut> {
        self.encode(0)
    }

    /// 解析 SOCKS5 UDP 报文，不支持分片
    pub async fn from_packet(packet: &[u8]) -> Result<Self> {
        if packet.len() < 4 {
            bail!("Datagram too short: {} bytes", packet.len());
        }
        if packet[2] != 0 {
            bail!("Fragmented datagrams are not supported");
        }
        let atyp = packet[3];
        let mut rest = &packet[4..];
        let addr = read_address(&mut rest, atyp).await?;
        Ok(Self {
            addr,
            payload: Bytes::copy_from_slice(rest),
        })
    }

    /// 写入一帧到 UDP 隧道
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let len = u16::try_from(self.payload.len())
            .map_err(|_| anyhow::anyhow!("Datagram too large: {} bytes", self.payload.len()))?;
        let frame = self.encode(len)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// 从 UDP 隧道读取一帧
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_u16().await? as usize;
        if reader.read_u8().await? != 0 {
            bail!("Fragmented datagrams are not supported");
        }
        let atyp = reader.read_u8().await?;
        let addr = read_address(reader, atyp).await?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(Self {
            addr,
            payload: payload.into(),
        })
    }
}
