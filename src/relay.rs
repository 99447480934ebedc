//! 双向数据转发

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// 复制缓冲区大小
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// 默认连接空闲超时
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// 双向转发统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// 客户端 -> 远端
    pub sent: u64,
    /// 远端 -> 客户端
    pub received: u64,
}

/// 单向复制，`idle_timeout` 内没有数据则以 TimedOut 结束
async fn copy_with_idle_timeout<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Duration,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection idle timeout",
                ))
            }
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    Ok(total)
}

/// 在两个连接之间双向转发，直到两个方向都结束
///
/// 一个方向读到 EOF 后关闭对端的写半部，另一方向继续转发
pub async fn relay<A, B>(client: A, remote: B, idle_timeout: Duration) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let client_to_remote = async {
        let bytes = copy_with_idle_timeout(&mut client_read, &mut remote_write, idle_timeout).await;
        let _ = remote_write.shutdown().await;
        bytes
    };
    let remote_to_client = async {
        let bytes = copy_with_idle_timeout(&mut remote_read, &mut client_write, idle_timeout).await;
        let _ = client_write.shutdown().await;
        bytes
    };

    let (sent, received) = tokio::join!(client_to_remote, remote_to_client);

    let sent = sent.unwrap_or_else(|e| {
        debug!("Client to remote copy ended: {}", e);
        0
    });
    let received = received.unwrap_or_else(|e| {
        debug!("Remote to client copy ended: {}", e);
        0
    });
    RelayStats { sent, received }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (remote, mut remote_peer) = tokio::io::duplex(1024);

        let relay_task = tokio::spawn(relay(client, remote, Duration::from_secs(5)));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote_peer.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client_peer);
        drop(remote_peer);

        let stats = relay_task.await.unwrap();
        assert_eq!(stats, RelayStats { sent: 4, received: 5 });
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (client, _client_peer) = tokio::io::duplex(64);
        let (remote, _remote_peer) = tokio::io::duplex(64);

        let stats = tokio::time::timeout(
            Duration::from_secs(2),
            relay(client, remote, Duration::from_millis(50)),
        )
        .await
        .unwrap();
        assert_eq!(stats, RelayStats::default());
    }
}
